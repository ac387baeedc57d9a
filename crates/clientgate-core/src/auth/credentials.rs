use anyhow::{Context, Result};
use keyring::Entry;

const SERVICE_NAME: &str = "clientgate";

/// Keychain account holding the mail relay's shared secret.
const MAIL_RELAY_ACCOUNT: &str = "mail-relay";

/// Environment variable that overrides the keychain entry.
pub const MAIL_RELAY_SECRET_ENV: &str = "MAIL_RELAY_SECRET";

/// OS keychain storage for portal secrets.
pub struct CredentialStore;

impl CredentialStore {
    /// Store a secret under `account` in the OS keychain
    pub fn store(account: &str, secret: &str) -> Result<()> {
        let entry = Entry::new(SERVICE_NAME, account).context("Failed to create keyring entry")?;
        entry
            .set_password(secret)
            .context("Failed to store secret in keychain")?;
        Ok(())
    }

    pub fn get(account: &str) -> Result<String> {
        let entry = Entry::new(SERVICE_NAME, account).context("Failed to create keyring entry")?;
        entry
            .get_password()
            .context("Failed to retrieve secret from keychain")
    }

    pub fn delete(account: &str) -> Result<()> {
        let entry = Entry::new(SERVICE_NAME, account).context("Failed to create keyring entry")?;
        entry
            .delete_credential()
            .context("Failed to delete secret from keychain")?;
        Ok(())
    }

    pub fn store_mail_relay_secret(secret: &str) -> Result<()> {
        Self::store(MAIL_RELAY_ACCOUNT, secret)
    }

    pub fn delete_mail_relay_secret() -> Result<()> {
        Self::delete(MAIL_RELAY_ACCOUNT)
    }

    /// The relay secret from `MAIL_RELAY_SECRET`, else from the keychain.
    pub fn mail_relay_secret() -> Option<String> {
        std::env::var(MAIL_RELAY_SECRET_ENV)
            .ok()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| Self::get(MAIL_RELAY_ACCOUNT).ok())
    }
}
