use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, SubsecRound, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::error::AuthError;
use super::session::{AuthMethod, NewSession, Session, SessionStore};
use crate::config::Config;
use crate::storage::{KeyValueStore, TOKENS_KEY};
use crate::utils::{is_valid_email, mask_email, normalize_email, random_token};

/// Length of a magic-link token value (~285 bits of entropy).
const MAGIC_TOKEN_LENGTH: usize = 48;

/// A single-use sign-in token.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MagicToken {
    pub value: String,
    pub email: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
    #[serde(default = "Utc::now", with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for MagicToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MagicToken")
            .field("value", &"[REDACTED]")
            .field("email", &mask_email(&self.email))
            .field("expires_at", &self.expires_at)
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl MagicToken {
    /// Tokens are invalid at or after `expires_at`.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// A freshly issued token and the URL that redeems it.
#[derive(Debug, Clone)]
pub struct IssuedLink {
    pub token: MagicToken,
    pub url: String,
}

/// Durable collection of live magic-link tokens.
///
/// Expired entries are swept whenever the collection is read for a write;
/// there is no background task.
#[derive(Clone)]
pub struct TokenStore {
    store: Arc<dyn KeyValueStore>,
    sessions: SessionStore,
    lifetime: Duration,
    sign_in_url: String,
}

impl TokenStore {
    pub fn new(store: Arc<dyn KeyValueStore>, sessions: SessionStore, config: &Config) -> Self {
        Self::with_settings(store, sessions, config.token_lifetime(), config.sign_in_url())
    }

    pub fn with_settings(
        store: Arc<dyn KeyValueStore>,
        sessions: SessionStore,
        lifetime: Duration,
        sign_in_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            sessions,
            lifetime,
            sign_in_url: sign_in_url.into(),
        }
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Issue a token for `email` and build its redemption URL.
    pub fn issue(&self, email: &str) -> Result<IssuedLink, AuthError> {
        self.issue_at(email, Utc::now())
    }

    pub fn issue_at(&self, email: &str, now: DateTime<Utc>) -> Result<IssuedLink, AuthError> {
        if !is_valid_email(email) {
            return Err(AuthError::InvalidEmail(email.to_string()));
        }
        let email = normalize_email(email);
        // Persisted timestamps carry millisecond precision
        let now = now.trunc_subsecs(3);

        let mut tokens = self.load()?;
        let token = loop {
            let value = random_token(MAGIC_TOKEN_LENGTH);
            if !tokens.iter().any(|t| t.value == value) {
                break MagicToken {
                    value,
                    email,
                    expires_at: now + self.lifetime,
                    created_at: now,
                };
            }
        };

        let url = self.redemption_url(&token.value)?;

        Self::sweep(&mut tokens, now);
        tokens.push(token.clone());
        self.save(&tokens)?;

        debug!(email = %mask_email(&token.email), live = tokens.len(), "Magic link issued");
        Ok(IssuedLink { token, url })
    }

    /// Redeem a token. A live match is deleted before the session is created,
    /// so a value can never be redeemed twice. Unknown, expired and reused
    /// values all return `None`.
    pub fn redeem(&self, value: &str) -> Result<Option<Session>> {
        self.redeem_at(value, Utc::now())
    }

    pub fn redeem_at(&self, value: &str, now: DateTime<Utc>) -> Result<Option<Session>> {
        let mut tokens = self.load()?;
        let position = tokens
            .iter()
            .position(|t| t.is_live_at(now) && t.value == value);

        let redeemed = position.map(|idx| tokens.remove(idx));
        Self::sweep(&mut tokens, now);
        self.save(&tokens)?;

        match redeemed {
            Some(token) => {
                let session = self
                    .sessions
                    .create_at(NewSession::new(token.email).method(AuthMethod::MagicLink), now)?;
                debug!(email = %mask_email(&session.email), "Magic link redeemed");
                Ok(Some(session))
            }
            None => {
                debug!("Magic link rejected");
                Ok(None)
            }
        }
    }

    /// Drop expired tokens, returning how many were removed.
    pub fn purge_expired(&self) -> Result<usize> {
        let mut tokens = self.load()?;
        let removed = Self::sweep(&mut tokens, Utc::now());
        if removed > 0 {
            self.save(&tokens)?;
        }
        Ok(removed)
    }

    /// Number of unexpired, unredeemed tokens.
    pub fn live_count(&self) -> Result<usize> {
        let now = Utc::now();
        Ok(self.load()?.iter().filter(|t| t.is_live_at(now)).count())
    }

    /// Invalidate every outstanding link.
    pub fn revoke_all(&self) -> Result<()> {
        self.store.remove(TOKENS_KEY)
    }

    /// Pull the token out of a pasted redemption URL, or accept a bare value.
    pub fn extract_token(input: &str) -> Option<String> {
        let input = input.trim();
        if input.is_empty() {
            return None;
        }
        match Url::parse(input) {
            Ok(url) => url
                .query_pairs()
                .find(|(key, _)| key == "token")
                .map(|(_, value)| value.into_owned())
                .filter(|value| !value.is_empty()),
            Err(_) => Some(input.to_string()),
        }
    }

    fn redemption_url(&self, value: &str) -> Result<String, AuthError> {
        let mut url = Url::parse(&self.sign_in_url)
            .map_err(|e| AuthError::InvalidUrl(format!("{}: {}", self.sign_in_url, e)))?;
        url.query_pairs_mut().append_pair("token", value);
        Ok(url.to_string())
    }

    fn sweep(tokens: &mut Vec<MagicToken>, now: DateTime<Utc>) -> usize {
        let before = tokens.len();
        tokens.retain(|t| t.is_live_at(now));
        before - tokens.len()
    }

    fn load(&self) -> Result<Vec<MagicToken>> {
        match self.store.get(TOKENS_KEY)? {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(tokens) => Ok(tokens),
                Err(e) => {
                    warn!(error = %e, "Discarding corrupt token collection");
                    Ok(Vec::new())
                }
            },
            None => Ok(Vec::new()),
        }
    }

    fn save(&self, tokens: &[MagicToken]) -> Result<()> {
        let contents = serde_json::to_string(tokens).context("Failed to serialize tokens")?;
        self.store
            .set(TOKENS_KEY, &contents)
            .context("Failed to persist tokens")
    }
}
