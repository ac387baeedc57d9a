use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::guard::Redirect;
use crate::config::Config;
use crate::storage::{KeyValueStore, SESSION_KEY};
use crate::utils::{mask_email, random_token};

/// Length of the opaque session identifier.
const SESSION_TOKEN_LENGTH: usize = 32;

/// How a session was established.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethod {
    MagicLink,
    #[default]
    #[serde(other)]
    Unknown,
}

/// The single authenticated identity held by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[serde(default)]
    pub authenticated: bool,
    #[serde(default)]
    pub method: AuthMethod,
    pub email: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_name: Option<String>,
    /// Opaque session identifier. Nothing validates it yet; it is carried so
    /// a server-side revocation list can be introduced without a format change.
    #[serde(default)]
    pub token: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    #[cfg_attr(feature = "ts", ts(type = "number"))]
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn time_until_expiry(&self) -> Duration {
        self.expires_at - Utc::now()
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self) -> i64 {
        self.time_until_expiry().num_minutes().max(0)
    }

    /// True once the identity-selection step has bound a contact.
    pub fn has_contact(&self) -> bool {
        self.contact_id.is_some()
    }
}

/// Input for `SessionStore::create`. Unset fields take their defaults.
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub email: String,
    pub method: Option<AuthMethod>,
    pub display_name: Option<String>,
    pub token: Option<String>,
}

impl NewSession {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            ..Self::default()
        }
    }

    pub fn method(mut self, method: AuthMethod) -> Self {
        self.method = Some(method);
        self
    }

    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

/// Single-slot session record in the portal's key/value store.
///
/// Expiry is passive: nothing sweeps in the background, a read that finds an
/// expired record deletes it and reports no session.
#[derive(Clone)]
pub struct SessionStore {
    store: Arc<dyn KeyValueStore>,
    lifetime: Duration,
    sign_in_url: String,
}

impl SessionStore {
    pub fn new(store: Arc<dyn KeyValueStore>, config: &Config) -> Self {
        Self::with_settings(store, config.session_lifetime(), config.sign_in_url())
    }

    pub fn with_settings(
        store: Arc<dyn KeyValueStore>,
        lifetime: Duration,
        sign_in_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            lifetime,
            sign_in_url: sign_in_url.into(),
        }
    }

    pub fn sign_in_url(&self) -> &str {
        &self.sign_in_url
    }

    /// Create a session, replacing whatever occupied the slot.
    pub fn create(&self, data: NewSession) -> Result<Session> {
        self.create_at(data, Utc::now())
    }

    pub fn create_at(&self, data: NewSession, now: DateTime<Utc>) -> Result<Session> {
        let display_name = data
            .display_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| data.email.clone());

        let session = Session {
            authenticated: true,
            method: data.method.unwrap_or_default(),
            email: data.email,
            display_name,
            contact_id: None,
            contact_name: None,
            token: data.token.unwrap_or_else(|| random_token(SESSION_TOKEN_LENGTH)),
            expires_at: now.trunc_subsecs(3) + self.lifetime,
        };

        self.save(&session)?;
        debug!(email = %mask_email(&session.email), method = ?session.method, "Session created");
        Ok(session)
    }

    /// Read the live session, purging it if it has expired.
    pub fn read(&self) -> Result<Option<Session>> {
        self.read_at(Utc::now())
    }

    pub fn read_at(&self, now: DateTime<Utc>) -> Result<Option<Session>> {
        let raw = match self.store.get(SESSION_KEY)? {
            Some(raw) => raw,
            None => return Ok(None),
        };

        let mut session: Session = match serde_json::from_str(&raw) {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "Discarding corrupt session record");
                self.store.remove(SESSION_KEY)?;
                return Ok(None);
            }
        };

        if !session.authenticated {
            return Ok(None);
        }

        if session.is_expired_at(now) {
            debug!(email = %mask_email(&session.email), "Session expired, purging");
            self.store.remove(SESSION_KEY)?;
            return Ok(None);
        }

        if session.display_name.is_empty() {
            session.display_name = session.email.clone();
        }
        Ok(Some(session))
    }

    /// Bind the live session to one resolved contact. Does not extend the
    /// session and never creates one.
    pub fn attach_contact(&self, contact_id: &str, contact_name: &str) -> Result<Option<Session>> {
        self.attach_contact_at(contact_id, contact_name, Utc::now())
    }

    pub fn attach_contact_at(
        &self,
        contact_id: &str,
        contact_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>> {
        let mut session = match self.read_at(now)? {
            Some(session) => session,
            None => return Ok(None),
        };

        session.contact_id = Some(contact_id.to_string());
        session.contact_name = Some(contact_name.to_string());
        self.save(&session)?;
        Ok(Some(session))
    }

    /// Delete the session and return where the caller should navigate.
    pub fn destroy(&self) -> Result<Redirect> {
        self.store.remove(SESSION_KEY)?;
        Ok(Redirect::to(self.sign_in_url.clone()))
    }

    fn save(&self, session: &Session) -> Result<()> {
        let contents = serde_json::to_string(session).context("Failed to serialize session")?;
        self.store
            .set(SESSION_KEY, &contents)
            .context("Failed to persist session")
    }
}
