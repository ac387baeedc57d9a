//! Client sign-in: magic links, the session slot and the state machine.
//!
//! This module provides:
//! - `TokenStore`: single-use magic-link tokens with a 15 minute lifetime
//! - `SessionStore`: the one live session, expiring 24 hours after creation
//! - `SessionGuard`: redirects protected views to the sign-in page
//! - `AuthEngine`: the sign-in state machine tying these to the CRM and mail
//! - `CredentialStore`: OS keychain storage for the mail relay secret
//!
//! Expiry is passive everywhere. Nothing runs in the background; stale
//! records are removed when they are next read.

pub mod credentials;
pub mod engine;
pub mod error;
pub mod guard;
pub mod message;
pub mod session;
pub mod token;

pub use credentials::CredentialStore;
pub use engine::{AuthEngine, AuthState, ContactResolution, RedeemOutcome, SubmitOutcome};
pub use error::AuthError;
pub use guard::{Navigator, Redirect, SessionGuard};
pub use message::compose_magic_link;
pub use session::{AuthMethod, NewSession, Session, SessionStore};
pub use token::{IssuedLink, MagicToken, TokenStore};
