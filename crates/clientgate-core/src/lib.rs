//! Clientgate core - passwordless sign-in for a law firm's client portal.
//!
//! Clients prove control of an email inbox by following a single-use magic
//! link. The address is checked against the firm's CRM first, but a CRM
//! outage never blocks sign-in. Once signed in, the session is bound to the
//! CRM contact whose document folders the portal shows.

pub mod auth;
pub mod config;
pub mod crm;
pub mod mail;
pub mod models;
pub mod storage;
pub mod utils;

pub use auth::{AuthEngine, AuthState, SessionGuard};
pub use config::{Config, CrmConfig};
