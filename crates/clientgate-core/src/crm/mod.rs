//! CRM gateways for client identity.
//!
//! This module provides:
//! - `CrmClient`: SOQL query client over a pluggable `CrmTransport`
//! - Identity verification (`CrmClient::verify`), which fails open
//! - Contact resolution (`CrmClient::fetch_all_by_email`,
//!   `CrmClient::fetch_by_id`), which fails to an empty result
//!
//! Nothing in this module returns an error to its callers for CRM trouble.
//! An unreachable CRM must never lock the firm's own clients out.

pub mod client;
pub mod contacts;
pub mod error;
pub mod verify;

pub use client::{CrmClient, CrmTransport, HttpTransport, TransportResponse};
pub use error::CrmError;
pub use verify::{VerificationResult, VerificationSource};
