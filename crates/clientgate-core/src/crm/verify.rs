use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{CrmClient, CrmError, CrmTransport};
use crate::utils::{escape_soql, mask_email};

/// Where a verification answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "lowercase")]
pub enum VerificationSource {
    /// No CRM configured; nothing to check against.
    Local,
    /// A definitive answer from the CRM.
    Salesforce,
    /// The CRM could not answer; allowed by default.
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct VerificationResult {
    pub verified: bool,
    pub source: VerificationSource,
}

impl VerificationResult {
    pub fn local() -> Self {
        Self {
            verified: true,
            source: VerificationSource::Local,
        }
    }

    pub fn fallback() -> Self {
        Self {
            verified: true,
            source: VerificationSource::Fallback,
        }
    }

    pub fn salesforce(verified: bool) -> Self {
        Self {
            verified,
            source: VerificationSource::Salesforce,
        }
    }

    /// True when the answer came from a degraded path.
    pub fn is_degraded(&self) -> bool {
        self.source == VerificationSource::Fallback
    }
}

impl<T: CrmTransport> CrmClient<T> {
    /// Confirm that `email` belongs to a known client.
    ///
    /// Only a well-formed, empty `records` answer from the CRM yields
    /// `verified: false`. Missing configuration, error statuses, malformed
    /// bodies, transport failures and timeouts all allow the user through.
    pub async fn verify(&self, email: &str) -> VerificationResult {
        let soql = format!(
            "SELECT Id FROM Contact WHERE Email = '{}' LIMIT 1",
            escape_soql(email.trim())
        );

        match self.query::<serde_json::Value>(&soql).await {
            Ok(records) => {
                let found = !records.is_empty();
                debug!(email = %mask_email(email), found = found, "CRM verification answered");
                VerificationResult::salesforce(found)
            }
            Err(CrmError::NotConfigured) => VerificationResult::local(),
            Err(e) => {
                warn!(email = %mask_email(email), error = %e, "CRM verification failed, allowing sign-in");
                VerificationResult::fallback()
            }
        }
    }
}
