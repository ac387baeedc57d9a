use thiserror::Error;

use crate::utils::truncate_string;

#[derive(Error, Debug)]
pub enum CrmError {
    #[error("CRM is not configured")]
    NotConfigured,

    #[error("Unauthorized - access token may be expired")]
    Unauthorized,

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited by CRM")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("CRM did not answer within {0} seconds")]
    Timeout(u64),
}

/// Longest response body carried in an error
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl CrmError {
    /// Cap a response body at `MAX_ERROR_BODY_LENGTH` characters
    fn truncate_body(body: &str) -> String {
        if body.chars().count() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            format!(
                "{} (truncated, {} total bytes)",
                truncate_string(body, MAX_ERROR_BODY_LENGTH),
                body.len()
            )
        }
    }

    pub fn from_status(status: u16, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status {
            401 => CrmError::Unauthorized,
            403 => CrmError::AccessDenied(truncated),
            404 => CrmError::NotFound(truncated),
            429 => CrmError::RateLimited,
            500..=599 => CrmError::ServerError(truncated),
            _ => CrmError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }
}
