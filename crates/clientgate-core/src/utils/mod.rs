//! Utility functions for email handling, log redaction and token generation.

pub mod format;

pub use format::{escape_soql, is_valid_email, mask_email, normalize_email, random_token, truncate_string};
