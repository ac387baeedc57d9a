//! Durable key/value storage for portal state.
//!
//! Every piece of client-held state (the session slot, the live magic-link
//! tokens, the CRM connection settings) is a JSON document stored under a
//! fixed key. Stores are synchronous: each call runs to completion before the
//! next one starts, which is what lets token redemption be single-use without
//! any locking.

pub mod file;
pub mod memory;

use anyhow::Result;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Key holding the single session record.
pub const SESSION_KEY: &str = "client_portal_session";

/// Key holding the array of live magic-link tokens.
pub const TOKENS_KEY: &str = "client_portal_magic_tokens";

/// Key holding the CRM connection settings.
pub const CRM_CONFIG_KEY: &str = "client_portal_crm_config";

pub trait KeyValueStore: Send + Sync {
    /// Read the raw document stored under `key`, if any.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Replace the document stored under `key`.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete the document stored under `key`. Missing keys are not an error.
    fn remove(&self, key: &str) -> Result<()>;
}
