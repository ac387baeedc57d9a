//! Data models for CRM entities.
//!
//! - `Contact`: a client record and the links to that client's document
//!   folders, in the shape the portal works with
//! - `ContactRecord`: the raw CRM row it is mapped from

pub mod contact;

pub use contact::{Contact, ContactRecord};
