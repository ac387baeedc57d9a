//! Client contact records.
//!
//! Several contacts may share one inbox (a family served through one email
//! address), so lookups by email return a list and the session narrows to one
//! of them by id.

use serde::{Deserialize, Serialize};

/// A client record as the portal sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    /// Link to the client's upload folder. `None` while the folder is pending.
    pub upload_link: Option<String>,
    /// Link to the client's read-only folder. `None` while the folder is pending.
    pub view_link: Option<String>,
}

impl Contact {
    pub fn full_name(&self) -> String {
        match (self.first_name.is_empty(), self.last_name.is_empty()) {
            (false, false) => format!("{} {}", self.first_name, self.last_name),
            (false, true) => self.first_name.clone(),
            (true, false) => self.last_name.clone(),
            (true, true) => self.id.clone(),
        }
    }

    /// True once both document folders have been provisioned.
    pub fn has_folders(&self) -> bool {
        self.upload_link.is_some() && self.view_link.is_some()
    }
}

/// Contact row as returned by the CRM query API.
#[derive(Debug, Deserialize)]
pub struct ContactRecord {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "FirstName")]
    pub first_name: Option<String>,
    #[serde(rename = "LastName")]
    pub last_name: Option<String>,
    #[serde(rename = "Email")]
    pub email: Option<String>,
    #[serde(rename = "Box_Upload_Link__c")]
    pub upload_link: Option<String>,
    #[serde(rename = "Box_View_Only_Link__c")]
    pub view_link: Option<String>,
}

impl ContactRecord {
    pub fn to_contact(&self) -> Contact {
        Contact {
            id: self.id.clone(),
            first_name: self.first_name.clone().unwrap_or_default(),
            last_name: self.last_name.clone().unwrap_or_default(),
            upload_link: non_empty(&self.upload_link),
            view_link: non_empty(&self.view_link),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
