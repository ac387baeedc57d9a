use tracing::{debug, warn};

use super::{CrmClient, CrmError, CrmTransport};
use crate::models::{Contact, ContactRecord};
use crate::utils::{escape_soql, mask_email};

const CONTACT_FIELDS: &str = "Id, FirstName, LastName, Email, Box_Upload_Link__c, Box_View_Only_Link__c";

impl<T: CrmTransport> CrmClient<T> {
    /// Every contact sharing `email`, in the order the CRM returned them.
    ///
    /// Any failure yields an empty list so callers can show a pending state.
    pub async fn fetch_all_by_email(&self, email: &str) -> Vec<Contact> {
        let soql = format!(
            "SELECT {} FROM Contact WHERE Email = '{}'",
            CONTACT_FIELDS,
            escape_soql(email.trim())
        );

        match self.query::<ContactRecord>(&soql).await {
            Ok(records) => {
                debug!(email = %mask_email(email), count = records.len(), "Contacts resolved");
                records.iter().map(ContactRecord::to_contact).collect()
            }
            Err(CrmError::NotConfigured) => {
                debug!("CRM not configured, no contacts to resolve");
                Vec::new()
            }
            Err(e) => {
                warn!(email = %mask_email(email), error = %e, "Contact lookup failed");
                Vec::new()
            }
        }
    }

    /// One contact by record id, for restoring a selection after reload.
    pub async fn fetch_by_id(&self, contact_id: &str) -> Option<Contact> {
        let contact_id = contact_id.trim();
        if contact_id.is_empty() {
            return None;
        }

        let soql = format!(
            "SELECT {} FROM Contact WHERE Id = '{}' LIMIT 1",
            CONTACT_FIELDS,
            escape_soql(contact_id)
        );

        match self.query::<ContactRecord>(&soql).await {
            Ok(records) => records.first().map(ContactRecord::to_contact),
            Err(CrmError::NotConfigured) => None,
            Err(e) => {
                warn!(contact_id = contact_id, error = %e, "Contact fetch failed");
                None
            }
        }
    }
}
