//! Sign-in state machine.
//!
//! ```text
//! Anonymous --submit--> Verifying --verified--> LinkIssued --redeem--> Authenticated
//!     ^                     |                       |                      |
//!     +----- not found -----+------ bad link -------+                      |
//!     +------------------------- sign out / expiry ------------------------+
//! ```
//!
//! CRM calls are awaited outside the state lock. Every transition bumps an
//! epoch, and an async step applies its result only if the epoch it captured
//! is still current, so a slow answer can never overwrite a newer state.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::error::AuthError;
use super::guard::Redirect;
use super::message::compose_magic_link;
use super::session::{Session, SessionStore};
use super::token::TokenStore;
use crate::config::Config;
use crate::crm::{CrmClient, CrmTransport, HttpTransport, VerificationResult};
use crate::mail::{Delivery, MailDelivery, Mailer};
use crate::models::Contact;
use crate::storage::KeyValueStore;
use crate::utils::{is_valid_email, mask_email, normalize_email};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    Anonymous,
    Verifying { email: String },
    LinkIssued { email: String },
    /// Signed in. The contact is bound once `session.contact_id` is set.
    Authenticated { session: Session },
    SignedOut,
}

impl AuthState {
    pub fn session(&self) -> Option<&Session> {
        match self {
            AuthState::Authenticated { session } => Some(session),
            _ => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.session().is_some()
    }

    pub fn is_contact_bound(&self) -> bool {
        self.session().map(Session::has_contact).unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Rejected before any network call.
    InvalidEmail,
    /// The CRM answered definitively that the address is unknown.
    NotFound,
    LinkSent {
        email: String,
        delivery: Delivery,
        verification: VerificationResult,
    },
    AlreadyAuthenticated(Session),
    /// A newer transition happened while verification was in flight.
    Superseded,
}

impl SubmitOutcome {
    pub fn user_message(&self) -> &'static str {
        match self {
            SubmitOutcome::InvalidEmail => "Please enter a valid email address.",
            SubmitOutcome::NotFound => {
                "We couldn't find a client account for that email address. Please check it or contact our office."
            }
            SubmitOutcome::LinkSent { .. } => {
                "Check your email for a sign-in link. It can be used once and expires shortly."
            }
            SubmitOutcome::AlreadyAuthenticated(_) => "You are already signed in.",
            SubmitOutcome::Superseded => "This request was replaced by a newer one.",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedeemOutcome {
    Authenticated(Session),
    /// Unknown, expired or already used. Deliberately not distinguished.
    LinkInvalid,
}

impl RedeemOutcome {
    pub fn user_message(&self) -> &'static str {
        match self {
            RedeemOutcome::Authenticated(_) => "You are signed in.",
            RedeemOutcome::LinkInvalid => {
                "This sign-in link has expired or is invalid. Please request a new one."
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContactResolution {
    /// Exactly one candidate (or the previously bound one); the session is bound.
    Bound(Contact),
    /// Several candidates share the inbox; the caller must pick one.
    Choose(Vec<Contact>),
    /// No contact records yet. Show the "folder pending" state.
    Pending,
    NoSession,
    Superseded,
}

struct Machine {
    state: AuthState,
    epoch: u64,
}

impl Machine {
    fn transition(&mut self, next: AuthState) {
        self.state = next;
        self.epoch += 1;
    }

    /// Transition only when the state actually changes.
    fn settle(&mut self, next: AuthState) {
        if self.state != next {
            self.transition(next);
        }
    }

    /// Align the machine with what the session store holds.
    fn settle_session(&mut self, session: Option<Session>) {
        match session {
            Some(session) => self.settle(AuthState::Authenticated { session }),
            None if self.state.is_authenticated() => self.transition(AuthState::Anonymous),
            None => {}
        }
    }
}

pub struct AuthEngine<T = HttpTransport, M = Mailer> {
    sessions: SessionStore,
    tokens: TokenStore,
    crm: CrmClient<T>,
    mailer: M,
    firm_name: String,
    machine: Mutex<Machine>,
}

impl<T: CrmTransport, M: MailDelivery> AuthEngine<T, M> {
    pub fn new(store: Arc<dyn KeyValueStore>, config: &Config, crm: CrmClient<T>, mailer: M) -> Self {
        let sessions = SessionStore::new(store.clone(), config);
        let tokens = TokenStore::new(store, sessions.clone(), config);
        Self::from_parts(sessions, tokens, crm, mailer, config.firm_name.clone())
    }

    pub fn from_parts(
        sessions: SessionStore,
        tokens: TokenStore,
        crm: CrmClient<T>,
        mailer: M,
        firm_name: impl Into<String>,
    ) -> Self {
        Self {
            sessions,
            tokens,
            crm,
            mailer,
            firm_name: firm_name.into(),
            machine: Mutex::new(Machine {
                state: AuthState::Anonymous,
                epoch: 0,
            }),
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    pub fn crm(&self) -> &CrmClient<T> {
        &self.crm
    }

    pub async fn state(&self) -> AuthState {
        self.machine.lock().await.state.clone()
    }

    /// Re-read the session store. An expired or missing session drops an
    /// authenticated machine back to `Anonymous`.
    pub async fn sync(&self) -> Result<AuthState> {
        let mut machine = self.machine.lock().await;
        machine.settle_session(self.sessions.read()?);
        Ok(machine.state.clone())
    }

    /// Request a sign-in link for `email`.
    pub async fn submit(&self, email: &str) -> Result<SubmitOutcome> {
        if !is_valid_email(email) {
            return Ok(SubmitOutcome::InvalidEmail);
        }
        let email = normalize_email(email);

        let epoch = {
            let mut machine = self.machine.lock().await;
            if let Some(session) = self.sessions.read()? {
                machine.settle(AuthState::Authenticated {
                    session: session.clone(),
                });
                return Ok(SubmitOutcome::AlreadyAuthenticated(session));
            }
            machine.transition(AuthState::Verifying {
                email: email.clone(),
            });
            machine.epoch
        };

        let verification = self.crm.verify(&email).await;

        let link = {
            let mut machine = self.machine.lock().await;
            if machine.epoch != epoch {
                debug!(email = %mask_email(&email), "Verification result arrived after state moved on");
                return Ok(SubmitOutcome::Superseded);
            }

            if !verification.verified {
                machine.transition(AuthState::Anonymous);
                info!(email = %mask_email(&email), "Sign-in refused: email not found");
                return Ok(SubmitOutcome::NotFound);
            }

            match self.tokens.issue(&email) {
                Ok(link) => {
                    machine.transition(AuthState::LinkIssued {
                        email: email.clone(),
                    });
                    link
                }
                Err(AuthError::InvalidEmail(_)) => {
                    machine.transition(AuthState::Anonymous);
                    return Ok(SubmitOutcome::InvalidEmail);
                }
                Err(e) => {
                    machine.transition(AuthState::Anonymous);
                    return Err(e.into());
                }
            }
        };

        let message = compose_magic_link(
            &email,
            &link.url,
            self.tokens.lifetime().num_minutes(),
            &self.firm_name,
        );

        let delivery = match self.mailer.deliver(&message).await {
            Ok(delivery) => delivery,
            Err(e) => {
                warn!(email = %mask_email(&email), error = %e, "Mail delivery failed, surfacing link");
                Delivery::Surfaced(message)
            }
        };

        info!(
            email = %mask_email(&email),
            source = ?verification.source,
            sent = matches!(delivery, Delivery::Sent),
            "Sign-in link issued"
        );

        Ok(SubmitOutcome::LinkSent {
            email,
            delivery,
            verification,
        })
    }

    /// Redeem a magic-link token.
    pub async fn redeem(&self, token: &str) -> Result<RedeemOutcome> {
        let mut machine = self.machine.lock().await;

        match self.tokens.redeem(token.trim())? {
            Some(session) => {
                machine.transition(AuthState::Authenticated {
                    session: session.clone(),
                });
                info!(email = %mask_email(&session.email), "Signed in with magic link");
                Ok(RedeemOutcome::Authenticated(session))
            }
            None => {
                match self.sessions.read()? {
                    Some(session) => machine.settle(AuthState::Authenticated { session }),
                    None => machine.settle(AuthState::Anonymous),
                }
                Ok(RedeemOutcome::LinkInvalid)
            }
        }
    }

    /// Find the contact records behind the signed-in email and bind the
    /// session when the answer is unambiguous.
    pub async fn resolve_contacts(&self) -> Result<ContactResolution> {
        let (session, epoch) = {
            let mut machine = self.machine.lock().await;
            let session = self.sessions.read()?;
            machine.settle_session(session.clone());
            match session {
                Some(session) => (session, machine.epoch),
                None => return Ok(ContactResolution::NoSession),
            }
        };

        let mut contacts = self.crm.fetch_all_by_email(&session.email).await;

        let mut machine = self.machine.lock().await;
        if machine.epoch != epoch {
            debug!("Contact resolution arrived after state moved on");
            return Ok(ContactResolution::Superseded);
        }

        if let Some(ref bound) = session.contact_id {
            if let Some(contact) = contacts.iter().find(|c| &c.id == bound) {
                return Ok(ContactResolution::Bound(contact.clone()));
            }
        }

        match contacts.len() {
            0 => {
                info!(email = %mask_email(&session.email), "No contact records yet");
                Ok(ContactResolution::Pending)
            }
            1 => {
                let contact = contacts.remove(0);
                match self.sessions.attach_contact(&contact.id, &contact.full_name())? {
                    Some(session) => {
                        machine.transition(AuthState::Authenticated { session });
                        Ok(ContactResolution::Bound(contact))
                    }
                    None => {
                        machine.transition(AuthState::Anonymous);
                        Ok(ContactResolution::NoSession)
                    }
                }
            }
            _ => Ok(ContactResolution::Choose(contacts)),
        }
    }

    /// Bind the session to an explicitly chosen contact.
    pub async fn select_contact(&self, contact: &Contact) -> Result<Option<Session>> {
        let mut machine = self.machine.lock().await;
        let session = self.sessions.attach_contact(&contact.id, &contact.full_name())?;
        match session {
            Some(ref session) => machine.transition(AuthState::Authenticated {
                session: session.clone(),
            }),
            None => machine.settle_session(None),
        }
        Ok(session)
    }

    /// Re-fetch the bound contact after a reload, by id. `None` when no
    /// contact is bound or the CRM cannot return it.
    pub async fn restore_contact(&self) -> Result<Option<Contact>> {
        let session = {
            let mut machine = self.machine.lock().await;
            let session = self.sessions.read()?;
            machine.settle_session(session.clone());
            session
        };

        match session.and_then(|s| s.contact_id) {
            Some(contact_id) => Ok(self.crm.fetch_by_id(&contact_id).await),
            None => Ok(None),
        }
    }

    /// Destroy the session. The caller navigates to the returned location.
    pub async fn sign_out(&self) -> Result<Redirect> {
        let mut machine = self.machine.lock().await;
        let redirect = self.sessions.destroy()?;
        machine.transition(AuthState::SignedOut);
        info!("Signed out");
        Ok(redirect)
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::time::Duration;

    use chrono::Utc;
    use tokio::sync::Notify;

    use super::*;
    use crate::auth::session::NewSession;
    use crate::config::CrmConfig;
    use crate::crm::client::stub::{StubReply, StubTransport};
    use crate::crm::VerificationSource;
    use crate::mail::{ConsoleMailer, MagicLinkEmail};
    use crate::storage::{MemoryStore, TOKENS_KEY};

    const FOUND: &str = r#"{"totalSize":1,"done":true,"records":[{"Id":"003A00000000001AAA"}]}"#;
    const EMPTY: &str = r#"{"totalSize":0,"done":true,"records":[]}"#;
    const ONE_CONTACT: &str = r#"{"records":[{"Id":"003A00000000001AAA","FirstName":"Jane","LastName":"Doe","Box_Upload_Link__c":"https://app.box.com/f/up","Box_View_Only_Link__c":"https://app.box.com/s/view"}]}"#;
    const TWO_CONTACTS: &str = r#"{"records":[{"Id":"003A00000000001AAA","FirstName":"Jane","LastName":"Doe"},{"Id":"003A00000000002AAA","FirstName":"John","LastName":"Doe"}]}"#;

    struct FailingMailer;

    impl MailDelivery for FailingMailer {
        fn deliver(&self, _message: &MagicLinkEmail) -> impl Future<Output = Result<Delivery>> + Send {
            async { Err(anyhow::anyhow!("relay unreachable")) }
        }
    }

    #[derive(Default)]
    struct SentMailer {
        sent: std::sync::Mutex<Vec<MagicLinkEmail>>,
    }

    impl MailDelivery for SentMailer {
        fn deliver(&self, message: &MagicLinkEmail) -> impl Future<Output = Result<Delivery>> + Send {
            self.sent.lock().unwrap().push(message.clone());
            async { Ok(Delivery::Sent) }
        }
    }

    fn engine_with<M: MailDelivery>(
        transport: StubTransport,
        crm_config: CrmConfig,
        mailer: M,
    ) -> (Arc<MemoryStore>, AuthEngine<StubTransport, M>) {
        let kv = Arc::new(MemoryStore::new());
        let mut config = Config::default();
        config.origin = "https://portal.example.com".to_string();
        let crm = CrmClient::with_transport(transport, crm_config, Duration::from_secs(8));
        let engine = AuthEngine::new(kv.clone(), &config, crm, mailer);
        (kv, engine)
    }

    fn engine(transport: StubTransport) -> (Arc<MemoryStore>, AuthEngine<StubTransport, ConsoleMailer>) {
        engine_with(
            transport,
            CrmConfig::new("https://firm.my.salesforce.com", "secret-token"),
            ConsoleMailer,
        )
    }

    fn link_of(outcome: &SubmitOutcome) -> String {
        match outcome {
            SubmitOutcome::LinkSent {
                delivery: Delivery::Surfaced(message),
                ..
            } => message.link.clone(),
            other => panic!("expected surfaced link, got {:?}", other),
        }
    }

    fn token_of(link: &str) -> String {
        TokenStore::extract_token(link).expect("token in link")
    }

    #[tokio::test]
    async fn test_full_sign_in_flow() {
        let (_, engine) = engine(StubTransport::new(vec![
            StubReply::Respond(200, FOUND.to_string()),
            StubReply::Respond(200, ONE_CONTACT.to_string()),
        ]));
        assert_eq!(engine.sync().await.unwrap(), AuthState::Anonymous);

        let outcome = engine.submit("client@example.com").await.unwrap();
        let link = link_of(&outcome);
        assert!(link.starts_with("https://portal.example.com/portal/login.html?token="));
        assert_eq!(
            engine.state().await,
            AuthState::LinkIssued {
                email: "client@example.com".to_string()
            }
        );

        let session = match engine.redeem(&token_of(&link)).await.unwrap() {
            RedeemOutcome::Authenticated(session) => session,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(session.email, "client@example.com");
        assert!(engine.state().await.is_authenticated());
        assert!(!engine.state().await.is_contact_bound());

        let resolution = engine.resolve_contacts().await.unwrap();
        match resolution {
            ContactResolution::Bound(contact) => assert_eq!(contact.full_name(), "Jane Doe"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(engine.state().await.is_contact_bound());
        let stored = engine.sessions().read().unwrap().unwrap();
        assert_eq!(stored.contact_id.as_deref(), Some("003A00000000001AAA"));
        assert_eq!(stored.contact_name.as_deref(), Some("Jane Doe"));
        assert_eq!(stored.expires_at, session.expires_at);
    }

    #[tokio::test]
    async fn test_invalid_email_makes_no_call() {
        let (kv, engine) = engine(StubTransport::ok(FOUND));
        let outcome = engine.submit("not-an-email").await.unwrap();
        assert_eq!(outcome, SubmitOutcome::InvalidEmail);
        assert_eq!(engine.crm().transport_calls(), 0);
        assert!(kv.get(TOKENS_KEY).unwrap().is_none());
        assert_eq!(engine.state().await, AuthState::Anonymous);
    }

    #[tokio::test]
    async fn test_unknown_email_issues_no_token() {
        let (kv, engine) = engine(StubTransport::ok(EMPTY));
        let outcome = engine.submit("stranger@example.com").await.unwrap();
        assert_eq!(outcome, SubmitOutcome::NotFound);
        assert!(outcome.user_message().contains("couldn't find"));
        assert_eq!(engine.state().await, AuthState::Anonymous);
        assert!(kv.get(TOKENS_KEY).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_crm_outage_still_issues_link() {
        let (_, engine) = engine(StubTransport::new(vec![StubReply::Fail]));
        match engine.submit("client@example.com").await.unwrap() {
            SubmitOutcome::LinkSent { verification, .. } => {
                assert!(verification.verified);
                assert_eq!(verification.source, VerificationSource::Fallback);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_crm_configured_is_local() {
        let (_, engine) = engine_with(StubTransport::ok(EMPTY), CrmConfig::default(), ConsoleMailer);
        match engine.submit("anyone@example.com").await.unwrap() {
            SubmitOutcome::LinkSent { verification, .. } => {
                assert_eq!(verification, VerificationResult::local());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(engine.crm().transport_calls(), 0);
    }

    #[tokio::test]
    async fn test_relay_delivery() {
        let (_, engine) = engine_with(
            StubTransport::ok(FOUND),
            CrmConfig::new("https://firm.my.salesforce.com", "t"),
            SentMailer::default(),
        );
        let outcome = engine.submit("client@example.com").await.unwrap();
        assert!(matches!(
            outcome,
            SubmitOutcome::LinkSent {
                delivery: Delivery::Sent,
                ..
            }
        ));

        let sent = engine.mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "client@example.com");
        assert!(sent[0].html.contains(&sent[0].link));
        assert!(sent[0].text.contains("15 minutes"));
    }

    #[tokio::test]
    async fn test_failed_delivery_surfaces_payload() {
        let (_, engine) = engine_with(
            StubTransport::ok(FOUND),
            CrmConfig::new("https://firm.my.salesforce.com", "t"),
            FailingMailer,
        );
        let outcome = engine.submit("client@example.com").await.unwrap();
        let link = link_of(&outcome);
        assert!(link.contains("token="));
        assert!(matches!(engine.state().await, AuthState::LinkIssued { .. }));
    }

    #[tokio::test]
    async fn test_redeem_twice_fails_second_time() {
        let (_, engine) = engine(StubTransport::ok(FOUND));
        let link = link_of(&engine.submit("client@example.com").await.unwrap());
        let token = token_of(&link);

        assert!(matches!(engine.redeem(&token).await.unwrap(), RedeemOutcome::Authenticated(_)));
        // Still signed in: a reused link does not sign the user out
        assert_eq!(engine.redeem(&token).await.unwrap(), RedeemOutcome::LinkInvalid);
        assert!(engine.state().await.is_authenticated());
    }

    #[tokio::test]
    async fn test_bad_token_returns_to_anonymous() {
        let (_, engine) = engine(StubTransport::ok(FOUND));
        engine.submit("client@example.com").await.unwrap();

        let outcome = engine.redeem("bogus").await.unwrap();
        assert_eq!(outcome, RedeemOutcome::LinkInvalid);
        assert!(outcome.user_message().contains("expired or is invalid"));
        assert_eq!(engine.state().await, AuthState::Anonymous);
        assert!(engine.sessions().read().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_submit_while_signed_in() {
        let (_, engine) = engine(StubTransport::ok(FOUND));
        engine.sessions().create(NewSession::new("client@example.com")).unwrap();

        let outcome = engine.submit("client@example.com").await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::AlreadyAuthenticated(_)));
        assert_eq!(engine.crm().transport_calls(), 0);
    }

    #[tokio::test]
    async fn test_several_contacts_require_choice() {
        let (_, engine) = engine(StubTransport::ok(TWO_CONTACTS));
        engine.sessions().create(NewSession::new("family@example.com")).unwrap();

        let candidates = match engine.resolve_contacts().await.unwrap() {
            ContactResolution::Choose(candidates) => candidates,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(candidates.len(), 2);
        assert!(!engine.state().await.is_contact_bound());

        let session = engine.select_contact(&candidates[1]).await.unwrap().unwrap();
        assert_eq!(session.contact_id.as_deref(), Some("003A00000000002AAA"));
        assert_eq!(session.contact_name.as_deref(), Some("John Doe"));
        assert!(engine.state().await.is_contact_bound());

        // A later resolution keeps the explicit choice
        match engine.resolve_contacts().await.unwrap() {
            ContactResolution::Bound(contact) => assert_eq!(contact.id, "003A00000000002AAA"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_contacts_is_pending() {
        let (_, pending_engine) = engine(StubTransport::ok(EMPTY));
        pending_engine.sessions().create(NewSession::new("client@example.com")).unwrap();
        assert_eq!(pending_engine.resolve_contacts().await.unwrap(), ContactResolution::Pending);

        let (_, outage_engine) = engine(StubTransport::new(vec![StubReply::Fail]));
        outage_engine.sessions().create(NewSession::new("client@example.com")).unwrap();
        assert_eq!(outage_engine.resolve_contacts().await.unwrap(), ContactResolution::Pending);
    }

    #[tokio::test]
    async fn test_resolve_without_session() {
        let (_, engine) = engine(StubTransport::ok(ONE_CONTACT));
        assert_eq!(engine.resolve_contacts().await.unwrap(), ContactResolution::NoSession);
        assert_eq!(engine.crm().transport_calls(), 0);
    }

    #[tokio::test]
    async fn test_select_contact_without_session() {
        let (kv, engine) = engine(StubTransport::ok(ONE_CONTACT));
        let contact = Contact {
            id: "003A00000000001AAA".to_string(),
            first_name: "Jane".to_string(),
            last_name: "Doe".to_string(),
            upload_link: None,
            view_link: None,
        };
        assert!(engine.select_contact(&contact).await.unwrap().is_none());
        assert!(kv.is_empty());
    }

    #[tokio::test]
    async fn test_restore_contact_by_id() {
        let (_, engine) = engine(StubTransport::ok(ONE_CONTACT));
        engine.sessions().create(NewSession::new("client@example.com")).unwrap();
        assert!(engine.restore_contact().await.unwrap().is_none());
        assert_eq!(engine.crm().transport_calls(), 0);

        engine
            .sessions()
            .attach_contact("003A00000000001AAA", "Jane Doe")
            .unwrap();
        let contact = engine.restore_contact().await.unwrap().expect("contact");
        assert_eq!(contact.id, "003A00000000001AAA");
        assert!(engine.crm().transport_last_url().unwrap().contains("WHERE+Id"));

        // Any bound id is looked up, whatever its length
        engine.sessions().attach_contact("003A", "Jane Doe").unwrap();
        assert!(engine.restore_contact().await.unwrap().is_some());
        assert_eq!(engine.crm().transport_calls(), 2);
        assert!(engine.crm().transport_last_url().unwrap().contains("%27003A%27"));
    }

    #[tokio::test]
    async fn test_sign_out() {
        let (_, engine) = engine(StubTransport::ok(FOUND));
        engine.sessions().create(NewSession::new("client@example.com")).unwrap();
        engine.sync().await.unwrap();

        let redirect = engine.sign_out().await.unwrap();
        assert_eq!(redirect.location, "https://portal.example.com/portal/login.html");
        assert_eq!(engine.state().await, AuthState::SignedOut);
        assert!(engine.sessions().read().unwrap().is_none());

        // Signed out is immediately re-enterable
        assert!(matches!(
            engine.submit("client@example.com").await.unwrap(),
            SubmitOutcome::LinkSent { .. }
        ));
    }

    #[tokio::test]
    async fn test_sync_drops_expired_session() {
        let (_, engine) = engine(StubTransport::ok(FOUND));
        engine.sessions().create(NewSession::new("client@example.com")).unwrap();
        assert!(engine.sync().await.unwrap().is_authenticated());

        engine
            .sessions()
            .create_at(
                NewSession::new("client@example.com"),
                Utc::now() - chrono::Duration::hours(25),
            )
            .unwrap();
        assert_eq!(engine.sync().await.unwrap(), AuthState::Anonymous);
    }

    #[tokio::test]
    async fn test_stale_verification_is_ignored() {
        let gate = Arc::new(Notify::new());
        let (kv, engine) = engine(StubTransport::new(vec![StubReply::Gated(
            gate.clone(),
            200,
            FOUND.to_string(),
        )]));

        let interrupt = async {
            // Let the submit reach the CRM call first
            while engine.crm().transport_calls() == 0 {
                tokio::task::yield_now().await;
            }
            engine.sign_out().await.unwrap();
            gate.notify_one();
        };

        let (outcome, _) = tokio::join!(engine.submit("client@example.com"), interrupt);
        assert_eq!(outcome.unwrap(), SubmitOutcome::Superseded);
        assert_eq!(engine.state().await, AuthState::SignedOut);
        assert!(kv.get(TOKENS_KEY).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_contact_resolution_is_ignored() {
        let gate = Arc::new(Notify::new());
        let (_, engine) = engine(StubTransport::new(vec![StubReply::Gated(
            gate.clone(),
            200,
            ONE_CONTACT.to_string(),
        )]));
        engine.sessions().create(NewSession::new("client@example.com")).unwrap();

        let interrupt = async {
            while engine.crm().transport_calls() == 0 {
                tokio::task::yield_now().await;
            }
            engine.sign_out().await.unwrap();
            gate.notify_one();
        };

        let (resolution, _) = tokio::join!(engine.resolve_contacts(), interrupt);
        assert_eq!(resolution.unwrap(), ContactResolution::Superseded);
        assert!(engine.sessions().read().unwrap().is_none());
    }
}
