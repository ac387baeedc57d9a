use tracing::{debug, warn};

use super::session::{Session, SessionStore};

/// A navigation the caller must perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub location: String,
}

impl Redirect {
    pub fn to(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
        }
    }
}

/// Performs navigations on behalf of the guard.
///
/// `replace` must not leave the current location in history, so there is no
/// back-button return to a protected page that was never authorized.
pub trait Navigator {
    fn replace(&self, location: &str);
}

/// Gate for protected views.
#[derive(Clone)]
pub struct SessionGuard {
    sessions: SessionStore,
}

impl SessionGuard {
    pub fn new(sessions: SessionStore) -> Self {
        Self { sessions }
    }

    /// Return the live session, or send the navigator to the sign-in page and
    /// return `None`. Callers must stop rendering on `None`.
    pub fn require_session<N: Navigator + ?Sized>(&self, navigator: &N) -> Option<Session> {
        let session = match self.sessions.read() {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "Failed to read session, treating as signed out");
                None
            }
        };

        match session {
            Some(session) => Some(session),
            None => {
                debug!(location = self.sessions.sign_in_url(), "No live session, redirecting");
                navigator.replace(self.sessions.sign_in_url());
                None
            }
        }
    }
}
