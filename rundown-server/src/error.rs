//! Mapping of server errors onto the wire-level [`ErrorKind`].

use rundown_proto::sync::{ErrorKind, RequestId, SyncMessage};

use crate::agenda::AgendaError;
use crate::identity::AuthError;
use crate::store::StoreError;
use crate::timer::TimerError;

/// Message shown to users when the store fails. The detail is only logged.
const PERSISTENCE_REASON: &str = "could not save changes, please retry";

/// A request failure ready to be sent to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Category.
    pub kind: ErrorKind,
    /// User-facing message.
    pub reason: String,
}

impl Rejection {
    /// Creates a rejection.
    pub fn new(kind: ErrorKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }

    /// Wraps the rejection into an [`SyncMessage::Error`] reply.
    #[must_use]
    pub fn into_message(self, request_id: Option<RequestId>) -> SyncMessage {
        SyncMessage::Error {
            request_id,
            kind: self.kind,
            reason: self.reason,
        }
    }

    fn persistence(source: &StoreError) -> Self {
        tracing::error!(error = %source, "store operation failed");
        Self::new(ErrorKind::Persistence, PERSISTENCE_REASON)
    }
}

impl From<TimerError> for Rejection {
    fn from(e: TimerError) -> Self {
        match &e {
            TimerError::ServiceNotFound | TimerError::ItemNotFound(_) => {
                Self::new(ErrorKind::NotFound, e.to_string())
            }
            TimerError::Permission => Self::new(ErrorKind::Permission, e.to_string()),
            TimerError::Conflict { .. } => Self::new(ErrorKind::Conflict, e.to_string()),
            TimerError::Persistence(source) => Self::persistence(source),
        }
    }
}

impl From<AgendaError> for Rejection {
    fn from(e: AgendaError) -> Self {
        match e {
            AgendaError::ServiceNotFound | AgendaError::ItemNotFound(_) => {
                Self::new(ErrorKind::NotFound, e.to_string())
            }
            AgendaError::Permission => Self::new(ErrorKind::Permission, e.to_string()),
            AgendaError::Invalid(_) | AgendaError::CreatorGrant => {
                Self::new(ErrorKind::Invalid, e.to_string())
            }
            AgendaError::Persistence(source) => Self::persistence(&source),
            AgendaError::Timer(inner) => inner.into(),
        }
    }
}

impl From<AuthError> for Rejection {
    fn from(e: AuthError) -> Self {
        Self::new(ErrorKind::Unauthenticated, e.to_string())
    }
}
