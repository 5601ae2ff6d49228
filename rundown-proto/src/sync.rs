//! Synchronization channel protocol between `Rundown` clients and the server.
//!
//! Every frame on the WebSocket is one postcard-encoded [`SyncMessage`]
//! (see [`crate::codec`]). A connection authenticates with
//! [`SyncMessage::Hello`], subscribes to at most one service at a time, and
//! then receives every authoritative [`TimerState`] change for that service
//! as a [`SyncMessage::Snapshot`].
//!
//! Requests that expect a reply carry a client-chosen [`RequestId`]; the
//! server echoes it in the matching ack or [`SyncMessage::Error`].

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::agenda::{Direction, ItemId, ItemPatch, NewItem, Service, ServiceId, UserId};
use crate::auth::UserIdentity;
use crate::timer::{TimerCommand, TimerState};

/// Client-chosen correlation id for request/response pairs.
pub type RequestId = u64;

/// Category of a rejected request, surfaced to the initiating user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Referenced service or item is absent.
    NotFound,
    /// Caller lacks edit/control rights.
    Permission,
    /// The store could not be read or written; safe to retry.
    Persistence,
    /// Malformed input (empty title, zero duration, ...).
    Invalid,
    /// The command's expected version no longer matches.
    Conflict,
    /// The connection has not authenticated.
    Unauthenticated,
    /// The connection has no active subscription for the target service.
    NotSubscribed,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "not found"),
            Self::Permission => write!(f, "permission denied"),
            Self::Persistence => write!(f, "persistence failure"),
            Self::Invalid => write!(f, "invalid request"),
            Self::Conflict => write!(f, "conflict"),
            Self::Unauthenticated => write!(f, "unauthenticated"),
            Self::NotSubscribed => write!(f, "not subscribed"),
        }
    }
}

/// Edits to a service and its agenda.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgendaCommand {
    /// Append a new item.
    AddItem {
        /// Item fields; the server assigns the id.
        item: NewItem,
    },
    /// Partially update an item.
    UpdateItem {
        /// Item to change.
        item_id: ItemId,
        /// Fields to change.
        patch: ItemPatch,
    },
    /// Remove an item. Resets the timer if it was the current item.
    DeleteItem {
        /// Item to remove.
        item_id: ItemId,
    },
    /// Swap the item at `index` with its neighbour.
    MoveItem {
        /// Position of the item to move.
        index: u32,
        /// Which neighbour to swap with.
        direction: Direction,
    },
    /// Change the service title and/or date.
    UpdateDetails {
        /// New title.
        title: Option<String>,
        /// New date.
        date: Option<NaiveDate>,
    },
    /// Grant a user edit/control rights.
    AddEditor {
        /// User to grant.
        user_id: UserId,
    },
    /// Revoke a user's edit/control rights.
    RemoveEditor {
        /// User to revoke.
        user_id: UserId,
    },
}

/// Messages exchanged over the synchronization channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMessage {
    // -- client -> server --
    /// Authenticate the connection. Must be the first frame.
    Hello {
        /// Bearer token understood by the identity provider.
        token: String,
    },
    /// Observe a service. Replaces any previous subscription.
    Subscribe {
        /// Correlation id.
        request_id: RequestId,
        /// Service to observe.
        service_id: ServiceId,
    },
    /// Stop observing the current service.
    Unsubscribe,
    /// Ask for the current snapshot of the subscribed service.
    FetchSnapshot {
        /// Service to fetch.
        service_id: ServiceId,
    },
    /// Timer control command.
    Control {
        /// Correlation id.
        request_id: RequestId,
        /// Target service (must be the subscribed one).
        service_id: ServiceId,
        /// What to do.
        command: TimerCommand,
        /// When set, reject unless the current version matches.
        expected_version: Option<u64>,
    },
    /// Agenda edit.
    Agenda {
        /// Correlation id.
        request_id: RequestId,
        /// Target service (must be the subscribed one).
        service_id: ServiceId,
        /// What to change.
        command: AgendaCommand,
    },
    /// List every service.
    ListServices {
        /// Correlation id.
        request_id: RequestId,
    },
    /// Create a new empty service owned by the caller.
    CreateService {
        /// Correlation id.
        request_id: RequestId,
        /// Service title.
        title: String,
        /// Service date.
        date: NaiveDate,
    },
    /// Delete a service and its timer.
    DeleteService {
        /// Correlation id.
        request_id: RequestId,
        /// Service to delete.
        service_id: ServiceId,
    },

    // -- server -> client --
    /// Authentication accepted.
    Welcome {
        /// Who the server thinks we are.
        user: UserIdentity,
    },
    /// Subscription established, with the state for first paint.
    Subscribed {
        /// Correlation id.
        request_id: RequestId,
        /// Current service and agenda.
        service: Service,
        /// Current authoritative timer state.
        state: TimerState,
        /// Server clock when `state` was read (ms since epoch).
        server_time_ms: u64,
    },
    /// An authoritative timer snapshot.
    Snapshot {
        /// The snapshot.
        state: TimerState,
        /// Server clock when the snapshot was sent (ms since epoch).
        server_time_ms: u64,
    },
    /// The subscribed service or its agenda changed.
    ServiceUpdated {
        /// Full new service row.
        service: Service,
    },
    /// The subscribed service was deleted; the subscription is gone.
    ServiceRemoved {
        /// Deleted service.
        service_id: ServiceId,
    },
    /// Control command accepted.
    ControlAck {
        /// Correlation id.
        request_id: RequestId,
        /// State after the command (unchanged for a no-op).
        state: TimerState,
    },
    /// Agenda command accepted.
    AgendaAck {
        /// Correlation id.
        request_id: RequestId,
        /// Service after the command.
        service: Service,
    },
    /// Reply to [`SyncMessage::ListServices`].
    ServiceList {
        /// Correlation id.
        request_id: RequestId,
        /// All services.
        services: Vec<Service>,
    },
    /// Reply to [`SyncMessage::CreateService`].
    ServiceCreated {
        /// Correlation id.
        request_id: RequestId,
        /// The new service.
        service: Service,
    },
    /// Generic success for requests with no payload.
    Done {
        /// Correlation id.
        request_id: RequestId,
    },
    /// Request rejected.
    Error {
        /// Correlation id, when the failure belongs to a request.
        request_id: Option<RequestId>,
        /// Category.
        kind: ErrorKind,
        /// Human-readable message.
        reason: String,
    },
}

impl SyncMessage {
    /// Correlation id for replies, `None` for pushes and requests.
    #[must_use]
    pub const fn reply_to(&self) -> Option<RequestId> {
        match self {
            Self::Subscribed { request_id, .. }
            | Self::ControlAck { request_id, .. }
            | Self::AgendaAck { request_id, .. }
            | Self::ServiceList { request_id, .. }
            | Self::ServiceCreated { request_id, .. }
            | Self::Done { request_id } => Some(*request_id),
            Self::Error { request_id, .. } => *request_id,
            _ => None,
        }
    }
}
