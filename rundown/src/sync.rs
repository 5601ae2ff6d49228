//! WebSocket client for the timer synchronization channel.
//!
//! [`SyncClient::connect`] authenticates with the server and spawns a
//! background reader task. Replies are correlated with their request by
//! [`RequestId`]; pushes (snapshots, agenda updates, removals) are forwarded
//! to the caller as [`SyncEvent`]s.
//!
//! The client never changes timer state locally. A successful control call
//! only means the server accepted the command; the new state arrives as a
//! [`SyncEvent::Snapshot`] like it does for every other subscriber.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use rundown_proto::agenda::{Direction, ItemId, ItemPatch, NewItem, Service, ServiceId, UserId};
use rundown_proto::auth::UserIdentity;
use rundown_proto::codec::{self, CodecError};
use rundown_proto::sync::{AgendaCommand, ErrorKind, RequestId, SyncMessage};
use rundown_proto::timer::{TimerCommand, TimerState};

/// Type alias for the write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

type PendingMap = Arc<parking_lot::Mutex<HashMap<RequestId, oneshot::Sender<SyncMessage>>>>;

/// Errors surfaced by [`SyncClient`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The server URL is malformed or not `ws://`/`wss://`.
    #[error("invalid server url: {0}")]
    InvalidUrl(String),

    /// The connection is down.
    #[error("not connected to the server")]
    NotConnected,

    /// Timer or agenda command sent without an active subscription.
    #[error("no service is selected")]
    NotSubscribed,

    /// The server did not answer in time.
    #[error("request timed out")]
    Timeout,

    /// The server refused the request.
    #[error("{kind}: {reason}")]
    Rejected {
        /// Category reported by the server.
        kind: ErrorKind,
        /// Server-provided message.
        reason: String,
    },

    /// The server answered with a message that does not fit the request.
    #[error("unexpected reply from server: {0}")]
    UnexpectedReply(String),

    /// A frame could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// WebSocket or network failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Whether a reconnect attempt could succeed later.
    ///
    /// Authentication failures and missing services are final.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Rejected { kind, .. } => {
                !matches!(kind, ErrorKind::Unauthenticated | ErrorKind::NotFound)
            }
            Self::InvalidUrl(_) => false,
            _ => true,
        }
    }
}

/// Something the server pushed.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// An authoritative timer snapshot.
    Snapshot {
        /// The snapshot.
        state: TimerState,
        /// Server clock at send time.
        server_time_ms: u64,
        /// Local instant the frame was read.
        received_at: Instant,
    },
    /// The subscribed service or its agenda changed.
    ServiceUpdated(Service),
    /// The subscribed service was deleted.
    ServiceRemoved(ServiceId),
    /// The connection is gone; no further events follow.
    Disconnected,
}

/// Timeouts and buffer sizes for [`SyncClient`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// WebSocket connect timeout.
    pub connect_timeout: Duration,
    /// Time to wait for any reply, including `Welcome`.
    pub request_timeout: Duration,
    /// Capacity of the event channel.
    pub event_capacity: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
            event_capacity: 256,
        }
    }
}

/// An authenticated connection to the sync server.
pub struct SyncClient {
    user: UserIdentity,
    ws_sender: Arc<Mutex<WsSender>>,
    pending: PendingMap,
    connected: Arc<AtomicBool>,
    subscribed: Arc<parking_lot::Mutex<Option<ServiceId>>>,
    next_request_id: AtomicU64,
    request_timeout: Duration,
    reader_handle: tokio::task::JoinHandle<()>,
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("user", &self.user)
            .field("connected", &self.is_connected())
            .field("subscribed", &self.subscribed_service())
            .finish_non_exhaustive()
    }
}

impl SyncClient {
    /// Connects to `url` and authenticates with `token`.
    ///
    /// Returns the client and the receiver for pushed [`SyncEvent`]s.
    ///
    /// # Errors
    ///
    /// - [`ClientError::InvalidUrl`] if `url` is not a WebSocket URL.
    /// - [`ClientError::Timeout`] if the connection or `Welcome` is late.
    /// - [`ClientError::Rejected`] if the token is refused.
    /// - [`ClientError::Io`] / [`ClientError::NotConnected`] for network failures.
    pub async fn connect(
        url: &str,
        token: &str,
        options: &ClientOptions,
    ) -> Result<(Self, mpsc::Receiver<SyncEvent>), ClientError> {
        validate_url(url)?;

        let (ws_stream, _response) =
            tokio::time::timeout(options.connect_timeout, connect_async(url))
                .await
                .map_err(|_| {
                    tracing::warn!(url, "sync WebSocket connect timed out");
                    ClientError::Timeout
                })?
                .map_err(|e| {
                    tracing::warn!(url, err = %e, "sync WebSocket connect failed");
                    map_ws_connect_error(e)
                })?;

        let (mut ws_sender, mut ws_reader) = ws_stream.split();

        let hello = codec::encode(&SyncMessage::Hello {
            token: token.to_string(),
        })?;
        ws_sender
            .send(Message::Binary(hello.into()))
            .await
            .map_err(|e| {
                tracing::warn!(err = %e, "failed to send Hello");
                ClientError::NotConnected
            })?;

        let user = wait_for_welcome(&mut ws_reader, options.request_timeout).await?;
        tracing::info!(url, user = %user.name, role = %user.role, "connected to sync server");

        let (tx, rx) = mpsc::channel(options.event_capacity);
        let connected = Arc::new(AtomicBool::new(true));
        let pending: PendingMap = Arc::default();
        let subscribed = Arc::new(parking_lot::Mutex::new(None));

        let reader_handle = tokio::spawn(reader_loop(
            ws_reader,
            tx,
            Arc::clone(&pending),
            Arc::clone(&connected),
            Arc::clone(&subscribed),
        ));

        Ok((
            Self {
                user,
                ws_sender: Arc::new(Mutex::new(ws_sender)),
                pending,
                connected,
                subscribed,
                next_request_id: AtomicU64::new(1),
                request_timeout: options.request_timeout,
                reader_handle,
            },
            rx,
        ))
    }

    /// The identity the server accepted.
    #[must_use]
    pub const fn user(&self) -> &UserIdentity {
        &self.user
    }

    /// Whether the socket is still up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// The service this connection currently observes.
    #[must_use]
    pub fn subscribed_service(&self) -> Option<ServiceId> {
        *self.subscribed.lock()
    }

    /// Subscribes to `service_id`, replacing any previous subscription.
    ///
    /// The current agenda and snapshot are delivered as events before this
    /// returns; the agenda is also returned for convenience.
    ///
    /// # Errors
    ///
    /// [`ClientError::Rejected`] with `NotFound` for an unknown service, or
    /// any transport error.
    pub async fn subscribe(&self, service_id: ServiceId) -> Result<Service, ClientError> {
        let reply = self
            .request(|request_id| SyncMessage::Subscribe {
                request_id,
                service_id,
            })
            .await?;
        match reply {
            SyncMessage::Subscribed { service, .. } => Ok(service),
            other => Err(unexpected(&other)),
        }
    }

    /// Drops the active subscription, if any.
    ///
    /// # Errors
    ///
    /// [`ClientError::NotConnected`] if the socket is down.
    pub async fn unsubscribe(&self) -> Result<(), ClientError> {
        self.send_frame(&SyncMessage::Unsubscribe).await?;
        *self.subscribed.lock() = None;
        Ok(())
    }

    /// Asks the server to push the current snapshot again.
    ///
    /// # Errors
    ///
    /// [`ClientError::NotSubscribed`] without a subscription, or
    /// [`ClientError::NotConnected`].
    pub async fn fetch_snapshot(&self) -> Result<(), ClientError> {
        let service_id = self.require_subscription()?;
        self.send_frame(&SyncMessage::FetchSnapshot { service_id })
            .await
    }

    /// Sends a timer command for the subscribed service.
    ///
    /// With `expected_version` set the server refuses the command with
    /// `Conflict` unless its current version matches.
    ///
    /// # Errors
    ///
    /// [`ClientError::NotSubscribed`], [`ClientError::NotConnected`],
    /// [`ClientError::Timeout`] or the server's [`ClientError::Rejected`].
    pub async fn control(
        &self,
        command: TimerCommand,
        expected_version: Option<u64>,
    ) -> Result<TimerState, ClientError> {
        let service_id = self.require_subscription()?;
        let reply = self
            .request(|request_id| SyncMessage::Control {
                request_id,
                service_id,
                command,
                expected_version,
            })
            .await?;
        match reply {
            SyncMessage::ControlAck { state, .. } => Ok(state),
            other => Err(unexpected(&other)),
        }
    }

    /// Starts timing `item_id` from zero.
    ///
    /// # Errors
    ///
    /// See [`Self::control`].
    pub async fn start(&self, item_id: ItemId) -> Result<TimerState, ClientError> {
        self.control(TimerCommand::Start { item_id }, None).await
    }

    /// Pauses the running timer.
    ///
    /// # Errors
    ///
    /// See [`Self::control`].
    pub async fn pause(&self) -> Result<TimerState, ClientError> {
        self.control(TimerCommand::Pause, None).await
    }

    /// Resumes the paused timer.
    ///
    /// # Errors
    ///
    /// See [`Self::control`].
    pub async fn resume(&self) -> Result<TimerState, ClientError> {
        self.control(TimerCommand::Resume, None).await
    }

    /// Back to idle.
    ///
    /// # Errors
    ///
    /// See [`Self::control`].
    pub async fn reset(&self) -> Result<TimerState, ClientError> {
        self.control(TimerCommand::Reset, None).await
    }

    /// Jumps to `item_id`, running from zero.
    ///
    /// # Errors
    ///
    /// See [`Self::control`].
    pub async fn skip_to_item(&self, item_id: ItemId) -> Result<TimerState, ClientError> {
        self.control(TimerCommand::SkipToItem { item_id }, None)
            .await
    }

    /// Applies an agenda edit to the subscribed service.
    ///
    /// # Errors
    ///
    /// [`ClientError::NotSubscribed`], transport errors, or the server's
    /// [`ClientError::Rejected`].
    pub async fn agenda(&self, command: AgendaCommand) -> Result<Service, ClientError> {
        let service_id = self.require_subscription()?;
        let reply = self
            .request(|request_id| SyncMessage::Agenda {
                request_id,
                service_id,
                command,
            })
            .await?;
        match reply {
            SyncMessage::AgendaAck { service, .. } => Ok(service),
            other => Err(unexpected(&other)),
        }
    }

    /// Appends an item to the agenda.
    ///
    /// # Errors
    ///
    /// See [`Self::agenda`].
    pub async fn add_item(&self, item: NewItem) -> Result<Service, ClientError> {
        self.agenda(AgendaCommand::AddItem { item }).await
    }

    /// Edits an item's title, duration or notes.
    ///
    /// # Errors
    ///
    /// See [`Self::agenda`].
    pub async fn update_item(
        &self,
        item_id: ItemId,
        patch: ItemPatch,
    ) -> Result<Service, ClientError> {
        self.agenda(AgendaCommand::UpdateItem { item_id, patch })
            .await
    }

    /// Removes an item. A running timer on it is reset first.
    ///
    /// # Errors
    ///
    /// See [`Self::agenda`].
    pub async fn delete_item(&self, item_id: ItemId) -> Result<Service, ClientError> {
        self.agenda(AgendaCommand::DeleteItem { item_id }).await
    }

    /// Swaps the item at `index` with its neighbour.
    ///
    /// # Errors
    ///
    /// See [`Self::agenda`].
    pub async fn move_item(
        &self,
        index: u32,
        direction: Direction,
    ) -> Result<Service, ClientError> {
        self.agenda(AgendaCommand::MoveItem { index, direction })
            .await
    }

    /// Changes the service title and/or date.
    ///
    /// # Errors
    ///
    /// See [`Self::agenda`].
    pub async fn update_details(
        &self,
        title: Option<String>,
        date: Option<NaiveDate>,
    ) -> Result<Service, ClientError> {
        self.agenda(AgendaCommand::UpdateDetails { title, date })
            .await
    }

    /// Grants a volunteer edit rights.
    ///
    /// # Errors
    ///
    /// See [`Self::agenda`].
    pub async fn add_editor(&self, user_id: UserId) -> Result<Service, ClientError> {
        self.agenda(AgendaCommand::AddEditor { user_id }).await
    }

    /// Revokes a volunteer's edit rights.
    ///
    /// # Errors
    ///
    /// See [`Self::agenda`].
    pub async fn remove_editor(&self, user_id: UserId) -> Result<Service, ClientError> {
        self.agenda(AgendaCommand::RemoveEditor { user_id }).await
    }

    /// Lists all services, ordered by date.
    ///
    /// # Errors
    ///
    /// Transport errors or [`ClientError::Rejected`].
    pub async fn list_services(&self) -> Result<Vec<Service>, ClientError> {
        let reply = self
            .request(|request_id| SyncMessage::ListServices { request_id })
            .await?;
        match reply {
            SyncMessage::ServiceList { services, .. } => Ok(services),
            other => Err(unexpected(&other)),
        }
    }

    /// Creates an empty service owned by the caller.
    ///
    /// # Errors
    ///
    /// Transport errors or [`ClientError::Rejected`] (`Invalid` title).
    pub async fn create_service(
        &self,
        title: impl Into<String>,
        date: NaiveDate,
    ) -> Result<Service, ClientError> {
        let title = title.into();
        let reply = self
            .request(|request_id| SyncMessage::CreateService {
                request_id,
                title,
                date,
            })
            .await?;
        match reply {
            SyncMessage::ServiceCreated { service, .. } => Ok(service),
            other => Err(unexpected(&other)),
        }
    }

    /// Deletes a service and its timer.
    ///
    /// # Errors
    ///
    /// Transport errors or [`ClientError::Rejected`].
    pub async fn delete_service(&self, service_id: ServiceId) -> Result<(), ClientError> {
        let reply = self
            .request(|request_id| SyncMessage::DeleteService {
                request_id,
                service_id,
            })
            .await?;
        match reply {
            SyncMessage::Done { .. } => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Sends a close frame. Outstanding requests fail with `NotConnected`.
    pub async fn close(&self) {
        let mut sender = self.ws_sender.lock().await;
        if let Err(e) = sender.send(Message::Close(None)).await {
            tracing::debug!(err = %e, "close frame not sent");
        }
        self.connected.store(false, Ordering::Relaxed);
    }

    fn require_subscription(&self) -> Result<ServiceId, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        self.subscribed_service().ok_or(ClientError::NotSubscribed)
    }

    async fn send_frame(&self, msg: &SyncMessage) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let bytes = codec::encode(msg)?;
        let mut sender = self.ws_sender.lock().await;
        sender
            .send(Message::Binary(bytes.into()))
            .await
            .map_err(|e| {
                tracing::warn!(err = %e, "sync send failed");
                self.connected.store(false, Ordering::Relaxed);
                ClientError::NotConnected
            })
    }

    /// Sends a request and waits for the reply carrying its id.
    async fn request(
        &self,
        build: impl FnOnce(RequestId) -> SyncMessage,
    ) -> Result<SyncMessage, ClientError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, tx);

        if let Err(e) = self.send_frame(&build(request_id)).await {
            self.pending.lock().remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Err(_) => {
                self.pending.lock().remove(&request_id);
                tracing::warn!(request_id, "request timed out");
                Err(ClientError::Timeout)
            }
            Ok(Err(_)) => Err(ClientError::NotConnected),
            Ok(Ok(SyncMessage::Error { kind, reason, .. })) => {
                Err(ClientError::Rejected { kind, reason })
            }
            Ok(Ok(reply)) => Ok(reply),
        }
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

/// Accepts only absolute `ws://` and `wss://` URLs with a host.
fn validate_url(raw: &str) -> Result<(), ClientError> {
    let parsed = url::Url::parse(raw).map_err(|e| ClientError::InvalidUrl(format!("{raw}: {e}")))?;
    if !matches!(parsed.scheme(), "ws" | "wss") {
        return Err(ClientError::InvalidUrl(format!(
            "{raw}: scheme must be ws or wss"
        )));
    }
    if parsed.host_str().is_none() {
        return Err(ClientError::InvalidUrl(format!("{raw}: missing host")));
    }
    Ok(())
}

async fn wait_for_welcome(
    ws_reader: &mut WsReader,
    wait: Duration,
) -> Result<UserIdentity, ClientError> {
    let frame = tokio::time::timeout(wait, ws_reader.next())
        .await
        .map_err(|_| {
            tracing::warn!("sync handshake timed out");
            ClientError::Timeout
        })?;

    match frame {
        Some(Ok(Message::Binary(data))) => match codec::decode(&data)? {
            SyncMessage::Welcome { user } => Ok(user),
            SyncMessage::Error { kind, reason, .. } => {
                tracing::warn!(%kind, reason = %reason, "sync handshake rejected");
                Err(ClientError::Rejected { kind, reason })
            }
            other => Err(unexpected(&other)),
        },
        Some(Ok(Message::Close(_))) | None => {
            tracing::warn!("server closed connection during handshake");
            Err(ClientError::NotConnected)
        }
        Some(Ok(_)) => Err(ClientError::UnexpectedReply(
            "non-binary frame during handshake".to_string(),
        )),
        Some(Err(e)) => Err(ClientError::Io(std::io::Error::other(format!(
            "WebSocket error during handshake: {e}"
        )))),
    }
}

/// Background task: dispatches replies to waiting requests and pushes to
/// the event channel.
///
/// Malformed frames are logged and skipped. On exit the connection is
/// marked down, every pending request fails and a final
/// [`SyncEvent::Disconnected`] is emitted.
async fn reader_loop(
    mut ws_reader: WsReader,
    tx: mpsc::Sender<SyncEvent>,
    pending: PendingMap,
    connected: Arc<AtomicBool>,
    subscribed: Arc<parking_lot::Mutex<Option<ServiceId>>>,
) {
    while let Some(msg_result) = ws_reader.next().await {
        let data = match msg_result {
            Ok(Message::Binary(data)) => data,
            Ok(Message::Close(_)) => {
                tracing::info!("sync WebSocket closed by server");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(err = %e, "sync WebSocket read error");
                break;
            }
        };
        let received_at = Instant::now();
        let msg = match codec::decode(&data) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(err = %e, "malformed sync frame, skipping");
                continue;
            }
        };

        for event in events_for(&msg, received_at, &subscribed) {
            // A dropped receiver only stops event delivery; replies still flow.
            let _ = tx.send(event).await;
        }

        match msg.reply_to() {
            Some(request_id) => match pending.lock().remove(&request_id) {
                Some(waiter) => {
                    let _ = waiter.send(msg);
                }
                None => tracing::debug!(request_id, "reply for unknown or expired request"),
            },
            None => {
                if let SyncMessage::Error { kind, reason, .. } = &msg {
                    tracing::warn!(%kind, reason = %reason, "server error");
                }
            }
        }
    }

    connected.store(false, Ordering::Relaxed);
    *subscribed.lock() = None;
    pending.lock().clear();
    let _ = tx.send(SyncEvent::Disconnected).await;
    tracing::info!("sync reader task exiting");
}

/// Events a frame produces, updating the subscription bookkeeping.
///
/// Frames for a service other than the subscribed one are dropped; they can
/// arrive briefly after switching services.
fn events_for(
    msg: &SyncMessage,
    received_at: Instant,
    subscribed: &parking_lot::Mutex<Option<ServiceId>>,
) -> Vec<SyncEvent> {
    let mut current = subscribed.lock();
    match msg {
        SyncMessage::Subscribed {
            service,
            state,
            server_time_ms,
            ..
        } => {
            *current = Some(service.id);
            vec![
                SyncEvent::ServiceUpdated(service.clone()),
                SyncEvent::Snapshot {
                    state: state.clone(),
                    server_time_ms: *server_time_ms,
                    received_at,
                },
            ]
        }
        SyncMessage::Snapshot {
            state,
            server_time_ms,
        } if *current == Some(state.service_id) => vec![SyncEvent::Snapshot {
            state: state.clone(),
            server_time_ms: *server_time_ms,
            received_at,
        }],
        SyncMessage::ServiceUpdated { service } if *current == Some(service.id) => {
            vec![SyncEvent::ServiceUpdated(service.clone())]
        }
        SyncMessage::ServiceRemoved { service_id } if *current == Some(*service_id) => {
            *current = None;
            vec![SyncEvent::ServiceRemoved(*service_id)]
        }
        SyncMessage::Snapshot { .. }
        | SyncMessage::ServiceUpdated { .. }
        | SyncMessage::ServiceRemoved { .. } => {
            tracing::debug!("dropping push for a service no longer observed");
            Vec::new()
        }
        _ => Vec::new(),
    }
}

fn unexpected(msg: &SyncMessage) -> ClientError {
    ClientError::UnexpectedReply(format!("{msg:?}"))
}

/// Map a `tokio_tungstenite` connection error to a [`ClientError`].
fn map_ws_connect_error(err: tokio_tungstenite::tungstenite::Error) -> ClientError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => {
            if io_err.kind() == std::io::ErrorKind::ConnectionRefused
                || io_err.kind() == std::io::ErrorKind::AddrNotAvailable
            {
                ClientError::NotConnected
            } else {
                ClientError::Io(io_err)
            }
        }
        WsError::Tls(_) => ClientError::Io(std::io::Error::other(format!("TLS error: {err}"))),
        WsError::Http(response) => ClientError::Io(std::io::Error::other(format!(
            "server HTTP error: status {}",
            response.status()
        ))),
        other => ClientError::Io(std::io::Error::other(format!(
            "connection error: {other}"
        ))),
    }
}
