//! Synchronization channel: shared server state and the WebSocket handler.
//!
//! Each connection authenticates with `Hello`, then may subscribe to one
//! service at a time. A subscription is a forwarder task that relays the
//! service's change feed to the socket. Requests are answered on the same
//! socket through a single writer task, so replies and pushes never
//! interleave within a frame.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use rundown_proto::agenda::ServiceId;
use rundown_proto::auth::{UserIdentity, can_edit};
use rundown_proto::codec;
use rundown_proto::sync::{ErrorKind, RequestId, SyncMessage};
use rundown_proto::timer::{Clock, SystemClock};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::agenda::{AgendaError, AgendaService};
use crate::error::Rejection;
use crate::feed::{ChangeFeed, DEFAULT_FEED_CAPACITY, FeedEvent};
use crate::identity::IdentityProvider;
use crate::locks::ServiceLocks;
use crate::store::RelationalStore;
use crate::timer::TimerStore;

/// Default maximum accepted frame size in bytes (256 KB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 256 * 1024;

/// Tunables for [`ServerState`].
#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    /// Maximum accepted frame size in bytes.
    pub max_frame_size: usize,
    /// Buffered change-feed events per service.
    pub feed_capacity: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            feed_capacity: DEFAULT_FEED_CAPACITY,
        }
    }
}

/// Shared server state: services, timers, feed, identity and live sockets.
pub struct ServerState<S, I> {
    /// Service catalogue and agenda editing.
    pub agenda: AgendaService<S>,
    /// Authoritative timer state.
    pub timers: Arc<TimerStore<S>>,
    feed: Arc<ChangeFeed>,
    identity: I,
    max_frame_size: usize,
    connections: RwLock<HashMap<u64, mpsc::UnboundedSender<Message>>>,
    next_connection_id: AtomicU64,
}

impl<S: RelationalStore, I: IdentityProvider> ServerState<S, I> {
    /// Creates state with default options and the system clock.
    pub fn new(store: Arc<S>, identity: I) -> Self {
        Self::with_options(store, identity, ServerOptions::default(), Arc::new(SystemClock))
    }

    /// Creates state with custom options and clock.
    pub fn with_options(
        store: Arc<S>,
        identity: I,
        options: ServerOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let feed = Arc::new(ChangeFeed::new(options.feed_capacity));
        let locks = Arc::new(ServiceLocks::new());
        let timers = Arc::new(TimerStore::new(
            Arc::clone(&store),
            Arc::clone(&feed),
            Arc::clone(&locks),
            clock,
        ));
        let agenda = AgendaService::new(store, Arc::clone(&feed), locks, Arc::clone(&timers));
        Self {
            agenda,
            timers,
            feed,
            identity,
            max_frame_size: options.max_frame_size,
            connections: RwLock::new(HashMap::new()),
            next_connection_id: AtomicU64::new(1),
        }
    }

    /// Number of subscribers currently attached to `service_id`.
    #[must_use]
    pub fn subscriber_count(&self, service_id: ServiceId) -> usize {
        self.feed.subscriber_count(service_id)
    }

    /// Number of authenticated connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Sends a close frame to every connection.
    ///
    /// Each writer task closes its socket, which the client observes as a
    /// disconnect. Used for graceful shutdown and in tests.
    pub async fn close_all_connections(&self) {
        let conns = self.connections.read().await;
        for (conn_id, sender) in conns.iter() {
            tracing::info!(conn_id, "sending close frame");
            let _ = sender.send(Message::Close(None));
        }
    }
}

// ---------------------------------------------------------------------------
// Connection handling
// ---------------------------------------------------------------------------

/// An active service subscription owned by one connection.
struct Subscription {
    service_id: ServiceId,
    forwarder: JoinHandle<()>,
}

impl Subscription {
    fn is_active_for(&self, service_id: ServiceId) -> bool {
        self.service_id == service_id && !self.forwarder.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

/// Per-connection state held by the reader task.
struct Connection {
    id: u64,
    user: UserIdentity,
    tx: mpsc::UnboundedSender<Message>,
    subscription: Option<Subscription>,
}

impl Connection {
    fn send(&self, msg: &SyncMessage) {
        send_msg(&self.tx, msg);
    }

    fn reject(&self, request_id: Option<RequestId>, rejection: Rejection) {
        tracing::debug!(
            conn_id = self.id,
            kind = %rejection.kind,
            reason = %rejection.reason,
            "request rejected"
        );
        self.send(&rejection.into_message(request_id));
    }

    fn require_subscription(&self, service_id: ServiceId) -> Result<(), Rejection> {
        if self
            .subscription
            .as_ref()
            .is_some_and(|s| s.is_active_for(service_id))
        {
            Ok(())
        } else {
            Err(Rejection::new(
                ErrorKind::NotSubscribed,
                "subscribe to the service before changing it",
            ))
        }
    }
}

/// Handles an upgraded WebSocket connection.
///
/// The connection lifecycle:
/// 1. Wait for `Hello` and authenticate it.
/// 2. Send `Welcome`, register the connection and start the writer task.
/// 3. Process requests until either side closes.
/// 4. On disconnect, tear down the subscription and unregister.
pub async fn handle_socket<S, I>(socket: WebSocket, state: Arc<ServerState<S, I>>)
where
    S: RelationalStore + 'static,
    I: IdentityProvider + 'static,
{
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let user = match wait_for_hello(&mut ws_receiver, &state).await {
        Ok(user) => user,
        Err(rejection) => {
            tracing::warn!(reason = %rejection.reason, "connection refused");
            let _ = send_sync_msg(&mut ws_sender, &rejection.into_message(None)).await;
            let _ = ws_sender.send(Message::Close(None)).await;
            return;
        }
    };

    let conn_id = state.next_connection_id.fetch_add(1, Ordering::Relaxed);
    if let Err(e) = send_sync_msg(
        &mut ws_sender,
        &SyncMessage::Welcome { user: user.clone() },
    )
    .await
    {
        tracing::warn!(conn_id, error = %e, "failed to send Welcome");
        return;
    }
    tracing::info!(conn_id, user_id = %user.id, role = %user.role, "client authenticated");

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    state.connections.write().await.insert(conn_id, tx.clone());

    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(conn_id, "WebSocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        let mut conn = Connection {
            id: conn_id,
            user,
            tx,
            subscription: None,
        };
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Binary(data) => {
                    handle_binary_message(&mut conn, &data, &reader_state).await;
                }
                Message::Close(_) => {
                    tracing::info!(conn_id, "received close frame");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    state.connections.write().await.remove(&conn_id);
    tracing::info!(conn_id, "client disconnected");
}

/// Waits for the first frame, expecting `Hello`, and authenticates it.
async fn wait_for_hello<S, I>(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
    state: &ServerState<S, I>,
) -> Result<UserIdentity, Rejection>
where
    S: RelationalStore,
    I: IdentityProvider,
{
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Binary(data) => {
                return match codec::decode_bounded(&data, state.max_frame_size) {
                    Ok(SyncMessage::Hello { token }) => {
                        state.identity.authenticate(&token).map_err(Rejection::from)
                    }
                    Ok(other) => {
                        tracing::warn!(msg = ?other, "expected Hello, got different message");
                        Err(Rejection::new(
                            ErrorKind::Unauthenticated,
                            "authenticate before sending requests",
                        ))
                    }
                    Err(e) => Err(Rejection::new(ErrorKind::Invalid, e.to_string())),
                };
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err(Rejection::new(
        ErrorKind::Unauthenticated,
        "connection closed before Hello",
    ))
}

/// Handles one binary frame from an authenticated connection.
async fn handle_binary_message<S, I>(
    conn: &mut Connection,
    data: &[u8],
    state: &Arc<ServerState<S, I>>,
) where
    S: RelationalStore + 'static,
    I: IdentityProvider + 'static,
{
    let msg = match codec::decode_bounded(data, state.max_frame_size) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(conn_id = conn.id, error = %e, "failed to decode frame");
            conn.reject(None, Rejection::new(ErrorKind::Invalid, e.to_string()));
            return;
        }
    };

    match msg {
        SyncMessage::Subscribe {
            request_id,
            service_id,
        } => subscribe(conn, state, request_id, service_id).await,
        SyncMessage::Unsubscribe => {
            if let Some(sub) = conn.subscription.take() {
                tracing::debug!(conn_id = conn.id, service_id = %sub.service_id, "unsubscribed");
            }
        }
        SyncMessage::FetchSnapshot { service_id } => {
            if let Err(rejection) = conn.require_subscription(service_id) {
                conn.reject(None, rejection);
                return;
            }
            match state.timers.observe(service_id).await {
                Ok(timer) => conn.send(&SyncMessage::Snapshot {
                    state: timer,
                    server_time_ms: state.timers.now_ms(),
                }),
                Err(e) => conn.reject(None, e.into()),
            }
        }
        SyncMessage::Control {
            request_id,
            service_id,
            command,
            expected_version,
        } => {
            if let Err(rejection) = conn.require_subscription(service_id) {
                conn.reject(Some(request_id), rejection);
                return;
            }
            match state
                .timers
                .control(&conn.user, service_id, command, expected_version)
                .await
            {
                Ok(timer) => conn.send(&SyncMessage::ControlAck {
                    request_id,
                    state: timer,
                }),
                Err(e) => conn.reject(Some(request_id), e.into()),
            }
        }
        SyncMessage::Agenda {
            request_id,
            service_id,
            command,
        } => {
            if let Err(rejection) = conn.require_subscription(service_id) {
                conn.reject(Some(request_id), rejection);
                return;
            }
            match state.agenda.apply(&conn.user, service_id, command).await {
                Ok(service) => conn.send(&SyncMessage::AgendaAck {
                    request_id,
                    service,
                }),
                Err(e) => conn.reject(Some(request_id), e.into()),
            }
        }
        SyncMessage::ListServices { request_id } => match state.agenda.list_services().await {
            Ok(services) => conn.send(&SyncMessage::ServiceList {
                request_id,
                services,
            }),
            Err(e) => conn.reject(Some(request_id), e.into()),
        },
        SyncMessage::CreateService {
            request_id,
            title,
            date,
        } => match state.agenda.create_service(&conn.user, &title, date).await {
            Ok(service) => conn.send(&SyncMessage::ServiceCreated {
                request_id,
                service,
            }),
            Err(e) => conn.reject(Some(request_id), e.into()),
        },
        SyncMessage::DeleteService {
            request_id,
            service_id,
        } => match state.agenda.delete_service(&conn.user, service_id).await {
            Ok(()) => conn.send(&SyncMessage::Done { request_id }),
            Err(e) => conn.reject(Some(request_id), e.into()),
        },
        SyncMessage::Hello { .. } => {
            conn.reject(
                None,
                Rejection::new(ErrorKind::Invalid, "connection is already authenticated"),
            );
        }
        other => {
            tracing::warn!(conn_id = conn.id, msg = ?other, "unexpected message type from client");
            conn.reject(
                other.reply_to(),
                Rejection::new(ErrorKind::Invalid, "unexpected message"),
            );
        }
    }
}

/// Replaces the connection's subscription with one for `service_id`.
///
/// The feed receiver is created before the initial state is read, so no
/// change committed after the read can be missed. Changes committed in
/// between may arrive twice and are discarded by version on the client.
async fn subscribe<S, I>(
    conn: &mut Connection,
    state: &Arc<ServerState<S, I>>,
    request_id: RequestId,
    service_id: ServiceId,
) where
    S: RelationalStore + 'static,
    I: IdentityProvider + 'static,
{
    let rx = state.feed.subscribe(service_id);

    let loaded = match state.agenda.get_service(service_id).await {
        Ok(service) => state
            .timers
            .observe(service_id)
            .await
            .map(|timer| (service, timer))
            .map_err(Rejection::from),
        Err(e) => Err(e.into()),
    };
    let (service, timer) = match loaded {
        Ok(loaded) => loaded,
        Err(rejection) => {
            // The channel was opened for this request only.
            drop(rx);
            state.feed.prune(service_id);
            conn.reject(Some(request_id), rejection);
            return;
        }
    };

    // Tear down the previous subscription before the new one starts.
    conn.subscription = None;

    let version = timer.version;
    conn.send(&SyncMessage::Subscribed {
        request_id,
        service,
        state: timer,
        server_time_ms: state.timers.now_ms(),
    });

    let forwarder = tokio::spawn(forward_feed(
        rx,
        conn.tx.clone(),
        Arc::clone(state),
        service_id,
    ));
    conn.subscription = Some(Subscription {
        service_id,
        forwarder,
    });
    tracing::info!(
        conn_id = conn.id,
        service_id = %service_id,
        version,
        "subscribed"
    );
}

/// Relays feed events for one service to one socket until the service is
/// removed, the feed closes or the socket goes away.
async fn forward_feed<S, I>(
    mut rx: broadcast::Receiver<FeedEvent>,
    tx: mpsc::UnboundedSender<Message>,
    state: Arc<ServerState<S, I>>,
    service_id: ServiceId,
) where
    S: RelationalStore,
    I: IdentityProvider,
{
    loop {
        let msg = match rx.recv().await {
            Ok(FeedEvent::Timer(timer)) => SyncMessage::Snapshot {
                state: timer,
                server_time_ms: state.timers.now_ms(),
            },
            Ok(FeedEvent::Service(service)) => SyncMessage::ServiceUpdated { service },
            Ok(FeedEvent::Removed(id)) => {
                send_msg(&tx, &SyncMessage::ServiceRemoved { service_id: id });
                break;
            }
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!(service_id = %service_id, missed, "subscriber lagged, resyncing");
                if !resync(&tx, &state, service_id).await {
                    break;
                }
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        if !send_msg(&tx, &msg) {
            break;
        }
    }
}

/// Sends the current service and snapshot after missed feed events.
async fn resync<S, I>(
    tx: &mpsc::UnboundedSender<Message>,
    state: &ServerState<S, I>,
    service_id: ServiceId,
) -> bool
where
    S: RelationalStore,
    I: IdentityProvider,
{
    match state.agenda.get_service(service_id).await {
        Ok(service) => {
            if !send_msg(tx, &SyncMessage::ServiceUpdated { service }) {
                return false;
            }
        }
        Err(AgendaError::ServiceNotFound) => {
            send_msg(tx, &SyncMessage::ServiceRemoved { service_id });
            return false;
        }
        Err(e) => {
            tracing::warn!(service_id = %service_id, error = %e, "resync failed");
            return true;
        }
    }
    match state.timers.observe(service_id).await {
        Ok(timer) => send_msg(
            tx,
            &SyncMessage::Snapshot {
                state: timer,
                server_time_ms: state.timers.now_ms(),
            },
        ),
        Err(e) => {
            tracing::warn!(service_id = %service_id, error = %e, "resync failed");
            true
        }
    }
}

/// Encodes and queues a message for the writer task. Returns `false` once the
/// writer is gone.
fn send_msg(tx: &mpsc::UnboundedSender<Message>, msg: &SyncMessage) -> bool {
    match codec::encode(msg) {
        Ok(bytes) => tx.send(Message::Binary(bytes.into())).is_ok(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode outgoing message");
            true
        }
    }
}

/// Sends a message directly on the socket (before the writer task exists).
async fn send_sync_msg(
    ws_sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    msg: &SyncMessage,
) -> Result<(), String> {
    let bytes = codec::encode(msg).map_err(|e| e.to_string())?;
    ws_sender
        .send(Message::Binary(bytes.into()))
        .await
        .map_err(|e| format!("WebSocket send error: {e}"))
}

// ---------------------------------------------------------------------------
// Server startup
// ---------------------------------------------------------------------------

/// Starts the server on `addr` with the given state.
///
/// Returns the bound address (useful with port 0) and the server task.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound.
pub async fn start_server_with_state<S, I>(
    addr: &str,
    state: Arc<ServerState<S, I>>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
>
where
    S: RelationalStore + 'static,
    I: IdentityProvider + 'static,
{
    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler::<S, I>))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "server error");
        }
    });

    Ok((bound_addr, handle))
}

async fn ws_handler<S, I>(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<ServerState<S, I>>>,
) -> impl axum::response::IntoResponse
where
    S: RelationalStore + 'static,
    I: IdentityProvider + 'static,
{
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}
