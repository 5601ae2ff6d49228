//! A live view of one service's timer.
//!
//! [`ServiceSession::spawn`] keeps a subscription to a single service alive
//! across connection drops and emits a [`SessionUpdate::Frame`] every tick.
//! Ticks are computed locally from the last applied snapshot and never wait
//! on the network. While disconnected the display keeps counting from the
//! last snapshot and a background task reconnects with exponential backoff;
//! on reconnect the session subscribes again, which delivers a fresh
//! snapshot. Dropping the session tears down the task, the connection and
//! with it the server-side subscription.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use rundown_proto::agenda::{ItemId, Service, ServiceId};
use rundown_proto::timer::{TimerCommand, TimerState};

use crate::clock::{ApplyOutcome, PlaybackClock, TimerFrame};
use crate::sync::{ClientError, ClientOptions, SyncClient, SyncEvent};

/// Backoff schedule for reconnect attempts.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound for the delay.
    pub max_delay: Duration,
    /// Attempts before giving up; `0` retries forever.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 0,
        }
    }
}

impl ReconnectConfig {
    /// Delay after the `attempt`-th failure (1-based): doubles from
    /// `initial_delay`, capped at `max_delay`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    const fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts != 0 && attempts >= self.max_attempts
    }
}

/// Everything needed to (re)connect a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Server WebSocket URL.
    pub url: String,
    /// Bearer token.
    pub token: String,
    /// Connection timeouts.
    pub client: ClientOptions,
    /// Display refresh period.
    pub tick: Duration,
    /// Reconnect schedule.
    pub reconnect: ReconnectConfig,
    /// Capacity of the update channel.
    pub update_capacity: usize,
}

impl SessionOptions {
    /// Options with default timeouts, a 1 s tick and default backoff.
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            client: ClientOptions::default(),
            tick: Duration::from_secs(1),
            reconnect: ReconnectConfig::default(),
            update_capacity: 64,
        }
    }
}

/// What a session reports to its owner.
#[derive(Debug, Clone)]
pub enum SessionUpdate {
    /// Periodic render model.
    Frame(TimerFrame),
    /// Subscribed (again) and holding a fresh snapshot.
    Connected,
    /// Lost the connection; reconnecting in the background.
    Disconnected,
    /// The service was deleted. The session has stopped.
    ServiceRemoved,
    /// Reconnecting failed for good. The session has stopped.
    GaveUp(String),
}

/// State shared between the session task and its handle.
#[derive(Debug, Default)]
struct View {
    service: Option<Service>,
    clock: PlaybackClock,
}

type ClientSlot = Arc<parking_lot::RwLock<Option<Arc<SyncClient>>>>;

/// Handle to a running session. Dropping it stops the session.
#[derive(Debug)]
pub struct ServiceSession {
    service_id: ServiceId,
    view: Arc<parking_lot::Mutex<View>>,
    client: ClientSlot,
    task: JoinHandle<()>,
}

impl ServiceSession {
    /// Starts watching `service_id`.
    ///
    /// Returns immediately; connecting happens in the background. The first
    /// [`SessionUpdate::Connected`] signals that a snapshot is applied.
    #[must_use]
    pub fn spawn(
        options: SessionOptions,
        service_id: ServiceId,
    ) -> (Self, mpsc::Receiver<SessionUpdate>) {
        let (updates_tx, updates_rx) = mpsc::channel(options.update_capacity);
        let view = Arc::new(parking_lot::Mutex::new(View::default()));
        let client: ClientSlot = Arc::default();

        let task = tokio::spawn(run(
            options,
            service_id,
            Arc::clone(&view),
            Arc::clone(&client),
            updates_tx,
        ));

        (
            Self {
                service_id,
                view,
                client,
                task,
            },
            updates_rx,
        )
    }

    /// The watched service.
    #[must_use]
    pub const fn service_id(&self) -> ServiceId {
        self.service_id
    }

    /// Whether the session currently has a live subscription.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.client
            .read()
            .as_ref()
            .is_some_and(|c| c.is_connected())
    }

    /// The render model right now, once the agenda is known.
    #[must_use]
    pub fn frame(&self) -> Option<TimerFrame> {
        let view = self.view.lock();
        let service = view.service.as_ref()?;
        Some(view.clock.frame(service, Instant::now()))
    }

    /// Latest known agenda.
    #[must_use]
    pub fn service(&self) -> Option<Service> {
        self.view.lock().service.clone()
    }

    /// Latest applied snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Option<TimerState> {
        self.view.lock().clock.snapshot().cloned()
    }

    /// The live connection, for agenda edits and catalogue requests.
    ///
    /// # Errors
    ///
    /// [`ClientError::NotConnected`] while reconnecting.
    pub fn client(&self) -> Result<Arc<SyncClient>, ClientError> {
        self.client
            .read()
            .clone()
            .filter(|c| c.is_connected())
            .ok_or(ClientError::NotConnected)
    }

    /// Sends a timer command. Fails immediately while disconnected.
    ///
    /// # Errors
    ///
    /// See [`SyncClient::control`].
    pub async fn control(&self, command: TimerCommand) -> Result<TimerState, ClientError> {
        self.client()?.control(command, None).await
    }

    /// Starts timing `item_id`.
    ///
    /// # Errors
    ///
    /// See [`Self::control`].
    pub async fn start(&self, item_id: ItemId) -> Result<TimerState, ClientError> {
        self.control(TimerCommand::Start { item_id }).await
    }

    /// Pauses the timer.
    ///
    /// # Errors
    ///
    /// See [`Self::control`].
    pub async fn pause(&self) -> Result<TimerState, ClientError> {
        self.control(TimerCommand::Pause).await
    }

    /// Resumes the timer.
    ///
    /// # Errors
    ///
    /// See [`Self::control`].
    pub async fn resume(&self) -> Result<TimerState, ClientError> {
        self.control(TimerCommand::Resume).await
    }

    /// Resets the timer.
    ///
    /// # Errors
    ///
    /// See [`Self::control`].
    pub async fn reset(&self) -> Result<TimerState, ClientError> {
        self.control(TimerCommand::Reset).await
    }

    /// Skips to `item_id`.
    ///
    /// # Errors
    ///
    /// See [`Self::control`].
    pub async fn skip_to_item(&self, item_id: ItemId) -> Result<TimerState, ClientError> {
        self.control(TimerCommand::SkipToItem { item_id }).await
    }

    /// Unsubscribes and stops the session.
    pub async fn close(self) {
        let client = self.client.read().clone();
        if let Some(client) = client {
            if let Err(e) = client.unsubscribe().await {
                tracing::debug!(err = %e, "unsubscribe on close failed");
            }
            client.close().await;
        }
    }
}

impl Drop for ServiceSession {
    fn drop(&mut self) {
        self.task.abort();
        self.client.write().take();
    }
}

/// Handle to a running connector; aborts the retry loop when dropped.
struct Connector(JoinHandle<()>);

impl Connector {
    fn spawn(
        options: &SessionOptions,
        service_id: ServiceId,
        done: &mpsc::Sender<Result<Established, ClientError>>,
    ) -> Self {
        Self(tokio::spawn(connect_with_backoff(
            options.clone(),
            service_id,
            done.clone(),
        )))
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// A subscribed connection handed from the connector to the session loop.
struct Established {
    client: Arc<SyncClient>,
    events: mpsc::Receiver<SyncEvent>,
}

async fn run(
    options: SessionOptions,
    service_id: ServiceId,
    view: Arc<parking_lot::Mutex<View>>,
    slot: ClientSlot,
    updates: mpsc::Sender<SessionUpdate>,
) {
    let (conn_tx, mut conn_rx) = mpsc::channel::<Result<Established, ClientError>>(1);
    let mut connector = Some(Connector::spawn(&options, service_id, &conn_tx));
    let mut events: Option<mpsc::Receiver<SyncEvent>> = None;

    let mut tick = tokio::time::interval(options.tick);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let frame = {
                    let view = view.lock();
                    view.service
                        .as_ref()
                        .map(|service| view.clock.frame(service, Instant::now()))
                };
                if let Some(frame) = frame {
                    // A slow consumer misses frames instead of stalling the loop.
                    let _ = updates.try_send(SessionUpdate::Frame(frame));
                }
            }
            Some(outcome) = conn_rx.recv() => {
                connector = None;
                match outcome {
                    Ok(established) => {
                        // Versions are only comparable within one connection's
                        // stream; the subscription just delivered a fresh baseline.
                        view.lock().clock.clear();
                        *slot.write() = Some(established.client);
                        events = Some(established.events);
                        tracing::info!(%service_id, "session subscribed");
                        let _ = updates.send(SessionUpdate::Connected).await;
                    }
                    Err(e) => {
                        tracing::error!(%service_id, err = %e, "session giving up");
                        let _ = updates.send(SessionUpdate::GaveUp(e.to_string())).await;
                        return;
                    }
                }
            }
            event = next_event(&mut events) => match event {
                SyncEvent::Snapshot { state, server_time_ms, received_at } => {
                    let outcome = view.lock().clock.apply(state, server_time_ms, received_at);
                    if outcome == ApplyOutcome::Stale {
                        tracing::debug!(%service_id, "stale snapshot ignored");
                    }
                }
                SyncEvent::ServiceUpdated(service) => {
                    view.lock().service = Some(service);
                }
                SyncEvent::ServiceRemoved(_) => {
                    tracing::info!(%service_id, "service removed, stopping session");
                    slot.write().take();
                    let _ = updates.send(SessionUpdate::ServiceRemoved).await;
                    return;
                }
                SyncEvent::Disconnected => {
                    tracing::warn!(%service_id, "session disconnected, reconnecting");
                    events = None;
                    slot.write().take();
                    let _ = updates.send(SessionUpdate::Disconnected).await;
                    if connector.is_none() {
                        connector = Some(Connector::spawn(&options, service_id, &conn_tx));
                    }
                }
            },
        }
    }
}

/// Next event from the current connection, or pending forever without one.
async fn next_event(events: &mut Option<mpsc::Receiver<SyncEvent>>) -> SyncEvent {
    match events {
        Some(rx) => rx.recv().await.unwrap_or(SyncEvent::Disconnected),
        None => std::future::pending().await,
    }
}

/// Connects and subscribes, retrying with exponential backoff.
///
/// Sends at most one outcome: the established connection, or the error
/// that ended the retries. Stops quietly once the session loop is gone.
async fn connect_with_backoff(
    options: SessionOptions,
    service_id: ServiceId,
    done: mpsc::Sender<Result<Established, ClientError>>,
) {
    let mut attempts = 0u32;
    let outcome = loop {
        if done.is_closed() {
            return;
        }
        attempts += 1;
        match establish(&options, service_id).await {
            Ok(established) => break Ok(established),
            Err(e) if !e.is_retryable() || options.reconnect.exhausted(attempts) => break Err(e),
            Err(e) => {
                let delay = options.reconnect.delay_for(attempts);
                tracing::warn!(
                    %service_id,
                    attempt = attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    err = %e,
                    "connect failed, retrying"
                );
                if done.is_closed() {
                    return;
                }
                tokio::time::sleep(delay).await;
            }
        }
    };
    let _ = done.send(outcome).await;
}

async fn establish(options: &SessionOptions, service_id: ServiceId) -> Result<Established, ClientError> {
    let (client, events) = SyncClient::connect(&options.url, &options.token, &options.client).await?;
    client.subscribe(service_id).await?;
    Ok(Established {
        client: Arc::new(client),
        events,
    })
}
