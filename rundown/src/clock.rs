//! Local playback clock.
//!
//! Between authoritative snapshots the client advances the displayed time
//! locally. Nothing here accumulates ticks: every value is a pure function
//! of the last applied snapshot, the instant it was received and the
//! current instant, so re-rendering mid-second never makes the clock jump.
//!
//! Snapshots carry the server clock at send time. The elapsed value at
//! receipt is taken from the snapshot's own anchor evaluated at that server
//! time, and only the local monotonic delta since receipt is added on top.
//! Client and server wall clocks are never compared.

use std::time::Instant;

use rundown_proto::agenda::{AgendaItem, ItemId, Service, ServiceId};
use rundown_proto::timer::{TimerPhase, TimerState};

/// Elapsed whole seconds to display for `snapshot` at `now`.
///
/// Running: `elapsed(server_time_ms) + (now - received_at)`, floored to whole
/// seconds after summing. Paused or idle: the stored value.
#[must_use]
pub fn displayed_elapsed(
    snapshot: &TimerState,
    server_time_ms: u64,
    received_at: Instant,
    now: Instant,
) -> u64 {
    if !snapshot.is_running {
        return snapshot.elapsed_secs;
    }
    let local_ms =
        u64::try_from(now.saturating_duration_since(received_at).as_millis()).unwrap_or(u64::MAX);
    snapshot
        .elapsed_ms_at(server_time_ms)
        .saturating_add(local_ms)
        / 1000
}

/// Fraction of `duration_secs` consumed, clamped to `0.0..=1.0`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn progress(elapsed_secs: u64, duration_secs: u32) -> f64 {
    if duration_secs == 0 {
        return 1.0;
    }
    (elapsed_secs as f64 / f64::from(duration_secs)).min(1.0)
}

/// Seconds left on the item, never negative.
#[must_use]
pub fn remaining(elapsed_secs: u64, duration_secs: u32) -> u64 {
    u64::from(duration_secs).saturating_sub(elapsed_secs)
}

/// The item after `current` in playback order.
///
/// `None` when there is no current item or it is the last one.
#[must_use]
pub fn next_item<'a>(service: &'a Service, current: Option<&ItemId>) -> Option<&'a AgendaItem> {
    service.item_after(current?)
}

/// Formats seconds as `MM:SS`. Minutes keep counting past 59.
#[must_use]
pub fn format_clock(secs: u64) -> String {
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

/// Result of offering a snapshot to [`PlaybackClock::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The snapshot is now the basis of the display.
    Applied,
    /// The snapshot's version is not newer than the applied one; discarded.
    Stale,
}

/// An applied snapshot and where it was anchored locally.
#[derive(Debug, Clone)]
struct Anchor {
    state: TimerState,
    server_time_ms: u64,
    received_at: Instant,
}

/// Holds the latest authoritative snapshot for one service.
#[derive(Debug, Clone, Default)]
pub struct PlaybackClock {
    anchor: Option<Anchor>,
}

impl PlaybackClock {
    /// Creates a clock with nothing applied.
    #[must_use]
    pub const fn new() -> Self {
        Self { anchor: None }
    }

    /// Offers a snapshot received at `received_at`.
    ///
    /// Snapshots are ordered by version, not arrival: a version lower than
    /// or equal to the applied one is discarded. A snapshot for a different
    /// service replaces the held one.
    pub fn apply(
        &mut self,
        state: TimerState,
        server_time_ms: u64,
        received_at: Instant,
    ) -> ApplyOutcome {
        if let Some(current) = &self.anchor
            && current.state.service_id == state.service_id
            && !state.supersedes(&current.state)
        {
            tracing::debug!(
                held = current.state.version,
                received = state.version,
                "discarding stale snapshot"
            );
            return ApplyOutcome::Stale;
        }
        self.anchor = Some(Anchor {
            state,
            server_time_ms,
            received_at,
        });
        ApplyOutcome::Applied
    }

    /// Forgets the applied snapshot (service deselected or new connection).
    pub fn clear(&mut self) {
        self.anchor = None;
    }

    /// The applied snapshot, if any.
    #[must_use]
    pub fn snapshot(&self) -> Option<&TimerState> {
        self.anchor.as_ref().map(|a| &a.state)
    }

    /// Version of the applied snapshot.
    #[must_use]
    pub fn version(&self) -> Option<u64> {
        self.snapshot().map(|s| s.version)
    }

    /// Service the applied snapshot belongs to.
    #[must_use]
    pub fn service_id(&self) -> Option<ServiceId> {
        self.snapshot().map(|s| s.service_id)
    }

    /// Elapsed seconds to display at `now`; zero when nothing is applied.
    #[must_use]
    pub fn elapsed(&self, now: Instant) -> u64 {
        self.anchor.as_ref().map_or(0, |a| {
            displayed_elapsed(&a.state, a.server_time_ms, a.received_at, now)
        })
    }

    /// Builds the render model for `service` at `now`.
    #[must_use]
    pub fn frame(&self, service: &Service, now: Instant) -> TimerFrame {
        let Some(state) = self.snapshot() else {
            return TimerFrame::idle(service);
        };
        let current = state
            .current_item_id
            .as_ref()
            .and_then(|id| service.item(id));
        let Some(current) = current else {
            return TimerFrame {
                version: state.version,
                ..TimerFrame::idle(service)
            };
        };

        let elapsed = self.elapsed(now);
        TimerFrame {
            phase: state.phase(),
            version: state.version,
            current_title: Some(current.title.clone()),
            next_title: next_item(service, Some(&current.id)).map(|i| i.title.clone()),
            up_first: None,
            elapsed_secs: elapsed,
            duration_secs: current.duration_secs,
            remaining_secs: remaining(elapsed, current.duration_secs),
            progress: progress(elapsed, current.duration_secs),
            is_running: state.is_running,
            overrun: elapsed > u64::from(current.duration_secs),
        }
    }
}

/// Everything a view needs to draw the live timer.
#[derive(Debug, Clone, PartialEq)]
pub struct TimerFrame {
    /// Timer phase.
    pub phase: TimerPhase,
    /// Version of the snapshot the frame was built from.
    pub version: u64,
    /// Title of the current item.
    pub current_title: Option<String>,
    /// Title of the following item. `None` while no item is current.
    pub next_title: Option<String>,
    /// Title of the first agenda item, set only while idle.
    pub up_first: Option<String>,
    /// Displayed elapsed seconds.
    pub elapsed_secs: u64,
    /// Nominal duration of the current item.
    pub duration_secs: u32,
    /// Seconds left, clamped at zero.
    pub remaining_secs: u64,
    /// Progress in `0.0..=1.0`.
    pub progress: f64,
    /// Whether the timer is counting.
    pub is_running: bool,
    /// Elapsed time exceeds the nominal duration.
    pub overrun: bool,
}

impl TimerFrame {
    fn idle(service: &Service) -> Self {
        Self {
            phase: TimerPhase::Idle,
            version: 0,
            current_title: None,
            next_title: None,
            up_first: service.items.first().map(|i| i.title.clone()),
            elapsed_secs: 0,
            duration_secs: 0,
            remaining_secs: 0,
            progress: 0.0,
            is_running: false,
            overrun: false,
        }
    }

    /// One-line textual rendering, e.g.
    /// `Welcome  03:12 / 05:00  remaining 01:48  [running]  next: Prayer`.
    #[must_use]
    pub fn render_line(&self) -> String {
        let Some(title) = &self.current_title else {
            return match &self.up_first {
                Some(first) => format!("[idle]  up first: {first}"),
                None => "[idle]  agenda is empty".to_string(),
            };
        };
        let mut line = format!(
            "{title}  {} / {}  remaining {}  [{}]",
            format_clock(self.elapsed_secs),
            format_clock(u64::from(self.duration_secs)),
            format_clock(self.remaining_secs),
            self.phase,
        );
        if self.overrun {
            line.push_str("  OVERRUN");
        }
        if let Some(next) = &self.next_title {
            line.push_str("  next: ");
            line.push_str(next);
        }
        line
    }
}
