//! Live timer state machine for a single service.
//!
//! [`TimerState`] is the authoritative snapshot persisted once per service.
//! The transition functions here are pure: they take the current snapshot
//! and the current time and return the next snapshot (or `None` for a
//! no-op). The server owns validation, persistence and fan-out.
//!
//! Elapsed time is never accumulated tick by tick. A running snapshot
//! stores the elapsed seconds at its last change plus the time of that
//! change, and every reader derives the current value from that anchor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::agenda::{ItemId, ServiceId};

/// Source of wall-clock time in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    /// Returns the current time in milliseconds since epoch.
    fn now_ms(&self) -> u64;
}

/// [`Clock`] backed by the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        u64::try_from(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis(),
        )
        .unwrap_or(u64::MAX)
    }
}

/// Manually advanced [`Clock`] for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    /// Creates a clock frozen at `now_ms`.
    #[must_use]
    pub const fn new(now_ms: u64) -> Self {
        Self(AtomicU64::new(now_ms))
    }

    /// Moves the clock forward by `ms` milliseconds.
    pub fn advance_ms(&self, ms: u64) {
        self.0.fetch_add(ms, Ordering::SeqCst);
    }

    /// Moves the clock forward by whole seconds.
    pub fn advance_secs(&self, secs: u64) {
        self.advance_ms(secs.saturating_mul(1000));
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Derived phase of a [`TimerState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerPhase {
    /// No current item.
    Idle,
    /// Counting on the current item.
    Running,
    /// Frozen on the current item.
    Paused,
}

impl std::fmt::Display for TimerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
        }
    }
}

/// Control operations a controller may issue against a service timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerCommand {
    /// Begin running `item_id` from zero.
    Start {
        /// Item to run.
        item_id: ItemId,
    },
    /// Freeze the running item at its current elapsed time.
    Pause,
    /// Continue a paused item from its frozen elapsed time.
    Resume,
    /// Return to idle.
    Reset,
    /// Jump to `item_id`, discarding the previous item's progress.
    SkipToItem {
        /// Item to run.
        item_id: ItemId,
    },
}

impl TimerCommand {
    /// The item this command targets, if any.
    #[must_use]
    pub const fn target_item(&self) -> Option<ItemId> {
        match self {
            Self::Start { item_id } | Self::SkipToItem { item_id } => Some(*item_id),
            Self::Pause | Self::Resume | Self::Reset => None,
        }
    }
}

/// Authoritative, versioned timer snapshot for one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerState {
    /// Owning service.
    pub service_id: ServiceId,
    /// Whether the current item is counting.
    pub is_running: bool,
    /// Item being timed, if any.
    pub current_item_id: Option<ItemId>,
    /// Elapsed seconds on the current item as of `last_changed_at`.
    pub elapsed_secs: u64,
    /// When this snapshot was written (ms since epoch).
    pub last_changed_at: u64,
    /// Monotonic per-service version; bumped on every transition.
    pub version: u64,
}

impl TimerState {
    /// The idle state a service starts in.
    #[must_use]
    pub const fn idle(service_id: ServiceId, now_ms: u64) -> Self {
        Self {
            service_id,
            is_running: false,
            current_item_id: None,
            elapsed_secs: 0,
            last_changed_at: now_ms,
            version: 0,
        }
    }

    /// Derived phase of this snapshot.
    #[must_use]
    pub const fn phase(&self) -> TimerPhase {
        match (self.current_item_id, self.is_running) {
            (None, _) => TimerPhase::Idle,
            (Some(_), true) => TimerPhase::Running,
            (Some(_), false) => TimerPhase::Paused,
        }
    }

    /// Elapsed seconds at `now_ms`, derived from the fixed anchor.
    ///
    /// Running: `elapsed_secs + floor((now - last_changed_at) / 1000)`.
    /// Otherwise the stored value. A `now_ms` before the anchor (clock
    /// skew) contributes nothing.
    #[must_use]
    pub const fn elapsed_at(&self, now_ms: u64) -> u64 {
        if !self.is_running {
            return self.elapsed_secs;
        }
        self.elapsed_secs + now_ms.saturating_sub(self.last_changed_at) / 1000
    }

    /// Elapsed milliseconds at `now_ms`; same anchor as [`Self::elapsed_at`].
    #[must_use]
    pub const fn elapsed_ms_at(&self, now_ms: u64) -> u64 {
        let stored = self.elapsed_secs.saturating_mul(1000);
        if !self.is_running {
            return stored;
        }
        stored.saturating_add(now_ms.saturating_sub(self.last_changed_at))
    }

    /// Whether this snapshot is strictly newer than `other`.
    #[must_use]
    pub const fn supersedes(&self, other: &Self) -> bool {
        self.version > other.version
    }

    /// Applies a command, returning the next snapshot or `None` for a no-op.
    ///
    /// Item existence is the caller's concern; this only encodes the state
    /// machine.
    #[must_use]
    pub fn apply(&self, command: TimerCommand, now_ms: u64) -> Option<Self> {
        match command {
            TimerCommand::Start { item_id } | TimerCommand::SkipToItem { item_id } => {
                Some(self.started(item_id, now_ms))
            }
            TimerCommand::Pause => self.paused(now_ms),
            TimerCommand::Resume => self.resumed(now_ms),
            TimerCommand::Reset => Some(self.reset(now_ms)),
        }
    }

    /// Running on `item_id` from zero. Valid from any phase, including when
    /// `item_id` is already current.
    #[must_use]
    pub const fn started(&self, item_id: ItemId, now_ms: u64) -> Self {
        Self {
            service_id: self.service_id,
            is_running: true,
            current_item_id: Some(item_id),
            elapsed_secs: 0,
            last_changed_at: now_ms,
            version: self.version + 1,
        }
    }

    /// Freezes a running snapshot. `None` unless running.
    #[must_use]
    pub const fn paused(&self, now_ms: u64) -> Option<Self> {
        if !matches!(self.phase(), TimerPhase::Running) {
            return None;
        }
        Some(Self {
            service_id: self.service_id,
            is_running: false,
            current_item_id: self.current_item_id,
            elapsed_secs: self.elapsed_at(now_ms),
            last_changed_at: now_ms,
            version: self.version + 1,
        })
    }

    /// Continues a paused snapshot from its frozen value. `None` unless
    /// paused.
    #[must_use]
    pub const fn resumed(&self, now_ms: u64) -> Option<Self> {
        if !matches!(self.phase(), TimerPhase::Paused) {
            return None;
        }
        Some(Self {
            service_id: self.service_id,
            is_running: true,
            current_item_id: self.current_item_id,
            elapsed_secs: self.elapsed_secs,
            last_changed_at: now_ms,
            version: self.version + 1,
        })
    }

    /// Back to idle. Valid from any phase.
    #[must_use]
    pub const fn reset(&self, now_ms: u64) -> Self {
        Self {
            service_id: self.service_id,
            is_running: false,
            current_item_id: None,
            elapsed_secs: 0,
            last_changed_at: now_ms,
            version: self.version + 1,
        }
    }
}
