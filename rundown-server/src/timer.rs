//! Authoritative timer state store.
//!
//! [`TimerStore`] owns the single [`TimerState`] row of every service. Each
//! command runs under the service lock:
//!
//! 1. load the service and the current snapshot
//! 2. check authorization, the optional expected version and item existence
//! 3. compute the next snapshot with the pure transitions from
//!    [`rundown_proto::timer`]
//! 4. write it to the store, then update the cache and publish it
//!
//! A failed write leaves both the store row and the cached copy at the
//! previous snapshot, and nothing is published.

use std::collections::HashMap;
use std::sync::Arc;

use rundown_proto::agenda::{ItemId, ServiceId};
use rundown_proto::auth::{UserIdentity, can_control_timer};
use rundown_proto::timer::{Clock, TimerCommand, TimerState};

use crate::feed::{ChangeFeed, FeedEvent};
use crate::locks::{ServiceGuard, ServiceLocks};
use crate::store::{RelationalStore, StoreError};

/// Errors returned by timer operations.
#[derive(Debug, thiserror::Error)]
pub enum TimerError {
    /// The service does not exist.
    #[error("service not found")]
    ServiceNotFound,
    /// The target item is not part of the service.
    #[error("item not found: {0}")]
    ItemNotFound(ItemId),
    /// The caller may not control this service's timer.
    #[error("not allowed to control this timer")]
    Permission,
    /// Strict write rejected: the timer moved on since the caller looked.
    #[error("timer changed (expected version {expected}, current {actual})")]
    Conflict {
        /// Version the caller based its command on.
        expected: u64,
        /// Current version.
        actual: u64,
    },
    /// The store could not be read or written.
    #[error(transparent)]
    Persistence(#[from] StoreError),
}

/// A reset already written to the store but not yet visible to readers.
#[derive(Debug)]
pub struct StagedReset {
    previous: TimerState,
    next: TimerState,
}

impl StagedReset {
    /// The reset snapshot.
    #[must_use]
    pub const fn state(&self) -> &TimerState {
        &self.next
    }
}

/// Per-service timer state with persistence and fan-out.
pub struct TimerStore<S> {
    store: Arc<S>,
    feed: Arc<ChangeFeed>,
    locks: Arc<ServiceLocks>,
    clock: Arc<dyn Clock>,
    cache: parking_lot::RwLock<HashMap<ServiceId, TimerState>>,
}

impl<S: RelationalStore> TimerStore<S> {
    /// Creates a timer store over shared infrastructure.
    pub fn new(
        store: Arc<S>,
        feed: Arc<ChangeFeed>,
        locks: Arc<ServiceLocks>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            feed,
            locks,
            clock,
            cache: parking_lot::RwLock::new(HashMap::new()),
        }
    }

    /// Current time according to the store's clock.
    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Returns the current snapshot, creating the idle row if absent.
    ///
    /// # Errors
    ///
    /// [`TimerError::ServiceNotFound`] for an unknown service, or
    /// [`TimerError::Persistence`].
    pub async fn observe(&self, service_id: ServiceId) -> Result<TimerState, TimerError> {
        let cached = self.cache.read().get(&service_id).cloned();
        if let Some(state) = cached {
            return Ok(state);
        }
        let guard = self.locks.acquire(service_id).await;
        self.observe_locked(&guard).await
    }

    /// [`Self::observe`] for a caller that already holds the service lock.
    ///
    /// # Errors
    ///
    /// Same as [`Self::observe`].
    pub async fn observe_locked(&self, guard: &ServiceGuard) -> Result<TimerState, TimerError> {
        let service_id = guard.service_id();
        let cached = self.cache.read().get(&service_id).cloned();
        if let Some(state) = cached {
            return Ok(state);
        }

        if let Some(state) = self.store.load_timer(service_id).await? {
            self.cache.write().insert(service_id, state.clone());
            return Ok(state);
        }

        if self.store.load_service(service_id).await?.is_none() {
            return Err(TimerError::ServiceNotFound);
        }
        let idle = TimerState::idle(service_id, self.clock.now_ms());
        self.store.save_timer(&idle).await?;
        tracing::debug!(service_id = %service_id, "created idle timer row");
        self.cache.write().insert(service_id, idle.clone());
        Ok(idle)
    }

    /// Applies a control command on behalf of `user`.
    ///
    /// When `expected_version` is set the command is rejected with
    /// [`TimerError::Conflict`] unless it equals the current version.
    /// Otherwise the last writer wins. A command that does not change the
    /// state (pause while paused, resume while running) returns the current
    /// snapshot without a version bump or broadcast.
    ///
    /// # Errors
    ///
    /// See [`TimerError`].
    pub async fn control(
        &self,
        user: &UserIdentity,
        service_id: ServiceId,
        command: TimerCommand,
        expected_version: Option<u64>,
    ) -> Result<TimerState, TimerError> {
        let guard = self.locks.acquire(service_id).await;

        let service = self
            .store
            .load_service(service_id)
            .await?
            .ok_or(TimerError::ServiceNotFound)?;
        if !can_control_timer(user, &service) {
            tracing::info!(
                service_id = %service_id,
                user_id = %user.id,
                "timer control refused"
            );
            return Err(TimerError::Permission);
        }

        let current = self.observe_locked(&guard).await?;
        if let Some(expected) = expected_version
            && expected != current.version
        {
            return Err(TimerError::Conflict {
                expected,
                actual: current.version,
            });
        }
        if let Some(item_id) = command.target_item()
            && !service.contains_item(&item_id)
        {
            return Err(TimerError::ItemNotFound(item_id));
        }

        let Some(next) = current.apply(command, self.clock.now_ms()) else {
            tracing::debug!(service_id = %service_id, ?command, "timer command was a no-op");
            return Ok(current);
        };
        self.commit_locked(&guard, next).await
    }

    /// Starts `item_id` from zero.
    ///
    /// # Errors
    ///
    /// See [`Self::control`].
    pub async fn start(
        &self,
        user: &UserIdentity,
        service_id: ServiceId,
        item_id: ItemId,
    ) -> Result<TimerState, TimerError> {
        self.control(user, service_id, TimerCommand::Start { item_id }, None)
            .await
    }

    /// Freezes the running item. No-op unless running.
    ///
    /// # Errors
    ///
    /// See [`Self::control`].
    pub async fn pause(
        &self,
        user: &UserIdentity,
        service_id: ServiceId,
    ) -> Result<TimerState, TimerError> {
        self.control(user, service_id, TimerCommand::Pause, None).await
    }

    /// Continues a paused item. No-op unless paused.
    ///
    /// # Errors
    ///
    /// See [`Self::control`].
    pub async fn resume(
        &self,
        user: &UserIdentity,
        service_id: ServiceId,
    ) -> Result<TimerState, TimerError> {
        self.control(user, service_id, TimerCommand::Resume, None).await
    }

    /// Returns to idle.
    ///
    /// # Errors
    ///
    /// See [`Self::control`].
    pub async fn reset(
        &self,
        user: &UserIdentity,
        service_id: ServiceId,
    ) -> Result<TimerState, TimerError> {
        self.control(user, service_id, TimerCommand::Reset, None).await
    }

    /// Jumps to `item_id`, restarting from zero.
    ///
    /// # Errors
    ///
    /// See [`Self::control`].
    pub async fn skip_to_item(
        &self,
        user: &UserIdentity,
        service_id: ServiceId,
        item_id: ItemId,
    ) -> Result<TimerState, TimerError> {
        self.control(user, service_id, TimerCommand::SkipToItem { item_id }, None)
            .await
    }

    /// Writes a reset row if `item_id` is the current item, without caching
    /// or publishing it. The caller finishes with [`Self::publish_staged`]
    /// or undoes the row with [`Self::rollback_staged`].
    ///
    /// # Errors
    ///
    /// [`TimerError::Persistence`] if the reset could not be written.
    pub async fn stage_reset_if_current_locked(
        &self,
        guard: &ServiceGuard,
        item_id: ItemId,
    ) -> Result<Option<StagedReset>, TimerError> {
        let current = self.observe_locked(guard).await?;
        if current.current_item_id != Some(item_id) {
            return Ok(None);
        }
        let next = current.reset(self.clock.now_ms());
        self.save_locked(guard, &next).await?;
        Ok(Some(StagedReset {
            previous: current,
            next,
        }))
    }

    /// Caches and publishes a staged reset.
    pub fn publish_staged(&self, guard: &ServiceGuard, staged: StagedReset) -> TimerState {
        self.publish_locked(guard, staged.next)
    }

    /// Restores the row a staged reset replaced. Cache and feed never saw
    /// the reset.
    pub async fn rollback_staged(&self, guard: &ServiceGuard, staged: StagedReset) {
        if let Err(e) = self.store.save_timer(&staged.previous).await {
            tracing::error!(
                service_id = %guard.service_id(),
                version = staged.previous.version,
                error = %e,
                "failed to restore timer row after aborted reset"
            );
        }
    }

    /// Drops the cached snapshot of a deleted service.
    pub fn forget(&self, service_id: ServiceId) {
        self.cache.write().remove(&service_id);
    }

    async fn commit_locked(
        &self,
        guard: &ServiceGuard,
        next: TimerState,
    ) -> Result<TimerState, TimerError> {
        self.save_locked(guard, &next).await?;
        Ok(self.publish_locked(guard, next))
    }

    async fn save_locked(&self, guard: &ServiceGuard, next: &TimerState) -> Result<(), TimerError> {
        if let Err(e) = self.store.save_timer(next).await {
            tracing::error!(
                service_id = %guard.service_id(),
                version = next.version,
                error = %e,
                "failed to persist timer state"
            );
            return Err(e.into());
        }
        Ok(())
    }

    fn publish_locked(&self, guard: &ServiceGuard, next: TimerState) -> TimerState {
        let service_id = guard.service_id();
        self.cache.write().insert(service_id, next.clone());
        let receivers = self.feed.publish(service_id, FeedEvent::Timer(next.clone()));
        tracing::info!(
            service_id = %service_id,
            version = next.version,
            phase = %next.phase(),
            receivers,
            "timer state committed"
        );
        next
    }
}
