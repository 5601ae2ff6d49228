//! Service catalogue and agenda editing.
//!
//! Every mutation runs under the service lock shared with the timer store,
//! is authorized with [`can_edit`], written whole to the store, and then
//! published on the change feed as [`FeedEvent::Service`].

use std::sync::Arc;

use chrono::NaiveDate;
use rundown_proto::agenda::{
    Direction, ItemId, ItemPatch, NewItem, Service, ServiceId, UserId, ValidationError,
    validate_title,
};
use rundown_proto::auth::{UserIdentity, can_edit};
use rundown_proto::sync::AgendaCommand;

use crate::feed::{ChangeFeed, FeedEvent};
use crate::locks::{ServiceGuard, ServiceLocks};
use crate::store::{RelationalStore, StoreError};
use crate::timer::{TimerError, TimerStore};

/// Errors returned by agenda operations.
#[derive(Debug, thiserror::Error)]
pub enum AgendaError {
    /// The service does not exist.
    #[error("service not found")]
    ServiceNotFound,
    /// The item is not part of the service.
    #[error("item not found: {0}")]
    ItemNotFound(ItemId),
    /// The caller may not edit this service.
    #[error("not allowed to edit this service")]
    Permission,
    /// The input failed validation.
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    /// The service creator always keeps edit rights.
    #[error("cannot revoke the creator's edit rights")]
    CreatorGrant,
    /// The store could not be read or written.
    #[error(transparent)]
    Persistence(#[from] StoreError),
    /// Resetting the timer for a deleted item failed.
    #[error(transparent)]
    Timer(#[from] TimerError),
}

/// Agenda and service operations.
pub struct AgendaService<S> {
    store: Arc<S>,
    feed: Arc<ChangeFeed>,
    locks: Arc<ServiceLocks>,
    timers: Arc<TimerStore<S>>,
}

impl<S: RelationalStore> AgendaService<S> {
    /// Creates the service over shared infrastructure.
    pub fn new(
        store: Arc<S>,
        feed: Arc<ChangeFeed>,
        locks: Arc<ServiceLocks>,
        timers: Arc<TimerStore<S>>,
    ) -> Self {
        Self {
            store,
            feed,
            locks,
            timers,
        }
    }

    /// Lists every service.
    ///
    /// # Errors
    ///
    /// [`AgendaError::Persistence`] if the store cannot be read.
    pub async fn list_services(&self) -> Result<Vec<Service>, AgendaError> {
        Ok(self.store.list_services().await?)
    }

    /// Loads one service.
    ///
    /// # Errors
    ///
    /// [`AgendaError::ServiceNotFound`] or [`AgendaError::Persistence`].
    pub async fn get_service(&self, service_id: ServiceId) -> Result<Service, AgendaError> {
        self.store
            .load_service(service_id)
            .await?
            .ok_or(AgendaError::ServiceNotFound)
    }

    /// Creates an empty service owned by `user`.
    ///
    /// # Errors
    ///
    /// [`AgendaError::Invalid`] for a bad title, or [`AgendaError::Persistence`].
    pub async fn create_service(
        &self,
        user: &UserIdentity,
        title: &str,
        date: NaiveDate,
    ) -> Result<Service, AgendaError> {
        let service = Service::new(title.trim(), date, user.id.clone())?;
        self.store.save_service(&service).await?;
        tracing::info!(
            service_id = %service.id,
            user_id = %user.id,
            date = %service.date,
            "service created"
        );
        Ok(service)
    }

    /// Deletes a service, its items, grants and timer row.
    ///
    /// Subscribers receive [`FeedEvent::Removed`] and their feed closes.
    ///
    /// # Errors
    ///
    /// [`AgendaError::ServiceNotFound`], [`AgendaError::Permission`] or
    /// [`AgendaError::Persistence`].
    pub async fn delete_service(
        &self,
        user: &UserIdentity,
        service_id: ServiceId,
    ) -> Result<(), AgendaError> {
        let guard = self.locks.acquire(service_id).await;
        self.load_editable(&guard, user).await?;

        self.store.delete_service(service_id).await?;
        self.timers.forget(service_id);
        self.feed.publish(service_id, FeedEvent::Removed(service_id));
        self.feed.close(service_id);
        tracing::info!(service_id = %service_id, user_id = %user.id, "service deleted");

        drop(guard);
        self.locks.release(service_id);
        Ok(())
    }

    /// Changes the title and/or date of a service.
    ///
    /// # Errors
    ///
    /// See [`AgendaError`].
    pub async fn update_details(
        &self,
        user: &UserIdentity,
        service_id: ServiceId,
        title: Option<String>,
        date: Option<NaiveDate>,
    ) -> Result<Service, AgendaError> {
        if let Some(title) = &title {
            validate_title(title.trim())?;
        }
        self.edit(user, service_id, |service| {
            if let Some(title) = title {
                service.title = title.trim().to_string();
            }
            if let Some(date) = date {
                service.date = date;
            }
            Ok(true)
        })
        .await
    }

    /// Appends a new item to the agenda.
    ///
    /// # Errors
    ///
    /// See [`AgendaError`].
    pub async fn add_item(
        &self,
        user: &UserIdentity,
        service_id: ServiceId,
        item: NewItem,
    ) -> Result<Service, AgendaError> {
        let item = item.into_item()?;
        self.edit(user, service_id, |service| {
            service.push_item(item)?;
            Ok(true)
        })
        .await
    }

    /// Applies a partial update to an item.
    ///
    /// # Errors
    ///
    /// See [`AgendaError`].
    pub async fn update_item(
        &self,
        user: &UserIdentity,
        service_id: ServiceId,
        item_id: ItemId,
        patch: ItemPatch,
    ) -> Result<Service, AgendaError> {
        self.edit(user, service_id, |service| {
            let item = service
                .items
                .iter_mut()
                .find(|i| i.id == item_id)
                .ok_or(AgendaError::ItemNotFound(item_id))?;
            item.apply_patch(patch)?;
            Ok(true)
        })
        .await
    }

    /// Removes an item. If it is the timer's current item, the timer is
    /// reset as well, and the reset is published before the new agenda so no
    /// snapshot refers to a missing item. If the agenda cannot be saved, the
    /// timer row is restored and nothing is published.
    ///
    /// # Errors
    ///
    /// See [`AgendaError`].
    pub async fn delete_item(
        &self,
        user: &UserIdentity,
        service_id: ServiceId,
        item_id: ItemId,
    ) -> Result<Service, AgendaError> {
        let guard = self.locks.acquire(service_id).await;
        let mut service = self.load_editable(&guard, user).await?;
        if !service.contains_item(&item_id) {
            return Err(AgendaError::ItemNotFound(item_id));
        }

        let staged = self
            .timers
            .stage_reset_if_current_locked(&guard, item_id)
            .await?;
        service.remove_item(&item_id);
        if let Err(e) = self.save_locked(&guard, &service).await {
            if let Some(staged) = staged {
                self.timers.rollback_staged(&guard, staged).await;
            }
            return Err(e);
        }

        if let Some(staged) = staged {
            let reset = self.timers.publish_staged(&guard, staged);
            tracing::info!(
                service_id = %service_id,
                item_id = %item_id,
                version = reset.version,
                "timer reset for deleted item"
            );
        }
        Ok(self.publish_locked(&guard, service))
    }

    /// Swaps the item at `index` with its neighbour. Out-of-bounds moves
    /// return the service unchanged without writing.
    ///
    /// # Errors
    ///
    /// See [`AgendaError`].
    pub async fn move_item(
        &self,
        user: &UserIdentity,
        service_id: ServiceId,
        index: usize,
        direction: Direction,
    ) -> Result<Service, AgendaError> {
        self.edit(user, service_id, |service| {
            Ok(service.move_item(index, direction))
        })
        .await
    }

    /// Grants `user_id` edit and timer-control rights. Idempotent.
    ///
    /// # Errors
    ///
    /// See [`AgendaError`].
    pub async fn add_editor(
        &self,
        user: &UserIdentity,
        service_id: ServiceId,
        user_id: UserId,
    ) -> Result<Service, AgendaError> {
        self.edit(user, service_id, |service| {
            Ok(service.editable_by.insert(user_id))
        })
        .await
    }

    /// Revokes a grant. Idempotent, except that the creator's grant cannot be
    /// removed.
    ///
    /// # Errors
    ///
    /// [`AgendaError::CreatorGrant`] or see [`AgendaError`].
    pub async fn remove_editor(
        &self,
        user: &UserIdentity,
        service_id: ServiceId,
        user_id: UserId,
    ) -> Result<Service, AgendaError> {
        self.edit(user, service_id, |service| {
            if service.created_by == user_id {
                return Err(AgendaError::CreatorGrant);
            }
            Ok(service.editable_by.remove(&user_id))
        })
        .await
    }

    /// Dispatches a wire-level [`AgendaCommand`].
    ///
    /// # Errors
    ///
    /// See [`AgendaError`].
    pub async fn apply(
        &self,
        user: &UserIdentity,
        service_id: ServiceId,
        command: AgendaCommand,
    ) -> Result<Service, AgendaError> {
        match command {
            AgendaCommand::AddItem { item } => self.add_item(user, service_id, item).await,
            AgendaCommand::UpdateItem { item_id, patch } => {
                self.update_item(user, service_id, item_id, patch).await
            }
            AgendaCommand::DeleteItem { item_id } => {
                self.delete_item(user, service_id, item_id).await
            }
            AgendaCommand::MoveItem { index, direction } => {
                let index = usize::try_from(index).unwrap_or(usize::MAX);
                self.move_item(user, service_id, index, direction).await
            }
            AgendaCommand::UpdateDetails { title, date } => {
                self.update_details(user, service_id, title, date).await
            }
            AgendaCommand::AddEditor { user_id } => {
                self.add_editor(user, service_id, user_id).await
            }
            AgendaCommand::RemoveEditor { user_id } => {
                self.remove_editor(user, service_id, user_id).await
            }
        }
    }

    /// Runs `change` on the locked service; commits when it reports a
    /// change.
    async fn edit(
        &self,
        user: &UserIdentity,
        service_id: ServiceId,
        change: impl FnOnce(&mut Service) -> Result<bool, AgendaError> + Send,
    ) -> Result<Service, AgendaError> {
        let guard = self.locks.acquire(service_id).await;
        let mut service = self.load_editable(&guard, user).await?;
        if !change(&mut service)? {
            return Ok(service);
        }
        self.commit_locked(&guard, service).await
    }

    async fn load_editable(
        &self,
        guard: &ServiceGuard,
        user: &UserIdentity,
    ) -> Result<Service, AgendaError> {
        let service = self
            .store
            .load_service(guard.service_id())
            .await?
            .ok_or(AgendaError::ServiceNotFound)?;
        if !can_edit(user, &service) {
            tracing::info!(
                service_id = %service.id,
                user_id = %user.id,
                "agenda edit refused"
            );
            return Err(AgendaError::Permission);
        }
        Ok(service)
    }

    async fn commit_locked(
        &self,
        guard: &ServiceGuard,
        service: Service,
    ) -> Result<Service, AgendaError> {
        self.save_locked(guard, &service).await?;
        Ok(self.publish_locked(guard, service))
    }

    async fn save_locked(&self, guard: &ServiceGuard, service: &Service) -> Result<(), AgendaError> {
        if let Err(e) = self.store.save_service(service).await {
            tracing::error!(
                service_id = %guard.service_id(),
                error = %e,
                "failed to persist service"
            );
            return Err(e.into());
        }
        Ok(())
    }

    fn publish_locked(&self, guard: &ServiceGuard, service: Service) -> Service {
        self.feed
            .publish(guard.service_id(), FeedEvent::Service(service.clone()));
        tracing::debug!(
            service_id = %service.id,
            items = service.items.len(),
            "service committed"
        );
        service
    }
}
