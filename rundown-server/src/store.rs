//! Relational store for services, agenda items, editor grants and timer rows.
//!
//! The [`RelationalStore`] trait is the durable boundary of the server. Rows
//! are kept in four tables (`services`, `service_items` with an explicit
//! `position`, `service_editors`, `timer_state`); a [`Service`] is assembled
//! from them on read and written back as a whole.
//!
//! Implementations:
//! - [`InMemoryStore`]: volatile tables with failure injection for tests
//! - [`JsonFileStore`]: tables persisted to a JSON file on every write

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::NaiveDate;
use rundown_proto::agenda::{AgendaItem, Service, ServiceId, UserId};
use rundown_proto::timer::TimerState;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The underlying storage is unavailable.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A write operation failed.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// A read operation failed.
    #[error("read failed: {0}")]
    ReadFailed(String),
}

/// Durable CRUD for services and their timer rows.
pub trait RelationalStore: Send + Sync {
    /// Loads a service with its items (ordered by position) and editors.
    fn load_service(
        &self,
        id: ServiceId,
    ) -> impl std::future::Future<Output = Result<Option<Service>, StoreError>> + Send;

    /// Lists every service, ordered by date then title.
    fn list_services(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<Service>, StoreError>> + Send;

    /// Inserts or replaces a service together with its items and grants.
    ///
    /// Item positions are rewritten densely from the order of `items`.
    fn save_service(
        &self,
        service: &Service,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Deletes a service and every row that belongs to it, including its
    /// timer row. Returns whether the service existed.
    fn delete_service(
        &self,
        id: ServiceId,
    ) -> impl std::future::Future<Output = Result<bool, StoreError>> + Send;

    /// Loads the timer row for a service.
    fn load_timer(
        &self,
        service_id: ServiceId,
    ) -> impl std::future::Future<Output = Result<Option<TimerState>, StoreError>> + Send;

    /// Inserts or replaces the timer row for `state.service_id`.
    fn save_timer(
        &self,
        state: &TimerState,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;
}

// ---------------------------------------------------------------------------
// Rows and tables
// ---------------------------------------------------------------------------

/// `services` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ServiceRow {
    id: ServiceId,
    title: String,
    date: NaiveDate,
    created_by: UserId,
}

/// `service_items` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ItemRow {
    service_id: ServiceId,
    position: u32,
    item: AgendaItem,
}

/// `service_editors` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct EditorRow {
    service_id: ServiceId,
    user_id: UserId,
}

/// All tables of the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct Tables {
    services: Vec<ServiceRow>,
    service_items: Vec<ItemRow>,
    service_editors: Vec<EditorRow>,
    timer_state: Vec<TimerState>,
}

impl Tables {
    fn assemble(&self, id: ServiceId) -> Option<Service> {
        let row = self.services.iter().find(|s| s.id == id)?;

        let mut items: Vec<&ItemRow> = self
            .service_items
            .iter()
            .filter(|r| r.service_id == id)
            .collect();
        items.sort_by_key(|r| r.position);

        Some(Service {
            id: row.id,
            title: row.title.clone(),
            date: row.date,
            items: items.into_iter().map(|r| r.item.clone()).collect(),
            editable_by: self
                .service_editors
                .iter()
                .filter(|e| e.service_id == id)
                .map(|e| e.user_id.clone())
                .collect(),
            created_by: row.created_by.clone(),
        })
    }

    fn list(&self) -> Vec<Service> {
        let mut rows: Vec<&ServiceRow> = self.services.iter().collect();
        rows.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.title.cmp(&b.title)));
        rows.into_iter().filter_map(|r| self.assemble(r.id)).collect()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn upsert_service(&mut self, service: &Service) {
        let row = ServiceRow {
            id: service.id,
            title: service.title.clone(),
            date: service.date,
            created_by: service.created_by.clone(),
        };
        match self.services.iter_mut().find(|s| s.id == service.id) {
            Some(existing) => *existing = row,
            None => self.services.push(row),
        }

        self.service_items.retain(|r| r.service_id != service.id);
        self.service_items
            .extend(service.items.iter().enumerate().map(|(i, item)| ItemRow {
                service_id: service.id,
                // Item counts are far below u32::MAX.
                position: i as u32,
                item: item.clone(),
            }));

        self.service_editors.retain(|e| e.service_id != service.id);
        self.service_editors
            .extend(service.editable_by.iter().map(|user_id| EditorRow {
                service_id: service.id,
                user_id: user_id.clone(),
            }));
    }

    fn delete_service(&mut self, id: ServiceId) -> bool {
        let before = self.services.len();
        self.services.retain(|s| s.id != id);
        self.service_items.retain(|r| r.service_id != id);
        self.service_editors.retain(|e| e.service_id != id);
        self.timer_state.retain(|t| t.service_id != id);
        self.services.len() != before
    }

    fn timer(&self, service_id: ServiceId) -> Option<TimerState> {
        self.timer_state
            .iter()
            .find(|t| t.service_id == service_id)
            .cloned()
    }

    fn upsert_timer(&mut self, state: &TimerState) {
        match self
            .timer_state
            .iter_mut()
            .find(|t| t.service_id == state.service_id)
        {
            Some(existing) => *existing = state.clone(),
            None => self.timer_state.push(state.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Volatile store backed by in-process tables.
///
/// Reads and writes can be made to fail on demand, which lets tests exercise
/// the persistence-failure paths of the timer and agenda services.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    fail_writes: AtomicBool,
    fail_service_writes: AtomicBool,
    fail_reads: AtomicBool,
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes writes to service rows fail while timer rows still save.
    pub fn set_fail_service_writes(&self, fail: bool) {
        self.fail_service_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes every subsequent read fail (or succeed again).
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    fn check_read(&self) -> Result<(), StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::ReadFailed("injected read failure".into()));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::WriteFailed("injected write failure".into()));
        }
        Ok(())
    }

    fn check_service_write(&self) -> Result<(), StoreError> {
        self.check_write()?;
        if self.fail_service_writes.load(Ordering::SeqCst) {
            return Err(StoreError::WriteFailed("injected service write failure".into()));
        }
        Ok(())
    }
}

impl RelationalStore for InMemoryStore {
    async fn load_service(&self, id: ServiceId) -> Result<Option<Service>, StoreError> {
        self.check_read()?;
        Ok(self.tables.read().await.assemble(id))
    }

    async fn list_services(&self) -> Result<Vec<Service>, StoreError> {
        self.check_read()?;
        Ok(self.tables.read().await.list())
    }

    async fn save_service(&self, service: &Service) -> Result<(), StoreError> {
        self.check_service_write()?;
        self.tables.write().await.upsert_service(service);
        Ok(())
    }

    async fn delete_service(&self, id: ServiceId) -> Result<bool, StoreError> {
        self.check_service_write()?;
        Ok(self.tables.write().await.delete_service(id))
    }

    async fn load_timer(&self, service_id: ServiceId) -> Result<Option<TimerState>, StoreError> {
        self.check_read()?;
        Ok(self.tables.read().await.timer(service_id))
    }

    async fn save_timer(&self, state: &TimerState) -> Result<(), StoreError> {
        self.check_write()?;
        self.tables.write().await.upsert_timer(state);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JSON file store
// ---------------------------------------------------------------------------

/// Store whose tables live in a single JSON file.
///
/// Every write serializes the full table set to a sibling temporary file and
/// renames it over the original, so a failed write leaves both the file and
/// the in-memory tables at their previous contents.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    tables: Mutex<Tables>,
}

impl JsonFileStore {
    /// Opens the store at `path`, starting empty if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ReadFailed`] if the file exists but cannot be
    /// read or parsed.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let tables = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                StoreError::ReadFailed(format!("{}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Tables::default(),
            Err(e) => {
                return Err(StoreError::ReadFailed(format!("{}: {e}", path.display())));
            }
        };
        tracing::info!(path = %path.display(), "opened data file");
        Ok(Self {
            path,
            tables: Mutex::new(tables),
        })
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Applies `change` to a copy of the tables, persists it, then commits.
    async fn write_with<R>(&self, change: impl FnOnce(&mut Tables) -> R) -> Result<R, StoreError> {
        let mut tables = self.tables.lock().await;
        let mut next = tables.clone();
        let result = change(&mut next);

        let bytes = serde_json::to_vec_pretty(&next)
            .map_err(|e| StoreError::WriteFailed(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| StoreError::WriteFailed(format!("{}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StoreError::WriteFailed(format!("{}: {e}", self.path.display())))?;

        *tables = next;
        drop(tables);
        Ok(result)
    }
}

impl RelationalStore for JsonFileStore {
    async fn load_service(&self, id: ServiceId) -> Result<Option<Service>, StoreError> {
        Ok(self.tables.lock().await.assemble(id))
    }

    async fn list_services(&self) -> Result<Vec<Service>, StoreError> {
        Ok(self.tables.lock().await.list())
    }

    async fn save_service(&self, service: &Service) -> Result<(), StoreError> {
        self.write_with(|t| t.upsert_service(service)).await
    }

    async fn delete_service(&self, id: ServiceId) -> Result<bool, StoreError> {
        self.write_with(|t| t.delete_service(id)).await
    }

    async fn load_timer(&self, service_id: ServiceId) -> Result<Option<TimerState>, StoreError> {
        Ok(self.tables.lock().await.timer(service_id))
    }

    async fn save_timer(&self, state: &TimerState) -> Result<(), StoreError> {
        self.write_with(|t| t.upsert_timer(state)).await
    }
}
