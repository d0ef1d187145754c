//! Resource store: typed CRUD over JSON documents with finalizer semantics.
//!
//! `ResourceStore` is the object-safe document interface; `ResourceStoreExt`
//! layers typed access for every [`Record`] on top of it. `SqliteStore`
//! persists documents locally so records survive operator restarts.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use super::records::{Record, RecordKind};

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{kind} '{name}' not found")]
    NotFound { kind: RecordKind, name: String },

    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: RecordKind, name: String },
}

/// Filter for list operations; all given conditions must match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    pub name: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl ListFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_name(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    pub fn by_label(key: &str, value: &str) -> Self {
        Self::default().label(key, value)
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn matches(&self, name: &str, labels: &BTreeMap<String, String>) -> bool {
        if self.name.as_deref().is_some_and(|n| n != name) {
            return false;
        }
        self.labels
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
    }
}

/// Result of a delete request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The record was removed.
    Removed,
    /// The record has finalizers; only its deletion marker was set.
    Marked,
    /// No such record.
    Absent,
}

/// Document-level store interface.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get_document(&self, kind: RecordKind, name: &str) -> Result<Option<Value>, StoreError>;

    async fn list_documents(
        &self,
        kind: RecordKind,
        filter: &ListFilter,
    ) -> Result<Vec<Value>, StoreError>;

    async fn create_document(
        &self,
        kind: RecordKind,
        name: &str,
        labels: &BTreeMap<String, String>,
        body: &Value,
    ) -> Result<(), StoreError>;

    async fn update_document(
        &self,
        kind: RecordKind,
        name: &str,
        labels: &BTreeMap<String, String>,
        body: &Value,
    ) -> Result<(), StoreError>;

    /// Remove a document. Removing an absent document is not an error.
    async fn delete_document(&self, kind: RecordKind, name: &str) -> Result<(), StoreError>;
}

/// Typed record access with finalizer semantics.
#[async_trait]
pub trait ResourceStoreExt: ResourceStore {
    async fn get<R: Record>(&self, name: &str) -> Result<Option<R>, StoreError> {
        match self.get_document(R::KIND, name).await? {
            Some(doc) => Ok(Some(serde_json::from_value(doc)?)),
            None => Ok(None),
        }
    }

    async fn list<R: Record>(&self, filter: &ListFilter) -> Result<Vec<R>, StoreError> {
        self.list_documents(R::KIND, filter)
            .await?
            .into_iter()
            .map(|doc| serde_json::from_value(doc).map_err(StoreError::from))
            .collect()
    }

    async fn create<R: Record>(&self, record: &R) -> Result<(), StoreError> {
        let mut record = record.clone();
        record.meta_mut().created_at.get_or_insert_with(Utc::now);
        let body = serde_json::to_value(&record)?;
        let meta = record.meta();
        self.create_document(R::KIND, &meta.name, &meta.labels, &body)
            .await
    }

    /// Replace a record. A deletion-marked record whose last finalizer is
    /// gone is removed instead.
    async fn update<R: Record>(&self, record: &R) -> Result<(), StoreError> {
        let meta = record.meta();
        if meta.is_deleting() && meta.finalizers.is_empty() {
            debug!(kind = %R::KIND, name = %meta.name, "Last finalizer released, removing record");
            return self.delete_document(R::KIND, &meta.name).await;
        }
        let body = serde_json::to_value(record)?;
        self.update_document(R::KIND, &meta.name, &meta.labels, &body)
            .await
    }

    /// Replace only the status of the stored record.
    async fn update_status<R: Record>(&self, record: &R) -> Result<(), StoreError> {
        let mut stored: R = self
            .get(record.name())
            .await?
            .ok_or_else(|| StoreError::NotFound {
                kind: R::KIND,
                name: record.name().to_string(),
            })?;
        stored.take_status_from(record);
        let body = serde_json::to_value(&stored)?;
        let meta = stored.meta();
        self.update_document(R::KIND, &meta.name, &meta.labels, &body)
            .await
    }

    async fn delete<R: Record>(&self, name: &str) -> Result<DeleteOutcome, StoreError> {
        let Some(mut record) = self.get::<R>(name).await? else {
            return Ok(DeleteOutcome::Absent);
        };
        if record.meta().finalizers.is_empty() {
            self.delete_document(R::KIND, name).await?;
            return Ok(DeleteOutcome::Removed);
        }
        if !record.meta().is_deleting() {
            record.meta_mut().deletion_requested_at = Some(Utc::now());
            self.update(&record).await?;
        }
        Ok(DeleteOutcome::Marked)
    }

    /// Add a finalizer; returns false when it was already present.
    async fn add_finalizer<R: Record>(&self, name: &str, finalizer: &str) -> Result<bool, StoreError> {
        let mut record: R = self.get(name).await?.ok_or_else(|| StoreError::NotFound {
            kind: R::KIND,
            name: name.to_string(),
        })?;
        if record.meta().has_finalizer(finalizer) {
            return Ok(false);
        }
        record.meta_mut().finalizers.push(finalizer.to_string());
        self.update(&record).await?;
        Ok(true)
    }

    /// Remove a finalizer; returns true when the record was removed as a
    /// consequence.
    async fn remove_finalizer<R: Record>(&self, name: &str, finalizer: &str) -> Result<bool, StoreError> {
        let Some(mut record) = self.get::<R>(name).await? else {
            return Ok(false);
        };
        if !record.meta().has_finalizer(finalizer) {
            return Ok(false);
        }
        record.meta_mut().finalizers.retain(|f| f != finalizer);
        let removed = record.meta().is_deleting() && record.meta().finalizers.is_empty();
        self.update(&record).await?;
        Ok(removed)
    }

    /// Remove a finalizer, then delete the record.
    async fn release_and_delete<R: Record>(&self, name: &str, finalizer: &str) -> Result<(), StoreError> {
        if !self.remove_finalizer::<R>(name, finalizer).await? {
            self.delete::<R>(name).await?;
        }
        Ok(())
    }
}

impl<S: ResourceStore + ?Sized> ResourceStoreExt for S {}

// =============================================================================
// SQLite
// =============================================================================

/// SQLite-backed resource store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    mutations: AtomicU64,
}

impl SqliteStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        Self::with_connection(conn)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                kind TEXT NOT NULL,
                name TEXT NOT NULL,
                labels TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (kind, name)
            );

            CREATE INDEX IF NOT EXISTS idx_records_kind ON records(kind);
            "#,
        )?;

        debug!("Record store schema initialized");
        Ok(Self {
            conn: Mutex::new(conn),
            mutations: AtomicU64::new(0),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of successful create/update/delete calls since open.
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
    }

    fn get_sync(&self, kind: RecordKind, name: &str) -> Result<Option<Value>, StoreError> {
        let conn = self.conn();
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM records WHERE kind = ?1 AND name = ?2",
                params![kind.as_str(), name],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|b| serde_json::from_str(&b).map_err(StoreError::from))
            .transpose()
    }

    fn list_sync(&self, kind: RecordKind, filter: &ListFilter) -> Result<Vec<Value>, StoreError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT name, labels, body FROM records WHERE kind = ?1 ORDER BY name")?;
        let rows = stmt
            .query_map(params![kind.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut out = Vec::new();
        for (name, labels, body) in rows {
            let labels: BTreeMap<String, String> = serde_json::from_str(&labels)?;
            if filter.matches(&name, &labels) {
                out.push(serde_json::from_str(&body)?);
            }
        }
        Ok(out)
    }

    fn create_sync(
        &self,
        kind: RecordKind,
        name: &str,
        labels: &BTreeMap<String, String>,
        body: &Value,
    ) -> Result<(), StoreError> {
        let now = Utc::now().timestamp();
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO records (kind, name, labels, body, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![
                kind.as_str(),
                name,
                serde_json::to_string(labels)?,
                serde_json::to_string(body)?,
                now
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::AlreadyExists {
                kind,
                name: name.to_string(),
            });
        }
        self.bump();
        Ok(())
    }

    fn update_sync(
        &self,
        kind: RecordKind,
        name: &str,
        labels: &BTreeMap<String, String>,
        body: &Value,
    ) -> Result<(), StoreError> {
        let updated = self.conn().execute(
            "UPDATE records SET labels = ?1, body = ?2, updated_at = ?3 WHERE kind = ?4 AND name = ?5",
            params![
                serde_json::to_string(labels)?,
                serde_json::to_string(body)?,
                Utc::now().timestamp(),
                kind.as_str(),
                name
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                kind,
                name: name.to_string(),
            });
        }
        self.bump();
        Ok(())
    }

    fn delete_sync(&self, kind: RecordKind, name: &str) -> Result<(), StoreError> {
        let deleted = self.conn().execute(
            "DELETE FROM records WHERE kind = ?1 AND name = ?2",
            params![kind.as_str(), name],
        )?;
        if deleted > 0 {
            self.bump();
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceStore for SqliteStore {
    async fn get_document(&self, kind: RecordKind, name: &str) -> Result<Option<Value>, StoreError> {
        self.get_sync(kind, name)
    }

    async fn list_documents(
        &self,
        kind: RecordKind,
        filter: &ListFilter,
    ) -> Result<Vec<Value>, StoreError> {
        self.list_sync(kind, filter)
    }

    async fn create_document(
        &self,
        kind: RecordKind,
        name: &str,
        labels: &BTreeMap<String, String>,
        body: &Value,
    ) -> Result<(), StoreError> {
        self.create_sync(kind, name, labels, body)
    }

    async fn update_document(
        &self,
        kind: RecordKind,
        name: &str,
        labels: &BTreeMap<String, String>,
        body: &Value,
    ) -> Result<(), StoreError> {
        self.update_sync(kind, name, labels, body)
    }

    async fn delete_document(&self, kind: RecordKind, name: &str) -> Result<(), StoreError> {
        self.delete_sync(kind, name)
    }
}
