//! Local state: persisted records and process-local tracking.
//!
//! - `records`: record types for BMCs and their dependents
//! - `store`: the resource store interface and its SQLite implementation
//! - `tracking`: in-flight work, rebuilt on restart

pub mod records;
mod store;
mod tracking;

pub use store::{DeleteOutcome, ListFilter, ResourceStore, ResourceStoreExt, SqliteStore, StoreError};
pub use tracking::{PendingVolume, ResourcePresence, Tracking, VolumeKey, VolumeOp};
