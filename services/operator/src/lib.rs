//! BMC fleet operator library.
//!
//! The operator keeps a local store of BMC records and a Redfish
//! aggregation service in sync. Drift between the two is resolved by one
//! of two policies: accommodate (remote wins) or revert (local wins).
//!
//! ## Architecture
//!
//! ```text
//! PollScheduler ──tick──┐
//!                       ├──> Fleet ──> BmcActor(name) ──> engine::reconcile_bmc
//! EventDispatcher ──────┘
//! ```
//!
//! ## Modules
//!
//! - `redfish`: aggregation service client, typed documents and an in-memory mock
//! - `state`: persisted records and process-local tracking
//! - `task_monitor`: drives asynchronous remote operations to a terminal outcome
//! - `reset`: vendor reset allow-lists and power transitions
//! - `crypto`: RSA envelope for stored BMC passwords
//! - `registry`: Redfish registry lookups
//! - `engine`: the per-BMC pass and the accommodate/revert engines
//! - `actors`: one actor per BMC record

pub mod actors;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod events;
pub mod reconciler;
pub mod redfish;
pub mod registry;
pub mod reset;
pub mod state;
pub mod task_monitor;

pub use actors::Fleet;
pub use engine::{Policy, ReconcileContext, Trigger};
pub use reconciler::PollScheduler;
