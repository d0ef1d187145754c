//! Actor framework for the operator.
//!
//! ## Design Principles
//!
//! - **One actor per BMC**: each actor owns the passes for a single BMC
//!   record, so passes for one BMC are serialized
//! - **Crash isolation**: a failing pass is reported to the caller and does
//!   not affect sibling actors
//! - **Self-retiring**: an actor stops once its record is gone

mod bmc;
mod framework;
mod supervisor;

pub use bmc::{BmcActor, BmcMessage};
pub use framework::{Actor, ActorContext, ActorError, ActorHandle, Flow, Message, Supervisor};
pub use supervisor::{Fleet, FleetError};
