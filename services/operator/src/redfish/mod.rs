//! Redfish aggregation service access.
//!
//! - `client`: the `RedfishApi` capability and its reqwest implementation
//! - `types`: typed response and request documents, decoded once at the boundary
//! - `mock`: in-memory aggregation service for tests and dry runs

pub mod client;
pub mod mock;
pub mod types;

pub use client::{
    ApiResponse, AuthMode, BmcConnector, ClientSettings, HttpConnector, HttpRedfishClient,
    Method, RedfishApi, RedfishApiExt, RedfishError,
};
pub use mock::{MockConnector, MockRedfish, MockReply, RecordedCall};
