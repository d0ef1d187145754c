//! Inbound event webhook.
//!
//! The aggregation service posts Redfish events here. Resource added,
//! resource removed and discovery complete events on systems run the pass
//! for that one BMC right away instead of waiting for the next tick.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::actors::Fleet;
use crate::engine::{fleet, Trigger};
use crate::redfish::types::{last_segment, system_path, ODataRef, SYSTEMS};
use crate::registry::MessageId;

const RESOURCE_ADDED: &str = "ResourceAdded";
const RESOURCE_REMOVED: &str = "ResourceRemoved";
const DISCOVERY_COMPLETE: &str = "DiscoveryComplete";

/// A Redfish event notification.
#[derive(Debug, Deserialize)]
pub struct EventPayload {
    #[serde(rename = "Events", default)]
    pub events: Vec<EventRecord>,
}

#[derive(Debug, Deserialize)]
pub struct EventRecord {
    #[serde(rename = "MessageId")]
    pub message_id: String,
    #[serde(rename = "OriginOfCondition", default)]
    pub origin: Option<ODataRef>,
}

/// Counts of how the events of one notification were handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventOutcome {
    pub dispatched: usize,
    pub ignored: usize,
    pub rejected: usize,
}

pub struct EventDispatcher {
    fleet: Arc<Fleet>,
}

impl EventDispatcher {
    pub fn new(fleet: Arc<Fleet>) -> Self {
        Self { fleet }
    }

    pub async fn handle(&self, payload: EventPayload) -> EventOutcome {
        let mut outcome = EventOutcome::default();

        for event in payload.events {
            let message_id: MessageId = match event.message_id.parse() {
                Ok(id) => id,
                Err(e) => {
                    warn!(message_id = %event.message_id, error = %e, "Malformed event message id rejected");
                    outcome.rejected += 1;
                    continue;
                }
            };

            let Some(system_id) = event.origin.as_ref().and_then(|o| origin_system(&o.odata_id))
            else {
                debug!(message_id = %message_id, "Event origin is not a system, ignored");
                outcome.ignored += 1;
                continue;
            };

            let dispatched = match message_id.key.as_str() {
                RESOURCE_ADDED => self.system_added(system_id).await,
                RESOURCE_REMOVED => self.system_removed(system_id).await,
                DISCOVERY_COMPLETE => self.discovery_complete(system_id).await,
                other => {
                    debug!(message_key = %other, "Event not handled");
                    false
                }
            };
            if dispatched {
                outcome.dispatched += 1;
            } else {
                outcome.ignored += 1;
            }
        }

        outcome
    }

    async fn system_added(&self, system_id: &str) -> bool {
        let ctx = self.fleet.context();
        ctx.tracking.observe_present(&system_path(system_id));

        let name = {
            let _guard = self.fleet.lock().await;
            match fleet::discover(ctx, system_id).await {
                Ok(Some(name)) => name,
                Ok(None) => return false,
                Err(e) => {
                    warn!(system_id = %system_id, error = %e, "Discovery for added system failed");
                    return false;
                }
            }
        };
        self.dispatch(&name, Trigger::RemoteAdded).await
    }

    async fn system_removed(&self, system_id: &str) -> bool {
        let ctx = self.fleet.context();
        ctx.tracking.observe_absent(&system_path(system_id));

        match fleet::find_by_system(ctx, system_id).await {
            Ok(Some(record)) => self.dispatch(&record.meta.name, Trigger::RemoteRemoved).await,
            Ok(None) => {
                ctx.tracking.confirm_deleted(&system_path(system_id));
                false
            }
            Err(e) => {
                warn!(system_id = %system_id, error = %e, "Lookup for removed system failed");
                false
            }
        }
    }

    async fn discovery_complete(&self, system_id: &str) -> bool {
        let ctx = self.fleet.context();
        match fleet::find_by_system(ctx, system_id).await {
            Ok(Some(record)) => {
                self.dispatch(&record.meta.name, Trigger::DiscoveryComplete)
                    .await
            }
            Ok(None) => self.system_added(system_id).await,
            Err(e) => {
                warn!(system_id = %system_id, error = %e, "Lookup after discovery failed");
                false
            }
        }
    }

    async fn dispatch(&self, bmc: &str, trigger: Trigger) -> bool {
        match self.fleet.dispatch(bmc, trigger).await {
            Ok(report) => {
                info!(bmc = %bmc, ?trigger, clean = report.is_clean(), removed = report.removed, "Event pass finished");
                true
            }
            Err(e) => {
                warn!(bmc = %bmc, ?trigger, error = %e, "Event pass failed");
                false
            }
        }
    }
}

/// The system id of a `Systems/{id}` origin.
fn origin_system(origin: &str) -> Option<&str> {
    let rest = origin.strip_prefix(SYSTEMS)?.strip_prefix('/')?;
    let id = last_segment(rest);
    (!id.is_empty() && !rest.contains('/')).then_some(id)
}

/// Create the webhook routes.
pub fn router(dispatcher: Arc<EventDispatcher>) -> Router {
    Router::new()
        .route("/events", post(receive_events))
        .with_state(dispatcher)
}

async fn receive_events(
    State(dispatcher): State<Arc<EventDispatcher>>,
    Json(payload): Json<EventPayload>,
) -> StatusCode {
    let outcome = dispatcher.handle(payload).await;
    debug!(
        dispatched = outcome.dispatched,
        ignored = outcome.ignored,
        rejected = outcome.rejected,
        "Events received"
    );
    StatusCode::NO_CONTENT
}

/// Serve the webhook until shutdown.
pub async fn serve(
    listener: tokio::net::TcpListener,
    dispatcher: Arc<EventDispatcher>,
    shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    axum::serve(listener, router(dispatcher))
        .with_graceful_shutdown(async move {
            let mut shutdown = shutdown;
            loop {
                if *shutdown.borrow() {
                    break;
                }
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            info!("Event listener shutting down");
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_system() {
        assert_eq!(origin_system("/redfish/v1/Systems/abc.1"), Some("abc.1"));
        assert_eq!(origin_system("/redfish/v1/Systems/abc.1/Bios"), None);
        assert_eq!(origin_system("/redfish/v1/Managers/bmc"), None);
        assert_eq!(origin_system("/redfish/v1/Systems/"), None);
    }

    #[test]
    fn test_payload_decodes() {
        let payload: EventPayload = serde_json::from_str(
            r#"{"Events":[{"MessageId":"ResourceEvent.1.0.ResourceAdded","OriginOfCondition":{"@odata.id":"/redfish/v1/Systems/s1"}}]}"#,
        )
        .unwrap();
        assert_eq!(payload.events.len(), 1);
        assert_eq!(payload.events[0].origin.as_ref().unwrap().id(), "s1");
    }
}
