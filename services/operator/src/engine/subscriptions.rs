//! Event subscription intent and drift.
//!
//! Subscriptions are fleet-level: they are not owned by a BMC record and
//! are reconciled once per scheduler tick.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use super::{EngineError, Policy, ReconcileContext};
use crate::redfish::types::{
    last_segment, CreateSubscriptionRequest, EventDestination, ODataRef, EVENT_SUBSCRIPTIONS,
};
use crate::redfish::{Method, RedfishApiExt};
use crate::registry::{message_exists, MessageId};
use crate::state::records::{
    sanitize_name, EventSubscriptionRecord, RecordMeta, SubscriptionSpec, SubscriptionStatus,
    LABEL_SUBSCRIPTION_ID, OPERATOR_FINALIZER,
};
use crate::state::{ListFilter, ResourceStoreExt, StoreError};
use crate::task_monitor::OperationKind;

fn subscription_path(id: &str) -> String {
    format!("{EVENT_SUBSCRIPTIONS}/{id}")
}

/// Apply subscription intent, then correct drift per policy.
///
/// Failures of single subscriptions are logged; the first one is returned
/// after every subscription was visited.
pub async fn reconcile_subscriptions(ctx: &ReconcileContext) -> Result<(), EngineError> {
    let records: Vec<EventSubscriptionRecord> = ctx.store.list(&ListFilter::all()).await?;
    let mut first_error = None;

    for record in &records {
        let result = if record.meta.is_deleting() {
            delete_subscription(ctx, record).await
        } else if record.subscription_id().is_none() {
            create_subscription(ctx, record).await
        } else {
            Ok(())
        };
        if let Err(e) = result {
            warn!(subscription = %record.meta.name, error = %e, "Subscription intent failed");
            first_error.get_or_insert(e);
        }
    }

    if let Err(e) = correct_drift(ctx).await {
        first_error.get_or_insert(e);
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Reject malformed or unknown message ids before anything is sent.
async fn validate(ctx: &ReconcileContext, spec: &SubscriptionSpec) -> Result<(), EngineError> {
    for raw in &spec.message_ids {
        let id: MessageId = raw.parse().map_err(EngineError::Rejected)?;
        if !message_exists(ctx.api(), &id).await? {
            return Err(EngineError::Rejected(format!(
                "message {} not found in registry {}",
                id.key,
                id.registry_version()
            )));
        }
    }
    Ok(())
}

fn create_request(spec: &SubscriptionSpec) -> CreateSubscriptionRequest {
    CreateSubscriptionRequest {
        name: spec.name.clone(),
        destination: spec.destination.clone(),
        event_types: spec.event_types.clone(),
        message_ids: spec.message_ids.clone(),
        resource_types: spec.resource_types.clone(),
        origin_resources: spec.origin_resources.iter().map(ODataRef::new).collect(),
        context: spec.context.clone(),
        protocol: spec.protocol.clone(),
        subordinate_resources: spec.subordinate_resources,
    }
}

async fn create_subscription(
    ctx: &ReconcileContext,
    record: &EventSubscriptionRecord,
) -> Result<(), EngineError> {
    if let Err(e) = validate(ctx, &record.spec).await {
        if matches!(e, EngineError::Rejected(_)) {
            record_error(ctx, record, &e).await?;
        }
        return Err(e);
    }

    let body = serde_json::to_value(create_request(&record.spec))
        .map_err(|e| EngineError::Invalid(e.to_string()))?;
    let response = ctx
        .monitor
        .execute(
            ctx.api(),
            Method::Post,
            EVENT_SUBSCRIPTIONS,
            Some(&body),
            OperationKind::CreateEventSubscription,
        )
        .await?;

    let id = response
        .resource_path()
        .map(|path| last_segment(&path).to_string())
        .or_else(|| response.body.get("Id").and_then(|v| v.as_str()).map(str::to_string))
        .ok_or_else(|| EngineError::Invalid("subscription created without an id".to_string()))?;

    let mut created = record.clone();
    created.status = SubscriptionStatus {
        subscription_id: Some(id.clone()),
        error: None,
    };
    created
        .meta
        .labels
        .insert(LABEL_SUBSCRIPTION_ID.to_string(), id.clone());
    if !created.meta.has_finalizer(OPERATOR_FINALIZER) {
        created.meta.finalizers.push(OPERATOR_FINALIZER.to_string());
    }
    ctx.store.update(&created).await?;

    info!(subscription = %record.meta.name, subscription_id = %id, destination = %record.spec.destination, "Event subscription created");
    Ok(())
}

async fn record_error(
    ctx: &ReconcileContext,
    record: &EventSubscriptionRecord,
    error: &EngineError,
) -> Result<(), EngineError> {
    let message = error.to_string();
    if record.status.error.as_deref() == Some(message.as_str()) {
        return Ok(());
    }
    let mut failed = record.clone();
    failed.status.error = Some(message);
    ctx.store.update_status(&failed).await?;
    Ok(())
}

async fn delete_subscription(
    ctx: &ReconcileContext,
    record: &EventSubscriptionRecord,
) -> Result<(), EngineError> {
    if let Some(id) = record.subscription_id() {
        ctx.monitor
            .execute(
                ctx.api(),
                Method::Delete,
                &subscription_path(id),
                None,
                OperationKind::DeleteEventSubscription,
            )
            .await?;
        info!(subscription = %record.meta.name, subscription_id = %id, "Event subscription deleted");
    }
    ctx.store
        .release_and_delete::<EventSubscriptionRecord>(&record.meta.name, OPERATOR_FINALIZER)
        .await?;
    Ok(())
}

async fn correct_drift(ctx: &ReconcileContext) -> Result<(), EngineError> {
    let remote: BTreeSet<String> = ctx
        .api()
        .list_members(EVENT_SUBSCRIPTIONS)
        .await?
        .iter()
        .map(|m| m.id().to_string())
        .collect();

    // Re-read: intent handling above may have assigned ids.
    let records: Vec<EventSubscriptionRecord> = ctx.store.list(&ListFilter::all()).await?;
    let local: BTreeMap<String, &EventSubscriptionRecord> = records
        .iter()
        .filter_map(|r| r.subscription_id().map(|id| (id.to_string(), r)))
        .collect();

    let remote_only: Vec<&String> = remote.iter().filter(|id| !local.contains_key(*id)).collect();
    let local_only: Vec<(&String, &&EventSubscriptionRecord)> = local
        .iter()
        .filter(|(id, record)| !remote.contains(*id) && !record.meta.is_deleting())
        .collect();

    let mut first_error = None;

    match ctx.policy() {
        Policy::Accommodate => {
            for id in remote_only {
                note(&mut first_error, id, adopt_subscription(ctx, id).await);
            }
            for (id, record) in local_only {
                let result = ctx
                    .store
                    .release_and_delete::<EventSubscriptionRecord>(&record.meta.name, OPERATOR_FINALIZER)
                    .await
                    .map_err(EngineError::from);
                if result.is_ok() {
                    info!(subscription_id = %id, "Subscription gone remotely, record released");
                }
                note(&mut first_error, id, result);
            }
        }
        Policy::Revert => {
            for id in remote_only {
                let result = ctx
                    .monitor
                    .execute(
                        ctx.api(),
                        Method::Delete,
                        &subscription_path(id),
                        None,
                        OperationKind::DeleteEventSubscription,
                    )
                    .await
                    .map(|_| ())
                    .map_err(EngineError::from);
                if result.is_ok() {
                    info!(subscription_id = %id, "Unknown subscription deleted remotely");
                }
                note(&mut first_error, id, result);
            }
            for (id, record) in local_only {
                info!(subscription_id = %id, "Subscription missing remotely, recreating");
                let mut detached = (*record).clone();
                detached.status.subscription_id = None;
                detached.meta.labels.remove(LABEL_SUBSCRIPTION_ID);
                note(&mut first_error, id, create_subscription(ctx, &detached).await);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Log a per-subscription failure and keep the first one.
fn note(first_error: &mut Option<EngineError>, id: &str, result: Result<(), EngineError>) {
    if let Err(e) = result {
        warn!(subscription_id = %id, error = %e, "Subscription drift correction failed");
        first_error.get_or_insert(e);
    }
}

fn spec_from_remote(destination: &EventDestination) -> SubscriptionSpec {
    SubscriptionSpec {
        destination: destination.destination.clone(),
        name: destination.name.clone(),
        context: destination.context.clone(),
        protocol: destination
            .protocol
            .clone()
            .unwrap_or_else(|| "Redfish".to_string()),
        event_types: destination.event_types.clone(),
        message_ids: destination.message_ids.clone(),
        resource_types: destination.resource_types.clone(),
        origin_resources: destination
            .origin_resources
            .iter()
            .map(|r| r.odata_id.clone())
            .collect(),
        subordinate_resources: destination.subordinate_resources.unwrap_or(false),
    }
}

async fn adopt_subscription(ctx: &ReconcileContext, id: &str) -> Result<(), EngineError> {
    let destination: EventDestination = ctx.api().get_as(&subscription_path(id)).await?;

    let fallback = format!("subscription-{}", sanitize_name(id));
    let name = destination
        .name
        .as_deref()
        .map(sanitize_name)
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| fallback.clone());

    let build = |name: &str| EventSubscriptionRecord {
        meta: RecordMeta::new(name)
            .with_label(LABEL_SUBSCRIPTION_ID, id)
            .with_finalizer(OPERATOR_FINALIZER),
        spec: spec_from_remote(&destination),
        status: SubscriptionStatus {
            subscription_id: Some(id.to_string()),
            error: None,
        },
    };

    match ctx.store.create(&build(&name)).await {
        Ok(()) => {}
        Err(StoreError::AlreadyExists { .. }) if name != fallback => {
            ctx.store.create(&build(&fallback)).await?;
        }
        Err(e) => return Err(e.into()),
    }
    debug!(subscription_id = %id, "Subscription adopted from remote");
    Ok(())
}
