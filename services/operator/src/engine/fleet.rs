//! Fleet-level discovery of systems that have no local record.

use tracing::{debug, info};

use super::{bmc, EngineError, Policy, ReconcileContext};
use crate::redfish::types::{last_segment, system_path, SYSTEMS};
use crate::redfish::{Method, RedfishApiExt};
use crate::state::records::{
    sanitize_name, BmcRecord, LABEL_BMC_ADDRESS, LABEL_SYSTEM_ID,
};
use crate::state::{ListFilter, ResourceStoreExt, StoreError};
use crate::task_monitor::OperationKind;

/// Remote system paths currently listed by the aggregation service.
pub async fn remote_systems(ctx: &ReconcileContext) -> Result<Vec<String>, EngineError> {
    Ok(ctx
        .api()
        .list_members(SYSTEMS)
        .await?
        .into_iter()
        .map(|m| m.odata_id)
        .collect())
}

/// The local BMC record that owns `system_id`, if any.
pub async fn find_by_system(
    ctx: &ReconcileContext,
    system_id: &str,
) -> Result<Option<BmcRecord>, EngineError> {
    let mut found: Vec<BmcRecord> = ctx
        .store
        .list(&ListFilter::by_label(LABEL_SYSTEM_ID, system_id))
        .await?;
    Ok(found.pop())
}

/// Handle a remote system that has no local record yet.
///
/// Accommodate creates a minimal BMC record from the aggregation source
/// and adopts the system; Revert removes the unknown aggregation source.
/// Returns the name of the BMC record that now owns the system.
pub async fn discover(
    ctx: &ReconcileContext,
    system_path_or_id: &str,
) -> Result<Option<String>, EngineError> {
    let system_id = last_segment(system_path_or_id).to_string();
    let path = system_path(&system_id);

    if let Some(record) = find_by_system(ctx, &system_id).await? {
        ctx.tracking.mark_record_created(&path);
        return Ok(Some(record.meta.name));
    }

    let Some((source_path, source)) = bmc::source_for_system(ctx, &system_id).await? else {
        debug!(system_id = %system_id, "No aggregation source exposes system yet");
        return Ok(None);
    };
    let address = source.host_name.clone().unwrap_or_default();

    // A record registered under this address but not yet linked to a system.
    if !address.is_empty() {
        let pending: Vec<BmcRecord> = ctx
            .store
            .list(&ListFilter::by_label(LABEL_BMC_ADDRESS, &address))
            .await?;
        if let Some(record) = pending.into_iter().next() {
            ctx.tracking.mark_record_created(&path);
            return Ok(Some(record.meta.name));
        }
    }

    match ctx.policy() {
        Policy::Accommodate => {
            let name = record_name(&address, &system_id);
            let record = BmcRecord::new(
                &name,
                &address,
                source.user_name.as_deref().unwrap_or_default(),
                "",
            );
            match ctx.store.create(&record).await {
                Ok(()) | Err(StoreError::AlreadyExists { .. }) => {}
                Err(e) => return Err(e.into()),
            }
            let Some(record) = ctx.store.get::<BmcRecord>(&name).await? else {
                return Ok(None);
            };
            bmc::adopt_system(ctx, record, &system_id, Some(source_path)).await?;
            info!(bmc = %name, system_id = %system_id, address = %address, "Discovered BMC adopted");
            Ok(Some(name))
        }
        Policy::Revert => {
            ctx.monitor
                .execute(
                    ctx.api(),
                    Method::Delete,
                    &source_path,
                    None,
                    OperationKind::DeleteBmc,
                )
                .await?;
            ctx.tracking.confirm_deleted(&path);
            info!(system_id = %system_id, address = %address, "Unknown BMC removed from aggregation service");
            Ok(None)
        }
    }
}

fn record_name(address: &str, system_id: &str) -> String {
    let from_address = sanitize_name(address);
    if from_address.is_empty() {
        sanitize_name(system_id)
    } else {
        from_address
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_name_prefers_address() {
        assert_eq!(record_name("10.0.0.5", "sys.1"), "10-0-0-5");
        assert_eq!(record_name("", "abc.1"), "abc-1");
    }
}
