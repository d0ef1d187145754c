//! Power requests and reset execution.
//!
//! Every reset goes through [`reset_and_settle`], which holds the
//! per-system reset gate for its whole duration. While the gate is held,
//! drift correction for that system is skipped.

use bmcsync_reconcile::SpecHash;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{accommodate, volume, EngineError, ReconcileContext};
use crate::redfish::types::{bios_path, reset_path, system_path, Bios, ComputerSystem, ResetRequest};
use crate::redfish::{Method, RedfishApiExt};
use crate::reset::{is_reset_allowed, PowerState};
use crate::state::records::BmcRecord;
use crate::state::ResourceStoreExt;
use crate::task_monitor::OperationKind;

/// Execute the one-shot power request of a BMC record, if any.
///
/// A request that fails the reset state machine is cleared with a
/// rejection result and nothing is sent remotely.
pub async fn apply_power_request(ctx: &ReconcileContext, bmc: &str) -> Result<(), EngineError> {
    let Some(record) = ctx.load_bmc(bmc).await? else {
        return Ok(());
    };
    let (Some(request), Some(system_id)) = (record.spec.power.clone(), record.system_id()) else {
        return Ok(());
    };
    let system_id = system_id.to_string();

    let system: ComputerSystem = ctx.api().get_as(&system_path(&system_id)).await?;
    let current = system
        .power_state
        .as_deref()
        .and_then(|s| s.parse::<PowerState>().ok())
        .or(record.status.power_state)
        .ok_or_else(|| EngineError::Invalid("system reports no power state".to_string()))?;

    let vendor = record.status.vendor.as_deref().unwrap_or_default();
    let model = record.status.model.as_deref().unwrap_or_default();
    if !is_reset_allowed(vendor, model, current, request.power_state, &request.reset_type) {
        let reason = format!(
            "{} from {} to {} not allowed for {} {}",
            request.reset_type, current, request.power_state, vendor, model
        );
        finish_request(ctx, bmc, None, format!("rejected: {reason}")).await?;
        return Err(EngineError::Rejected(reason));
    }

    match reset_and_settle(ctx, bmc, &system_id, &request.reset_type).await {
        Ok(true) => {
            finish_request(
                ctx,
                bmc,
                Some(request.power_state),
                format!("{} completed", request.reset_type),
            )
            .await
        }
        Ok(false) => Ok(()),
        Err(e) => {
            finish_request(ctx, bmc, None, format!("failed: {e}")).await?;
            Err(e)
        }
    }
}

async fn finish_request(
    ctx: &ReconcileContext,
    bmc: &str,
    power_state: Option<PowerState>,
    result: String,
) -> Result<(), EngineError> {
    let Some(mut record) = ctx.load_bmc(bmc).await? else {
        return Ok(());
    };
    record.spec.power = None;
    if power_state.is_some() {
        record.status.power_state = power_state;
    }
    record.status.last_reset_result = Some(result);
    ctx.store.update(&record).await?;
    Ok(())
}

/// Reset a system and wait for it to settle.
///
/// Returns false without doing anything when a reset is already pending
/// for the system.
pub async fn reset_and_settle(
    ctx: &ReconcileContext,
    bmc: &str,
    system_id: &str,
    reset_type: &str,
) -> Result<bool, EngineError> {
    if !ctx.tracking.try_mark_reset_pending(system_id) {
        debug!(system_id = %system_id, "Reset already pending");
        return Ok(false);
    }

    let result = run_reset(ctx, bmc, system_id, reset_type).await;

    ctx.tracking.clear_reset_pending(system_id);
    let cleared = set_reset_flag(ctx, bmc, false).await;
    result?;
    cleared?;
    Ok(true)
}

async fn run_reset(
    ctx: &ReconcileContext,
    bmc: &str,
    system_id: &str,
    reset_type: &str,
) -> Result<(), EngineError> {
    set_reset_flag(ctx, bmc, true).await?;

    let before = snapshot(ctx, system_id).await;

    let body = serde_json::to_value(ResetRequest {
        reset_type: reset_type.to_string(),
    })
    .map_err(|e| EngineError::Invalid(e.to_string()))?;
    ctx.monitor
        .execute(
            ctx.api(),
            Method::Post,
            &reset_path(system_id),
            Some(&body),
            OperationKind::Reset,
        )
        .await?;
    info!(bmc = %bmc, system_id = %system_id, reset_type = %reset_type, "Reset completed");

    post_reset(ctx, bmc, system_id, before).await
}

async fn set_reset_flag(ctx: &ReconcileContext, bmc: &str, pending: bool) -> Result<(), EngineError> {
    let Some(mut record) = ctx.load_bmc(bmc).await? else {
        return Ok(());
    };
    if record.status.reset_pending != pending {
        record.status.reset_pending = pending;
        ctx.store.update_status::<BmcRecord>(&record).await?;
    }
    Ok(())
}

/// Hashes of BIOS attributes and boot settings.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Snapshot {
    bios: Option<SpecHash>,
    boot: Option<SpecHash>,
}

async fn snapshot(ctx: &ReconcileContext, system_id: &str) -> Snapshot {
    let bios = ctx.api().get_as::<Value>(&bios_path(system_id)).await.ok();
    let system = ctx.api().get_as::<Value>(&system_path(system_id)).await.ok();
    Snapshot {
        bios: bios.as_ref().map(|b| SpecHash::from_json(&b["Attributes"])),
        boot: system.as_ref().map(|s| SpecHash::from_json(&s["Boot"])),
    }
}

/// After a reset: resolve pending volume creations, or else wait for BIOS
/// or boot settings to move and persist what changed.
async fn post_reset(
    ctx: &ReconcileContext,
    bmc: &str,
    system_id: &str,
    before: Snapshot,
) -> Result<(), EngineError> {
    if ctx.tracking.has_pending_volumes(bmc) {
        for attempt in 1..=ctx.settings.settle_attempts {
            volume::resolve_pending(ctx, bmc, system_id).await?;
            if !ctx.tracking.has_pending_volumes(bmc) {
                return Ok(());
            }
            debug!(attempt, "Pending volumes not visible yet");
            tokio::time::sleep(ctx.settings.settle_interval).await;
        }
        warn!(bmc = %bmc, "Pending volumes unresolved after reset, retrying next pass");
        return Ok(());
    }

    for attempt in 1..=ctx.settings.settle_attempts {
        tokio::time::sleep(ctx.settings.settle_interval).await;

        let after = snapshot(ctx, system_id).await;
        let bios_changed = after.bios.is_some() && after.bios != before.bios;
        let boot_changed = after.boot.is_some() && after.boot != before.boot;
        if !bios_changed && !boot_changed {
            debug!(attempt, "Settings unchanged since reset");
            continue;
        }

        if bios_changed {
            let bios: Bios = ctx.api().get_as(&bios_path(system_id)).await?;
            accommodate::store_bios(ctx, bmc, bios).await?;
        }
        if boot_changed {
            let system: ComputerSystem = ctx.api().get_as(&system_path(system_id)).await?;
            accommodate::store_boot(ctx, bmc, system.boot.unwrap_or_default()).await?;
        }
        info!(bmc = %bmc, bios_changed, boot_changed, "Settings refreshed after reset");
        return Ok(());
    }

    debug!(bmc = %bmc, "No setting changes observed after reset");
    Ok(())
}
