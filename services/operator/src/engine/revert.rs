//! Revert engine: local records are authoritative.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::{accommodate, bmc, power, volume, EngineError, PassReport, ReconcileContext};
use crate::redfish::types::{
    bios_path, bios_settings_path, system_path, Bios, Boot, ComputerSystem, SimpleUpdateRequest,
    SIMPLE_UPDATE,
};
use crate::redfish::{Method, RedfishApiExt};
use crate::registry;
use crate::reset::{is_reset_allowed, revert_reset_type, PowerState, FORCE_RESTART};
use crate::state::records::{BiosRecord, BmcRecord, BootRecord, FirmwareImage, FirmwareRecord};
use crate::state::ResourceStoreExt;
use crate::task_monitor::OperationKind;

/// Push local state to the remote system.
pub async fn run(
    ctx: &ReconcileContext,
    record: &BmcRecord,
    system_id: &str,
    report: &mut PassReport,
) {
    let name = record.meta.name.as_str();

    let result = volume::revert_volumes(ctx, name, system_id).await;
    let remote_volumes = report.check("volumes", result);

    let result = push_bios(ctx, name, system_id).await;
    report.check("bios", result);

    let result = ctx.api().get_as::<ComputerSystem>(&system_path(system_id)).await;
    if let Some(system) = report.check("system", result.map_err(EngineError::from)) {
        let result = push_boot(ctx, name, system_id, &system).await;
        report.check("boot", result);

        let result = push_firmware(ctx, name, system_id, &system).await;
        report.check("firmware", result);

        let result = revert_power(ctx, record, system_id, &system).await;
        report.check("power", result);
    }

    if let Some(remote) = remote_volumes {
        let result = store_summary(ctx, name, volume::summarize(&remote)).await;
        report.check("status", result);
    }
}

async fn store_summary(
    ctx: &ReconcileContext,
    bmc: &str,
    storage: BTreeMap<String, Vec<String>>,
) -> Result<(), EngineError> {
    let Some(mut record) = ctx.load_bmc(bmc).await? else {
        return Ok(());
    };
    if record.status.storage != storage {
        record.status.storage = storage;
        ctx.store.update_status(&record).await?;
    }
    Ok(())
}

/// Attributes whose local value differs from the remote one.
fn bios_drift(local: &BTreeMap<String, Value>, remote: &BTreeMap<String, Value>) -> Map<String, Value> {
    local
        .iter()
        .filter(|(key, value)| remote.get(*key) != Some(*value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Push drifted BIOS attributes and restart so they apply.
async fn push_bios(ctx: &ReconcileContext, bmc: &str, system_id: &str) -> Result<(), EngineError> {
    let Some(local) = ctx.store.get::<BiosRecord>(bmc).await? else {
        return Ok(());
    };
    let remote: Bios = ctx.api().get_as(&bios_path(system_id)).await?;

    let mut drift = bios_drift(&local.attributes, &remote.attributes);
    if drift.is_empty() {
        return Ok(());
    }

    let registry_id = remote
        .attribute_registry
        .or_else(|| local.status.attribute_registry.clone());
    if let Some(id) = registry_id {
        if let Some(registry) = registry::attribute_registry(ctx.api(), &id).await? {
            let entries = registry.registry_entries.attributes;
            drift.retain(|key, _| {
                let writable = entries
                    .iter()
                    .any(|e| &e.attribute_name == key && !e.read_only);
                if !writable {
                    warn!(bmc = %bmc, attribute = %key, "Attribute unknown or read-only, not pushed");
                }
                writable
            });
        }
    }
    if drift.is_empty() {
        return Ok(());
    }

    let count = drift.len();
    let body = serde_json::json!({ "Attributes": Value::Object(drift) });
    ctx.monitor
        .execute(
            ctx.api(),
            Method::Patch,
            &bios_settings_path(system_id),
            Some(&body),
            OperationKind::BiosSettings,
        )
        .await?;
    info!(bmc = %bmc, attributes = count, "BIOS settings pushed");

    power::reset_and_settle(ctx, bmc, system_id, FORCE_RESTART).await?;
    Ok(())
}

/// Boot fields set locally that differ remotely, as a PATCH body.
pub(crate) fn boot_patch(local: &Boot, remote: &Boot) -> Option<Value> {
    let mut patch = Map::new();
    if !local.boot_order.is_empty() && local.boot_order != remote.boot_order {
        patch.insert("BootOrder".to_string(), Value::from(local.boot_order.clone()));
    }

    let overrides = [
        (
            "BootSourceOverrideTarget",
            &local.boot_source_override_target,
            &remote.boot_source_override_target,
        ),
        (
            "BootSourceOverrideEnabled",
            &local.boot_source_override_enabled,
            &remote.boot_source_override_enabled,
        ),
        (
            "BootSourceOverrideMode",
            &local.boot_source_override_mode,
            &remote.boot_source_override_mode,
        ),
    ];
    for (field, wanted, current) in overrides {
        if let Some(wanted) = wanted {
            if current.as_ref() != Some(wanted) {
                patch.insert(field.to_string(), Value::from(wanted.clone()));
            }
        }
    }

    if patch.is_empty() {
        None
    } else {
        Some(serde_json::json!({ "Boot": Value::Object(patch) }))
    }
}

async fn push_boot(
    ctx: &ReconcileContext,
    bmc: &str,
    system_id: &str,
    system: &ComputerSystem,
) -> Result<(), EngineError> {
    let Some(local) = ctx.store.get::<BootRecord>(bmc).await? else {
        return Ok(());
    };
    let remote = system.boot.clone().unwrap_or_default();
    let Some(body) = boot_patch(&local.boot, &remote) else {
        return Ok(());
    };

    ctx.monitor
        .execute(
            ctx.api(),
            Method::Patch,
            &system_path(system_id),
            Some(&body),
            OperationKind::BootSettings,
        )
        .await?;
    info!(bmc = %bmc, "Boot settings pushed");
    Ok(())
}

/// Push the stored firmware image when the running version differs.
async fn push_firmware(
    ctx: &ReconcileContext,
    bmc: &str,
    system_id: &str,
    system: &ComputerSystem,
) -> Result<(), EngineError> {
    let Some(record) = ctx.store.get::<FirmwareRecord>(bmc).await? else {
        return Ok(());
    };
    let Some(image) = record.spec.image.clone() else {
        return Ok(());
    };

    let running = bmc::manager_firmware(ctx, system).await?;
    if running.as_deref() == Some(image.version.as_str()) {
        return Ok(());
    }
    if !ctx.tracking.try_begin_firmware(bmc) {
        debug!(bmc = %bmc, "Firmware update in flight");
        return Ok(());
    }

    let result = update_firmware(ctx, bmc, system_id, system, &image).await;
    ctx.tracking.finish_firmware(bmc);

    let Some(mut record) = ctx.store.get::<FirmwareRecord>(bmc).await? else {
        return result.map(|_| ());
    };
    match result {
        Ok(version) => {
            accommodate::set_version(&mut record, version);
            record.status.last_update_error = None;
            ctx.store.update(&record).await?;
            Ok(())
        }
        Err(e) => {
            record.status.last_update_error = Some(e.to_string());
            ctx.store.update_status(&record).await?;
            Err(e)
        }
    }
}

async fn update_firmware(
    ctx: &ReconcileContext,
    bmc: &str,
    system_id: &str,
    system: &ComputerSystem,
    image: &FirmwareImage,
) -> Result<Option<String>, EngineError> {
    let request = SimpleUpdateRequest {
        image_uri: image.uri.clone(),
        targets: bmc::manager_path(system).map(str::to_string).into_iter().collect(),
        transfer_protocol: image.transfer_protocol.clone(),
    };
    let body = serde_json::to_value(&request).map_err(|e| EngineError::Invalid(e.to_string()))?;

    info!(bmc = %bmc, image = %image.uri, version = %image.version, "Pushing firmware");
    ctx.monitor
        .execute(
            ctx.api(),
            Method::Post,
            SIMPLE_UPDATE,
            Some(&body),
            OperationKind::FirmwareUpdate,
        )
        .await?;

    power::reset_and_settle(ctx, bmc, system_id, FORCE_RESTART).await?;

    let system: ComputerSystem = ctx.api().get_as(&system_path(system_id)).await?;
    bmc::manager_firmware(ctx, &system).await
}

/// Bring the power state back to the stored one.
async fn revert_power(
    ctx: &ReconcileContext,
    record: &BmcRecord,
    system_id: &str,
    system: &ComputerSystem,
) -> Result<(), EngineError> {
    let Some(desired) = record.status.power_state else {
        return Ok(());
    };
    let Some(current) = system
        .power_state
        .as_deref()
        .and_then(|s| s.parse::<PowerState>().ok())
    else {
        return Ok(());
    };
    if current == desired {
        return Ok(());
    }

    let reset_type = revert_reset_type(desired);
    let vendor = record.status.vendor.as_deref().unwrap_or_default();
    let model = record.status.model.as_deref().unwrap_or_default();
    if !is_reset_allowed(vendor, model, current, desired, reset_type) {
        return Err(EngineError::Rejected(format!(
            "{reset_type} from {current} to {desired} not allowed for {vendor} {model}"
        )));
    }

    info!(bmc = %record.meta.name, from = %current, to = %desired, "Power state drifted, reverting");
    power::reset_and_settle(ctx, &record.meta.name, system_id, reset_type).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bios_drift_only_lists_differences() {
        let local = BTreeMap::from([
            ("BootMode".to_string(), json!("Uefi")),
            ("ProcHyperthreading".to_string(), json!("Enabled")),
        ]);
        let remote = BTreeMap::from([
            ("BootMode".to_string(), json!("Uefi")),
            ("ProcHyperthreading".to_string(), json!("Disabled")),
            ("Other".to_string(), json!(1)),
        ]);

        let drift = bios_drift(&local, &remote);
        assert_eq!(drift.len(), 1);
        assert_eq!(drift["ProcHyperthreading"], "Enabled");
    }

    #[test]
    fn test_boot_patch_ignores_unset_fields() {
        let local = Boot {
            boot_order: vec![],
            boot_source_override_target: Some("Pxe".to_string()),
            ..Default::default()
        };
        let remote = Boot {
            boot_order: vec!["Boot0001".to_string()],
            boot_source_override_target: Some("Hdd".to_string()),
            boot_source_override_enabled: Some("Once".to_string()),
            ..Default::default()
        };

        let patch = boot_patch(&local, &remote).unwrap();
        assert_eq!(patch, json!({"Boot": {"BootSourceOverrideTarget": "Pxe"}}));
    }

    #[test]
    fn test_boot_patch_none_when_in_sync() {
        let boot = Boot {
            boot_order: vec!["Boot0001".to_string(), "Boot0002".to_string()],
            ..Default::default()
        };
        assert!(boot_patch(&boot, &boot).is_none());
    }
}
