//! Accommodate engine: the remote system is authoritative.
//!
//! Every step compares before writing, so a pass over an unchanged system
//! performs no store mutations.

use chrono::Utc;
use tracing::{debug, info};

use super::{bmc, volume, EngineError, PassReport, ReconcileContext};
use crate::redfish::types::{bios_path, system_path, Bios, Boot, ComputerSystem};
use crate::redfish::RedfishApiExt;
use crate::state::records::{
    dependent_meta, BiosRecord, BiosStatus, BmcRecord, BootRecord, BootStatus, FirmwareRecord,
    FirmwareSpec, FirmwareStatus, LABEL_FIRMWARE_VERSION,
};
use crate::state::ResourceStoreExt;

/// Pull remote state into the BMC record and its dependents.
pub async fn run(
    ctx: &ReconcileContext,
    record: &BmcRecord,
    system_id: &str,
    report: &mut PassReport,
) {
    let name = record.meta.name.as_str();
    let mut updated = record.clone();

    let result = volume::accommodate_volumes(ctx, name, system_id).await;
    if let Some(remote) = report.check("volumes", result) {
        updated.status.storage = volume::summarize(&remote);
    }

    let result = pull_bios(ctx, name, system_id).await;
    if let Some(registry) = report.check("bios", result) {
        updated.status.bios_attribute_registry = registry;
    }

    let result = ctx.api().get_as::<ComputerSystem>(&system_path(system_id)).await;
    if let Some(system) = report.check("system", result.map_err(EngineError::from)) {
        let result = store_boot(ctx, name, system.boot.clone().unwrap_or_default()).await;
        report.check("boot", result);

        let result = bmc::observe_status(ctx, system_id, &system, &updated.status).await;
        if let Some(status) = report.check("firmware", result) {
            updated.status = status;
            let result = store_firmware(ctx, name, updated.status.firmware_version.clone()).await;
            report.check("firmware", result);
        }
    }

    bmc::apply_identity_labels(&mut updated);
    let result = if updated.meta.labels != record.meta.labels {
        ctx.store.update(&updated).await
    } else if updated.status != record.status {
        ctx.store.update_status(&updated).await
    } else {
        debug!(bmc = %name, "BMC status unchanged");
        Ok(())
    };
    report.check("status", result.map_err(EngineError::from));
}

/// Fetch BIOS attributes and store them. Returns the attribute registry id.
async fn pull_bios(
    ctx: &ReconcileContext,
    bmc: &str,
    system_id: &str,
) -> Result<Option<String>, EngineError> {
    let bios: Bios = ctx.api().get_as(&bios_path(system_id)).await?;
    let registry = bios.attribute_registry.clone();
    store_bios(ctx, bmc, bios).await?;
    Ok(registry)
}

/// Store remote BIOS attributes; true when the record changed.
pub async fn store_bios(ctx: &ReconcileContext, bmc: &str, bios: Bios) -> Result<bool, EngineError> {
    let Some(mut record) = ctx.store.get::<BiosRecord>(bmc).await? else {
        ctx.store
            .create(&BiosRecord {
                meta: dependent_meta(bmc),
                attributes: bios.attributes,
                status: BiosStatus {
                    attribute_registry: bios.attribute_registry,
                    last_synced_at: Some(Utc::now()),
                },
            })
            .await?;
        return Ok(true);
    };

    if record.attributes == bios.attributes
        && record.status.attribute_registry == bios.attribute_registry
    {
        return Ok(false);
    }

    record.attributes = bios.attributes;
    record.status.attribute_registry = bios.attribute_registry;
    record.status.last_synced_at = Some(Utc::now());
    ctx.store.update(&record).await?;
    info!(bmc = %bmc, "BIOS attributes updated from remote");
    Ok(true)
}

/// Store remote boot settings; true when the record changed.
pub async fn store_boot(ctx: &ReconcileContext, bmc: &str, boot: Boot) -> Result<bool, EngineError> {
    let Some(mut record) = ctx.store.get::<BootRecord>(bmc).await? else {
        ctx.store
            .create(&BootRecord {
                meta: dependent_meta(bmc),
                boot,
                status: BootStatus {
                    last_synced_at: Some(Utc::now()),
                },
            })
            .await?;
        return Ok(true);
    };

    if record.boot == boot {
        return Ok(false);
    }

    record.boot = boot;
    record.status.last_synced_at = Some(Utc::now());
    ctx.store.update(&record).await?;
    info!(bmc = %bmc, "Boot settings updated from remote");
    Ok(true)
}

/// Store the remote firmware version on the firmware record and its label.
pub async fn store_firmware(
    ctx: &ReconcileContext,
    bmc: &str,
    version: Option<String>,
) -> Result<bool, EngineError> {
    let Some(mut record) = ctx.store.get::<FirmwareRecord>(bmc).await? else {
        let mut record = FirmwareRecord {
            meta: dependent_meta(bmc),
            spec: FirmwareSpec::default(),
            status: FirmwareStatus::default(),
        };
        set_version(&mut record, version);
        ctx.store.create(&record).await?;
        return Ok(true);
    };

    if record.status.version == version {
        return Ok(false);
    }

    info!(
        bmc = %bmc,
        from = record.status.version.as_deref().unwrap_or(""),
        to = version.as_deref().unwrap_or(""),
        "Firmware version changed remotely"
    );
    set_version(&mut record, version);
    ctx.store.update(&record).await?;
    Ok(true)
}

pub(crate) fn set_version(record: &mut FirmwareRecord, version: Option<String>) {
    match &version {
        Some(v) => {
            record
                .meta
                .labels
                .insert(LABEL_FIRMWARE_VERSION.to_string(), v.clone());
        }
        None => {
            record.meta.labels.remove(LABEL_FIRMWARE_VERSION);
        }
    }
    record.status.version = version;
}
