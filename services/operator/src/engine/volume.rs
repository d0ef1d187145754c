//! Volume reconciliation.
//!
//! Remote and local volumes are compared as `controller -> {volume id}`
//! maps. Local ids come from records that carry a remote assignment,
//! including records being deleted, so a volume mid-deletion is never
//! adopted again.

use std::collections::{BTreeMap, BTreeSet};

use bmcsync_reconcile::diff_keyed_sets;
use tracing::{debug, info, warn};

use super::{power, EngineError, ReconcileContext};
use crate::redfish::types::{
    drive_path, storage_path, volume_path, volumes_path, Collection, CreateVolumeLinks,
    CreateVolumeRequest, ODataRef, Volume,
};
use crate::redfish::{Method, RedfishApiExt};
use crate::reset::FORCE_RESTART;
use crate::state::records::{
    volume_record_name, VolumeRecord, VolumeSpec, VolumeStatus, LABEL_BMC, OPERATOR_FINALIZER,
};
use crate::state::{ListFilter, PendingVolume, ResourceStoreExt, StoreError, VolumeKey, VolumeOp};
use crate::task_monitor::OperationKind;

/// Volumes are created to take effect on the next reset.
const APPLY_ON_RESET: &str = "OnReset";

pub type VolumeIds = BTreeMap<String, BTreeSet<String>>;

/// Volume ids per storage controller as reported remotely.
pub async fn remote_volume_ids(
    ctx: &ReconcileContext,
    system_id: &str,
) -> Result<VolumeIds, EngineError> {
    let path = storage_path(system_id);
    let response = ctx.api().get(&path).await?;
    if response.status == 404 {
        return Ok(VolumeIds::new());
    }
    response.ensure_success(Method::Get, &path)?;
    let storage: Collection = response.decode(&path)?;

    let mut ids = VolumeIds::new();
    for controller in storage.members {
        let controller = controller.id().to_string();
        let volumes = ctx
            .api()
            .list_members(&volumes_path(system_id, &controller))
            .await?;
        ids.insert(
            controller,
            volumes.iter().map(|v| v.id().to_string()).collect(),
        );
    }
    Ok(ids)
}

/// Volume ids held locally, with the records they came from.
pub async fn local_volume_ids(
    ctx: &ReconcileContext,
    bmc: &str,
) -> Result<(VolumeIds, Vec<VolumeRecord>), EngineError> {
    let records: Vec<VolumeRecord> = ctx
        .store
        .list(&ListFilter::by_label(LABEL_BMC, bmc))
        .await?;

    let mut ids = VolumeIds::new();
    for record in &records {
        if let Some(volume_id) = record.volume_id() {
            ids.entry(record.storage_controller.clone())
                .or_default()
                .insert(volume_id.to_string());
        }
    }
    Ok((ids, records))
}

/// Storage summary kept on the BMC status.
pub fn summarize(ids: &VolumeIds) -> BTreeMap<String, Vec<String>> {
    ids.iter()
        .map(|(controller, ids)| (controller.clone(), ids.iter().cloned().collect()))
        .collect()
}

pub fn volume_status(volume: &Volume) -> VolumeStatus {
    let identifier = volume.identifiers.first();
    VolumeStatus {
        volume_id: volume.id.clone(),
        name: volume.display_name.clone().or_else(|| volume.name.clone()),
        raid_type: volume.raid_type.clone(),
        drives: volume.drive_ids(),
        capacity_bytes: volume.capacity_bytes,
        durable_name: identifier.and_then(|i| i.durable_name.clone()),
        durable_name_format: identifier.and_then(|i| i.durable_name_format.clone()),
    }
}

/// Create a local record for a volume that exists remotely.
pub async fn record_remote_volume(
    ctx: &ReconcileContext,
    bmc: &str,
    system_id: &str,
    controller: &str,
    volume_id: &str,
) -> Result<VolumeRecord, EngineError> {
    let volume: Volume = ctx
        .api()
        .get_as(&volume_path(system_id, controller, volume_id))
        .await?;
    let status = volume_status(&volume);

    let name = volume_record_name(bmc, controller, volume_id, volume.display_name.as_deref());
    let record = VolumeRecord::observed(&name, bmc, controller, status.clone());
    let record = match ctx.store.create(&record).await {
        Ok(()) => record,
        Err(StoreError::AlreadyExists { .. }) => {
            // Display names are not unique across volumes.
            let fallback = volume_record_name(bmc, controller, volume_id, None);
            let record = VolumeRecord::observed(&fallback, bmc, controller, status);
            ctx.store.create(&record).await?;
            record
        }
        Err(e) => return Err(e.into()),
    };

    info!(
        bmc = %bmc,
        controller = %controller,
        volume_id = %volume_id,
        record = %record.meta.name,
        "Volume record created from remote"
    );
    Ok(record)
}

fn find_assigned<'a>(
    records: &'a [VolumeRecord],
    controller: &str,
    volume_id: &str,
) -> Option<&'a VolumeRecord> {
    records
        .iter()
        .find(|r| r.storage_controller == controller && r.volume_id() == Some(volume_id))
}

fn is_pending(ctx: &ReconcileContext, bmc: &str, record: &str) -> bool {
    ctx.tracking
        .pending_volumes(bmc)
        .iter()
        .any(|p| p.record == record)
}

/// Act on volume records that ask for remote work: spec-only records are
/// created, deletion-marked records are deleted.
pub async fn apply_volume_intent(ctx: &ReconcileContext, bmc: &str) -> Result<(), EngineError> {
    let Some(record) = ctx.load_bmc(bmc).await? else {
        return Ok(());
    };
    let Some(system_id) = record.system_id() else {
        return Ok(());
    };

    let (_, volumes) = local_volume_ids(ctx, bmc).await?;
    let mut requested = false;
    let mut first_error = None;

    for volume in &volumes {
        let result = if volume.meta.is_deleting() {
            delete_requested(ctx, bmc, system_id, volume).await
        } else if volume.spec.is_some() && volume.status.is_none() {
            request_creation(ctx, bmc, system_id, volume)
                .await
                .map(|created| requested |= created)
        } else {
            Ok(())
        };

        if let Err(e) = result {
            warn!(bmc = %bmc, record = %volume.meta.name, error = %e, "Volume intent failed");
            first_error.get_or_insert(e);
        }
    }

    if requested {
        power::reset_and_settle(ctx, bmc, system_id, FORCE_RESTART).await?;
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn delete_requested(
    ctx: &ReconcileContext,
    bmc: &str,
    system_id: &str,
    volume: &VolumeRecord,
) -> Result<(), EngineError> {
    let name = volume.meta.name.as_str();
    match volume.volume_id() {
        Some(volume_id) => {
            if delete_remote_volume(ctx, bmc, system_id, &volume.storage_controller, volume_id)
                .await?
            {
                ctx.store
                    .release_and_delete::<VolumeRecord>(name, OPERATOR_FINALIZER)
                    .await?;
            }
        }
        None if is_pending(ctx, bmc, name) => {
            debug!(record = %name, "Volume creation pending, deferring deletion");
        }
        None => {
            ctx.store
                .release_and_delete::<VolumeRecord>(name, OPERATOR_FINALIZER)
                .await?;
        }
    }
    Ok(())
}

/// Delete a volume remotely. Returns false when another pass already
/// has an operation in flight for it.
pub async fn delete_remote_volume(
    ctx: &ReconcileContext,
    bmc: &str,
    system_id: &str,
    controller: &str,
    volume_id: &str,
) -> Result<bool, EngineError> {
    let key = VolumeKey::new(bmc, controller, volume_id);
    if !ctx.tracking.try_begin_volume_op(&key, VolumeOp::Deleting) {
        debug!(controller = %controller, volume_id = %volume_id, "Volume operation in flight, skipping");
        return Ok(false);
    }

    let result = ctx
        .monitor
        .execute(
            ctx.api(),
            Method::Delete,
            &volume_path(system_id, controller, volume_id),
            None,
            OperationKind::DeleteVolume,
        )
        .await;
    ctx.tracking.finish_volume_op(&key);
    result?;

    info!(bmc = %bmc, controller = %controller, volume_id = %volume_id, "Volume deleted remotely");
    Ok(true)
}

/// Ask the remote system to create the volume described by `volume.spec`.
///
/// The creation only takes effect on the next reset; the record stays
/// pending until its new id is resolved. Returns false when a creation for
/// this record is already in flight.
pub async fn request_creation(
    ctx: &ReconcileContext,
    bmc: &str,
    system_id: &str,
    volume: &VolumeRecord,
) -> Result<bool, EngineError> {
    let Some(spec) = &volume.spec else {
        return Ok(false);
    };
    let name = volume.meta.name.as_str();
    let controller = volume.storage_controller.as_str();

    let key = VolumeKey::pending(bmc, controller, name);
    if !ctx.tracking.try_begin_volume_op(&key, VolumeOp::Creating) {
        return Ok(false);
    }

    let result = send_create(ctx, system_id, controller, name, spec).await;
    if let Err(e) = result {
        ctx.tracking.finish_volume_op(&key);
        return Err(e);
    }

    ctx.tracking.add_pending_volume(
        bmc,
        PendingVolume {
            record: name.to_string(),
            controller: controller.to_string(),
            raid_type: spec.raid_type.clone(),
            drives: spec.drives.iter().cloned().collect(),
        },
    );
    info!(bmc = %bmc, controller = %controller, record = %name, raid_type = %spec.raid_type, "Volume creation accepted");
    Ok(true)
}

async fn send_create(
    ctx: &ReconcileContext,
    system_id: &str,
    controller: &str,
    name: &str,
    spec: &VolumeSpec,
) -> Result<(), EngineError> {
    ctx.store
        .add_finalizer::<VolumeRecord>(name, OPERATOR_FINALIZER)
        .await?;

    let request = CreateVolumeRequest {
        name: spec.display_name.clone(),
        raid_type: spec.raid_type.clone(),
        links: CreateVolumeLinks {
            drives: spec
                .drives
                .iter()
                .map(|d| ODataRef::new(drive_path(system_id, controller, d)))
                .collect(),
        },
        operation_apply_time: APPLY_ON_RESET.to_string(),
    };
    let body = serde_json::to_value(&request).map_err(|e| EngineError::Invalid(e.to_string()))?;

    ctx.monitor
        .execute(
            ctx.api(),
            Method::Post,
            &volumes_path(system_id, controller),
            Some(&body),
            OperationKind::CreateVolume,
        )
        .await?;
    Ok(())
}

/// Match pending creations to newly assigned remote volumes by RAID type
/// and drive set, and finalize their records.
pub async fn resolve_pending(
    ctx: &ReconcileContext,
    bmc: &str,
    system_id: &str,
) -> Result<(), EngineError> {
    let pending = ctx.tracking.pending_volumes(bmc);
    if pending.is_empty() {
        return Ok(());
    }

    let (local, _) = local_volume_ids(ctx, bmc).await?;
    let mut claimed: BTreeSet<(String, String)> = BTreeSet::new();

    for entry in pending {
        let controller = entry.controller.as_str();
        let assigned = local.get(controller);
        let candidates = ctx
            .api()
            .list_members(&volumes_path(system_id, controller))
            .await?;

        for candidate in candidates {
            let volume_id = candidate.id().to_string();
            if assigned.is_some_and(|ids| ids.contains(&volume_id))
                || claimed.contains(&(controller.to_string(), volume_id.clone()))
            {
                continue;
            }

            let volume: Volume = ctx.api().get_as(&candidate.odata_id).await?;
            let raid_matches = volume
                .raid_type
                .as_deref()
                .is_some_and(|r| r.eq_ignore_ascii_case(&entry.raid_type));
            let drives: BTreeSet<String> = volume.drive_ids().into_iter().collect();
            if !raid_matches || drives != entry.drives {
                continue;
            }

            finalize_created(ctx, bmc, &entry, &volume).await?;
            claimed.insert((controller.to_string(), volume_id));
            break;
        }
    }

    Ok(())
}

async fn finalize_created(
    ctx: &ReconcileContext,
    bmc: &str,
    entry: &PendingVolume,
    volume: &Volume,
) -> Result<(), EngineError> {
    if let Some(mut record) = ctx.store.get::<VolumeRecord>(&entry.record).await? {
        record.status = Some(volume_status(volume));
        record.spec = None;
        ctx.store.update(&record).await?;
    }
    ctx.tracking.remove_pending_volume(bmc, &entry.record);
    ctx.tracking
        .finish_volume_op(&VolumeKey::pending(bmc, &entry.controller, &entry.record));

    info!(
        bmc = %bmc,
        controller = %entry.controller,
        volume_id = %volume.id,
        record = %entry.record,
        "Pending volume resolved"
    );
    Ok(())
}

/// Remote wins: adopt new remote volumes, release records whose volume is
/// gone. Returns the remote ids for the storage summary.
pub async fn accommodate_volumes(
    ctx: &ReconcileContext,
    bmc: &str,
    system_id: &str,
) -> Result<VolumeIds, EngineError> {
    resolve_pending(ctx, bmc, system_id).await?;

    let remote = remote_volume_ids(ctx, system_id).await?;
    let (local, records) = local_volume_ids(ctx, bmc).await?;

    let mut first_error = None;

    for (controller, ids) in diff_keyed_sets(&remote, &local) {
        // New ids on this controller may belong to a creation not yet resolved.
        if ctx.tracking.has_pending_on_controller(bmc, &controller) {
            continue;
        }
        for volume_id in ids {
            if in_flight(ctx, bmc, &controller, &volume_id) {
                continue;
            }
            let result = record_remote_volume(ctx, bmc, system_id, &controller, &volume_id).await;
            note(&mut first_error, bmc, &volume_id, result);
        }
    }

    for (controller, ids) in diff_keyed_sets(&local, &remote) {
        for volume_id in ids {
            if in_flight(ctx, bmc, &controller, &volume_id) {
                continue;
            }
            if let Some(record) = find_assigned(&records, &controller, &volume_id) {
                let result = ctx
                    .store
                    .release_and_delete::<VolumeRecord>(&record.meta.name, OPERATOR_FINALIZER)
                    .await
                    .map_err(EngineError::from);
                if result.is_ok() {
                    info!(bmc = %bmc, controller = %controller, volume_id = %volume_id, "Volume gone remotely, record released");
                }
                note(&mut first_error, bmc, &volume_id, result);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(remote),
    }
}

/// Local wins: delete volumes unknown locally, recreate volumes missing
/// remotely. Returns the remote ids as observed before any change.
pub async fn revert_volumes(
    ctx: &ReconcileContext,
    bmc: &str,
    system_id: &str,
) -> Result<VolumeIds, EngineError> {
    resolve_pending(ctx, bmc, system_id).await?;

    let remote = remote_volume_ids(ctx, system_id).await?;
    let (local, records) = local_volume_ids(ctx, bmc).await?;
    let mut first_error = None;

    for (controller, ids) in diff_keyed_sets(&remote, &local) {
        if ctx.tracking.has_pending_on_controller(bmc, &controller) {
            continue;
        }
        for volume_id in ids {
            let result = delete_remote_volume(ctx, bmc, system_id, &controller, &volume_id).await;
            note(&mut first_error, bmc, &volume_id, result);
        }
    }

    let mut requested = false;
    for (controller, ids) in diff_keyed_sets(&local, &remote) {
        for volume_id in ids {
            if in_flight(ctx, bmc, &controller, &volume_id) {
                continue;
            }
            let Some(record) = find_assigned(&records, &controller, &volume_id) else {
                continue;
            };
            let result = if record.meta.is_deleting() {
                ctx.store
                    .release_and_delete::<VolumeRecord>(&record.meta.name, OPERATOR_FINALIZER)
                    .await
                    .map_err(EngineError::from)
            } else {
                recreate(ctx, bmc, system_id, record)
                    .await
                    .map(|created| requested |= created)
            };
            note(&mut first_error, bmc, &volume_id, result);
        }
    }

    if requested {
        power::reset_and_settle(ctx, bmc, system_id, FORCE_RESTART).await?;
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(remote),
    }
}

/// Turn an assigned record back into a creation request.
async fn recreate(
    ctx: &ReconcileContext,
    bmc: &str,
    system_id: &str,
    record: &VolumeRecord,
) -> Result<bool, EngineError> {
    let Some(status) = &record.status else {
        return Ok(false);
    };
    let Some(raid_type) = status.raid_type.clone() else {
        warn!(record = %record.meta.name, "Volume has no RAID type recorded, cannot recreate");
        return Ok(false);
    };

    let mut desired = record.clone();
    desired.spec = Some(VolumeSpec {
        raid_type,
        drives: status.drives.clone(),
        display_name: status.name.clone(),
    });
    desired.status = None;
    ctx.store.update(&desired).await?;

    info!(bmc = %bmc, record = %record.meta.name, volume_id = %status.volume_id, "Volume missing remotely, recreating");
    request_creation(ctx, bmc, system_id, &desired).await
}

/// Log a per-volume failure and keep the first one.
fn note<T>(
    first_error: &mut Option<EngineError>,
    bmc: &str,
    volume_id: &str,
    result: Result<T, EngineError>,
) {
    if let Err(e) = result {
        warn!(bmc = %bmc, volume_id = %volume_id, error = %e, "Volume reconciliation failed");
        first_error.get_or_insert(e);
    }
}

fn in_flight(ctx: &ReconcileContext, bmc: &str, controller: &str, volume_id: &str) -> bool {
    ctx.tracking
        .volume_op(&VolumeKey::new(bmc, controller, volume_id))
        .is_some()
}
