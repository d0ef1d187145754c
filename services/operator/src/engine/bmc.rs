//! BMC lifecycle: add workflow, adoption of a remote system, deletion and
//! remote removal.

use std::collections::{BTreeMap, BTreeSet};

use bmcsync_reconcile::diff_keyed_sets;
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use super::{volume, EngineError, Policy, ReconcileContext};
use crate::redfish::types::{
    bios_path, system_path, AddAggregationSourceLinks, AddAggregationSourceRequest,
    AggregationSource, Bios, ComputerSystem, ConnectionMethod, Manager, ODataRef, AGGREGATION_SOURCES, CONNECTION_METHODS,
    SYSTEMS,
};
use crate::redfish::{Method, RedfishApiExt};
use crate::state::records::{
    dependent_meta, BiosRecord, BiosStatus, BmcRecord, BmcStatus, BootRecord, BootStatus,
    FirmwareRecord, FirmwareSpec, FirmwareStatus, VolumeRecord, LABEL_BMC, LABEL_BMC_ADDRESS,
    LABEL_FIRMWARE_VERSION, LABEL_SERIAL_NUMBER, LABEL_SYSTEM_ID, OPERATOR_FINALIZER,
};
use crate::state::{ListFilter, ResourceStoreExt};
use crate::task_monitor::OperationKind;

/// Register a BMC that has no remote system yet.
///
/// Returns `None` when the record was removed after its add attempts were
/// used up.
#[instrument(skip(ctx, record), fields(bmc = %record.meta.name, address = %record.spec.address))]
pub async fn add_bmc(
    ctx: &ReconcileContext,
    record: BmcRecord,
) -> Result<Option<BmcRecord>, EngineError> {
    let name = record.meta.name.clone();

    match register(ctx, &record).await {
        Ok((system_id, source_path)) => {
            let adopted = adopt_system(ctx, record, &system_id, Some(source_path)).await?;
            ctx.clear_add_failures(&name);
            Ok(Some(adopted))
        }
        Err(e) => {
            if !ctx.record_add_failure(&name) {
                return Err(e);
            }
            warn!(
                bmc = %name,
                max_attempts = ctx.settings.max_add_attempts,
                error = %e,
                "BMC could not be added, removing record"
            );
            ctx.store
                .release_and_delete::<BmcRecord>(&name, OPERATOR_FINALIZER)
                .await?;
            ctx.clear_add_failures(&name);
            Ok(None)
        }
    }
}

/// Create (or find) the aggregation source for `record`.
///
/// Returns the system id and the aggregation source path.
async fn register(
    ctx: &ReconcileContext,
    record: &BmcRecord,
) -> Result<(String, String), EngineError> {
    let address = record.spec.address.as_str();

    if let Some((path, source)) =
        find_source(ctx, |s| s.host_name.as_deref() == Some(address)).await?
    {
        debug!(source = %path, "Aggregation source already exists");
        return system_of(&source)
            .map(|system_id| (system_id, path))
            .ok_or_else(|| EngineError::Invalid(format!("{address} exposes no system yet")));
    }

    if record.spec.credentials.password.is_empty() {
        return Err(EngineError::Invalid("no password stored".to_string()));
    }
    let password = ctx.cipher.decrypt(&record.spec.credentials.password)?;

    let method =
        resolve_connection_method(ctx, record.spec.connection_method_variant.as_deref()).await?;

    let request = AddAggregationSourceRequest {
        host_name: address.to_string(),
        user_name: record.spec.credentials.username.clone(),
        password,
        links: AddAggregationSourceLinks {
            connection_method: ODataRef::new(method.odata_id.clone()),
        },
    };
    let body = serde_json::to_value(&request).map_err(|e| EngineError::Invalid(e.to_string()))?;

    let response = ctx
        .monitor
        .execute(
            ctx.api(),
            Method::Post,
            AGGREGATION_SOURCES,
            Some(&body),
            OperationKind::AddBmc,
        )
        .await?;

    let source_path = response
        .resource_path()
        .ok_or_else(|| EngineError::Invalid("add returned no aggregation source".to_string()))?;

    let source = match response.decode::<AggregationSource>(&source_path) {
        Ok(source) if !source.links.resources_accessed.is_empty() => source,
        _ => ctx.api().get_as(&source_path).await?,
    };

    let system_id = system_of(&source)
        .ok_or_else(|| EngineError::Invalid(format!("{address} exposes no system yet")))?;

    info!(source = %source_path, system_id = %system_id, "Aggregation source created");
    Ok((system_id, source_path))
}

fn system_of(source: &AggregationSource) -> Option<String> {
    let prefix = format!("{SYSTEMS}/");
    source
        .links
        .resources_accessed
        .iter()
        .find(|r| r.odata_id.starts_with(&prefix))
        .map(|r| r.id().to_string())
}

/// Pick the connection method by variant, or the first Redfish one.
async fn resolve_connection_method(
    ctx: &ReconcileContext,
    variant: Option<&str>,
) -> Result<ConnectionMethod, EngineError> {
    let mut methods = Vec::new();
    for member in ctx.api().list_members(CONNECTION_METHODS).await? {
        methods.push(ctx.api().get_as::<ConnectionMethod>(&member.odata_id).await?);
    }

    let found = match variant {
        Some(variant) => methods.into_iter().find(|m| {
            m.connection_method_variant
                .as_deref()
                .is_some_and(|v| v.eq_ignore_ascii_case(variant))
        }),
        None => methods
            .into_iter()
            .find(|m| m.connection_method_type.as_deref() == Some("Redfish")),
    };

    found.ok_or_else(|| match variant {
        Some(variant) => EngineError::Unsupported(format!("connection method variant {variant}")),
        None => EngineError::Unsupported("no Redfish connection method".to_string()),
    })
}

/// First aggregation source matching `pred`, with its path.
pub(crate) async fn find_source<F>(
    ctx: &ReconcileContext,
    pred: F,
) -> Result<Option<(String, AggregationSource)>, EngineError>
where
    F: Fn(&AggregationSource) -> bool + Send,
{
    for member in ctx.api().list_members(AGGREGATION_SOURCES).await? {
        let source: AggregationSource = ctx.api().get_as(&member.odata_id).await?;
        if pred(&source) {
            let path = source.odata_id.clone().unwrap_or(member.odata_id);
            return Ok(Some((path, source)));
        }
    }
    Ok(None)
}

/// Aggregation source that exposes `system_id`.
pub(crate) async fn source_for_system(
    ctx: &ReconcileContext,
    system_id: &str,
) -> Result<Option<(String, AggregationSource)>, EngineError> {
    let path = system_path(system_id);
    find_source(ctx, |s| s.accesses(&path)).await
}

/// Populate status and labels from the remote system, persist the record
/// and create its dependents.
pub async fn adopt_system(
    ctx: &ReconcileContext,
    mut record: BmcRecord,
    system_id: &str,
    source_path: Option<String>,
) -> Result<BmcRecord, EngineError> {
    let path = system_path(system_id);
    let system: ComputerSystem = ctx.api().get_as(&path).await?;
    let storage = volume::remote_volume_ids(ctx, system_id).await?;

    let mut status = observe_status(ctx, system_id, &system, &record.status).await?;
    status.storage = volume::summarize(&storage);
    if source_path.is_some() {
        status.aggregation_source = source_path;
    }
    record.status = status;

    apply_identity_labels(&mut record);
    if !record.meta.has_finalizer(OPERATOR_FINALIZER) {
        record.meta.finalizers.push(OPERATOR_FINALIZER.to_string());
    }
    ctx.store.update(&record).await?;

    ensure_dependents(ctx, &record, system_id, &system, &storage).await?;
    ctx.tracking.mark_record_created(&path);

    info!(
        bmc = %record.meta.name,
        system_id = %system_id,
        serial = record.status.serial_number.as_deref().unwrap_or(""),
        "BMC adopted"
    );
    Ok(record)
}

pub(crate) fn apply_identity_labels(record: &mut BmcRecord) {
    let labels = &mut record.meta.labels;
    labels.insert(LABEL_BMC_ADDRESS.to_string(), record.spec.address.clone());
    if let Some(system_id) = &record.status.system_id {
        labels.insert(LABEL_SYSTEM_ID.to_string(), system_id.clone());
    }
    if let Some(serial) = &record.status.serial_number {
        labels.insert(LABEL_SERIAL_NUMBER.to_string(), serial.clone());
    }
}

/// Status as reported by the remote system; fields not observed here are
/// carried over from `previous`.
pub(crate) async fn observe_status(
    ctx: &ReconcileContext,
    system_id: &str,
    system: &ComputerSystem,
    previous: &BmcStatus,
) -> Result<BmcStatus, EngineError> {
    let mut status = previous.clone();
    status.system_id = Some(system_id.to_string());
    if system.host_name.is_some() {
        status.host_name = system.host_name.clone();
    }
    status.serial_number = system.serial_number.clone();
    status.vendor = system.manufacturer.clone();
    status.model = system.model.clone();
    status.power_state = system.power_state.as_deref().and_then(|s| s.parse().ok());
    status.firmware_version = manager_firmware(ctx, system).await?;
    Ok(status)
}

/// Firmware version of the system's first manager.
pub(crate) async fn manager_firmware(
    ctx: &ReconcileContext,
    system: &ComputerSystem,
) -> Result<Option<String>, EngineError> {
    let Some(manager) = system.links.managed_by.first() else {
        return Ok(None);
    };
    let manager: Manager = ctx.api().get_as(&manager.odata_id).await?;
    Ok(manager.firmware_version)
}

/// Create the Bios, Boot, Firmware and Volume records of a BMC where they
/// do not exist yet.
async fn ensure_dependents(
    ctx: &ReconcileContext,
    record: &BmcRecord,
    system_id: &str,
    system: &ComputerSystem,
    storage: &BTreeMap<String, BTreeSet<String>>,
) -> Result<(), EngineError> {
    let bmc = record.meta.name.as_str();

    if ctx.store.get::<BiosRecord>(bmc).await?.is_none() {
        let bios: Bios = ctx.api().get_as(&bios_path(system_id)).await?;
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
    }

    if ctx.store.get::<BootRecord>(bmc).await?.is_none() {
        ctx.store
            .create(&BootRecord {
                meta: dependent_meta(bmc),
                boot: system.boot.clone().unwrap_or_default(),
                status: BootStatus {
                    last_synced_at: Some(Utc::now()),
                },
            })
            .await?;
    }

    if ctx.store.get::<FirmwareRecord>(bmc).await?.is_none() {
        let mut meta = dependent_meta(bmc);
        if let Some(version) = &record.status.firmware_version {
            meta.labels
                .insert(LABEL_FIRMWARE_VERSION.to_string(), version.clone());
        }
        ctx.store
            .create(&FirmwareRecord {
                meta,
                spec: FirmwareSpec::default(),
                status: FirmwareStatus {
                    version: record.status.firmware_version.clone(),
                    last_update_error: None,
                },
            })
            .await?;
    }

    let (local, _) = volume::local_volume_ids(ctx, bmc).await?;
    for (controller, ids) in diff_keyed_sets(storage, &local) {
        for volume_id in ids {
            volume::record_remote_volume(ctx, bmc, system_id, &controller, &volume_id).await?;
        }
    }

    Ok(())
}

/// Remove a deletion-marked BMC: remote aggregation source first, then
/// dependents, then the record itself.
#[instrument(skip(ctx, record), fields(bmc = %record.meta.name))]
pub async fn delete_bmc(ctx: &ReconcileContext, record: &BmcRecord) -> Result<(), EngineError> {
    let name = record.meta.name.as_str();

    if let Some(source) = source_path_for(ctx, record).await? {
        ctx.monitor
            .execute(ctx.api(), Method::Delete, &source, None, OperationKind::DeleteBmc)
            .await?;
        info!(source = %source, "Aggregation source deleted");
    }

    destroy_dependents(ctx, name).await?;
    forget(ctx, record);
    ctx.store
        .release_and_delete::<BmcRecord>(name, OPERATOR_FINALIZER)
        .await?;
    info!("BMC record removed");
    Ok(())
}

async fn source_path_for(
    ctx: &ReconcileContext,
    record: &BmcRecord,
) -> Result<Option<String>, EngineError> {
    if let Some(path) = &record.status.aggregation_source {
        return Ok(Some(path.clone()));
    }
    let found = match record.system_id() {
        Some(system_id) => source_for_system(ctx, system_id).await?,
        None => {
            let address = record.spec.address.as_str();
            find_source(ctx, |s| s.host_name.as_deref() == Some(address)).await?
        }
    };
    Ok(found.map(|(path, _)| path))
}

/// Destroy dependents in order: Bios, Boot, Firmware, Volume.
pub async fn destroy_dependents(ctx: &ReconcileContext, bmc: &str) -> Result<(), EngineError> {
    let owned = ListFilter::by_label(LABEL_BMC, bmc);

    for record in ctx.store.list::<BiosRecord>(&owned).await? {
        ctx.store
            .release_and_delete::<BiosRecord>(&record.meta.name, OPERATOR_FINALIZER)
            .await?;
    }
    for record in ctx.store.list::<BootRecord>(&owned).await? {
        ctx.store
            .release_and_delete::<BootRecord>(&record.meta.name, OPERATOR_FINALIZER)
            .await?;
    }
    for record in ctx.store.list::<FirmwareRecord>(&owned).await? {
        ctx.store
            .release_and_delete::<FirmwareRecord>(&record.meta.name, OPERATOR_FINALIZER)
            .await?;
    }
    for record in ctx.store.list::<VolumeRecord>(&owned).await? {
        ctx.store
            .release_and_delete::<VolumeRecord>(&record.meta.name, OPERATOR_FINALIZER)
            .await?;
    }

    debug!(bmc = %bmc, "Dependents destroyed");
    Ok(())
}

fn forget(ctx: &ReconcileContext, record: &BmcRecord) {
    ctx.tracking
        .forget_bmc(&record.meta.name, record.system_id());
    if let Some(system_id) = record.system_id() {
        ctx.tracking.confirm_deleted(&system_path(system_id));
    }
    ctx.clear_add_failures(&record.meta.name);
}

/// The remote system of `record` was reported gone.
///
/// Accommodate drops the local record; Revert registers the BMC again.
/// Returns true when the record was removed.
#[instrument(skip(ctx, record), fields(bmc = %record.meta.name))]
pub async fn handle_remote_removed(
    ctx: &ReconcileContext,
    record: &BmcRecord,
) -> Result<bool, EngineError> {
    let Some(system_id) = record.system_id() else {
        return Ok(false);
    };
    let path = system_path(system_id);

    let response = ctx.api().get(&path).await?;
    if response.is_success() {
        debug!(system_id = %system_id, "System still present, ignoring removal");
        ctx.tracking.mark_record_created(&path);
        return Ok(false);
    }
    // Only a 404 confirms the removal; anything else is retried next pass.
    if response.status != 404 {
        response.ensure_success(Method::Get, &path)?;
    }

    match ctx.policy() {
        Policy::Accommodate => {
            destroy_dependents(ctx, &record.meta.name).await?;
            forget(ctx, record);
            ctx.store
                .release_and_delete::<BmcRecord>(&record.meta.name, OPERATOR_FINALIZER)
                .await?;
            info!(system_id = %system_id, "System removed remotely, record dropped");
            Ok(true)
        }
        Policy::Revert => {
            let mut detached = record.clone();
            detached.status.system_id = None;
            detached.status.aggregation_source = None;
            detached.meta.labels.remove(LABEL_SYSTEM_ID);
            ctx.store.update(&detached).await?;
            ctx.tracking.confirm_deleted(&path);
            info!(system_id = %system_id, "System removed remotely, registering again");
            Ok(add_bmc(ctx, detached).await?.is_none())
        }
    }
}

/// Manager that a system reports first, as an `ODataRef` path.
pub(crate) fn manager_path(system: &ComputerSystem) -> Option<&str> {
    system.links.managed_by.first().map(|m| m.odata_id.as_str())
}
