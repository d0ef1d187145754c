//! Shared fixtures: an in-memory aggregation service seeded with one
//! system, an in-memory record store and a fast task monitor.

#![allow(dead_code)]

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bmcsync_operator::crypto::PasswordCipher;
use bmcsync_operator::engine::{
    reconcile_bmc, EngineSettings, PassReport, Policy, ReconcileContext, Trigger,
};
use bmcsync_operator::redfish::types::{
    bios_path, drive_path, last_segment, storage_path, system_path, volume_path, volumes_path,
    AGGREGATION_SOURCES, CONNECTION_METHODS, EVENT_SUBSCRIPTIONS, SYSTEMS,
};
use bmcsync_operator::redfish::{MockConnector, MockRedfish};
use bmcsync_operator::state::records::{
    BmcRecord, VolumeRecord, VolumeStatus, LABEL_SYSTEM_ID, OPERATOR_FINALIZER,
};
use bmcsync_operator::state::{ResourceStoreExt, SqliteStore};
use bmcsync_operator::task_monitor::TaskMonitor;
use rsa::rand_core::OsRng;
use rsa::RsaPrivateKey;
use serde_json::json;

pub const SYSTEM_ID: &str = "s1";
pub const CONTROLLER: &str = "ArrayControllers-0";
pub const ADDRESS: &str = "10.0.0.5";
pub const USERNAME: &str = "admin";
pub const PASSWORD: &str = "initial-pw";
pub const BMC: &str = "bmc-x";
pub const SOURCE_PATH: &str = "/redfish/v1/AggregationService/AggregationSources/src1";
pub const CONNECTION_METHOD: &str = "/redfish/v1/AggregationService/ConnectionMethods/cm1";

pub struct Harness {
    pub remote: Arc<MockRedfish>,
    pub store: Arc<SqliteStore>,
    pub connector: Arc<MockConnector>,
    pub cipher: Arc<PasswordCipher>,
    pub ctx: Arc<ReconcileContext>,
}

/// One key per test binary; generation is slow in debug builds.
pub fn cipher() -> PasswordCipher {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    let key = KEY.get_or_init(|| RsaPrivateKey::new(&mut OsRng, 1536).unwrap());
    PasswordCipher::from_private_key(key.clone())
}

pub fn harness(policy: Policy) -> Harness {
    let remote = Arc::new(MockRedfish::new());
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let connector = Arc::new(MockConnector::new());
    let cipher = Arc::new(cipher());

    let settings = EngineSettings {
        policy,
        settle_attempts: 2,
        settle_interval: Duration::from_millis(1),
        max_add_attempts: 2,
    };
    let ctx = Arc::new(ReconcileContext::new(
        remote.clone(),
        store.clone(),
        connector.clone(),
        cipher.clone(),
        TaskMonitor::new(3, Duration::from_millis(1)),
        settings,
    ));

    seed_service(&remote);

    Harness {
        remote,
        store,
        connector,
        cipher,
        ctx,
    }
}

/// Empty collections the engines list on every pass.
fn seed_service(remote: &MockRedfish) {
    remote.insert_collection(SYSTEMS, &[]);
    remote.insert_collection(AGGREGATION_SOURCES, &[]);
    remote.insert_collection(EVENT_SUBSCRIPTIONS, &[]);
    remote.add_member(
        CONNECTION_METHODS,
        CONNECTION_METHOD,
        json!({
            "@odata.id": CONNECTION_METHOD,
            "Id": "cm1",
            "ConnectionMethodType": "Redfish",
            "ConnectionMethodVariant": "iLO5",
        }),
    );
}

/// A powered-on HPE system with a manager and BIOS.
pub fn seed_system(remote: &MockRedfish, power_state: &str) {
    seed_system_as(remote, SYSTEM_ID, power_state);
}

pub fn manager_path(system_id: &str) -> String {
    format!("/redfish/v1/Managers/{system_id}-ilo")
}

pub fn seed_system_as(remote: &MockRedfish, system_id: &str, power_state: &str) {
    let path = system_path(system_id);
    let manager = manager_path(system_id);
    remote.add_member(
        SYSTEMS,
        &path,
        json!({
            "@odata.id": path,
            "Id": system_id,
            "HostName": format!("node-{system_id}"),
            "SerialNumber": format!("SN-{system_id}"),
            "Manufacturer": "HPE",
            "Model": "ProLiant DL380 Gen10",
            "PowerState": power_state,
            "Boot": {"BootOrder": ["Boot0001", "Boot0002"]},
            "Links": {"ManagedBy": [{"@odata.id": manager}]},
        }),
    );
    remote.insert(&manager, json!({"Id": format!("{system_id}-ilo"), "FirmwareVersion": "2.72"}));
    remote.insert(
        &bios_path(system_id),
        json!({
            "AttributeRegistry": "BiosAttributeRegistryU30.v1_2",
            "Attributes": {"BootMode": "Uefi", "ProcHyperthreading": "Enabled"},
        }),
    );
}

/// The aggregation source that exposes the seeded system.
pub fn seed_source(remote: &MockRedfish) {
    seed_source_as(remote, SOURCE_PATH, ADDRESS, SYSTEM_ID);
}

pub fn seed_source_as(remote: &MockRedfish, source_path: &str, address: &str, system_id: &str) {
    remote.add_member(
        AGGREGATION_SOURCES,
        source_path,
        json!({
            "@odata.id": source_path,
            "Id": last_segment(source_path),
            "HostName": address,
            "UserName": USERNAME,
            "Links": {
                "ConnectionMethod": {"@odata.id": CONNECTION_METHOD},
                "ResourcesAccessed": [{"@odata.id": system_path(system_id)}],
            },
        }),
    );
}

/// A volume on the seeded controller.
pub fn seed_volume(remote: &MockRedfish, volume_id: &str, raid_type: &str, drives: &[&str]) {
    let controller_path = format!("{}/{CONTROLLER}", storage_path(SYSTEM_ID));
    remote.add_member(
        &storage_path(SYSTEM_ID),
        &controller_path,
        json!({"Id": CONTROLLER}),
    );

    let drives: Vec<_> = drives
        .iter()
        .map(|d| json!({"@odata.id": drive_path(SYSTEM_ID, CONTROLLER, d)}))
        .collect();
    remote.add_member(
        &volumes_path(SYSTEM_ID, CONTROLLER),
        &volume_path(SYSTEM_ID, CONTROLLER, volume_id),
        json!({
            "Id": volume_id,
            "Name": format!("Logical Drive {volume_id}"),
            "RAIDType": raid_type,
            "CapacityBytes": 480_103_981_056u64,
            "Identifiers": [{
                "DurableName": format!("600508B1001C{volume_id:0>4}"),
                "DurableNameFormat": "NAA",
            }],
            "Links": {"Drives": drives},
        }),
    );
}

/// A BMC record already linked to the seeded system.
pub async fn adopted_bmc(h: &Harness) -> BmcRecord {
    adopted_bmc_as(h, BMC, ADDRESS, SYSTEM_ID, SOURCE_PATH).await
}

pub async fn adopted_bmc_as(
    h: &Harness,
    name: &str,
    address: &str,
    system_id: &str,
    source_path: &str,
) -> BmcRecord {
    let ciphertext = h.cipher.encrypt(PASSWORD).unwrap();
    let mut record = BmcRecord::new(name, address, USERNAME, &ciphertext);
    record.status.system_id = Some(system_id.to_string());
    record.status.aggregation_source = Some(source_path.to_string());
    record.status.vendor = Some("HPE".to_string());
    record.status.model = Some("ProLiant DL380 Gen10".to_string());
    record
        .meta
        .labels
        .insert(LABEL_SYSTEM_ID.to_string(), system_id.to_string());
    record.meta.finalizers.push(OPERATOR_FINALIZER.to_string());
    h.store.create(&record).await.unwrap();
    h.ctx.tracking.mark_record_created(&system_path(system_id));
    record
}

/// A local record for a volume that exists remotely.
pub async fn local_volume(
    h: &Harness,
    volume_id: &str,
    raid_type: &str,
    drives: &[&str],
) -> VolumeRecord {
    let name = format!("{BMC}.vol{volume_id}");
    let record = VolumeRecord::observed(
        &name,
        BMC,
        CONTROLLER,
        VolumeStatus {
            volume_id: volume_id.to_string(),
            raid_type: Some(raid_type.to_string()),
            drives: drives.iter().map(|d| d.to_string()).collect(),
            ..Default::default()
        },
    );
    h.store.create(&record).await.unwrap();
    record
}

pub async fn pass(h: &Harness, trigger: Trigger) -> PassReport {
    reconcile_bmc(&h.ctx, BMC, trigger).await.unwrap()
}

pub async fn load_bmc(h: &Harness) -> Option<BmcRecord> {
    h.store.get::<BmcRecord>(BMC).await.unwrap()
}
