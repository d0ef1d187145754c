//! BMC lifecycle: registration, adoption, discovery, removal and deletion.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bmcsync_operator::engine::{accommodate, fleet, Policy, Trigger};
use bmcsync_operator::redfish::types::{
    system_path, Bios, Boot, AGGREGATION_SOURCES, CONNECTION_METHODS, SYSTEMS,
};
use bmcsync_operator::redfish::{Method, MockReply};
use bmcsync_operator::state::records::{
    BiosRecord, BmcRecord, BootRecord, FirmwareRecord, VolumeRecord, LABEL_FIRMWARE_VERSION,
    LABEL_SERIAL_NUMBER, LABEL_SYSTEM_ID, OPERATOR_FINALIZER, PREVIOUS_PASSWORD_ANNOTATION,
};
use bmcsync_operator::state::{DeleteOutcome, ListFilter, ResourceStoreExt};
use bmcsync_operator::{Fleet, PollScheduler};
use common::*;
use rstest::rstest;
use serde_json::json;
use tokio::sync::watch;

fn unregistered_bmc(h: &Harness) -> BmcRecord {
    let ciphertext = h.cipher.encrypt(PASSWORD).unwrap();
    BmcRecord::new(BMC, ADDRESS, USERNAME, &ciphertext)
}

fn created_source() -> MockReply {
    MockReply::created(json!({
        "@odata.id": SOURCE_PATH,
        "HostName": ADDRESS,
        "UserName": USERNAME,
        "Links": {
            "ConnectionMethod": {"@odata.id": CONNECTION_METHOD},
            "ResourcesAccessed": [{"@odata.id": system_path(SYSTEM_ID)}],
        },
    }))
}

#[tokio::test]
async fn test_add_bmc_registers_and_adopts_system() {
    let h = harness(Policy::Accommodate);
    seed_system(&h.remote, "On");
    h.remote
        .script(Method::Post, AGGREGATION_SOURCES, [created_source()]);
    h.store.create(&unregistered_bmc(&h)).await.unwrap();

    let report = pass(&h, Trigger::Poll).await;
    assert!(report.is_clean(), "{:?}", report.errors);

    let posts = h.remote.calls_to(Method::Post, AGGREGATION_SOURCES);
    assert_eq!(posts.len(), 1);
    let body = posts[0].body.as_ref().unwrap();
    assert_eq!(body["HostName"], ADDRESS);
    assert_eq!(body["UserName"], USERNAME);
    assert_eq!(body["Password"], PASSWORD);
    assert_eq!(body["Links"]["ConnectionMethod"]["@odata.id"], CONNECTION_METHOD);

    let record = load_bmc(&h).await.unwrap();
    assert_eq!(record.system_id(), Some(SYSTEM_ID));
    assert_eq!(record.status.aggregation_source.as_deref(), Some(SOURCE_PATH));
    assert_eq!(record.status.serial_number.as_deref(), Some("SN-s1"));
    assert_eq!(record.status.firmware_version.as_deref(), Some("2.72"));
    assert_eq!(record.meta.label(LABEL_SYSTEM_ID), Some(SYSTEM_ID));
    assert_eq!(record.meta.label(LABEL_SERIAL_NUMBER), Some("SN-s1"));
    assert!(record.meta.has_finalizer(OPERATOR_FINALIZER));

    let bios: BiosRecord = h.store.get(BMC).await.unwrap().unwrap();
    assert_eq!(bios.attributes["BootMode"], "Uefi");
    let boot: BootRecord = h.store.get(BMC).await.unwrap().unwrap();
    assert_eq!(boot.boot.boot_order, vec!["Boot0001", "Boot0002"]);
    let firmware: FirmwareRecord = h.store.get(BMC).await.unwrap().unwrap();
    assert_eq!(firmware.meta.label(LABEL_FIRMWARE_VERSION), Some("2.72"));
}

#[tokio::test]
async fn test_add_bmc_reuses_existing_source() {
    let h = harness(Policy::Accommodate);
    seed_system(&h.remote, "On");
    seed_source(&h.remote);
    h.store.create(&unregistered_bmc(&h)).await.unwrap();

    let report = pass(&h, Trigger::Poll).await;
    assert!(report.is_clean(), "{:?}", report.errors);

    assert!(h.remote.calls_to(Method::Post, AGGREGATION_SOURCES).is_empty());
    assert_eq!(load_bmc(&h).await.unwrap().system_id(), Some(SYSTEM_ID));
}

#[tokio::test]
async fn test_add_bmc_removes_record_after_attempts_exhausted() {
    let h = harness(Policy::Accommodate);
    h.remote.insert_collection(CONNECTION_METHODS, &[]);
    h.store.create(&unregistered_bmc(&h)).await.unwrap();

    let first = pass(&h, Trigger::Poll).await;
    assert_eq!(first.errors.len(), 1);
    assert_eq!(first.errors[0].0, "add");
    assert!(!first.removed);
    assert!(load_bmc(&h).await.is_some());

    let second = pass(&h, Trigger::Poll).await;
    assert!(second.removed);
    assert!(load_bmc(&h).await.is_none());
}

#[tokio::test]
async fn test_add_bmc_unknown_connection_variant_fails() {
    let h = harness(Policy::Accommodate);
    let mut record = unregistered_bmc(&h);
    record.spec.connection_method_variant = Some("iDRAC9".to_string());
    h.store.create(&record).await.unwrap();

    let report = pass(&h, Trigger::Poll).await;
    assert!(report.errors[0].1.contains("iDRAC9"));
    assert!(h.remote.calls_to(Method::Post, AGGREGATION_SOURCES).is_empty());
}

#[tokio::test]
async fn test_delete_bmc_removes_source_and_dependents() {
    let h = harness(Policy::Accommodate);
    seed_system(&h.remote, "On");
    seed_source(&h.remote);
    seed_volume(&h.remote, "1", "RAID1", &["d1", "d2"]);
    adopted_bmc(&h).await;
    pass(&h, Trigger::Poll).await;
    assert!(h.store.get::<BiosRecord>(BMC).await.unwrap().is_some());

    let outcome = h.store.delete::<BmcRecord>(BMC).await.unwrap();
    assert_eq!(outcome, DeleteOutcome::Marked);

    let report = pass(&h, Trigger::Poll).await;
    assert!(report.removed);
    assert_eq!(h.remote.calls_to(Method::Delete, SOURCE_PATH).len(), 1);
    assert!(h.remote.resource(SOURCE_PATH).is_none());

    assert!(load_bmc(&h).await.is_none());
    assert!(h.store.get::<BiosRecord>(BMC).await.unwrap().is_none());
    assert!(h.store.get::<BootRecord>(BMC).await.unwrap().is_none());
    assert!(h.store.get::<FirmwareRecord>(BMC).await.unwrap().is_none());
    let volumes: Vec<VolumeRecord> = h.store.list(&ListFilter::all()).await.unwrap();
    assert!(volumes.is_empty());
}

#[tokio::test]
async fn test_remote_removed_drops_record_under_accommodate() {
    let h = harness(Policy::Accommodate);
    seed_system(&h.remote, "On");
    seed_source(&h.remote);
    adopted_bmc(&h).await;
    pass(&h, Trigger::Poll).await;

    h.remote.remove_member(SYSTEMS, &system_path(SYSTEM_ID));

    let report = pass(&h, Trigger::RemoteRemoved).await;
    assert!(report.removed);
    assert!(load_bmc(&h).await.is_none());
    assert!(h.store.get::<BiosRecord>(BMC).await.unwrap().is_none());
    assert!(h.remote.mutating_calls().is_empty());
}

#[tokio::test]
async fn test_remote_removed_ignored_while_system_present() {
    let h = harness(Policy::Accommodate);
    seed_system(&h.remote, "On");
    seed_source(&h.remote);
    adopted_bmc(&h).await;

    let report = pass(&h, Trigger::RemoteRemoved).await;
    assert!(!report.removed);
    assert_eq!(load_bmc(&h).await.unwrap().system_id(), Some(SYSTEM_ID));
}

#[rstest]
#[case::accommodate_unavailable(Policy::Accommodate, 503)]
#[case::accommodate_server_error(Policy::Accommodate, 500)]
#[case::revert_unauthorized(Policy::Revert, 401)]
#[case::revert_unavailable(Policy::Revert, 503)]
#[tokio::test]
async fn test_remote_removed_needs_not_found_confirmation(
    #[case] policy: Policy,
    #[case] status: u16,
) {
    let h = harness(policy);
    seed_system(&h.remote, "On");
    seed_source(&h.remote);
    adopted_bmc(&h).await;
    accommodate::store_bios(&h.ctx, BMC, Bios::default()).await.unwrap();
    accommodate::store_boot(&h.ctx, BMC, Boot::default()).await.unwrap();

    h.remote
        .script(Method::Get, &system_path(SYSTEM_ID), [MockReply::status(status)]);
    let report = pass(&h, Trigger::RemoteRemoved).await;

    assert!(!report.removed);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].0, "remote_removed");
    assert_eq!(load_bmc(&h).await.unwrap().system_id(), Some(SYSTEM_ID));
    assert!(h.store.get::<BiosRecord>(BMC).await.unwrap().is_some());
    assert!(h.store.get::<BootRecord>(BMC).await.unwrap().is_some());
    assert!(h.remote.mutating_calls().is_empty());

    // The next event sees the system again.
    let report = pass(&h, Trigger::RemoteRemoved).await;
    assert!(report.is_clean(), "{:?}", report.errors);
    assert_eq!(load_bmc(&h).await.unwrap().system_id(), Some(SYSTEM_ID));
}

#[tokio::test]
async fn test_remote_removed_detaches_record_under_revert() {
    let h = harness(Policy::Revert);
    h.remote.insert_collection(CONNECTION_METHODS, &[]);
    adopted_bmc(&h).await;

    let report = pass(&h, Trigger::RemoteRemoved).await;
    assert!(!report.removed);
    assert_eq!(report.errors[0].0, "remote_removed");

    let record = load_bmc(&h).await.unwrap();
    assert!(record.system_id().is_none());
    assert!(record.status.aggregation_source.is_none());
    assert!(record.meta.label(LABEL_SYSTEM_ID).is_none());
}

#[tokio::test]
async fn test_discover_creates_record_under_accommodate() {
    let h = harness(Policy::Accommodate);
    seed_system(&h.remote, "On");
    seed_source(&h.remote);

    let name = fleet::discover(&h.ctx, &system_path(SYSTEM_ID))
        .await
        .unwrap()
        .expect("record created");
    assert_eq!(name, "10-0-0-5");

    let record: BmcRecord = h.store.get(&name).await.unwrap().unwrap();
    assert_eq!(record.spec.address, ADDRESS);
    assert_eq!(record.spec.credentials.username, USERNAME);
    assert!(record.spec.credentials.password.is_empty());
    assert_eq!(record.system_id(), Some(SYSTEM_ID));
    assert!(record.meta.has_finalizer(OPERATOR_FINALIZER));

    // No stored password: rotation has nothing to do.
    let report = bmcsync_operator::engine::reconcile_bmc(&h.ctx, &name, Trigger::RemoteAdded)
        .await
        .unwrap();
    assert!(report.is_clean(), "{:?}", report.errors);
    let record: BmcRecord = h.store.get(&name).await.unwrap().unwrap();
    assert!(!record
        .meta
        .annotations
        .contains_key(PREVIOUS_PASSWORD_ANNOTATION));
}

#[tokio::test]
async fn test_discover_removes_unknown_source_under_revert() {
    let h = harness(Policy::Revert);
    seed_system(&h.remote, "On");
    seed_source(&h.remote);

    let name = fleet::discover(&h.ctx, SYSTEM_ID).await.unwrap();
    assert!(name.is_none());
    assert_eq!(h.remote.calls_to(Method::Delete, SOURCE_PATH).len(), 1);

    let records: Vec<BmcRecord> = h.store.list(&ListFilter::all()).await.unwrap();
    assert!(records.is_empty());
}

#[rstest]
#[case::accommodate(Policy::Accommodate)]
#[case::revert(Policy::Revert)]
#[tokio::test]
async fn test_discover_links_record_registered_by_address(#[case] policy: Policy) {
    let h = harness(policy);
    seed_system(&h.remote, "On");
    seed_source(&h.remote);
    h.store.create(&unregistered_bmc(&h)).await.unwrap();

    let name = fleet::discover(&h.ctx, SYSTEM_ID).await.unwrap();
    assert_eq!(name.as_deref(), Some(BMC));
    assert!(h.remote.mutating_calls().is_empty());
}

#[tokio::test]
async fn test_second_pass_is_a_no_op() {
    let h = harness(Policy::Accommodate);
    seed_system(&h.remote, "On");
    seed_source(&h.remote);
    seed_volume(&h.remote, "1", "RAID1", &["d1", "d2"]);
    adopted_bmc(&h).await;

    let first = pass(&h, Trigger::Poll).await;
    assert!(first.is_clean(), "{:?}", first.errors);
    let record = load_bmc(&h).await.unwrap();
    assert!(record
        .meta
        .annotations
        .contains_key(PREVIOUS_PASSWORD_ANNOTATION));

    let mutations = h.store.mutation_count();
    let second = pass(&h, Trigger::Poll).await;
    assert!(second.is_clean(), "{:?}", second.errors);
    assert_eq!(h.store.mutation_count(), mutations);
    assert!(h.remote.mutating_calls().is_empty());
}

#[tokio::test]
async fn test_tick_discovers_new_system_and_passes_fleet() {
    let h = harness(Policy::Accommodate);
    let nodes = [
        ("s1", "10.0.0.5", "bmc-a"),
        ("s2", "10.0.0.6", "bmc-b"),
        ("s3", "10.0.0.7", ""),
    ];
    for (system_id, address, _) in nodes {
        seed_system_as(&h.remote, system_id, "On");
        let source = format!("{AGGREGATION_SOURCES}/src-{system_id}");
        seed_source_as(&h.remote, &source, address, system_id);
    }
    for (system_id, address, name) in &nodes[..2] {
        let source = format!("{AGGREGATION_SOURCES}/src-{system_id}");
        adopted_bmc_as(&h, name, address, system_id, &source).await;
    }

    let fleet = Arc::new(Fleet::new(h.ctx.clone()));
    let scheduler = PollScheduler::new(fleet.clone(), Duration::from_secs(60));
    let summary = scheduler.tick().await;

    assert_eq!(summary.systems, 3);
    assert_eq!(summary.discovered, 1);
    assert_eq!(summary.passes, 3);
    assert_eq!(summary.failed, 0);

    let records: Vec<BmcRecord> = h.store.list(&ListFilter::all()).await.unwrap();
    let names: Vec<&str> = records.iter().map(|r| r.meta.name.as_str()).collect();
    assert_eq!(names, vec!["10-0-0-7", "bmc-a", "bmc-b"]);

    let discovered = &records[0];
    assert_eq!(discovered.system_id(), Some("s3"));
    assert_eq!(discovered.status.serial_number.as_deref(), Some("SN-s3"));
    assert!(discovered.meta.has_finalizer(OPERATOR_FINALIZER));
    assert_eq!(fleet.running().await, 3);

    // A system that disappears is dropped on the next tick.
    h.remote.remove_member(SYSTEMS, &system_path("s2"));
    let summary = scheduler.tick().await;
    assert_eq!(summary.systems, 2);
    assert!(h.store.get::<BmcRecord>("bmc-b").await.unwrap().is_none());

    fleet.stop_all().await;
}

#[tokio::test]
async fn test_scheduler_with_zero_interval_runs_until_shutdown() {
    let h = harness(Policy::Accommodate);
    seed_system(&h.remote, "On");
    seed_source(&h.remote);
    adopted_bmc(&h).await;

    let fleet = Arc::new(Fleet::new(h.ctx.clone()));
    let scheduler = PollScheduler::new(fleet.clone(), Duration::ZERO);
    assert_eq!(scheduler.interval(), Duration::from_secs(60));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(async move { scheduler.run(shutdown_rx).await });

    // The first tick fires immediately.
    for _ in 0..100 {
        if fleet.running().await == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(fleet.running().await, 1);

    shutdown_tx.send(true).unwrap();
    task.await.unwrap();
    fleet.stop_all().await;
}
