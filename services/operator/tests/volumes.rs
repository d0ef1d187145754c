//! Volume reconciliation against the in-memory aggregation service.

mod common;

use bmcsync_operator::engine::{Policy, Trigger};
use bmcsync_operator::redfish::types::{reset_path, volume_path, volumes_path};
use bmcsync_operator::redfish::{Method, MockReply};
use bmcsync_operator::state::records::{
    VolumeRecord, VolumeSpec, LABEL_BMC, OPERATOR_FINALIZER,
};
use bmcsync_operator::state::{DeleteOutcome, ListFilter, ResourceStoreExt, VolumeKey, VolumeOp};
use common::*;
use serde_json::json;

async fn volumes(h: &Harness) -> Vec<VolumeRecord> {
    h.store
        .list(&ListFilter::by_label(LABEL_BMC, BMC))
        .await
        .unwrap()
}

fn adopted_system(policy: Policy) -> Harness {
    let h = harness(policy);
    seed_system(&h.remote, "On");
    seed_source(&h.remote);
    h
}

#[tokio::test]
async fn test_accommodate_releases_volume_gone_remotely() {
    let h = adopted_system(Policy::Accommodate);
    seed_volume(&h.remote, "1", "RAID1", &["d1", "d2"]);
    adopted_bmc(&h).await;
    local_volume(&h, "1", "RAID1", &["d1", "d2"]).await;
    local_volume(&h, "2", "RAID0", &["d3"]).await;

    let report = pass(&h, Trigger::Poll).await;
    assert!(report.is_clean(), "{:?}", report.errors);

    let remaining = volumes(&h).await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].volume_id(), Some("1"));

    let record = load_bmc(&h).await.unwrap();
    assert_eq!(record.status.storage[CONTROLLER], vec!["1".to_string()]);
    assert!(h.remote.mutating_calls().is_empty());
}

#[tokio::test]
async fn test_accommodate_adopts_only_the_new_remote_volume() {
    let h = adopted_system(Policy::Accommodate);
    seed_volume(&h.remote, "1", "RAID1", &["d1", "d2"]);
    seed_volume(&h.remote, "2", "RAID0", &["d3"]);
    adopted_bmc(&h).await;
    local_volume(&h, "1", "RAID1", &["d1", "d2"]).await;
    local_volume(&h, "2", "RAID0", &["d3"]).await;

    // Settle dependents and the status once, with both sides at {1, 2}.
    let report = pass(&h, Trigger::Poll).await;
    assert!(report.is_clean(), "{:?}", report.errors);
    let before = volumes(&h).await;
    assert_eq!(before.len(), 2);
    let mutations = h.store.mutation_count();

    seed_volume(&h.remote, "3", "RAID5", &["d4", "d5", "d6"]);
    let report = pass(&h, Trigger::Poll).await;
    assert!(report.is_clean(), "{:?}", report.errors);

    let after = volumes(&h).await;
    assert_eq!(after.len(), 3);
    for existing in &before {
        let current = after
            .iter()
            .find(|v| v.meta.name == existing.meta.name)
            .expect("existing volume kept");
        assert_eq!(current, existing);
    }

    let adopted: Vec<_> = after
        .iter()
        .filter(|v| v.volume_id() == Some("3"))
        .collect();
    assert_eq!(adopted.len(), 1);
    let adopted = adopted[0];
    assert_eq!(adopted.meta.name, "bmc-x.arraycontrollers-0_vol3");
    assert!(adopted.meta.has_finalizer(OPERATOR_FINALIZER));

    let status = adopted.status.as_ref().unwrap();
    assert_eq!(status.raid_type.as_deref(), Some("RAID5"));
    assert_eq!(status.drives, vec!["d4", "d5", "d6"]);
    assert_eq!(status.durable_name_format.as_deref(), Some("NAA"));

    // The new record plus the BMC's storage summary.
    assert_eq!(h.store.mutation_count(), mutations + 2);
    let record = load_bmc(&h).await.unwrap();
    assert_eq!(
        record.status.storage[CONTROLLER],
        vec!["1".to_string(), "2".to_string(), "3".to_string()]
    );
    assert!(h.remote.mutating_calls().is_empty());
}

#[tokio::test]
async fn test_accommodate_adopts_remaining_volumes_after_one_fails() {
    let h = adopted_system(Policy::Accommodate);
    seed_volume(&h.remote, "2", "RAID0", &["d1"]);
    seed_volume(&h.remote, "3", "RAID1", &["d2", "d3"]);
    adopted_bmc(&h).await;
    h.remote.script(
        Method::Get,
        &volume_path(SYSTEM_ID, CONTROLLER, "2"),
        [MockReply::status(500)],
    );

    let report = pass(&h, Trigger::Poll).await;
    assert!(report.errors.iter().any(|(step, _)| *step == "volumes"));

    let adopted = volumes(&h).await;
    assert_eq!(adopted.len(), 1);
    assert_eq!(adopted[0].volume_id(), Some("3"));

    // Volume 2 is picked up once the service answers again.
    let report = pass(&h, Trigger::Poll).await;
    assert!(report.is_clean(), "{:?}", report.errors);
    assert_eq!(volumes(&h).await.len(), 2);
}

#[tokio::test]
async fn test_revert_deletes_remaining_volumes_after_one_fails() {
    let h = adopted_system(Policy::Revert);
    seed_volume(&h.remote, "2", "RAID0", &["d1"]);
    seed_volume(&h.remote, "3", "RAID1", &["d2", "d3"]);
    adopted_bmc(&h).await;
    let blocked = volume_path(SYSTEM_ID, CONTROLLER, "2");
    h.remote
        .script(Method::Delete, &blocked, [MockReply::status(409)]);

    let report = pass(&h, Trigger::Poll).await;
    assert!(report.errors.iter().any(|(step, _)| *step == "volumes"));

    let other = volume_path(SYSTEM_ID, CONTROLLER, "3");
    assert_eq!(h.remote.calls_to(Method::Delete, &other).len(), 1);
    assert!(h.remote.resource(&other).is_none());
    assert!(h.remote.resource(&blocked).is_some());
    assert!(h
        .ctx
        .tracking
        .volume_op(&VolumeKey::new(BMC, CONTROLLER, "2"))
        .is_none());
}

#[tokio::test]
async fn test_revert_deletes_unknown_remote_volume() {
    let h = adopted_system(Policy::Revert);
    seed_volume(&h.remote, "1", "RAID1", &["d1", "d2"]);
    seed_volume(&h.remote, "2", "RAID0", &["d3"]);
    adopted_bmc(&h).await;
    local_volume(&h, "1", "RAID1", &["d1", "d2"]).await;

    let report = pass(&h, Trigger::Poll).await;
    assert!(report.is_clean(), "{:?}", report.errors);

    let unknown = volume_path(SYSTEM_ID, CONTROLLER, "2");
    assert_eq!(h.remote.calls_to(Method::Delete, &unknown).len(), 1);
    assert!(h.remote.resource(&unknown).is_none());
    assert!(h
        .remote
        .calls_to(Method::Post, &reset_path(SYSTEM_ID))
        .is_empty());
    assert_eq!(volumes(&h).await.len(), 1);
}

#[tokio::test]
async fn test_revert_skips_volume_with_operation_in_flight() {
    let h = adopted_system(Policy::Revert);
    seed_volume(&h.remote, "2", "RAID0", &["d3"]);
    adopted_bmc(&h).await;

    let key = VolumeKey::new(BMC, CONTROLLER, "2");
    assert!(h.ctx.tracking.try_begin_volume_op(&key, VolumeOp::Deleting));

    pass(&h, Trigger::Poll).await;

    assert!(h
        .remote
        .calls_to(Method::Delete, &volume_path(SYSTEM_ID, CONTROLLER, "2"))
        .is_empty());
}

#[tokio::test]
async fn test_revert_recreates_missing_volume() {
    let h = adopted_system(Policy::Revert);
    seed_volume(&h.remote, "1", "RAID1", &["d1", "d2"]);
    // Volume 3 is what the controller assigns once the reset applies the
    // creation; the first listing happens before that.
    seed_volume(&h.remote, "3", "RAID1", &["d3", "d4"]);
    h.remote.script(
        Method::Get,
        &volumes_path(SYSTEM_ID, CONTROLLER),
        [MockReply::ok(json!({
            "Members": [{"@odata.id": volume_path(SYSTEM_ID, CONTROLLER, "1")}]
        }))],
    );
    adopted_bmc(&h).await;
    local_volume(&h, "1", "RAID1", &["d1", "d2"]).await;
    let missing = local_volume(&h, "2", "RAID1", &["d3", "d4"]).await;

    let report = pass(&h, Trigger::Poll).await;
    assert!(report.is_clean(), "{:?}", report.errors);

    let creates = h
        .remote
        .calls_to(Method::Post, &volumes_path(SYSTEM_ID, CONTROLLER));
    assert_eq!(creates.len(), 1);
    let body = creates[0].body.as_ref().unwrap();
    assert_eq!(body["RAIDType"], "RAID1");
    assert_eq!(body["@Redfish.OperationApplyTime"], "OnReset");
    assert_eq!(body["Links"]["Drives"].as_array().unwrap().len(), 2);

    let resets = h.remote.calls_to(Method::Post, &reset_path(SYSTEM_ID));
    assert_eq!(resets.len(), 1);
    assert_eq!(resets[0].body.as_ref().unwrap()["ResetType"], "ForceRestart");

    let resolved: VolumeRecord = h.store.get(&missing.meta.name).await.unwrap().unwrap();
    assert_eq!(resolved.volume_id(), Some("3"));
    assert!(resolved.spec.is_none());
    assert!(!h.ctx.tracking.has_pending_volumes(BMC));
    assert!(!load_bmc(&h).await.unwrap().status.reset_pending);
}

#[tokio::test]
async fn test_desired_volume_is_created_and_resolved() {
    let h = adopted_system(Policy::Accommodate);
    seed_volume(&h.remote, "1", "RAID1", &["d1", "d2"]);
    seed_volume(&h.remote, "4", "RAID5", &["d3", "d4", "d5"]);
    adopted_bmc(&h).await;
    local_volume(&h, "1", "RAID1", &["d1", "d2"]).await;

    let desired = VolumeRecord::desired(
        "bmc-x.data",
        BMC,
        CONTROLLER,
        VolumeSpec {
            raid_type: "RAID5".to_string(),
            drives: vec!["d5".to_string(), "d3".to_string(), "d4".to_string()],
            display_name: Some("data".to_string()),
        },
    );
    h.store.create(&desired).await.unwrap();

    let report = pass(&h, Trigger::Poll).await;
    assert!(report.is_clean(), "{:?}", report.errors);

    let creates = h
        .remote
        .calls_to(Method::Post, &volumes_path(SYSTEM_ID, CONTROLLER));
    assert_eq!(creates.len(), 1);
    assert_eq!(creates[0].body.as_ref().unwrap()["Name"], "data");

    let resolved: VolumeRecord = h.store.get("bmc-x.data").await.unwrap().unwrap();
    assert_eq!(resolved.volume_id(), Some("4"));
    assert!(resolved.meta.has_finalizer(OPERATOR_FINALIZER));
    // Resolved volume is not adopted a second time.
    assert_eq!(volumes(&h).await.len(), 2);
}

#[tokio::test]
async fn test_deletion_marked_volume_is_deleted_remotely() {
    let h = adopted_system(Policy::Accommodate);
    seed_volume(&h.remote, "1", "RAID1", &["d1", "d2"]);
    seed_volume(&h.remote, "2", "RAID0", &["d3"]);
    adopted_bmc(&h).await;
    local_volume(&h, "1", "RAID1", &["d1", "d2"]).await;
    let doomed = local_volume(&h, "2", "RAID0", &["d3"]).await;

    let outcome = h
        .store
        .delete::<VolumeRecord>(&doomed.meta.name)
        .await
        .unwrap();
    assert_eq!(outcome, DeleteOutcome::Marked);

    let report = pass(&h, Trigger::Poll).await;
    assert!(report.is_clean(), "{:?}", report.errors);

    let path = volume_path(SYSTEM_ID, CONTROLLER, "2");
    assert_eq!(h.remote.calls_to(Method::Delete, &path).len(), 1);
    assert!(h.remote.resource(&path).is_none());
    assert!(h
        .store
        .get::<VolumeRecord>(&doomed.meta.name)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_failed_remote_delete_keeps_record() {
    let h = adopted_system(Policy::Accommodate);
    seed_volume(&h.remote, "2", "RAID0", &["d3"]);
    adopted_bmc(&h).await;
    let doomed = local_volume(&h, "2", "RAID0", &["d3"]).await;
    h.store
        .delete::<VolumeRecord>(&doomed.meta.name)
        .await
        .unwrap();

    let path = volume_path(SYSTEM_ID, CONTROLLER, "2");
    h.remote.script(Method::Delete, &path, [MockReply::status(409)]);

    let report = pass(&h, Trigger::Poll).await;
    assert!(report.errors.iter().any(|(step, _)| *step == "volume_intent"));

    let kept: VolumeRecord = h.store.get(&doomed.meta.name).await.unwrap().unwrap();
    assert!(kept.meta.is_deleting());
    assert!(h
        .ctx
        .tracking
        .volume_op(&VolumeKey::new(BMC, CONTROLLER, "2"))
        .is_none());
}
