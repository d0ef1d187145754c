//! Process-local tracking of in-flight work.
//!
//! Nothing here is persisted; it is rebuilt from remote and local state on
//! restart. Every method is one short critical section, so check-and-set
//! operations (`try_*`) are atomic with respect to concurrent passes.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Presence of a remote resource as seen by the poll scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourcePresence {
    pub is_added: bool,
    pub is_deleted: bool,
    pub is_record_created: bool,
}

/// Operation already dispatched for a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeOp {
    Creating,
    Deleting,
}

/// Identifies a volume on one controller of one BMC.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolumeKey {
    pub bmc: String,
    pub controller: String,
    pub volume: String,
}

impl VolumeKey {
    pub fn new(bmc: &str, controller: &str, volume: &str) -> Self {
        Self {
            bmc: bmc.to_string(),
            controller: controller.to_string(),
            volume: volume.to_string(),
        }
    }

    /// Key for a creation whose remote id is not assigned yet.
    pub fn pending(bmc: &str, controller: &str, record: &str) -> Self {
        Self::new(bmc, controller, &format!("pending:{record}"))
    }
}

/// A volume creation accepted remotely whose id is not yet resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingVolume {
    pub record: String,
    pub controller: String,
    pub raid_type: String,
    pub drives: BTreeSet<String>,
}

#[derive(Default)]
struct TrackingState {
    presence: HashMap<String, ResourcePresence>,
    volume_ops: HashMap<VolumeKey, VolumeOp>,
    reset_pending: HashSet<String>,
    firmware_in_flight: HashSet<String>,
    pending_volumes: HashMap<String, Vec<PendingVolume>>,
}

/// Shared tracking state for all reconciliation passes.
#[derive(Default)]
pub struct Tracking {
    state: Mutex<TrackingState>,
}

impl Tracking {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TrackingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -------------------------------------------------------------------------
    // Presence
    // -------------------------------------------------------------------------

    pub fn presence(&self, path: &str) -> ResourcePresence {
        self.lock().presence.get(path).copied().unwrap_or_default()
    }

    /// Record that `path` is present remotely. Returns true while the
    /// resource still awaits a local record.
    pub fn observe_present(&self, path: &str) -> bool {
        let mut state = self.lock();
        let entry = state.presence.entry(path.to_string()).or_default();
        entry.is_deleted = false;
        entry.is_added = !entry.is_record_created;
        entry.is_added
    }

    /// Record that `path` is absent remotely. Returns true when a local
    /// record exists for it.
    pub fn observe_absent(&self, path: &str) -> bool {
        let mut state = self.lock();
        let entry = state.presence.entry(path.to_string()).or_default();
        entry.is_added = false;
        entry.is_deleted = entry.is_record_created;
        entry.is_deleted
    }

    pub fn mark_record_created(&self, path: &str) {
        let mut state = self.lock();
        let entry = state.presence.entry(path.to_string()).or_default();
        entry.is_record_created = true;
        entry.is_added = false;
    }

    /// Forget `path` after its deletion was confirmed.
    pub fn confirm_deleted(&self, path: &str) {
        self.lock().presence.remove(path);
    }

    // -------------------------------------------------------------------------
    // Volume operations
    // -------------------------------------------------------------------------

    /// Claim `key` for `op`; false when any operation is already in flight.
    pub fn try_begin_volume_op(&self, key: &VolumeKey, op: VolumeOp) -> bool {
        let mut state = self.lock();
        if state.volume_ops.contains_key(key) {
            return false;
        }
        state.volume_ops.insert(key.clone(), op);
        true
    }

    pub fn finish_volume_op(&self, key: &VolumeKey) {
        self.lock().volume_ops.remove(key);
    }

    pub fn volume_op(&self, key: &VolumeKey) -> Option<VolumeOp> {
        self.lock().volume_ops.get(key).copied()
    }

    // -------------------------------------------------------------------------
    // Reset / firmware
    // -------------------------------------------------------------------------

    /// Claim the reset gate for `system_id`; false when already held.
    pub fn try_mark_reset_pending(&self, system_id: &str) -> bool {
        self.lock().reset_pending.insert(system_id.to_string())
    }

    pub fn clear_reset_pending(&self, system_id: &str) {
        self.lock().reset_pending.remove(system_id);
    }

    pub fn is_reset_pending(&self, system_id: &str) -> bool {
        self.lock().reset_pending.contains(system_id)
    }

    pub fn try_begin_firmware(&self, bmc: &str) -> bool {
        self.lock().firmware_in_flight.insert(bmc.to_string())
    }

    pub fn finish_firmware(&self, bmc: &str) {
        self.lock().firmware_in_flight.remove(bmc);
    }

    pub fn is_firmware_in_flight(&self, bmc: &str) -> bool {
        self.lock().firmware_in_flight.contains(bmc)
    }

    // -------------------------------------------------------------------------
    // Pending volume creations
    // -------------------------------------------------------------------------

    pub fn add_pending_volume(&self, bmc: &str, pending: PendingVolume) {
        let mut state = self.lock();
        let list = state.pending_volumes.entry(bmc.to_string()).or_default();
        if !list.iter().any(|p| p.record == pending.record) {
            list.push(pending);
        }
    }

    pub fn pending_volumes(&self, bmc: &str) -> Vec<PendingVolume> {
        self.lock()
            .pending_volumes
            .get(bmc)
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_pending_volumes(&self, bmc: &str) -> bool {
        self.lock()
            .pending_volumes
            .get(bmc)
            .is_some_and(|list| !list.is_empty())
    }

    pub fn has_pending_on_controller(&self, bmc: &str, controller: &str) -> bool {
        self.lock()
            .pending_volumes
            .get(bmc)
            .is_some_and(|list| list.iter().any(|p| p.controller == controller))
    }

    pub fn remove_pending_volume(&self, bmc: &str, record: &str) {
        let mut state = self.lock();
        if let Some(list) = state.pending_volumes.get_mut(bmc) {
            list.retain(|p| p.record != record);
            if list.is_empty() {
                state.pending_volumes.remove(bmc);
            }
        }
    }

    /// Drop everything tracked for a BMC whose record is gone.
    pub fn forget_bmc(&self, bmc: &str, system_id: Option<&str>) {
        let mut state = self.lock();
        state.pending_volumes.remove(bmc);
        state.firmware_in_flight.remove(bmc);
        state.volume_ops.retain(|key, _| key.bmc != bmc);
        if let Some(system_id) = system_id {
            state.reset_pending.remove(system_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presence_lifecycle() {
        let tracking = Tracking::new();
        let path = "/redfish/v1/Systems/s1";

        assert!(tracking.observe_present(path));
        assert!(tracking.presence(path).is_added);

        tracking.mark_record_created(path);
        assert!(!tracking.observe_present(path));
        assert!(tracking.presence(path).is_record_created);

        assert!(tracking.observe_absent(path));
        let presence = tracking.presence(path);
        assert!(presence.is_deleted && !presence.is_added);

        tracking.confirm_deleted(path);
        assert_eq!(tracking.presence(path), ResourcePresence::default());
    }

    #[test]
    fn test_absent_without_record_is_not_deleted() {
        let tracking = Tracking::new();
        assert!(!tracking.observe_absent("/redfish/v1/Systems/s9"));
    }

    #[test]
    fn test_volume_op_check_and_set() {
        let tracking = Tracking::new();
        let key = VolumeKey::new("x", "ArrayControllers-0", "3");

        assert!(tracking.try_begin_volume_op(&key, VolumeOp::Deleting));
        assert!(!tracking.try_begin_volume_op(&key, VolumeOp::Creating));
        assert_eq!(tracking.volume_op(&key), Some(VolumeOp::Deleting));

        tracking.finish_volume_op(&key);
        assert!(tracking.try_begin_volume_op(&key, VolumeOp::Creating));
    }

    #[test]
    fn test_reset_and_firmware_gates() {
        let tracking = Tracking::new();
        assert!(tracking.try_mark_reset_pending("s1"));
        assert!(!tracking.try_mark_reset_pending("s1"));
        tracking.clear_reset_pending("s1");
        assert!(!tracking.is_reset_pending("s1"));

        assert!(tracking.try_begin_firmware("x"));
        assert!(!tracking.try_begin_firmware("x"));
        tracking.finish_firmware("x");
        assert!(!tracking.is_firmware_in_flight("x"));
    }

    #[test]
    fn test_pending_volumes_and_forget() {
        let tracking = Tracking::new();
        let pending = PendingVolume {
            record: "x.data".to_string(),
            controller: "ArrayControllers-0".to_string(),
            raid_type: "RAID1".to_string(),
            drives: ["0", "1"].iter().map(|s| s.to_string()).collect(),
        };
        tracking.add_pending_volume("x", pending.clone());
        tracking.add_pending_volume("x", pending);
        assert_eq!(tracking.pending_volumes("x").len(), 1);
        assert!(tracking.has_pending_on_controller("x", "ArrayControllers-0"));
        assert!(!tracking.has_pending_on_controller("x", "ArrayControllers-1"));

        tracking.try_begin_volume_op(&VolumeKey::pending("x", "ArrayControllers-0", "x.data"), VolumeOp::Creating);
        tracking.forget_bmc("x", None);
        assert!(!tracking.has_pending_volumes("x"));
        assert!(tracking
            .volume_op(&VolumeKey::pending("x", "ArrayControllers-0", "x.data"))
            .is_none());
    }
}
