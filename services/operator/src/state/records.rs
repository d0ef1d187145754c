//! Record types held in the resource store.
//!
//! Every record carries a [`RecordMeta`] (name, labels, annotations,
//! finalizers, deletion marker) plus a kind-specific spec and status.
//! Dependent records (Bios, Boot, Firmware, Volume) are owned by exactly one
//! `BmcRecord` through the `bmc` label.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::redfish::types::Boot;
use crate::reset::PowerState;

/// Finalizer placed on every record the operator manages remotely.
pub const OPERATOR_FINALIZER: &str = "bmcsync.io/remote-cleanup";

/// Annotation holding the ciphertext of the last known-good password.
pub const PREVIOUS_PASSWORD_ANNOTATION: &str = "bmcsync.io/previous-password";

pub const LABEL_SERIAL_NUMBER: &str = "serial-number";
pub const LABEL_BMC_ADDRESS: &str = "bmc-address";
pub const LABEL_SYSTEM_ID: &str = "system-id";
pub const LABEL_SUBSCRIPTION_ID: &str = "subscription-id";
pub const LABEL_BMC: &str = "bmc";
pub const LABEL_STORAGE_CONTROLLER: &str = "storage-controller";
pub const LABEL_FIRMWARE_VERSION: &str = "firmware-version";

/// Record kinds, used as the store's partition key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKind {
    Bmc,
    Volume,
    Bios,
    Boot,
    Firmware,
    EventSubscription,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bmc => "bmc",
            Self::Volume => "volume",
            Self::Bios => "bios",
            Self::Boot => "boot",
            Self::Firmware => "firmware",
            Self::EventSubscription => "event-subscription",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata common to every record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordMeta {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub finalizers: Vec<String>,
    /// Set when deletion was requested while finalizers were present.
    #[serde(default)]
    pub deletion_requested_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl RecordMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_label(mut self, key: &str, value: impl Into<String>) -> Self {
        self.labels.insert(key.to_string(), value.into());
        self
    }

    pub fn with_finalizer(mut self, finalizer: &str) -> Self {
        if !self.has_finalizer(finalizer) {
            self.finalizers.push(finalizer.to_string());
        }
        self
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_requested_at.is_some()
    }
}

/// A typed record stored as a JSON document.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: RecordKind;

    fn meta(&self) -> &RecordMeta;

    fn meta_mut(&mut self) -> &mut RecordMeta;

    /// Replace this record's status with `other`'s.
    fn take_status_from(&mut self, other: &Self);

    fn name(&self) -> &str {
        &self.meta().name
    }
}

macro_rules! impl_record {
    ($ty:ty, $kind:expr) => {
        impl Record for $ty {
            const KIND: RecordKind = $kind;

            fn meta(&self) -> &RecordMeta {
                &self.meta
            }

            fn meta_mut(&mut self) -> &mut RecordMeta {
                &mut self.meta
            }

            fn take_status_from(&mut self, other: &Self) {
                self.status = other.status.clone();
            }
        }
    };
}

// =============================================================================
// BMC
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BmcRecord {
    pub meta: RecordMeta,
    pub spec: BmcSpec,
    #[serde(default)]
    pub status: BmcStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BmcSpec {
    /// Network address of the BMC (host or host:port).
    pub address: String,
    pub credentials: Credentials,
    /// Preferred aggregation connection method variant, e.g. `iLO5`.
    #[serde(default)]
    pub connection_method_variant: Option<String>,
    /// One-shot power request, cleared once executed or rejected.
    #[serde(default)]
    pub power: Option<PowerRequest>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    /// Base64 RSA-OAEP ciphertext of the desired password.
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerRequest {
    pub power_state: PowerState,
    pub reset_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BmcStatus {
    #[serde(default)]
    pub system_id: Option<String>,
    #[serde(default)]
    pub aggregation_source: Option<String>,
    #[serde(default)]
    pub host_name: Option<String>,
    #[serde(default)]
    pub serial_number: Option<String>,
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub power_state: Option<PowerState>,
    #[serde(default)]
    pub firmware_version: Option<String>,
    #[serde(default)]
    pub bios_attribute_registry: Option<String>,
    /// Volume ids per storage controller as last seen remotely.
    #[serde(default)]
    pub storage: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub reset_pending: bool,
    #[serde(default)]
    pub last_reset_result: Option<String>,
}

impl BmcRecord {
    pub fn new(name: &str, address: &str, username: &str, password_ciphertext: &str) -> Self {
        Self {
            meta: RecordMeta::new(name).with_label(LABEL_BMC_ADDRESS, address),
            spec: BmcSpec {
                address: address.to_string(),
                credentials: Credentials {
                    username: username.to_string(),
                    password: password_ciphertext.to_string(),
                },
                connection_method_variant: None,
                power: None,
            },
            status: BmcStatus::default(),
        }
    }

    pub fn system_id(&self) -> Option<&str> {
        self.status.system_id.as_deref()
    }
}

impl_record!(BmcRecord, RecordKind::Bmc);

// =============================================================================
// Volume
// =============================================================================

/// A storage volume on one controller of one BMC.
///
/// Either `spec` (desired, not yet created remotely) or `status` (assigned
/// remotely) is set, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub meta: RecordMeta,
    pub bmc: String,
    pub storage_controller: String,
    #[serde(default)]
    pub spec: Option<VolumeSpec>,
    #[serde(default)]
    pub status: Option<VolumeStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub raid_type: String,
    pub drives: Vec<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeStatus {
    pub volume_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub raid_type: Option<String>,
    #[serde(default)]
    pub drives: Vec<String>,
    #[serde(default)]
    pub capacity_bytes: Option<u64>,
    #[serde(default)]
    pub durable_name: Option<String>,
    #[serde(default)]
    pub durable_name_format: Option<String>,
}

impl VolumeRecord {
    /// A volume the user wants created.
    pub fn desired(name: &str, bmc: &str, controller: &str, spec: VolumeSpec) -> Self {
        Self {
            meta: Self::owned_meta(name, bmc, controller),
            bmc: bmc.to_string(),
            storage_controller: controller.to_string(),
            spec: Some(spec),
            status: None,
        }
    }

    /// A volume that exists remotely.
    pub fn observed(name: &str, bmc: &str, controller: &str, status: VolumeStatus) -> Self {
        Self {
            meta: Self::owned_meta(name, bmc, controller).with_finalizer(OPERATOR_FINALIZER),
            bmc: bmc.to_string(),
            storage_controller: controller.to_string(),
            spec: None,
            status: Some(status),
        }
    }

    fn owned_meta(name: &str, bmc: &str, controller: &str) -> RecordMeta {
        RecordMeta::new(name)
            .with_label(LABEL_BMC, bmc)
            .with_label(LABEL_STORAGE_CONTROLLER, controller)
    }

    pub fn volume_id(&self) -> Option<&str> {
        self.status.as_ref().map(|s| s.volume_id.as_str())
    }
}

impl_record!(VolumeRecord, RecordKind::Volume);

/// Record name for a volume, derived from its remote display name when it
/// has one and from `<controller>_vol<id>` otherwise.
pub fn volume_record_name(
    bmc: &str,
    controller: &str,
    volume_id: &str,
    display_name: Option<&str>,
) -> String {
    let base = display_name
        .map(sanitize_name)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| sanitize_name(&format!("{controller}_vol{volume_id}")));
    format!("{bmc}.{base}")
}

/// Lowercase, keeping `[a-z0-9-_]` and mapping everything else to `-`.
pub fn sanitize_name(raw: &str) -> String {
    let mapped: String = raw
        .trim()
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    mapped.trim_matches('-').to_string()
}

// =============================================================================
// BIOS / Boot / Firmware
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiosRecord {
    pub meta: RecordMeta,
    /// Attributes the operator holds for this BMC.
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    #[serde(default)]
    pub status: BiosStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BiosStatus {
    #[serde(default)]
    pub attribute_registry: Option<String>,
    #[serde(default)]
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl_record!(BiosRecord, RecordKind::Bios);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootRecord {
    pub meta: RecordMeta,
    #[serde(default)]
    pub boot: Boot,
    #[serde(default)]
    pub status: BootStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BootStatus {
    #[serde(default)]
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl_record!(BootRecord, RecordKind::Boot);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirmwareRecord {
    pub meta: RecordMeta,
    #[serde(default)]
    pub spec: FirmwareSpec,
    #[serde(default)]
    pub status: FirmwareStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FirmwareSpec {
    /// Image to push when reverting.
    #[serde(default)]
    pub image: Option<FirmwareImage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirmwareImage {
    pub uri: String,
    pub version: String,
    #[serde(default)]
    pub transfer_protocol: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FirmwareStatus {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub last_update_error: Option<String>,
}

impl_record!(FirmwareRecord, RecordKind::Firmware);

/// Metadata for a dependent record owned by `bmc`.
pub fn dependent_meta(bmc: &str) -> RecordMeta {
    RecordMeta::new(bmc).with_label(LABEL_BMC, bmc)
}

// =============================================================================
// Event subscriptions
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSubscriptionRecord {
    pub meta: RecordMeta,
    pub spec: SubscriptionSpec,
    #[serde(default)]
    pub status: SubscriptionStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionSpec {
    pub destination: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub event_types: Vec<String>,
    #[serde(default)]
    pub message_ids: Vec<String>,
    #[serde(default)]
    pub resource_types: Vec<String>,
    /// Origin resource paths.
    #[serde(default)]
    pub origin_resources: Vec<String>,
    #[serde(default)]
    pub subordinate_resources: bool,
}

fn default_protocol() -> String {
    "Redfish".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionStatus {
    #[serde(default)]
    pub subscription_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl EventSubscriptionRecord {
    pub fn new(name: &str, spec: SubscriptionSpec) -> Self {
        Self {
            meta: RecordMeta::new(name),
            spec,
            status: SubscriptionStatus::default(),
        }
    }

    pub fn subscription_id(&self) -> Option<&str> {
        self.status.subscription_id.as_deref()
    }
}

impl_record!(EventSubscriptionRecord, RecordKind::EventSubscription);
