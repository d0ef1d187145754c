//! Typed Redfish documents.
//!
//! Every response consumed by the engines is decoded into one of these
//! structs. Fields the aggregation service may omit are `Option` or carry a
//! serde default, so a missing field is a `None` rather than a panic.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const SERVICE_ROOT: &str = "/redfish/v1";
pub const SYSTEMS: &str = "/redfish/v1/Systems";
pub const AGGREGATION_SOURCES: &str = "/redfish/v1/AggregationService/AggregationSources";
pub const CONNECTION_METHODS: &str = "/redfish/v1/AggregationService/ConnectionMethods";
pub const EVENT_SUBSCRIPTIONS: &str = "/redfish/v1/EventService/Subscriptions";
pub const REGISTRIES: &str = "/redfish/v1/Registries";
pub const SESSIONS: &str = "/redfish/v1/SessionService/Sessions";
pub const ACCOUNTS: &str = "/redfish/v1/AccountService/Accounts";
pub const SIMPLE_UPDATE: &str = "/redfish/v1/UpdateService/Actions/UpdateService.SimpleUpdate";
pub const FIRMWARE_INVENTORY: &str = "/redfish/v1/UpdateService/FirmwareInventory";

pub fn system_path(system_id: &str) -> String {
    format!("{SYSTEMS}/{system_id}")
}

pub fn bios_path(system_id: &str) -> String {
    format!("{SYSTEMS}/{system_id}/Bios")
}

pub fn bios_settings_path(system_id: &str) -> String {
    format!("{SYSTEMS}/{system_id}/Bios/Settings")
}

pub fn reset_path(system_id: &str) -> String {
    format!("{SYSTEMS}/{system_id}/Actions/ComputerSystem.Reset")
}

pub fn storage_path(system_id: &str) -> String {
    format!("{SYSTEMS}/{system_id}/Storage")
}

pub fn volumes_path(system_id: &str, controller: &str) -> String {
    format!("{SYSTEMS}/{system_id}/Storage/{controller}/Volumes")
}

pub fn volume_path(system_id: &str, controller: &str, volume_id: &str) -> String {
    format!("{SYSTEMS}/{system_id}/Storage/{controller}/Volumes/{volume_id}")
}

pub fn drive_path(system_id: &str, controller: &str, drive_id: &str) -> String {
    format!("{SYSTEMS}/{system_id}/Storage/{controller}/Drives/{drive_id}")
}

/// Final path segment of a Redfish URI, ignoring a trailing slash.
pub fn last_segment(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// A `{"@odata.id": ...}` link.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ODataRef {
    #[serde(rename = "@odata.id")]
    pub odata_id: String,
}

impl ODataRef {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            odata_id: path.into(),
        }
    }

    /// The resource id (last path segment).
    pub fn id(&self) -> &str {
        last_segment(&self.odata_id)
    }
}

/// Any Redfish collection.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Collection {
    #[serde(default)]
    pub members: Vec<ODataRef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ComputerSystem {
    pub id: String,
    #[serde(default)]
    pub host_name: Option<String>,
    #[serde(default)]
    pub serial_number: Option<String>,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub power_state: Option<String>,
    #[serde(default)]
    pub bios_version: Option<String>,
    #[serde(default)]
    pub boot: Option<Boot>,
    #[serde(default)]
    pub links: SystemLinks,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SystemLinks {
    #[serde(default)]
    pub managed_by: Vec<ODataRef>,
}

/// Boot settings of a computer system.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Boot {
    #[serde(default)]
    pub boot_order: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_source_override_target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_source_override_enabled: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_source_override_mode: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Bios {
    #[serde(default)]
    pub attribute_registry: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Storage {
    pub id: String,
    #[serde(default)]
    pub drives: Vec<ODataRef>,
    #[serde(default)]
    pub volumes: Option<ODataRef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Volume {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default, rename = "RAIDType")]
    pub raid_type: Option<String>,
    #[serde(default)]
    pub capacity_bytes: Option<u64>,
    #[serde(default)]
    pub identifiers: Vec<Identifier>,
    #[serde(default)]
    pub links: VolumeLinks,
}

impl Volume {
    /// Ids of the drives backing this volume, sorted.
    pub fn drive_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .links
            .drives
            .iter()
            .map(|d| d.id().to_string())
            .collect();
        ids.sort();
        ids
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VolumeLinks {
    #[serde(default)]
    pub drives: Vec<ODataRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Identifier {
    #[serde(default)]
    pub durable_name: Option<String>,
    #[serde(default)]
    pub durable_name_format: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Manager {
    pub id: String,
    #[serde(default)]
    pub firmware_version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AggregationSource {
    #[serde(default, rename = "@odata.id")]
    pub odata_id: Option<String>,
    #[serde(default)]
    pub host_name: Option<String>,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub links: AggregationSourceLinks,
}

impl AggregationSource {
    /// Whether this source aggregates the given system.
    pub fn accesses(&self, system_path: &str) -> bool {
        self.links
            .resources_accessed
            .iter()
            .any(|r| r.odata_id.trim_end_matches('/') == system_path.trim_end_matches('/'))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AggregationSourceLinks {
    #[serde(default)]
    pub connection_method: Option<ODataRef>,
    #[serde(default)]
    pub resources_accessed: Vec<ODataRef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConnectionMethod {
    #[serde(rename = "@odata.id")]
    pub odata_id: String,
    #[serde(default)]
    pub connection_method_type: Option<String>,
    #[serde(default)]
    pub connection_method_variant: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EventDestination {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub destination: String,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub event_types: Vec<String>,
    #[serde(default)]
    pub message_ids: Vec<String>,
    #[serde(default)]
    pub resource_types: Vec<String>,
    #[serde(default)]
    pub origin_resources: Vec<ODataRef>,
    #[serde(default)]
    pub subordinate_resources: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Account {
    pub id: String,
    #[serde(default)]
    pub user_name: Option<String>,
}

/// Registry file entry: points at the actual registry document.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RegistryFile {
    pub id: String,
    #[serde(default)]
    pub registry: Option<String>,
    #[serde(default)]
    pub location: Vec<RegistryLocation>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RegistryLocation {
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub uri: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MessageRegistry {
    #[serde(default)]
    pub registry_prefix: Option<String>,
    #[serde(default)]
    pub messages: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AttributeRegistry {
    #[serde(default)]
    pub registry_entries: RegistryEntries,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RegistryEntries {
    #[serde(default)]
    pub attributes: Vec<AttributeEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AttributeEntry {
    pub attribute_name: String,
    #[serde(default)]
    pub read_only: bool,
}

// =============================================================================
// Requests
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AddAggregationSourceRequest {
    pub host_name: String,
    pub user_name: String,
    pub password: String,
    pub links: AddAggregationSourceLinks,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AddAggregationSourceLinks {
    pub connection_method: ODataRef,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResetRequest {
    pub reset_type: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateVolumeRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "RAIDType")]
    pub raid_type: String,
    pub links: CreateVolumeLinks,
    #[serde(rename = "@Redfish.OperationApplyTime")]
    pub operation_apply_time: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateVolumeLinks {
    pub drives: Vec<ODataRef>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SimpleUpdateRequest {
    #[serde(rename = "ImageURI")]
    pub image_uri: String,
    pub targets: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_protocol: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateSubscriptionRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub destination: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub event_types: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub message_ids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub resource_types: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub origin_resources: Vec<ODataRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub protocol: String,
    pub subordinate_resources: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_deserialization() {
        let json = serde_json::json!({
            "@odata.id": "/redfish/v1/Systems/sys.1/Storage/ArrayControllers-0/Volumes/3",
            "Id": "3",
            "Name": "Volume 3",
            "RAIDType": "RAID1",
            "CapacityBytes": 1_200_000_000_000u64,
            "Identifiers": [{"DurableName": "600508B1001C", "DurableNameFormat": "NAA"}],
            "Links": {"Drives": [
                {"@odata.id": "/redfish/v1/Systems/sys.1/Storage/ArrayControllers-0/Drives/1"},
                {"@odata.id": "/redfish/v1/Systems/sys.1/Storage/ArrayControllers-0/Drives/0"}
            ]}
        });

        let volume: Volume = serde_json::from_value(json).unwrap();
        assert_eq!(volume.id, "3");
        assert_eq!(volume.raid_type.as_deref(), Some("RAID1"));
        assert_eq!(volume.drive_ids(), vec!["0".to_string(), "1".to_string()]);
        assert_eq!(volume.identifiers[0].durable_name_format.as_deref(), Some("NAA"));
        assert!(volume.display_name.is_none());
    }

    #[test]
    fn test_system_tolerates_missing_fields() {
        let system: ComputerSystem = serde_json::from_value(serde_json::json!({"Id": "sys.1"})).unwrap();
        assert_eq!(system.id, "sys.1");
        assert!(system.power_state.is_none());
        assert!(system.links.managed_by.is_empty());
    }

    #[test]
    fn test_last_segment() {
        assert_eq!(last_segment("/redfish/v1/Systems/abc.1"), "abc.1");
        assert_eq!(last_segment("/redfish/v1/Systems/abc.1/"), "abc.1");
        assert_eq!(ODataRef::new("/redfish/v1/Managers/m.1").id(), "m.1");
    }

    #[test]
    fn test_create_volume_request_serialization() {
        let request = CreateVolumeRequest {
            name: None,
            raid_type: "RAID0".to_string(),
            links: CreateVolumeLinks {
                drives: vec![ODataRef::new(drive_path("sys.1", "c0", "0"))],
            },
            operation_apply_time: "OnReset".to_string(),
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["RAIDType"], "RAID0");
        assert_eq!(json["@Redfish.OperationApplyTime"], "OnReset");
        assert_eq!(
            json["Links"]["Drives"][0]["@odata.id"],
            "/redfish/v1/Systems/sys.1/Storage/c0/Drives/0"
        );
        assert!(json.get("Name").is_none());
    }
}
