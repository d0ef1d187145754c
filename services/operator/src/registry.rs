//! Registry lookups.
//!
//! Registries are reached in two hops: the registry collection lists
//! registry files, and each file points at the localized registry body.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use tracing::debug;

use crate::redfish::types::{
    last_segment, AttributeRegistry, MessageRegistry, RegistryFile, REGISTRIES,
};
use crate::redfish::{RedfishApi, RedfishApiExt, RedfishError};

const PREFERRED_LANGUAGE: &str = "en";

/// Fetch the registry whose id is `id` or starts with `id.`.
pub async fn fetch_registry<T>(api: &dyn RedfishApi, id: &str) -> Result<Option<T>, RedfishError>
where
    T: DeserializeOwned + Send,
{
    let members = api.list_members(REGISTRIES).await?;
    let Some(member) = members.iter().find(|m| registry_matches(last_segment(&m.odata_id), id)) else {
        debug!(registry = %id, "Registry not published");
        return Ok(None);
    };

    let file: RegistryFile = api.get_as(&member.odata_id).await?;
    let location = file
        .location
        .iter()
        .find(|l| l.language.as_deref() == Some(PREFERRED_LANGUAGE))
        .or_else(|| file.location.first())
        .and_then(|l| l.uri.clone());

    match location {
        Some(uri) => Ok(Some(api.get_as(&uri).await?)),
        None => {
            debug!(registry = %file.id, "Registry file has no location");
            Ok(None)
        }
    }
}

fn registry_matches(candidate: &str, id: &str) -> bool {
    candidate == id
        || candidate
            .strip_prefix(id)
            .is_some_and(|rest| rest.starts_with('.'))
}

pub async fn attribute_registry(
    api: &dyn RedfishApi,
    id: &str,
) -> Result<Option<AttributeRegistry>, RedfishError> {
    fetch_registry(api, id).await
}

pub async fn message_registry(
    api: &dyn RedfishApi,
    prefix: &str,
) -> Result<Option<MessageRegistry>, RedfishError> {
    fetch_registry(api, prefix).await
}

/// A message id of the form `Registry.Major.Minor.MessageKey`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageId {
    pub registry: String,
    pub major: u32,
    pub minor: u32,
    pub key: String,
}

impl MessageId {
    /// `Registry.Major.Minor`, as registries are published.
    pub fn registry_version(&self) -> String {
        format!("{}.{}.{}", self.registry, self.major, self.minor)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.registry, self.major, self.minor, self.key)
    }
}

impl FromStr for MessageId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        let [registry, major, minor, key] = parts.as_slice() else {
            return Err(format!("message id '{s}' is not Registry.Major.Minor.Key"));
        };
        if registry.is_empty() || key.is_empty() {
            return Err(format!("message id '{s}' has an empty registry or key"));
        }
        let major = major
            .parse()
            .map_err(|_| format!("message id '{s}' has a non-numeric major version"))?;
        let minor = minor
            .parse()
            .map_err(|_| format!("message id '{s}' has a non-numeric minor version"))?;
        Ok(Self {
            registry: registry.to_string(),
            major,
            minor,
            key: key.to_string(),
        })
    }
}

/// Check a message id against its registry. Unreachable registries are not
/// an error: the id passed its format check and is accepted.
pub async fn message_exists(api: &dyn RedfishApi, id: &MessageId) -> Result<bool, RedfishError> {
    let registry = match message_registry(api, &id.registry_version()).await? {
        Some(registry) => Some(registry),
        None => message_registry(api, &id.registry).await?,
    };
    Ok(registry.is_none_or(|r| r.messages.contains_key(&id.key)))
}
