//! In-memory Redfish service.
//!
//! `MockRedfish` serves a mutable resource tree and lets callers script
//! reply sequences per `(method, path)`, which is how task-monitor flows
//! (202 → 202 → 201) are simulated. Every call is recorded.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::client::{ApiResponse, BmcConnector, Method, RedfishApi, RedfishError};

/// A scripted reply.
#[derive(Debug, Clone)]
pub enum MockReply {
    Respond(ApiResponse),
    TransportError(String),
}

impl MockReply {
    pub fn status(status: u16) -> Self {
        Self::Respond(ApiResponse::new(status, Value::Null))
    }

    pub fn ok(body: Value) -> Self {
        Self::Respond(ApiResponse::new(200, body))
    }

    pub fn created(body: Value) -> Self {
        Self::Respond(ApiResponse::new(201, body))
    }

    /// 202 with a task-monitor `Location`.
    pub fn accepted(location: &str) -> Self {
        Self::Respond(ApiResponse {
            status: 202,
            body: Value::Null,
            location: Some(location.to_string()),
        })
    }

    pub fn transport_error(message: &str) -> Self {
        Self::TransportError(message.to_string())
    }
}

/// A request seen by the mock.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
}

#[derive(Default)]
struct MockState {
    resources: BTreeMap<String, Value>,
    scripts: HashMap<(Method, String), VecDeque<MockReply>>,
    calls: Vec<RecordedCall>,
}

/// Mock aggregation service for testing and development.
#[derive(Default)]
pub struct MockRedfish {
    state: Mutex<MockState>,
}

impl MockRedfish {
    /// Create an empty mock service.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a resource document at `path`.
    pub fn insert(&self, path: &str, body: Value) {
        self.lock().resources.insert(path.to_string(), body);
    }

    /// Remove a resource document.
    pub fn remove(&self, path: &str) {
        self.lock().resources.remove(path);
    }

    /// Read back a resource document.
    pub fn resource(&self, path: &str) -> Option<Value> {
        self.lock().resources.get(path).cloned()
    }

    /// Store a collection with the given member paths.
    pub fn insert_collection(&self, path: &str, members: &[&str]) {
        let members: Vec<Value> = members.iter().map(|m| json!({ "@odata.id": m })).collect();
        self.insert(
            path,
            json!({
                "@odata.id": path,
                "Members@odata.count": members.len(),
                "Members": members,
            }),
        );
    }

    /// Store a resource and link it into its parent collection.
    pub fn add_member(&self, collection: &str, member_path: &str, body: Value) {
        let mut state = self.lock();
        state.resources.insert(member_path.to_string(), body);

        let entry = state
            .resources
            .entry(collection.to_string())
            .or_insert_with(|| json!({ "@odata.id": collection, "Members": [] }));
        link_member(entry, member_path);
    }

    /// Remove a resource and unlink it from its parent collection.
    pub fn remove_member(&self, collection: &str, member_path: &str) {
        let mut state = self.lock();
        state.resources.remove(member_path);
        if let Some(entry) = state.resources.get_mut(collection) {
            unlink_member(entry, member_path);
        }
    }

    /// Queue replies for `(method, path)`; they are consumed in order before
    /// falling back to the resource tree.
    pub fn script<I>(&self, method: Method, path: &str, replies: I)
    where
        I: IntoIterator<Item = MockReply>,
    {
        self.lock()
            .scripts
            .entry((method, path.to_string()))
            .or_default()
            .extend(replies);
    }

    /// All calls seen so far.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    /// Calls matching a method and path.
    pub fn calls_to(&self, method: Method, path: &str) -> Vec<RecordedCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.method == method && c.path == path)
            .cloned()
            .collect()
    }

    /// Calls other than GET.
    pub fn mutating_calls(&self) -> Vec<RecordedCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.method != Method::Get)
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }
}

fn link_member(collection: &mut Value, member_path: &str) {
    let Some(members) = collection.get_mut("Members").and_then(Value::as_array_mut) else {
        return;
    };
    let exists = members
        .iter()
        .any(|m| m.get("@odata.id").and_then(Value::as_str) == Some(member_path));
    if !exists {
        members.push(json!({ "@odata.id": member_path }));
    }
}

fn unlink_member(collection: &mut Value, member_path: &str) {
    if let Some(members) = collection.get_mut("Members").and_then(Value::as_array_mut) {
        members.retain(|m| m.get("@odata.id").and_then(Value::as_str) != Some(member_path));
    }
}

fn parent_path(path: &str) -> Option<&str> {
    path.trim_end_matches('/').rsplit_once('/').map(|(parent, _)| parent)
}

impl MockRedfish {
    fn respond(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<ApiResponse, RedfishError> {
        let mut state = self.lock();
        state.calls.push(RecordedCall {
            method,
            path: path.to_string(),
            body: body.cloned(),
        });

        let scripted = state
            .scripts
            .get_mut(&(method, path.to_string()))
            .and_then(VecDeque::pop_front);

        if let Some(reply) = scripted {
            debug!(method = %method, path = %path, "[MOCK] Scripted reply");
            return match reply {
                MockReply::Respond(response) => Ok(response),
                MockReply::TransportError(message) => Err(RedfishError::Transport {
                    path: path.to_string(),
                    message,
                }),
            };
        }

        let response = match method {
            Method::Get => match state.resources.get(path) {
                Some(doc) => ApiResponse::new(200, doc.clone()),
                None => ApiResponse::new(404, Value::Null),
            },
            Method::Patch | Method::Put => match state.resources.get_mut(path) {
                Some(doc) => {
                    if let (Some(target), Some(Value::Object(patch))) = (doc.as_object_mut(), body) {
                        for (key, value) in patch {
                            target.insert(key.clone(), value.clone());
                        }
                    }
                    ApiResponse::new(200, doc.clone())
                }
                None => ApiResponse::new(404, Value::Null),
            },
            Method::Delete => {
                if state.resources.remove(path).is_some() {
                    if let Some(parent) = parent_path(path) {
                        if let Some(collection) = state.resources.get_mut(parent) {
                            unlink_member(collection, path);
                        }
                    }
                    ApiResponse::new(204, Value::Null)
                } else {
                    ApiResponse::new(404, Value::Null)
                }
            }
            Method::Post => ApiResponse::new(200, json!({})),
        };

        Ok(response)
    }
}

#[async_trait]
impl RedfishApi for MockRedfish {
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<ApiResponse, RedfishError> {
        self.respond(method, path, body)
    }
}

/// Connector handing out registered mock services per BMC address.
#[derive(Default)]
pub struct MockConnector {
    targets: Mutex<HashMap<String, Arc<MockRedfish>>>,
    connections: Mutex<Vec<(String, String, String)>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route connections for `address` to `service`.
    pub fn register(&self, address: &str, service: Arc<MockRedfish>) {
        self.targets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address.to_string(), service);
    }

    /// `(address, username, password)` of every connection made.
    pub fn connections(&self) -> Vec<(String, String, String)> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl BmcConnector for MockConnector {
    fn connect(
        &self,
        address: &str,
        username: &str,
        password: &str,
    ) -> Result<Arc<dyn RedfishApi>, RedfishError> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((address.to_string(), username.to_string(), password.to_string()));

        let targets = self.targets.lock().unwrap_or_else(PoisonError::into_inner);
        match targets.get(address) {
            Some(service) => Ok(Arc::clone(service) as Arc<dyn RedfishApi>),
            None => Err(RedfishError::Transport {
                path: address.to_string(),
                message: "no route to host".to_string(),
            }),
        }
    }
}
