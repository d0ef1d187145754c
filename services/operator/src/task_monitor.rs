//! Async task monitor.
//!
//! A remote operation answered with 202 returns a task-monitor URL in its
//! `Location` header. The monitor polls that URL at a fixed interval, up to
//! a fixed number of attempts, and maps each `(status, operation kind)` to
//! continue / success / failure.

use std::fmt;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::redfish::{ApiResponse, Method, RedfishApi, RedfishApiExt, RedfishError};

/// Remote operations whose completion is tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    AddBmc,
    DeleteBmc,
    Reset,
    CreateVolume,
    DeleteVolume,
    BiosSettings,
    BootSettings,
    FirmwareUpdate,
    UpdateCredentials,
    CreateEventSubscription,
    DeleteEventSubscription,
    GetResource,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AddBmc => "add_bmc",
            Self::DeleteBmc => "delete_bmc",
            Self::Reset => "reset",
            Self::CreateVolume => "create_volume",
            Self::DeleteVolume => "delete_volume",
            Self::BiosSettings => "bios_settings",
            Self::BootSettings => "boot_settings",
            Self::FirmwareUpdate => "firmware_update",
            Self::UpdateCredentials => "update_credentials",
            Self::CreateEventSubscription => "create_event_subscription",
            Self::DeleteEventSubscription => "delete_event_subscription",
            Self::GetResource => "get_resource",
        }
    }

    /// Operations that complete by creating a resource.
    fn completes_with_created(&self) -> bool {
        matches!(self, Self::AddBmc | Self::CreateEventSubscription)
    }

    /// Operations for which a missing target means the work is done.
    fn absent_is_done(&self) -> bool {
        matches!(
            self,
            Self::DeleteBmc | Self::DeleteVolume | Self::DeleteEventSubscription
        )
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision for one observed status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Continue,
    Success,
    Failure,
}

/// Map a status code to an outcome for the given operation kind.
pub fn classify(status: u16, kind: OperationKind) -> TaskOutcome {
    match status {
        202 => TaskOutcome::Continue,
        409 => TaskOutcome::Failure,
        201 if kind.completes_with_created() => TaskOutcome::Success,
        201 => TaskOutcome::Failure,
        200 if kind.completes_with_created() => TaskOutcome::Continue,
        200 | 204 => TaskOutcome::Success,
        404 if kind.absent_is_done() => TaskOutcome::Success,
        _ => TaskOutcome::Failure,
    }
}

/// Terminal failures of a monitored operation.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("{kind} rejected with status {status}: {body}")]
    Failed {
        kind: OperationKind,
        status: u16,
        body: String,
    },

    #[error("{kind} did not complete after {attempts} polls")]
    Exhausted { kind: OperationKind, attempts: u32 },

    #[error("{kind} accepted without a task location")]
    MissingLocation { kind: OperationKind },

    #[error("{kind} request failed: {source}")]
    Request {
        kind: OperationKind,
        #[source]
        source: RedfishError,
    },
}

/// Bounded poller for remote tasks.
#[derive(Debug, Clone)]
pub struct TaskMonitor {
    retry_count: u32,
    interval: Duration,
}

impl TaskMonitor {
    pub fn new(retry_count: u32, interval: Duration) -> Self {
        Self {
            retry_count,
            interval,
        }
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Issue a request and drive it to a terminal outcome.
    ///
    /// A 202 reply is followed through its task location; any other reply
    /// is classified directly.
    pub async fn execute(
        &self,
        api: &dyn RedfishApi,
        method: Method,
        path: &str,
        body: Option<&Value>,
        kind: OperationKind,
    ) -> Result<ApiResponse, TaskError> {
        let response = api
            .request(method, path, body)
            .await
            .map_err(|source| TaskError::Request { kind, source })?;

        match classify(response.status, kind) {
            TaskOutcome::Success => Ok(response),
            TaskOutcome::Failure => Err(failed(kind, &response)),
            TaskOutcome::Continue => {
                let Some(location) = response.location.clone() else {
                    return Err(TaskError::MissingLocation { kind });
                };
                info!(operation = %kind, path = %path, task = %location, "Remote operation accepted, monitoring task");
                self.await_task(api, &location, kind).await
            }
        }
    }

    /// Poll `location` until a terminal outcome or the retry bound.
    pub async fn await_task(
        &self,
        api: &dyn RedfishApi,
        location: &str,
        kind: OperationKind,
    ) -> Result<ApiResponse, TaskError> {
        let mut location = location.to_string();

        for attempt in 1..=self.retry_count {
            match api.get(&location).await {
                Ok(response) => match classify(response.status, kind) {
                    TaskOutcome::Success => {
                        debug!(operation = %kind, attempt, status = response.status, "Task completed");
                        return Ok(response);
                    }
                    TaskOutcome::Failure => {
                        warn!(operation = %kind, attempt, status = response.status, "Task failed");
                        return Err(failed(kind, &response));
                    }
                    TaskOutcome::Continue => {
                        if let Some(next) = response.location {
                            location = next;
                        }
                        debug!(operation = %kind, attempt, "Task still running");
                    }
                },
                Err(e) => {
                    warn!(operation = %kind, attempt, error = %e, "Task poll failed, counting as retry");
                }
            }

            if attempt < self.retry_count {
                tokio::time::sleep(self.interval).await;
            }
        }

        Err(TaskError::Exhausted {
            kind,
            attempts: self.retry_count,
        })
    }
}

fn failed(kind: OperationKind, response: &ApiResponse) -> TaskError {
    TaskError::Failed {
        kind,
        status: response.status,
        body: response.body.to_string(),
    }
}
