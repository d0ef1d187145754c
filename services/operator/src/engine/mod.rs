//! Reconciliation engines.
//!
//! A per-BMC pass runs in a fixed order:
//!
//! ```text
//! deleted?        -> remote delete, dependents Bios -> Boot -> Firmware -> Volume
//! no system id?   -> add workflow
//! credentials     -> rotation protocol
//! power request   -> reset state machine
//! volume intent   -> create / delete requested volumes
//! reset pending?  -> stop
//! drift           -> accommodate (remote wins) | revert (local wins)
//! ```
//!
//! A failing step is logged into the [`PassReport`] and the pass moves on;
//! only store failures on the record itself abort it.

pub mod accommodate;
pub mod bmc;
pub mod credentials;
pub mod fleet;
pub mod power;
pub mod revert;
pub mod subscriptions;
pub mod volume;

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bmcsync_reconcile::{RetryTracker, DEFAULT_RETRY_WINDOW};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::crypto::{CryptoError, PasswordCipher};
use crate::redfish::{BmcConnector, RedfishApi, RedfishError};
use crate::state::records::BmcRecord;
use crate::state::{ResourceStore, ResourceStoreExt, StoreError, Tracking};
use crate::task_monitor::{TaskError, TaskMonitor};

/// Which side wins when local and remote state disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    Accommodate,
    Revert,
}

impl FromStr for Policy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "accommodate" => Ok(Self::Accommodate),
            "revert" => Ok(Self::Revert),
            other => Err(format!("unknown reconciliation policy: {other}")),
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accommodate => f.write_str("accommodate"),
            Self::Revert => f.write_str("revert"),
        }
    }
}

/// What caused a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Poll,
    RemoteAdded,
    RemoteRemoved,
    DiscoveryComplete,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Redfish(#[from] RedfishError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    TaskFailed(#[from] TaskError),

    /// Refused locally; nothing was sent to the remote service.
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("invalid: {0}")]
    Invalid(String),
}

/// Tunables for the engines.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub policy: Policy,
    pub settle_attempts: u32,
    pub settle_interval: Duration,
    pub max_add_attempts: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            policy: Policy::Accommodate,
            settle_attempts: 10,
            settle_interval: Duration::from_secs(10),
            max_add_attempts: bmcsync_reconcile::DEFAULT_MAX_ADD_ATTEMPTS,
        }
    }
}

/// Everything a pass needs, shared by all actors.
pub struct ReconcileContext {
    pub api: Arc<dyn RedfishApi>,
    pub store: Arc<dyn ResourceStore>,
    pub connector: Arc<dyn BmcConnector>,
    pub cipher: Arc<PasswordCipher>,
    pub tracking: Arc<Tracking>,
    pub monitor: TaskMonitor,
    pub settings: EngineSettings,
    add_attempts: Mutex<RetryTracker>,
}

impl ReconcileContext {
    pub fn new(
        api: Arc<dyn RedfishApi>,
        store: Arc<dyn ResourceStore>,
        connector: Arc<dyn BmcConnector>,
        cipher: Arc<PasswordCipher>,
        monitor: TaskMonitor,
        settings: EngineSettings,
    ) -> Self {
        let add_attempts = RetryTracker::new(settings.max_add_attempts, DEFAULT_RETRY_WINDOW);
        Self {
            api,
            store,
            connector,
            cipher,
            tracking: Arc::new(Tracking::new()),
            monitor,
            settings,
            add_attempts: Mutex::new(add_attempts),
        }
    }

    pub fn api(&self) -> &dyn RedfishApi {
        self.api.as_ref()
    }

    pub fn policy(&self) -> Policy {
        self.settings.policy
    }

    /// Count a failed add attempt; true once attempts are used up.
    pub(crate) fn record_add_failure(&self, bmc: &str) -> bool {
        let mut tracker = self.add_attempts.lock().unwrap_or_else(PoisonError::into_inner);
        tracker.prune();
        tracker.record_failure(bmc)
    }

    pub(crate) fn clear_add_failures(&self, bmc: &str) {
        self.add_attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear(bmc);
    }

    pub async fn load_bmc(&self, name: &str) -> Result<Option<BmcRecord>, StoreError> {
        self.store.get::<BmcRecord>(name).await
    }
}

/// Outcome of one per-BMC pass.
#[derive(Debug, Clone)]
pub struct PassReport {
    pub bmc: String,
    pub trigger: Trigger,
    /// `(step, error)` for every step that failed.
    pub errors: Vec<(&'static str, String)>,
    /// The BMC record no longer exists after this pass.
    pub removed: bool,
}

impl PassReport {
    pub fn new(bmc: &str, trigger: Trigger) -> Self {
        Self {
            bmc: bmc.to_string(),
            trigger,
            errors: Vec::new(),
            removed: false,
        }
    }

    pub fn fail(&mut self, step: &'static str, error: EngineError) {
        warn!(bmc = %self.bmc, step, error = %error, "Reconcile step failed");
        self.errors.push((step, error.to_string()));
    }

    /// Fold a step result into the report.
    pub fn check<T>(&mut self, step: &'static str, result: Result<T, EngineError>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.fail(step, e);
                None
            }
        }
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Run one pass for the BMC record `name`.
#[instrument(skip(ctx), fields(policy = %ctx.policy()))]
pub async fn reconcile_bmc(
    ctx: &ReconcileContext,
    name: &str,
    trigger: Trigger,
) -> Result<PassReport, EngineError> {
    let mut report = PassReport::new(name, trigger);

    let Some(record) = ctx.load_bmc(name).await? else {
        debug!("BMC record gone, nothing to do");
        report.removed = true;
        return Ok(report);
    };

    if record.meta.is_deleting() {
        let result = bmc::delete_bmc(ctx, &record).await;
        report.removed = report.check("delete", result).is_some();
        return Ok(report);
    }

    if trigger == Trigger::RemoteRemoved && record.system_id().is_some() {
        let result = bmc::handle_remote_removed(ctx, &record).await;
        if let Some(removed) = report.check("remote_removed", result) {
            report.removed = removed;
        }
        return Ok(report);
    }

    let record = if record.system_id().is_none() {
        match bmc::add_bmc(ctx, record).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                report.removed = true;
                return Ok(report);
            }
            Err(e) => {
                report.fail("add", e);
                return Ok(report);
            }
        }
    } else {
        record
    };

    let result = credentials::rotate_if_needed(ctx, &record).await;
    report.check("credentials", result);

    let result = power::apply_power_request(ctx, name).await;
    report.check("power", result);

    let result = volume::apply_volume_intent(ctx, name).await;
    report.check("volume_intent", result);

    let Some(record) = ctx.load_bmc(name).await? else {
        report.removed = true;
        return Ok(report);
    };
    let Some(system_id) = record.system_id().map(str::to_string) else {
        return Ok(report);
    };

    if ctx.tracking.is_reset_pending(&system_id) {
        debug!(system_id = %system_id, "Reset pending, skipping drift correction");
        return Ok(report);
    }

    match ctx.policy() {
        Policy::Accommodate => accommodate::run(ctx, &record, &system_id, &mut report).await,
        Policy::Revert => revert::run(ctx, &record, &system_id, &mut report).await,
    }

    Ok(report)
}
