//! Poll scheduler: the timer-driven entry point.
//!
//! Each tick:
//! - lists remote systems and updates presence tracking
//! - discovers systems without a local record
//! - dispatches one pass per BMC record and waits for all of them
//! - reconciles event subscriptions

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::actors::Fleet;
use crate::engine::{fleet, subscriptions, Trigger};
use crate::redfish::types::{last_segment, system_path};
use crate::state::records::BmcRecord;
use crate::state::{ListFilter, ResourceStoreExt};

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Systems listed remotely.
    pub systems: usize,
    /// BMC records newly linked to a remote system.
    pub discovered: usize,
    /// Passes dispatched.
    pub passes: usize,
    /// Passes that failed or reported step errors.
    pub failed: usize,
}

pub struct PollScheduler {
    fleet: Arc<Fleet>,
    interval: Duration,
}

impl PollScheduler {
    /// A zero `interval` falls back to the default poll interval.
    pub fn new(fleet: Arc<Fleet>, interval: Duration) -> Self {
        let interval = if interval.is_zero() {
            warn!("Zero poll interval, using the default");
            bmcsync_reconcile::DEFAULT_POLL_INTERVAL
        } else {
            interval
        };
        Self { fleet, interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run ticks until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_secs = self.interval.as_secs(),
            policy = %self.fleet.context().policy(),
            "Starting poll scheduler"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let summary = self.tick().await;
                    debug!(
                        systems = summary.systems,
                        discovered = summary.discovered,
                        passes = summary.passes,
                        failed = summary.failed,
                        "Tick complete"
                    );
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Poll scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Perform a single full pass over the fleet.
    pub async fn tick(&self) -> TickSummary {
        let ctx = self.fleet.context();
        let mut summary = TickSummary::default();

        let systems = match fleet::remote_systems(ctx).await {
            Ok(systems) => systems,
            Err(e) => {
                warn!(error = %e, "Failed to list remote systems, will retry");
                return summary;
            }
        };
        summary.systems = systems.len();

        let present: BTreeSet<String> = systems
            .iter()
            .map(|path| last_segment(path).to_string())
            .collect();
        let awaiting_record: Vec<&String> = present
            .iter()
            .filter(|id| ctx.tracking.observe_present(&system_path(id)))
            .collect();

        let mut added = BTreeSet::new();
        if !awaiting_record.is_empty() {
            let _guard = self.fleet.lock().await;
            for system_id in awaiting_record {
                match fleet::discover(ctx, system_id).await {
                    Ok(Some(name)) => {
                        added.insert(name);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(system_id = %system_id, error = %e, "Discovery failed");
                    }
                }
            }
        }
        summary.discovered = added.len();

        let records: Vec<BmcRecord> = match ctx.store.list(&ListFilter::all()).await {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "Failed to list BMC records");
                return summary;
            }
        };

        let mut work = Vec::with_capacity(records.len());
        for record in &records {
            let trigger = match record.system_id() {
                Some(system_id) if !present.contains(system_id) => {
                    ctx.tracking.observe_absent(&system_path(system_id));
                    Trigger::RemoteRemoved
                }
                _ if added.contains(&record.meta.name) => Trigger::RemoteAdded,
                _ => Trigger::Poll,
            };
            work.push((record.meta.name.clone(), trigger));
        }

        let names: BTreeSet<String> = work.iter().map(|(name, _)| name.clone()).collect();
        self.fleet.retain(&names).await;

        summary.passes = work.len();
        let fleet = &self.fleet;
        let results = join_all(work.iter().map(|(name, trigger)| async move {
            (name, fleet.dispatch(name, *trigger).await)
        }))
        .await;

        for (name, result) in results {
            match result {
                Ok(report) if report.is_clean() => {}
                Ok(report) => {
                    summary.failed += 1;
                    warn!(bmc = %name, failed_steps = report.errors.len(), "Pass finished with errors");
                }
                Err(e) => {
                    summary.failed += 1;
                    warn!(bmc = %name, error = %e, "Pass failed");
                }
            }
        }

        let _guard = self.fleet.lock().await;
        if let Err(e) = subscriptions::reconcile_subscriptions(ctx).await {
            warn!(error = %e, "Subscription reconciliation failed");
        }

        summary
    }
}
