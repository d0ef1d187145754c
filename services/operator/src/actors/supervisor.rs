//! Fleet supervisor: one [`BmcActor`] per BMC record.
//!
//! ```text
//! Fleet
//! ├── BmcActor(bmc-a)
//! ├── BmcActor(bmc-b)
//! └── ...
//! ```
//!
//! Actors are spawned on first dispatch and stop by themselves once their
//! record is gone. A dispatch to an actor that stopped in the meantime
//! respawns it once.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{oneshot, Mutex, MutexGuard};
use tracing::{debug, info};

use super::bmc::{BmcActor, BmcMessage};
use super::framework::{ActorError, ActorHandle, Supervisor};
use crate::engine::{EngineError, PassReport, ReconcileContext, Trigger};

const MAILBOX_SIZE: usize = 16;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error(transparent)]
    Actor(#[from] ActorError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("actor for {0} is unavailable")]
    Unavailable(String),
}

#[derive(Default)]
struct FleetState {
    supervisor: Supervisor,
    handles: HashMap<String, ActorHandle<BmcMessage>>,
}

pub struct Fleet {
    ctx: Arc<ReconcileContext>,
    state: Mutex<FleetState>,
    /// Serializes fleet-level work such as discovery.
    fleet_lock: Mutex<()>,
}

impl Fleet {
    pub fn new(ctx: Arc<ReconcileContext>) -> Self {
        Self {
            ctx,
            state: Mutex::new(FleetState::default()),
            fleet_lock: Mutex::new(()),
        }
    }

    pub fn context(&self) -> &Arc<ReconcileContext> {
        &self.ctx
    }

    /// Hold this while doing work that spans BMCs.
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.fleet_lock.lock().await
    }

    /// Run one pass for `bmc` on its actor and wait for the report.
    pub async fn dispatch(&self, bmc: &str, trigger: Trigger) -> Result<PassReport, FleetError> {
        for _ in 0..2 {
            let handle = self.handle_for(bmc).await;
            let (reply_to, reply) = oneshot::channel();

            match handle.send(BmcMessage::Reconcile { trigger, reply_to }).await {
                Ok(()) => {}
                Err(ActorError::ActorStopped) => {
                    self.forget(bmc, handle.actor_id()).await;
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            match reply.await {
                Ok(Ok(report)) => {
                    if report.removed {
                        self.forget(bmc, handle.actor_id()).await;
                    }
                    return Ok(report);
                }
                Ok(Err(e)) => return Err(e.into()),
                // The actor went away before answering.
                Err(_) => self.forget(bmc, handle.actor_id()).await,
            }
        }
        Err(FleetError::Unavailable(bmc.to_string()))
    }

    async fn handle_for(&self, bmc: &str) -> ActorHandle<BmcMessage> {
        let mut state = self.state.lock().await;
        if let Some(handle) = state.handles.get(bmc) {
            if !handle.is_closed() {
                return handle.clone();
            }
        }

        let actor = BmcActor::new(bmc, Arc::clone(&self.ctx));
        let handle = state.supervisor.spawn(actor, MAILBOX_SIZE);
        debug!(bmc = %bmc, actor_id = %handle.actor_id(), "BMC actor spawned");
        state.handles.insert(bmc.to_string(), handle.clone());
        handle
    }

    async fn forget(&self, bmc: &str, actor_id: &str) {
        let mut state = self.state.lock().await;
        if state
            .handles
            .get(bmc)
            .is_some_and(|h| h.actor_id() == actor_id)
        {
            state.handles.remove(bmc);
        }
        state.supervisor.reap();
    }

    /// Stop actors for BMCs not in `names`.
    pub async fn retain(&self, names: &BTreeSet<String>) {
        let mut state = self.state.lock().await;
        let gone: Vec<String> = state
            .handles
            .keys()
            .filter(|name| !names.contains(*name))
            .cloned()
            .collect();

        for name in gone {
            if let Some(handle) = state.handles.remove(&name) {
                let _ = handle.try_send(BmcMessage::Stop);
                state.supervisor.stop(handle.actor_id());
                debug!(bmc = %name, "BMC actor retired");
            }
        }
        state.supervisor.reap();
    }

    /// Number of live BMC actors.
    pub async fn running(&self) -> usize {
        self.state.lock().await.supervisor.running_count()
    }

    pub async fn stop_all(&self) {
        let mut state = self.state.lock().await;
        info!(actors = state.handles.len(), "Stopping BMC actors");
        state.handles.clear();
        state.supervisor.stop_all().await;
    }
}
