//! Per-BMC actor.
//!
//! One actor owns all passes for one BMC record, so two passes for the
//! same BMC never overlap. Different BMCs run concurrently.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, info};

use super::framework::{Actor, ActorContext, ActorError, Flow};
use crate::engine::{self, EngineError, PassReport, ReconcileContext, Trigger};

/// Messages for a [`BmcActor`].
#[derive(Debug)]
pub enum BmcMessage {
    /// Run one pass and reply with its report.
    Reconcile {
        trigger: Trigger,
        reply_to: oneshot::Sender<Result<PassReport, EngineError>>,
    },

    /// Stop the actor.
    Stop,
}

pub struct BmcActor {
    bmc: String,
    ctx: Arc<ReconcileContext>,
    passes: u64,
}

impl BmcActor {
    pub fn new(bmc: impl Into<String>, ctx: Arc<ReconcileContext>) -> Self {
        Self {
            bmc: bmc.into(),
            ctx,
            passes: 0,
        }
    }

    pub fn bmc(&self) -> &str {
        &self.bmc
    }
}

#[async_trait]
impl Actor for BmcActor {
    type Message = BmcMessage;

    fn name(&self) -> &str {
        "bmc"
    }

    async fn handle(&mut self, msg: BmcMessage, ctx: &ActorContext) -> Result<Flow, ActorError> {
        match msg {
            BmcMessage::Reconcile { trigger, reply_to } => {
                if ctx.is_shutdown() {
                    return Ok(Flow::Stop);
                }
                self.passes += 1;
                let result = engine::reconcile_bmc(&self.ctx, &self.bmc, trigger).await;
                let removed = matches!(&result, Ok(report) if report.removed);
                let _ = reply_to.send(result);

                if removed {
                    info!(bmc = %self.bmc, "BMC record removed, actor stopping");
                    return Ok(Flow::Stop);
                }
                Ok(Flow::Continue)
            }
            BmcMessage::Stop => {
                debug!(bmc = %self.bmc, "Stop requested");
                Ok(Flow::Stop)
            }
        }
    }

    async fn on_stop(&mut self, ctx: &ActorContext) {
        debug!(
            bmc = %self.bmc,
            actor_id = %ctx.actor_id,
            passes = self.passes,
            "BMC actor stopped"
        );
    }
}
