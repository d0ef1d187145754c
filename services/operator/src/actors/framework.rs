//! Minimal actor runtime: a mailbox per actor, a shutdown signal, and a
//! supervisor that owns the spawned tasks.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long `stop_all` waits before aborting stragglers.
const STOP_GRACE: Duration = Duration::from_secs(10);

static NEXT_ACTOR: AtomicU64 = AtomicU64::new(0);

/// Anything that can sit in a mailbox.
pub trait Message: Send + Debug + 'static {}

impl<T: Send + Debug + 'static> Message for T {}

/// What the loop does after a message was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// An actor handles its messages one at a time on its own task.
#[async_trait]
pub trait Actor: Send + 'static {
    type Message: Message;

    /// Short type name, used as the actor id prefix.
    fn name(&self) -> &str;

    /// An error stops the actor.
    async fn handle(&mut self, msg: Self::Message, ctx: &ActorContext) -> Result<Flow, ActorError>;

    async fn on_stop(&mut self, _ctx: &ActorContext) {}
}

pub struct ActorContext {
    pub actor_id: String,
    shutdown: watch::Receiver<bool>,
}

impl ActorContext {
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }
}

#[derive(Debug, Error)]
pub enum ActorError {
    #[error("actor failed: {0}")]
    Failed(String),

    #[error("mailbox full")]
    MailboxFull,

    #[error("actor stopped")]
    ActorStopped,
}

/// Sending side of an actor's mailbox.
pub struct ActorHandle<M: Message> {
    tx: mpsc::Sender<M>,
    actor_id: String,
}

// Derived Clone would require `M: Clone`; messages carry reply channels.
impl<M: Message> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            actor_id: self.actor_id.clone(),
        }
    }
}

impl<M: Message> ActorHandle<M> {
    pub async fn send(&self, msg: M) -> Result<(), ActorError> {
        self.tx.send(msg).await.map_err(|_| ActorError::ActorStopped)
    }

    pub fn try_send(&self, msg: M) -> Result<(), ActorError> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ActorError::MailboxFull,
            mpsc::error::TrySendError::Closed(_) => ActorError::ActorStopped,
        })
    }

    /// True once the actor's loop has exited.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }
}

struct Child {
    task: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl Child {
    fn signal_stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

/// Owns the tasks of every spawned actor.
#[derive(Default)]
pub struct Supervisor {
    children: HashMap<String, Child>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<A: Actor>(&mut self, actor: A, mailbox_size: usize) -> ActorHandle<A::Message> {
        let actor_id = format!(
            "{}-{}",
            actor.name(),
            NEXT_ACTOR.fetch_add(1, Ordering::Relaxed)
        );
        let (tx, rx) = mpsc::channel(mailbox_size);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let ctx = ActorContext {
            actor_id: actor_id.clone(),
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(actor_loop(actor, rx, ctx));
        self.children
            .insert(actor_id.clone(), Child { task, shutdown_tx });
        debug!(actor_id = %actor_id, "Actor spawned");

        ActorHandle { tx, actor_id }
    }

    /// Signal one actor and stop tracking it.
    pub fn stop(&mut self, actor_id: &str) {
        if let Some(child) = self.children.remove(actor_id) {
            child.signal_stop();
        }
    }

    /// Drop children whose loop has exited.
    pub fn reap(&mut self) {
        self.children.retain(|_, child| child.is_running());
    }

    pub async fn stop_all(&mut self) {
        info!(count = self.children.len(), "Stopping all actors");
        for child in self.children.values() {
            child.signal_stop();
        }

        let deadline = tokio::time::Instant::now() + STOP_GRACE;
        for (actor_id, mut child) in self.children.drain() {
            if tokio::time::timeout_at(deadline, &mut child.task).await.is_err() {
                warn!(actor_id = %actor_id, "Actor did not stop in time, aborting");
                child.task.abort();
            }
        }
    }

    pub fn running_count(&self) -> usize {
        self.children.values().filter(|c| c.is_running()).count()
    }
}

async fn actor_loop<A: Actor>(mut actor: A, mut rx: mpsc::Receiver<A::Message>, ctx: ActorContext) {
    let mut shutdown = ctx.shutdown.clone();

    loop {
        let msg = tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            msg = rx.recv() => msg,
        };
        let Some(msg) = msg else { break };

        match actor.handle(msg, &ctx).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Stop) => break,
            Err(e) => {
                error!(actor_id = %ctx.actor_id, error = %e, "Actor failed");
                break;
            }
        }
    }

    // Close before on_stop so senders see the actor as gone right away.
    rx.close();
    actor.on_stop(&ctx).await;
    debug!(actor_id = %ctx.actor_id, "Actor stopped");
}
