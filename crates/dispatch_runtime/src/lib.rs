//! Tokio host for one [DispatchNode].
//!
//! The node runs on its own task. Node time follows the wall clock: every
//! tick drains the broker subscription and runs every event due by
//! `start + elapsed`. Connection servers talk to the task through a
//! [RuntimeHandle]; each call is answered once the node has processed it.

pub mod logging;

use std::time::Duration;

use dispatch_core::broker::Subscription;
use dispatch_core::ecs::{ConnectionId, RidePid, Role};
use dispatch_core::error::DispatchError;
use dispatch_core::node::DispatchNode;
use dispatch_core::registry::SocketHandle;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info};

const INPUT_QUEUE: usize = 1_024;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("node task is not running")]
    Closed,

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

type Inspect = Box<dyn FnOnce(&DispatchNode) + Send>;

enum NodeInput {
    Connect {
        token: String,
        role: Role,
        socket: SocketHandle,
        reply: oneshot::Sender<Result<ConnectionId, DispatchError>>,
    },
    Disconnect {
        connection: ConnectionId,
        reply: oneshot::Sender<Result<(), DispatchError>>,
    },
    Frame {
        connection: ConnectionId,
        frame: Vec<u8>,
    },
    StartDispatch {
        ride: RidePid,
        reply: oneshot::Sender<Result<(), DispatchError>>,
    },
    Inspect(Inspect),
    Shutdown,
}

pub struct NodeRuntime;

impl NodeRuntime {
    /// Move `node` onto a new task fed by `subscription`, advancing every `tick`.
    pub fn spawn(
        node: DispatchNode,
        subscription: Box<dyn Subscription>,
        tick: Duration,
    ) -> RuntimeHandle {
        let (tx, rx) = mpsc::channel(INPUT_QUEUE);
        let task = tokio::spawn(run_node(node, subscription, rx, tick));
        RuntimeHandle { tx, task }
    }
}

/// Client side of a running node.
pub struct RuntimeHandle {
    tx: mpsc::Sender<NodeInput>,
    task: JoinHandle<DispatchNode>,
}

impl RuntimeHandle {
    pub async fn connect(
        &self,
        token: impl Into<String>,
        role: Role,
        socket: SocketHandle,
    ) -> Result<ConnectionId, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.send(NodeInput::Connect {
            token: token.into(),
            role,
            socket,
            reply,
        })
        .await?;
        Ok(rx.await.map_err(|_| RuntimeError::Closed)??)
    }

    pub async fn disconnect(&self, connection: ConnectionId) -> Result<(), RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.send(NodeInput::Disconnect { connection, reply }).await?;
        Ok(rx.await.map_err(|_| RuntimeError::Closed)??)
    }

    /// Hand over a frame read from `connection`'s socket.
    pub async fn frame(&self, connection: ConnectionId, frame: Vec<u8>) -> Result<(), RuntimeError> {
        self.send(NodeInput::Frame { connection, frame }).await
    }

    pub async fn start_dispatch(&self, ride: RidePid) -> Result<(), RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.send(NodeInput::StartDispatch { ride, reply }).await?;
        Ok(rx.await.map_err(|_| RuntimeError::Closed)??)
    }

    /// Run `f` against the node between two events.
    pub async fn inspect<R, F>(&self, f: F) -> Result<R, RuntimeError>
    where
        R: Send + 'static,
        F: FnOnce(&DispatchNode) -> R + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        self.send(NodeInput::Inspect(Box::new(move |node| {
            let _ = reply.send(f(node));
        })))
        .await?;
        rx.await.map_err(|_| RuntimeError::Closed)
    }

    /// Stop the task and get the node back.
    pub async fn shutdown(self) -> Result<DispatchNode, RuntimeError> {
        // The task may already be gone; joining tells.
        let _ = self.tx.send(NodeInput::Shutdown).await;
        self.task.await.map_err(|_| RuntimeError::Closed)
    }

    async fn send(&self, input: NodeInput) -> Result<(), RuntimeError> {
        self.tx.send(input).await.map_err(|_| RuntimeError::Closed)
    }
}

async fn run_node(
    mut node: DispatchNode,
    mut subscription: Box<dyn Subscription>,
    mut rx: mpsc::Receiver<NodeInput>,
    tick: Duration,
) -> DispatchNode {
    let started = Instant::now();
    let base = node.now();
    let node_time = move || {
        let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        base.saturating_add(elapsed)
    };
    let mut interval = time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(node = %node.node_id(), tick_ms = tick.as_millis() as u64, "node task started");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                node.pump(subscription.as_mut());
                let processed = node.run_until(node_time());
                if processed > 0 {
                    debug!(node = %node.node_id(), processed, now = node.now(), "tick");
                }
            }
            input = rx.recv() => {
                let Some(input) = input else {
                    break;
                };
                if !handle_input(&mut node, input) {
                    break;
                }
                node.pump(subscription.as_mut());
                node.run_until(node_time());
            }
        }
    }

    info!(node = %node.node_id(), now = node.now(), "node task stopped");
    node
}

/// Returns `false` when the task should stop.
fn handle_input(node: &mut DispatchNode, input: NodeInput) -> bool {
    match input {
        NodeInput::Connect {
            token,
            role,
            socket,
            reply,
        } => {
            let _ = reply.send(node.connect(&token, role, socket));
        }
        NodeInput::Disconnect { connection, reply } => {
            let _ = reply.send(node.disconnect(connection));
        }
        NodeInput::Frame { connection, frame } => node.receive_frame(connection, frame),
        NodeInput::StartDispatch { ride, reply } => {
            let _ = reply.send(node.start_dispatch(ride));
        }
        NodeInput::Inspect(f) => f(node),
        NodeInput::Shutdown => return false,
    }
    true
}
