//! Broadcast hub: fans node state out to every connected stream.
//!
//! The hub is a single-writer actor. One dispatch task owns the subscriber
//! registry and is reached only through a bounded command mailbox, so the
//! registry needs no lock and every hazard is reduced to message ordering.
//! The dispatch task starts on the node-started signal and stops, terminally,
//! on node-stopped; stopping drops the registry, which closes every
//! subscriber queue and lets the attached HTTP handlers run out.
//!
//! Slow consumers are handled per subscriber: a full queue drops the newest
//! frame for that subscriber only. A later snapshot is always complete, so a
//! dropped frame self-heals without stalling anyone else.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use veil_bus::{EventBus, SubscriptionId};
use veil_core::events::{topic, NatEvent, NodeEvent, NodeStatus, ServiceStatusEvent};
use veil_core::state::NodeState;

use crate::wire::{Envelope, EventKind};

/// Command mailbox depth. Register/deregister/broadcast all share it; a
/// publish burst beyond this drops frames rather than stalling the caller.
const MAILBOX_CAPACITY: usize = 20;

/// Default per-subscriber queue depth.
pub const DEFAULT_SUBSCRIBER_QUEUE: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("broadcast hub is stopped")]
    Stopped,
}

enum HubCommand {
    Register { id: u64, queue: mpsc::Sender<String> },
    Deregister { id: u64 },
    Broadcast { frame: String },
}

/// Fan-out hub for serialized state frames.
pub struct BroadcastHub {
    cmd_tx: mpsc::Sender<HubCommand>,
    cmd_rx: Mutex<Option<mpsc::Receiver<HubCommand>>>,
    stop: CancellationToken,
    queue_capacity: usize,
    next_subscriber: AtomicU64,
}

impl BroadcastHub {
    pub fn new(queue_capacity: usize) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel(MAILBOX_CAPACITY);
        Arc::new(Self {
            cmd_tx,
            cmd_rx: Mutex::new(Some(cmd_rx)),
            stop: CancellationToken::new(),
            queue_capacity,
            next_subscriber: AtomicU64::new(1),
        })
    }

    /// Attach the hub to the bus: lifecycle signals drive start/stop, state
    /// and passthrough events become broadcasts. Returns subscription
    /// handles for teardown.
    pub fn subscribe_bus(self: &Arc<Self>, bus: &EventBus) -> Vec<(&'static str, SubscriptionId)> {
        let mut handles = Vec::new();

        let hub = Arc::clone(self);
        handles.push((
            topic::NODE,
            bus.subscribe::<NodeEvent, _>(topic::NODE, move |event| match event.status {
                NodeStatus::Started => hub.start(),
                NodeStatus::Stopped => hub.stop(),
            }),
        ));

        let hub = Arc::clone(self);
        handles.push((
            topic::STATE,
            bus.subscribe::<NodeState, _>(topic::STATE, move |state| hub.publish_state(state)),
        ));

        let hub = Arc::clone(self);
        handles.push((
            topic::NAT,
            bus.subscribe::<NatEvent, _>(topic::NAT, move |event| {
                hub.publish(EventKind::Nat, event)
            }),
        ));

        let hub = Arc::clone(self);
        handles.push((
            topic::SERVICE_STATUS,
            bus.subscribe::<ServiceStatusEvent, _>(topic::SERVICE_STATUS, move |event| {
                hub.publish(EventKind::ServiceStatus, event)
            }),
        ));

        handles
    }

    /// Spawn the dispatch task. Commands sent before this point have been
    /// queuing in the mailbox and are drained once the task runs. A second
    /// call is a no-op.
    pub fn start(&self) {
        let Some(cmd_rx) = self.cmd_rx.lock().take() else {
            tracing::warn!("broadcast hub already started");
            return;
        };
        if self.stop.is_cancelled() {
            return;
        }
        tracing::debug!("broadcast hub starting");
        tokio::spawn(dispatch(cmd_rx, self.stop.clone()));
    }

    /// Stop the hub. Terminal for this instance and safe to call from any
    /// number of signal paths concurrently.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Serialize the state snapshot and broadcast it as a `state-change`
    /// frame. Non-blocking; a full mailbox drops this one frame.
    pub fn publish_state(&self, state: &NodeState) {
        match Envelope::state_change(state) {
            Ok(envelope) => self.send(&envelope),
            Err(error) => tracing::error!(%error, "state snapshot not serializable, dropped"),
        }
    }

    /// Broadcast an arbitrary payload under the given event kind.
    pub fn publish<T: Serialize>(&self, kind: EventKind, payload: &T) {
        match Envelope::new(kind, payload) {
            Ok(envelope) => self.send(&envelope),
            Err(error) => tracing::error!(%error, ?kind, "payload not serializable, dropped"),
        }
    }

    fn send(&self, envelope: &Envelope) {
        let frame = match serde_json::to_string(envelope) {
            Ok(frame) => frame,
            Err(error) => {
                tracing::error!(%error, "envelope not serializable, dropped");
                return;
            }
        };
        match self.cmd_tx.try_send(HubCommand::Broadcast { frame }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!("hub mailbox full, dropping broadcast");
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("hub stopped, dropping broadcast");
            }
        }
    }

    /// Register a new subscriber. The returned handle yields frames in
    /// publish order and deregisters itself when dropped.
    pub async fn register(&self) -> Result<Subscriber, HubError> {
        if self.stop.is_cancelled() {
            return Err(HubError::Stopped);
        }
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (queue_tx, queue_rx) = mpsc::channel(self.queue_capacity);
        self.cmd_tx
            .send(HubCommand::Register { id, queue: queue_tx })
            .await
            .map_err(|_| HubError::Stopped)?;
        Ok(Subscriber {
            id,
            queue: queue_rx,
            cmd_tx: self.cmd_tx.clone(),
        })
    }
}

/// The dispatch loop: sole owner of the subscriber registry.
async fn dispatch(mut cmd_rx: mpsc::Receiver<HubCommand>, stop: CancellationToken) {
    let mut subscribers: HashMap<u64, mpsc::Sender<String>> = HashMap::new();

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    HubCommand::Register { id, queue } => {
                        subscribers.insert(id, queue);
                        tracing::debug!(subscriber = id, total = subscribers.len(), "subscriber registered");
                    }
                    HubCommand::Deregister { id } => {
                        if subscribers.remove(&id).is_some() {
                            tracing::debug!(subscriber = id, total = subscribers.len(), "subscriber deregistered");
                        }
                    }
                    HubCommand::Broadcast { frame } => {
                        let mut closed = Vec::new();
                        for (id, queue) in &subscribers {
                            match queue.try_send(frame.clone()) {
                                Ok(()) => {}
                                Err(TrySendError::Full(_)) => {
                                    tracing::warn!(subscriber = id, "subscriber queue full, frame dropped");
                                }
                                Err(TrySendError::Closed(_)) => closed.push(*id),
                            }
                        }
                        for id in closed {
                            subscribers.remove(&id);
                            tracing::debug!(subscriber = id, "subscriber gone, pruned");
                        }
                    }
                }
            }
        }
    }

    tracing::debug!(subscribers = subscribers.len(), "broadcast hub stopped");
    // dropping the registry closes every subscriber queue exactly once
}

/// One connected consumer's delivery queue.
pub struct Subscriber {
    id: u64,
    queue: mpsc::Receiver<String>,
    cmd_tx: mpsc::Sender<HubCommand>,
}

impl Subscriber {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next frame, or `None` once the hub has closed the queue.
    pub async fn recv(&mut self) -> Option<String> {
        self.queue.recv().await
    }
}

impl Stream for Subscriber {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.queue.poll_recv(cx)
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        // Best effort: if the mailbox is full the dispatch loop prunes this
        // queue on its next broadcast instead.
        if let Err(TrySendError::Full(cmd)) =
            self.cmd_tx.try_send(HubCommand::Deregister { id: self.id })
        {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let cmd_tx = self.cmd_tx.clone();
                handle.spawn(async move {
                    let _ = cmd_tx.send(cmd).await;
                });
            }
        }
    }
}
