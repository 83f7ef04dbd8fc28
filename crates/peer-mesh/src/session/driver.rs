//! Session event loop
//!
//! One task per joined session. It feeds relay events, link reports, fired
//! timers and caller commands into [`MeshCore`] one at a time and executes
//! the resulting actions: spawning and stopping link workers, queuing link
//! operations, talking to the relay, arming timers and publishing events.

use super::events::MeshEvent;
use super::machine::MeshCore;
use super::worker;
use crate::actions::{Action, Actions, LinkOp};
use crate::backend::{LinkEventSink, LinkSignal, LinkSpec, RtcBackend};
use crate::channels::AppMessage;
use crate::config::MeshConfig;
use crate::media::MediaGate;
use crate::participant::PeerId;
use crate::peer::PeerSummary;
use crate::signaling::{RelayEvent, SignalingTransport};
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

/// Request from the session handle to its event loop
pub(crate) enum Command {
    SendApp {
        message: AppMessage,
        reply: oneshot::Sender<Result<AppMessage>>,
    },
    SetMuted {
        muted: bool,
        reply: oneshot::Sender<()>,
    },
    Peers(oneshot::Sender<Vec<PeerSummary>>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug)]
pub(crate) struct TimerFired {
    peer_id: PeerId,
    generation: u64,
    token: u64,
}

struct WorkerHandle {
    generation: u64,
    ops: mpsc::UnboundedSender<LinkOp>,
}

struct ArmedTimer {
    generation: u64,
    token: u64,
    handle: AbortHandle,
}

pub(crate) struct Driver {
    core: MeshCore,
    config: MeshConfig,
    signaling: Arc<dyn SignalingTransport>,
    backend: Arc<dyn RtcBackend>,
    media: Arc<MediaGate>,
    events: mpsc::UnboundedSender<MeshEvent>,
    link_tx: mpsc::UnboundedSender<LinkSignal>,
    timer_tx: mpsc::UnboundedSender<TimerFired>,
    workers: HashMap<PeerId, WorkerHandle>,
    timers: HashMap<PeerId, ArmedTimer>,
}

impl Driver {
    pub(crate) fn new(
        core: MeshCore,
        config: MeshConfig,
        signaling: Arc<dyn SignalingTransport>,
        backend: Arc<dyn RtcBackend>,
        media: Arc<MediaGate>,
        events: mpsc::UnboundedSender<MeshEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<LinkSignal>, mpsc::UnboundedReceiver<TimerFired>) {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let driver = Self {
            core,
            config,
            signaling,
            backend,
            media,
            events,
            link_tx,
            timer_tx,
            workers: HashMap::new(),
            timers: HashMap::new(),
        };
        (driver, link_rx, timer_rx)
    }

    /// Run until shutdown or until the session handle is dropped
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut relay: mpsc::UnboundedReceiver<RelayEvent>,
        mut links: mpsc::UnboundedReceiver<LinkSignal>,
        mut fired: mpsc::UnboundedReceiver<TimerFired>,
    ) {
        info!(local_id = self.core.local_id(), "Mesh event loop started");
        let mut relay_open = true;

        loop {
            let mut out = Actions::default();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::SendApp { message, reply }) => {
                        let result = self.core.send_app_message(message, &mut out);
                        self.execute(std::mem::take(&mut out)).await;
                        let _ = reply.send(result);
                    }
                    Some(Command::SetMuted { muted, reply }) => {
                        self.media.set_muted(muted).await;
                        self.core.set_muted(muted, &mut out);
                        self.execute(std::mem::take(&mut out)).await;
                        let _ = reply.send(());
                    }
                    Some(Command::Peers(reply)) => {
                        let _ = reply.send(self.core.peers());
                    }
                    Some(Command::Shutdown(reply)) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        debug!("Session handle dropped");
                        self.shutdown().await;
                        break;
                    }
                },

                event = relay.recv(), if relay_open => match event {
                    Some(RelayEvent::Presence(presence)) => self.core.on_presence(presence, &mut out),
                    Some(RelayEvent::Signal(envelope)) => self.core.on_signal(envelope, &mut out),
                    Some(RelayEvent::Broadcast(payload)) => self.core.on_broadcast(payload, &mut out),
                    None => {
                        warn!("Relay subscription ended");
                        relay_open = false;
                    }
                },

                Some(signal) = links.recv() => self.core.on_link_event(signal, &mut out),

                Some(timer) = fired.recv() => {
                    let current = matches!(
                        self.timers.get(&timer.peer_id),
                        Some(armed) if armed.token == timer.token
                    );
                    if current {
                        self.timers.remove(&timer.peer_id);
                    }
                    self.core.on_timer(&timer.peer_id, timer.generation, timer.token, &mut out);
                }
            }
            self.execute(out).await;
        }

        info!(local_id = self.core.local_id(), "Mesh event loop stopped");
    }

    async fn shutdown(&mut self) {
        let mut out = Actions::default();
        self.core.shutdown(&mut out);
        self.execute(out).await;
        for (_, timer) in self.timers.drain() {
            timer.handle.abort();
        }
        let remaining: Vec<PeerId> = self.workers.drain().map(|(peer_id, _)| peer_id).collect();
        for peer_id in remaining {
            self.media.detach(&peer_id).await;
        }
    }

    async fn execute(&mut self, actions: Actions) {
        for action in actions {
            match action {
                Action::OpenLink {
                    peer_id,
                    generation,
                    role,
                } => {
                    let local_media = self.media.attach(&peer_id).await;
                    let spec = LinkSpec::new(
                        &self.config,
                        self.core.local_id(),
                        &peer_id,
                        generation,
                        role,
                        local_media,
                    );
                    let sink = LinkEventSink::new(&peer_id, generation, self.link_tx.clone());
                    let (ops_tx, ops_rx) = mpsc::unbounded_channel();
                    tokio::spawn(worker::run_link(
                        Arc::clone(&self.backend),
                        spec,
                        sink,
                        ops_rx,
                    ));
                    debug!(peer_id = %peer_id, generation, ?role, "Spawned link worker");
                    self.workers.insert(
                        peer_id,
                        WorkerHandle {
                            generation,
                            ops: ops_tx,
                        },
                    );
                }
                Action::CloseLink {
                    peer_id,
                    generation,
                } => {
                    if matches!(self.timers.get(&peer_id), Some(t) if t.generation == generation) {
                        if let Some(timer) = self.timers.remove(&peer_id) {
                            timer.handle.abort();
                        }
                    }
                    if matches!(self.workers.get(&peer_id), Some(w) if w.generation == generation) {
                        // Dropping the sender stops the worker, which closes its connection
                        self.workers.remove(&peer_id);
                        self.media.detach(&peer_id).await;
                        debug!(peer_id = %peer_id, generation, "Stopped link worker");
                    }
                }
                Action::Op {
                    peer_id,
                    generation,
                    op,
                } => match self.workers.get(&peer_id) {
                    Some(worker) if worker.generation == generation => {
                        if worker.ops.send(op).is_err() {
                            debug!(peer_id = %peer_id, generation, "Link worker already gone");
                        }
                    }
                    _ => trace!(peer_id = %peer_id, generation, op = op.name(), "Dropping op for stale link"),
                },
                Action::Signal(envelope) => {
                    let kind = envelope.kind;
                    if let Err(e) = self.signaling.send_signal(envelope).await {
                        warn!(?kind, error = %e, "Failed to send signal");
                    }
                }
                Action::Broadcast(payload) => {
                    if let Err(e) = self.signaling.broadcast(payload).await {
                        warn!(error = %e, "Failed to broadcast app message");
                    }
                }
                Action::ArmTimer {
                    peer_id,
                    generation,
                    token,
                    after,
                } => {
                    if let Some(old) = self.timers.remove(&peer_id) {
                        old.handle.abort();
                    }
                    let tx = self.timer_tx.clone();
                    let fired = TimerFired {
                        peer_id: peer_id.clone(),
                        generation,
                        token,
                    };
                    let task = tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        let _ = tx.send(fired);
                    });
                    self.timers.insert(
                        peer_id,
                        ArmedTimer {
                            generation,
                            token,
                            handle: task.abort_handle(),
                        },
                    );
                }
                Action::CancelTimer { peer_id } => {
                    if let Some(timer) = self.timers.remove(&peer_id) {
                        timer.handle.abort();
                    }
                }
                Action::Emit(event) => {
                    let _ = self.events.send(event);
                }
            }
        }
    }
}
