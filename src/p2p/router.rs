//! Typed message routing over the shared gossipsub topic.
//!
//! One handler per [`MessageKind`]; registration is last-write-wins. Dispatch
//! clones the handler under the read lock and runs it outside any lock, so a
//! concurrent re-registration of the same kind may race with an in-flight
//! dispatch (the old handler can still run once after being replaced). That
//! window is harmless here and accepted.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use libp2p::PeerId;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{TssError, TssResult};
use crate::p2p::messages::{Envelope, MessageKind};
use crate::p2p::network::{NetworkCommand, RawMessage};

/// Inbound handler. Runs on the router task, one message at a time; a slow
/// handler stalls delivery for everything behind it.
pub type Handler = Arc<dyn Fn(Envelope) + Send + Sync>;

/// Cloneable publishing half of the router. Handlers and background tasks hold
/// this instead of the router itself, which keeps ownership acyclic.
#[derive(Clone)]
pub struct EnvelopeSender {
    commands: mpsc::Sender<NetworkCommand>,
}

impl EnvelopeSender {
    /// Serializes and publishes an envelope. Publish failures come back
    /// synchronously through the swarm task's reply channel.
    pub async fn send(&self, envelope: &Envelope) -> TssResult<()> {
        let data = envelope.encode()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(NetworkCommand::Publish {
                data,
                reply: reply_tx,
            })
            .await
            .map_err(|_| TssError::Transport("network task unavailable".into()))?;
        match reply_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TssError::Transport(format!("publish: {e}"))),
            Err(_) => Err(TssError::Transport("network task unavailable".into())),
        }
    }
}

pub struct MessageRouter {
    local_peer_id: PeerId,
    handlers: Arc<RwLock<HashMap<MessageKind, Handler>>>,
    sender: EnvelopeSender,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MessageRouter {
    pub(crate) fn new(local_peer_id: PeerId, commands: mpsc::Sender<NetworkCommand>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            local_peer_id,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            sender: EnvelopeSender { commands },
            shutdown,
            task: Mutex::new(None),
        }
    }

    /// Registers (or replaces) the handler for a message kind.
    pub fn register_handler<F>(&self, kind: MessageKind, handler: F)
    where
        F: Fn(Envelope) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, Arc::new(handler));
    }

    pub fn sender(&self) -> EnvelopeSender {
        self.sender.clone()
    }

    pub async fn send_message(&self, envelope: &Envelope) -> TssResult<()> {
        self.sender.send(envelope).await
    }

    /// Spawns the receive loop over the substrate's raw-message stream.
    pub(crate) async fn start(&self, mut inbound: mpsc::Receiver<RawMessage>) {
        let handlers = Arc::clone(&self.handlers);
        let local = self.local_peer_id;
        let mut shutdown_rx = self.shutdown.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    raw = inbound.recv() => {
                        let Some(raw) = raw else { break };
                        dispatch(&handlers, local, raw);
                    }
                }
            }
        });
        *self.task.lock().await = Some(handle);
    }

    /// Stops the receive loop. Safe to call more than once.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
    }
}

fn dispatch(
    handlers: &RwLock<HashMap<MessageKind, Handler>>,
    local: PeerId,
    raw: RawMessage,
) {
    if raw.source == local {
        return;
    }
    let envelope = match Envelope::decode(&raw.data) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("dropping undecodable message from {}: {e}", raw.source);
            return;
        }
    };
    let handler = handlers
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&envelope.kind)
        .cloned();
    match handler {
        Some(handler) => handler(envelope),
        None => debug!("no handler for {:?}; dropping message", envelope.kind),
    }
}
