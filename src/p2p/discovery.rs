//! Peer discovery.
//!
//! Bootstraps the Kademlia routing table, merges mDNS announcements from the
//! local network, and runs one periodic task that looks up the peers closest
//! to a well-known rendezvous key. Candidates are offered on an output stream
//! with a cancellable send; the stream closes only after the background task
//! has fully exited, so a consumer never observes a send-after-close.

use std::time::Duration;

use libp2p::PeerId;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, warn};

use crate::error::{TssError, TssResult};
use crate::p2p::network::NetworkCommand;

pub const DISCOVERY_INTERVAL: Duration = Duration::from_secs(60);
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Rendezvous key all TSS nodes look up in the routing table.
pub const RENDEZVOUS_KEY: &str = "tss-network";

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub interval: Duration,
    pub lookup_timeout: Duration,
    pub rendezvous: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interval: DISCOVERY_INTERVAL,
            lookup_timeout: DISCOVERY_TIMEOUT,
            rendezvous: RENDEZVOUS_KEY.to_string(),
        }
    }
}

pub struct Discovery {
    local_peer_id: PeerId,
    commands: mpsc::Sender<NetworkCommand>,
    config: DiscoveryConfig,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Discovery {
    pub(crate) fn new(
        local_peer_id: PeerId,
        commands: mpsc::Sender<NetworkCommand>,
        config: DiscoveryConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            local_peer_id,
            commands,
            config,
            shutdown,
            task: Mutex::new(None),
        }
    }

    /// Kicks off a routing-table bootstrap and spawns the discovery loop.
    /// Returns the stream of peer candidates.
    pub(crate) async fn start(
        &self,
        mut mdns_peers: mpsc::Receiver<PeerId>,
    ) -> TssResult<mpsc::Receiver<PeerId>> {
        self.commands
            .send(NetworkCommand::Bootstrap)
            .await
            .map_err(|_| TssError::Transport("network task unavailable".into()))?;

        let (peer_tx, peer_rx) = mpsc::channel(32);
        let mut shutdown_rx = self.shutdown.subscribe();
        let commands = self.commands.clone();
        let config = self.config.clone();
        let local = self.local_peer_id;

        let handle = tokio::spawn(async move {
            let mut ticker = interval(config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut mdns_open = true;

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        for peer in lookup_closest(&commands, &config).await {
                            if peer == local {
                                continue;
                            }
                            if !offer(&peer_tx, &mut shutdown_rx, peer).await {
                                return;
                            }
                        }
                    }
                    found = mdns_peers.recv(), if mdns_open => {
                        match found {
                            Some(peer) if peer != local => {
                                if !offer(&peer_tx, &mut shutdown_rx, peer).await {
                                    return;
                                }
                            }
                            Some(_) => {}
                            None => mdns_open = false,
                        }
                    }
                }
            }
        });
        *self.task.lock().await = Some(handle);
        Ok(peer_rx)
    }

    /// Signals cancellation and waits for the loop to exit. The peer stream
    /// closes when the task drops its sender, never before.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
    }
}

/// Cancellable send: a slow or absent consumer cannot leak the task past
/// shutdown. Returns false when the loop should exit.
async fn offer(
    peer_tx: &mpsc::Sender<PeerId>,
    shutdown_rx: &mut watch::Receiver<bool>,
    peer: PeerId,
) -> bool {
    tokio::select! {
        sent = peer_tx.send(peer) => sent.is_ok(),
        _ = shutdown_rx.changed() => false,
    }
}

/// One bounded-timeout closest-peer lookup. Errors are non-fatal; the caller
/// simply tries again at the next tick.
async fn lookup_closest(
    commands: &mpsc::Sender<NetworkCommand>,
    config: &DiscoveryConfig,
) -> Vec<PeerId> {
    let (reply_tx, reply_rx) = oneshot::channel();
    let command = NetworkCommand::ClosestPeers {
        key: config.rendezvous.clone().into_bytes(),
        reply: reply_tx,
    };
    if commands.send(command).await.is_err() {
        warn!("peer lookup failed: network task unavailable");
        return Vec::new();
    }
    match timeout(config.lookup_timeout, reply_rx).await {
        Ok(Ok(peers)) => {
            debug!("peer lookup returned {} candidates", peers.len());
            peers
        }
        Ok(Err(_)) => {
            warn!("peer lookup reply dropped");
            Vec::new()
        }
        Err(_) => {
            warn!("peer lookup timed out");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::identity::Keypair;

    fn peer() -> PeerId {
        PeerId::from(Keypair::generate_ed25519().public())
    }

    fn config(interval: Duration) -> DiscoveryConfig {
        DiscoveryConfig {
            interval,
            lookup_timeout: Duration::from_millis(200),
            rendezvous: RENDEZVOUS_KEY.to_string(),
        }
    }

    /// Answers every closest-peer lookup with a fixed peer set.
    fn fake_network(
        answer: Vec<PeerId>,
    ) -> (mpsc::Sender<NetworkCommand>, JoinHandle<usize>) {
        let (tx, mut rx) = mpsc::channel(16);
        let responder = tokio::spawn(async move {
            let mut bootstraps = 0usize;
            while let Some(command) = rx.recv().await {
                match command {
                    NetworkCommand::Bootstrap => bootstraps += 1,
                    NetworkCommand::ClosestPeers { reply, .. } => {
                        let _ = reply.send(answer.clone());
                    }
                    _ => {}
                }
            }
            bootstraps
        });
        (tx, responder)
    }

    #[tokio::test]
    async fn periodic_lookup_filters_self() {
        let local = peer();
        let other = peer();
        let (commands, _responder) = fake_network(vec![local, other]);

        let discovery = Discovery::new(local, commands, config(Duration::from_millis(20)));
        let (_mdns_tx, mdns_rx) = mpsc::channel(4);
        let mut peers = discovery.start(mdns_rx).await.unwrap();

        let found = timeout(Duration::from_secs(1), peers.recv())
            .await
            .expect("discovery output")
            .expect("stream open");
        assert_eq!(found, other);

        discovery.stop().await;
    }

    #[tokio::test]
    async fn mdns_candidates_are_merged() {
        let local = peer();
        let neighbour = peer();
        let (commands, _responder) = fake_network(Vec::new());

        let discovery = Discovery::new(local, commands, config(Duration::from_secs(60)));
        let (mdns_tx, mdns_rx) = mpsc::channel(4);
        let mut peers = discovery.start(mdns_rx).await.unwrap();

        mdns_tx.send(local).await.unwrap();
        mdns_tx.send(neighbour).await.unwrap();

        let found = timeout(Duration::from_secs(1), peers.recv())
            .await
            .expect("discovery output")
            .expect("stream open");
        assert_eq!(found, neighbour);

        discovery.stop().await;
    }

    #[tokio::test]
    async fn stop_closes_stream_after_task_exit() {
        let local = peer();
        let (commands, _responder) = fake_network(vec![peer()]);

        let discovery = Discovery::new(local, commands, config(Duration::from_millis(10)));
        let (_mdns_tx, mdns_rx) = mpsc::channel(4);
        let mut peers = discovery.start(mdns_rx).await.unwrap();

        discovery.stop().await;

        // Drain whatever was offered before shutdown; the stream must then end.
        loop {
            match peers.recv().await {
                Some(_) => continue,
                None => break,
            }
        }
    }

    #[tokio::test]
    async fn bootstrap_issued_on_start() {
        let local = peer();
        let (commands, responder) = fake_network(Vec::new());

        let discovery = Discovery::new(local, commands.clone(), config(Duration::from_secs(60)));
        let (_mdns_tx, mdns_rx) = mpsc::channel(4);
        let _peers = discovery.start(mdns_rx).await.unwrap();
        discovery.stop().await;
        drop(discovery);
        drop(commands);

        assert_eq!(responder.await.unwrap(), 1);
    }
}
