//! libp2p substrate facade.
//!
//! All swarm interaction happens on one background task; the rest of the crate
//! talks to it through a command channel and two event streams (raw gossip
//! messages for the router, discovered peers for discovery). The node only
//! ever consumes this narrow interface, so the swarm internals never leak into
//! the coordination logic.

use std::collections::HashMap;

use libp2p::core::{multiaddr::Error as MultiaddrError, upgrade, Multiaddr};
use libp2p::futures::StreamExt;
use libp2p::gossipsub::{
    self, Behaviour as Gossipsub, ConfigBuilder as GossipsubConfigBuilder, IdentTopic,
    MessageAuthenticity, ValidationMode,
};
use libp2p::identity;
use libp2p::kad::{self, store::MemoryStore};
use libp2p::mdns;
use libp2p::noise;
use libp2p::ping;
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::{Config as SwarmConfig, NetworkBehaviour, Swarm, SwarmEvent};
use libp2p::{identify, tcp, yamux, PeerId, Transport};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::error::{TssError, TssResult};
use crate::p2p::messages::TSS_TOPIC;

const IDENTIFY_PROTOCOL: &str = "/tss/1.0.0";

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub listen_addresses: Vec<String>,
    pub bootstrap_peers: Vec<String>,
    pub topic: String,
    pub enable_mdns: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addresses: vec!["/ip4/0.0.0.0/tcp/0".to_string()],
            bootstrap_peers: Vec::new(),
            topic: TSS_TOPIC.to_string(),
            enable_mdns: true,
        }
    }
}

/// Commands accepted by the swarm task.
#[derive(Debug)]
pub(crate) enum NetworkCommand {
    Publish {
        data: Vec<u8>,
        reply: oneshot::Sender<Result<(), String>>,
    },
    Dial(Multiaddr),
    Bootstrap,
    ClosestPeers {
        key: Vec<u8>,
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    Shutdown,
}

/// Raw gossipsub message as handed to the router.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub source: PeerId,
    pub data: Vec<u8>,
}

/// A receiver that can be taken exactly once; each event stream has a single
/// consumer.
type TakeOnce<T> = Mutex<Option<mpsc::Receiver<T>>>;

pub struct Network {
    local_peer_id: PeerId,
    keypair: identity::Keypair,
    command_tx: mpsc::Sender<NetworkCommand>,
    messages_rx: TakeOnce<RawMessage>,
    discovered_rx: TakeOnce<PeerId>,
}

impl Network {
    /// Builds the transport stack, joins the broadcast topic, and spawns the
    /// swarm task. This is the only operation in the crate whose failure is
    /// fatal to startup.
    pub async fn new(keypair: identity::Keypair, config: NetworkConfig) -> TssResult<Self> {
        let peer_id = PeerId::from(keypair.public());

        let transport = tcp::tokio::Transport::new(tcp::Config::default().nodelay(true))
            .upgrade(upgrade::Version::V1)
            .authenticate(
                noise::Config::new(&keypair)
                    .map_err(|e| TssError::Transport(format!("noise config: {e}")))?,
            )
            .multiplex(yamux::Config::default())
            .boxed();

        let gossipsub = build_gossipsub(&keypair)?;
        let mdns = if config.enable_mdns {
            Some(
                mdns::tokio::Behaviour::new(mdns::Config::default(), peer_id)
                    .map_err(TssError::Io)?,
            )
        } else {
            None
        };
        let identify = identify::Behaviour::new(identify::Config::new(
            IDENTIFY_PROTOCOL.into(),
            keypair.public(),
        ));
        let mut kademlia = kad::Behaviour::new(peer_id, MemoryStore::new(peer_id));
        kademlia.set_mode(Some(kad::Mode::Server));

        let behaviour = TssBehaviour {
            gossipsub,
            mdns: Toggle::from(mdns),
            identify,
            ping: ping::Behaviour::default(),
            kademlia,
        };

        let swarm_config = SwarmConfig::with_tokio_executor()
            .with_idle_connection_timeout(std::time::Duration::from_secs(60));
        let mut swarm = Swarm::new(transport, behaviour, peer_id, swarm_config);

        let topic = IdentTopic::new(config.topic.clone());
        swarm
            .behaviour_mut()
            .gossipsub
            .subscribe(&topic)
            .map_err(|e: gossipsub::SubscriptionError| {
                TssError::Transport(format!("subscribe: {e}"))
            })?;

        let listen_addrs = parse_multiaddrs(config.listen_addresses)?;
        if listen_addrs.is_empty() {
            return Err(TssError::Transport(
                "at least one listen address is required".to_string(),
            ));
        }
        for addr in listen_addrs {
            if let Err(e) = Swarm::listen_on(&mut swarm, addr.clone()) {
                warn!("failed to listen on {addr}: {e}");
            }
        }

        let bootstrap_peers = parse_multiaddrs(config.bootstrap_peers)?;

        let (command_tx, command_rx) = mpsc::channel(64);
        let (message_tx, messages_rx) = mpsc::channel(128);
        let (discovered_tx, discovered_rx) = mpsc::channel(128);

        tokio::spawn(run_swarm(
            swarm,
            topic,
            bootstrap_peers,
            command_rx,
            message_tx,
            discovered_tx,
        ));

        Ok(Self {
            local_peer_id: peer_id,
            keypair,
            command_tx,
            messages_rx: Mutex::new(Some(messages_rx)),
            discovered_rx: Mutex::new(Some(discovered_rx)),
        })
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    pub fn keypair(&self) -> &identity::Keypair {
        &self.keypair
    }

    pub fn public_key(&self) -> identity::PublicKey {
        self.keypair.public()
    }

    pub(crate) fn command_sender(&self) -> mpsc::Sender<NetworkCommand> {
        self.command_tx.clone()
    }

    /// Takes the raw-message stream; `None` once taken.
    pub(crate) async fn take_messages(&self) -> Option<mpsc::Receiver<RawMessage>> {
        self.messages_rx.lock().await.take()
    }

    /// Takes the mDNS-discovered-peer stream; `None` once taken.
    pub(crate) async fn take_discovered(&self) -> Option<mpsc::Receiver<PeerId>> {
        self.discovered_rx.lock().await.take()
    }

    pub async fn dial(&self, addr: &str) -> TssResult<()> {
        let addr: Multiaddr = addr
            .parse()
            .map_err(|e: MultiaddrError| TssError::Transport(format!("invalid address: {e}")))?;
        self.command_tx
            .send(NetworkCommand::Dial(addr))
            .await
            .map_err(|_| TssError::Transport("network task unavailable".into()))
    }

    pub async fn shutdown(&self) {
        let _ = self.command_tx.send(NetworkCommand::Shutdown).await;
    }
}

#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "TssEvent")]
struct TssBehaviour {
    gossipsub: Gossipsub,
    mdns: Toggle<mdns::tokio::Behaviour>,
    identify: identify::Behaviour,
    ping: ping::Behaviour,
    kademlia: kad::Behaviour<MemoryStore>,
}

#[allow(clippy::large_enum_variant)]
enum TssEvent {
    Gossipsub(gossipsub::Event),
    Mdns(mdns::Event),
    Identify(identify::Event),
    Ping(ping::Event),
    Kademlia(kad::Event),
}

impl From<gossipsub::Event> for TssEvent {
    fn from(event: gossipsub::Event) -> Self {
        TssEvent::Gossipsub(event)
    }
}

impl From<mdns::Event> for TssEvent {
    fn from(event: mdns::Event) -> Self {
        TssEvent::Mdns(event)
    }
}

impl From<identify::Event> for TssEvent {
    fn from(event: identify::Event) -> Self {
        TssEvent::Identify(event)
    }
}

impl From<ping::Event> for TssEvent {
    fn from(event: ping::Event) -> Self {
        TssEvent::Ping(event)
    }
}

impl From<kad::Event> for TssEvent {
    fn from(event: kad::Event) -> Self {
        TssEvent::Kademlia(event)
    }
}

fn build_gossipsub(keypair: &identity::Keypair) -> TssResult<Gossipsub> {
    let message_authenticity = MessageAuthenticity::Signed(keypair.clone());
    // Mesh parameters sized for small signing groups (parties of 3-10 peers).
    // Constraint: mesh_outbound_min <= mesh_n_low <= mesh_n <= mesh_n_high.
    let config = GossipsubConfigBuilder::default()
        .validation_mode(ValidationMode::Strict)
        .mesh_outbound_min(1)
        .mesh_n_low(1)
        .mesh_n(3)
        .mesh_n_high(5)
        .heartbeat_interval(std::time::Duration::from_secs(1))
        .build()
        .map_err(|e: gossipsub::ConfigBuilderError| {
            TssError::Transport(format!("gossipsub config: {e}"))
        })?;
    Gossipsub::new(message_authenticity, config)
        .map_err(|e: &'static str| TssError::Transport(e.to_string()))
}

fn parse_multiaddrs(addrs: Vec<String>) -> TssResult<Vec<Multiaddr>> {
    addrs
        .into_iter()
        .map(|addr| {
            addr.parse::<Multiaddr>()
                .map_err(|e: MultiaddrError| TssError::Transport(format!("invalid address: {e}")))
        })
        .collect()
}

async fn run_swarm(
    mut swarm: Swarm<TssBehaviour>,
    topic: IdentTopic,
    bootstrap: Vec<Multiaddr>,
    mut command_rx: mpsc::Receiver<NetworkCommand>,
    message_tx: mpsc::Sender<RawMessage>,
    discovered_tx: mpsc::Sender<PeerId>,
) {
    let mut pending_lookups: HashMap<kad::QueryId, oneshot::Sender<Vec<PeerId>>> = HashMap::new();

    for addr in bootstrap {
        if let Err(e) = Swarm::dial(&mut swarm, addr.clone()) {
            warn!("bootstrap dial failed for {addr}: {e}");
        }
    }

    loop {
        tokio::select! {
            Some(command) = command_rx.recv() => {
                match command {
                    NetworkCommand::Publish { data, reply } => {
                        let result = swarm
                            .behaviour_mut()
                            .gossipsub
                            .publish(topic.clone(), data)
                            .map(|_| ())
                            .map_err(|e| e.to_string());
                        let _ = reply.send(result);
                    }
                    NetworkCommand::Dial(addr) => {
                        if let Err(e) = Swarm::dial(&mut swarm, addr.clone()) {
                            warn!("dial failed for {addr}: {e}");
                        }
                    }
                    NetworkCommand::Bootstrap => {
                        if let Err(e) = swarm.behaviour_mut().kademlia.bootstrap() {
                            debug!("kademlia bootstrap skipped: {e}");
                        }
                    }
                    NetworkCommand::ClosestPeers { key, reply } => {
                        let query_id = swarm.behaviour_mut().kademlia.get_closest_peers(key);
                        pending_lookups.insert(query_id, reply);
                    }
                    NetworkCommand::Shutdown => break,
                }
            }
            event = swarm.select_next_some() => {
                match event {
                    SwarmEvent::Behaviour(TssEvent::Gossipsub(gossipsub::Event::Message {
                        propagation_source,
                        message,
                        ..
                    })) => {
                        let raw = RawMessage {
                            source: propagation_source,
                            data: message.data,
                        };
                        if message_tx.send(raw).await.is_err() {
                            debug!("message consumer gone; dropping inbound gossip");
                        }
                    }
                    SwarmEvent::Behaviour(TssEvent::Kademlia(kad::Event::OutboundQueryProgressed {
                        id,
                        result: kad::QueryResult::GetClosestPeers(result),
                        step,
                        ..
                    })) => {
                        if step.last {
                            if let Some(reply) = pending_lookups.remove(&id) {
                                let _ = reply.send(closest_peer_ids(result));
                            }
                        }
                    }
                    SwarmEvent::Behaviour(TssEvent::Identify(identify::Event::Received {
                        peer_id,
                        info,
                        ..
                    })) => {
                        for addr in info.listen_addrs {
                            swarm.behaviour_mut().kademlia.add_address(&peer_id, addr);
                        }
                    }
                    SwarmEvent::Behaviour(TssEvent::Mdns(event)) => {
                        handle_mdns_event(&mut swarm, event, &discovered_tx);
                    }
                    SwarmEvent::NewListenAddr { address, .. } => {
                        info!("listening on {address}");
                    }
                    SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                        debug!("connection established with {peer_id}");
                    }
                    SwarmEvent::ConnectionClosed { peer_id, .. } => {
                        debug!("connection closed with {peer_id}");
                    }
                    _ => {}
                }
            }
        }
    }
    debug!("swarm task exited");
}

fn closest_peer_ids(
    result: Result<kad::GetClosestPeersOk, kad::GetClosestPeersError>,
) -> Vec<PeerId> {
    let peers = match result {
        Ok(ok) => ok.peers,
        // A timed-out query still reports the peers found so far.
        Err(kad::GetClosestPeersError::Timeout { peers, .. }) => peers,
    };
    peers.into_iter().map(|info| info.peer_id).collect()
}

fn handle_mdns_event(
    swarm: &mut Swarm<TssBehaviour>,
    event: mdns::Event,
    discovered_tx: &mpsc::Sender<PeerId>,
) {
    match event {
        mdns::Event::Discovered(list) => {
            for (peer, addr) in list {
                debug!("mDNS discovered {peer} at {addr}");
                swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer);
                swarm.behaviour_mut().kademlia.add_address(&peer, addr.clone());
                if discovered_tx.try_send(peer).is_err() {
                    debug!("discovery consumer busy; dropping mDNS candidate");
                }

                // Dial from the lower peer id only, so two peers discovering
                // each other at once do not race to connect.
                if !swarm.is_connected(&peer) && *swarm.local_peer_id() < peer {
                    if let Err(e) = Swarm::dial(swarm, addr.clone()) {
                        debug!("mDNS dial failed for {addr}: {e}");
                    }
                }
            }
        }
        mdns::Event::Expired(list) => {
            for (peer, _addr) in list {
                debug!("mDNS entry expired for {peer}");
                swarm.behaviour_mut().gossipsub.remove_explicit_peer(&peer);
            }
        }
    }
}
