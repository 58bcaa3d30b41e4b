//! Node composition: wires the network substrate, discovery, router, party
//! manager, security layer, and protocol engine together.
//!
//! Every protocol payload crosses the wire as a secure envelope: the plaintext
//! is encrypted for the recipient, the ciphertext is signed, and the two are
//! joined as `ciphertext ‖ delimiter ‖ signature`. Inbound envelopes are
//! verified before any decryption is attempted, and the two failure modes stay
//! distinguishable. Fan-out to party members is explicit best effort: each
//! send is spawned independently and a failed send only logs.

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};

use libp2p::identity::Keypair;
use libp2p::PeerId;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::{EngineOutput, ProtocolEngine};
use crate::error::{CryptoError, TssError, TssResult};
use crate::p2p::discovery::{Discovery, DiscoveryConfig};
use crate::p2p::messages::{Destination, Envelope, MessageKind, PartyDescriptor, PartyNotice, ProtocolPayload};
use crate::p2p::network::{Network, NetworkConfig};
use crate::p2p::router::{EnvelopeSender, MessageRouter};
use crate::party::{Party, PartyConfig, PartyEvent, PartyManager, PartyStatus, TssOperation};
use crate::security::{peer_public_key, SecurityLayer};

/// Separates ciphertext from the trailing signature in a secure payload.
const SIGNATURE_DELIMITER: &[u8] = b"|sig|";

/// ed25519 signatures are always 64 bytes, which is what makes the trailing
/// split unambiguous even when the ciphertext contains the delimiter bytes.
const SIGNATURE_LEN: usize = 64;

#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    pub network: NetworkConfig,
    pub discovery: DiscoveryConfig,
    pub party: PartyConfig,
}

pub struct Node {
    network: Arc<Network>,
    router: Arc<MessageRouter>,
    discovery: Arc<Discovery>,
    parties: PartyManager,
    security: Arc<SecurityLayer>,
    engine: Arc<dyn ProtocolEngine>,
    /// Peers seen by discovery. Invitation policy stays with the caller; the
    /// node only tracks candidates.
    known_peers: Arc<RwLock<HashSet<PeerId>>>,
    /// Parties this node created; only their `Ready` events trigger readiness
    /// notices to the other members.
    initiated: Arc<RwLock<HashSet<String>>>,
    party_events: Mutex<Option<mpsc::UnboundedReceiver<PartyEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Builds the node. Substrate construction is the only fatal failure; from
    /// here on, errors are per-operation.
    pub async fn new(
        keypair: Keypair,
        config: NodeConfig,
        engine: Arc<dyn ProtocolEngine>,
    ) -> TssResult<Self> {
        let security = Arc::new(SecurityLayer::new(keypair.clone())?);
        let network = Arc::new(Network::new(keypair, config.network).await?);
        let local_peer_id = network.local_peer_id();

        let (parties, party_events) = PartyManager::with_config(config.party);
        let router = Arc::new(MessageRouter::new(local_peer_id, network.command_sender()));
        let discovery = Arc::new(Discovery::new(
            local_peer_id,
            network.command_sender(),
            config.discovery,
        ));

        register_handlers(
            &router,
            parties.clone(),
            Arc::clone(&security),
            Arc::clone(&engine),
            local_peer_id,
        );

        Ok(Self {
            network,
            router,
            discovery,
            parties,
            security,
            engine,
            known_peers: Arc::new(RwLock::new(HashSet::new())),
            initiated: Arc::new(RwLock::new(HashSet::new())),
            party_events: Mutex::new(Some(party_events)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Starts discovery, the router loop, and the two bridge tasks (peer
    /// candidates and party lifecycle events).
    pub async fn start(&self) -> TssResult<()> {
        let mdns_rx = self
            .network
            .take_discovered()
            .await
            .ok_or_else(|| TssError::Transport("node already started".into()))?;
        let inbound = self
            .network
            .take_messages()
            .await
            .ok_or_else(|| TssError::Transport("node already started".into()))?;

        let mut peers_rx = self.discovery.start(mdns_rx).await?;
        self.router.start(inbound).await;

        let known = Arc::clone(&self.known_peers);
        let peer_bridge = tokio::spawn(async move {
            while let Some(peer) = peers_rx.recv().await {
                let inserted = known
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(peer);
                if inserted {
                    info!(%peer, "discovered peer");
                }
            }
        });

        let mut events_rx = self
            .party_events
            .lock()
            .await
            .take()
            .ok_or_else(|| TssError::Transport("node already started".into()))?;
        let sender = self.router.sender();
        let security = Arc::clone(&self.security);
        let initiated = Arc::clone(&self.initiated);
        let local = self.local_peer_id();
        let event_bridge = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    PartyEvent::Ready(party) => {
                        let ours = initiated
                            .read()
                            .unwrap_or_else(PoisonError::into_inner)
                            .contains(&party.id);
                        if ours {
                            notify_members(
                                &sender,
                                &security,
                                local,
                                &party,
                                &PartyNotice::Ready,
                            )
                            .await;
                        }
                    }
                    PartyEvent::Failed { party_id } => {
                        initiated
                            .write()
                            .unwrap_or_else(PoisonError::into_inner)
                            .remove(&party_id);
                        warn!(%party_id, "party failed to form");
                    }
                }
            }
        });

        self.tasks.lock().await.push(peer_bridge);
        self.tasks.lock().await.push(event_bridge);
        info!(peer_id = %self.local_peer_id(), "node started");
        Ok(())
    }

    /// Stops the router and discovery loops, then shuts the swarm down.
    pub async fn stop(&self) {
        self.router.stop().await;
        self.discovery.stop().await;
        self.network.shutdown().await;
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        info!("node stopped");
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.network.local_peer_id()
    }

    pub fn known_peers(&self) -> Vec<PeerId> {
        self.known_peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    pub async fn dial(&self, addr: &str) -> TssResult<()> {
        self.network.dial(addr).await
    }

    /// Creates a party with this node as initiator and invites every other
    /// member with a secure formation notice.
    pub async fn create_party(
        &self,
        mut members: Vec<PeerId>,
        threshold: usize,
        operation: TssOperation,
    ) -> TssResult<Party> {
        let local = self.local_peer_id();
        if !members.contains(&local) {
            members.push(local);
        }
        let party = self
            .parties
            .create_party(local, members, threshold, operation)?;
        self.initiated
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(party.id.clone());

        let invite = PartyNotice::Invite(PartyDescriptor::from_party(&party));
        notify_members(&self.router.sender(), &self.security, local, &party, &invite).await;
        Ok(party)
    }

    /// Moves a `Ready` party to `Active` and sends the key-generation start
    /// message to every other member, then runs the local engine's round.
    pub async fn initiate_key_generation(&self, party_id: &str) -> TssResult<()> {
        self.initiate(party_id, ProtocolPayload::StartKeyGen, MessageKind::KeyGeneration)
            .await
    }

    /// Like key generation, but for a signing round over `message`.
    pub async fn initiate_signing(&self, party_id: &str, message: Vec<u8>) -> TssResult<()> {
        self.initiate(
            party_id,
            ProtocolPayload::StartSigning { message },
            MessageKind::Signing,
        )
        .await
    }

    async fn initiate(
        &self,
        party_id: &str,
        start: ProtocolPayload,
        kind: MessageKind,
    ) -> TssResult<()> {
        let party = self.parties.get_party(party_id)?;
        if party.status != PartyStatus::Ready {
            return Err(TssError::Validation(format!(
                "party {party_id} is {} (must be ready)",
                party.status
            )));
        }
        self.parties
            .update_party_status(party_id, PartyStatus::Active)?;

        let local = self.local_peer_id();
        let payload = encode_payload(&start)?;
        for member in party.members.iter().filter(|m| **m != local) {
            match seal_for(&self.security, &payload, member) {
                Ok(sealed) => {
                    let envelope = Envelope {
                        kind,
                        party_id: party.id.clone(),
                        from: local.to_string(),
                        to: Destination::Unicast(member.to_string()),
                        payload: sealed,
                    };
                    if let Err(e) = self.router.sender().send(&envelope).await {
                        warn!(party_id, %member, "start message failed: {e}");
                    }
                }
                Err(e) => warn!(party_id, %member, "could not seal start message: {e}"),
            }
        }

        // The initiator runs its own round immediately.
        let outputs = self.engine.handle_message(&party, &local, kind, &start)?;
        fan_out(
            self.router.sender(),
            Arc::clone(&self.security),
            local,
            party,
            outputs,
        );
        Ok(())
    }

    pub fn get_party(&self, party_id: &str) -> TssResult<Party> {
        self.parties.get_party(party_id)
    }

    pub fn get_all_parties(&self) -> Vec<Party> {
        self.parties.get_all_parties()
    }

    pub fn get_peer_parties(&self, peer: &PeerId) -> Vec<String> {
        self.parties.get_peer_parties(peer)
    }

    pub fn update_party_status(&self, party_id: &str, status: PartyStatus) -> TssResult<()> {
        self.parties.update_party_status(party_id, status)
    }
}

/// Encrypt-then-sign: the signature covers the ciphertext, so verification
/// happens without touching the plaintext.
fn seal_secure(
    security: &SecurityLayer,
    plaintext: &[u8],
    peer_pub: &libp2p::identity::PublicKey,
) -> TssResult<Vec<u8>> {
    let ciphertext = security.encrypt_message(plaintext, peer_pub)?;
    let signature = security.sign_message(&ciphertext)?;
    let mut blob =
        Vec::with_capacity(ciphertext.len() + SIGNATURE_DELIMITER.len() + signature.len());
    blob.extend_from_slice(&ciphertext);
    blob.extend_from_slice(SIGNATURE_DELIMITER);
    blob.extend_from_slice(&signature);
    Ok(blob)
}

/// Verify-then-decrypt. A bad signature fails with `InvalidSignature` before
/// any decryption is attempted; a good signature over tampered ciphertext
/// fails later with `DecryptionFailed`.
fn open_secure(
    security: &SecurityLayer,
    blob: &[u8],
    peer_pub: &libp2p::identity::PublicKey,
) -> TssResult<Vec<u8>> {
    let (ciphertext, signature) = split_secure_payload(blob)?;
    if !security.verify_signature(ciphertext, signature, peer_pub) {
        return Err(TssError::Crypto(CryptoError::InvalidSignature));
    }
    security.decrypt_message(ciphertext, peer_pub)
}

/// Splits `ciphertext ‖ delimiter ‖ signature`. The signature length is fixed,
/// so the split is taken from the end; delimiter bytes occurring inside the
/// binary ciphertext cannot shift it.
fn split_secure_payload(blob: &[u8]) -> TssResult<(&[u8], &[u8])> {
    let min_len = SIGNATURE_DELIMITER.len() + SIGNATURE_LEN;
    if blob.len() < min_len {
        return Err(TssError::Crypto(CryptoError::MalformedPayload));
    }
    let sig_start = blob.len() - SIGNATURE_LEN;
    let delim_start = sig_start - SIGNATURE_DELIMITER.len();
    if &blob[delim_start..sig_start] != SIGNATURE_DELIMITER {
        return Err(TssError::Crypto(CryptoError::MalformedPayload));
    }
    Ok((&blob[..delim_start], &blob[sig_start..]))
}

fn seal_for(security: &SecurityLayer, plaintext: &[u8], peer: &PeerId) -> TssResult<Vec<u8>> {
    let peer_pub = peer_public_key(peer)?;
    seal_secure(security, plaintext, &peer_pub)
}

fn encode_payload<T: serde::Serialize>(payload: &T) -> TssResult<Vec<u8>> {
    bincode::serialize(payload).map_err(|e| TssError::Transport(format!("encode payload: {e}")))
}

/// Sends a formation notice to every member except the sender, sealed per
/// recipient. Best effort: failures log and the remaining sends continue.
async fn notify_members(
    sender: &EnvelopeSender,
    security: &SecurityLayer,
    local: PeerId,
    party: &Party,
    notice: &PartyNotice,
) {
    let payload = match encode_payload(notice) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(party_id = %party.id, "could not encode formation notice: {e}");
            return;
        }
    };
    for member in party.members.iter().filter(|m| **m != local) {
        match seal_for(security, &payload, member) {
            Ok(sealed) => {
                let envelope = Envelope {
                    kind: MessageKind::PartyFormation,
                    party_id: party.id.clone(),
                    from: local.to_string(),
                    to: Destination::Unicast(member.to_string()),
                    payload: sealed,
                };
                if let Err(e) = sender.send(&envelope).await {
                    warn!(party_id = %party.id, %member, "formation notice failed: {e}");
                }
            }
            Err(e) => {
                warn!(party_id = %party.id, %member, "could not seal formation notice: {e}")
            }
        }
    }
}

/// Fans engine outputs out to their recipients as fresh secure envelopes. Each
/// send runs on its own task; delivery order across recipients is arbitrary.
fn fan_out(
    sender: EnvelopeSender,
    security: Arc<SecurityLayer>,
    local: PeerId,
    party: Party,
    outputs: Vec<EngineOutput>,
) {
    for output in outputs {
        let recipients: Vec<PeerId> = match &output.to {
            Destination::Unicast(target) => match target.parse::<PeerId>() {
                Ok(peer) => vec![peer],
                Err(_) => {
                    warn!(party_id = %party.id, %target, "engine produced an invalid recipient");
                    continue;
                }
            },
            Destination::Broadcast => party
                .members
                .iter()
                .filter(|m| **m != local)
                .copied()
                .collect(),
        };
        let payload = match encode_payload(&output.payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(party_id = %party.id, "could not encode engine output: {e}");
                continue;
            }
        };
        for peer in recipients {
            let sealed = match seal_for(&security, &payload, &peer) {
                Ok(sealed) => sealed,
                Err(e) => {
                    warn!(party_id = %party.id, %peer, "could not seal engine output: {e}");
                    continue;
                }
            };
            let envelope = Envelope {
                kind: output.kind,
                party_id: party.id.clone(),
                from: local.to_string(),
                to: Destination::Unicast(peer.to_string()),
                payload: sealed,
            };
            let sender = sender.clone();
            tokio::spawn(async move {
                if let Err(e) = sender.send(&envelope).await {
                    warn!(party_id = %envelope.party_id, %peer, "share delivery failed: {e}");
                }
            });
        }
    }
}

/// Installs the router handlers. Each closure captures only the sub-components
/// it needs, never the node itself.
fn register_handlers(
    router: &MessageRouter,
    parties: PartyManager,
    security: Arc<SecurityLayer>,
    engine: Arc<dyn ProtocolEngine>,
    local: PeerId,
) {
    let sender = router.sender();

    {
        let parties = parties.clone();
        let security = Arc::clone(&security);
        router.register_handler(MessageKind::PartyFormation, move |envelope| {
            handle_formation(&parties, &security, &sender, local, envelope);
        });
    }

    for kind in [MessageKind::KeyGeneration, MessageKind::Signing] {
        let parties = parties.clone();
        let security = Arc::clone(&security);
        let engine = Arc::clone(&engine);
        let sender = router.sender();
        router.register_handler(kind, move |envelope| {
            handle_protocol(&parties, &security, &engine, &sender, local, envelope);
        });
    }
}

fn handle_formation(
    parties: &PartyManager,
    security: &Arc<SecurityLayer>,
    sender: &EnvelopeSender,
    local: PeerId,
    envelope: Envelope,
) {
    let Some((from, plaintext)) = unwrap_envelope(security, local, &envelope) else {
        return;
    };
    let notice: PartyNotice = match bincode::deserialize(&plaintext) {
        Ok(notice) => notice,
        Err(e) => {
            warn!(party_id = %envelope.party_id, "undecodable formation notice: {e}");
            return;
        }
    };

    match notice {
        PartyNotice::Invite(descriptor) => {
            let party = match descriptor.to_party() {
                Ok(party) => party,
                Err(e) => {
                    warn!(party_id = %envelope.party_id, "invalid party invite: {e}");
                    return;
                }
            };
            if !party.members.contains(&local) {
                debug!(party_id = %party.id, "ignoring invite for a party we are not in");
                return;
            }
            if party.initiator != from {
                warn!(party_id = %party.id, %from, "invite not signed by its initiator");
                return;
            }
            let party_id = party.id.clone();
            if let Err(e) = parties.register_party(party) {
                warn!(%party_id, "could not register invited party: {e}");
                return;
            }
            info!(%party_id, initiator = %from, "joined party, acking");

            // Ack back to the initiator off the dispatch path.
            let security = Arc::clone(security);
            let sender = sender.clone();
            tokio::spawn(async move {
                let Ok(payload) = encode_payload(&PartyNotice::Ack) else {
                    return;
                };
                match seal_for(&security, &payload, &from) {
                    Ok(sealed) => {
                        let envelope = Envelope {
                            kind: MessageKind::PartyFormation,
                            party_id: party_id.clone(),
                            from: local.to_string(),
                            to: Destination::Unicast(from.to_string()),
                            payload: sealed,
                        };
                        if let Err(e) = sender.send(&envelope).await {
                            warn!(%party_id, "formation ack failed: {e}");
                        }
                    }
                    Err(e) => warn!(%party_id, "could not seal formation ack: {e}"),
                }
            });
        }
        PartyNotice::Ack => {
            if let Err(e) = parties.record_formation_ack(&envelope.party_id, from) {
                debug!(party_id = %envelope.party_id, "stray formation ack: {e}");
            }
        }
        PartyNotice::Ready => {
            if let Err(e) = parties.mark_ready(&envelope.party_id, from) {
                debug!(party_id = %envelope.party_id, "stray readiness notice: {e}");
            }
        }
    }
}

fn handle_protocol(
    parties: &PartyManager,
    security: &Arc<SecurityLayer>,
    engine: &Arc<dyn ProtocolEngine>,
    sender: &EnvelopeSender,
    local: PeerId,
    envelope: Envelope,
) {
    let Some((from, plaintext)) = unwrap_envelope(security, local, &envelope) else {
        return;
    };
    let party = match parties.get_party(&envelope.party_id) {
        Ok(party) => party,
        Err(_) => {
            debug!(party_id = %envelope.party_id, "message for unknown party");
            return;
        }
    };
    let payload: ProtocolPayload = match bincode::deserialize(&plaintext) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(party_id = %party.id, "undecodable protocol payload: {e}");
            return;
        }
    };

    // A start message from the initiator moves this member to Active too.
    if matches!(
        payload,
        ProtocolPayload::StartKeyGen | ProtocolPayload::StartSigning { .. }
    ) && party.status == PartyStatus::Ready
    {
        if let Err(e) = parties.update_party_status(&party.id, PartyStatus::Active) {
            debug!(party_id = %party.id, "could not activate party: {e}");
        }
    }

    match engine.handle_message(&party, &from, envelope.kind, &payload) {
        Ok(outputs) => fan_out(
            sender.clone(),
            Arc::clone(security),
            local,
            party,
            outputs,
        ),
        Err(e) => warn!(party_id = %party.id, %from, "engine rejected message: {e}"),
    }
}

/// Common inbound unwrap: destination filter, sender identification, then
/// verify-then-decrypt. Returns `None` (after logging) on anything dubious.
fn unwrap_envelope(
    security: &SecurityLayer,
    local: PeerId,
    envelope: &Envelope,
) -> Option<(PeerId, Vec<u8>)> {
    if !envelope.to.is_for(&local.to_string()) {
        return None;
    }
    let from: PeerId = match envelope.from.parse() {
        Ok(peer) => peer,
        Err(_) => {
            warn!("envelope with invalid sender id dropped");
            return None;
        }
    };
    let peer_pub = match peer_public_key(&from) {
        Ok(key) => key,
        Err(e) => {
            warn!(%from, "cannot recover sender key: {e}");
            return None;
        }
    };
    match open_secure(security, &envelope.payload, &peer_pub) {
        Ok(plaintext) => Some((from, plaintext)),
        Err(e) => {
            warn!(%from, party_id = %envelope.party_id, "secure envelope rejected: {e}");
            None
        }
    }
}
