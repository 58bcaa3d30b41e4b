//! Typed wire envelope exchanged between party members.
//!
//! Every message on the shared gossipsub topic is a bincode-serialized
//! [`Envelope`]. Peer ids travel as base58 strings because `PeerId` carries no
//! serde implementations. The `payload` field is opaque at this layer; for
//! secure envelopes it holds `ciphertext ‖ delimiter ‖ signature` as produced
//! by the node (see `node.rs`).

use libp2p::PeerId;
use serde::{Deserialize, Serialize};

use crate::error::{TssError, TssResult};
use crate::party::{Party, PartyStatus, TssOperation};

/// Well-known broadcast topic shared by all participants.
pub const TSS_TOPIC: &str = "tss-messages";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    PartyFormation,
    KeyGeneration,
    Signing,
}

/// Explicit destination tag. A broadcast envelope is meant for every member of
/// the party; a unicast envelope only for the named peer (other receivers on
/// the shared topic skip it without attempting to unwrap).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Broadcast,
    Unicast(String),
}

impl Destination {
    pub fn is_for(&self, peer: &str) -> bool {
        match self {
            Destination::Broadcast => true,
            Destination::Unicast(target) => target == peer,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Envelope {
    pub kind: MessageKind,
    pub party_id: String,
    pub from: String,
    pub to: Destination,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn encode(&self) -> TssResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| TssError::Transport(format!("encode envelope: {e}")))
    }

    pub fn decode(data: &[u8]) -> TssResult<Self> {
        bincode::deserialize(data).map_err(|e| TssError::Transport(format!("decode envelope: {e}")))
    }
}

/// Inner payload of `PartyFormation` envelopes.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum PartyNotice {
    /// Initiator announces a new party to a prospective member.
    Invite(PartyDescriptor),
    /// Member acknowledges an invite back to the initiator.
    Ack,
    /// Initiator tells members the party reached `Ready`.
    Ready,
}

/// Inner payload of `KeyGeneration` and `Signing` envelopes. `Share` data is
/// opaque protocol-engine output; the core never interprets it.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum ProtocolPayload {
    StartKeyGen,
    StartSigning { message: Vec<u8> },
    Share { index: usize, data: Vec<u8> },
}

/// Serializable view of a party, carried inside formation invites.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PartyDescriptor {
    pub id: String,
    pub initiator: String,
    pub members: Vec<String>,
    pub threshold: usize,
    pub operation: TssOperation,
}

impl PartyDescriptor {
    pub fn from_party(party: &Party) -> Self {
        Self {
            id: party.id.clone(),
            initiator: party.initiator.to_string(),
            members: party.members.iter().map(ToString::to_string).collect(),
            threshold: party.threshold,
            operation: party.operation,
        }
    }

    pub fn to_party(&self) -> TssResult<Party> {
        let initiator = self
            .initiator
            .parse::<PeerId>()
            .map_err(|_| TssError::Transport("invalid initiator id in party descriptor".into()))?;
        let members = self
            .members
            .iter()
            .map(|m| m.parse::<PeerId>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| TssError::Transport("invalid peer id in party descriptor".into()))?;
        if !members.contains(&initiator) {
            return Err(TssError::Transport(
                "party descriptor initiator is not a member".into(),
            ));
        }
        Ok(Party {
            id: self.id.clone(),
            initiator,
            members,
            threshold: self.threshold,
            status: PartyStatus::Forming,
            operation: self.operation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::identity::Keypair;

    fn peer_string() -> String {
        PeerId::from(Keypair::generate_ed25519().public()).to_string()
    }

    #[test]
    fn envelope_round_trip() {
        let from = peer_string();
        let to = peer_string();
        let envelope = Envelope {
            kind: MessageKind::KeyGeneration,
            party_id: "party-cafe".into(),
            from: from.clone(),
            to: Destination::Unicast(to.clone()),
            payload: vec![1, 2, 3, 0, 255],
        };

        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded.kind, MessageKind::KeyGeneration);
        assert_eq!(decoded.party_id, "party-cafe");
        assert_eq!(decoded.from, from);
        assert_eq!(decoded.to, Destination::Unicast(to));
        assert_eq!(decoded.payload, vec![1, 2, 3, 0, 255]);
    }

    #[test]
    fn destination_matching() {
        let peer = peer_string();
        let other = peer_string();

        assert!(Destination::Broadcast.is_for(&peer));
        assert!(Destination::Unicast(peer.clone()).is_for(&peer));
        assert!(!Destination::Unicast(other).is_for(&peer));
    }

    #[test]
    fn decode_garbage_fails() {
        assert!(Envelope::decode(b"not an envelope").is_err());
    }

    #[test]
    fn descriptor_round_trip() {
        let members: Vec<String> = (0..3).map(|_| peer_string()).collect();
        let descriptor = PartyDescriptor {
            id: "party-beef".into(),
            initiator: members[0].clone(),
            members: members.clone(),
            threshold: 2,
            operation: TssOperation::KeyGen,
        };

        let party = descriptor.to_party().unwrap();
        assert_eq!(party.status, PartyStatus::Forming);
        assert_eq!(party.members.len(), 3);
        assert_eq!(party.initiator.to_string(), members[0]);

        let back = PartyDescriptor::from_party(&party);
        assert_eq!(back.members, members);
        assert_eq!(back.initiator, members[0]);
        assert_eq!(back.threshold, 2);
    }

    #[test]
    fn descriptor_rejects_bad_peer_id() {
        let peer = peer_string();
        let descriptor = PartyDescriptor {
            id: "party-bad".into(),
            initiator: peer.clone(),
            members: vec!["not-a-peer-id!".into()],
            threshold: 2,
            operation: TssOperation::Signing,
        };
        assert!(descriptor.to_party().is_err());
    }

    #[test]
    fn descriptor_rejects_outside_initiator() {
        let descriptor = PartyDescriptor {
            id: "party-out".into(),
            initiator: peer_string(),
            members: (0..3).map(|_| peer_string()).collect(),
            threshold: 2,
            operation: TssOperation::KeyGen,
        };
        assert!(descriptor.to_party().is_err());
    }
}
