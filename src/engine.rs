//! Seam between the coordination substrate and the threshold-signature
//! protocol itself.
//!
//! The node hands every decrypted protocol message to a [`ProtocolEngine`] and
//! sends whatever the engine returns. Real MPC math lives behind this trait;
//! the crate ships only [`SimulatedEngine`], which fabricates random shares so
//! the full coordination flow can run end to end.

use libp2p::PeerId;
use rand::RngCore;
use tracing::info;

use crate::error::{TssError, TssResult};
use crate::p2p::messages::{Destination, MessageKind, ProtocolPayload};
use crate::party::Party;

/// One outbound protocol message produced by the engine.
#[derive(Debug, Clone)]
pub struct EngineOutput {
    pub kind: MessageKind,
    pub to: Destination,
    pub payload: ProtocolPayload,
}

/// Protocol driver invoked for every inbound `KeyGeneration`/`Signing`
/// message. Implementations must be cheap to call or offload their own work;
/// they run on the router's dispatch path.
pub trait ProtocolEngine: Send + Sync + 'static {
    fn handle_message(
        &self,
        party: &Party,
        from: &PeerId,
        kind: MessageKind,
        payload: &ProtocolPayload,
    ) -> TssResult<Vec<EngineOutput>>;
}

/// Stand-in engine: answers every protocol start with a random 32-byte share
/// per remote member. Shares it receives are logged and absorbed.
pub struct SimulatedEngine {
    local_peer: PeerId,
}

impl SimulatedEngine {
    pub fn new(local_peer: PeerId) -> Self {
        Self { local_peer }
    }

    fn share_round(&self, party: &Party, kind: MessageKind) -> Vec<EngineOutput> {
        let mut rng = rand::thread_rng();
        party
            .members
            .iter()
            .filter(|member| **member != self.local_peer)
            .enumerate()
            .map(|(index, member)| {
                let mut data = vec![0u8; 32];
                rng.fill_bytes(&mut data);
                EngineOutput {
                    kind,
                    to: Destination::Unicast(member.to_string()),
                    payload: ProtocolPayload::Share { index, data },
                }
            })
            .collect()
    }
}

impl ProtocolEngine for SimulatedEngine {
    fn handle_message(
        &self,
        party: &Party,
        from: &PeerId,
        kind: MessageKind,
        payload: &ProtocolPayload,
    ) -> TssResult<Vec<EngineOutput>> {
        if !party.members.contains(from) {
            return Err(TssError::Validation(format!(
                "peer {from} is not a member of party {}",
                party.id
            )));
        }
        match payload {
            ProtocolPayload::StartKeyGen => {
                info!(party_id = %party.id, "starting key generation round");
                Ok(self.share_round(party, kind))
            }
            ProtocolPayload::StartSigning { message } => {
                info!(
                    party_id = %party.id,
                    message_len = message.len(),
                    "starting signing round"
                );
                Ok(self.share_round(party, kind))
            }
            ProtocolPayload::Share { index, data } => {
                info!(
                    party_id = %party.id,
                    %from,
                    index,
                    share_len = data.len(),
                    "received share"
                );
                Ok(Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::party::{PartyStatus, TssOperation};
    use libp2p::identity::Keypair;

    fn peer() -> PeerId {
        PeerId::from(Keypair::generate_ed25519().public())
    }

    fn party(members: &[PeerId]) -> Party {
        Party {
            id: "party-engine".into(),
            initiator: members[0],
            members: members.to_vec(),
            threshold: 2,
            status: PartyStatus::Active,
            operation: TssOperation::KeyGen,
        }
    }

    #[test]
    fn start_keygen_emits_one_share_per_remote_member() {
        let members: Vec<PeerId> = (0..4).map(|_| peer()).collect();
        let engine = SimulatedEngine::new(members[0]);
        let party = party(&members);

        let outputs = engine
            .handle_message(
                &party,
                &members[1],
                MessageKind::KeyGeneration,
                &ProtocolPayload::StartKeyGen,
            )
            .unwrap();

        assert_eq!(outputs.len(), 3);
        for output in &outputs {
            assert_eq!(output.kind, MessageKind::KeyGeneration);
            match &output.to {
                Destination::Unicast(target) => {
                    assert_ne!(target, &members[0].to_string());
                }
                Destination::Broadcast => panic!("shares must be unicast"),
            }
            assert!(matches!(
                &output.payload,
                ProtocolPayload::Share { data, .. } if data.len() == 32
            ));
        }
    }

    #[test]
    fn inbound_share_produces_no_output() {
        let members: Vec<PeerId> = (0..3).map(|_| peer()).collect();
        let engine = SimulatedEngine::new(members[0]);
        let party = party(&members);

        let outputs = engine
            .handle_message(
                &party,
                &members[2],
                MessageKind::Signing,
                &ProtocolPayload::Share {
                    index: 1,
                    data: vec![9; 32],
                },
            )
            .unwrap();
        assert!(outputs.is_empty());
    }

    #[test]
    fn non_member_sender_is_rejected() {
        let members: Vec<PeerId> = (0..3).map(|_| peer()).collect();
        let outsider = peer();
        let engine = SimulatedEngine::new(members[0]);
        let party = party(&members);

        let err = engine
            .handle_message(
                &party,
                &outsider,
                MessageKind::KeyGeneration,
                &ProtocolPayload::StartKeyGen,
            )
            .unwrap_err();
        assert!(matches!(err, TssError::Validation(_)));
    }
}
