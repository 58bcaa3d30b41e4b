//! Peer-to-peer substrate: libp2p swarm facade, peer discovery, and typed
//! message routing over a shared gossipsub topic.

pub mod discovery;
pub mod messages;
pub mod network;
pub mod router;

pub use discovery::{Discovery, DiscoveryConfig};
pub use messages::{
    Destination, Envelope, MessageKind, PartyDescriptor, PartyNotice, ProtocolPayload, TSS_TOPIC,
};
pub use network::{Network, NetworkConfig, RawMessage};
pub use router::{EnvelopeSender, MessageRouter};
