//! TSS coordination node
//!
//! Peer-to-peer substrate for running threshold signature schemes: nodes
//! discover each other over Kademlia and mDNS, form ad-hoc signing parties
//! with a declared threshold, and exchange per-message encrypted and signed
//! protocol payloads over gossipsub.
//!
//! ## Key Components
//!
//! - **Discovery**: periodic closest-peer lookups plus local mDNS
//! - **Party Manager**: party lifecycle (`Forming → Ready → Active → done`)
//!   with formation acks and timeouts
//! - **Security Layer**: X25519 key agreement from ed25519 identities,
//!   HKDF-SHA256, AES-256-GCM, encrypt-then-sign envelopes
//! - **Message Router**: typed dispatch over one shared gossipsub topic
//! - **Protocol Engine**: trait seam where the actual MPC rounds plug in;
//!   a simulated engine ships for end-to-end runs
//!
//! The actual threshold cryptography is out of scope here: this crate gets
//! the right bytes to the right peers, confidentially and authenticated.

pub mod engine;
pub mod error;
pub mod node;
pub mod p2p;
pub mod party;
pub mod security;

pub use engine::{EngineOutput, ProtocolEngine, SimulatedEngine};
pub use error::{CryptoError, TssError, TssResult};
pub use node::{Node, NodeConfig};
pub use p2p::{
    Destination, DiscoveryConfig, Envelope, MessageKind, NetworkConfig, PartyNotice,
    ProtocolPayload, TSS_TOPIC,
};
pub use party::{
    Party, PartyConfig, PartyEvent, PartyManager, PartyStatus, TssOperation, MAX_PARTY_SIZE,
    MIN_PARTY_SIZE, PARTY_FORMATION_TIMEOUT,
};
pub use security::SecurityLayer;
