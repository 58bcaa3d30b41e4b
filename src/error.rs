//! Error types for the TSS coordination node.

use thiserror::Error;

pub type TssResult<T> = Result<T, TssError>;

/// Top-level error taxonomy.
///
/// Validation and not-found errors are caller-visible and fatal to the single
/// operation only. Crypto and transport errors raised while processing an
/// inbound message are logged and the message dropped; they never terminate
/// the receive loop. Formation timeouts never appear here at all: they are
/// absorbed into the party's `Failed` status.
#[derive(Debug, Error)]
pub enum TssError {
    #[error("invalid party parameters: {0}")]
    Validation(String),

    #[error("party not found: {0}")]
    NotFound(String),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("identity error: {0}")]
    Identity(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures raised while protecting or unwrapping a secure envelope.
///
/// Signature failures and decryption failures are separate variants on
/// purpose: inbound messages are verified before any decryption is attempted,
/// and callers rely on telling the two stages apart.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("signature verification failed")]
    InvalidSignature,

    #[error("ciphertext shorter than nonce")]
    TruncatedCiphertext,

    #[error("authenticated decryption failed")]
    DecryptionFailed,

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("malformed secure payload")]
    MalformedPayload,

    #[error("unsupported key type (ed25519 required)")]
    UnsupportedKey,

    #[error("signing failed: {0}")]
    SigningFailed(String),
}
