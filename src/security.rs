//! Per-message confidentiality and integrity.
//!
//! Symmetric keys are derived per operation from an X25519 Diffie-Hellman
//! exchange between the two peers' identity keys: the node's ed25519 seed is
//! expanded to an X25519 scalar exactly the way ed25519 itself derives its
//! signing scalar (RFC 8032), and the peer's ed25519 public key is mapped to
//! its Montgomery form. Both sides therefore compute the same shared secret
//! from nothing but each other's identity keys. The shared secret is never
//! stored; it is recomputed for every encrypt/decrypt call.
//!
//! Key schedule: HKDF-SHA256 over the shared secret with the fixed
//! domain-separation label `"encryption"`, yielding a 256-bit AES-GCM key.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use curve25519_dalek::edwards::CompressedEdwardsY;
use hkdf::Hkdf;
use libp2p::identity::{Keypair, PublicKey};
use libp2p::PeerId;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::error::{CryptoError, TssError, TssResult};

/// Domain-separation label for the symmetric encryption key.
const ENCRYPTION_INFO: &[u8] = b"encryption";

/// AES-GCM nonce size in bytes.
pub const NONCE_SIZE: usize = 12;

pub struct SecurityLayer {
    identity: Keypair,
    dh_secret: StaticSecret,
}

impl SecurityLayer {
    /// Builds the layer from the node's identity keypair. Only ed25519
    /// identities are supported.
    pub fn new(identity: Keypair) -> TssResult<Self> {
        let ed = identity
            .clone()
            .try_into_ed25519()
            .map_err(|_| TssError::Crypto(CryptoError::UnsupportedKey))?;
        let dh_secret = ed25519_to_x25519_secret(ed.secret().as_ref());
        Ok(Self { identity, dh_secret })
    }

    /// Encrypts `plaintext` for the peer owning `peer_pub`. Returns
    /// `nonce ‖ ciphertext ‖ tag` with a freshly random nonce.
    pub fn encrypt_message(&self, plaintext: &[u8], peer_pub: &PublicKey) -> TssResult<Vec<u8>> {
        let key = self.derive_key(peer_pub)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| TssError::Crypto(CryptoError::EncryptionFailed))?;

        let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Decrypts a blob produced by the peer's `encrypt_message`. Fails with
    /// `TruncatedCiphertext` if the blob is shorter than the nonce and with
    /// `DecryptionFailed` if authentication fails.
    pub fn decrypt_message(&self, blob: &[u8], peer_pub: &PublicKey) -> TssResult<Vec<u8>> {
        if blob.len() < NONCE_SIZE {
            return Err(TssError::Crypto(CryptoError::TruncatedCiphertext));
        }
        let key = self.derive_key(peer_pub)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));

        let (nonce, ciphertext) = blob.split_at(NONCE_SIZE);
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| TssError::Crypto(CryptoError::DecryptionFailed))
    }

    pub fn sign_message(&self, msg: &[u8]) -> TssResult<Vec<u8>> {
        self.identity
            .sign(msg)
            .map_err(|e| TssError::Crypto(CryptoError::SigningFailed(e.to_string())))
    }

    pub fn verify_signature(&self, msg: &[u8], signature: &[u8], peer_pub: &PublicKey) -> bool {
        peer_pub.verify(msg, signature)
    }

    pub fn public_key(&self) -> PublicKey {
        self.identity.public()
    }

    pub fn peer_id(&self) -> PeerId {
        self.identity.public().to_peer_id()
    }

    fn shared_secret(&self, peer_pub: &PublicKey) -> TssResult<[u8; 32]> {
        let peer_x = ed25519_to_x25519_public(peer_pub)?;
        Ok(self.dh_secret.diffie_hellman(&peer_x).to_bytes())
    }

    fn derive_key(&self, peer_pub: &PublicKey) -> TssResult<[u8; 32]> {
        let secret = self.shared_secret(peer_pub)?;
        let hkdf = Hkdf::<Sha256>::new(None, &secret);
        let mut key = [0u8; 32];
        hkdf.expand(ENCRYPTION_INFO, &mut key)
            .map_err(|_| TssError::Crypto(CryptoError::EncryptionFailed))?;
        Ok(key)
    }
}

/// Extracts the ed25519 public key embedded in a peer id.
///
/// Modern ed25519 peer ids use an identity multihash, so the key can be
/// recovered from the id itself and no separate peerstore is needed.
pub fn peer_public_key(peer_id: &PeerId) -> TssResult<PublicKey> {
    let multihash = peer_id.as_ref();
    if multihash.code() != 0x00 {
        return Err(TssError::Crypto(CryptoError::UnsupportedKey));
    }
    PublicKey::try_decode_protobuf(multihash.digest())
        .map_err(|_| TssError::Crypto(CryptoError::UnsupportedKey))
}

/// RFC 8032 scalar derivation: SHA-512 the seed, take the lower half, clamp.
fn ed25519_to_x25519_secret(seed: &[u8]) -> StaticSecret {
    let hash = Sha512::digest(seed);
    let mut scalar = [0u8; 32];
    scalar.copy_from_slice(&hash[..32]);
    scalar[0] &= 248;
    scalar[31] &= 127;
    scalar[31] |= 64;
    StaticSecret::from(scalar)
}

/// Maps an ed25519 public key to its X25519 (Montgomery) form.
fn ed25519_to_x25519_public(peer_pub: &PublicKey) -> TssResult<X25519Public> {
    let ed = peer_pub
        .clone()
        .try_into_ed25519()
        .map_err(|_| TssError::Crypto(CryptoError::UnsupportedKey))?;
    let point = CompressedEdwardsY(ed.to_bytes())
        .decompress()
        .ok_or(TssError::Crypto(CryptoError::UnsupportedKey))?;
    Ok(X25519Public::from(point.to_montgomery().to_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CryptoError, TssError};

    fn layer_pair() -> (SecurityLayer, SecurityLayer) {
        let a = SecurityLayer::new(Keypair::generate_ed25519()).unwrap();
        let b = SecurityLayer::new(Keypair::generate_ed25519()).unwrap();
        (a, b)
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let (alice, bob) = layer_pair();
        let plaintext = b"threshold signing round 1";

        let blob = alice.encrypt_message(plaintext, &bob.public_key()).unwrap();
        let recovered = bob.decrypt_message(&blob, &alice.public_key()).unwrap();
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn shared_secret_is_commutative() {
        let (alice, bob) = layer_pair();

        // Both directions must work off the same derived key.
        let to_bob = alice.encrypt_message(b"ping", &bob.public_key()).unwrap();
        assert_eq!(
            bob.decrypt_message(&to_bob, &alice.public_key()).unwrap(),
            b"ping"
        );

        let to_alice = bob.encrypt_message(b"pong", &alice.public_key()).unwrap();
        assert_eq!(
            alice.decrypt_message(&to_alice, &bob.public_key()).unwrap(),
            b"pong"
        );
    }

    #[test]
    fn bit_flip_is_rejected() {
        let (alice, bob) = layer_pair();
        let blob = alice
            .encrypt_message(b"do not tamper", &bob.public_key())
            .unwrap();

        // Flip one bit in a spread of positions: nonce, body, and tag.
        let step = (blob.len() / 8).max(1);
        for i in (0..blob.len()).step_by(step) {
            let mut tampered = blob.clone();
            tampered[i] ^= 0x01;
            let err = bob
                .decrypt_message(&tampered, &alice.public_key())
                .unwrap_err();
            assert!(matches!(
                err,
                TssError::Crypto(CryptoError::DecryptionFailed)
            ));
        }
    }

    #[test]
    fn truncated_blob_is_rejected() {
        let (alice, bob) = layer_pair();
        let err = bob
            .decrypt_message(&[0u8; NONCE_SIZE - 1], &alice.public_key())
            .unwrap_err();
        assert!(matches!(
            err,
            TssError::Crypto(CryptoError::TruncatedCiphertext)
        ));
    }

    #[test]
    fn wrong_peer_key_fails_decryption() {
        let (alice, bob) = layer_pair();
        let mallory = SecurityLayer::new(Keypair::generate_ed25519()).unwrap();

        let blob = alice.encrypt_message(b"secret", &bob.public_key()).unwrap();
        assert!(bob.decrypt_message(&blob, &mallory.public_key()).is_err());
    }

    #[test]
    fn sign_and_verify() {
        let (alice, bob) = layer_pair();
        let msg = b"envelope ciphertext";

        let sig = alice.sign_message(msg).unwrap();
        assert!(bob.verify_signature(msg, &sig, &alice.public_key()));
        assert!(!bob.verify_signature(b"other bytes", &sig, &alice.public_key()));
        assert!(!bob.verify_signature(msg, &sig, &bob.public_key()));
    }

    #[test]
    fn public_key_recoverable_from_peer_id() {
        let layer = SecurityLayer::new(Keypair::generate_ed25519()).unwrap();
        let recovered = peer_public_key(&layer.peer_id()).unwrap();
        assert_eq!(recovered, layer.public_key());
    }
}
