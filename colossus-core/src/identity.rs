//! Node identity and the box construction used by the handshake.
//!
//! A box is X25519 static-static Diffie-Hellman, a SHA-256 key derivation bound
//! to a context label, and ChaCha20-Poly1305 with a random nonce prefixed to the
//! ciphertext. Opening fails unless both sides hold the matching secrets.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

pub const PUBLIC_KEY_SIZE: usize = 32;
pub const SECRET_KEY_SIZE: usize = 32;
const BOX_NONCE_SIZE: usize = 12;
/// Poly1305 tag appended by the AEAD.
pub const BOX_TAG_SIZE: usize = 16;
/// Bytes a box adds on top of its plaintext.
pub const BOX_OVERHEAD: usize = BOX_NONCE_SIZE + BOX_TAG_SIZE;

/// Node public key (32 bytes, X25519).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PublicKey([u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        PublicKey(bytes)
    }

    /// Read a key from the front of `bytes`.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let key: [u8; PUBLIC_KEY_SIZE] = bytes.get(..PUBLIC_KEY_SIZE)?.try_into().ok()?;
        Some(PublicKey(key))
    }

    /// Abbreviated hex form for log lines.
    pub fn short(&self) -> String {
        let full = hex::encode(self.0);
        format!("{}..{}", &full[..6], &full[full.len() - 6..])
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl std::str::FromStr for PublicKey {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut key = [0u8; PUBLIC_KEY_SIZE];
        hex::decode_to_slice(s.trim(), &mut key)?;
        Ok(PublicKey(key))
    }
}

/// X25519 keypair. The secret never leaves this type except through `secret_bytes`.
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    pub fn from_secret_bytes(bytes: [u8; SECRET_KEY_SIZE]) -> Self {
        Self::from_secret(StaticSecret::from(bytes))
    }

    /// Assemble a keypair from stored parts without checking that they belong together.
    /// A mismatched pair is only detected when a peer fails to open our boxes.
    pub fn from_parts(secret: [u8; SECRET_KEY_SIZE], public: PublicKey) -> Self {
        Self {
            secret: StaticSecret::from(secret),
            public,
        }
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey(X25519PublicKey::from(&secret).to_bytes());
        Self { secret, public }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn secret_bytes(&self) -> [u8; SECRET_KEY_SIZE] {
        self.secret.to_bytes()
    }

    /// Shared secret with another node's public key.
    pub fn shared_secret(&self, other_public: &PublicKey) -> [u8; 32] {
        let other = X25519PublicKey::from(other_public.0);
        self.secret.diffie_hellman(&other).to_bytes()
    }

    /// Encrypt `plaintext` so that only `peer` (holding its secret) can open it,
    /// and only if it knows our public key.
    pub fn seal(
        &self,
        peer: &PublicKey,
        context: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, BoxError> {
        let key = derive_box_key(&self.shared_secret(peer), context);
        let cipher = ChaCha20Poly1305::new_from_slice(&key).map_err(|_| BoxError::Key)?;
        let mut nonce = [0u8; BOX_NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| BoxError::Seal)?;
        let mut out = Vec::with_capacity(BOX_NONCE_SIZE + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Open a box sealed by `peer` for us.
    pub fn open(&self, peer: &PublicKey, context: &[u8], sealed: &[u8]) -> Result<Vec<u8>, BoxError> {
        if sealed.len() < BOX_OVERHEAD {
            return Err(BoxError::Truncated);
        }
        let key = derive_box_key(&self.shared_secret(peer), context);
        let cipher = ChaCha20Poly1305::new_from_slice(&key).map_err(|_| BoxError::Key)?;
        let (nonce, ciphertext) = sealed.split_at(BOX_NONCE_SIZE);
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| BoxError::Open)
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &self.public.short())
            .finish_non_exhaustive()
    }
}

/// Derive a 32-byte box key from a shared secret and a context label.
pub fn derive_box_key(shared_secret: &[u8; 32], context: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"colossus-box-v1");
    hasher.update(shared_secret);
    hasher.update(context);
    hasher.finalize().into()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BoxError {
    #[error("invalid key")]
    Key,
    #[error("sealing failed")]
    Seal,
    #[error("box cannot be opened")]
    Open,
    #[error("box too short")]
    Truncated,
}
