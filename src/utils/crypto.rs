//! # Asymmetric Crypto Layer
//!
//! Whole-datagram encryption to a recipient's public key.
//!
//! The layer is pluggable through the [`Cipher`] trait; keys are opaque,
//! provider-encoded byte wrappers so the rest of the crate never depends on a
//! particular algorithm. The default provider is [`SealedBox`]:
//!
//! - a fresh X25519 ephemeral secret per message, agreed against the recipient's
//!   static public key
//! - SHA-256 over the shared secret and both public keys as the message key
//! - XChaCha20-Poly1305 with a random 24-byte nonce
//!
//! ```text
//! [ephemeral public(32)] [nonce(24)] [ciphertext + tag(16)]
//! ```
//!
//! There is no sender authentication and no forward secrecy beyond the
//! per-message ephemeral key.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use x25519_dalek::{EphemeralSecret, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use crate::error::{constants, ProtocolError, Result};

/// X25519 key length in bytes
pub const KEY_LEN: usize = 32;

/// XChaCha20 nonce length in bytes
pub const NONCE_LEN: usize = 24;

/// Poly1305 tag length in bytes
pub const TAG_LEN: usize = 16;

/// Smallest possible sealed box
pub const SEALED_OVERHEAD: usize = KEY_LEN + NONCE_LEN + TAG_LEN;

/// Public key material, exchanged in clear and cached per remote peer.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct PublicKey(Vec<u8>);

impl PublicKey {
    /// Wrap provider-encoded key material without validating it
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Export the raw key material
    pub fn export(&self) -> Vec<u8> {
        self.0.clone()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix: String = self.0.iter().take(4).map(|b| format!("{b:02x}")).collect();
        write!(f, "PublicKey({prefix}..; {} bytes)", self.0.len())
    }
}

/// Private key material. Owned by its endpoint, never serialized onto the wire.
pub struct PrivateKey(Zeroizing<Vec<u8>>);

impl PrivateKey {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Export the raw key material
    pub fn export(&self) -> Zeroizing<Vec<u8>> {
        self.0.clone()
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(<redacted>)")
    }
}

/// An endpoint's keypair, generated once at startup.
#[derive(Debug)]
pub struct KeyPair {
    pub public: PublicKey,
    pub private: PrivateKey,
}

/// Pluggable asymmetric encryption provider.
pub trait Cipher: Send + Sync + 'static {
    /// Provider name for logs
    fn name(&self) -> &'static str;

    /// Key strength in bits
    fn key_bits(&self) -> u32;

    fn generate_keypair(&self) -> Result<KeyPair>;

    /// Encrypt an already framed message for `recipient`
    fn encrypt(&self, recipient: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt a blob addressed to the holder of `key`
    fn decrypt(&self, key: &PrivateKey, ciphertext: &[u8]) -> Result<Vec<u8>>;

    /// Validate and wrap public key material received from a peer
    fn import_public_key(&self, bytes: &[u8]) -> Result<PublicKey>;

    fn import_private_key(&self, bytes: &[u8]) -> Result<PrivateKey>;
}

/// Shared handle to the configured provider
pub type SharedCipher = Arc<dyn Cipher>;

/// The default provider
pub fn default_cipher() -> SharedCipher {
    Arc::new(SealedBox)
}

/// Symmetric XChaCha20-Poly1305 wrapper used under the sealed box.
pub struct Crypto {
    cipher: XChaCha20Poly1305,
}

impl Crypto {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(key.into()),
        }
    }

    /// Generate a random 24-byte nonce
    pub fn generate_nonce() -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        nonce
    }

    pub fn encrypt(&self, plaintext: &[u8], nonce: &[u8; NONCE_LEN]) -> Result<Vec<u8>> {
        self.cipher
            .encrypt(XNonce::from_slice(nonce), plaintext)
            .map_err(|_| ProtocolError::EncryptionFailure)
    }

    pub fn decrypt(&self, ciphertext: &[u8], nonce: &[u8; NONCE_LEN]) -> Result<Vec<u8>> {
        self.cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| ProtocolError::DecryptionFailure)
    }
}

/// X25519 + XChaCha20-Poly1305 sealed box.
#[derive(Debug, Clone, Copy, Default)]
pub struct SealedBox;

fn key_array(bytes: &[u8]) -> Result<[u8; KEY_LEN]> {
    bytes
        .try_into()
        .map_err(|_| ProtocolError::InvalidKey(constants::ERR_KEY_LENGTH.into()))
}

/// Derive the message key from the shared secret and both public halves
fn derive_key(shared: &[u8], ephemeral: &[u8], recipient: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"datagram-protocol sealed box");
    hasher.update(shared);
    hasher.update(ephemeral);
    hasher.update(recipient);
    hasher.finalize().into()
}

impl Cipher for SealedBox {
    fn name(&self) -> &'static str {
        "x25519-xchacha20poly1305"
    }

    fn key_bits(&self) -> u32 {
        (KEY_LEN * 8) as u32
    }

    fn generate_keypair(&self) -> Result<KeyPair> {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = x25519_dalek::PublicKey::from(&secret);
        Ok(KeyPair {
            public: PublicKey::from_bytes(public.as_bytes().to_vec()),
            private: PrivateKey::from_bytes(secret.to_bytes().to_vec()),
        })
    }

    fn encrypt(&self, recipient: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>> {
        let recipient_bytes = key_array(recipient.as_bytes())?;
        let recipient_key = x25519_dalek::PublicKey::from(recipient_bytes);

        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = x25519_dalek::PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(&recipient_key);

        let mut key = derive_key(shared.as_bytes(), ephemeral_public.as_bytes(), &recipient_bytes);
        let nonce = Crypto::generate_nonce();
        let ciphertext = Crypto::new(&key).encrypt(plaintext, &nonce);
        key.zeroize();

        let ciphertext = ciphertext?;
        let mut sealed = Vec::with_capacity(KEY_LEN + NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(ephemeral_public.as_bytes());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn decrypt(&self, key: &PrivateKey, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < SEALED_OVERHEAD {
            return Err(ProtocolError::DecryptionFailure);
        }
        let (ephemeral_bytes, rest) = ciphertext.split_at(KEY_LEN);
        let (nonce_bytes, body) = rest.split_at(NONCE_LEN);

        let mut secret_bytes = key_array(key.as_bytes())?;
        let secret = StaticSecret::from(secret_bytes);
        secret_bytes.zeroize();
        let own_public = x25519_dalek::PublicKey::from(&secret);

        let ephemeral = x25519_dalek::PublicKey::from(key_array(ephemeral_bytes)?);
        let shared = secret.diffie_hellman(&ephemeral);

        let mut message_key = derive_key(shared.as_bytes(), ephemeral_bytes, own_public.as_bytes());
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(nonce_bytes);
        let plaintext = Crypto::new(&message_key).decrypt(body, &nonce);
        message_key.zeroize();
        plaintext
    }

    fn import_public_key(&self, bytes: &[u8]) -> Result<PublicKey> {
        key_array(bytes).map(|key| PublicKey::from_bytes(key.to_vec()))
    }

    fn import_private_key(&self, bytes: &[u8]) -> Result<PrivateKey> {
        key_array(bytes).map(|key| PrivateKey::from_bytes(key.to_vec()))
    }
}
