//! # Utility Modules
//!
//! Supporting utilities for cryptography, logging, metrics and timing.
//!
//! ## Components
//! - **Crypto**: pluggable asymmetric sealing (X25519 + XChaCha20-Poly1305 by default)
//! - **Logging**: Structured logging configuration
//! - **Metrics**: Thread-safe observability counters
//! - **Time**: Wall-clock timestamps for ping round trips
//! - **Timeout**: Timing constants and async timeout wrappers
//!
//! ## Security
//! - Cryptographically secure RNG (`OsRng`)
//! - Memory zeroing for private keys and derived secrets (zeroize crate)

pub mod crypto;
pub mod logging;
pub mod metrics;
pub mod time;
pub mod timeout;

pub use crypto::{default_cipher, Cipher, KeyPair, PrivateKey, PublicKey, SealedBox, SharedCipher};
pub use metrics::{global_metrics, Metrics, MetricsSnapshot};
