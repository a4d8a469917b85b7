//! Selects a cryptographic backend for tarn at build time.
//!
//! The `rustcrypto` feature (default) provides a pure-software backend over
//! the RustCrypto crates; alternative backends (hardware accelerators,
//! vendored crypto libraries) plug in through the same [Crypto] trait.
#![no_std]

pub use tarn_shared::Crypto as CryptoTrait;

#[cfg(feature = "rustcrypto")]
pub type Crypto = tarn_crypto_rustcrypto::Crypto<rand_core::OsRng>;

#[cfg(feature = "rustcrypto")]
pub const fn default_crypto() -> Crypto {
    tarn_crypto_rustcrypto::Crypto::new(rand_core::OsRng)
}
