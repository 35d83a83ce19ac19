//! SGX HSM session library
//!
//! Lifecycle management for a PKCS#11 token backed by an SGX enclave: token
//! discovery and first-time provisioning, labelled key generation, the
//! enclave quote key workflow and self-signed CA issuance.

#![cfg_attr(
    test,
    allow(clippy::unwrap_used, clippy::expect_used, clippy::unwrap_in_result)
)]

pub mod ca;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod keys;
pub mod params;
pub mod pkcs11;
pub mod random;
pub mod session;

#[cfg(test)]
pub(crate) mod mock;

pub use ca::{CA_SUBJECT, CA_VALIDITY, CaCertificate, CaSigner, issue_ca_certificate};
pub use config::Config;
pub use context::{LifecycleState, SgxContext};
pub use device::{CryptoConfig, CryptoContext, HsmBackend, Pkcs11Device, TokenSummary};
pub use error::HsmError;
pub use keys::{EcCurve, KeyAlgorithm, KeyPairTemplate, KeySpec};
pub use params::{QuoteEvidence, exponent_len, modulus_len, params_size, quote_offset};
pub use pkcs11::{CryptokiBackend, DEFAULT_LIBRARY_PATH, TokenKeySigner};
pub use random::{OsRandom, RandomSource};
