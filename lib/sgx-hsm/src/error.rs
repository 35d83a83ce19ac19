//! SGX HSM Error Types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HsmError {
    #[error("Invalid SGX context")]
    InvalidContext,

    #[error("Could not find PKCS#11 token: {0}")]
    TokenNotFound(String),

    #[error("Failed to open session: {0}")]
    SessionOpen(String),

    #[error("Failed to initialize token: {0}")]
    TokenInit(String),

    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Failed to read random bytes: {0}")]
    RandomSource(String),

    #[error("Certificate issuance failed: {0}")]
    CertificateIssuance(String),

    #[error("Invalid parameter blob: {0}")]
    InvalidParameterBlob(String),

    #[error("PKCS#11 error: {0}")]
    Pkcs11(#[from] cryptoki::error::Error),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl HsmError {
    /// True for the one load failure the coordinator recovers from by
    /// provisioning a fresh token.
    pub fn is_token_not_found(&self) -> bool {
        matches!(self, HsmError::TokenNotFound(_))
    }
}
