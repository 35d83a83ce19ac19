//! Device capability surface
//!
//! The coordinator only talks to the token through these traits so the
//! lifecycle can be exercised without a real PKCS#11 module. The production
//! implementation lives in [`crate::pkcs11`].

use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::ca::CaSigner;
use crate::error::HsmError;
use crate::keys::KeyPairTemplate;
use crate::random::RandomSource;

/// What the session manager needs to know about a token in a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSummary {
    pub label: String,
    pub initialized: bool,
}

/// Low-level PKCS#11 operations used by the session manager and the quote key workflow.
pub trait Pkcs11Device: Send {
    type Slot: Copy + fmt::Debug + Send;
    type Session: Send;
    type Object: Copy + fmt::Debug + Send;

    /// Slots that currently have a token present, initialized or not.
    fn slots_with_token(&self) -> Result<Vec<Self::Slot>, HsmError>;

    fn token_info(&self, slot: Self::Slot) -> Result<TokenSummary, HsmError>;

    /// Initialize the token in `slot` and set its user pin.
    fn init_token(
        &self,
        slot: Self::Slot,
        label: &str,
        so_pin: &str,
        user_pin: &str,
    ) -> Result<(), HsmError>;

    /// Open a serial read/write session.
    fn open_rw_session(&self, slot: Self::Slot) -> Result<Self::Session, HsmError>;

    fn login_user(&self, session: &Self::Session, pin: &str) -> Result<(), HsmError>;

    fn logout(&self, session: &Self::Session) -> Result<(), HsmError>;

    /// Returns `(public, private)` handles.
    fn generate_key_pair(
        &self,
        session: &Self::Session,
        template: &KeyPairTemplate,
    ) -> Result<(Self::Object, Self::Object), HsmError>;

    fn destroy_object(&self, session: &Self::Session, object: Self::Object)
    -> Result<(), HsmError>;

    fn close_session(&self, session: Self::Session) -> Result<(), HsmError>;

    /// Release this device's hold on the module. Nothing may be called on it
    /// afterwards. Whether the module itself is finalized is up to the backend.
    fn finalize(self) -> Result<(), HsmError>
    where
        Self: Sized;
}

/// Token-scoped crypto context: key generation by label, randomness and signing.
pub trait CryptoContext: RandomSource + Send {
    type Signer: CaSigner;

    fn generate_key_pair(&self, template: &KeyPairTemplate) -> Result<(), HsmError>;

    /// Resolve the private key labelled `label` into a signer.
    fn signer(&self, label: &str) -> Result<Self::Signer, HsmError>;

    fn close(self) -> Result<(), HsmError>
    where
        Self: Sized;
}

/// Settings used to (re)load a [`CryptoContext`]. Scrubbed on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct CryptoConfig {
    pub token_label: String,
    pub user_pin: String,
}

impl fmt::Debug for CryptoConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoConfig")
            .field("token_label", &self.token_label)
            .field("user_pin", &"<redacted>")
            .finish()
    }
}

/// Factory for the two views of one PKCS#11 module.
pub trait HsmBackend: Send + Sync {
    type Device: Pkcs11Device;
    type Crypto: CryptoContext;

    /// Load a crypto context for the configured token.
    ///
    /// Must return [`HsmError::TokenNotFound`] when no token carries the label.
    fn configure(&self, config: &CryptoConfig) -> Result<Self::Crypto, HsmError>;

    fn open_device(&self) -> Result<Self::Device, HsmError>;
}
