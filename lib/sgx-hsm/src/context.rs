//! SGX context lifecycle
//!
//! [`SgxContext`] owns the crypto context and the PKCS#11 quote session for
//! one token. Every state change goes through a single mutex, and teardown
//! moves each handle out of the state before releasing it, so destroying
//! twice (or destroying a half-built context) never releases anything twice.

use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

use crate::ca::{self, CaCertificate};
use crate::config::Config;
use crate::device::{CryptoConfig, CryptoContext, HsmBackend, Pkcs11Device};
use crate::error::HsmError;
use crate::keys::{KEY_ID_LEN, KeyPairTemplate, KeySpec, QUOTE_KEY_ID_LEN};
use crate::params::QuoteEvidence;
use crate::random::{OsRandom, generate_key_id};
use crate::session;

type SessionOf<B> = <<B as HsmBackend>::Device as Pkcs11Device>::Session;
type ObjectOf<B> = <<B as HsmBackend>::Device as Pkcs11Device>::Object;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    ConfigValidated,
    ContextLoaded,
    SessionOpen,
    KeysProvisioned,
    Destroyed,
}

/// PKCS#11 session used for the enclave quote key.
struct QuoteSession<D: Pkcs11Device> {
    device: D,
    session: Option<D::Session>,
    quote_private_key: Option<D::Object>,
    quote_public_key: Option<D::Object>,
}

struct ContextState<B: HsmBackend> {
    lifecycle: LifecycleState,
    crypto: Option<B::Crypto>,
    p11: Option<QuoteSession<B::Device>>,
}

impl<B: HsmBackend> ContextState<B> {
    fn crypto(&self) -> Result<&B::Crypto, HsmError> {
        self.crypto.as_ref().ok_or(HsmError::InvalidContext)
    }

    fn teardown(&mut self) {
        if let Some(p11) = self.p11.take() {
            let QuoteSession {
                device,
                session,
                quote_private_key,
                quote_public_key,
            } = p11;

            if let Some(session) = session {
                if let Err(e) = device.logout(&session) {
                    warn!("Failed to log out of PKCS#11 session: {}", e);
                }
                if let Some(key) = quote_private_key
                    && let Err(e) = device.destroy_object(&session, key)
                {
                    warn!(?key, "Failed to destroy quote private key: {}", e);
                }
                if let Some(key) = quote_public_key
                    && let Err(e) = device.destroy_object(&session, key)
                {
                    warn!(?key, "Failed to destroy quote public key: {}", e);
                }
                if let Err(e) = device.close_session(session) {
                    warn!("Failed to close PKCS#11 session: {}", e);
                }
            }

            if let Err(e) = device.finalize() {
                warn!("Failed to finalize PKCS#11 context: {}", e);
            }
        }

        self.close_crypto();
        self.lifecycle = LifecycleState::Destroyed;
    }

    fn close_crypto(&mut self) {
        if let Some(crypto) = self.crypto.take()
            && let Err(e) = crypto.close()
        {
            warn!("Failed to close crypto context: {}", e);
        }
    }
}

/// Session and key lifecycle for one SGX-backed token.
pub struct SgxContext<B: HsmBackend> {
    backend: B,
    config: Config,
    state: Mutex<ContextState<B>>,
}

impl<B: HsmBackend> SgxContext<B> {
    /// Validate `config`, load (or provision) the token and open the quote session.
    ///
    /// On failure everything acquired so far is released before returning.
    pub fn new(backend: B, config: Config) -> Result<Self, HsmError> {
        let context = Self {
            backend,
            config: config.validated(),
            state: Mutex::new(ContextState {
                lifecycle: LifecycleState::ConfigValidated,
                crypto: None,
                p11: None,
            }),
        };

        if let Err(e) = context.open() {
            error!("Failed to create SGX context: {}", e);
            context.destroy();
            return Err(e);
        }

        Ok(context)
    }

    fn open(&self) -> Result<(), HsmError> {
        let mut state = self.lock_state("construction")?;

        match self.reload_locked(&mut state) {
            Ok(()) => {}
            Err(e) if e.is_token_not_found() => {
                info!(token_label = %self.config.token_label, "No existing token found, creating new token...");
                self.provision_token()?;
                self.reload_locked(&mut state)?;
            }
            Err(e) => return Err(e),
        }
        state.lifecycle = LifecycleState::ContextLoaded;

        info!("Initiating PKCS#11 session...");
        let device = self.backend.open_device()?;
        let p11 = state.p11.insert(QuoteSession {
            device,
            session: None,
            quote_private_key: None,
            quote_public_key: None,
        });
        let slot = session::find_slot(&p11.device, &self.config.token_label)?;
        let handle = p11.session.insert(session::open_session(&p11.device, slot)?);
        p11.device
            .login_user(handle, &self.config.user_pin)
            .map_err(|e| HsmError::SessionOpen(format!("login failed: {}", e)))?;

        state.lifecycle = LifecycleState::SessionOpen;
        Ok(())
    }

    fn provision_token(&self) -> Result<(), HsmError> {
        let device = self
            .backend
            .open_device()
            .map_err(|e| HsmError::TokenInit(e.to_string()))?;
        let result = session::initialize_token(&device, &self.config);
        if let Err(e) = device.finalize() {
            warn!("Failed to finalize provisioning context: {}", e);
        }
        result
    }

    fn crypto_config(&self) -> CryptoConfig {
        CryptoConfig {
            token_label: self.config.token_label.clone(),
            user_pin: self.config.user_pin.clone(),
        }
    }

    fn reload_locked(&self, state: &mut ContextState<B>) -> Result<(), HsmError> {
        state.close_crypto();
        match self.backend.configure(&self.crypto_config()) {
            Ok(crypto) => {
                state.crypto = Some(crypto);
                debug!(token_label = %self.config.token_label, "Crypto context loaded");
                Ok(())
            }
            Err(e) => {
                // Closing the crypto context logs the whole token out.
                self.relogin_quote_session(state);
                Err(e)
            }
        }
    }

    fn relogin_quote_session(&self, state: &ContextState<B>) {
        if let Some(p11) = &state.p11
            && let Some(session) = &p11.session
            && let Err(e) = p11.device.login_user(session, &self.config.user_pin)
        {
            warn!("Failed to re-authenticate quote session: {}", e);
        }
    }

    fn lock_state(&self, operation: &str) -> Result<MutexGuard<'_, ContextState<B>>, HsmError> {
        self.state.lock().map_err(|_| {
            HsmError::InternalError(format!("Context lock poisoned during {}", operation))
        })
    }

    fn live_state(&self, operation: &str) -> Result<MutexGuard<'_, ContextState<B>>, HsmError> {
        let state = self.lock_state(operation)?;
        if state.lifecycle == LifecycleState::Destroyed {
            return Err(HsmError::InvalidContext);
        }
        Ok(state)
    }

    // ==================== Accessors ====================

    pub fn token_label(&self) -> Result<String, HsmError> {
        self.live_state("token label access")?;
        Ok(self.config.token_label.clone())
    }

    /// Snapshot of the validated configuration.
    pub fn config(&self) -> Result<Config, HsmError> {
        self.live_state("config access")?;
        Ok(self.config.clone())
    }

    pub fn state(&self) -> Result<LifecycleState, HsmError> {
        Ok(self.lock_state("state access")?.lifecycle)
    }

    /// Run `f` against the crypto context while holding the context lock.
    pub fn with_crypto_context<R>(&self, f: impl FnOnce(&B::Crypto) -> R) -> Result<R, HsmError> {
        let state = self.live_state("crypto context access")?;
        Ok(f(state.crypto()?))
    }

    // ==================== Lifecycle ====================

    /// Close and reopen the crypto context against the configured token.
    pub fn reload_crypto_context(&self) -> Result<(), HsmError> {
        let mut state = self.live_state("crypto context reload")?;
        self.reload_locked(&mut state)
    }

    /// Release every handle in fixed order. Safe to call more than once.
    pub fn destroy(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.lifecycle != LifecycleState::Destroyed {
            info!(token_label = %self.config.token_label, "Destroying SGX context");
        }
        state.teardown();
    }

    // ==================== Keys ====================

    /// Generate a token-resident key pair under `label`.
    ///
    /// Invalid `(algorithm, size)` combinations are coerced to a default with
    /// a warning; only device failures are errors.
    pub fn initialize_key(&self, label: &str, algorithm: &str, size: u32) -> Result<(), HsmError> {
        let mut state = self.live_state("key initialization")?;
        let crypto = state.crypto()?;

        let key_id = generate_key_id(crypto, KEY_ID_LEN)?;
        let spec = KeySpec::resolve(algorithm, size);
        let template = KeyPairTemplate::persistent(spec, key_id, label.as_bytes());

        crypto.generate_key_pair(&template).map_err(|e| match e {
            HsmError::KeyGeneration(_) => e,
            other => HsmError::KeyGeneration(other.to_string()),
        })?;

        state.lifecycle = LifecycleState::KeysProvisioned;
        info!(label, %spec, "Crypto key pair generated");
        Ok(())
    }

    /// Generate the session-scoped enclave quote key pair, replacing any previous one.
    pub fn generate_quote_key_pair(&self) -> Result<(), HsmError> {
        let mut state = self.live_state("quote key generation")?;
        let p11 = state.p11.as_mut().ok_or(HsmError::InvalidContext)?;
        let session = p11.session.as_ref().ok_or(HsmError::InvalidContext)?;

        for key in [p11.quote_private_key.take(), p11.quote_public_key.take()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = p11.device.destroy_object(session, key) {
                warn!(?key, "Failed to destroy previous quote key: {}", e);
            }
        }

        let key_id = generate_key_id(&OsRandom, QUOTE_KEY_ID_LEN)?;
        let (public, private) = p11
            .device
            .generate_key_pair(session, &KeyPairTemplate::enclave_quote(key_id))
            .map_err(|e| HsmError::KeyGeneration(e.to_string()))?;

        p11.quote_public_key = Some(public);
        p11.quote_private_key = Some(private);
        info!(?public, ?private, "Enclave quote key pair generated");
        Ok(())
    }

    /// Run the platform quote call against the quote public key and split its output.
    ///
    /// `export` receives the device, the open session and the quote public key
    /// handle, and must return the exported `CK_RSA_PUBLIC_KEY_PARAMS` blob.
    pub fn export_quote<F>(&self, export: F) -> Result<QuoteEvidence, HsmError>
    where
        F: FnOnce(&B::Device, &SessionOf<B>, ObjectOf<B>) -> Result<Vec<u8>, HsmError>,
    {
        let state = self.live_state("quote export")?;
        let p11 = state.p11.as_ref().ok_or(HsmError::InvalidContext)?;
        let session = p11.session.as_ref().ok_or(HsmError::InvalidContext)?;
        let public = p11.quote_public_key.ok_or_else(|| {
            HsmError::KeyGeneration("enclave quote key pair has not been generated".to_string())
        })?;

        let blob = export(&p11.device, session, public)?;
        QuoteEvidence::parse(&blob)
    }

    // ==================== Certificates ====================

    /// Self-sign a root CA certificate with the token key labelled `key_label`.
    pub fn issue_ca_certificate(&self, key_label: &str) -> Result<CaCertificate, HsmError> {
        let state = self.live_state("CA issuance")?;
        let signer = state
            .crypto()?
            .signer(key_label)
            .map_err(|e| HsmError::CertificateIssuance(e.to_string()))?;
        ca::issue_ca_certificate(&signer)
    }
}

impl<B: HsmBackend> Drop for SgxContext<B> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        state.teardown();
    }
}
