//! In-memory PKCS#11 backend for exercising the lifecycle without a token.

use der::Decode;
use p256::ecdsa::{DerSignature, SigningKey, VerifyingKey};
use p256::ecdsa::signature::Signer;
use p256::pkcs8::EncodePublicKey;
use rand::rngs::OsRng;
use spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing_subscriber::layer::{Context, SubscriberExt};

use crate::ca::{CaSigner, ECDSA_WITH_SHA_256};
use crate::device::{CryptoConfig, CryptoContext, HsmBackend, Pkcs11Device, TokenSummary};
use crate::error::HsmError;
use crate::keys::{KeyPairTemplate, KeySpec};
use crate::random::{OsRandom, RandomSource};

/// Software P-256 key standing in for a token-resident CA key.
pub struct SoftwareSigner {
    key: SigningKey,
}

impl SoftwareSigner {
    pub fn random() -> Self {
        Self {
            key: SigningKey::random(&mut OsRng),
        }
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.key
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        self.key.verifying_key()
    }
}

impl CaSigner for SoftwareSigner {
    fn public_key_info(&self) -> Result<SubjectPublicKeyInfoOwned, HsmError> {
        let document = self
            .verifying_key()
            .to_public_key_der()
            .map_err(|e| HsmError::Device(e.to_string()))?;
        SubjectPublicKeyInfoOwned::from_der(document.as_bytes())
            .map_err(|e| HsmError::Device(e.to_string()))
    }

    fn signature_algorithm(&self) -> AlgorithmIdentifierOwned {
        AlgorithmIdentifierOwned {
            oid: ECDSA_WITH_SHA_256,
            parameters: None,
        }
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, HsmError> {
        let signature: DerSignature = self.key.sign(message);
        Ok(signature.as_bytes().to_vec())
    }
}

#[derive(Debug, Clone)]
pub struct MockToken {
    pub label: String,
    pub initialized: bool,
    pub user_pin: String,
}

/// Shared state of the fake module; every call is appended to `calls`.
#[derive(Debug, Default)]
pub struct MockHsm {
    pub tokens: Vec<MockToken>,
    pub next_handle: u64,
    pub open_sessions: HashSet<u64>,
    pub objects: HashSet<u64>,
    pub token_keys: Vec<KeyPairTemplate>,
    pub session_keys: Vec<KeyPairTemplate>,
    pub calls: Vec<String>,
    pub configure_count: usize,
    pub fail_configure: Option<String>,
    pub fail_open_session: bool,
    pub fail_key_generation: bool,
    pub fail_random: bool,
    pub fail_init_token: bool,
    pub fail_logout: bool,
}

impl MockHsm {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls.iter().filter(|c| c.as_str() == call).count()
    }

    pub fn calls_matching(&self, prefix: &str) -> Vec<String> {
        self.calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .cloned()
            .collect()
    }
}

#[derive(Clone, Default)]
pub struct MockBackend {
    hsm: Arc<Mutex<MockHsm>>,
}

impl MockBackend {
    /// A module whose only slot holds an initialized token labelled `label`.
    pub fn with_token(label: &str, user_pin: &str) -> Self {
        let backend = Self::default();
        backend.hsm().tokens.push(MockToken {
            label: label.to_string(),
            initialized: true,
            user_pin: user_pin.to_string(),
        });
        backend
    }

    /// A module with one empty, uninitialized token.
    pub fn with_uninitialized_token() -> Self {
        let backend = Self::default();
        backend.hsm().tokens.push(MockToken {
            label: String::new(),
            initialized: false,
            user_pin: String::new(),
        });
        backend
    }

    pub fn hsm(&self) -> MutexGuard<'_, MockHsm> {
        self.hsm.lock().unwrap()
    }
}

impl HsmBackend for MockBackend {
    type Device = MockDevice;
    type Crypto = MockCryptoContext;

    fn configure(&self, config: &CryptoConfig) -> Result<Self::Crypto, HsmError> {
        let mut hsm = self.hsm();
        hsm.configure_count += 1;
        hsm.calls.push("configure".to_string());

        if let Some(message) = hsm.fail_configure.clone() {
            return Err(HsmError::Device(message));
        }

        let found = hsm
            .tokens
            .iter()
            .any(|t| t.initialized && t.label == config.token_label && t.user_pin == config.user_pin);
        if !found {
            return Err(HsmError::TokenNotFound(config.token_label.clone()));
        }

        Ok(MockCryptoContext {
            hsm: Arc::clone(&self.hsm),
        })
    }

    fn open_device(&self) -> Result<Self::Device, HsmError> {
        self.hsm().calls.push("open_device".to_string());
        Ok(MockDevice {
            hsm: Arc::clone(&self.hsm),
        })
    }
}

pub struct MockDevice {
    hsm: Arc<Mutex<MockHsm>>,
}

impl MockDevice {
    fn hsm(&self) -> MutexGuard<'_, MockHsm> {
        self.hsm.lock().unwrap()
    }
}

impl Pkcs11Device for MockDevice {
    type Slot = usize;
    type Session = u64;
    type Object = u64;

    fn slots_with_token(&self) -> Result<Vec<usize>, HsmError> {
        Ok((0..self.hsm().tokens.len()).collect())
    }

    fn token_info(&self, slot: usize) -> Result<TokenSummary, HsmError> {
        let hsm = self.hsm();
        let token = hsm
            .tokens
            .get(slot)
            .ok_or_else(|| HsmError::Device(format!("CKR_SLOT_ID_INVALID {}", slot)))?;
        Ok(TokenSummary {
            label: token.label.clone(),
            initialized: token.initialized,
        })
    }

    fn init_token(
        &self,
        slot: usize,
        label: &str,
        _so_pin: &str,
        user_pin: &str,
    ) -> Result<(), HsmError> {
        let mut hsm = self.hsm();
        hsm.calls.push(format!("init_token:{}", label));
        if hsm.fail_init_token {
            return Err(HsmError::Device("CKR_PIN_INCORRECT".to_string()));
        }
        let token = hsm
            .tokens
            .get_mut(slot)
            .ok_or_else(|| HsmError::Device(format!("CKR_SLOT_ID_INVALID {}", slot)))?;
        token.label = label.to_string();
        token.user_pin = user_pin.to_string();
        token.initialized = true;
        Ok(())
    }

    fn open_rw_session(&self, _slot: usize) -> Result<u64, HsmError> {
        let mut hsm = self.hsm();
        hsm.calls.push("open_session".to_string());
        if hsm.fail_open_session {
            return Err(HsmError::Device("CKR_DEVICE_ERROR".to_string()));
        }
        let session = hsm.handle();
        hsm.open_sessions.insert(session);
        Ok(session)
    }

    fn login_user(&self, _session: &u64, _pin: &str) -> Result<(), HsmError> {
        self.hsm().calls.push("login".to_string());
        Ok(())
    }

    fn logout(&self, _session: &u64) -> Result<(), HsmError> {
        let mut hsm = self.hsm();
        hsm.calls.push("logout".to_string());
        if hsm.fail_logout {
            return Err(HsmError::Device("CKR_USER_NOT_LOGGED_IN".to_string()));
        }
        Ok(())
    }

    fn generate_key_pair(
        &self,
        session: &u64,
        template: &KeyPairTemplate,
    ) -> Result<(u64, u64), HsmError> {
        let mut hsm = self.hsm();
        if !hsm.open_sessions.contains(session) {
            return Err(HsmError::Device("CKR_SESSION_HANDLE_INVALID".to_string()));
        }
        if hsm.fail_key_generation {
            return Err(HsmError::Device("CKR_MECHANISM_INVALID".to_string()));
        }
        let public = hsm.handle();
        let private = hsm.handle();
        hsm.objects.insert(public);
        hsm.objects.insert(private);
        hsm.session_keys.push(template.clone());
        Ok((public, private))
    }

    fn destroy_object(&self, _session: &u64, object: u64) -> Result<(), HsmError> {
        let mut hsm = self.hsm();
        hsm.calls.push(format!("destroy_object:{}", object));
        if !hsm.objects.remove(&object) {
            return Err(HsmError::Device("CKR_OBJECT_HANDLE_INVALID".to_string()));
        }
        Ok(())
    }

    fn close_session(&self, session: u64) -> Result<(), HsmError> {
        let mut hsm = self.hsm();
        hsm.calls.push("close_session".to_string());
        if !hsm.open_sessions.remove(&session) {
            return Err(HsmError::Device("CKR_SESSION_HANDLE_INVALID".to_string()));
        }
        Ok(())
    }

    fn finalize(self) -> Result<(), HsmError> {
        self.hsm().calls.push("finalize".to_string());
        Ok(())
    }
}

pub struct MockCryptoContext {
    hsm: Arc<Mutex<MockHsm>>,
}

impl RandomSource for MockCryptoContext {
    fn fill_random(&self, buf: &mut [u8]) -> Result<(), HsmError> {
        if self.hsm.lock().unwrap().fail_random {
            return Err(HsmError::RandomSource("CKR_RANDOM_NO_RNG".to_string()));
        }
        OsRandom.fill_random(buf)
    }
}

impl CryptoContext for MockCryptoContext {
    type Signer = SoftwareSigner;

    fn generate_key_pair(&self, template: &KeyPairTemplate) -> Result<(), HsmError> {
        let mut hsm = self.hsm.lock().unwrap();
        if hsm.fail_key_generation {
            return Err(HsmError::Device("CKR_TEMPLATE_INCONSISTENT".to_string()));
        }
        hsm.token_keys.push(template.clone());
        Ok(())
    }

    fn signer(&self, label: &str) -> Result<SoftwareSigner, HsmError> {
        let hsm = self.hsm.lock().unwrap();
        hsm.token_keys
            .iter()
            .find(|t| t.label == label.as_bytes() && matches!(t.spec, KeySpec::Ec(_)))
            .map(|_| SoftwareSigner::random())
            .ok_or_else(|| HsmError::Device(format!("Key not found: {}", label)))
    }

    fn close(self) -> Result<(), HsmError> {
        self.hsm.lock().unwrap().calls.push("close_crypto".to_string());
        Ok(())
    }
}

/// Counts `WARN` events emitted on the current thread.
struct WarningCounter(Arc<AtomicUsize>);

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for WarningCounter {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == tracing::Level::WARN {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Run `f` and return its result along with the number of warnings it logged.
pub fn count_warnings<R>(f: impl FnOnce() -> R) -> (R, usize) {
    let count = Arc::new(AtomicUsize::new(0));
    let subscriber = tracing_subscriber::registry().with(WarningCounter(count.clone()));
    let result = tracing::subscriber::with_default(subscriber, f);
    (result, count.load(Ordering::SeqCst))
}
