//! PKCS#11 backend for the SGX crypto provider
//!
//! Wraps a cryptoki module behind [`HsmBackend`]. The library is loaded and
//! initialized once; the crypto context and every device handed out share it.
//! Keys are identified by their label and looked up each time.

use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::error::{Error as CryptokiError, RvError};
use cryptoki::mechanism::Mechanism;
use cryptoki::object::{Attribute, AttributeType, KeyType, ObjectClass, ObjectHandle};
use cryptoki::session::{Session, UserType};
use cryptoki::slot::Slot;
use cryptoki::types::AuthPin;
use der::Decode;
use der::asn1::OctetString;
use sha2::{Digest, Sha256, Sha384, Sha512};
use spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::ca::{
    self, CaSigner, ECDSA_WITH_SHA_256, ECDSA_WITH_SHA_384, ECDSA_WITH_SHA_512,
    SHA_256_WITH_RSA_ENCRYPTION,
};
use crate::device::{CryptoConfig, CryptoContext, HsmBackend, Pkcs11Device, TokenSummary};
use crate::error::HsmError;
use crate::keys::{EcCurve, KeyPairTemplate, KeySpec, RSA_PUBLIC_EXPONENT};
use crate::random::RandomSource;

/// Where the SGX PKCS#11 provider installs by default.
pub const DEFAULT_LIBRARY_PATH: &str = "/usr/local/lib/libp11sgx.so";

fn auth_pin(pin: &str) -> AuthPin {
    AuthPin::new(pin.into())
}

/// Log in as the normal user. Login state is per token, so a second session
/// on an already authenticated token is not an error.
fn login_user(session: &Session, pin: &str) -> Result<(), HsmError> {
    match session.login(UserType::User, Some(&auth_pin(pin))) {
        Ok(()) | Err(CryptokiError::Pkcs11(RvError::UserAlreadyLoggedIn, _)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn logout(session: &Session) -> Result<(), HsmError> {
    match session.logout() {
        Ok(()) | Err(CryptokiError::Pkcs11(RvError::UserNotLoggedIn, _)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Mechanism and public/private attribute sets for `template`.
fn key_pair_attributes(
    template: &KeyPairTemplate,
) -> Result<(Mechanism<'static>, Vec<Attribute>, Vec<Attribute>), HsmError> {
    let mut public = vec![
        Attribute::Class(ObjectClass::PUBLIC_KEY),
        Attribute::Token(template.token),
        Attribute::Verify(true),
        Attribute::Label(template.label.clone()),
        Attribute::Id(template.id.clone()),
    ];
    let mut private = vec![
        Attribute::Class(ObjectClass::PRIVATE_KEY),
        Attribute::Token(template.token),
        Attribute::Private(true),
        Attribute::Sensitive(true),
        Attribute::Sign(true),
        Attribute::Label(template.label.clone()),
        Attribute::Id(template.id.clone()),
    ];

    let mechanism = match template.spec {
        KeySpec::Rsa { bits } => {
            public.extend([
                Attribute::KeyType(KeyType::RSA),
                Attribute::Encrypt(true),
                Attribute::ModulusBits(u64::from(bits).into()),
                Attribute::PublicExponent(RSA_PUBLIC_EXPONENT.to_vec()),
            ]);
            private.extend([Attribute::KeyType(KeyType::RSA), Attribute::Decrypt(true)]);
            Mechanism::RsaPkcsKeyPairGen
        }
        KeySpec::Ec(curve) => {
            let ec_params = hex::decode(curve.params_hex())
                .map_err(|e| HsmError::KeyGeneration(format!("Invalid EC params: {}", e)))?;
            public.extend([
                Attribute::KeyType(KeyType::EC),
                Attribute::EcParams(ec_params),
            ]);
            private.push(Attribute::KeyType(KeyType::EC));
            Mechanism::EccKeyPairGen
        }
    };

    if template.wrapping {
        public.push(Attribute::Wrap(true));
        private.extend([Attribute::Unwrap(true), Attribute::Extractable(true)]);
    }

    Ok((mechanism, public, private))
}

fn find_key(session: &Session, label: &str, class: ObjectClass) -> Result<ObjectHandle, HsmError> {
    let template = vec![
        Attribute::Class(class),
        Attribute::Label(label.as_bytes().to_vec()),
    ];

    session
        .find_objects(&template)?
        .into_iter()
        .next()
        .ok_or_else(|| HsmError::Device(format!("Key not found: {}", label)))
}

/// Find the initialized token labelled `token_label` and open a logged-in session on it.
fn open_token_session(pkcs11: &Pkcs11, token_label: &str, user_pin: &str) -> Result<Session, HsmError> {
    for slot in pkcs11.get_slots_with_token()? {
        let info = pkcs11.get_token_info(slot)?;
        if info.token_initialized() && info.label() == token_label {
            let session = pkcs11.open_rw_session(slot)?;
            login_user(&session, user_pin)?;
            return Ok(session);
        }
    }
    Err(HsmError::TokenNotFound(token_label.to_string()))
}

// ==================== Backend ====================

/// A loaded and initialized PKCS#11 module.
#[derive(Clone)]
pub struct CryptokiBackend {
    pkcs11: Arc<Pkcs11>,
}

impl CryptokiBackend {
    pub fn new(library_path: &str) -> Result<Self, HsmError> {
        let pkcs11 = Pkcs11::new(library_path)?;
        pkcs11.initialize(CInitializeArgs::OsThreads)?;
        info!(library_path, "PKCS#11 module initialized");

        Ok(Self {
            pkcs11: Arc::new(pkcs11),
        })
    }
}

impl HsmBackend for CryptokiBackend {
    type Device = CryptokiDevice;
    type Crypto = TokenContext;

    fn configure(&self, config: &CryptoConfig) -> Result<TokenContext, HsmError> {
        let session = open_token_session(&self.pkcs11, &config.token_label, &config.user_pin)?;
        debug!(token_label = %config.token_label, "Token context opened");

        Ok(TokenContext {
            session: Arc::new(Mutex::new(session)),
        })
    }

    fn open_device(&self) -> Result<CryptokiDevice, HsmError> {
        Ok(CryptokiDevice {
            pkcs11: Arc::clone(&self.pkcs11),
        })
    }
}

// ==================== Device ====================

/// Raw slot and session access on the shared module.
pub struct CryptokiDevice {
    pkcs11: Arc<Pkcs11>,
}

impl Pkcs11Device for CryptokiDevice {
    type Slot = Slot;
    type Session = Session;
    type Object = ObjectHandle;

    fn slots_with_token(&self) -> Result<Vec<Slot>, HsmError> {
        Ok(self.pkcs11.get_slots_with_token()?)
    }

    fn token_info(&self, slot: Slot) -> Result<TokenSummary, HsmError> {
        let info = self.pkcs11.get_token_info(slot)?;
        Ok(TokenSummary {
            label: info.label().to_string(),
            initialized: info.token_initialized(),
        })
    }

    fn init_token(
        &self,
        slot: Slot,
        label: &str,
        so_pin: &str,
        user_pin: &str,
    ) -> Result<(), HsmError> {
        self.pkcs11.init_token(slot, &auth_pin(so_pin), label)?;

        let session = self.pkcs11.open_rw_session(slot)?;
        session.login(UserType::So, Some(&auth_pin(so_pin)))?;
        session.init_pin(&auth_pin(user_pin))?;
        session.logout()?;
        Ok(())
    }

    fn open_rw_session(&self, slot: Slot) -> Result<Session, HsmError> {
        Ok(self.pkcs11.open_rw_session(slot)?)
    }

    fn login_user(&self, session: &Session, pin: &str) -> Result<(), HsmError> {
        login_user(session, pin)
    }

    fn logout(&self, session: &Session) -> Result<(), HsmError> {
        logout(session)
    }

    fn generate_key_pair(
        &self,
        session: &Session,
        template: &KeyPairTemplate,
    ) -> Result<(ObjectHandle, ObjectHandle), HsmError> {
        let (mechanism, public, private) = key_pair_attributes(template)?;
        Ok(session.generate_key_pair(&mechanism, &public, &private)?)
    }

    fn destroy_object(&self, session: &Session, object: ObjectHandle) -> Result<(), HsmError> {
        Ok(session.destroy_object(object)?)
    }

    fn close_session(&self, session: Session) -> Result<(), HsmError> {
        // C_CloseSession runs on drop
        drop(session);
        Ok(())
    }

    /// Releases this device's handle on the module only. `C_Finalize` runs
    /// once the backend and every other device and context are dropped.
    fn finalize(self) -> Result<(), HsmError> {
        drop(self.pkcs11);
        Ok(())
    }
}

// ==================== Crypto context ====================

/// Logged-in session on the configured token, used for labelled keys and randomness.
pub struct TokenContext {
    session: Arc<Mutex<Session>>,
}

impl TokenContext {
    fn lock(&self, operation: &str) -> Result<std::sync::MutexGuard<'_, Session>, HsmError> {
        self.session.lock().map_err(|_| {
            HsmError::InternalError(format!("Session lock poisoned during {}", operation))
        })
    }
}

impl RandomSource for TokenContext {
    fn fill_random(&self, buf: &mut [u8]) -> Result<(), HsmError> {
        let session = self.lock("random generation")?;
        session
            .generate_random_slice(buf)
            .map_err(|e| HsmError::RandomSource(e.to_string()))
    }
}

impl CryptoContext for TokenContext {
    type Signer = TokenKeySigner;

    fn generate_key_pair(&self, template: &KeyPairTemplate) -> Result<(), HsmError> {
        let session = self.lock("key generation")?;
        let (mechanism, public, private) = key_pair_attributes(template)?;
        session
            .generate_key_pair(&mechanism, &public, &private)
            .map_err(|e| HsmError::KeyGeneration(e.to_string()))?;
        Ok(())
    }

    fn signer(&self, label: &str) -> Result<TokenKeySigner, HsmError> {
        let session = self.lock("signer lookup")?;
        TokenKeySigner::load(&session, Arc::clone(&self.session), label)
    }

    fn close(self) -> Result<(), HsmError> {
        let session = self.lock("close")?;
        logout(&session)
    }
}

// ==================== Signer ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignatureScheme {
    RsaSha256,
    Ecdsa(EcCurve),
}

/// A token-resident private key used to self-sign the CA certificate.
pub struct TokenKeySigner {
    session: Arc<Mutex<Session>>,
    private_key: ObjectHandle,
    public_key_info: SubjectPublicKeyInfoOwned,
    scheme: SignatureScheme,
}

impl TokenKeySigner {
    fn load(session: &Session, shared: Arc<Mutex<Session>>, label: &str) -> Result<Self, HsmError> {
        let private_key = find_key(session, label, ObjectClass::PRIVATE_KEY)?;
        let public_key = find_key(session, label, ObjectClass::PUBLIC_KEY)?;

        let key_type = session
            .get_attributes(private_key, &[AttributeType::KeyType])?
            .into_iter()
            .find_map(|attr| match attr {
                Attribute::KeyType(key_type) => Some(key_type),
                _ => None,
            })
            .ok_or_else(|| HsmError::Device(format!("Key type missing for {}", label)))?;

        let (public_key_info, scheme) = if key_type == KeyType::RSA {
            let (modulus, exponent) = rsa_components(session, public_key)?;
            (
                ca::rsa_public_key_info(&modulus, &exponent)?,
                SignatureScheme::RsaSha256,
            )
        } else if key_type == KeyType::EC {
            let (params, point) = ec_components(session, public_key)?;
            let curve = EcCurve::from_params(&params)
                .ok_or_else(|| HsmError::Device(format!("Unsupported EC curve for {}", label)))?;
            let point = unwrap_ec_point(&point, curve);
            (
                ca::ec_public_key_info(&params, &point)?,
                SignatureScheme::Ecdsa(curve),
            )
        } else {
            return Err(HsmError::Device(format!(
                "Unsupported key type {} for {}",
                key_type, label
            )));
        };

        debug!(label, ?scheme, "Loaded token signing key");
        Ok(Self {
            session: shared,
            private_key,
            public_key_info,
            scheme,
        })
    }
}

fn rsa_components(session: &Session, key: ObjectHandle) -> Result<(Vec<u8>, Vec<u8>), HsmError> {
    let mut modulus = None;
    let mut exponent = None;
    for attr in session.get_attributes(key, &[AttributeType::Modulus, AttributeType::PublicExponent])? {
        match attr {
            Attribute::Modulus(bytes) => modulus = Some(bytes),
            Attribute::PublicExponent(bytes) => exponent = Some(bytes),
            _ => {}
        }
    }
    modulus
        .zip(exponent)
        .ok_or_else(|| HsmError::Device("Failed to get RSA public key".into()))
}

fn ec_components(session: &Session, key: ObjectHandle) -> Result<(Vec<u8>, Vec<u8>), HsmError> {
    let mut params = None;
    let mut point = None;
    for attr in session.get_attributes(key, &[AttributeType::EcParams, AttributeType::EcPoint])? {
        match attr {
            Attribute::EcParams(bytes) => params = Some(bytes),
            Attribute::EcPoint(bytes) => point = Some(bytes),
            _ => {}
        }
    }
    params
        .zip(point)
        .ok_or_else(|| HsmError::Device("Failed to get EC public key".into()))
}

/// `CKA_EC_POINT` is usually a DER OCTET STRING around the SEC1 point; some
/// modules return the bare point.
fn unwrap_ec_point(point: &[u8], curve: EcCurve) -> Vec<u8> {
    let expected = uncompressed_point_len(curve);
    match OctetString::from_der(point) {
        Ok(inner) if inner.as_bytes().len() == expected => inner.as_bytes().to_vec(),
        _ => point.to_vec(),
    }
}

fn uncompressed_point_len(curve: EcCurve) -> usize {
    let coordinate = (curve.bits() as usize).div_ceil(8);
    1 + 2 * coordinate
}

impl CaSigner for TokenKeySigner {
    fn public_key_info(&self) -> Result<SubjectPublicKeyInfoOwned, HsmError> {
        Ok(self.public_key_info.clone())
    }

    fn signature_algorithm(&self) -> AlgorithmIdentifierOwned {
        match self.scheme {
            SignatureScheme::RsaSha256 => AlgorithmIdentifierOwned {
                oid: SHA_256_WITH_RSA_ENCRYPTION,
                parameters: der::Any::new(der::Tag::Null, Vec::<u8>::new()).ok(),
            },
            SignatureScheme::Ecdsa(curve) => AlgorithmIdentifierOwned {
                oid: match curve {
                    EcCurve::P256 => ECDSA_WITH_SHA_256,
                    EcCurve::P384 => ECDSA_WITH_SHA_384,
                    EcCurve::P521 => ECDSA_WITH_SHA_512,
                },
                parameters: None,
            },
        }
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, HsmError> {
        let session = self
            .session
            .lock()
            .map_err(|_| HsmError::InternalError("Session lock poisoned during signing".into()))?;

        match self.scheme {
            SignatureScheme::RsaSha256 => {
                Ok(session.sign(&Mechanism::Sha256RsaPkcs, self.private_key, message)?)
            }
            SignatureScheme::Ecdsa(curve) => {
                // Hash on the host and sign with raw ECDSA
                let digest = match curve {
                    EcCurve::P256 => Sha256::digest(message).to_vec(),
                    EcCurve::P384 => Sha384::digest(message).to_vec(),
                    EcCurve::P521 => Sha512::digest(message).to_vec(),
                };
                let raw = session.sign(&Mechanism::Ecdsa, self.private_key, &digest)?;
                ca::ecdsa_signature_der(&raw)
            }
        }
    }
}
