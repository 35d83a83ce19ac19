//! Key pair parameters and templates

use std::fmt;
use std::str::FromStr;
use tracing::warn;

pub const MIN_RSA_KEY_SIZE: u32 = 2048;
pub const MAX_RSA_KEY_SIZE: u32 = 8192;
const ALLOWED_RSA_KEY_SIZES: [u32; 3] = [MIN_RSA_KEY_SIZE, 4096, MAX_RSA_KEY_SIZE];

pub const EC_CURVE_256: u32 = 256;
pub const EC_CURVE_384: u32 = 384;
pub const EC_CURVE_521: u32 = 521;

/// Modulus size of the enclave quote key.
pub const QUOTE_RSA_KEY_SIZE: u32 = 3072;
pub const ENCLAVE_QUOTE_KEY_LABEL: &str = "Enclave Quote";
pub const QUOTE_KEY_ID_LEN: usize = 16;
pub const KEY_ID_LEN: usize = 32;

/// RSA public exponent 65537.
pub const RSA_PUBLIC_EXPONENT: [u8; 3] = [0x01, 0x00, 0x01];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    Rsa,
    Ecdsa,
}

impl FromStr for KeyAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rsa" => Ok(KeyAlgorithm::Rsa),
            "ecdsa" => Ok(KeyAlgorithm::Ecdsa),
            other => Err(format!("unknown key algorithm '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EcCurve {
    P256,
    P384,
    P521,
}

impl EcCurve {
    /// DER-encoded named curve OID, as carried in `CKA_EC_PARAMS`.
    pub fn params_hex(&self) -> &'static str {
        match self {
            // 1.2.840.10045.3.1.7
            EcCurve::P256 => "06082a8648ce3d030107",
            // 1.3.132.0.34
            EcCurve::P384 => "06052b81040022",
            // 1.3.132.0.35
            EcCurve::P521 => "06052b81040023",
        }
    }

    pub fn from_params(params: &[u8]) -> Option<Self> {
        let encoded = hex::encode(params);
        [EcCurve::P256, EcCurve::P384, EcCurve::P521]
            .into_iter()
            .find(|curve| curve.params_hex() == encoded)
    }

    pub fn bits(&self) -> u32 {
        match self {
            EcCurve::P256 => EC_CURVE_256,
            EcCurve::P384 => EC_CURVE_384,
            EcCurve::P521 => EC_CURVE_521,
        }
    }
}

/// A fully resolved key pair request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySpec {
    Rsa { bits: u32 },
    Ec(EcCurve),
}

impl Default for KeySpec {
    fn default() -> Self {
        KeySpec::Rsa {
            bits: MIN_RSA_KEY_SIZE,
        }
    }
}

impl fmt::Display for KeySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySpec::Rsa { bits } => write!(f, "RSA-{}", bits),
            KeySpec::Ec(curve) => write!(f, "ECDSA-P{}", curve.bits()),
        }
    }
}

impl KeySpec {
    /// Map a requested `(algorithm, size)` onto the allow-list.
    ///
    /// Anything outside it is coerced to a safe default with a warning; this
    /// never fails.
    pub fn resolve(algorithm: &str, size: u32) -> Self {
        match algorithm.parse::<KeyAlgorithm>() {
            Ok(KeyAlgorithm::Rsa) => {
                if ALLOWED_RSA_KEY_SIZES.contains(&size) {
                    KeySpec::Rsa { bits: size }
                } else {
                    warn!(
                        requested = size,
                        "Unspecified or invalid RSA key size, valid values are '2048', '4096' or '8192', defaulting to 2048"
                    );
                    KeySpec::default()
                }
            }
            Ok(KeyAlgorithm::Ecdsa) => {
                let curve = match size {
                    EC_CURVE_256 => EcCurve::P256,
                    EC_CURVE_384 => EcCurve::P384,
                    EC_CURVE_521 => EcCurve::P521,
                    _ => {
                        warn!(
                            requested = size,
                            "Unspecified or invalid ECDSA curve, valid values are '256', '384' or '521', defaulting to 256"
                        );
                        EcCurve::P256
                    }
                };
                KeySpec::Ec(curve)
            }
            Err(_) => {
                warn!(
                    algorithm,
                    "Unspecified or invalid key algorithm, defaulting to RSA 2048"
                );
                KeySpec::default()
            }
        }
    }
}

/// Attributes for one key pair generation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPairTemplate {
    pub spec: KeySpec,
    pub id: Vec<u8>,
    pub label: Vec<u8>,
    /// Persist on the token (`CKA_TOKEN`) rather than as a session object.
    pub token: bool,
    /// Wrap/unwrap capable and extractable, as the quote export requires.
    pub wrapping: bool,
}

impl KeyPairTemplate {
    /// Token-resident signing key pair under `label`.
    pub fn persistent(spec: KeySpec, id: Vec<u8>, label: &[u8]) -> Self {
        Self {
            spec,
            id,
            label: label.to_vec(),
            token: true,
            wrapping: false,
        }
    }

    /// Session-scoped RSA key pair used to export the enclave quote.
    pub fn enclave_quote(id: Vec<u8>) -> Self {
        Self {
            spec: KeySpec::Rsa {
                bits: QUOTE_RSA_KEY_SIZE,
            },
            id,
            label: ENCLAVE_QUOTE_KEY_LABEL.as_bytes().to_vec(),
            token: false,
            wrapping: true,
        }
    }
}
