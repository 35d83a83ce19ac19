//! Self-signed CA certificate issuance
//!
//! The CA key never leaves the token: the certificate is assembled on the
//! host and only the TBS bytes are handed to a [`CaSigner`]. Template
//! material is scrubbed as soon as the signature is produced, and the issued
//! DER is held in zeroizing storage.

use der::asn1::{Any, BitString, GeneralizedTime, OctetString, Uint, UtcTime};
use der::oid::AssociatedOid;
use der::{Decode, Encode, Sequence, Tag};
use spki::{AlgorithmIdentifierOwned, ObjectIdentifier, SubjectPublicKeyInfoOwned};
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};
use x509_cert::Certificate;
use x509_cert::certificate::{TbsCertificate, Version};
use x509_cert::ext::Extension;
use x509_cert::ext::pkix::{BasicConstraints, KeyUsage, KeyUsages};
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::time::{Time, Validity};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::HsmError;
use crate::random::{OsRandom, RandomSource};

pub const CA_SUBJECT: &str = "CN=SGX self-signed root certificate authority,O=Intel(R) Corporation";
pub const CA_VALIDITY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

pub const RSA_ENCRYPTION: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");
pub const SHA_256_WITH_RSA_ENCRYPTION: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.11");
pub const EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");
pub const ECDSA_WITH_SHA_256: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.2");
pub const ECDSA_WITH_SHA_384: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.3");
pub const ECDSA_WITH_SHA_512: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.4");

/// A key able to self-sign the CA certificate.
pub trait CaSigner {
    fn public_key_info(&self) -> Result<SubjectPublicKeyInfoOwned, HsmError>;

    fn signature_algorithm(&self) -> AlgorithmIdentifierOwned;

    /// Sign `message`, returning the signature exactly as it goes in the
    /// certificate's signature BIT STRING.
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, HsmError>;
}

fn issuance_error(context: &str) -> impl FnOnce(der::Error) -> HsmError + '_ {
    move |e| HsmError::CertificateIssuance(format!("{}: {}", context, e))
}

/// Everything about the certificate that must not outlive signing.
#[derive(Zeroize, ZeroizeOnDrop)]
struct CaTemplate {
    serial: Vec<u8>,
    not_before: u64,
    not_after: u64,
    tbs_der: Vec<u8>,
}

impl CaTemplate {
    fn new<R: RandomSource + ?Sized>(rng: &R, now: SystemTime) -> Result<Self, HsmError> {
        let not_before = now
            .duration_since(UNIX_EPOCH)
            .map_err(|e| HsmError::CertificateIssuance(format!("clock before epoch: {}", e)))?
            .as_secs();

        Ok(Self {
            serial: random_serial(rng)?,
            not_before,
            not_after: not_before + CA_VALIDITY.as_secs(),
            tbs_der: Vec::new(),
        })
    }

    fn tbs_certificate(
        &self,
        public_key_info: SubjectPublicKeyInfoOwned,
        signature_algorithm: AlgorithmIdentifierOwned,
    ) -> Result<TbsCertificate, HsmError> {
        let subject = Name::from_str(CA_SUBJECT).map_err(issuance_error("subject"))?;
        let key_usage = KeyUsage(
            KeyUsages::DigitalSignature | KeyUsages::KeyEncipherment | KeyUsages::KeyCertSign,
        );
        let basic_constraints = BasicConstraints {
            ca: true,
            path_len_constraint: None,
        };

        Ok(TbsCertificate {
            version: Version::V3,
            serial_number: SerialNumber::new(&self.serial).map_err(issuance_error("serial"))?,
            signature: signature_algorithm,
            issuer: subject.clone(),
            validity: Validity {
                not_before: asn1_time(self.not_before).map_err(issuance_error("not before"))?,
                not_after: asn1_time(self.not_after).map_err(issuance_error("not after"))?,
            },
            subject,
            subject_public_key_info: public_key_info,
            issuer_unique_id: None,
            subject_unique_id: None,
            extensions: Some(vec![
                extension(&basic_constraints, true)?,
                extension(&key_usage, true)?,
            ]),
        })
    }
}

fn extension<T: Encode + AssociatedOid>(value: &T, critical: bool) -> Result<Extension, HsmError> {
    let encoded = value.to_der().map_err(issuance_error("extension"))?;
    Ok(Extension {
        extn_id: T::OID,
        critical,
        extn_value: OctetString::new(encoded).map_err(issuance_error("extension"))?,
    })
}

/// UTCTime through 2049, GeneralizedTime after, per RFC 5280.
fn asn1_time(unix_secs: u64) -> der::Result<Time> {
    let duration = Duration::from_secs(unix_secs);
    match UtcTime::from_unix_duration(duration) {
        Ok(time) => Ok(Time::UtcTime(time)),
        Err(_) => GeneralizedTime::from_unix_duration(duration).map(Time::GeneralTime),
    }
}

/// Random serial in `[0, 2^63)`, minimally encoded as a positive INTEGER.
fn random_serial<R: RandomSource + ?Sized>(rng: &R) -> Result<Vec<u8>, HsmError> {
    let mut buf = [0u8; 8];
    rng.fill_random(&mut buf)
        .map_err(|e| HsmError::CertificateIssuance(format!("serial: {}", e)))?;
    let value = u64::from_be_bytes(buf) & (i64::MAX as u64);
    buf.zeroize();
    Ok(serial_bytes(value))
}

fn serial_bytes(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let first = bytes
        .iter()
        .position(|b| *b != 0)
        .unwrap_or(bytes.len() - 1);
    let mut serial = bytes[first..].to_vec();
    if serial[0] & 0x80 != 0 {
        serial.insert(0, 0);
    }
    serial
}

/// A signed CA certificate whose DER encoding is scrubbed on drop.
///
/// Only the DER buffer is scrubbed. The parsed [`Certificate`] (and the
/// intermediate `TbsCertificate` built during issuance) are plain x509-cert
/// values without `Zeroize`, so their heap copies of the serial and validity are
/// freed normally.
pub struct CaCertificate {
    certificate: Certificate,
    der: Zeroizing<Vec<u8>>,
}

impl CaCertificate {
    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn to_der(&self) -> &[u8] {
        &self.der
    }

    pub fn serial_number(&self) -> &[u8] {
        self.certificate.tbs_certificate.serial_number.as_bytes()
    }

    pub fn is_ca(&self) -> bool {
        self.extension::<BasicConstraints>()
            .map(|bc| bc.ca)
            .unwrap_or(false)
    }

    pub fn key_usage(&self) -> Option<KeyUsage> {
        self.extension::<KeyUsage>()
    }

    /// `notAfter - notBefore`.
    pub fn validity_period(&self) -> Option<Duration> {
        let validity = &self.certificate.tbs_certificate.validity;
        validity
            .not_after
            .to_unix_duration()
            .checked_sub(validity.not_before.to_unix_duration())
    }

    fn extension<'a, T: Decode<'a> + AssociatedOid>(&'a self) -> Option<T> {
        self.certificate
            .tbs_certificate
            .extensions
            .as_ref()?
            .iter()
            .find(|ext| ext.extn_id == T::OID)
            .and_then(|ext| T::from_der(ext.extn_value.as_bytes()).ok())
    }
}

impl std::fmt::Debug for CaCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaCertificate")
            .field("serial", &hex::encode(self.serial_number()))
            .field("der_len", &self.der.len())
            .finish()
    }
}

/// Build and self-sign a root CA certificate for `signer`'s key.
pub fn issue_ca_certificate<S: CaSigner + ?Sized>(signer: &S) -> Result<CaCertificate, HsmError> {
    issue_ca_certificate_at(signer, &OsRandom, SystemTime::now())
}

pub(crate) fn issue_ca_certificate_at<S, R>(
    signer: &S,
    rng: &R,
    now: SystemTime,
) -> Result<CaCertificate, HsmError>
where
    S: CaSigner + ?Sized,
    R: RandomSource + ?Sized,
{
    let mut template = CaTemplate::new(rng, now)?;
    let signature_algorithm = signer.signature_algorithm();
    let public_key_info = signer
        .public_key_info()
        .map_err(|e| HsmError::CertificateIssuance(format!("public key: {}", e)))?;

    let tbs_certificate = template.tbs_certificate(public_key_info, signature_algorithm.clone())?;
    template.tbs_der = tbs_certificate
        .to_der()
        .map_err(issuance_error("tbs encoding"))?;

    let signature = signer.sign(&template.tbs_der);
    template.zeroize();
    let signature = signature.map_err(|e| HsmError::CertificateIssuance(format!("sign: {}", e)))?;
    debug!(len = signature.len(), "CA template signed");

    let certificate = Certificate {
        tbs_certificate,
        signature_algorithm,
        signature: BitString::from_bytes(&signature).map_err(issuance_error("signature"))?,
    };
    let der = Zeroizing::new(certificate.to_der().map_err(issuance_error("encoding"))?);
    drop(certificate);

    let certificate = Certificate::from_der(&der).map_err(issuance_error("parsing"))?;
    let issued = CaCertificate { certificate, der };
    info!(serial = %hex::encode(issued.serial_number()), "Issued self-signed CA certificate");

    Ok(issued)
}

// ==================== DER helpers for token keys ====================

#[derive(Sequence)]
struct RsaPublicKeyDer {
    modulus: Uint,
    public_exponent: Uint,
}

#[derive(Sequence)]
struct EcdsaSignatureDer {
    r: Uint,
    s: Uint,
}

/// `SubjectPublicKeyInfo` for an RSA key given its big-endian modulus and exponent.
pub fn rsa_public_key_info(
    modulus: &[u8],
    exponent: &[u8],
) -> Result<SubjectPublicKeyInfoOwned, HsmError> {
    let key = RsaPublicKeyDer {
        modulus: Uint::new(modulus).map_err(issuance_error("modulus"))?,
        public_exponent: Uint::new(exponent).map_err(issuance_error("exponent"))?,
    };
    let encoded = key.to_der().map_err(issuance_error("rsa public key"))?;

    Ok(SubjectPublicKeyInfoOwned {
        algorithm: AlgorithmIdentifierOwned {
            oid: RSA_ENCRYPTION,
            parameters: Some(
                Any::new(Tag::Null, Vec::<u8>::new()).map_err(issuance_error("rsa parameters"))?,
            ),
        },
        subject_public_key: BitString::from_bytes(&encoded)
            .map_err(issuance_error("rsa public key"))?,
    })
}

/// `SubjectPublicKeyInfo` for an EC key from `CKA_EC_PARAMS` and the raw SEC1 point.
pub fn ec_public_key_info(
    ec_params: &[u8],
    point: &[u8],
) -> Result<SubjectPublicKeyInfoOwned, HsmError> {
    Ok(SubjectPublicKeyInfoOwned {
        algorithm: AlgorithmIdentifierOwned {
            oid: EC_PUBLIC_KEY,
            parameters: Some(Any::from_der(ec_params).map_err(issuance_error("ec params"))?),
        },
        subject_public_key: BitString::from_bytes(point).map_err(issuance_error("ec point"))?,
    })
}

/// DER-encode a raw `r || s` ECDSA signature as produced by `CKM_ECDSA`.
pub fn ecdsa_signature_der(raw: &[u8]) -> Result<Vec<u8>, HsmError> {
    if raw.is_empty() || raw.len() % 2 != 0 {
        return Err(HsmError::CertificateIssuance(format!(
            "invalid raw ECDSA signature length {}",
            raw.len()
        )));
    }
    let (r, s) = raw.split_at(raw.len() / 2);
    EcdsaSignatureDer {
        r: Uint::new(r).map_err(issuance_error("signature r"))?,
        s: Uint::new(s).map_err(issuance_error("signature s"))?,
    }
    .to_der()
    .map_err(issuance_error("signature"))
}
