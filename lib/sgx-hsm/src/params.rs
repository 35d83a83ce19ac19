//! Exported RSA public-key parameter blobs
//!
//! The SGX PKCS#11 provider exports the quote public key as a
//! `CK_RSA_PUBLIC_KEY_PARAMS` header followed by the modulus, the exponent
//! and finally the quote itself:
//!
//! ```text
//! +---------------+---------------+---------+----------+-------+
//! | ulExponentLen | ulModulusLen  | modulus | exponent | quote |
//! | CK_ULONG (8)  | CK_ULONG (8)  |  M      |  E       |  ...  |
//! +---------------+---------------+---------+----------+-------+
//! ```
//!
//! `CK_ULONG` is 8 bytes little-endian on the x86-64 targets that host SGX.
//! All functions here are total: malformed input yields 0 rather than a panic.

use crate::error::HsmError;

/// Width of one `CK_ULONG` header field.
const FIELD_SIZE: usize = 8;
const EXPONENT_LEN_OFFSET: usize = 0;
const MODULUS_LEN_OFFSET: usize = FIELD_SIZE;

/// Size of the fixed `CK_RSA_PUBLIC_KEY_PARAMS` header.
pub const PARAMS_HEADER_SIZE: u64 = (2 * FIELD_SIZE) as u64;

fn read_field(blob: &[u8], offset: usize) -> Option<u64> {
    let bytes = blob.get(offset..offset + FIELD_SIZE)?;
    let array: [u8; FIELD_SIZE] = bytes.try_into().ok()?;
    Some(u64::from_le_bytes(array))
}

fn has_header(blob: &[u8]) -> bool {
    blob.len() as u64 >= PARAMS_HEADER_SIZE
}

/// Size of the fixed header, independent of the blob contents.
pub fn params_size(_blob: &[u8]) -> u64 {
    PARAMS_HEADER_SIZE
}

/// Modulus length recorded in the header, or 0 if the header is incomplete.
pub fn modulus_len(blob: &[u8]) -> u64 {
    if !has_header(blob) {
        return 0;
    }
    read_field(blob, MODULUS_LEN_OFFSET).unwrap_or(0)
}

/// Exponent length recorded in the header, or 0 if the header is incomplete.
pub fn exponent_len(blob: &[u8]) -> u64 {
    if !has_header(blob) {
        return 0;
    }
    read_field(blob, EXPONENT_LEN_OFFSET).unwrap_or(0)
}

/// Offset at which the quote begins: header + modulus + exponent.
///
/// Returns 0 for an empty or truncated blob and whenever the sum overflows `u64`.
pub fn quote_offset(blob: &[u8]) -> u64 {
    if !has_header(blob) {
        return 0;
    }
    offset_from_lengths(modulus_len(blob), exponent_len(blob))
}

fn offset_from_lengths(modulus_len: u64, exponent_len: u64) -> u64 {
    let Some(public_key_size) = modulus_len.checked_add(exponent_len) else {
        return 0;
    };
    PARAMS_HEADER_SIZE
        .checked_add(public_key_size)
        .unwrap_or(0)
}

/// Public key and quote carved out of an exported parameter blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteEvidence {
    pub modulus: Vec<u8>,
    pub exponent: Vec<u8>,
    pub quote: Vec<u8>,
}

impl QuoteEvidence {
    pub fn parse(blob: &[u8]) -> Result<Self, HsmError> {
        let offset = quote_offset(blob);
        if offset == 0 {
            return Err(HsmError::InvalidParameterBlob(format!(
                "no valid header in {} byte blob",
                blob.len()
            )));
        }
        if offset > blob.len() as u64 {
            return Err(HsmError::InvalidParameterBlob(format!(
                "quote offset {} exceeds blob length {}",
                offset,
                blob.len()
            )));
        }

        // offset fits in the blob, so every partial sum below fits in usize
        let modulus_start = PARAMS_HEADER_SIZE as usize;
        let exponent_start = modulus_start + modulus_len(blob) as usize;
        let quote_start = offset as usize;

        Ok(Self {
            modulus: blob[modulus_start..exponent_start].to_vec(),
            exponent: blob[exponent_start..quote_start].to_vec(),
            quote: blob[quote_start..].to_vec(),
        })
    }
}
