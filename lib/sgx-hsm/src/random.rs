//! Random sources and key identifiers

use rand::RngCore;
use rand::rngs::OsRng;

use crate::error::HsmError;

/// Anything that can fill a buffer with cryptographically secure bytes.
pub trait RandomSource {
    fn fill_random(&self, buf: &mut [u8]) -> Result<(), HsmError>;
}

/// Host operating system randomness.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn fill_random(&self, buf: &mut [u8]) -> Result<(), HsmError> {
        OsRng
            .try_fill_bytes(buf)
            .map_err(|e| HsmError::RandomSource(e.to_string()))
    }
}

/// Generate a `len` byte key identifier (`CKA_ID`) from `source`.
pub fn generate_key_id<R: RandomSource + ?Sized>(
    source: &R,
    len: usize,
) -> Result<Vec<u8>, HsmError> {
    let mut key_id = vec![0u8; len];
    source.fill_random(&mut key_id).map_err(|e| match e {
        HsmError::RandomSource(_) => e,
        other => HsmError::RandomSource(other.to_string()),
    })?;
    Ok(key_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSource;

    impl RandomSource for FailingSource {
        fn fill_random(&self, _buf: &mut [u8]) -> Result<(), HsmError> {
            Err(HsmError::Device("CKR_RANDOM_NO_RNG".to_string()))
        }
    }

    #[test]
    fn test_generate_key_id_length() {
        assert_eq!(generate_key_id(&OsRandom, 32).unwrap().len(), 32);
        assert_eq!(generate_key_id(&OsRandom, 16).unwrap().len(), 16);
    }

    #[test]
    fn test_generate_key_id_unique() {
        let a = generate_key_id(&OsRandom, 32).unwrap();
        let b = generate_key_id(&OsRandom, 32).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_generate_key_id_wraps_source_failure() {
        let err = generate_key_id(&FailingSource, 32).unwrap_err();
        assert!(matches!(err, HsmError::RandomSource(msg) if msg.contains("CKR_RANDOM_NO_RNG")));
    }
}
