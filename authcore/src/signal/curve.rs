use crate::codec::buffer;
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret, x25519};
use xeddsa::xed25519;
use xeddsa::{Sign, Verify};

pub const DJB_TYPE: u8 = 0x05;

#[derive(Debug, Error)]
pub enum CurveError {
    #[error("bad key type: {0}")]
    BadKeyType(u8),

    #[error("invalid {kind} key length: {len}")]
    InvalidKeyLength { kind: &'static str, len: usize },
}

/// A Curve25519 key pair as stored in credentials and pre-key records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    #[serde(with = "buffer")]
    pub public: Vec<u8>,
    #[serde(with = "buffer")]
    pub private: Vec<u8>,
}

/// Key agreement and signing capability consumed when synthesizing credentials.
pub trait Curve: Send + Sync {
    fn generate_key_pair(&self) -> KeyPair;

    fn calculate_signature(&self, private_key: &[u8], message: &[u8])
    -> Result<Vec<u8>, CurveError>;

    fn verify_signature(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool;

    fn calculate_agreement(
        &self,
        public_key: &[u8],
        private_key: &[u8],
    ) -> Result<Vec<u8>, CurveError>;
}

/// Prefixes a raw 32-byte public key with the DJB type byte.
pub fn signal_public_key(public_key: &[u8]) -> Vec<u8> {
    if public_key.len() == 33 {
        return public_key.to_vec();
    }
    let mut out = Vec::with_capacity(33);
    out.push(DJB_TYPE);
    out.extend_from_slice(public_key);
    out
}

// Corresponds to DecodePoint(); accepts prefixed and raw forms.
fn raw_public_key(public_key: &[u8]) -> Result<[u8; 32], CurveError> {
    let raw = match public_key.len() {
        33 if public_key[0] == DJB_TYPE => &public_key[1..],
        33 => return Err(CurveError::BadKeyType(public_key[0])),
        _ => public_key,
    };
    raw.try_into().map_err(|_| CurveError::InvalidKeyLength {
        kind: "public",
        len: public_key.len(),
    })
}

fn raw_private_key(private_key: &[u8]) -> Result<[u8; 32], CurveError> {
    private_key
        .try_into()
        .map_err(|_| CurveError::InvalidKeyLength {
            kind: "private",
            len: private_key.len(),
        })
}

/// X25519 agreement with XEdDSA signatures.
#[derive(Debug, Clone, Copy, Default)]
pub struct X25519Curve;

impl Curve for X25519Curve {
    fn generate_key_pair(&self) -> KeyPair {
        let private = StaticSecret::random_from_rng(&mut OsRng);
        let public = PublicKey::from(&private);
        KeyPair {
            public: public.as_bytes().to_vec(),
            private: private.to_bytes().to_vec(),
        }
    }

    fn calculate_signature(
        &self,
        private_key: &[u8],
        message: &[u8],
    ) -> Result<Vec<u8>, CurveError> {
        let key = xed25519::PrivateKey(raw_private_key(private_key)?);
        let signature: [u8; 64] = key.sign(message, &mut OsRng);
        Ok(signature.to_vec())
    }

    fn verify_signature(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
        let Ok(public_key) = raw_public_key(public_key) else {
            return false;
        };
        let Ok(signature) = <[u8; 64]>::try_from(signature) else {
            return false;
        };
        xed25519::PublicKey(public_key)
            .verify(message, &signature)
            .is_ok()
    }

    fn calculate_agreement(
        &self,
        public_key: &[u8],
        private_key: &[u8],
    ) -> Result<Vec<u8>, CurveError> {
        let shared = x25519(raw_private_key(private_key)?, raw_public_key(public_key)?);
        Ok(shared.to_vec())
    }
}
