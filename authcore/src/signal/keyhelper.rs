use super::curve::{Curve, CurveError, KeyPair, signal_public_key};
use crate::codec::buffer;
use rand::{Rng, rng};
use serde::{Deserialize, Serialize};

/// A pre-key pair signed by the identity key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedKeyPair {
    pub key_pair: KeyPair,
    #[serde(with = "buffer")]
    pub signature: Vec<u8>,
    pub key_id: u32,
}

pub fn generate_registration_id() -> u32 {
    rng().random_range(1..=16380)
}

pub fn signed_key_pair(
    curve: &dyn Curve,
    identity_key_pair: &KeyPair,
    key_id: u32,
) -> Result<SignedKeyPair, CurveError> {
    let key_pair = curve.generate_key_pair();
    let signature =
        curve.calculate_signature(&identity_key_pair.private, &signal_public_key(&key_pair.public))?;
    Ok(SignedKeyPair {
        key_pair,
        signature,
        key_id,
    })
}

pub fn generate_pre_keys(curve: &dyn Curve, start: u32, count: u32) -> Vec<(u32, KeyPair)> {
    (start..start.saturating_add(count))
        .map(|id| (id, curve.generate_key_pair()))
        .collect()
}

pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rng().fill(&mut bytes[..]);
    bytes
}
