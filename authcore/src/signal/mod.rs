pub mod curve;
pub mod keyhelper;

pub use curve::{Curve, CurveError, DJB_TYPE, KeyPair, X25519Curve, signal_public_key};
pub use keyhelper::{SignedKeyPair, generate_registration_id, signed_key_pair};
