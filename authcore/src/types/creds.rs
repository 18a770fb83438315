use crate::codec::{Value, buffer};
use crate::signal::keyhelper::{self, SignedKeyPair};
use crate::signal::{Curve, CurveError, KeyPair};
use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSettings {
    #[serde(default)]
    pub unarchive_chats: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_disappearing_mode: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify: Option<String>,
}

/// Key material and account state that must survive restarts.
///
/// Fields this crate does not model are kept in `extra` and written back
/// unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationCreds {
    pub noise_key: KeyPair,
    pub pairing_ephemeral_key_pair: KeyPair,
    pub signed_identity_key: KeyPair,
    pub signed_pre_key: SignedKeyPair,
    pub registration_id: u32,
    pub adv_secret_key: String,
    #[serde(default)]
    pub processed_history_messages: Vec<Value>,
    pub next_pre_key_id: u32,
    pub first_unuploaded_pre_key_id: u32,
    #[serde(default)]
    pub account_sync_counter: u32,
    #[serde(default)]
    pub account_settings: AccountSettings,
    pub device_id: String,
    pub phone_id: String,
    #[serde(with = "buffer")]
    pub identity_id: Vec<u8>,
    #[serde(default)]
    pub registered: bool,
    #[serde(with = "buffer")]
    pub backup_token: Vec<u8>,
    #[serde(default = "empty_object")]
    pub registration: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pairing_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_prop_hash: Option<String>,
    #[serde(
        default,
        with = "buffer::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub routing_info: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub me: Option<Contact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn empty_object() -> Value {
    Value::Object(BTreeMap::new())
}

impl AuthenticationCreds {
    /// Synthesizes fresh credentials for an unregistered device.
    pub fn generate(curve: &dyn Curve) -> Result<Self, CurveError> {
        let identity = curve.generate_key_pair();
        let signed_pre_key = keyhelper::signed_key_pair(curve, &identity, 1)?;

        Ok(Self {
            noise_key: curve.generate_key_pair(),
            pairing_ephemeral_key_pair: curve.generate_key_pair(),
            signed_identity_key: identity,
            signed_pre_key,
            registration_id: keyhelper::generate_registration_id(),
            adv_secret_key: STANDARD.encode(keyhelper::random_bytes::<32>()),
            processed_history_messages: Vec::new(),
            next_pre_key_id: 1,
            first_unuploaded_pre_key_id: 1,
            account_sync_counter: 0,
            account_settings: AccountSettings::default(),
            device_id: URL_SAFE_NO_PAD.encode(Uuid::new_v4().as_bytes()),
            phone_id: Uuid::new_v4().to_string(),
            identity_id: keyhelper::random_bytes::<20>().to_vec(),
            registered: false,
            backup_token: keyhelper::random_bytes::<20>().to_vec(),
            registration: empty_object(),
            pairing_code: None,
            last_prop_hash: None,
            routing_info: None,
            me: None,
            account: None,
            platform: None,
            extra: BTreeMap::new(),
        })
    }
}
