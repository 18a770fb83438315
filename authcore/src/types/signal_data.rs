//! Key categories persisted next to the credentials, and their typed values.

use crate::codec::{self, CodecError, Value, buffer};
use crate::signal::KeyPair;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The closed set of record categories the protocol layer stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SignalDataType {
    PreKey,
    Session,
    SenderKey,
    SenderKeyMemory,
    AppStateSyncKey,
    AppStateSyncVersion,
    IdentityKey,
    LidMapping,
    DeviceList,
    TcToken,
}

impl SignalDataType {
    pub const ALL: [SignalDataType; 10] = [
        SignalDataType::PreKey,
        SignalDataType::Session,
        SignalDataType::SenderKey,
        SignalDataType::SenderKeyMemory,
        SignalDataType::AppStateSyncKey,
        SignalDataType::AppStateSyncVersion,
        SignalDataType::IdentityKey,
        SignalDataType::LidMapping,
        SignalDataType::DeviceList,
        SignalDataType::TcToken,
    ];

    /// Wire name used in logical ids.
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalDataType::PreKey => "pre-key",
            SignalDataType::Session => "session",
            SignalDataType::SenderKey => "sender-key",
            SignalDataType::SenderKeyMemory => "sender-key-memory",
            SignalDataType::AppStateSyncKey => "app-state-sync-key",
            SignalDataType::AppStateSyncVersion => "app-state-sync-version",
            SignalDataType::IdentityKey => "identity-key",
            SignalDataType::LidMapping => "lid-mapping",
            SignalDataType::DeviceList => "device-list",
            SignalDataType::TcToken => "tctoken",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|ty| ty.as_str() == s)
    }
}

impl fmt::Display for SignalDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppStateSyncKeyFingerprint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub device_indexes: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppStateSyncKeyData {
    #[serde(
        default,
        with = "buffer::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub key_data: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<AppStateSyncKeyFingerprint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl AppStateSyncKeyData {
    /// Rebuilds the structure from a decoded document.
    ///
    /// Besides the shape written by this crate it accepts base64 strings for
    /// `keyData`, and numeric strings or `{low, high}` pairs for integers.
    pub fn revive(value: &Value) -> Result<Self, CodecError> {
        let Value::Object(fields) = value else {
            return Err(shape("app-state-sync-key must be an object"));
        };

        let key_data = match fields.get("keyData") {
            None | Some(Value::Null) => None,
            Some(Value::Bytes(bytes)) => Some(bytes.clone()),
            Some(Value::String(encoded)) => Some(
                STANDARD
                    .decode(encoded.as_bytes())
                    .map_err(|e| shape(&format!("keyData is not base64: {e}")))?,
            ),
            Some(other) => return Err(shape(&format!("unexpected keyData: {other:?}"))),
        };

        let fingerprint = match fields.get("fingerprint") {
            None | Some(Value::Null) => None,
            Some(Value::Object(fp)) => Some(AppStateSyncKeyFingerprint {
                raw_id: long_like(fp.get("rawId"))?.map(to_u32).transpose()?,
                current_index: long_like(fp.get("currentIndex"))?.map(to_u32).transpose()?,
                device_indexes: match fp.get("deviceIndexes") {
                    None | Some(Value::Null) => Vec::new(),
                    Some(Value::Array(items)) => items
                        .iter()
                        .map(|item| {
                            long_like(Some(item))?
                                .ok_or_else(|| shape("null device index"))
                                .and_then(to_u32)
                        })
                        .collect::<Result<_, _>>()?,
                    Some(other) => {
                        return Err(shape(&format!("unexpected deviceIndexes: {other:?}")));
                    }
                },
            }),
            Some(other) => return Err(shape(&format!("unexpected fingerprint: {other:?}"))),
        };

        Ok(Self {
            key_data,
            fingerprint,
            timestamp: long_like(fields.get("timestamp"))?,
        })
    }
}

fn shape(message: &str) -> CodecError {
    CodecError::UnexpectedShape(message.to_string())
}

fn to_u32(n: i64) -> Result<u32, CodecError> {
    u32::try_from(n).map_err(|_| shape(&format!("{n} does not fit in u32")))
}

// Integers may have been persisted as numbers, numeric strings or {low, high} longs.
fn long_like(value: Option<&Value>) -> Result<Option<i64>, CodecError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .map(Some)
            .ok_or_else(|| shape(&format!("{n} is not an integer"))),
        Some(Value::String(s)) => s
            .parse::<i64>()
            .map(Some)
            .map_err(|_| shape(&format!("{s:?} is not an integer"))),
        Some(Value::Object(long)) => {
            let low = long.get("low").and_then(Value::as_i64).unwrap_or(0);
            let high = long.get("high").and_then(Value::as_i64).unwrap_or(0);
            Ok(Some((high << 32) | (low & 0xffff_ffff)))
        }
        Some(other) => Err(shape(&format!("unexpected integer: {other:?}"))),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexValue {
    #[serde(with = "buffer")]
    pub value_mac: Vec<u8>,
}

/// App state collection version (LT-hash state).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LtHashState {
    pub version: u64,
    #[serde(with = "buffer")]
    pub hash: Vec<u8>,
    #[serde(default)]
    pub index_value_map: BTreeMap<String, IndexValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcToken {
    #[serde(with = "buffer")]
    pub token: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// A typed record value; the variant determines its category.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalValue {
    PreKey(KeyPair),
    Session(Vec<u8>),
    SenderKey(Vec<u8>),
    SenderKeyMemory(BTreeMap<String, bool>),
    AppStateSyncKey(AppStateSyncKeyData),
    AppStateSyncVersion(LtHashState),
    IdentityKey(Vec<u8>),
    LidMapping(String),
    DeviceList(Vec<String>),
    TcToken(TcToken),
}

impl SignalValue {
    pub fn data_type(&self) -> SignalDataType {
        match self {
            SignalValue::PreKey(_) => SignalDataType::PreKey,
            SignalValue::Session(_) => SignalDataType::Session,
            SignalValue::SenderKey(_) => SignalDataType::SenderKey,
            SignalValue::SenderKeyMemory(_) => SignalDataType::SenderKeyMemory,
            SignalValue::AppStateSyncKey(_) => SignalDataType::AppStateSyncKey,
            SignalValue::AppStateSyncVersion(_) => SignalDataType::AppStateSyncVersion,
            SignalValue::IdentityKey(_) => SignalDataType::IdentityKey,
            SignalValue::LidMapping(_) => SignalDataType::LidMapping,
            SignalValue::DeviceList(_) => SignalDataType::DeviceList,
            SignalValue::TcToken(_) => SignalDataType::TcToken,
        }
    }

    pub fn to_value(&self) -> Result<Value, CodecError> {
        match self {
            SignalValue::PreKey(key_pair) => codec::to_value(key_pair),
            SignalValue::Session(bytes)
            | SignalValue::SenderKey(bytes)
            | SignalValue::IdentityKey(bytes) => Ok(Value::Bytes(bytes.clone())),
            SignalValue::SenderKeyMemory(memory) => codec::to_value(memory),
            SignalValue::AppStateSyncKey(data) => codec::to_value(data),
            SignalValue::AppStateSyncVersion(state) => codec::to_value(state),
            SignalValue::LidMapping(mapping) => Ok(Value::String(mapping.clone())),
            SignalValue::DeviceList(devices) => codec::to_value(devices),
            SignalValue::TcToken(token) => codec::to_value(token),
        }
    }

    pub fn from_value(data_type: SignalDataType, value: &Value) -> Result<Self, CodecError> {
        Ok(match data_type {
            SignalDataType::PreKey => SignalValue::PreKey(codec::from_value(value)?),
            SignalDataType::Session => SignalValue::Session(expect_bytes(value)?),
            SignalDataType::SenderKey => SignalValue::SenderKey(expect_bytes(value)?),
            SignalDataType::SenderKeyMemory => {
                SignalValue::SenderKeyMemory(codec::from_value(value)?)
            }
            SignalDataType::AppStateSyncKey => {
                SignalValue::AppStateSyncKey(AppStateSyncKeyData::revive(value)?)
            }
            SignalDataType::AppStateSyncVersion => {
                SignalValue::AppStateSyncVersion(codec::from_value(value)?)
            }
            SignalDataType::IdentityKey => SignalValue::IdentityKey(expect_bytes(value)?),
            SignalDataType::LidMapping => match value {
                Value::String(mapping) => SignalValue::LidMapping(mapping.clone()),
                other => return Err(shape(&format!("expected a string, found {other:?}"))),
            },
            SignalDataType::DeviceList => SignalValue::DeviceList(codec::from_value(value)?),
            SignalDataType::TcToken => SignalValue::TcToken(codec::from_value(value)?),
        })
    }
}

fn expect_bytes(value: &Value) -> Result<Vec<u8>, CodecError> {
    value
        .as_bytes()
        .map(<[u8]>::to_vec)
        .ok_or_else(|| shape(&format!("expected a binary payload, found {value:?}")))
}

/// A batch of key mutations: `Some` upserts, `None` deletes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignalDataSet {
    entries: BTreeMap<(SignalDataType, String), Option<SignalValue>>,
}

impl SignalDataSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an upsert under the value's own category.
    pub fn insert(&mut self, id: impl Into<String>, value: SignalValue) -> &mut Self {
        self.entries
            .insert((value.data_type(), id.into()), Some(value));
        self
    }

    pub fn remove(&mut self, category: SignalDataType, id: impl Into<String>) -> &mut Self {
        self.entries.insert((category, id.into()), None);
        self
    }

    pub fn with(mut self, id: impl Into<String>, value: SignalValue) -> Self {
        self.insert(id, value);
        self
    }

    pub fn without(mut self, category: SignalDataType, id: impl Into<String>) -> Self {
        self.remove(category, id);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SignalDataType, &str, Option<&SignalValue>)> {
        self.entries
            .iter()
            .map(|((category, id), value)| (*category, id.as_str(), value.as_ref()))
    }
}

impl IntoIterator for SignalDataSet {
    type Item = (SignalDataType, String, Option<SignalValue>);
    type IntoIter = std::vec::IntoIter<Self::Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries
            .into_iter()
            .map(|((category, id), value)| (category, id, value))
            .collect::<Vec<_>>()
            .into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_data_type_names_round_trip() {
        for ty in SignalDataType::ALL {
            assert_eq!(SignalDataType::parse(ty.as_str()), Some(ty));
        }
        assert_eq!(SignalDataType::parse("unknown"), None);
        assert_eq!(SignalDataType::AppStateSyncKey.to_string(), "app-state-sync-key");
    }

    #[test]
    fn test_values_convert_per_category() {
        let values = vec![
            SignalValue::PreKey(KeyPair {
                public: vec![1; 32],
                private: vec![2; 32],
            }),
            SignalValue::Session(vec![3, 4]),
            SignalValue::SenderKeyMemory(BTreeMap::from([("a@s.whatsapp.net".into(), true)])),
            SignalValue::AppStateSyncVersion(LtHashState {
                version: 3,
                hash: vec![0; 128],
                index_value_map: BTreeMap::from([(
                    "aW5kZXg=".into(),
                    IndexValue { value_mac: vec![9; 32] },
                )]),
            }),
            SignalValue::LidMapping("12345@lid".into()),
            SignalValue::DeviceList(vec!["0".into(), "12".into()]),
            SignalValue::TcToken(TcToken {
                token: vec![5; 8],
                timestamp: Some("1700000000".into()),
            }),
        ];

        for value in values {
            let tree = value.to_value().unwrap();
            let back = SignalValue::from_value(value.data_type(), &tree).unwrap();
            assert_eq!(back, value);
        }
    }

    #[test]
    fn test_category_shape_mismatch_is_an_error() {
        assert!(SignalValue::from_value(SignalDataType::Session, &Value::from("x")).is_err());
        assert!(SignalValue::from_value(SignalDataType::LidMapping, &Value::Bytes(vec![1])).is_err());
    }

    #[test]
    fn test_app_state_sync_key_revives_legacy_shapes() {
        let legacy = codec::decode(json!({
            "keyData": "AQID",
            "fingerprint": {"rawId": "7", "currentIndex": 2, "deviceIndexes": [0, 1]},
            "timestamp": {"low": 5, "high": 1, "unsigned": false}
        }))
        .unwrap();

        let revived = AppStateSyncKeyData::revive(&legacy).unwrap();
        assert_eq!(revived.key_data, Some(vec![1, 2, 3]));
        assert_eq!(
            revived.fingerprint,
            Some(AppStateSyncKeyFingerprint {
                raw_id: Some(7),
                current_index: Some(2),
                device_indexes: vec![0, 1],
            })
        );
        assert_eq!(revived.timestamp, Some((1i64 << 32) | 5));
    }

    #[test]
    fn test_app_state_sync_key_revives_own_shape() {
        let data = AppStateSyncKeyData {
            key_data: Some(vec![8; 32]),
            fingerprint: None,
            timestamp: Some(1_700_000_000_000),
        };
        let tree = SignalValue::AppStateSyncKey(data.clone()).to_value().unwrap();
        assert_eq!(AppStateSyncKeyData::revive(&tree).unwrap(), data);
        assert!(AppStateSyncKeyData::revive(&Value::from("nope")).is_err());
    }

    #[test]
    fn test_data_set_orders_and_tombstones() {
        let set = SignalDataSet::new()
            .with("1", SignalValue::Session(vec![1]))
            .without(SignalDataType::PreKey, "9")
            .with("1", SignalValue::Session(vec![2]));

        assert_eq!(set.len(), 2);
        let entries: Vec<_> = set.into_iter().collect();
        assert_eq!(entries[0], (SignalDataType::PreKey, "9".to_string(), None));
        assert_eq!(
            entries[1],
            (SignalDataType::Session, "1".to_string(), Some(SignalValue::Session(vec![2])))
        );
    }
}
