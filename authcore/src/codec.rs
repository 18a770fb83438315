//! Binary-aware value tree and the storage codec.
//!
//! Binary payloads are written as `{"type":"Buffer","data":"<base64>"}`. A plain
//! object whose key set is exactly `type`/`data` is escaped as
//! `{"type":"Object","data":[[key, value], ...]}` so it can never be read back
//! as a buffer. Documents written to a backend carry a format version.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::de::{self, DeserializeOwned, MapAccess, SeqAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Version written into every stored document.
pub const CODEC_VERSION: u32 = 1;

const BUFFER_TAG: &str = "Buffer";
const OBJECT_TAG: &str = "Object";
const TYPE_KEY: &str = "type";
const DATA_KEY: &str = "data";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported codec version {0}, expected {CODEC_VERSION}")]
    UnsupportedVersion(u32),

    #[error("unexpected value shape: {0}")]
    UnexpectedShape(String),
}

/// A JSON-like tree that keeps binary payloads distinct from strings.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Looks up `key` when this value is an object.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_object().and_then(|map| map.get(key))
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bytes(bytes)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n.into())
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Number(n.into())
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Object(map)
    }
}

fn is_marker_shaped(map: &BTreeMap<String, Value>) -> bool {
    map.len() == 2 && map.contains_key(TYPE_KEY) && map.contains_key(DATA_KEY)
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Number(n) => n.serialize(serializer),
            Value::String(s) => serializer.serialize_str(s),
            Value::Bytes(bytes) => buffer::serialize(bytes, serializer),
            Value::Array(items) => serializer.collect_seq(items),
            Value::Object(map) if is_marker_shaped(map) => {
                let mut out = serializer.serialize_map(Some(2))?;
                out.serialize_entry(TYPE_KEY, OBJECT_TAG)?;
                out.serialize_entry(DATA_KEY, &EscapedEntries(map))?;
                out.end()
            }
            Value::Object(map) => serializer.collect_map(map),
        }
    }
}

struct EscapedEntries<'a>(&'a BTreeMap<String, Value>);

impl Serialize for EscapedEntries<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.iter())
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a codec-encoded value")
    }

    fn visit_unit<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Value, D::Error> {
        Value::deserialize(deserializer)
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Value, E> {
        Ok(Value::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Value, E> {
        Ok(Value::Number(v.into()))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Value, E> {
        Ok(Value::Number(v.into()))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Value, E> {
        serde_json::Number::from_f64(v)
            .map(Value::Number)
            .ok_or_else(|| E::custom("non-finite number"))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Value, E> {
        Ok(Value::String(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Value, E> {
        Ok(Value::String(v))
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Value, E> {
        Ok(Value::Bytes(v.to_vec()))
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Value, E> {
        Ok(Value::Bytes(v))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element::<Value>()? {
            items.push(item);
        }
        Ok(Value::Array(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Value, A::Error> {
        let mut map = BTreeMap::new();
        while let Some((key, value)) = access.next_entry::<String, Value>()? {
            map.insert(key, value);
        }
        if is_marker_shaped(&map) {
            return unwrap_marker(map).map_err(de::Error::custom);
        }
        Ok(Value::Object(map))
    }
}

fn unwrap_marker(mut map: BTreeMap<String, Value>) -> Result<Value, String> {
    let tag = match map.get(TYPE_KEY) {
        Some(Value::String(tag)) => tag.clone(),
        _ => return Ok(Value::Object(map)),
    };

    match tag.as_str() {
        BUFFER_TAG => match map.remove(DATA_KEY) {
            Some(Value::String(data)) => STANDARD
                .decode(data.as_bytes())
                .map(Value::Bytes)
                .map_err(|e| format!("malformed Buffer payload: {e}")),
            other => Err(format!(
                "Buffer payload must be a base64 string, found {other:?}"
            )),
        },
        OBJECT_TAG => match map.remove(DATA_KEY) {
            Some(Value::Array(entries)) => entries
                .into_iter()
                .map(entry_pair)
                .collect::<Result<BTreeMap<_, _>, _>>()
                .map(Value::Object),
            other => Err(format!(
                "escaped object payload must be an entry list, found {other:?}"
            )),
        },
        // Never produced by the encoder, so it is an ordinary object.
        _ => Ok(Value::Object(map)),
    }
}

fn entry_pair(entry: Value) -> Result<(String, Value), String> {
    let mut pair = match entry {
        Value::Array(pair) if pair.len() == 2 => pair.into_iter(),
        _ => return Err("escaped object entry must be a [key, value] pair".to_string()),
    };
    match (pair.next(), pair.next()) {
        (Some(Value::String(key)), Some(value)) => Ok((key, value)),
        _ => Err("escaped object entry key must be a string".to_string()),
    }
}

/// Serde helpers for binary fields of typed records.
///
/// Use with `#[serde(with = "crate::codec::buffer")]` on `Vec<u8>` fields.
pub mod buffer {
    use super::{BUFFER_TAG, DATA_KEY, STANDARD, TYPE_KEY};
    use base64::Engine as _;
    use serde::ser::SerializeMap;
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<T, S>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: AsRef<[u8]> + ?Sized,
        S: Serializer,
    {
        let mut out = serializer.serialize_map(Some(2))?;
        out.serialize_entry(TYPE_KEY, BUFFER_TAG)?;
        out.serialize_entry(DATA_KEY, &STANDARD.encode(bytes.as_ref()))?;
        out.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        #[derive(Deserialize)]
        struct Tagged {
            #[serde(rename = "type")]
            kind: String,
            data: String,
        }

        let tagged = Tagged::deserialize(deserializer)?;
        if tagged.kind != BUFFER_TAG {
            return Err(de::Error::custom(format!(
                "expected a {BUFFER_TAG} tag, found {}",
                tagged.kind
            )));
        }
        STANDARD
            .decode(tagged.data.as_bytes())
            .map_err(de::Error::custom)
    }

    /// Same encoding for `Option<Vec<u8>>` fields.
    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            bytes: &Option<Vec<u8>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match bytes {
                Some(bytes) => super::serialize(bytes, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Vec<u8>>, D::Error> {
            #[derive(Deserialize)]
            struct Wrapper(#[serde(with = "crate::codec::buffer")] Vec<u8>);

            Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|w| w.0))
        }
    }
}

/// Encodes a value tree into its portable JSON form.
pub fn encode(value: &Value) -> Result<serde_json::Value, CodecError> {
    Ok(serde_json::to_value(value)?)
}

/// Decodes a portable JSON form back into a value tree.
pub fn decode(portable: serde_json::Value) -> Result<Value, CodecError> {
    Ok(serde_json::from_value(portable)?)
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    v: u32,
    value: &'a Value,
}

#[derive(Deserialize)]
struct Envelope {
    v: u32,
    value: serde_json::Value,
}

/// Encodes a value as the versioned text document stored by the backends.
pub fn encode_document(value: &Value) -> Result<String, CodecError> {
    Ok(serde_json::to_string(&EnvelopeRef {
        v: CODEC_VERSION,
        value,
    })?)
}

pub fn decode_document(text: &str) -> Result<Value, CodecError> {
    let envelope: Envelope = serde_json::from_str(text)?;
    if envelope.v != CODEC_VERSION {
        return Err(CodecError::UnsupportedVersion(envelope.v));
    }
    decode(envelope.value)
}

/// Converts a typed record into a value tree.
pub fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<Value, CodecError> {
    decode(serde_json::to_value(value)?)
}

/// Converts a value tree into a typed record.
pub fn from_value<T: DeserializeOwned>(value: &Value) -> Result<T, CodecError> {
    Ok(serde_json::from_value(encode(value)?)?)
}
