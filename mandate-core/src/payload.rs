//! Canonical signing payloads.
//!
//! Every signed or hashed structure (delegations, revocation records,
//! witness attestations, rotation certificates, proofs of possession) is
//! encoded the same way:
//!
//! ```text
//! CBOR array [ domain, PAYLOAD_VERSION, { 0: field0, 1: field1, ... } ]
//! ```
//!
//! The field map uses small integer keys in strictly ascending order, absent
//! optional fields are omitted, and nested collections are ordered
//! (`BTreeMap`/`BTreeSet`/`Vec`). Two logically identical structures
//! therefore always produce identical bytes, and the domain tag keeps
//! signatures from crossing structure types.
//!
//! Decoding is fail closed: an envelope with the wrong domain, an unknown
//! version, out-of-order or duplicate keys, or fields nobody consumed is
//! rejected.

use crate::error::{Error, Result};
use ciborium::Value;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Version of the canonical envelope. Bumping it invalidates every existing
/// signature, so it only changes with a migration path.
pub const PAYLOAD_VERSION: u8 = 1;

/// Domain tags, one per signable structure.
pub const DELEGATION_DOMAIN: &str = "mandate.delegation";
pub const REVOCATION_DOMAIN: &str = "mandate.revocation";
pub const ATTESTATION_DOMAIN: &str = "mandate.attestation";
pub const ROTATION_DOMAIN: &str = "mandate.rotation";
pub const PROOF_DOMAIN: &str = "mandate.proof";

/// SHA-256 digest of a canonical payload.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Hash arbitrary bytes.
    pub fn of(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Self(out)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| Error::DeserializationError(e.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::DeserializationError("content hash must be 32 bytes".into()))?;
        Ok(Self(arr))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..16])
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            ContentHash::from_hex(&s).map_err(serde::de::Error::custom)
        } else {
            let bytes = serde_bytes::ByteBuf::deserialize(deserializer)?;
            let arr: [u8; 32] = bytes
                .into_vec()
                .try_into()
                .map_err(|_| serde::de::Error::custom("content hash must be 32 bytes"))?;
            Ok(ContentHash(arr))
        }
    }
}

/// Ordered integer-keyed field map, the body of a canonical envelope.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CanonicalMap {
    fields: BTreeMap<u8, Value>,
}

impl CanonicalMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field. Keys may be added in any order; encoding sorts them.
    pub fn field<T: Serialize + ?Sized>(mut self, key: u8, value: &T) -> Result<Self> {
        let value = Value::serialized(value)?;
        if self.fields.insert(key, value).is_some() {
            return Err(Error::InvalidPayload(format!("duplicate field key {}", key)));
        }
        Ok(self)
    }

    /// Add a field only when present.
    pub fn optional<T: Serialize>(self, key: u8, value: Option<&T>) -> Result<Self> {
        match value {
            Some(v) => self.field(key, v),
            None => Ok(self),
        }
    }

    /// Encode as a canonical envelope for `domain`.
    pub fn encode(&self, domain: &str) -> Result<Vec<u8>> {
        let map = Value::Map(
            self.fields
                .iter()
                .map(|(k, v)| (Value::Integer((*k).into()), v.clone()))
                .collect(),
        );
        let envelope = Value::Array(vec![
            Value::Text(domain.to_string()),
            Value::Integer(PAYLOAD_VERSION.into()),
            map,
        ]);
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&envelope, &mut bytes)?;
        Ok(bytes)
    }

    /// Decode a canonical envelope, rejecting anything but `domain`.
    pub fn decode(bytes: &[u8], domain: &str) -> Result<Self> {
        let envelope: Value = ciborium::de::from_reader(bytes)?;
        let mut parts = match envelope {
            Value::Array(parts) if parts.len() == 3 => parts.into_iter(),
            _ => return Err(Error::InvalidPayload("expected [domain, version, map]".into())),
        };

        match parts.next() {
            Some(Value::Text(d)) if d == domain => {}
            Some(Value::Text(d)) => {
                return Err(Error::InvalidPayload(format!(
                    "domain mismatch: expected {}, got {}",
                    domain, d
                )))
            }
            _ => return Err(Error::InvalidPayload("missing domain tag".into())),
        }

        let version = match parts.next() {
            Some(Value::Integer(v)) => u8::try_from(v)
                .map_err(|_| Error::InvalidPayload("version out of range".into()))?,
            _ => return Err(Error::InvalidPayload("missing version".into())),
        };
        if version != PAYLOAD_VERSION {
            return Err(Error::InvalidPayload(format!(
                "unsupported payload version {}",
                version
            )));
        }

        let entries = match parts.next() {
            Some(Value::Map(entries)) => entries,
            _ => return Err(Error::InvalidPayload("missing field map".into())),
        };

        let mut fields = BTreeMap::new();
        let mut last: Option<u8> = None;
        for (k, v) in entries {
            let key = match k {
                Value::Integer(i) => u8::try_from(i)
                    .map_err(|_| Error::InvalidPayload("field key out of range".into()))?,
                _ => return Err(Error::InvalidPayload("non-integer field key".into())),
            };
            if last.is_some_and(|prev| key <= prev) {
                return Err(Error::InvalidPayload(format!(
                    "field key {} out of order or duplicated",
                    key
                )));
            }
            last = Some(key);
            fields.insert(key, v);
        }

        Ok(Self { fields })
    }

    /// Remove and decode a required field.
    pub fn take<T: DeserializeOwned>(&mut self, key: u8) -> Result<T> {
        self.take_optional(key)?
            .ok_or_else(|| Error::InvalidPayload(format!("missing required field {}", key)))
    }

    /// Remove and decode an optional field.
    pub fn take_optional<T: DeserializeOwned>(&mut self, key: u8) -> Result<Option<T>> {
        match self.fields.remove(&key) {
            Some(value) => Ok(Some(value.deserialized()?)),
            None => Ok(None),
        }
    }

    /// Fail if any field was left unconsumed.
    pub fn finish(self) -> Result<()> {
        match self.fields.keys().next() {
            Some(key) => Err(Error::InvalidPayload(format!("unknown field key {}", key))),
            None => Ok(()),
        }
    }
}

/// A structure with a canonical, signable encoding.
pub trait Signable {
    /// Domain tag of the envelope.
    const DOMAIN: &'static str;

    /// The structure's fields, excluding any signature over them.
    fn canonical_fields(&self) -> Result<CanonicalMap>;

    /// Bytes to sign or verify.
    fn signing_bytes(&self) -> Result<Vec<u8>> {
        self.canonical_fields()?.encode(Self::DOMAIN)
    }

    /// Content hash of the signing bytes.
    fn content_hash(&self) -> Result<ContentHash> {
        Ok(ContentHash::of(&self.signing_bytes()?))
    }
}
