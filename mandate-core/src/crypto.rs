//! Cryptographic primitives for Mandate.
//!
//! Ed25519 throughout. Every signature is computed over
//! `SIGNATURE_CONTEXT || payload`, and every payload is itself a canonical
//! envelope tagged with its own domain (see [`crate::payload`]), so a
//! signature made for one structure never verifies as another.

use crate::error::{Error, Result};
use crate::SIGNATURE_CONTEXT;
use ed25519_dalek::{
    Signature as DalekSignature, Signer, SigningKey as Ed25519SigningKey, VerifyingKey,
};
use rand::rngs::OsRng;
use secrecy::{CloneableSecret, ExposeSecret, Secret, Zeroize};
use serde::{Deserialize, Serialize};

/// A signing key held by the key rotation manager or by a participant.
///
/// Wrapped in `Secret` so it is zeroized on drop and redacted in `Debug`.
#[derive(Clone)]
pub struct SigningKey {
    signing_key: Secret<Ed25519SigningKeyWrapper>,
}

// ed25519-dalek 2.x zeroizes on drop; Zeroize here only satisfies secrecy.
struct Ed25519SigningKeyWrapper(Ed25519SigningKey);

impl Clone for Ed25519SigningKeyWrapper {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl Zeroize for Ed25519SigningKeyWrapper {
    fn zeroize(&mut self) {}
}

impl CloneableSecret for Ed25519SigningKeyWrapper {}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("public_key", &self.public_key().fingerprint())
            .field("signing_key", &"***SECRET***")
            .finish()
    }
}

impl SigningKey {
    /// Generate a new random signing key.
    pub fn generate() -> Self {
        let signing_key = Ed25519SigningKey::generate(&mut OsRng);
        Self {
            signing_key: Secret::new(Ed25519SigningKeyWrapper(signing_key)),
        }
    }

    /// Create a signing key from secret key bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = Ed25519SigningKey::from_bytes(bytes);
        Self {
            signing_key: Secret::new(Ed25519SigningKeyWrapper(signing_key)),
        }
    }

    /// Get the public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            verifying_key: self.signing_key.expose_secret().0.verifying_key(),
        }
    }

    /// Sign a message with context prefix.
    pub fn sign(&self, message: &[u8]) -> Signature {
        let prefixed = prefix_message(message);
        let sig = self.signing_key.expose_secret().0.sign(&prefixed);
        Signature { inner: sig }
    }

    /// Get the secret key bytes.
    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.expose_secret().0.to_bytes()
    }
}

fn prefix_message(message: &[u8]) -> Vec<u8> {
    let mut prefixed = Vec::with_capacity(SIGNATURE_CONTEXT.len() + message.len());
    prefixed.extend_from_slice(SIGNATURE_CONTEXT);
    prefixed.extend_from_slice(message);
    prefixed
}

/// A public key for verifying signatures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    verifying_key: VerifyingKey,
}

impl PublicKey {
    /// Create a public key from bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self> {
        let verifying_key =
            VerifyingKey::from_bytes(bytes).map_err(|e| Error::CryptoError(e.to_string()))?;
        if verifying_key.is_weak() {
            return Err(Error::CryptoError("weak public key (small-order point)".into()));
        }
        Ok(Self { verifying_key })
    }

    /// Get the public key as bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// Short fingerprint (first 16 hex chars) for logs and audit records.
    pub fn fingerprint(&self) -> String {
        let bytes = self.to_bytes();
        hex::encode(&bytes[..8])
    }

    /// Verify a signature against a message.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        let prefixed = prefix_message(message);
        self.verifying_key
            .verify_strict(&prefixed, &signature.inner)
            .map_err(|e| Error::SignatureInvalid(e.to_string()))
    }
}

impl std::hash::Hash for PublicKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.to_bytes().hash(state);
    }
}

const ED25519_ALG_ID: u8 = 1;

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serialize_key_material(&self.to_bytes(), serializer)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes = deserialize_key_material(deserializer, "public key")?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("invalid public key length"))?;
        PublicKey::from_bytes(&arr).map_err(serde::de::Error::custom)
    }
}

/// An Ed25519 signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    inner: DalekSignature,
}

impl Signature {
    /// Create a signature from bytes.
    pub fn from_bytes(bytes: &[u8; 64]) -> Self {
        Self {
            inner: DalekSignature::from_bytes(bytes),
        }
    }

    /// Get the signature as bytes.
    pub fn to_bytes(&self) -> [u8; 64] {
        self.inner.to_bytes()
    }
}

impl Serialize for Signature {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serialize_key_material(&self.to_bytes(), serializer)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes = deserialize_key_material(deserializer, "signature")?;
        let arr: [u8; 64] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("invalid signature length"))?;
        Ok(Signature::from_bytes(&arr))
    }
}

// Human-readable formats get base64url; binary formats get `[alg, bytes]`.
fn serialize_key_material<S>(bytes: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    if serializer.is_human_readable() {
        serializer.serialize_str(&base64::Engine::encode(
            &base64::engine::general_purpose::URL_SAFE_NO_PAD,
            bytes,
        ))
    } else {
        use serde::ser::SerializeTuple;
        let mut tup = serializer.serialize_tuple(2)?;
        tup.serialize_element(&ED25519_ALG_ID)?;
        tup.serialize_element(&serde_bytes::Bytes::new(bytes))?;
        tup.end()
    }
}

fn deserialize_key_material<'de, D>(
    deserializer: D,
    what: &'static str,
) -> std::result::Result<Vec<u8>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    if deserializer.is_human_readable() {
        let s = String::deserialize(deserializer)?;
        base64::Engine::decode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, &s)
            .map_err(serde::de::Error::custom)
    } else {
        struct MaterialVisitor(&'static str);

        impl<'de> serde::de::Visitor<'de> for MaterialVisitor {
            type Value = Vec<u8>;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(formatter, "a {} array [algo, bytes]", self.0)
            }

            fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: serde::de::SeqAccess<'de>,
            {
                let alg: u8 = seq
                    .next_element()?
                    .ok_or_else(|| serde::de::Error::invalid_length(0, &self))?;

                if alg != ED25519_ALG_ID {
                    return Err(serde::de::Error::custom(format!(
                        "unsupported algorithm id: {}",
                        alg
                    )));
                }

                let bytes: serde_bytes::ByteBuf = seq
                    .next_element()?
                    .ok_or_else(|| serde::de::Error::invalid_length(1, &self))?;
                Ok(bytes.into_vec())
            }
        }

        deserializer.deserialize_tuple(2, MaterialVisitor(what))
    }
}
