//! Content hashing: canonicalization and content identifiers.
//!
//! An object is canonicalized (keys sorted at every depth, arrays untouched),
//! encoded as compact canonical JSON, digested, and the digest is wrapped in a
//! self-describing content identifier:
//!
//! ```text
//! <multibase prefix><base-encoded( varint(version) varint(codec) varint(digest code) varint(len) digest )>
//! ```
//!
//! With the defaults (v1, `dag-json`, BLAKE3, base32) an id looks like
//! `bagaaiera...`. Changing any field of [`Hasher`] changes every id, so a
//! workspace must agree on one configuration.
//!
//! # Sub-modules
//!
//! - [`canonical`]: canonical JSON writer.

pub mod canonical;

use data_encoding::{BASE32_NOPAD, HEXLOWER};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Digest as _;

use crate::error::Result;
use crate::model::Entity;

// ---------------------------------------------------------------------------
// Identifier parameters
// ---------------------------------------------------------------------------

/// Content codec recorded in the identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Codec {
    /// `dag-json` (0x0129).
    #[default]
    DagJson,
    /// `raw` (0x55), for opaque payloads.
    Raw,
}

impl Codec {
    const fn code(self) -> u64 {
        match self {
            Self::DagJson => 0x0129,
            Self::Raw => 0x55,
        }
    }
}

/// Digest algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DigestAlgorithm {
    /// BLAKE3, 32-byte output (multihash 0x1e).
    #[default]
    Blake3,
    /// SHA2-256 (multihash 0x12).
    #[serde(rename = "sha2-256")]
    Sha2_256,
}

impl DigestAlgorithm {
    const fn code(self) -> u64 {
        match self {
            Self::Blake3 => 0x1e,
            Self::Sha2_256 => 0x12,
        }
    }

    fn digest(self, bytes: &[u8]) -> Vec<u8> {
        match self {
            Self::Blake3 => blake3::hash(bytes).as_bytes().to_vec(),
            Self::Sha2_256 => sha2::Sha256::digest(bytes).to_vec(),
        }
    }
}

/// Text encoding of the identifier bytes, with its multibase prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Base {
    /// RFC 4648 base32, lowercase, no padding (prefix `b`).
    #[default]
    Base32,
    /// Lowercase hex (prefix `f`).
    Base16,
}

impl Base {
    fn encode(self, bytes: &[u8]) -> String {
        match self {
            Self::Base32 => format!("b{}", BASE32_NOPAD.encode(bytes).to_ascii_lowercase()),
            Self::Base16 => format!("f{}", HEXLOWER.encode(bytes)),
        }
    }
}

// ---------------------------------------------------------------------------
// Hasher
// ---------------------------------------------------------------------------

/// Derives content identifiers from objects.
///
/// Pure and cheap to copy; every layer that verifies or computes ids holds its
/// own copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hasher {
    /// Identifier version. Only `1` is produced.
    #[serde(default = "default_version")]
    pub version: u64,
    #[serde(default)]
    pub codec: Codec,
    #[serde(default)]
    pub digest: DigestAlgorithm,
    #[serde(default)]
    pub base: Base,
}

const fn default_version() -> u64 {
    1
}

impl Default for Hasher {
    fn default() -> Self {
        Self {
            version: default_version(),
            codec: Codec::default(),
            digest: DigestAlgorithm::default(),
            base: Base::default(),
        }
    }
}

impl Hasher {
    /// Identifier for raw bytes.
    #[must_use]
    pub fn hash_bytes(&self, bytes: &[u8]) -> String {
        let digest = self.digest.digest(bytes);

        let mut cid = Vec::with_capacity(digest.len() + 8);
        write_varint(self.version, &mut cid);
        write_varint(self.codec.code(), &mut cid);
        write_varint(self.digest.code(), &mut cid);
        write_varint(digest.len() as u64, &mut cid);
        cid.extend_from_slice(&digest);

        self.base.encode(&cid)
    }

    /// Identifier for a JSON value, after canonicalization.
    #[must_use]
    pub fn hash_value(&self, value: &Value) -> String {
        self.hash_bytes(canonical::canonicalize_json(value).as_bytes())
    }

    /// Serialize `object` and wrap it as an [`Entity`] with its identifier.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if `object` cannot be represented as JSON.
    pub fn entity<T: Serialize>(&self, object: &T) -> Result<Entity> {
        let value = serde_json::to_value(object)?;
        Ok(Entity {
            id: self.hash_value(&value),
            object: value,
        })
    }

    /// Like [`Hasher::entity`] but keeps the typed object alongside the id.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if `object` cannot be represented as JSON.
    pub fn typed_entity<T: Serialize + Clone>(&self, object: &T) -> Result<Entity<T>> {
        let value = serde_json::to_value(object)?;
        Ok(Entity {
            id: self.hash_value(&value),
            object: object.clone(),
        })
    }
}

/// Unsigned LEB128, as used by multiformats.
fn write_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        // Low seven bits; the cast cannot truncate after masking.
        #[allow(clippy::cast_possible_truncation)]
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}
