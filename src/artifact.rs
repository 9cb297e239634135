//! Artifacts, their format tags, and the fingerprints that key them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::language::Language;

/// Hex-encoded SHA-256 content hash identifying a node's output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wrap an already computed hex digest.
    ///
    /// Returns `None` unless `hex` is 64 lowercase hexadecimal characters.
    #[must_use]
    pub fn from_hex(hex: &str) -> Option<Self> {
        let valid = hex.len() == 64
            && hex
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| Self(hex.to_owned()))
    }

    /// The full hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First twelve characters, for display.
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }

    pub(crate) const fn new_unchecked(hex: String) -> Self {
        Self(hex)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Encoding of an artifact's bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Format {
    /// The default persisted form of a language runtime.
    Native(Language),
    /// A named interchange format written by a serializer hook.
    Interchange(String),
}

impl Format {
    /// Interchange JSON.
    #[must_use]
    pub fn json() -> Self {
        Self::Interchange("json".to_owned())
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native(lang) => write!(f, "native:{lang}"),
            Self::Interchange(name) => write!(f, "interchange:{name}"),
        }
    }
}

/// Error returned when a format tag cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid format tag '{0}'")]
pub struct InvalidFormat(pub String);

impl FromStr for Format {
    type Err = InvalidFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidFormat(s.to_owned());
        match s.split_once(':') {
            Some(("native", lang)) => lang.parse().map(Self::Native).map_err(|_| invalid()),
            Some(("interchange", name)) if !name.is_empty() => {
                Ok(Self::Interchange(name.to_owned()))
            }
            _ => Err(invalid()),
        }
    }
}

impl Serialize for Format {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Format {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Materialised output of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    format: Format,
    bytes: Vec<u8>,
}

impl Artifact {
    /// Create an artifact from raw bytes.
    #[must_use]
    pub const fn new(format: Format, bytes: Vec<u8>) -> Self {
        Self { format, bytes }
    }

    /// Encode `value` as canonical JSON tagged with `format`.
    ///
    /// # Errors
    ///
    /// Returns an error when the value cannot be canonicalised.
    pub fn from_json(format: Format, value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        let text = serde_json_canonicalizer::to_string(value)?;
        Ok(Self::new(format, text.into_bytes()))
    }

    /// Format tag.
    #[must_use]
    pub const fn format(&self) -> &Format {
        &self.format
    }

    /// Raw bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consume into raw bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Decode the bytes as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error when the bytes are not valid JSON.
    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.bytes)
    }

    /// Re-tag the same bytes with a different format.
    #[must_use]
    pub fn retagged(self, format: Format) -> Self {
        Self { format, ..self }
    }
}

/// Reference to a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Content key.
    pub fingerprint: Fingerprint,
    /// Encoding of the stored bytes.
    pub format: Format,
    /// Size in bytes.
    pub size: u64,
    /// Store-specific location (a path for durable stores).
    pub location: String,
}
