//! Serializer and deserializer hooks.
//!
//! A hook names a [`Codec`] that moves values between a language's native
//! format and a named interchange format. A producer's `serializer` encodes
//! its result; a consumer's `deserializer` decodes each upstream. Encoded
//! artifacts carry the interchange tag, so a consumer decoding with the wrong
//! hook is detected as a [`ConversionError::FormatMismatch`] instead of
//! silently misreading bytes.

use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;

use crate::artifact::{Artifact, Format};
use crate::convert::{ConversionError, from_value, shell_text, to_value, utf8};
use crate::language::Language;

/// Encoder/decoder pair behind a hook identifier.
pub trait Codec: Send + Sync {
    /// Interchange format written by [`Codec::encode`].
    fn format(&self) -> Format;

    /// Encode a native artifact into the interchange format.
    ///
    /// # Errors
    ///
    /// Returns [`ConversionError`] when the artifact cannot be encoded.
    fn encode(&self, native: &Artifact) -> Result<Artifact, ConversionError>;

    /// Decode an interchange artifact into the native format of `into`.
    ///
    /// Callers check the format tag first; see [`CodecRegistry::decode`].
    ///
    /// # Errors
    ///
    /// Returns [`ConversionError`] when the bytes cannot be decoded.
    fn decode(&self, encoded: &Artifact, into: Language) -> Result<Artifact, ConversionError>;
}

/// Canonical JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn format(&self) -> Format {
        Format::json()
    }

    fn encode(&self, native: &Artifact) -> Result<Artifact, ConversionError> {
        let format = self.format();
        Artifact::from_json(format.clone(), &to_value(native)?)
            .map_err(|err| ConversionError::malformed(&format, err))
    }

    fn decode(&self, encoded: &Artifact, into: Language) -> Result<Artifact, ConversionError> {
        from_value(&to_value(encoded)?, into)
    }
}

/// Plain UTF-8 text. Strings are written verbatim, other values as JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextCodec;

impl Codec for TextCodec {
    fn format(&self) -> Format {
        Format::Interchange("text".to_owned())
    }

    fn encode(&self, native: &Artifact) -> Result<Artifact, ConversionError> {
        let text = if *native.format() == Format::Native(Language::Shell) {
            utf8(native)?.to_owned()
        } else {
            shell_text(&to_value(native)?)
        };
        Ok(Artifact::new(self.format(), text.into_bytes()))
    }

    fn decode(&self, encoded: &Artifact, into: Language) -> Result<Artifact, ConversionError> {
        let text = utf8(encoded)?;
        from_value(&Value::String(text.to_owned()), into)
    }
}

/// Newline-separated records; arrays map to one element per line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinesCodec;

impl Codec for LinesCodec {
    fn format(&self) -> Format {
        Format::Interchange("lines".to_owned())
    }

    fn encode(&self, native: &Artifact) -> Result<Artifact, ConversionError> {
        let mut text = if *native.format() == Format::Native(Language::Shell) {
            utf8(native)?.trim_end_matches('\n').to_owned()
        } else {
            match to_value(native)? {
                Value::Array(items) => items
                    .iter()
                    .map(shell_text)
                    .collect::<Vec<_>>()
                    .join("\n"),
                other => shell_text(&other),
            }
        };
        if !text.is_empty() {
            text.push('\n');
        }
        Ok(Artifact::new(self.format(), text.into_bytes()))
    }

    fn decode(&self, encoded: &Artifact, into: Language) -> Result<Artifact, ConversionError> {
        if into == Language::Shell {
            return Ok(Artifact::new(Format::Native(into), encoded.bytes().to_vec()));
        }
        from_value(&to_value(encoded)?, into)
    }
}

/// Hooks available to derivations, keyed by identifier.
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: IndexMap<String, Arc<dyn Codec>>,
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.codecs.keys()).finish()
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl CodecRegistry {
    /// A registry with no hooks.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            codecs: IndexMap::new(),
        }
    }

    /// The built-in `json`, `text`, and `lines` hooks.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("json", Arc::new(JsonCodec));
        registry.register("text", Arc::new(TextCodec));
        registry.register("lines", Arc::new(LinesCodec));
        registry
    }

    /// Register (or replace) a hook.
    pub fn register(&mut self, id: impl Into<String>, codec: Arc<dyn Codec>) {
        self.codecs.insert(id.into(), codec);
    }

    /// Registered hook identifiers, in registration order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.codecs.keys().map(String::as_str)
    }

    /// Look up a hook.
    ///
    /// # Errors
    ///
    /// Returns [`ConversionError::UnknownHook`] for unregistered identifiers.
    pub fn get(&self, hook: &str) -> Result<&dyn Codec, ConversionError> {
        self.codecs
            .get(hook)
            .map(|codec| &**codec)
            .ok_or_else(|| ConversionError::UnknownHook {
                hook: hook.to_owned(),
            })
    }

    /// Serialize a native artifact with `hook`.
    ///
    /// # Errors
    ///
    /// Returns [`ConversionError`] when the hook is unknown or encoding fails.
    pub fn encode(&self, hook: &str, native: &Artifact) -> Result<Artifact, ConversionError> {
        self.get(hook)?.encode(native)
    }

    /// Deserialize an upstream artifact with `hook` into `into`'s native
    /// format, verifying the interchange tag first.
    ///
    /// # Errors
    ///
    /// Returns [`ConversionError::FormatMismatch`] when the artifact was not
    /// written by a codec producing the hook's format.
    pub fn decode(
        &self,
        hook: &str,
        encoded: &Artifact,
        into: Language,
    ) -> Result<Artifact, ConversionError> {
        let codec = self.get(hook)?;
        let expected = codec.format();
        if *encoded.format() != expected {
            return Err(ConversionError::FormatMismatch {
                hook: hook.to_owned(),
                produced: encoded.format().clone(),
                expected,
            });
        }
        codec.decode(encoded, into)
    }
}
