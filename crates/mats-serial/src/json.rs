//! JSON envelope serializer with threshold-gated compression.

use std::borrow::Cow;

use mats_trace::MatsTrace;

use crate::{MatsSerializer, SerialResult, SerializationError, SerializedTrace};

/// Meta prefix for the JSON body format.
const FORMAT_JSON: &str = "json";

/// Default size above which bodies are compressed.
///
/// Below this, compression overhead tends to exceed the win for the small
/// envelopes typical of short flows.
const DEFAULT_COMPRESSION_THRESHOLD: usize = 900;

/// Zstandard level used when that codec is selected.
const ZSTD_LEVEL: i32 = 3;

/// Body compression, named in the serializer meta.
///
/// The meta token, not the local policy, decides how a body is decoded: a
/// peer configured plain-only still decodes an LZ4 envelope whose meta says
/// so.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionKind {
    /// No compression.
    Plain,
    /// LZ4, the default above the threshold.
    Lz4,
    /// Zstandard, for deployments trading speed for ratio.
    Zstd,
}

impl CompressionKind {
    fn token(self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token {
            "plain" => Some(Self::Plain),
            "lz4" => Some(Self::Lz4),
            "zstd" => Some(Self::Zstd),
            _ => None,
        }
    }
}

/// The standard envelope serializer: JSON body, compressed above a size
/// threshold, meta string `"<format>:<codec>"` (e.g. `"json:lz4"`).
pub struct MatsSerializerJson {
    compression: CompressionKind,
    threshold: usize,
}

impl MatsSerializerJson {
    /// Creates a serializer with the default policy (LZ4 above 900 bytes).
    pub fn new() -> Self {
        Self {
            compression: CompressionKind::Lz4,
            threshold: DEFAULT_COMPRESSION_THRESHOLD,
        }
    }

    /// Creates a serializer with an explicit codec and threshold.
    pub fn with_compression(compression: CompressionKind, threshold: usize) -> Self {
        Self {
            compression,
            threshold,
        }
    }

    fn parse_meta(meta: &str) -> SerialResult<CompressionKind> {
        let (format, codec) = meta
            .split_once(':')
            .ok_or_else(|| SerializationError::UnknownMeta(meta.to_string()))?;
        if format != FORMAT_JSON {
            return Err(SerializationError::UnknownMeta(meta.to_string()));
        }
        CompressionKind::from_token(codec)
            .ok_or_else(|| SerializationError::UnknownMeta(meta.to_string()))
    }
}

impl Default for MatsSerializerJson {
    fn default() -> Self {
        Self::new()
    }
}

impl MatsSerializer for MatsSerializerJson {
    fn serialize_trace(&self, trace: &MatsTrace) -> SerialResult<SerializedTrace> {
        let plain = serde_json::to_vec(trace).map_err(SerializationError::Encode)?;
        let size_plain = plain.len();

        let kind = if size_plain >= self.threshold {
            self.compression
        } else {
            CompressionKind::Plain
        };
        let bytes = match kind {
            CompressionKind::Plain => plain,
            CompressionKind::Lz4 => lz4_flex::compress_prepend_size(&plain),
            CompressionKind::Zstd => zstd::encode_all(plain.as_slice(), ZSTD_LEVEL).map_err(
                |e| SerializationError::CompressionFailed {
                    codec: "zstd",
                    reason: e.to_string(),
                },
            )?,
        };

        Ok(SerializedTrace {
            size_wire: bytes.len(),
            bytes,
            meta: format!("{FORMAT_JSON}:{}", kind.token()),
            size_plain,
        })
    }

    fn deserialize_trace(&self, bytes: &[u8], meta: &str) -> SerialResult<MatsTrace> {
        let plain: Cow<'_, [u8]> = match Self::parse_meta(meta)? {
            CompressionKind::Plain => Cow::Borrowed(bytes),
            CompressionKind::Lz4 => Cow::Owned(
                lz4_flex::decompress_size_prepended(bytes).map_err(|e| {
                    SerializationError::DecompressionFailed {
                        codec: "lz4",
                        reason: e.to_string(),
                    }
                })?,
            ),
            CompressionKind::Zstd => Cow::Owned(zstd::decode_all(bytes).map_err(|e| {
                SerializationError::DecompressionFailed {
                    codec: "zstd",
                    reason: e.to_string(),
                }
            })?),
        };
        serde_json::from_slice(&plain).map_err(SerializationError::Decode)
    }
}
