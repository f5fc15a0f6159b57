//! Artifact serialization for the persistent tier.
//!
//! Every persisted artifact is wrapped in an envelope carrying a format
//! version, the full disk key it was written under, the payload encoding and
//! the write time. The envelope itself is always bincode; the payload uses the
//! configured [`ArtifactFormat`]. An envelope that fails to decode, or that
//! carries another version, key or encoding, is reported as
//! [`FormatError::Corrupt`] so the caller can delete it.
//!
//! The byte layout is internal and not a compatibility surface.

use bincode::config::standard as bincode_config;
use bincode::serde::{decode_from_slice, encode_to_vec};
use cellbox_core::Raw;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{DiskKey, FormatError};

/// Current envelope version.
pub const FORMAT_VERSION: u8 = 2;

/// Payload encoding for persisted artifacts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactFormat {
    /// Compact binary encoding. The default.
    #[default]
    Bincode,
    /// JSON encoding, useful when inspecting a store by hand.
    Json,
}

impl ArtifactFormat {
    fn tag(self) -> u8 {
        match self {
            ArtifactFormat::Bincode => 0,
            ArtifactFormat::Json => 1,
        }
    }

    /// Encodes an artifact stored under `key` into a persisted blob.
    pub fn encode<A>(&self, key: &DiskKey, artifact: &A) -> Result<Raw, FormatError>
    where
        A: Serialize,
    {
        let payload = match self {
            ArtifactFormat::Bincode => encode_to_vec(artifact, bincode_config())
                .map_err(|err| FormatError::Serialize(Box::new(err)))?,
            ArtifactFormat::Json => {
                serde_json::to_vec(artifact).map_err(|err| FormatError::Serialize(Box::new(err)))?
            }
        };

        let envelope = Envelope {
            version: FORMAT_VERSION,
            format: self.tag(),
            key: key.as_str().to_owned(),
            written_at_ms: Utc::now().timestamp_millis(),
            payload,
        };

        encode_to_vec(&envelope, bincode_config())
            .map(Raw::from)
            .map_err(|err| FormatError::Serialize(Box::new(err)))
    }

    /// Decodes a persisted blob, checking that it was written under `key`.
    pub fn decode<A>(&self, key: &DiskKey, bytes: &[u8]) -> Result<Decoded<A>, FormatError>
    where
        A: DeserializeOwned,
    {
        let (envelope, _): (Envelope, usize) = decode_from_slice(bytes, bincode_config())
            .map_err(|err| FormatError::Corrupt(err.to_string()))?;

        if envelope.version != FORMAT_VERSION {
            return Err(FormatError::Corrupt(format!(
                "unsupported envelope version {}",
                envelope.version
            )));
        }
        if envelope.format != self.tag() {
            return Err(FormatError::Corrupt(format!(
                "payload encoded as {}, expected {}",
                envelope.format,
                self.tag()
            )));
        }
        if envelope.key != key.as_str() {
            return Err(FormatError::Corrupt(format!(
                "entry written under {:?}, expected {:?}",
                envelope.key,
                key.as_str()
            )));
        }

        let artifact = match self {
            ArtifactFormat::Bincode => decode_from_slice(&envelope.payload, bincode_config())
                .map(|(artifact, _)| artifact)
                .map_err(|err| FormatError::Deserialize(Box::new(err)))?,
            ArtifactFormat::Json => serde_json::from_slice(&envelope.payload)
                .map_err(|err| FormatError::Deserialize(Box::new(err)))?,
        };

        Ok(Decoded {
            artifact,
            written_at: DateTime::<Utc>::from_timestamp_millis(envelope.written_at_ms),
        })
    }
}

/// A decoded persisted artifact.
#[derive(Debug, Clone)]
pub struct Decoded<A> {
    /// The artifact.
    pub artifact: A,
    /// When the blob was written, if the timestamp is representable.
    pub written_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    version: u8,
    format: u8,
    key: String,
    written_at_ms: i64,
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
}
