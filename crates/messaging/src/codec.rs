//! Wire formats for message bodies.
//!
//! The format is pinned once at startup (configuration) and every encode and
//! decode goes through it. A delivery that announces a different content type
//! is refused instead of being guessed at.

use core::str::FromStr;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::CodecError;

pub const BSON_CONTENT_TYPE: &str = "application/bson";
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Binary object format used for bodies on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// BSON documents (current producers).
    #[default]
    Bson,
    /// JSON documents (legacy producers).
    Json,
}

impl WireFormat {
    pub fn name(&self) -> &'static str {
        match self {
            WireFormat::Bson => "bson",
            WireFormat::Json => "json",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            WireFormat::Bson => BSON_CONTENT_TYPE,
            WireFormat::Json => JSON_CONTENT_TYPE,
        }
    }

    /// Encode a payload. BSON requires the payload to serialize as a map/struct.
    pub fn encode<T>(&self, payload: &T) -> Result<Vec<u8>, CodecError>
    where
        T: Serialize,
    {
        let encoded = match self {
            WireFormat::Bson => bson::to_vec(payload).map_err(|e| e.to_string()),
            WireFormat::Json => serde_json::to_vec(payload).map_err(|e| e.to_string()),
        };
        encoded.map_err(|message| CodecError::Encode {
            format: self.name(),
            message,
        })
    }

    pub fn decode<T>(&self, bytes: &[u8]) -> Result<T, CodecError>
    where
        T: DeserializeOwned,
    {
        let decoded = match self {
            WireFormat::Bson => bson::from_slice(bytes).map_err(|e| e.to_string()),
            WireFormat::Json => serde_json::from_slice(bytes).map_err(|e| e.to_string()),
        };
        decoded.map_err(|message| CodecError::Decode {
            format: self.name(),
            message,
        })
    }

    /// A missing content type is accepted; a different one is not.
    pub fn check_content_type(&self, content_type: Option<&str>) -> Result<(), CodecError> {
        match content_type {
            None => Ok(()),
            Some(found) if found.eq_ignore_ascii_case(self.content_type()) => Ok(()),
            Some(found) => Err(CodecError::ContentType {
                expected: self.content_type(),
                found: found.to_string(),
            }),
        }
    }

    /// Content-type check followed by decode.
    pub fn decode_checked<T>(&self, content_type: Option<&str>, bytes: &[u8]) -> Result<T, CodecError>
    where
        T: DeserializeOwned,
    {
        self.check_content_type(content_type)?;
        self.decode(bytes)
    }
}

impl core::fmt::Display for WireFormat {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for WireFormat {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bson" | BSON_CONTENT_TYPE => Ok(WireFormat::Bson),
            "json" | JSON_CONTENT_TYPE => Ok(WireFormat::Json),
            other => Err(CodecError::UnknownFormat(other.to_string())),
        }
    }
}
