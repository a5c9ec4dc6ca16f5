pub mod deflate;
pub mod stored;

use serde::{Deserialize, Serialize};

use crate::error::{NpzError, NpzResult};

pub use deflate::DeflateCodec;
pub use stored::StoredCodec;

// ---------------------------------------------------------------------------
// CodecId
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecId {
    Stored,
    Deflate,
}

impl CodecId {
    /// Archive compression-method number.
    pub fn method(&self) -> u16 {
        match self {
            CodecId::Stored => 0,
            CodecId::Deflate => 8,
        }
    }

    pub fn from_method(method: u16) -> Option<Self> {
        match method {
            0 => Some(CodecId::Stored),
            8 => Some(CodecId::Deflate),
            _ => None,
        }
    }
}

impl std::fmt::Display for CodecId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecId::Stored => write!(f, "stored"),
            CodecId::Deflate => write!(f, "deflate"),
        }
    }
}

// ---------------------------------------------------------------------------
// AnyCodec  (enum dispatch, no Box<dyn>)
// ---------------------------------------------------------------------------

/// Per-member compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "CodecEnvelope", into = "CodecEnvelope")]
pub enum AnyCodec {
    Stored(StoredCodec),
    Deflate(DeflateCodec),
}

impl Default for AnyCodec {
    fn default() -> Self {
        AnyCodec::Stored(StoredCodec)
    }
}

impl AnyCodec {
    pub fn stored() -> Self {
        AnyCodec::Stored(StoredCodec)
    }

    pub fn deflate() -> Self {
        AnyCodec::Deflate(DeflateCodec::default())
    }

    pub fn codec_id(&self) -> CodecId {
        match self {
            AnyCodec::Stored(_) => CodecId::Stored,
            AnyCodec::Deflate(_) => CodecId::Deflate,
        }
    }

    pub fn method(&self) -> u16 {
        self.codec_id().method()
    }

    /// Codec able to read members written with `method`.
    pub fn for_method(method: u16) -> Option<Self> {
        CodecId::from_method(method).map(|id| match id {
            CodecId::Stored => AnyCodec::stored(),
            CodecId::Deflate => AnyCodec::deflate(),
        })
    }

    pub fn encode(&self, data: &[u8]) -> NpzResult<Vec<u8>> {
        match self {
            AnyCodec::Stored(c) => c.encode(data),
            AnyCodec::Deflate(c) => c.encode(data),
        }
    }

    /// Decode member bytes, producing at most `limit + 1` bytes so the caller
    /// can detect a stream that is longer than declared.
    pub fn decode(&self, data: &[u8], limit: u64) -> NpzResult<Vec<u8>> {
        match self {
            AnyCodec::Stored(c) => c.decode(data),
            AnyCodec::Deflate(c) => Ok(c.decode(data, limit)?),
        }
    }
}

// ---------------------------------------------------------------------------
// JSON-based codec parsing
// ---------------------------------------------------------------------------

/// `{ "name": ..., "configuration": ... }`
#[derive(Debug, Deserialize, Serialize)]
struct CodecEnvelope {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    configuration: Option<serde_json::Value>,
}

pub fn lookup_codec_id(name: &str) -> Option<CodecId> {
    match name {
        "stored" => Some(CodecId::Stored),
        "deflate" => Some(CodecId::Deflate),
        _ => None,
    }
}

fn from_envelope(env: CodecEnvelope) -> NpzResult<AnyCodec> {
    let config = env
        .configuration
        .unwrap_or(serde_json::Value::Object(Default::default()));
    match lookup_codec_id(&env.name) {
        Some(CodecId::Stored) => Ok(AnyCodec::Stored(StoredCodec)),
        Some(CodecId::Deflate) => {
            let c: DeflateCodec = serde_json::from_value(config)?;
            if c.level > 9 {
                return Err(NpzError::Codec(format!(
                    "deflate level {} is outside 0..=9",
                    c.level
                )));
            }
            Ok(AnyCodec::Deflate(c))
        }
        None => Err(NpzError::Codec(format!("Unknown codec: {}", env.name))),
    }
}

impl TryFrom<CodecEnvelope> for AnyCodec {
    type Error = NpzError;

    fn try_from(env: CodecEnvelope) -> NpzResult<Self> {
        from_envelope(env)
    }
}

impl From<AnyCodec> for CodecEnvelope {
    fn from(codec: AnyCodec) -> Self {
        let configuration = match codec {
            AnyCodec::Stored(_) => None,
            AnyCodec::Deflate(c) => Some(serde_json::json!({ "level": c.level })),
        };
        CodecEnvelope {
            name: codec.codec_id().to_string(),
            configuration,
        }
    }
}

/// Parse a single codec from a JSON value.
pub fn parse_codec(value: &serde_json::Value) -> NpzResult<AnyCodec> {
    let env: CodecEnvelope = serde_json::from_value(value.clone())?;
    from_envelope(env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_codec() {
        let c = parse_codec(&json!({"name": "deflate", "configuration": {"level": 9}})).unwrap();
        assert_eq!(c, AnyCodec::Deflate(DeflateCodec { level: 9 }));
        assert_eq!(c.method(), 8);

        let c = parse_codec(&json!({"name": "deflate"})).unwrap();
        assert_eq!(c, AnyCodec::deflate());

        assert_eq!(parse_codec(&json!({"name": "stored"})).unwrap().method(), 0);
        assert!(parse_codec(&json!({"name": "bzip2"})).is_err());
        for alias in ["none", "zlib", "gzip"] {
            assert!(matches!(
                parse_codec(&json!({ "name": alias })),
                Err(NpzError::Codec(_))
            ));
        }
        assert!(parse_codec(&json!({"name": "deflate", "configuration": {"level": 12}})).is_err());
    }

    #[test]
    fn test_codec_serializes_as_envelope() {
        let v = serde_json::to_value(AnyCodec::deflate()).unwrap();
        assert_eq!(v, json!({"name": "deflate", "configuration": {"level": 6}}));
        let v = serde_json::to_value(AnyCodec::stored()).unwrap();
        assert_eq!(v, json!({"name": "stored"}));
    }

    #[test]
    fn test_method_lookup() {
        assert_eq!(AnyCodec::for_method(8), Some(AnyCodec::deflate()));
        assert_eq!(AnyCodec::for_method(12), None);
    }
}
