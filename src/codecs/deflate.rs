use std::io::{self, Read};

use flate2::Compression;
use flate2::read::{DeflateDecoder, DeflateEncoder};
use serde::{Deserialize, Serialize};

use crate::error::NpzResult;

/// Raw deflate (archive method 8), no zlib or gzip framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeflateCodec {
    #[serde(default = "default_level")]
    pub level: u32,
}

fn default_level() -> u32 {
    6
}

impl Default for DeflateCodec {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

impl DeflateCodec {
    pub fn new(level: u32) -> Self {
        Self { level: level.min(9) }
    }

    /// Inflate at most `limit` bytes. One extra byte is read so that a stream
    /// longer than `limit` is reported rather than silently cut.
    pub fn decode(&self, data: &[u8], limit: u64) -> io::Result<Vec<u8>> {
        let mut decoder = DeflateDecoder::new(data).take(limit.saturating_add(1));
        let mut out = Vec::with_capacity(limit.min(1 << 24) as usize);
        decoder.read_to_end(&mut out)?;
        Ok(out)
    }

    pub fn encode(&self, data: &[u8]) -> NpzResult<Vec<u8>> {
        let mut encoder = DeflateEncoder::new(data, Compression::new(self.level.min(9)));
        let mut out = Vec::new();
        encoder.read_to_end(&mut out)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deflate_bounded() {
        let data = vec![7u8; 10_000];
        let codec = DeflateCodec::default();
        let packed = codec.encode(&data).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(codec.decode(&packed, 10_000).unwrap(), data);
        assert_eq!(codec.decode(&packed, 100).unwrap().len(), 101);
    }

    #[test]
    fn test_deflate_garbage() {
        let codec = DeflateCodec::default();
        assert!(codec.decode(&[0xff, 0xff, 0xff, 0xff], 64).is_err());
    }
}
