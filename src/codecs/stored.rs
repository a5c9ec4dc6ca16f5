use serde::{Deserialize, Serialize};

use crate::error::NpzResult;

/// Stored codec (archive method 0): member bytes are written as-is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCodec;

impl StoredCodec {
    pub fn decode(&self, data: &[u8]) -> NpzResult<Vec<u8>> {
        Ok(data.to_vec())
    }

    pub fn encode(&self, data: &[u8]) -> NpzResult<Vec<u8>> {
        Ok(data.to_vec())
    }
}
