use thiserror::Error;

pub type NpzResult<T> = Result<T, NpzError>;

#[derive(Error, Debug)]
pub enum NpzError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Bad magic: expected \\x93NUMPY, found {found:02x?}")]
    BadMagic { found: Vec<u8> },

    #[error("Unsupported format version {major}.{minor}")]
    UnsupportedVersion { major: u8, minor: u8 },

    #[error("Malformed descriptor at offset {offset}: {reason} (near {fragment:?})")]
    MalformedDescriptor {
        offset: usize,
        fragment: String,
        reason: String,
    },

    #[error("Malformed header at offset {offset}: {reason}")]
    MalformedHeader { offset: usize, reason: String },

    #[error("Payload size mismatch: expected {expected} bytes, got {actual}")]
    PayloadSizeMismatch { expected: u64, actual: u64 },

    #[error("Truncated payload at offset {offset}: need {expected} bytes, have {available}")]
    TruncatedPayload {
        offset: u64,
        expected: u64,
        available: u64,
    },

    #[error("Duplicate member name: {0}")]
    DuplicateMemberName(String),

    #[error("Malformed member name {name:?}: {reason}")]
    MalformedMemberName { name: String, reason: String },

    #[error("Checksum mismatch in {member:?}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        member: String,
        expected: u32,
        actual: u32,
    },

    #[error("Unsupported compression method {method} in member {member:?}")]
    UnsupportedCompressionMethod { member: String, method: u16 },

    #[error("Malformed archive at offset {offset}: {reason}")]
    MalformedArchive { offset: u64, reason: String },

    #[error("Invalid dtype: {0}")]
    InvalidDType(String),

    #[error("Index {index:?} out of bounds for shape {shape:?}")]
    IndexOutOfBounds { index: Vec<usize>, shape: Vec<usize> },

    #[error("Type conversion error: {0}")]
    TypeConversion(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),
}

impl NpzError {
    /// Build a [`NpzError::MalformedDescriptor`] pointing at `fragment`.
    pub(crate) fn descriptor(offset: usize, fragment: &str, reason: impl Into<String>) -> Self {
        let fragment: String = fragment.chars().take(40).collect();
        NpzError::MalformedDescriptor {
            offset,
            fragment,
            reason: reason.into(),
        }
    }

    pub(crate) fn header(offset: usize, reason: impl Into<String>) -> Self {
        NpzError::MalformedHeader {
            offset,
            reason: reason.into(),
        }
    }

    pub(crate) fn archive(offset: u64, reason: impl Into<String>) -> Self {
        NpzError::MalformedArchive {
            offset,
            reason: reason.into(),
        }
    }
}
