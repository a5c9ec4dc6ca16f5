use std::collections::HashMap;

use crate::array::NpyArray;
use crate::codecs::AnyCodec;
use crate::container::MEMBER_SUFFIX;
use crate::container::zip::{self, DirectoryEntry};
use crate::error::{NpzError, NpzResult};

/// Lazy view over an archive. Only the central directory is parsed up front;
/// each member is inflated and checked when it is read, so a damaged member
/// does not hide the others.
#[derive(Debug)]
pub struct ContainerReader<'a> {
    bytes: &'a [u8],
    entries: Vec<(String, DirectoryEntry)>,
    index: HashMap<String, usize>,
}

fn member_key(file_name: &str) -> NpzResult<&str> {
    file_name
        .strip_suffix(MEMBER_SUFFIX)
        .ok_or_else(|| NpzError::MalformedMemberName {
            name: file_name.to_string(),
            reason: format!("missing {MEMBER_SUFFIX:?} suffix"),
        })
}

impl<'a> ContainerReader<'a> {
    pub fn new(bytes: &'a [u8]) -> NpzResult<Self> {
        let directory = zip::read_directory(bytes)?;
        let mut entries = Vec::with_capacity(directory.len());
        let mut index = HashMap::with_capacity(directory.len());
        for entry in directory {
            let key = member_key(&entry.name)?.to_string();
            if index.insert(key.clone(), entries.len()).is_some() {
                return Err(NpzError::DuplicateMemberName(key));
            }
            entries.push((key, entry));
        }
        Ok(Self {
            bytes,
            entries,
            index,
        })
    }

    /// Member names in directory order, without the `.npy` suffix.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Compression method recorded for `name`.
    pub fn method(&self, name: &str) -> Option<u16> {
        self.index.get(name).map(|&i| self.entries[i].1.method)
    }

    /// Recover the uncompressed `.npy` stream of a member, verifying its size
    /// and CRC-32.
    pub fn read_raw(&self, name: &str) -> NpzResult<Vec<u8>> {
        let &i = self
            .index
            .get(name)
            .ok_or_else(|| NpzError::NotFound(format!("member {name:?}")))?;
        let entry = &self.entries[i].1;
        let codec = AnyCodec::for_method(entry.method).ok_or_else(|| {
            NpzError::UnsupportedCompressionMethod {
                member: name.to_string(),
                method: entry.method,
            }
        })?;
        let stored = zip::entry_data(self.bytes, entry)?;

        let corrupt = |data: &[u8]| {
            let mut crc = flate2::Crc::new();
            crc.update(data);
            NpzError::ChecksumMismatch {
                member: name.to_string(),
                expected: entry.crc,
                actual: crc.sum(),
            }
        };
        let data = match codec.decode(stored, entry.uncompressed_size) {
            Ok(data) => data,
            Err(e) => {
                tracing::debug!(member = name, error = %e, "member failed to decompress");
                return Err(corrupt(&[]));
            }
        };
        if data.len() as u64 != entry.uncompressed_size {
            tracing::debug!(
                member = name,
                declared = entry.uncompressed_size,
                actual = data.len(),
                "member size differs from directory"
            );
            return Err(corrupt(&data));
        }
        let mut crc = flate2::Crc::new();
        crc.update(&data);
        if crc.sum() != entry.crc {
            return Err(corrupt(&data));
        }
        Ok(data)
    }

    /// Decode one member into an array.
    pub fn read(&self, name: &str) -> NpzResult<NpyArray> {
        NpyArray::decode(&self.read_raw(name)?)
    }

    pub(crate) fn codec(&self, name: &str) -> AnyCodec {
        self.method(name)
            .and_then(AnyCodec::for_method)
            .unwrap_or_default()
    }
}
