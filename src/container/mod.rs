pub mod reader;
pub(crate) mod zip;

use serde::{Deserialize, Serialize};

use crate::array::NpyArray;
use crate::codecs::AnyCodec;
use crate::error::{NpzError, NpzResult};
use crate::names::{DEFAULT_PREFIX, NameAllocator};

pub use reader::ContainerReader;

/// Appended to every member name inside the archive.
pub const MEMBER_SUFFIX: &str = ".npy";

// ---------------------------------------------------------------------------
// ContainerOptions
// ---------------------------------------------------------------------------

/// Container settings, loadable from JSON:
///
/// ```json
/// { "name_prefix": "arr_", "compression": { "name": "deflate", "configuration": { "level": 6 } } }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerOptions {
    /// Prefix for generated member names.
    pub name_prefix: String,
    /// Compression for members added without an explicit codec.
    pub compression: AnyCodec,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            name_prefix: DEFAULT_PREFIX.to_string(),
            compression: AnyCodec::stored(),
        }
    }
}

impl ContainerOptions {
    /// Default options with every member deflated.
    pub fn compressed() -> Self {
        Self {
            compression: AnyCodec::deflate(),
            ..Self::default()
        }
    }

    pub fn from_json(text: &str) -> NpzResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

// ---------------------------------------------------------------------------
// ContainerMember
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerMember {
    name: String,
    array: NpyArray,
    compression: AnyCodec,
}

impl ContainerMember {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn array(&self) -> &NpyArray {
        &self.array
    }

    pub fn compression(&self) -> AnyCodec {
        self.compression
    }

    pub fn is_compressed(&self) -> bool {
        !matches!(self.compression, AnyCodec::Stored(_))
    }

    pub fn into_array(self) -> NpyArray {
        self.array
    }

    fn encode(&self) -> NpzResult<zip::EncodedEntry> {
        let raw = self.array.encode()?;
        let mut crc = flate2::Crc::new();
        crc.update(&raw);
        let data = self.compression.encode(&raw)?;
        tracing::debug!(
            member = %self.name,
            method = %self.compression.codec_id(),
            raw = raw.len(),
            stored = data.len(),
            "encoded member"
        );
        Ok(zip::EncodedEntry {
            name: format!("{}{MEMBER_SUFFIX}", self.name),
            method: self.compression.method(),
            crc: crc.sum(),
            uncompressed_size: raw.len() as u64,
            data,
        })
    }
}

// ---------------------------------------------------------------------------
// Container
// ---------------------------------------------------------------------------

/// Named arrays kept in insertion order.
///
/// Equality compares names and arrays; member order and compression are
/// ignored.
#[derive(Debug, Clone, Default)]
pub struct Container {
    members: Vec<ContainerMember>,
    names: NameAllocator,
    options: ContainerOptions,
}

impl PartialEq for Container {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .members
                .iter()
                .all(|m| other.get(&m.name) == Some(&m.array))
    }
}

impl Container {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ContainerOptions) -> Self {
        Self {
            members: Vec::new(),
            names: NameAllocator::new(options.name_prefix.clone()),
            options,
        }
    }

    pub fn options(&self) -> &ContainerOptions {
        &self.options
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.members.iter().any(|m| m.name == name)
    }

    /// Add `array` under `name` with the default compression.
    pub fn insert(&mut self, name: impl Into<String>, array: NpyArray) -> NpzResult<()> {
        let compression = self.options.compression;
        self.insert_with(name, array, compression)
    }

    pub fn insert_with(
        &mut self,
        name: impl Into<String>,
        array: NpyArray,
        compression: AnyCodec,
    ) -> NpzResult<()> {
        let name = name.into();
        if name.is_empty() {
            return Err(NpzError::MalformedMemberName {
                name,
                reason: "member name is empty".into(),
            });
        }
        if self.contains(&name) {
            return Err(NpzError::DuplicateMemberName(name));
        }
        self.members.push(ContainerMember {
            name,
            array,
            compression,
        });
        Ok(())
    }

    /// Add `array` under the next generated name, which is returned.
    pub fn push(&mut self, array: NpyArray) -> NpzResult<String> {
        let compression = self.options.compression;
        self.push_with(array, compression)
    }

    pub fn push_with(&mut self, array: NpyArray, compression: AnyCodec) -> NpzResult<String> {
        let members = &self.members;
        let name = self
            .names
            .next_name(|candidate| members.iter().any(|m| m.name == candidate))?;
        self.insert_with(name.clone(), array, compression)?;
        Ok(name)
    }

    pub fn get(&self, name: &str) -> Option<&NpyArray> {
        self.member(name).map(|m| &m.array)
    }

    pub fn member(&self, name: &str) -> Option<&ContainerMember> {
        self.members.iter().find(|m| m.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(|m| m.name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &ContainerMember> {
        self.members.iter()
    }

    pub fn remove(&mut self, name: &str) -> Option<NpyArray> {
        let pos = self.members.iter().position(|m| m.name == name)?;
        Some(self.members.remove(pos).array)
    }

    // -----------------------------------------------------------------------
    // Serialisation
    // -----------------------------------------------------------------------

    /// Encode the archive. Members appear in insertion order.
    pub fn encode(&self) -> NpzResult<Vec<u8>> {
        let entries = self
            .members
            .iter()
            .map(ContainerMember::encode)
            .collect::<NpzResult<Vec<_>>>()?;
        zip::write_archive(&entries)
    }

    /// Like [`Container::encode`], compressing members in parallel on the
    /// blocking pool. The output is identical to the sequential form.
    pub async fn encode_concurrent(&self) -> NpzResult<Vec<u8>> {
        let tasks = self.members.iter().cloned().map(|member| {
            tokio::task::spawn_blocking(move || member.encode())
        });
        let entries = futures::future::try_join_all(tasks)
            .await
            .map_err(|e| NpzError::Codec(format!("Member encode task join error: {e}")))?
            .into_iter()
            .collect::<NpzResult<Vec<_>>>()?;
        zip::write_archive(&entries)
    }

    /// Decode every member, failing on the first damaged one. Use
    /// [`ContainerReader`] to read members independently.
    pub fn decode(bytes: &[u8]) -> NpzResult<Self> {
        Self::decode_with(bytes, ContainerOptions::default())
    }

    pub fn decode_with(bytes: &[u8], options: ContainerOptions) -> NpzResult<Self> {
        let reader = ContainerReader::new(bytes)?;
        let mut container = Container::with_options(options);
        for name in reader.names() {
            let array = reader.read(name)?;
            container.insert_with(name, array, reader.codec(name))?;
        }
        tracing::debug!(members = container.len(), "decoded container");
        Ok(container)
    }
}

impl<'a> IntoIterator for &'a Container {
    type Item = &'a ContainerMember;
    type IntoIter = std::slice::Iter<'a, ContainerMember>;

    fn into_iter(self) -> Self::IntoIter {
        self.members.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ArrayOrder;

    fn small(v: u8) -> NpyArray {
        NpyArray::from_elements(vec![2], ArrayOrder::C, &[v, v]).unwrap()
    }

    #[test]
    fn test_explicit_then_generated_names() {
        let mut c = Container::new();
        c.insert("arr_0", small(1)).unwrap();
        assert_eq!(c.push(small(2)).unwrap(), "arr_1");
        assert_eq!(c.push(small(3)).unwrap(), "arr_2");
        assert!(matches!(
            c.insert("arr_2", small(4)),
            Err(NpzError::DuplicateMemberName(n)) if n == "arr_2"
        ));
        assert!(c.insert("", small(4)).is_err());
    }

    #[test]
    fn test_equality_ignores_order() {
        let mut a = Container::new();
        a.insert("x", small(1)).unwrap();
        a.insert("y", small(2)).unwrap();
        let mut b = Container::with_options(ContainerOptions::compressed());
        b.insert("y", small(2)).unwrap();
        b.insert("x", small(1)).unwrap();
        assert_eq!(a, b);
        b.remove("x");
        assert_ne!(a, b);
    }

    #[test]
    fn test_options_from_json() {
        let json = r#"{
            "name_prefix": "m",
            "compression": {"name": "deflate", "configuration": {"level": 1}}
        }"#;
        let opts = ContainerOptions::from_json(json).unwrap();
        assert_eq!(opts.name_prefix, "m");
        assert_eq!(opts.compression.method(), 8);

        let opts = ContainerOptions::from_json("{}").unwrap();
        assert_eq!(opts, ContainerOptions::default());
        assert!(ContainerOptions::from_json(r#"{"compression": {"name": "lzma"}}"#).is_err());
    }

    #[test]
    fn test_encode_is_deterministic() {
        let mut c = Container::with_options(ContainerOptions::compressed());
        c.push(small(1)).unwrap();
        c.push_with(small(2), AnyCodec::stored()).unwrap();
        assert_eq!(c.encode().unwrap(), c.encode().unwrap());
        let back = Container::decode(&c.encode().unwrap()).unwrap();
        assert!(back.member("arr_0").unwrap().is_compressed());
        assert!(!back.member("arr_1").unwrap().is_compressed());
    }

    #[tokio::test]
    async fn test_concurrent_encode_matches_sequential() {
        let mut c = Container::with_options(ContainerOptions::compressed());
        for i in 0..8 {
            c.push(small(i)).unwrap();
        }
        assert_eq!(c.encode_concurrent().await.unwrap(), c.encode().unwrap());
    }
}
