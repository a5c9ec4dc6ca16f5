pub mod array;
pub mod codecs;
pub mod container;
pub mod error;
pub mod metadata;
pub mod names;
pub mod store;
pub mod types;
pub mod value;

// Re-export key types at crate root for convenience.
pub use array::NpyArray;
pub use codecs::{AnyCodec, DeflateCodec, StoredCodec};
pub use container::{Container, ContainerMember, ContainerOptions, ContainerReader};
pub use error::{NpzError, NpzResult};
pub use metadata::{ArrayHeader, FormatVersion, descr_string, parse_descr};
pub use names::NameAllocator;
pub use store::{
    LocalBackend, Loaded, ObjectStoreBackend, StorageBackend, load, save_array, save_container,
};
pub use types::{ArrayOrder, DType, Endian, Field, ScalarKind, TextEncoding};
pub use value::{Element, NpyValue};
