use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;

use crate::array::NpyArray;
use crate::container::Container;
use crate::error::{NpzError, NpzResult};
use crate::metadata::MAGIC;

// ---------------------------------------------------------------------------
// StorageBackend trait
// ---------------------------------------------------------------------------

/// Async byte storage that `.npy` and `.npz` objects are loaded from and
/// saved to.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Fetch the contents at `path`.
    /// Returns `Ok(None)` when the key does not exist (rather than an error).
    async fn get(&self, path: &str) -> NpzResult<Option<Bytes>>;

    /// Store `data` at `path`. Without `overwrite`, an existing object is
    /// left untouched and [`NpzError::AlreadyExists`] is returned.
    async fn put(&self, path: &str, data: Bytes, overwrite: bool) -> NpzResult<()>;

    async fn exists(&self, path: &str) -> NpzResult<bool>;
}

// ---------------------------------------------------------------------------
// LocalBackend  (tokio::fs)
// ---------------------------------------------------------------------------

/// Local-filesystem backend using `tokio::fs`.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Create a new backend rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    async fn get(&self, path: &str) -> NpzResult<Option<Bytes>> {
        let full = self.resolve(path);
        match tokio::fs::read(&full).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(NpzError::Storage(format!(
                "Failed to read {}: {e}",
                full.display()
            ))),
        }
    }

    async fn put(&self, path: &str, data: Bytes, overwrite: bool) -> NpzResult<()> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                NpzError::Storage(format!("Failed to create {}: {e}", parent.display()))
            })?;
        }
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true);
        if overwrite {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }
        let mut file = match options.open(&full).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(NpzError::AlreadyExists(full.display().to_string()));
            }
            Err(e) => {
                return Err(NpzError::Storage(format!(
                    "Failed to open {}: {e}",
                    full.display()
                )));
            }
        };
        file.write_all(&data).await?;
        file.flush().await?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> NpzResult<bool> {
        let full = self.resolve(path);
        tokio::fs::try_exists(&full).await.map_err(|e| {
            NpzError::Storage(format!("Failed to stat {}: {e}", full.display()))
        })
    }
}

// ---------------------------------------------------------------------------
// ObjectStoreBackend  (wraps object_store crate)
// ---------------------------------------------------------------------------

/// Backend that wraps any [`object_store::ObjectStore`] implementation.
pub struct ObjectStoreBackend {
    store: Box<dyn object_store::ObjectStore>,
    prefix: String,
}

impl ObjectStoreBackend {
    pub fn new(store: Box<dyn object_store::ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    fn full_path(&self, path: &str) -> object_store::path::Path {
        if self.prefix.is_empty() {
            object_store::path::Path::from(path)
        } else {
            object_store::path::Path::from(format!("{}/{}", self.prefix, path))
        }
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    async fn get(&self, path: &str) -> NpzResult<Option<Bytes>> {
        let location = self.full_path(path);
        match self
            .store
            .get_opts(&location, object_store::GetOptions::default())
            .await
        {
            Ok(result) => {
                let data = result.bytes().await.map_err(|e| {
                    NpzError::Storage(format!("Failed to read bytes from {path}: {e}"))
                })?;
                Ok(Some(data))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(NpzError::Storage(format!(
                "Object store error for {path}: {e}"
            ))),
        }
    }

    async fn put(&self, path: &str, data: Bytes, overwrite: bool) -> NpzResult<()> {
        let location = self.full_path(path);
        let opts = object_store::PutOptions {
            mode: if overwrite {
                object_store::PutMode::Overwrite
            } else {
                object_store::PutMode::Create
            },
            ..Default::default()
        };
        match self
            .store
            .put_opts(&location, object_store::PutPayload::from(data), opts)
            .await
        {
            Ok(_) => Ok(()),
            Err(object_store::Error::AlreadyExists { .. }) => {
                Err(NpzError::AlreadyExists(location.to_string()))
            }
            Err(e) => Err(NpzError::Storage(format!(
                "Object store put error for {path}: {e}"
            ))),
        }
    }

    async fn exists(&self, path: &str) -> NpzResult<bool> {
        let location = self.full_path(path);
        let opts = object_store::GetOptions {
            head: true,
            ..Default::default()
        };
        match self.store.get_opts(&location, opts).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(NpzError::Storage(format!(
                "Object store head error for {path}: {e}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// load / save
// ---------------------------------------------------------------------------

/// What [`load`] found at a path.
#[derive(Debug, Clone, PartialEq)]
pub enum Loaded {
    Array(NpyArray),
    Container(Container),
}

impl Loaded {
    pub fn into_array(self) -> Option<NpyArray> {
        match self {
            Loaded::Array(a) => Some(a),
            Loaded::Container(_) => None,
        }
    }

    pub fn into_container(self) -> Option<Container> {
        match self {
            Loaded::Container(c) => Some(c),
            Loaded::Array(_) => None,
        }
    }
}

/// Load a `.npy` or `.npz` object, telling them apart by the leading magic.
pub async fn load<B: StorageBackend + ?Sized>(backend: &B, path: &str) -> NpzResult<Loaded> {
    let data = backend
        .get(path)
        .await?
        .ok_or_else(|| NpzError::NotFound(path.to_string()))?;
    if data.starts_with(&MAGIC) {
        tracing::debug!(path, bytes = data.len(), "loading array");
        Ok(Loaded::Array(NpyArray::decode(&data)?))
    } else {
        tracing::debug!(path, bytes = data.len(), "loading container");
        Ok(Loaded::Container(Container::decode(&data)?))
    }
}

pub async fn save_array<B: StorageBackend + ?Sized>(
    backend: &B,
    path: &str,
    array: &NpyArray,
    overwrite: bool,
) -> NpzResult<()> {
    let data = array.encode()?;
    backend.put(path, Bytes::from(data), overwrite).await
}

pub async fn save_container<B: StorageBackend + ?Sized>(
    backend: &B,
    path: &str,
    container: &Container,
    overwrite: bool,
) -> NpzResult<()> {
    let data = container.encode_concurrent().await?;
    backend.put(path, Bytes::from(data), overwrite).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ArrayOrder;

    #[tokio::test]
    async fn test_object_store_backend() {
        let store = object_store::memory::InMemory::new();
        let backend = ObjectStoreBackend::new(Box::new(store), "data");
        let array = NpyArray::from_elements(vec![3], ArrayOrder::C, &[1.0f32, 2.0, 3.0]).unwrap();

        assert!(!backend.exists("a.npy").await.unwrap());
        save_array(&backend, "a.npy", &array, false).await.unwrap();
        assert!(backend.exists("a.npy").await.unwrap());
        assert!(matches!(
            save_array(&backend, "a.npy", &array, false).await,
            Err(NpzError::AlreadyExists(_))
        ));
        save_array(&backend, "a.npy", &array, true).await.unwrap();

        let loaded = load(&backend, "a.npy").await.unwrap();
        assert_eq!(loaded.into_array(), Some(array));
        assert!(matches!(load(&backend, "b.npy").await, Err(NpzError::NotFound(_))));
    }
}
