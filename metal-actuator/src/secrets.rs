//! Secret lookups by namespace and name.

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

/// Key/value contents of a secret.
pub type SecretData = BTreeMap<String, Vec<u8>>;

#[derive(Debug, Error)]
pub enum SecretStoreError {
    #[error("secret {namespace}/{name} not found")]
    NotFound { namespace: String, name: String },

    #[error("invalid secret reference {namespace}/{name}")]
    InvalidName { namespace: String, name: String },

    #[error("failed to read secret {namespace}/{name}: {source}")]
    Io {
        namespace: String,
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Read access to secrets.
#[async_trait]
pub trait SecretReader: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<SecretData, SecretStoreError>;
}

/// In-memory secrets.
#[derive(Default)]
pub struct MemorySecrets {
    secrets: RwLock<HashMap<(String, String), SecretData>>,
}

impl MemorySecrets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a secret.
    pub fn insert<K, V>(&self, namespace: &str, name: &str, data: impl IntoIterator<Item = (K, V)>)
    where
        K: Into<String>,
        V: Into<Vec<u8>>,
    {
        let data = data
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.secrets
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert((namespace.to_string(), name.to_string()), data);
    }

    pub fn remove(&self, namespace: &str, name: &str) {
        self.secrets
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&(namespace.to_string(), name.to_string()));
    }
}

#[async_trait]
impl SecretReader for MemorySecrets {
    async fn get(&self, namespace: &str, name: &str) -> Result<SecretData, SecretStoreError> {
        self.secrets
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| SecretStoreError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }
}

/// Secrets mounted as files: `<root>/<namespace>/<name>/<key>`.
pub struct DirectorySecrets {
    root: PathBuf,
}

impl DirectorySecrets {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

/// A single normal path component, so lookups stay under the root.
fn is_plain_component(segment: &str) -> bool {
    let mut components = Path::new(segment).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !segment.contains(['/', '\\'])
}

#[async_trait]
impl SecretReader for DirectorySecrets {
    async fn get(&self, namespace: &str, name: &str) -> Result<SecretData, SecretStoreError> {
        if !is_plain_component(namespace) || !is_plain_component(name) {
            return Err(SecretStoreError::InvalidName {
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }
        let dir = self.root.join(namespace).join(name);
        let io_err = |source: std::io::Error| SecretStoreError::Io {
            namespace: namespace.to_string(),
            name: name.to_string(),
            source,
        };

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SecretStoreError::NotFound {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                })
            }
            Err(e) => return Err(io_err(e)),
        };

        let mut data = SecretData::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            // Skip the `..data` style symlinks and hidden files of mounted volumes.
            let Some(key) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if key.starts_with('.') || !path.is_file() {
                continue;
            }
            let value = tokio::fs::read(&path).await.map_err(io_err)?;
            data.insert(key.to_string(), value);
        }

        debug!("Read secret {}/{} ({} keys)", namespace, name, data.len());
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_secrets_lookup() {
        let secrets = MemorySecrets::new();
        secrets.insert("test", "credentials", [("EQUINIX_METAL_API_KEY", "key")]);

        let data = secrets.get("test", "credentials").await.unwrap();
        assert_eq!(data["EQUINIX_METAL_API_KEY"], b"key".to_vec());

        let err = secrets.get("other", "credentials").await.unwrap_err();
        assert!(matches!(err, SecretStoreError::NotFound { .. }));
        assert_eq!(err.to_string(), "secret other/credentials not found");

        secrets.remove("test", "credentials");
        assert!(secrets.get("test", "credentials").await.is_err());
    }

    #[tokio::test]
    async fn directory_secrets_reads_key_files() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("test").join("user-data");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("userData"), "#cloud-config\n").unwrap();
        std::fs::write(dir.join(".hidden"), "ignored").unwrap();

        let secrets = DirectorySecrets::new(root.path());
        let data = secrets.get("test", "user-data").await.unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data["userData"], b"#cloud-config\n".to_vec());

        let err = secrets.get("test", "missing").await.unwrap_err();
        assert!(matches!(err, SecretStoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn directory_secrets_stay_under_root() {
        let base = tempfile::tempdir().unwrap();
        let outside = base.path().join("outside");
        std::fs::create_dir_all(&outside).unwrap();
        std::fs::write(outside.join("key"), "leaked").unwrap();
        let root = base.path().join("secrets");
        std::fs::create_dir_all(root.join("test")).unwrap();

        let secrets = DirectorySecrets::new(&root);
        let absolute = outside.to_string_lossy().to_string();
        for name in ["../../outside", "..", ".", "", "a/b", absolute.as_str()] {
            let err = secrets.get("test", name).await.unwrap_err();
            assert!(
                matches!(err, SecretStoreError::InvalidName { .. }),
                "{:?} was not rejected",
                name
            );
        }
        let err = secrets.get("..", "outside").await.unwrap_err();
        assert!(matches!(err, SecretStoreError::InvalidName { .. }));
    }
}
