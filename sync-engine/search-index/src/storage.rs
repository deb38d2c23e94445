use std::fmt::{Debug, Formatter};
use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// The persisted control markers consulted at startup.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Marker {
    /// The whole index must be rebuilt from the primary store.
    Reindex,

    /// Documents without a visible backing entity must be pruned.
    CleanUp,
}

impl Marker {
    fn keyspace(&self) -> &'static str {
        match self {
            Self::Reindex => "marker-reindex",
            Self::CleanUp => "marker-cleanup",
        }
    }
}

/// The metadata store of an index.
///
/// This holds every structure that must survive a restart next to the
/// index itself, every write is flushed to disk before returning.
#[derive(Clone)]
pub struct StorageBackend {
    conn: sled::Db,
}

impl StorageBackend {
    /// Opens the store at the given path, or a temporary store which is
    /// removed once dropped when no path is given.
    pub fn connect(path: Option<&Path>) -> Result<Self> {
        let config = sled::Config::new()
            .use_compression(true)
            .mode(sled::Mode::HighThroughput)
            .flush_every_ms(None);

        let conn = match path {
            Some(path) => {
                std::fs::create_dir_all(path)?;
                config
                    .path(path)
                    .open()
                    .with_context(|| format!("failed to open metadata store at {:?}", path))?
            },
            None => config.temporary(true).open()?,
        };

        Ok(Self { conn })
    }

    pub fn store_structure<T: Serialize>(&self, keyspace: &str, value: &T) -> Result<()> {
        let data = bincode::serialize(value)?;
        self.conn.insert(keyspace, data)?;
        self.conn.flush()?;
        Ok(())
    }

    pub fn load_structure<T: DeserializeOwned>(&self, keyspace: &str) -> Result<Option<T>> {
        let data = match self.conn.get(keyspace)? {
            Some(data) => data,
            None => return Ok(None),
        };

        let value = bincode::deserialize(&data)
            .with_context(|| format!("failed to decode persisted structure {:?}", keyspace))?;

        Ok(Some(value))
    }

    pub fn remove_structure(&self, keyspace: &str) -> Result<()> {
        self.conn.remove(keyspace)?;
        self.conn.flush()?;
        Ok(())
    }

    pub fn set_marker(&self, marker: Marker) -> Result<()> {
        self.store_structure(marker.keyspace(), &true)
    }

    pub fn clear_marker(&self, marker: Marker) -> Result<()> {
        self.remove_structure(marker.keyspace())
    }

    pub fn has_marker(&self, marker: Marker) -> Result<bool> {
        Ok(self.conn.contains_key(marker.keyspace())?)
    }
}

impl Debug for StorageBackend {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("StorageBackend")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loading_and_unloading() -> Result<()> {
        let test_structure = vec!["foo".to_string(), "bar".to_string()];

        let storage = StorageBackend::connect(None)?;
        storage.store_structure("test", &test_structure)?;

        let loaded: Option<Vec<String>> = storage.load_structure("test")?;
        assert_eq!(loaded, Some(test_structure));

        storage.remove_structure("test")?;
        let loaded: Option<Vec<String>> = storage.load_structure("test")?;
        assert!(loaded.is_none());

        Ok(())
    }

    #[test]
    fn markers_survive_reopening() -> Result<()> {
        let dir = tempfile::tempdir()?;

        {
            let storage = StorageBackend::connect(Some(dir.path()))?;
            assert!(!storage.has_marker(Marker::Reindex)?);
            storage.set_marker(Marker::Reindex)?;
        }

        let storage = StorageBackend::connect(Some(dir.path()))?;
        assert!(storage.has_marker(Marker::Reindex)?);
        assert!(!storage.has_marker(Marker::CleanUp)?);

        storage.clear_marker(Marker::Reindex)?;
        assert!(!storage.has_marker(Marker::Reindex)?);

        Ok(())
    }
}
