use std::path::Path;

use super::{ShutdownMarker, SledMode, StorageBackend, StorageError};

pub struct SledStorage {
    db: sled::Db,
}

const AGENT_ID_KEY: &[u8] = b"v1:agent:id";
const SHUTDOWN_MARKER_KEY: &[u8] = b"v1:agent:shutdown";

impl SledStorage {
    pub fn open(
        data_path: &Path,
        cache_capacity: Option<u64>,
        mode: Option<SledMode>,
    ) -> Result<Self, StorageError> {
        let mut config = sled::Config::new().path(data_path);

        if let Some(cache_capacity) = cache_capacity {
            config = config.cache_capacity(cache_capacity);
        }

        if let Some(mode) = mode {
            config = config.mode(match mode {
                SledMode::LowSpace => sled::Mode::LowSpace,
                SledMode::HighThroughput => sled::Mode::HighThroughput,
            });
        }

        let db = config.open().map_err(StorageError::Sled)?;
        Ok(Self { db })
    }

    fn insert_durably(&self, key: &[u8], value: Vec<u8>) -> Result<(), StorageError> {
        self.db.insert(key, value).map_err(StorageError::Sled)?;
        self.db.flush().map_err(StorageError::Sled)?;
        Ok(())
    }
}

impl StorageBackend for SledStorage {
    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush().map(|_| ()).map_err(StorageError::Sled)
    }

    fn load_agent_id(&self) -> Result<Option<String>, StorageError> {
        let Some(raw) = self.db.get(AGENT_ID_KEY).map_err(StorageError::Sled)? else {
            return Ok(None);
        };
        String::from_utf8(raw.to_vec())
            .map(Some)
            .map_err(|_| StorageError::InvalidAgentId)
    }

    fn store_agent_id(&self, agent_id: &str) -> Result<(), StorageError> {
        self.insert_durably(AGENT_ID_KEY, agent_id.as_bytes().to_vec())
    }

    fn load_shutdown_marker(&self) -> Result<Option<ShutdownMarker>, StorageError> {
        let value = self
            .db
            .get(SHUTDOWN_MARKER_KEY)
            .map_err(StorageError::Sled)?;
        value
            .map(|raw| {
                serde_json::from_slice(raw.as_ref()).map_err(StorageError::DeserializeMarker)
            })
            .transpose()
    }

    fn store_shutdown_marker(&self, marker: &ShutdownMarker) -> Result<(), StorageError> {
        let value = serde_json::to_vec(marker).map_err(StorageError::SerializeMarker)?;
        self.insert_durably(SHUTDOWN_MARKER_KEY, value)
    }

    fn clear_shutdown_marker(&self) -> Result<bool, StorageError> {
        let removed = self
            .db
            .remove(SHUTDOWN_MARKER_KEY)
            .map_err(StorageError::Sled)?;
        self.db.flush().map_err(StorageError::Sled)?;
        Ok(removed.is_some())
    }
}
