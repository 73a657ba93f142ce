use std::fs;
use std::path::PathBuf;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::logging::{LogLevel, Logger};

use super::{
    ShutdownMarker, SledMode, SledStorage, StorageBackend, StorageEngine, StorageError,
    expand_home_path,
};

pub struct StorageFacade {
    engine: StorageEngine,
    data_path: PathBuf,
    backend: Box<dyn StorageBackend>,
}

impl StorageFacade {
    pub fn initialize(config: &StorageConfig, logger: &Logger) -> Result<Self, StorageError> {
        let Some(engine) = StorageEngine::parse(&config.engine) else {
            return Err(StorageError::UnsupportedEngine {
                engine: config.engine.clone(),
            });
        };
        let data_path = expand_home_path(&config.path)?;

        logger.log(
            LogLevel::Info,
            Some("storage::init"),
            "Initializing agent state storage",
            Some(json!({
                "engine": engine.as_str(),
                "configured_path": config.path,
                "resolved_path": data_path.display().to_string(),
                "sled": {
                    "cache_capacity": config.sled.cache_capacity,
                    "mode": config.sled.mode
                }
            })),
        );

        fs::create_dir_all(&data_path).map_err(|source| StorageError::CreateDataDir {
            path: data_path.clone(),
            source,
        })?;

        let backend: Box<dyn StorageBackend> = match engine {
            StorageEngine::Sled => {
                let mode = config
                    .sled
                    .mode
                    .as_deref()
                    .map(|raw| {
                        SledMode::parse(raw).ok_or_else(|| StorageError::InvalidSledMode {
                            mode: raw.to_owned(),
                        })
                    })
                    .transpose()?;

                Box::new(SledStorage::open(
                    &data_path,
                    config.sled.cache_capacity,
                    mode,
                )?)
            }
        };

        Ok(Self {
            engine,
            data_path,
            backend,
        })
    }

    pub fn engine(&self) -> StorageEngine {
        self.engine
    }

    pub fn data_path(&self) -> &PathBuf {
        &self.data_path
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.backend.flush()
    }

    // A configured id wins and is persisted; otherwise reuse the stored id or generate one.
    pub fn resolve_agent_id(&self, configured: &str) -> Result<String, StorageError> {
        let configured = configured.trim();
        if !configured.is_empty() {
            if self.backend.load_agent_id()?.as_deref() != Some(configured) {
                self.backend.store_agent_id(configured)?;
            }
            return Ok(configured.to_owned());
        }

        if let Some(stored) = self.backend.load_agent_id()? {
            return Ok(stored);
        }

        let generated = Uuid::new_v4().to_string();
        self.backend.store_agent_id(&generated)?;
        Ok(generated)
    }

    pub fn shutdown_marker(&self) -> Result<Option<ShutdownMarker>, StorageError> {
        self.backend.load_shutdown_marker()
    }

    pub fn mark_permanently_shut_down(
        &self,
        agent_id: &str,
    ) -> Result<ShutdownMarker, StorageError> {
        let marker = ShutdownMarker {
            agent_id: agent_id.to_owned(),
            shut_down_at: Utc::now(),
        };
        self.backend.store_shutdown_marker(&marker)?;
        Ok(marker)
    }

    pub fn clear_shutdown_marker(&self) -> Result<bool, StorageError> {
        self.backend.clear_shutdown_marker()
    }
}
