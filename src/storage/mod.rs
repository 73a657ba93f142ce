mod backend;
mod engine;
mod error;
mod facade;
mod path;
mod sled_backend;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use backend::StorageBackend;
pub use engine::{SledMode, StorageEngine};
pub use error::StorageError;
pub use facade::StorageFacade;
use path::expand_home_path;
pub use sled_backend::SledStorage;

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct ShutdownMarker {
    pub agent_id: String,
    pub shut_down_at: DateTime<Utc>,
}

#[cfg(test)]
pub(crate) fn unique_temp_path(label: &str) -> String {
    let path = std::env::temp_dir().join(format!(
        "mole-storage-test-{label}-{}-{}",
        std::process::id(),
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    path.to_string_lossy().to_string()
}

#[cfg(test)]
pub(crate) fn test_storage(path: &str) -> StorageFacade {
    let config = crate::config::StorageConfig {
        engine: "sled".to_owned(),
        path: path.to_owned(),
        sled: crate::config::SledConfig::default(),
    };
    StorageFacade::initialize(&config, &crate::logging::Logger::discard())
        .expect("storage init should work")
}

#[cfg(test)]
mod tests {
    use crate::config::{SledConfig, StorageConfig};
    use crate::logging::Logger;
    use crate::storage::{StorageEngine, StorageError, StorageFacade};

    use super::{expand_home_path, test_storage, unique_temp_path};

    #[test]
    fn expands_tilde_prefix_to_home() {
        let home = std::env::var("HOME").expect("HOME should be available in tests");
        let expanded = expand_home_path("~/.mole/agent").expect("expansion should work");
        assert_eq!(expanded, std::path::Path::new(&home).join(".mole/agent"));
    }

    #[test]
    fn keeps_absolute_paths_unchanged() {
        let expanded = expand_home_path("/var/lib/mole/agent").expect("expansion should work");
        assert_eq!(expanded, std::path::PathBuf::from("/var/lib/mole/agent"));
    }

    #[test]
    fn rejects_unknown_engine_and_sled_mode() {
        let logger = Logger::discard();
        let mut config = StorageConfig {
            engine: "rocks".to_owned(),
            path: unique_temp_path("bad-engine"),
            sled: SledConfig::default(),
        };
        assert!(matches!(
            StorageFacade::initialize(&config, &logger),
            Err(StorageError::UnsupportedEngine { .. })
        ));

        config.engine = "sled".to_owned();
        config.sled.mode = Some("turbo".to_owned());
        assert!(matches!(
            StorageFacade::initialize(&config, &logger),
            Err(StorageError::InvalidSledMode { .. })
        ));
    }

    #[test]
    fn generated_agent_id_is_stable_until_configured() {
        let path = unique_temp_path("agent-id");
        let storage = test_storage(&path);
        assert_eq!(storage.engine(), StorageEngine::Sled);

        let generated = storage.resolve_agent_id("").expect("id should resolve");
        assert!(!generated.is_empty());
        assert_eq!(storage.resolve_agent_id("  ").expect("id should resolve"), generated);
        assert_eq!(
            storage.resolve_agent_id("edge-9").expect("configured id should win"),
            "edge-9"
        );
        assert_eq!(storage.resolve_agent_id("").expect("id should resolve"), "edge-9");

        drop(storage);
        let _ = std::fs::remove_dir_all(path);
    }

    #[test]
    fn shutdown_marker_persists_until_cleared() {
        let path = unique_temp_path("shutdown-marker");
        let storage = test_storage(&path);
        assert!(storage.shutdown_marker().expect("lookup should work").is_none());

        let written = storage
            .mark_permanently_shut_down("edge-1")
            .expect("marker should persist");
        let marker = storage
            .shutdown_marker()
            .expect("lookup should work")
            .expect("marker should be stored");
        assert_eq!(marker, written);
        assert_eq!(marker.agent_id, "edge-1");

        assert!(storage.clear_shutdown_marker().expect("clear should work"));
        assert!(!storage.clear_shutdown_marker().expect("second clear is a no-op"));
        assert!(storage.shutdown_marker().expect("lookup should work").is_none());

        drop(storage);
        let _ = std::fs::remove_dir_all(path);
    }
}
