use super::{ShutdownMarker, StorageError};

pub trait StorageBackend: Send + Sync {
    fn flush(&self) -> Result<(), StorageError>;
    fn load_agent_id(&self) -> Result<Option<String>, StorageError>;
    fn store_agent_id(&self, agent_id: &str) -> Result<(), StorageError>;
    fn load_shutdown_marker(&self) -> Result<Option<ShutdownMarker>, StorageError>;
    fn store_shutdown_marker(&self, marker: &ShutdownMarker) -> Result<(), StorageError>;
    fn clear_shutdown_marker(&self) -> Result<bool, StorageError>;
}
