use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum StorageError {
    UnsupportedEngine {
        engine: String,
    },
    InvalidSledMode {
        mode: String,
    },
    HomeDirectoryUnavailable,
    CreateDataDir {
        path: PathBuf,
        source: std::io::Error,
    },
    SerializeMarker(serde_json::Error),
    DeserializeMarker(serde_json::Error),
    InvalidAgentId,
    Sled(sled::Error),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedEngine { engine } => write!(
                f,
                "unsupported storage.engine '{engine}'; currently only 'sled' is supported"
            ),
            Self::InvalidSledMode { mode } => write!(
                f,
                "invalid storage.sled.mode '{mode}'; allowed values: low_space, high_throughput"
            ),
            Self::HomeDirectoryUnavailable => {
                write!(f, "cannot resolve storage path because HOME is not set")
            }
            Self::CreateDataDir { path, source } => write!(
                f,
                "failed to create storage data directory '{}': {source}",
                path.display()
            ),
            Self::SerializeMarker(source) => {
                write!(f, "failed to serialize shutdown marker: {source}")
            }
            Self::DeserializeMarker(source) => {
                write!(f, "failed to deserialize shutdown marker: {source}")
            }
            Self::InvalidAgentId => write!(f, "persisted agent id is not valid UTF-8"),
            Self::Sled(source) => write!(f, "sled storage error: {source}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::CreateDataDir { source, .. } => Some(source),
            Self::SerializeMarker(source) | Self::DeserializeMarker(source) => Some(source),
            Self::Sled(source) => Some(source),
            _ => None,
        }
    }
}
