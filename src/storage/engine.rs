use std::fmt;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StorageEngine {
    #[default]
    Sled,
}

impl StorageEngine {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "sled" => Some(Self::Sled),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sled => "sled",
        }
    }
}

impl fmt::Display for StorageEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SledMode {
    LowSpace,
    HighThroughput,
}

impl SledMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "low_space" => Some(Self::LowSpace),
            "high_throughput" => Some(Self::HighThroughput),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{SledMode, StorageEngine};

    #[test]
    fn parses_known_names_only() {
        assert_eq!(StorageEngine::parse(" sled "), Some(StorageEngine::Sled));
        assert_eq!(StorageEngine::parse("rocksdb"), None);
        assert_eq!(SledMode::parse("low_space"), Some(SledMode::LowSpace));
        assert_eq!(SledMode::parse("fast"), None);
        assert_eq!(StorageEngine::default().to_string(), "sled");
    }
}
