use crate::error::{Result, StoreError};
use std::path::PathBuf;

pub const DEFAULT_ROOT: &str = "storage";
pub const DEFAULT_MSGS_PER_CHUNK: u32 = 5000;

/// Settings for a [`crate::store::MarketStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Directory holding the series/event/market tree.
    pub root: PathBuf,
    /// Messages per chunk before rotating. Larger values mean fewer
    /// snapshots on disk but more replay per read.
    pub msgs_per_chunk: u32,
    /// `sync_data` chunk appends and metadata before committing them.
    pub sync_writes: bool,
}

impl StoreConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn with_msgs_per_chunk(mut self, msgs_per_chunk: u32) -> Self {
        self.msgs_per_chunk = msgs_per_chunk;
        self
    }

    pub fn with_sync_writes(mut self, sync_writes: bool) -> Self {
        self.sync_writes = sync_writes;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.msgs_per_chunk == 0 {
            return Err(StoreError::InvalidConfig(
                "msgs_per_chunk must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            msgs_per_chunk: DEFAULT_MSGS_PER_CHUNK,
            sync_writes: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = StoreConfig::default();
        assert_eq!(c.root, PathBuf::from("storage"));
        assert_eq!(c.msgs_per_chunk, 5000);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn zero_chunk_size_is_invalid() {
        let c = StoreConfig::new("/tmp/x").with_msgs_per_chunk(0);
        assert!(matches!(c.validate(), Err(StoreError::InvalidConfig(_))));
    }
}
