use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{LogTreeError, Result};

// Log file layout
pub const LOG_FILE_SUFFIX: &str = "ltl";
pub const LOG_FILE_MAGIC: u32 = 0x4C54_4C47; // "LTLG"
pub const LOG_FORMAT_VERSION: u8 = 1;
pub const ENTRY_HEADER_SIZE: usize = 16;

// Smallest file that can hold a header plus a useful amount of entries
pub const MIN_LOG_FILE_SIZE: u32 = 4 * 1024;
pub const MIN_NODE_ENTRIES: usize = 4;

/// How far a commit has to push its log entries before returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Durability {
    /// Written and fsynced before the commit returns.
    Sync,
    /// Written to the operating system, not fsynced.
    WriteNoSync,
    /// Left in the log buffer.
    NoSync,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Maximum size of a single log file (default: 10MB)
    pub max_file_size: u32,

    /// Number of write buffers in the log buffer pool (default: 3)
    pub num_log_buffers: usize,

    /// Size of each log write buffer (default: 1MB)
    pub log_buffer_size: usize,

    /// Memory budget for resident tree nodes and record data (default: 64MB)
    pub cache_size: u64,

    /// Maximum entries per tree node before it is split (default: 128)
    pub node_max_entries: usize,

    /// Default lock wait bound (default: 500ms)
    pub lock_timeout: Duration,

    /// Default transaction lifetime bound, zero disables it (default: 0)
    pub txn_timeout: Duration,

    /// Durability used by commits that do not override it (default: Sync)
    pub durability: Durability,

    /// Bytes logged between two daemon-driven checkpoints (default: 20MB)
    pub checkpoint_bytes_interval: u64,

    /// Wall-clock bound between two daemon-driven checkpoints (default: 30s)
    pub checkpoint_interval: Duration,

    /// Largest share of dirty slots, in percent, for which a BIN is logged as a delta (default: 25)
    pub delta_percent: u32,

    /// Overall log utilization, in percent, the cleaner tries to maintain (default: 50)
    pub cleaner_min_utilization: u32,

    /// Files under this utilization, in percent, are always cleaned (default: 5)
    pub cleaner_min_file_utilization: u32,

    /// Maximum files cleaned per cleaner run (default: 4)
    pub cleaner_backlog: usize,

    pub run_checkpointer: bool,
    pub run_cleaner: bool,
    pub run_evictor: bool,
    pub run_compressor: bool,

    /// How often the daemons wake up when nobody wakes them (default: 5s)
    pub daemon_interval: Duration,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            max_file_size: 10 * 1024 * 1024, // 10MB
            num_log_buffers: 3,
            log_buffer_size: 1024 * 1024, // 1MB
            cache_size: 64 * 1024 * 1024, // 64MB
            node_max_entries: 128,
            lock_timeout: Duration::from_millis(500),
            txn_timeout: Duration::ZERO,
            durability: Durability::Sync,
            checkpoint_bytes_interval: 20 * 1024 * 1024,
            checkpoint_interval: Duration::from_secs(30),
            delta_percent: 25,
            cleaner_min_utilization: 50,
            cleaner_min_file_utilization: 5,
            cleaner_backlog: 4,
            run_checkpointer: true,
            run_cleaner: true,
            run_evictor: true,
            run_compressor: true,
            daemon_interval: Duration::from_secs(5),
        }
    }
}

impl EnvironmentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// A configuration with every daemon switched off, so tests drive
    /// checkpoints, cleaning, eviction and compression explicitly.
    pub fn without_daemons() -> Self {
        Self::default().with_daemons(false)
    }

    pub fn with_max_file_size(mut self, size: u32) -> Self {
        self.max_file_size = size;
        self
    }

    pub fn with_log_buffers(mut self, count: usize, size: usize) -> Self {
        self.num_log_buffers = count;
        self.log_buffer_size = size;
        self
    }

    pub fn with_cache_size(mut self, bytes: u64) -> Self {
        self.cache_size = bytes;
        self
    }

    pub fn with_node_max_entries(mut self, entries: usize) -> Self {
        self.node_max_entries = entries;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_txn_timeout(mut self, timeout: Duration) -> Self {
        self.txn_timeout = timeout;
        self
    }

    pub fn with_durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    pub fn with_checkpoint_bytes_interval(mut self, bytes: u64) -> Self {
        self.checkpoint_bytes_interval = bytes;
        self
    }

    pub fn with_checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    pub fn with_delta_percent(mut self, percent: u32) -> Self {
        self.delta_percent = percent;
        self
    }

    pub fn with_cleaner_utilization(mut self, min_utilization: u32, min_file_utilization: u32) -> Self {
        self.cleaner_min_utilization = min_utilization;
        self.cleaner_min_file_utilization = min_file_utilization;
        self
    }

    pub fn with_cleaner_backlog(mut self, files: usize) -> Self {
        self.cleaner_backlog = files;
        self
    }

    pub fn with_daemons(mut self, enabled: bool) -> Self {
        self.run_checkpointer = enabled;
        self.run_cleaner = enabled;
        self.run_evictor = enabled;
        self.run_compressor = enabled;
        self
    }

    pub fn with_daemon_interval(mut self, interval: Duration) -> Self {
        self.daemon_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_file_size < MIN_LOG_FILE_SIZE {
            return Err(LogTreeError::InvalidConfig(format!(
                "max_file_size {} is below the minimum of {}",
                self.max_file_size, MIN_LOG_FILE_SIZE
            )));
        }
        if self.num_log_buffers < 2 {
            return Err(LogTreeError::InvalidConfig(
                "at least two log buffers are required".to_string(),
            ));
        }
        if self.log_buffer_size < 1024 {
            return Err(LogTreeError::InvalidConfig(format!(
                "log_buffer_size {} is too small",
                self.log_buffer_size
            )));
        }
        if self.node_max_entries < MIN_NODE_ENTRIES {
            return Err(LogTreeError::InvalidConfig(format!(
                "node_max_entries must be at least {}",
                MIN_NODE_ENTRIES
            )));
        }
        if self.delta_percent > 100
            || self.cleaner_min_utilization > 100
            || self.cleaner_min_file_utilization > 100
        {
            return Err(LogTreeError::InvalidConfig(
                "percentages must be within 0..=100".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EnvironmentConfig::default();
        assert_eq!(config.max_file_size, 10 * 1024 * 1024);
        assert_eq!(config.durability, Durability::Sync);
        assert!(config.run_cleaner);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = EnvironmentConfig::without_daemons()
            .with_max_file_size(64 * 1024)
            .with_node_max_entries(16)
            .with_lock_timeout(Duration::from_millis(100))
            .with_durability(Durability::WriteNoSync);

        assert_eq!(config.max_file_size, 64 * 1024);
        assert_eq!(config.node_max_entries, 16);
        assert_eq!(config.lock_timeout, Duration::from_millis(100));
        assert_eq!(config.durability, Durability::WriteNoSync);
        assert!(!config.run_checkpointer && !config.run_evictor);
    }

    #[test]
    fn test_rejects_tiny_files() {
        let config = EnvironmentConfig::default().with_max_file_size(100);
        assert!(matches!(config.validate(), Err(LogTreeError::InvalidConfig(_))));
    }

    #[test]
    fn test_serde_round_trip() {
        let config = EnvironmentConfig::default().with_cache_size(1 << 20);
        let bytes = bincode::serialize(&config).unwrap();
        let decoded: EnvironmentConfig = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded.cache_size, 1 << 20);
    }
}
