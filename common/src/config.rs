//! Configuration types for runtime, output and synchronization settings

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}

/// Periodic progress output
#[derive(Debug, Clone, Copy)]
pub struct ProgressSettings {
    pub delay: std::time::Duration,
}

impl Default for ProgressSettings {
    fn default() -> Self {
        Self {
            delay: std::time::Duration::from_secs(10),
        }
    }
}

/// Objects above this size are uploaded in parts when the destination supports it
pub const DEFAULT_PART_SIZE: u64 = 32 << 20;

/// What to synchronize and how; read-only once the run starts
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Number of concurrent transfer workers
    pub threads: usize,
    /// Number of concurrent listing requests
    pub list_threads: usize,
    /// Depth down to which prefixes are listed concurrently
    pub list_depth: usize,
    /// First key to sync (inclusive)
    pub start: Option<String>,
    /// Last key to sync (inclusive)
    pub end: Option<String>,
    /// Maximum number of decisions to act on (None = unlimited)
    pub limit: Option<u64>,
    pub filter: crate::filter::FilterSettings,
    /// Copy only when the source is newer
    pub update: bool,
    /// Always overwrite existing keys
    pub force_update: bool,
    /// Skip keys missing at the destination
    pub existing: bool,
    /// Skip keys present at the destination
    pub ignore_existing: bool,
    pub delete_src: bool,
    pub delete_dst: bool,
    /// Verify every transferred object
    pub check_all: bool,
    /// Verify newly created objects
    pub check_new: bool,
    /// Count decisions without executing them
    pub dry: bool,
    /// Sync directory placeholders
    pub dirs: bool,
    /// Preserve permissions, ownership and mtime
    pub perms: bool,
    /// Copy symlinks as symlinks
    pub links: bool,
    pub storage_class: Option<String>,
    /// Bandwidth limit in Mbps (0 = unlimited)
    pub bwlimit: u64,
    pub part_size: u64,
    /// Address of the manager, set for worker processes
    pub manager: Option<String>,
    /// Hosts to start workers on
    pub workers: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            threads: 10,
            list_threads: 1,
            list_depth: 1,
            start: None,
            end: None,
            limit: None,
            filter: Default::default(),
            update: false,
            force_update: false,
            existing: false,
            ignore_existing: false,
            delete_src: false,
            delete_dst: false,
            check_all: false,
            check_new: false,
            dry: false,
            dirs: false,
            perms: false,
            links: false,
            storage_class: None,
            bwlimit: 0,
            part_size: DEFAULT_PART_SIZE,
            manager: None,
            workers: vec![],
        }
    }
}

impl SyncConfig {
    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.threads == 0 {
            return Err("threads must be greater than 0".to_string());
        }
        if self.list_threads == 0 {
            return Err("list-threads must be greater than 0".to_string());
        }
        if self.part_size == 0 {
            return Err("part-size must be greater than 0".to_string());
        }
        if self.update && self.force_update {
            return Err("--update and --force-update are mutually exclusive".to_string());
        }
        if self.existing && self.ignore_existing {
            return Err("--existing and --ignore-existing are mutually exclusive".to_string());
        }
        if let (Some(start), Some(end)) = (&self.start, &self.end) {
            if start > end {
                return Err(format!("start key {start:?} is after end key {end:?}"));
            }
        }
        if self.manager.is_some() && !self.workers.is_empty() {
            return Err("a worker (--manager) cannot start other workers".to_string());
        }
        Ok(())
    }

    /// True when `key` lies within `[start, end]`
    pub fn in_range(&self, key: &str) -> bool {
        if let Some(start) = &self.start {
            if key < start.as_str() {
                return false;
            }
        }
        !self.past_end(key)
    }

    pub fn past_end(&self, key: &str) -> bool {
        matches!(&self.end, Some(end) if key > end.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(SyncConfig::default().validate().is_ok());
    }

    #[test]
    fn contradictions_are_rejected() {
        let config = SyncConfig {
            update: true,
            force_update: true,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = SyncConfig {
            existing: true,
            ignore_existing: true,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = SyncConfig {
            threads: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = SyncConfig {
            start: Some("b".into()),
            end: Some("a".into()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn key_range_is_inclusive() {
        let config = SyncConfig {
            start: Some("b".into()),
            end: Some("d".into()),
            ..Default::default()
        };
        assert!(!config.in_range("a"));
        assert!(config.in_range("b"));
        assert!(config.in_range("c/x"));
        assert!(config.in_range("d"));
        assert!(!config.in_range("d/x"));
        assert!(config.past_end("e"));
    }
}
