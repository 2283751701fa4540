//! Store configuration

use std::path::PathBuf;
use std::time::Duration;

use crate::machine::UNDO_LIMIT;

/// Default delay before a scheduled state write hits the disk
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(250);

/// Configuration for a session store and the machine it seeds
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Directory holding `active.json`, the continue flag, event logs and snapshots
    pub data_dir: PathBuf,
    pub debounce: Duration,
    pub undo_limit: usize,
}

impl StoreConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_undo_limit(mut self, undo_limit: usize) -> Self {
        self.undo_limit = undo_limit;
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".taskstack"),
            debounce: DEFAULT_DEBOUNCE,
            undo_limit: UNDO_LIMIT,
        }
    }
}
