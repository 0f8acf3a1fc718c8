use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Longest leaf name accepted from the remote agent.
pub const MAX_NAME: usize = 1024;

pub const DEFAULT_IDLE_MINUTES: u32 = 10;
pub const DEFAULT_MAX_READ: u32 = 131072;

/// Mount settings, normally read from the launcher profile JSON and then
/// overridden from the command line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MountConfig {
    /// Unmount after this many minutes without open handles (0 = never)
    pub idle_minutes: u32,
    pub read_only: bool,
    pub attr_timeout_secs: f64,
    pub entry_timeout_secs: f64,
    pub max_read: u32,
    pub readdir_page: u32,
    pub fsname: String,
    pub open_with: Option<String>,
    pub throttle_high_water: usize,
    pub throttle_low_water: usize,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            idle_minutes: DEFAULT_IDLE_MINUTES,
            read_only: false,
            attr_timeout_secs: 10.0,
            entry_timeout_secs: 3600.0,
            max_read: DEFAULT_MAX_READ,
            readdir_page: 4096,
            fsname: "remotemount".to_string(),
            open_with: None,
            throttle_high_water: 1 << 20,
            throttle_low_water: 1 << 18,
        }
    }
}

impl MountConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn idle_window(&self) -> Option<Duration> {
        match self.idle_minutes {
            0 => None,
            n => Some(Duration::from_secs(u64::from(n) * 60)),
        }
    }

    /// How long the kernel may cache attributes fetched from the agent.
    pub fn attr_ttl(&self) -> Duration {
        Duration::from_secs_f64(self.attr_timeout_secs.max(0.0))
    }

    /// How long the kernel may cache entries the bridge owns locally.
    pub fn entry_ttl(&self) -> Duration {
        Duration::from_secs_f64(self.entry_timeout_secs.max(0.0))
    }
}
