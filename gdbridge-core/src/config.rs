//! Engine configuration.
//!
//! Timeouts and caps used by the session gates, the interrupt retry loop and
//! the frame enumerator. Every field has a default so partial JSON files load.

use anyhow::{bail, Context as _, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// How long one interrupt attempt waits for the stop acknowledgement.
    pub interrupt_timeout_ms: u64,
    /// Wake interval for blocked gate waiters re-checking session liveness.
    pub lock_poll_ms: u64,
    /// Maximum number of stack frames reported per thread.
    pub max_frames: usize,
    /// Capacity of the engine event broadcast channel.
    pub event_capacity: usize,
    /// Interrupt attempts before giving up; 0 retries while the session lives.
    pub max_interrupt_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            interrupt_timeout_ms: 1000,
            lock_poll_ms: 50,
            max_frames: 30,
            event_capacity: 100,
            max_interrupt_attempts: 0,
        }
    }
}

impl EngineConfig {
    /// Load a configuration from a JSON file, filling omitted fields with defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interrupt_timeout_ms == 0 {
            bail!("interrupt_timeout_ms must be greater than zero");
        }
        if self.lock_poll_ms == 0 {
            bail!("lock_poll_ms must be greater than zero");
        }
        if self.max_frames == 0 {
            bail!("max_frames must be greater than zero");
        }
        if self.event_capacity == 0 {
            bail!("event_capacity must be greater than zero");
        }
        Ok(())
    }

    pub const fn interrupt_timeout(&self) -> Duration {
        Duration::from_millis(self.interrupt_timeout_ms)
    }

    pub const fn lock_poll(&self) -> Duration {
        Duration::from_millis(self.lock_poll_ms)
    }
}
