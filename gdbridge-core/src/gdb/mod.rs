//! GDB collaborator contract.
//!
//! The transport that spawns GDB and parses MI lines lives outside this crate.
//! It is consumed through `GdbClient` (commands) and a channel of `GdbEvent`
//! (async notifications), both obtained from a `GdbLauncher`.

pub mod commands;
pub mod mock;
pub mod response;

use anyhow::{bail, Context as _, Result};
use crossbeam_channel::Receiver;
use std::path::PathBuf;
use std::sync::Arc;

/// Synchronous request/response plus fire-and-forget access to a GDB/MI process.
pub trait GdbClient: Send + Sync {
    /// Send a command and wait for its parsed tabular response.
    fn send_command(&self, command: &str) -> Result<String>;

    /// Queue a command without waiting for a response (interrupts, run control).
    fn add_async_command(&self, command: &str) -> Result<()>;
}

/// A live GDB process: the command side and its notification stream.
pub struct GdbConnection {
    pub client: Arc<dyn GdbClient>,
    pub events: Receiver<GdbEvent>,
}

/// Starts GDB for a target. Failure here is fatal for the session.
pub trait GdbLauncher: Send + Sync {
    fn launch(&self, params: &LaunchParams) -> Result<GdbConnection>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GdbEvent {
    Stopped(StopEvent),
    Running { thread_id: Option<u32> },
    Exited { code: Option<i32> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopEvent {
    pub reason: StopReason,
    pub thread_id: Option<u32>,
    pub file: Option<String>,
    pub line: Option<u32>,
}

impl StopEvent {
    pub const fn new(reason: StopReason, thread_id: Option<u32>) -> Self {
        Self { reason, thread_id, file: None, line: None }
    }

    pub fn at(mut self, file: impl Into<String>, line: u32) -> Self {
        self.file = Some(file.into());
        self.line = Some(line);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// `times` is GDB's crossing count for the breakpoint, when reported.
    BreakpointHit { gdb_id: u32, times: Option<u32> },
    EndSteppingRange,
    FunctionFinished,
    SignalReceived(String),
    Exception(String),
    Other(String),
}

/// Where and what to debug.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchParams {
    pub executable: PathBuf,
    pub device: Option<String>,
    pub pid: Option<u32>,
    pub simulator: bool,
}

impl LaunchParams {
    pub fn for_executable(executable: impl Into<PathBuf>) -> Self {
        Self { executable: executable.into(), ..Self::default() }
    }

    /// Parse `key=value` pairs separated by `;`, e.g. `pid=42;exe=/tmp/app;device=10.0.0.2`.
    ///
    /// `exe` is required. Unknown keys are rejected.
    pub fn from_options(options: &str) -> Result<Self> {
        let mut params = Self::default();
        let mut have_exe = false;
        for pair in options.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .with_context(|| format!("Malformed option '{pair}', expected key=value"))?;
            let value = value.trim();
            match key.trim() {
                "exe" => {
                    if value.is_empty() {
                        bail!("Empty executable path");
                    }
                    params.executable = PathBuf::from(value);
                    have_exe = true;
                }
                "pid" => {
                    params.pid = Some(value.parse().with_context(|| format!("Invalid pid '{value}'"))?);
                }
                "device" => params.device = Some(value.to_string()),
                "simulator" => {
                    params.simulator =
                        value.parse().with_context(|| format!("Invalid simulator flag '{value}'"))?;
                }
                other => bail!("Unknown option '{other}'"),
            }
        }
        if !have_exe {
            bail!("Missing 'exe' option");
        }
        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_options_parse() {
        let params = LaunchParams::from_options("pid=42; exe=/tmp/app ;device=10.0.0.2").unwrap();
        assert_eq!(params.pid, Some(42));
        assert_eq!(params.executable, PathBuf::from("/tmp/app"));
        assert_eq!(params.device.as_deref(), Some("10.0.0.2"));
        assert!(!params.simulator);
    }

    #[test]
    fn test_launch_options_malformed() {
        assert!(LaunchParams::from_options("pid=abc;exe=/tmp/app").is_err());
        assert!(LaunchParams::from_options("pid=1").is_err());
        assert!(LaunchParams::from_options("exe").is_err());
        assert!(LaunchParams::from_options("exe=/a;color=red").is_err());
    }

    #[test]
    fn test_stop_event_builder() {
        let stop = StopEvent::new(StopReason::EndSteppingRange, Some(1)).at("main.c", 12);
        assert_eq!(stop.file.as_deref(), Some("main.c"));
        assert_eq!(stop.line, Some(12));
    }
}
