//! Breakpoint management module.
//!
//! A `PendingBreakpoint` is what the IDE asked for; binding it produces at
//! most one `BoundBreakpoint` backed by a live GDB breakpoint. The
//! `BreakpointRegistry` owns the mapping from GDB ids to bound breakpoints.

pub mod bound;
pub mod pending;
pub mod registry;

pub use bound::{BoundBreakpoint, BoundState, Resolution};
pub use pending::{PendingBreakpoint, PendingState, PendingStatus};
pub use registry::BreakpointRegistry;

/// Where the IDE wants the target to stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakpointLocation {
    FileLine { file: String, line: u32 },
    FunctionOffset { function: String, offset: u32 },
    Address(u64),
    Context(String),
    Data { expression: String },
}

impl BreakpointLocation {
    pub fn file_line(file: impl Into<String>, line: u32) -> Self {
        Self::FileLine { file: file.into(), line }
    }

    pub fn function(function: impl Into<String>, offset: u32) -> Self {
        Self::FunctionOffset { function: function.into(), offset }
    }

    /// Only source-line and function-offset breakpoints are ever bound.
    pub const fn is_bindable(&self) -> bool {
        matches!(self, Self::FileLine { .. } | Self::FunctionOffset { .. })
    }
}

/// When a crossing counts as a stop, relative to the hit count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PassCount {
    #[default]
    None,
    EqualOrGreater(u32),
    Equal(u32),
    Modulo(u32),
}

impl PassCount {
    /// Ignore count for the next stop, given the hits recorded so far.
    ///
    /// The value is "stop on the N-th next crossing". `Equal` is not clamped
    /// and goes negative once the target has been passed.
    pub fn ignore_count(self, hit_count: u32) -> i64 {
        let hits = i64::from(hit_count);
        match self {
            Self::None => 1,
            Self::EqualOrGreater(target) => {
                let remaining = i64::from(target) - hits;
                if remaining < 0 {
                    1
                } else {
                    remaining
                }
            }
            Self::Equal(target) => i64::from(target) - hits,
            // Modulo(0) has no period; treat it like no policy.
            Self::Modulo(0) => 1,
            Self::Modulo(n) => i64::from(n) - (hits % i64::from(n)),
        }
    }

    /// Whether a stop at `hit_count` should be presented to the IDE.
    pub const fn is_satisfied(self, hit_count: u32) -> bool {
        match self {
            Self::None | Self::Modulo(0) => true,
            Self::EqualOrGreater(target) => hit_count >= target,
            Self::Equal(target) => hit_count == target,
            Self::Modulo(n) => hit_count % n == 0,
        }
    }
}

/// GDB's `-break-after` count for an ignore value: crossings to skip before
/// the stop, never negative.
pub fn gdb_ignore_count(ignore: i64) -> u32 {
    u32::try_from((ignore - 1).max(0)).unwrap_or(u32::MAX)
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Condition {
    #[default]
    None,
    WhenTrue(String),
    WhenChanged(String),
}

impl Condition {
    pub fn expression(&self) -> Option<&str> {
        match self {
            Self::None => None,
            Self::WhenTrue(expr) | Self::WhenChanged(expr) => Some(expr),
        }
    }

    pub const fn is_when_changed(&self) -> bool {
        matches!(self, Self::WhenChanged(_))
    }
}

/// The IDE's breakpoint request, as handed to `Engine::create_pending_breakpoint`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointRequest {
    pub location: BreakpointLocation,
    pub pass_count: PassCount,
    pub condition: Condition,
    pub enabled: bool,
}

impl BreakpointRequest {
    pub const fn new(location: BreakpointLocation) -> Self {
        Self { location, pass_count: PassCount::None, condition: Condition::None, enabled: true }
    }

    pub fn with_pass_count(mut self, pass_count: PassCount) -> Self {
        self.pass_count = pass_count;
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = condition;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}
