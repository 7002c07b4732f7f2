//! gdbridge Core - the debug-engine side of an IDE/GDB bridge.
//!
//! This crate translates the asynchronous GDB/MI command stream into the
//! synchronous breakpoint, thread and stack-frame object model an IDE debug
//! engine exposes, and coordinates concurrent access to the live session.

pub mod breakpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod execution;
pub mod expression;
pub mod gdb;
pub mod session;
pub mod sync;
pub mod thread;

// Re-export commonly used types
pub use breakpoint::{
    BoundBreakpoint, BoundState, BreakpointLocation, BreakpointRegistry, BreakpointRequest,
    Condition, PassCount, PendingBreakpoint, PendingState, PendingStatus, Resolution,
};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{EngineError, EngineResult};
pub use events::EngineEvent;
pub use execution::{ExecutionCoordinator, ExecutionState, StepKind};
pub use expression::{CancelToken, EvalTask, Evaluatable, GdbExpression};
pub use gdb::{GdbClient, GdbConnection, GdbEvent, GdbLauncher, LaunchParams, StopEvent, StopReason};
pub use session::{Lifecycle, Session};
pub use thread::{FrameInfo, FrameInfoFlags, ThreadAndFrameCache, ThreadProperties, ThreadSnapshot};
