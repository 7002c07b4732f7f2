//! Error taxonomy for the IDE-facing surface.
//!
//! Expected-negative outcomes (a breakpoint that cannot bind, a torn-down
//! session) are ordinary variants; only `Launch` and `Unexpected` mean the
//! session is unusable.

use thiserror::Error;

/// Conventional AD7 result codes.
pub mod codes {
    pub const S_OK: i32 = 0;
    pub const S_FALSE: i32 = 1;
    pub const E_NOTIMPL: i32 = 0x8000_4001_u32 as i32;
    pub const E_FAIL: i32 = 0x8000_4005_u32 as i32;
    pub const E_UNEXPECTED: i32 = 0x8000_FFFF_u32 as i32;
    pub const E_INVALIDARG: i32 = 0x8007_0057_u32 as i32;
    pub const E_BP_DELETED: i32 = 0x8004_0060_u32 as i32;
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("breakpoint could not be bound")]
    NotBound,
    #[error("no debug session is running")]
    NoSession,
    #[error("breakpoint has been deleted")]
    Deleted,
    #[error("target is not stopped")]
    NotStopped,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("GDB command failed: {0:#}")]
    Gdb(#[source] anyhow::Error),
    #[error("failed to launch debug session: {0:#}")]
    Launch(#[source] anyhow::Error),
    #[error("unexpected exception: {0}")]
    Unexpected(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// The HRESULT an AD7 caller would observe for this error.
    pub const fn code(&self) -> i32 {
        match self {
            Self::NotBound => codes::S_FALSE,
            Self::Deleted => codes::E_BP_DELETED,
            Self::InvalidArgument(_) => codes::E_INVALIDARG,
            Self::NotImplemented(_) => codes::E_NOTIMPL,
            Self::Unexpected(_) => codes::E_UNEXPECTED,
            Self::NoSession | Self::NotStopped | Self::Timeout(_) | Self::Gdb(_) | Self::Launch(_) => codes::E_FAIL,
        }
    }

    /// Session-ending failures as opposed to locally absorbed ones.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Launch(_) | Self::Unexpected(_))
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        Self::Gdb(err)
    }
}

/// Collapse a result into the HRESULT an AD7 caller sees.
pub fn to_code<T>(result: &EngineResult<T>) -> i32 {
    match result {
        Ok(_) => codes::S_OK,
        Err(e) => e.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(EngineError::NotBound.code(), codes::S_FALSE);
        assert_eq!(EngineError::Deleted.code(), codes::E_BP_DELETED);
        assert_eq!(EngineError::Unexpected("boom".into()).code(), codes::E_UNEXPECTED);
        assert_eq!(EngineError::NoSession.code(), codes::E_FAIL);
        assert_eq!(to_code(&Ok::<(), EngineError>(())), codes::S_OK);
    }

    #[test]
    fn test_fatal_classification() {
        assert!(EngineError::Launch(anyhow::anyhow!("gdb missing")).is_fatal());
        assert!(!EngineError::NotBound.is_fatal());
        assert!(!EngineError::NoSession.is_fatal());
    }

    #[test]
    fn test_gdb_error_message_keeps_context() {
        let err: EngineError = anyhow::anyhow!("No symbol table").context("-break-insert").into();
        assert!(err.to_string().contains("No symbol table"));
    }
}
