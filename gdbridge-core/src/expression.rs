//! Expression evaluation.
//!
//! `Evaluatable` is the one seam every expression goes through; `EvalTask`
//! runs an evaluation on a worker thread and can be cancelled before it
//! delivers its result.

use crate::error::{EngineError, EngineResult};
use crate::events::EngineEvent;
use crate::execution::ExecutionState;
use crate::gdb::{commands, GdbClient};
use crate::session::Session;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub trait Evaluatable: Send + Sync {
    fn text(&self) -> &str;

    fn evaluate(&self, gdb: &dyn GdbClient) -> anyhow::Result<String>;
}

/// An expression evaluated by GDB in the selected frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GdbExpression {
    text: String,
}

impl GdbExpression {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

impl Evaluatable for GdbExpression {
    fn text(&self) -> &str {
        &self.text
    }

    fn evaluate(&self, gdb: &dyn GdbClient) -> anyhow::Result<String> {
        Ok(gdb.send_command(&commands::evaluate_expression(&self.text))?.trim().to_string())
    }
}

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Evaluate synchronously against a stopped target.
pub fn evaluate(session: &Session, expression: &dyn Evaluatable) -> EngineResult<String> {
    match session.state() {
        ExecutionState::Break | ExecutionState::Design => {}
        ExecutionState::Done => return Err(EngineError::NoSession),
        ExecutionState::Run | ExecutionState::Step => return Err(EngineError::NotStopped),
    }
    let gdb = session.gdb()?;
    let value = expression.evaluate(gdb.as_ref())?;
    log::debug!("{} = {}", expression.text(), value);
    Ok(value)
}

/// An evaluation running on its own thread.
pub struct EvalTask {
    result: Receiver<EngineResult<String>>,
    token: CancelToken,
}

impl EvalTask {
    pub fn spawn(session: Arc<Session>, expression: Arc<dyn Evaluatable>, token: CancelToken) -> EngineResult<Self> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let worker_token = token.clone();
        thread::Builder::new()
            .name("gdb-eval".to_string())
            .spawn(move || {
                if worker_token.is_cancelled() {
                    return;
                }
                let result = evaluate(&session, expression.as_ref());
                if worker_token.is_cancelled() {
                    log::debug!("Evaluation of '{}' cancelled", expression.text());
                    return;
                }
                if let Ok(value) = &result {
                    session.emit(EngineEvent::ExpressionEvaluated {
                        expression: expression.text().to_string(),
                        value: value.clone(),
                    });
                }
                let _ = tx.send(result);
            })
            .map_err(|e| EngineError::Unexpected(format!("failed to spawn evaluation thread: {e}")))?;
        Ok(Self { result: rx, token })
    }

    /// Wait for the result. `None` on timeout or when the task was cancelled.
    pub fn wait(&self, timeout: Duration) -> Option<EngineResult<String>> {
        if self.token.is_cancelled() {
            return None;
        }
        match self.result.recv_timeout(timeout) {
            Ok(result) if !self.token.is_cancelled() => Some(result),
            Ok(_) | Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::gdb::mock::MockGdb;

    fn session_with(gdb: Arc<MockGdb>) -> Arc<Session> {
        let session = Session::new(EngineConfig::default());
        session.start(gdb, None).unwrap();
        session.set_state(ExecutionState::Break);
        session
    }

    /// Blocks until released, so cancellation can race a pending result.
    struct Gated {
        release: Receiver<()>,
    }

    impl Evaluatable for Gated {
        fn text(&self) -> &str {
            "slow"
        }

        fn evaluate(&self, _gdb: &dyn GdbClient) -> anyhow::Result<String> {
            let _ = self.release.recv_timeout(Duration::from_secs(2));
            Ok("42".to_string())
        }
    }

    #[test]
    fn test_evaluate_trims_value() {
        let (gdb, _events) = MockGdb::new();
        gdb.script_values("x", &[" 7 "]);
        let session = session_with(gdb);
        assert_eq!(evaluate(&session, &GdbExpression::new("x")).unwrap(), "7");
    }

    #[test]
    fn test_evaluate_refused_while_running() {
        let (gdb, _events) = MockGdb::new();
        let session = session_with(gdb);
        session.set_state(ExecutionState::Run);
        assert!(matches!(evaluate(&session, &GdbExpression::new("x")), Err(EngineError::NotStopped)));
    }

    #[test]
    fn test_async_result_and_event() {
        let (gdb, _events) = MockGdb::new();
        gdb.script_values("x", &["3"]);
        let session = session_with(gdb);
        let mut rx = session.subscribe();
        let task = EvalTask::spawn(Arc::clone(&session), Arc::new(GdbExpression::new("x")), CancelToken::new()).unwrap();
        assert_eq!(task.wait(Duration::from_secs(2)).unwrap().unwrap(), "3");
        assert_eq!(
            rx.try_recv().unwrap(),
            EngineEvent::ExpressionEvaluated { expression: "x".to_string(), value: "3".to_string() }
        );
    }

    #[test]
    fn test_cancel_suppresses_result_and_event() {
        let (gdb, _events) = MockGdb::new();
        let session = session_with(gdb);
        let mut rx = session.subscribe();
        let (release, gate) = crossbeam_channel::bounded(1);
        let task = EvalTask::spawn(Arc::clone(&session), Arc::new(Gated { release: gate }), CancelToken::new()).unwrap();
        task.cancel();
        release.send(()).unwrap();
        assert!(task.wait(Duration::from_millis(200)).is_none());
        thread::sleep(Duration::from_millis(50));
        assert!(rx.try_recv().is_err());
    }
}
