use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::Fault;
use crate::protocol::{DebugPayload, RequestId, Response};

#[derive(Debug, Error)]
pub enum InterpreterError {
    #[error("interpreter init failed: {0}")]
    Init(String),
    #[error("interpreter runtime error: {0}")]
    Runtime(String),
    #[error("malformed execution report: {0}")]
    Report(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionSummary {
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub traceback: Option<String>,
}

impl ExceptionSummary {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            traceback: None,
        }
    }
}

/// What one run of user code produced, as reported by the interpreter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    pub result: Value,
    pub stdout: String,
    pub stderr: String,
    pub namespace: BTreeMap<String, String>,
    pub exception: Option<ExceptionSummary>,
}

/// Executes source text against the host. Implementations need not be
/// `Send`; they live on the main thread for their whole life.
pub trait Interpreter {
    /// Runs `code` in a fresh namespace. When `capture_namespace` is set the
    /// report includes a `repr` snapshot of user-defined names.
    fn run(&mut self, code: &str, capture_namespace: bool) -> Result<RunReport, InterpreterError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capture {
    pub stdout: String,
    pub stderr: String,
    pub locals: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Success {
        result: Value,
        capture: Capture,
    },
    Failure {
        exception: ExceptionSummary,
        capture: Capture,
    },
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success { .. })
    }

    pub fn capture(&self) -> &Capture {
        match self {
            ExecutionOutcome::Success { capture, .. } | ExecutionOutcome::Failure { capture, .. } => {
                capture
            }
        }
    }

    pub fn into_response(self, id: RequestId, debug: bool) -> Response {
        match self {
            ExecutionOutcome::Success { result, capture } => {
                let response = Response::success(id, result);
                if debug {
                    response.with_debug(debug_payload(capture, None))
                } else {
                    response
                }
            }
            ExecutionOutcome::Failure { exception, capture } => {
                let fault = Fault::Execution(format!("{}: {}", exception.kind, exception.message));
                let response = Response::fault(Some(id), &fault);
                if debug {
                    response.with_debug(debug_payload(capture, exception.traceback))
                } else {
                    response
                }
            }
        }
    }
}

fn debug_payload(capture: Capture, traceback: Option<String>) -> DebugPayload {
    DebugPayload {
        stdout: capture.stdout,
        stderr: capture.stderr,
        locals: capture.locals,
        traceback,
    }
}

/// Owns the interpreter on the main thread and turns every way a run can
/// end into an [`ExecutionOutcome`].
pub struct Sandbox<I> {
    interpreter: I,
    executions: u64,
}

impl<I: Interpreter> Sandbox<I> {
    pub fn new(interpreter: I) -> Self {
        Self {
            interpreter,
            executions: 0,
        }
    }

    pub fn executions(&self) -> u64 {
        self.executions
    }

    pub fn interpreter(&self) -> &I {
        &self.interpreter
    }

    pub fn run(&mut self, code: &str, debug: bool) -> ExecutionOutcome {
        self.executions += 1;
        let interpreter = &mut self.interpreter;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| interpreter.run(code, debug)));
        match outcome {
            Ok(Ok(report)) => {
                let capture = Capture {
                    stdout: report.stdout,
                    stderr: report.stderr,
                    locals: if debug { report.namespace } else { BTreeMap::new() },
                };
                match report.exception {
                    Some(exception) => {
                        debug!(kind = %exception.kind, "user code raised");
                        ExecutionOutcome::Failure { exception, capture }
                    }
                    None => ExecutionOutcome::Success {
                        result: report.result,
                        capture,
                    },
                }
            }
            Ok(Err(err)) => {
                warn!(error = %err, "interpreter failed");
                ExecutionOutcome::Failure {
                    exception: ExceptionSummary::new("InterpreterError", err.to_string()),
                    capture: Capture::default(),
                }
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(%message, "interpreter panicked");
                ExecutionOutcome::Failure {
                    exception: ExceptionSummary::new("Panic", message),
                    capture: Capture::default(),
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_owned()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "interpreter panicked".to_owned()
    }
}
