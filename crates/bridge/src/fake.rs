//! Scripted stand-in for the Python interpreter, for tests that exercise the
//! bridge and transports without embedding a VM.
//!
//! Each line of "code" is one command:
//!
//! * `result = <json>` or `result = <int> + <int> ...`
//! * `print <text>` / `eprint <text>`
//! * `let <name> = <text>`
//! * `raise <Kind>: <message>`
//! * `sleep <millis>`
//! * `mark <label>` appends to the shared probe log
//! * `panic`
//!
//! Anything else is ignored.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use serde_json::Value;

use crate::sandbox::{ExceptionSummary, Interpreter, InterpreterError, RunReport};

#[derive(Debug, Default)]
pub struct ExecutionProbe {
    pub entered: AtomicUsize,
    pub max_concurrent: AtomicUsize,
    pub executions: AtomicUsize,
    log: Mutex<Vec<String>>,
}

impl ExecutionProbe {
    pub fn log(&self) -> Vec<String> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        let now = self.entered.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);
        self.executions.fetch_add(1, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.entered.fetch_sub(1, Ordering::SeqCst);
    }

    fn mark(&self, label: &str) {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(label.to_owned());
    }
}

#[derive(Debug, Default)]
pub struct ScriptedInterpreter {
    probe: Arc<ExecutionProbe>,
}

struct ExitOnDrop<'a>(&'a ExecutionProbe);

impl Drop for ExitOnDrop<'_> {
    fn drop(&mut self) {
        self.0.exit();
    }
}

impl ScriptedInterpreter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn probe(&self) -> Arc<ExecutionProbe> {
        self.probe.clone()
    }

    /// A second interpreter reporting into the same probe.
    pub fn sharing_probe(&self) -> Self {
        Self {
            probe: self.probe.clone(),
        }
    }
}

impl Interpreter for ScriptedInterpreter {
    fn run(&mut self, code: &str, capture_namespace: bool) -> Result<RunReport, InterpreterError> {
        self.probe.enter();
        let _exit = ExitOnDrop(&self.probe);
        let mut report = RunReport::default();
        let mut namespace = BTreeMap::new();

        for line in code.lines().map(str::trim) {
            if line == "panic" {
                panic!("scripted panic");
            } else if let Some(expr) = line.strip_prefix("result = ") {
                match evaluate(expr) {
                    Some(value) => {
                        namespace.insert("result".to_owned(), value.to_string());
                        report.result = value;
                    }
                    None => {
                        report.exception = Some(ExceptionSummary::new(
                            "SyntaxError",
                            format!("cannot evaluate {expr:?}"),
                        ));
                        break;
                    }
                }
            } else if let Some(text) = line.strip_prefix("print ") {
                report.stdout.push_str(text);
                report.stdout.push('\n');
            } else if let Some(text) = line.strip_prefix("eprint ") {
                report.stderr.push_str(text);
                report.stderr.push('\n');
            } else if let Some(binding) = line.strip_prefix("let ") {
                if let Some((name, value)) = binding.split_once('=') {
                    namespace.insert(name.trim().to_owned(), format!("{:?}", value.trim()));
                }
            } else if let Some(raised) = line.strip_prefix("raise ") {
                let (kind, message) = raised.split_once(':').unwrap_or((raised, ""));
                report.exception = Some(ExceptionSummary {
                    kind: kind.trim().to_owned(),
                    message: message.trim().to_owned(),
                    traceback: Some(format!(
                        "Traceback (most recent call last):\n  File \"<execute>\"\n{}",
                        raised.trim()
                    )),
                });
                break;
            } else if let Some(millis) = line.strip_prefix("sleep ") {
                let millis = millis.trim().parse().unwrap_or(0);
                thread::sleep(Duration::from_millis(millis));
            } else if let Some(label) = line.strip_prefix("mark ") {
                self.probe.mark(label.trim());
            }
        }

        if report.exception.is_some() {
            report.result = Value::Null;
        }
        if capture_namespace {
            report.namespace = namespace;
        }
        Ok(report)
    }
}

fn evaluate(expr: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str(expr) {
        return Some(value);
    }
    let mut total: i64 = 0;
    for term in expr.split('+') {
        total = total.checked_add(term.trim().parse().ok()?)?;
    }
    Some(total.into())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn scripts_drive_the_report() {
        let mut interpreter = ScriptedInterpreter::new();
        let report = interpreter
            .run("print hi\neprint careful\nlet x = 5\nresult = 2+2", true)
            .expect("run");
        assert_eq!(report.result, json!(4));
        assert_eq!(report.stdout, "hi\n");
        assert_eq!(report.stderr, "careful\n");
        assert_eq!(report.namespace.get("x").map(String::as_str), Some("\"5\""));

        let report = interpreter
            .run("result = {\"a\": 1}\nraise ValueError: nope", false)
            .expect("run");
        assert_eq!(report.result, Value::Null);
        let exception = report.exception.expect("raised");
        assert_eq!((exception.kind.as_str(), exception.message.as_str()), ("ValueError", "nope"));
        assert!(report.namespace.is_empty());
        assert_eq!(interpreter.probe().executions(), 2);
    }
}
