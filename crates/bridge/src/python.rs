use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use rustpython_pylib;
use rustpython_stdlib;
use rustpython_vm as vm;
use rustpython_vm::builtins::PyBaseException;
use rustpython_vm::scope::Scope;
use rustpython_vm::{Interpreter as VmInterpreter, InterpreterBuilder};
use serde::Deserialize;
use tracing::debug;

use crate::host::{HostApi, dispatch_call};
use crate::sandbox::{ExceptionSummary, Interpreter, InterpreterError, RunReport};

const REPR_LIMIT: usize = 1000;

const INIT_SEGMENTS: [(&str, &str); 4] = [
    (
        "imports",
        r#"import builtins as _bridge_builtins
import io as _bridge_io
import json as _bridge_json
import sys as _bridge_sys
try:
    import traceback as _bridge_traceback
except Exception:
    _bridge_traceback = None
"#,
    ),
    (
        "host",
        r#"class _BridgeHost:
    def _call(self, op, **args):
        reply = _bridge_json.loads(_bridge_host_call(_bridge_json.dumps({"op": op, "args": args})))
        if not reply["ok"]:
            raise RuntimeError(reply["error"])
        return reply.get("value")

    def add_object(self, kind, name=None, location=(0.0, 0.0, 0.0)):
        return self._call("add_object", kind=kind, name=name, location=[float(v) for v in location])

    def remove_object(self, name):
        return self._call("remove_object", name=name)

    def move_object(self, name, location):
        return self._call("move_object", name=name, location=[float(v) for v in location])

    def get_object(self, name):
        return self._call("get_object", name=name)

    def list_objects(self):
        return self._call("list_objects")

    def count(self):
        return self._call("count")

    def clear(self):
        return self._call("clear")

    def __repr__(self):
        return "<host>"

host = _BridgeHost()
_bridge_sys.modules["host"] = host
"#,
    ),
    (
        "helpers",
        r#"def _bridge_repr(value):
    try:
        text = repr(value)
    except Exception:
        text = "<unrepresentable %s>" % type(value).__name__
    if len(text) > __REPR_LIMIT__:
        text = text[:__REPR_LIMIT__] + "..."
    return text

def _bridge_format(exc):
    if _bridge_traceback is None:
        return None
    try:
        return "".join(_bridge_traceback.format_exception(type(exc), exc, exc.__traceback__))
    except Exception:
        return None
"#,
    ),
    (
        "run",
        r#"def _bridge_run(code, capture_namespace):
    namespace = {"__builtins__": _bridge_builtins, "__name__": "__bridge__", "host": host}
    stdout = _bridge_io.StringIO()
    stderr = _bridge_io.StringIO()
    saved_stdout = _bridge_sys.stdout
    saved_stderr = _bridge_sys.stderr
    result_json = "null"
    exception = None
    _bridge_sys.stdout = stdout
    _bridge_sys.stderr = stderr
    try:
        try:
            exec(compile(code, "<execute>", "exec"), namespace)
            if "result" in namespace:
                result_json = _bridge_json.dumps(namespace["result"], allow_nan=False)
        except BaseException as exc:
            exception = {
                "kind": type(exc).__name__,
                "message": str(exc),
                "traceback": _bridge_format(exc),
            }
    finally:
        _bridge_sys.stdout = saved_stdout
        _bridge_sys.stderr = saved_stderr
    snapshot = {}
    if capture_namespace:
        for name, value in namespace.items():
            if name.startswith("__") or name == "host":
                continue
            snapshot[name] = _bridge_repr(value)
    return _bridge_json.dumps({
        "result_json": result_json,
        "stdout": stdout.getvalue(),
        "stderr": stderr.getvalue(),
        "namespace": snapshot,
        "exception": exception,
    })
"#,
    ),
];

#[derive(Debug, Deserialize)]
struct PyReport {
    result_json: String,
    stdout: String,
    stderr: String,
    #[serde(default)]
    namespace: BTreeMap<String, String>,
    exception: Option<ExceptionSummary>,
}

/// Embedded RustPython interpreter with the `host` scene API bound in.
///
/// Every call to [`Interpreter::run`] executes in a brand-new namespace, so
/// user variables never leak between requests. Scene state lives in the host
/// and does persist.
pub struct PythonInterpreter {
    interpreter: VmInterpreter,
    scope: Scope,
}

impl PythonInterpreter {
    pub fn new(host: Arc<Mutex<dyn HostApi>>) -> Result<Self, InterpreterError> {
        let interpreter = init_stdlib(InterpreterBuilder::new()).interpreter();
        let scope = interpreter
            .enter(|vm: &vm::VirtualMachine| -> vm::PyResult<Scope> {
                let scope = vm.new_scope_with_builtins();
                let host_fn = vm.new_function(
                    "_bridge_host_call",
                    move |payload: String| -> vm::PyResult<String> {
                        Ok(dispatch_call(&host, &payload))
                    },
                );
                scope
                    .globals
                    .set_item("_bridge_host_call", host_fn.into(), vm)?;
                for (label, code) in INIT_SEGMENTS {
                    let code = code.replace("__REPR_LIMIT__", &REPR_LIMIT.to_string());
                    vm.run_string(scope.clone(), &code, &format!("<bridge_init_{label}>"))?;
                }
                Ok(scope)
            })
            .map_err(|err: vm::PyRef<PyBaseException>| {
                InterpreterError::Init(format!("{err:?}"))
            })?;
        debug!("python interpreter ready");
        Ok(Self { interpreter, scope })
    }
}

impl Interpreter for PythonInterpreter {
    fn run(&mut self, code: &str, capture_namespace: bool) -> Result<RunReport, InterpreterError> {
        let scope = self.scope.clone();
        let raw = self
            .interpreter
            .enter(|vm: &vm::VirtualMachine| -> vm::PyResult<String> {
                scope
                    .globals
                    .set_item("_bridge_code", vm.ctx.new_str(code).into(), vm)?;
                let call = if capture_namespace {
                    "_bridge_report = _bridge_run(_bridge_code, True)\n"
                } else {
                    "_bridge_report = _bridge_run(_bridge_code, False)\n"
                };
                vm.run_string(scope.clone(), call, "<bridge_run>")?;
                Ok(get_string_from_scope(vm, &scope, "_bridge_report"))
            })
            .map_err(|err: vm::PyRef<PyBaseException>| {
                InterpreterError::Runtime(format!("{err:?}"))
            })?;

        let report: PyReport = serde_json::from_str(&raw)?;
        let result = serde_json::from_str(&report.result_json)?;
        Ok(RunReport {
            result,
            stdout: report.stdout,
            stderr: report.stderr,
            namespace: report.namespace,
            exception: report.exception,
        })
    }
}

fn init_stdlib(builder: InterpreterBuilder) -> InterpreterBuilder {
    let defs = rustpython_stdlib::stdlib_module_defs(&builder.ctx);
    builder
        .add_native_modules(&defs)
        .add_frozen_modules(rustpython_pylib::FROZEN_STDLIB)
        .init_hook(set_frozen_stdlib_dir)
}

fn set_frozen_stdlib_dir(vm: &mut vm::VirtualMachine) {
    use rustpython_vm::common::rc::PyRc;

    if let Some(state) = PyRc::get_mut(&mut vm.state) {
        state.config.paths.stdlib_dir = Some(rustpython_pylib::LIB_PATH.to_owned());
    }
}

fn get_string_from_scope(vm: &vm::VirtualMachine, scope: &Scope, name: &str) -> String {
    scope
        .globals
        .get_item(name, vm)
        .ok()
        .and_then(|value| value.try_to_value::<String>(vm).ok())
        .unwrap_or_default()
}
