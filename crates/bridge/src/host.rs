use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("unknown host operation '{0}'")]
    UnknownOp(String),
    #[error("invalid arguments for '{op}': {reason}")]
    InvalidArgs { op: String, reason: String },
    #[error("no object named '{0}'")]
    NotFound(String),
}

/// Host application surface exposed to executed code as `host`.
///
/// Only ever called from the thread that runs the main loop.
pub trait HostApi: Send {
    fn call(&mut self, op: &str, args: &Value) -> Result<Value, HostError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneObject {
    pub name: String,
    pub kind: String,
    pub location: [f64; 3],
}

/// In-memory scene standing in for a 3D application. Objects persist across
/// requests for the lifetime of the process.
#[derive(Debug, Default)]
pub struct Scene {
    objects: Vec<SceneObject>,
}

#[derive(Deserialize)]
struct AddArgs {
    kind: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    location: Option<[f64; 3]>,
}

#[derive(Deserialize)]
struct NameArgs {
    name: String,
}

#[derive(Deserialize)]
struct MoveArgs {
    name: String,
    location: [f64; 3],
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn objects(&self) -> &[SceneObject] {
        &self.objects
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&SceneObject> {
        self.objects.iter().find(|object| object.name == name)
    }

    pub fn add(&mut self, kind: &str, name: Option<&str>, location: [f64; 3]) -> &SceneObject {
        let base = match name {
            Some(name) if !name.is_empty() => name.to_owned(),
            _ => display_name(kind),
        };
        let name = self.unique_name(&base);
        self.objects.push(SceneObject {
            name,
            kind: kind.to_owned(),
            location,
        });
        let index = self.objects.len() - 1;
        &self.objects[index]
    }

    pub fn remove(&mut self, name: &str) -> Option<SceneObject> {
        let index = self.objects.iter().position(|object| object.name == name)?;
        Some(self.objects.remove(index))
    }

    pub fn clear(&mut self) -> usize {
        let removed = self.objects.len();
        self.objects.clear();
        removed
    }

    // "Cube", "Cube.001", "Cube.002", ...
    fn unique_name(&self, base: &str) -> String {
        if self.get(base).is_none() {
            return base.to_owned();
        }
        (1..)
            .map(|n| format!("{base}.{n:03}"))
            .find(|candidate| self.get(candidate).is_none())
            .unwrap_or_else(|| base.to_owned())
    }
}

impl HostApi for Scene {
    fn call(&mut self, op: &str, args: &Value) -> Result<Value, HostError> {
        match op {
            "add_object" => {
                let args: AddArgs = parse_args(op, args)?;
                let object = self.add(
                    &args.kind,
                    args.name.as_deref(),
                    args.location.unwrap_or_default(),
                );
                Ok(to_value(object))
            }
            "remove_object" => {
                let args: NameArgs = parse_args(op, args)?;
                self.remove(&args.name)
                    .map(|object| to_value(&object))
                    .ok_or(HostError::NotFound(args.name))
            }
            "move_object" => {
                let args: MoveArgs = parse_args(op, args)?;
                let object = self
                    .objects
                    .iter_mut()
                    .find(|object| object.name == args.name)
                    .ok_or_else(|| HostError::NotFound(args.name.clone()))?;
                object.location = args.location;
                Ok(to_value(object))
            }
            "get_object" => {
                let args: NameArgs = parse_args(op, args)?;
                Ok(self.get(&args.name).map(to_value).unwrap_or(Value::Null))
            }
            "list_objects" => Ok(Value::Array(self.objects.iter().map(to_value).collect())),
            "count" => Ok(json!(self.objects.len())),
            "clear" => Ok(json!(self.clear())),
            other => Err(HostError::UnknownOp(other.to_owned())),
        }
    }
}

#[derive(Deserialize)]
struct HostCall {
    op: String,
    #[serde(default)]
    args: Value,
}

/// Entry point for the interpreter's native `host` hook. Takes and returns
/// JSON text so nothing interpreter-specific crosses into the host.
pub fn dispatch_call(host: &Mutex<dyn HostApi>, payload: &str) -> String {
    let call: HostCall = match serde_json::from_str(payload) {
        Ok(call) => call,
        Err(err) => {
            let error = format!("malformed host call: {err}");
            return json!({"ok": false, "error": error}).to_string();
        }
    };
    let mut host = host
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    match host.call(&call.op, &call.args) {
        Ok(value) => json!({"ok": true, "value": value}).to_string(),
        Err(err) => json!({"ok": false, "error": err.to_string()}).to_string(),
    }
}

fn parse_args<T: for<'de> Deserialize<'de>>(op: &str, args: &Value) -> Result<T, HostError> {
    let args = if args.is_null() { json!({}) } else { args.clone() };
    serde_json::from_value(args).map_err(|err| HostError::InvalidArgs {
        op: op.to_owned(),
        reason: err.to_string(),
    })
}

fn to_value(object: &SceneObject) -> Value {
    json!({
        "name": object.name,
        "kind": object.kind,
        "location": object.location,
    })
}

fn display_name(kind: &str) -> String {
    let mut chars = kind.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => "Object".to_owned(),
    }
}
