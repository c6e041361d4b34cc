use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value, json};

use crate::error::Fault;

pub const JSONRPC_VERSION: &str = "2.0";
pub const SERVER_NAME: &str = "host-rpc";

/// Caller-chosen correlation token, echoed back verbatim. Numbers keep their
/// original representation so `1` and `1.0` stay distinct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(Number),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(number) => write!(f, "{number}"),
            RequestId::String(text) => write!(f, "{text:?}"),
        }
    }
}

impl From<u64> for RequestId {
    fn from(value: u64) -> Self {
        Self::Number(value.into())
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Describe,
    Execute,
    Shutdown,
}

impl Method {
    pub const ALL: [Method; 3] = [Method::Describe, Method::Execute, Method::Shutdown];

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Describe => "describe",
            Method::Execute => "execute",
            Method::Shutdown => "shutdown",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|method| method.as_str() == name)
    }
}

/// Method-specific payload of a validated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Describe,
    Execute { code: String },
    Shutdown,
}

impl Call {
    pub fn method(&self) -> Method {
        match self {
            Call::Describe => Method::Describe,
            Call::Execute { .. } => Method::Execute,
            Call::Shutdown => Method::Shutdown,
        }
    }
}

/// A request that passed validation. Consumed exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub id: RequestId,
    pub call: Call,
    pub debug: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl From<&Fault> for RpcError {
    fn from(fault: &Fault) -> Self {
        Self {
            code: fault.code(),
            message: fault.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseBody {
    Result(Value),
    Error(RpcError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugPayload {
    pub stdout: String,
    pub stderr: String,
    pub locals: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

/// Outgoing only; clients read replies as plain JSON values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    #[serde(flatten)]
    pub body: ResponseBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<DebugPayload>,
}

impl Response {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id: Some(id),
            body: ResponseBody::Result(result),
            debug: None,
        }
    }

    pub fn fault(id: Option<RequestId>, fault: &Fault) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id,
            body: ResponseBody::Error(fault.into()),
            debug: None,
        }
    }

    pub fn with_debug(mut self, debug: DebugPayload) -> Self {
        self.debug = Some(debug);
        self
    }

    pub fn result(&self) -> Option<&Value> {
        match &self.body {
            ResponseBody::Result(value) => Some(value),
            ResponseBody::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&RpcError> {
        match &self.body {
            ResponseBody::Result(_) => None,
            ResponseBody::Error(error) => Some(error),
        }
    }
}

/// Outgoing request line, as written by clients.
#[derive(Debug, Clone, Serialize)]
pub struct RequestFrame {
    pub jsonrpc: &'static str,
    pub id: RequestId,
    pub method: Method,
    pub params: Value,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub debug: bool,
}

impl RequestFrame {
    pub fn new(id: impl Into<RequestId>, method: Method) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id: id.into(),
            method,
            params: json!({}),
            debug: false,
        }
    }

    pub fn execute(id: impl Into<RequestId>, code: impl Into<String>) -> Self {
        let mut frame = Self::new(id, Method::Execute);
        frame.params = json!({ "code": code.into() });
        frame
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

/// Capability listing returned by `describe`.
pub fn describe() -> Value {
    json!({
        "name": SERVER_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": "JSON-RPC 2.0",
        "methods": [
            {
                "name": Method::Describe.as_str(),
                "description": "List the methods this server supports and their parameters.",
                "params": {},
                "returns": "object",
            },
            {
                "name": Method::Execute.as_str(),
                "description": "Run Python code on the host's main thread with access to the `host` scene API. Assign `result = ...` to return a value.",
                "params": { "code": "string" },
                "options": { "debug": "boolean (top-level) - include stdout, stderr, and locals" },
                "returns": "any JSON-serialisable value, or null",
            },
            {
                "name": Method::Shutdown.as_str(),
                "description": "Stop accepting work and close the listening transports.",
                "params": {},
                "returns": "object",
            },
        ],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FORBIDDEN;

    #[test]
    fn success_serializes_result_even_when_null() {
        let response = Response::success(RequestId::from(7), Value::Null);
        let value = serde_json::to_value(&response).expect("serialize");
        assert_eq!(value, json!({"jsonrpc": "2.0", "id": 7, "result": null}));
    }

    #[test]
    fn fault_without_id_serializes_null_id_and_no_result() {
        let response = Response::fault(None, &Fault::Parse("bad".to_owned()));
        let value = serde_json::to_value(&response).expect("serialize");
        assert_eq!(value["id"], Value::Null);
        assert_eq!(value["error"]["code"], json!(-32700));
        assert!(value.get("result").is_none());
        assert!(value.get("debug").is_none());
    }

    #[test]
    fn numeric_ids_keep_their_representation() {
        let float_id: RequestId = serde_json::from_str("1.0").expect("float id");
        let int_id: RequestId = serde_json::from_str("1").expect("int id");
        assert_ne!(float_id, int_id);
        let response = Response::success(float_id, json!(true));
        let text = serde_json::to_string(&response).expect("serialize");
        assert!(text.contains("\"id\":1.0"), "{text}");
    }

    #[test]
    fn big_integer_results_are_not_rounded() {
        let result: Value = serde_json::from_str("100000000000000000000").expect("big int");
        let response = Response::success(RequestId::from(1), result);
        assert_eq!(
            serde_json::to_string(&response).expect("serialize"),
            r#"{"jsonrpc":"2.0","id":1,"result":100000000000000000000}"#
        );
    }

    #[test]
    fn debug_payload_rides_along_with_errors() {
        let response = Response::fault(
            Some(RequestId::from("abc")),
            &Fault::Forbidden("import of 'os' is not allowed".to_owned()),
        )
        .with_debug(DebugPayload {
            stdout: "hi\n".to_owned(),
            ..DebugPayload::default()
        });
        let value = serde_json::to_value(&response).expect("serialize");
        assert_eq!(value["error"]["code"], json!(FORBIDDEN));
        assert_eq!(value["debug"]["stdout"], json!("hi\n"));
        assert!(value["debug"].get("traceback").is_none());
    }

    #[test]
    fn describe_lists_exactly_the_supported_methods() {
        let described = describe();
        let names: Vec<&str> = described["methods"]
            .as_array()
            .expect("methods array")
            .iter()
            .filter_map(|method| method["name"].as_str())
            .collect();
        assert_eq!(names, ["describe", "execute", "shutdown"]);
        for name in names {
            assert!(Method::from_name(name).is_some());
        }
    }

    #[test]
    fn request_frame_omits_debug_unless_set() {
        let plain = serde_json::to_value(RequestFrame::execute(1, "result = 1")).expect("plain");
        assert!(plain.get("debug").is_none());
        assert_eq!(plain["method"], json!("execute"));
        assert_eq!(plain["params"]["code"], json!("result = 1"));

        let debug = serde_json::to_value(RequestFrame::execute(2, "x").with_debug(true))
            .expect("debug");
        assert_eq!(debug["debug"], json!(true));
    }
}
