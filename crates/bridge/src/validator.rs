use serde_json::{Map, Value};

use crate::error::Fault;
use crate::policy::WhitelistPolicy;
use crate::protocol::{Call, JSONRPC_VERSION, Method, Request, RequestId, Response};

/// A frame that failed validation, with whatever id could be recovered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationFault {
    pub id: Option<RequestId>,
    pub fault: Fault,
}

impl ValidationFault {
    fn new(id: Option<RequestId>, fault: Fault) -> Self {
        Self { id, fault }
    }

    pub fn into_response(self) -> Response {
        Response::fault(self.id, &self.fault)
    }
}

/// A frame that passed the shape checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Request(Request),
    /// An object with no `id` member. It gets no reply and does not run.
    Notification,
}

#[derive(Debug, Clone)]
pub struct Validator {
    policy: WhitelistPolicy,
}

impl Validator {
    pub fn new(policy: WhitelistPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &WhitelistPolicy {
        &self.policy
    }

    pub fn validate(&self, raw: &str) -> Result<Incoming, ValidationFault> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|err| ValidationFault::new(None, Fault::Parse(err.to_string())))?;
        let Value::Object(object) = value else {
            return Err(ValidationFault::new(
                None,
                Fault::InvalidRequest("request must be a JSON object".to_owned()),
            ));
        };
        if !object.contains_key("id") {
            return Ok(Incoming::Notification);
        }
        let id = request_id(&object)?;
        let fail = |fault: Fault| ValidationFault::new(Some(id.clone()), fault);

        match object.get("jsonrpc") {
            Some(Value::String(version)) if version == JSONRPC_VERSION => {}
            _ => {
                return Err(fail(Fault::InvalidRequest(
                    "jsonrpc must be \"2.0\"".to_owned(),
                )));
            }
        }

        let method = match object.get("method") {
            Some(Value::String(name)) => Method::from_name(name)
                .ok_or_else(|| fail(Fault::MethodNotFound(name.clone())))?,
            Some(_) => {
                return Err(fail(Fault::InvalidRequest(
                    "method must be a string".to_owned(),
                )));
            }
            None => return Err(fail(Fault::InvalidRequest("missing method".to_owned()))),
        };

        let params = match object.get("params") {
            None | Some(Value::Null) => None,
            Some(Value::Object(params)) => Some(params),
            Some(_) => {
                return Err(fail(Fault::InvalidParams(
                    "params must be an object".to_owned(),
                )));
            }
        };

        let debug = match object.get("debug") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(flag)) => *flag,
            Some(_) => {
                return Err(fail(Fault::InvalidParams(
                    "debug must be a boolean".to_owned(),
                )));
            }
        };

        let call = match method {
            Method::Describe => Call::Describe,
            Method::Shutdown => Call::Shutdown,
            Method::Execute => {
                let code = match params.and_then(|params| params.get("code")) {
                    Some(Value::String(code)) => code.clone(),
                    Some(_) => {
                        return Err(fail(Fault::InvalidParams(
                            "params.code must be a string".to_owned(),
                        )));
                    }
                    None => {
                        return Err(fail(Fault::InvalidParams(
                            "missing params.code".to_owned(),
                        )));
                    }
                };
                self.policy
                    .check(&code)
                    .map_err(|violation| fail(Fault::Forbidden(violation.to_string())))?;
                Call::Execute { code }
            }
        };

        Ok(Incoming::Request(Request { id, call, debug }))
    }
}

fn request_id(object: &Map<String, Value>) -> Result<RequestId, ValidationFault> {
    match object.get("id") {
        Some(Value::Number(number)) => Ok(RequestId::Number(number.clone())),
        Some(Value::String(text)) => Ok(RequestId::String(text.clone())),
        _ => Err(ValidationFault::new(
            None,
            Fault::InvalidRequest("id must be a string or number".to_owned()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{
        FORBIDDEN, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR,
    };

    fn validator() -> Validator {
        Validator::new(WhitelistPolicy::standard().expect("policy"))
    }

    fn request(raw: &str) -> Request {
        match validator().validate(raw).expect("valid") {
            Incoming::Request(request) => request,
            Incoming::Notification => panic!("unexpected notification: {raw}"),
        }
    }

    fn code_of(raw: &str) -> (Option<RequestId>, i64) {
        let fault = validator().validate(raw).expect_err("should fail");
        (fault.id, fault.fault.code())
    }

    #[test]
    fn accepts_execute_with_debug() {
        let request = request(
            r#"{"jsonrpc":"2.0","id":1,"method":"execute","params":{"code":"result = 2+2"},"debug":true}"#,
        );
        assert_eq!(request.id, RequestId::from(1));
        assert_eq!(
            request.call,
            Call::Execute {
                code: "result = 2+2".to_owned()
            }
        );
        assert!(request.debug);
    }

    #[test]
    fn describe_and_shutdown_need_no_params() {
        let describe = request(r#"{"jsonrpc":"2.0","id":"a","method":"describe"}"#);
        assert_eq!(describe.call, Call::Describe);
        let shutdown = request(r#"{"jsonrpc":"2.0","id":"b","method":"shutdown","params":{}}"#);
        assert_eq!(shutdown.call, Call::Shutdown);
        assert!(!shutdown.debug);
    }

    #[test]
    fn garbage_is_a_parse_fault_with_null_id() {
        assert_eq!(code_of("not json"), (None, PARSE_ERROR));
        assert_eq!(code_of("{\"jsonrpc\":"), (None, PARSE_ERROR));
    }

    #[test]
    fn shape_errors_before_id_have_null_id() {
        assert_eq!(code_of("[1,2]"), (None, INVALID_REQUEST));
        assert_eq!(
            code_of(r#"{"jsonrpc":"2.0","id":null,"method":"describe"}"#),
            (None, INVALID_REQUEST)
        );
        assert_eq!(
            code_of(r#"{"jsonrpc":"2.0","id":[1],"method":"describe"}"#),
            (None, INVALID_REQUEST)
        );
    }

    #[test]
    fn errors_after_id_echo_it() {
        let id = Some(RequestId::from(9));
        assert_eq!(
            code_of(r#"{"jsonrpc":"1.0","id":9,"method":"describe"}"#),
            (id.clone(), INVALID_REQUEST)
        );
        assert_eq!(
            code_of(r#"{"jsonrpc":"2.0","id":9,"method":"initialize"}"#),
            (id.clone(), METHOD_NOT_FOUND)
        );
        assert_eq!(
            code_of(r#"{"jsonrpc":"2.0","id":9,"method":"execute","params":[]}"#),
            (id.clone(), INVALID_PARAMS)
        );
        assert_eq!(
            code_of(r#"{"jsonrpc":"2.0","id":9,"method":"execute","params":{"code":5}}"#),
            (id.clone(), INVALID_PARAMS)
        );
        assert_eq!(
            code_of(r#"{"jsonrpc":"2.0","id":9,"method":"execute","params":{}}"#),
            (id.clone(), INVALID_PARAMS)
        );
        assert_eq!(
            code_of(r#"{"jsonrpc":"2.0","id":9,"method":"describe","debug":"yes"}"#),
            (id, INVALID_PARAMS)
        );
    }

    #[test]
    fn objects_without_id_are_notifications() {
        let v = validator();
        for raw in [
            r#"{"jsonrpc":"2.0","method":"describe"}"#,
            r#"{"jsonrpc":"2.0","method":"execute","params":{"code":"result = 1"}}"#,
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            r#"{"method":"execute","params":{"code":"import os"}}"#,
        ] {
            assert_eq!(v.validate(raw), Ok(Incoming::Notification), "{raw}");
        }
    }

    #[test]
    fn whitelist_violation_is_forbidden() {
        let fault = validator()
            .validate(r#"{"jsonrpc":"2.0","id":"x","method":"execute","params":{"code":"import os"}}"#)
            .expect_err("forbidden");
        assert_eq!(fault.fault.code(), FORBIDDEN);
        assert_eq!(fault.id, Some(RequestId::from("x")));
        assert!(fault.fault.to_string().contains("'os'"));
    }

    #[test]
    fn into_response_carries_code_and_id() {
        let response = validator()
            .validate(r#"{"jsonrpc":"2.0","id":3,"method":"nope"}"#)
            .expect_err("unknown")
            .into_response();
        let error = response.error().expect("error body");
        assert_eq!(error.code, METHOD_NOT_FOUND);
        assert_eq!(response.id, Some(RequestId::from(3)));
    }
}
