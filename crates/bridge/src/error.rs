use std::time::Duration;

use thiserror::Error;

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const EXECUTION_ERROR: i64 = -32000;
pub const FORBIDDEN: i64 = -32001;
pub const SERVER_BUSY: i64 = -32002;
pub const SERVER_SHUTTING_DOWN: i64 = -32003;
pub const TIMEOUT: i64 = -32004;

/// Every failure a client can observe. Each variant maps to one stable
/// JSON-RPC error code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Fault {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("method not found: {0}")]
    MethodNotFound(String),
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("{0}")]
    Execution(String),
    #[error("server busy: {0}")]
    ServerBusy(String),
    #[error("server is shutting down")]
    ServerShuttingDown,
    #[error("timed out after {}ms waiting for the host", .0.as_millis())]
    Timeout(Duration),
    #[error("internal error: {0}")]
    Internal(String),
}

impl Fault {
    pub fn code(&self) -> i64 {
        match self {
            Fault::Parse(_) => PARSE_ERROR,
            Fault::InvalidRequest(_) => INVALID_REQUEST,
            Fault::MethodNotFound(_) => METHOD_NOT_FOUND,
            Fault::InvalidParams(_) => INVALID_PARAMS,
            Fault::Forbidden(_) => FORBIDDEN,
            Fault::Execution(_) => EXECUTION_ERROR,
            Fault::ServerBusy(_) => SERVER_BUSY,
            Fault::ServerShuttingDown => SERVER_SHUTTING_DOWN,
            Fault::Timeout(_) => TIMEOUT,
            Fault::Internal(_) => INTERNAL_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_distinct() {
        let faults = [
            Fault::Parse(String::new()),
            Fault::InvalidRequest(String::new()),
            Fault::MethodNotFound(String::new()),
            Fault::InvalidParams(String::new()),
            Fault::Forbidden(String::new()),
            Fault::Execution(String::new()),
            Fault::ServerBusy(String::new()),
            Fault::ServerShuttingDown,
            Fault::Timeout(Duration::from_millis(5)),
            Fault::Internal(String::new()),
        ];
        let mut codes: Vec<i64> = faults.iter().map(Fault::code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), faults.len());
    }

    #[test]
    fn timeout_message_reports_millis() {
        let fault = Fault::Timeout(Duration::from_millis(1500));
        assert_eq!(fault.to_string(), "timed out after 1500ms waiting for the host");
    }
}
