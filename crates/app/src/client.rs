use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use bridge::protocol::{Method, RequestFrame, RequestId};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Io(#[from] io::Error),
    #[error("invalid response: {0}")]
    Json(#[from] serde_json::Error),
    #[error("server closed the connection")]
    Closed,
    #[error("response id {got} does not match request id {expected}")]
    IdMismatch { expected: String, got: String },
}

/// Blocking line-delimited JSON-RPC client for the TCP front-end.
pub struct BridgeClient {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    next_id: u64,
}

impl BridgeClient {
    pub fn connect(addr: impl ToSocketAddrs, timeout: Option<Duration>) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(timeout)?;
        stream.set_nodelay(true)?;
        let writer = BufWriter::new(stream.try_clone()?);
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
            next_id: 1,
        })
    }

    pub fn describe(&mut self) -> Result<Value, ClientError> {
        let frame = RequestFrame::new(self.take_id(), Method::Describe);
        self.call(&frame)
    }

    pub fn execute(&mut self, code: &str, debug: bool) -> Result<Value, ClientError> {
        let frame = RequestFrame::execute(self.take_id(), code).with_debug(debug);
        self.call(&frame)
    }

    pub fn shutdown(&mut self) -> Result<Value, ClientError> {
        let frame = RequestFrame::new(self.take_id(), Method::Shutdown);
        self.call(&frame)
    }

    /// Sends one frame and reads one response line, checking the id echo.
    /// Returns the whole response object, error or not.
    pub fn call(&mut self, frame: &RequestFrame) -> Result<Value, ClientError> {
        let line = serde_json::to_string(frame)?;
        self.send_line(&line)?;
        let response = self.read_response()?;
        let expected = serde_json::to_value(&frame.id)?;
        if response.get("id") != Some(&expected) {
            return Err(ClientError::IdMismatch {
                expected: expected.to_string(),
                got: response
                    .get("id")
                    .map(Value::to_string)
                    .unwrap_or_else(|| "nothing".to_owned()),
            });
        }
        Ok(response)
    }

    /// Writes raw text followed by a newline. For malformed-input tests and
    /// hand-written frames.
    pub fn send_line(&mut self, line: &str) -> Result<(), ClientError> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn read_response(&mut self) -> Result<Value, ClientError> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(ClientError::Closed);
        }
        Ok(serde_json::from_str(line.trim_end())?)
    }

    fn take_id(&mut self) -> RequestId {
        let id = self.next_id;
        self.next_id += 1;
        RequestId::from(id)
    }
}
