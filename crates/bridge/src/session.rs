use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::bridge::{Bridge, Job, JobOutcome};
use crate::codec::{FrameCodec, FrameError};
use crate::error::Fault;
use crate::protocol::{Call, Request, Response, describe};
use crate::validator::{Incoming, Validator};

/// Maps validated requests onto behaviour. Cheap to clone; every transport
/// shares one.
#[derive(Clone)]
pub struct Dispatcher {
    validator: Arc<Validator>,
    bridge: Bridge,
    request_timeout: Duration,
}

impl Dispatcher {
    pub fn new(validator: Validator, bridge: Bridge, request_timeout: Duration) -> Self {
        Self {
            validator: Arc::new(validator),
            bridge,
            request_timeout,
        }
    }

    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    pub async fn dispatch_frame(&self, frame: Result<String, FrameError>) -> Option<Response> {
        match frame {
            Ok(text) => self.dispatch_text(&text).await,
            Err(err) => Some(Response::fault(None, &Fault::Parse(err.to_string()))),
        }
    }

    /// `None` means the frame was a notification and nothing is sent back.
    pub async fn dispatch_text(&self, raw: &str) -> Option<Response> {
        match self.validator.validate(raw) {
            Ok(Incoming::Request(request)) => Some(self.dispatch(request).await),
            Ok(Incoming::Notification) => {
                debug!("notification ignored");
                None
            }
            Err(fault) => {
                debug!(code = fault.fault.code(), "rejected request: {}", fault.fault);
                Some(fault.into_response())
            }
        }
    }

    pub async fn dispatch(&self, request: Request) -> Response {
        let Request { id, call, debug } = request;
        let method = call.method().as_str();
        if !self.bridge.is_accepting() {
            return Response::fault(Some(id), &Fault::ServerShuttingDown);
        }
        debug!(%id, method, "dispatching");
        let job = match call {
            Call::Describe => return Response::success(id, describe()),
            Call::Execute { code } => Job::Execute { code, debug },
            Call::Shutdown => Job::Shutdown,
        };
        match self
            .bridge
            .submit(id.clone(), job, self.request_timeout)
            .await
        {
            Ok(JobOutcome::Executed(outcome)) => outcome.into_response(id, debug),
            Ok(JobOutcome::ShutdownAccepted) => {
                info!(%id, "shutdown requested");
                Response::success(id, json!({ "shutdown": true }))
            }
            Ok(JobOutcome::Cancelled) => Response::fault(Some(id), &Fault::ServerShuttingDown),
            Err(fault) => Response::fault(Some(id), &fault),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    WebSocket,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::WebSocket => "ws",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Busy,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: Uuid,
    pub transport: Transport,
    pub peer: Option<SocketAddr>,
    pub opened_at: Instant,
    pub requests: u64,
}

/// Open stream connections, capped at `max_connections`.
#[derive(Clone)]
pub struct SessionRegistry {
    connections: Arc<Mutex<HashMap<Uuid, ConnectionInfo>>>,
    max_connections: usize,
}

impl SessionRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Arc::new(Mutex::new(HashMap::new())),
            max_connections: max_connections.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, ConnectionInfo>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn open(
        &self,
        transport: Transport,
        peer: Option<SocketAddr>,
    ) -> Result<ConnectionLease, Fault> {
        let mut connections = self.lock();
        if connections.len() >= self.max_connections {
            return Err(Fault::ServerBusy(format!(
                "connection limit of {} reached",
                self.max_connections
            )));
        }
        let id = Uuid::new_v4();
        connections.insert(
            id,
            ConnectionInfo {
                id,
                transport,
                peer,
                opened_at: Instant::now(),
                requests: 0,
            },
        );
        info!(%id, transport = transport.as_str(), ?peer, open = connections.len(), "connection opened");
        Ok(ConnectionLease {
            id,
            registry: self.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.lock().values().cloned().collect()
    }

    fn record(&self, id: Uuid) {
        if let Some(info) = self.lock().get_mut(&id) {
            info.requests += 1;
        }
    }

    fn release(&self, id: Uuid) {
        if let Some(info) = self.lock().remove(&id) {
            info!(
                %id,
                transport = info.transport.as_str(),
                requests = info.requests,
                elapsed_ms = info.opened_at.elapsed().as_millis() as u64,
                "connection closed"
            );
        }
    }
}

/// Registry slot for one connection; released on drop.
pub struct ConnectionLease {
    id: Uuid,
    registry: SessionRegistry,
}

impl ConnectionLease {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.registry.release(self.id);
    }
}

/// One stream connection. Frames are answered strictly in order: request
/// N+1 is not read until request N has its response.
pub struct Session {
    codec: FrameCodec,
    dispatcher: Dispatcher,
    lease: Option<ConnectionLease>,
    state: SessionState,
}

impl Session {
    pub fn new(dispatcher: Dispatcher, lease: ConnectionLease, max_frame_bytes: usize) -> Self {
        Self {
            codec: FrameCodec::new(max_frame_bytes),
            dispatcher,
            lease: Some(lease),
            state: SessionState::Idle,
        }
    }

    pub fn id(&self) -> Option<Uuid> {
        self.lease.as_ref().map(ConnectionLease::id)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn push(&mut self, bytes: &[u8]) {
        if self.state != SessionState::Closed {
            self.codec.push(bytes);
        }
    }

    /// Feeds one message-oriented payload; its last line need not end in a
    /// newline.
    pub fn push_message(&mut self, text: &str) {
        self.push(text.as_bytes());
        self.codec.finish();
    }

    /// Marks end of input so an unterminated last line is still answered.
    pub fn finish(&mut self) {
        self.codec.finish();
    }

    /// Answers buffered frames until one produces a response. Notifications
    /// are consumed silently.
    pub async fn next_response(&mut self) -> Option<Response> {
        while self.state != SessionState::Closed {
            let frame = self.codec.next_frame()?;
            self.state = SessionState::Busy;
            let response = self.dispatcher.dispatch_frame(frame).await;
            if let Some(lease) = &self.lease {
                lease.registry.record(lease.id);
            }
            self.state = SessionState::Idle;
            if response.is_some() {
                return response;
            }
        }
        None
    }

    pub fn close(&mut self) {
        self.state = SessionState::Closed;
        self.lease = None;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
