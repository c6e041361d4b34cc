pub mod client;
pub mod http;
pub mod logging;
pub mod server;
pub mod tcp;
pub mod ws;

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bridge::config::BridgeConfig;
use bridge::session::{Dispatcher, Session, SessionRegistry, Transport};
use bridge::{Bridge, Fault};

/// State shared by every transport front-end.
#[derive(Clone)]
pub struct ServerContext {
    pub dispatcher: Dispatcher,
    pub registry: SessionRegistry,
    pub max_frame_bytes: usize,
}

impl ServerContext {
    pub fn new(dispatcher: Dispatcher, config: &BridgeConfig) -> Self {
        Self {
            dispatcher,
            registry: SessionRegistry::new(config.max_connections),
            max_frame_bytes: config.max_frame_bytes,
        }
    }

    pub fn bridge(&self) -> &Bridge {
        self.dispatcher.bridge()
    }

    pub fn open_session(
        &self,
        transport: Transport,
        peer: Option<SocketAddr>,
    ) -> Result<Session, Fault> {
        let lease = self.registry.open(transport, peer)?;
        Ok(Session::new(
            self.dispatcher.clone(),
            lease,
            self.max_frame_bytes,
        ))
    }

    /// Waits up to `grace` for open connections to close. Returns whether
    /// every connection went away in time.
    pub async fn wait_for_sessions(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        while !self.registry.is_empty() {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        true
    }
}
