use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::http::{self, HttpOptions};
use crate::{ServerContext, tcp, ws};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_TCP_PORT: u16 = 8765;
pub const DEFAULT_WS_PORT: u16 = 8766;
pub const DEFAULT_HTTP_PORT: u16 = 8767;
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Which front-ends to start and where. `None` leaves a transport off.
#[derive(Debug, Clone, Default)]
pub struct ListenPlan {
    pub tcp: Option<SocketAddr>,
    pub ws: Option<SocketAddr>,
    pub http: Option<SocketAddr>,
}

impl ListenPlan {
    pub fn all(host: IpAddr, tcp_port: u16, ws_port: u16, http_port: u16) -> Self {
        Self {
            tcp: Some(SocketAddr::new(host, tcp_port)),
            ws: Some(SocketAddr::new(host, ws_port)),
            http: Some(SocketAddr::new(host, http_port)),
        }
    }

    fn addrs(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        [self.tcp, self.ws, self.http].into_iter().flatten()
    }
}

pub struct Listeners {
    tcp: Option<TcpListener>,
    ws: Option<TcpListener>,
    http: Option<TcpListener>,
}

async fn bind_optional(addr: Option<SocketAddr>) -> io::Result<Option<TcpListener>> {
    match addr {
        Some(addr) => TcpListener::bind(addr).await.map(Some),
        None => Ok(None),
    }
}

fn local_addr(listener: &Option<TcpListener>) -> Option<SocketAddr> {
    listener
        .as_ref()
        .and_then(|listener| listener.local_addr().ok())
}

impl Listeners {
    pub async fn bind(plan: &ListenPlan) -> io::Result<Self> {
        for addr in plan.addrs() {
            if !addr.ip().is_loopback() {
                warn!(%addr, "binding a non-loopback address; anyone who can reach it can run code on this host");
            }
        }
        Ok(Self {
            tcp: bind_optional(plan.tcp).await?,
            ws: bind_optional(plan.ws).await?,
            http: bind_optional(plan.http).await?,
        })
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        local_addr(&self.tcp)
    }

    pub fn ws_addr(&self) -> Option<SocketAddr> {
        local_addr(&self.ws)
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        local_addr(&self.http)
    }

    /// Serves every bound front-end until the bridge signals shutdown, then
    /// gives open connections `grace` to finish.
    pub async fn serve(
        self,
        context: ServerContext,
        http_options: HttpOptions,
        grace: Duration,
    ) -> io::Result<()> {
        let bridge = context.bridge().clone();
        let mut tasks = JoinSet::new();
        if let Some(listener) = self.tcp {
            tasks.spawn(tcp::serve(
                listener,
                context.clone(),
                bridge.shutdown_signal(),
            ));
        }
        if let Some(listener) = self.ws {
            tasks.spawn(ws::serve(listener, context.clone(), bridge.shutdown_signal()));
        }
        if let Some(listener) = self.http {
            tasks.spawn(http::serve(
                listener,
                context.clone(),
                http_options,
                bridge.shutdown_signal(),
            ));
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.unwrap_or_else(|err| Err(io::Error::other(err)));
            if let Err(err) = result {
                error!("front-end failed: {err}");
                bridge.begin_shutdown();
                first_error.get_or_insert(err);
            }
        }

        if !context.wait_for_sessions(grace).await {
            warn!(
                open = context.registry.len(),
                "grace period over; dropping open connections"
            );
        }
        info!("front-ends stopped");
        first_error.map_or(Ok(()), Err)
    }
}

pub async fn wait_for_shutdown(signal: &mut watch::Receiver<bool>) {
    // An error means the bridge is gone, which is as final as a shutdown.
    let _ = signal.wait_for(|stopped| *stopped).await;
}
