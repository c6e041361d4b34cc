use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use app::ServerContext;
use app::http::{DEFAULT_MAX_INFLIGHT, HttpOptions};
use app::logging::init_tracing;
use app::server::{
    DEFAULT_HOST, DEFAULT_HTTP_PORT, DEFAULT_SHUTDOWN_GRACE, DEFAULT_TCP_PORT, DEFAULT_WS_PORT,
    ListenPlan, Listeners,
};
use bridge::config::{
    DEFAULT_DRAIN_BUDGET, DEFAULT_MAX_CONNECTIONS, DEFAULT_QUEUE_CAPACITY,
};
use bridge::codec::DEFAULT_MAX_FRAME_BYTES;
use bridge::{
    Bridge, BridgeConfig, Dispatcher, HostApi, MainLoop, PythonInterpreter, Sandbox, Scene,
    Validator, WhitelistPolicy,
};
use clap::{Parser, ValueEnum};
use tracing::{info, warn};

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TransportArg {
    Tcp,
    Ws,
    Http,
}

/// JSON-RPC server that runs Python against the host scene on the main thread.
#[derive(Debug, Parser)]
#[command(name = "app", version, about)]
struct Cli {
    /// Address every front-end binds to.
    #[arg(long, env = "BRIDGE_HOST", default_value = DEFAULT_HOST)]
    host: IpAddr,
    #[arg(long, env = "BRIDGE_TCP_PORT", default_value_t = DEFAULT_TCP_PORT)]
    tcp_port: u16,
    #[arg(long, env = "BRIDGE_WS_PORT", default_value_t = DEFAULT_WS_PORT)]
    ws_port: u16,
    #[arg(long, env = "BRIDGE_HTTP_PORT", default_value_t = DEFAULT_HTTP_PORT)]
    http_port: u16,
    /// Front-ends to start.
    #[arg(
        long,
        env = "BRIDGE_TRANSPORTS",
        value_enum,
        value_delimiter = ',',
        default_values_t = [TransportArg::Tcp, TransportArg::Ws, TransportArg::Http]
    )]
    transports: Vec<TransportArg>,
    /// TOML file with `allowed_modules` and `denied_patterns`.
    #[arg(long, env = "BRIDGE_POLICY")]
    policy: Option<PathBuf>,
    #[arg(long, env = "BRIDGE_QUEUE_CAPACITY", default_value_t = DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,
    /// Seconds a request waits for the main thread before timing out.
    #[arg(long, env = "BRIDGE_REQUEST_TIMEOUT", default_value_t = 300)]
    request_timeout: u64,
    /// Main loop poll interval in milliseconds; at least 1.
    #[arg(
        long,
        env = "BRIDGE_TICK_MS",
        default_value_t = 10,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    tick_ms: u64,
    #[arg(long, env = "BRIDGE_DRAIN_BUDGET", default_value_t = DEFAULT_DRAIN_BUDGET)]
    drain_budget: usize,
    #[arg(long, env = "BRIDGE_MAX_FRAME_BYTES", default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    max_frame_bytes: usize,
    #[arg(long, env = "BRIDGE_MAX_CONNECTIONS", default_value_t = DEFAULT_MAX_CONNECTIONS)]
    max_connections: usize,
    #[arg(long, env = "BRIDGE_MAX_INFLIGHT", default_value_t = DEFAULT_MAX_INFLIGHT)]
    max_inflight: usize,
    /// Seconds open connections get to finish after shutdown.
    #[arg(long, env = "BRIDGE_SHUTDOWN_GRACE", default_value_t = DEFAULT_SHUTDOWN_GRACE.as_secs())]
    shutdown_grace: u64,
    #[arg(long, env = "BRIDGE_LOG_JSON")]
    log_json: bool,
}

impl Cli {
    fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            queue_capacity: self.queue_capacity,
            request_timeout: Duration::from_secs(self.request_timeout),
            tick_interval: Duration::from_millis(self.tick_ms),
            drain_budget: self.drain_budget,
            max_frame_bytes: self.max_frame_bytes,
            max_connections: self.max_connections,
        }
    }

    fn listen_plan(&self) -> ListenPlan {
        let mut plan = ListenPlan::all(self.host, self.tcp_port, self.ws_port, self.http_port);
        if !self.transports.contains(&TransportArg::Tcp) {
            plan.tcp = None;
        }
        if !self.transports.contains(&TransportArg::Ws) {
            plan.ws = None;
        }
        if !self.transports.contains(&TransportArg::Http) {
            plan.http = None;
        }
        plan
    }

    fn policy(&self) -> anyhow::Result<WhitelistPolicy> {
        match &self.policy {
            Some(path) => WhitelistPolicy::load(path)
                .with_context(|| format!("loading policy from {}", path.display())),
            None => Ok(WhitelistPolicy::standard()?),
        }
    }
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = cli.bridge_config();
    let policy = cli.policy()?;
    info!(
        allowed = ?policy.allowed_modules().collect::<Vec<_>>(),
        denied = policy.denied_patterns().count(),
        "whitelist loaded"
    );
    let bridge = Bridge::new(config.queue_capacity);
    let dispatcher = Dispatcher::new(Validator::new(policy), bridge.clone(), config.request_timeout);
    let context = ServerContext::new(dispatcher, &config);
    let http_options = HttpOptions {
        max_inflight: cli.max_inflight,
        body_limit: config.max_frame_bytes,
        request_timeout: config.request_timeout + Duration::from_secs(5),
    };
    let grace = Duration::from_secs(cli.shutdown_grace);
    let plan = cli.listen_plan();
    if plan.tcp.is_none() && plan.ws.is_none() && plan.http.is_none() {
        anyhow::bail!("no transports enabled");
    }

    // The interpreter is not Send, so it is built here and never leaves the
    // main thread. Networking gets its own thread and runtime.
    let host: Arc<Mutex<dyn HostApi>> = Arc::new(Mutex::new(Scene::new()));
    let sandbox = Sandbox::new(PythonInterpreter::new(host)?);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("bridge-net")
        .build()?;
    let listeners = runtime
        .block_on(Listeners::bind(&plan))
        .context("binding listeners")?;
    for (name, addr) in [
        ("tcp", listeners.tcp_addr()),
        ("ws", listeners.ws_addr()),
        ("http", listeners.http_addr()),
    ] {
        if let Some(addr) = addr {
            println!("{name} listening on {addr}");
        }
    }

    let signal_bridge = bridge.clone();
    let network = thread::Builder::new()
        .name("network".to_owned())
        .spawn(move || {
            runtime.block_on(async move {
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("ctrl-c received");
                        signal_bridge.begin_shutdown();
                    }
                });
                listeners.serve(context, http_options, grace).await
            })
        })?;

    let sandbox = MainLoop::new(bridge.clone(), sandbox, &config).run();
    info!(executions = sandbox.executions(), "main loop exited");

    match network.join() {
        Ok(result) => result.context("serving front-ends")?,
        Err(_) => warn!("network thread panicked"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_tick_is_rejected() {
        assert!(Cli::try_parse_from(["app", "--tick-ms", "0"]).is_err());
        let cli = Cli::try_parse_from(["app", "--tick-ms", "1"]).expect("one is allowed");
        assert_eq!(cli.bridge_config().tick_interval, Duration::from_millis(1));
    }

    #[test]
    fn defaults_parse() {
        let cli = Cli::try_parse_from(["app"]).expect("defaults");
        assert_eq!(cli.bridge_config().tick_interval, Duration::from_millis(10));
        assert_eq!(cli.transports.len(), 3);
    }
}
