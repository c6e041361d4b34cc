#![allow(dead_code)]

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use app::ServerContext;
use app::http::HttpOptions;
use app::server::{ListenPlan, Listeners};
use bridge::fake::{ExecutionProbe, ScriptedInterpreter};
use bridge::{Bridge, BridgeConfig, Dispatcher, MainLoop, Sandbox, Validator, WhitelistPolicy};

pub struct TestServer {
    pub tcp: SocketAddr,
    pub ws: SocketAddr,
    pub http: SocketAddr,
    pub bridge: Bridge,
    pub probe: Arc<ExecutionProbe>,
    main_loop: Option<JoinHandle<()>>,
    network: Option<JoinHandle<io::Result<()>>>,
}

pub fn test_config() -> BridgeConfig {
    BridgeConfig {
        tick_interval: Duration::from_millis(1),
        request_timeout: Duration::from_secs(10),
        ..BridgeConfig::default()
    }
}

impl TestServer {
    pub fn start() -> Self {
        Self::start_with(test_config(), WhitelistPolicy::standard().expect("policy"))
    }

    pub fn start_with(config: BridgeConfig, policy: WhitelistPolicy) -> Self {
        let bridge = Bridge::new(config.queue_capacity);
        let dispatcher =
            Dispatcher::new(Validator::new(policy), bridge.clone(), config.request_timeout);
        let context = ServerContext::new(dispatcher, &config);
        let http_options = HttpOptions {
            max_inflight: 32,
            body_limit: config.max_frame_bytes,
            request_timeout: config.request_timeout + Duration::from_secs(1),
        };

        let (addrs_tx, addrs_rx) = mpsc::channel();
        let network = thread::spawn(move || -> io::Result<()> {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()?;
            runtime.block_on(async move {
                let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
                let listeners = Listeners::bind(&ListenPlan::all(loopback, 0, 0, 0)).await?;
                let addrs = (
                    listeners.tcp_addr(),
                    listeners.ws_addr(),
                    listeners.http_addr(),
                );
                let _ = addrs_tx.send(addrs);
                listeners
                    .serve(context, http_options, Duration::from_secs(1))
                    .await
            })
        });
        let (tcp, ws, http) = match addrs_rx.recv().expect("listeners bound") {
            (Some(tcp), Some(ws), Some(http)) => (tcp, ws, http),
            other => panic!("missing listener: {other:?}"),
        };

        let interpreter = ScriptedInterpreter::new();
        let probe = interpreter.probe();
        let loop_bridge = bridge.clone();
        let main_loop = thread::spawn(move || {
            MainLoop::new(loop_bridge, Sandbox::new(interpreter), &config).run();
        });

        Self {
            tcp,
            ws,
            http,
            bridge,
            probe,
            main_loop: Some(main_loop),
            network: Some(network),
        }
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{path}", self.http)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/", self.ws)
    }

    pub fn stop(&mut self) {
        self.bridge.begin_shutdown();
        if let Some(main_loop) = self.main_loop.take() {
            main_loop.join().expect("main loop thread");
        }
        if let Some(network) = self.network.take() {
            network
                .join()
                .expect("network thread")
                .expect("front-ends exit cleanly");
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if !thread::panicking() {
            self.stop();
        } else {
            self.bridge.begin_shutdown();
        }
    }
}

pub fn execute_line(id: u64, code: &str) -> String {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "execute",
        "params": {"code": code},
    })
    .to_string()
}
