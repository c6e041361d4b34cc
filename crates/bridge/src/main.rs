use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use bridge::protocol::Method;
use bridge::{
    Bridge, BridgeConfig, Dispatcher, HostApi, MainLoop, PythonInterpreter, RequestFrame, Sandbox,
    Scene, Validator, WhitelistPolicy,
};
use tracing_subscriber::EnvFilter;

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const SCRIPTS: [(&str, &str); 3] = [
    ("simple_cube", include_str!("../scripts/simple_cube.py")),
    ("cube_grid", include_str!("../scripts/cube_grid.py")),
    ("list_scene", include_str!("../scripts/list_scene.py")),
];

async fn run_scripts(dispatcher: &Dispatcher) -> anyhow::Result<()> {
    for (n, (name, code)) in (1u64..).zip(SCRIPTS) {
        let frame = serde_json::to_string(&RequestFrame::execute(n, code).with_debug(true))?;
        let start = Instant::now();
        let Some(response) = dispatcher.dispatch_text(&frame).await else {
            continue;
        };
        println!("== {name} ({:.3}s)", start.elapsed().as_secs_f64());
        if let Some(debug) = &response.debug {
            print!("{}", debug.stdout);
        }
        match (response.result(), response.error()) {
            (Some(result), _) => println!("result: {}", serde_json::to_string_pretty(result)?),
            (_, Some(error)) => println!("error {}: {}", error.code, error.message),
            _ => {}
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    println!("Running example scene scripts through the main-thread bridge.");
    let config = BridgeConfig::default();
    let bridge = Bridge::new(config.queue_capacity);
    let dispatcher = Dispatcher::new(
        Validator::new(WhitelistPolicy::standard()?),
        bridge.clone(),
        config.request_timeout,
    );

    let scene = Arc::new(Mutex::new(Scene::new()));
    let host: Arc<Mutex<dyn HostApi>> = scene.clone();
    let sandbox = Sandbox::new(PythonInterpreter::new(host)?);

    let client_bridge = bridge.clone();
    let client = thread::Builder::new()
        .name("demo-client".to_owned())
        .spawn(move || -> anyhow::Result<()> {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()?;
            let outcome = runtime.block_on(async {
                let outcome = run_scripts(&dispatcher).await;
                let shutdown = serde_json::to_string(&RequestFrame::new(0, Method::Shutdown))?;
                dispatcher.dispatch_text(&shutdown).await;
                outcome
            });
            // Make sure the main loop can exit even if the shutdown request never went out.
            client_bridge.begin_shutdown();
            outcome
        })?;

    let sandbox = MainLoop::new(bridge, sandbox, &config).run();
    client
        .join()
        .map_err(|_| anyhow::anyhow!("demo client panicked"))??;

    let objects = scene.lock().map(|scene| scene.len()).unwrap_or_default();
    println!(
        "Executions: {}. Objects left in scene: {objects}",
        sandbox.executions()
    );
    Ok(())
}
