use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use app::client::BridgeClient;
use app::server::{DEFAULT_HOST, DEFAULT_TCP_PORT};
use clap::Parser;

/// Send one request to a running server over TCP and print the response.
#[derive(Debug, Parser)]
#[command(name = "client", version, about)]
struct Cli {
    /// Python file to execute; reads stdin when omitted.
    file: Option<PathBuf>,
    #[arg(long, env = "BRIDGE_HOST", default_value = DEFAULT_HOST)]
    host: String,
    #[arg(long, env = "BRIDGE_TCP_PORT", default_value_t = DEFAULT_TCP_PORT)]
    port: u16,
    /// Ask for captured stdout, stderr, and locals.
    #[arg(long)]
    debug: bool,
    /// Seconds to wait for the response.
    #[arg(long, default_value_t = 330)]
    timeout: u64,
    #[arg(long, conflicts_with_all = ["shutdown", "file"])]
    describe: bool,
    #[arg(long, conflicts_with = "file")]
    shutdown: bool,
}

fn read_code(file: Option<&PathBuf>) -> anyhow::Result<String> {
    match file {
        Some(path) => {
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
        }
        None => {
            let mut code = String::new();
            io::stdin()
                .read_to_string(&mut code)
                .context("reading code from stdin")?;
            Ok(code)
        }
    }
}

fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let mut client = BridgeClient::connect(
        (cli.host.as_str(), cli.port),
        Some(Duration::from_secs(cli.timeout)),
    )
    .with_context(|| format!("connecting to {}:{}", cli.host, cli.port))?;

    let response = if cli.describe {
        client.describe()?
    } else if cli.shutdown {
        client.shutdown()?
    } else {
        let code = read_code(cli.file.as_ref())?;
        client.execute(&code, cli.debug)?
    };

    println!("{}", serde_json::to_string_pretty(&response)?);
    if let Some(stdout) = response
        .get("debug")
        .and_then(|debug| debug.get("stdout"))
        .and_then(|stdout| stdout.as_str())
        .filter(|stdout| !stdout.is_empty())
    {
        eprintln!("--- stdout ---\n{stdout}");
    }
    Ok(if response.get("error").is_some() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
