use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use sandbox_compiler::config::{ServiceConfig, CONFIG_ENV};

#[derive(Parser)]
#[command(name = "sandbox-compiler")]
#[command(about = "Sandbox compilation service: files, processes and artifact builds over WebSocket", long_about = None)]
struct Cli {
    /// Config file (TOML)
    #[arg(short, long, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen address
    #[arg(long)]
    bind: Option<String>,

    /// Host directory backing the sandbox filesystem
    #[arg(long)]
    sandbox_root: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Print the effective config and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = ServiceConfig::load(cli.config.as_deref()).context("Failed to load config")?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }
    if let Some(root) = cli.sandbox_root {
        config.sandbox.root = root;
    }

    if cli.print_config {
        let toml = config.to_toml().map_err(anyhow::Error::msg)?;
        println!("{}", toml);
        return Ok(());
    }

    sandbox_compiler::util::init_logging(cli.json_logs);
    info!(
        "Starting sandbox compilation service on {}:{}",
        config.server.bind, config.server.port
    );

    sandbox_compiler::server::run_server(config).await
}
