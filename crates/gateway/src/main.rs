use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use fg_gateway::api::router::{build_router, HttpState};
use fg_gateway::bootstrap::{build_state, spawn_background};
use fg_gateway::cli::{load_config, report_issues, Cli, Command, ConfigCommand};
use fg_gateway::mcp::catalog::{Identity, Role};
use fg_gateway::mcp::service::McpService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve { stdio: false }) => {
            init_tracing();
            serve_http(&cli).await
        }
        Some(Command::Serve { stdio: true }) => {
            // Logs go to stderr so stdout stays a clean protocol stream.
            init_tracing_stderr();
            serve_stdio(&cli).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let config = load_config(&cli)?;
            if !report_issues(&config) {
                std::process::exit(1);
            }
            println!("configuration ok");
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let config = load_config(&cli)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Some(Command::Version) => {
            println!("fleetgate {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON tracing for the HTTP server.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,fg_gateway=debug")),
        )
        .json()
        .init();
}

fn init_tracing_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,fg_gateway=debug")),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();
}

async fn serve_http(cli: &Cli) -> anyhow::Result<()> {
    let config = Arc::new(load_config(cli)?);
    if !report_issues(&config) {
        anyhow::bail!("configuration has fatal problems");
    }
    tracing::info!(environment = %config.environment, "fleetgate starting");

    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .context("installing Prometheus recorder")?;

    let state = build_state(config.clone())?;
    let shutdown = CancellationToken::new();
    spawn_background(&state, shutdown.clone());

    let mcp = Arc::new(McpService::new(state.clone()));
    let router = build_router(HttpState {
        app: state,
        mcp,
        metrics,
    });

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .context("http server")?;
    Ok(())
}

/// Newline-delimited JSON-RPC on stdin/stdout. The local operator owns the
/// process, so the identity is an admin subject.
async fn serve_stdio(cli: &Cli) -> anyhow::Result<()> {
    let config = Arc::new(load_config(cli)?);
    if !report_issues(&config) {
        anyhow::bail!("configuration has fatal problems");
    }
    tracing::info!(environment = %config.environment, "fleetgate starting (stdio)");

    let state = build_state(config)?;
    let shutdown = CancellationToken::new();
    spawn_background(&state, shutdown.clone());
    let mcp = McpService::new(state);
    let identity = Identity::new("local-operator", Role::Admin);

    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut lines = stdin.lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        if let Some(response) = mcp.handle_message(&line, identity.clone()).await {
            stdout.write_all(response.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
    }

    shutdown.cancel();
    tracing::info!("stdin closed, shutting down");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
    shutdown.cancel();
}
