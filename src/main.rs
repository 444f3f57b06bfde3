// src/main.rs

//! The main entry point for the fcgi-reactor server application.

use anyhow::{Context, Result};
use fcgi_reactor::config::{Config, ServerOptions};
use fcgi_reactor::core::EventDispatcher;
use fcgi_reactor::server::metrics_server::run_metrics_server;
use fcgi_reactor::{FcgiServer, TracingLogger};
use std::env;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

const DEFAULT_CONFIG_PATH: &str = "fcgi.toml";

#[tokio::main]
async fn main() -> Result<()> {
    run_app().await
}

async fn run_app() -> Result<()> {
    // Define version information.
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("fcgi-reactor version {VERSION}");
        return Ok(());
    }

    // An explicit --config must exist; the default path falls back to built-in defaults.
    let explicit_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());
    let config_path = explicit_path.unwrap_or(DEFAULT_CONFIG_PATH);

    let mut config = if explicit_path.is_some() || Path::new(config_path).exists() {
        match Config::from_file(config_path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Failed to load configuration from \"{config_path}\": {e:#}");
                std::process::exit(1);
            }
        }
    } else {
        Config::default()
    };

    // Override port if provided as a command-line argument
    if let Some(port_index) = args.iter().position(|arg| arg == "--port") {
        if let Some(port_str) = args.get(port_index + 1) {
            match port_str.parse::<u16>() {
                Ok(port) => config.port = port,
                Err(_) => {
                    eprintln!("Invalid port number: {port_str}");
                    std::process::exit(1);
                }
            }
        } else {
            eprintln!("--port flag requires a value");
            std::process::exit(1);
        }
        if let Err(e) = config.validate() {
            eprintln!("Invalid configuration: {e}");
            std::process::exit(1);
        }
    }

    // Get initial log level from env var or config.
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .compact()
        .with_ansi(true)
        .init();

    let server = FcgiServer::with_logger(ServerOptions::from(&config), Arc::new(TracingLogger))
        .context("Failed to create the FastCGI server")?;

    let addr = server
        .bind((config.host.as_str(), config.port))
        .with_context(|| format!("Failed to bind {}:{}", config.host, config.port))?;
    info!("fcgi-reactor {} accepting FastCGI on {}", VERSION, addr);

    if let Some(path) = &config.unix_socket {
        #[cfg(unix)]
        server
            .bind_unix(path)
            .with_context(|| format!("Failed to bind local socket {}", path.display()))?;
        #[cfg(not(unix))]
        warn!(
            "Ignoring unix_socket {}: local sockets are not supported on this platform.",
            path.display()
        );
    }

    register_demo_responder(server.events());
    server.start(true).context("Failed to start the FastCGI server")?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let metrics_task = config
        .metrics
        .enabled
        .then(|| tokio::spawn(run_metrics_server(config.metrics.port, shutdown_tx.subscribe())));

    wait_for_shutdown_signal().await;

    if shutdown_tx.send(()).is_err() && metrics_task.is_some() {
        warn!("Metrics server was already gone at shutdown.");
    }
    if let Some(task) = metrics_task {
        let _ = task.await;
    }
    tokio::task::spawn_blocking(move || server.dispose())
        .await
        .context("Failed to dispose the FastCGI server")?;
    info!("Server shutdown complete.");
    Ok(())
}

/// Answers every request, once its STDIN stream ends, with a plain-text
/// listing of the parameters it received.
fn register_demo_responder(events: &EventDispatcher) {
    events.on_stdin(|request, record| {
        if !record.is_stream_end() {
            return Ok(());
        }
        let mut params: Vec<_> = request.params().into_iter().collect();
        params.sort();

        let mut body = String::new();
        for (name, value) in params {
            writeln!(body, "{name}={value}")?;
        }
        writeln!(body, "STDIN_BYTES={}", request.body().len())?;

        let response = format!(
            "Content-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        request.write_stdout(response.as_bytes())?;
        request.end(0)?;
        Ok(())
    });
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("SIGINT received, initiating graceful shutdown."),
                    _ = sigterm.recv() => info!("SIGTERM received, initiating graceful shutdown."),
                }
                return;
            }
            Err(e) => warn!("Failed to register SIGTERM handler: {}", e),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for SIGINT: {}", e);
    }
    info!("SIGINT received, initiating graceful shutdown.");
}
