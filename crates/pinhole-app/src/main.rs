//! Pinhole - intercepting HTTP/WebSocket proxy.
//!
//! Loads configuration and rewrite rules, starts the proxy server, logs
//! traffic and runs until Ctrl-C.

mod observers;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use directories::ProjectDirs;
use pinhole_proxy::{ExternalProxy, ProxyConfig, ProxyServer, RewriteRules};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::observers::{JsonLinesRecorder, LoggingListener};

/// Command line arguments.
#[derive(Parser, Debug)]
#[command(name = "pinhole", version, about)]
struct Args {
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides the configuration)
    #[arg(long)]
    port: Option<u16>,

    /// JSON rewrite rules file
    #[arg(long)]
    rules: Option<PathBuf>,

    /// Relay TLS without intercepting it
    #[arg(long)]
    no_ssl: bool,

    /// Point the OS proxy at Pinhole while running
    #[arg(long)]
    system_proxy: bool,

    /// Directory holding the root CA
    #[arg(long)]
    ca_dir: Option<PathBuf>,

    /// Chain outbound traffic through host:port
    #[arg(long)]
    external_proxy: Option<String>,

    /// Skip certificate verification toward origins
    #[arg(long)]
    insecure: bool,

    /// Append every event as JSON lines to this file
    #[arg(long)]
    record: Option<PathBuf>,

    /// Print the root CA certificate (PEM) and exit
    #[arg(long)]
    print_ca: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Get the logs directory path.
fn logs_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "pinhole", "Pinhole").map(|dirs| dirs.data_dir().join("logs"))
}

/// Initialize logging: console plus a daily rotated file when possible.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("pinhole={log_level},pinhole_proxy={log_level},warn"))
    });

    if let Some(log_dir) = logs_dir() {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("pinhole")
                .filename_suffix("log")
                .build(&log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stderr))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();

                tracing::info!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }
    }

    // Fallback: console logging only
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::warn!("File logging unavailable, using console only");
    None
}

/// Builds the effective configuration: file (or defaults), then flags.
fn load_config(args: &Args) -> anyhow::Result<ProxyConfig> {
    let mut config = match &args.config {
        Some(path) => ProxyConfig::from_file(path)?,
        None => ProxyConfig::default(),
    };

    if let Some(port) = args.port {
        config.port = port;
    }
    if args.no_ssl {
        config.enable_ssl = false;
    }
    if args.system_proxy {
        config.enable_system_proxy = true;
    }
    if args.insecure {
        config.accept_invalid_upstream_certs = true;
    }
    if let Some(dir) = &args.ca_dir {
        config.ca_dir = Some(dir.clone());
    }
    if let Some(proxy) = &args.external_proxy {
        config.external_proxy = Some(ExternalProxy::parse(proxy)?);
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Keep the guard alive for the duration of the program
    let _log_guard = init_logging(&args);

    let config = load_config(&args)?;
    tracing::debug!("Config: {:?}", config);

    let mut server = ProxyServer::new(config)?;

    if args.print_ca {
        println!("{}", server.ca().root_certificate_pem()?);
        return Ok(());
    }

    if let Some(path) = &args.rules {
        let rules = RewriteRules::from_file(path)?;
        tracing::info!("Loaded {} rewrite rules from {:?}", rules.len(), path);
        server = server.with_rewriter(Arc::new(rules));
    }

    server.add_listener(Arc::new(LoggingListener));
    if let Some(path) = &args.record {
        let recorder = JsonLinesRecorder::create(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        server.add_listener(Arc::new(recorder));
    }

    let handle = server.start().await?;
    tracing::info!("Pinhole listening on port {}", handle.port());
    if server.config().enable_ssl {
        tracing::info!(
            "Trust {:?} in your client to inspect TLS traffic",
            server.ca().cert_path()
        );
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Pinhole shutting down");
    server.stop().await?;
    Ok(())
}
