//! edgetun: local SOCKS5 proxy.
//!
//! Destinations inside the CDN edge ranges are reached through a relay
//! session over a TLS WebSocket; everything else is dialed directly.

mod config;
mod socks;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use config::ProxyConfig;
use edgetun_client::TunnelDialer;
use socks::Socks5Server;
use tracing::{error, info};

/// edgetun: SOCKS5 proxy with CDN-edge relaying
#[derive(Parser, Debug)]
#[command(name = "edgetun", version, about = "SOCKS5 proxy with CDN-edge relaying")]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Listen address (overrides `bind` in the config file)
    #[arg(long)]
    bind: Option<String>,

    /// Listen port (overrides `port` in the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting edgetun");

    let config = match ProxyConfig::load(&cli.config, cli.bind.as_deref(), cli.port) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %format!("{e:#}"), "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        domain = %config.relay.domain,
        relay = %config.relay.relay_target(),
        egress = ?config.relay.egress.as_ref().map(|e| e.to_string()),
        "relay configured"
    );

    let dialer = match TunnelDialer::new(config.relay) {
        Ok(d) => Arc::new(d),
        Err(e) => {
            error!(error = %e, "failed to create dialer");
            std::process::exit(1);
        }
    };

    let server = match Socks5Server::bind(config.listen_addr, dialer, config.connect_timeout).await
    {
        Ok(s) => s,
        Err(e) => {
            error!(addr = %config.listen_addr, error = %e, "failed to bind SOCKS5 listener");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("edgetun stopped");
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
