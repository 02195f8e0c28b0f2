//! Configuration sourced from the CLI, overlaid on top of the file config.

use std::path::PathBuf;

use clap::Parser;

use crate::config::ProxyConfig;
use crate::engine_kind::EngineKind;
use crate::logmask::LogMask;

#[derive(Parser, Debug, Default)]
#[command(name = "proxyd", about = "HTTP/1.x intercepting forward proxy")]
pub struct Cli {
    /// Path to the configuration file in TOML format.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Validate the configuration and exit without binding a socket.
    #[arg(long)]
    pub validate_config: bool,

    #[arg(long)]
    pub host: Option<String>,

    #[arg(long)]
    pub port: Option<u16>,

    #[arg(long)]
    pub chunk: Option<usize>,

    #[arg(long)]
    pub timeout_secs: Option<u64>,

    #[arg(long)]
    pub max_clients: Option<usize>,

    #[arg(long)]
    pub max_connections: Option<usize>,

    #[arg(long)]
    pub max_keep_alive_requests: Option<usize>,

    #[arg(long)]
    pub via: Option<String>,

    #[arg(long)]
    pub x_forwarded_for: Option<bool>,

    #[arg(long, value_parser = clap::value_parser!(EngineKind))]
    pub engine: Option<EngineKind>,

    #[arg(long, value_parser = clap::value_parser!(LogMask))]
    pub logmask: Option<LogMask>,
}

// clap needs `ValueParserFactory`/`FromStr` for custom enum types used with
// `value_parser!`; both EngineKind and LogMask already implement FromStr, and
// clap's blanket impl covers the rest as long as the Err type is Display,
// which our thiserror types are.

/// Overlay CLI-provided overrides onto a file-sourced (or default) config.
/// Only fields the user actually passed are applied; everything else keeps
/// the file value.
pub fn apply_cli(config: &mut ProxyConfig, cli: &Cli) {
    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(chunk) = cli.chunk {
        config.chunk = chunk;
    }
    if let Some(timeout_secs) = cli.timeout_secs {
        config.timeout_secs = timeout_secs;
    }
    if let Some(max_clients) = cli.max_clients {
        config.max_clients = max_clients;
    }
    if let Some(max_connections) = cli.max_connections {
        config.max_connections = max_connections;
    }
    if let Some(n) = cli.max_keep_alive_requests {
        config.max_keep_alive_requests = n;
    }
    if let Some(via) = &cli.via {
        config.via = via.clone();
    }
    if let Some(xff) = cli.x_forwarded_for {
        config.x_forwarded_for = xff;
    }
    if let Some(engine) = cli.engine {
        config.engine = engine;
    }
    if let Some(logmask) = cli.logmask {
        config.logmask = logmask;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_only_touches_set_fields() {
        let mut config = ProxyConfig::default();
        let cli = Cli {
            port: Some(9090),
            ..Default::default()
        };
        apply_cli(&mut config, &cli);
        assert_eq!(config.port, 9090);
        assert_eq!(config.host, "localhost");
    }
}
