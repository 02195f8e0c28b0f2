use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine_kind::EngineKind;
use crate::logmask::LogMask;

/// Pre-fork pool tuning, used only when `engine = Scoreboard`.
///
/// Not part of the primary config table, but required by the Scoreboard
/// engine's pre-fork algorithm; defaults follow the same proportions
/// Apache's prefork MPM documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreboardConfig {
    pub start_servers: usize,
    pub min_spare_servers: usize,
    pub max_spare_servers: usize,
    pub max_requests_per_child: usize,
    pub verify_delay_secs: u64,
}

impl Default for ScoreboardConfig {
    fn default() -> Self {
        Self {
            start_servers: 5,
            min_spare_servers: 2,
            max_spare_servers: 10,
            max_requests_per_child: 1_000,
            verify_delay_secs: 30,
        }
    }
}

/// The single configuration struct for a running proxy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub chunk: usize,
    pub timeout_secs: u64,
    pub max_clients: usize,
    pub max_connections: usize,
    pub max_keep_alive_requests: usize,
    pub via: String,
    pub x_forwarded_for: bool,
    pub engine: EngineKind,
    pub logmask: LogMask,
    pub scoreboard: ScoreboardConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        let host = "localhost".to_string();
        let via = default_via(&host);
        Self {
            host,
            port: 8080,
            chunk: 4096,
            timeout_secs: 60,
            max_clients: 10,
            max_connections: 0,
            max_keep_alive_requests: 10,
            via,
            x_forwarded_for: true,
            engine: EngineKind::default(),
            logmask: LogMask::empty(),
            scoreboard: ScoreboardConfig::default(),
        }
    }
}

fn default_via(host: &str) -> String {
    format!("{host} (ProxyCore/{})", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, thiserror::Error)]
pub enum ValidateError {
    #[error("port must be non-zero unless engine is single-process-for-test, got {0}")]
    InvalidPort(u16),
    #[error("chunk must be > 0")]
    ZeroChunk,
    #[error("max_keep_alive_requests must be >= 1")]
    ZeroKeepAlive,
    #[error("scoreboard.min_spare_servers ({min}) must be <= scoreboard.max_spare_servers ({max})")]
    SpareServerRange { min: usize, max: usize },
    #[error("scoreboard.start_servers ({start}) must be <= max_clients ({max})")]
    StartServersExceedsMaxClients { start: usize, max: usize },
}

impl ProxyConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn verify_delay(&self) -> Duration {
        Duration::from_secs(self.scoreboard.verify_delay_secs)
    }

    /// Checked at config-build time, not at runtime, the same as predicate
    /// construction errors.
    pub fn validate(&self) -> Result<(), ValidateError> {
        if self.chunk == 0 {
            return Err(ValidateError::ZeroChunk);
        }
        if self.max_keep_alive_requests == 0 {
            return Err(ValidateError::ZeroKeepAlive);
        }
        if self.scoreboard.min_spare_servers > self.scoreboard.max_spare_servers {
            return Err(ValidateError::SpareServerRange {
                min: self.scoreboard.min_spare_servers,
                max: self.scoreboard.max_spare_servers,
            });
        }
        if self.max_clients > 0 && self.scoreboard.start_servers > self.max_clients {
            return Err(ValidateError::StartServersExceedsMaxClients {
                start: self.scoreboard.start_servers,
                max: self.max_clients,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = ProxyConfig::default();
        assert_eq!(cfg.host, "localhost");
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.chunk, 4096);
        assert_eq!(cfg.timeout_secs, 60);
        assert_eq!(cfg.max_clients, 10);
        assert_eq!(cfg.max_connections, 0);
        assert_eq!(cfg.max_keep_alive_requests, 10);
        assert!(cfg.x_forwarded_for);
        assert_eq!(cfg.engine, EngineKind::ForkPerConn);
        assert_eq!(cfg.logmask, LogMask::empty());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_zero_chunk() {
        let mut cfg = ProxyConfig::default();
        cfg.chunk = 0;
        assert!(matches!(cfg.validate(), Err(ValidateError::ZeroChunk)));
    }

    #[test]
    fn rejects_inverted_spare_server_range() {
        let mut cfg = ProxyConfig::default();
        cfg.scoreboard.min_spare_servers = 20;
        cfg.scoreboard.max_spare_servers = 5;
        assert!(matches!(
            cfg.validate(),
            Err(ValidateError::SpareServerRange { .. })
        ));
    }
}
