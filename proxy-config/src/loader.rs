use std::path::Path;

use miette::{Context, IntoDiagnostic, Result};

use crate::cli::{apply_cli, Cli};
use crate::config::ProxyConfig;

/// Loads a [`ProxyConfig`] from an optional TOML file, then overlays CLI
/// flags, then validates (file → CLI overrides → `validate()`).
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigLoader;

impl ConfigLoader {
    pub fn load(&self, cli: &Cli) -> Result<ProxyConfig> {
        let mut config = match &cli.config {
            Some(path) => Self::load_file(path)?,
            None => {
                tracing::warn!("no --config given, using defaults");
                ProxyConfig::default()
            }
        };

        apply_cli(&mut config, cli);

        config
            .validate()
            .into_diagnostic()
            .wrap_err("configuration failed validation")?;

        Ok(config)
    }

    fn load_file(path: &Path) -> Result<ProxyConfig> {
        let raw = std::fs::read_to_string(path)
            .into_diagnostic()
            .wrap_err_with(|| format!("reading config file '{}'", path.display()))?;

        toml::from_str(&raw)
            .into_diagnostic()
            .wrap_err_with(|| format!("parsing config file '{}' as TOML", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_partial_toml_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"port = 9999
engine = "threaded""#).unwrap();

        let cli = Cli {
            config: Some(file.path().to_path_buf()),
            ..Default::default()
        };

        let config = ConfigLoader.load(&cli).unwrap();
        assert_eq!(config.port, 9999);
        assert_eq!(config.engine, crate::engine_kind::EngineKind::Threaded);
        assert_eq!(config.host, "localhost");
    }

    #[test]
    fn cli_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port = 9999").unwrap();

        let cli = Cli {
            config: Some(file.path().to_path_buf()),
            port: Some(1234),
            ..Default::default()
        };

        let config = ConfigLoader.load(&cli).unwrap();
        assert_eq!(config.port, 1234);
    }

    #[test]
    fn missing_file_is_an_error() {
        let cli = Cli {
            config: Some("/nonexistent/path/proxy.toml".into()),
            ..Default::default()
        };
        assert!(ConfigLoader.load(&cli).is_err());
    }

    #[test]
    fn invalid_config_fails_validation() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "chunk = 0").unwrap();

        let cli = Cli {
            config: Some(file.path().to_path_buf()),
            ..Default::default()
        };

        assert!(ConfigLoader.load(&cli).is_err());
    }
}
