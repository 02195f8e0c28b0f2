use std::process::ExitCode;

use clap::Parser;
use proxy_config::{Cli, ConfigLoader};
use proxy_core::{Proxy, ProxyError};

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match ConfigLoader.load(&cli) {
        Ok(config) => config,
        Err(report) => {
            eprintln!("{report:?}");
            return ExitCode::from(2);
        }
    };

    if cli.validate_config {
        println!("configuration OK");
        return ExitCode::SUCCESS;
    }

    proxy_core::logging::init(config.logmask);
    tracing::info!("proxy running (pid {})", std::process::id());

    match Proxy::new(config).run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(ProxyError::Engine(msg)) => {
            eprintln!("unrecoverable engine error: {msg}");
            ExitCode::from(1)
        }
        Err(e) => {
            eprintln!("proxy exited with error: {e}");
            ExitCode::from(1)
        }
    }
}
