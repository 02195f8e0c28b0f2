use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Which concurrency strategy the [`Engine`](crate) trait is instantiated with.
///
/// The contract (`start`/`run`/`stop`) is shared; only the worker-dispatch
/// mechanics differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineKind {
    /// Debugging engine: accept and serve inline, no parallelism.
    SingleProcess,
    /// Default: fork one child process per accepted connection.
    #[default]
    ForkPerConn,
    /// Apache-style pre-fork pool with a parent-owned scoreboard.
    Scoreboard,
    /// Spawn one detached OS thread per connection.
    Threaded,
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineKind::SingleProcess => "single-process",
            EngineKind::ForkPerConn => "fork-per-conn",
            EngineKind::Scoreboard => "scoreboard",
            EngineKind::Threaded => "threaded",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown engine '{0}', expected one of single-process, fork-per-conn, scoreboard, threaded")]
pub struct ParseEngineKindError(String);

impl FromStr for EngineKind {
    type Err = ParseEngineKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "single-process" | "singleprocess" => Ok(EngineKind::SingleProcess),
            "fork-per-conn" | "forkperconn" | "fork" => Ok(EngineKind::ForkPerConn),
            "scoreboard" | "prefork" => Ok(EngineKind::Scoreboard),
            "threaded" | "thread" => Ok(EngineKind::Threaded),
            other => Err(ParseEngineKindError(other.to_string())),
        }
    }
}
