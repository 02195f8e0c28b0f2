use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Bitmask gating which categories of proxy-internal tracing events are
    /// allowed through. `NONE` (the default) mutes all five categories;
    /// events outside of them (config loading, startup banners, panics) are
    /// never gated by this mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LogMask: u32 {
        const STATUS  = 0b0000_0001;
        const PROCESS = 0b0000_0010;
        const CONNECT = 0b0000_0100;
        const HEADERS = 0b0000_1000;
        const FILTER  = 0b0001_0000;
    }
}

impl LogMask {
    /// The `tracing` target string associated with this single-bit flag.
    /// Panics if `self` is not exactly one flag (callers only use this on
    /// the canonical per-bit constants).
    pub fn target(self) -> &'static str {
        match self {
            LogMask::STATUS => "proxy::status",
            LogMask::PROCESS => "proxy::process",
            LogMask::CONNECT => "proxy::connect",
            LogMask::HEADERS => "proxy::headers",
            LogMask::FILTER => "proxy::filter",
            _ => "proxy",
        }
    }

    pub const ALL_BITS: [LogMask; 5] = [
        LogMask::STATUS,
        LogMask::PROCESS,
        LogMask::CONNECT,
        LogMask::HEADERS,
        LogMask::FILTER,
    ];
}

impl fmt::Display for LogMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "NONE");
        }
        let names: Vec<&str> = LogMask::ALL_BITS
            .iter()
            .filter(|bit| self.contains(**bit))
            .map(|bit| match *bit {
                LogMask::STATUS => "STATUS",
                LogMask::PROCESS => "PROCESS",
                LogMask::CONNECT => "CONNECT",
                LogMask::HEADERS => "HEADERS",
                LogMask::FILTER => "FILTER",
                _ => unreachable!(),
            })
            .collect();
        write!(f, "{}", names.join("|"))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown logmask token '{0}', expected one of NONE, STATUS, PROCESS, CONNECT, HEADERS, FILTER")]
pub struct ParseLogMaskError(String);

impl FromStr for LogMask {
    type Err = ParseLogMaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut mask = LogMask::empty();
        for token in s.split(|c| c == ',' || c == '|' || c == ' ').filter(|t| !t.is_empty()) {
            match token.to_ascii_uppercase().as_str() {
                "NONE" => {}
                "STATUS" => mask |= LogMask::STATUS,
                "PROCESS" => mask |= LogMask::PROCESS,
                "CONNECT" => mask |= LogMask::CONNECT,
                "HEADERS" => mask |= LogMask::HEADERS,
                "FILTER" => mask |= LogMask::FILTER,
                other => return Err(ParseLogMaskError(other.to_string())),
            }
        }
        Ok(mask)
    }
}

impl Serialize for LogMask {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for LogMask {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        LogMask::from_str(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_none() {
        assert_eq!(LogMask::from_str("NONE").unwrap(), LogMask::empty());
        assert_eq!(LogMask::from_str("").unwrap(), LogMask::empty());
    }

    #[test]
    fn parses_combined_tokens() {
        let mask = LogMask::from_str("status,headers|FILTER").unwrap();
        assert!(mask.contains(LogMask::STATUS));
        assert!(mask.contains(LogMask::HEADERS));
        assert!(mask.contains(LogMask::FILTER));
        assert!(!mask.contains(LogMask::CONNECT));
    }

    #[test]
    fn rejects_unknown_token() {
        assert!(LogMask::from_str("bogus").is_err());
    }

    #[test]
    fn display_round_trips() {
        let mask = LogMask::STATUS | LogMask::CONNECT;
        let rendered = mask.to_string();
        assert_eq!(LogMask::from_str(&rendered).unwrap(), mask);
    }
}
