//! Component A: `tracing` initialization gated by the `logmask` config key.
//!
//! Events on the five proxy-internal targets (`proxy::status`,
//! `proxy::process`, `proxy::connect`, `proxy::headers`, `proxy::filter`)
//! are only emitted when the corresponding `LogMask` bit is set; every
//! other target (config loading, startup banners, library internals)
//! always passes through at whatever level `RUST_LOG` allows.

use proxy_config::LogMask;
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

pub fn init(mask: LogMask) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let mask_filter = filter_fn(move |metadata| {
        let target = metadata.target();
        if !target.starts_with("proxy::") {
            return true;
        }
        LogMask::ALL_BITS
            .iter()
            .any(|bit| target == bit.target() && mask.contains(*bit))
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_thread_ids(true).with_filter(mask_filter))
        .init();
}
