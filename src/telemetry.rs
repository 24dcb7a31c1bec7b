//! Tracing subscriber setup for the binary

use anyhow::Result;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Install the global subscriber. `RUST_LOG` wins over `default_filter`.
pub fn init_tracing(default_filter: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    if json {
        let layer = fmt::layer()
            .json()
            .with_ansi(false)
            .with_target(true)
            .with_filter(filter);
        tracing_subscriber::registry().with(layer).try_init()?;
    } else {
        let layer = fmt::layer().with_target(false).with_filter(filter);
        tracing_subscriber::registry().with(layer).try_init()?;
    }

    Ok(())
}
