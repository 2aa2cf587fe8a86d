//! Tracing subscriber wiring for the gateway binary.
//!
//! Filters from `RUST_LOG`, falling back to a gateway-specific default; formatted with
//! the span-aware text formatter in [`crate::log_format`] so log lines can be
//! correlated back to the trace/span that produced them.

use tracing_subscriber::{fmt, EnvFilter};

use crate::log_format::TextWithSpanIds;

const DEFAULT_FILTER: &str = "info,gateway_core=debug,gateway_transport=debug";

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    fmt()
        .with_env_filter(filter)
        .event_format(TextWithSpanIds::new())
        .init();
}
