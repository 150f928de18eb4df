//! Structured logging setup, matching the teacher's
//! `runtime::telemetry` module in spirit: `tracing-subscriber` with an
//! env-filter and a switchable plain/JSON formatter.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

pub fn init(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,mcp_gateway_registry=debug"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
