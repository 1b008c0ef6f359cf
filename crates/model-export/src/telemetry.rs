// model-export/crates/model-export/src/telemetry.rs

use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber. `RUST_LOG` wins; otherwise `verbose`
/// selects `model_export=debug` over plain `info`.
pub fn init_tracing(verbose: bool) {
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter(verbose).into());

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(env_filter))
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_target(true)
        .with_level(true)
        .compact()
        .finish();

    // a host application may already own the global subscriber
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn default_filter(verbose: bool) -> &'static str {
    if verbose {
        "info,model_export=debug"
    } else {
        "info"
    }
}
