use crate::Environment;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, Layer, fmt, prelude::*};

/// Install the color-eyre panic and error report hooks.
///
/// Reports show the error location but not the environment section. Only the
/// first call has an effect.
pub fn install_color_eyre() {
    let _ = color_eyre::config::HookBuilder::default()
        .display_location_section(true)
        .display_env_section(false)
        .install();
}

/// Filter used when `RUST_LOG` is unset.
///
/// Development keeps Redis and hyper at `info`; consumer loops poll Redis
/// continuously and would drown everything else at `debug`.
pub fn default_directives(environment: &Environment) -> &'static str {
    if environment.is_production() {
        "info"
    } else {
        "debug,redis=info,hyper=info"
    }
}

/// Install the global subscriber: flattened JSON in production, pretty
/// output otherwise, with span-trace capture for color-eyre.
///
/// Calling it again is harmless.
pub fn init_tracing(environment: &Environment) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(environment)));

    let output = if environment.is_production() {
        fmt::layer()
            .json()
            .with_target(false)
            .flatten_event(true)
            .boxed()
    } else {
        fmt::layer()
            .pretty()
            .with_file(false)
            .with_line_number(false)
            .boxed()
    };

    let installed = tracing_subscriber::registry()
        .with(output)
        .with(tracing_error::ErrorLayer::default())
        .with(filter)
        .try_init();

    match installed {
        Ok(()) => info!(environment = ?environment, "Tracing initialized"),
        Err(_) => debug!("Global subscriber already set"),
    }
}
