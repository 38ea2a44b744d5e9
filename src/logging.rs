use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Initialize the global tracing subscriber.
///
/// Call once at program startup. Respects `RUST_LOG` for filtering; without
/// it, each `-v` raises the level for this crate (info → debug → trace) and
/// `--silent` drops to errors only.
pub fn init(verbose: u8, silent: bool) {
    let default_filter = if silent {
        "luksrku=error"
    } else {
        match verbose {
            0 => "luksrku=info,warn",
            1 => "luksrku=debug,warn",
            _ => "luksrku=trace,warn",
        }
    };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let subscriber = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .compact();
    tracing_subscriber::registry()
        .with(env_filter)
        .with(subscriber)
        .init();
}
