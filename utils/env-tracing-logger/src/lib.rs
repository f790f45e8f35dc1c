use tracing_subscriber::{fmt, layer::SubscriberExt};

struct Guard {}

impl Drop for Guard {
    fn drop(&mut self) {}
}

/// Start console logging filtered by `RUST_LOG`.
pub fn init() -> impl Drop {
    init_with_default("info")
}

/// Start console logging filtered by `RUST_LOG`, falling back to
/// `default_filter` when the variable is unset or unparseable.
pub fn init_with_default(default_filter: &str) -> impl Drop {
    let with_ansi = !cfg!(windows);

    let console_layer = fmt::layer()
        .with_ansi(with_ansi)
        .with_file(true)
        .with_line_number(true);

    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(default_filter));
    let collector = tracing_subscriber::registry().with(console_layer).with(filter);
    tracing::subscriber::set_global_default(collector).expect("set global tracing subscriber");

    if let Ok(var) = std::env::var("RUST_LOG") {
        tracing::debug!("Logging initiated to console with RUST_LOG=\"{var}\".");
    }

    Guard {}
}
