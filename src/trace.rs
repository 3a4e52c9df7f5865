use tracing_subscriber::EnvFilter;

/// Initialize the global subscriber. `REFLECTOR_LOG` takes a full filter
/// expression; otherwise the CLI level applies to this crate and the
/// client.
pub fn init(level: &str) {
    let directives = std::env::var("REFLECTOR_LOG")
        .unwrap_or_else(|_| format!("reflector={level},kubernetes={level}"));

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(directives))
        .init();
}
