use tracing_subscriber::EnvFilter;

/// `RUST_LOG` wins, then `LOG_LEVEL`, then `info`.
pub fn init() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}
