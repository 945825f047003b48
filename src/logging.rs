//! Opt-in tracing subscriber setup for binaries and tests.

/// Install an env-filtered fmt subscriber. Safe to call repeatedly; later
/// calls are no-ops if a subscriber is already set.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .try_init();
}
