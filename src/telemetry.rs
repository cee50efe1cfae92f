//! Tracing subscriber setup for binaries and tests.

use tracing_subscriber::{fmt, EnvFilter};

/// Install a formatted subscriber filtered by `RUST_LOG`, falling back to
/// `default_filter` when it is unset or invalid.
///
/// Returns `false` if a global subscriber was already installed; calling this
/// more than once is harmless.
pub fn init_tracing(default_filter: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_init_is_tolerated() {
        let _ = init_tracing("recall_core=debug");
        assert!(!init_tracing("recall_core=debug"));
    }
}
