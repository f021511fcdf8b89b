//! Tracing initialisation shared by binaries and integration harnesses.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` wins over `default_directive` when set. With `json` the
/// structured JSON formatter is used instead of the human-readable one.
///
/// # Returns
/// `false` if a global subscriber was already installed.
pub fn init_tracing(default_directive: &str, json: bool) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let registry = tracing_subscriber::registry().with(filter);

    let installed = if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };
    installed.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_harmless() {
        init_tracing("switchboard_core=debug,info", false);
        assert!(!init_tracing("info", true));
    }
}
