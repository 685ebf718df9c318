//! Tracing subscriber setup.

use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Installs the global fmt subscriber.
///
/// `RUST_LOG` directives are honoured; the configured level (or DEBUG when
/// `verbose` is set) is added on top. `json` forces JSON output even if the
/// configuration asks for text.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init(config: &LoggingConfig, verbose: bool, json: bool) -> bool {
    let level = if verbose {
        Level::DEBUG
    } else {
        Level::from(config.level)
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if json || config.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init()
            .is_ok()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init()
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;

    #[test]
    fn test_second_init_is_refused() {
        let config = LoggingConfig {
            level: LogLevel::Warn,
            json: false,
        };
        init(&config, false, false);
        assert!(!init(&config, true, true));
    }
}
