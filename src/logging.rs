//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

use crate::config::AwgSettings;
use crate::error::{AppResult, AwgError};

/// Installs a `fmt` subscriber filtered at `level`. `RUST_LOG`, when set,
/// takes precedence. A subscriber installed earlier is left in place.
///
/// # Errors
///
/// [`AwgError::Configuration`] if `level` is not a valid filter directive.
pub fn init_logging(level: &str) -> AppResult<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).map_err(|e| {
            AwgError::Configuration(format!("invalid log level '{level}': {e}"))
        })?,
    };

    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_err()
    {
        tracing::debug!("global subscriber already installed");
    }
    Ok(())
}

/// [`init_logging`] with the configured level.
///
/// # Errors
///
/// See [`init_logging`].
pub fn init_from_settings(settings: &AwgSettings) -> AppResult<()> {
    init_logging(&settings.log_level)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_init_twice_is_harmless() {
        std::env::remove_var("RUST_LOG");
        init_logging("debug").unwrap();
        init_from_settings(&AwgSettings::default()).unwrap();
    }

    #[test]
    #[serial]
    fn test_invalid_level() {
        std::env::remove_var("RUST_LOG");
        assert!(matches!(
            init_logging("no=such=level"),
            Err(AwgError::Configuration(_))
        ));
    }
}
