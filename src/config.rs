//! Layered settings using Figment
//!
//! Settings are read from a TOML file and then overridden by environment
//! variables prefixed with `AWG_`; a double underscore separates nested keys:
//!
//! ```text
//! AWG_LOG_LEVEL=debug
//! AWG_INSTRUMENT__RESOURCE="TCPIP0::192.168.1.50::inst0::INSTR"
//! AWG_TRANSFER__OPC_TIMEOUT_MS=120000
//! ```
//!
//! Every field has a default, so a missing file yields [`AwgSettings::default`].

use std::path::Path;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{AppResult, AwgError};
use crate::instrument::awg70000::MAX_AMPLITUDE;

/// Default settings file.
pub const DEFAULT_CONFIG_PATH: &str = "config/awg.toml";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Top-level settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwgSettings {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Connection to the generator
    #[serde(default)]
    pub instrument: InstrumentSettings,
    /// Transfer paths, timeouts and channel defaults
    #[serde(default)]
    pub transfer: TransferSettings,
}

/// VISA connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentSettings {
    /// VISA resource string
    #[serde(default = "default_resource")]
    pub resource: String,
    /// Read/write timeout (ms)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Appended to every command
    #[serde(default = "default_line_terminator")]
    pub line_terminator: String,
}

/// Settings of the transfer path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferSettings {
    /// Deadline for `*OPC?` polling (ms)
    #[serde(default = "default_opc_timeout_ms")]
    pub opc_timeout_ms: u64,
    /// Deadline for the run state after starting playback (ms)
    #[serde(default = "default_play_timeout_ms")]
    pub play_timeout_ms: u64,
    /// Pause between polls (ms)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Directory on the instrument disk receiving `.seqx` files
    #[serde(default = "default_sequence_path")]
    pub sequence_path: String,
    /// Directory on the instrument disk receiving `.wfmx` files
    #[serde(default = "default_waveform_path")]
    pub waveform_path: String,
    /// Channel amplitude (Vpp) used when none is given
    #[serde(default = "default_amplitude")]
    pub default_amplitude: f64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_resource() -> String {
    "TCPIP0::localhost::inst0::INSTR".to_string()
}

fn default_timeout_ms() -> u64 {
    7500
}

fn default_line_terminator() -> String {
    "\n".to_string()
}

fn default_opc_timeout_ms() -> u64 {
    60_000
}

fn default_play_timeout_ms() -> u64 {
    10_000
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_sequence_path() -> String {
    r"C:\Users\OEM\Documents\Sequences".to_string()
}

fn default_waveform_path() -> String {
    r"C:\Users\OEM\Documents\Waveforms".to_string()
}

fn default_amplitude() -> f64 {
    MAX_AMPLITUDE
}

impl Default for AwgSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            instrument: InstrumentSettings::default(),
            transfer: TransferSettings::default(),
        }
    }
}

impl Default for InstrumentSettings {
    fn default() -> Self {
        Self {
            resource: default_resource(),
            timeout_ms: default_timeout_ms(),
            line_terminator: default_line_terminator(),
        }
    }
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            opc_timeout_ms: default_opc_timeout_ms(),
            play_timeout_ms: default_play_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            sequence_path: default_sequence_path(),
            waveform_path: default_waveform_path(),
            default_amplitude: default_amplitude(),
        }
    }
}

impl AwgSettings {
    /// Loads [`DEFAULT_CONFIG_PATH`] plus environment overrides.
    ///
    /// # Errors
    ///
    /// [`AwgError::Config`] for unreadable values, [`AwgError::Configuration`]
    /// when validation fails.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Loads a specific file plus environment overrides.
    ///
    /// # Errors
    ///
    /// See [`AwgSettings::load`].
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("AWG_").split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Checks the loaded values.
    ///
    /// # Errors
    ///
    /// [`AwgError::Configuration`] for an unknown log level, an empty resource,
    /// a zero timeout or poll interval, or a default amplitude outside
    /// (0, 0.5] V.
    pub fn validate(&self) -> AppResult<()> {
        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(AwgError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                LOG_LEVELS.join(", ")
            )));
        }

        if self.instrument.resource.trim().is_empty() {
            return Err(AwgError::Configuration(
                "instrument.resource must not be empty".into(),
            ));
        }

        let durations = [
            ("instrument.timeout_ms", self.instrument.timeout_ms),
            ("transfer.opc_timeout_ms", self.transfer.opc_timeout_ms),
            ("transfer.play_timeout_ms", self.transfer.play_timeout_ms),
            ("transfer.poll_interval_ms", self.transfer.poll_interval_ms),
        ];
        if let Some((key, _)) = durations.iter().find(|(_, ms)| *ms == 0) {
            return Err(AwgError::Configuration(format!("{key} must be positive")));
        }

        let amplitude = self.transfer.default_amplitude;
        if !(amplitude > 0.0 && amplitude <= MAX_AMPLITUDE) {
            return Err(AwgError::Configuration(format!(
                "transfer.default_amplitude {amplitude} V outside (0, {MAX_AMPLITUDE}] V"
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    #[serial]
    fn test_missing_file_gives_defaults() {
        let settings = AwgSettings::load_from("does/not/exist.toml").unwrap();
        assert_eq!(settings, AwgSettings::default());
        assert_eq!(settings.transfer.opc_timeout_ms, 60_000);
        assert_eq!(settings.instrument.timeout_ms, 7500);
    }

    #[test]
    #[serial]
    fn test_file_values_and_partial_sections() {
        let file = write_config(
            r#"
log_level = "debug"

[instrument]
resource = "TCPIP0::10.0.0.7::inst0::INSTR"

[transfer]
poll_interval_ms = 20
default_amplitude = 0.25
"#,
        );
        let settings = AwgSettings::load_from(file.path()).unwrap();
        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.instrument.resource, "TCPIP0::10.0.0.7::inst0::INSTR");
        assert_eq!(settings.instrument.line_terminator, "\n");
        assert_eq!(settings.transfer.poll_interval_ms, 20);
        assert_eq!(settings.transfer.default_amplitude, 0.25);
        assert_eq!(settings.transfer.play_timeout_ms, 10_000);
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let file = write_config("[transfer]\nopc_timeout_ms = 1000\n");
        std::env::set_var("AWG_TRANSFER__OPC_TIMEOUT_MS", "2500");
        let settings = AwgSettings::load_from(file.path());
        std::env::remove_var("AWG_TRANSFER__OPC_TIMEOUT_MS");
        assert_eq!(settings.unwrap().transfer.opc_timeout_ms, 2500);
    }

    #[test]
    #[serial]
    fn test_validation_failures() {
        let file = write_config("log_level = \"loud\"\n");
        let err = AwgSettings::load_from(file.path()).unwrap_err();
        assert!(matches!(err, AwgError::Configuration(_)));
        assert!(err.to_string().contains("loud"));

        let mut settings = AwgSettings::default();
        settings.transfer.poll_interval_ms = 0;
        assert!(settings
            .validate()
            .unwrap_err()
            .to_string()
            .contains("poll_interval_ms"));

        let mut settings = AwgSettings::default();
        settings.transfer.default_amplitude = 0.75;
        assert!(settings.validate().is_err());

        let mut settings = AwgSettings::default();
        settings.instrument.resource = " ".into();
        assert!(settings.validate().is_err());
    }
}
