use migrun_core::wire::DEFAULT_MAX_FRAME_BYTES;
use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use url::Url;

pub const DEFAULT_WS_URL: &str = "ws://127.0.0.1:8000/ws/jobs";
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8000/api";
pub const DEFAULT_HEARTBEAT_SECS: u64 = 25;
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 3_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid {field} '{value}': {source}")]
    InvalidUrl {
        field: &'static str,
        value: String,
        #[source]
        source: url::ParseError,
    },
    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconnectPolicy {
    Fixed(Duration),
    Exponential { initial: Duration, max: Duration },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::Fixed(Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS))
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            ReconnectPolicy::Fixed(delay) => *delay,
            ReconnectPolicy::Exponential { initial, max } => {
                let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
                initial.saturating_mul(factor).min(*max)
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub ws_url: Url,
    pub api_url: Url,
    pub heartbeat_interval: Duration,
    pub reconnect: ReconnectPolicy,
    pub auto_reconnect: bool,
    pub poll_interval: Duration,
    pub max_frame_bytes: usize,
    pub channel_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        ConfigLayer::default()
            .resolve()
            .expect("valid built-in defaults")
    }
}

/// One source of settings. Layers are merged field by field; the upper
/// layer wins wherever it sets a value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigLayer {
    pub ws_url: Option<String>,
    pub api_url: Option<String>,
    pub heartbeat_secs: Option<u64>,
    pub reconnect_delay_ms: Option<u64>,
    /// Enables capped exponential backoff up to this delay.
    pub reconnect_max_ms: Option<u64>,
    pub auto_reconnect: Option<bool>,
    pub poll_interval_ms: Option<u64>,
    pub max_frame_bytes: Option<usize>,
}

impl ConfigLayer {
    /// Reads a TOML layer. A missing file is an empty layer.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn over(self, lower: ConfigLayer) -> ConfigLayer {
        ConfigLayer {
            ws_url: self.ws_url.or(lower.ws_url),
            api_url: self.api_url.or(lower.api_url),
            heartbeat_secs: self.heartbeat_secs.or(lower.heartbeat_secs),
            reconnect_delay_ms: self.reconnect_delay_ms.or(lower.reconnect_delay_ms),
            reconnect_max_ms: self.reconnect_max_ms.or(lower.reconnect_max_ms),
            auto_reconnect: self.auto_reconnect.or(lower.auto_reconnect),
            poll_interval_ms: self.poll_interval_ms.or(lower.poll_interval_ms),
            max_frame_bytes: self.max_frame_bytes.or(lower.max_frame_bytes),
        }
    }

    pub fn resolve(self) -> Result<SessionConfig, ConfigError> {
        let ws_url = parse_url("ws_url", self.ws_url.as_deref().unwrap_or(DEFAULT_WS_URL))?;
        let api_url = parse_url("api_url", self.api_url.as_deref().unwrap_or(DEFAULT_API_URL))?;
        let heartbeat_secs = non_zero(
            "heartbeat_secs",
            self.heartbeat_secs.unwrap_or(DEFAULT_HEARTBEAT_SECS),
        )?;
        let reconnect_delay_ms = non_zero(
            "reconnect_delay_ms",
            self.reconnect_delay_ms.unwrap_or(DEFAULT_RECONNECT_DELAY_MS),
        )?;
        let poll_interval_ms = non_zero(
            "poll_interval_ms",
            self.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
        )?;
        let initial = Duration::from_millis(reconnect_delay_ms);
        let reconnect = match self.reconnect_max_ms {
            Some(max_ms) if max_ms > reconnect_delay_ms => ReconnectPolicy::Exponential {
                initial,
                max: Duration::from_millis(max_ms),
            },
            _ => ReconnectPolicy::Fixed(initial),
        };
        Ok(SessionConfig {
            ws_url,
            api_url,
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            reconnect,
            auto_reconnect: self.auto_reconnect.unwrap_or(true),
            poll_interval: Duration::from_millis(poll_interval_ms),
            max_frame_bytes: self.max_frame_bytes.unwrap_or(DEFAULT_MAX_FRAME_BYTES),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        })
    }
}

fn parse_url(field: &'static str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value.trim()).map_err(|source| ConfigError::InvalidUrl {
        field,
        value: value.to_string(),
        source,
    })
}

fn non_zero(field: &'static str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(ConfigError::ZeroDuration { field });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_reference_timings() {
        let config = SessionConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(25));
        assert_eq!(config.reconnect, ReconnectPolicy::Fixed(Duration::from_millis(3_000)));
        assert_eq!(config.poll_interval, Duration::from_millis(1_000));
        assert!(config.auto_reconnect);
        assert_eq!(config.ws_url.as_str(), DEFAULT_WS_URL);
    }

    #[test]
    fn upper_layer_wins_field_by_field() {
        let file = ConfigLayer {
            ws_url: Some("ws://file.example/ws/jobs".to_string()),
            api_url: Some("http://file.example/api".to_string()),
            poll_interval_ms: Some(500),
            ..ConfigLayer::default()
        };
        let flags = ConfigLayer {
            api_url: Some("http://flag.example/api".to_string()),
            auto_reconnect: Some(false),
            ..ConfigLayer::default()
        };
        let config = flags.over(file).resolve().expect("resolve");
        assert_eq!(config.ws_url.host_str(), Some("file.example"));
        assert_eq!(config.api_url.host_str(), Some("flag.example"));
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert!(!config.auto_reconnect);
    }

    #[test]
    fn loads_toml_file_and_enables_backoff() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            concat!(
                "ws_url = \"wss://jobs.example/ws\"\n",
                "reconnect_delay_ms = 1000\n",
                "reconnect_max_ms = 8000\n",
                "heartbeat_secs = 10"
            )
        )
        .expect("write");
        let layer = ConfigLayer::load(file.path()).expect("load");
        let config = layer.resolve().expect("resolve");
        assert_eq!(config.ws_url.scheme(), "wss");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(
            config.reconnect,
            ReconnectPolicy::Exponential {
                initial: Duration::from_millis(1_000),
                max: Duration::from_millis(8_000),
            }
        );
    }

    #[test]
    fn missing_file_is_an_empty_layer() {
        let dir = tempfile::tempdir().expect("temp dir");
        let layer = ConfigLayer::load(&dir.path().join("absent.toml")).expect("load");
        assert_eq!(layer, ConfigLayer::default());
    }

    #[test]
    fn malformed_file_and_values_are_errors() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "heartbeat_secs = \"soon\"").expect("write");
        assert!(matches!(
            ConfigLayer::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));

        let bad_url = ConfigLayer {
            ws_url: Some("not a url".to_string()),
            ..ConfigLayer::default()
        };
        assert!(matches!(
            bad_url.resolve(),
            Err(ConfigError::InvalidUrl { field: "ws_url", .. })
        ));

        let zero = ConfigLayer {
            poll_interval_ms: Some(0),
            ..ConfigLayer::default()
        };
        assert!(matches!(zero.resolve(), Err(ConfigError::ZeroDuration { .. })));
    }

    #[test]
    fn exponential_delay_doubles_up_to_cap() {
        let policy = ReconnectPolicy::Exponential {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(3),
        };
        assert_eq!(policy.delay(0), Duration::from_millis(500));
        assert_eq!(policy.delay(1), Duration::from_millis(1_000));
        assert_eq!(policy.delay(2), Duration::from_millis(2_000));
        assert_eq!(policy.delay(3), Duration::from_secs(3));
        assert_eq!(policy.delay(40), Duration::from_secs(3));
    }
}
