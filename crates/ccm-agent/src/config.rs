use ccm_config::helpers::{
    deserialize_humantime_duration, deserialize_optional_humantime_duration,
    serialize_humantime_duration, serialize_optional_humantime_duration,
};
use figment::providers::{Env, Format, Yaml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Floor for both the configured apply interval and the in-worker
/// "skip if just applied" guard.
pub const MIN_INTERVAL: Duration = Duration::from_secs(30);

/// Fixed cadence at which remote sources are probed for change.
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

const DEFAULT_CONFIG_PATH: &str = "./ccm_agent_config.yaml";
const ENV_PREFIX: &str = "CCM_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: String,
        #[source]
        source: figment::Error,
    },
    #[error("`interval` must be >= {min:?}, got {actual:?}")]
    IntervalTooShort { min: Duration, actual: Duration },
    #[error("manifests list must not be empty")]
    NoManifests,
    #[error("cache_dir must be set")]
    NoCacheDir,
    #[error("choria_token_file and choria_seed_file must both be set, or neither")]
    IncompleteCredentialPair,
    #[error("nats_servers must be set when credential files are set")]
    CredentialsWithoutServers,
    #[error("credential file {0:?} does not exist")]
    CredentialFileMissing(PathBuf),
    #[error("log_level must be one of debug, info, warn, error; got {0:?}")]
    InvalidLogLevel(String),
}

impl ccm_error::CcmError for ConfigError {
    fn code(&self) -> ccm_error::ErrorCodes {
        ccm_error::ErrorCodes::InvalidArgument
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AgentConfig {
    #[serde(
        deserialize_with = "deserialize_humantime_duration",
        serialize_with = "serialize_humantime_duration",
        default = "AgentConfig::default_interval"
    )]
    pub interval: Duration,

    #[serde(
        rename = "health_check_interval",
        deserialize_with = "deserialize_optional_humantime_duration",
        serialize_with = "serialize_optional_humantime_duration",
        default
    )]
    pub health_check_interval: Option<Duration>,

    pub manifests: Vec<String>,

    #[serde(default)]
    pub external_data_url: Option<String>,

    pub cache_dir: PathBuf,

    #[serde(default)]
    pub monitor_port: u16,

    #[serde(default = "AgentConfig::default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub nats_context: Option<String>,
    #[serde(default)]
    pub nats_servers: Option<Vec<String>>,
    #[serde(default)]
    pub choria_token_file: Option<PathBuf>,
    #[serde(default)]
    pub choria_seed_file: Option<PathBuf>,
    #[serde(default)]
    pub choria_collective: Option<String>,
    #[serde(default)]
    pub nats_tls_ca: Option<PathBuf>,
    #[serde(default)]
    pub nats_tls_insecure: bool,
}

impl AgentConfig {
    fn default_interval() -> Duration {
        Duration::from_secs(5 * 60)
    }

    fn default_log_level() -> String {
        "info".to_string()
    }

    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path(DEFAULT_CONFIG_PATH)
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut f = figment::Figment::from(Env::prefixed(ENV_PREFIX).map(|k| {
            k.as_str().replace("__", ".").into()
        }));
        if path.exists() {
            f = figment::Figment::from(Yaml::file(path)).merge(f);
        }
        let config: AgentConfig = f.extract().map_err(|source| ConfigError::Load {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval < MIN_INTERVAL {
            return Err(ConfigError::IntervalTooShort {
                min: MIN_INTERVAL,
                actual: self.interval,
            });
        }
        if self.manifests.is_empty() {
            return Err(ConfigError::NoManifests);
        }
        if self.cache_dir.as_os_str().is_empty() {
            return Err(ConfigError::NoCacheDir);
        }
        if !matches!(self.log_level.as_str(), "debug" | "info" | "warn" | "error") {
            return Err(ConfigError::InvalidLogLevel(self.log_level.clone()));
        }

        let has_token = self.choria_token_file.is_some();
        let has_seed = self.choria_seed_file.is_some();
        if has_token != has_seed {
            return Err(ConfigError::IncompleteCredentialPair);
        }
        if has_token && has_seed {
            if self.nats_servers.as_ref().map(|s| s.is_empty()).unwrap_or(true) {
                return Err(ConfigError::CredentialsWithoutServers);
            }
            for path in [
                self.choria_token_file.as_ref().unwrap(),
                self.choria_seed_file.as_ref().unwrap(),
            ] {
                if !path.exists() {
                    return Err(ConfigError::CredentialFileMissing(path.clone()));
                }
            }
        }
        Ok(())
    }

    /// Health-check cycle is disabled when the interval is unset or zero.
    pub fn health_check_enabled(&self) -> bool {
        self.health_check_interval
            .map(|d| !d.is_zero())
            .unwrap_or(false)
    }

    /// Metrics endpoint is disabled when the port is 0.
    pub fn metrics_enabled(&self) -> bool {
        self.monitor_port != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AgentConfig {
        AgentConfig {
            interval: Duration::from_secs(300),
            health_check_interval: None,
            manifests: vec!["/tmp/m.yaml".to_string()],
            external_data_url: None,
            cache_dir: PathBuf::from("/tmp/ccm-cache"),
            monitor_port: 0,
            log_level: "info".to_string(),
            nats_context: None,
            nats_servers: None,
            choria_token_file: None,
            choria_seed_file: None,
            choria_collective: None,
            nats_tls_ca: None,
            nats_tls_insecure: false,
        }
    }

    #[test]
    fn rejects_interval_below_minimum() {
        let mut config = base_config();
        config.interval = Duration::from_secs(29);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::IntervalTooShort { .. })
        ));
    }

    #[test]
    fn accepts_interval_equal_to_minimum() {
        let mut config = base_config();
        config.interval = MIN_INTERVAL;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_empty_manifests() {
        let mut config = base_config();
        config.manifests = vec![];
        assert!(matches!(config.validate(), Err(ConfigError::NoManifests)));
    }

    #[test]
    fn rejects_one_sided_credential_pair() {
        let mut config = base_config();
        config.choria_token_file = Some(PathBuf::from("/tmp/token"));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::IncompleteCredentialPair)
        ));
    }

    #[test]
    fn health_check_disabled_when_zero() {
        let mut config = base_config();
        config.health_check_interval = Some(Duration::ZERO);
        assert!(!config.health_check_enabled());
        config.health_check_interval = Some(Duration::from_secs(60));
        assert!(config.health_check_enabled());
    }

    #[test]
    fn round_trips_through_serialization() {
        let mut config = base_config();
        config.health_check_interval = Some(Duration::from_secs(60));
        config.nats_servers = Some(vec!["nats://localhost:4222".to_string()]);

        let serialized = serde_json::to_string(&config).unwrap();
        let deserialized: AgentConfig = serde_json::from_str(&serialized).unwrap();
        assert_eq!(config, deserialized);
    }
}
