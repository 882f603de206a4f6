//! fleetschema.toml configuration parser.
//!
//! Every section is optional and falls back to defaults, so an empty file
//! is a valid configuration. Durations are strings such as `"500ms"`,
//! `"20s"` or `"2m"`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryPolicy;
use crate::types::VersionRange;

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid duration for {field}: {value:?}")]
    Duration { field: &'static str, value: String },

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub instance: InstanceConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// libpq-style connection string, without the database name.
    pub url: String,
    /// Target database name.
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Registration name; unique per process identity.
    pub name: Option<String>,
    pub min_supported_version: i32,
    pub max_supported_version: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval: String,
    pub lease_ttl: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub base_uri: String,
    /// Directory holding `{id}.sql` snapshot and `{id}.diff.sql` diff scripts.
    pub scripts_dir: Option<String>,
    pub listen_port: u16,
    /// Apply the latest compatible version when the daemon starts.
    pub auto_upgrade: bool,
    /// Highest version the served catalog advertises, even if the scripts
    /// directory holds newer ones.
    pub max_version: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub attempts: u32,
    pub delay: String,
    /// When set, the delay doubles after each failure up to this cap.
    pub max_delay: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "RetryConfig::default_discover")]
    pub discover: RetrySettings,
    #[serde(default = "RetryConfig::default_resolve")]
    pub resolve: RetrySettings,
    #[serde(default = "RetryConfig::default_compatibility")]
    pub compatibility: RetrySettings,
    #[serde(default = "RetryConfig::default_readiness")]
    pub readiness: RetrySettings,
    #[serde(default = "RetryConfig::default_registration")]
    pub registration: RetrySettings,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "host=localhost user=postgres".to_string(),
            name: "fleet".to_string(),
        }
    }
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            name: None,
            min_supported_version: 1,
            max_supported_version: 1,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: "30s".to_string(),
            lease_ttl: "2m".to_string(),
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            base_uri: "http://127.0.0.1:8080".to_string(),
            scripts_dir: None,
            listen_port: 8080,
            auto_upgrade: false,
            max_version: None,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            discover: Self::default_discover(),
            resolve: Self::default_resolve(),
            compatibility: Self::default_compatibility(),
            readiness: Self::default_readiness(),
            registration: Self::default_registration(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self::fixed(5, "2s")
    }
}

impl RetryConfig {
    fn default_discover() -> RetrySettings {
        RetrySettings::fixed(10, "3s")
    }

    fn default_resolve() -> RetrySettings {
        RetrySettings::fixed(5, "5s")
    }

    // Registrations propagate on the heartbeat cadence, so these wait longer.
    fn default_compatibility() -> RetrySettings {
        RetrySettings::fixed(3, "30s")
    }

    fn default_readiness() -> RetrySettings {
        RetrySettings::fixed(5, "30s")
    }

    fn default_registration() -> RetrySettings {
        RetrySettings::fixed(5, "2s")
    }
}

impl RetrySettings {
    pub fn fixed(attempts: u32, delay: &str) -> Self {
        Self {
            attempts,
            delay: delay.to_string(),
            max_delay: None,
        }
    }

    pub fn to_policy(&self, field: &'static str) -> ConfigResult<RetryPolicy> {
        if self.attempts == 0 {
            return Err(ConfigError::Invalid {
                field,
                reason: "attempts must be at least 1".to_string(),
            });
        }
        let delay = duration_field(field, &self.delay)?;
        match &self.max_delay {
            Some(max) => Ok(RetryPolicy::exponential(
                self.attempts,
                delay,
                duration_field(field, max)?,
            )),
            None => Ok(RetryPolicy::fixed(self.attempts, delay)),
        }
    }
}

impl InstanceConfig {
    pub fn supported_range(&self) -> ConfigResult<VersionRange> {
        VersionRange::new(self.min_supported_version, self.max_supported_version).map_err(
            |reason| ConfigError::Invalid {
                field: "instance.min_supported_version",
                reason,
            },
        )
    }

    /// Configured name, or `{hostname}-{pid}` when unset.
    pub fn resolved_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        format!("{host}-{}", std::process::id())
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> ConfigResult<Duration> {
        duration_field("heartbeat.interval", &self.interval)
    }

    pub fn lease_ttl(&self) -> ConfigResult<Duration> {
        duration_field("heartbeat.lease_ttl", &self.lease_ttl)
    }
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> ConfigResult<Self> {
        let config: FleetConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check every derived value once, so later accessors only fail on
    /// programmer error.
    pub fn validate(&self) -> ConfigResult<()> {
        self.instance.supported_range()?;
        let interval = self.heartbeat.interval()?;
        let ttl = self.heartbeat.lease_ttl()?;
        if ttl <= interval {
            return Err(ConfigError::Invalid {
                field: "heartbeat.lease_ttl",
                reason: format!("lease ttl {ttl:?} must exceed heartbeat interval {interval:?}"),
            });
        }
        if let Some(max) = self.catalog.max_version.filter(|max| *max < 1) {
            return Err(ConfigError::Invalid {
                field: "catalog.max_version",
                reason: format!("{max} is not a schema version"),
            });
        }
        self.retry.discover.to_policy("retry.discover")?;
        self.retry.resolve.to_policy("retry.resolve")?;
        self.retry.compatibility.to_policy("retry.compatibility")?;
        self.retry.readiness.to_policy("retry.readiness")?;
        self.retry.registration.to_policy("retry.registration")?;
        Ok(())
    }
}

fn duration_field(field: &'static str, value: &str) -> ConfigResult<Duration> {
    parse_duration(value).ok_or_else(|| ConfigError::Duration {
        field,
        value: value.to_string(),
    })
}

/// Parse a duration string like "5s", "500ms", "1m". A bare number is seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim().parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::Backoff;

    #[test]
    fn empty_file_uses_defaults() {
        let config = FleetConfig::from_toml("").unwrap();
        assert_eq!(config.database.name, "fleet");
        assert_eq!(config.heartbeat.interval().unwrap(), Duration::from_secs(30));
        assert_eq!(config.heartbeat.lease_ttl().unwrap(), Duration::from_secs(120));
        assert_eq!(config.retry.discover.attempts, 10);
        assert!(!config.catalog.auto_upgrade);
    }

    #[test]
    fn parse_full_file() {
        let toml_str = r#"
[database]
url = "host=db user=fleet"
name = "orders"

[instance]
name = "api-1"
min_supported_version = 3
max_supported_version = 5

[heartbeat]
interval = "10s"
lease_ttl = "45s"

[catalog]
base_uri = "http://schema:9000"
scripts_dir = "./schema"
listen_port = 9000
auto_upgrade = true

[retry.readiness]
attempts = 2
delay = "100ms"
max_delay = "1s"
"#;
        let config = FleetConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.instance.resolved_name(), "api-1");
        let range = config.instance.supported_range().unwrap();
        assert_eq!((range.min(), range.max()), (3, 5));
        assert_eq!(config.catalog.listen_port, 9000);

        let readiness = config.retry.readiness.to_policy("retry.readiness").unwrap();
        assert_eq!(readiness.max_attempts, 2);
        assert_eq!(
            readiness.backoff,
            Backoff::Exponential {
                initial: Duration::from_millis(100),
                max: Duration::from_secs(1),
            }
        );
        // Untouched sections keep their defaults.
        assert_eq!(config.retry.registration.attempts, 5);
    }

    #[test]
    fn partial_sections_fill_in_defaults() {
        let toml_str = r#"
[database]
url = "host=db user=fleet"

[instance]
max_supported_version = 3

[catalog]
max_version = 2

[retry.discover]
attempts = 3
"#;
        let config = FleetConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.database.url, "host=db user=fleet");
        assert_eq!(config.database.name, "fleet");
        let range = config.instance.supported_range().unwrap();
        assert_eq!((range.min(), range.max()), (1, 3));
        assert_eq!(config.catalog.max_version, Some(2));
        assert_eq!(config.catalog.listen_port, 8080);

        let discover = config.retry.discover.to_policy("retry.discover").unwrap();
        assert_eq!(discover.max_attempts, 3);
        assert_eq!(
            discover.backoff,
            Backoff::Fixed {
                delay: Duration::from_secs(2)
            }
        );
    }

    #[test]
    fn rejects_non_positive_catalog_cap() {
        let toml_str = r#"
[catalog]
max_version = 0
"#;
        assert!(matches!(
            FleetConfig::from_toml(toml_str),
            Err(ConfigError::Invalid { field: "catalog.max_version", .. })
        ));
    }

    #[test]
    fn rejects_inverted_version_range() {
        let toml_str = r#"
[instance]
min_supported_version = 4
max_supported_version = 2
"#;
        assert!(matches!(
            FleetConfig::from_toml(toml_str),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn rejects_ttl_shorter_than_interval() {
        let toml_str = r#"
[heartbeat]
interval = "1m"
lease_ttl = "30s"
"#;
        assert!(FleetConfig::from_toml(toml_str).is_err());
    }

    #[test]
    fn rejects_bad_duration() {
        let toml_str = r#"
[retry.discover]
attempts = 3
delay = "soon"
"#;
        assert!(matches!(
            FleetConfig::from_toml(toml_str),
            Err(ConfigError::Duration { field: "retry.discover", .. })
        ));
    }

    #[test]
    fn duration_suffixes() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("20s"), Some(Duration::from_secs(20)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("7"), Some(Duration::from_secs(7)));
        assert_eq!(parse_duration("fast"), None);
    }

    #[test]
    fn round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleetschema.toml");
        std::fs::write(&path, FleetConfig::default().to_toml_string().unwrap()).unwrap();
        let config = FleetConfig::from_file(&path).unwrap();
        assert_eq!(config.catalog.listen_port, 8080);
    }
}
