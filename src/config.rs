//! # Configuration Management
//!
//! This module handles loading and validating the hub configuration from a
//! TOML file (`weather-config.toml` by default). It describes where the
//! device is, which BOM feeds to poll, how often, and which output fields
//! are bound to which sinks.
//!
//! Validation happens once, at load time. A configuration that names zero or
//! several location modes, an out-of-range coordinate, or an unknown output
//! field is rejected before the hub starts; nothing in the runtime ever
//! re-checks it.
//!
//! ```toml
//! poll_interval_secs = 300
//!
//! [location]
//! latitude = -37.8136
//! longitude = 144.9631
//!
//! [feeds]
//! warnings = false
//!
//! [[outputs]]
//! field = "temperature"
//!
//! [[outputs]]
//! field = "today_summary"
//! file = "/run/weather/today_summary"
//! ```

use crate::geo::{is_valid_geohash, LocationSpec};
use crate::{FeedKind, FieldId, UnknownField};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default configuration file name, looked up in the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "weather-config.toml";

/// Default poll interval (5 minutes).
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 300;

/// Public BOM API root.
pub const DEFAULT_BASE_URL: &str = "https://api.weather.bom.gov.au/v1";

/// Errors detected while loading or validating a configuration.
///
/// All of these are fatal at start-up.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config file format: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("provide exactly one location method: geohash OR latitude+longitude OR latitude_sensor+longitude_sensor (found {0})")]
    LocationCount(usize),

    #[error("{0} is set without its counterpart")]
    IncompleteLocation(&'static str),

    #[error("latitude must be between -90 and 90, got {0}")]
    LatitudeOutOfRange(f64),

    #[error("longitude must be between -180 and 180, got {0}")]
    LongitudeOutOfRange(f64),

    #[error("'{0}' is not a valid geohash")]
    InvalidGeohash(String),

    #[error(transparent)]
    UnknownField(#[from] UnknownField),

    #[error("field '{0}' is bound more than once")]
    DuplicateBinding(FieldId),

    #[error("poll interval must be at least one second")]
    ZeroInterval,

    #[error("request timeout must be at least one second")]
    ZeroTimeout,
}

/// Hub configuration as written in `weather-config.toml`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Seconds between poll cycles
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Location input, exactly one mode must be filled in
    #[serde(default)]
    pub location: LocationConfig,
    /// Per-feed enable flags
    #[serde(default)]
    pub feeds: FeedToggles,
    /// Provider endpoint and transport limits
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Output field bindings
    #[serde(default)]
    pub outputs: Vec<OutputConfig>,
}

/// The three mutually exclusive ways to locate the device.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LocationConfig {
    pub geohash: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Position input reference (a file holding the current latitude)
    pub latitude_sensor: Option<String>,
    /// Position input reference (a file holding the current longitude)
    pub longitude_sensor: Option<String>,
}

/// Independent enable flags for each feed. All default to on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct FeedToggles {
    #[serde(default = "default_enabled")]
    pub observations: bool,
    #[serde(default = "default_enabled")]
    pub forecast: bool,
    #[serde(default = "default_enabled")]
    pub warnings: bool,
}

impl Default for FeedToggles {
    fn default() -> Self {
        Self {
            observations: true,
            forecast: true,
            warnings: true,
        }
    }
}

impl FeedToggles {
    pub fn is_enabled(&self, kind: FeedKind) -> bool {
        match kind {
            FeedKind::Observations => self.observations,
            FeedKind::Forecast => self.forecast,
            FeedKind::Warnings => self.warnings,
        }
    }

    /// Enabled feeds in cycle order.
    pub fn enabled(&self) -> impl Iterator<Item = FeedKind> + '_ {
        FeedKind::ALL
            .into_iter()
            .filter(move |k| self.is_enabled(*k))
    }
}

/// Which end of the observations list holds the newest reading, when the
/// provider returns a list rather than a single object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationOrder {
    #[default]
    NewestFirst,
    NewestLast,
}

/// Provider API settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_body")]
    pub max_body_bytes: usize,
    #[serde(default)]
    pub observation_order: ObservationOrder,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout(),
            max_body_bytes: default_max_body(),
            observation_order: ObservationOrder::default(),
        }
    }
}

/// One `[[outputs]]` entry.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    /// Field type, one of the fixed catalogue names (e.g. `today_max`)
    pub field: String,
    /// Write the value to this file instead of the log
    #[serde(default)]
    pub file: Option<PathBuf>,
}

/// Where a bound field's values are delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkTarget {
    Log,
    File(PathBuf),
}

/// A configuration that passed validation.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub location: LocationSpec,
    pub feeds: FeedToggles,
    pub poll_interval: Duration,
    pub provider: ProviderSettings,
    pub outputs: Vec<(FieldId, SinkTarget)>,
}

/// Validated provider settings.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub base_url: String,
    pub timeout: Duration,
    pub max_body_bytes: usize,
    pub observation_order: ObservationOrder,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        let raw = ProviderConfig::default();
        Self {
            base_url: raw.base_url,
            timeout: Duration::from_secs(raw.timeout_secs),
            max_body_bytes: raw.max_body_bytes,
            observation_order: raw.observation_order,
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_timeout() -> u64 {
    10
}

fn default_max_body() -> usize {
    64 * 1024
}

impl Default for Config {
    fn default() -> Self {
        Config {
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            location: LocationConfig::default(),
            feeds: FeedToggles::default(),
            provider: ProviderConfig::default(),
            outputs: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from `weather-config.toml` in the working directory.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from the specified path.
    ///
    /// The file is only parsed here; call [`Config::validate`] before use.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        })?;
        let config = toml::from_str::<Config>(&contents)?;
        Ok(config)
    }

    /// Check every start-up invariant and produce the runtime configuration.
    pub fn validate(&self) -> Result<HubConfig, ConfigError> {
        let location = self.location.validate()?;

        if self.poll_interval_secs == 0 {
            return Err(ConfigError::ZeroInterval);
        }
        if self.provider.timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout);
        }

        let mut seen = HashSet::new();
        let mut outputs = Vec::with_capacity(self.outputs.len());
        for out in &self.outputs {
            let field: FieldId = out.field.parse()?;
            if !seen.insert(field) {
                return Err(ConfigError::DuplicateBinding(field));
            }
            let target = match &out.file {
                Some(path) => SinkTarget::File(path.clone()),
                None => SinkTarget::Log,
            };
            outputs.push((field, target));
        }

        Ok(HubConfig {
            location,
            feeds: self.feeds,
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            provider: ProviderSettings {
                base_url: self.provider.base_url.trim_end_matches('/').to_string(),
                timeout: Duration::from_secs(self.provider.timeout_secs),
                max_body_bytes: self.provider.max_body_bytes,
                observation_order: self.provider.observation_order,
            },
            outputs,
        })
    }
}

impl LocationConfig {
    /// Enforce exactly one location mode and the coordinate ranges.
    pub fn validate(&self) -> Result<LocationSpec, ConfigError> {
        if self.latitude.is_some() != self.longitude.is_some() {
            return Err(ConfigError::IncompleteLocation(if self.latitude.is_some() {
                "latitude"
            } else {
                "longitude"
            }));
        }
        if self.latitude_sensor.is_some() != self.longitude_sensor.is_some() {
            return Err(ConfigError::IncompleteLocation(
                if self.latitude_sensor.is_some() {
                    "latitude_sensor"
                } else {
                    "longitude_sensor"
                },
            ));
        }

        let provided = [
            self.geohash.is_some(),
            self.latitude.is_some(),
            self.latitude_sensor.is_some(),
        ]
        .iter()
        .filter(|p| **p)
        .count();
        if provided != 1 {
            return Err(ConfigError::LocationCount(provided));
        }

        if let Some(gh) = &self.geohash {
            if !is_valid_geohash(gh) {
                return Err(ConfigError::InvalidGeohash(gh.clone()));
            }
            // The provider's location paths are case-sensitive
            return Ok(LocationSpec::Geohash(gh.to_ascii_lowercase()));
        }

        if let (Some(lat), Some(lon)) = (self.latitude, self.longitude) {
            check_latitude(lat)?;
            check_longitude(lon)?;
            return Ok(LocationSpec::StaticLatLon { lat, lon });
        }

        match (&self.latitude_sensor, &self.longitude_sensor) {
            (Some(lat_ref), Some(lon_ref)) => Ok(LocationSpec::SensorLatLon {
                lat_ref: lat_ref.clone(),
                lon_ref: lon_ref.clone(),
            }),
            _ => Err(ConfigError::LocationCount(0)),
        }
    }
}

/// Accepts `[-90, 90]`; NaN is rejected.
pub fn check_latitude(lat: f64) -> Result<f64, ConfigError> {
    if (-90.0..=90.0).contains(&lat) {
        Ok(lat)
    } else {
        Err(ConfigError::LatitudeOutOfRange(lat))
    }
}

/// Accepts `[-180, 180]`; NaN is rejected.
pub fn check_longitude(lon: f64) -> Result<f64, ConfigError> {
    if (-180.0..=180.0).contains(&lon) {
        Ok(lon)
    } else {
        Err(ConfigError::LongitudeOutOfRange(lon))
    }
}
