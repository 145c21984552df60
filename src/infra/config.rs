//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use crate::domain::geo::active_radius;
use anyhow::{ensure, Context};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SiteConfig {
    /// Deployment identifier used as the metrics label
    #[serde(default = "default_site_id")]
    pub id: String,
}

fn default_site_id() -> String {
    "checkin".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckinConfig {
    #[serde(default = "default_geofence_radius_m")]
    pub geofence_radius_m: f64,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_dwell_threshold_secs")]
    pub dwell_threshold_secs: u64,
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// How long the undo action is offered on the check-in notice
    #[serde(default = "default_undo_window_secs")]
    pub undo_window_secs: u64,
    /// Hard expiry of the pending undo record
    #[serde(default = "default_undo_expiry_secs")]
    pub undo_expiry_secs: u64,
}

fn default_geofence_radius_m() -> f64 {
    30.0
}

fn default_min_confidence() -> f64 {
    0.7
}

fn default_dwell_threshold_secs() -> u64 {
    150
}

fn default_tick_interval_secs() -> u64 {
    10
}

fn default_undo_window_secs() -> u64 {
    10
}

fn default_undo_expiry_secs() -> u64 {
    300
}

impl Default for CheckinConfig {
    fn default() -> Self {
        Self {
            geofence_radius_m: default_geofence_radius_m(),
            min_confidence: default_min_confidence(),
            dwell_threshold_secs: default_dwell_threshold_secs(),
            tick_interval_secs: default_tick_interval_secs(),
            undo_window_secs: default_undo_window_secs(),
            undo_expiry_secs: default_undo_expiry_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SettingsConfig {
    #[serde(default = "default_auto_checkin_enabled")]
    pub auto_checkin_enabled: bool,
}

fn default_auto_checkin_enabled() -> bool {
    true
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self { auto_checkin_enabled: default_auto_checkin_enabled() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_base_url")]
    pub base_url: String,
    #[serde(default = "default_validate_path")]
    pub validate_path: String,
    #[serde(default = "default_undo_path")]
    pub undo_path: String,
    /// Project anon key sent as the `apikey` header
    #[serde(default)]
    pub api_key: Option<String>,
    /// User session token; absent means the user is signed out
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default = "default_api_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_api_base_url() -> String {
    "http://localhost:54321".to_string()
}

fn default_validate_path() -> String {
    "/functions/v1/validate-checkin".to_string()
}

fn default_undo_path() -> String {
    "/functions/v1/undo-checkin".to_string()
}

fn default_api_timeout_ms() -> u64 {
    5000
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_api_base_url(),
            validate_path: default_validate_path(),
            undo_path: default_undo_path(),
            api_key: None,
            access_token: None,
            timeout_ms: default_api_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocationConfig {
    #[serde(default = "default_location_listener_enabled")]
    pub listener_enabled: bool,
    #[serde(default = "default_location_listener_port")]
    pub listener_port: u16,
}

fn default_location_listener_enabled() -> bool {
    true
}

fn default_location_listener_port() -> u16 {
    25900
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            listener_enabled: default_location_listener_enabled(),
            listener_port: default_location_listener_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VenuesConfig {
    /// JSON array of venue records
    #[serde(default = "default_venues_file")]
    pub file: String,
    #[serde(default = "default_venues_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_venues_file() -> String {
    "venues.json".to_string()
}

fn default_venues_poll_interval() -> u64 {
    30
}

impl Default for VenuesConfig {
    fn default() -> Self {
        Self { file: default_venues_file(), poll_interval_secs: default_venues_poll_interval() }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct NoticesConfig {
    /// Optional JSONL sink for user-facing notices
    #[serde(default)]
    pub file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default)]
    pub prometheus_port: u16,
}

fn default_metrics_interval() -> u64 {
    60
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval(), prometheus_port: 0 }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub checkin: CheckinConfig,
    #[serde(default)]
    pub settings: SettingsConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub location: LocationConfig,
    #[serde(default)]
    pub venues: VenuesConfig,
    #[serde(default)]
    pub notices: NoticesConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    geofence_radius_m: f64,
    min_confidence: f64,
    dwell_threshold: Duration,
    tick_interval: Duration,
    undo_window: Duration,
    undo_expiry: Duration,
    auto_checkin_enabled: bool,
    api_base_url: String,
    api_validate_path: String,
    api_undo_path: String,
    api_key: Option<String>,
    access_token: Option<String>,
    api_timeout_ms: u64,
    location_listener_enabled: bool,
    location_listener_port: u16,
    venues_file: String,
    venues_poll_interval_secs: u64,
    notices_file: Option<String>,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        let checkin = toml_config.checkin;
        Self {
            site_id: toml_config.site.id,
            geofence_radius_m: checkin.geofence_radius_m,
            min_confidence: checkin.min_confidence,
            dwell_threshold: Duration::from_secs(checkin.dwell_threshold_secs),
            tick_interval: Duration::from_secs(checkin.tick_interval_secs),
            undo_window: Duration::from_secs(checkin.undo_window_secs),
            undo_expiry: Duration::from_secs(checkin.undo_expiry_secs),
            auto_checkin_enabled: toml_config.settings.auto_checkin_enabled,
            api_base_url: toml_config.api.base_url,
            api_validate_path: toml_config.api.validate_path,
            api_undo_path: toml_config.api.undo_path,
            api_key: toml_config.api.api_key,
            access_token: toml_config.api.access_token,
            api_timeout_ms: toml_config.api.timeout_ms,
            location_listener_enabled: toml_config.location.listener_enabled,
            location_listener_port: toml_config.location.listener_port,
            venues_file: toml_config.venues.file,
            venues_poll_interval_secs: toml_config.venues.poll_interval_secs,
            notices_file: toml_config.notices.file,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            prometheus_port: toml_config.metrics.prometheus_port,
            config_file,
        }
    }

    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        // Check for --config argument
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        let config = Self::from_toml(toml_config, path.display().to_string());
        config
            .validate()
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Geofence radius and minimum confidence only make sense as a pair:
    /// together they define the radius in which a dwell can run.
    fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.geofence_radius_m > 0.0, "geofence_radius_m must be positive");
        ensure!(
            (0.0..1.0).contains(&self.min_confidence),
            "min_confidence must be in [0, 1)"
        );
        ensure!(
            active_radius(self.geofence_radius_m, self.min_confidence) > 0.0,
            "geofence_radius_m and min_confidence leave no active radius"
        );
        ensure!(!self.tick_interval.is_zero(), "tick_interval_secs must be positive");
        ensure!(
            self.undo_window <= self.undo_expiry,
            "undo_window_secs must not exceed undo_expiry_secs"
        );
        Ok(())
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load(args: &[String]) -> Self {
        Self::load_from_path(&Self::resolve_config_path(args))
    }

    /// Load configuration from an explicit path, falling back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn geofence_radius_m(&self) -> f64 {
        self.geofence_radius_m
    }

    pub fn min_confidence(&self) -> f64 {
        self.min_confidence
    }

    /// Radius inside which confidence reaches `min_confidence`
    pub fn active_radius_m(&self) -> f64 {
        active_radius(self.geofence_radius_m, self.min_confidence)
    }

    pub fn dwell_threshold(&self) -> Duration {
        self.dwell_threshold
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    pub fn undo_window(&self) -> Duration {
        self.undo_window
    }

    pub fn undo_expiry(&self) -> Duration {
        self.undo_expiry
    }

    pub fn auto_checkin_enabled(&self) -> bool {
        self.auto_checkin_enabled
    }

    pub fn api_base_url(&self) -> &str {
        &self.api_base_url
    }

    pub fn api_validate_url(&self) -> String {
        join_url(&self.api_base_url, &self.api_validate_path)
    }

    pub fn api_undo_url(&self) -> String {
        join_url(&self.api_base_url, &self.api_undo_path)
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    /// A session token is configured
    pub fn is_authenticated(&self) -> bool {
        self.access_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    pub fn api_timeout_ms(&self) -> u64 {
        self.api_timeout_ms
    }

    pub fn location_listener_enabled(&self) -> bool {
        self.location_listener_enabled
    }

    pub fn location_listener_port(&self) -> u16 {
        self.location_listener_port
    }

    pub fn venues_file(&self) -> &str {
        &self.venues_file
    }

    pub fn venues_poll_interval_secs(&self) -> u64 {
        self.venues_poll_interval_secs
    }

    pub fn notices_file(&self) -> Option<&str> {
        self.notices_file.as_deref()
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to toggle the auto check-in setting
    #[cfg(test)]
    pub fn with_auto_checkin_enabled(mut self, enabled: bool) -> Self {
        self.auto_checkin_enabled = enabled;
        self
    }

    /// Builder method for tests to set the session token
    #[cfg(test)]
    pub fn with_access_token(mut self, token: Option<&str>) -> Self {
        self.access_token = token.map(str::to_string);
        self
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}
