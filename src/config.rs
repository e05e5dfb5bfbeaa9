#![allow(dead_code)]
use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use validator::Validate;

/// Top-level application configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AppConfig {
    #[validate(nested)]
    pub server: ServerConfig,

    #[validate(nested)]
    pub controller: ControllerConfig,

    #[validate(nested)]
    pub battery: BatteryConfig,

    #[validate(nested)]
    pub eos: EosConfig,

    #[validate(nested)]
    pub price: PriceConfig,

    #[validate(nested)]
    pub pv: PvConfig,

    #[validate(nested)]
    pub load_profile: LoadProfileConfig,

    #[validate(nested)]
    pub evcc: EvccConfig,

    #[validate(nested)]
    pub inverter: InverterConfig,

    #[validate(nested)]
    pub mqtt: MqttConfig,

    #[validate(nested)]
    pub telemetry: TelemetryConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ServerConfig {
    #[validate(length(min = 1))]
    pub host: String,

    #[validate(range(min = 1, max = 65535))]
    pub port: u16,

    /// Number of adjacent ports to try on EADDRINUSE before giving up (spec §6).
    #[serde(default = "default_port_fallback_attempts")]
    pub port_fallback_attempts: u16,

    #[serde(default)]
    pub enable_cors: bool,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .context("failed to parse socket address")
    }
}

/// Scheduler loop cadences (spec §4.5).
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ControllerConfig {
    /// IANA timezone name used for all local-hour calculations (load profile
    /// bucketing, `start_hour`). e.g. "Europe/Stockholm".
    #[validate(length(min = 1))]
    pub timezone: String,

    #[validate(range(min = 1, max = 180))]
    pub refresh_interval_minutes: u64,

    #[serde(default = "default_control_tick_seconds")]
    #[validate(range(min = 1, max = 60))]
    pub control_tick_seconds: u64,

    #[serde(default = "default_data_loop_seconds")]
    #[validate(range(min = 1, max = 300))]
    pub data_loop_seconds: u64,

    /// Heartbeat period for unchanged overall-state writes (spec §4.3).
    #[serde(default = "default_heartbeat_minutes")]
    #[validate(range(min = 1, max = 60))]
    pub heartbeat_minutes: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,
}

/// Battery configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[validate(schema(function = "validate_battery_config"))]
pub struct BatteryConfig {
    #[validate(range(min = 0.1, max = 1000.0))]
    pub capacity_wh: f64,

    #[validate(range(min = 0.5, max = 1.0))]
    pub charge_efficiency: f64,

    #[validate(range(min = 0.5, max = 1.0))]
    pub discharge_efficiency: f64,

    #[validate(range(min = 1.0, max = 50000.0))]
    pub max_charge_power_w: f64,

    #[validate(range(min = 1.0, max = 50000.0))]
    pub max_discharge_power_w: f64,

    #[serde(default = "default_min_soc")]
    #[validate(range(min = 0.0, max = 100.0))]
    pub min_soc_percent: f64,

    #[serde(default = "default_max_soc")]
    #[validate(range(min = 0.0, max = 100.0))]
    pub max_soc_percent: f64,

    /// SoC at which `max_charge_power_dyn_w` begins to taper toward zero
    /// (spec §4.1 BatteryInterface).
    #[serde(default = "default_taper_start_soc")]
    #[validate(range(min = 0.0, max = 100.0))]
    pub charge_taper_start_soc_percent: f64,

    /// OpenHAB or Home Assistant item/entity id exposing SoC.
    #[validate(length(min = 1))]
    pub soc_item: String,

    /// Assumed cost of battery wear per Wh cycled, fed to the solver's ems
    /// block (spec §3 `battery_wear_cost_eur_per_wh`).
    #[serde(default = "default_battery_wear_cost")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub wear_cost_eur_per_wh: f64,

    /// Cadence of the SoC poller (spec §4.1 "each adapter polls its
    /// upstream on its own cadence").
    #[serde(default = "default_battery_poll_secs")]
    #[validate(range(min = 1, max = 300))]
    pub poll_interval_secs: u64,
}

fn validate_battery_config(config: &BatteryConfig) -> Result<(), validator::ValidationError> {
    if config.min_soc_percent >= config.max_soc_percent {
        return Err(validator::ValidationError::new(
            "min_soc_percent must be less than max_soc_percent",
        ));
    }
    if config.charge_taper_start_soc_percent > config.max_soc_percent {
        return Err(validator::ValidationError::new(
            "charge_taper_start_soc_percent must not exceed max_soc_percent",
        ));
    }
    Ok(())
}

/// EOS solver client configuration (spec §4.2).
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct EosConfig {
    #[validate(url)]
    pub base_url: String,

    #[serde(default = "default_eos_timeout_secs")]
    #[validate(range(min = 1, max = 600))]
    pub timeout_secs: u64,

    /// Rolling average window size for observed solver runtime (spec §4.2.5).
    #[serde(default = "default_runtime_window")]
    #[validate(range(min = 1, max = 50))]
    pub runtime_average_window: usize,

    /// EOS protocol version cutover date, device-aware payload fields are
    /// sent once the client has negotiated a version >= this date.
    #[serde(default = "default_device_aware_since")]
    pub device_aware_since: String,
}

/// Day-ahead price source configuration (spec §6, Tibber example).
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct PriceConfig {
    #[validate(length(min = 1))]
    pub provider: String,

    #[validate(url)]
    pub base_url: String,

    #[serde(default)]
    pub api_token: Option<String>,

    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,

    /// Fraction of the import price used as the feed-in (export) price when
    /// the source does not report one directly.
    #[serde(default = "default_feedin_fraction")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub feedin_price_fraction: f64,

    /// Cadence of the day-ahead price poller (spec §4.1).
    #[serde(default = "default_price_poll_secs")]
    #[validate(range(min = 1, max = 86400))]
    pub poll_interval_secs: u64,
}

/// PV forecast configuration — one or more physical plants (spec §4.1 PvInterface).
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct PvConfig {
    #[validate(url)]
    pub base_url: String,

    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,

    #[validate(length(min = 1))]
    #[validate(nested)]
    pub plants: Vec<PvPlantConfig>,

    /// Cadence of the PV forecast poller (spec §4.1).
    #[serde(default = "default_pv_poll_secs")]
    #[validate(range(min = 1, max = 86400))]
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct PvPlantConfig {
    #[validate(range(min = -90.0, max = 90.0))]
    pub lat: f64,

    #[validate(range(min = -180.0, max = 180.0))]
    pub lon: f64,

    #[validate(range(min = 0.0, max = 360.0))]
    pub azimuth: f64,

    #[validate(range(min = 0.0, max = 90.0))]
    pub tilt: f64,

    #[validate(range(min = 0.0))]
    pub peak_power_w: f64,

    #[validate(range(min = 0.0))]
    pub inverter_power_w: f64,

    #[serde(default = "default_inverter_efficiency")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub inverter_efficiency: f64,

    #[serde(default)]
    pub horizon: Option<String>,
}

/// Load-profile builder configuration (spec §4.4).
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct LoadProfileConfig {
    #[serde(rename_all = "snake_case")]
    pub source: LoadSource,

    #[validate(url)]
    pub base_url: String,

    #[serde(default)]
    pub access_token: Option<String>,

    #[validate(length(min = 1))]
    pub load_sensor: String,

    #[serde(default)]
    pub car_charge_load_sensor: Option<String>,

    #[serde(default)]
    pub additional_load_1_sensor: Option<String>,

    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,

    /// Resolved Open Question #3: thresholds for the legacy OpenHAB
    /// EV-contamination subtraction workaround (spec §4.4 step 5).
    #[serde(default = "default_legacy_subtract_high_wh")]
    pub legacy_subtract_high_wh: f64,

    #[serde(default = "default_legacy_subtract_low_wh")]
    pub legacy_subtract_low_wh: f64,

    #[serde(default)]
    pub apply_legacy_subtraction: bool,

    /// Cadence of the load-history poller feeding the profile builder
    /// (spec §4.1).
    #[serde(default = "default_load_poll_secs")]
    #[validate(range(min = 1, max = 86400))]
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadSource {
    Openhab,
    HomeAssistant,
    Default,
}

/// EVCC adapter configuration (spec §4.1 EvccInterface).
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct EvccConfig {
    #[serde(default)]
    pub enabled: bool,

    #[validate(url)]
    pub base_url: String,

    #[serde(default = "default_evcc_poll_secs")]
    #[validate(range(min = 1, max = 300))]
    pub poll_interval_secs: u64,

    /// When true, control decisions are pushed to EVCC's external-battery
    /// API instead of directly to the inverter (spec §4.1 InverterInterface).
    #[serde(default)]
    pub external_battery_controller: bool,
}

/// Inverter hardware configuration (spec §9 polymorphism note).
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct InverterConfig {
    #[serde(default = "default_inverter_kind")]
    pub kind: InverterKind,

    #[serde(default)]
    pub modbus: Option<ModbusConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InverterKind {
    FroniusGen24,
    FroniusGen24Legacy,
    EvccExternalBattery,
    NoopShowOnly,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ModbusConfig {
    #[validate(length(min = 1))]
    pub host: String,

    #[validate(range(min = 1, max = 65535))]
    pub port: u16,

    #[validate(range(min = 1, max = 247))]
    pub unit_id: u8,

    #[serde(default = "default_modbus_timeout_ms")]
    pub timeout_ms: u64,
}

/// MQTT bridge configuration (spec §4.6).
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct MqttConfig {
    #[serde(default)]
    pub enabled: bool,

    #[validate(length(min = 1))]
    pub broker: String,

    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub tls: bool,

    #[serde(default = "default_base_topic")]
    pub base_topic: String,

    #[serde(default)]
    pub ha_auto_discovery: bool,

    #[serde(default = "default_discovery_prefix")]
    pub ha_auto_discovery_prefix: String,
}

/// Logging / log-ring-buffer configuration (spec §7, §9).
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_log_capacity")]
    pub log_buffer_capacity: usize,

    #[serde(default = "default_alert_capacity")]
    pub alert_buffer_capacity: usize,
}

// --- default value functions -------------------------------------------------

fn default_port_fallback_attempts() -> u16 {
    5
}
fn default_control_tick_seconds() -> u64 {
    1
}
fn default_data_loop_seconds() -> u64 {
    15
}
fn default_heartbeat_minutes() -> u64 {
    5
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_shutdown_grace_seconds() -> u64 {
    2
}
fn default_min_soc() -> f64 {
    10.0
}
fn default_max_soc() -> f64 {
    95.0
}
fn default_taper_start_soc() -> f64 {
    90.0
}
fn default_battery_wear_cost() -> f64 {
    0.0001
}
fn default_eos_timeout_secs() -> u64 {
    120
}
fn default_runtime_window() -> usize {
    5
}
fn default_device_aware_since() -> String {
    "2025-04-09".to_string()
}
fn default_http_timeout_secs() -> u64 {
    10
}
fn default_feedin_fraction() -> f64 {
    0.4
}
fn default_inverter_efficiency() -> f64 {
    0.97
}
fn default_legacy_subtract_high_wh() -> f64 {
    10_800.0
}
fn default_legacy_subtract_low_wh() -> f64 {
    9_200.0
}
fn default_evcc_poll_secs() -> u64 {
    10
}
fn default_battery_poll_secs() -> u64 {
    60
}
fn default_price_poll_secs() -> u64 {
    3600
}
fn default_pv_poll_secs() -> u64 {
    900
}
fn default_load_poll_secs() -> u64 {
    900
}
fn default_inverter_kind() -> InverterKind {
    InverterKind::NoopShowOnly
}
fn default_modbus_timeout_ms() -> u64 {
    2000
}
fn default_mqtt_port() -> u16 {
    1883
}
fn default_base_topic() -> String {
    "oec".to_string()
}
fn default_discovery_prefix() -> String {
    "homeassistant".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_capacity() -> usize {
    10_000
}
fn default_alert_capacity() -> usize {
    2_000
}

impl AppConfig {
    /// Load configuration from TOML files and environment variables.
    ///
    /// Order (later overrides earlier): `config/default.toml`, an optional
    /// `config/local.toml`, then `OEC__`-prefixed environment variables
    /// (`OEC__SERVER__PORT` -> `server.port`).
    pub fn load() -> Result<Self> {
        Self::load_with_env(None)
    }

    pub fn load_with_env(environment: Option<&str>) -> Result<Self> {
        let mut figment = Figment::new().merge(Toml::file("config/default.toml"));

        if let Some(env) = environment {
            figment = figment.merge(Toml::file(format!("config/{env}.toml")));
        } else {
            figment = figment.merge(Toml::file("config/local.toml").nested());
        }

        figment = figment.merge(Env::prefixed("OEC__").split("__"));

        let config: AppConfig = figment.extract().context("failed to parse configuration")?;

        config
            .validate()
            .context("configuration validation failed")?;

        Ok(config)
    }
}

pub type Config = AppConfig;

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_battery_config() -> BatteryConfig {
        BatteryConfig {
            capacity_wh: 10_000.0,
            charge_efficiency: 0.95,
            discharge_efficiency: 0.95,
            max_charge_power_w: 5000.0,
            max_discharge_power_w: 5000.0,
            min_soc_percent: 10.0,
            max_soc_percent: 95.0,
            charge_taper_start_soc_percent: 90.0,
            soc_item: "Battery_SoC".to_string(),
            wear_cost_eur_per_wh: 0.0001,
            poll_interval_secs: 60,
        }
    }

    #[test]
    fn server_config_socket_addr() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
            port_fallback_attempts: 5,
            enable_cors: false,
        };
        assert_eq!(config.socket_addr().unwrap().port(), 8080);
    }

    #[test]
    fn battery_config_validates() {
        assert!(sample_battery_config().validate().is_ok());
    }

    #[test]
    fn battery_config_rejects_inverted_soc_bounds() {
        let mut config = sample_battery_config();
        config.min_soc_percent = 96.0;
        config.max_soc_percent = 95.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn battery_config_rejects_taper_above_max_soc() {
        let mut config = sample_battery_config();
        config.charge_taper_start_soc_percent = 99.0;
        assert!(config.validate().is_err());
    }
}
