use chrono::{Duration, NaiveDate, NaiveTime, Weekday};
use figment::{providers::{Env, Format, Toml}, Figment};
use serde::Deserialize;
use std::collections::HashSet;
use thiserror::Error;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::domain::{PointAddress, PointName};

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Configuration errors are fatal at startup: there is no sensible fallback
/// for control thresholds.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] figment::Error),
    #[error("invalid configuration: {0}")]
    Invalid(#[from] ValidationErrors),
    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct Config {
    #[validate(nested)]
    pub controller: ControllerConfig,
    #[validate(nested)]
    pub battery: BatteryConfig,
    pub weekend: WeekendConfig,
    #[validate(nested)]
    pub charge: ChargeConfig,
    #[validate(nested)]
    pub throttle: ThrottleConfig,
    #[validate(nested)]
    pub safety: SafetyConfig,
    pub points: PointsConfig,
    #[serde(default)]
    #[validate(nested)]
    pub pv_lines: Vec<PvLineConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ControllerConfig {
    /// Period of the control cycle (LoopCheckTime)
    #[validate(range(min = 1))]
    pub loop_check_time_s: u64,
    /// Longest tolerated gap between cycles before the watchdog forces one
    #[validate(range(min = 1))]
    pub max_sleep_time_s: u64,
    /// How often unreachable endpoints are probed again
    #[validate(range(min = 1))]
    pub rescan_service_interval_s: u64,
    #[serde(default = "default_true")]
    pub pv_controllable: bool,
}

impl ControllerConfig {
    pub fn loop_check_time(&self) -> Duration {
        Duration::seconds(self.loop_check_time_s as i64)
    }

    /// Gap after which the watchdog runs a cycle by hand.
    pub fn watchdog_grace(&self) -> Duration {
        Duration::seconds(self.max_sleep_time_s as i64 - self.loop_check_time_s as i64)
    }

    pub fn rescan_interval(&self) -> Duration {
        Duration::seconds(self.rescan_service_interval_s as i64)
    }
}

/// Battery charge-curve parameters
#[derive(Debug, Clone, Deserialize, Validate)]
#[validate(schema(function = "validate_battery_curve"))]
pub struct BatteryConfig {
    #[validate(range(min = 0.0, max = 100.0))]
    pub week_stable_soc: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub weekend_stable_soc: f64,
    /// SOC at which the input power drops to 20% of the load
    #[validate(range(min = 0.0, max = 100.0))]
    pub twenty_percent_power_soc: f64,
    #[validate(range(min = 0.0))]
    pub capacity_wh: f64,
    /// Hours in which a low battery should be brought back to its stable SOC
    pub low_battery_recharge_time_h: f64,
}

fn validate_battery_curve(battery: &BatteryConfig) -> Result<(), ValidationError> {
    if battery.low_battery_recharge_time_h <= 0.0 {
        return Err(schema_error(
            "recharge_time",
            "low_battery_recharge_time_h must be positive",
        ));
    }
    if battery.week_stable_soc >= battery.twenty_percent_power_soc
        || battery.weekend_stable_soc >= battery.twenty_percent_power_soc
    {
        return Err(schema_error(
            "stable_soc",
            "stable SOC targets must lie below twenty_percent_power_soc",
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize)]
pub struct WeekendConfig {
    pub start_day: Weekday,
    pub start_time: NaiveTime,
    pub end_day: Weekday,
    pub end_time: NaiveTime,
}

/// Scheduled equalization charge
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ChargeConfig {
    #[serde(default)]
    pub enabled: bool,
    /// First date on which a charge may start
    pub date: NaiveDate,
    pub day: Weekday,
    pub start_time: NaiveTime,
    #[validate(range(min = 1, max = 10080))]
    pub duration_minutes: i64,
    #[validate(range(min = 1, max = 3650))]
    pub interval_days: i64,
    #[validate(range(min = 0.0))]
    pub power_w: f64,
}

impl ChargeConfig {
    pub fn duration(&self) -> Duration {
        Duration::minutes(self.duration_minutes)
    }

    pub fn interval(&self) -> Duration {
        Duration::days(self.interval_days)
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[validate(schema(function = "validate_strong_throttle"))]
pub struct ThrottleConfig {
    /// PV line whose inverters are throttled
    #[serde(default = "default_line")]
    #[validate(length(min = 1))]
    pub line: String,
    /// Baseline grid draw the regulator keeps (MinInPower)
    pub min_in_power_w: f64,
    #[validate(range(min = 0.0))]
    pub throttle_buffer_w: f64,
    #[validate(range(min = 0.0))]
    pub over_throttle_w: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub strong_throttle_min_soc: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub strong_throttle_max_soc: f64,
    #[validate(range(min = 0.0))]
    pub strong_throttle_buffer_w: f64,
}

fn validate_strong_throttle(throttle: &ThrottleConfig) -> Result<(), ValidationError> {
    if throttle.strong_throttle_max_soc <= throttle.strong_throttle_min_soc {
        return Err(schema_error(
            "strong_throttle",
            "strong_throttle_max_soc must be above strong_throttle_min_soc",
        ));
    }
    Ok(())
}

/// Overcurrent protection thresholds
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SafetyConfig {
    pub buildup_threshold_w: f64,
    /// Length of the sliding window, in cycles
    #[validate(range(min = 1, max = 100000))]
    pub buildup_iterations: usize,
    #[validate(range(min = 0.0, max = 100.0))]
    pub buildup_percentage: f64,
    pub critical_threshold_w: f64,
    pub max_inverter_power_w: f64,
    #[validate(range(min = 0, max = 86400))]
    pub duration_s: i64,
}

impl SafetyConfig {
    pub fn duration(&self) -> Duration {
        Duration::seconds(self.duration_s)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    /// Directory for the rotating log file; stdout only when unset
    #[serde(default)]
    pub directory: Option<String>,
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            directory: None,
            file_prefix: default_file_prefix(),
        }
    }
}

/// A measurement or actuator endpoint and the value substituted while it
/// cannot be read.
#[derive(Debug, Clone, Deserialize)]
pub struct PointConfig {
    pub service: String,
    pub path: String,
    #[serde(default)]
    pub default: f64,
}

impl PointConfig {
    pub fn address(&self) -> PointAddress {
        PointAddress::new(&self.service, &self.path)
    }
}

/// Named system points. Keys are snake_case so environment overrides
/// (`ESS__POINTS__SOC__DEFAULT`) reach them.
#[derive(Debug, Clone, Deserialize)]
pub struct PointsConfig {
    pub soc: PointConfig,
    pub l1_out_power: PointConfig,
    pub l1_in_power: PointConfig,
    pub input_source: PointConfig,
    pub ac_setpoint: PointConfig,
}

impl PointsConfig {
    pub fn get(&self, name: PointName) -> &PointConfig {
        match name {
            PointName::Soc => &self.soc,
            PointName::L1OutPower => &self.l1_out_power,
            PointName::L1InPower => &self.l1_in_power,
            PointName::InputSource => &self.input_source,
            PointName::AcSetpoint => &self.ac_setpoint,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct PvLineConfig {
    #[validate(length(min = 1))]
    pub name: String,
    #[serde(default)]
    pub inverters: Vec<PvInverterConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PvInverterConfig {
    pub id: String,
    pub power: PointConfig,
    pub max_power: PointConfig,
    pub power_limit: PointConfig,
}

impl Config {
    /// Load `config/default.toml` overlaid with `ESS__`-prefixed environment
    /// variables (`ESS__THROTTLE__MIN_IN_POWER_W=250`).
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment())
    }

    pub fn figment() -> Figment {
        Figment::new()
            .merge(Toml::file(DEFAULT_CONFIG_PATH))
            .merge(Env::prefixed("ESS__").split("__"))
    }

    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        Self::from_figment(Figment::from(Toml::string(toml)))
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let cfg: Config = figment.extract()?;
        cfg.check()?;
        Ok(cfg)
    }

    /// Field validation plus the checks that span sections.
    pub fn check(&self) -> Result<(), ConfigError> {
        self.validate()?;

        if self.controller.max_sleep_time_s <= self.controller.loop_check_time_s {
            return Err(ConfigError::Inconsistent(format!(
                "max_sleep_time_s ({}) must exceed loop_check_time_s ({})",
                self.controller.max_sleep_time_s, self.controller.loop_check_time_s
            )));
        }

        if self.controller.pv_controllable && self.pv_line(&self.throttle.line).is_none() {
            return Err(ConfigError::Inconsistent(format!(
                "throttled PV line '{}' is not configured",
                self.throttle.line
            )));
        }

        let mut seen = HashSet::new();
        for inverter in self.pv_lines.iter().flat_map(|line| &line.inverters) {
            if !seen.insert(inverter.id.as_str()) {
                return Err(ConfigError::Inconsistent(format!(
                    "duplicate PV inverter id '{}'",
                    inverter.id
                )));
            }
        }

        Ok(())
    }

    pub fn pv_line(&self, name: &str) -> Option<&PvLineConfig> {
        self.pv_lines.iter().find(|line| line.name == name)
    }
}

fn schema_error(code: &'static str, message: &'static str) -> ValidationError {
    let mut err = ValidationError::new(code);
    err.message = Some(message.into());
    err
}

fn default_true() -> bool {
    true
}

fn default_line() -> String {
    "L1".to_string()
}

fn default_level() -> String {
    "info".to_string()
}

fn default_file_prefix() -> String {
    "ess-regulator.log".to_string()
}
