//! Configuration for the automation, one immutable section per model.
//!
//! Every field has a working default except the ESS indices, which must be
//! supplied; `validate` rejects a configuration without them.

use chrono_tz::Tz;
use serde::Deserialize;

use crate::diurnal::TwilightAltitude;
use crate::error::{EasError, Result};
use crate::solar::Site;

/// A behavior that can be switched off through `features_to_disable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    Vec04,
    Ahu,
    RoomSetpoint,
    GlycolChillers,
    M1m3ts,
    TopEnd,
    RequireDomeOpen,
    Fans,
    /// Any flag this build does not know about. Accepted and ignored.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct FeatureSet(Vec<Feature>);

impl FeatureSet {
    pub fn disabling(features: &[Feature]) -> Self {
        FeatureSet(features.to_vec())
    }

    pub fn is_enabled(&self, feature: Feature) -> bool {
        !self.0.contains(&feature)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WeatherConfig {
    /// Outdoor weather station (wind and temperature).
    pub ess_index: Option<u32>,
    /// Indoor station (temperature and dew point).
    pub indoor_ess_index: Option<u32>,
    pub wind_average_window: f64,
    pub wind_minimum_window: f64,
    pub max_telemetry_age: f64,
}

impl Default for WeatherConfig {
    fn default() -> Self {
        WeatherConfig {
            ess_index: None,
            indoor_ess_index: None,
            wind_average_window: 1800.0,
            wind_minimum_window: 600.0,
            max_telemetry_age: 300.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DomeConfig {
    /// Percent open below which a shutter door or louver counts as closed.
    pub open_threshold: f64,
    pub max_telemetry_age: f64,
}

impl Default for DomeConfig {
    fn default() -> Self {
        DomeConfig {
            open_threshold: 50.0,
            max_telemetry_age: 300.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HvacConfig {
    pub wind_threshold: f64,
    pub vec04_hold_time: f64,
    pub setpoint_lower_limit: f64,
    pub glycol_band_low: f64,
    pub glycol_band_high: f64,
    pub glycol_average_offset: f64,
    pub glycol_dew_point_margin: f64,
    pub glycol_setpoints_delta: f64,
    pub glycol_absolute_minimum: f64,
    pub glycol_absolute_maximum: f64,
    pub cycle_time: f64,
}

impl Default for HvacConfig {
    fn default() -> Self {
        HvacConfig {
            wind_threshold: 5.0,
            vec04_hold_time: 300.0,
            setpoint_lower_limit: 6.0,
            glycol_band_low: -10.0,
            glycol_band_high: -5.0,
            glycol_average_offset: -7.5,
            glycol_dew_point_margin: 1.0,
            glycol_setpoints_delta: 1.0,
            glycol_absolute_minimum: -10.0,
            glycol_absolute_maximum: 20.0,
            cycle_time: 60.0,
        }
    }
}

/// Fan speed and glycol offset as a function of |glass - setpoint|.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FanSpeedConfig {
    pub minimum_rpm: f64,
    pub maximum_rpm: f64,
    pub minimum_temperature_difference: f64,
    pub maximum_temperature_difference: f64,
    /// Glycol offset at the minimum difference.
    pub minimum_glycol_offset: f64,
    /// Glycol offset at the maximum difference.
    pub maximum_glycol_offset: f64,
}

impl Default for FanSpeedConfig {
    fn default() -> Self {
        FanSpeedConfig {
            minimum_rpm: 500.0,
            maximum_rpm: 2000.0,
            minimum_temperature_difference: 0.0,
            maximum_temperature_difference: 1.0,
            minimum_glycol_offset: 0.0,
            maximum_glycol_offset: -1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TmaConfig {
    pub ess_timeout: f64,
    pub m1m3_setpoint_cadence: f64,
    pub glycol_setpoint_delta: f64,
    pub heater_setpoint_delta: f64,
    pub top_end_setpoint_delta: f64,
    pub setpoint_deadband_heating: f64,
    pub setpoint_deadband_cooling: f64,
    /// °C per hour
    pub maximum_heating_rate: f64,
    pub slow_cooling_rate: f64,
    pub fast_cooling_rate: f64,
    /// Fast cooling stops this long before twilight.
    pub slow_cooling_lead_time: f64,
    pub dome_open_delay: f64,
    pub fan_speed: FanSpeedConfig,
}

impl Default for TmaConfig {
    fn default() -> Self {
        TmaConfig {
            ess_timeout: 120.0,
            m1m3_setpoint_cadence: 300.0,
            glycol_setpoint_delta: -2.0,
            heater_setpoint_delta: -1.0,
            top_end_setpoint_delta: -1.0,
            setpoint_deadband_heating: 0.1,
            setpoint_deadband_cooling: 0.1,
            maximum_heating_rate: 1.0,
            slow_cooling_rate: 1.0,
            fast_cooling_rate: 10.0,
            slow_cooling_lead_time: 3600.0,
            dome_open_delay: 300.0,
            fan_speed: FanSpeedConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CommandConfig {
    /// Give up waiting for a component to be enabled after this long.
    pub enable_timeout: Option<f64>,
    /// Poll interval while waiting for a component to be enabled.
    pub dormant_time: f64,
    pub command_timeout: f64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        CommandConfig {
            enable_timeout: None,
            dormant_time: 60.0,
            command_timeout: 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthConfig {
    pub initial_backoff: f64,
    pub max_backoff: f64,
    pub failure_timeout: f64,
    pub max_failures: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        HealthConfig {
            initial_backoff: 10.0,
            max_backoff: 600.0,
            failure_timeout: 3600.0,
            max_failures: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EasConfig {
    pub site: Site,
    pub time_zone: String,
    pub twilight_definition: TwilightAltitude,
    pub weather: WeatherConfig,
    pub dome: DomeConfig,
    pub hvac: HvacConfig,
    pub tma: TmaConfig,
    pub commands: CommandConfig,
    pub health: HealthConfig,
    pub features_to_disable: FeatureSet,
}

impl Default for EasConfig {
    fn default() -> Self {
        EasConfig {
            site: Site::default(),
            time_zone: "America/Santiago".to_string(),
            twilight_definition: TwilightAltitude::default(),
            weather: WeatherConfig::default(),
            dome: DomeConfig::default(),
            hvac: HvacConfig::default(),
            tma: TmaConfig::default(),
            commands: CommandConfig::default(),
            health: HealthConfig::default(),
            features_to_disable: FeatureSet::default(),
        }
    }
}

fn require_positive(name: &str, value: f64) -> Result<()> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(EasError::Config(format!("{name} must be positive, got {value}")))
    }
}

fn require(condition: bool, message: &str) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(EasError::Config(message.to_string()))
    }
}

impl EasConfig {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: EasConfig =
            serde_yaml::from_str(text).map_err(|err| EasError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn time_zone(&self) -> Result<Tz> {
        self.time_zone
            .parse()
            .map_err(|_| EasError::Config(format!("unknown time zone {:?}", self.time_zone)))
    }

    pub fn validate(&self) -> Result<()> {
        self.twilight_definition.degrees()?;
        self.time_zone()?;

        let weather = &self.weather;
        require(weather.ess_index.is_some(), "weather.ess_index is required")?;
        require(
            weather.indoor_ess_index.is_some(),
            "weather.indoor_ess_index is required",
        )?;
        require_positive("weather.wind_average_window", weather.wind_average_window)?;
        require_positive("weather.wind_minimum_window", weather.wind_minimum_window)?;
        require_positive("weather.max_telemetry_age", weather.max_telemetry_age)?;
        require(
            weather.wind_minimum_window <= weather.wind_average_window,
            "weather.wind_minimum_window exceeds wind_average_window",
        )?;

        require_positive("dome.max_telemetry_age", self.dome.max_telemetry_age)?;

        let hvac = &self.hvac;
        require_positive("hvac.wind_threshold", hvac.wind_threshold)?;
        require_positive("hvac.cycle_time", hvac.cycle_time)?;
        require(hvac.vec04_hold_time >= 0.0, "hvac.vec04_hold_time is negative")?;
        require(hvac.glycol_setpoints_delta >= 0.0, "hvac.glycol_setpoints_delta is negative")?;
        require(
            hvac.glycol_band_low <= hvac.glycol_band_high,
            "hvac.glycol_band_low exceeds glycol_band_high",
        )?;
        require(
            hvac.glycol_absolute_minimum + hvac.glycol_setpoints_delta
                <= hvac.glycol_absolute_maximum,
            "hvac glycol absolute limits are narrower than glycol_setpoints_delta",
        )?;

        let tma = &self.tma;
        require_positive("tma.ess_timeout", tma.ess_timeout)?;
        require_positive("tma.m1m3_setpoint_cadence", tma.m1m3_setpoint_cadence)?;
        require_positive("tma.maximum_heating_rate", tma.maximum_heating_rate)?;
        require_positive("tma.slow_cooling_rate", tma.slow_cooling_rate)?;
        require_positive("tma.fast_cooling_rate", tma.fast_cooling_rate)?;
        require(
            tma.setpoint_deadband_heating >= 0.0 && tma.setpoint_deadband_cooling >= 0.0,
            "tma setpoint deadbands must not be negative",
        )?;
        let fan = &tma.fan_speed;
        require(
            fan.maximum_rpm > fan.minimum_rpm,
            "tma.fan_speed.maximum_rpm must exceed minimum_rpm",
        )?;
        require(
            fan.maximum_temperature_difference > fan.minimum_temperature_difference,
            "tma.fan_speed temperature difference range is empty",
        )?;

        require_positive("commands.dormant_time", self.commands.dormant_time)?;
        require_positive("commands.command_timeout", self.commands.command_timeout)?;
        if let Some(timeout) = self.commands.enable_timeout {
            require_positive("commands.enable_timeout", timeout)?;
        }

        let health = &self.health;
        require_positive("health.initial_backoff", health.initial_backoff)?;
        require(
            health.max_backoff >= health.initial_backoff,
            "health.max_backoff is below initial_backoff",
        )?;
        require(health.max_failures > 0, "health.max_failures must be at least 1")?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> EasConfig {
    EasConfig {
        weather: WeatherConfig {
            ess_index: Some(301),
            indoor_ess_index: Some(112),
            ..WeatherConfig::default()
        },
        ..EasConfig::default()
    }
}
