use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Number of fan coil units on the M1M3 thermal system.
pub const N_FCU: usize = 96;

/// Remote components the automation commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Component {
    #[serde(rename = "HVAC")]
    Hvac,
    #[serde(rename = "MTM1M3TS")]
    M1m3ts,
    #[serde(rename = "MTMount")]
    MtMount,
}

impl Component {
    pub const ALL: [Component; 3] = [Component::Hvac, Component::M1m3ts, Component::MtMount];

    pub fn as_str(self) -> &'static str {
        match self {
            Component::Hvac => "HVAC",
            Component::M1m3ts => "MTM1M3TS",
            Component::MtMount => "MTMount",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HVAC devices addressed by enable/disable/config commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceId {
    #[serde(rename = "lowerAHU01P05")]
    LowerAhu01P05,
    #[serde(rename = "lowerAHU02P05")]
    LowerAhu02P05,
    #[serde(rename = "lowerAHU03P05")]
    LowerAhu03P05,
    #[serde(rename = "lowerAHU04P05")]
    LowerAhu04P05,
    /// VEC-04, the loading bay exhaust fan.
    #[serde(rename = "loadingBayFan04P04")]
    LoadingBayFan04P04,
    #[serde(rename = "chiller01P01")]
    Chiller01P01,
    #[serde(rename = "chiller02P01")]
    Chiller02P01,
}

impl DeviceId {
    pub const LOWER_AHUS: [DeviceId; 4] = [
        DeviceId::LowerAhu01P05,
        DeviceId::LowerAhu02P05,
        DeviceId::LowerAhu03P05,
        DeviceId::LowerAhu04P05,
    ];

    pub const VEC04: DeviceId = DeviceId::LoadingBayFan04P04;

    /// Warmer and colder glycol chiller, in that order.
    pub const CHILLERS: [DeviceId; 2] = [DeviceId::Chiller01P01, DeviceId::Chiller02P01];

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceId::LowerAhu01P05 => "lowerAHU01P05",
            DeviceId::LowerAhu02P05 => "lowerAHU02P05",
            DeviceId::LowerAhu03P05 => "lowerAHU03P05",
            DeviceId::LowerAhu04P05 => "lowerAHU04P05",
            DeviceId::LoadingBayFan04P04 => "loadingBayFan04P04",
            DeviceId::Chiller01P01 => "chiller01P01",
            DeviceId::Chiller02P01 => "chiller02P01",
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "command",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum Command {
    EnableDevice {
        device: DeviceId,
    },
    DisableDevice {
        device: DeviceId,
    },
    ConfigLowerAhu {
        device: DeviceId,
        working_setpoint: f64,
    },
    ConfigChiller {
        device: DeviceId,
        active_setpoint: f64,
    },
    ApplySetpoints {
        glycol_setpoint: f64,
        heaters_setpoint: f64,
    },
    HeaterFanDemand {
        heater_pwm: Vec<f64>,
        fan_rpm: Vec<i32>,
    },
    SetThermal {
        top_end_chiller_setpoint: f64,
    },
}

impl Command {
    pub fn component(&self) -> Component {
        match self {
            Command::EnableDevice { .. }
            | Command::DisableDevice { .. }
            | Command::ConfigLowerAhu { .. }
            | Command::ConfigChiller { .. } => Component::Hvac,
            Command::ApplySetpoints { .. } | Command::HeaterFanDemand { .. } => Component::M1m3ts,
            Command::SetThermal { .. } => Component::MtMount,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::EnableDevice { .. } => "enableDevice",
            Command::DisableDevice { .. } => "disableDevice",
            Command::ConfigLowerAhu { .. } => "configLowerAhu",
            Command::ConfigChiller { .. } => "configChiller",
            Command::ApplySetpoints { .. } => "applySetpoints",
            Command::HeaterFanDemand { .. } => "heaterFanDemand",
            Command::SetThermal { .. } => "setThermal",
        }
    }

    /// Same fan speed on every fan coil unit, heaters off.
    pub fn uniform_fan_demand(rpm: i32) -> Command {
        Command::HeaterFanDemand {
            heater_pwm: vec![0.0; N_FCU],
            fan_rpm: vec![rpm; N_FCU],
        }
    }
}

/// Positive acknowledgement from a component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub result: String,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("{component}.{command} not acknowledged within {timeout:?}")]
    Timeout {
        component: Component,
        command: &'static str,
        timeout: Duration,
    },
    #[error("{component}.{command} rejected: {reason}")]
    Rejected {
        component: Component,
        command: &'static str,
        reason: String,
    },
    #[error("no endpoint configured for {0}")]
    NoEndpoint(Component),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Codec(#[from] serde_json::Error),
}

/// Something that can deliver a command to a remote component.
#[async_trait]
pub trait CommandSender: Send + Sync {
    async fn send(&self, command: &Command, timeout: Duration) -> Result<Ack, CommandError>;
}
