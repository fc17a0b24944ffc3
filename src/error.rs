use eas_protocol::{CommandError, TelemetryError};
use thiserror::Error;

use crate::diurnal::DiurnalEvent;

#[derive(Debug, Error)]
pub enum EasError {
    /// Configuration rejected at load or validation time.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A scheduler query was made before that cycle published a time.
    #[error("{0} time has not been computed yet")]
    NotPublished(DiurnalEvent),

    /// The sun never crossed the target altitude in the search horizon.
    #[error("sun altitude does not cross {target_deg}° within {hours} hours of {start_tai}")]
    NoCrossing {
        target_deg: f64,
        start_tai: f64,
        hours: u32,
    },

    #[error("root finder failed: {0}")]
    RootFinder(String),

    /// Local civil time that cannot be represented (DST gap) or out of range.
    #[error("cannot represent local time: {0}")]
    LocalTime(String),

    #[error("M1M3TS ESS temperature sample has unexpected sensorName {0:?}")]
    SensorName(String),

    #[error("unexpected thermocouple index {0}")]
    ThermocoupleIndex(usize),

    /// No usable ambient temperature arrived within the allowed time.
    #[error("no valid ESS temperature samples received in {seconds} s")]
    NoTemperatureSamples { seconds: f64 },

    #[error("historical query failed: {0}")]
    History(String),

    /// The health monitor gave up on a control loop.
    #[error("{task} failed {failures} times, giving up: {source}")]
    Escalated {
        task: String,
        failures: u32,
        #[source]
        source: Box<EasError>,
    },

    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    #[error(transparent)]
    Command(#[from] CommandError),
}

pub type Result<T, E = EasError> = std::result::Result<T, E>;
