pub mod command;
pub mod telemetry;
pub mod udp;

pub use command::{Ack, Command, CommandError, CommandSender, Component, DeviceId};
pub use telemetry::{
    AirFlow, ApertureShutter, DewPoint, Louvers, Subscription, SummaryState, SummaryStateSample,
    TelemetryBus, TelemetryError, TelemetryFrame, Temperature, Topic,
};
