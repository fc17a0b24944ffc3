pub mod aggregate;
pub mod clock;
pub mod config;
pub mod diurnal;
pub mod dome;
pub mod efd;
pub mod error;
pub mod glass;
pub mod health;
pub mod hvac;
pub mod issuer;
pub mod model;
pub mod setpoint;
pub mod solar;
pub mod tma;
pub mod weather;

pub use clock::Clock;
pub use config::{EasConfig, Feature, FeatureSet};
pub use diurnal::{DiurnalEvent, DiurnalTimer};
pub use efd::{HistoricalClient, NoHistory};
pub use error::{EasError, Result};
pub use model::{EasModel, EasState, EasStatus};
