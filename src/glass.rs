//! M1M3 glass temperature from the thermal scanner thermocouples.
//!
//! Four ESS controllers multiplex their thermocouples through `sensor_name`
//! (`m1m3-ts-<NN> <seq>/<total>`); channel `16 * seq + i` of a controller
//! maps through a fixed layout onto one of [`N_THERMOCOUPLES`] slots.

use eas_protocol::{Subscription, Temperature};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, error};

use crate::aggregate::median;
use crate::clock::Clock;
use crate::error::{EasError, Result};

pub const SAL_INDICES: [u32; 4] = [114, 115, 116, 117];
pub const N_THERMOCOUPLES: usize = 146;
pub const MAX_TIMESTAMP_AGE: f64 = 300.0;

const CHANNELS_PER_SEQUENCE: u32 = 16;

/// (sal_index, first logical index, thermocouple count)
const SCANNER_LAYOUT: [(u32, usize, usize); 4] = [(114, 0, 37), (115, 37, 37), (116, 74, 36), (117, 110, 36)];

/// Logical thermocouple index for a scanner channel.
///
/// Channel 0 of each sequence block is the reference junction and is not a
/// thermocouple. The remaining channels fill the scanner's slots in order.
pub fn find_thermocouple(sal_index: u32, channel: u32) -> Option<usize> {
    let &(_, first, count) = SCANNER_LAYOUT.iter().find(|(index, ..)| *index == sal_index)?;
    let sequence = channel / CHANNELS_PER_SEQUENCE;
    let position = channel % CHANNELS_PER_SEQUENCE;
    if sequence == 0 || position == 0 {
        return None;
    }
    let ordinal = ((sequence - 1) * (CHANNELS_PER_SEQUENCE - 1) + position - 1) as usize;
    (ordinal < count).then_some(first + ordinal)
}

/// Sequence number from `m1m3-ts-<NN> <seq>/<total>`.
pub fn parse_sequence(sensor_name: &str) -> Result<u32> {
    let invalid = || EasError::SensorName(sensor_name.to_string());
    let rest = sensor_name.strip_prefix("m1m3-ts-").ok_or_else(invalid)?;
    let (scanner, fraction) = rest.split_once(' ').ok_or_else(invalid)?;
    if scanner.is_empty() || !scanner.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let (sequence, total) = fraction.split_once('/').ok_or_else(invalid)?;
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !digits(sequence) || !digits(total.split_whitespace().next().unwrap_or("")) {
        return Err(invalid());
    }
    sequence.parse().map_err(|_| invalid())
}

#[derive(Debug, Clone, Copy)]
struct ThermocoupleSample {
    temperature: f64,
    timestamp: f64,
}

pub struct GlassTemperatureModel {
    clock: Clock,
    cache: Mutex<[Option<ThermocoupleSample>; N_THERMOCOUPLES]>,
}

impl GlassTemperatureModel {
    pub fn new(clock: Clock) -> Self {
        GlassTemperatureModel {
            clock,
            cache: Mutex::new([None; N_THERMOCOUPLES]),
        }
    }

    /// Store one scanner sample. Samples from other controllers are ignored;
    /// a malformed sensor name or layout mismatch is an error.
    pub fn temperature_callback(&self, sample: &Temperature) -> Result<()> {
        if !SAL_INDICES.contains(&sample.sal_index) {
            return Ok(());
        }
        let sequence = parse_sequence(&sample.sensor_name).inspect_err(|err| error!("{err}"))?;

        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        for (i, &temperature) in sample.channels().iter().enumerate() {
            let channel = CHANNELS_PER_SEQUENCE * sequence + i as u32;
            let Some(index) = find_thermocouple(sample.sal_index, channel) else {
                continue;
            };
            let slot = cache
                .get_mut(index)
                .ok_or(EasError::ThermocoupleIndex(index))?;
            *slot = Some(ThermocoupleSample {
                temperature,
                timestamp: sample.timestamp,
            });
        }
        Ok(())
    }

    /// Median over thermocouples reported in the last [`MAX_TIMESTAMP_AGE`]
    /// seconds, `None` if there are none.
    pub fn median_temperature(&self) -> Option<f64> {
        let cutoff = self.clock.now() - MAX_TIMESTAMP_AGE;
        let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        median(
            cache
                .iter()
                .flatten()
                .filter(|sample| sample.timestamp > cutoff)
                .map(|sample| sample.temperature),
        )
    }

    pub async fn monitor(&self, mut temperatures: Subscription<Temperature>) -> Result<()> {
        debug!("glass temperature monitor starts");
        while let Some(sample) = temperatures.recv().await {
            self.temperature_callback(&sample)?;
        }
        Ok(())
    }
}
