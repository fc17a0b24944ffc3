//! Outdoor and indoor weather derived from the ESS stations.

use chrono::Days;
use eas_protocol::{AirFlow, DewPoint, Subscription, Temperature};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use crate::aggregate::{median, Extreme, NightlyExtreme, WindowedAverage};
use crate::clock::{tai_to_utc, Clock};
use crate::config::WeatherConfig;
use crate::diurnal::{DiurnalTimer, DiurnalWaiter};
use crate::efd::{HistoricalClient, ESS_DEW_POINT_TOPIC, ESS_TEMPERATURE_TOPIC};
use crate::error::{EasError, Result};

/// Days searched backwards for a twilight temperature.
const TWILIGHT_BACKFILL_DAYS: u64 = 10;
/// Length of the window after twilight used for the backfilled temperature.
const TWILIGHT_SAMPLE_WINDOW: f64 = 600.0;
const TEMPERATURE_FIELD: &str = "temperatureItem0";
const DEW_POINT_FIELD: &str = "dewPoint";

#[derive(Debug, Clone, Copy)]
struct Reading {
    value: f64,
    timestamp: f64,
}

struct WeatherState {
    wind: WindowedAverage,
    outdoor: Option<Reading>,
    indoor: Option<Reading>,
    minimum_temperature: NightlyExtreme,
    maximum_dew_point: NightlyExtreme,
    last_twilight_temperature: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WeatherSnapshot {
    pub average_windspeed: f64,
    pub current_temperature: f64,
    pub current_indoor_temperature: f64,
    pub nightly_minimum_temperature: f64,
    pub nightly_maximum_indoor_dew_point: f64,
    pub last_twilight_temperature: Option<f64>,
}

pub struct WeatherModel {
    config: WeatherConfig,
    ess_index: u32,
    indoor_ess_index: u32,
    clock: Clock,
    timer: Arc<DiurnalTimer>,
    history: Arc<dyn HistoricalClient>,
    state: Mutex<WeatherState>,
}

impl WeatherModel {
    pub fn new(
        config: WeatherConfig,
        timer: Arc<DiurnalTimer>,
        history: Arc<dyn HistoricalClient>,
    ) -> Result<Self> {
        let ess_index = config
            .ess_index
            .ok_or_else(|| EasError::Config("weather.ess_index is required".to_string()))?;
        let indoor_ess_index = config
            .indoor_ess_index
            .ok_or_else(|| EasError::Config("weather.indoor_ess_index is required".to_string()))?;
        let state = WeatherState {
            wind: WindowedAverage::new(config.wind_average_window, config.wind_minimum_window),
            outdoor: None,
            indoor: None,
            minimum_temperature: NightlyExtreme::new(Extreme::Minimum),
            maximum_dew_point: NightlyExtreme::new(Extreme::Maximum),
            last_twilight_temperature: None,
        };
        Ok(WeatherModel {
            clock: *timer.clock(),
            config,
            ess_index,
            indoor_ess_index,
            timer,
            history,
            state: Mutex::new(state),
        })
    }

    fn lock(&self) -> MutexGuard<'_, WeatherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ess_index(&self) -> u32 {
        self.ess_index
    }

    pub fn indoor_ess_index(&self) -> u32 {
        self.indoor_ess_index
    }

    fn is_night(&self, tai: f64) -> Option<bool> {
        self.timer.is_night(tai).ok()
    }

    pub fn air_flow_callback(&self, sample: &AirFlow) {
        if sample.sal_index != self.ess_index {
            return;
        }
        self.lock().wind.add(sample.speed, sample.timestamp);
    }

    pub fn temperature_callback(&self, sample: &Temperature) {
        let reading = Reading {
            value: sample.first(),
            timestamp: sample.timestamp,
        };
        if sample.sal_index == self.ess_index {
            let is_night = self.is_night(sample.timestamp);
            let mut state = self.lock();
            state.outdoor = Some(reading);
            if let Some(is_night) = is_night {
                state.minimum_temperature.update(reading.value, is_night);
            }
        } else if sample.sal_index == self.indoor_ess_index {
            self.lock().indoor = Some(reading);
        }
    }

    pub fn dew_point_callback(&self, sample: &DewPoint) {
        if sample.sal_index != self.indoor_ess_index {
            return;
        }
        if let Some(is_night) = self.is_night(sample.timestamp) {
            self.lock().maximum_dew_point.update(sample.dew_point, is_night);
        }
    }

    /// Mean wind speed (m/s) over the averaging window; NaN until the
    /// history spans the minimum window.
    pub fn average_windspeed(&self) -> f64 {
        let now = self.clock.now();
        self.lock().wind.average(now)
    }

    fn fresh(&self, reading: Option<Reading>) -> f64 {
        match reading {
            Some(r) if self.clock.now() - r.timestamp <= self.config.max_telemetry_age => r.value,
            _ => f64::NAN,
        }
    }

    pub fn current_temperature(&self) -> f64 {
        let outdoor = self.lock().outdoor;
        self.fresh(outdoor)
    }

    pub fn current_indoor_temperature(&self) -> f64 {
        let indoor = self.lock().indoor;
        self.fresh(indoor)
    }

    pub fn nightly_minimum_temperature(&self) -> f64 {
        self.lock().minimum_temperature.value()
    }

    pub fn nightly_maximum_indoor_dew_point(&self) -> f64 {
        self.lock().maximum_dew_point.value()
    }

    pub fn last_twilight_temperature(&self) -> Option<f64> {
        self.lock().last_twilight_temperature
    }

    #[cfg(test)]
    pub(crate) fn set_last_twilight_temperature(&self, temperature: f64) {
        self.lock().last_twilight_temperature = Some(temperature);
    }

    fn record_twilight(&self) {
        let temperature = self.current_temperature();
        if temperature.is_nan() {
            warn!("no current outdoor temperature at twilight");
            return;
        }
        info!(temperature, "twilight temperature recorded");
        self.lock().last_twilight_temperature = Some(temperature);
    }

    /// The cached twilight temperature, or one backfilled from history.
    ///
    /// Walks back day by day and uses the median outdoor temperature over
    /// the first minutes after that day's twilight. Days with no finite
    /// samples are skipped.
    pub async fn get_last_twilight_temperature(&self) -> Option<f64> {
        if let Some(cached) = self.last_twilight_temperature() {
            return Some(cached);
        }
        let now = self.clock.now();
        let today = match tai_to_utc(now) {
            Ok(utc) => utc.with_timezone(&self.timer.time_zone()).date_naive(),
            Err(err) => {
                warn!("cannot backfill twilight temperature: {err}");
                return None;
            }
        };
        for days_back in 0..TWILIGHT_BACKFILL_DAYS {
            let Some(date) = today.checked_sub_days(Days::new(days_back)) else {
                break;
            };
            let twilight = match self.timer.twilight_on(date) {
                Ok(twilight) => twilight,
                Err(err) => {
                    warn!(%date, "cannot compute twilight: {err}");
                    continue;
                }
            };
            let end = twilight + TWILIGHT_SAMPLE_WINDOW;
            if end > now {
                continue;
            }
            let series = match self
                .history
                .select_time_series(ESS_TEMPERATURE_TOPIC, &[TEMPERATURE_FIELD], twilight, end, self.ess_index)
                .await
            {
                Ok(series) => series,
                Err(err) => {
                    warn!(%date, "twilight temperature query failed: {err}");
                    continue;
                }
            };
            if let Some(temperature) = median(series.column(TEMPERATURE_FIELD).iter().copied()) {
                info!(%date, temperature, "twilight temperature backfilled from history");
                self.lock().last_twilight_temperature = Some(temperature);
                return Some(temperature);
            }
            debug!(%date, "no twilight temperature samples");
        }
        None
    }

    /// If it is night, start tonight's extremes from history since twilight.
    pub async fn seed(&self) -> Result<()> {
        let now = self.clock.now();
        let twilight = self.timer.previous_twilight(now)?;
        if self.timer.sunrise_after(twilight)? <= now {
            return Ok(());
        }
        debug!(twilight, "seeding nightly extremes from history");

        let temperatures = self
            .history
            .select_time_series(ESS_TEMPERATURE_TOPIC, &[TEMPERATURE_FIELD], twilight, now, self.ess_index)
            .await?;
        let minimum = temperatures
            .column(TEMPERATURE_FIELD)
            .iter()
            .copied()
            .filter(|t| t.is_finite())
            .reduce(f64::min);
        if let Some(minimum) = minimum {
            self.lock().minimum_temperature.seed(minimum);
        }

        let dew_points = self
            .history
            .select_time_series(ESS_DEW_POINT_TOPIC, &[DEW_POINT_FIELD], twilight, now, self.indoor_ess_index)
            .await?;
        let maximum = dew_points
            .column(DEW_POINT_FIELD)
            .iter()
            .copied()
            .filter(|t| t.is_finite())
            .reduce(f64::max);
        if let Some(maximum) = maximum {
            self.lock().maximum_dew_point.seed(maximum);
        }
        info!(?minimum, ?maximum, "nightly extremes seeded");
        Ok(())
    }

    pub fn snapshot(&self) -> WeatherSnapshot {
        WeatherSnapshot {
            average_windspeed: self.average_windspeed(),
            current_temperature: self.current_temperature(),
            current_indoor_temperature: self.current_indoor_temperature(),
            nightly_minimum_temperature: self.nightly_minimum_temperature(),
            nightly_maximum_indoor_dew_point: self.nightly_maximum_indoor_dew_point(),
            last_twilight_temperature: self.last_twilight_temperature(),
        }
    }

    /// Feed the model until the telemetry closes or the timer stops.
    pub async fn monitor(
        &self,
        mut air_flow: Subscription<AirFlow>,
        mut temperature: Subscription<Temperature>,
        mut dew_point: Subscription<DewPoint>,
        mut twilight: DiurnalWaiter,
    ) -> Result<()> {
        debug!(ess_index = self.ess_index, indoor_ess_index = self.indoor_ess_index, "weather monitor starts");
        loop {
            tokio::select! {
                sample = air_flow.recv() => match sample {
                    Some(sample) => self.air_flow_callback(&sample),
                    None => return Ok(()),
                },
                sample = temperature.recv() => match sample {
                    Some(sample) => self.temperature_callback(&sample),
                    None => return Ok(()),
                },
                sample = dew_point.recv() => match sample {
                    Some(sample) => self.dew_point_callback(&sample),
                    None => return Ok(()),
                },
                fired = twilight.wait() => {
                    if !fired {
                        return Ok(());
                    }
                    self.record_twilight();
                }
            }
        }
    }
}
