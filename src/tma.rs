//! M1M3 thermal system and top-end setpoints follow the indoor ambient.

use eas_protocol::{Command, Subscription, Temperature, TelemetryError};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::clock::{duration, Clock};
use crate::config::{Feature, FeatureSet, TmaConfig};
use crate::diurnal::{DiurnalEvent, DiurnalTimer};
use crate::dome::DomeModel;
use crate::error::{EasError, Result};
use crate::glass::GlassTemperatureModel;
use crate::issuer::CommandIssuer;
use crate::setpoint::{CoolingRate, FanDemand, SetpointState};
use crate::weather::WeatherModel;

/// Longest wait for a single indoor temperature sample.
const SAMPLE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
struct TmaState {
    setpoint: SetpointState,
    ambient: Option<f64>,
    fan_rpm: Option<i32>,
    fan_glycol_offset: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TmaSnapshot {
    pub ambient: Option<f64>,
    pub last_applied_setpoint: Option<f64>,
    pub fan_rpm: Option<i32>,
    pub fan_glycol_offset: f64,
}

pub struct TmaModel {
    config: TmaConfig,
    features: FeatureSet,
    clock: Clock,
    indoor_ess_index: u32,
    timer: Arc<DiurnalTimer>,
    dome: Arc<DomeModel>,
    weather: Arc<WeatherModel>,
    glass: Arc<GlassTemperatureModel>,
    m1m3ts: CommandIssuer,
    mtmount: CommandIssuer,
    state: Mutex<TmaState>,
}

impl TmaModel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: TmaConfig,
        features: FeatureSet,
        timer: Arc<DiurnalTimer>,
        dome: Arc<DomeModel>,
        weather: Arc<WeatherModel>,
        glass: Arc<GlassTemperatureModel>,
        m1m3ts: CommandIssuer,
        mtmount: CommandIssuer,
    ) -> Self {
        TmaModel {
            clock: *timer.clock(),
            indoor_ess_index: weather.indoor_ess_index(),
            config,
            features,
            timer,
            dome,
            weather,
            glass,
            m1m3ts,
            mtmount,
            state: Mutex::new(TmaState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TmaState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn issuers(&self) -> [&CommandIssuer; 2] {
        [&self.m1m3ts, &self.mtmount]
    }

    pub async fn monitor(&self, temperatures: Subscription<Temperature>) -> Result<()> {
        if !self.features.is_enabled(Feature::M1m3ts) && !self.features.is_enabled(Feature::TopEnd) {
            info!("M1M3TS and top end automation are disabled");
            return Ok(());
        }
        debug!(indoor_ess_index = self.indoor_ess_index, "TMA monitor starts");
        tokio::try_join!(self.follow_ess_indoor(temperatures), self.noon_loop())?;
        Ok(())
    }

    async fn follow_ess_indoor(&self, mut temperatures: Subscription<Temperature>) -> Result<()> {
        loop {
            if self.features.is_enabled(Feature::RequireDomeOpen) {
                self.dome.wait_until_open(self.config.dome_open_delay).await;
            }
            let ambient = self.collect_ambient(&mut temperatures).await?;
            self.lock().ambient = Some(ambient);

            self.apply_top_end(ambient).await;
            if !self.features.is_enabled(Feature::M1m3ts) {
                continue;
            }
            self.update_fans().await;

            let cooling = self.cooling_rate();
            let next = self.lock().setpoint.decide(ambient, &self.config, cooling);
            match next {
                Some(setpoint) => self.apply_setpoints(setpoint).await,
                None => debug!(ambient, "M1M3TS setpoint change within deadband"),
            }
        }
    }

    /// Mean indoor temperature over one cadence.
    ///
    /// A NaN sample or a timeout restarts the cadence. Restarts are only
    /// tolerated for `ess_timeout` seconds after the collection starts; a
    /// later one fails with `NoTemperatureSamples`.
    pub async fn collect_ambient(&self, temperatures: &mut Subscription<Temperature>) -> Result<f64> {
        let cadence = duration(self.config.m1m3_setpoint_cadence);
        let start = Instant::now();
        let deadline = start + duration(self.config.ess_timeout);
        let mut end = start + cadence;
        let mut sum = 0.0;
        let mut count = 0usize;
        let mut warned_nan = false;
        let mut warned_timeout = false;
        temperatures.flush();

        while Instant::now() < end || count == 0 {
            match self.next_indoor_sample(temperatures).await? {
                Some(temperature) if !temperature.is_nan() => {
                    sum += temperature;
                    count += 1;
                    continue;
                }
                Some(_) => {
                    if !warned_nan {
                        warn!(ess_index = self.indoor_ess_index, "Received temperature NaN");
                        warned_nan = true;
                    }
                }
                None => {
                    if !warned_timeout {
                        warn!(ess_index = self.indoor_ess_index, "Timed out while getting temperature");
                        warned_timeout = true;
                    }
                }
            }
            let now = Instant::now();
            if now > deadline {
                error!(
                    ess_index = self.indoor_ess_index,
                    "No usable temperature samples were collected."
                );
                return Err(EasError::NoTemperatureSamples {
                    seconds: self.config.ess_timeout,
                });
            }
            end = now + cadence;
        }
        let average = sum / count as f64;
        debug!(count, average, "collected indoor temperature samples");
        Ok(average)
    }

    async fn next_indoor_sample(&self, temperatures: &mut Subscription<Temperature>) -> Result<Option<f64>> {
        let deadline = Instant::now() + SAMPLE_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match temperatures.next(false, remaining).await {
                Ok(sample) if sample.sal_index == self.indoor_ess_index => return Ok(Some(sample.first())),
                Ok(_) => continue,
                Err(TelemetryError::Timeout { .. }) => return Ok(None),
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Fast cooling only in daylight with the dome closed and twilight far
    /// enough away.
    pub fn cooling_rate(&self) -> CoolingRate {
        let now = self.clock.now();
        let daylight = self.timer.sun_altitude_at(now) > 0.0;
        let twilight_far = self
            .timer
            .seconds_until_twilight(now)
            .is_ok_and(|seconds| seconds > self.config.slow_cooling_lead_time);
        if self.dome.is_closed() == Some(true) && daylight && twilight_far {
            CoolingRate::Fast
        } else {
            CoolingRate::Slow
        }
    }

    async fn apply_setpoints(&self, setpoint: f64) {
        let fan_glycol_offset = {
            let mut state = self.lock();
            state.setpoint.record(setpoint);
            state.fan_glycol_offset
        };
        let glycol_setpoint = setpoint + self.config.glycol_setpoint_delta + fan_glycol_offset;
        let heaters_setpoint = setpoint + self.config.heater_setpoint_delta;
        info!(glycol_setpoint, heaters_setpoint, "Setting MTM1M3TS");
        self.m1m3ts
            .issue(
                "setpoints",
                vec![Command::ApplySetpoints {
                    glycol_setpoint,
                    heaters_setpoint,
                }],
            )
            .await;
    }

    async fn apply_top_end(&self, setpoint: f64) {
        if !self.features.is_enabled(Feature::TopEnd) {
            return;
        }
        let top_end_chiller_setpoint = setpoint + self.config.top_end_setpoint_delta;
        debug!(top_end_chiller_setpoint, "Setting MTMount top end");
        self.mtmount
            .issue(
                "top_end",
                vec![Command::SetThermal {
                    top_end_chiller_setpoint,
                }],
            )
            .await;
    }

    async fn update_fans(&self) {
        if !self.features.is_enabled(Feature::Fans) {
            return;
        }
        let Some(glass) = self.glass.median_temperature() else {
            return;
        };
        let rpm = {
            let mut state = self.lock();
            let Some(setpoint) = state.setpoint.last_applied() else {
                return;
            };
            let demand = FanDemand::for_difference(&self.config.fan_speed, glass, setpoint);
            state.fan_glycol_offset = demand.glycol_offset;
            let rpm = demand.rounded_rpm();
            if state.fan_rpm == Some(rpm) {
                return;
            }
            state.fan_rpm = Some(rpm);
            rpm
        };
        info!(glass, rpm, "Setting M1M3TS fan speed");
        self.m1m3ts
            .issue("fans", vec![Command::uniform_fan_demand(rpm)])
            .await;
    }

    /// At noon the mirror is set to last night's twilight temperature.
    async fn noon_loop(&self) -> Result<()> {
        let mut noon = self.timer.subscribe(DiurnalEvent::Noon);
        while noon.wait().await {
            let Some(twilight) = self.weather.get_last_twilight_temperature().await else {
                warn!("no twilight temperature at noon; M1M3TS setpoint unchanged");
                continue;
            };
            info!(twilight, "Noon M1M3TS and top end set from twilight temperature");
            if self.features.is_enabled(Feature::M1m3ts) {
                self.apply_setpoints(twilight).await;
            }
            self.apply_top_end(twilight).await;
        }
        Ok(())
    }

    pub fn snapshot(&self) -> TmaSnapshot {
        let state = self.lock();
        TmaSnapshot {
            ambient: state.ambient,
            last_applied_setpoint: state.setpoint.last_applied(),
            fan_rpm: state.fan_rpm,
            fan_glycol_offset: state.fan_glycol_offset,
        }
    }
}
