//! HVAC automation: AHUs and the VEC-04 exhaust fan follow the dome,
//! glycol chillers follow ambient, AHU setpoints follow the outdoor
//! temperature.

use eas_protocol::{Command, DeviceId};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::{duration, Clock};
use crate::config::{Feature, FeatureSet, HvacConfig};
use crate::diurnal::{DiurnalEvent, DiurnalTimer};
use crate::dome::DomeModel;
use crate::error::Result;
use crate::issuer::CommandIssuer;
use crate::weather::WeatherModel;

/// Poll interval while the dome state is unknown.
const DOME_POLL: Duration = Duration::from_secs(1);

/// Chiller setpoints (warmer, colder) for an ambient temperature.
///
/// The average sits `glycol_average_offset` from ambient but never below
/// the dew point plus margin. When one side hits an absolute limit both
/// are shifted together so the spread stays `glycol_setpoints_delta`.
pub fn compute_glycol_setpoints(ambient: f64, dew_point: f64, config: &HvacConfig) -> (f64, f64) {
    let mut average = ambient + config.glycol_average_offset;
    if !dew_point.is_nan() {
        average = average.max(dew_point + config.glycol_dew_point_margin);
    }
    let half = config.glycol_setpoints_delta / 2.0;
    let (mut warmer, mut colder) = (average + half, average - half);
    if colder < config.glycol_absolute_minimum {
        colder = config.glycol_absolute_minimum;
        warmer = colder + config.glycol_setpoints_delta;
    } else if warmer > config.glycol_absolute_maximum {
        warmer = config.glycol_absolute_maximum;
        colder = warmer - config.glycol_setpoints_delta;
    }
    (warmer, colder)
}

/// Whether the pair still sits in [band_low, band_high] relative to ambient.
pub fn check_glycol_setpoint(ambient: f64, setpoints: (f64, f64), config: &HvacConfig) -> bool {
    let average = (setpoints.0 + setpoints.1) / 2.0;
    let offset = average - ambient;
    (config.glycol_band_low..=config.glycol_band_high).contains(&offset)
}

#[derive(Debug, Default)]
struct HvacState {
    /// Dome state the AHUs were last switched for.
    dome_closed: Option<bool>,
    vec04_on: Option<bool>,
    /// TAI of the last VEC-04 change.
    last_vec04_time: f64,
    glycol: Option<(f64, f64)>,
    room_setpoint: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HvacSnapshot {
    pub ahus_enabled: Option<bool>,
    pub vec04_on: Option<bool>,
    pub last_vec04_time: f64,
    pub glycol_setpoints: Option<(f64, f64)>,
    pub room_setpoint: Option<f64>,
}

pub struct HvacModel {
    config: HvacConfig,
    features: FeatureSet,
    clock: Clock,
    timer: Arc<DiurnalTimer>,
    dome: Arc<DomeModel>,
    weather: Arc<WeatherModel>,
    issuer: CommandIssuer,
    state: Mutex<HvacState>,
}

impl HvacModel {
    pub fn new(
        config: HvacConfig,
        features: FeatureSet,
        timer: Arc<DiurnalTimer>,
        dome: Arc<DomeModel>,
        weather: Arc<WeatherModel>,
        issuer: CommandIssuer,
    ) -> Self {
        HvacModel {
            clock: *timer.clock(),
            config,
            features,
            timer,
            dome,
            weather,
            issuer,
            state: Mutex::new(HvacState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HvacState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn issuer(&self) -> &CommandIssuer {
        &self.issuer
    }

    pub async fn monitor(&self) -> Result<()> {
        debug!("HVAC monitor starts");
        tokio::try_join!(self.control_loop(), self.noon_loop(), self.sunrise_loop())?;
        Ok(())
    }

    async fn control_loop(&self) -> Result<()> {
        loop {
            let Some(closed) = self.dome.is_closed() else {
                tokio::time::sleep(DOME_POLL).await;
                continue;
            };
            self.control_step(closed).await;
            tokio::time::sleep(duration(self.config.cycle_time)).await;
        }
    }

    /// One control cycle for a known dome state.
    pub async fn control_step(&self, closed: bool) {
        self.control_ahus_and_vec04(closed).await;
        self.follow_indoor_glycol().await;
        self.follow_outdoor_room_setpoint(closed).await;
    }

    async fn control_ahus_and_vec04(&self, closed: bool) {
        let now = self.clock.now();
        let vec04_enabled = self.features.is_enabled(Feature::Vec04);
        let (ahus, vec04) = {
            let mut state = self.lock();
            let mut vec04 = None;
            if vec04_enabled && !closed && now - state.last_vec04_time > self.config.vec04_hold_time {
                let average_windspeed = self.weather.average_windspeed();
                // NaN wind is never calm.
                let calm = average_windspeed < self.config.wind_threshold;
                debug!(average_windspeed, calm, "VEC-04 operation demanded");
                if state.vec04_on != Some(calm) {
                    state.vec04_on = Some(calm);
                    state.last_vec04_time = now;
                    vec04 = Some(calm);
                }
            }

            let mut ahus = None;
            if state.dome_closed != Some(closed) {
                state.dome_closed = Some(closed);
                if self.features.is_enabled(Feature::Ahu) {
                    ahus = Some(closed);
                }
                if closed && vec04_enabled {
                    state.vec04_on = Some(false);
                    state.last_vec04_time = now;
                    vec04 = Some(false);
                }
            }
            (ahus, vec04)
        };

        if let Some(enable) = ahus {
            info!("{} HVAC AHUs", if enable { "Enabling" } else { "Disabling" });
            let commands = DeviceId::LOWER_AHUS
                .iter()
                .map(|&device| device_command(device, enable))
                .collect();
            self.issuer.issue("ahus", commands).await;
        }
        if let Some(enable) = vec04 {
            info!("Turning {} VEC-04 fan", if enable { "on" } else { "off" });
            self.issuer
                .issue("vec04", vec![device_command(DeviceId::VEC04, enable)])
                .await;
        }
    }

    async fn follow_indoor_glycol(&self) {
        if !self.features.is_enabled(Feature::GlycolChillers) {
            return;
        }
        let indoor = self.weather.current_indoor_temperature();
        if indoor.is_nan() {
            return;
        }
        let current = self.lock().glycol;
        if current.is_some_and(|setpoints| check_glycol_setpoint(indoor, setpoints, &self.config)) {
            return;
        }
        let setpoints =
            compute_glycol_setpoints(indoor, self.weather.nightly_maximum_indoor_dew_point(), &self.config);
        debug!(indoor, ?current, ?setpoints, "glycol setpoints out of band");
        self.apply_glycol(setpoints).await;
    }

    async fn apply_glycol(&self, (warmer, colder): (f64, f64)) {
        info!(warmer, colder, "Setting glycol chillers");
        self.lock().glycol = Some((warmer, colder));
        let [warm_chiller, cold_chiller] = DeviceId::CHILLERS;
        self.issuer
            .issue(
                "chillers",
                vec![
                    Command::ConfigChiller {
                        device: warm_chiller,
                        active_setpoint: warmer,
                    },
                    Command::ConfigChiller {
                        device: cold_chiller,
                        active_setpoint: colder,
                    },
                ],
            )
            .await;
    }

    async fn follow_outdoor_room_setpoint(&self, closed: bool) {
        if !closed || !self.features.is_enabled(Feature::RoomSetpoint) {
            return;
        }
        if !matches!(self.timer.is_night(self.clock.now()), Ok(true)) {
            return;
        }
        let outdoor = self.weather.current_temperature();
        if outdoor.is_nan() {
            return;
        }
        let setpoint = outdoor.max(self.config.setpoint_lower_limit);
        if self.lock().room_setpoint == Some(setpoint) {
            return;
        }
        self.apply_room_setpoint(setpoint).await;
    }

    async fn apply_room_setpoint(&self, setpoint: f64) {
        info!(setpoint, "Setting AHU working setpoints");
        self.lock().room_setpoint = Some(setpoint);
        let commands = DeviceId::LOWER_AHUS
            .iter()
            .map(|&device| Command::ConfigLowerAhu {
                device,
                working_setpoint: setpoint,
            })
            .collect();
        self.issuer.issue("room_setpoint", commands).await;
    }

    /// At noon the chillers are set from last night's minimum temperature.
    async fn noon_loop(&self) -> Result<()> {
        let mut noon = self.timer.subscribe(DiurnalEvent::Noon);
        while noon.wait().await {
            if !self.features.is_enabled(Feature::GlycolChillers) {
                continue;
            }
            let minimum = self.weather.nightly_minimum_temperature();
            if minimum.is_nan() {
                warn!("no nightly minimum temperature at noon; glycol setpoints unchanged");
                continue;
            }
            let setpoints =
                compute_glycol_setpoints(minimum, self.weather.nightly_maximum_indoor_dew_point(), &self.config);
            self.apply_glycol(setpoints).await;
        }
        Ok(())
    }

    /// At sunrise the AHUs are set to the last twilight temperature.
    async fn sunrise_loop(&self) -> Result<()> {
        let mut sunrise = self.timer.subscribe(DiurnalEvent::Sunrise);
        while sunrise.wait().await {
            if !self.features.is_enabled(Feature::RoomSetpoint) {
                continue;
            }
            match self.weather.get_last_twilight_temperature().await {
                Some(twilight) => {
                    self.apply_room_setpoint(twilight.max(self.config.setpoint_lower_limit))
                        .await
                }
                None => warn!("no twilight temperature at sunrise; AHU setpoints unchanged"),
            }
        }
        Ok(())
    }

    pub fn snapshot(&self) -> HvacSnapshot {
        let state = self.lock();
        HvacSnapshot {
            ahus_enabled: state.dome_closed,
            vec04_on: state.vec04_on,
            last_vec04_time: state.last_vec04_time,
            glycol_setpoints: state.glycol,
            room_setpoint: state.room_setpoint,
        }
    }
}

fn device_command(device: DeviceId, enable: bool) -> Command {
    if enable {
        Command::EnableDevice { device }
    } else {
        Command::DisableDevice { device }
    }
}
