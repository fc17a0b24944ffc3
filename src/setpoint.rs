use crate::config::{FanSpeedConfig, TmaConfig};

/// Linear interpolation of `x_target` over [x_start, x_end], clamped at both
/// ends. A zero-length interval yields `val_start`.
pub fn linear(val_start: f64, val_end: f64, x_start: f64, x_end: f64, x_target: f64) -> f64 {
    if x_end == x_start {
        return val_start;
    }
    let progress = ((x_target - x_start) / (x_end - x_start)).clamp(0.0, 1.0);
    val_end * progress + val_start * (1.0 - progress)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoolingRate {
    /// Near twilight, or whenever the dome is open.
    Slow,
    /// Daytime with the dome closed.
    Fast,
}

/// The mirror setpoint last sent, and the rate-limited deadbanded step
/// towards a new candidate.
#[derive(Debug, Clone, Default)]
pub struct SetpointState {
    last_applied: Option<f64>,
}

impl SetpointState {
    pub fn last_applied(&self) -> Option<f64> {
        self.last_applied
    }

    pub fn record(&mut self, setpoint: f64) {
        self.last_applied = Some(setpoint);
    }

    /// Next setpoint to apply for `candidate`, or `None` when the change is
    /// inside the deadband. Without a previous setpoint the candidate is
    /// applied as is.
    pub fn decide(&self, candidate: f64, config: &TmaConfig, cooling: CoolingRate) -> Option<f64> {
        if candidate.is_nan() {
            return None;
        }
        let Some(last) = self.last_applied else {
            return Some(candidate);
        };
        let hours_per_cycle = config.m1m3_setpoint_cadence / 3600.0;
        if candidate > last {
            if candidate - last <= config.setpoint_deadband_heating {
                return None;
            }
            Some(candidate.min(last + config.maximum_heating_rate * hours_per_cycle))
        } else {
            if last - candidate <= config.setpoint_deadband_cooling {
                return None;
            }
            let rate = match cooling {
                CoolingRate::Slow => config.slow_cooling_rate,
                CoolingRate::Fast => config.fast_cooling_rate,
            };
            Some(candidate.max(last - rate * hours_per_cycle))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FanDemand {
    pub rpm: f64,
    pub glycol_offset: f64,
}

impl FanDemand {
    /// Both outputs come from the same interpolation of |glass - setpoint|.
    pub fn for_difference(config: &FanSpeedConfig, glass: f64, setpoint: f64) -> Self {
        let difference = (glass - setpoint).abs();
        let interpolate = |at_minimum, at_maximum| {
            linear(
                at_minimum,
                at_maximum,
                config.minimum_temperature_difference,
                config.maximum_temperature_difference,
                difference,
            )
        };
        FanDemand {
            rpm: interpolate(config.minimum_rpm, config.maximum_rpm),
            glycol_offset: interpolate(config.minimum_glycol_offset, config.maximum_glycol_offset),
        }
    }

    pub fn rounded_rpm(&self) -> i32 {
        self.rpm.round() as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn linear_clamps() {
        assert_eq!(linear(500.0, 2000.0, 0.0, 1.0, -1.0), 500.0);
        assert_eq!(linear(500.0, 2000.0, 0.0, 1.0, 0.5), 1250.0);
        assert_eq!(linear(500.0, 2000.0, 0.0, 1.0, 3.0), 2000.0);
        assert_eq!(linear(7.0, 9.0, 2.0, 2.0, 5.0), 7.0);
    }

    #[test]
    fn first_application_is_unconditional() {
        let config = TmaConfig::default();
        let state = SetpointState::default();
        assert_eq!(state.decide(10.0, &config, CoolingRate::Slow), Some(10.0));
        assert_eq!(state.decide(f64::NAN, &config, CoolingRate::Slow), None);
    }

    #[test]
    fn deadband_and_rate_limits() {
        let config = TmaConfig::default();
        let mut state = SetpointState::default();
        state.record(10.0);

        assert_eq!(state.decide(10.05, &config, CoolingRate::Slow), None);
        assert_eq!(state.decide(9.95, &config, CoolingRate::Fast), None);

        // 1 °C/h over a 300 s cadence.
        let warmer = state.decide(12.0, &config, CoolingRate::Slow).unwrap();
        assert_abs_diff_eq!(warmer, 10.0 + 1.0 / 12.0, epsilon = 1e-12);

        let slow = state.decide(5.0, &config, CoolingRate::Slow).unwrap();
        assert_abs_diff_eq!(slow, 10.0 - 1.0 / 12.0, epsilon = 1e-12);
        let fast = state.decide(5.0, &config, CoolingRate::Fast).unwrap();
        assert_abs_diff_eq!(fast, 10.0 - 10.0 / 12.0, epsilon = 1e-12);

        // A step smaller than the limit lands on the candidate.
        assert_eq!(state.decide(9.5, &config, CoolingRate::Fast), Some(9.5));
    }

    #[test]
    fn fan_demand_shares_one_map() {
        let config = FanSpeedConfig::default();
        let idle = FanDemand::for_difference(&config, 10.0, 10.0);
        assert_eq!(idle, FanDemand { rpm: 500.0, glycol_offset: 0.0 });

        let half = FanDemand::for_difference(&config, 9.5, 10.0);
        assert_abs_diff_eq!(half.rpm, 1250.0);
        assert_abs_diff_eq!(half.glycol_offset, -0.5);
        assert_eq!(half.rounded_rpm(), 1250);

        let saturated = FanDemand::for_difference(&config, 14.0, 10.0);
        assert_eq!(saturated, FanDemand { rpm: 2000.0, glycol_offset: -1.0 });
    }

    /// Mirror glass lagging behind its setpoint.
    struct Mirror {
        glass: f64,
    }

    impl Mirror {
        fn update(&mut self, setpoint: f64) {
            self.glass += (setpoint - self.glass) * 0.2;
        }
    }

    /// A warm afternoon ambient followed by a cold evening.
    struct AmbientGen {
        t: f64,
        index: usize,
    }

    impl Iterator for AmbientGen {
        type Item = f64;

        fn next(&mut self) -> Option<f64> {
            if self.index >= 96 {
                return None;
            }
            let result = self.t;
            self.t += if self.index < 36 { 0.05 } else { -0.15 };
            self.index += 1;
            Some(result)
        }
    }

    #[test]
    fn follows_ambient_within_rate_limits() {
        let config = TmaConfig::default();
        let step_hours = config.m1m3_setpoint_cadence / 3600.0;
        let mut state = SetpointState::default();
        let mut mirror = Mirror { glass: 12.0 };
        let mut applied = 0;
        let mut last_ambient = 0.0;

        for (cycle, ambient) in (AmbientGen { t: 12.0, index: 0 }).enumerate() {
            let cooling = if cycle < 60 { CoolingRate::Fast } else { CoolingRate::Slow };
            if let Some(next) = state.decide(ambient, &config, cooling) {
                if let Some(previous) = state.last_applied() {
                    let limit = match (next > previous, cooling) {
                        (true, _) => config.maximum_heating_rate,
                        (false, CoolingRate::Fast) => config.fast_cooling_rate,
                        (false, CoolingRate::Slow) => config.slow_cooling_rate,
                    };
                    assert!((next - previous).abs() <= limit * step_hours + 1e-9);
                }
                state.record(next);
                applied += 1;
            }
            if let Some(setpoint) = state.last_applied() {
                mirror.update(setpoint);
            }
            last_ambient = ambient;
        }

        assert!(applied > 20, "applied {applied} setpoints");
        // Slow cooling cannot keep up with the evening drop.
        let setpoint = state.last_applied().unwrap();
        assert!(setpoint > last_ambient + 1.0, "{setpoint} vs {last_ambient}");
        assert!((mirror.glass - setpoint).abs() < 0.5);
    }
}
