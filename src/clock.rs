use chrono::{DateTime, TimeZone, Utc};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

use crate::error::{EasError, Result};

/// TAI - UTC, valid since 2017-01-01.
pub const TAI_MINUS_UTC: f64 = 37.0;

/// Source of "now" in TAI seconds.
///
/// Anchored once to the wall clock and advanced by the runtime's monotonic
/// clock, so paused-time tests see a continuous, controllable time base.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    anchor_tai: f64,
    anchor: Instant,
}

impl Clock {
    pub fn system() -> Self {
        let unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        Clock::starting_at(unix + TAI_MINUS_UTC)
    }

    pub fn starting_at(tai: f64) -> Self {
        Clock {
            anchor_tai: tai,
            anchor: Instant::now(),
        }
    }

    pub fn now(&self) -> f64 {
        self.anchor_tai + self.anchor.elapsed().as_secs_f64()
    }

    /// Sleep until the given TAI time. Returns immediately for past times.
    pub async fn sleep_until(&self, tai: f64) {
        let remaining = tai - self.now();
        if remaining > 0.0 {
            tokio::time::sleep(duration(remaining)).await;
        }
    }
}

pub fn tai_to_utc(tai: f64) -> Result<DateTime<Utc>> {
    let unix = tai - TAI_MINUS_UTC;
    let secs = unix.floor();
    let nanos = ((unix - secs) * 1e9).round().min(999_999_999.0) as u32;
    Utc.timestamp_opt(secs as i64, nanos)
        .single()
        .ok_or_else(|| EasError::LocalTime(format!("TAI {tai} is out of range")))
}

pub fn utc_to_tai(utc: DateTime<Utc>) -> f64 {
    utc.timestamp() as f64 + f64::from(utc.timestamp_subsec_nanos()) * 1e-9 + TAI_MINUS_UTC
}

/// Non-negative duration from a count of seconds. NaN counts as zero.
pub fn duration(seconds: f64) -> Duration {
    Duration::try_from_secs_f64(seconds.max(0.0)).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn utc_round_trip() -> anyhow::Result<()> {
        let utc = Utc.with_ymd_and_hms(2025, 6, 21, 16, 0, 0).unwrap();
        let tai = utc_to_tai(utc);
        assert_abs_diff_eq!(tai - utc.timestamp() as f64, 37.0);
        assert_eq!(tai_to_utc(tai)?, utc);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn clock_follows_runtime_time() {
        let clock = Clock::starting_at(1000.0);
        tokio::time::advance(Duration::from_secs(90)).await;
        assert_abs_diff_eq!(clock.now(), 1090.0, epsilon = 1e-6);

        clock.sleep_until(1100.0).await;
        assert_abs_diff_eq!(clock.now(), 1100.0, epsilon = 1e-3);
    }
}
