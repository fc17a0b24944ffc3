//! Low-precision solar ephemeris and crossing-time search.
//!
//! Altitudes are geometric (no refraction) and good to a few hundredths of
//! a degree, which puts crossing times well inside a minute.

use serde::Deserialize;
use std::f64::consts::PI;

use crate::clock::TAI_MINUS_UTC;
use crate::error::{EasError, Result};

/// Hours of sun altitude scanned when looking for a crossing.
pub const SEARCH_HOURS: u32 = 25;

const SECONDS_PER_HOUR: f64 = 3600.0;
const ROOT_TOLERANCE: f64 = 1e-3;
const ROOT_MAX_ITERATIONS: usize = 100;

/// Geodetic location of the observatory.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct Site {
    pub latitude: f64,
    pub longitude: f64,
    pub elevation: f64,
}

impl Default for Site {
    // Cerro Pachón
    fn default() -> Self {
        Site {
            latitude: -30.2407,
            longitude: -70.7366,
            elevation: 2715.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Sun going down through the target, e.g. evening twilight.
    Descending,
    /// Sun coming up through the target, e.g. sunrise.
    Ascending,
}

fn to_rad(deg: f64) -> f64 {
    deg * PI / 180.0
}

fn to_deg(rad: f64) -> f64 {
    rad * 180.0 / PI
}

/// Sun altitude in degrees above the horizon at a TAI time.
pub fn sun_altitude(site: &Site, tai: f64) -> f64 {
    let unix = tai - TAI_MINUS_UTC;
    // Days from J2000.0
    let n = unix / 86400.0 + 2440587.5 - 2451545.0;

    let mean_longitude = (280.460 + 0.9856474 * n).rem_euclid(360.0);
    let mean_anomaly = to_rad((357.528 + 0.9856003 * n).rem_euclid(360.0));
    let ecliptic_longitude = to_rad(
        mean_longitude + 1.915 * mean_anomaly.sin() + 0.020 * (2.0 * mean_anomaly).sin(),
    );
    let obliquity = to_rad(23.439 - 0.0000004 * n);

    let right_ascension = (obliquity.cos() * ecliptic_longitude.sin()).atan2(ecliptic_longitude.cos());
    let declination = (obliquity.sin() * ecliptic_longitude.sin()).asin();

    let gmst = (280.46061837 + 360.98564736629 * n).rem_euclid(360.0);
    let hour_angle = to_rad(gmst + site.longitude) - right_ascension;

    let latitude = to_rad(site.latitude);
    let sin_altitude = latitude.sin() * declination.sin()
        + latitude.cos() * declination.cos() * hour_angle.cos();
    to_deg(sin_altitude.clamp(-1.0, 1.0).asin())
}

/// First time after `start_tai` at which the sun passes `target_deg` going
/// in `direction`.
///
/// Altitude is sampled hourly to find a bracketing hour, which is then
/// solved with Brent's method. No bracket within [`SEARCH_HOURS`] is an
/// error; a stale previous answer is never substituted.
pub fn next_crossing(site: &Site, start_tai: f64, target_deg: f64, direction: Direction) -> Result<f64> {
    let offset = |t: f64| sun_altitude(site, t) - target_deg;

    let t0 = start_tai + 1.0;
    let mut before = offset(t0);
    for hour in 1..=SEARCH_HOURS {
        let t1 = t0 + f64::from(hour) * SECONDS_PER_HOUR;
        let after = offset(t1);
        let crosses = match direction {
            Direction::Descending => before > 0.0 && after <= 0.0,
            Direction::Ascending => before < 0.0 && after >= 0.0,
        };
        if crosses {
            return brent(offset, t1 - SECONDS_PER_HOUR, t1, ROOT_TOLERANCE, ROOT_MAX_ITERATIONS);
        }
        before = after;
    }

    Err(EasError::NoCrossing {
        target_deg,
        start_tai,
        hours: SEARCH_HOURS,
    })
}

/// Brent's method for a root of `f` in `[a, b]`; `f(a)` and `f(b)` must
/// have opposite signs.
pub fn brent<F: Fn(f64) -> f64>(f: F, a: f64, b: f64, xtol: f64, max_iterations: usize) -> Result<f64> {
    let (mut a, mut b) = (a, b);
    let (mut fa, mut fb) = (f(a), f(b));
    if fa == 0.0 {
        return Ok(a);
    }
    if fb == 0.0 {
        return Ok(b);
    }
    if !(fa.is_finite() && fb.is_finite()) || fa.signum() == fb.signum() {
        return Err(EasError::RootFinder(format!(
            "root not bracketed: f({a}) = {fa}, f({b}) = {fb}"
        )));
    }

    let (mut c, mut fc) = (a, fa);
    let mut d = b - a;
    let mut e = d;

    for _ in 0..max_iterations {
        if fb.signum() == fc.signum() {
            c = a;
            fc = fa;
            d = b - a;
            e = d;
        }
        if fc.abs() < fb.abs() {
            a = b;
            b = c;
            c = a;
            fa = fb;
            fb = fc;
            fc = fa;
        }

        let tol = 2.0 * f64::EPSILON * b.abs() + 0.5 * xtol;
        let m = 0.5 * (c - b);
        if m.abs() <= tol || fb == 0.0 {
            return Ok(b);
        }

        if e.abs() >= tol && fa.abs() > fb.abs() {
            // Inverse quadratic interpolation, or secant when only two points.
            let s = fb / fa;
            let (mut p, mut q) = if a == c {
                (2.0 * m * s, 1.0 - s)
            } else {
                let q = fa / fc;
                let r = fb / fc;
                (
                    s * (2.0 * m * q * (q - r) - (b - a) * (r - 1.0)),
                    (q - 1.0) * (r - 1.0) * (s - 1.0),
                )
            };
            if p > 0.0 {
                q = -q;
            } else {
                p = -p;
            }
            if 2.0 * p < (3.0 * m * q - (tol * q).abs()).min((e * q).abs()) {
                e = d;
                d = p / q;
            } else {
                d = m;
                e = m;
            }
        } else {
            d = m;
            e = m;
        }

        a = b;
        fa = fb;
        b += if d.abs() > tol { d } else { tol.copysign(m) };
        fb = f(b);
    }

    Err(EasError::RootFinder(format!(
        "no convergence after {max_iterations} iterations"
    )))
}
