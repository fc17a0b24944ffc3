//! Noon, twilight and sunrise scheduling.
//!
//! Each event kind runs its own cycle: compute the next occurrence, publish
//! it, sleep until then, wake every waiter, repeat. Waiters subscribe to a
//! per-kind `watch` channel so a wake-up is never lost between polls.

use chrono::{Days, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Deserialize;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::{tai_to_utc, utc_to_tai, Clock};
use crate::error::{EasError, Result};
use crate::solar::{next_crossing, sun_altitude, Direction, Site};

/// Noon closer than this to "now" counts as already passed.
const NOON_LOOKAHEAD: f64 = 1.0;
const MAX_SECONDS_UNTIL: f64 = 25.0 * 3600.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiurnalEvent {
    Noon,
    Twilight,
    Sunrise,
}

impl fmt::Display for DiurnalEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DiurnalEvent::Noon => "noon",
            DiurnalEvent::Twilight => "twilight",
            DiurnalEvent::Sunrise => "sunrise",
        })
    }
}

/// Sun altitude that defines the end of evening twilight.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum TwilightAltitude {
    Degrees(f64),
    Named(String),
}

impl TwilightAltitude {
    pub fn degrees(&self) -> Result<f64> {
        match self {
            TwilightAltitude::Named(name) => match name.as_str() {
                "civil" => Ok(-6.0),
                "nautical" => Ok(-12.0),
                "astronomical" => Ok(-18.0),
                other => Err(EasError::Config(format!(
                    "unknown twilight definition {other:?}"
                ))),
            },
            TwilightAltitude::Degrees(deg) if (-90.0..=0.0).contains(deg) => Ok(*deg),
            TwilightAltitude::Degrees(deg) => Err(EasError::Config(format!(
                "twilight altitude {deg} is outside [-90, 0]"
            ))),
        }
    }
}

impl Default for TwilightAltitude {
    fn default() -> Self {
        TwilightAltitude::Named("astronomical".to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Signal {
    Idle,
    Fired(f64),
    Stopped,
}

struct EventChannel {
    next_time: Mutex<Option<f64>>,
    signal: watch::Sender<Signal>,
}

impl EventChannel {
    fn new() -> Self {
        let (signal, _) = watch::channel(Signal::Idle);
        EventChannel {
            next_time: Mutex::new(None),
            signal,
        }
    }

    fn next_time(&self) -> Option<f64> {
        *self.next_time.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_next_time(&self, time: Option<f64>) {
        *self.next_time.lock().unwrap_or_else(PoisonError::into_inner) = time;
    }
}

/// Handle for waiting on one event kind.
pub struct DiurnalWaiter {
    receiver: watch::Receiver<Signal>,
}

impl DiurnalWaiter {
    /// Waits for the next occurrence. Returns `false` once the timer stops.
    pub async fn wait(&mut self) -> bool {
        if *self.receiver.borrow() == Signal::Stopped {
            return false;
        }
        loop {
            if self.receiver.changed().await.is_err() {
                return false;
            }
            match *self.receiver.borrow_and_update() {
                Signal::Fired(_) => return true,
                Signal::Stopped => return false,
                Signal::Idle => continue,
            }
        }
    }
}

pub struct DiurnalTimer {
    site: Site,
    time_zone: Tz,
    twilight_altitude: f64,
    clock: Clock,
    noon: EventChannel,
    twilight: EventChannel,
    sunrise: EventChannel,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    failure: watch::Sender<Option<String>>,
}

impl DiurnalTimer {
    pub fn new(site: Site, time_zone: Tz, twilight: &TwilightAltitude, clock: Clock) -> Result<Self> {
        let (failure, _) = watch::channel(None);
        Ok(DiurnalTimer {
            site,
            time_zone,
            twilight_altitude: twilight.degrees()?,
            clock,
            noon: EventChannel::new(),
            twilight: EventChannel::new(),
            sunrise: EventChannel::new(),
            tasks: Mutex::new(Vec::new()),
            failure,
        })
    }

    fn channel(&self, event: DiurnalEvent) -> &EventChannel {
        match event {
            DiurnalEvent::Noon => &self.noon,
            DiurnalEvent::Twilight => &self.twilight,
            DiurnalEvent::Sunrise => &self.sunrise,
        }
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn time_zone(&self) -> Tz {
        self.time_zone
    }

    pub fn twilight_altitude(&self) -> f64 {
        self.twilight_altitude
    }

    /// Launch the three event cycles. Does nothing if already running.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if !tasks.is_empty() {
            return;
        }
        self.failure.send_replace(None);
        for event in [DiurnalEvent::Noon, DiurnalEvent::Twilight, DiurnalEvent::Sunrise] {
            self.channel(event).signal.send_replace(Signal::Idle);
            tasks.push(tokio::spawn(Arc::clone(self).run_cycle(event)));
        }
        info!(twilight_altitude = self.twilight_altitude, "diurnal timer started");
    }

    /// Cancel all cycles and release every waiter.
    pub async fn stop(&self) {
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }
        for event in [DiurnalEvent::Noon, DiurnalEvent::Twilight, DiurnalEvent::Sunrise] {
            let channel = self.channel(event);
            channel.set_next_time(None);
            channel.signal.send_replace(Signal::Stopped);
        }
        debug!("diurnal timer stopped");
    }

    pub fn is_running(&self) -> bool {
        !self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    async fn run_cycle(self: Arc<Self>, event: DiurnalEvent) {
        loop {
            let now = self.clock.now();
            let next = match self.compute_next(event, now) {
                Ok(next) => next,
                Err(err) => {
                    error!(%event, "diurnal cycle failed: {err}");
                    self.failure.send_replace(Some(format!("{event} cycle failed: {err}")));
                    return;
                }
            };
            self.channel(event).set_next_time(Some(next));
            debug!(%event, next, in_seconds = next - now, "next diurnal event");

            self.clock.sleep_until(next).await;
            self.channel(event).signal.send_replace(Signal::Fired(next));
            info!(%event, "diurnal event");
        }
    }

    fn compute_next(&self, event: DiurnalEvent, now: f64) -> Result<f64> {
        match event {
            DiurnalEvent::Noon => next_local_noon(now, self.time_zone),
            DiurnalEvent::Twilight => {
                next_crossing(&self.site, now, self.twilight_altitude, Direction::Descending)
            }
            DiurnalEvent::Sunrise => next_crossing(&self.site, now, 0.0, Direction::Ascending),
        }
    }

    pub fn subscribe(&self, event: DiurnalEvent) -> DiurnalWaiter {
        DiurnalWaiter {
            receiver: self.channel(event).signal.subscribe(),
        }
    }

    /// Wait for the next occurrence of `event`; `false` if the timer stops.
    pub async fn wait(&self, event: DiurnalEvent) -> bool {
        self.subscribe(event).wait().await
    }

    /// Most recently published time for `event`, if any.
    pub fn next_time(&self, event: DiurnalEvent) -> Option<f64> {
        self.channel(event).next_time()
    }

    /// Resolves with a description once any cycle has failed.
    pub async fn failure(&self) -> String {
        let mut receiver = self.failure.subscribe();
        let failure = receiver
            .wait_for(Option::is_some)
            .await
            .map(|failure| failure.clone().unwrap_or_default());
        match failure {
            Ok(failure) => failure,
            Err(_) => std::future::pending().await,
        }
    }

    pub fn sun_altitude_at(&self, tai: f64) -> f64 {
        sun_altitude(&self.site, tai)
    }

    pub fn seconds_until_twilight(&self, tai: f64) -> Result<f64> {
        self.seconds_until(DiurnalEvent::Twilight, tai)
    }

    pub fn seconds_until_sunrise(&self, tai: f64) -> Result<f64> {
        self.seconds_until(DiurnalEvent::Sunrise, tai)
    }

    fn seconds_until(&self, event: DiurnalEvent, tai: f64) -> Result<f64> {
        let next = self.next_time(event).ok_or(EasError::NotPublished(event))?;
        let seconds = next - tai;
        if !(0.0..=MAX_SECONDS_UNTIL).contains(&seconds) {
            warn!(%event, seconds, "time until diurnal event is out of range");
        }
        Ok(seconds)
    }

    /// True between the published twilight and the following sunrise.
    ///
    /// The two times come from independent cycles, so sunrise may already
    /// point at tomorrow while twilight is still today, or the other way
    /// round.
    pub fn is_night(&self, tai: f64) -> Result<bool> {
        let twilight = self
            .next_time(DiurnalEvent::Twilight)
            .ok_or(EasError::NotPublished(DiurnalEvent::Twilight))?;
        let sunrise = self
            .next_time(DiurnalEvent::Sunrise)
            .ok_or(EasError::NotPublished(DiurnalEvent::Sunrise))?;
        Ok(if twilight <= sunrise {
            twilight <= tai && tai < sunrise
        } else {
            tai < sunrise || tai >= twilight
        })
    }

    /// Evening twilight on a given local calendar date.
    pub fn twilight_on(&self, date: NaiveDate) -> Result<f64> {
        let noon = local_noon(date, self.time_zone)?;
        next_crossing(&self.site, noon, self.twilight_altitude, Direction::Descending)
    }

    /// Most recent evening twilight at or before `tai`.
    pub fn previous_twilight(&self, tai: f64) -> Result<f64> {
        let date = tai_to_utc(tai)?.with_timezone(&self.time_zone).date_naive();
        let twilight = self.twilight_on(date)?;
        if twilight <= tai {
            return Ok(twilight);
        }
        let yesterday = date
            .checked_sub_days(Days::new(1))
            .ok_or_else(|| EasError::LocalTime(format!("no day before {date}")))?;
        self.twilight_on(yesterday)
    }

    /// First sunrise after `tai`, computed directly rather than published.
    pub fn sunrise_after(&self, tai: f64) -> Result<f64> {
        next_crossing(&self.site, tai, 0.0, Direction::Ascending)
    }

    #[cfg(test)]
    pub(crate) fn publish_for_test(&self, event: DiurnalEvent, tai: f64) {
        self.channel(event).set_next_time(Some(tai));
    }

    #[cfg(test)]
    pub(crate) fn fire_for_test(&self, event: DiurnalEvent) {
        let time = self.next_time(event).unwrap_or_default();
        self.channel(event).signal.send_replace(Signal::Fired(time));
    }
}

/// 12:00 local civil time on `date`, in TAI.
pub fn local_noon(date: NaiveDate, time_zone: Tz) -> Result<f64> {
    let naive = date
        .and_hms_opt(12, 0, 0)
        .ok_or_else(|| EasError::LocalTime(format!("noon on {date}")))?;
    let local = time_zone
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| EasError::LocalTime(format!("{naive} does not exist in {time_zone}")))?;
    Ok(utc_to_tai(local.with_timezone(&Utc)))
}

/// Next local noon strictly after `now + NOON_LOOKAHEAD`.
///
/// Walks calendar dates rather than adding 24 h, so the result stays at
/// 12:00 local across daylight-saving changes.
pub fn next_local_noon(now: f64, time_zone: Tz) -> Result<f64> {
    let horizon = now + NOON_LOOKAHEAD;
    let mut date = tai_to_utc(horizon)?.with_timezone(&time_zone).date_naive();
    for _ in 0..2 {
        let noon = local_noon(date, time_zone)?;
        if noon > horizon {
            return Ok(noon);
        }
        date = date
            .checked_add_days(Days::new(1))
            .ok_or_else(|| EasError::LocalTime(format!("no day after {date}")))?;
    }
    Err(EasError::LocalTime(format!("no local noon after {horizon}")))
}
