use eas_protocol::{ApertureShutter, Louvers, Subscription};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::clock::{duration, Clock};
use crate::config::DomeConfig;
use crate::error::Result;

// Taken by whichever of the timer or a close transition gets there first.
type Trigger = Arc<Mutex<Option<oneshot::Sender<()>>>>;

fn fire(trigger: &Trigger) {
    if let Some(sender) = trigger.lock().unwrap_or_else(PoisonError::into_inner).take() {
        let _ = sender.send(());
    }
}

struct Delayed {
    trigger: Trigger,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct DomeState {
    shutter: Option<ApertureShutter>,
    louvers: Option<Louvers>,
    /// Last closed/open classification that was not unknown.
    last_known_closed: Option<bool>,
    on_open: Vec<(Trigger, f64)>,
    delayed: HashMap<u64, Delayed>,
    next_id: u64,
}

/// Resolves when the dome has opened (after the registered delay).
pub struct OpenWaiter {
    receiver: oneshot::Receiver<()>,
}

impl OpenWaiter {
    /// `true` when fired, `false` if the tracker was shut down first.
    pub async fn wait(self) -> bool {
        self.receiver.await.is_ok()
    }
}

/// Open/closed classification of the dome from shutter and louver telemetry.
pub struct DomeModel {
    config: DomeConfig,
    clock: Clock,
    state: Arc<Mutex<DomeState>>,
}

impl DomeModel {
    pub fn new(config: DomeConfig, clock: Clock) -> Self {
        DomeModel {
            config,
            clock,
            state: Arc::new(Mutex::new(DomeState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DomeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `Some(true)` when both shutter doors and every louver are below the
    /// open threshold, `None` when either telemetry item is missing or
    /// older than the allowed age.
    pub fn is_closed(&self) -> Option<bool> {
        self.classify(&self.lock())
    }

    fn classify(&self, state: &DomeState) -> Option<bool> {
        let shutter = state.shutter.as_ref()?;
        let louvers = state.louvers.as_ref()?;
        let now = self.clock.now();
        let fresh = |timestamp: f64| now - timestamp <= self.config.max_telemetry_age;
        if !fresh(shutter.timestamp) || !fresh(louvers.timestamp) {
            return None;
        }
        let closed = |position: &f64| *position < self.config.open_threshold;
        Some(
            shutter.position_actual.iter().all(closed)
                && louvers.position_actual.iter().all(closed),
        )
    }

    pub fn aperture_shutter_callback(&self, sample: ApertureShutter) {
        let mut state = self.lock();
        state.shutter = Some(sample);
        self.evaluate(&mut state);
    }

    pub fn louvers_callback(&self, sample: Louvers) {
        let mut state = self.lock();
        state.louvers = Some(sample);
        self.evaluate(&mut state);
    }

    fn evaluate(&self, state: &mut DomeState) {
        let closed = self.classify(state);
        match (state.last_known_closed, closed) {
            (Some(true), Some(false)) => {
                info!("dome opened");
                self.schedule_open_waiters(state);
            }
            (Some(false), Some(true)) => {
                info!("dome closed");
                cancel_pending(state);
            }
            _ => {}
        }
        if closed.is_some() {
            state.last_known_closed = closed;
        }
    }

    fn schedule_open_waiters(&self, state: &mut DomeState) {
        let waiters: Vec<_> = state.on_open.drain(..).collect();
        for (trigger, delay) in waiters {
            let id = state.next_id;
            state.next_id += 1;
            let shared = Arc::clone(&self.state);
            let timer_trigger = Arc::clone(&trigger);
            let handle = tokio::spawn(async move {
                tokio::time::sleep(duration(delay)).await;
                fire(&timer_trigger);
                shared
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .delayed
                    .remove(&id);
            });
            state.delayed.insert(id, Delayed { trigger, handle });
        }
    }

    /// Register interest in the next closed-to-open transition, fired
    /// `delay` seconds after it.
    pub fn on_open(&self, delay: f64) -> OpenWaiter {
        let (sender, receiver) = oneshot::channel();
        self.lock()
            .on_open
            .push((Arc::new(Mutex::new(Some(sender))), delay));
        OpenWaiter { receiver }
    }

    /// If the dome is known to be closed, wait until it has been open for
    /// `delay` seconds (or closes again before that). Otherwise return at once.
    pub async fn wait_until_open(&self, delay: f64) {
        let waiter = {
            let mut state = self.lock();
            if self.classify(&state) != Some(true) {
                return;
            }
            let (sender, receiver) = oneshot::channel();
            state.on_open.push((Arc::new(Mutex::new(Some(sender))), delay));
            OpenWaiter { receiver }
        };
        debug!(delay, "waiting for the dome to open");
        waiter.wait().await;
    }

    /// Fire every pending delayed waiter now.
    pub fn cancel_pending(&self) {
        cancel_pending(&mut self.lock());
    }

    pub fn pending_count(&self) -> usize {
        self.lock().delayed.len()
    }

    /// Release every waiter; used when monitoring stops.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        cancel_pending(&mut state);
        state.on_open.clear();
    }

    pub async fn monitor(
        &self,
        mut shutter: Subscription<ApertureShutter>,
        mut louvers: Subscription<Louvers>,
    ) -> Result<()> {
        debug!("dome monitor starts");
        loop {
            tokio::select! {
                sample = shutter.recv() => match sample {
                    Some(sample) => self.aperture_shutter_callback(sample),
                    None => return Ok(()),
                },
                sample = louvers.recv() => match sample {
                    Some(sample) => self.louvers_callback(sample),
                    None => return Ok(()),
                },
            }
        }
    }
}

fn cancel_pending(state: &mut DomeState) {
    for (_, delayed) in state.delayed.drain() {
        delayed.handle.abort();
        fire(&delayed.trigger);
    }
}
