//! Lifecycle of the automation: builds the per-run models, spawns their
//! tasks and tears them down again.

use eas_protocol::{CommandSender, Component, TelemetryBus};
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::EasConfig;
use crate::diurnal::{DiurnalEvent, DiurnalTimer};
use crate::dome::DomeModel;
use crate::efd::HistoricalClient;
use crate::error::Result;
use crate::glass::GlassTemperatureModel;
use crate::health::HealthMonitor;
use crate::hvac::{HvacModel, HvacSnapshot};
use crate::issuer::{CommandIssuer, IssuerHooks};
use crate::tma::{TmaModel, TmaSnapshot};
use crate::weather::{WeatherModel, WeatherSnapshot};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EasState {
    Stopped,
    Running,
    Fault(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct EasStatus {
    pub state: EasState,
    pub dome_closed: Option<bool>,
    pub glass_median_temperature: Option<f64>,
    pub next_noon: Option<f64>,
    pub next_twilight: Option<f64>,
    pub next_sunrise: Option<f64>,
    pub weather: Option<WeatherSnapshot>,
    pub hvac: Option<HvacSnapshot>,
    pub tma: Option<TmaSnapshot>,
}

/// Everything owned by one start/stop cycle.
struct Run {
    timer: Arc<DiurnalTimer>,
    dome: Arc<DomeModel>,
    weather: Arc<WeatherModel>,
    glass: Arc<GlassTemperatureModel>,
    hvac: Arc<HvacModel>,
    tma: Arc<TmaModel>,
    tasks: JoinSet<()>,
    supervisor: Option<JoinHandle<()>>,
}

impl Run {
    async fn teardown(mut self) {
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
        self.dome.shutdown();
        self.hvac.issuer().close_all().await;
        for issuer in self.tma.issuers() {
            issuer.close_all().await;
        }
        self.timer.stop().await;
    }
}

pub struct EasModel {
    /// Read at each start, so a new configuration applies to the next run.
    config: StdMutex<EasConfig>,
    clock: Clock,
    bus: Arc<TelemetryBus>,
    sender: Arc<dyn CommandSender>,
    history: Arc<dyn HistoricalClient>,
    state: watch::Sender<EasState>,
    run: Mutex<Option<Run>>,
}

impl EasModel {
    pub fn new(
        config: EasConfig,
        clock: Clock,
        bus: Arc<TelemetryBus>,
        sender: Arc<dyn CommandSender>,
        history: Arc<dyn HistoricalClient>,
    ) -> Result<Self> {
        config.validate()?;
        let (state, _) = watch::channel(EasState::Stopped);
        Ok(EasModel {
            config: StdMutex::new(config),
            clock,
            bus,
            sender,
            history,
            state,
            run: Mutex::new(None),
        })
    }

    fn config(&self) -> EasConfig {
        self.config.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the configuration used by the next `start_monitoring`.
    pub fn set_config(&self, config: EasConfig) -> Result<()> {
        config.validate()?;
        *self.config.lock().unwrap_or_else(PoisonError::into_inner) = config;
        Ok(())
    }

    pub fn state(&self) -> EasState {
        self.state.borrow().clone()
    }

    /// Resolves with the fault message once the model faults.
    pub async fn wait_for_fault(&self) -> String {
        let mut receiver = self.state.subscribe();
        let result = receiver
            .wait_for(|state| matches!(state, EasState::Fault(_)))
            .await
            .map(|state| state.clone());
        match result {
            Ok(EasState::Fault(message)) => message,
            _ => std::future::pending::<String>().await,
        }
    }

    fn issuer(&self, config: &EasConfig, component: Component, hooks: &IssuerHooks) -> CommandIssuer {
        CommandIssuer::new(
            component,
            Arc::clone(&self.sender),
            Arc::clone(&self.bus),
            config.commands.clone(),
            hooks.clone(),
        )
    }

    fn build(&self, config: &EasConfig) -> Result<Run> {
        let timer = Arc::new(DiurnalTimer::new(
            config.site,
            config.time_zone()?,
            &config.twilight_definition,
            self.clock,
        )?);
        let dome = Arc::new(DomeModel::new(config.dome.clone(), self.clock));
        let weather = Arc::new(WeatherModel::new(
            config.weather.clone(),
            Arc::clone(&timer),
            Arc::clone(&self.history),
        )?);
        let glass = Arc::new(GlassTemperatureModel::new(self.clock));

        let running = self.state.subscribe();
        let hooks = IssuerHooks {
            exception_callback: None,
            allow_send: Some(Arc::new(move || {
                matches!(*running.borrow(), EasState::Running)
            })),
        };
        let hvac = Arc::new(HvacModel::new(
            config.hvac.clone(),
            config.features_to_disable.clone(),
            Arc::clone(&timer),
            Arc::clone(&dome),
            Arc::clone(&weather),
            self.issuer(config, Component::Hvac, &hooks),
        ));
        let tma = Arc::new(TmaModel::new(
            config.tma.clone(),
            config.features_to_disable.clone(),
            Arc::clone(&timer),
            Arc::clone(&dome),
            Arc::clone(&weather),
            Arc::clone(&glass),
            self.issuer(config, Component::M1m3ts, &hooks),
            self.issuer(config, Component::MtMount, &hooks),
        ));
        Ok(Run {
            timer,
            dome,
            weather,
            glass,
            hvac,
            tma,
            tasks: JoinSet::new(),
            supervisor: None,
        })
    }

    /// Start the scheduler, the aggregators and the control loops.
    /// Does nothing if monitoring is already running.
    pub async fn start_monitoring(self: &Arc<Self>) -> Result<()> {
        let mut current = self.run.lock().await;
        if current.is_some() {
            debug!("monitoring already running");
            return Ok(());
        }
        let config = self.config();
        let mut run = self.build(&config)?;
        run.timer.start();
        self.state.send_replace(EasState::Running);
        if let Err(err) = run.weather.seed().await {
            warn!("could not seed nightly extremes: {err}");
        }

        let (faults, mut fault_rx) = mpsc::unbounded_channel();
        let bus = &self.bus;

        let dome = Arc::clone(&run.dome);
        let shutter = bus.aperture_shutter.subscribe();
        let louvers = bus.louvers.subscribe();
        spawn_reporting(&mut run.tasks, &faults, "dome", async move {
            dome.monitor(shutter, louvers).await
        });

        let weather = Arc::clone(&run.weather);
        let (air_flow, temperature, dew_point) = (
            bus.air_flow.subscribe(),
            bus.temperature.subscribe(),
            bus.dew_point.subscribe(),
        );
        let twilight = run.timer.subscribe(DiurnalEvent::Twilight);
        spawn_reporting(&mut run.tasks, &faults, "weather", async move {
            weather.monitor(air_flow, temperature, dew_point, twilight).await
        });

        let glass = Arc::clone(&run.glass);
        let temperature = bus.temperature.subscribe();
        spawn_reporting(&mut run.tasks, &faults, "glass", async move {
            glass.monitor(temperature).await
        });

        let health = HealthMonitor::new(config.health.clone());
        let hvac = Arc::clone(&run.hvac);
        let hvac_health = health.clone();
        spawn_reporting(&mut run.tasks, &faults, "hvac", async move {
            hvac_health.run("hvac", || hvac.monitor()).await
        });

        let tma = Arc::clone(&run.tma);
        let tma_bus = Arc::clone(bus);
        spawn_reporting(&mut run.tasks, &faults, "tma", async move {
            health.run("tma", || tma.monitor(tma_bus.temperature.subscribe())).await
        });
        drop(faults);

        let timer = Arc::clone(&run.timer);
        let model = Arc::downgrade(self);
        run.supervisor = Some(tokio::spawn(async move {
            let message = tokio::select! {
                Some(message) = fault_rx.recv() => message,
                message = timer.failure() => message,
            };
            fault(model, message).await;
        }));

        *current = Some(run);
        info!("monitoring started");
        Ok(())
    }

    /// Cancel every task and stop the scheduler. Safe to call repeatedly.
    pub async fn stop_monitoring(&self) {
        let mut current = self.run.lock().await;
        let Some(mut run) = current.take() else {
            debug!("monitoring not running");
            return;
        };
        if let Some(supervisor) = run.supervisor.take() {
            supervisor.abort();
            let _ = supervisor.await;
        }
        self.state.send_if_modified(|state| {
            let running = *state == EasState::Running;
            if running {
                *state = EasState::Stopped;
            }
            running
        });
        run.teardown().await;
        info!("monitoring stopped");
    }

    pub async fn status(&self) -> EasStatus {
        let current = self.run.lock().await;
        let run = current.as_ref();
        let next = |event| run.and_then(|run| run.timer.next_time(event));
        EasStatus {
            state: self.state(),
            dome_closed: run.and_then(|run| run.dome.is_closed()),
            glass_median_temperature: run.and_then(|run| run.glass.median_temperature()),
            next_noon: next(DiurnalEvent::Noon),
            next_twilight: next(DiurnalEvent::Twilight),
            next_sunrise: next(DiurnalEvent::Sunrise),
            weather: run.map(|run| run.weather.snapshot()),
            hvac: run.map(|run| run.hvac.snapshot()),
            tma: run.map(|run| run.tma.snapshot()),
        }
    }
}

fn spawn_reporting<F>(
    tasks: &mut JoinSet<()>,
    faults: &mpsc::UnboundedSender<String>,
    name: &'static str,
    task: F,
) where
    F: Future<Output = Result<()>> + Send + 'static,
{
    let faults = faults.clone();
    tasks.spawn(async move {
        match task.await {
            Ok(()) => debug!(task = name, "task finished"),
            Err(err) => {
                let _ = faults.send(format!("{name}: {err}"));
            }
        }
    });
}

async fn fault(model: Weak<EasModel>, message: String) {
    let Some(model) = model.upgrade() else {
        return;
    };
    let mut current = model.run.lock().await;
    let Some(run) = current.take() else {
        return;
    };
    error!("automation fault: {message}");
    model.state.send_replace(EasState::Fault(message));
    run.teardown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{test_config, Feature, FeatureSet};
    use crate::efd::NoHistory;
    use crate::issuer::testing::{enable_all, RecordingSender};
    use crate::weather::tests::afternoon;
    use eas_protocol::{ApertureShutter, Louvers, Temperature};
    use std::time::Duration;

    fn model() -> anyhow::Result<(Arc<EasModel>, Arc<TelemetryBus>, Arc<RecordingSender>, Clock)> {
        let clock = Clock::starting_at(afternoon());
        let bus = Arc::new(TelemetryBus::new());
        let sender = Arc::new(RecordingSender::default());
        let model = EasModel::new(
            test_config(),
            clock,
            Arc::clone(&bus),
            sender.clone(),
            Arc::new(NoHistory),
        )?;
        Ok((Arc::new(model), bus, sender, clock))
    }

    #[tokio::test(start_paused = true)]
    async fn start_and_stop_repeatedly() -> anyhow::Result<()> {
        let (model, _bus, _sender, _clock) = model()?;
        assert_eq!(model.state(), EasState::Stopped);
        model.stop_monitoring().await;

        for _ in 0..3 {
            model.start_monitoring().await?;
            model.start_monitoring().await?;
            assert_eq!(model.state(), EasState::Running);
            tokio::time::sleep(Duration::from_secs(1)).await;
            let status = model.status().await;
            assert!(status.next_noon.is_some());
            assert!(status.next_twilight.is_some());
            assert!(status.hvac.is_some());

            model.stop_monitoring().await;
            model.stop_monitoring().await;
            assert_eq!(model.state(), EasState::Stopped);
            let status = model.status().await;
            assert!(status.next_noon.is_none());
            assert!(status.weather.is_none());
        }
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn closed_dome_enables_the_ahus() -> anyhow::Result<()> {
        let (model, bus, sender, clock) = model()?;
        enable_all(&bus);
        model.start_monitoring().await?;

        bus.aperture_shutter.publish(ApertureShutter {
            position_actual: [0.0, 0.0],
            timestamp: clock.now(),
        });
        bus.louvers.publish(Louvers {
            position_actual: vec![0.0; 34],
            timestamp: clock.now(),
        });
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(model.status().await.dome_closed, Some(true));
        let delivered = sender.delivered();
        assert!(delivered.iter().any(|c| c.name() == "enableDevice"));
        assert!(delivered.iter().all(|c| c.component() == Component::Hvac));

        model.stop_monitoring().await;
        let count = sender.delivered().len();
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(sender.delivered().len(), count);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn new_configuration_applies_at_next_start() -> anyhow::Result<()> {
        let (model, bus, sender, clock) = model()?;
        assert!(model.set_config(EasConfig::default()).is_err());

        let mut config = test_config();
        config.features_to_disable = FeatureSet::disabling(&[Feature::Ahu, Feature::Vec04]);
        model.set_config(config)?;
        enable_all(&bus);
        model.start_monitoring().await?;
        bus.aperture_shutter.publish(ApertureShutter {
            position_actual: [0.0, 0.0],
            timestamp: clock.now(),
        });
        bus.louvers.publish(Louvers {
            position_actual: vec![0.0; 34],
            timestamp: clock.now(),
        });
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(model.status().await.dome_closed, Some(true));
        assert!(sender.delivered().is_empty());
        model.stop_monitoring().await;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_scanner_sample_faults() -> anyhow::Result<()> {
        let (model, bus, _sender, clock) = model()?;
        model.start_monitoring().await?;

        bus.temperature.publish(Temperature {
            sal_index: 114,
            sensor_name: "not a scanner".to_string(),
            num_channels: 16,
            temperature_item: vec![10.0; 16],
            timestamp: clock.now(),
        });
        let message = tokio::time::timeout(Duration::from_secs(5), model.wait_for_fault()).await?;
        assert!(message.starts_with("glass:"), "{message}");
        assert!(matches!(model.state(), EasState::Fault(_)));
        let status = model.status().await;
        assert!(status.hvac.is_none());

        model.stop_monitoring().await;
        assert!(matches!(model.state(), EasState::Fault(_)));
        model.start_monitoring().await?;
        assert_eq!(model.state(), EasState::Running);
        model.stop_monitoring().await;
        Ok(())
    }
}
