//! Background command issuing with enable gating and supersession.
//!
//! Each logical command name owned by a model has at most one task in
//! flight. A new call for the same name cancels the old task, waits for it
//! to finish, and only then starts. Transport failures are logged and
//! handed to an optional callback; they never reach the caller.

use eas_protocol::{Command, CommandError, CommandSender, Component, SummaryState, TelemetryBus};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::clock::duration;
use crate::config::CommandConfig;
use crate::error::Result;

pub type ExceptionCallback = Arc<dyn Fn(&CommandError) -> Result<()> + Send + Sync>;
pub type AllowSend = Arc<dyn Fn() -> bool + Send + Sync>;

/// Optional behavior shared by every issuer of one model.
#[derive(Clone, Default)]
pub struct IssuerHooks {
    pub exception_callback: Option<ExceptionCallback>,
    /// Checked before each call; `false` skips the call entirely.
    pub allow_send: Option<AllowSend>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cancel {
    Superseded,
    Closed,
}

struct InFlight {
    cancel: oneshot::Sender<Cancel>,
    handle: JoinHandle<()>,
}

struct Shared {
    component: Component,
    sender: Arc<dyn CommandSender>,
    bus: Arc<TelemetryBus>,
    config: CommandConfig,
    hooks: IssuerHooks,
    superseded: AtomicU64,
}

pub struct CommandIssuer {
    shared: Arc<Shared>,
    tasks: Mutex<HashMap<String, InFlight>>,
}

impl CommandIssuer {
    pub fn new(
        component: Component,
        sender: Arc<dyn CommandSender>,
        bus: Arc<TelemetryBus>,
        config: CommandConfig,
        hooks: IssuerHooks,
    ) -> Self {
        CommandIssuer {
            shared: Arc::new(Shared {
                component,
                sender,
                bus,
                config,
                hooks,
                superseded: AtomicU64::new(0),
            }),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn component(&self) -> Component {
        self.shared.component
    }

    /// Send `commands` in order from a background task once the component is
    /// enabled. An empty decision does nothing, and leaves any earlier call
    /// for `name` running.
    pub async fn issue(&self, name: &str, commands: Vec<Command>) {
        if commands.is_empty() {
            return;
        }
        let mut tasks = self.tasks.lock().await;
        if let Some(prior) = tasks.remove(name) {
            if !prior.handle.is_finished() {
                let _ = prior.cancel.send(Cancel::Superseded);
            }
            join(name, prior.handle).await;
        }

        let (cancel, cancelled) = oneshot::channel();
        let handle = tokio::spawn(Arc::clone(&self.shared).run(commands, cancelled));
        tasks.insert(name.to_string(), InFlight { cancel, handle });
    }

    /// Cancel and await every outstanding call.
    pub async fn close_all(&self) {
        let tasks: Vec<_> = self.tasks.lock().await.drain().collect();
        for (name, in_flight) in tasks {
            let _ = in_flight.cancel.send(Cancel::Closed);
            join(&name, in_flight.handle).await;
        }
    }

    pub async fn in_flight(&self) -> usize {
        self.tasks
            .lock()
            .await
            .values()
            .filter(|task| !task.handle.is_finished())
            .count()
    }

    /// Calls cancelled by a newer call for the same name.
    pub fn superseded_count(&self) -> u64 {
        self.shared.superseded.load(Ordering::Relaxed)
    }
}

async fn join(name: &str, handle: JoinHandle<()>) {
    if let Err(err) = handle.await {
        if err.is_panic() {
            error!(name, "command task panicked: {err}");
        }
    }
}

impl Shared {
    fn label(&self, command: &Command) -> String {
        format!("{}.{}", self.component, command.name())
    }

    fn is_enabled(&self) -> bool {
        self.bus
            .summary_state(self.component)
            .latest()
            .is_some_and(|sample| sample.summary_state == SummaryState::Enabled)
    }

    async fn run(self: Arc<Self>, commands: Vec<Command>, mut cancelled: oneshot::Receiver<Cancel>) {
        let label = self.label(&commands[0]);
        tokio::select! {
            biased;
            reason = &mut cancelled => {
                if reason == Ok(Cancel::Superseded) {
                    self.superseded.fetch_add(1, Ordering::Relaxed);
                    warn!(command = %label, "Prior call to {label} was superseded.");
                }
            }
            _ = self.gate_and_send(&label, &commands) => {}
        }
    }

    async fn gate_and_send(&self, label: &str, commands: &[Command]) {
        if let Some(allow_send) = &self.hooks.allow_send {
            if !allow_send() {
                debug!(command = %label, "not allowed to send {label}");
                return;
            }
        }

        let deadline = self
            .config
            .enable_timeout
            .map(|timeout| Instant::now() + duration(timeout));
        loop {
            if self.is_enabled() {
                self.send_all(commands).await;
                return;
            }
            let now = Instant::now();
            if deadline.is_some_and(|deadline| now >= deadline) {
                warn!(
                    command = %label,
                    "Command {label} timed out waiting for {} to be enabled.",
                    self.component
                );
                return;
            }
            let wake = now + duration(self.config.dormant_time);
            tokio::time::sleep_until(deadline.map_or(wake, |deadline| wake.min(deadline))).await;
        }
    }

    async fn send_all(&self, commands: &[Command]) {
        let timeout = duration(self.config.command_timeout);
        for command in commands {
            let label = self.label(command);
            match self.sender.send(command, timeout).await {
                Ok(ack) => debug!(command = %label, result = %ack.result, "command acknowledged"),
                Err(err) => {
                    warn!(command = %label, "Error returned by {label}: {err}");
                    if let Some(callback) = &self.hooks.exception_callback {
                        if let Err(callback_err) = callback(&err) {
                            error!(command = %label, "{label}: exception callback failed: {callback_err}");
                        }
                    }
                    return;
                }
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{enable, RecordingSender};
    use super::*;
    use eas_protocol::{DeviceId, SummaryStateSample};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn setpoint(value: f64) -> Command {
        Command::ApplySetpoints {
            glycol_setpoint: value,
            heaters_setpoint: value,
        }
    }

    fn issuer_with(
        sender: Arc<RecordingSender>,
        config: CommandConfig,
        hooks: IssuerHooks,
    ) -> (CommandIssuer, Arc<TelemetryBus>) {
        let bus = Arc::new(TelemetryBus::new());
        let issuer = CommandIssuer::new(Component::M1m3ts, sender, bus.clone(), config, hooks);
        (issuer, bus)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_component_to_be_enabled() {
        let sender = Arc::new(RecordingSender::default());
        let (issuer, bus) = issuer_with(sender.clone(), CommandConfig::default(), IssuerHooks::default());

        issuer.issue("setpoints", vec![setpoint(1.0)]).await;
        tokio::time::sleep(Duration::from_secs(130)).await;
        assert!(sender.delivered().is_empty());
        assert_eq!(issuer.in_flight().await, 1);

        enable(&bus, Component::M1m3ts);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(sender.delivered(), vec![setpoint(1.0)]);
        assert_eq!(issuer.in_flight().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_enable_timeout() {
        let sender = Arc::new(RecordingSender::default());
        let called = Arc::new(AtomicUsize::new(0));
        let counter = called.clone();
        let hooks = IssuerHooks {
            exception_callback: Some(Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })),
            allow_send: None,
        };
        let config = CommandConfig {
            enable_timeout: Some(100.0),
            ..CommandConfig::default()
        };
        let (issuer, bus) = issuer_with(sender.clone(), config, hooks);

        issuer.issue("setpoints", vec![setpoint(1.0)]).await;
        tokio::time::sleep(Duration::from_secs(101)).await;
        assert_eq!(issuer.in_flight().await, 0);

        enable(&bus, Component::M1m3ts);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(sender.delivered().is_empty());
        assert_eq!(called.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn newer_call_supersedes_older() {
        let sender = Arc::new(RecordingSender {
            latency: Duration::from_secs(10),
            ..RecordingSender::default()
        });
        let (issuer, bus) = issuer_with(sender.clone(), CommandConfig::default(), IssuerHooks::default());
        enable(&bus, Component::M1m3ts);

        issuer.issue("setpoints", vec![setpoint(1.0)]).await;
        issuer.issue("setpoints", vec![setpoint(2.0)]).await;
        assert_eq!(issuer.superseded_count(), 1);

        // Superseded while its send is in progress.
        tokio::time::sleep(Duration::from_secs(5)).await;
        issuer.issue("setpoints", vec![setpoint(3.0)]).await;
        assert_eq!(issuer.superseded_count(), 2);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(sender.delivered(), vec![setpoint(3.0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn names_are_independent_and_batches_ordered() {
        let sender = Arc::new(RecordingSender {
            latency: Duration::from_secs(1),
            ..RecordingSender::default()
        });
        let bus = Arc::new(TelemetryBus::new());
        enable(&bus, Component::Hvac);
        let issuer = CommandIssuer::new(
            Component::Hvac,
            sender.clone(),
            bus,
            CommandConfig::default(),
            IssuerHooks::default(),
        );

        let ahus: Vec<_> = DeviceId::LOWER_AHUS
            .iter()
            .map(|&device| Command::EnableDevice { device })
            .collect();
        issuer.issue("ahus", ahus.clone()).await;
        issuer
            .issue("vec04", vec![Command::DisableDevice { device: DeviceId::VEC04 }])
            .await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        let delivered = sender.delivered();
        assert_eq!(delivered.len(), 5);
        let delivered_ahus: Vec<_> = delivered
            .into_iter()
            .filter(|c| matches!(c, Command::EnableDevice { .. }))
            .collect();
        assert_eq!(delivered_ahus, ahus);
        assert_eq!(issuer.superseded_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_go_to_callback_and_stop_the_batch() {
        let sender = Arc::new(RecordingSender {
            reject: Some("heaterFanDemand"),
            ..RecordingSender::default()
        });
        let errors = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = errors.clone();
        let hooks = IssuerHooks {
            exception_callback: Some(Arc::new(move |err: &CommandError| {
                seen.lock().unwrap().push(err.to_string());
                Err(crate::error::EasError::Config("callback failure is only logged".into()))
            })),
            allow_send: None,
        };
        let (issuer, bus) = issuer_with(sender.clone(), CommandConfig::default(), hooks);
        enable(&bus, Component::M1m3ts);

        issuer
            .issue("mixed", vec![setpoint(1.0), Command::uniform_fan_demand(800), setpoint(2.0)])
            .await;
        settle().await;
        assert_eq!(sender.delivered(), vec![setpoint(1.0)]);
        assert_eq!(errors.lock().unwrap().len(), 1);
        assert!(errors.lock().unwrap()[0].contains("refused"));

        issuer.issue("mixed", vec![setpoint(4.0)]).await;
        settle().await;
        assert_eq!(sender.delivered(), vec![setpoint(1.0), setpoint(4.0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn allow_send_gate() {
        let sender = Arc::new(RecordingSender::default());
        let hooks = IssuerHooks {
            exception_callback: None,
            allow_send: Some(Arc::new(|| false)),
        };
        let (issuer, bus) = issuer_with(sender.clone(), CommandConfig::default(), hooks);
        enable(&bus, Component::M1m3ts);
        issuer.issue("setpoints", vec![setpoint(1.0)]).await;
        settle().await;
        assert!(sender.delivered().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_decision_keeps_prior_call() {
        let sender = Arc::new(RecordingSender {
            latency: Duration::from_secs(10),
            ..RecordingSender::default()
        });
        let (issuer, bus) = issuer_with(sender.clone(), CommandConfig::default(), IssuerHooks::default());
        enable(&bus, Component::M1m3ts);
        issuer.issue("setpoints", vec![setpoint(1.0)]).await;
        issuer.issue("setpoints", Vec::new()).await;
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(sender.delivered(), vec![setpoint(1.0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn close_all_cancels_pending_and_tolerates_finished() {
        let sender = Arc::new(RecordingSender::default());
        let (issuer, bus) = issuer_with(sender.clone(), CommandConfig::default(), IssuerHooks::default());
        enable(&bus, Component::M1m3ts);
        issuer.issue("done", vec![setpoint(1.0)]).await;
        settle().await;

        bus.summary_state(Component::M1m3ts).publish(SummaryStateSample {
            component: Component::M1m3ts,
            summary_state: SummaryState::Disabled,
            timestamp: 1.0,
        });
        issuer.issue("waiting", vec![setpoint(2.0)]).await;
        assert_eq!(issuer.in_flight().await, 1);

        issuer.close_all().await;
        assert_eq!(issuer.in_flight().await, 0);
        assert_eq!(issuer.superseded_count(), 0);

        enable(&bus, Component::M1m3ts);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(sender.delivered(), vec![setpoint(1.0)]);
    }
}
