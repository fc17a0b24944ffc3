use std::future::Future;
use tokio::time::Instant;
use tracing::{error, warn};

use crate::clock::duration;
use crate::config::HealthConfig;
use crate::error::{EasError, Result};

/// Restarts a failing control loop with exponential backoff.
///
/// A loop that ran for longer than `failure_timeout` before failing starts
/// counting from zero again. After `max_failures` consecutive failures the
/// last error is returned wrapped in [`EasError::Escalated`].
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        HealthMonitor { config }
    }

    /// Delay after the `failures`-th consecutive failure.
    pub fn backoff(&self, failures: u32) -> f64 {
        let exponent = failures.saturating_sub(1).min(62) as i32;
        (self.config.initial_backoff * 2f64.powi(exponent)).min(self.config.max_backoff)
    }

    /// Run `attempt` until it returns `Ok`, or escalate.
    pub async fn run<F, Fut>(&self, name: &str, mut attempt: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut failures = 0u32;
        loop {
            let started = Instant::now();
            let err = match attempt().await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            if started.elapsed() > duration(self.config.failure_timeout) {
                failures = 0;
            }
            failures += 1;
            if failures >= self.config.max_failures {
                error!(task = name, failures, "giving up: {err}");
                return Err(EasError::Escalated {
                    task: name.to_string(),
                    failures,
                    source: Box::new(err),
                });
            }
            let backoff = self.backoff(failures);
            warn!(task = name, failures, backoff, "failed, retrying: {err}");
            tokio::time::sleep(duration(backoff)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn failing() -> EasError {
        EasError::NoTemperatureSamples { seconds: 120.0 }
    }

    /// Records attempt start times (seconds since the test began).
    fn recorder() -> (Arc<Mutex<Vec<f64>>>, Instant) {
        (Arc::new(Mutex::new(Vec::new())), Instant::now())
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let monitor = HealthMonitor::new(HealthConfig {
            max_backoff: 25.0,
            ..HealthConfig::default()
        });
        let delays: Vec<f64> = (1..=5).map(|n| monitor.backoff(n)).collect();
        assert_eq!(delays, vec![10.0, 20.0, 25.0, 25.0, 25.0]);
        assert_eq!(monitor.backoff(1000), 25.0);
    }

    #[tokio::test(start_paused = true)]
    async fn escalates_after_max_failures() {
        let monitor = HealthMonitor::new(HealthConfig::default());
        let (attempts, start) = recorder();
        let result = monitor
            .run("hvac", || {
                let attempts = attempts.clone();
                async move {
                    attempts.lock().unwrap().push(start.elapsed().as_secs_f64());
                    Err(failing())
                }
            })
            .await;

        match result {
            Err(EasError::Escalated { task, failures, source }) => {
                assert_eq!(task, "hvac");
                assert_eq!(failures, 5);
                assert!(matches!(*source, EasError::NoTemperatureSamples { .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(*attempts.lock().unwrap(), vec![0.0, 10.0, 30.0, 70.0, 150.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failures() -> anyhow::Result<()> {
        let monitor = HealthMonitor::new(HealthConfig::default());
        let (attempts, start) = recorder();
        monitor
            .run("tma", || {
                let attempts = attempts.clone();
                async move {
                    let mut attempts = attempts.lock().unwrap();
                    attempts.push(start.elapsed().as_secs_f64());
                    if attempts.len() < 3 {
                        Err(failing())
                    } else {
                        Ok(())
                    }
                }
            })
            .await?;
        assert_eq!(*attempts.lock().unwrap(), vec![0.0, 10.0, 30.0]);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn long_healthy_run_resets_the_count() {
        let monitor = HealthMonitor::new(HealthConfig {
            max_failures: 3,
            ..HealthConfig::default()
        });
        let (attempts, start) = recorder();
        let result = monitor
            .run("weather", || {
                let attempts = attempts.clone();
                async move {
                    let n = {
                        let mut attempts = attempts.lock().unwrap();
                        attempts.push(start.elapsed().as_secs_f64());
                        attempts.len()
                    };
                    // The second attempt runs for two hours before failing.
                    if n == 2 {
                        tokio::time::sleep(Duration::from_secs(7200)).await;
                    }
                    Err(failing())
                }
            })
            .await;

        assert!(matches!(result, Err(EasError::Escalated { failures: 3, .. })));
        // fail (10 s), long run resets to 1 (10 s), fail (20 s), fail: escalate.
        assert_eq!(
            *attempts.lock().unwrap(),
            vec![0.0, 10.0, 7220.0, 7240.0]
        );
    }
}
