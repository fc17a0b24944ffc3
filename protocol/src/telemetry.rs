use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::command::Component;

/// Number of slots in an ESS temperature sample.
pub const TEMPERATURE_ITEMS: usize = 16;

const TOPIC_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("timed out after {timeout:?} waiting for {topic}")]
    Timeout { topic: &'static str, timeout: Duration },
    #[error("telemetry topic {topic} is closed")]
    Closed { topic: &'static str },
}

// Every sample carries a TAI timestamp in seconds.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AirFlow {
    pub sal_index: u32,
    pub speed: f64,
    pub timestamp: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Temperature {
    pub sal_index: u32,
    #[serde(default)]
    pub sensor_name: String,
    pub num_channels: usize,
    pub temperature_item: Vec<f64>,
    pub timestamp: f64,
}

impl Temperature {
    /// First channel, the one reported by single-probe ESS controllers.
    pub fn first(&self) -> f64 {
        match self.temperature_item.first() {
            Some(value) if self.num_channels > 0 => *value,
            _ => f64::NAN,
        }
    }

    /// Channels actually populated by the controller.
    pub fn channels(&self) -> &[f64] {
        let n = self.num_channels.min(self.temperature_item.len());
        &self.temperature_item[..n]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DewPoint {
    pub sal_index: u32,
    pub dew_point: f64,
    pub timestamp: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApertureShutter {
    /// Percent open, one entry per shutter door.
    pub position_actual: [f64; 2],
    pub timestamp: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Louvers {
    pub position_actual: Vec<f64>,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SummaryState {
    Offline,
    Standby,
    Disabled,
    Enabled,
    Fault,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryStateSample {
    pub component: Component,
    pub summary_state: SummaryState,
    pub timestamp: f64,
}

/// Datagram envelope for every telemetry stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic", rename_all = "camelCase")]
pub enum TelemetryFrame {
    AirFlow(AirFlow),
    Temperature(Temperature),
    DewPoint(DewPoint),
    ApertureShutter(ApertureShutter),
    Louvers(Louvers),
    SummaryState(SummaryStateSample),
}

/// A named telemetry stream.
///
/// The most recent sample is cached for non-blocking reads, and every
/// subscriber gets its own queue of samples published after it subscribed.
pub struct Topic<T> {
    name: &'static str,
    latest: Mutex<Option<T>>,
    sender: broadcast::Sender<T>,
}

impl<T: Clone + Send + 'static> Topic<T> {
    pub fn new(name: &'static str) -> Self {
        let (sender, _) = broadcast::channel(TOPIC_CAPACITY);
        Topic {
            name,
            latest: Mutex::new(None),
            sender,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn publish(&self, sample: T) {
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(sample.clone());
        // Having no subscribers is not an error, latest() still sees the sample.
        let _ = self.sender.send(sample);
    }

    pub fn latest(&self) -> Option<T> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn subscribe(&self) -> Subscription<T> {
        Subscription {
            topic: self.name,
            receiver: self.sender.subscribe(),
        }
    }
}

pub struct Subscription<T> {
    topic: &'static str,
    receiver: broadcast::Receiver<T>,
}

impl<T: Clone> Subscription<T> {
    pub fn topic(&self) -> &'static str {
        self.topic
    }

    /// Next queued sample, or `None` once the topic is gone.
    ///
    /// Cancel safe. A subscriber that falls behind loses the overflowed
    /// samples and carries on with the oldest one still queued.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.receiver.recv().await {
                Ok(sample) => return Some(sample),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(topic = self.topic, skipped, "telemetry subscriber fell behind");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Drop everything queued so far.
    pub fn flush(&mut self) {
        self.receiver = self.receiver.resubscribe();
    }

    pub async fn next(&mut self, flush: bool, timeout: Duration) -> Result<T, TelemetryError> {
        if flush {
            self.flush();
        }
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(Some(sample)) => Ok(sample),
            Ok(None) => Err(TelemetryError::Closed { topic: self.topic }),
            Err(_) => Err(TelemetryError::Timeout {
                topic: self.topic,
                timeout,
            }),
        }
    }
}

/// All telemetry streams the automation consumes.
pub struct TelemetryBus {
    pub air_flow: Topic<AirFlow>,
    pub temperature: Topic<Temperature>,
    pub dew_point: Topic<DewPoint>,
    pub aperture_shutter: Topic<ApertureShutter>,
    pub louvers: Topic<Louvers>,
    hvac_state: Topic<SummaryStateSample>,
    m1m3ts_state: Topic<SummaryStateSample>,
    mtmount_state: Topic<SummaryStateSample>,
}

impl TelemetryBus {
    pub fn new() -> Self {
        TelemetryBus {
            air_flow: Topic::new("ESS.airFlow"),
            temperature: Topic::new("ESS.temperature"),
            dew_point: Topic::new("ESS.dewPoint"),
            aperture_shutter: Topic::new("MTDome.apertureShutter"),
            louvers: Topic::new("MTDome.louvers"),
            hvac_state: Topic::new("HVAC.summaryState"),
            m1m3ts_state: Topic::new("MTM1M3TS.summaryState"),
            mtmount_state: Topic::new("MTMount.summaryState"),
        }
    }

    pub fn summary_state(&self, component: Component) -> &Topic<SummaryStateSample> {
        match component {
            Component::Hvac => &self.hvac_state,
            Component::M1m3ts => &self.m1m3ts_state,
            Component::MtMount => &self.mtmount_state,
        }
    }

    pub fn dispatch(&self, frame: TelemetryFrame) {
        match frame {
            TelemetryFrame::AirFlow(sample) => self.air_flow.publish(sample),
            TelemetryFrame::Temperature(sample) => self.temperature.publish(sample),
            TelemetryFrame::DewPoint(sample) => self.dew_point.publish(sample),
            TelemetryFrame::ApertureShutter(sample) => self.aperture_shutter.publish(sample),
            TelemetryFrame::Louvers(sample) => self.louvers.publish(sample),
            TelemetryFrame::SummaryState(sample) => {
                self.summary_state(sample.component).publish(sample)
            }
        }
    }
}

impl Default for TelemetryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wind(speed: f64, timestamp: f64) -> AirFlow {
        AirFlow {
            sal_index: 301,
            speed,
            timestamp,
        }
    }

    #[tokio::test]
    async fn latest_is_cached_without_subscribers() {
        let topic = Topic::new("wind");
        assert_eq!(topic.latest(), None);
        topic.publish(wind(3.0, 1.0));
        topic.publish(wind(4.0, 2.0));
        assert_eq!(topic.latest(), Some(wind(4.0, 2.0)));
    }

    #[tokio::test]
    async fn subscribers_see_samples_in_order() {
        let topic = Topic::new("wind");
        let mut first = topic.subscribe();
        let mut second = topic.subscribe();
        topic.publish(wind(1.0, 1.0));
        topic.publish(wind(2.0, 2.0));
        assert_eq!(first.recv().await, Some(wind(1.0, 1.0)));
        assert_eq!(first.recv().await, Some(wind(2.0, 2.0)));
        assert_eq!(second.recv().await, Some(wind(1.0, 1.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn next_with_flush_skips_queued_samples() {
        let topic = Topic::new("wind");
        let mut sub = topic.subscribe();
        topic.publish(wind(1.0, 1.0));

        let err = sub.next(true, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, TelemetryError::Timeout { topic: "wind", .. }));

        topic.publish(wind(2.0, 2.0));
        assert_eq!(sub.next(false, Duration::from_secs(5)).await.unwrap(), wind(2.0, 2.0));
    }

    #[tokio::test]
    async fn dispatch_routes_summary_state_by_component() {
        let bus = TelemetryBus::new();
        bus.dispatch(TelemetryFrame::SummaryState(SummaryStateSample {
            component: Component::MtMount,
            summary_state: SummaryState::Enabled,
            timestamp: 1.0,
        }));
        assert!(bus.summary_state(Component::Hvac).latest().is_none());
        let sample = bus.summary_state(Component::MtMount).latest().unwrap();
        assert_eq!(sample.summary_state, SummaryState::Enabled);
    }

    #[test]
    fn frame_json_is_tagged_by_topic() -> anyhow::Result<()> {
        let frame: TelemetryFrame = serde_json::from_str(
            r#"{"topic":"temperature","salIndex":114,"sensorName":"m1m3-ts-00 1/6",
                "numChannels":2,"temperatureItem":[1.5,2.5,0.0],"timestamp":10.0}"#,
        )?;
        let TelemetryFrame::Temperature(sample) = frame else {
            anyhow::bail!("expected a temperature frame");
        };
        assert_eq!(sample.channels(), &[1.5, 2.5]);
        assert_eq!(sample.first(), 1.5);
        Ok(())
    }
}
