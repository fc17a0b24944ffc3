use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::command::{Ack, Command, CommandError, CommandSender, Component};
use crate::telemetry::{TelemetryBus, TelemetryFrame};

const MAX_DATAGRAM: usize = 65507;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandFrame {
    pub seq: u64,
    pub component: Component,
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckFrame {
    pub seq: u64,
    pub ok: bool,
    #[serde(default)]
    pub result: String,
}

pub fn decode_frame(buf: &[u8]) -> serde_json::Result<TelemetryFrame> {
    serde_json::from_slice(buf)
}

/// Receives JSON telemetry datagrams and publishes them on the bus.
pub struct TelemetryListener {
    socket: UdpSocket,
}

impl TelemetryListener {
    pub async fn bind(addr: &str) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("binding telemetry socket {addr}"))?;
        Ok(TelemetryListener { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn run(&self, bus: &TelemetryBus) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (size, src) = self.socket.recv_from(&mut buf).await?;
            match decode_frame(&buf[..size]) {
                Ok(frame) => bus.dispatch(frame),
                Err(err) => warn!(%src, "dropping malformed telemetry datagram: {err}"),
            }
        }
    }
}

/// Publish one telemetry frame to a listener.
pub async fn send_frame(addr: SocketAddr, frame: &TelemetryFrame) -> Result<()> {
    let socket = UdpSocket::bind(unspecified_for(addr)).await?;
    let bytes = serde_json::to_vec(frame)?;
    socket.send_to(&bytes, addr).await?;
    Ok(())
}

/// Sends commands as JSON datagrams and waits for the matching ack.
pub struct UdpCommandSender {
    endpoints: HashMap<Component, SocketAddr>,
    next_seq: AtomicU64,
}

impl UdpCommandSender {
    pub fn new(endpoints: HashMap<Component, SocketAddr>) -> Self {
        UdpCommandSender {
            endpoints,
            next_seq: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl CommandSender for UdpCommandSender {
    async fn send(&self, command: &Command, timeout: Duration) -> Result<Ack, CommandError> {
        let component = command.component();
        let endpoint = *self
            .endpoints
            .get(&component)
            .ok_or(CommandError::NoEndpoint(component))?;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        let socket = UdpSocket::bind(unspecified_for(endpoint)).await?;
        socket.connect(endpoint).await?;
        let frame = CommandFrame {
            seq,
            component,
            command: command.clone(),
        };
        socket.send(&serde_json::to_vec(&frame)?).await?;
        debug!(%component, command = command.name(), seq, "command sent");

        let ack = match tokio::time::timeout(timeout, await_ack(&socket, seq)).await {
            Ok(ack) => ack?,
            Err(_) => {
                return Err(CommandError::Timeout {
                    component,
                    command: command.name(),
                    timeout,
                })
            }
        };
        if !ack.ok {
            return Err(CommandError::Rejected {
                component,
                command: command.name(),
                reason: ack.result,
            });
        }
        Ok(Ack { result: ack.result })
    }
}

async fn await_ack(socket: &UdpSocket, seq: u64) -> Result<AckFrame, CommandError> {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let size = socket.recv(&mut buf).await?;
        match serde_json::from_slice::<AckFrame>(&buf[..size]) {
            Ok(ack) if ack.seq == seq => return Ok(ack),
            Ok(ack) => debug!(seq = ack.seq, expected = seq, "ignoring stale ack"),
            Err(err) => warn!("ignoring malformed ack: {err}"),
        }
    }
}

fn unspecified_for(addr: SocketAddr) -> SocketAddr {
    if addr.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::DeviceId;
    use crate::telemetry::AirFlow;

    // Acks every command, rejecting chillers.
    async fn fake_component() -> Result<SocketAddr> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        let addr = socket.local_addr()?;
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            while let Ok((size, src)) = socket.recv_from(&mut buf).await {
                let Ok(frame) = serde_json::from_slice::<CommandFrame>(&buf[..size]) else {
                    continue;
                };
                let ok = !matches!(frame.command, Command::ConfigChiller { .. });
                let ack = AckFrame {
                    seq: frame.seq,
                    ok,
                    result: if ok { "Done".into() } else { "chiller offline".into() },
                };
                let bytes = serde_json::to_vec(&ack).unwrap();
                socket.send_to(&bytes, src).await.unwrap();
            }
        });
        Ok(addr)
    }

    #[tokio::test]
    async fn command_round_trip() -> Result<()> {
        let addr = fake_component().await?;
        let sender = UdpCommandSender::new(HashMap::from([(Component::Hvac, addr)]));

        let ack = sender
            .send(&Command::EnableDevice { device: DeviceId::VEC04 }, Duration::from_secs(2))
            .await?;
        assert_eq!(ack.result, "Done");

        let err = sender
            .send(
                &Command::ConfigChiller { device: DeviceId::Chiller01P01, active_setpoint: 1.0 },
                Duration::from_secs(2),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Rejected { reason, .. } if reason == "chiller offline"));
        Ok(())
    }

    #[tokio::test]
    async fn missing_endpoint_is_reported() {
        let sender = UdpCommandSender::new(HashMap::new());
        let err = sender
            .send(&Command::SetThermal { top_end_chiller_setpoint: 1.0 }, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::NoEndpoint(Component::MtMount)));
    }

    #[tokio::test]
    async fn silent_component_times_out() -> Result<()> {
        let silent = UdpSocket::bind("127.0.0.1:0").await?;
        let sender = UdpCommandSender::new(HashMap::from([(Component::M1m3ts, silent.local_addr()?)]));
        let err = sender
            .send(&Command::uniform_fan_demand(500), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Timeout { command: "heaterFanDemand", .. }));
        Ok(())
    }

    #[tokio::test]
    async fn listener_publishes_frames() -> Result<()> {
        let bus = std::sync::Arc::new(TelemetryBus::new());
        let listener = TelemetryListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let mut wind = bus.air_flow.subscribe();
        let task_bus = bus.clone();
        let task = tokio::spawn(async move { listener.run(&task_bus).await });

        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        socket.send_to(b"not json", addr).await?;
        let sample = AirFlow { sal_index: 301, speed: 7.5, timestamp: 100.0 };
        send_frame(addr, &TelemetryFrame::AirFlow(sample.clone())).await?;

        assert_eq!(wind.next(false, Duration::from_secs(2)).await?, sample);
        task.abort();
        Ok(())
    }
}
