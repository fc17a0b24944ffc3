use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use eas::Clock;
use eas_protocol::udp::{send_frame, UdpCommandSender};
use eas_protocol::{Command, CommandSender, Component, SummaryState, SummaryStateSample, TelemetryFrame};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

/// Bench tool for the automation daemon and the components it drives.
#[derive(Debug, Parser)]
#[command(name = "eas-command", version, about)]
struct Cli {
    #[command(subcommand)]
    action: Action,
}

#[derive(Debug, Subcommand)]
enum Action {
    /// Send one command and wait for its ack,
    /// e.g. '{"command":"enableDevice","device":"loadingBayFan04P04"}'.
    Send {
        to: SocketAddr,
        command: String,
        #[arg(long, default_value_t = 10.0)]
        timeout: f64,
    },
    /// Publish one telemetry frame to a daemon's telemetry port.
    Inject { to: SocketAddr, frame: String },
    /// Report a component as ENABLED so the daemon starts commanding it.
    Enable {
        to: SocketAddr,
        #[arg(value_parser = parse_component)]
        component: Component,
    },
}

fn parse_component(name: &str) -> Result<Component, String> {
    Component::ALL
        .into_iter()
        .find(|component| component.as_str().eq_ignore_ascii_case(name))
        .ok_or_else(|| format!("unknown component {name:?}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    match Cli::parse().action {
        Action::Send { to, command, timeout } => {
            let command: Command = serde_json::from_str(&command).context("parsing command")?;
            if !(timeout > 0.0 && timeout.is_finite()) {
                bail!("timeout must be positive");
            }
            let sender = UdpCommandSender::new(HashMap::from([(command.component(), to)]));
            let ack = sender.send(&command, Duration::from_secs_f64(timeout)).await?;
            println!("{} {}: {}", command.component(), command.name(), ack.result);
        }
        Action::Inject { to, frame } => {
            let frame: TelemetryFrame = serde_json::from_str(&frame).context("parsing frame")?;
            send_frame(to, &frame).await?;
        }
        Action::Enable { to, component } => {
            let frame = TelemetryFrame::SummaryState(SummaryStateSample {
                component,
                summary_state: SummaryState::Enabled,
                timestamp: Clock::system().now(),
            });
            send_frame(to, &frame).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn component_names_are_case_insensitive() {
        assert_eq!(parse_component("hvac"), Ok(Component::Hvac));
        assert_eq!(parse_component("MTMount"), Ok(Component::MtMount));
        assert!(parse_component("dome").is_err());
    }
}
