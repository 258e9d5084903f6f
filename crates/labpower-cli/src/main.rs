// labpower -- command line front end for KA3005-style bench power supplies.
//
// Usage:
//   labpower ports
//   labpower monitor --port /dev/ttyUSB0 --duration 30
//   labpower monitor --demo --json
//   labpower set --port /dev/ttyUSB0 --voltage 5 --current 0.5 --output on

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use labpower_core::demo::{SimulatedSupply, DEMO_PORT};
use labpower_core::prelude::*;
use labpower_core::protocol::{list_ports, Link};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// Remote control for KA3005-style bench power supplies.
#[derive(Parser)]
#[command(name = "labpower", version, about)]
struct Cli {
    /// Connection settings file (JSON). Defaults to
    /// <config dir>/labpower/config.json when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log protocol traffic.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: CliCommand,
}

/// Where to find the supply.
#[derive(clap::Args)]
struct Target {
    /// Serial port path (e.g. /dev/ttyUSB0, COM3).
    #[arg(long, conflicts_with = "demo")]
    port: Option<String>,

    /// Talk to a simulated supply instead of hardware.
    #[arg(long)]
    demo: bool,
}

#[derive(Subcommand)]
enum CliCommand {
    /// List serial ports.
    Ports,

    /// Print setpoints and live readings until Ctrl-C.
    Monitor {
        #[command(flatten)]
        target: Target,

        /// Duration in seconds (0 = run until Ctrl-C).
        #[arg(long, default_value_t = 0)]
        duration: u64,

        /// One JSON object per reading.
        #[arg(long)]
        json: bool,
    },

    /// Change setpoints or switch the output.
    Set {
        #[command(flatten)]
        target: Target,

        /// Voltage setpoint in volts.
        #[arg(long)]
        voltage: Option<f64>,

        /// Current limit in amps.
        #[arg(long)]
        current: Option<f64>,

        /// Output relay.
        #[arg(long, value_enum)]
        output: Option<OnOff>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OnOff {
    On,
    Off,
}

/// A reading as printed by `monitor --json`.
#[derive(Serialize)]
struct Reading {
    timestamp: DateTime<Local>,
    kind: CommandKind,
    value: f64,
}

// ---------------------------------------------------------------------------
// Setup helpers
// ---------------------------------------------------------------------------

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("labpower").join("config.json"))
}

fn load_config(explicit: Option<&Path>) -> Result<ConnectionConfig> {
    if let Some(path) = explicit {
        return ConnectionConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()));
    }
    match default_config_path() {
        Some(path) if path.exists() => {
            debug!("Using config {}", path.display());
            ConnectionConfig::load(&path)
                .with_context(|| format!("failed to load config {}", path.display()))
        }
        _ => Ok(ConnectionConfig::default()),
    }
}

fn open_link(target: &Target) -> Result<(Box<dyn Link>, String)> {
    if target.demo {
        return Ok((Box::new(SimulatedSupply::new()), DEMO_PORT.to_string()));
    }
    let port = match &target.port {
        Some(port) => port.clone(),
        None => match list_ports().into_iter().next() {
            Some(info) => {
                info!("No --port given, using {}", info.name);
                info.name
            }
            None => bail!("no serial port found; pass --port or --demo"),
        },
    };
    Ok((Box::new(SerialLink::new()), port))
}

/// Move worker events onto the async side
fn forward_events(events: std::sync::mpsc::Receiver<WorkerEvent>) -> UnboundedReceiver<WorkerEvent> {
    let (tx, rx) = unbounded_channel();
    tokio::task::spawn_blocking(move || {
        while let Ok(event) = events.recv() {
            if tx.send(event).is_err() {
                break;
            }
        }
    });
    rx
}

/// Wait for the worker to report `Running`, or fail with the reason it stopped
async fn wait_running(events: &mut UnboundedReceiver<WorkerEvent>) -> Result<()> {
    while let Some(event) = events.recv().await {
        match event {
            WorkerEvent::State(ConnectionState::Running) => return Ok(()),
            WorkerEvent::Disconnected(DisconnectReason::OpenFailed(reason)) => {
                bail!("can't open port: {reason}")
            }
            WorkerEvent::Disconnected(reason) => bail!("disconnected: {reason:?}"),
            _ => {}
        }
    }
    bail!("worker stopped unexpectedly")
}

/// Cancel the connection and wait for the worker to tear down
async fn disconnect(handle: ConnectionHandle) -> Result<()> {
    tokio::task::spawn_blocking(move || drop(handle))
        .await
        .context("worker shutdown failed")
}

fn unit(kind: CommandKind) -> &'static str {
    match kind {
        CommandKind::SetVoltage | CommandKind::ReadVoltage => "V",
        CommandKind::SetCurrent | CommandKind::ReadCurrent => "A",
        CommandKind::SetOutputEnabled => "",
    }
}

fn print_reading(command: &Command, json: bool) -> Result<()> {
    let Some(value) = command.decoded_value() else {
        return Ok(());
    };
    let reading = Reading {
        timestamp: Local::now(),
        kind: command.kind(),
        value,
    };
    if json {
        println!("{}", serde_json::to_string(&reading)?);
    } else {
        println!(
            "[{}] {}: {} {}",
            reading.timestamp.format("%H:%M:%S%.3f"),
            command.kind().label(),
            command.decoded_answer().unwrap_or_default(),
            unit(command.kind())
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_ports() -> Result<()> {
    let ports = list_ports();
    if ports.is_empty() {
        println!("No serial ports found.");
        return Ok(());
    }
    for port in ports {
        match port.usb {
            Some(usb) => println!(
                "{}  {:04x}:{:04x} {}",
                port.name,
                usb.vid,
                usb.pid,
                usb.product.unwrap_or_default()
            ),
            None => println!("{}", port.name),
        }
    }
    Ok(())
}

async fn cmd_monitor(
    config: ConnectionConfig,
    target: &Target,
    duration_secs: u64,
    json: bool,
) -> Result<()> {
    let (link, port) = open_link(target)?;
    let (comm, events) = Communication::new(config);
    let mut events = forward_events(events);

    let handle = comm
        .connect(link, &port)
        .with_context(|| format!("failed to connect to {port}"))?;
    wait_running(&mut events).await?;
    info!("Monitoring {} (Ctrl-C to stop)", port);

    let deadline = (duration_secs > 0).then(|| Instant::now() + Duration::from_secs(duration_secs));
    let mut state = SupplyState::new();

    loop {
        let until_deadline = async {
            match deadline {
                Some(dl) => sleep_until(dl).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            _ = until_deadline => {
                info!("Monitor duration elapsed");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                state.apply(&event);
                match &event {
                    WorkerEvent::Resolved(command) => print_reading(command, json)?,
                    WorkerEvent::Disconnected(reason) => {
                        warn!("Connection lost: {:?}", reason);
                        break;
                    }
                    WorkerEvent::State(s) => debug!("State: {:?}", s),
                }
            }
        }
    }

    disconnect(handle).await?;
    if !json {
        println!(
            "Last reading: {:.2} V, {:.3} A ({:.2} W)",
            state.measured_voltage,
            state.measured_current,
            state.power()
        );
    }
    Ok(())
}

async fn cmd_set(
    config: ConnectionConfig,
    target: &Target,
    voltage: Option<f64>,
    current: Option<f64>,
    output: Option<OnOff>,
) -> Result<()> {
    if voltage.is_none() && current.is_none() && output.is_none() {
        bail!("nothing to set; pass --voltage, --current or --output");
    }

    let limits = SupplyLimits::default();
    let (link, port) = open_link(target)?;
    let (comm, events) = Communication::new(config);
    let mut events = forward_events(events);

    let handle = comm
        .connect(link, &port)
        .with_context(|| format!("failed to connect to {port}"))?;
    wait_running(&mut events).await?;

    let mut state = SupplyState::new();
    if let Some(v) = voltage {
        handle.add_command(limits.voltage_command(v)?);
    }
    if let Some(i) = current {
        handle.add_command(limits.current_command(i)?);
    }
    if let Some(flag) = output {
        handle.add_command(state.set_output(matches!(flag, OnOff::On))?);
    }
    handle.add_command(Command::query(CommandKind::SetVoltage));
    handle.add_command(Command::query(CommandKind::SetCurrent));

    // Two readbacks on connect plus the two queued above
    let mut setpoint_readbacks = 0;
    let deadline = Instant::now() + Duration::from_secs(5);
    while setpoint_readbacks < 4 {
        let event = tokio::select! {
            _ = sleep_until(deadline) => bail!("supply did not confirm the new setpoints"),
            event = events.recv() => event,
        };
        let Some(event) = event else { break };
        state.apply(&event);
        match event {
            WorkerEvent::Resolved(command)
                if matches!(command.kind(), CommandKind::SetVoltage | CommandKind::SetCurrent) =>
            {
                setpoint_readbacks += 1;
            }
            WorkerEvent::Disconnected(reason) => bail!("disconnected: {reason:?}"),
            _ => {}
        }
    }

    disconnect(handle).await?;
    println!(
        "Setpoints: {:.2} V, {:.3} A, output {}",
        state.voltage_setpoint,
        state.current_setpoint,
        if state.output_enabled { "on" } else { "off" }
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match &cli.command {
        CliCommand::Ports => cmd_ports(),
        CliCommand::Monitor {
            target,
            duration,
            json,
        } => {
            let config = load_config(cli.config.as_deref())?;
            cmd_monitor(config, target, *duration, *json).await
        }
        CliCommand::Set {
            target,
            voltage,
            current,
            output,
        } => {
            let config = load_config(cli.config.as_deref())?;
            cmd_set(config, target, *voltage, *current, *output).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_monitor() {
        let cli = Cli::parse_from(["labpower", "monitor", "--demo", "--duration", "3", "--json"]);
        match cli.command {
            CliCommand::Monitor {
                target,
                duration,
                json,
            } => {
                assert!(target.demo);
                assert_eq!(duration, 3);
                assert!(json);
            }
            _ => panic!("expected monitor"),
        }
    }

    #[test]
    fn test_cli_parses_set() {
        let cli = Cli::parse_from([
            "labpower", "-v", "set", "--port", "/dev/ttyUSB0", "--voltage", "5", "--output", "on",
        ]);
        assert!(cli.verbose);
        match cli.command {
            CliCommand::Set {
                target,
                voltage,
                current,
                output,
            } => {
                assert_eq!(target.port.as_deref(), Some("/dev/ttyUSB0"));
                assert_eq!(voltage, Some(5.0));
                assert_eq!(current, None);
                assert!(matches!(output, Some(OnOff::On)));
            }
            _ => panic!("expected set"),
        }
    }

    #[test]
    fn test_port_and_demo_conflict() {
        let result = Cli::try_parse_from(["labpower", "monitor", "--demo", "--port", "COM3"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_explicit_config_is_loaded() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "pacing_ms": 75, "poll_enabled": false }"#).unwrap();

        let config = load_config(Some(path.as_path())).unwrap();
        assert_eq!(config.pacing_ms, 75);
        assert!(!config.poll_enabled);

        assert!(load_config(Some(dir.path().join("missing.json").as_path())).is_err());
    }

    #[tokio::test]
    async fn test_set_against_simulated_supply() {
        let config = ConnectionConfig {
            pacing_ms: 2,
            poll_enabled: false,
            ..ConnectionConfig::default()
        };
        let target = Target {
            port: None,
            demo: true,
        };
        cmd_set(config, &target, Some(5.0), Some(0.5), Some(OnOff::On))
            .await
            .unwrap();
    }
}
