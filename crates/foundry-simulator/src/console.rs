//! Line-oriented operator console.
//!
//! ```text
//! start                  begin generating
//! stop                   stop and send offline patches
//! mode random|manual     switch generation mode
//! select <id>            choose the controlled machine
//! all on|off             target every machine or only the selected one
//! set <sensor> <value>   set a baseline for the selected machine
//! status | list | help | quit
//! ```

use crate::controls::slider_ceiling;
use crate::generator::{Mode, ParseModeError};
use crate::session::{SessionState, Simulator, SimulatorError};
use std::fmt::Write as _;
use std::str::FromStr;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

/// Help text printed by `help`.
pub const HELP: &str = "\
commands:
  start                  begin generating
  stop                   stop and send offline patches
  mode random|manual     switch generation mode
  select <id>            choose the controlled machine
  all on|off             target every machine or only the selected one
  set <sensor> <value>   set a baseline for the selected machine
  status                 show the session
  list                   show known machines
  quit                   stop and exit";

/// A parsed console command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Start,
    Stop,
    Mode(Mode),
    Select(String),
    All(bool),
    Set { sensor: String, value: f64 },
    Status,
    List,
    Help,
    Quit,
}

/// Console parse errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error("empty command")]
    Empty,

    #[error("unknown command '{0}', try 'help'")]
    Unknown(String),

    #[error("missing {0}")]
    MissingArgument(&'static str),

    #[error("unexpected argument '{0}'")]
    TrailingArgument(String),

    #[error(transparent)]
    Mode(#[from] ParseModeError),

    #[error("expected 'on' or 'off', got '{0}'")]
    Toggle(String),

    #[error("'{0}' is not a number")]
    Number(String),

    #[error("{sensor} must be between 0 and {max}, got {value}")]
    OutOfRange { sensor: String, value: f64, max: f64 },
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let name = words.next().ok_or(CommandError::Empty)?;

        let command = match name.to_ascii_lowercase().as_str() {
            "start" => Command::Start,
            "stop" => Command::Stop,
            "status" => Command::Status,
            "list" | "ls" => Command::List,
            "help" | "?" => Command::Help,
            "quit" | "exit" => Command::Quit,
            "mode" => Command::Mode(words.next().ok_or(CommandError::MissingArgument("mode"))?.parse()?),
            "select" => Command::Select(
                words
                    .next()
                    .ok_or(CommandError::MissingArgument("machine id"))?
                    .to_string(),
            ),
            "all" => {
                let toggle = words.next().ok_or(CommandError::MissingArgument("on|off"))?;
                match toggle.to_ascii_lowercase().as_str() {
                    "on" | "true" => Command::All(true),
                    "off" | "false" => Command::All(false),
                    _ => return Err(CommandError::Toggle(toggle.to_string())),
                }
            }
            "set" => {
                let sensor = words.next().ok_or(CommandError::MissingArgument("sensor"))?;
                let raw = words.next().ok_or(CommandError::MissingArgument("value"))?;
                let value: f64 = raw
                    .parse()
                    .ok()
                    .filter(|v: &f64| v.is_finite())
                    .ok_or_else(|| CommandError::Number(raw.to_string()))?;
                let max = slider_ceiling(sensor);
                if !(0.0..=max).contains(&value) {
                    return Err(CommandError::OutOfRange {
                        sensor: sensor.to_string(),
                        value,
                        max,
                    });
                }
                Command::Set {
                    sensor: sensor.to_string(),
                    value,
                }
            }
            other => return Err(CommandError::Unknown(other.to_string())),
        };

        match words.next() {
            Some(extra) => Err(CommandError::TrailingArgument(extra.to_string())),
            None => Ok(command),
        }
    }
}

/// Run one command and describe the outcome.
///
/// # Errors
///
/// Returns the simulator error if the command could not be carried out.
pub async fn execute(sim: &mut Simulator, command: Command) -> Result<String, SimulatorError> {
    let reply = match command {
        Command::Start => {
            sim.start().await?;
            "simulation started".to_string()
        }
        Command::Stop => {
            if sim.is_running() {
                sim.stop().await?;
                "simulation stopped".to_string()
            } else {
                "simulation is not running".to_string()
            }
        }
        Command::Mode(mode) => {
            sim.set_mode(mode).await?;
            format!("mode: {mode}")
        }
        Command::Select(id) => {
            let was_running = sim.is_running();
            sim.select_machine(&id).await?;
            if was_running && !sim.is_running() {
                format!("selected {id} (simulation stopped)")
            } else {
                format!("selected {id}")
            }
        }
        Command::All(on) => {
            let was_running = sim.is_running();
            sim.set_target_all(on).await?;
            let target = if on { "all machines" } else { "selected machine" };
            if was_running && !sim.is_running() {
                format!("targeting {target} (simulation stopped)")
            } else {
                format!("targeting {target}")
            }
        }
        Command::Set { sensor, value } => {
            sim.set_control_value(&sensor, value).await?;
            format!("{sensor} = {value}")
        }
        Command::Status => status(sim).await,
        Command::List => list(sim).await,
        Command::Help => HELP.to_string(),
        Command::Quit => String::new(),
    };
    Ok(reply)
}

async fn status(sim: &Simulator) -> String {
    let controls = sim.controls().read().await;
    let state = match sim.state() {
        SessionState::Idle => "idle",
        SessionState::Running => "running",
    };

    let mut out = format!(
        "state: {state}\nmode: {}\ntarget: {}\nselected: {}",
        controls.mode(),
        if controls.target_all() { "all" } else { "selected" },
        controls.selected().unwrap_or("-"),
    );
    for (sensor, value) in controls.values() {
        let _ = write!(out, "\n  {sensor} = {value:.2} (max {})", slider_ceiling(sensor));
    }
    out
}

async fn list(sim: &Simulator) -> String {
    let controls = sim.controls().read().await;
    if controls.machines().is_empty() {
        return "no machines known yet".to_string();
    }

    let mut out = String::new();
    for machine in controls.machines() {
        let marker = if controls.is_selected(&machine.id) { '*' } else { ' ' };
        let _ = writeln!(
            out,
            "{marker} {:<10} {:<24} {:<16} {}",
            machine.id, machine.name, machine.kind, machine.status
        );
    }
    out.trim_end().to_string()
}

/// Read commands from `input` until `quit` or end of input.
///
/// # Errors
///
/// Returns an error if reading input or writing output fails. Command
/// failures are reported to `output` and do not end the loop.
pub async fn run<R, W>(sim: &mut Simulator, input: R, mut output: W) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();

    while let Some(line) = lines.next_line().await? {
        let command = match line.parse::<Command>() {
            Ok(command) => command,
            Err(CommandError::Empty) => continue,
            Err(e) => {
                output.write_all(format!("error: {e}\n").as_bytes()).await?;
                output.flush().await?;
                continue;
            }
        };

        if command == Command::Quit {
            break;
        }

        let reply = match execute(sim, command).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "Command failed");
                format!("error: {e}")
            }
        };
        output.write_all(reply.as_bytes()).await?;
        output.write_all(b"\n").await?;
        output.flush().await?;
    }

    Ok(())
}
