//! # foundry-simulator
//!
//! Synthetic telemetry for the foundry hub.
//!
//! An operator session drives one periodic task that generates machine
//! patches from live control inputs, either for a single selected machine
//! or for every known machine, and submits them to the server.
//!
//! - **Generator** - Per-tick patch generation, targeting and shutdown patches
//! - **Controls** - Shared operator inputs and the known machine list
//! - **Session** - The Idle/Running state machine and the periodic task
//! - **Link** - WebSocket connection to the server with reconnection
//! - **Console** - Line-oriented operator commands
//!
//! ## Example
//!
//! ```rust,ignore
//! use foundry_simulator::{ControlState, Mode, Simulator};
//!
//! let controls = ControlState::new(Mode::Manual).shared();
//! let mut sim = Simulator::new(sink, controls);
//! sim.start().await?;
//! sim.set_control_value("temperature", 80.0).await?;
//! sim.stop().await?;
//! ```

pub mod config;
pub mod console;
pub mod controls;
pub mod generator;
pub mod link;
pub mod session;

pub use config::{ConfigError, ReconnectConfig, SimulatorConfig};
pub use console::{Command, CommandError};
pub use controls::{slider_ceiling, ControlState, SharedControls};
pub use generator::{generate_patch, terminal_patches, tick_patches, GeneratorParams, Mode};
pub use link::ServerLink;
pub use session::{PatchSink, SessionState, SimulatorError, Simulator, SinkError};
