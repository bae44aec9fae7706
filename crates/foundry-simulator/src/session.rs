//! Simulation session.
//!
//! A [`Simulator`] is either idle or running one periodic task. The task
//! reads the shared [`ControlState`](crate::controls::ControlState) on every
//! tick and hands the generated patches to a [`PatchSink`].

use crate::controls::SharedControls;
use crate::generator::{self, GeneratorParams, Mode};
use async_trait::async_trait;
use foundry_core::HubHandle;
use foundry_protocol::MachinePatch;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default tick interval.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(500);

/// Errors from a patch sink.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The sink no longer accepts patches.
    #[error("Patch sink closed")]
    Closed,

    /// The patch could not be delivered.
    #[error("Failed to submit patch: {0}")]
    Failed(String),
}

/// Destination for generated patches.
#[async_trait]
pub trait PatchSink: Send + Sync {
    /// Submit one patch.
    async fn submit(&self, patch: MachinePatch) -> Result<(), SinkError>;
}

/// Applies patches directly to an in-process hub.
#[async_trait]
impl PatchSink for HubHandle {
    async fn submit(&self, patch: MachinePatch) -> Result<(), SinkError> {
        self.apply(patch).await.map(|_| ()).map_err(|_| SinkError::Closed)
    }
}

/// Simulator errors.
#[derive(Debug, Error)]
pub enum SimulatorError {
    /// Nothing is selected and not targeting all, or no machines are known.
    #[error("No machine to target")]
    NoTarget,

    /// The machine is not in the known list.
    #[error("Unknown machine: {0}")]
    UnknownMachine(String),

    /// The selected machine has no such sensor.
    #[error("Unknown sensor: {0}")]
    UnknownSensor(String),

    /// No machine is selected.
    #[error("No machine selected")]
    NoSelection,

    /// Submitting a patch failed.
    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Drives generation for one operator session.
pub struct Simulator {
    sink: Arc<dyn PatchSink>,
    controls: SharedControls,
    params: GeneratorParams,
    interval: Duration,
    running: Option<Running>,
}

impl Simulator {
    /// Create an idle simulator.
    #[must_use]
    pub fn new(sink: Arc<dyn PatchSink>, controls: SharedControls) -> Self {
        Self {
            sink,
            controls,
            params: GeneratorParams::default(),
            interval: DEFAULT_TICK_INTERVAL,
            running: None,
        }
    }

    /// Set the tick interval used by the next `start`.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub fn with_params(mut self, params: GeneratorParams) -> Self {
        self.params = params;
        self
    }

    #[must_use]
    pub fn controls(&self) -> &SharedControls {
        &self.controls
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        if self.running.is_some() {
            SessionState::Running
        } else {
            SessionState::Idle
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Start generating.
    ///
    /// A session that is already running is replaced; its task is
    /// cancelled first so two tasks never overlap. In manual single-target
    /// mode the current values are pushed right away.
    ///
    /// # Errors
    ///
    /// Returns [`SimulatorError::NoTarget`] if nothing can be targeted.
    pub async fn start(&mut self) -> Result<(), SimulatorError> {
        let targets = self.controls.read().await.targets().len();
        if targets == 0 {
            return Err(SimulatorError::NoTarget);
        }

        if let Some(previous) = self.running.take() {
            debug!("Replacing running session");
            shutdown(previous).await;
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_ticks(
            Arc::clone(&self.sink),
            Arc::clone(&self.controls),
            self.params,
            self.interval,
            cancel.clone(),
        ));
        self.running = Some(Running { cancel, task });

        info!(targets, interval_ms = self.interval.as_millis() as u64, "Simulation started");

        self.push_if_manual().await
    }

    /// Stop generating.
    ///
    /// When this returns, the periodic task has finished and the offline
    /// patches for every targeted machine have been submitted. Stopping an
    /// idle simulator does nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if a terminal patch cannot be submitted.
    pub async fn stop(&mut self) -> Result<(), SimulatorError> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        shutdown(running).await;

        let patches = {
            let controls = self.controls.read().await;
            generator::terminal_patches(controls.targets())
        };
        let count = patches.len();
        for patch in patches {
            self.sink.submit(patch).await?;
        }

        info!(machines = count, "Simulation stopped");
        Ok(())
    }

    /// Change the generation mode.
    ///
    /// # Errors
    ///
    /// Returns an error if an immediate push fails.
    pub async fn set_mode(&mut self, mode: Mode) -> Result<(), SimulatorError> {
        self.controls.write().await.set_mode(mode);
        debug!(mode = %mode, "Mode changed");
        self.push_if_manual().await
    }

    /// Select the machine to control. A running session is stopped first.
    /// Selecting the machine that is already selected changes nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the machine is unknown or stopping fails.
    pub async fn select_machine(&mut self, id: &str) -> Result<(), SimulatorError> {
        {
            let controls = self.controls.read().await;
            if controls.machine(id).is_none() {
                return Err(SimulatorError::UnknownMachine(id.to_string()));
            }
            if controls.is_selected(id) {
                return Ok(());
            }
        }
        self.stop().await?;
        self.controls.write().await.select(id);
        Ok(())
    }

    /// Switch between all machines and the selected one. A running session
    /// is stopped first.
    ///
    /// # Errors
    ///
    /// Returns an error if stopping fails.
    pub async fn set_target_all(&mut self, on: bool) -> Result<(), SimulatorError> {
        if self.controls.read().await.target_all() == on {
            return Ok(());
        }
        self.stop().await?;
        self.controls.write().await.set_target_all(on);
        Ok(())
    }

    /// Set the operator baseline for a sensor of the selected machine.
    ///
    /// # Errors
    ///
    /// Returns an error if no machine is selected, the sensor is not one of
    /// its sensors, or an immediate push fails.
    pub async fn set_control_value(&mut self, sensor: &str, value: f64) -> Result<(), SimulatorError> {
        {
            let mut controls = self.controls.write().await;
            let machine = controls.selected_machine().ok_or(SimulatorError::NoSelection)?;
            if !machine.sensors.contains_key(sensor) {
                return Err(SimulatorError::UnknownSensor(sensor.to_string()));
            }
            controls.set_value(sensor, value);
        }
        self.push_if_manual().await
    }

    async fn push_if_manual(&self) -> Result<(), SimulatorError> {
        if self.running.is_none() {
            return Ok(());
        }

        let patch = {
            let controls = self.controls.read().await;
            if !controls.pushes_immediately() {
                return Ok(());
            }
            controls.selected_machine().map(|machine| {
                generator::generate_patch(
                    machine,
                    Some(controls.values()),
                    controls.mode(),
                    &self.params,
                    &mut rand::thread_rng(),
                )
            })
        };

        if let Some(patch) = patch {
            self.sink.submit(patch).await?;
        }
        Ok(())
    }
}

async fn shutdown(running: Running) {
    running.cancel.cancel();
    if let Err(e) = running.task.await {
        warn!("Simulation task ended abnormally: {}", e);
    }
}

async fn run_ticks(
    sink: Arc<dyn PatchSink>,
    controls: SharedControls,
    params: GeneratorParams,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut rng = StdRng::from_entropy();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // Skip immediate first tick.

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let patches = {
                    let controls = controls.read().await;
                    generator::tick_patches(&controls, &params, &mut rng)
                };

                for patch in patches {
                    if cancel.is_cancelled() {
                        break;
                    }
                    if let Err(e) = sink.submit(patch).await {
                        warn!(error = %e, "Failed to submit patch");
                    }
                }
            }
        }
    }

    debug!("Simulation task finished");
}
