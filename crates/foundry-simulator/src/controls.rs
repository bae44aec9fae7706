//! Operator control state.
//!
//! One `ControlState` is shared between the operator console, the server
//! link and the periodic task. The task reads it on every tick, so any
//! change is picked up within one interval.

use crate::generator::Mode;
use foundry_protocol::{Machine, MachineId, Sensors};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Shared handle to the control state.
pub type SharedControls = Arc<RwLock<ControlState>>;

/// Live control inputs and the latest known machine list.
#[derive(Debug, Clone, Default)]
pub struct ControlState {
    mode: Mode,
    selected: Option<MachineId>,
    target_all: bool,
    values: Sensors,
    machines: Vec<Machine>,
}

impl ControlState {
    #[must_use]
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Wrap into a shared handle.
    #[must_use]
    pub fn shared(self) -> SharedControls {
        Arc::new(RwLock::new(self))
    }

    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    #[must_use]
    pub fn target_all(&self) -> bool {
        self.target_all
    }

    pub fn set_target_all(&mut self, on: bool) {
        self.target_all = on;
    }

    /// Selected machine id, if any.
    #[must_use]
    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    #[must_use]
    pub fn is_selected(&self, id: &str) -> bool {
        self.selected.as_deref() == Some(id)
    }

    /// Operator baselines for the selected machine.
    #[must_use]
    pub fn values(&self) -> &Sensors {
        &self.values
    }

    #[must_use]
    pub fn machines(&self) -> &[Machine] {
        &self.machines
    }

    #[must_use]
    pub fn machine(&self, id: &str) -> Option<&Machine> {
        self.machines.iter().find(|m| m.id == id)
    }

    #[must_use]
    pub fn selected_machine(&self) -> Option<&Machine> {
        self.selected.as_deref().and_then(|id| self.machine(id))
    }

    /// Whether edits to control values are pushed out immediately.
    #[must_use]
    pub fn pushes_immediately(&self) -> bool {
        self.mode == Mode::Manual && !self.target_all && self.selected.is_some()
    }

    /// Select a machine, re-initializing control values from its last
    /// known sensors. Selecting an id that is not known yet keeps the
    /// values empty until the machine list arrives.
    pub fn select(&mut self, id: impl Into<MachineId>) {
        let id = id.into();
        self.values = self
            .machine(&id)
            .map(|m| m.sensors.clone())
            .unwrap_or_default();
        debug!(machine = %id, "Machine selected");
        self.selected = Some(id);
    }

    /// Set one operator baseline.
    pub fn set_value(&mut self, sensor: impl Into<String>, value: f64) {
        self.values.insert(sensor.into(), value);
    }

    /// Install a full machine list from `machines:list`.
    ///
    /// Selects the first machine when nothing is selected yet. A selection
    /// made before the list arrived gets its control values here.
    pub fn replace_machines(&mut self, machines: Vec<Machine>) {
        self.machines = machines;

        match self.selected.clone() {
            None => {
                if let Some(first) = self.machines.first().map(|m| m.id.clone()) {
                    self.select(first);
                }
            }
            Some(id) if self.values.is_empty() => self.select(id),
            Some(_) => {}
        }
    }

    /// Refresh one record from `machine:update`.
    ///
    /// Control values are left alone so an operator's edits are not
    /// overwritten by the echo of their own patches.
    pub fn update_machine(&mut self, machine: Machine) {
        match self.machines.iter_mut().find(|m| m.id == machine.id) {
            Some(slot) => *slot = machine,
            None => self.machines.push(machine),
        }
    }

    /// Machines the generator currently targets.
    #[must_use]
    pub fn targets(&self) -> Vec<&Machine> {
        if self.target_all {
            self.machines.iter().collect()
        } else {
            self.selected_machine().into_iter().collect()
        }
    }
}

/// Upper bound of the operator's control range for a sensor.
#[must_use]
pub fn slider_ceiling(sensor: &str) -> f64 {
    let key = sensor.to_ascii_lowercase();
    if key.contains("temp") {
        150.0
    } else if key.contains("vib") || key.contains("press") {
        100.0
    } else if key.contains("speed") || key.contains("rot") {
        3000.0
    } else if key.contains("volt") {
        380.0
    } else if key.contains("freq") {
        60.0
    } else if key.contains("ph") {
        14.0
    } else {
        100.0
    }
}
