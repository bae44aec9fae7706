//! Machine records and update patches.
//!
//! A [`Machine`] is the unit of state held by the registry. A
//! [`MachinePatch`] describes a desired change to exactly one machine.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Sensor readings keyed by sensor name.
pub type Sensors = BTreeMap<String, f64>;

/// Actuator states keyed by actuator name.
pub type Actuators = BTreeMap<String, bool>;

/// Machine identifier.
pub type MachineId = String;

/// Connectivity status of a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    /// Receiving telemetry.
    Online,
    /// Not receiving telemetry, or shut down in an orderly way.
    #[default]
    Offline,
}

impl MachineStatus {
    /// Wire name of the status.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MachineStatus::Online => "online",
            MachineStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A machine record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    /// Stable unique identifier.
    pub id: MachineId,
    /// Display name.
    pub name: String,
    /// Machine type, e.g. "Compressor".
    #[serde(rename = "type")]
    pub kind: String,
    /// Current status.
    #[serde(default)]
    pub status: MachineStatus,
    /// Sensor values. The key set is fixed at creation.
    #[serde(default)]
    pub sensors: Sensors,
    /// Actuator states. The key set is fixed at creation.
    #[serde(default)]
    pub actuators: Actuators,
    /// Milliseconds since the Unix epoch of the last applied update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<u64>,
}

impl Machine {
    /// Create an offline machine with no sensors or actuators.
    #[must_use]
    pub fn new(id: impl Into<MachineId>, name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: kind.into(),
            status: MachineStatus::Offline,
            sensors: Sensors::new(),
            actuators: Actuators::new(),
            last_update: None,
        }
    }

    /// Add a sensor with an initial value.
    #[must_use]
    pub fn with_sensor(mut self, name: impl Into<String>, value: f64) -> Self {
        self.sensors.insert(name.into(), value);
        self
    }

    /// Add an actuator with an initial state.
    #[must_use]
    pub fn with_actuator(mut self, name: impl Into<String>, on: bool) -> Self {
        self.actuators.insert(name.into(), on);
        self
    }

    /// Sensor names in key order.
    pub fn sensor_keys(&self) -> impl Iterator<Item = &str> {
        self.sensors.keys().map(String::as_str)
    }

    /// Actuator names in key order.
    pub fn actuator_keys(&self) -> impl Iterator<Item = &str> {
        self.actuators.keys().map(String::as_str)
    }

    /// Whether the machine is online.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.status == MachineStatus::Online
    }
}

/// A partial update targeting one machine.
///
/// Absent fields leave the machine untouched. Present fields replace the
/// machine's field wholesale; maps are not merged key by key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachinePatch {
    /// Target machine.
    pub machine_id: MachineId,
    /// New status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MachineStatus>,
    /// Full replacement sensor map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensors: Option<Sensors>,
    /// Full replacement actuator map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actuators: Option<Actuators>,
}

impl MachinePatch {
    /// Create an empty patch for a machine.
    #[must_use]
    pub fn new(machine_id: impl Into<MachineId>) -> Self {
        Self {
            machine_id: machine_id.into(),
            status: None,
            sensors: None,
            actuators: None,
        }
    }

    /// Set the status field.
    #[must_use]
    pub fn with_status(mut self, status: MachineStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Set the sensors field.
    #[must_use]
    pub fn with_sensors(mut self, sensors: Sensors) -> Self {
        self.sensors = Some(sensors);
        self
    }

    /// Set the actuators field.
    #[must_use]
    pub fn with_actuators(mut self, actuators: Actuators) -> Self {
        self.actuators = Some(actuators);
        self
    }

    /// Orderly shutdown patch: offline, every sensor zeroed, actuators untouched.
    #[must_use]
    pub fn terminal(machine: &Machine) -> Self {
        let sensors = machine.sensor_keys().map(|k| (k.to_string(), 0.0)).collect();
        Self::new(machine.id.clone())
            .with_status(MachineStatus::Offline)
            .with_sensors(sensors)
    }

    /// Whether the patch carries no field besides the target.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.sensors.is_none() && self.actuators.is_none()
    }

    /// First sensor whose value is NaN or infinite.
    ///
    /// JSON has no representation for such values, so a patch carrying one
    /// must not reach the registry.
    #[must_use]
    pub fn non_finite_sensor(&self) -> Option<(&str, f64)> {
        self.sensors
            .iter()
            .flatten()
            .find(|(_, value)| !value.is_finite())
            .map(|(name, value)| (name.as_str(), *value))
    }
}
