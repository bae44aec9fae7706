//! Canonical machine registry.
//!
//! The registry holds the authoritative collection of machine records and
//! applies update patches to it. It is a plain owned value: exclusive
//! access through `&mut self` is what makes each patch atomic, and the
//! [`Hub`](crate::hub::Hub) task is its only owner at runtime.

use crate::catalog;
use foundry_protocol::{Machine, MachinePatch};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, trace};

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Two machines share an identifier.
    #[error("Duplicate machine id: {0}")]
    DuplicateMachine(String),
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The machine registry.
#[derive(Debug, Clone)]
pub struct MachineRegistry {
    /// Records in catalog order.
    machines: Vec<Machine>,
    /// Position of each machine in `machines`.
    index: HashMap<String, usize>,
}

impl MachineRegistry {
    /// Create a registry from a list of machines.
    ///
    /// # Errors
    ///
    /// Returns an error if two machines share an identifier.
    pub fn new(machines: Vec<Machine>) -> Result<Self, RegistryError> {
        let mut index = HashMap::with_capacity(machines.len());
        for (pos, machine) in machines.iter().enumerate() {
            if index.insert(machine.id.clone(), pos).is_some() {
                return Err(RegistryError::DuplicateMachine(machine.id.clone()));
            }
        }

        debug!(machines = machines.len(), "Registry created");
        Ok(Self { machines, index })
    }

    /// Create a registry seeded with the built-in catalog.
    #[must_use]
    pub fn seeded() -> Self {
        let machines = catalog::seed_machines();
        let index = machines
            .iter()
            .enumerate()
            .map(|(pos, m)| (m.id.clone(), pos))
            .collect();
        Self { machines, index }
    }

    /// Full ordered collection of machine records.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Machine> {
        self.machines.clone()
    }

    /// Borrow the records without copying.
    #[must_use]
    pub fn machines(&self) -> &[Machine] {
        &self.machines
    }

    /// Look up a machine by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Machine> {
        self.index.get(id).map(|&pos| &self.machines[pos])
    }

    /// Number of machines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.machines.len()
    }

    /// Whether the registry holds no machines.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    /// Apply a patch, stamping the record with the current time.
    ///
    /// Returns the updated record, or `None` if the patch targets an
    /// unknown machine, in which case nothing changes.
    pub fn apply_patch(&mut self, patch: MachinePatch) -> Option<&Machine> {
        self.apply_patch_at(patch, now_millis())
    }

    /// Apply a patch with an explicit `lastUpdate` timestamp.
    ///
    /// Present fields replace the machine's fields wholesale. A `sensors`
    /// map missing some of the machine's keys drops those keys; callers are
    /// responsible for sending complete maps.
    pub fn apply_patch_at(&mut self, patch: MachinePatch, timestamp: u64) -> Option<&Machine> {
        let Some(&pos) = self.index.get(&patch.machine_id) else {
            debug!(machine = %patch.machine_id, "Ignoring patch for unknown machine");
            return None;
        };

        let mut next = self.machines[pos].clone();
        if let Some(status) = patch.status {
            next.status = status;
        }
        if let Some(sensors) = patch.sensors {
            next.sensors = sensors;
        }
        if let Some(actuators) = patch.actuators {
            next.actuators = actuators;
        }
        next.last_update = Some(timestamp);

        self.machines[pos] = next;
        trace!(machine = %patch.machine_id, timestamp, "Patch applied");

        Some(&self.machines[pos])
    }
}

impl Default for MachineRegistry {
    fn default() -> Self {
        Self::seeded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foundry_protocol::{Actuators, MachineStatus, Sensors};

    fn m1() -> Machine {
        Machine::new("M1", "Conveyor 01", "Smart Conveyor")
            .with_sensor("temperature", 50.0)
            .with_sensor("vibration", 10.0)
            .with_sensor("speed", 100.0)
            .with_actuator("motor", false)
            .with_actuator("emergencyStop", false)
    }

    fn registry() -> MachineRegistry {
        MachineRegistry::new(vec![m1(), Machine::new("M2", "Tank", "Tank").with_sensor("level", 0.0)])
            .unwrap()
    }

    fn sensors(pairs: &[(&str, f64)]) -> Sensors {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        assert!(matches!(
            MachineRegistry::new(vec![m1(), m1()]),
            Err(RegistryError::DuplicateMachine(id)) if id == "M1"
        ));
    }

    #[test]
    fn test_seeded_registry() {
        let registry = MachineRegistry::seeded();
        assert_eq!(registry.len(), catalog::SEED_MACHINE_COUNT);
        assert!(registry.get("machine-1").is_some());
    }

    #[test]
    fn test_snapshot_preserves_order() {
        let ids: Vec<_> = registry().snapshot().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["M1", "M2"]);
    }

    #[test]
    fn test_absent_fields_untouched() {
        let mut registry = registry();
        let updated = registry
            .apply_patch_at(MachinePatch::new("M1").with_status(MachineStatus::Online), 7)
            .unwrap()
            .clone();

        assert_eq!(updated.status, MachineStatus::Online);
        assert_eq!(updated.sensors, m1().sensors);
        assert_eq!(updated.actuators, m1().actuators);
        assert_eq!(updated.last_update, Some(7));
        assert_eq!(updated.name, "Conveyor 01");
    }

    #[test]
    fn test_present_fields_replace_wholesale() {
        let mut registry = registry();
        let actuators: Actuators = [("motor".to_string(), true)].into_iter().collect();
        let patch = MachinePatch::new("M1")
            .with_sensors(sensors(&[("temperature", 80.0), ("vibration", 11.0), ("speed", 99.0)]))
            .with_actuators(actuators.clone());

        let updated = registry.apply_patch_at(patch, 1).unwrap();
        assert_eq!(updated.sensors["temperature"], 80.0);
        assert_eq!(updated.actuators, actuators);
    }

    #[test]
    fn test_partial_sensor_map_drops_missing_keys() {
        let mut registry = registry();
        let patch = MachinePatch::new("M1").with_sensors(sensors(&[("temperature", 60.0)]));

        let updated = registry.apply_patch_at(patch, 1).unwrap();
        assert_eq!(updated.sensors.len(), 1);
        assert!(!updated.sensors.contains_key("speed"));
    }

    #[test]
    fn test_unknown_machine_is_noop() {
        let mut registry = registry();
        let before = registry.snapshot();

        let patch = MachinePatch::new("ghost").with_status(MachineStatus::Online);
        assert!(registry.apply_patch(patch).is_none());
        assert_eq!(registry.snapshot(), before);
    }

    #[test]
    fn test_last_writer_wins_per_field() {
        let mut registry = registry();
        let patches = vec![
            MachinePatch::new("M1").with_status(MachineStatus::Online),
            MachinePatch::new("M1").with_sensors(sensors(&[
                ("temperature", 1.0),
                ("vibration", 2.0),
                ("speed", 3.0),
            ])),
            MachinePatch::new("M1").with_status(MachineStatus::Offline),
            MachinePatch::new("M1").with_sensors(sensors(&[
                ("temperature", 4.0),
                ("vibration", 5.0),
                ("speed", 6.0),
            ])),
        ];
        for (ts, patch) in patches.into_iter().enumerate() {
            registry.apply_patch_at(patch, ts as u64);
        }

        let m = registry.get("M1").unwrap();
        assert_eq!(m.status, MachineStatus::Offline);
        assert_eq!(m.sensors, sensors(&[("temperature", 4.0), ("vibration", 5.0), ("speed", 6.0)]));
        // Never patched: equals the pre-sequence value.
        assert_eq!(m.actuators, m1().actuators);
        assert_eq!(m.last_update, Some(3));
    }

    #[test]
    fn test_key_sets_stable_under_full_patches() {
        let mut registry = MachineRegistry::seeded();
        let seeded = registry.snapshot();

        for round in 0..5 {
            for machine in &seeded {
                let sensors = machine
                    .sensor_keys()
                    .map(|k| (k.to_string(), f64::from(round) * 3.5))
                    .collect();
                let actuators = machine
                    .actuator_keys()
                    .map(|k| (k.to_string(), round % 2 == 0))
                    .collect();
                let patch = MachinePatch::new(machine.id.clone())
                    .with_status(MachineStatus::Online)
                    .with_sensors(sensors)
                    .with_actuators(actuators);
                registry.apply_patch(patch);
            }
            registry.apply_patch(MachinePatch::terminal(&seeded[round as usize]));
        }

        for (before, after) in seeded.iter().zip(registry.machines()) {
            assert!(before.sensor_keys().eq(after.sensor_keys()));
            assert!(before.actuator_keys().eq(after.actuator_keys()));
        }
    }
}
