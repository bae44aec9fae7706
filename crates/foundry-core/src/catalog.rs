//! Seed catalog of machines.
//!
//! The registry is seeded with this fixed list at process start. Every
//! machine starts offline with zeroed sensors and all actuators off.

use foundry_protocol::Machine;

/// Number of machines in the seed catalog.
pub const SEED_MACHINE_COUNT: usize = 8;

fn machine(id: &str, name: &str, kind: &str, sensors: &[&str], actuators: &[&str]) -> Machine {
    let machine = sensors
        .iter()
        .fold(Machine::new(id, name, kind), |m, s| m.with_sensor(*s, 0.0));
    actuators
        .iter()
        .fold(machine, |m, a| m.with_actuator(*a, false))
}

/// Build the seed catalog.
#[must_use]
pub fn seed_machines() -> Vec<Machine> {
    vec![
        machine(
            "machine-1",
            "Conveyor 01",
            "Smart Conveyor",
            &["temperature", "vibration", "speed"],
            &["motor", "emergencyStop"],
        ),
        machine(
            "machine-2",
            "Hydraulic Press A",
            "Press",
            &["pressure", "temperature", "cycles"],
            &["pump", "valve"],
        ),
        machine(
            "machine-3",
            "Robotic Arm X1",
            "Robot",
            &["axisX", "axisY", "axisZ", "load"],
            &["gripper", "power"],
        ),
        machine(
            "machine-4",
            "Quality Sensor",
            "Sensor",
            &["accuracy", "scans"],
            &["laser"],
        ),
        machine(
            "machine-5",
            "Industrial Compressor",
            "Compressor",
            &["pressure", "temperature", "airflow"],
            &["motor"],
        ),
        machine(
            "machine-6",
            "Mixing Tank",
            "Tank",
            &["level", "temperature", "ph"],
            &["mixer", "valve"],
        ),
        machine(
            "machine-7",
            "Diesel Generator",
            "Generator",
            &["voltage", "frequency", "fuel"],
            &["starter"],
        ),
        machine(
            "machine-8",
            "Autonomous Forklift",
            "Vehicle",
            &["battery", "speed", "load"],
            &["motor", "lift"],
        ),
    ]
}
