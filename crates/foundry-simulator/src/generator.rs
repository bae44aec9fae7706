//! Per-tick telemetry generation.
//!
//! Everything here is pure: callers pass the current control state and a
//! random number generator, and get patches back.

use crate::controls::ControlState;
use foundry_protocol::{Machine, MachinePatch, MachineStatus, Sensors};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Default half-width of the random noise band.
pub const DEFAULT_NOISE_AMPLITUDE: f64 = 2.5;

/// Baseline used when a machine has no usable value for a sensor.
pub const DEFAULT_BASELINE: f64 = 50.0;

/// Generation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Baselines plus uniform noise.
    #[default]
    Random,
    /// Baselines exactly as set by the operator.
    Manual,
}

impl Mode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Random => "random",
            Mode::Manual => "manual",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error parsing a [`Mode`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown mode '{0}', expected 'random' or 'manual'")]
pub struct ParseModeError(pub String);

impl FromStr for Mode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "random" => Ok(Mode::Random),
            "manual" => Ok(Mode::Manual),
            _ => Err(ParseModeError(s.to_string())),
        }
    }
}

/// Tunables of the generation algorithm.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeneratorParams {
    /// Noise is drawn uniformly from `[-noise_amplitude, +noise_amplitude]`.
    pub noise_amplitude: f64,
    /// Fallback baseline for sensors without a usable value.
    pub default_baseline: f64,
}

impl Default for GeneratorParams {
    fn default() -> Self {
        Self {
            noise_amplitude: DEFAULT_NOISE_AMPLITUDE,
            default_baseline: DEFAULT_BASELINE,
        }
    }
}

/// Generate one patch for `machine`.
///
/// `overrides` holds operator baselines and is only passed for the selected
/// machine. For every sensor key of the machine the baseline is the
/// override if present, else the machine's own last value, else
/// [`GeneratorParams::default_baseline`]. Values are clamped at zero from
/// below; there is no upper clamp.
pub fn generate_patch<R: Rng + ?Sized>(
    machine: &Machine,
    overrides: Option<&Sensors>,
    mode: Mode,
    params: &GeneratorParams,
    rng: &mut R,
) -> MachinePatch {
    let sensors = machine
        .sensors
        .iter()
        .map(|(key, last)| {
            let base = overrides
                .and_then(|values| values.get(key))
                .or(Some(last))
                .copied()
                .filter(|v| v.is_finite())
                .unwrap_or(params.default_baseline);
            let value = (base + noise(mode, params, rng)).max(0.0);
            (key.clone(), value)
        })
        .collect();

    MachinePatch::new(machine.id.clone())
        .with_status(MachineStatus::Online)
        .with_sensors(sensors)
        .with_actuators(machine.actuators.clone())
}

fn noise<R: Rng + ?Sized>(mode: Mode, params: &GeneratorParams, rng: &mut R) -> f64 {
    let amplitude = params.noise_amplitude;
    // NaN and infinite amplitudes would make the range panic.
    if mode == Mode::Manual || !(amplitude.is_finite() && amplitude > 0.0) {
        return 0.0;
    }
    rng.gen_range(-amplitude..=amplitude)
}

/// Patches for one tick: one per known machine when targeting all,
/// otherwise one for the selected machine (none if nothing is selected).
pub fn tick_patches<R: Rng + ?Sized>(
    controls: &ControlState,
    params: &GeneratorParams,
    rng: &mut R,
) -> Vec<MachinePatch> {
    controls
        .targets()
        .into_iter()
        .map(|machine| {
            let overrides = controls.is_selected(&machine.id).then(|| controls.values());
            generate_patch(machine, overrides, controls.mode(), params, rng)
        })
        .collect()
}

/// Orderly shutdown patches for a target set.
pub fn terminal_patches<'a>(targets: impl IntoIterator<Item = &'a Machine>) -> Vec<MachinePatch> {
    targets.into_iter().map(MachinePatch::terminal).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn conveyor() -> Machine {
        Machine::new("M1", "Conveyor 01", "Smart Conveyor")
            .with_sensor("temperature", 50.0)
            .with_sensor("vibration", 10.0)
            .with_sensor("speed", 100.0)
            .with_actuator("motor", true)
    }

    fn press() -> Machine {
        Machine::new("M2", "Press", "Press")
            .with_sensor("pressure", 1.0)
            .with_sensor("cycles", 0.0)
            .with_actuator("pump", false)
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("random".parse::<Mode>().unwrap(), Mode::Random);
        assert_eq!("MANUAL".parse::<Mode>().unwrap(), Mode::Manual);
        assert!("chaos".parse::<Mode>().is_err());
    }

    #[test]
    fn test_random_noise_is_bounded() {
        let mut rng = StdRng::seed_from_u64(7);
        let params = GeneratorParams::default();
        let machine = conveyor();

        for _ in 0..500 {
            let patch = generate_patch(&machine, None, Mode::Random, &params, &mut rng);
            let sensors = patch.sensors.unwrap();
            for (key, base) in &machine.sensors {
                let value = sensors[key];
                assert!(value >= (base - 2.5).max(0.0), "{key}={value}");
                assert!(value <= base + 2.5, "{key}={value}");
            }
        }
    }

    #[test]
    fn test_unusable_amplitude_adds_no_noise() {
        let mut rng = StdRng::seed_from_u64(3);
        let machine = conveyor();

        for amplitude in [f64::NAN, f64::INFINITY, -1.0] {
            let params = GeneratorParams {
                noise_amplitude: amplitude,
                ..GeneratorParams::default()
            };
            let patch = generate_patch(&machine, None, Mode::Random, &params, &mut rng);
            assert_eq!(patch.sensors.unwrap(), machine.sensors);
        }
    }

    #[test]
    fn test_values_are_never_negative() {
        let mut rng = StdRng::seed_from_u64(11);
        let params = GeneratorParams::default();
        let machine = press();

        for mode in [Mode::Random, Mode::Manual] {
            for _ in 0..500 {
                let patch = generate_patch(&machine, None, mode, &params, &mut rng);
                assert!(patch.sensors.unwrap().values().all(|v| *v >= 0.0));
            }
        }

        let negative: Sensors = [("pressure".to_string(), -40.0)].into_iter().collect();
        let patch = generate_patch(&machine, Some(&negative), Mode::Manual, &params, &mut rng);
        assert_eq!(patch.sensors.unwrap()["pressure"], 0.0);
    }

    #[test]
    fn test_manual_uses_control_values_exactly() {
        let mut rng = StdRng::seed_from_u64(3);
        let machine = conveyor();
        let values: Sensors = [("temperature".to_string(), 80.0)].into_iter().collect();

        let patch = generate_patch(
            &machine,
            Some(&values),
            Mode::Manual,
            &GeneratorParams::default(),
            &mut rng,
        );

        assert_eq!(patch.machine_id, "M1");
        assert_eq!(patch.status, Some(MachineStatus::Online));
        assert_eq!(patch.actuators, Some(machine.actuators.clone()));
        let sensors = patch.sensors.unwrap();
        assert_eq!(sensors["temperature"], 80.0);
        assert_eq!(sensors["vibration"], 10.0);
        assert_eq!(sensors["speed"], 100.0);
    }

    #[test]
    fn test_non_finite_values_fall_back_to_default_baseline() {
        let mut rng = StdRng::seed_from_u64(5);
        let machine = Machine::new("M3", "Tank", "Tank").with_sensor("level", f64::NAN);

        let patch = generate_patch(&machine, None, Mode::Manual, &GeneratorParams::default(), &mut rng);
        assert_eq!(patch.sensors.unwrap()["level"], DEFAULT_BASELINE);
    }

    #[test]
    fn test_only_machine_keys_are_emitted() {
        let mut rng = StdRng::seed_from_u64(9);
        let machine = conveyor();
        let values: Sensors = [("humidity".to_string(), 12.0)].into_iter().collect();

        let patch = generate_patch(&machine, Some(&values), Mode::Manual, &GeneratorParams::default(), &mut rng);
        let sensors = patch.sensors.unwrap();
        assert_eq!(sensors.len(), 3);
        assert!(!sensors.contains_key("humidity"));
    }

    #[test]
    fn test_tick_targets() {
        let mut rng = StdRng::seed_from_u64(1);
        let params = GeneratorParams::default();
        let mut controls = ControlState::new(Mode::Manual);

        assert!(tick_patches(&controls, &params, &mut rng).is_empty());

        controls.replace_machines(vec![conveyor(), press()]);
        controls.set_value("temperature", 90.0);

        let single = tick_patches(&controls, &params, &mut rng);
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].sensors.as_ref().unwrap()["temperature"], 90.0);

        controls.set_target_all(true);
        let all = tick_patches(&controls, &params, &mut rng);
        let ids: Vec<_> = all.iter().map(|p| p.machine_id.as_str()).collect();
        assert_eq!(ids, vec!["M1", "M2"]);
        // Non-selected machines keep their own baselines.
        assert_eq!(all[1].sensors.as_ref().unwrap()["pressure"], 1.0);
    }

    #[test]
    fn test_terminal_patches() {
        let machines = [conveyor(), press()];
        let patches = terminal_patches(&machines);

        assert_eq!(patches.len(), 2);
        for (patch, machine) in patches.iter().zip(&machines) {
            assert_eq!(patch.status, Some(MachineStatus::Offline));
            assert!(patch.actuators.is_none());
            let sensors = patch.sensors.as_ref().unwrap();
            assert_eq!(sensors.len(), machine.sensors.len());
            assert!(sensors.values().all(|v| *v == 0.0));
        }
    }
}
