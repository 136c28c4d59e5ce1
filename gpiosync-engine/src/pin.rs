//! Output pin drivers.
//!
//! [`PinController`] is the seam between the engine and the hardware. Two
//! implementations ship: [`SysfsPins`] for Linux boards exposing
//! `/sys/class/gpio`, and [`SimulatedPins`] for benches and tests.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use gpiosync_core::types::{Level, PinId};

use crate::error::HardwareError;

/// Drives digital outputs.
pub trait PinController: Send + Sync {
    /// Whether `pin` may be driven as an output on this platform.
    fn is_valid_output(&self, pin: PinId) -> bool;

    /// Configure `pin` as an output (idempotent) and drive it to `level`.
    fn write(&self, pin: PinId, level: Level) -> Result<(), HardwareError>;

    /// Read back the level the pin is currently driven to.
    fn read(&self, pin: PinId) -> Result<Level, HardwareError>;
}

// ---------------------------------------------------------------------------
// sysfs
// ---------------------------------------------------------------------------

/// Linux sysfs GPIO (`<root>/export`, `<root>/gpio<N>/{direction,value}`).
#[derive(Debug, Clone)]
pub struct SysfsPins {
    root: PathBuf,
    valid: BTreeSet<PinId>,
}

impl SysfsPins {
    pub fn new(root: impl Into<PathBuf>, valid: BTreeSet<PinId>) -> Self {
        Self {
            root: root.into(),
            valid,
        }
    }

    fn pin_dir(&self, pin: PinId) -> PathBuf {
        self.root.join(format!("gpio{pin}"))
    }

    fn ensure_exported(&self, pin: PinId) -> Result<PathBuf, HardwareError> {
        let dir = self.pin_dir(pin);
        if !dir.exists() {
            let export = self.root.join("export");
            write_attr(pin, &export, &pin.to_string())?;
            tracing::debug!(pin = %pin, "exported gpio");
        }
        Ok(dir)
    }
}

impl PinController for SysfsPins {
    fn is_valid_output(&self, pin: PinId) -> bool {
        self.valid.contains(&pin)
    }

    fn write(&self, pin: PinId, level: Level) -> Result<(), HardwareError> {
        if !self.is_valid_output(pin) {
            return Err(HardwareError::InvalidPin { pin });
        }
        let dir = self.ensure_exported(pin)?;

        // Writing "high"/"low" to direction switches to output glitch-free;
        // only needed the first time, "out" means already configured.
        let direction = dir.join("direction");
        let current = match fs::read_to_string(&direction) {
            Ok(value) => value.trim().to_string(),
            Err(err) if err.kind() == ErrorKind::NotFound => String::new(),
            Err(source) => {
                return Err(HardwareError::Io {
                    pin,
                    path: direction,
                    source,
                })
            }
        };
        if current != "out" {
            let initial = if level.is_on() { "high" } else { "low" };
            write_attr(pin, &direction, initial)?;
        }

        write_attr(pin, &dir.join("value"), &level.as_bit().to_string())
    }

    fn read(&self, pin: PinId) -> Result<Level, HardwareError> {
        if !self.is_valid_output(pin) {
            return Err(HardwareError::InvalidPin { pin });
        }
        let path = self.pin_dir(pin).join("value");
        let raw = fs::read_to_string(&path).map_err(|source| HardwareError::Io {
            pin,
            path: path.clone(),
            source,
        })?;
        match raw.trim() {
            "0" => Ok(Level::Off),
            "1" => Ok(Level::On),
            other => Err(HardwareError::UnexpectedValue {
                pin,
                value: other.to_string(),
            }),
        }
    }
}

fn write_attr(pin: PinId, path: &Path, value: &str) -> Result<(), HardwareError> {
    fs::write(path, value).map_err(|source| HardwareError::Io {
        pin,
        path: path.to_path_buf(),
        source,
    })
}

// ---------------------------------------------------------------------------
// Simulated
// ---------------------------------------------------------------------------

/// In-memory pins. Unwritten pins read as `Off`.
#[derive(Debug, Default)]
pub struct SimulatedPins {
    valid: BTreeSet<PinId>,
    levels: Mutex<BTreeMap<PinId, Level>>,
    writes: Mutex<Vec<(PinId, Level)>>,
}

impl SimulatedPins {
    pub fn new(valid: BTreeSet<PinId>) -> Self {
        Self {
            valid,
            ..Self::default()
        }
    }

    /// Every successful write, oldest first.
    pub fn writes(&self) -> Vec<(PinId, Level)> {
        self.writes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Force a level without recording a write, e.g. to model a pin changed
    /// behind the agent's back.
    pub fn force(&self, pin: PinId, level: Level) {
        self.levels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pin, level);
    }
}

impl PinController for SimulatedPins {
    fn is_valid_output(&self, pin: PinId) -> bool {
        self.valid.contains(&pin)
    }

    fn write(&self, pin: PinId, level: Level) -> Result<(), HardwareError> {
        if !self.is_valid_output(pin) {
            return Err(HardwareError::InvalidPin { pin });
        }
        self.levels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pin, level);
        self.writes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((pin, level));
        Ok(())
    }

    fn read(&self, pin: PinId) -> Result<Level, HardwareError> {
        if !self.is_valid_output(pin) {
            return Err(HardwareError::InvalidPin { pin });
        }
        Ok(self
            .levels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&pin)
            .copied()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn valid() -> BTreeSet<PinId> {
        [PinId(2), PinId(4)].into_iter().collect()
    }

    fn fake_sysfs(exported: &[(u32, &str, &str)]) -> TempDir {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("export"), "").unwrap();
        for (pin, direction, value) in exported {
            let dir = tmp.path().join(format!("gpio{pin}"));
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("direction"), direction).unwrap();
            fs::write(dir.join("value"), value).unwrap();
        }
        tmp
    }

    #[test]
    fn sysfs_write_configures_direction_then_value() {
        let tmp = fake_sysfs(&[(2, "in\n", "0\n")]);
        let pins = SysfsPins::new(tmp.path(), valid());

        pins.write(PinId(2), Level::On).unwrap();

        let dir = tmp.path().join("gpio2");
        assert_eq!(fs::read_to_string(dir.join("direction")).unwrap(), "high");
        assert_eq!(fs::read_to_string(dir.join("value")).unwrap(), "1");
        assert_eq!(pins.read(PinId(2)).unwrap(), Level::On);
    }

    #[test]
    fn sysfs_write_leaves_configured_output_direction_alone() {
        let tmp = fake_sysfs(&[(2, "out\n", "1\n")]);
        let pins = SysfsPins::new(tmp.path(), valid());

        pins.write(PinId(2), Level::Off).unwrap();

        let dir = tmp.path().join("gpio2");
        assert_eq!(fs::read_to_string(dir.join("direction")).unwrap(), "out\n");
        assert_eq!(fs::read_to_string(dir.join("value")).unwrap(), "0");
    }

    #[test]
    fn sysfs_exports_unexported_pin() {
        let tmp = fake_sysfs(&[]);
        let pins = SysfsPins::new(tmp.path(), valid());

        // The fake tree has no kernel behind it, so the pin directory never
        // appears and the write fails after exporting.
        let err = pins.write(PinId(4), Level::On).unwrap_err();
        assert!(matches!(err, HardwareError::Io { .. }), "got: {err}");
        assert_eq!(fs::read_to_string(tmp.path().join("export")).unwrap(), "4");
    }

    #[test]
    fn sysfs_rejects_invalid_pin_without_touching_files() {
        let tmp = fake_sysfs(&[]);
        let pins = SysfsPins::new(tmp.path(), valid());
        let err = pins.write(PinId(6), Level::On).unwrap_err();
        assert!(matches!(err, HardwareError::InvalidPin { pin } if pin == PinId(6)));
        assert_eq!(fs::read_to_string(tmp.path().join("export")).unwrap(), "");
    }

    #[test]
    fn sysfs_read_rejects_garbage() {
        let tmp = fake_sysfs(&[(2, "out", "x")]);
        let pins = SysfsPins::new(tmp.path(), valid());
        let err = pins.read(PinId(2)).unwrap_err();
        assert!(matches!(err, HardwareError::UnexpectedValue { .. }));
    }

    #[test]
    fn simulated_pins_record_writes() {
        let pins = SimulatedPins::new(valid());
        assert_eq!(pins.read(PinId(2)).unwrap(), Level::Off);
        pins.write(PinId(2), Level::On).unwrap();
        pins.write(PinId(2), Level::On).unwrap();
        assert_eq!(pins.read(PinId(2)).unwrap(), Level::On);
        assert_eq!(pins.writes(), vec![(PinId(2), Level::On), (PinId(2), Level::On)]);
        assert!(pins.write(PinId(34), Level::On).is_err());
    }
}
