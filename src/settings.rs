use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::PathBuf,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use crate::telemetry::DEFAULT_HISTORY_CAPACITY;

pub const SETTINGS_ENV: &str = "DYNO_SETTINGS";
pub const DEFAULT_SETTINGS_FILE: &str = "dyno_settings.json";
/// Serial port name that selects the in-process simulator.
pub const SIMULATOR_PORT: &str = "sim";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    pub port: String,
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
    /// Scenario name used when `port` is `"sim"`.
    pub sim_scenario: String,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: SIMULATOR_PORT.into(),
            baud_rate: 115_200,
            read_timeout_ms: 50,
            sim_scenario: "idle".into(),
        }
    }
}

impl SerialSettings {
    pub fn is_simulated(&self) -> bool {
        self.port.eq_ignore_ascii_case(SIMULATOR_PORT)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    pub history_capacity: usize,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub database_path: PathBuf,
    pub retention_days: u32,
    /// Delete the stored rows of a session when the controller restarts it.
    pub clear_session_on_restart: bool,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("dyno_data.db"),
            retention_days: 7,
            clear_session_on_restart: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DynoSettings {
    pub serial: SerialSettings,
    pub telemetry: TelemetrySettings,
    pub storage: StorageSettings,
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<DynoSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|err| {
                warn!(
                    "Ignoring unreadable settings in {}: {err}",
                    path.display()
                );
                DynoSettings::default()
            })
        } else {
            DynoSettings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    /// Opens the file named by `DYNO_SETTINGS`, or `dyno_settings.json`.
    pub fn from_env() -> Result<Self> {
        let path = env::var_os(SETTINGS_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_FILE));
        Self::new(path)
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn get(&self) -> DynoSettings {
        self.read().clone()
    }

    pub fn serial(&self) -> SerialSettings {
        self.read().serial.clone()
    }

    pub fn telemetry(&self) -> TelemetrySettings {
        self.read().telemetry.clone()
    }

    pub fn storage(&self) -> StorageSettings {
        self.read().storage.clone()
    }

    pub fn update_serial(&self, settings: SerialSettings) -> Result<()> {
        let mut guard = self.write();
        guard.serial = settings;
        self.persist(&guard)
    }

    pub fn update_storage(&self, settings: StorageSettings) -> Result<()> {
        let mut guard = self.write();
        guard.storage = settings;
        self.persist(&guard)
    }

    pub fn update(&self, settings: DynoSettings) -> Result<()> {
        let mut guard = self.write();
        *guard = settings;
        self.persist(&guard)
    }

    pub fn reload(&self) -> Result<()> {
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read settings from {}", self.path.display()))?;
        let data: DynoSettings = serde_json::from_str(&contents)
            .with_context(|| format!("Invalid settings in {}", self.path.display()))?;
        *self.write() = data;
        Ok(())
    }

    fn persist(&self, data: &DynoSettings) -> Result<()> {
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }

    fn read(&self) -> RwLockReadGuard<'_, DynoSettings> {
        match self.data.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, DynoSettings> {
        match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
