use anyhow::{Context, Result};
use clap::ValueEnum;
use giobridge_core::{MapperConfig, PseudoConfig, PseudoMode};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Loopback,
    Pattern,
    Sink,
}

impl From<Mode> for PseudoMode {
    fn from(value: Mode) -> Self {
        match value {
            Mode::Loopback => PseudoMode::Loopback,
            Mode::Pattern => PseudoMode::Pattern,
            Mode::Sink => PseudoMode::Sink,
        }
    }
}

/// Pseudo devices to bind.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    pub driver_name: String,
    pub mode: Mode,
    /// Bytes; 0 binds a sequential device.
    pub device_size: u64,
    pub max_safe_alloc: usize,
    pub instances: u32,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            driver_name: "pseudo".to_owned(),
            mode: Mode::Loopback,
            device_size: 1 << 20,
            max_safe_alloc: 0,
            instances: 1,
        }
    }
}

impl DeviceSettings {
    pub fn pseudo_config(&self) -> PseudoConfig {
        PseudoConfig {
            driver_name: self.driver_name.clone(),
            mode: self.mode.into(),
            device_size: Some(self.device_size).filter(|size| *size > 0),
            max_safe_alloc: self.max_safe_alloc,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadSettings {
    pub workers: usize,
    pub transfer_size: usize,
    pub iterations: u32,
}

impl Default for WorkloadSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            transfer_size: 16 * 1024,
            iterations: 64,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub mapper: MapperConfig,
    pub device: DeviceSettings,
    pub workload: WorkloadSettings,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path).context(format!("read config {}", path.display()))?;
        serde_json::from_slice(&data).context(format!("decode config {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("giobridge.json");
        fs::write(
            &path,
            r#"{
                "mapper": { "max_contexts": 2 },
                "device": { "mode": "pattern", "device_size": 0 },
                "workload": { "iterations": 3 }
            }"#,
        )
        .unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.mapper.max_contexts, 2);
        assert_eq!(
            settings.mapper.staging_buffer_size,
            MapperConfig::default().staging_buffer_size
        );
        assert_eq!(settings.device.mode, Mode::Pattern);
        assert_eq!(settings.device.pseudo_config().device_size, None);
        assert_eq!(settings.device.driver_name, "pseudo");
        assert_eq!(settings.workload.iterations, 3);
        assert_eq!(settings.workload.workers, 4);
    }

    #[test]
    fn missing_file_reports_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.json");
        let err = Settings::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("absent.json"));
    }
}
