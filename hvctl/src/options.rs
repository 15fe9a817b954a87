//! Handler configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::constants::{disk, envs, paths};

/// What `with_machine_session` does with changes applied before a hypervisor fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultPolicy {
    /// Save whatever was applied before the fault.
    #[default]
    PersistApplied,
    /// Roll the session machine back to its last saved settings.
    Discard,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerOptions {
    /// Root of machine settings, disk images and logs. Must be absolute.
    pub settings_dir: PathBuf,
    /// Capacity of disks created by `attach_disk`.
    pub disk_size_bytes: u64,
    pub fault_policy: FaultPolicy,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            settings_dir: default_settings_dir(),
            disk_size_bytes: disk::DEFAULT_SIZE_BYTES,
            fault_policy: FaultPolicy::default(),
        }
    }
}

impl HandlerOptions {
    pub fn with_settings_dir(settings_dir: impl Into<PathBuf>) -> Self {
        Self {
            settings_dir: settings_dir.into(),
            ..Self::default()
        }
    }
}

/// `$HVCTL_HOME`, else `~/.hvctl`, else `./.hvctl` resolved against the working directory.
pub fn default_settings_dir() -> PathBuf {
    if let Some(home) = std::env::var_os(envs::HVCTL_HOME).filter(|v| !v.is_empty()) {
        return PathBuf::from(home);
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(paths::HOME_DIR_NAME);
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(paths::HOME_DIR_NAME))
        .unwrap_or_else(|_| PathBuf::from(paths::HOME_DIR_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = HandlerOptions::with_settings_dir("/srv/hvctl");
        assert_eq!(options.settings_dir, PathBuf::from("/srv/hvctl"));
        assert_eq!(options.disk_size_bytes, 10 * 1024 * 1024 * 1024);
        assert_eq!(options.fault_policy, FaultPolicy::PersistApplied);
    }

    #[test]
    fn test_deserialize_partial() {
        let options: HandlerOptions = serde_json::from_str(
            r#"{"settings_dir": "/srv/hvctl", "fault_policy": "discard"}"#,
        )
        .unwrap();
        assert_eq!(options.fault_policy, FaultPolicy::Discard);
        assert_eq!(options.disk_size_bytes, disk::DEFAULT_SIZE_BYTES);
    }
}
