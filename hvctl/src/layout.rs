//! Filesystem layout under the settings directory.
//!
//! ```text
//! <settings>/
//! ├── machines/<name>/<name>.vbox
//! ├── disks/<disk>.vdi
//! └── logs/
//! ```

use std::path::{Path, PathBuf};

use hvctl_shared::{HvctlError, HvctlResult};

use crate::constants::{SETTINGS_EXTENSION, disk, paths};

#[derive(Debug, Clone)]
pub struct SettingsLayout {
    root: PathBuf,
}

impl SettingsLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn machines_dir(&self) -> PathBuf {
        self.root.join(paths::MACHINES)
    }

    /// Settings file of machine `name`.
    pub fn machine_settings_file(&self, name: &str) -> PathBuf {
        self.machines_dir()
            .join(name)
            .join(format!("{}.{}", name, SETTINGS_EXTENSION))
    }

    pub fn disks_dir(&self) -> PathBuf {
        self.root.join(paths::DISKS)
    }

    /// Image file backing disk `name`.
    pub fn disk_image(&self, name: &str) -> PathBuf {
        self.disks_dir()
            .join(format!("{}.{}", name, disk::EXTENSION))
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join(paths::LOGS)
    }

    /// Create the directory skeleton.
    pub fn prepare(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.machines_dir())?;
        std::fs::create_dir_all(self.disks_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        Ok(())
    }
}

/// Reject names that cannot be used as a single path component.
pub fn validate_name(kind: &str, name: &str) -> HvctlResult<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if invalid {
        return Err(HvctlError::InvalidArgument(format!(
            "invalid {} name '{}'",
            kind,
            name.escape_debug()
        )));
    }
    Ok(())
}
