use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use hvctl_shared::{HvctlError, HvctlResult};
use parking_lot::Mutex;

use super::command::VBoxManage;
use super::medium::VBoxManageMedium;
use super::parse;
use crate::hypervisor::progress::CompletedProgress;
use crate::hypervisor::{
    CleanupMode, DeviceType, Machine, MachineId, MachineProperty, MachineState, Medium,
    Progress, PropertyKey, SessionState,
};

/// `showvminfo --machinereadable` key holding each property.
pub(super) fn info_key(key: PropertyKey) -> &'static str {
    match key {
        PropertyKey::CpuCount => "cpus",
        PropertyKey::MemorySize => "memory",
        PropertyKey::VramSize => "vram",
        PropertyKey::Description => "description",
    }
}

pub(super) struct VBoxManageMachine {
    id: MachineId,
    name: String,
    vbox: Arc<VBoxManage>,
    /// Settings file, captured at unregister time for `delete_config`.
    settings_file: Mutex<Option<PathBuf>>,
}

impl VBoxManageMachine {
    pub(super) fn new(
        id: MachineId,
        name: String,
        settings_file: Option<PathBuf>,
        vbox: Arc<VBoxManage>,
    ) -> Self {
        Self {
            id,
            name,
            vbox,
            settings_file: Mutex::new(settings_file),
        }
    }

    fn info(&self) -> HvctlResult<HashMap<String, String>> {
        let id = self.id.to_string();
        let output = self
            .vbox
            .run(["showvminfo", id.as_str(), "--machinereadable"])?;
        Ok(parse::parse_machine_readable(&output))
    }

    fn delete_settings_file(&self, path: &std::path::Path) -> HvctlResult<()> {
        for file in [path.to_path_buf(), path.with_extension("vbox-prev")] {
            match std::fs::remove_file(&file) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        if let Some(dir) = path.parent() {
            let logs = dir.join("Logs");
            if logs.is_dir() {
                std::fs::remove_dir_all(&logs)?;
            }
            // Only remove the machine folder once it is empty.
            if let Err(e) = std::fs::remove_dir(dir) {
                tracing::debug!(path = %dir.display(), error = %e, "Keeping machine folder");
            }
        }
        Ok(())
    }
}

impl Machine for VBoxManageMachine {
    fn id(&self) -> MachineId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn property(&self, key: PropertyKey) -> HvctlResult<MachineProperty> {
        let info = self.info()?;
        let raw = info.get(info_key(key)).cloned().unwrap_or_default();
        let number = || {
            raw.parse::<u32>().map_err(|_| {
                HvctlError::Hypervisor(format!(
                    "unexpected value '{}' for {} of '{}'",
                    raw, key, self.name
                ))
            })
        };
        Ok(match key {
            PropertyKey::CpuCount => MachineProperty::CpuCount(number()?),
            PropertyKey::MemorySize => MachineProperty::MemorySize(number()?),
            PropertyKey::VramSize => MachineProperty::VramSize(number()?),
            PropertyKey::Description => MachineProperty::Description(raw.clone()),
        })
    }

    fn state(&self) -> HvctlResult<MachineState> {
        let info = self.info()?;
        Ok(info
            .get("VMState")
            .map(|s| parse::machine_state(s))
            .unwrap_or(MachineState::Unknown))
    }

    fn session_state(&self) -> HvctlResult<SessionState> {
        let info = self.info()?;
        Ok(match info.get("SessionName") {
            Some(name) if !name.is_empty() => SessionState::Locked,
            _ => SessionState::Unlocked,
        })
    }

    fn save_settings(&self) -> HvctlResult<()> {
        // createvm and every later VBoxManage command write the settings file themselves.
        tracing::trace!(machine = %self.name, "Settings already persisted by VBoxManage");
        Ok(())
    }

    fn unregister(&self, cleanup: CleanupMode) -> HvctlResult<Vec<Arc<dyn Medium>>> {
        let info = self.info()?;
        let attached = parse::attached_media(&info);

        if cleanup == CleanupMode::UnregisterOnly && !attached.is_empty() {
            return Err(HvctlError::Hypervisor(format!(
                "cannot unregister machine '{}' because media are still attached",
                self.name
            )));
        }
        if let Some(cfg) = info.get("CfgFile") {
            *self.settings_file.lock() = Some(PathBuf::from(cfg));
        }

        let id = self.id.to_string();
        self.vbox.run(["unregistervm", id.as_str()])?;

        Ok(attached
            .into_iter()
            .map(|(path, device)| {
                Arc::new(VBoxManageMedium::attached(
                    path,
                    device,
                    Arc::clone(&self.vbox),
                )) as Arc<dyn Medium>
            })
            .collect())
    }

    fn delete_config(&self, media: Vec<Arc<dyn Medium>>) -> HvctlResult<Box<dyn Progress>> {
        let description = format!("delete config of '{}'", self.name);
        let mut failures = Vec::new();

        for medium in media {
            // Optical images belong to the user; only disks are deleted.
            if medium.device_type() != DeviceType::HardDisk {
                continue;
            }
            let result = medium
                .delete_storage()
                .and_then(|mut progress| progress.wait_for_completion(None));
            if let Err(e) = result {
                tracing::warn!(
                    machine = %self.name,
                    medium = %medium.location().display(),
                    error = %e,
                    "Failed to delete medium"
                );
                failures.push(e.to_string());
            }
        }

        let settings_file = self.settings_file.lock().clone();
        match settings_file {
            Some(path) => self.delete_settings_file(&path)?,
            None => tracing::warn!(machine = %self.name, "Settings file location unknown, not deleted"),
        }

        Ok(Box::new(if failures.is_empty() {
            CompletedProgress::succeeded(description)
        } else {
            CompletedProgress::failed(description, failures.join("; "))
        }))
    }
}
