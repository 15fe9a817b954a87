use std::path::{Path, PathBuf};
use std::sync::Arc;

use hvctl_shared::{HvctlError, HvctlResult};
use parking_lot::Mutex;

use super::command::VBoxManage;
use super::parse;
use crate::hypervisor::progress::CompletedProgress;
use crate::hypervisor::{DeviceType, MachineId, Medium, MediumId, Progress};

const MIB: u64 = 1024 * 1024;

/// Medium kind argument of `showmediuminfo`, `createmedium` and `closemedium`.
pub(super) fn medium_kind(device: DeviceType) -> &'static str {
    match device {
        DeviceType::HardDisk => "disk",
        DeviceType::Dvd => "dvd",
        DeviceType::Floppy => "floppy",
    }
}

pub(super) struct VBoxManageMedium {
    /// Provisional until `createmedium` reports the real UUID.
    id: Mutex<MediumId>,
    location: PathBuf,
    device: DeviceType,
    format: Option<String>,
    vbox: Arc<VBoxManage>,
}

impl VBoxManageMedium {
    /// A medium that `showmediuminfo` already knows.
    pub(super) fn known(
        id: MediumId,
        location: PathBuf,
        device: DeviceType,
        vbox: Arc<VBoxManage>,
    ) -> Self {
        Self {
            id: Mutex::new(id),
            location,
            device,
            format: None,
            vbox,
        }
    }

    /// A medium found in a machine's attachments, identified by path only.
    pub(super) fn attached(location: PathBuf, device: DeviceType, vbox: Arc<VBoxManage>) -> Self {
        Self::known(MediumId::new(), location, device, vbox)
    }

    /// A medium whose storage does not exist yet.
    pub(super) fn pending(
        format: &str,
        location: PathBuf,
        device: DeviceType,
        vbox: Arc<VBoxManage>,
    ) -> Self {
        Self {
            id: Mutex::new(MediumId::new()),
            location,
            device,
            format: Some(format.to_string()),
            vbox,
        }
    }

    fn location_arg(&self) -> String {
        self.location.to_string_lossy().into_owned()
    }
}

impl Medium for VBoxManageMedium {
    fn id(&self) -> MediumId {
        *self.id.lock()
    }

    fn location(&self) -> &Path {
        &self.location
    }

    fn device_type(&self) -> DeviceType {
        self.device
    }

    fn machine_ids(&self) -> HvctlResult<Vec<MachineId>> {
        let location = self.location_arg();
        let output = self
            .vbox
            .run(["showmediuminfo", medium_kind(self.device), location.as_str()])?;
        Ok(parse::parse_medium_info(&output).in_use_by)
    }

    fn create_base_storage(&self, size_bytes: u64) -> HvctlResult<Box<dyn Progress>> {
        let Some(format) = self.format.as_deref() else {
            return Err(HvctlError::Hypervisor(format!(
                "storage for medium '{}' already exists",
                self.location.display()
            )));
        };
        if size_bytes == 0 {
            return Err(HvctlError::Hypervisor(
                "medium capacity must be greater than zero".into(),
            ));
        }

        let size_mb = size_bytes.div_ceil(MIB).to_string();
        let location = self.location_arg();
        let output = self.vbox.run([
            "createmedium",
            medium_kind(self.device),
            "--filename",
            location.as_str(),
            "--size",
            size_mb.as_str(),
            "--format",
            format,
        ])?;

        match parse::parse_created_uuid(&output) {
            Some(uuid) => *self.id.lock() = MediumId::from_uuid(uuid),
            None => tracing::warn!(
                medium = %self.location.display(),
                "createmedium did not report a UUID"
            ),
        }

        Ok(Box::new(CompletedProgress::succeeded(format!(
            "create storage '{}'",
            self.location.display()
        ))))
    }

    fn delete_storage(&self) -> HvctlResult<Box<dyn Progress>> {
        let location = self.location_arg();
        self.vbox.run([
            "closemedium",
            medium_kind(self.device),
            location.as_str(),
            "--delete",
        ])?;

        Ok(Box::new(CompletedProgress::succeeded(format!(
            "delete storage '{}'",
            self.location.display()
        ))))
    }
}
