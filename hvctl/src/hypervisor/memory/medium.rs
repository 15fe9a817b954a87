use std::path::{Path, PathBuf};

use hvctl_shared::{HvctlError, HvctlResult};

use super::SharedState;
use crate::hypervisor::progress::CompletedProgress;
use crate::hypervisor::{DeviceType, MachineId, Medium, MediumId, Progress};

pub(super) struct MemoryMedium {
    id: MediumId,
    location: PathBuf,
    device: DeviceType,
    state: SharedState,
}

impl MemoryMedium {
    pub(super) fn new(
        id: MediumId,
        location: PathBuf,
        device: DeviceType,
        state: SharedState,
    ) -> Self {
        Self {
            id,
            location,
            device,
            state,
        }
    }

    fn missing(&self) -> HvctlError {
        HvctlError::Hypervisor(format!(
            "medium '{}' is no longer registered",
            self.location.display()
        ))
    }
}

impl Medium for MemoryMedium {
    fn id(&self) -> MediumId {
        self.id
    }

    fn location(&self) -> &Path {
        &self.location
    }

    fn device_type(&self) -> DeviceType {
        self.device
    }

    fn machine_ids(&self) -> HvctlResult<Vec<MachineId>> {
        let state = self.state.lock();
        if !state.media.contains_key(&self.id) {
            return Err(self.missing());
        }
        Ok(state.medium_users(self.id))
    }

    fn create_base_storage(&self, size_bytes: u64) -> HvctlResult<Box<dyn Progress>> {
        if size_bytes == 0 {
            return Err(HvctlError::Hypervisor(
                "medium capacity must be greater than zero".into(),
            ));
        }

        let mut state = self.state.lock();
        let record = state.media.get_mut(&self.id).ok_or_else(|| self.missing())?;
        if record.capacity.is_some() {
            return Err(HvctlError::Hypervisor(format!(
                "storage for medium '{}' already exists",
                self.location.display()
            )));
        }
        record.capacity = Some(size_bytes);

        Ok(Box::new(CompletedProgress::succeeded(format!(
            "create storage '{}'",
            self.location.display()
        ))))
    }

    fn delete_storage(&self) -> HvctlResult<Box<dyn Progress>> {
        let mut state = self.state.lock();
        if !state.media.contains_key(&self.id) {
            return Err(self.missing());
        }
        let users = state.medium_users(self.id);
        if !users.is_empty() {
            return Err(HvctlError::Hypervisor(format!(
                "medium '{}' is attached to {} machine(s)",
                self.location.display(),
                users.len()
            )));
        }
        state.media.remove(&self.id);

        Ok(Box::new(CompletedProgress::succeeded(format!(
            "delete storage '{}'",
            self.location.display()
        ))))
    }
}

#[cfg(test)]
mod tests {
    use crate::hypervisor::{AccessMode, Hypervisor, MemoryHypervisor};

    use super::*;

    #[test]
    fn test_storage_lifecycle() {
        let hv = MemoryHypervisor::new();
        let location = Path::new("/disks/data.vdi");
        let disk = hv
            .create_medium("VDI", location, AccessMode::ReadWrite, DeviceType::HardDisk)
            .unwrap();

        // Not openable before storage exists.
        assert!(
            hv.open_medium(location, DeviceType::HardDisk, AccessMode::ReadWrite)
                .is_err()
        );

        disk.create_base_storage(4096)
            .unwrap()
            .wait_for_completion(None)
            .unwrap();
        assert!(disk.create_base_storage(4096).is_err());

        let opened = hv
            .open_medium(location, DeviceType::HardDisk, AccessMode::ReadWrite)
            .unwrap();
        assert_eq!(opened.id(), disk.id());
        assert!(disk.machine_ids().unwrap().is_empty());

        disk.delete_storage()
            .unwrap()
            .wait_for_completion(None)
            .unwrap();
        assert!(disk.machine_ids().is_err());
        assert!(
            hv.find_medium(location, DeviceType::HardDisk)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let hv = MemoryHypervisor::new();
        let disk = hv
            .create_medium(
                "VDI",
                Path::new("/disks/empty.vdi"),
                AccessMode::ReadWrite,
                DeviceType::HardDisk,
            )
            .unwrap();
        assert!(disk.create_base_storage(0).is_err());
    }
}
