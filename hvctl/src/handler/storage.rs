//! Storage controllers, disks and optical images.

use std::path::Path;

use hvctl_shared::{HvctlError, HvctlResult};

use super::MachineHandler;
use crate::constants::{DEVICE_SLOT, disk};
use crate::hypervisor::{AccessMode, DeviceType, StorageBus};
use crate::layout::validate_name;

impl MachineHandler {
    pub fn add_storage_controller(
        &self,
        name: &str,
        controller: &str,
        bus: StorageBus,
    ) -> HvctlResult<()> {
        self.with_machine_session(name, |machine| {
            machine.add_storage_controller(controller, bus)
        })
    }

    /// Attach disk `disk_name` at (`controller`, `port`), creating it first.
    ///
    /// The disk lives at `<settings>/disks/<disk_name>.vdi`. A disk already
    /// registered there is recreated when no machine uses it.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the machine is unknown
    /// - `InvalidState` if the disk is attached to any machine
    pub fn attach_disk(
        &self,
        name: &str,
        disk_name: &str,
        controller: &str,
        port: u32,
    ) -> HvctlResult<()> {
        let machine = self.machine(name)?;
        validate_name("disk", disk_name)?;
        let location = self.layout.disk_image(disk_name);

        if let Some(existing) = self
            .hypervisor
            .find_medium(&location, DeviceType::HardDisk)?
        {
            let users = existing.machine_ids()?;
            if !users.is_empty() {
                return Err(HvctlError::InvalidState(format!(
                    "disk '{}' is attached to {} machine(s)",
                    disk_name,
                    users.len()
                )));
            }
            tracing::info!(disk = %location.display(), "Deleting unattached disk before recreating it");
            existing.delete_storage()?.wait_for_completion(None)?;
        }

        let created = self.hypervisor.create_medium(
            disk::FORMAT,
            &location,
            AccessMode::ReadWrite,
            DeviceType::HardDisk,
        )?;
        created
            .create_base_storage(self.options.disk_size_bytes)?
            .wait_for_completion(None)?;
        tracing::debug!(
            disk = %location.display(),
            size_bytes = self.options.disk_size_bytes,
            "Created disk"
        );

        let opened =
            self.hypervisor
                .open_medium(&location, DeviceType::HardDisk, AccessMode::ReadWrite)?;
        self.run_in_session(machine.as_ref(), |m| {
            m.attach_device(
                controller,
                port,
                DEVICE_SLOT,
                DeviceType::HardDisk,
                Some(opened.as_ref()),
            )
        })?;

        tracing::info!(machine = %name, disk = %disk_name, controller, port, "Attached disk");
        Ok(())
    }

    /// Detach whatever is attached at (`controller`, `port`). The medium is kept.
    pub fn detach_disk(&self, name: &str, controller: &str, port: u32) -> HvctlResult<()> {
        self.with_machine_session(name, |machine| {
            machine.detach_device(controller, port, DEVICE_SLOT)
        })?;
        tracing::info!(machine = %name, controller, port, "Detached device");
        Ok(())
    }

    /// Attach an ISO image, opened read-only, as a DVD at (`controller`, `port`).
    pub fn attach_optical_image(
        &self,
        name: &str,
        controller: &str,
        port: u32,
        image: &Path,
    ) -> HvctlResult<()> {
        let machine = self.machine(name)?;
        let image = std::path::absolute(image)?;

        let medium = self
            .hypervisor
            .open_medium(&image, DeviceType::Dvd, AccessMode::ReadOnly)?;
        self.run_in_session(machine.as_ref(), |m| {
            m.attach_device(
                controller,
                port,
                DEVICE_SLOT,
                DeviceType::Dvd,
                Some(medium.as_ref()),
            )
        })?;

        tracing::info!(machine = %name, image = %image.display(), controller, port, "Attached optical image");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{fixture, fixture_with};
    use super::*;
    use crate::hypervisor::{Hypervisor, SessionState};

    fn prepared(f: &super::super::testing::Fixture, name: &str) {
        f.handler.create_machine(name, "Linux").unwrap();
        f.handler
            .add_storage_controller(name, "SATA", StorageBus::Sata)
            .unwrap();
    }

    #[test]
    fn test_duplicate_controller_is_fault() {
        let f = fixture();
        prepared(&f, "t1");
        let err = f
            .handler
            .add_storage_controller("t1", "SATA", StorageBus::Sata)
            .unwrap_err();
        assert!(err.is_hypervisor_fault());
    }

    #[test]
    fn test_attach_disk_creates_sized_medium() {
        let f = fixture_with(|o| o.disk_size_bytes = 64 * 1024 * 1024);
        prepared(&f, "t1");

        f.handler.attach_disk("t1", "root", "SATA", 0).unwrap();

        let location = f.handler.layout().disk_image("root");
        let disk = f
            .hypervisor
            .find_medium(&location, DeviceType::HardDisk)
            .unwrap()
            .unwrap();
        let machines = f.hypervisor.machines().unwrap();
        assert_eq!(disk.machine_ids().unwrap(), vec![machines[0].id()]);
    }

    #[test]
    fn test_second_attach_of_same_disk_fails() {
        let f = fixture();
        prepared(&f, "t1");
        prepared(&f, "t2");

        f.handler.attach_disk("t1", "shared", "SATA", 0).unwrap();

        let err = f.handler.attach_disk("t1", "shared", "SATA", 1).unwrap_err();
        assert!(matches!(err, HvctlError::InvalidState(_)));
        let err = f.handler.attach_disk("t2", "shared", "SATA", 0).unwrap_err();
        assert!(matches!(err, HvctlError::InvalidState(_)));
    }

    #[test]
    fn test_detached_disk_is_recreated() {
        let f = fixture();
        prepared(&f, "t1");

        f.handler.attach_disk("t1", "scratch", "SATA", 0).unwrap();
        let location = f.handler.layout().disk_image("scratch");
        let first = f
            .hypervisor
            .find_medium(&location, DeviceType::HardDisk)
            .unwrap()
            .unwrap()
            .id();

        f.handler.detach_disk("t1", "SATA", 0).unwrap();
        f.handler.attach_disk("t1", "scratch", "SATA", 0).unwrap();

        let second = f
            .hypervisor
            .find_medium(&location, DeviceType::HardDisk)
            .unwrap()
            .unwrap()
            .id();
        assert_ne!(first, second);
    }

    #[test]
    fn test_attach_to_unknown_controller_releases_session() {
        let f = fixture();
        f.handler.create_machine("t1", "Linux").unwrap();

        let err = f.handler.attach_disk("t1", "root", "NVMe", 0).unwrap_err();
        assert!(err.is_hypervisor_fault());

        let machines = f.hypervisor.machines().unwrap();
        assert_eq!(machines[0].session_state().unwrap(), SessionState::Unlocked);
    }

    #[test]
    fn test_detach_empty_port_is_fault() {
        let f = fixture();
        prepared(&f, "t1");
        assert!(
            f.handler
                .detach_disk("t1", "SATA", 3)
                .unwrap_err()
                .is_hypervisor_fault()
        );
    }

    #[test]
    fn test_attach_optical_image() {
        let f = fixture();
        f.handler.create_machine("t1", "Linux").unwrap();
        f.handler
            .add_storage_controller("t1", "IDE", StorageBus::Ide)
            .unwrap();

        let iso = f.handler.layout().root().join("debian.iso");
        f.handler
            .attach_optical_image("t1", "IDE", 1, &iso)
            .unwrap();

        let dvd = f
            .hypervisor
            .find_medium(&iso, DeviceType::Dvd)
            .unwrap()
            .unwrap();
        assert_eq!(dvd.machine_ids().unwrap().len(), 1);

        // The optical image survives machine removal.
        f.handler.remove_machine("t1").unwrap();
        assert!(
            f.hypervisor
                .find_medium(&iso, DeviceType::Dvd)
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn test_storage_ops_on_unknown_machine() {
        let f = fixture();
        assert!(
            f.handler
                .add_storage_controller("ghost", "SATA", StorageBus::Sata)
                .unwrap_err()
                .is_not_found()
        );
        assert!(
            f.handler
                .attach_disk("ghost", "root", "SATA", 0)
                .unwrap_err()
                .is_not_found()
        );
        assert!(
            f.handler
                .detach_disk("ghost", "SATA", 0)
                .unwrap_err()
                .is_not_found()
        );
        assert!(
            f.handler
                .attach_optical_image("ghost", "IDE", 0, Path::new("/isos/a.iso"))
                .unwrap_err()
                .is_not_found()
        );

        // Nothing was created for the unknown machine.
        let location = f.handler.layout().disk_image("root");
        assert!(
            f.hypervisor
                .find_medium(&location, DeviceType::HardDisk)
                .unwrap()
                .is_none()
        );
    }
}
