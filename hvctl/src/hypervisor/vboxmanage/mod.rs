//! VirtualBox backend driven through the `VBoxManage` command line.

mod command;
mod machine;
mod medium;
mod parse;
mod session;

pub use command::VBOXMANAGE_ENV;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hvctl_shared::{HvctlError, HvctlResult};
use parking_lot::Mutex;

use self::command::VBoxManage;
use self::machine::VBoxManageMachine;
use self::medium::{VBoxManageMedium, medium_kind};
use self::session::VBoxManageSession;
use super::{
    AccessMode, DeviceType, Hypervisor, Machine, MachineId, Medium, OsKind, Session,
};

/// [`Hypervisor`] backed by a local VirtualBox installation.
#[derive(Clone)]
pub struct VBoxManageHypervisor {
    vbox: Arc<VBoxManage>,
    /// Machines created but not yet registered, with their settings file.
    pending: Arc<Mutex<HashMap<MachineId, PathBuf>>>,
}

impl VBoxManageHypervisor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self::with_vbox(VBoxManage::new(program))
    }

    /// Use the program named by `HVCTL_VBOXMANAGE`, or `VBoxManage` from `PATH`.
    pub fn from_env() -> Self {
        Self::with_vbox(VBoxManage::from_env())
    }

    fn with_vbox(vbox: VBoxManage) -> Self {
        tracing::debug!(program = %vbox.program().display(), "Using VBoxManage");
        Self {
            vbox: Arc::new(vbox),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn program(&self) -> &Path {
        self.vbox.program()
    }

    fn machine(&self, id: MachineId, name: String, settings_file: Option<PathBuf>) -> Arc<dyn Machine> {
        Arc::new(VBoxManageMachine::new(
            id,
            name,
            settings_file,
            Arc::clone(&self.vbox),
        ))
    }

    fn medium_info(&self, location: &Path, device: DeviceType) -> HvctlResult<parse::MediumInfo> {
        let location = location.to_string_lossy();
        let output = self
            .vbox
            .run(["showmediuminfo", medium_kind(device), &*location])?;
        Ok(parse::parse_medium_info(&output))
    }

    fn known_medium(
        &self,
        info: parse::MediumInfo,
        location: &Path,
        device: DeviceType,
    ) -> Arc<dyn Medium> {
        Arc::new(VBoxManageMedium::known(
            info.id.unwrap_or_default(),
            location.to_path_buf(),
            device,
            Arc::clone(&self.vbox),
        ))
    }
}

impl std::fmt::Debug for VBoxManageHypervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VBoxManageHypervisor")
            .field("program", &self.vbox.program())
            .finish()
    }
}

impl Hypervisor for VBoxManageHypervisor {
    fn machines(&self) -> HvctlResult<Vec<Arc<dyn Machine>>> {
        let output = self.vbox.run(["list", "vms"])?;
        Ok(parse::parse_vm_list(&output)
            .into_iter()
            .map(|(name, id)| self.machine(id, name, None))
            .collect())
    }

    fn create_machine(
        &self,
        settings_file: &Path,
        name: &str,
        os: OsKind,
    ) -> HvctlResult<Arc<dyn Machine>> {
        // createvm lays out <basefolder>/<name>/<name>.vbox itself.
        let base_folder = settings_file
            .parent()
            .and_then(Path::parent)
            .ok_or_else(|| {
                HvctlError::InvalidArgument(format!(
                    "settings file '{}' has no machine base folder",
                    settings_file.display()
                ))
            })?;
        let base_folder = base_folder.to_string_lossy();

        let output = self.vbox.run([
            "createvm",
            "--name",
            name,
            "--ostype",
            os.as_str(),
            "--basefolder",
            &*base_folder,
        ])?;
        let id = parse::parse_created_uuid(&output)
            .map(MachineId::from_uuid)
            .ok_or_else(|| {
                HvctlError::Hypervisor(format!("createvm did not report a UUID for '{}'", name))
            })?;

        self.pending.lock().insert(id, settings_file.to_path_buf());
        tracing::debug!(machine = %name, %id, "Created machine");
        Ok(self.machine(id, name.to_string(), Some(settings_file.to_path_buf())))
    }

    fn register_machine(&self, machine: &dyn Machine) -> HvctlResult<()> {
        let id = machine.id();
        let settings_file = self.pending.lock().get(&id).cloned().ok_or_else(|| {
            HvctlError::Hypervisor(format!(
                "machine '{}' was not created by this hypervisor handle",
                machine.name()
            ))
        })?;

        let path = settings_file.to_string_lossy();
        self.vbox.run(["registervm", &*path])?;
        self.pending.lock().remove(&id);
        Ok(())
    }

    fn create_session(&self) -> HvctlResult<Box<dyn Session>> {
        Ok(Box::new(VBoxManageSession::new(Arc::clone(&self.vbox))))
    }

    fn find_medium(
        &self,
        location: &Path,
        device: DeviceType,
    ) -> HvctlResult<Option<Arc<dyn Medium>>> {
        match self.medium_info(location, device) {
            Ok(info) => Ok(Some(self.known_medium(info, location, device))),
            Err(HvctlError::Hypervisor(msg)) => {
                tracing::debug!(medium = %location.display(), error = %msg, "Medium not registered");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn create_medium(
        &self,
        format: &str,
        location: &Path,
        access: AccessMode,
        device: DeviceType,
    ) -> HvctlResult<Arc<dyn Medium>> {
        if access == AccessMode::ReadOnly {
            return Err(HvctlError::Unsupported(
                "creating read-only media is not supported".into(),
            ));
        }
        Ok(Arc::new(VBoxManageMedium::pending(
            format,
            location.to_path_buf(),
            device,
            Arc::clone(&self.vbox),
        )))
    }

    fn open_medium(
        &self,
        location: &Path,
        device: DeviceType,
        _access: AccessMode,
    ) -> HvctlResult<Arc<dyn Medium>> {
        // showmediuminfo registers the image as a side effect.
        let info = self.medium_info(location, device)?;
        Ok(self.known_medium(info, location, device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_program_is_unsupported() {
        let hv = VBoxManageHypervisor::new("/nonexistent/VBoxManage");
        assert!(matches!(hv.machines(), Err(HvctlError::Unsupported(_))));
    }

    #[test]
    fn test_register_requires_created_machine() {
        let hv = VBoxManageHypervisor::new("/nonexistent/VBoxManage");
        let stranger = hv.machine(MachineId::new(), "t1".into(), None);
        let err = hv.register_machine(stranger.as_ref()).unwrap_err();
        assert!(err.is_hypervisor_fault());
    }

    #[test]
    fn test_read_only_media_cannot_be_created() {
        let hv = VBoxManageHypervisor::new("/nonexistent/VBoxManage");
        let result = hv.create_medium(
            "VDI",
            Path::new("/disks/ro.vdi"),
            AccessMode::ReadOnly,
            DeviceType::HardDisk,
        );
        assert!(matches!(result, Err(HvctlError::Unsupported(_))));
    }
}
