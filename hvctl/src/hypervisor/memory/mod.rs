//! In-process hypervisor model.
//!
//! Keeps machines, their saved settings and the media registry behind a single
//! mutex and applies the same admission rules a real hypervisor does:
//!
//! - a write lock is refused while the machine runs or anyone else holds a lock
//! - a shared lock is refused while a write lock is held
//! - launching needs an unlocked session and a machine that is not running
//! - unregistering needs a machine that is neither running nor locked
//! - media usage is derived from saved attachments only

mod medium;
mod session;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hvctl_shared::{HvctlError, HvctlResult};
use parking_lot::Mutex;

use super::progress::CompletedProgress;
use super::{
    AccessMode, CleanupMode, DeviceType, Hypervisor, LockType, Machine, MachineId,
    MachineProperty, MachineState, Medium, MediumId, OsKind, Progress, PropertyKey, Session,
    SessionState, StorageBus,
};
use medium::MemoryMedium;
use session::MemorySession;

pub(super) type SharedState = Arc<Mutex<MemoryState>>;

/// Settings persisted for a machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct MachineSettings {
    pub cpu_count: u32,
    pub memory_mib: u32,
    pub vram_mib: u32,
    pub description: String,
    pub controllers: Vec<StorageController>,
    pub attachments: Vec<Attachment>,
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self {
            cpu_count: 1,
            memory_mib: 128,
            vram_mib: 8,
            description: String::new(),
            controllers: Vec::new(),
            attachments: Vec::new(),
        }
    }
}

impl MachineSettings {
    fn property(&self, key: PropertyKey) -> MachineProperty {
        match key {
            PropertyKey::CpuCount => MachineProperty::CpuCount(self.cpu_count),
            PropertyKey::MemorySize => MachineProperty::MemorySize(self.memory_mib),
            PropertyKey::VramSize => MachineProperty::VramSize(self.vram_mib),
            PropertyKey::Description => MachineProperty::Description(self.description.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct StorageController {
    pub name: String,
    pub bus: StorageBus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct Attachment {
    pub controller: String,
    pub port: u32,
    pub slot: u32,
    pub device: DeviceType,
    pub medium: Option<MediumId>,
}

#[derive(Debug)]
pub(super) struct MachineRecord {
    pub name: String,
    pub os: OsKind,
    pub settings_file: PathBuf,
    pub registered: bool,
    pub settings_saved: bool,
    pub settings: MachineSettings,
    pub state: MachineState,
    /// Locks held by sessions, keyed by session id.
    pub locks: Vec<(u64, LockType)>,
}

#[derive(Debug)]
pub(super) struct MediumRecord {
    pub location: PathBuf,
    pub device: DeviceType,
    /// `None` until base storage is created.
    pub capacity: Option<u64>,
}

#[derive(Debug, Default)]
pub(super) struct MemoryState {
    pub machines: HashMap<MachineId, MachineRecord>,
    pub media: HashMap<MediumId, MediumRecord>,
    next_session: u64,
}

impl MemoryState {
    pub fn machine(&self, id: MachineId) -> HvctlResult<&MachineRecord> {
        self.machines
            .get(&id)
            .ok_or_else(|| HvctlError::Hypervisor(format!("machine {} does not exist", id)))
    }

    pub fn machine_mut(&mut self, id: MachineId) -> HvctlResult<&mut MachineRecord> {
        self.machines
            .get_mut(&id)
            .ok_or_else(|| HvctlError::Hypervisor(format!("machine {} does not exist", id)))
    }

    fn registered_machine(&self, id: MachineId) -> HvctlResult<&MachineRecord> {
        let record = self.machine(id)?;
        if !record.registered {
            return Err(HvctlError::Hypervisor(format!(
                "machine '{}' is not registered",
                record.name
            )));
        }
        Ok(record)
    }

    /// Machines whose saved settings attach `medium`.
    pub fn medium_users(&self, medium: MediumId) -> Vec<MachineId> {
        let mut users: Vec<MachineId> = self
            .machines
            .iter()
            .filter(|(_, record)| {
                record
                    .settings
                    .attachments
                    .iter()
                    .any(|a| a.medium == Some(medium))
            })
            .map(|(id, _)| *id)
            .collect();
        users.sort_by_key(|id| *id.as_uuid());
        users
    }

    fn find_medium(&self, location: &Path) -> Option<(MediumId, &MediumRecord)> {
        self.media
            .iter()
            .find(|(_, record)| record.location == location)
            .map(|(id, record)| (*id, record))
    }
}

/// Hypervisor kept entirely in process memory.
///
/// Cloning yields another client of the same hypervisor.
#[derive(Clone, Default)]
pub struct MemoryHypervisor {
    state: SharedState,
}

impl std::fmt::Debug for MemoryHypervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryHypervisor")
            .field("machines", &state.machines.len())
            .field("media", &state.media.len())
            .finish()
    }
}

impl MemoryHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a machine directly, as if it had been created by another client.
    pub fn seed_machine(&self, name: &str, os: OsKind) -> MachineId {
        let id = MachineId::new();
        let mut state = self.state.lock();
        state.machines.insert(
            id,
            MachineRecord {
                name: name.to_string(),
                os,
                settings_file: PathBuf::from(format!("{}.vbox", name)),
                registered: true,
                settings_saved: true,
                settings: MachineSettings::default(),
                state: MachineState::PoweredOff,
                locks: Vec::new(),
            },
        );
        id
    }

    fn machine_handle(&self, id: MachineId, name: &str) -> Arc<dyn Machine> {
        Arc::new(MemoryMachine {
            id,
            name: name.to_string(),
            state: Arc::clone(&self.state),
        })
    }

    fn medium_handle(&self, id: MediumId, record: &MediumRecord) -> Arc<dyn Medium> {
        Arc::new(MemoryMedium::new(
            id,
            record.location.clone(),
            record.device,
            Arc::clone(&self.state),
        ))
    }
}

impl Hypervisor for MemoryHypervisor {
    fn machines(&self) -> HvctlResult<Vec<Arc<dyn Machine>>> {
        let state = self.state.lock();
        let mut registered: Vec<(&MachineId, &MachineRecord)> = state
            .machines
            .iter()
            .filter(|(_, record)| record.registered)
            .collect();
        registered.sort_by(|a, b| a.1.name.cmp(&b.1.name));

        Ok(registered
            .into_iter()
            .map(|(id, record)| self.machine_handle(*id, &record.name))
            .collect())
    }

    fn create_machine(
        &self,
        settings_file: &Path,
        name: &str,
        os: OsKind,
    ) -> HvctlResult<Arc<dyn Machine>> {
        let mut state = self.state.lock();

        if state
            .machines
            .values()
            .any(|record| record.settings_file == settings_file)
        {
            return Err(HvctlError::Hypervisor(format!(
                "machine settings file '{}' already exists",
                settings_file.display()
            )));
        }

        let id = MachineId::new();
        state.machines.insert(
            id,
            MachineRecord {
                name: name.to_string(),
                os,
                settings_file: settings_file.to_path_buf(),
                registered: false,
                settings_saved: false,
                settings: MachineSettings::default(),
                state: MachineState::PoweredOff,
                locks: Vec::new(),
            },
        );
        drop(state);

        tracing::trace!(machine_id = %id, name, os = %os, "Created machine");
        Ok(self.machine_handle(id, name))
    }

    fn register_machine(&self, machine: &dyn Machine) -> HvctlResult<()> {
        let mut state = self.state.lock();
        let id = machine.id();

        let record = state.machine(id)?;
        if record.registered {
            return Err(HvctlError::Hypervisor(format!(
                "machine '{}' is already registered",
                record.name
            )));
        }
        if !record.settings_saved {
            return Err(HvctlError::Hypervisor(format!(
                "settings of machine '{}' have not been saved",
                record.name
            )));
        }
        let name = record.name.clone();
        if state
            .machines
            .iter()
            .any(|(other, r)| *other != id && r.registered && r.name == name)
        {
            return Err(HvctlError::Hypervisor(format!(
                "a machine named '{}' is already registered",
                name
            )));
        }

        state.machine_mut(id)?.registered = true;
        Ok(())
    }

    fn create_session(&self) -> HvctlResult<Box<dyn Session>> {
        let mut state = self.state.lock();
        state.next_session += 1;
        let id = state.next_session;
        Ok(Box::new(MemorySession::new(id, Arc::clone(&self.state))))
    }

    fn find_medium(
        &self,
        location: &Path,
        device: DeviceType,
    ) -> HvctlResult<Option<Arc<dyn Medium>>> {
        let state = self.state.lock();
        Ok(state
            .find_medium(location)
            .filter(|(_, record)| record.device == device)
            .map(|(id, record)| self.medium_handle(id, record)))
    }

    fn create_medium(
        &self,
        format: &str,
        location: &Path,
        _access: AccessMode,
        device: DeviceType,
    ) -> HvctlResult<Arc<dyn Medium>> {
        if format.is_empty() {
            return Err(HvctlError::Hypervisor("medium format must not be empty".into()));
        }

        let mut state = self.state.lock();
        if state.find_medium(location).is_some() {
            return Err(HvctlError::Hypervisor(format!(
                "a medium at '{}' is already registered",
                location.display()
            )));
        }

        let id = MediumId::new();
        let record = MediumRecord {
            location: location.to_path_buf(),
            device,
            capacity: None,
        };
        let handle = self.medium_handle(id, &record);
        state.media.insert(id, record);
        Ok(handle)
    }

    fn open_medium(
        &self,
        location: &Path,
        device: DeviceType,
        _access: AccessMode,
    ) -> HvctlResult<Arc<dyn Medium>> {
        let mut state = self.state.lock();

        if let Some((id, record)) = state.find_medium(location) {
            if record.device != device {
                return Err(HvctlError::Hypervisor(format!(
                    "medium '{}' is registered as {:?}, not {:?}",
                    location.display(),
                    record.device,
                    device
                )));
            }
            if record.capacity.is_none() {
                return Err(HvctlError::Hypervisor(format!(
                    "medium '{}' has no storage",
                    location.display()
                )));
            }
            return Ok(self.medium_handle(id, record));
        }

        if device == DeviceType::HardDisk {
            return Err(HvctlError::Hypervisor(format!(
                "could not find file for the medium '{}'",
                location.display()
            )));
        }

        // Image files are opened in place; their size is not tracked.
        let id = MediumId::new();
        let record = MediumRecord {
            location: location.to_path_buf(),
            device,
            capacity: Some(0),
        };
        let handle = self.medium_handle(id, &record);
        state.media.insert(id, record);
        Ok(handle)
    }
}

/// Registry handle onto a machine in a [`MemoryHypervisor`].
struct MemoryMachine {
    id: MachineId,
    name: String,
    state: SharedState,
}

impl Machine for MemoryMachine {
    fn id(&self) -> MachineId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn property(&self, key: PropertyKey) -> HvctlResult<MachineProperty> {
        let state = self.state.lock();
        Ok(state.machine(self.id)?.settings.property(key))
    }

    fn state(&self) -> HvctlResult<MachineState> {
        let state = self.state.lock();
        Ok(state.machine(self.id)?.state)
    }

    fn session_state(&self) -> HvctlResult<SessionState> {
        let state = self.state.lock();
        Ok(if state.machine(self.id)?.locks.is_empty() {
            SessionState::Unlocked
        } else {
            SessionState::Locked
        })
    }

    fn save_settings(&self) -> HvctlResult<()> {
        let mut state = self.state.lock();
        state.machine_mut(self.id)?.settings_saved = true;
        Ok(())
    }

    fn unregister(&self, cleanup: CleanupMode) -> HvctlResult<Vec<Arc<dyn Medium>>> {
        let mut state = self.state.lock();

        let record = state.registered_machine(self.id)?;
        if record.state.is_running() {
            return Err(HvctlError::Hypervisor(format!(
                "cannot unregister machine '{}' while it is {:?}",
                record.name, record.state
            )));
        }
        if !record.locks.is_empty() {
            return Err(HvctlError::Hypervisor(format!(
                "cannot unregister machine '{}' while a session is locked",
                record.name
            )));
        }
        if cleanup == CleanupMode::UnregisterOnly && !record.settings.attachments.is_empty() {
            return Err(HvctlError::Hypervisor(format!(
                "cannot unregister machine '{}' because media are still attached",
                record.name
            )));
        }

        let record = state.machine_mut(self.id)?;
        let detached: Vec<MediumId> = record
            .settings
            .attachments
            .drain(..)
            .filter_map(|a| a.medium)
            .collect();
        record.registered = false;

        let media = detached
            .into_iter()
            .filter_map(|id| {
                state.media.get(&id).map(|record| {
                    Arc::new(MemoryMedium::new(
                        id,
                        record.location.clone(),
                        record.device,
                        Arc::clone(&self.state),
                    )) as Arc<dyn Medium>
                })
            })
            .collect();
        Ok(media)
    }

    fn delete_config(&self, media: Vec<Arc<dyn Medium>>) -> HvctlResult<Box<dyn Progress>> {
        let mut state = self.state.lock();

        let record = state.machine(self.id)?;
        if record.registered {
            return Err(HvctlError::Hypervisor(format!(
                "cannot delete the settings of registered machine '{}'",
                record.name
            )));
        }
        state.machines.remove(&self.id);

        for medium in media {
            let id = medium.id();
            if !state.medium_users(id).is_empty() {
                tracing::debug!(medium = %medium.location().display(), "Medium still in use, keeping it");
                continue;
            }
            // Optical images belong to the user; only disks are deleted.
            if medium.device_type() == DeviceType::HardDisk {
                state.media.remove(&id);
            }
        }

        Ok(Box::new(CompletedProgress::succeeded(format!(
            "delete config of '{}'",
            self.name
        ))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created(hv: &MemoryHypervisor, name: &str) -> Arc<dyn Machine> {
        let machine = hv
            .create_machine(Path::new(&format!("/vms/{name}.vbox")), name, OsKind::Linux)
            .unwrap();
        machine.save_settings().unwrap();
        hv.register_machine(machine.as_ref()).unwrap();
        machine
    }

    #[test]
    fn test_created_machine_is_listed_only_after_registration() {
        let hv = MemoryHypervisor::new();
        let machine = hv
            .create_machine(Path::new("/vms/a.vbox"), "a", OsKind::Linux)
            .unwrap();
        assert!(hv.machines().unwrap().is_empty());

        machine.save_settings().unwrap();
        hv.register_machine(machine.as_ref()).unwrap();

        let names: Vec<String> = hv
            .machines()
            .unwrap()
            .iter()
            .map(|m| m.name().to_string())
            .collect();
        assert_eq!(names, vec!["a".to_string()]);
    }

    #[test]
    fn test_register_requires_saved_settings() {
        let hv = MemoryHypervisor::new();
        let machine = hv
            .create_machine(Path::new("/vms/a.vbox"), "a", OsKind::Linux)
            .unwrap();
        let err = hv.register_machine(machine.as_ref()).unwrap_err();
        assert!(err.is_hypervisor_fault());
    }

    #[test]
    fn test_duplicate_settings_file_rejected() {
        let hv = MemoryHypervisor::new();
        created(&hv, "a");
        let err = hv
            .create_machine(Path::new("/vms/a.vbox"), "a", OsKind::Linux)
            .err()
            .unwrap();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn test_write_lock_excludes_other_sessions() {
        let hv = MemoryHypervisor::new();
        let machine = created(&hv, "a");

        let mut first = hv.create_session().unwrap();
        first.lock_machine(machine.id(), LockType::Write).unwrap();

        let mut second = hv.create_session().unwrap();
        assert!(second.lock_machine(machine.id(), LockType::Shared).is_err());
        assert!(second.lock_machine(machine.id(), LockType::Write).is_err());

        first.unlock_machine().unwrap();
        second.lock_machine(machine.id(), LockType::Shared).unwrap();
        assert_eq!(machine.session_state().unwrap(), SessionState::Locked);
        second.unlock_machine().unwrap();
        assert_eq!(machine.session_state().unwrap(), SessionState::Unlocked);
    }

    #[test]
    fn test_unregister_refused_while_running() {
        let hv = MemoryHypervisor::new();
        let machine = created(&hv, "a");

        let mut session = hv.create_session().unwrap();
        session
            .launch_vm_process(machine.id(), super::super::LaunchMode::Headless)
            .unwrap()
            .wait_for_completion(None)
            .unwrap();
        session.unlock_machine().unwrap();

        assert!(machine.unregister(CleanupMode::Full).is_err());
    }

    #[test]
    fn test_full_unregister_returns_attached_media() {
        let hv = MemoryHypervisor::new();
        let machine = created(&hv, "a");
        let disk = hv
            .create_medium(
                "VDI",
                Path::new("/disks/a.vdi"),
                AccessMode::ReadWrite,
                DeviceType::HardDisk,
            )
            .unwrap();
        disk.create_base_storage(1024).unwrap();

        let mut session = hv.create_session().unwrap();
        session.lock_machine(machine.id(), LockType::Shared).unwrap();
        {
            let m = session.machine().unwrap();
            m.add_storage_controller("SATA", StorageBus::Sata).unwrap();
            m.attach_device("SATA", 0, 0, DeviceType::HardDisk, Some(disk.as_ref()))
                .unwrap();
            m.save_settings().unwrap();
        }
        session.unlock_machine().unwrap();

        assert!(machine.unregister(CleanupMode::UnregisterOnly).is_err());

        let media = machine.unregister(CleanupMode::Full).unwrap();
        assert_eq!(media.len(), 1);
        assert_eq!(media[0].id(), disk.id());

        machine
            .delete_config(media)
            .unwrap()
            .wait_for_completion(None)
            .unwrap();
        assert!(
            hv.find_medium(Path::new("/disks/a.vdi"), DeviceType::HardDisk)
                .unwrap()
                .is_none()
        );
    }
}
