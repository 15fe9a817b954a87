//! Hypervisor client API.
//!
//! The hypervisor is consumed as a black box through a small object graph:
//!
//! ```text
//! Hypervisor ──┬─ Machine (registry handle, read-only)
//!              ├─ Session ──┬─ MutableMachine (session-scoped settings)
//!              │            └─ Console (running VM)
//!              └─ Medium
//! ```
//!
//! Long-running calls return a [`Progress`] that the caller waits on.
//!
//! Two backends are provided:
//! - [`VBoxManageHypervisor`]: a VirtualBox installation driven through `VBoxManage`
//! - [`MemoryHypervisor`]: an in-process model with the same locking rules

mod memory;
mod progress;
pub mod types;
mod vboxmanage;

pub use memory::MemoryHypervisor;
pub use progress::CompletedProgress;
pub use types::{
    AccessMode, CleanupMode, DeviceType, LaunchMode, LockType, MachineId, MachineProperty,
    MachineState, MediumId, OsKind, PropertyKey, SessionState, StorageBus,
};
pub use vboxmanage::{VBOXMANAGE_ENV, VBoxManageHypervisor};

use hvctl_shared::HvctlResult;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Entry point of the hypervisor's management API.
///
/// Implementations are explicitly constructed and owned by the caller; hvctl never
/// keeps a process-wide instance.
pub trait Hypervisor: Send + Sync {
    /// Enumerate every machine registered with the hypervisor.
    fn machines(&self) -> HvctlResult<Vec<Arc<dyn Machine>>>;

    /// Create a new, unregistered machine whose settings live at `settings_file`.
    fn create_machine(
        &self,
        settings_file: &Path,
        name: &str,
        os: OsKind,
    ) -> HvctlResult<Arc<dyn Machine>>;

    /// Make a created machine known to the hypervisor.
    fn register_machine(&self, machine: &dyn Machine) -> HvctlResult<()>;

    /// Create a fresh, unlocked session object.
    fn create_session(&self) -> HvctlResult<Box<dyn Session>>;

    /// Look up a registered medium by its file location.
    fn find_medium(
        &self,
        location: &Path,
        device: DeviceType,
    ) -> HvctlResult<Option<Arc<dyn Medium>>>;

    /// Create a medium object at `location`. Storage is allocated separately with
    /// [`Medium::create_base_storage`].
    fn create_medium(
        &self,
        format: &str,
        location: &Path,
        access: AccessMode,
        device: DeviceType,
    ) -> HvctlResult<Arc<dyn Medium>>;

    /// Open an existing image file as a medium, registering it if needed.
    fn open_medium(
        &self,
        location: &Path,
        device: DeviceType,
        access: AccessMode,
    ) -> HvctlResult<Arc<dyn Medium>>;
}

/// Registry-side view of a machine.
///
/// Reads go straight to the hypervisor's saved settings; changes require a [`Session`].
pub trait Machine: Send + Sync {
    fn id(&self) -> MachineId;

    fn name(&self) -> &str;

    fn property(&self, key: PropertyKey) -> HvctlResult<MachineProperty>;

    fn state(&self) -> HvctlResult<MachineState>;

    /// Whether any session currently holds a lock on this machine.
    fn session_state(&self) -> HvctlResult<SessionState>;

    /// Persist the settings of a machine that is not yet registered.
    fn save_settings(&self) -> HvctlResult<()>;

    /// Unregister the machine, returning the media detached by `cleanup`.
    fn unregister(&self, cleanup: CleanupMode) -> HvctlResult<Vec<Arc<dyn Medium>>>;

    /// Delete the settings file of an unregistered machine along with `media`.
    fn delete_config(&self, media: Vec<Arc<dyn Medium>>) -> HvctlResult<Box<dyn Progress>>;
}

/// A client's access handle to one machine.
pub trait Session: Send {
    fn state(&self) -> SessionState;

    fn lock_machine(&mut self, machine: MachineId, lock: LockType) -> HvctlResult<()>;

    fn unlock_machine(&mut self) -> HvctlResult<()>;

    /// Start the VM process. The session must be unlocked; on success it ends up
    /// locked to the launched machine.
    fn launch_vm_process(
        &mut self,
        machine: MachineId,
        mode: LaunchMode,
    ) -> HvctlResult<Box<dyn Progress>>;

    /// Session-scoped, mutable copy of the locked machine's settings.
    fn machine(&mut self) -> HvctlResult<&mut dyn MutableMachine>;

    /// Console of the running machine the session is locked to.
    fn console(&mut self) -> HvctlResult<&mut dyn Console>;
}

/// Settings of a locked machine. Changes are pending until [`save_settings`].
///
/// [`save_settings`]: MutableMachine::save_settings
pub trait MutableMachine {
    fn set_property(&mut self, property: MachineProperty) -> HvctlResult<()>;

    fn add_storage_controller(&mut self, name: &str, bus: StorageBus) -> HvctlResult<()>;

    fn attach_device(
        &mut self,
        controller: &str,
        port: u32,
        device_slot: u32,
        device: DeviceType,
        medium: Option<&dyn Medium>,
    ) -> HvctlResult<()>;

    fn detach_device(&mut self, controller: &str, port: u32, device_slot: u32) -> HvctlResult<()>;

    fn save_settings(&mut self) -> HvctlResult<()>;

    /// Drop pending changes, going back to the last saved settings.
    fn discard_settings(&mut self) -> HvctlResult<()>;
}

pub trait Console {
    fn power_down(&mut self) -> HvctlResult<Box<dyn Progress>>;
}

/// A virtual disk or optical image known to the hypervisor.
pub trait Medium: Send + Sync {
    fn id(&self) -> MediumId;

    fn location(&self) -> &Path;

    fn device_type(&self) -> DeviceType;

    /// Machines whose saved settings reference this medium.
    fn machine_ids(&self) -> HvctlResult<Vec<MachineId>>;

    /// Allocate backing storage of `size_bytes` for a newly created medium.
    fn create_base_storage(&self, size_bytes: u64) -> HvctlResult<Box<dyn Progress>>;

    /// Delete the backing file and forget the medium.
    fn delete_storage(&self) -> HvctlResult<Box<dyn Progress>>;
}

/// Handle to an asynchronous hypervisor operation.
pub trait Progress: Send {
    fn description(&self) -> &str;

    /// Block until the operation completes.
    ///
    /// `None` waits indefinitely. A failed operation is reported as
    /// [`HvctlError::Hypervisor`](hvctl_shared::HvctlError::Hypervisor).
    fn wait_for_completion(&mut self, timeout: Option<Duration>) -> HvctlResult<()>;
}
