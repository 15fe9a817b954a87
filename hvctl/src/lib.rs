//! hvctl: machine lifecycle and storage management over a hypervisor
//! management API.
//!
//! ```no_run
//! use std::sync::Arc;
//! use hvctl::{HandlerOptions, LaunchMode, MachineHandler, MachineProperty, VBoxManageHypervisor};
//!
//! # fn main() -> hvctl::HvctlResult<()> {
//! let handler = MachineHandler::new(
//!     Arc::new(VBoxManageHypervisor::from_env()),
//!     HandlerOptions::default(),
//! )?;
//! handler.create_machine("t1", "Linux")?;
//! handler.start_machine("t1", LaunchMode::Headless)?;
//! handler.set_machine_property("t1", [MachineProperty::CpuCount(2)])?;
//! handler.stop_machine("t1")?;
//! handler.remove_machine("t1")?;
//! # Ok(())
//! # }
//! ```

pub mod constants;
pub mod handler;
pub mod hypervisor;
pub mod layout;
mod logging;
pub mod options;

pub use handler::{MachineHandler, MachineRegistry, MachineSummary, SessionGuard};
pub use hvctl_shared::{HvctlError, HvctlResult};
pub use hypervisor::{
    DeviceType, Hypervisor, LaunchMode, MachineId, MachineProperty, MachineState,
    MemoryHypervisor, OsKind, PropertyKey, StorageBus, VBoxManageHypervisor,
};
pub use layout::SettingsLayout;
pub use logging::{LogGuard, init_logging};
pub use options::{FaultPolicy, HandlerOptions};
