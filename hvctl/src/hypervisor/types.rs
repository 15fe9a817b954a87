//! Value types exchanged with the hypervisor.

use hvctl_shared::{HvctlError, HvctlResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Hypervisor-assigned machine identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MachineId(Uuid);

impl MachineId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MachineId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MachineId {
    type Err = HvctlError;

    fn from_str(s: &str) -> HvctlResult<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| HvctlError::InvalidArgument(format!("invalid machine id '{}': {}", s, e)))
    }
}

/// Hypervisor-assigned medium identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediumId(Uuid);

impl MediumId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for MediumId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MediumId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Guest operating system families a machine may be created for.
///
/// This is an allowlist: anything else is rejected before the hypervisor is called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OsKind {
    Linux,
    MacOS,
}

impl OsKind {
    /// OS type identifier understood by the hypervisor.
    pub fn as_str(&self) -> &'static str {
        match self {
            OsKind::Linux => "Linux",
            OsKind::MacOS => "MacOS",
        }
    }
}

impl fmt::Display for OsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OsKind {
    type Err = HvctlError;

    fn from_str(s: &str) -> HvctlResult<Self> {
        match s {
            "Linux" => Ok(OsKind::Linux),
            "MacOS" => Ok(OsKind::MacOS),
            other => Err(HvctlError::InvalidArgument(format!(
                "unsupported machine kind '{}', expected one of: Linux, MacOS",
                other
            ))),
        }
    }
}

/// Front end used when launching the VM process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    #[default]
    Headless,
    Gui,
    Sdl,
    Separate,
}

impl LaunchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LaunchMode::Headless => "headless",
            LaunchMode::Gui => "gui",
            LaunchMode::Sdl => "sdl",
            LaunchMode::Separate => "separate",
        }
    }
}

impl fmt::Display for LaunchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LaunchMode {
    type Err = HvctlError;

    fn from_str(s: &str) -> HvctlResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "headless" => Ok(LaunchMode::Headless),
            "gui" => Ok(LaunchMode::Gui),
            "sdl" => Ok(LaunchMode::Sdl),
            "separate" => Ok(LaunchMode::Separate),
            other => Err(HvctlError::InvalidArgument(format!(
                "invalid launch mode '{}', must be one of: headless, gui, sdl, separate",
                other
            ))),
        }
    }
}

/// Kind of lock a session takes on a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    /// Many holders; enough to reach the console of a running machine.
    Shared,
    /// Single holder; refused while the machine runs or anyone else holds a lock.
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Unlocked,
    Locked,
}

/// Execution state of a machine as reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineState {
    PoweredOff,
    Saved,
    Aborted,
    Running,
    Paused,
    Unknown,
}

impl MachineState {
    /// States from which a VM process can be launched.
    pub fn can_launch(&self) -> bool {
        matches!(
            self,
            MachineState::PoweredOff | MachineState::Saved | MachineState::Aborted
        )
    }

    pub fn is_running(&self) -> bool {
        matches!(self, MachineState::Running | MachineState::Paused)
    }
}

/// How much of a machine's footprint `unregister` cleans up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupMode {
    /// Only unregister; refused while media are attached.
    UnregisterOnly,
    /// Detach all media and hand them back so they can be deleted with the config.
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageBus {
    Ide,
    Sata,
    Scsi,
    Sas,
    Floppy,
    Usb,
    PciE,
    VirtioScsi,
}

impl StorageBus {
    /// Bus name as used by the hypervisor's configuration interface.
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageBus::Ide => "ide",
            StorageBus::Sata => "sata",
            StorageBus::Scsi => "scsi",
            StorageBus::Sas => "sas",
            StorageBus::Floppy => "floppy",
            StorageBus::Usb => "usb",
            StorageBus::PciE => "pcie",
            StorageBus::VirtioScsi => "virtio",
        }
    }

    /// Highest usable port count on a controller of this bus.
    pub fn max_ports(&self) -> u32 {
        match self {
            StorageBus::Ide => 2,
            StorageBus::Sata => 30,
            StorageBus::Scsi => 16,
            StorageBus::Sas => 255,
            StorageBus::Floppy => 1,
            StorageBus::Usb => 8,
            StorageBus::PciE => 255,
            StorageBus::VirtioScsi => 256,
        }
    }
}

impl fmt::Display for StorageBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageBus {
    type Err = HvctlError;

    fn from_str(s: &str) -> HvctlResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ide" => Ok(StorageBus::Ide),
            "sata" => Ok(StorageBus::Sata),
            "scsi" => Ok(StorageBus::Scsi),
            "sas" => Ok(StorageBus::Sas),
            "floppy" => Ok(StorageBus::Floppy),
            "usb" => Ok(StorageBus::Usb),
            "pcie" | "nvme" => Ok(StorageBus::PciE),
            "virtio" | "virtioscsi" | "virtio-scsi" => Ok(StorageBus::VirtioScsi),
            other => Err(HvctlError::InvalidArgument(format!(
                "unknown storage bus '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceType {
    HardDisk,
    Dvd,
    Floppy,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::HardDisk => "hdd",
            DeviceType::Dvd => "dvddrive",
            DeviceType::Floppy => "fdd",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

/// The closed set of machine properties hvctl can change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "key", content = "value")]
pub enum MachineProperty {
    /// Number of virtual CPUs.
    CpuCount(u32),
    /// Guest RAM in MiB.
    MemorySize(u32),
    /// Video memory in MiB.
    VramSize(u32),
    Description(String),
}

impl MachineProperty {
    pub fn key(&self) -> PropertyKey {
        match self {
            MachineProperty::CpuCount(_) => PropertyKey::CpuCount,
            MachineProperty::MemorySize(_) => PropertyKey::MemorySize,
            MachineProperty::VramSize(_) => PropertyKey::VramSize,
            MachineProperty::Description(_) => PropertyKey::Description,
        }
    }

    /// Check the value against the ranges the hypervisor accepts.
    pub fn validate(&self) -> HvctlResult<()> {
        let (value, min, max) = match self {
            MachineProperty::CpuCount(n) => (*n, 1, 64),
            MachineProperty::MemorySize(n) => (*n, 4, 2 * 1024 * 1024),
            MachineProperty::VramSize(n) => (*n, 0, 256),
            MachineProperty::Description(_) => return Ok(()),
        };
        if value < min || value > max {
            return Err(HvctlError::Hypervisor(format!(
                "{} must be between {} and {}, got {}",
                self.key(),
                min,
                max,
                value
            )));
        }
        Ok(())
    }
}

impl fmt::Display for MachineProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineProperty::CpuCount(n)
            | MachineProperty::MemorySize(n)
            | MachineProperty::VramSize(n) => write!(f, "{}={}", self.key(), n),
            MachineProperty::Description(s) => write!(f, "{}={}", self.key(), s),
        }
    }
}

/// Name of a [`MachineProperty`], used for reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyKey {
    CpuCount,
    MemorySize,
    VramSize,
    Description,
}

impl PropertyKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyKey::CpuCount => "CPUCount",
            PropertyKey::MemorySize => "MemorySize",
            PropertyKey::VramSize => "VRAMSize",
            PropertyKey::Description => "Description",
        }
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PropertyKey {
    type Err = HvctlError;

    fn from_str(s: &str) -> HvctlResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cpucount" | "cpus" => Ok(PropertyKey::CpuCount),
            "memorysize" | "memory" => Ok(PropertyKey::MemorySize),
            "vramsize" | "vram" => Ok(PropertyKey::VramSize),
            "description" => Ok(PropertyKey::Description),
            other => Err(HvctlError::InvalidArgument(format!(
                "unknown machine property '{}'",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_kind_allowlist() {
        assert_eq!("Linux".parse::<OsKind>().unwrap(), OsKind::Linux);
        assert_eq!("MacOS".parse::<OsKind>().unwrap(), OsKind::MacOS);

        let err = "Windows10_64".parse::<OsKind>().unwrap_err();
        assert!(matches!(err, HvctlError::InvalidArgument(_)));
    }

    #[test]
    fn test_launch_mode_parse() {
        assert_eq!("Headless".parse::<LaunchMode>().unwrap(), LaunchMode::Headless);
        assert_eq!("gui".parse::<LaunchMode>().unwrap(), LaunchMode::Gui);
        assert!("vnc".parse::<LaunchMode>().is_err());
    }

    #[test]
    fn test_property_key_aliases() {
        assert_eq!("CPUCount".parse::<PropertyKey>().unwrap(), PropertyKey::CpuCount);
        assert_eq!("memory".parse::<PropertyKey>().unwrap(), PropertyKey::MemorySize);
        assert!("firmware".parse::<PropertyKey>().is_err());
    }

    #[test]
    fn test_property_validation() {
        assert!(MachineProperty::CpuCount(2).validate().is_ok());
        assert!(MachineProperty::CpuCount(0).validate().is_err());
        assert!(MachineProperty::VramSize(1024).validate().is_err());
        assert!(MachineProperty::Description(String::new()).validate().is_ok());
    }

    #[test]
    fn test_machine_state_transitions() {
        assert!(MachineState::PoweredOff.can_launch());
        assert!(MachineState::Aborted.can_launch());
        assert!(!MachineState::Running.can_launch());
        assert!(MachineState::Paused.is_running());
    }
}
