//! Shared configuration values.

/// Environment variables read by hvctl.
pub mod envs {
    /// Settings directory override.
    pub const HVCTL_HOME: &str = "HVCTL_HOME";

    /// Log filter, same syntax as `RUST_LOG`.
    pub const HVCTL_LOG: &str = "HVCTL_LOG";

    pub use crate::hypervisor::VBOXMANAGE_ENV as HVCTL_VBOXMANAGE;
}

/// Names under the settings directory.
pub mod paths {
    /// Default settings directory name inside the user's home.
    pub const HOME_DIR_NAME: &str = ".hvctl";

    pub const MACHINES: &str = "machines";

    pub const DISKS: &str = "disks";

    pub const LOGS: &str = "logs";
}

/// Disk images created by `attach_disk`.
pub mod disk {
    /// Image format handed to the hypervisor.
    pub const FORMAT: &str = "VDI";

    /// File extension matching [`FORMAT`].
    pub const EXTENSION: &str = "vdi";

    /// Default fixed capacity (10 GiB).
    pub const DEFAULT_SIZE_BYTES: u64 = 10 * 1024 * 1024 * 1024;
}

/// Machine settings file extension.
pub const SETTINGS_EXTENSION: &str = "vbox";

/// Device slot used for every attachment.
pub const DEVICE_SLOT: u32 = 0;

/// Prefix of the daily log files.
pub const LOG_FILE_PREFIX: &str = "hvctl.log";
