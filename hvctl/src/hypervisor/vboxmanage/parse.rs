//! Parsers for `VBoxManage` output.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::hypervisor::{DeviceType, MachineId, MachineState, MediumId};

/// Parse `VBoxManage list vms`, one `"name" {uuid}` per line.
pub(super) fn parse_vm_list(output: &str) -> Vec<(String, MachineId)> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let (name, uuid) = line.rsplit_once(' ')?;
            let name = name.trim().strip_prefix('"')?.strip_suffix('"')?;
            let uuid = uuid.strip_prefix('{')?.strip_suffix('}')?;
            let id = uuid.parse::<MachineId>().ok()?;
            Some((name.to_string(), id))
        })
        .collect()
}

/// Parse `--machinereadable` output: `key=value` lines where both sides may be quoted.
pub(super) fn parse_machine_readable(output: &str) -> HashMap<String, String> {
    let mut values = HashMap::new();
    for line in output.lines() {
        let line = line.trim_end_matches('\r');
        let (key, value) = if let Some(rest) = line.strip_prefix('"') {
            let Some((key, rest)) = rest.split_once('"') else {
                continue;
            };
            let Some(value) = rest.strip_prefix('=') else {
                continue;
            };
            (key, value)
        } else {
            let Some(pair) = line.split_once('=') else {
                continue;
            };
            pair
        };
        values.insert(key.to_string(), unquote(value).to_string());
    }
    values
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

/// Extract the `UUID:` line printed by `createvm` and `createmedium`.
pub(super) fn parse_created_uuid(output: &str) -> Option<uuid::Uuid> {
    output.lines().find_map(|line| {
        let (_, rest) = line.split_once("UUID:")?;
        uuid::Uuid::parse_str(rest.trim()).ok()
    })
}

#[derive(Debug, Default, PartialEq)]
pub(super) struct MediumInfo {
    pub id: Option<MediumId>,
    pub in_use_by: Vec<MachineId>,
}

/// Parse `VBoxManage showmediuminfo`.
pub(super) fn parse_medium_info(output: &str) -> MediumInfo {
    let mut info = MediumInfo::default();
    let mut in_use = false;

    for line in output.lines() {
        if let Some(rest) = line.strip_prefix("UUID:") {
            info.id = uuid::Uuid::parse_str(rest.trim())
                .ok()
                .map(MediumId::from_uuid);
            in_use = false;
            continue;
        }
        if line.starts_with("In use by VMs:") {
            in_use = true;
        } else if !line.starts_with(' ') {
            in_use = false;
        }
        if in_use {
            info.in_use_by.extend(uuids_in(line));
        }
    }
    info
}

fn uuids_in(line: &str) -> Vec<MachineId> {
    line.split("(UUID: ")
        .skip(1)
        .filter_map(|part| part.split(')').next())
        .filter_map(|uuid| uuid.parse::<MachineId>().ok())
        .collect()
}

pub(super) fn machine_state(value: &str) -> MachineState {
    match value {
        "poweroff" => MachineState::PoweredOff,
        "saved" => MachineState::Saved,
        "aborted" | "aborted-saved" => MachineState::Aborted,
        "running" => MachineState::Running,
        "paused" => MachineState::Paused,
        _ => MachineState::Unknown,
    }
}

/// Image paths attached to a machine, from `showvminfo --machinereadable`.
///
/// Attachment keys look like `"<controller>-<port>-<device>"`; the value is the
/// image path or `none`/`emptydrive`.
pub(super) fn attached_media(info: &HashMap<String, String>) -> Vec<(PathBuf, DeviceType)> {
    let mut media: Vec<(PathBuf, DeviceType)> = info
        .iter()
        .filter(|(key, _)| is_attachment_key(key))
        .filter(|(_, value)| value.starts_with('/') || value.contains(":\\"))
        .map(|(_, value)| {
            let path = PathBuf::from(value);
            let device = device_for_image(&path);
            (path, device)
        })
        .collect();
    media.sort();
    media.dedup();
    media
}

fn is_attachment_key(key: &str) -> bool {
    let mut parts = key.rsplitn(3, '-');
    let device = parts.next();
    let port = parts.next();
    let prefix = parts.next();
    matches!(
        (device, port, prefix),
        (Some(d), Some(p), Some(prefix))
            if d.parse::<u32>().is_ok() && p.parse::<u32>().is_ok() && !prefix.is_empty()
    )
}

fn device_for_image(path: &std::path::Path) -> DeviceType {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("iso") | Some("dmg") | Some("cdr") => DeviceType::Dvd,
        Some("img") | Some("ima") | Some("flp") => DeviceType::Floppy,
        _ => DeviceType::HardDisk,
    }
}
