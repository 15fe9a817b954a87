use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use hvctl::{
    HandlerOptions, LaunchMode, MachineHandler, MachineProperty, PropertyKey, SettingsLayout,
    StorageBus, VBoxManageHypervisor, init_logging,
};

#[derive(Debug, Parser)]
#[command(name = "hvctl", version, about = "Manage VirtualBox machines and their storage")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Settings directory [default: $HVCTL_HOME or ~/.hvctl]
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// VBoxManage program [default: $HVCTL_VBOXMANAGE or VBoxManage]
    #[arg(long, global = true)]
    vboxmanage: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List registered machines
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Create and register a machine
    Create {
        name: String,
        /// OS kind: Linux or MacOS
        #[arg(long)]
        kind: String,
    },
    /// Launch a machine
    Start {
        name: String,
        #[arg(long, default_value = "headless")]
        mode: LaunchMode,
    },
    /// Power a machine off
    Stop { name: String },
    /// Unregister a machine and delete its settings and disks
    Remove { name: String },
    /// Change machine settings
    Set {
        name: String,
        #[arg(long)]
        cpus: Option<u32>,
        /// Memory in MiB
        #[arg(long)]
        memory: Option<u32>,
        /// Video memory in MiB
        #[arg(long)]
        vram: Option<u32>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Read one machine setting
    Get {
        name: String,
        /// CPUCount, MemorySize, VRAMSize or Description
        key: PropertyKey,
    },
    /// Add a storage controller
    AddController {
        name: String,
        controller: String,
        #[arg(long, default_value = "sata")]
        bus: StorageBus,
    },
    /// Create a disk and attach it
    AttachDisk {
        name: String,
        disk: String,
        #[arg(long)]
        controller: String,
        #[arg(long, default_value_t = 0)]
        port: u32,
    },
    /// Detach the device at a controller port
    DetachDisk {
        name: String,
        #[arg(long)]
        controller: String,
        #[arg(long, default_value_t = 0)]
        port: u32,
    },
    /// Attach an ISO image as a DVD
    AttachDvd {
        name: String,
        image: PathBuf,
        #[arg(long)]
        controller: String,
        #[arg(long, default_value_t = 0)]
        port: u32,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut options = HandlerOptions::default();
    if let Some(home) = args.home {
        options.settings_dir = std::path::absolute(&home)
            .with_context(|| format!("resolving {}", home.display()))?;
    }

    let level = if args.verbose { "debug" } else { "warn" };
    let _log_guard = init_logging(&SettingsLayout::new(&options.settings_dir), level)?;

    let hypervisor = match args.vboxmanage {
        Some(program) => VBoxManageHypervisor::new(program),
        None => VBoxManageHypervisor::from_env(),
    };
    let handler = MachineHandler::new(Arc::new(hypervisor), options)?;

    run(&handler, args.command)
}

fn run(handler: &MachineHandler, command: Command) -> Result<()> {
    match command {
        Command::List { json } => {
            let machines = handler.list_machines()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&machines)?);
            } else {
                for machine in machines {
                    println!("{:<32} {}", machine.name, machine.id);
                }
            }
        }
        Command::Create { name, kind } => {
            handler.create_machine(&name, &kind)?;
            println!("machine {} created", name);
        }
        Command::Start { name, mode } => handler.start_machine(&name, mode)?,
        Command::Stop { name } => handler.stop_machine(&name)?,
        Command::Remove { name } => handler.remove_machine(&name)?,
        Command::Set {
            name,
            cpus,
            memory,
            vram,
            description,
        } => {
            let properties: Vec<MachineProperty> = [
                cpus.map(MachineProperty::CpuCount),
                memory.map(MachineProperty::MemorySize),
                vram.map(MachineProperty::VramSize),
                description.map(MachineProperty::Description),
            ]
            .into_iter()
            .flatten()
            .collect();
            if properties.is_empty() {
                bail!("nothing to set: pass at least one of --cpus, --memory, --vram, --description");
            }
            handler.set_machine_property(&name, properties)?;
        }
        Command::Get { name, key } => {
            let value = handler.get_machine_property(&name, key)?;
            println!("{}", value);
        }
        Command::AddController {
            name,
            controller,
            bus,
        } => handler.add_storage_controller(&name, &controller, bus)?,
        Command::AttachDisk {
            name,
            disk,
            controller,
            port,
        } => handler.attach_disk(&name, &disk, &controller, port)?,
        Command::DetachDisk {
            name,
            controller,
            port,
        } => handler.detach_disk(&name, &controller, port)?,
        Command::AttachDvd {
            name,
            image,
            controller,
            port,
        } => handler.attach_optical_image(&name, &controller, port, &image)?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_start_defaults_to_headless() {
        let args = Args::parse_from(["hvctl", "start", "t1"]);
        match args.command {
            Command::Start { name, mode } => {
                assert_eq!(name, "t1");
                assert_eq!(mode, LaunchMode::Headless);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_get_key() {
        let args = Args::parse_from(["hvctl", "--home", "/tmp/hv", "get", "t1", "CPUCount"]);
        assert_eq!(args.home, Some(PathBuf::from("/tmp/hv")));
        assert!(matches!(
            args.command,
            Command::Get {
                key: PropertyKey::CpuCount,
                ..
            }
        ));
    }
}
