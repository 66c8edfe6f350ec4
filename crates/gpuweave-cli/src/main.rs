use clap::{Parser, Subcommand};
use tracing::info;

use gpuweave_core::config::default_config_path;
use gpuweave_core::GpuweaveConfig;
use gpuweave_vk::{enumerate_devices, standard_extensions, DeviceInfo, ValidationCollector};

#[derive(Parser)]
#[command(name = "gpuweave")]
#[command(about = "gpuweave - GPU resource lifetime and submission orchestration")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List Vulkan devices and whether the configured extensions are usable on each
    Devices {
        /// Configuration file path (defaults to the system path, then ./gpuweave.toml)
        #[arg(short, long)]
        config: Option<String>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Run arena, copy, submission chain, descriptor, timestamp and shader checks
    Smoke {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<String>,

        /// Run against the software recording driver instead of a real GPU
        #[arg(long)]
        dry_run: bool,

        /// Print JSON instead of a report
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<String>,

        /// Print the built-in defaults, ignoring any file
        #[arg(long)]
        defaults: bool,
    },
}

fn main() -> anyhow::Result<()> {
    gpuweave_common::init_logging();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices { config, json } => {
            let path = config.unwrap_or_else(default_config_path);
            let config = GpuweaveConfig::load_or_default(&path);
            let collector = ValidationCollector::new();
            let extensions = standard_extensions(&config, &collector, None);

            info!("enumerating Vulkan devices");
            let devices = enumerate_devices(&extensions)?;
            if json {
                let list: Vec<serde_json::Value> = devices.iter().map(device_json).collect();
                println!("{}", serde_json::to_string_pretty(&list)?);
            } else if devices.is_empty() {
                println!("No Vulkan devices found.");
            } else {
                for device in &devices {
                    print_device(device, device.index == config.device.index);
                }
            }
        }

        Commands::Smoke {
            config,
            dry_run,
            json,
        } => {
            let path = config.unwrap_or_else(default_config_path);
            gpuweave_cli::smoke::run_smoke(&path, dry_run, json)?;
        }

        Commands::Config { config, defaults } => {
            let config = if defaults {
                GpuweaveConfig::default()
            } else {
                let path = config.unwrap_or_else(default_config_path);
                GpuweaveConfig::load(&path)
                    .map_err(|e| anyhow::anyhow!("failed to load {}: {}", path, e))?
            };
            config.validate()?;
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

fn print_device(device: &DeviceInfo, selected: bool) {
    let marker = if selected { "*" } else { " " };
    println!(
        "{} [{}] {} ({}, Vulkan {}, {} MB device-local)",
        marker,
        device.index,
        device.name,
        device.kind,
        device.api_version,
        device.device_local_bytes / (1024 * 1024)
    );
    for family in &device.queue_families {
        println!(
            "      queue family {}: {} x {:?}",
            family.index, family.queue_count, family.flags
        );
    }
    for (name, status) in &device.extensions {
        match status {
            Ok(()) => println!("      extension {}: available", name),
            Err(reason) => println!("      extension {}: missing ({})", name, reason),
        }
    }
}

fn device_json(device: &DeviceInfo) -> serde_json::Value {
    serde_json::json!({
        "index": device.index,
        "name": device.name,
        "kind": device.kind,
        "api_version": device.api_version,
        "device_local_bytes": device.device_local_bytes,
        "queue_families": device.queue_families.iter().map(|f| serde_json::json!({
            "index": f.index,
            "queue_count": f.queue_count,
            "flags": format!("{:?}", f.flags),
        })).collect::<Vec<_>>(),
        "extensions": device.extensions.iter().map(|(name, status)| serde_json::json!({
            "name": name,
            "available": status.is_ok(),
            "reason": status.as_ref().err(),
        })).collect::<Vec<_>>(),
    })
}
