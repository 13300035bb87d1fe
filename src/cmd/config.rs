//! Configuration view and validation commands, `devstack config`.

use anyhow::{Context, Result};

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    use devstack::config::{CONFIG_DIR, CONFIG_FILE, DevstackConfig, DevstackToml};

    let config_dir = project_dir.join(CONFIG_DIR);
    let config_path = config_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Devstack Configuration");
            println!("======================");
            println!();

            let toml = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                DevstackToml::load(&config_path)?
            } else {
                println!("No {} found at {}", CONFIG_FILE, config_path.display());
                println!("Using default configuration.");
                DevstackToml::default()
            };
            println!();

            println!("[supervisor]");
            println!("  log_capacity = {}", toml.supervisor.log_capacity);
            println!(
                "  teardown_grace_secs = {}",
                toml.supervisor.teardown_grace_secs
            );
            println!("  event_buffer = {}", toml.supervisor.event_buffer);
            println!();

            for spec in &toml.processes {
                println!("[[processes]] {}", spec.name);
                println!(
                    "  command = \"{}\"",
                    devstack::errors::command_line(&spec.command, &spec.args)
                );
                if let Some(cwd) = &spec.cwd {
                    println!("  cwd = \"{}\"", cwd.display());
                }
                if let Some(marker) = &spec.lock_marker {
                    println!("  lock_marker = \"{}\"", marker);
                }
                let services: Vec<&str> = spec.services.iter().map(|s| s.key()).collect();
                println!("  services = [{}]", services.join(", "));
                println!();
            }

            for (service, over) in toml.service_overrides() {
                println!("[services.{}]", service.key());
                if let Some(required) = over.required {
                    println!("  required = {}", required);
                }
                if !over.ready_markers.is_empty() {
                    println!("  ready_markers = {:?}", over.ready_markers);
                }
                println!();
            }

            println!("Effective values (with env/CLI overrides):");
            let config = DevstackConfig::new(project_dir.to_path_buf())?;
            println!("  log_capacity = {}", config.log_capacity());
            println!(
                "  teardown_grace_secs = {}",
                config.teardown_grace().as_secs()
            );
            println!("  log_dir = \"{}\"", config.log_dir().display());
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No {} found. Using defaults (valid).", CONFIG_FILE);
                return Ok(());
            }

            let toml = DevstackToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("{} already exists at {}", CONFIG_FILE, config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&config_dir)
                .with_context(|| format!("Failed to create {}", config_dir.display()))?;

            let toml = DevstackToml::default();
            toml.save(&config_path)?;

            println!("Created {} at {}", CONFIG_FILE, config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [supervisor] log_capacity, teardown_grace_secs, event_buffer");
            println!("  - [[processes]] the launch plan");
            println!("  - [services.<name>] required, ready_markers");
            println!();
        }
    }

    Ok(())
}
