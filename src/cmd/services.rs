//! Readiness table view, `devstack services`.

use anyhow::{Context, Result};
use console::style;
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Serialize)]
struct ServiceRow<'a> {
    service: &'static str,
    name: &'static str,
    required: bool,
    reported_by: Vec<&'a str>,
    ready_markers: &'a [String],
}

pub fn cmd_services(project_dir: &Path, json: bool) -> Result<()> {
    use devstack::config::DevstackConfig;
    use devstack::readiness::Service;

    let config = DevstackConfig::new(project_dir.to_path_buf())?;
    let table = config.readiness_table();
    let required = config.required_services();

    let rows: Vec<ServiceRow<'_>> = Service::ALL
        .into_iter()
        .map(|service| ServiceRow {
            service: service.key(),
            name: service.display_name(),
            required: required.contains(&service),
            reported_by: config
                .toml
                .processes
                .iter()
                .filter(|spec| spec.services.contains(&service))
                .map(|spec| spec.name.as_str())
                .collect(),
            ready_markers: table.markers(service),
        })
        .collect();

    if json {
        let out = serde_json::to_string_pretty(&rows).context("Failed to serialize services")?;
        println!("{}", out);
        return Ok(());
    }

    println!();
    println!("Services");
    println!("========");
    println!();

    for row in &rows {
        let flag = if row.required {
            style("required").green()
        } else {
            style("optional").dim()
        };
        println!("{} ({}) [{}]", style(row.name).bold(), row.service, flag);
        if row.reported_by.is_empty() {
            println!("  reported by: {}", style("no process").yellow());
        } else {
            println!("  reported by: {}", row.reported_by.join(", "));
        }
        for marker in row.ready_markers {
            println!("  - \"{}\"", marker);
        }
        println!();
    }

    Ok(())
}
