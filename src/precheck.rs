//! Port pre-flight check.
//!
//! Runs in two stages:
//! 1. every port variable must be present, numeric, non-zero and unique;
//!    all offending variables are reported and occupancy is not probed
//! 2. all ports are probed concurrently by binding a TCP listener; every
//!    occupied port is reported

use crate::errors::PrecheckError;
use futures::future::join_all;
use std::collections::HashMap;
use std::path::Path;
use tokio::net::TcpListener;

/// Port variables in index order, with the service that listens on each.
pub const PORT_VARS: [(&str, &str); 5] = [
    ("PORT", "web server"),
    ("ANALYTICS_SERVER_PORT", "analytics API"),
    ("SYNC_SERVER_PORT", "sync server"),
    ("DB_PORT", "postgres"),
    ("REDIS_PORT", "redis"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortIssueKind {
    Missing,
    NotNumeric(String),
    OutOfRange(String),
    Duplicate { port: u16, first_index: usize },
    InUse(u16),
    ProbeFailed { port: u16, message: String },
}

/// One offending port variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortIssue {
    pub index: usize,
    pub var: String,
    pub kind: PortIssueKind,
}

impl std::fmt::Display for PortIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: ", self.index, self.var)?;
        match &self.kind {
            PortIssueKind::Missing => write!(f, "not set"),
            PortIssueKind::NotNumeric(value) => write!(f, "'{}' is not a number", value),
            PortIssueKind::OutOfRange(value) => {
                write!(f, "'{}' is outside the valid port range 1-65535", value)
            }
            PortIssueKind::Duplicate { port, first_index } => {
                write!(f, "port {} is already assigned at index {}", port, first_index)
            }
            PortIssueKind::InUse(port) => write!(f, "port {} is already in use", port),
            PortIssueKind::ProbeFailed { port, message } => {
                write!(f, "could not probe port {}: {}", port, message)
            }
        }
    }
}

/// A validated port variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortAssignment {
    pub index: usize,
    pub var: String,
    pub port: u16,
}

/// Load `<project_dir>/.env` into the process environment.
///
/// Variables already present in the environment win. A missing file is fine.
pub fn load_dotenv(project_dir: &Path) -> anyhow::Result<bool> {
    let path = project_dir.join(".env");
    if !path.exists() {
        return Ok(false);
    }
    dotenvy::from_path(&path)
        .map_err(|e| anyhow::anyhow!("Failed to load {}: {}", path.display(), e))?;
    tracing::debug!(path = %path.display(), "loaded .env");
    Ok(true)
}

/// Read the raw values of [`PORT_VARS`] through `lookup`.
pub fn read_port_vars<F>(lookup: F) -> Vec<(String, Option<String>)>
where
    F: Fn(&str) -> Option<String>,
{
    PORT_VARS
        .iter()
        .map(|(var, _)| (var.to_string(), lookup(var)))
        .collect()
}

/// Stage 1: parse every value, collecting all problems.
pub fn validate_ports(
    values: &[(String, Option<String>)],
) -> Result<Vec<PortAssignment>, PrecheckError> {
    let mut issues = Vec::new();
    let mut assignments = Vec::new();
    let mut seen: HashMap<u16, usize> = HashMap::new();

    for (index, (var, value)) in values.iter().enumerate() {
        let issue = |kind| PortIssue {
            index,
            var: var.clone(),
            kind,
        };
        let Some(raw) = value.as_deref().map(str::trim).filter(|v| !v.is_empty()) else {
            issues.push(issue(PortIssueKind::Missing));
            continue;
        };
        if !raw.chars().all(|c| c.is_ascii_digit()) {
            issues.push(issue(PortIssueKind::NotNumeric(raw.to_string())));
            continue;
        }
        let port = match raw.parse::<u16>() {
            Ok(port) if port > 0 => port,
            _ => {
                issues.push(issue(PortIssueKind::OutOfRange(raw.to_string())));
                continue;
            }
        };
        if let Some(&first_index) = seen.get(&port) {
            issues.push(issue(PortIssueKind::Duplicate { port, first_index }));
            continue;
        }
        seen.insert(port, index);
        assignments.push(PortAssignment {
            index,
            var: var.clone(),
            port,
        });
    }

    if issues.is_empty() {
        Ok(assignments)
    } else {
        Err(PrecheckError::InvalidPorts(issues))
    }
}

async fn probe_port(assignment: &PortAssignment) -> Option<PortIssue> {
    let kind = match TcpListener::bind(("0.0.0.0", assignment.port)).await {
        Ok(listener) => {
            drop(listener);
            return None;
        }
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            PortIssueKind::InUse(assignment.port)
        }
        Err(e) => PortIssueKind::ProbeFailed {
            port: assignment.port,
            message: e.to_string(),
        },
    };
    Some(PortIssue {
        index: assignment.index,
        var: assignment.var.clone(),
        kind,
    })
}

/// Stage 2: probe all ports concurrently and report every failure.
pub async fn probe_ports(assignments: &[PortAssignment]) -> Result<(), PrecheckError> {
    let issues: Vec<PortIssue> = join_all(assignments.iter().map(probe_port))
        .await
        .into_iter()
        .flatten()
        .collect();
    if issues.is_empty() {
        Ok(())
    } else {
        Err(PrecheckError::PortsInUse(issues))
    }
}

/// Full pre-flight: validate, then probe.
pub async fn run_precheck<F>(lookup: F) -> Result<Vec<PortAssignment>, PrecheckError>
where
    F: Fn(&str) -> Option<String>,
{
    let assignments = validate_ports(&read_port_vars(lookup))?;
    probe_ports(&assignments).await?;
    let ports: Vec<u16> = assignments.iter().map(|a| a.port).collect();
    tracing::info!(?ports, "port precheck passed");
    Ok(assignments)
}
