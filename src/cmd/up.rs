//! Bring the stack up, `devstack up` (the default command).

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use super::super::Cli;
use super::precheck::check_ports;

/// Flags of `devstack up`.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct UpArgs {
    /// Skip the port pre-flight check
    #[arg(long)]
    pub skip_precheck: bool,

    /// Print `[process] line` output instead of progress bars
    #[arg(long)]
    pub no_ui: bool,

    /// Lines of output kept per process. Overrides devstack.toml.
    #[arg(long)]
    pub log_capacity: Option<usize>,

    /// Seconds between SIGTERM and SIGKILL on teardown. Overrides devstack.toml.
    #[arg(long)]
    pub teardown_grace_secs: Option<u64>,
}

pub async fn cmd_up(cli: &Cli, project_dir: PathBuf, args: &UpArgs) -> Result<()> {
    use devstack::config::DevstackConfig;
    use devstack::orchestrator::{Orchestrator, OrchestratorSettings};
    use devstack::precheck::load_dotenv;
    use devstack::readiness::Service;
    use devstack::ui::icons::WARN;
    use devstack::ui::{StackUI, UiMode};
    use std::collections::BTreeSet;

    let config = DevstackConfig::with_cli_args(
        project_dir,
        cli.verbose,
        args.log_capacity,
        args.teardown_grace_secs,
    )?;
    config.ensure_directories()?;

    for warning in config.validate() {
        tracing::warn!(%warning, "configuration warning");
        eprintln!("{}{}", WARN, warning);
    }

    if args.skip_precheck {
        load_dotenv(&config.project_dir)?;
        tracing::info!("port pre-flight check skipped");
    } else {
        check_ports(&config.project_dir)
            .await
            .context("Port pre-flight check failed")?;
    }

    let plan = config.processes();
    let settings = OrchestratorSettings::from_config(&config);
    let tracked: BTreeSet<Service> = plan
        .iter()
        .flat_map(|spec| spec.services.iter().copied())
        .collect();
    let mode = if args.no_ui {
        UiMode::Plain
    } else {
        UiMode::Full
    };
    let ui = Arc::new(StackUI::new(&tracked, &settings.required, mode, cli.verbose));

    tracing::info!(
        processes = plan.len(),
        log_capacity = settings.log_capacity,
        grace = ?settings.teardown_grace,
        "starting stack"
    );
    let (orchestrator, mut handle) = Orchestrator::new(plan, settings);

    let mut events = handle
        .take_events()
        .context("Orchestrator event stream was already taken")?;
    let render_ui = Arc::clone(&ui);
    let renderer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            render_ui.handle_event(&event);
        }
    });

    let token = handle.cancel_token();
    let signals = tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        token.cancel();
    });

    let result = orchestrator.run().await;
    signals.abort();
    // The orchestrator dropped its sender, so the renderer ends after the last event.
    if let Err(e) = renderer.await {
        tracing::warn!(error = %e, "UI task ended abnormally");
    }
    ui.finish();

    match result {
        Ok(summary) => {
            ui.print_summary(&summary);
            Ok(())
        }
        Err(err) => {
            ui.print_failure(&err.to_string());
            Err(err).context("Stack stopped with an error")
        }
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
