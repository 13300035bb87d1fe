//! Port pre-flight check, `devstack precheck`.

use anyhow::Result;
use console::style;
use std::path::Path;

/// Load `.env`, validate the port variables and probe them.
///
/// Every issue is printed to stderr before the error is returned, so the
/// caller only has to turn it into a non-zero exit.
pub async fn check_ports(project_dir: &Path) -> Result<()> {
    use devstack::precheck::{load_dotenv, run_precheck};
    use devstack::ui::icons::{CHECK, CROSS};

    load_dotenv(project_dir)?;

    match run_precheck(|var| std::env::var(var).ok()).await {
        Ok(assignments) => {
            for assignment in &assignments {
                println!(
                    "{}[{}] {} = {}",
                    CHECK,
                    assignment.index,
                    assignment.var,
                    style(assignment.port).cyan()
                );
            }
            Ok(())
        }
        Err(err) => {
            for issue in err.issues() {
                eprintln!("{}{}", CROSS, style(issue).red());
            }
            tracing::error!(error = %err, "port pre-flight check failed");
            Err(err.into())
        }
    }
}

pub async fn cmd_precheck(project_dir: &Path) -> Result<()> {
    check_ports(project_dir).await?;
    println!();
    println!("All ports are free.");
    Ok(())
}
