use crate::orchestrator::{ExitOutcome, OrchestratorEvent, RunSummary};
use crate::readiness::Service;
use crate::state::AppState;
use crate::supervisor::{ProcessOutput, StreamKind};
use crate::ui::icons::{CHECK, CROSS, FOLDER, RUNNING, SPARKLE, STOP, WAITING, WARN};
use console::{Term, style};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::time::Duration;

/// How `up` renders orchestrator events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiMode {
    /// Progress bars with log lines printed above them
    Full,
    /// `[process] line` output, no cursor movement
    Plain,
}

/// Terminal UI for `devstack up`.
///
/// A header spinner shows the app state; below it one spinner per tracked
/// service flips to a check mark when its ready marker is seen. Process output
/// scrolls above the bars through [`MultiProgress::println`].
pub struct StackUI {
    mode: UiMode,
    multi: MultiProgress,
    header_bar: ProgressBar,
    service_bars: BTreeMap<Service, ProgressBar>,
    verbose: bool,
    term: Term,
}

impl StackUI {
    /// Create the UI for `services`; those missing from `required` are labelled optional.
    pub fn new(
        services: &BTreeSet<Service>,
        required: &BTreeSet<Service>,
        mode: UiMode,
        verbose: bool,
    ) -> Self {
        let multi = match mode {
            UiMode::Full => MultiProgress::new(),
            UiMode::Plain => MultiProgress::with_draw_target(ProgressDrawTarget::hidden()),
        };

        let header_style = ProgressStyle::default_spinner()
            .template("{prefix:.bold} {spinner} {msg}")
            .expect("progress bar template is a valid static string");
        let header_bar = multi.add(ProgressBar::new_spinner());
        header_bar.set_style(header_style);
        header_bar.set_prefix("devstack");
        header_bar.set_message(state_label(AppState::Init));

        let service_style = ProgressStyle::default_spinner()
            .template("  {prefix:.bold.dim} {spinner} {msg}")
            .expect("progress bar template is a valid static string");

        let mut service_bars = BTreeMap::new();
        for service in services {
            let bar = multi.add(ProgressBar::new_spinner());
            bar.set_style(service_style.clone());
            bar.set_prefix(format!("{:<12}", service.display_name()));
            let suffix = if required.contains(service) {
                String::new()
            } else {
                format!(" {}", style("(optional)").dim())
            };
            bar.set_message(format!("{}waiting{}", WAITING, suffix));
            service_bars.insert(*service, bar);
        }

        if mode == UiMode::Full {
            header_bar.enable_steady_tick(Duration::from_millis(100));
            for bar in service_bars.values() {
                bar.enable_steady_tick(Duration::from_millis(120));
            }
        }

        Self {
            mode,
            multi,
            header_bar,
            service_bars,
            verbose,
            term: Term::stdout(),
        }
    }

    /// Print a line via `MultiProgress`, falling back to `eprintln!` if the rich UI fails.
    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    pub fn handle_event(&self, event: &OrchestratorEvent) {
        match self.mode {
            UiMode::Plain => self.handle_plain(event),
            UiMode::Full => self.handle_full(event),
        }
    }

    fn handle_plain(&self, event: &OrchestratorEvent) {
        let line = match event {
            OrchestratorEvent::Output(output) => plain_line(output),
            OrchestratorEvent::Spawned {
                process,
                pid,
                command,
            } => match pid {
                Some(pid) => format!("[devstack] started {} (pid {}): {}", process, pid, command),
                None => format!("[devstack] started {}: {}", process, command),
            },
            OrchestratorEvent::ServiceReady(service) => {
                self.finish_service_bar(*service);
                format!("[devstack] ready: {}", service.key())
            }
            OrchestratorEvent::StateChanged(state) => format!("[devstack] state: {}", state),
            OrchestratorEvent::Exited {
                process,
                outcome,
                during_teardown,
            } => format!(
                "[devstack] exited {}: {}",
                process,
                describe_outcome(outcome, *during_teardown)
            ),
        };
        let _ = writeln!(&self.term, "{}", line);
    }

    fn handle_full(&self, event: &OrchestratorEvent) {
        match event {
            OrchestratorEvent::Spawned {
                process, command, ..
            } => {
                self.print_line(format!(
                    "{}{} {}",
                    RUNNING,
                    style(process).cyan().bold(),
                    style(command).dim()
                ));
            }
            OrchestratorEvent::Output(output) => self.on_output(output),
            OrchestratorEvent::ServiceReady(service) => self.on_service_ready(*service),
            OrchestratorEvent::StateChanged(state) => self.on_state_changed(*state),
            OrchestratorEvent::Exited {
                process,
                outcome,
                during_teardown,
            } => {
                let icon = match (outcome.is_success(), *during_teardown) {
                    (true, _) => CHECK,
                    (false, true) => STOP,
                    (false, false) => CROSS,
                };
                self.print_line(format!(
                    "{}{} {}",
                    icon,
                    style(process).bold(),
                    describe_outcome(outcome, *during_teardown)
                ));
            }
        }
    }

    fn on_output(&self, output: &ProcessOutput) {
        let prefix = style(format!("[{}]", output.process)).dim();
        let text = match output.stream {
            StreamKind::Stdout => style(output.text.as_str()),
            StreamKind::Stderr => style(output.text.as_str()).yellow(),
        };
        self.print_line(format!("{} {}", prefix, text));
    }

    fn finish_service_bar(&self, service: Service) {
        if let Some(bar) = self.service_bars.get(&service) {
            bar.finish_with_message(format!("{}{}", CHECK, style("ready").green()));
        }
    }

    fn on_service_ready(&self, service: Service) {
        self.finish_service_bar(service);
        if self.verbose {
            self.print_line(format!(
                "  {} {} is ready",
                style("→").dim(),
                style(service.display_name()).green()
            ));
        }
    }

    fn on_state_changed(&self, state: AppState) {
        self.header_bar.set_message(state_label(state));
        match state {
            AppState::DockerReady => {
                self.print_line(format!(
                    "\n{}{}\n",
                    SPARKLE,
                    style("All required services are ready. Press Ctrl-C to stop.")
                        .green()
                        .bold()
                ));
            }
            AppState::Teardown => {
                for bar in self.service_bars.values().filter(|bar| !bar.is_finished()) {
                    bar.finish_with_message(format!("{}", style("not ready").dim()));
                }
            }
            AppState::Terminated => {
                self.header_bar.finish_with_message(state_label(state));
            }
            AppState::Init => {}
        }
    }

    /// Closing lines after a clean run.
    pub fn print_summary(&self, summary: &RunSummary) {
        let ready: Vec<&str> = summary.ready.iter().map(|s| s.key()).collect();
        if ready.is_empty() {
            self.emit_line(format!("{}no services became ready", WARN));
        } else {
            self.emit_line(format!("{}ready: {}", CHECK, ready.join(", ")));
        }
        for path in &summary.log_files {
            self.emit_line(format!("{}{}", FOLDER, style(path.display()).dim()));
        }
    }

    /// Closing line after a failed run.
    pub fn print_failure(&self, message: &str) {
        self.emit_line(format!("{}{}", CROSS, style(message).red().bold()));
    }

    fn emit_line(&self, line: String) {
        match self.mode {
            UiMode::Plain => {
                let _ = writeln!(&self.term, "{}", console::strip_ansi_codes(&line));
            }
            UiMode::Full => self.print_line(line),
        }
    }

    /// Stop every spinner; leaves the final messages on screen.
    pub fn finish(&self) {
        for bar in self.service_bars.values().filter(|bar| !bar.is_finished()) {
            bar.abandon();
        }
        if !self.header_bar.is_finished() {
            self.header_bar.abandon();
        }
    }
}

/// `[process] text`, as printed by the plain renderer.
pub fn plain_line(output: &ProcessOutput) -> String {
    format!("[{}] {}", output.process, output.text)
}

fn state_label(state: AppState) -> String {
    match state {
        AppState::Init => format!("{} {}", style(state).yellow().bold(), "starting services"),
        AppState::DockerReady => format!("{} {}", style(state).green().bold(), "stack is up"),
        AppState::Teardown => format!("{} {}", style(state).red().bold(), "stopping processes"),
        AppState::Terminated => format!("{}", style(state).dim().bold()),
    }
}

fn describe_outcome(outcome: &ExitOutcome, during_teardown: bool) -> String {
    match outcome {
        ExitOutcome::Success(0) => "completed".to_string(),
        ExitOutcome::Success(code) => format!("completed (code {})", code),
        ExitOutcome::Failed(_) if during_teardown => "stopped".to_string(),
        ExitOutcome::Failed(message) => message.clone(),
    }
}
