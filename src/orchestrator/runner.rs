use super::events::{ExitOutcome, OrchestratorEvent, ProcessReport, RunSummary};
use crate::config::{DevstackConfig, ProcessSpec};
use crate::errors::{OrchestratorError, SupervisorError};
use crate::log_buffer::CircularBuffer;
use crate::readiness::{ReadinessTable, ReadinessTracker, Service};
use crate::state::{AppState, AppStateMachine};
use crate::supervisor::{ProcessController, ProcessHandle, ProcessOutput, RunOptions, run_command};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Sleep};
use tokio_util::sync::CancellationToken;

/// How often leftover process groups are checked during teardown.
const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long to wait for groups to vanish after SIGKILL before giving up.
const GROUP_KILL_WAIT: Duration = Duration::from_secs(1);

/// Knobs for one orchestrator run.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub log_capacity: usize,
    pub teardown_grace: Duration,
    pub event_buffer: usize,
    /// Where each process's last lines are written on exit; `None` disables it
    pub log_dir: Option<PathBuf>,
    pub readiness: ReadinessTable,
    pub required: BTreeSet<Service>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            log_capacity: 500,
            teardown_grace: Duration::from_secs(10),
            event_buffer: 256,
            log_dir: None,
            readiness: ReadinessTable::default(),
            required: Service::ALL.into_iter().collect(),
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &DevstackConfig) -> Self {
        Self {
            log_capacity: config.log_capacity(),
            teardown_grace: config.teardown_grace(),
            event_buffer: config.event_buffer(),
            log_dir: Some(config.log_dir()),
            readiness: config.readiness_table(),
            required: config.required_services(),
        }
    }
}

/// Read-only view of a running orchestrator plus its one input, `cancel`.
#[derive(Debug)]
pub struct OrchestratorHandle {
    state: watch::Receiver<AppState>,
    ready: watch::Receiver<BTreeSet<Service>>,
    events: Option<mpsc::Receiver<OrchestratorEvent>>,
    cancel: CancellationToken,
}

impl OrchestratorHandle {
    pub fn state(&self) -> AppState {
        *self.state.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<AppState> {
        self.state.clone()
    }

    pub fn ready_services(&self) -> BTreeSet<Service> {
        self.ready.borrow().clone()
    }

    pub fn ready_receiver(&self) -> watch::Receiver<BTreeSet<Service>> {
        self.ready.clone()
    }

    /// Take the event stream. The orchestrator waits for room in this channel,
    /// so a taken receiver must be drained (or dropped).
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<OrchestratorEvent>> {
        self.events.take()
    }

    /// Request teardown.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Spawns the launch plan, watches readiness, and tears everything down.
pub struct Orchestrator {
    plan: Vec<ProcessSpec>,
    settings: OrchestratorSettings,
    state: AppStateMachine,
    ready_tx: watch::Sender<BTreeSet<Service>>,
    events: mpsc::Sender<OrchestratorEvent>,
    cancel: CancellationToken,
    routes: HashMap<String, Vec<Service>>,
}

impl Orchestrator {
    pub fn new(
        plan: Vec<ProcessSpec>,
        settings: OrchestratorSettings,
    ) -> (Self, OrchestratorHandle) {
        let state = AppStateMachine::new();
        let (ready_tx, ready_rx) = watch::channel(BTreeSet::new());
        let (events_tx, events_rx) = mpsc::channel(settings.event_buffer.max(1));
        let cancel = CancellationToken::new();
        let routes = plan
            .iter()
            .map(|spec| (spec.name.clone(), spec.services.clone()))
            .collect();

        let handle = OrchestratorHandle {
            state: state.subscribe(),
            ready: ready_rx,
            events: Some(events_rx),
            cancel: cancel.clone(),
        };
        let orchestrator = Self {
            plan,
            settings,
            state,
            ready_tx,
            events: events_tx,
            cancel,
            routes,
        };
        (orchestrator, handle)
    }

    /// Run until every process has settled and the state is `TERMINATED`.
    ///
    /// Returns the first failure of a process that reports a required service
    /// (spawn error or failing exit before teardown), after teardown finished.
    pub async fn run(mut self) -> Result<RunSummary, OrchestratorError> {
        if self.plan.is_empty() {
            return Err(OrchestratorError::EmptyPlan);
        }
        let plan = std::mem::take(&mut self.plan);

        let (out_tx, mut out_rx) = mpsc::channel(self.settings.event_buffer.max(1));
        let mut tracker = ReadinessTracker::new(self.settings.readiness.clone());
        let mut controllers: Vec<ProcessController> = Vec::new();
        let mut pending = FuturesUnordered::new();
        let mut first_failure: Option<OrchestratorError> = None;
        let mut summary = RunSummary::default();
        let mut logs: Vec<(String, CircularBuffer<String>)> = Vec::new();

        for spec in &plan {
            match self.spawn(spec, out_tx.clone()) {
                Ok(handle) => {
                    self.emit(OrchestratorEvent::Spawned {
                        process: spec.name.clone(),
                        pid: handle.pid(),
                        command: handle.command_line(),
                    })
                    .await;
                    controllers.push(handle.controller());
                    let name = spec.name.clone();
                    pending.push(async move { (name, handle.wait_settled().await) });
                }
                Err(source) => {
                    tracing::error!(
                        process = %spec.name,
                        error = %source,
                        "failed to start process"
                    );
                    let report = ProcessReport {
                        process: spec.name.clone(),
                        outcome: ExitOutcome::Failed(source.to_string()),
                        during_teardown: false,
                    };
                    self.report_exit(&mut summary, report).await;
                    first_failure = Some(OrchestratorError::ProcessFailed {
                        process: spec.name.clone(),
                        source,
                    });
                    break;
                }
            }
        }
        drop(out_tx);

        let grace = tokio::time::sleep(Duration::MAX);
        tokio::pin!(grace);
        let mut kill_sent = false;

        if first_failure.is_some() {
            self.begin_teardown(&controllers, grace.as_mut()).await;
        } else {
            self.check_all_ready(&tracker, &mut summary).await;
        }

        while !pending.is_empty() {
            let tearing_down = self.state.current() == AppState::Teardown;
            tokio::select! {
                biased;

                _ = self.cancel.cancelled(), if !tearing_down => {
                    tracing::info!("teardown requested");
                    self.begin_teardown(&controllers, grace.as_mut()).await;
                }
                Some(output) = out_rx.recv() => {
                    self.on_output(output, &mut tracker, &mut summary).await;
                }
                Some((name, settled)) = pending.next() => {
                    if let Some(buffer) = settled.log_buffer {
                        logs.push((name.clone(), buffer));
                    }
                    let during_teardown = self.state.current() == AppState::Teardown;
                    let outcome = match settled.result {
                        Ok(code) => {
                            tracing::info!(process = %name, code, "process completed");
                            ExitOutcome::Success(code)
                        }
                        Err(source) => {
                            let outcome = ExitOutcome::Failed(source.to_string());
                            if during_teardown {
                                tracing::debug!(
                                    process = %name,
                                    error = %source,
                                    "process stopped during teardown"
                                );
                            } else {
                                tracing::warn!(process = %name, error = %source, "process failed");
                                if first_failure.is_none() && self.is_required_process(&name) {
                                    first_failure = Some(OrchestratorError::ProcessFailed {
                                        process: name.clone(),
                                        source,
                                    });
                                    self.begin_teardown(&controllers, grace.as_mut()).await;
                                }
                            }
                            outcome
                        }
                    };
                    let report = ProcessReport { process: name, outcome, during_teardown };
                    self.report_exit(&mut summary, report).await;
                }
                _ = &mut grace, if tearing_down && !kill_sent => {
                    tracing::warn!(
                        grace = ?self.settings.teardown_grace,
                        "grace period elapsed, killing remaining processes"
                    );
                    for controller in &controllers {
                        controller.kill();
                    }
                    kill_sent = true;
                }
            }
        }

        // Every supervisor has settled, so all output senders are gone.
        while let Some(output) = out_rx.recv().await {
            self.on_output(output, &mut tracker, &mut summary).await;
        }

        self.begin_teardown(&controllers, grace.as_mut()).await;
        self.reap_groups(&controllers, grace.as_mut(), kill_sent)
            .await;
        self.state.finish()?;
        self.emit(OrchestratorEvent::StateChanged(AppState::Terminated))
            .await;

        summary.ready = tracker.ready_set().clone();
        let persisted = self.persist_logs(&logs);

        if let Some(err) = first_failure {
            if let Err(e) = persisted {
                tracing::warn!(error = %e, "failed to persist process logs");
            }
            return Err(err);
        }
        summary.log_files = persisted?;
        Ok(summary)
    }

    fn spawn(
        &self,
        spec: &ProcessSpec,
        forward: mpsc::Sender<ProcessOutput>,
    ) -> Result<ProcessHandle, SupervisorError> {
        let mut options = RunOptions::new()
            .name(spec.name.clone())
            .log_buffer(CircularBuffer::new(self.settings.log_capacity))
            .forward(forward);
        options.channel_capacity = self.settings.event_buffer;
        options.env = spec.env.clone();
        if let Some(ref cwd) = spec.cwd {
            options = options.current_dir(cwd);
        }
        if let Some(ref marker) = spec.lock_marker
            && !marker.is_empty()
        {
            options = options.lock_marker(marker.clone());
        }
        run_command(&spec.command, &spec.args, options)
    }

    async fn emit(&self, event: OrchestratorEvent) {
        // A dropped receiver just means nobody is rendering.
        let _ = self.events.send(event).await;
    }

    async fn report_exit(&self, summary: &mut RunSummary, report: ProcessReport) {
        self.emit(OrchestratorEvent::Exited {
            process: report.process.clone(),
            outcome: report.outcome.clone(),
            during_teardown: report.during_teardown,
        })
        .await;
        summary.exits.push(report);
    }

    fn is_required_process(&self, name: &str) -> bool {
        self.routes
            .get(name)
            .is_some_and(|services| services.iter().any(|s| self.settings.required.contains(s)))
    }

    async fn on_output(
        &self,
        output: ProcessOutput,
        tracker: &mut ReadinessTracker,
        summary: &mut RunSummary,
    ) {
        let candidates = self
            .routes
            .get(&*output.process)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let newly_ready = tracker.observe(candidates, &output.text);
        if !newly_ready.is_empty() {
            self.ready_tx.send_replace(tracker.ready_set().clone());
        }
        self.emit(OrchestratorEvent::Output(output)).await;
        for service in newly_ready {
            tracing::info!(%service, "service ready");
            self.emit(OrchestratorEvent::ServiceReady(service)).await;
        }
        self.check_all_ready(tracker, summary).await;
    }

    async fn check_all_ready(&self, tracker: &ReadinessTracker, summary: &mut RunSummary) {
        if tracker.covers(&self.settings.required) && self.state.mark_ready() {
            summary.reached_ready = true;
            self.emit(OrchestratorEvent::StateChanged(AppState::DockerReady))
                .await;
        }
    }

    /// Enter TEARDOWN, SIGTERM every process and arm the kill timer.
    async fn begin_teardown(&self, controllers: &[ProcessController], grace: Pin<&mut Sleep>) {
        if self.state.current() == AppState::Teardown {
            return;
        }
        if let Err(e) = self.state.begin_teardown() {
            tracing::warn!(error = %e, "cannot begin teardown");
            return;
        }
        self.emit(OrchestratorEvent::StateChanged(AppState::Teardown))
            .await;
        for controller in controllers {
            controller.terminate();
        }
        grace.reset(Instant::now() + self.settings.teardown_grace);
    }

    /// Wait until no process group outlives its leader.
    ///
    /// Descendants left behind by an exited launcher get SIGKILL once the
    /// grace period is over.
    async fn reap_groups(
        &self,
        controllers: &[ProcessController],
        mut grace: Pin<&mut Sleep>,
        mut kill_sent: bool,
    ) {
        let mut give_up = None;
        if kill_sent {
            for controller in controllers {
                controller.kill();
            }
            give_up = Some(Instant::now() + GROUP_KILL_WAIT);
        }

        loop {
            let alive: Vec<&ProcessController> =
                controllers.iter().filter(|c| c.group_alive()).collect();
            if alive.is_empty() {
                return;
            }
            if give_up.is_some_and(|at| Instant::now() >= at) {
                let names: Vec<&str> = alive.iter().map(|c| c.name()).collect();
                tracing::warn!(processes = ?names, "process groups still present after SIGKILL");
                return;
            }
            tokio::select! {
                _ = grace.as_mut(), if !kill_sent => {
                    tracing::warn!(
                        grace = ?self.settings.teardown_grace,
                        "grace period elapsed, killing leftover process groups"
                    );
                    for controller in &alive {
                        controller.kill();
                    }
                    kill_sent = true;
                    give_up = Some(Instant::now() + GROUP_KILL_WAIT);
                }
                _ = tokio::time::sleep(GROUP_POLL_INTERVAL) => {}
            }
        }
    }

    fn persist_logs(
        &self,
        logs: &[(String, CircularBuffer<String>)],
    ) -> Result<Vec<PathBuf>, OrchestratorError> {
        let Some(ref dir) = self.settings.log_dir else {
            return Ok(Vec::new());
        };
        let mut written = Vec::new();
        for (process, buffer) in logs {
            let path = write_process_log(dir, process, buffer).map_err(|source| {
                OrchestratorError::LogWriteFailed {
                    process: process.clone(),
                    path: dir.join(log_file_name(process)),
                    source,
                }
            })?;
            written.push(path);
        }
        Ok(written)
    }
}

fn log_file_name(process: &str) -> String {
    let safe: String = process
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}.log", safe)
}

fn write_process_log(
    dir: &Path,
    process: &str,
    buffer: &CircularBuffer<String>,
) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(log_file_name(process));
    let mut content = format!(
        "# {}: last {} lines, captured {}\n",
        process,
        buffer.len(),
        chrono::Local::now().to_rfc3339()
    );
    for line in buffer.iter() {
        content.push_str(line);
        content.push('\n');
    }
    std::fs::write(&path, content)?;
    Ok(path)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::supervisor::process::testing::{pid_alive, read_pid, wait_for_exit};
    use tempfile::tempdir;

    fn sh_process(name: &str, script: &str, services: &[Service]) -> ProcessSpec {
        ProcessSpec {
            name: name.to_string(),
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            cwd: None,
            env: Default::default(),
            lock_marker: None,
            services: services.to_vec(),
        }
    }

    fn settings(required: &[Service]) -> OrchestratorSettings {
        OrchestratorSettings {
            log_capacity: 32,
            teardown_grace: Duration::from_secs(5),
            event_buffer: 16,
            log_dir: None,
            readiness: ReadinessTable::default(),
            required: required.iter().copied().collect(),
        }
    }

    fn drain(handle: &mut OrchestratorHandle) -> tokio::task::JoinHandle<Vec<OrchestratorEvent>> {
        let mut events = handle.take_events().unwrap();
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(event) = events.recv().await {
                seen.push(event);
            }
            seen
        })
    }

    #[tokio::test]
    async fn test_ready_then_cancel_terminates() {
        let script = "echo 'database system is ready to accept connections'; \
                      echo 'Ready to accept connections'; sleep 30";
        let plan = vec![sh_process(
            "stack",
            script,
            &[Service::Postgres, Service::Redis],
        )];
        let (orchestrator, mut handle) =
            Orchestrator::new(plan, settings(&[Service::Postgres, Service::Redis]));
        let collected = drain(&mut handle);
        let mut state = handle.state_receiver();
        let run = tokio::spawn(orchestrator.run());

        tokio::time::timeout(
            Duration::from_secs(10),
            state.wait_for(|s| *s == AppState::DockerReady),
        )
        .await
        .expect("should become ready")
        .unwrap();
        assert!(handle.ready_services().contains(&Service::Postgres));

        handle.cancel();
        let summary = tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .expect("teardown should finish")
            .unwrap()
            .unwrap();

        assert_eq!(handle.state(), AppState::Terminated);
        assert!(summary.reached_ready);
        assert_eq!(summary.exits.len(), 1);
        assert!(summary.exits[0].during_teardown);

        let events = collected.await.unwrap();
        let states: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                OrchestratorEvent::StateChanged(s) => Some(*s),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![AppState::DockerReady, AppState::Teardown, AppState::Terminated]
        );
    }

    #[tokio::test]
    async fn test_required_failure_tears_down_others() {
        let plan = vec![
            sh_process("db", "echo starting; exit 3", &[Service::Postgres]),
            sh_process("cache", "sleep 30", &[Service::Redis]),
        ];
        let (orchestrator, mut handle) =
            Orchestrator::new(plan, settings(&[Service::Postgres, Service::Redis]));
        let _collected = drain(&mut handle);

        let result = tokio::time::timeout(Duration::from_secs(10), orchestrator.run())
            .await
            .expect("run should finish");
        match result {
            Err(OrchestratorError::ProcessFailed { process, source }) => {
                assert_eq!(process, "db");
                assert_eq!(source.exit_code(), Some(3));
            }
            other => panic!("Expected ProcessFailed, got {:?}", other),
        }
        assert_eq!(handle.state(), AppState::Terminated);
    }

    #[tokio::test]
    async fn test_optional_failure_does_not_abort() {
        let plan = vec![
            sh_process("helper", "exit 5", &[]),
            sh_process("cache", "echo 'Ready to accept connections'", &[Service::Redis]),
        ];
        let (orchestrator, handle) = Orchestrator::new(plan, settings(&[Service::Redis]));
        drop(handle);

        let summary = orchestrator.run().await.unwrap();
        assert!(summary.reached_ready);
        let helper = summary.exits.iter().find(|r| r.process == "helper").unwrap();
        assert!(!helper.outcome.is_success());
        assert!(!helper.during_teardown);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_fatal() {
        let mut spec = sh_process("ghost", "", &[Service::Postgres]);
        spec.command = "devstack-missing-binary".to_string();
        let (orchestrator, handle) = Orchestrator::new(vec![spec], settings(&[Service::Postgres]));
        drop(handle);

        let err = orchestrator.run().await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::ProcessFailed {
                source: SupervisorError::SpawnFailed { .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_empty_plan_rejected() {
        let (orchestrator, _handle) = Orchestrator::new(Vec::new(), settings(&[]));
        assert!(matches!(
            orchestrator.run().await,
            Err(OrchestratorError::EmptyPlan)
        ));
    }

    #[tokio::test]
    async fn test_grace_period_escalates_to_kill() {
        let script = "trap '' TERM; echo up; sleep 30";
        let plan = vec![sh_process("stubborn", script, &[])];
        let mut s = settings(&[]);
        s.teardown_grace = Duration::from_millis(200);
        let (orchestrator, handle) = Orchestrator::new(plan, s);
        let token = handle.cancel_token();
        drop(handle);

        let run = tokio::spawn(orchestrator.run());
        tokio::time::sleep(Duration::from_millis(300)).await;
        token.cancel();

        let summary = tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .expect("kill escalation should end the run")
            .unwrap()
            .unwrap();
        assert_eq!(summary.exits.len(), 1);
        assert!(!summary.exits[0].outcome.is_success());
    }

    #[tokio::test]
    async fn test_lock_marker_completion_and_log_persistence() {
        let dir = tempdir().unwrap();
        let mut spec = sh_process(
            "docker-watch",
            "echo 'Ready to accept connections'; echo 'Watch enabled'; exit 1",
            &[Service::Redis],
        );
        spec.lock_marker = Some("Watch enabled".to_string());
        let mut s = settings(&[Service::Redis]);
        s.log_dir = Some(dir.path().to_path_buf());
        let (orchestrator, handle) = Orchestrator::new(vec![spec], s);
        drop(handle);

        let summary = orchestrator.run().await.unwrap();
        assert_eq!(summary.exits[0].outcome, ExitOutcome::Success(1));
        assert_eq!(summary.log_files, vec![dir.path().join("docker-watch.log")]);
        let content = std::fs::read_to_string(&summary.log_files[0]).unwrap();
        assert!(content.contains("Watch enabled"));
    }

    async fn run_with_background_sleep(script: &str) -> (tempfile::TempDir, i32) {
        let dir = tempdir().unwrap();
        let mut spec = sh_process("launcher", script, &[]);
        spec.cwd = Some(dir.path().to_path_buf());
        let (orchestrator, handle) = Orchestrator::new(vec![spec], settings(&[]));

        let summary = tokio::time::timeout(Duration::from_secs(20), orchestrator.run())
            .await
            .expect("run should finish")
            .unwrap();
        assert_eq!(handle.state(), AppState::Terminated);
        assert_eq!(summary.exits[0].outcome, ExitOutcome::Success(0));

        let pid = read_pid(&dir.path().join("bg.pid"));
        (dir, pid)
    }

    #[tokio::test]
    async fn test_teardown_kills_descendants_holding_pipes() {
        let (_dir, pid) =
            run_with_background_sleep("sleep 300 & echo $! > bg.pid; echo started").await;
        assert!(
            wait_for_exit(pid, Duration::from_secs(5)).await,
            "background sleep {} alive after TERMINATED",
            pid
        );
    }

    #[tokio::test]
    async fn test_teardown_kills_detached_descendants() {
        let (_dir, pid) =
            run_with_background_sleep("sleep 300 >/dev/null 2>&1 & echo $! > bg.pid").await;
        assert!(!pid_alive(pid), "background sleep {} alive after TERMINATED", pid);
    }

    #[tokio::test]
    async fn test_process_failure_wins_over_log_write_failure() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();

        let plan = vec![sh_process("db", "echo starting; exit 3", &[Service::Postgres])];
        let mut s = settings(&[Service::Postgres]);
        s.log_dir = Some(blocker.join("logs"));
        let (orchestrator, handle) = Orchestrator::new(plan, s);
        drop(handle);

        match orchestrator.run().await {
            Err(OrchestratorError::ProcessFailed { process, .. }) => assert_eq!(process, "db"),
            other => panic!("Expected ProcessFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_log_file_name_sanitizes() {
        assert_eq!(log_file_name("web server/1"), "web_server_1.log");
        assert_eq!(log_file_name("docker-watch"), "docker-watch.log");
    }
}
