use super::output::{OutputChunk, ProcessOutput, StreamKind, chunk_lines, spawn_reader};
use crate::errors::{SupervisorError, command_line};
use crate::log_buffer::CircularBuffer;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Completion value reported when the lock marker was seen, whatever the exit code.
pub const LOCK_EXIT_CODE: i32 = 1;

/// Default depth of the reader → supervisor channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// How long to keep draining pipes after the child exited.
///
/// A grandchild may hold the pipes open past the child's exit.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Synchronous per-chunk callback.
pub type OutputCallback = Box<dyn FnMut(StreamKind, &str) + Send + 'static>;

/// Options for [`run_command`].
pub struct RunOptions {
    /// Label used in forwarded output and logs (defaults to the command).
    pub name: Option<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub on_data: Option<OutputCallback>,
    pub log_buffer: Option<CircularBuffer<String>>,
    /// Substring that turns any exit into success with [`LOCK_EXIT_CODE`].
    pub lock_marker: Option<String>,
    /// Bounded channel receiving every non-blank line, tagged with `name`.
    pub forward: Option<mpsc::Sender<ProcessOutput>>,
    pub channel_capacity: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            name: None,
            cwd: None,
            env: BTreeMap::new(),
            on_data: None,
            log_buffer: None,
            lock_marker: None,
            forward: None,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn current_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn on_data(mut self, callback: impl FnMut(StreamKind, &str) + Send + 'static) -> Self {
        self.on_data = Some(Box::new(callback));
        self
    }

    pub fn log_buffer(mut self, buffer: CircularBuffer<String>) -> Self {
        self.log_buffer = Some(buffer);
        self
    }

    pub fn lock_marker(mut self, marker: impl Into<String>) -> Self {
        self.lock_marker = Some(marker.into());
        self
    }

    pub fn forward(mut self, tx: mpsc::Sender<ProcessOutput>) -> Self {
        self.forward = Some(tx);
        self
    }
}

/// How a supervised process settled, with its log buffer in either case.
#[derive(Debug)]
pub struct Settled {
    pub result: Result<i32, SupervisorError>,
    pub log_buffer: Option<CircularBuffer<String>>,
}

/// Successful settlement of a supervised process.
#[derive(Debug)]
pub struct Completion {
    /// 0 for a clean exit, [`LOCK_EXIT_CODE`] when the lock marker was seen
    pub code: i32,
    /// The buffer passed in through [`RunOptions::log_buffer`], handed back
    pub log_buffer: Option<CircularBuffer<String>>,
}

#[derive(Debug, Clone, Copy)]
enum Control {
    Terminate,
    Kill,
}

/// Cloneable control side of a supervised process.
///
/// On unix the child leads its own process group, and signals go to the
/// whole group. They keep working after the leader has been reaped, so
/// descendants it left behind are still reachable.
#[derive(Debug, Clone)]
pub struct ProcessController {
    name: Arc<str>,
    pid: Option<u32>,
    /// Process group id recorded at spawn; equal to the leader's pid.
    pgid: Option<u32>,
    tx: mpsc::UnboundedSender<Control>,
}

impl ProcessController {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the process (group) to stop: SIGTERM on unix, a hard kill elsewhere.
    pub fn terminate(&self) {
        self.request(Control::Terminate);
    }

    /// Forcibly kill the process (group).
    pub fn kill(&self) {
        self.request(Control::Kill);
    }

    /// Whether any member of the process group is still around.
    ///
    /// Always false off unix, where only the child itself is tracked.
    pub fn group_alive(&self) -> bool {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid {
            return match signal_group(pgid, 0) {
                Ok(()) => true,
                Err(e) => e.raw_os_error() == Some(libc::EPERM),
            };
        }
        false
    }

    fn request(&self, request: Control) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid {
            match signal_group(pgid, request.signal()) {
                Ok(()) => {
                    tracing::debug!(
                        process = %self.name,
                        pgid,
                        ?request,
                        "signalled process group"
                    );
                    return;
                }
                // Group is empty: the leader and every descendant are gone.
                Err(e) if e.raw_os_error() == Some(libc::ESRCH) => return,
                Err(e) => {
                    tracing::debug!(process = %self.name, pgid, error = %e, "group signal failed");
                }
            }
        }
        // Fallback: the supervising task kills the child directly, if it still runs.
        let _ = self.tx.send(request);
    }
}

/// A running child process plus the task supervising it.
pub struct ProcessHandle {
    command: String,
    args: Vec<String>,
    controller: ProcessController,
    task: JoinHandle<Settled>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("command", &self.command)
            .field("args", &self.args)
            .field("pid", &self.controller.pid)
            .finish()
    }
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.controller.pid
    }

    pub fn name(&self) -> &str {
        self.controller.name()
    }

    pub fn command_line(&self) -> String {
        command_line(&self.command, &self.args)
    }

    pub fn controller(&self) -> ProcessController {
        self.controller.clone()
    }

    pub fn terminate(&self) {
        self.controller.terminate();
    }

    /// Wait for the process to settle.
    pub async fn wait(self) -> Result<Completion, SupervisorError> {
        let settled = self.wait_settled().await;
        settled.result.map(|code| Completion {
            code,
            log_buffer: settled.log_buffer,
        })
    }

    /// Like [`wait`](Self::wait), but hands the log buffer back on failure too.
    pub async fn wait_settled(self) -> Settled {
        match self.task.await {
            Ok(settled) => settled,
            Err(e) => {
                tracing::error!(
                    process = %self.controller.name,
                    error = %e,
                    "supervisor task failed"
                );
                Settled {
                    result: Err(SupervisorError::SupervisorLost {
                        command: self.command,
                    }),
                    log_buffer: None,
                }
            }
        }
    }
}

/// Start `command` with `args` and supervise it.
///
/// Spawn failures are returned immediately. Otherwise the returned handle
/// settles once the process exited and its pipes were drained:
/// - lock marker found in the log buffer → `Ok` with [`LOCK_EXIT_CODE`]
/// - exit code 0 → `Ok` with 0
/// - any other exit code → [`SupervisorError::NonZeroExit`]
/// - killed by a signal → [`SupervisorError::Signalled`]
pub fn run_command(
    command: &str,
    args: &[String],
    options: RunOptions,
) -> Result<ProcessHandle, SupervisorError> {
    let mut cmd = Command::new(command);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(ref cwd) = options.cwd {
        cmd.current_dir(cwd);
    }
    cmd.envs(&options.env);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|source| SupervisorError::SpawnFailed {
        command: command.to_string(),
        source,
    })?;

    let name: Arc<str> = Arc::from(options.name.as_deref().unwrap_or(command));
    let pid = child.id();
    // process_group(0) makes the child a group leader with pgid == pid.
    let pgid = if cfg!(unix) { pid } else { None };
    tracing::info!(process = %name, pid, command = %command_line(command, args), "process spawned");

    let (chunk_tx, chunk_rx) = mpsc::channel(options.channel_capacity.max(1));
    if let Some(stdout) = child.stdout.take() {
        spawn_reader(stdout, StreamKind::Stdout, chunk_tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_reader(stderr, StreamKind::Stderr, chunk_tx.clone());
    }
    drop(chunk_tx);

    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let supervisor = Supervisor {
        name: name.clone(),
        command: command.to_string(),
        args: args.to_vec(),
        pgid,
        options,
    };
    let task = tokio::spawn(supervisor.run(child, chunk_rx, control_rx));

    Ok(ProcessHandle {
        command: command.to_string(),
        args: args.to_vec(),
        controller: ProcessController {
            name,
            pid,
            pgid,
            tx: control_tx,
        },
        task,
    })
}

/// State owned by the supervising task. Only this task touches the buffer.
struct Supervisor {
    name: Arc<str>,
    command: String,
    args: Vec<String>,
    pgid: Option<u32>,
    options: RunOptions,
}

impl Supervisor {
    async fn run(
        mut self,
        child: Child,
        chunks: mpsc::Receiver<OutputChunk>,
        control: mpsc::UnboundedReceiver<Control>,
    ) -> Settled {
        let exit = self.drive(child, chunks, control).await;
        let result = exit.and_then(|status| self.classify(status));
        Settled {
            result,
            log_buffer: self.options.log_buffer,
        }
    }

    /// Pump output and control requests until the child exited and its pipes drained.
    async fn drive(
        &mut self,
        mut child: Child,
        mut chunks: mpsc::Receiver<OutputChunk>,
        mut control: mpsc::UnboundedReceiver<Control>,
    ) -> Result<ExitStatus, SupervisorError> {
        let mut status: Option<ExitStatus> = None;
        let mut output_open = true;
        let drain_deadline = tokio::time::sleep(Duration::MAX);
        tokio::pin!(drain_deadline);

        while status.is_none() || output_open {
            tokio::select! {
                chunk = chunks.recv(), if output_open => match chunk {
                    Some(chunk) => self.handle_chunk(chunk).await,
                    None => output_open = false,
                },
                exit = child.wait(), if status.is_none() => {
                    let exit = exit.map_err(|source| SupervisorError::WaitFailed {
                        command: self.command.clone(),
                        source,
                    })?;
                    tracing::debug!(process = %self.name, code = ?exit.code(), "process exited");
                    status = Some(exit);
                    drain_deadline
                        .as_mut()
                        .reset(tokio::time::Instant::now() + OUTPUT_DRAIN_TIMEOUT);
                }
                Some(request) = control.recv() => {
                    kill_child(&mut child, request, &self.name);
                }
                _ = &mut drain_deadline, if status.is_some() && output_open => {
                    tracing::warn!(
                        process = %self.name,
                        "pipes still open after exit, killing leftover process group"
                    );
                    self.kill_group();
                    break;
                }
            }
        }

        // The loop only ends once an exit status was recorded.
        status.ok_or_else(|| SupervisorError::SupervisorLost {
            command: self.command.clone(),
        })
    }

    /// SIGKILL whatever is left of the group once the leader is gone.
    fn kill_group(&self) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid
            && let Err(e) = signal_group(pgid, libc::SIGKILL)
            && e.raw_os_error() != Some(libc::ESRCH)
        {
            tracing::warn!(process = %self.name, pgid, error = %e, "failed to kill process group");
        }
    }

    async fn handle_chunk(&mut self, chunk: OutputChunk) {
        if let Some(ref mut callback) = self.options.on_data {
            callback(chunk.stream, &chunk.text);
        }
        if let Some(ref mut buffer) = self.options.log_buffer {
            for line in chunk_lines(&chunk.text) {
                buffer.enqueue(line.to_string());
            }
        }
        if let Some(ref tx) = self.options.forward {
            for line in chunk_lines(&chunk.text) {
                let output = ProcessOutput {
                    process: self.name.clone(),
                    stream: chunk.stream,
                    text: line.to_string(),
                };
                if tx.send(output).await.is_err() {
                    tracing::debug!(
                        process = %self.name,
                        "output receiver dropped, no longer forwarding"
                    );
                    self.options.forward = None;
                    break;
                }
            }
        }
    }

    fn classify(&self, status: ExitStatus) -> Result<i32, SupervisorError> {
        let lock_seen = match (&self.options.lock_marker, &self.options.log_buffer) {
            (Some(marker), Some(buffer)) => buffer.contains_substring(marker),
            _ => false,
        };

        if lock_seen {
            tracing::info!(
                process = %self.name,
                code = ?status.code(),
                "lock marker seen, treating exit as success"
            );
            return Ok(LOCK_EXIT_CODE);
        }

        match status.code() {
            Some(0) => Ok(0),
            Some(code) => Err(SupervisorError::NonZeroExit {
                command: self.command.clone(),
                args: self.args.clone(),
                code,
            }),
            None => Err(SupervisorError::Signalled {
                command: self.command.clone(),
                args: self.args.clone(),
            }),
        }
    }
}

impl Control {
    #[cfg(unix)]
    fn signal(self) -> libc::c_int {
        match self {
            Control::Terminate => libc::SIGTERM,
            Control::Kill => libc::SIGKILL,
        }
    }
}

/// Send `signal` to every member of process group `pgid`.
///
/// A group id is not reused while any member is alive, and ESRCH reports
/// an empty group.
#[cfg(unix)]
fn signal_group(pgid: u32, signal: libc::c_int) -> std::io::Result<()> {
    // SAFETY: kill(2) has no memory-safety preconditions. A negative pid
    // addresses the group the child leads, never the caller's own group.
    let rc = unsafe { libc::kill(-(pgid as libc::pid_t), signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Kill the child itself; used when the group could not be signalled.
fn kill_child(child: &mut Child, request: Control, name: &str) {
    // `id()` is None once the child was reaped, so a recycled pid is never signalled.
    let Some(pid) = child.id() else {
        return;
    };
    tracing::debug!(process = %name, pid, ?request, "killing child directly");
    if let Err(e) = child.start_kill() {
        tracing::warn!(process = %name, pid, error = %e, "failed to kill process");
    }
}
