// Startup script supervision.
//
// launch() grants execute permission, spawns the script and forwards its
// output to the console while the HTTP server runs. The exit code is logged
// and recorded in the ScriptMonitor; nothing else reacts to it.

use anyhow::Context;
use serde::Serialize;
use std::collections::VecDeque;
use std::os::unix::process::ExitStatusExt;
use std::sync::Arc;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::ScriptConfig;
use crate::native::{file, process};

/// How long to wait for output forwarders once the script has exited.
/// Forwarders still running after that keep draining, unless the script
/// was stopped, in which case they are aborted.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    fn tag(self) -> &'static str {
        match self {
            Self::Stdout => "OUT",
            Self::Stderr => "ERR",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ScriptState {
    Pending,
    Running { pid: u32 },
    Exited { code: Option<i32>, signal: Option<i32> },
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ScriptStatus {
    pub script: String,
    #[serde(flatten)]
    pub state: ScriptState,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

/// Lifecycle state and recent output of the supervised script.
pub struct ScriptMonitor {
    status: RwLock<ScriptStatus>,
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl ScriptMonitor {
    pub fn new(script: &str, capacity: usize) -> Self {
        Self {
            status: RwLock::new(ScriptStatus {
                script: script.to_string(),
                state: ScriptState::Pending,
                started_at: None,
                finished_at: None,
            }),
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn snapshot(&self) -> ScriptStatus {
        self.status.read().await.clone()
    }

    async fn set_running(&self, pid: u32) {
        let mut status = self.status.write().await;
        status.state = ScriptState::Running { pid };
        status.started_at = Some(now_rfc3339());
    }

    async fn set_finished(&self, state: ScriptState) {
        let mut status = self.status.write().await;
        status.state = state;
        status.finished_at = Some(now_rfc3339());
    }

    pub async fn push_line(&self, stream: OutputStream, line: &str) {
        if self.capacity == 0 {
            return;
        }
        let mut lines = self.lines.lock().await;
        while lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(format!("[{}] {}", stream.tag(), line));
    }

    /// The newest `count` lines, oldest first.
    pub async fn recent_lines(&self, count: usize) -> Vec<String> {
        let lines = self.lines.lock().await;
        let skip = lines.len().saturating_sub(count);
        lines.iter().skip(skip).cloned().collect()
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "UnknownTime".to_string())
}

/// Handle to the background task running the script.
pub struct LaunchHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl LaunchHandle {
    /// Stop the script (SIGTERM, then SIGKILL after the grace period) and
    /// wait for supervision to finish. No-op for a script that already exited.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        self.join().await;
    }

    async fn join(self) {
        if let Err(e) = self.task.await {
            tracing::error!("Script supervision task panicked: {}", e);
        }
    }
}

pub fn launch(config: ScriptConfig, monitor: Arc<ScriptMonitor>) -> LaunchHandle {
    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        let label = config.label();
        if let Err(e) = supervise(&config, &monitor, stop_rx).await {
            tracing::error!(script = %label, "{:#}", e);
            monitor
                .set_finished(ScriptState::Failed { reason: format!("{:#}", e) })
                .await;
        }
    });
    LaunchHandle { stop: stop_tx, task }
}

async fn supervise(
    config: &ScriptConfig,
    monitor: &Arc<ScriptMonitor>,
    mut stop: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let label = config.label();
    let cwd = std::env::current_dir().context("Failed to read working directory")?;
    let script = config.resolve_path(&cwd);

    file::grant_execute(&script, config.mode)
        .await
        .with_context(|| format!("Failed to set executable permission for {}", label))?;
    tracing::info!(script = %label, mode = %format!("{:o}", config.mode), "Execute permission granted");

    let env = match &config.env_file {
        Some(path) => file::load_env_file(path).await?,
        None => Vec::new(),
    };
    if !env.is_empty() {
        tracing::debug!(script = %label, vars = env.len(), "Loaded env file");
    }

    let mut child = process::spawn_script(config, &script, &env)
        .with_context(|| format!("Failed to start {} process", label))?;
    let pid = child
        .id()
        .context("Child exited before its PID could be read")?;
    monitor.set_running(pid).await;
    tracing::info!(script = %label, pid, "Script started");

    let forwarders = spawn_forwarders(
        &mut child,
        &label,
        monitor,
        tokio::io::stdout(),
        tokio::io::stderr(),
    );

    let (status, stopped) = tokio::select! {
        status = child.wait() => (status.context("Failed to wait for script")?, false),
        _ = stop_requested(&mut stop) => {
            (terminate(&mut child, pid, &label, config.stop_grace_secs).await?, true)
        }
    };

    // Background children of the script may keep the pipes open
    for handle in forwarders {
        let abort = handle.abort_handle();
        if tokio::time::timeout(DRAIN_TIMEOUT, handle).await.is_err() && stopped {
            abort.abort();
        }
    }

    let code = status.code();
    let signal = status.signal();
    match (code, signal) {
        (Some(code), _) => tracing::info!(script = %label, "Script exited with code {}", code),
        (None, Some(sig)) => tracing::info!(script = %label, "Script terminated by signal {}", sig),
        (None, None) => tracing::info!(script = %label, "Script exited"),
    }
    if code != Some(0) && !stopped {
        tracing::warn!(script = %label, ?code, "Script exited with non-zero status");
    }

    monitor.set_finished(ScriptState::Exited { code, signal }).await;
    Ok(())
}

async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            // Sender gone without asking us to stop
            std::future::pending::<()>().await;
        }
    }
}

async fn terminate(
    child: &mut Child,
    pid: u32,
    label: &str,
    grace_secs: u64,
) -> anyhow::Result<std::process::ExitStatus> {
    tracing::info!(script = %label, pid, "Stopping script");
    if let Err(e) = process::signal_group(pid, false) {
        tracing::debug!(script = %label, "SIGTERM not delivered: {}", e);
    }

    match tokio::time::timeout(Duration::from_secs(grace_secs), child.wait()).await {
        Ok(status) => status.context("Failed to wait for script"),
        Err(_) => {
            tracing::warn!(script = %label, "Script did not stop within {}s, killing", grace_secs);
            if let Err(e) = process::signal_group(pid, true) {
                tracing::debug!(script = %label, "SIGKILL to group not delivered: {}", e);
            }
            let _ = child.kill().await;
            child.wait().await.context("Failed to reap killed script")
        }
    }
}

fn spawn_forwarders<O, E>(
    child: &mut Child,
    label: &str,
    monitor: &Arc<ScriptMonitor>,
    stdout_sink: O,
    stderr_sink: E,
) -> Vec<JoinHandle<()>>
where
    O: AsyncWrite + Unpin + Send + 'static,
    E: AsyncWrite + Unpin + Send + 'static,
{
    let mut handles = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        let label = label.to_string();
        let monitor = Arc::clone(monitor);
        handles.push(tokio::spawn(async move {
            forward_output(stdout, stdout_sink, OutputStream::Stdout, &label, &monitor).await;
        }));
    }
    if let Some(stderr) = child.stderr.take() {
        let label = label.to_string();
        let monitor = Arc::clone(monitor);
        handles.push(tokio::spawn(async move {
            forward_output(stderr, stderr_sink, OutputStream::Stderr, &label, &monitor).await;
        }));
    }
    handles
}

/// Copy one output stream of the script into `sink` line by line, prefixed
/// with `[<label> OUT]: ` or `[<label> ERR]: `. Returns the sink once the
/// stream ends.
async fn forward_output<R, W>(
    reader: R,
    mut sink: W,
    stream: OutputStream,
    label: &str,
    monitor: &ScriptMonitor,
) -> W
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        let line = match process::read_line_lossy(&mut reader, &mut buf).await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(script = %label, "Reading script {} failed: {}", stream.tag(), e);
                break;
            }
        };

        let rendered = format!("[{} {}]: {}\n", label, stream.tag(), line);
        if let Err(e) = sink.write_all(rendered.as_bytes()).await {
            tracing::debug!("Console write failed: {}", e);
        }
        monitor.push_line(stream, &line).await;
    }

    let _ = sink.flush().await;
    sink
}
