//! Toolbox - External Tool Invocation
//!
//! Tools run from an argv vector, never through a shell. The search path and
//! environment come from an explicit `ToolEnvironment`, never from the host
//! process. The public API blocks; a current-thread runtime multiplexes the
//! output pipes, the deadline and the cancellation token.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};

/// Lines of output kept for error reports.
pub const TAIL_LINES: usize = 40;

/// How long to wait for output pipes after the tool was killed.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Host variables passed on together with the host `PATH`.
const INHERITED_VARS: &[&str] = &["HOME", "USER", "LANG", "TMPDIR"];

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool '{tool}' not found in {searched:?}")]
    ToolNotFound { tool: String, searched: Vec<PathBuf> },

    #[error("Tool '{tool}' failed with exit code {}", exit_code.map_or("none (signal)".to_string(), |c| c.to_string()))]
    ToolFailure {
        tool: String,
        exit_code: Option<i32>,
        tail: Vec<String>,
        log: PathBuf,
    },

    #[error("Tool '{tool}' exceeded its {limit:?} time limit")]
    Timeout {
        tool: String,
        limit: Duration,
        tail: Vec<String>,
        log: PathBuf,
    },

    #[error("Tool '{tool}' was cancelled")]
    Cancelled { tool: String, log: PathBuf },

    #[error("I/O error while running '{tool}': {source}")]
    Io {
        tool: String,
        #[source]
        source: std::io::Error,
    },
}

/// Explicit tool environment: installation directories plus fixed variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolEnvironment {
    pub search_path: Vec<PathBuf>,
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    /// Also search (and pass on) the host `PATH` and `INHERITED_VARS`.
    #[serde(default)]
    pub inherit_path: bool,
}

impl ToolEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.search_path.push(dir.into());
        self
    }

    pub fn with_var(mut self, name: &str, value: &str) -> Self {
        self.vars.insert(name.to_string(), value.to_string());
        self
    }

    pub fn inheriting_path(mut self) -> Self {
        self.inherit_path = true;
        self
    }

    fn directories(&self) -> Vec<PathBuf> {
        let mut dirs = self.search_path.clone();
        if self.inherit_path {
            if let Some(host) = std::env::var_os("PATH") {
                dirs.extend(std::env::split_paths(&host));
            }
        }
        dirs
    }

    /// The `PATH` handed to tools.
    pub fn path_var(&self) -> OsString {
        std::env::join_paths(self.directories()).unwrap_or_default()
    }

    /// Every variable a tool starts with, apart from per-invocation ones.
    pub fn variables(&self) -> Vec<(OsString, OsString)> {
        let mut vars = vec![(OsString::from("PATH"), self.path_var())];
        if self.inherit_path {
            vars.extend(
                INHERITED_VARS
                    .iter()
                    .filter_map(|name| std::env::var_os(name).map(|value| (OsString::from(name), value))),
            );
        }
        vars.extend(self.vars.iter().map(|(k, v)| (OsString::from(k), OsString::from(v))));
        vars
    }

    /// Resolve a tool name to an executable file.
    pub fn resolve(&self, tool: &str) -> Result<PathBuf, ToolError> {
        let direct = Path::new(tool);
        if direct.components().count() > 1 || direct.is_absolute() {
            return if is_executable(direct) {
                Ok(direct.to_path_buf())
            } else {
                Err(ToolError::ToolNotFound { tool: tool.to_string(), searched: vec![] })
            };
        }

        let dirs = self.directories();
        dirs.iter()
            .map(|d| d.join(tool))
            .find(|candidate| is_executable(candidate))
            .ok_or_else(|| ToolError::ToolNotFound { tool: tool.to_string(), searched: dirs })
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Cloneable cancellation signal shared between a run and its caller.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // the sender lives as long as `self`, so `changed` cannot fail here
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// One tool invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub tool: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub timeout: Duration,
    pub env: BTreeMap<String, String>,
    pub log_path: PathBuf,
}

impl Invocation {
    pub fn new(tool: &str, working_dir: impl Into<PathBuf>, log_path: impl Into<PathBuf>) -> Self {
        Self {
            tool: tool.to_string(),
            args: vec![],
            working_dir: working_dir.into(),
            timeout: Duration::from_secs(3600),
            env: BTreeMap::new(),
            log_path: log_path.into(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, name: &str, value: &str) -> Self {
        self.env.insert(name.to_string(), value.to_string());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub exit_code: i32,
    pub runtime: Duration,
    pub log_path: PathBuf,
    pub tail: Vec<String>,
}

enum Ending {
    Exited(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

/// Runs tools inside a fixed environment.
#[derive(Debug, Clone)]
pub struct Toolbox {
    env: ToolEnvironment,
    spawned: Arc<AtomicUsize>,
}

impl Toolbox {
    pub fn new(env: ToolEnvironment) -> Self {
        Self { env, spawned: Arc::new(AtomicUsize::new(0)) }
    }

    pub fn environment(&self) -> &ToolEnvironment {
        &self.env
    }

    /// Number of processes this toolbox has spawned.
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    /// Run a tool to completion, blocking the calling thread.
    pub fn run(&self, invocation: &Invocation, cancel: &CancelToken) -> Result<ToolOutput, ToolError> {
        let io_err = |source| ToolError::Io { tool: invocation.tool.clone(), source };
        let program = self.env.resolve(&invocation.tool)?;
        if cancel.is_cancelled() {
            return Err(ToolError::Cancelled {
                tool: invocation.tool.clone(),
                log: invocation.log_path.clone(),
            });
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(io_err)?;
        runtime.block_on(self.run_async(program, invocation, cancel))
    }

    async fn run_async(
        &self,
        program: PathBuf,
        invocation: &Invocation,
        cancel: &CancelToken,
    ) -> Result<ToolOutput, ToolError> {
        let tool = invocation.tool.clone();
        let io_err = |source| ToolError::Io { tool: tool.clone(), source };

        let mut cmd = Command::new(&program);
        cmd.args(&invocation.args)
            .current_dir(&invocation.working_dir)
            .env_clear()
            .envs(self.env.variables())
            .envs(&invocation.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        tracing::debug!(tool = %invocation.tool, program = %program.display(), args = ?invocation.args, "spawning tool");
        let started = Instant::now();
        let mut child = cmd.spawn().map_err(io_err)?;
        self.spawned.fetch_add(1, Ordering::SeqCst);
        let pid = child.id();

        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(TAIL_LINES)));
        let writer = tokio::spawn(write_log(invocation.log_path.clone(), rx, Arc::clone(&tail)));
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx.clone()));
        }
        drop(tx);

        let ending = tokio::select! {
            status = child.wait() => Ending::Exited(status.map_err(io_err)?),
            _ = tokio::time::sleep(invocation.timeout) => Ending::TimedOut,
            _ = cancel.cancelled() => Ending::Cancelled,
        };

        if !matches!(ending, Ending::Exited(_)) {
            kill_tree(pid, &mut child).await;
        }

        let log_result = match tokio::time::timeout(DRAIN_GRACE, writer).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(std::io::Error::other(join)),
            Err(_) => Ok(()),
        };
        log_result.map_err(io_err)?;

        let tail: Vec<String> = tail.lock().map(|t| t.iter().cloned().collect()).unwrap_or_default();
        let runtime = started.elapsed();
        let log = invocation.log_path.clone();

        match ending {
            Ending::Exited(status) if status.success() => Ok(ToolOutput {
                exit_code: 0,
                runtime,
                log_path: log,
                tail,
            }),
            Ending::Exited(status) => Err(ToolError::ToolFailure {
                tool,
                exit_code: status.code(),
                tail,
                log,
            }),
            Ending::TimedOut => {
                tracing::warn!(tool = %invocation.tool, limit = ?invocation.timeout, "tool timed out, process group killed");
                Err(ToolError::Timeout { tool, limit: invocation.timeout, tail, log })
            }
            Ending::Cancelled => {
                tracing::warn!(tool = %invocation.tool, "tool cancelled, process group killed");
                Err(ToolError::Cancelled { tool, log })
            }
        }
    }
}

/// Forward output lines until EOF. Bytes that are not UTF-8 are replaced,
/// never a reason to stop reading: a closed pipe would kill the tool.
async fn forward_lines<R>(stream: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                }
                let _ = tx.send(String::from_utf8_lossy(&buf).into_owned());
            }
            Err(e) => {
                tracing::warn!(error = %e, "tool output stream failed");
                break;
            }
        }
    }
}

async fn write_log(
    path: PathBuf,
    mut rx: mpsc::UnboundedReceiver<String>,
    tail: Arc<Mutex<VecDeque<String>>>,
) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(&path).await?;
    while let Some(line) = rx.recv().await {
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        if let Ok(mut t) = tail.lock() {
            if t.len() == TAIL_LINES {
                t.pop_front();
            }
            t.push_back(line);
        }
    }
    file.flush().await
}

/// Kill the tool together with everything it spawned.
async fn kill_tree(pid: Option<u32>, child: &mut tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        // SAFETY: killpg only sends a signal; the group was created at spawn
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
    let _ = child.start_kill();
    let _ = child.wait().await;
}
