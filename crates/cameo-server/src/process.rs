//! Process collaborator
//!
//! A [`Launcher`] turns a [`LaunchSpec`] into a [`ProcessHandle`]. The handle
//! never owns the OS child directly: the child is moved into a background
//! wait task, and the handle only keeps a kill channel plus shared exit state.
//! That lets the lifecycle task check `is_alive()` synchronously and await
//! exit without holding a lock across `.await`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Notify};

use cameo_core::prelude::*;

/// Everything needed to start a process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_directory: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }
}

/// Starts processes.
#[cfg_attr(test, mockall::automock)]
pub trait Launcher: Send + Sync + 'static {
    fn launch(&self, spec: &LaunchSpec) -> Result<ProcessHandle>;
}

#[derive(Default)]
struct ExitState {
    exited: AtomicBool,
    code: Mutex<Option<i32>>,
    notify: Notify,
}

impl ExitState {
    fn code(&self) -> Option<i32> {
        self.code.lock().ok().and_then(|code| *code)
    }
}

/// Handle on a started process.
pub struct ProcessHandle {
    pid: Option<u32>,
    /// Consumed on first kill (or when the handle is dropped).
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    state: Arc<ExitState>,
}

/// Owned by whoever watches the real process; reports its exit to the handle.
pub struct ExitReporter {
    state: Arc<ExitState>,
    kill_rx: oneshot::Receiver<()>,
}

impl ExitReporter {
    /// Resolves once a kill is requested or the handle is dropped.
    pub async fn kill_requested(&mut self) {
        let _ = (&mut self.kill_rx).await;
    }

    /// Mark the process as exited and wake every waiter.
    pub fn report(self, code: Option<i32>) {
        if let Ok(mut slot) = self.state.code.lock() {
            *slot = code;
        }
        self.state.exited.store(true, Ordering::Release);
        self.state.notify.notify_waiters();
    }
}

impl ProcessHandle {
    /// Create a handle and the reporter that completes it.
    pub fn new(pid: Option<u32>) -> (Self, ExitReporter) {
        let state = Arc::new(ExitState::default());
        let (kill_tx, kill_rx) = oneshot::channel();
        let handle = Self {
            pid,
            kill_tx: Mutex::new(Some(kill_tx)),
            state: Arc::clone(&state),
        };
        (handle, ExitReporter { state, kill_rx })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        !self.state.exited.load(Ordering::Acquire)
    }

    /// Exit code once the process has exited; `None` while alive or if killed by a signal.
    pub fn exit_code(&self) -> Option<i32> {
        self.state.code()
    }

    /// Ask the wait task to kill the process. Idempotent.
    pub fn destroy_forcibly(&self) {
        let tx = self.kill_tx.lock().ok().and_then(|mut tx| tx.take());
        if let Some(tx) = tx {
            warn!("Force killing process {:?}", self.pid);
            // The wait task may already be gone if the process exited on its own.
            let _ = tx.send(());
        }
    }

    /// Wait for the process to exit and return its exit code.
    pub async fn wait(&self) -> Option<i32> {
        // Create the `notified()` future before checking the flag so an exit
        // between the check and the await cannot be missed.
        let notified = self.state.notify.notified();
        if !self.is_alive() {
            return self.exit_code();
        }
        notified.await;
        self.exit_code()
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Launches real OS processes with tokio.
#[derive(Debug, Clone, Default)]
pub struct CommandLauncher;

impl CommandLauncher {
    fn resolve(command: &str) -> Result<PathBuf> {
        if command.contains(std::path::MAIN_SEPARATOR) {
            return Ok(PathBuf::from(command));
        }
        which::which(command).map_err(|e| Error::ProcessSpawn {
            reason: format!("'{command}' not found: {e}"),
        })
    }

    /// Background task: owns `child` and reports its exit.
    ///
    /// Ends either when the process exits on its own, or after a requested
    /// kill has been carried out and the child reaped.
    async fn wait_for_exit(mut child: Child, mut reporter: ExitReporter) {
        let pid = child.id();
        let code = tokio::select! {
            result = child.wait() => match result {
                Ok(status) => {
                    info!("Process {:?} exited with status: {:?}", pid, status);
                    status.code()
                }
                Err(e) => {
                    error!("Error waiting for process {:?}: {}", pid, e);
                    None
                }
            },
            _ = reporter.kill_requested() => {
                if let Err(e) = child.kill().await {
                    error!("Failed to kill process {:?}: {}", pid, e);
                }
                match child.wait().await {
                    Ok(status) => {
                        info!("Process {:?} killed, exit status: {:?}", pid, status);
                        status.code()
                    }
                    Err(e) => {
                        error!("Error waiting after kill: {}", e);
                        None
                    }
                }
            }
        };

        reporter.report(code);
    }
}

impl Launcher for CommandLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<ProcessHandle> {
        let program = Self::resolve(&spec.command)?;
        info!("Spawning: {} {}", program.display(), spec.args.join(" "));

        let mut command = Command::new(&program);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_directory {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|e| Error::ProcessSpawn {
            reason: format!("{}: {}", program.display(), e),
        })?;

        let (handle, reporter) = ProcessHandle::new(child.id());
        info!("Process started with PID: {:?}", handle.pid());
        tokio::spawn(Self::wait_for_exit(child, reporter));
        Ok(handle)
    }
}
