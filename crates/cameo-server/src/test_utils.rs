//! Test helpers for driving the server without real processes
//!
//! Enabled for this crate's own tests and, through the `test-helpers`
//! feature, for integration tests elsewhere in the workspace.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use cameo_core::prelude::*;

use crate::process::{LaunchSpec, Launcher, ProcessHandle};

/// A scripted process. It runs until [`FakeProcess::exit`] or a kill.
#[derive(Debug)]
pub struct FakeProcess {
    spec: LaunchSpec,
    pid: u32,
    exit_tx: Mutex<Option<oneshot::Sender<Option<i32>>>>,
    killed: Arc<AtomicBool>,
}

impl FakeProcess {
    pub fn spec(&self) -> &LaunchSpec {
        &self.spec
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Make the process exit with `code`. Ignored if it already ended.
    pub fn exit(&self, code: i32) {
        if let Some(tx) = self.exit_tx.lock().ok().and_then(|mut tx| tx.take()) {
            let _ = tx.send(Some(code));
        }
    }

    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

/// Launcher that hands out [`FakeProcess`]es and records every launch.
#[derive(Debug, Default)]
pub struct FakeLauncher {
    next_pid: AtomicU32,
    exit_codes: Mutex<HashMap<String, i32>>,
    launched: Mutex<Vec<Arc<FakeProcess>>>,
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_pid: AtomicU32::new(1000),
            ..Default::default()
        })
    }

    /// Processes started with `command` exit immediately with `code`.
    pub fn exits_with(&self, command: impl Into<String>, code: i32) {
        if let Ok(mut codes) = self.exit_codes.lock() {
            codes.insert(command.into(), code);
        }
    }

    pub fn launched(&self) -> Vec<Arc<FakeProcess>> {
        self.launched
            .lock()
            .map(|launched| launched.clone())
            .unwrap_or_default()
    }

    pub fn last(&self) -> Option<Arc<FakeProcess>> {
        self.launched().pop()
    }
}

impl Launcher for FakeLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<ProcessHandle> {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (handle, mut reporter) = ProcessHandle::new(Some(pid));
        let (exit_tx, exit_rx) = oneshot::channel();
        let killed = Arc::new(AtomicBool::new(false));

        let process = Arc::new(FakeProcess {
            spec: spec.clone(),
            pid,
            exit_tx: Mutex::new(Some(exit_tx)),
            killed: Arc::clone(&killed),
        });

        let immediate = self
            .exit_codes
            .lock()
            .ok()
            .and_then(|codes| codes.get(&spec.command).copied());
        if let Some(code) = immediate {
            process.exit(code);
        }

        tokio::spawn(async move {
            let code = tokio::select! {
                Ok(code) = exit_rx => code,
                _ = reporter.kill_requested() => {
                    killed.store(true, Ordering::SeqCst);
                    None
                }
            };
            reporter.report(code);
        });

        debug!("Fake launch of {} as pid {}", spec.command, pid);
        if let Ok(mut launched) = self.launched.lock() {
            launched.push(process);
        }
        Ok(handle)
    }
}
