//! Instance lifecycle
//!
//! Every managed instance gets one lifecycle task. The task owns the
//! [`ProcessHandle`] and drives the registry through
//! STARTING -> RUNNING -> (STOPPING | KILLING) -> terminal, reacting to
//! process exit and to stop/kill requests signalled through the registry.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use cameo_core::messages::env;
use cameo_core::prelude::*;
use cameo_core::{ApplicationSummary, Endpoint, State};

use crate::config::{ApplicationConfig, ServerConfig, StartingTime};
use crate::process::{LaunchSpec, Launcher, ProcessHandle};
use crate::registry::{Admission, Registration, Registry, Signals, StopRequest};

/// Starts instances and supervises them until they terminate.
#[derive(Clone)]
pub struct Manager {
    registry: Arc<Registry>,
    launcher: Arc<dyn Launcher>,
    config: Arc<ServerConfig>,
    server_endpoint: Endpoint,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("server_endpoint", &self.server_endpoint)
            .field("applications", &self.config.applications.len())
            .finish_non_exhaustive()
    }
}

/// Resolves once `pred` holds, or at once if the registry forgot the instance.
async fn signalled(
    signals: &mut watch::Receiver<Signals>,
    pred: impl FnMut(&Signals) -> bool,
) -> bool {
    signals.wait_for(pred).await.is_ok()
}

/// The stop request that ended RUNNING. A vanished instance is killed.
async fn stop_requested(signals: &mut watch::Receiver<Signals>) -> StopRequest {
    match signals.wait_for(|s| s.stop.is_some()).await {
        Ok(s) => s.stop.unwrap_or(StopRequest::Kill),
        Err(_) => StopRequest::Kill,
    }
}

impl Manager {
    pub fn new(
        registry: Arc<Registry>,
        launcher: Arc<dyn Launcher>,
        config: Arc<ServerConfig>,
        server_endpoint: Endpoint,
    ) -> Self {
        Self {
            registry,
            launcher,
            config,
            server_endpoint,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Configured applications with their live instance counts.
    pub fn apps(&self) -> Vec<ApplicationSummary> {
        self.config
            .applications
            .iter()
            .map(|app| ApplicationSummary {
                name: app.name.clone(),
                description: app.description.clone(),
                max_instances: app.max_instances,
                running: self.registry.count_named(&app.name),
            })
            .collect()
    }

    /// Register a new instance of `name` and spawn its lifecycle task.
    ///
    /// Returns once the instance is STARTING; the process is launched by the task.
    pub fn start(&self, name: &str, args: Vec<String>) -> Result<i32> {
        let app = self
            .config
            .find(name)
            .ok_or_else(|| Error::unknown_application(name))?
            .clone();

        let registration = self.registry.register(
            name,
            args.clone(),
            Admission {
                max_instances: app.max_instances,
            },
            true,
        )?;
        let id = registration.id;
        info!("Starting #{} {} {:?}", id, name, args);

        tokio::spawn(self.clone().supervise(app, args, registration));
        Ok(id)
    }

    pub fn stop(&self, id: i32) -> Result<()> {
        self.registry.request_stop(id, StopRequest::Stop)
    }

    pub fn kill(&self, id: i32) -> Result<()> {
        self.registry.request_stop(id, StopRequest::Kill)
    }

    /// Kill every instance and wait, bounded by the stopping time, for them to terminate.
    pub async fn shutdown(&self) {
        let ids = self.registry.live_ids();
        if ids.is_empty() {
            return;
        }
        info!("Killing {} instance(s)", ids.len());
        for id in ids {
            if let Err(e) = self.kill(id) {
                debug!("#{} already gone: {}", id, e);
            }
        }

        let polling = self.config.server.polling_time();
        let deadline = Duration::from_millis(self.config.server.stopping_time_ms).max(polling);
        let drained = tokio::time::timeout(deadline, async {
            while !self.registry.is_empty() {
                tokio::time::sleep(polling).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                "{} instance(s) still registered at shutdown",
                self.registry.live_ids().len()
            );
        }
    }

    fn launch_spec(&self, app: &ApplicationConfig, args: &[String], id: i32) -> LaunchSpec {
        let mut spec = LaunchSpec::new(app.command.clone());
        spec.args = app.args.iter().chain(args).cloned().collect();
        spec.env = app.env.clone();
        spec.env.insert(env::ID.to_string(), id.to_string());
        spec.env.insert(env::NAME.to_string(), app.name.clone());
        spec.env
            .insert(env::SERVER.to_string(), self.server_endpoint.to_string());
        spec.working_directory = app.working_directory.clone();
        spec
    }

    /// Lifecycle task body.
    async fn supervise(self, app: ApplicationConfig, args: Vec<String>, registration: Registration) {
        let Registration { id, mut signals } = registration;

        match self.drive(&app, &args, id, &mut signals).await {
            Ok(State::Failure) if app.restart => {
                warn!("#{} {} failed, restarting", id, app.name);
                if let Err(e) = self.start(&app.name, args) {
                    error!("Failed to restart {}: {}", app.name, e);
                }
            }
            Ok(state) => debug!("Lifecycle of #{} ended in {}", id, state),
            // The process handle is dropped here, which kills the process.
            Err(e) => warn!("Lifecycle of #{} aborted: {}", id, e),
        }
    }

    async fn drive(
        &self,
        app: &ApplicationConfig,
        args: &[String],
        id: i32,
        signals: &mut watch::Receiver<Signals>,
    ) -> Result<State> {
        let process = match self.launcher.launch(&self.launch_spec(app, args, id)) {
            Ok(process) => process,
            Err(e) => {
                error!("Failed to launch #{} {}: {}", id, app.name, e);
                self.registry.terminate(id, State::Failure, None)?;
                return Ok(State::Failure);
            }
        };
        self.registry.set_pid(id, process.pid())?;

        // STARTING
        let starting = async {
            let reported = signalled(signals, |s| s.running_reported || s.stop.is_some());
            match app.starting_time() {
                StartingTime::Reported => {
                    reported.await;
                }
                StartingTime::After(delay) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = reported => {}
                    }
                }
            }
        };
        tokio::select! {
            code = process.wait() => {
                if app.starting_time() != StartingTime::After(Duration::ZERO) {
                    warn!("#{} {} exited while starting", id, app.name);
                }
                return self.finish(app, id, false, code).await;
            }
            _ = starting => {}
        }

        let stop_pending = signals.borrow().stop.is_some();
        if !stop_pending {
            self.registry.set_state(id, State::Running)?;
            info!("#{} {} is RUNNING", id, app.name);
        }

        // RUNNING
        let request = tokio::select! {
            code = process.wait() => return self.finish(app, id, false, code).await,
            request = stop_requested(signals) => request,
        };

        if request == StopRequest::Stop {
            let grace = self
                .registry
                .stop_handler(id)?
                .map(|handler| {
                    if handler.is_zero() {
                        app.stopping_time(&self.config.server)
                    } else {
                        handler
                    }
                })
                .filter(|grace| !grace.is_zero());

            if let Some(grace) = grace {
                self.registry.set_state(id, State::Stopping)?;
                info!("#{} {} stopping, grace {:?}", id, app.name, grace);
                let killed = signalled(signals, |s| s.stop == Some(StopRequest::Kill));
                tokio::select! {
                    code = process.wait() => return self.finish(app, id, true, code).await,
                    _ = tokio::time::sleep(grace) => {
                        warn!("#{} {} must be killed due to stop timeout", id, app.name);
                    }
                    _ = killed => {}
                }
            }
        }

        self.kill_process(app, id, &process).await
    }

    async fn kill_process(
        &self,
        app: &ApplicationConfig,
        id: i32,
        process: &ProcessHandle,
    ) -> Result<State> {
        self.registry.set_state(id, State::Killing)?;
        process.destroy_forcibly();
        let code = process.wait().await;
        info!("#{} {} killed", id, app.name);
        self.registry.terminate(id, State::Killed, code)?;
        Ok(State::Killed)
    }

    /// The process exited by itself.
    async fn finish(
        &self,
        app: &ApplicationConfig,
        id: i32,
        stopping: bool,
        code: Option<i32>,
    ) -> Result<State> {
        if code == Some(0) {
            let state = if stopping {
                State::Stopped
            } else {
                State::Success
            };
            self.registry.terminate(id, state, code)?;
            return Ok(state);
        }

        info!("#{} {} returned error code {:?}", id, app.name, code);
        if let Some(command) = &app.error_command {
            self.registry.set_state(id, State::ProcessingFailure)?;
            self.run_error_command(command, app, id, code).await;
        }
        self.registry.terminate(id, State::Failure, code)?;
        Ok(State::Failure)
    }

    /// Run the configured error command with `<id> <exit code> <name>` and wait for it.
    async fn run_error_command(
        &self,
        command: &str,
        app: &ApplicationConfig,
        id: i32,
        code: Option<i32>,
    ) {
        let mut spec = LaunchSpec::new(command);
        spec.args = vec![
            id.to_string(),
            code.map_or_else(|| "-1".to_string(), |c| c.to_string()),
            app.name.clone(),
        ];
        spec.working_directory = app.working_directory.clone();

        match self.launcher.launch(&spec) {
            Ok(handler) => {
                let status = handler.wait().await;
                debug!("Error command for #{} exited with {:?}", id, status);
            }
            Err(e) => error!("Failed to run error command for #{}: {}", id, e),
        }
    }
}
