//! Console commands
//!
//! Each command connects to a running server, performs one operation and
//! prints the outcome on stdout. Formatting lives in plain functions so it
//! can be checked without a server.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use cameo_client::{Server, WaitMode, Waited};
use cameo_core::prelude::*;
use cameo_core::{
    logging, ApplicationSummary, Endpoint, InstanceInfo, PortInfo, State, StateSet, TcpTransport,
};
use cameo_server::{load_config, load_config_or_default, CommandLauncher, ServerHandle};

/// Config file used when none is given.
pub const DEFAULT_CONFIG: &str = "cameo.toml";

/// Run a server until Ctrl-C, then stop every instance it manages.
pub async fn run_server(config_path: Option<&Path>) -> Result<()> {
    logging::init("server.log")?;

    let config = match config_path {
        Some(path) => load_config(path)?,
        None => load_config_or_default(Path::new(DEFAULT_CONFIG)),
    };
    let handle = ServerHandle::start(
        &TcpTransport::default(),
        config,
        Arc::new(CommandLauncher),
    )
    .await?;
    println!("cameo server on {}", handle.endpoint());

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, shutting down");
    handle.shutdown().await;
    Ok(())
}

async fn connect(endpoint: &Endpoint) -> Result<Server> {
    Server::connect_tcp(endpoint.clone()).await
}

pub async fn apps(endpoint: &Endpoint) -> Result<()> {
    let server = connect(endpoint).await?;
    for line in format_apps(&server.apps().await?) {
        println!("{line}");
    }
    Ok(())
}

pub async fn list(endpoint: &Endpoint) -> Result<()> {
    let server = connect(endpoint).await?;
    for line in format_instances(&server.list().await?) {
        println!("{line}");
    }
    Ok(())
}

pub async fn ports(endpoint: &Endpoint) -> Result<()> {
    let server = connect(endpoint).await?;
    for line in format_ports(&server.ports().await?) {
        println!("{line}");
    }
    Ok(())
}

/// Start `name`; with `wait`, block until it terminates and return its exit code.
pub async fn start(endpoint: &Endpoint, name: &str, args: Vec<String>, wait: bool) -> Result<i32> {
    let server = connect(endpoint).await?;
    let instance = server.start(name, args).await?;
    println!("Started {} #{}", instance.name(), instance.id());
    if !wait {
        return Ok(0);
    }

    let state = instance.wait_for_completion().await.into_result()?;
    println!("{} #{} {}", instance.name(), instance.id(), state);
    Ok(exit_status(state, instance.exit_code()))
}

pub async fn stop(endpoint: &Endpoint, id: i32) -> Result<()> {
    connect(endpoint).await?.stop(id).await
}

pub async fn kill(endpoint: &Endpoint, id: i32) -> Result<()> {
    connect(endpoint).await?.kill(id).await
}

/// Wait for the first instance of `name` to terminate, up to `timeout`.
pub async fn wait(endpoint: &Endpoint, name: &str, timeout: Option<Duration>) -> Result<i32> {
    let server = connect(endpoint).await?;
    let Some(instance) = server.connect(name).await? else {
        println!("No instance of {name}");
        return Ok(1);
    };

    match instance
        .wait_for(StateSet::TERMINAL, WaitMode::from(timeout))
        .await
    {
        Waited::Done(state) => {
            println!("{} #{} {}", instance.name(), instance.id(), state);
            Ok(exit_status(state, instance.exit_code()))
        }
        Waited::TimedOut => {
            let state = instance.last_state().await;
            println!("{} #{} still {}", instance.name(), instance.id(), state);
            Ok(2)
        }
        Waited::Canceled => Err(Error::Canceled),
    }
}

/// Process exit status mirroring an instance outcome.
pub fn exit_status(state: State, exit_code: Option<i32>) -> i32 {
    match state {
        State::Success | State::Stopped => 0,
        State::Failure => exit_code.filter(|code| *code != 0).unwrap_or(1),
        _ => 1,
    }
}

pub fn format_apps(apps: &[ApplicationSummary]) -> Vec<String> {
    apps.iter()
        .map(|app| {
            let limit = if app.max_instances < 0 {
                "unlimited".to_string()
            } else {
                app.max_instances.to_string()
            };
            format!(
                "{:<20} {:>3} running (max {:<9}) {}",
                app.name, app.running, limit, app.description
            )
        })
        .collect()
}

pub fn format_instances(instances: &[InstanceInfo]) -> Vec<String> {
    instances
        .iter()
        .map(|info| {
            let pid = info
                .pid
                .map_or_else(|| "-".to_string(), |pid| pid.to_string());
            format!(
                "#{:<5} {:<20} {:<16} pid {:<8} since {} {}",
                info.id,
                info.name,
                info.state,
                pid,
                info.started_at.format("%Y-%m-%d %H:%M:%S"),
                info.args.join(" ")
            )
            .trim_end()
            .to_string()
        })
        .collect()
}

pub fn format_ports(ports: &[PortInfo]) -> Vec<String> {
    ports
        .iter()
        .map(|port| {
            format!(
                "{:<6} {} (#{} {})",
                port.port, port.name, port.owner_id, port.owner_name
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_exit_status() {
        assert_eq!(exit_status(State::Success, Some(0)), 0);
        assert_eq!(exit_status(State::Stopped, None), 0);
        assert_eq!(exit_status(State::Failure, Some(3)), 3);
        assert_eq!(exit_status(State::Failure, None), 1);
        assert_eq!(exit_status(State::Killed, None), 1);
    }

    #[test]
    fn test_format_apps() {
        let lines = format_apps(&[ApplicationSummary {
            name: "worker".into(),
            description: "batch worker".into(),
            max_instances: -1,
            running: 2,
        }]);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("worker"));
        assert!(lines[0].contains("2 running"));
        assert!(lines[0].contains("unlimited"));
        assert!(lines[0].ends_with("batch worker"));
    }

    #[test]
    fn test_format_instances() {
        let lines = format_instances(&[InstanceInfo {
            id: 4,
            name: "calc".into(),
            args: vec!["--fast".into()],
            state: State::Running,
            past_states: State::Starting | State::Running,
            pid: None,
            started_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        }]);
        assert!(lines[0].starts_with("#4"));
        assert!(lines[0].contains("calc"));
        assert!(lines[0].contains("pid -"));
        assert!(lines[0].contains("2024-05-01 12:00:00"));
        assert!(lines[0].ends_with("--fast"));
    }

    #[test]
    fn test_format_ports() {
        let lines = format_ports(&[PortInfo {
            port: 7010,
            owner_id: 2,
            owner_name: "worker".into(),
            name: "publisher:stream".into(),
        }]);
        assert_eq!(lines, vec!["7010   publisher:stream (#2 worker)"]);
    }
}
