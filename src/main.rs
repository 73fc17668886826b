//! cameo - application lifecycle server and console
//!
//! This is the binary entry point. All logic lives in the library.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;

use cameo::console;
use cameo_core::{logging, Endpoint};

/// cameo - start, watch and stop applications through a server
#[derive(Parser, Debug)]
#[command(name = "cameo")]
#[command(about = "Application lifecycle server and console", long_about = None)]
struct Args {
    /// Server to talk to
    #[arg(long, global = true, default_value = "tcp://localhost:7000")]
    endpoint: Endpoint,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a server in the foreground
    Server {
        /// Config file (defaults to ./cameo.toml when present)
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,
    },
    /// List configured applications
    Apps,
    /// List running instances
    List,
    /// List ports held by instances
    Ports,
    /// Start an application
    Start {
        name: String,
        /// Arguments appended to the configured ones
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
        /// Block until the instance terminates and exit with its status
        #[arg(long)]
        wait: bool,
    },
    /// Ask an instance to stop
    Stop { id: i32 },
    /// Kill an instance
    Kill { id: i32 },
    /// Wait for an instance of an application to terminate
    Wait {
        name: String,
        /// Give up after this many milliseconds (exit status 2)
        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    if let Command::Server { config } = &args.command {
        console::run_server(config.as_deref()).await?;
        return Ok(());
    }

    logging::init_stderr();
    let endpoint = &args.endpoint;
    let code = match args.command {
        Command::Server { .. } => 0,
        Command::Apps => console::apps(endpoint).await.map(|_| 0)?,
        Command::List => console::list(endpoint).await.map(|_| 0)?,
        Command::Ports => console::ports(endpoint).await.map(|_| 0)?,
        Command::Start { name, args, wait } => console::start(endpoint, &name, args, wait).await?,
        Command::Stop { id } => console::stop(endpoint, id).await.map(|_| 0)?,
        Command::Kill { id } => console::kill(endpoint, id).await.map(|_| 0)?,
        Command::Wait { name, timeout_ms } => {
            let timeout = timeout_ms.map(Duration::from_millis);
            console::wait(endpoint, &name, timeout).await?
        }
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
