//! pybox - Python interpreter sessions in a Docker container, over HTTP.
//!
//! Usage:
//!   pybox serve [--port 8080]                    # Start HTTP server
//!   pybox --workdir-in ./in --workdir-out ./out serve

use clap::{Parser, Subcommand};
use pybox::config::{CliOverrides, Environment, Settings, CONTAINER_WORKDIR};
use pybox::container::{ContainerClient, DockerClient};
use pybox::coordinator::SessionCoordinator;
use pybox::current::CurrentSessionTracker;
use pybox::http_server::{self, AppState};
use pybox::state::{SessionStore, SystemClock};
use pybox::tools::{Tools, ToolsConfig};
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pybox")]
#[command(about = "Python code interpreter sessions in a Docker container")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Host directory files are uploaded from
    #[arg(long, alias = "WORKDIR_IN", global = true)]
    workdir_in: Option<String>,

    /// Host directory files are downloaded to
    #[arg(long, alias = "WORKDIR_OUT", global = true)]
    workdir_out: Option<String>,

    /// Docker image for the interpreter container
    #[arg(long, global = true)]
    image: Option<String>,

    /// Name of the interpreter container
    #[arg(long, global = true)]
    container_name: Option<String>,

    /// Idle seconds before a session expires
    #[arg(long, global = true)]
    session_ttl: Option<u64>,

    /// Maximum number of live sessions
    #[arg(long, global = true)]
    max_sessions: Option<usize>,

    /// Settings file read before the process environment
    #[arg(long, default_value = ".env", global = true)]
    env_file: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to listen on
        #[arg(long, default_value = "8080")]
        port: u16,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let settings = match load_settings(&args) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {}", e);
            exit(1);
        }
    };

    match args.command {
        Commands::Serve { port } => {
            let state = build_state(&settings).await;
            if let Err(e) = http_server::run_server(port, state, settings.reap_interval).await {
                error!("HTTP server stopped: {}", e);
                exit(1);
            }
        }
    }
}

fn load_settings(args: &Args) -> pybox::Result<Settings> {
    let env = Environment::load(Some(&args.env_file))?;
    let cwd = std::env::current_dir().map_err(|e| pybox::Error::Config(format!("current dir: {e}")))?;
    let cli = CliOverrides {
        workdir_in: args.workdir_in.clone(),
        workdir_out: args.workdir_out.clone(),
        image: args.image.clone(),
        container_name: args.container_name.clone(),
        session_ttl_secs: args.session_ttl,
        max_sessions: args.max_sessions,
    };
    Settings::resolve(cli, &env, cwd)
}

async fn build_state(settings: &Settings) -> AppState {
    let client: Arc<dyn ContainerClient> = Arc::new(DockerClient::new(settings.docker.clone()));
    let store = Arc::new(SessionStore::new(
        settings.store.clone(),
        Arc::new(SystemClock),
        client.clone(),
    ));
    let tracker = Arc::new(CurrentSessionTracker::new(store.clone(), client.clone()));

    // Reattach to the previous process's current session if the container
    // is still around.
    match client.ensure_container().await {
        Ok(()) => {
            if let Some(session) = tracker.restore().await {
                info!("Resumed current session: {}", session.id);
            }
        }
        Err(e) => warn!("Container not available yet, starting without a current session: {:#}", e),
    }

    let coordinator = Arc::new(SessionCoordinator::new(store, tracker, client));
    let tools = Tools::new(
        coordinator,
        ToolsConfig {
            workdir_in: settings.workdir_in.clone(),
            workdir_out: settings.workdir_out.clone(),
            container_workdir: PathBuf::from(CONTAINER_WORKDIR),
        },
    );
    AppState {
        tools: Arc::new(tools),
    }
}
