use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use waypoint::config::Config;
use waypoint::model::{Goal, GoalStatus};
use waypoint::server;
use waypoint::store::Store;

#[derive(Parser)]
#[command(name = "waypoint")]
#[command(version, about = "Goal orchestration engine - decompose, execute, evaluate, repair")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the API server (REST + SSE event streams)
    Serve {
        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// SQLite database path
        #[arg(long)]
        db: Option<PathBuf>,

        /// Bind on all interfaces and allow cross-origin requests
        #[arg(long)]
        dev: bool,
    },
    /// Execute a single goal to completion, printing events to stdout
    Run {
        /// The natural-language goal
        goal: String,

        /// SQLite database path (in-memory when omitted)
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "waypoint=debug"
    } else {
        "waypoint=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    match cli.command {
        Commands::Serve { port, db, dev } => {
            let mut config = Config::from_env()?;
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(db) = db {
                config.db_path = db;
            }
            server::start_server(config, dev).await
        }
        Commands::Run { goal, db } => run_goal(&goal, db).await,
    }
}

/// One-shot execution: create the goal, drive the workflow, and print
/// every event until the goal reaches a terminal state.
async fn run_goal(goal_text: &str, db: Option<PathBuf>) -> Result<()> {
    let config = Config::from_env()?;
    let store = match &db {
        Some(path) => Store::open(path).context("Failed to open store")?,
        None => Store::open_in_memory()?,
    };

    let state = server::build_state(&config, store);

    let goal = Goal::new(goal_text);
    let goal_id = goal.id.clone();
    state
        .store
        .call(move |store| store.create_goal(&goal))
        .await?;

    // Subscribe before spawning so no event is missed.
    let mut rx = state.events.subscribe(&goal_id);
    state.orchestrator.clone().spawn_goal(&goal_id);

    while let Ok(envelope) = rx.recv().await {
        let data = serde_json::to_string(&envelope)?;
        println!("{}", data);
        if envelope.event.is_terminal() {
            break;
        }
    }

    let final_goal = {
        let id = goal_id.clone();
        state
            .store
            .call(move |store| store.get_goal(&id))
            .await?
            .context("goal disappeared")?
    };

    println!(
        "\nGoal {}: {}{}",
        final_goal.id,
        final_goal.status.as_str(),
        final_goal
            .message
            .map(|m| format!(" ({})", m))
            .unwrap_or_default(),
    );

    if final_goal.status == GoalStatus::Failed {
        std::process::exit(1);
    }
    Ok(())
}
