//! Sprintdesk CLI
//!
//! Thin command-line front over the client core: log in, inspect projects
//! and tasks, and watch a project's realtime channel.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sprintdesk::cache::QueryKey;
use sprintdesk::realtime::ChannelStatus;
use sprintdesk::{AppClient, Config, SessionState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "sprintdesk")]
#[command(about = "Sprintdesk command-line client")]
struct Cli {
    /// Path to the YAML config file (default: ./sprintdesk.yaml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in with email and password
    Login {
        #[arg(short, long)]
        email: String,

        #[arg(short, long, env = "SPRINTDESK_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Finish an OAuth login from the redirect URL
    Oauth {
        /// Callback URL including the `#token=...` fragment
        callback_url: String,
    },

    /// End the session
    Logout,

    /// Show the current session
    Whoami,

    /// List projects visible to the current user
    Projects,

    /// List tasks of a project
    Tasks {
        project_id: String,
    },

    /// Follow a project's realtime channel until interrupted
    Watch {
        project_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sprintdesk=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Config::from_yaml_and_env(cli.config.as_deref())?;
    let client = AppClient::open(config).context("Failed to open client")?;

    match cli.command {
        Commands::Login { email, password } => {
            let user_id = client.login(&email, &password).await?;
            client.persist_cache().await?;
            println!("Logged in as {user_id}");
        }
        Commands::Oauth { callback_url } => {
            let user_id = client.complete_oauth(&callback_url).await?;
            println!("Logged in as {user_id}");
        }
        Commands::Logout => {
            client.logout().await;
            println!("Logged out");
        }
        Commands::Whoami => run_whoami(&client).await?,
        Commands::Projects => {
            require_session(&client).await?;
            for project in client.projects().await? {
                println!("{}\t{}", project.id, project.name);
            }
            client.persist_cache().await?;
        }
        Commands::Tasks { project_id } => {
            require_session(&client).await?;
            let key = QueryKey::Tasks {
                project_id: project_id.clone(),
            };
            let tasks = client.query(&key).await?;
            let tasks: Vec<sprintdesk::api::Task> =
                serde_json::from_value(tasks).context("Unexpected task list")?;
            for task in tasks {
                println!(
                    "{}\t{}\t{}",
                    task.id,
                    task.status.as_deref().unwrap_or("-"),
                    task.title
                );
            }
            client.persist_cache().await?;
        }
        Commands::Watch { project_id } => run_watch(&client, &project_id).await?,
    }

    Ok(())
}

async fn require_session(client: &AppClient) -> Result<()> {
    match client.initialize().await? {
        SessionState::Authenticated => Ok(()),
        _ => anyhow::bail!("Not logged in. Run `sprintdesk login` first."),
    }
}

async fn run_whoami(client: &AppClient) -> Result<()> {
    let state = match client.initialize().await {
        Ok(state) => state,
        Err(e) if e.is_retryable() => {
            println!("Backend unreachable, showing stored session ({e})");
            client.state()
        }
        Err(e) => return Err(e.into()),
    };
    match client.user_id() {
        Some(user_id) if state.is_authenticated() => {
            let remaining = client.coordinator().tokens().seconds_remaining();
            println!("user:     {user_id}");
            println!("state:    {state:?}");
            if let Some(secs) = remaining {
                println!("expires:  in {secs}s");
            }
            if let Some(project) = client.selected_project() {
                println!("project:  {project}");
            }
        }
        _ => println!("Not logged in"),
    }
    Ok(())
}

async fn run_watch(client: &AppClient, project_id: &str) -> Result<()> {
    require_session(client).await?;
    client.select_project(project_id)?;

    let mut status = client.realtime().watch_status();
    let mut state = client.session().watch();
    println!("Watching {project_id}, Ctrl-C to stop");

    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                println!("realtime: {current:?}");
                if let ChannelStatus::Closed { kind, .. } = current {
                    if kind.is_terminal() {
                        break;
                    }
                }
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                println!("session:  {current:?}");
                if current == SessionState::Unauthenticated {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.realtime().disconnect();
    client.persist_cache().await?;
    Ok(())
}
