mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use moments::config::MomentsConfig;

#[derive(Parser)]
#[command(name = "moments", version, about = "Timed journaling sessions with a topic-tracking coach")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start or resume a chat session in the terminal
    Chat {
        /// User to chat as (created on first use)
        #[arg(short, long)]
        user: String,
        /// Length of a new session in minutes
        #[arg(short, long)]
        minutes: Option<u32>,
    },
    /// List a user's active topics
    Topics {
        #[arg(short, long)]
        user: String,
    },
    /// Show a user's most recent session logs
    Logs {
        #[arg(short, long)]
        user: String,
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
    /// Run database diagnostics
    Doctor,
    /// Manage the embedding model
    Model {
        #[command(subcommand)]
        action: ModelAction,
    },
}

#[derive(Subcommand)]
enum ModelAction {
    /// Download the embedding model to ~/.moments/models/
    Download,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = MomentsConfig::load()?;

    // Log to stderr so stdout stays clean for the conversation.
    let filter = EnvFilter::try_new(&config.general.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Chat { user, minutes } => cli::chat::chat(config, &user, minutes).await?,
        Command::Topics { user } => cli::topics::topics(&config, &user)?,
        Command::Logs { user, limit } => cli::logs::logs(&config, &user, limit)?,
        Command::Doctor => cli::doctor::doctor(&config)?,
        Command::Model { action } => match action {
            ModelAction::Download => {
                cli::model_download(&config.embedding).await?;
            }
        },
    }

    Ok(())
}
