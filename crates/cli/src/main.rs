//! Threadline CLI: the main entry point.
//!
//! Commands:
//! - `serve`: Start the HTTP API
//! - `chat`: One turn, or an interactive loop
//! - `ingest`: Upload a local file as a document
//! - `conversations`: List conversations or show one
//! - `config`: Show, validate, locate, or initialise configuration
//! - `doctor`: Diagnose configuration and database health

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use threadline_config::{AppConfig, LogFormat};
use threadline_core::message::ConversationMode;

mod commands;

#[derive(Parser)]
#[command(
    name = "threadline",
    about = "Threadline — conversations grounded in your documents",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file to use instead of ~/.threadline/config.toml
    #[arg(short, long, global = true, env = "THREADLINE_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API server
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Chat in a conversation
    Chat {
        /// External user id
        #[arg(short, long)]
        user: String,

        /// Continue an existing conversation
        #[arg(short, long)]
        conversation: Option<String>,

        /// Mode for a new conversation (open_chat | grounded_chat)
        #[arg(short, long, default_value = "open_chat")]
        mode: ConversationMode,

        /// Document to link to a new grounded conversation (repeatable)
        #[arg(short, long = "document")]
        documents: Vec<String>,

        /// Send a single message instead of entering interactive mode
        message: Option<String>,
    },

    /// Upload a local file as a document
    Ingest {
        /// External user id
        #[arg(short, long)]
        user: String,

        /// Conversation to link the document to
        #[arg(short, long)]
        conversation: Option<String>,

        /// File to upload
        file: PathBuf,
    },

    /// Browse conversations
    Conversations {
        #[command(subcommand)]
        action: ConversationsAction,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Diagnose system health
    Doctor,
}

#[derive(Subcommand)]
enum ConversationsAction {
    /// List a user's conversations, most recent first
    List {
        #[arg(short, long)]
        user: String,

        #[arg(short, long, default_value_t = 1)]
        page: u32,

        #[arg(short, long, default_value_t = 10)]
        limit: u32,
    },

    /// Print a conversation's messages
    Show {
        /// Conversation id
        id: String,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration (API keys redacted)
    Show,
    /// Validate the configuration file
    Validate,
    /// Print the configuration file path
    Path,
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| AppConfig::config_dir().join("config.toml"));

    init_tracing(&config_path, cli.verbose);

    match cli.command {
        Commands::Serve { port } => commands::serve::run(&config_path, port).await?,
        Commands::Chat {
            user,
            conversation,
            mode,
            documents,
            message,
        } => {
            commands::chat::run(
                &config_path,
                commands::chat::ChatArgs {
                    user,
                    conversation,
                    mode,
                    documents,
                    message,
                },
            )
            .await?
        }
        Commands::Ingest {
            user,
            conversation,
            file,
        } => commands::ingest::run(&config_path, &user, conversation, &file).await?,
        Commands::Conversations { action } => match action {
            ConversationsAction::List { user, page, limit } => {
                commands::conversations::list(&config_path, &user, page, limit).await?
            }
            ConversationsAction::Show { id } => {
                commands::conversations::show(&config_path, &id).await?
            }
        },
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_cmd::show(&config_path).await?,
            ConfigAction::Validate => commands::config_cmd::validate(&config_path).await?,
            ConfigAction::Path => commands::config_cmd::path(&config_path).await?,
            ConfigAction::Init { force } => commands::config_cmd::init(&config_path, force).await?,
        },
        Commands::Doctor => commands::doctor::run(&config_path).await?,
    }

    Ok(())
}

/// `RUST_LOG` wins; otherwise `--verbose` or the configured level.
fn init_tracing(config_path: &std::path::Path, verbose: bool) {
    // A broken config is reported by the command itself.
    let logging = AppConfig::load_from(config_path)
        .map(|c| c.logging)
        .unwrap_or_default();
    let level = if verbose { "debug".to_string() } else { logging.level };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}
