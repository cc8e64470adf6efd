//! `threadline chat`: One turn, or an interactive loop.

use super::{CmdResult, load_config, open_runtime};
use std::path::Path;
use threadline_agent::{StartConversation, TurnOrchestrator, TurnOutcome};
use threadline_core::ErrorKind;
use threadline_core::document::DocumentId;
use threadline_core::error::Result;
use threadline_core::message::{ConversationId, ConversationMode};
use tokio::io::{AsyncBufReadExt, BufReader};

pub struct ChatArgs {
    pub user: String,
    pub conversation: Option<String>,
    pub mode: ConversationMode,
    pub documents: Vec<String>,
    pub message: Option<String>,
}

/// Where the next message goes: a conversation to open, or one in progress.
enum Session {
    Pending {
        user: String,
        mode: ConversationMode,
        documents: Vec<DocumentId>,
    },
    Active(ConversationId),
}

impl Session {
    async fn send(&mut self, orchestrator: &TurnOrchestrator, content: &str) -> Result<TurnOutcome> {
        let outcome = match self {
            Self::Pending {
                user,
                mode,
                documents,
            } => {
                orchestrator
                    .start_conversation(StartConversation {
                        user_id: user.clone(),
                        first_message: content.to_string(),
                        mode: *mode,
                        document_ids: documents.clone(),
                        title: None,
                    })
                    .await?
            }
            Self::Active(id) => orchestrator.send_message(id, content).await?,
        };
        *self = Self::Active(outcome.conversation.id.clone());
        Ok(outcome)
    }
}

pub async fn run(config_path: &Path, args: ChatArgs) -> CmdResult {
    let config = load_config(config_path)?;
    let runtime = open_runtime(&config).await?;
    let orchestrator = runtime.orchestrator.as_ref();

    let mut session = match args.conversation {
        Some(id) => Session::Active(ConversationId(id)),
        None => Session::Pending {
            user: args.user,
            mode: args.mode,
            documents: args.documents.into_iter().map(DocumentId).collect(),
        },
    };

    if let Some(message) = args.message {
        eprint!("  Thinking...");
        let result = session.send(orchestrator, &message).await;
        eprint!("\r              \r");
        let outcome = result?;
        println!("{}", outcome.assistant_message.content);
        print_footer(&outcome);
        return Ok(());
    }

    println!();
    println!("  ╔══════════════════════════════════════════════╗");
    println!("  ║        Threadline Chat — Interactive Mode      ║");
    println!("  ╚══════════════════════════════════════════════╝");
    println!();
    println!("  Provider:  {}", config.default_provider);
    println!("  Model:     {}", orchestrator.settings().model);
    if let Session::Active(id) = &session {
        println!("  Conversation: {id}");
    }
    println!();
    println!("  Type your message and press Enter.");
    println!("  Type 'exit' or Ctrl+D to quit.");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("  You > ");
        use std::io::Write;
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "exit" || line == "quit" {
            break;
        }

        eprint!("  ...");
        match session.send(orchestrator, line).await {
            Ok(outcome) => {
                eprint!("\r     \r");
                println!();
                for reply_line in outcome.assistant_message.content.lines() {
                    println!("  Assistant > {reply_line}");
                }
                print_footer(&outcome);
                println!();
            }
            Err(e) => {
                eprint!("\r     \r");
                match e.kind() {
                    ErrorKind::ContextOverflow => {
                        eprintln!("  [Error] {e}. Start a new conversation to continue.")
                    }
                    ErrorKind::RateLimited | ErrorKind::ServiceUnavailable => {
                        eprintln!("  [Error] {e}. Try again shortly.")
                    }
                    _ => eprintln!("  [Error] {e}"),
                }
                println!();
            }
        }
    }

    println!();
    if let Session::Active(id) = &session {
        println!("  Conversation: {id}");
    }
    println!("  Goodbye! 👋");
    println!();

    Ok(())
}

fn print_footer(outcome: &TurnOutcome) {
    let rag = if outcome.rag.enabled {
        format!("rag: {} chunk(s)", outcome.rag.chunks_used)
    } else {
        "rag: off".to_string()
    };
    eprintln!(
        "  [{} · {} tokens · {} total · {rag}]",
        outcome.conversation.id, outcome.tokens_used, outcome.total_tokens
    );
}
