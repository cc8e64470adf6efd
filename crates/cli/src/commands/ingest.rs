//! `threadline ingest`: Upload a local file as a document.

use super::{CmdResult, load_config, open_store};
use std::path::Path;
use threadline_agent::{DocumentIngestor, Upload};
use threadline_core::document::DocumentStatus;
use threadline_core::message::ConversationId;

pub async fn run(
    config_path: &Path,
    user: &str,
    conversation: Option<String>,
    file: &Path,
) -> CmdResult {
    let config = load_config(config_path)?;
    let filename = file
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| format!("Not a file name: {}", file.display()))?
        .to_string();
    let bytes = tokio::fs::read(file)
        .await
        .map_err(|e| format!("Failed to read {}: {e}", file.display()))?;

    let store = open_store(&config).await?;
    let ingestor = DocumentIngestor::new(store, &config.documents);
    let outcome = ingestor
        .ingest(Upload {
            user_id: user.to_string(),
            filename,
            bytes,
            conversation_id: conversation.map(ConversationId),
        })
        .await?;

    let document = &outcome.document;
    match document.status {
        DocumentStatus::Processed => println!(
            "✅ Ingested {} ({} bytes, {} chunk(s))",
            document.filename, document.file_size, outcome.chunk_count
        ),
        _ => println!(
            "⚠️  Stored {} but no text could be extracted; it will not be searched",
            document.filename
        ),
    }
    println!("   Document:     {}", document.id);
    match &outcome.linked_conversation {
        Some(id) => println!("   Linked to:    {id}"),
        None => println!("   Linked to:    (none)"),
    }

    Ok(())
}
