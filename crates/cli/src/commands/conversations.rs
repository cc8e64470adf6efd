//! `threadline conversations`: Browse stored conversations.

use super::{CmdResult, load_config, open_store};
use std::path::Path;
use threadline_core::message::ConversationId;
use threadline_core::store::{ConversationStore, Page};

pub async fn list(config_path: &Path, user: &str, page: u32, limit: u32) -> CmdResult {
    if page < 1 || !(1..=100).contains(&limit) {
        return Err("--page must be at least 1 and --limit between 1 and 100".into());
    }

    let config = load_config(config_path)?;
    let store = open_store(&config).await?;

    if store.find_user(user).await?.is_none() {
        return Err(format!("Unknown user: {user}").into());
    }

    let page = Page::new(page, limit);
    let (conversations, total) = store.list_conversations(user, page).await?;

    println!(
        "📜 Conversations for {user} (page {}/{}, {total} total)",
        page.page,
        page.page_count(total).max(1)
    );
    println!();
    if conversations.is_empty() {
        println!("   (none)");
    }
    for conversation in &conversations {
        println!(
            "   {}  {:<13}  {:>3} msgs  {:>6} tokens  {}  {}",
            conversation.id,
            conversation.mode.as_str(),
            conversation.total_messages,
            conversation.total_tokens,
            conversation.updated_at.format("%Y-%m-%d %H:%M"),
            conversation.title.as_deref().unwrap_or(""),
        );
    }

    Ok(())
}

pub async fn show(config_path: &Path, id: &str) -> CmdResult {
    let config = load_config(config_path)?;
    let store = open_store(&config).await?;
    let id = ConversationId::from(id);

    let conversation = store
        .get_conversation(&id)
        .await?
        .ok_or_else(|| format!("Conversation not found: {id}"))?;

    println!("💬 Conversation {}", conversation.id);
    println!("   User:     {}", conversation.user_id);
    println!("   Mode:     {}", conversation.mode.as_str());
    println!("   Status:   {}", conversation.status.as_str());
    println!(
        "   Messages: {}  Tokens: {}",
        conversation.total_messages, conversation.total_tokens
    );
    println!();

    for message in store.messages(&id).await? {
        println!(
            "[{}] {} ({})",
            message.sequence_number,
            message.role.as_str(),
            message.created_at.format("%Y-%m-%d %H:%M:%S")
        );
        println!("{}", message.content);
        println!();
    }

    Ok(())
}
