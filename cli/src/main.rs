//! Alumni Chat CLI
//!
//! Thin terminal client over the sync core:
//! - `watch` streams live updates
//! - `send` delivers one message and waits for the acknowledgment
//! - `unread` prints the persisted unread index without touching the network

use std::path::PathBuf;
use std::sync::Arc;

use alumni_chat_core::{
    ChatSession, ChatUpdate, ClientConfig, ConversationStore, LocalStorage, MessageContent,
    UnreadTracker, UpdateFilter, CURRENT_USER_KEY,
};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "alumni-chat")]
#[command(about = "Alumni chat sync client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Current user id (`unread` defaults to the last account used)
    #[arg(long, env = "ALUMNI_CHAT_USER")]
    user: Option<String>,

    /// Bearer token for the chat server
    #[arg(long, env = "ALUMNI_CHAT_TOKEN", default_value = "")]
    token: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream conversation updates until interrupted
    Watch {
        /// Open this conversation (marks it read and joins its room)
        #[arg(long)]
        conversation: Option<String>,
    },

    /// Send a text message
    Send {
        #[arg(long)]
        conversation: String,

        text: String,
    },

    /// Show unread counts from local state
    Unread,
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("alumni-chat")
        .join("config.toml")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "alumni_chat=info,alumni_chat_core=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = ClientConfig::load(&config_path)?;
    tracing::debug!("Config loaded from {}", config_path.display());

    match cli.command {
        Commands::Watch { conversation } => {
            let user = require_user(cli.user.as_deref())?;
            watch(&config, user, &cli.token, conversation).await?;
        }
        Commands::Send { conversation, text } => {
            let user = require_user(cli.user.as_deref())?;
            send(&config, user, &cli.token, &conversation, &text).await?;
        }
        Commands::Unread => {
            unread(&config, cli.user.as_deref())?;
        }
    }

    Ok(())
}

async fn watch(
    config: &ClientConfig,
    user: &str,
    token: &str,
    conversation: Option<String>,
) -> anyhow::Result<()> {
    let (session, manager) = ChatSession::connect(config, user, token)?;

    session.subscribe(
        UpdateFilter::All,
        Arc::new(|update: &ChatUpdate| -> anyhow::Result<()> {
            print_update(update);
            Ok(())
        }),
    );

    if let Err(e) = session.refresh_conversations().await {
        tracing::warn!("Could not refresh conversations: {}", e);
    }
    if let Some(id) = conversation.as_deref() {
        session.open_conversation(id).await?;
    }

    println!("Watching (total unread: {}). Ctrl-C to stop.", session.get_total_unread());
    tokio::signal::ctrl_c().await?;

    if let Some(id) = conversation.as_deref() {
        session.close_conversation(id);
    }
    manager.disconnect();
    Ok(())
}

async fn send(
    config: &ClientConfig,
    user: &str,
    token: &str,
    conversation: &str,
    text: &str,
) -> anyhow::Result<()> {
    let (session, manager) = ChatSession::connect(config, user, token)?;

    if session.get_conversation(conversation).is_none() {
        session.refresh_conversations().await?;
    }

    let pending = session.send_message(conversation, MessageContent::text(text))?;
    println!("Queued {}", pending.message_id());

    let result = pending.delivered().await;
    manager.disconnect();

    let message = result?;
    println!("Delivered as {} at {}", message.id, message.timestamp);
    Ok(())
}

fn require_user(user: Option<&str>) -> anyhow::Result<&str> {
    match user {
        Some(user) => Ok(user),
        None => anyhow::bail!("--user (or ALUMNI_CHAT_USER) is required"),
    }
}

fn unread(config: &ClientConfig, user: Option<&str>) -> anyhow::Result<()> {
    let storage = Arc::new(LocalStorage::new(&config.storage.data_dir)?);
    let remembered = storage.get_setting(CURRENT_USER_KEY);
    let Some(user) = user.map(str::to_string).or(remembered) else {
        anyhow::bail!("No account has synced on this device yet; pass --user");
    };
    let store = ConversationStore::open(storage, &user)?;
    let tracker = UnreadTracker::new();

    println!("=== Unread ===");
    for conv in store.list_conversations() {
        let label = conv.name.clone().unwrap_or_else(|| conv.id.clone());
        println!("{} | {}", label, tracker.get_unread_count(&store, &conv.id));
    }
    println!("Total: {}", tracker.get_total_unread(&store));
    Ok(())
}

fn print_update(update: &ChatUpdate) {
    match update {
        ChatUpdate::MessageUpserted {
            conversation_id,
            message,
        } => println!(
            "[{}] {}: {}",
            conversation_id,
            message.sender_id,
            message.content.preview()
        ),
        ChatUpdate::MessageReplaced {
            provisional_id,
            message,
            ..
        } => println!("{} acknowledged as {}", provisional_id, message.id),
        ChatUpdate::DeliveryStateChanged {
            message_id, state, ..
        } => println!("{} is {}", message_id, state.as_str()),
        ChatUpdate::MessageDeleted {
            conversation_id,
            message_id,
        } => println!("[{}] {} deleted", conversation_id, message_id),
        ChatUpdate::UnreadChanged {
            conversation_id,
            unread_count,
            total_unread,
        } => println!(
            "[{}] unread {} (total {})",
            conversation_id, unread_count, total_unread
        ),
        ChatUpdate::ConversationUpdated { conversation_id } => {
            println!("[{}] updated", conversation_id)
        }
        ChatUpdate::PeerRead {
            conversation_id,
            user_id,
            ..
        } => println!("[{}] read by {}", conversation_id, user_id),
        ChatUpdate::ConnectionStateChanged(state) => println!("Connection: {:?}", state),
        ChatUpdate::AuthRejected(reason) => println!("Authentication rejected: {}", reason),
    }
}
