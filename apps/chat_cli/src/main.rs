use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    BlobUploader, ChatClient, ChatEvent, ImageAttachment, LocalStoreGateway, Message,
    MissingPresenceConnector, RestStoreGateway, StoreGateway, ViewerSession,
};
use presence::{LocalPresenceHub, PresenceConnector};
use shared::domain::{ChannelId, UserId};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::{load_settings, normalize_database_url, Settings};

const CONFIRM_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(about = "Drives the group chat engine from a terminal")]
struct Args {
    #[arg(long, default_value = "chat.toml")]
    config: PathBuf,
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long)]
    store_url: Option<String>,
    #[arg(long)]
    max_image_bytes: Option<usize>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Two local viewers exchange a message over the embedded store.
    Demo,
    /// Follows a channel on a remote store and prints every change.
    Tail {
        #[arg(long)]
        channel: String,
        #[arg(long)]
        user: String,
        #[arg(long)]
        name: Option<String>,
    },
    /// Sends one message to a channel on a remote store.
    Send {
        #[arg(long)]
        channel: String,
        #[arg(long)]
        user: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        image: Option<PathBuf>,
        #[arg(default_value = "")]
        text: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut settings = load_settings(&args.config)?;
    if let Some(v) = args.database_url {
        settings.database_url = normalize_database_url(&v);
    }
    if let Some(v) = args.store_url {
        settings.store_url = Some(v);
    }
    if let Some(v) = args.max_image_bytes {
        settings.engine.max_image_bytes = v;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_filter.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match args.command {
        Command::Demo => run_demo(&settings).await,
        Command::Tail {
            channel,
            user,
            name,
        } => {
            let session = session(user, name);
            run_tail(&settings, session, ChannelId::new(channel)).await
        }
        Command::Send {
            channel,
            user,
            name,
            image,
            text,
        } => {
            let session = session(user, name);
            run_send(&settings, session, ChannelId::new(channel), &text, image).await
        }
    }
}

fn session(user: String, name: Option<String>) -> ViewerSession {
    let display_name = name.unwrap_or_else(|| user.clone());
    ViewerSession::new(UserId::new(user), display_name)
}

fn remote_client(settings: &Settings) -> Result<Arc<ChatClient>> {
    let store_url = settings
        .store_url
        .as_deref()
        .ok_or_else(|| anyhow!("no store url: pass --store-url or set APP__STORE_URL"))?;
    let mut gateway = RestStoreGateway::new(store_url, settings.engine.image_bucket.clone())?;
    if let Some(token) = &settings.access_token {
        gateway = gateway.with_access_token(token.clone());
    }
    let gateway = Arc::new(gateway);
    Ok(ChatClient::new_with_dependencies(
        Arc::clone(&gateway) as Arc<dyn StoreGateway>,
        gateway as Arc<dyn BlobUploader>,
        Arc::new(MissingPresenceConnector),
        settings.engine.clone(),
    ))
}

async fn run_demo(settings: &Settings) -> Result<()> {
    let store =
        LocalStoreGateway::initialize(&settings.database_url, &settings.engine.image_bucket)
            .await
            .with_context(|| format!("failed to open store '{}'", settings.database_url))?;
    let storage = store.storage();
    storage.health_check().await?;
    let alice_id = UserId::new("alice");
    let bob_id = UserId::new("bob");
    storage.upsert_user(&alice_id, "Alice", None).await?;
    storage.upsert_user(&bob_id, "Bob", None).await?;
    let channel_id = storage.create_channel("general", "hsl(173, 80%, 40%)").await?;
    storage.add_channel_member(&channel_id, &alice_id).await?;
    storage.add_channel_member(&channel_id, &bob_id).await?;
    info!(channel_id = %channel_id, "demo: seeded local store");

    let hub: Arc<dyn PresenceConnector> = Arc::new(LocalPresenceHub::new());
    let client = || {
        ChatClient::new_with_dependencies(
            Arc::clone(&store) as Arc<dyn StoreGateway>,
            Arc::clone(&store) as Arc<dyn BlobUploader>,
            Arc::clone(&hub),
            settings.engine.clone(),
        )
    };
    let alice = client();
    let bob = client();
    let printer = tokio::spawn(print_events("bob", bob.subscribe_events()));

    alice
        .open_channel(ViewerSession::new(alice_id.clone(), "Alice"), channel_id.clone())
        .await?;
    bob.open_channel(ViewerSession::new(bob_id.clone(), "Bob"), channel_id.clone())
        .await?;

    alice.send_message("hello from alice", None).await?;
    let read = wait_for(&alice, |messages| {
        messages
            .iter()
            .any(|m| !m.is_pending() && m.read_by.contains(&bob_id))
    })
    .await?;
    if let Some(message) = read.iter().find(|m| m.read_by.contains(&bob_id)) {
        for entry in alice.open_seen_by(&message.id).await? {
            println!("seen by {} at {}", entry.display_name, entry.read_at);
        }
    }
    println!("online besides alice: {}", alice.online_count().await);

    bob.close_channel().await;
    alice.close_channel().await;
    printer.abort();
    Ok(())
}

async fn run_tail(settings: &Settings, session: ViewerSession, channel_id: ChannelId) -> Result<()> {
    let client = remote_client(settings)?;
    let events = client.subscribe_events();
    client.open_channel(session, channel_id).await?;
    for message in client.messages().await {
        print_message(&message);
    }

    tokio::select! {
        _ = print_events("tail", events) => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                warn!(error = %err, "tail: failed to listen for ctrl-c");
            }
        }
    }
    client.close_channel().await;
    Ok(())
}

async fn run_send(
    settings: &Settings,
    session: ViewerSession,
    channel_id: ChannelId,
    text: &str,
    image: Option<PathBuf>,
) -> Result<()> {
    let client = remote_client(settings)?;
    let image = match image {
        Some(path) => Some(read_attachment(path).await?),
        None => None,
    };
    client.open_channel(session, channel_id).await?;
    let outcome = client.send_message(text, image).await?;
    info!(outcome = ?outcome, "send: accepted");
    let result = wait_for(&client, |messages| messages.iter().all(|m| !m.is_pending())).await;
    client.close_channel().await;
    result.map(|_| ())
}

async fn read_attachment(path: PathBuf) -> Result<ImageAttachment> {
    let bytes = tokio::fs::read(&path)
        .await
        .with_context(|| format!("failed to read image '{}'", path.display()))?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".into());
    let content_type = match path.extension().and_then(|ext| ext.to_str()) {
        Some("png") => Some("image/png".to_string()),
        Some("jpg" | "jpeg") => Some("image/jpeg".to_string()),
        Some("gif") => Some("image/gif".to_string()),
        Some("webp") => Some("image/webp".to_string()),
        _ => None,
    };
    Ok(ImageAttachment {
        file_name,
        content_type,
        bytes,
    })
}

async fn wait_for(
    client: &ChatClient,
    predicate: impl Fn(&[Message]) -> bool,
) -> Result<Vec<Message>> {
    tokio::time::timeout(CONFIRM_TIMEOUT, async {
        loop {
            let messages = client.messages().await;
            if predicate(&messages) {
                return messages;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .map_err(|_| anyhow!("timed out waiting for the store to confirm"))
}

async fn print_events(label: &'static str, mut events: broadcast::Receiver<ChatEvent>) {
    loop {
        match events.recv().await {
            Ok(ChatEvent::MessagesChanged { messages, .. }) => {
                if let Some(last) = messages.last() {
                    print!("[{label}] ");
                    print_message(last);
                }
            }
            Ok(ChatEvent::PresenceChanged { online, .. }) => {
                let names = online
                    .iter()
                    .map(|entry| entry.display_name.as_str())
                    .collect::<Vec<_>>();
                println!("[{label}] online: {}", names.join(", "));
            }
            Ok(ChatEvent::Notice(err)) => println!("[{label}] ! {err}"),
            Ok(ChatEvent::ChannelOpened { channel_id }) => {
                println!("[{label}] opened {channel_id}")
            }
            Ok(ChatEvent::ChannelClosed { channel_id }) => {
                println!("[{label}] closed {channel_id}")
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "cli: event printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_message(message: &Message) {
    let marker = if message.is_pending() { "…" } else { " " };
    let body = message
        .text
        .as_deref()
        .or(message.image_url.as_deref())
        .unwrap_or_default();
    println!(
        "{marker} {} {}: {body} (read by {})",
        message.created_at.format("%H:%M:%S"),
        message.sender.display_name,
        message.read_by.len()
    );
}
