//! Pairchat simulation harness
//!
//! Runs two clients against one in-process backend and narrates what each
//! of them observes:
//!
//! 1. **Conversation setup**: Alice finds or creates the conversation with
//!    Bob; Bob sees it appear in his list with an unread count.
//!
//! 2. **Live exchange**: both sides type and send; typing indicators, read
//!    receipts and the message stream update without polling.
//!
//! 3. **Lifecycle**: optional attachment upload and the two delete flavors,
//!    including a retraction attempted after the window closed.
//!
//! Timestamps come from a manual clock that the harness advances between
//! steps, so a run covers minutes of conversation in well under a second of
//! wall time (typing timers excepted).

mod render;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{Local, Utc};
use clap::Parser;
use color_eyre::eyre::{eyre, WrapErr};
use serde_json::json;

use pairchat_core::backend::{RowStore, Table};
use pairchat_core::{
    Backend, ChatClient, Clock, ClientConfig, Error, ManualClock, MediaKind, MemoryBackend, StreamSignal, Viewer,
};

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "pairchat", version, about = "Pairchat two-client simulation")]
struct Args {
    /// Number of messages exchanged in the live phase
    #[arg(short, long, default_value_t = 6, env = "PAIRCHAT_MESSAGES")]
    messages: usize,

    /// Send an image attachment
    #[arg(long, env = "PAIRCHAT_MEDIA")]
    media: bool,

    /// Exercise delete-for-me and delete-for-everyone
    #[arg(long, env = "PAIRCHAT_DELETION")]
    deletion: bool,

    /// Client configuration as a JSON file (unspecified fields use defaults)
    #[arg(long, env = "PAIRCHAT_CONFIG")]
    config: Option<PathBuf>,

    /// Override the typing idle debounce in milliseconds
    #[arg(long, env = "PAIRCHAT_TYPING_IDLE_MS")]
    typing_idle_ms: Option<u64>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "pairchat_cli=info,pairchat_core=info", env = "PAIRCHAT_LOG")]
    log: String,
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log.as_str().into()),
        )
        .init();

    let config = load_config(&args)?;
    tracing::info!(version = pairchat_core::version(), "Pairchat simulation starting");

    let clock = ManualClock::new(Utc::now());
    let memory = Arc::new(MemoryBackend::new(Arc::new(clock.clone())));
    seed_profiles(&memory).await?;

    let start = |id: &'static str, name: &'static str| {
        let backend = Backend::from_shared(memory.clone());
        let config = config.clone();
        let clock = Arc::new(clock.clone());
        async move { ChatClient::start(backend, Viewer::new(id, name), config, clock).await }
    };
    let alice = start("alice", "Alice Carter").await.wrap_err("starting Alice")?;
    let bob = start("bob", "Bob Nguyen").await.wrap_err("starting Bob")?;

    let result = run(&args, &config, &clock, &memory, &alice, &bob).await;

    alice.shutdown().await;
    bob.shutdown().await;
    tracing::info!(
        beacons = memory.beacons_dispatched(),
        live_subscriptions = memory.live_feed_subscriptions(),
        "Simulation finished"
    );
    result
}

fn load_config(args: &Args) -> color_eyre::Result<ClientConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path).wrap_err_with(|| format!("reading {}", path.display()))?;
            ClientConfig::from_json(&raw)?
        }
        None => ClientConfig::default(),
    };
    if let Some(ms) = args.typing_idle_ms {
        config.typing_idle_timeout_ms = ms;
    }
    config.validate()?;
    Ok(config)
}

async fn seed_profiles(memory: &MemoryBackend) -> color_eyre::Result<()> {
    memory
        .insert(
            Table::Profiles,
            vec![
                json!({"id": "alice", "full_name": "Alice Carter", "status_message": "Around"}),
                json!({"id": "bob", "full_name": "Bob Nguyen"}),
                json!({"id": "carol", "full_name": "Carol Diaz"}),
            ],
        )
        .await?;
    Ok(())
}

/// Let every pump drain what the backend just emitted.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(25)).await;
}

// ── Scenario ──────────────────────────────────────────────────────────────────

async fn run(
    args: &Args,
    config: &ClientConfig,
    clock: &ManualClock,
    memory: &MemoryBackend,
    alice: &ChatClient,
    bob: &ChatClient,
) -> color_eyre::Result<()> {
    // ── Conversation setup ────────────────────────────────────────────────

    let alices = alice.directory().open_with("bob").await?;
    let conversation_id = alices.conversation_id.clone();
    tracing::info!(conversation_id = %conversation_id, "Alice opened a conversation with Bob");

    clock.advance(chrono::Duration::minutes(1));
    alice.keystroke().await;
    settle().await;
    alice.send("Hey Bob, got a minute?").await?;
    settle().await;

    render::conversation_list("Bob", bob.directory(), clock.now(), &Local);

    let bobs = bob.directory().open(&conversation_id).await?;
    settle().await;

    let mut alice_signals = alices.stream.signals();
    let narrator = tokio::spawn(async move {
        while let Ok(signal) = alice_signals.recv().await {
            if let StreamSignal::Updated { message_id } = signal {
                tracing::debug!(message_id = %message_id, "Alice's view updated");
            }
        }
    });

    // ── Live exchange ─────────────────────────────────────────────────────

    let lines = [
        "Sure, what's up?",
        "Planning the trip for next weekend",
        "Nice! Mountains again?",
        "Coast this time",
        "Count me in",
        "I'll book the cabin",
    ];
    for i in 0..args.messages {
        let (from, to, watcher) = if i % 2 == 0 { (bob, &alices, "Alice") } else { (alice, &bobs, "Bob") };
        clock.advance(chrono::Duration::seconds(20));

        from.keystroke().await;
        settle().await;
        if let Some(who) = to.typing.typing_user() {
            tracing::info!(typing = %who, watcher, "Typing indicator shown");
        }

        from.send(lines[i % lines.len()]).await?;
        settle().await;
    }

    tracing::info!(
        idle_ms = config.typing_idle_timeout_ms,
        "Waiting for the typing indicators to clear"
    );
    tokio::time::sleep(config.typing_idle_timeout() + Duration::from_millis(100)).await;
    if alices.typing.typing_user().is_none() && bobs.typing.typing_user().is_none() {
        tracing::info!("No one is typing");
    }

    // ── Attachments ───────────────────────────────────────────────────────

    if args.media {
        clock.advance(chrono::Duration::seconds(30));
        let photo = Bytes::from_static(b"\xff\xd8\xff\xe0 simulated jpeg");
        alice
            .send_attachment(photo, "cabin.JPG", MediaKind::Image, "This one?")
            .await
            .wrap_err("sending the photo")?;
        settle().await;
        if let Some(last) = bobs.stream.visible().last() {
            tracing::info!(
                url = last.media_url.as_deref().unwrap_or_default(),
                preview = %last.preview(),
                "Bob received an attachment"
            );
        }
    }

    // ── Deletion ──────────────────────────────────────────────────────────

    if args.deletion {
        run_deletion(config, clock, alice, bob, &alices.stream, &bobs.stream).await?;
    }

    settle().await;
    render::conversation("Alice", &alice.viewer().id, &alices.stream, clock.now(), &Local);
    render::conversation("Bob", &bob.viewer().id, &bobs.stream, clock.now(), &Local);
    render::conversation_list("Alice", alice.directory(), clock.now(), &Local);
    render::conversation_list("Bob", bob.directory(), clock.now(), &Local);
    render::presence(alice.statuses(), &["alice", "bob", "carol"], &Local);

    narrator.abort();
    if memory.rows(Table::Messages).is_empty() {
        return Err(eyre!("no messages reached the backend"));
    }
    Ok(())
}

async fn run_deletion(
    config: &ClientConfig,
    clock: &ManualClock,
    alice: &ChatClient,
    bob: &ChatClient,
    alice_view: &pairchat_core::MessageStream,
    bob_view: &pairchat_core::MessageStream,
) -> color_eyre::Result<()> {
    clock.advance(chrono::Duration::seconds(10));
    alice.send("Oops, wrong chat").await?;
    settle().await;

    let retract = alice_view
        .all()
        .into_iter()
        .rev()
        .find(|m| m.is_from("alice") && !m.is_deleted)
        .ok_or_else(|| eyre!("Alice has no message to retract"))?;
    alice.delete_for_everyone(&retract.id).await?;
    settle().await;
    if bob_view.get(&retract.id).is_some_and(|m| m.is_deleted) {
        tracing::info!(message_id = %retract.id, "Bob sees the retraction");
    }

    if let Some(first) = bob_view.visible().first().cloned() {
        bob.delete_for_me(&first.id).await?;
        settle().await;
        tracing::info!(
            message_id = %first.id,
            bob_sees = bob_view.visible().len(),
            alice_sees = alice_view.visible().len(),
            "Message hidden from Bob's view only"
        );
    }

    let window = config.delete_window();
    clock.advance(window + chrono::Duration::minutes(1));
    let late = alice_view
        .all()
        .into_iter()
        .find(|m| m.is_from("alice") && !m.is_deleted)
        .ok_or_else(|| eyre!("Alice has no message left"))?;
    match alice.delete_for_everyone(&late.id).await {
        Err(Error::DeleteWindowExpired { minutes }) => {
            tracing::info!(minutes, "Late retraction refused as expected")
        }
        Err(e) => return Err(e.into()),
        Ok(()) => return Err(eyre!("retraction after the window was accepted")),
    }
    Ok(())
}
