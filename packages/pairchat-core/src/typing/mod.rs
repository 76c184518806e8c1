//! # Typing Signaler
//!
//! Ephemeral typing indicators over a per-conversation broadcast channel.
//!
//! ## Timers
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        TYPING SIGNALS                                   │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Local side (debounce)                                                 │
//! │  ─────────────────────                                                  │
//! │  keystroke ──► publish typing { userId, userName }                     │
//! │            └─► cancel idle timer, arm new one (2s)                     │
//! │                     │ expires                                          │
//! │                     ▼                                                   │
//! │                publish stop_typing { userId }                          │
//! │                                                                         │
//! │  Remote side (auto-clear)                                              │
//! │  ────────────────────────                                               │
//! │  typing from other      ──► show name, re-arm clear timer (3s)         │
//! │  stop_typing from other ──► clear now, cancel clear timer              │
//! │  anything from self     ──► ignored                                    │
//! │                                                                         │
//! │  close(): abort both timers and the pump, leave the channel            │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Broadcast delivery is not guaranteed, so the remote clear timer runs even
//! if the matching `stop_typing` never arrives.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::backend::{Backend, Broadcast, BroadcastEnvelope, SubscriptionId};
use crate::config::ClientConfig;
use crate::error::Result;
use crate::profiles::Viewer;

/// Event name for "user is typing"
pub const TYPING_EVENT: &str = "typing";

/// Event name for "user stopped typing"
pub const STOP_TYPING_EVENT: &str = "stop_typing";

/// Broadcast channel name for a conversation.
pub fn channel_name(conversation_id: &str) -> String {
    format!("typing:{}", conversation_id)
}

/// Payload carried by typing events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    /// Sender id
    pub user_id: String,
    /// Sender display name (absent on `stop_typing`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
}

struct SignalerState {
    broadcast: Arc<dyn Broadcast>,
    channel: String,
    viewer: Viewer,
    idle_timeout: Duration,
    display_timeout: Duration,
    idle_timer: Mutex<Option<JoinHandle<()>>>,
    clear_timer: Mutex<Option<JoinHandle<()>>>,
    typing: watch::Sender<Option<String>>,
    // Bumped on every remote typing event; a clear timer only fires for its own.
    generation: AtomicU64,
}

impl SignalerState {
    fn handle(self: &Arc<Self>, envelope: BroadcastEnvelope) {
        let payload: TypingPayload = match serde_json::from_value(envelope.payload) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::debug!(channel = %self.channel, error = %e, "Ignoring malformed typing payload");
                return;
            }
        };
        if payload.user_id == self.viewer.id {
            return;
        }

        match envelope.event.as_str() {
            TYPING_EVENT => {
                let name = payload.user_name.unwrap_or(payload.user_id);
                let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                self.typing.send_replace(Some(name));

                let state = Arc::clone(self);
                let timeout = self.display_timeout;
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    state.clear_if_current(generation);
                });
                if let Some(previous) = self.clear_timer.lock().replace(timer) {
                    previous.abort();
                }
            }
            STOP_TYPING_EVENT => {
                if let Some(timer) = self.clear_timer.lock().take() {
                    timer.abort();
                }
                self.typing.send_replace(None);
            }
            other => tracing::trace!(channel = %self.channel, event = %other, "Ignoring broadcast event"),
        }
    }

    /// Clear the indicator unless a newer typing event arrived since `generation`.
    fn clear_if_current(&self, generation: u64) {
        self.typing.send_if_modified(|typing| {
            if self.generation.load(Ordering::SeqCst) != generation || typing.is_none() {
                return false;
            }
            *typing = None;
            true
        });
    }

    fn abort_timers(&self) {
        if let Some(timer) = self.idle_timer.lock().take() {
            timer.abort();
        }
        if let Some(timer) = self.clear_timer.lock().take() {
            timer.abort();
        }
    }
}

/// Typing indicators for one conversation
pub struct TypingSignaler {
    state: Arc<SignalerState>,
    subscription: SubscriptionId,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl TypingSignaler {
    /// Join the conversation's channel and start handling remote signals.
    pub async fn join(
        backend: &Backend,
        conversation_id: &str,
        viewer: Viewer,
        config: &ClientConfig,
    ) -> Result<Self> {
        let channel = channel_name(conversation_id);
        let mut subscription = backend.broadcast.join(&channel).await.map_err(|e| {
            tracing::error!(channel = %channel, error = %e, "Failed to join typing channel");
            e
        })?;

        let (typing, _) = watch::channel(None);
        let state = Arc::new(SignalerState {
            broadcast: backend.broadcast.clone(),
            channel,
            viewer,
            idle_timeout: config.typing_idle_timeout(),
            display_timeout: config.typing_display_timeout(),
            idle_timer: Mutex::new(None),
            clear_timer: Mutex::new(None),
            typing,
            generation: AtomicU64::new(0),
        });

        let subscription_id = subscription.id;
        let pump_state = state.clone();
        let pump = tokio::spawn(async move {
            while let Some(envelope) = subscription.envelopes.recv().await {
                pump_state.handle(envelope);
            }
        });

        tracing::debug!(channel = %state.channel, "Joined typing channel");
        Ok(Self {
            state,
            subscription: subscription_id,
            pump: Mutex::new(Some(pump)),
        })
    }

    /// Name of the other participant currently typing, if any
    pub fn typing_user(&self) -> Option<String> {
        self.state.typing.borrow().clone()
    }

    /// Receiver that wakes whenever the indicator changes.
    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.state.typing.subscribe()
    }

    /// Record a local keystroke.
    ///
    /// Publishes `typing` and restarts the idle timer; `stop_typing` goes
    /// out once no keystroke arrives for the idle timeout.
    pub async fn keystroke(&self) {
        if self.pump.lock().is_none() {
            return;
        }

        let payload = TypingPayload {
            user_id: self.state.viewer.id.clone(),
            user_name: Some(self.state.viewer.display_name.clone()),
        };
        publish(&*self.state.broadcast, &self.state.channel, TYPING_EVENT, &payload).await;

        let broadcast = self.state.broadcast.clone();
        let channel = self.state.channel.clone();
        let user_id = self.state.viewer.id.clone();
        let idle = self.state.idle_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            let payload = TypingPayload {
                user_id,
                user_name: None,
            };
            publish(&*broadcast, &channel, STOP_TYPING_EVENT, &payload).await;
        });

        if let Some(previous) = self.state.idle_timer.lock().replace(timer) {
            previous.abort();
        }
    }

    /// Cancel both timers, stop the pump and leave the channel.
    pub async fn close(&self) {
        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            pump.abort();
            self.state.abort_timers();
            self.state.typing.send_replace(None);
            if let Err(e) = self.state.broadcast.leave(self.subscription).await {
                tracing::debug!(channel = %self.state.channel, error = %e, "Leaving typing channel failed");
            }
            tracing::debug!(channel = %self.state.channel, "Left typing channel");
        }
    }
}

impl Drop for TypingSignaler {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        self.state.abort_timers();
    }
}

impl std::fmt::Debug for TypingSignaler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypingSignaler")
            .field("channel", &self.state.channel)
            .field("subscription", &self.subscription)
            .finish_non_exhaustive()
    }
}

async fn publish(broadcast: &dyn Broadcast, channel: &str, event: &str, payload: &TypingPayload) {
    let payload = match serde_json::to_value(payload) {
        Ok(value) => value,
        Err(e) => {
            tracing::debug!(error = %e, "Failed to encode typing payload");
            return;
        }
    };
    if let Err(e) = broadcast.publish(channel, event, payload).await {
        tracing::debug!(channel = %channel, event = %event, error = %e, "Typing publish failed");
    }
}

// ============================================================================
// TESTS
// ============================================================================
