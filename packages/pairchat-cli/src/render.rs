//! Plain-text views of what a client currently shows.

use std::fmt::Display;

use chrono::{DateTime, TimeZone, Utc};

use pairchat_core::messaging::list_time_label;
use pairchat_core::{ConversationDirectory, MessageStream, StatusBoard};

/// The conversation list, most recent first.
pub fn conversation_list<Tz: TimeZone>(owner: &str, directory: &ConversationDirectory, now: DateTime<Utc>, tz: &Tz)
where
    Tz::Offset: Display,
{
    println!("\n── {owner}'s conversations ─────────────────────────────");
    let summaries = directory.conversations();
    if summaries.is_empty() {
        println!("  (none)");
    }
    for summary in summaries {
        let unread = match summary.unread_count {
            0 => String::new(),
            n => format!(" [{n}]"),
        };
        println!(
            "  {:<16} {:>9}{}  {}",
            summary.title(),
            list_time_label(summary.activity_at(), now, tz),
            unread,
            summary.preview(),
        );
    }
}

/// The open conversation as `viewer_id` sees it, grouped by calendar day.
pub fn conversation<Tz: TimeZone>(
    owner: &str,
    viewer_id: &str,
    stream: &MessageStream,
    now: DateTime<Utc>,
    tz: &Tz,
) where
    Tz::Offset: Display,
{
    println!("\n── {owner}'s view of {} ─────────", stream.conversation_id());
    for line in conversation_lines(viewer_id, stream, now, tz) {
        println!("{line}");
    }
}

/// Day headers and message bubbles; the viewer's own messages are right-aligned.
fn conversation_lines<Tz: TimeZone>(viewer_id: &str, stream: &MessageStream, now: DateTime<Utc>, tz: &Tz) -> Vec<String>
where
    Tz::Offset: Display,
{
    let today = now.with_timezone(tz).date_naive();
    let mut lines = Vec::new();

    for group in stream.groups(tz) {
        lines.push(format!("  · {} ·", group.label(today)));
        for message in &group.messages {
            let body = if message.is_deleted {
                message.preview()
            } else {
                match (&message.content, &message.media_url) {
                    (Some(text), Some(url)) => format!("{text} <{url}>"),
                    (Some(text), None) => text.clone(),
                    (None, Some(url)) => format!("<{url}>"),
                    (None, None) => message.preview(),
                }
            };
            if message.is_from(viewer_id) {
                lines.push(format!(
                    "  {:>44}  {} {}",
                    body,
                    message.time_label(tz),
                    message.delivery_state().glyph()
                ));
            } else {
                lines.push(format!("  {:<44}  {}", body, message.time_label(tz)));
            }
        }
    }
    lines
}

/// Presence badges for the given users.
pub fn presence<Tz: TimeZone>(board: &StatusBoard, users: &[&str], tz: &Tz)
where
    Tz::Offset: Display,
{
    println!("\n── Presence ────────────────────────────────────────────");
    for user in users {
        let label = board
            .get(user)
            .map(|status| status.last_seen_label(tz))
            .unwrap_or_else(|| "never seen".to_string());
        println!("  {user:<8} {label}");
    }
}
