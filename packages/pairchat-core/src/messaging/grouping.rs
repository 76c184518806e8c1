//! Calendar grouping and time labels for message display.
//!
//! Groups are recomputed from the current sequence on every call and never
//! cached. Dates come from `created_at`, interpreted in the caller's zone.

use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};

use super::Message;

/// A contiguous run of messages sharing a calendar date
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateGroup {
    /// Calendar date in the display zone
    pub date: NaiveDate,
    /// Messages in sequence order
    pub messages: Vec<Message>,
}

impl DateGroup {
    /// Header text relative to `today`
    pub fn label(&self, today: NaiveDate) -> String {
        date_label(self.date, today)
    }
}

/// Split an ordered sequence into contiguous same-date runs.
pub fn group_by_date<Tz: TimeZone>(messages: &[Message], tz: &Tz) -> Vec<DateGroup> {
    let mut groups: Vec<DateGroup> = Vec::new();

    for message in messages {
        let date = message.created_at.with_timezone(tz).date_naive();
        match groups.last_mut() {
            Some(group) if group.date == date => group.messages.push(message.clone()),
            _ => groups.push(DateGroup {
                date,
                messages: vec![message.clone()],
            }),
        }
    }

    groups
}

/// "Today", "Yesterday", or e.g. "October 19, 2026".
pub fn date_label(date: NaiveDate, today: NaiveDate) -> String {
    if date == today {
        "Today".to_string()
    } else if Some(date) == today.pred_opt() {
        "Yesterday".to_string()
    } else {
        date.format("%B %-d, %Y").to_string()
    }
}

/// Conversation-list timestamp: "HH:MM" today, "Yesterday", else "DD/MM/YY".
pub fn list_time_label<Tz: TimeZone>(at: DateTime<Utc>, now: DateTime<Utc>, tz: &Tz) -> String
where
    Tz::Offset: fmt::Display,
{
    let local = at.with_timezone(tz);
    let today = now.with_timezone(tz).date_naive();
    let date = local.date_naive();

    if date == today {
        local.format("%H:%M").to_string()
    } else if date + Duration::days(1) == today {
        "Yesterday".to_string()
    } else {
        local.format("%d/%m/%y").to_string()
    }
}
