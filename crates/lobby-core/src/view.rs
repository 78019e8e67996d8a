//! Render-ready rows derived from the message list.

use chrono::{DateTime, NaiveDate, Utc};

use crate::types::{ColorKey, Message};

const FALLBACK_NAME: &str = "Guest";
const NEAR_BOTTOM_THRESHOLD_PX: f32 = 40.0;

const FIXED_COLORS: [(i64, &str); 3] = [(1, "#fecaca"), (2, "#bbf7d0"), (3, "#ddd6fe")];
const PALETTE: [&str; 8] = [
    "#fee2e2", "#dcfce7", "#ede9fe", "#e0f2fe", "#fff7ed", "#fef9c3", "#fce7f3", "#d1fae5",
];

/// One visible message row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRow {
    pub key: String,
    pub author: String,
    pub text: String,
    pub initials: String,
    pub color: &'static str,
    pub is_own: bool,
    pub is_pending: bool,
    /// `HH:MM` in UTC.
    pub time_label: String,
}

/// Timeline row: a day separator or a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelineRow {
    DaySeparator { key: String, label: String },
    Message(MessageRow),
}

/// Background color for a sender.
///
/// Only [`ColorKey::Numeric`] keys can hit the fixed colors. A named author
/// that happens to look numeric, like `"2"`, is hashed into the palette;
/// the variant is chosen once when the key is built.
pub fn color_for(key: &ColorKey) -> &'static str {
    if let ColorKey::Numeric(value) = key
        && let Some((_, color)) = FIXED_COLORS.iter().find(|(fixed, _)| fixed == value)
    {
        return *color;
    }

    let hashed = match key {
        ColorKey::Numeric(value) => string_hash(&value.to_string()),
        ColorKey::Named(name) => string_hash(name),
    };
    PALETTE[hashed as usize % PALETTE.len()]
}

/// Two-character avatar label.
pub fn initials(author: &str) -> String {
    let name = if author.is_empty() {
        FALLBACK_NAME
    } else {
        author
    };
    name.chars().take(2).collect::<String>().to_uppercase()
}

/// Whether the viewport is close enough to the end to auto-follow.
pub fn is_near_bottom(scroll_height: f32, scroll_top: f32, client_height: f32) -> bool {
    scroll_height - scroll_top - client_height < NEAR_BOTTOM_THRESHOLD_PX
}

/// Rows for `messages`, with a separator before each new UTC day.
pub fn build_timeline(messages: &[Message], own_author: &str) -> Vec<TimelineRow> {
    let mut rows = Vec::with_capacity(messages.len() + 1);
    let mut previous_day: Option<NaiveDate> = None;

    for message in messages {
        let created_at = timestamp(message.created_at_ms);
        let day = created_at.date_naive();
        let key = row_key(message);

        if previous_day != Some(day) {
            rows.push(TimelineRow::DaySeparator {
                key: format!("sep-{key}"),
                label: day.format("%Y-%m-%d").to_string(),
            });
            previous_day = Some(day);
        }

        rows.push(TimelineRow::Message(MessageRow {
            key,
            author: message.author.clone(),
            text: message.text.clone(),
            initials: initials(&message.author),
            color: color_for(&message.color_key()),
            is_own: message.author == own_author,
            is_pending: message.is_pending(),
            time_label: created_at.format("%H:%M").to_string(),
        }));
    }

    rows
}

fn row_key(message: &Message) -> String {
    match &message.id {
        Some(id) => id.to_string(),
        None => message.created_at_ms.to_string(),
    }
}

fn timestamp(created_at_ms: u64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(created_at_ms as i64).unwrap_or_default()
}

fn string_hash(value: &str) -> u32 {
    value
        .encode_utf16()
        .fold(0_u32, |hash, unit| {
            hash.wrapping_mul(31).wrapping_add(u32::from(unit))
        })
}
