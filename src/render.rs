//! Plain-text transcript rendering for terminal output.

#[cfg(test)]
#[path = "render_test.rs"]
mod render_test;

use frames::chat::MessageType;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};

use crate::net::connection::ConnectionState;
use crate::state::timeline::{DeliveryStatus, Entry};

/// Render one timeline entry as a transcript line.
///
/// TALK: `[HH:MM] nickname: text`, with the local user's lines marked and
/// pending or failed deliveries flagged. ENTER/LEAVE: a system line using the
/// server's text when it sent one. Clock times are shown at `offset`.
#[must_use]
pub fn render_entry(entry: &Entry, current_user_id: i64, offset: UtcOffset) -> String {
    let message = &entry.message;
    if message.kind.is_presence() {
        let text = if message.message.trim().is_empty() {
            let verb = if message.kind == MessageType::Enter { "joined" } else { "left" };
            format!("{} {verb}", display_name(&message.sender_nickname, message.sender_id))
        } else {
            message.message.clone()
        };
        return format!("-- {text} --");
    }

    let name = display_name(&message.sender_nickname, message.sender_id);
    let own = if message.sender_id == current_user_id { " (me)" } else { "" };
    let marker = match entry.status() {
        DeliveryStatus::Confirmed => "",
        DeliveryStatus::Pending => " [sending]",
        DeliveryStatus::Failed => " [not delivered]",
    };
    format!("[{}] {name}{own}: {}{marker}", format_clock(message.sent_at.as_deref(), offset), message.message)
}

/// `HH:MM` wall-clock time of a `sentAt` value, `--:--` when absent or unreadable.
///
/// Zoned RFC 3339 values (client stamps) are shifted to `offset`. Zone-less
/// values (server stamps) are already local and shown as written.
#[must_use]
pub fn format_clock(sent_at: Option<&str>, offset: UtcOffset) -> String {
    sent_at
        .and_then(|raw| wall_clock(raw, offset))
        .map_or_else(|| "--:--".to_owned(), |time| format!("{:02}:{:02}", time.hour(), time.minute()))
}

fn wall_clock(raw: &str, offset: UtcOffset) -> Option<Time> {
    if let Ok(stamp) = OffsetDateTime::parse(raw, &Rfc3339) {
        return Some(stamp.to_offset(offset).time());
    }
    let local = format_description!("[year]-[month]-[day]T[hour]:[minute][optional [:[second][optional [.[subsecond]]]]]");
    PrimitiveDateTime::parse(raw, local).ok().map(PrimitiveDateTime::time)
}

/// One-line connection indicator.
#[must_use]
pub fn status_line(state: ConnectionState) -> String {
    match state {
        ConnectionState::Disconnected => "chat offline".to_owned(),
        ConnectionState::Connecting => "connecting to chat...".to_owned(),
        ConnectionState::Connected => "chat connected".to_owned(),
        ConnectionState::Reconnecting { attempt } => format!("connection lost, reconnecting (attempt {attempt})..."),
        ConnectionState::Failed => "could not reach chat server; giving up".to_owned(),
        ConnectionState::Closed => "chat closed".to_owned(),
    }
}

fn display_name(nickname: &str, sender_id: i64) -> String {
    if nickname.trim().is_empty() { format!("user-{sender_id}") } else { nickname.to_owned() }
}
