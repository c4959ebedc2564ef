//! Ordered, de-duplicated message timeline for one room.
//!
//! DESIGN
//! ======
//! The timeline is append-mostly. Three things mutate it: hydration from the
//! history snapshot, local optimistic sends, and inbound broker messages.
//! Inbound messages are reconciled in this order:
//!
//! 1. A `chatMessageId` already on the timeline is a redelivery and is dropped.
//! 2. The local user's own echo replaces the earliest unconfirmed local entry
//!    of the same type, in place, preferring one with identical text.
//! 3. Anything else is appended.
//!
//! Entries are never re-sorted by `sentAt`; broker delivery order wins.

#[cfg(test)]
#[path = "timeline_test.rs"]
mod timeline_test;

use std::collections::HashSet;
use std::time::Duration;

use frames::chat::ChatMessage;
use tokio::time::Instant;

use crate::error::ChatError;

/// Delivery state of one timeline entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Carries a server id, or arrived from the broker.
    Confirmed,
    /// Sent locally, echo not yet seen.
    Pending,
    /// Sent locally, no echo within the pending timeout.
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct LocalSend {
    queued_at: Instant,
    failed: bool,
}

/// One rendered line of the conversation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub message: ChatMessage,
    /// Set while the entry only exists because this client sent it.
    local: Option<LocalSend>,
}

impl Entry {
    fn remote(message: ChatMessage) -> Self {
        Self { message, local: None }
    }

    #[must_use]
    pub fn status(&self) -> DeliveryStatus {
        match self.local {
            Some(LocalSend { failed, .. }) if !self.message.is_confirmed() => {
                if failed { DeliveryStatus::Failed } else { DeliveryStatus::Pending }
            }
            _ => DeliveryStatus::Confirmed,
        }
    }

    fn is_outstanding(&self) -> bool {
        self.status() == DeliveryStatus::Pending
    }

    fn awaits_echo(&self) -> bool {
        self.local.is_some() && !self.message.is_confirmed()
    }
}

/// Effect of reconciling one inbound message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reconciled {
    /// Already present; the timeline is unchanged.
    Duplicate,
    /// Confirmed a local entry at this index.
    Replaced(usize),
    /// Added as a new entry at this index.
    Appended(usize),
}

#[derive(Clone, Debug)]
pub struct Timeline {
    current_user_id: i64,
    entries: Vec<Entry>,
    seen_ids: HashSet<i64>,
}

impl Timeline {
    #[must_use]
    pub fn new(current_user_id: i64) -> Self {
        Self { current_user_id, entries: Vec::new(), seen_ids: HashSet::new() }
    }

    #[must_use]
    pub fn current_user_id(&self) -> i64 {
        self.current_user_id
    }

    #[must_use]
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Entry> {
        self.entries.get(index)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replace the contents with a history snapshot, oldest first.
    ///
    /// Unconfirmed or repeated messages in the snapshot are skipped.
    pub fn hydrate(&mut self, messages: Vec<ChatMessage>) {
        self.entries.clear();
        self.seen_ids.clear();
        for message in messages {
            let Some(id) = message.chat_message_id else {
                tracing::warn!(sender_id = message.sender_id, "skipping unconfirmed history message");
                continue;
            };
            if self.seen_ids.insert(id) {
                self.entries.push(Entry::remote(message));
            }
        }
    }

    /// Reconcile one message received from the broker.
    pub fn apply_inbound(&mut self, message: ChatMessage) -> Reconciled {
        let Some(id) = message.chat_message_id else {
            // Broker frames without an id cannot be de-duplicated; show as-is.
            self.entries.push(Entry::remote(message));
            return Reconciled::Appended(self.entries.len() - 1);
        };

        if self.seen_ids.contains(&id) {
            tracing::debug!(chat_message_id = id, "dropping redelivered message");
            return Reconciled::Duplicate;
        }
        self.seen_ids.insert(id);

        if message.sender_id == self.current_user_id {
            if let Some(index) = self.find_echo_target(&message) {
                self.entries[index] = Entry::remote(message);
                return Reconciled::Replaced(index);
            }
        }

        self.entries.push(Entry::remote(message));
        Reconciled::Appended(self.entries.len() - 1)
    }

    /// Append a local send before it is published.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::SendInFlight`] while an earlier local send is still
    /// pending.
    pub fn push_optimistic(&mut self, mut message: ChatMessage, now: Instant) -> Result<usize, ChatError> {
        if self.has_outstanding() {
            return Err(ChatError::SendInFlight);
        }
        message.chat_message_id = None;
        self.entries.push(Entry { message, local: Some(LocalSend { queued_at: now, failed: false }) });
        Ok(self.entries.len() - 1)
    }

    /// Drop the local entry at `index` if it is still unconfirmed.
    ///
    /// Used when a publish could not be dispatched after the optimistic append.
    pub fn retract(&mut self, index: usize) -> Option<ChatMessage> {
        if self.entries.get(index).is_some_and(Entry::awaits_echo) {
            Some(self.entries.remove(index).message)
        } else {
            None
        }
    }

    /// True while a local send is pending and not yet timed out.
    #[must_use]
    pub fn has_outstanding(&self) -> bool {
        self.entries.iter().any(Entry::is_outstanding)
    }

    /// Mark pending local sends older than `timeout` as failed.
    ///
    /// Returns the indices that changed.
    pub fn expire_pending(&mut self, now: Instant, timeout: Duration) -> Vec<usize> {
        let mut expired = Vec::new();
        for (index, entry) in self.entries.iter_mut().enumerate() {
            if !entry.is_outstanding() {
                continue;
            }
            if let Some(local) = entry.local.as_mut() {
                if now.saturating_duration_since(local.queued_at) >= timeout {
                    local.failed = true;
                    expired.push(index);
                }
            }
        }
        expired
    }

    fn find_echo_target(&self, echo: &ChatMessage) -> Option<usize> {
        let mut candidates = self.entries.iter().enumerate().filter(|(_, entry)| {
            entry.awaits_echo()
                && entry.message.sender_id == echo.sender_id
                && entry.message.kind == echo.kind
        });
        let earliest = candidates.next()?;
        if earliest.1.message.message == echo.message {
            return Some(earliest.0);
        }
        let exact = candidates.find(|(_, entry)| entry.message.message == echo.message);
        Some(exact.unwrap_or(earliest).0)
    }
}
