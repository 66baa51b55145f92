//! Bounded discussion history with per-join replay limits.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use jid::{BareJid, FullJid, Jid};
use minidom::Element;
use xmpp_parsers::message::Message;

use super::NS_DELAY;

pub const DEFAULT_HISTORY_CAPACITY: usize = 20;

#[derive(Debug, Clone)]
struct HistoryEntry {
    nick: String,
    message: Message,
    timestamp: DateTime<Utc>,
}

/// Ring buffer of the most recent groupchat messages in a room.
#[derive(Debug)]
pub struct DiscussionHistory {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
}

/// Replay limits from the `<history/>` child of a join request.
#[derive(Debug, Clone, Default)]
pub struct HistoryRequest {
    pub max_chars: Option<usize>,
    pub max_stanzas: Option<usize>,
    pub seconds: Option<i64>,
    pub since: Option<DateTime<Utc>>,
}

impl HistoryRequest {
    /// No limits: replay everything buffered.
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Parse the optional `<history/>` element inside the join `<x/>`.
    pub fn from_join(x: &Element) -> Self {
        let Some(history) = x.children().find(|c| c.name() == "history") else {
            return Self::unlimited();
        };
        Self {
            max_chars: history.attr("maxchars").and_then(|v| v.parse().ok()),
            max_stanzas: history.attr("maxstanzas").and_then(|v| v.parse().ok()),
            seconds: history.attr("seconds").and_then(|v| v.parse().ok()),
            since: history
                .attr("since")
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|t| t.with_timezone(&Utc)),
        }
    }
}

impl DiscussionHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record a delivered groupchat message under the sender's room nick.
    pub fn append(&mut self, nick: &str, message: Message) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(HistoryEntry {
            nick: nick.to_string(),
            message,
            timestamp: Utc::now(),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Messages to replay to a joining occupant, oldest first, readdressed
    /// from the room and stamped with the original delivery time.
    pub fn replay_for(
        &self,
        room: &BareJid,
        recipient: &FullJid,
        limits: &HistoryRequest,
    ) -> Vec<Message> {
        let mut selected: Vec<&HistoryEntry> = self.entries.iter().collect();

        if let Some(since) = limits.since {
            selected.retain(|e| e.timestamp >= since);
        }
        if let Some(seconds) = limits.seconds {
            let cutoff = Utc::now() - Duration::seconds(seconds);
            selected.retain(|e| e.timestamp >= cutoff);
        }
        if let Some(max) = limits.max_stanzas {
            if selected.len() > max {
                selected.drain(..selected.len() - max);
            }
        }
        if let Some(max_chars) = limits.max_chars {
            // Budget counts body characters, consumed from the newest
            // message backwards.
            let mut budget = max_chars;
            let mut keep = 0;
            for entry in selected.iter().rev() {
                let cost = entry
                    .message
                    .bodies
                    .get("")
                    .map(|b| b.0.chars().count())
                    .unwrap_or(0);
                if cost > budget {
                    break;
                }
                budget -= cost;
                keep += 1;
            }
            selected.drain(..selected.len() - keep);
        }

        selected
            .into_iter()
            .map(|entry| {
                let mut message = entry.message.clone();
                message.from = room
                    .with_resource_str(&entry.nick)
                    .ok()
                    .map(Jid::from)
                    .or_else(|| Some(Jid::from(room.clone())));
                message.to = Some(Jid::from(recipient.clone()));
                message.payloads.push(
                    Element::builder("delay", NS_DELAY)
                        .attr("from", room.to_string())
                        .attr(
                            "stamp",
                            entry.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
                        )
                        .build(),
                );
                message
            })
            .collect()
    }
}
