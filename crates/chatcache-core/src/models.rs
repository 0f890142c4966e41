//! Domain models for cached conversations and messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Parse a message id into its numeric value.
///
/// Message ids are decimal strings; all ordering decisions go through this.
/// Ids must fit SQLite's signed 64-bit INTEGER, which the store compares on.
pub fn parse_message_id(id: &str) -> Result<u64> {
    let value = id
        .trim()
        .parse::<u64>()
        .map_err(|_| Error::Parse(format!("message id '{id}' is not numeric")))?;
    if i64::try_from(value).is_err() {
        return Err(Error::Parse(format!("message id '{id}' is out of range")));
    }
    Ok(value)
}

/// A single message within a group or chat.
///
/// Cached messages are immutable apart from `liked_by`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub created_at: DateTime<Utc>,
    pub sender_id: String,
    pub sender_name: String,
    pub text: Option<String>,
    pub attachments: serde_json::Value,
    pub liked_by: Vec<String>,
    #[serde(default)]
    pub system: bool,
}

impl Message {
    pub fn numeric_id(&self) -> Result<u64> {
        parse_message_id(&self.id)
    }
}

/// Joins a like-set into its stored, comma-delimited form.
pub fn encode_liked_by(liked_by: &[String]) -> String {
    liked_by.join(",")
}

/// Splits a stored like-set back into user ids.
pub fn decode_liked_by(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

/// A group conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub latest_message_id: Option<String>,
}

/// A direct-message conversation with one other user.
///
/// The chat is addressed remotely by `other_user_id`, but its messages are
/// stored under the composite `conversation_id` of both participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub other_user_id: String,
    pub other_user_name: String,
    pub conversation_id: String,
    pub latest_message_id: Option<String>,
}

impl Chat {
    /// Build the composite participant-pair id, lower id first.
    pub fn composite_id(user_a: &str, user_b: &str) -> String {
        let ordered = match (user_a.parse::<u64>(), user_b.parse::<u64>()) {
            (Ok(a), Ok(b)) => a <= b,
            _ => user_a <= user_b,
        };
        if ordered {
            format!("{user_a}+{user_b}")
        } else {
            format!("{user_b}+{user_a}")
        }
    }
}

/// Kind of conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Group,
    Chat,
}

impl std::fmt::Display for ConversationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConversationKind::Group => write!(f, "group"),
            ConversationKind::Chat => write!(f, "chat"),
        }
    }
}

/// A group or a chat, as listed by the message source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Conversation {
    Group(Group),
    Chat(Chat),
}

impl Conversation {
    /// Externally visible id: the group id, or the other participant's id.
    pub fn id(&self) -> &str {
        match self {
            Conversation::Group(group) => &group.id,
            Conversation::Chat(chat) => &chat.other_user_id,
        }
    }

    /// Id that messages and index status are stored under.
    pub fn conversation_id(&self) -> &str {
        match self {
            Conversation::Group(group) => &group.id,
            Conversation::Chat(chat) => &chat.conversation_id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Conversation::Group(group) => &group.name,
            Conversation::Chat(chat) => &chat.other_user_name,
        }
    }

    /// Id of the newest message according to the listing preview.
    pub fn latest_message_id(&self) -> Option<&str> {
        match self {
            Conversation::Group(group) => group.latest_message_id.as_deref(),
            Conversation::Chat(chat) => chat.latest_message_id.as_deref(),
        }
        .filter(|id| !id.is_empty())
    }

    pub fn kind(&self) -> ConversationKind {
        match self {
            Conversation::Group(_) => ConversationKind::Group,
            Conversation::Chat(_) => ConversationKind::Chat,
        }
    }
}

/// Per-conversation indexing watermark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStatus {
    pub conversation_id: String,
    /// Highest message id below which history is complete; empty if never indexed.
    pub last_indexed_id: String,
    pub updated_at: Option<DateTime<Utc>>,
}

impl IndexStatus {
    pub fn watermark(&self) -> Result<Option<u64>> {
        if self.last_indexed_id.trim().is_empty() {
            Ok(None)
        } else {
            parse_message_id(&self.last_indexed_id).map(Some)
        }
    }
}

#[cfg(test)]
#[path = "models_tests.rs"]
mod tests;
