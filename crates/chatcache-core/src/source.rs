//! Remote conversation source.
//!
//! [`MessageSource`] is what the indexer pulls listings and history pages
//! from. [`HttpSource`] implements it against a GroupMe-v3-style REST API.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::OnceCell;

use crate::config::RemoteConfig;
use crate::error::{Error, Result};
use crate::models::{Chat, Conversation, Group, Message};

/// Source of conversation listings and message pages.
///
/// Pages are returned newest first. An empty page means there is no more
/// history in that direction.
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn list_groups(&self) -> Result<Vec<Conversation>>;

    async fn list_chats(&self) -> Result<Vec<Conversation>>;

    async fn fetch_newest(&self, conversation: &Conversation) -> Result<Vec<Message>>;

    async fn fetch_before(&self, conversation: &Conversation, before_id: &str) -> Result<Vec<Message>>;
}

/// REST client for the messaging service.
pub struct HttpSource {
    client: reqwest::Client,
    base_url: String,
    token: String,
    page_size: u32,
    user_id: OnceCell<String>,
}

impl std::fmt::Debug for HttpSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSource")
            .field("base_url", &self.base_url)
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

impl HttpSource {
    /// Build a client from config. Fails with [`Error::Unavailable`] without a token.
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let token = config
            .token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| Error::Unavailable("no access token configured".to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("chatcache/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token,
            page_size: config.page_size.max(1),
            user_id: OnceCell::new(),
        })
    }

    /// GET `path` and unwrap the `{"response": ...}` envelope.
    ///
    /// `Ok(None)` covers both HTTP 304 and a null response body.
    async fn get<T: DeserializeOwned + Send>(&self, path: &str, query: &[(&str, String)]) -> Result<Option<T>> {
        let url = format!("{}/{path}", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("X-Access-Token", &self.token)
            .query(query)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            return Ok(None);
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::Remote(format!("GET {path}: HTTP {status}")));
        }
        if !status.is_success() {
            return Err(Error::Unavailable(format!("GET {path}: HTTP {status}")));
        }

        let body = response.text().await?;
        let envelope: Envelope<T> = serde_json::from_str(&body)
            .map_err(|e| Error::Parse(format!("GET {path}: {e}")))?;
        Ok(envelope.response)
    }

    async fn current_user_id(&self) -> Result<&str> {
        let id = self
            .user_id
            .get_or_try_init(|| async {
                let me: Option<WireUser> = self.get("users/me", &[]).await?;
                me.map(|user| user.id)
                    .ok_or_else(|| Error::Parse("users/me returned no user".to_string()))
            })
            .await?;
        Ok(id.as_str())
    }

    fn messages_query(&self, before_id: Option<&str>) -> Vec<(&'static str, String)> {
        let mut query = vec![("limit", self.page_size.to_string())];
        if let Some(before_id) = before_id {
            query.push(("before_id", before_id.to_string()));
        }
        query
    }

    async fn fetch_page(&self, conversation: &Conversation, before_id: Option<&str>) -> Result<Vec<Message>> {
        match conversation {
            Conversation::Group(group) => {
                let page: Option<GroupMessagesPage> = self
                    .get(&format!("groups/{}/messages", group.id), &self.messages_query(before_id))
                    .await?;
                Ok(page
                    .map(|page| page.messages)
                    .unwrap_or_default()
                    .into_iter()
                    .map(|wire| message_from_wire(wire, &group.id))
                    .collect())
            }
            Conversation::Chat(chat) => {
                let mut query = self.messages_query(before_id);
                query.push(("other_user_id", chat.other_user_id.clone()));
                let page: Option<DirectMessagesPage> = self.get("direct_messages", &query).await?;
                Ok(page
                    .map(|page| page.direct_messages)
                    .unwrap_or_default()
                    .into_iter()
                    .map(|wire| message_from_wire(wire, &chat.conversation_id))
                    .collect())
            }
        }
    }
}

#[async_trait]
impl MessageSource for HttpSource {
    async fn list_groups(&self) -> Result<Vec<Conversation>> {
        let mut groups = Vec::new();
        for page in 1u32.. {
            let items: Option<Vec<WireGroup>> = self
                .get(
                    "groups",
                    &[
                        ("omit", "memberships".to_string()),
                        ("per_page", self.page_size.to_string()),
                        ("page", page.to_string()),
                    ],
                )
                .await?;
            let items = items.unwrap_or_default();
            if items.is_empty() {
                break;
            }
            groups.extend(items.into_iter().map(group_from_wire));
        }
        tracing::debug!(count = groups.len(), "Listed groups");
        Ok(groups)
    }

    async fn list_chats(&self) -> Result<Vec<Conversation>> {
        let mut raw = Vec::new();
        for page in 1u32.. {
            let items: Option<Vec<WireChat>> = self
                .get(
                    "chats",
                    &[
                        ("per_page", self.page_size.to_string()),
                        ("page", page.to_string()),
                    ],
                )
                .await?;
            let items = items.unwrap_or_default();
            if items.is_empty() {
                break;
            }
            raw.extend(items);
        }

        let mut chats = Vec::with_capacity(raw.len());
        for item in raw {
            let known = item
                .last_message
                .as_ref()
                .and_then(|m| m.conversation_id.clone());
            let conversation_id = match known {
                Some(id) => id,
                None => Chat::composite_id(self.current_user_id().await?, &item.other_user.id),
            };
            chats.push(chat_from_wire(item, conversation_id));
        }
        tracing::debug!(count = chats.len(), "Listed chats");
        Ok(chats)
    }

    async fn fetch_newest(&self, conversation: &Conversation) -> Result<Vec<Message>> {
        self.fetch_page(conversation, None).await
    }

    async fn fetch_before(&self, conversation: &Conversation, before_id: &str) -> Result<Vec<Message>> {
        self.fetch_page(conversation, Some(before_id)).await
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    response: Option<T>,
}

#[derive(Debug, Deserialize)]
struct WireUser {
    id: String,
}

#[derive(Debug, Deserialize)]
struct WireGroup {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    messages: Option<WireGroupMessages>,
}

#[derive(Debug, Deserialize)]
struct WireGroupMessages {
    #[serde(default)]
    last_message_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireChat {
    other_user: WireOtherUser,
    #[serde(default)]
    last_message: Option<WireMessage>,
}

#[derive(Debug, Deserialize)]
struct WireOtherUser {
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct GroupMessagesPage {
    #[serde(default)]
    messages: Vec<WireMessage>,
}

#[derive(Debug, Deserialize)]
struct DirectMessagesPage {
    #[serde(default)]
    direct_messages: Vec<WireMessage>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    id: String,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    created_at: i64,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    sender_id: Option<String>,
    #[serde(default)]
    name: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    system: bool,
    #[serde(default)]
    favorited_by: Vec<String>,
    #[serde(default)]
    attachments: serde_json::Value,
}

fn group_from_wire(wire: WireGroup) -> Conversation {
    Conversation::Group(Group {
        id: wire.id,
        name: wire.name,
        latest_message_id: wire.messages.and_then(|m| m.last_message_id),
    })
}

fn chat_from_wire(wire: WireChat, conversation_id: String) -> Conversation {
    Conversation::Chat(Chat {
        other_user_id: wire.other_user.id,
        other_user_name: wire.other_user.name,
        conversation_id,
        latest_message_id: wire.last_message.map(|m| m.id),
    })
}

/// Pages are fetched per conversation, so the owning id comes from the caller.
fn message_from_wire(wire: WireMessage, conversation_id: &str) -> Message {
    let attachments = if wire.attachments.is_null() {
        serde_json::json!([])
    } else {
        wire.attachments
    };
    Message {
        id: wire.id,
        conversation_id: conversation_id.to_string(),
        created_at: chrono::DateTime::from_timestamp(wire.created_at, 0)
            .unwrap_or_default()
            .with_timezone(&Utc),
        sender_id: wire.sender_id.or(wire.user_id).unwrap_or_default(),
        sender_name: wire.name,
        text: wire.text,
        attachments,
        liked_by: wire.favorited_by,
        system: wire.system,
    }
}

#[cfg(test)]
#[path = "source_tests.rs"]
mod tests;
