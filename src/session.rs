use std::fmt;
use std::sync::LazyLock;

use chrono::Utc;
use chrono_tz::Tz;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ChatError;

/// Zone every persisted timestamp is rendered in (fixed UTC+3, no DST).
pub const LOG_TZ: Tz = chrono_tz::Asia::Riyadh;
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("static regex"));

/// Validated chat name, doubling as the storage key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Slug(String);

impl Slug {
    pub fn parse(name: &str) -> Result<Self, ChatError> {
        if NAME_RE.is_match(name) {
            Ok(Self(name.to_string()))
        } else {
            Err(ChatError::InvalidName(name.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Slug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into() }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: String,
    pub name: String,
    pub created_at: String,
}

impl SessionInfo {
    pub fn new(name: &Slug) -> Self {
        Self { id: short_id(6), name: name.to_string(), created_at: timestamp_now() }
    }
}

/// One persisted user/assistant exchange.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Turn {
    pub chat_id: String,
    pub model: String,
    pub created_at: String,
    pub time_zone: String,
    pub messages: Vec<Message>,
}

impl Turn {
    pub fn new(model: &str, user_text: &str, reply: String) -> Self {
        Self {
            chat_id: short_id(4),
            model: model.to_string(),
            created_at: timestamp_now(),
            time_zone: LOG_TZ.name().to_string(),
            messages: vec![Message::user(user_text), Message::assistant(reply)],
        }
    }
}

/// A single line of a session log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum LogRecord {
    #[serde(rename = "info")]
    Info(SessionInfo),
    #[serde(rename = "chats")]
    Turn(Turn),
}

impl LogRecord {
    /// Serializes to exactly one newline-terminated line.
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

pub fn timestamp_now() -> String {
    Utc::now().with_timezone(&LOG_TZ).format(TIMESTAMP_FORMAT).to_string()
}

/// Leading `len` hex digits of a fresh v4 uuid.
pub fn short_id(len: usize) -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(len);
    id
}
