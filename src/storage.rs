use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::error::{ChatError, Result};
use crate::session::{LogRecord, Message, SessionInfo, Slug};

const LOG_EXTENSION: &str = "jsonl";

/// Conversation history rebuilt from a session log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct History {
    pub messages: Vec<Message>,
    /// Lines that were malformed or carried no recognised role.
    pub skipped: usize,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, name: &str, model: Option<&str>) -> Result<SessionInfo>;
    async fn exists(&self, name: &Slug) -> bool;
    async fn read(&self, name: &str) -> Result<String>;
    async fn list_all(&self) -> Result<Vec<String>>;
    async fn append(&self, name: &Slug, record: &LogRecord) -> Result<()>;
    async fn load_history(&self, name: &Slug) -> Result<History>;
}

/// One append-only `<slug>.jsonl` file per chat under a data directory.
#[derive(Debug, Clone)]
pub struct JsonlSessionStore {
    dir: PathBuf,
}

impl JsonlSessionStore {
    pub async fn initialize(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn log_path(&self, name: &Slug) -> PathBuf {
        self.dir.join(format!("{}.{}", name, LOG_EXTENSION))
    }
}

#[async_trait]
impl SessionStore for JsonlSessionStore {
    async fn create(&self, name: &str, model: Option<&str>) -> Result<SessionInfo> {
        let slug = Slug::parse(name)?;
        let info = SessionInfo::new(&slug);
        let line = LogRecord::Info(info.clone()).to_line()?;
        match write_line(self.log_path(&slug), line, LineMode::CreateNew).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(ChatError::AlreadyExists(slug.to_string()));
            }
            Err(e) => return Err(e.into()),
        }
        metrics::counter!("chat_sessions_created_total").increment(1);
        tracing::info!(chat = %slug, id = %info.id, model = ?model, "chat created");
        Ok(info)
    }

    async fn exists(&self, name: &Slug) -> bool {
        fs::try_exists(self.log_path(name)).await.unwrap_or(false)
    }

    async fn read(&self, name: &str) -> Result<String> {
        let slug = Slug::parse(name)?;
        match fs::read_to_string(self.log_path(&slug)).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(ChatError::NotFound(slug.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_all(&self) -> Result<Vec<String>> {
        let mut entries = fs::read_dir(&self.dir).await?;
        let mut chats = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(LOG_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else { continue };
            let created_at = read_created_at(&path).await;
            chats.push((created_at, stem.to_string()));
        }
        // unreadable logs (None) sort first, then by creation time, then name
        chats.sort();
        Ok(chats.into_iter().map(|(_, name)| name).collect())
    }

    async fn append(&self, name: &Slug, record: &LogRecord) -> Result<()> {
        let line = record.to_line()?;
        match write_line(self.log_path(name), line, LineMode::Append).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(ChatError::NotFound(name.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_history(&self, name: &Slug) -> Result<History> {
        let content = self.read(name.as_str()).await?;
        let history = parse_history(&content);
        if history.skipped > 0 {
            tracing::debug!(
                chat = %name,
                skipped = history.skipped,
                "skipped log lines while loading history"
            );
        }
        Ok(history)
    }
}

/// Lines accepted when rebuilding history. Anything else is skipped.
#[derive(Deserialize)]
#[serde(untagged)]
enum HistoryLine {
    Record(LogRecord),
    Bare(Message),
}

pub fn parse_history(content: &str) -> History {
    let mut history = History::default();
    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<HistoryLine>(line) {
            Ok(HistoryLine::Record(LogRecord::Info(_))) if idx == 0 => {}
            Ok(HistoryLine::Record(LogRecord::Turn(turn))) => {
                history.messages.extend(turn.messages);
            }
            Ok(HistoryLine::Bare(msg)) => history.messages.push(msg),
            Ok(HistoryLine::Record(LogRecord::Info(_))) | Err(_) => history.skipped += 1,
        }
    }
    history
}

#[derive(Debug, Clone, Copy)]
enum LineMode {
    CreateNew,
    Append,
}

/// Writes `line` with one blocking `write_all` on an `O_APPEND` (or `O_EXCL`) handle.
///
/// tokio's async file splits large buffers into several `write(2)` calls, which
/// lets concurrent appends to the same log interleave.
async fn write_line(path: PathBuf, line: String, mode: LineMode) -> std::io::Result<()> {
    tokio::task::spawn_blocking(move || {
        use std::io::Write;
        let mut opts = std::fs::OpenOptions::new();
        match mode {
            LineMode::CreateNew => opts.write(true).create_new(true),
            LineMode::Append => opts.append(true),
        };
        let mut file = opts.open(&path)?;
        file.write_all(line.as_bytes())
    })
    .await
    .map_err(std::io::Error::other)?
}

async fn read_created_at(path: &Path) -> Option<String> {
    let file = fs::File::open(path).await.ok()?;
    let first = BufReader::new(file).lines().next_line().await.ok()??;
    match serde_json::from_str::<LogRecord>(&first).ok()? {
        LogRecord::Info(info) => Some(info.created_at),
        LogRecord::Turn(_) => None,
    }
}
