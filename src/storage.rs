use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(feature = "persistence")]
use sqlx::{sqlite::SqlitePoolOptions, Row, SqlitePool};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::{StorageBackend, StorageConfig};
use crate::conversation::Conversation;
use crate::error::{AgentError, Result};

/// Durable, cross-turn copy of each thread's conversation.
///
/// `checkpoint` replaces the stored conversation for a thread. Callers only
/// checkpoint settled conversations, once per completed turn.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// The stored conversation, or an empty one for an unknown thread.
    async fn load(&self, thread_id: &str) -> Result<Conversation>;
    async fn checkpoint(&self, thread_id: &str, conversation: &Conversation) -> Result<()>;
}

#[async_trait]
impl<T: ConversationStore + ?Sized> ConversationStore for Arc<T> {
    async fn load(&self, thread_id: &str) -> Result<Conversation> {
        (**self).load(thread_id).await
    }

    async fn checkpoint(&self, thread_id: &str, conversation: &Conversation) -> Result<()> {
        (**self).checkpoint(thread_id, conversation).await
    }
}

/// Thread ids become file names and SQL keys: 1-128 ASCII letters, digits, `-` or `_`.
pub fn validate_thread_id(thread_id: &str) -> Result<()> {
    let valid = !thread_id.is_empty()
        && thread_id.len() <= 128
        && thread_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(AgentError::InvalidInput(format!(
            "invalid thread id `{thread_id}`"
        )))
    }
}

/// Process-local store; contents are lost on restart.
#[derive(Default, Clone)]
pub struct InMemoryConversationStore {
    threads: Arc<RwLock<HashMap<String, Conversation>>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn load(&self, thread_id: &str) -> Result<Conversation> {
        Ok(self
            .threads
            .read()
            .await
            .get(thread_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn checkpoint(&self, thread_id: &str, conversation: &Conversation) -> Result<()> {
        self.threads
            .write()
            .await
            .insert(thread_id.to_string(), conversation.clone());
        Ok(())
    }
}

/// One JSON file per thread under a directory. Writes go to a temporary file
/// that is renamed over the previous checkpoint.
pub struct FileConversationStore {
    directory: PathBuf,
}

impl FileConversationStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    fn path_for(&self, thread_id: &str) -> Result<PathBuf> {
        validate_thread_id(thread_id)?;
        Ok(self.directory.join(format!("{thread_id}.json")))
    }
}

#[async_trait]
impl ConversationStore for FileConversationStore {
    async fn load(&self, thread_id: &str) -> Result<Conversation> {
        let path = self.path_for(thread_id)?;
        let content = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Conversation::new())
            }
            Err(err) => {
                return Err(AgentError::Storage(format!(
                    "failed to read checkpoint `{}`: {err}",
                    path.display()
                )))
            }
        };
        serde_json::from_str(&content).map_err(|err| {
            AgentError::Storage(format!("corrupt checkpoint `{}`: {err}", path.display()))
        })
    }

    async fn checkpoint(&self, thread_id: &str, conversation: &Conversation) -> Result<()> {
        let path = self.path_for(thread_id)?;
        fs::create_dir_all(&self.directory).await.map_err(|err| {
            AgentError::Storage(format!(
                "failed to create `{}`: {err}",
                self.directory.display()
            ))
        })?;
        let serialized = serde_json::to_vec(conversation)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serialized)
            .await
            .map_err(|err| AgentError::Storage(format!("failed to persist checkpoint: {err}")))?;
        fs::rename(&tmp, &path).await.map_err(|err| {
            AgentError::Storage(format!(
                "failed to replace `{}`: {err}",
                path.display()
            ))
        })?;
        debug!(thread_id, messages = conversation.len(), "checkpoint written");
        Ok(())
    }
}

#[cfg(feature = "persistence")]
pub struct SqlConversationStore {
    pool: SqlitePool,
}

#[cfg(feature = "persistence")]
impl SqlConversationStore {
    const INIT_STATEMENT: &'static str = r#"
        CREATE TABLE IF NOT EXISTS checkpoints (
            thread_id TEXT PRIMARY KEY,
            payload TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
    "#;

    pub async fn connect(connection_url: impl AsRef<str>) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(connection_url.as_ref())
            .await
            .map_err(|err| {
                AgentError::Storage(format!(
                    "failed connecting to SQL backend `{}`: {err}",
                    connection_url.as_ref()
                ))
            })?;

        sqlx::query(Self::INIT_STATEMENT)
            .execute(&pool)
            .await
            .map_err(|err| AgentError::Storage(format!("failed initializing schema: {err}")))?;

        Ok(Self { pool })
    }
}

#[cfg(feature = "persistence")]
#[async_trait]
impl ConversationStore for SqlConversationStore {
    async fn load(&self, thread_id: &str) -> Result<Conversation> {
        let row = sqlx::query("SELECT payload FROM checkpoints WHERE thread_id = ?")
            .bind(thread_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| AgentError::Storage(format!("failed loading checkpoint: {err}")))?;

        let Some(row) = row else {
            return Ok(Conversation::new());
        };
        let payload: String = row.try_get("payload").map_err(|err| {
            AgentError::Storage(format!("failed decoding checkpoint payload: {err}"))
        })?;
        serde_json::from_str(&payload)
            .map_err(|err| AgentError::Storage(format!("invalid checkpoint payload: {err}")))
    }

    async fn checkpoint(&self, thread_id: &str, conversation: &Conversation) -> Result<()> {
        let payload = serde_json::to_string(conversation)?;
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();
        sqlx::query(
            "INSERT INTO checkpoints (thread_id, payload, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(thread_id) DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at",
        )
        .bind(thread_id)
        .bind(payload)
        .bind(now)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(|err| AgentError::Storage(format!("failed writing checkpoint: {err}")))
    }
}

/// Builds the store selected in configuration.
pub async fn store_from_config(cfg: &StorageConfig) -> Result<Arc<dyn ConversationStore>> {
    match cfg.backend {
        StorageBackend::Memory => Ok(Arc::new(InMemoryConversationStore::new())),
        StorageBackend::File => Ok(Arc::new(FileConversationStore::new(&cfg.directory))),
        #[cfg(feature = "persistence")]
        StorageBackend::Sqlite => {
            let url = cfg.database_url.as_deref().ok_or_else(|| {
                AgentError::Configuration("sqlite storage requires `database_url`".into())
            })?;
            Ok(Arc::new(SqlConversationStore::connect(url).await?))
        }
        #[cfg(not(feature = "persistence"))]
        StorageBackend::Sqlite => Err(AgentError::Configuration(
            "sqlite storage requires the `persistence` feature".into(),
        )),
    }
}
