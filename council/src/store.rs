//! Conversation persistence: one JSON file per conversation.
//!
//! Writes go to a temp file in the same directory followed by a
//! rename, so readers never observe a half-written record. Ordering
//! across conversations is not promised; listings sort in memory by
//! `created_at` descending.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::error::{CouncilError, CouncilResult};
use crate::types::{Conversation, Message};

/// Store operations the deliberation core consumes.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Create a conversation with a fresh id and placeholder title.
    async fn create_conversation(&self) -> CouncilResult<Conversation>;
    async fn get(&self, id: &Uuid) -> CouncilResult<Conversation>;
    /// Non-deleted conversations, newest first.
    async fn list_active(&self) -> CouncilResult<Vec<Conversation>>;
    /// Soft-deleted conversations, newest first.
    async fn list_deleted(&self) -> CouncilResult<Vec<Conversation>>;
    async fn append_message(&self, id: &Uuid, message: Message) -> CouncilResult<()>;
    async fn update_title(&self, id: &Uuid, title: &str) -> CouncilResult<()>;
    async fn soft_delete(&self, id: &Uuid) -> CouncilResult<()>;
    async fn restore(&self, id: &Uuid) -> CouncilResult<()>;
    async fn hard_delete(&self, id: &Uuid) -> CouncilResult<()>;
}

/// File-per-conversation store rooted at one directory.
pub struct FileStore {
    dir: PathBuf,
    /// Serializes read-modify-write cycles; file renames alone do not
    /// protect two concurrent mutations of the same record.
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(dir: &Path) -> CouncilResult<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, id: &Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn load(&self, id: &Uuid) -> CouncilResult<Conversation> {
        let path = self.path_for(id);
        if !path.exists() {
            return Err(CouncilError::NotFound(id.to_string()));
        }
        let raw = std::fs::read_to_string(&path)?;
        serde_json::from_str(&raw)
            .map_err(|e| CouncilError::Corrupt(format!("{}: {}", path.display(), e)))
    }

    fn save(&self, conversation: &Conversation) -> CouncilResult<()> {
        let path = self.path_for(&conversation.id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(conversation)
            .map_err(|e| CouncilError::Corrupt(e.to_string()))?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    async fn mutate<F>(&self, id: &Uuid, apply: F) -> CouncilResult<()>
    where
        F: FnOnce(&mut Conversation),
    {
        let _guard = self.write_lock.lock().await;
        let mut conversation = self.load(id)?;
        apply(&mut conversation);
        self.save(&conversation)
    }

    fn load_all(&self) -> CouncilResult<Vec<Conversation>> {
        let mut conversations = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<Conversation>(&raw) {
                Ok(conversation) => conversations.push(conversation),
                Err(e) => warn!("skipping corrupt record {}: {}", path.display(), e),
            }
        }
        conversations.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(conversations)
    }
}

#[async_trait]
impl ConversationStore for FileStore {
    async fn create_conversation(&self) -> CouncilResult<Conversation> {
        let _guard = self.write_lock.lock().await;
        let conversation = Conversation::new();
        self.save(&conversation)?;
        Ok(conversation)
    }

    async fn get(&self, id: &Uuid) -> CouncilResult<Conversation> {
        self.load(id)
    }

    async fn list_active(&self) -> CouncilResult<Vec<Conversation>> {
        Ok(self
            .load_all()?
            .into_iter()
            .filter(|c| !c.deleted)
            .collect())
    }

    async fn list_deleted(&self) -> CouncilResult<Vec<Conversation>> {
        Ok(self.load_all()?.into_iter().filter(|c| c.deleted).collect())
    }

    async fn append_message(&self, id: &Uuid, message: Message) -> CouncilResult<()> {
        self.mutate(id, |c| c.messages.push(message)).await
    }

    async fn update_title(&self, id: &Uuid, title: &str) -> CouncilResult<()> {
        let title = title.to_string();
        self.mutate(id, move |c| c.title = title).await
    }

    async fn soft_delete(&self, id: &Uuid) -> CouncilResult<()> {
        self.mutate(id, |c| c.soft_delete()).await
    }

    async fn restore(&self, id: &Uuid) -> CouncilResult<()> {
        self.mutate(id, |c| c.restore()).await
    }

    async fn hard_delete(&self, id: &Uuid) -> CouncilResult<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(id);
        if !path.exists() {
            return Err(CouncilError::NotFound(id.to_string()));
        }
        std::fs::remove_file(path)?;
        Ok(())
    }
}
