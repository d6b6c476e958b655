// src/message_store.rs
use crate::error::ServiceError;
use crate::models::chat::{Message, Role};
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

/// Append-only persistence of chat turns. Messages are never updated or
/// deleted; ordering within a chat is by creation time.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append(
        &self,
        chat_id: Uuid,
        author_id: Option<Uuid>,
        content: &str,
        role: Role,
    ) -> Result<Message, ServiceError>;

    /// At most `limit` most recent messages of a chat, oldest first.
    async fn recent_history(&self, chat_id: Uuid, limit: i64) -> Result<Vec<Message>, ServiceError>;
}

pub struct PgMessageStore {
    pool: PgPool,
}

impl PgMessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn append(
        &self,
        chat_id: Uuid,
        author_id: Option<Uuid>,
        content: &str,
        role: Role,
    ) -> Result<Message, ServiceError> {
        let message = sqlx::query_as::<_, Message>(
            "INSERT INTO messages (chat_id, author_id, content, role)
             VALUES ($1, $2, $3, $4)
             RETURNING id, chat_id, author_id, content, role, created_at",
        )
        .bind(chat_id)
        .bind(author_id)
        .bind(content)
        .bind(role)
        .fetch_one(&self.pool)
        .await?;

        Ok(message)
    }

    async fn recent_history(
        &self,
        chat_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Message>, ServiceError> {
        // Fetch newest-first so the read is bounded to the tail of a
        // potentially long chat, then reverse to chronological order.
        let mut messages = sqlx::query_as::<_, Message>(
            "SELECT id, chat_id, author_id, content, role, created_at
             FROM messages
             WHERE chat_id = $1
             ORDER BY created_at DESC
             LIMIT $2",
        )
        .bind(chat_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        messages.reverse();
        Ok(messages)
    }
}
