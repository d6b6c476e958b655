// src/orchestrator.rs
//
// The per-message turn pipeline. One inbound chat message, bound to the
// connection's authenticated identity, produces exactly one reply:
//
//   1. persist user message + embed it        (concurrent, both must succeed)
//   2. insert user memory record
//   3. query memory + read recent history     (concurrent)
//   4. compose generation turns (LTM context turn, then STM history)
//   5. generate reply, hand it back to the caller immediately
//   6. persist reply + embed it, insert its memory record
//      (background; failures logged, client is not re-notified)
//
// One turn may be in flight per chat at a time. A second ai-message for
// the same chat is rejected with TurnInProgress instead of interleaving
// its store reads/writes with the running turn. The slot is held until
// the tail persistence finishes, so a turn's reply is durable before
// the next turn reads history.
use crate::error::{ServiceError, TurnError};
use crate::gemini_client::{Embedder, Generator};
use crate::memory::{MemoryIndex, MemoryRecord};
use crate::message_store::MessageStore;
use crate::models::chat::{ChatTurn, Message, Role};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Short-term memory: how many recent messages of the chat are replayed
/// verbatim into the generation request.
const HISTORY_LIMIT: i64 = 20;

/// Long-term memory: how many nearest records are retrieved per turn.
const MEMORY_TOP_K: u64 = 3;

/// Immutable connection identity, captured once at handshake time and
/// passed into every turn. Never re-checked or mutated per message.
#[derive(Debug, Clone)]
pub struct ConnectionIdentity {
    pub user_id: Uuid,
    pub email: String,
}

pub struct TurnOrchestrator {
    store: Arc<dyn MessageStore>,
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn Generator>,
    memory: Arc<dyn MemoryIndex>,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
}

/// Releases a chat's in-flight slot on drop.
struct TurnGuard {
    chat_id: Uuid,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        if let Ok(mut chats) = self.in_flight.lock() {
            chats.remove(&self.chat_id);
        }
    }
}

impl TurnOrchestrator {
    pub fn new(
        store: Arc<dyn MessageStore>,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
        memory: Arc<dyn MemoryIndex>,
    ) -> Self {
        Self {
            store,
            embedder,
            generator,
            memory,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn begin_turn(&self, chat_id: Uuid) -> Option<TurnGuard> {
        let mut chats = self.in_flight.lock().ok()?;
        if !chats.insert(chat_id) {
            return None;
        }
        Some(TurnGuard {
            chat_id,
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    /// Runs one turn and returns the reply text. The model reply is not
    /// yet durable when this returns; tail persistence runs in the
    /// background so the caller can emit the reply immediately.
    pub async fn run_turn(
        &self,
        identity: &ConnectionIdentity,
        chat_id: Uuid,
        content: &str,
    ) -> Result<String, TurnError> {
        let guard = self
            .begin_turn(chat_id)
            .ok_or(TurnError::TurnInProgress)?;

        // Step 1: persist the inbound message and embed it. If either
        // fails the turn fails and no memory write is attempted.
        let (user_message, user_vector) = tokio::try_join!(
            async {
                self.store
                    .append(chat_id, Some(identity.user_id), content, Role::User)
                    .await
                    .map_err(TurnError::Store)
            },
            async {
                self.embedder
                    .embed(content)
                    .await
                    .map_err(TurnError::Embedding)
            },
        )?;

        // Step 2: memory consistency is prioritized over availability,
        // so an insert failure aborts the turn.
        self.memory
            .insert(
                user_vector.clone(),
                MemoryRecord {
                    message_id: user_message.id,
                    chat_id,
                    user_id: identity.user_id,
                    text: content.to_string(),
                },
            )
            .await
            .map_err(TurnError::Memory)?;

        // Step 3: long-term and short-term context. The query is scoped
        // to this user and excludes the message we just inserted, which
        // would otherwise rank first against its own embedding.
        let (memories, history) = tokio::try_join!(
            async {
                self.memory
                    .query(
                        &user_vector,
                        MEMORY_TOP_K,
                        identity.user_id,
                        Some(user_message.id),
                    )
                    .await
                    .map_err(TurnError::Memory)
            },
            async {
                self.store
                    .recent_history(chat_id, HISTORY_LIMIT)
                    .await
                    .map_err(TurnError::Store)
            },
        )?;

        // Steps 4 and 5.
        let turns = build_generation_turns(&memories, &history);
        let reply = self
            .generator
            .generate(&turns)
            .await
            .map_err(TurnError::Generation)?;

        // Step 6: the caller already has the reply; persistence of the
        // model turn is best-effort. The guard moves into the task so
        // the chat stays serialized until the reply is durable.
        self.spawn_reply_persistence(guard, identity.user_id, chat_id, reply.clone());

        Ok(reply)
    }

    fn spawn_reply_persistence(
        &self,
        guard: TurnGuard,
        user_id: Uuid,
        chat_id: Uuid,
        reply: String,
    ) {
        let store = Arc::clone(&self.store);
        let embedder = Arc::clone(&self.embedder);
        let memory = Arc::clone(&self.memory);

        tokio::spawn(async move {
            let _guard = guard;

            let persisted = tokio::try_join!(
                async {
                    store
                        .append(chat_id, None, &reply, Role::Model)
                        .await
                        .map_err(TurnError::Store)
                },
                async { embedder.embed(&reply).await.map_err(TurnError::Embedding) },
            );

            match persisted {
                Ok((model_message, reply_vector)) => {
                    let record = MemoryRecord {
                        message_id: model_message.id,
                        chat_id,
                        user_id,
                        text: reply,
                    };
                    if let Err(e) = memory.insert(reply_vector, record).await {
                        tracing::error!(
                            "Failed to store memory for model reply in chat {}: {}",
                            chat_id,
                            e
                        );
                    }
                }
                Err(e) => {
                    tracing::error!(
                        "Failed to persist model reply for chat {}: {}",
                        chat_id,
                        e
                    );
                }
            }
        });
    }
}

/// Composes the generation request: a synthetic leading user-role turn
/// carrying the retrieved long-term memory (newline-joined), followed by
/// the short-term history in chronological order with original roles.
/// The just-persisted user message arrives via the history read.
fn build_generation_turns(memories: &[MemoryRecord], history: &[Message]) -> Vec<ChatTurn> {
    let mut turns = Vec::with_capacity(history.len() + 1);

    if !memories.is_empty() {
        let recalled = memories
            .iter()
            .map(|m| m.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        turns.push(ChatTurn {
            role: Role::User,
            content: format!("Relevant context from earlier conversations:\n{}", recalled),
        });
    }

    for message in history {
        turns.push(ChatTurn {
            role: message.role,
            content: message.content.clone(),
        });
    }

    turns
}
