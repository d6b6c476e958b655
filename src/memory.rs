// src/memory.rs
//
// Long-term memory: a Qdrant collection of per-message embeddings.
// Records are write-once and queried by vector similarity, always
// scoped to one user. One user's memory must never leak into another
// user's query results.
use crate::error::ServiceError;
use crate::gemini_client::EMBEDDING_DIM;
use async_trait::async_trait;
use qdrant_client::qdrant::{
    condition::ConditionOneOf, Condition, CreateCollectionBuilder,
    CreateFieldIndexCollectionBuilder, Distance, FieldType, Filter, HasIdCondition, PointId,
    PointStruct, SearchPointsBuilder, UpsertPointsBuilder, VectorParamsBuilder,
};
use qdrant_client::{Payload, Qdrant};
use serde_json::json;
use uuid::Uuid;

/// One memory entry: the embedding of a persisted message plus enough
/// metadata to scope and render it. The message id doubles as the point
/// id in the collection.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryRecord {
    pub message_id: Uuid,
    pub chat_id: Uuid,
    pub user_id: Uuid,
    pub text: String,
}

#[async_trait]
pub trait MemoryIndex: Send + Sync {
    /// Write-once insert of (vector, record).
    async fn insert(&self, vector: Vec<f32>, record: MemoryRecord) -> Result<(), ServiceError>;

    /// Nearest-first records for `user_id`, at most `limit`, optionally
    /// excluding one message id (the message whose turn is asking).
    async fn query(
        &self,
        vector: &[f32],
        limit: u64,
        user_id: Uuid,
        exclude_message_id: Option<Uuid>,
    ) -> Result<Vec<MemoryRecord>, ServiceError>;
}

pub struct QdrantMemoryIndex {
    client: Qdrant,
    collection_name: String,
}

impl QdrantMemoryIndex {
    pub fn new(url: &str, api_key: Option<String>) -> Result<Self, ServiceError> {
        let mut client_builder = Qdrant::from_url(url);

        if let Some(key) = api_key {
            client_builder = client_builder.api_key(key);
        }

        let client = client_builder.build()?;

        Ok(Self {
            client,
            collection_name: "chat_memories".to_string(),
        })
    }

    /// Creates the collection and its payload indexes if they don't
    /// exist yet. Safe to call on every startup.
    pub async fn ensure_collection(&self) -> Result<(), ServiceError> {
        let result = self
            .client
            .create_collection(
                CreateCollectionBuilder::new(&self.collection_name).vectors_config(
                    VectorParamsBuilder::new(EMBEDDING_DIM as u64, Distance::Cosine),
                ),
            )
            .await;

        match result {
            Ok(_) => {
                tracing::info!("Created Qdrant collection: {}", self.collection_name);
            }
            Err(e) if e.to_string().contains("already exists") => {
                tracing::debug!(
                    "Qdrant collection '{}' already exists, ensuring indexes",
                    self.collection_name
                );
            }
            Err(e) => return Err(e.into()),
        }

        // Keyword index on user_id: every query filters on it.
        let index_result = self
            .client
            .create_field_index(
                CreateFieldIndexCollectionBuilder::new(
                    &self.collection_name,
                    "user_id",
                    FieldType::Keyword,
                )
                .wait(true),
            )
            .await;

        if let Err(e) = index_result {
            if e.to_string().contains("already exists") {
                tracing::debug!("user_id index already exists, skipping");
            } else {
                return Err(e.into());
            }
        }

        Ok(())
    }
}

#[async_trait]
impl MemoryIndex for QdrantMemoryIndex {
    async fn insert(&self, vector: Vec<f32>, record: MemoryRecord) -> Result<(), ServiceError> {
        let payload: Payload = json!({
            "chat_id": record.chat_id.to_string(),
            "user_id": record.user_id.to_string(),
            "text": record.text,
        })
        .try_into()
        .map_err(|e| ServiceError::Api(format!("invalid memory payload: {}", e)))?;

        let point = PointStruct::new(record.message_id.to_string(), vector, payload);

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection_name, vec![point]).wait(true))
            .await?;

        tracing::debug!("Stored memory record for message {}", record.message_id);
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        limit: u64,
        user_id: Uuid,
        exclude_message_id: Option<Uuid>,
    ) -> Result<Vec<MemoryRecord>, ServiceError> {
        let mut filter = Filter {
            must: vec![Condition::matches("user_id", user_id.to_string())],
            ..Default::default()
        };

        if let Some(message_id) = exclude_message_id {
            filter.must_not.push(Condition {
                condition_one_of: Some(ConditionOneOf::HasId(HasIdCondition {
                    has_id: vec![PointId::from(message_id.to_string())],
                })),
            });
        }

        let search_result = self
            .client
            .search_points(
                SearchPointsBuilder::new(&self.collection_name, vector.to_vec(), limit)
                    .filter(filter)
                    .with_payload(true),
            )
            .await?;

        // Nearest-first, as returned by the index. Malformed points are
        // skipped rather than failing the whole query.
        let mut records = Vec::new();
        for scored_point in search_result.result {
            let point_id = match scored_point.id.and_then(|id| id.point_id_options) {
                Some(qdrant_client::qdrant::point_id::PointIdOptions::Uuid(uuid)) => uuid,
                _ => continue,
            };
            let Ok(message_id) = point_id.parse::<Uuid>() else {
                continue;
            };

            let payload = scored_point.payload;
            let chat_id = payload
                .get("chat_id")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<Uuid>().ok());
            let record_user_id = payload
                .get("user_id")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<Uuid>().ok());
            let text = payload
                .get("text")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());

            let (Some(chat_id), Some(record_user_id), Some(text)) =
                (chat_id, record_user_id, text)
            else {
                continue;
            };

            records.push(MemoryRecord {
                message_id,
                chat_id,
                user_id: record_user_id,
                text,
            });
        }

        Ok(records)
    }
}
