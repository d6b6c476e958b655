// src/error.rs
use thiserror::Error;

/// Failure of an external collaborator: database, embedding/generation
/// API, or the vector store. Calls are attempted once; retry policy is
/// left to the caller.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("vector store error: {0}")]
    Qdrant(#[from] qdrant_client::QdrantError),

    #[error("{0}")]
    Api(String),
}

/// Failure of one conversational turn, tagged with the pipeline stage
/// that aborted it. The original error is logged server-side; clients
/// only ever see a generic reply.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error("a turn is already in flight for this chat")]
    TurnInProgress,

    #[error("message store: {0}")]
    Store(#[source] ServiceError),

    #[error("embedding service: {0}")]
    Embedding(#[source] ServiceError),

    #[error("generation service: {0}")]
    Generation(#[source] ServiceError),

    #[error("memory index: {0}")]
    Memory(#[source] ServiceError),
}
