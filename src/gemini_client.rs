// src/gemini_client.rs
//
// Gemini API client covering both model calls the turn pipeline needs:
// text embeddings (text-embedding-004, 768 dims) and reply generation
// (gemini-2.5-flash). Both are stateless request/response calls with no
// retries; failures surface as ServiceError.
use crate::error::ServiceError;
use crate::models::chat::ChatTurn;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// Dimensionality of the embedding vectors. The memory index collection
/// is created with the same size.
pub const EMBEDDING_DIM: usize = 768;

/// Converts text to a fixed-size vector via an external model call.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ServiceError>;
}

/// Converts a role-tagged conversation into one reply string.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, turns: &[ChatTurn]) -> Result<String, ServiceError>;
}

#[derive(Debug, Clone)]
pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<Content>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    text: String,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Serialize)]
struct EmbedContentRequest {
    model: String,
    content: EmbedContent,
    #[serde(rename = "outputDimensionality")]
    output_dimensionality: Option<u32>,
}

#[derive(Debug, Serialize)]
struct EmbedContent {
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct EmbedContentResponse {
    embedding: Embedding,
}

#[derive(Debug, Deserialize)]
struct Embedding {
    values: Vec<f32>,
}

impl GeminiClient {
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
        }
    }

    async fn generate_content(&self, contents: Vec<Content>) -> Result<String, ServiceError> {
        let url = format!(
            "{}/models/gemini-2.5-flash:generateContent?key={}",
            self.base_url, self.api_key
        );

        let request = GenerateContentRequest { contents };

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(ServiceError::Api(format!(
                "Gemini API error ({}): {}",
                status, error_text
            )));
        }

        let result: GenerateContentResponse = response.json().await?;

        result
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .and_then(|c| c.parts.into_iter().next())
            .map(|p| p.text)
            .ok_or_else(|| ServiceError::Api("Gemini returned no candidates".to_string()))
    }

    async fn embed_content(&self, text: &str) -> Result<Vec<f32>, ServiceError> {
        let url = format!(
            "{}/models/text-embedding-004:embedContent?key={}",
            self.base_url, self.api_key
        );

        let request = EmbedContentRequest {
            model: "models/text-embedding-004".to_string(),
            content: EmbedContent {
                parts: vec![Part {
                    text: text.to_string(),
                }],
            },
            output_dimensionality: Some(EMBEDDING_DIM as u32),
        };

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(ServiceError::Api(format!(
                "Gemini Embedding API error ({}): {}",
                status, error_text
            )));
        }

        let result: EmbedContentResponse = response.json().await?;
        Ok(result.embedding.values)
    }
}

#[async_trait]
impl Embedder for GeminiClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ServiceError> {
        self.embed_content(text).await
    }
}

#[async_trait]
impl Generator for GeminiClient {
    async fn generate(&self, turns: &[ChatTurn]) -> Result<String, ServiceError> {
        let contents = turns
            .iter()
            .map(|turn| Content {
                role: Some(turn.role.as_str().to_string()),
                parts: vec![Part {
                    text: turn.content.clone(),
                }],
            })
            .collect();

        self.generate_content(contents).await
    }
}
