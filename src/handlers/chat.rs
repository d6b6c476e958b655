// src/handlers/chat.rs
//
// The realtime channel and the chat REST routes. The websocket is
// authenticated once, at handshake time, via the same session cookie as
// the HTTP routes; the resolved identity is pinned for the connection's
// lifetime and passed into every turn.
use crate::error::TurnError;
use crate::middleware::auth::{auth_middleware, resolve_user, token_from_headers, CurrentUser};
use crate::models::auth::ErrorResponse;
use crate::models::chat::{Chat, CreateChatRequest, Message};
use crate::orchestrator::ConnectionIdentity;
use crate::AppState;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Extension, Path,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post, Router},
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Generic failure reply. The client always receives exactly one
/// ai-response per ai-message, even when the turn fails; internals are
/// logged, never sent.
const FAILURE_REPLY: &str = "Something went wrong";

const BUSY_REPLY: &str = "I'm still working on your previous message, try again in a moment";

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum ClientEvent {
    AiMessage { chat: Uuid, content: String },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum ServerEvent {
    AiResponse { chat: Uuid, content: String },
}

pub fn chat_routes() -> Router {
    let realtime = Router::new().route("/ws", get(websocket_handler));

    let protected = Router::new()
        .route("/api/chat", post(create_chat).get(list_chats))
        .route("/api/chat/:chat_id/messages", get(get_chat_messages))
        .layer(axum::middleware::from_fn(auth_middleware));

    realtime.merge(protected)
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Extension(state): Extension<Arc<AppState>>,
) -> Response {
    // Handshake authentication: a connection with no or invalid token is
    // refused before entering the connected state.
    let Some(token) = token_from_headers(&headers) else {
        return unauthorized();
    };
    let Some(user) = resolve_user(&state, &token).await else {
        return unauthorized();
    };

    let identity = ConnectionIdentity {
        user_id: user.id,
        email: user.email,
    };

    ws.on_upgrade(move |socket| websocket(socket, state, identity))
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            message: "Unauthorized".to_string(),
        }),
    )
        .into_response()
}

async fn websocket(stream: WebSocket, state: Arc<AppState>, identity: ConnectionIdentity) {
    tracing::info!("Socket connected: {} ({})", identity.user_id, identity.email);

    let (mut sender, mut receiver) = stream.split();

    while let Some(Ok(message)) = receiver.next().await {
        let WsMessage::Text(text) = message else {
            continue;
        };

        let event = match serde_json::from_str::<ClientEvent>(&text) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("Ignoring malformed socket event: {}", e);
                continue;
            }
        };

        let ClientEvent::AiMessage { chat, content } = event;

        let reply = match state.orchestrator.run_turn(&identity, chat, &content).await {
            Ok(reply) => reply,
            Err(TurnError::TurnInProgress) => {
                tracing::warn!("Rejected concurrent turn for chat {}", chat);
                BUSY_REPLY.to_string()
            }
            Err(e) => {
                tracing::error!("Turn failed for chat {}: {}", chat, e);
                FAILURE_REPLY.to_string()
            }
        };

        let response = ServerEvent::AiResponse {
            chat,
            content: reply,
        };
        let Ok(json) = serde_json::to_string(&response) else {
            continue;
        };
        if sender.send(WsMessage::Text(json)).await.is_err() {
            // Client went away mid-turn; persistence already happened or
            // is in flight, only this emit is lost.
            tracing::warn!("Failed to send ai-response, client disconnected");
            break;
        }
    }

    tracing::info!("Socket disconnected: {}", identity.user_id);
}

async fn create_chat(
    Extension(state): Extension<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Json(payload): Json<CreateChatRequest>,
) -> Result<(StatusCode, Json<Chat>), (StatusCode, Json<ErrorResponse>)> {
    if payload.title.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                message: "Title is required".to_string(),
            }),
        ));
    }

    let chat = sqlx::query_as::<_, Chat>(
        "INSERT INTO chats (user_id, title)
         VALUES ($1, $2)
         RETURNING id, user_id, title, created_at",
    )
    .bind(user.id)
    .bind(payload.title.trim())
    .fetch_one(&state.db_pool)
    .await
    .map_err(|e| {
        tracing::error!("Error creating chat: {}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                message: "Failed to create chat".to_string(),
            }),
        )
    })?;

    Ok((StatusCode::CREATED, Json(chat)))
}

async fn list_chats(
    Extension(state): Extension<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
) -> Result<Json<Vec<Chat>>, (StatusCode, Json<ErrorResponse>)> {
    let chats = sqlx::query_as::<_, Chat>(
        "SELECT id, user_id, title, created_at
         FROM chats WHERE user_id = $1
         ORDER BY created_at DESC",
    )
    .bind(user.id)
    .fetch_all(&state.db_pool)
    .await
    .map_err(|e| {
        tracing::error!("Error listing chats: {}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                message: "Failed to list chats".to_string(),
            }),
        )
    })?;

    Ok(Json(chats))
}

async fn get_chat_messages(
    Path(chat_id): Path<Uuid>,
    Extension(state): Extension<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
) -> Result<Json<Vec<Message>>, (StatusCode, Json<ErrorResponse>)> {
    // Verify that the chat belongs to the authenticated user before
    // handing out its history.
    let owner = sqlx::query_scalar::<_, Uuid>("SELECT user_id FROM chats WHERE id = $1")
        .bind(chat_id)
        .fetch_optional(&state.db_pool)
        .await
        .map_err(|e| {
            tracing::error!("Failed to verify chat ownership: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    message: "Internal server error".to_string(),
                }),
            )
        })?;

    match owner {
        Some(owner_id) if owner_id == user.id => {}
        Some(_) => {
            tracing::warn!(
                "User {} attempted to access chat {} owned by another user",
                user.id,
                chat_id
            );
            return Err((
                StatusCode::FORBIDDEN,
                Json(ErrorResponse {
                    message: "Access denied".to_string(),
                }),
            ));
        }
        None => {
            return Err((
                StatusCode::NOT_FOUND,
                Json(ErrorResponse {
                    message: "Chat not found".to_string(),
                }),
            ));
        }
    }

    let messages = sqlx::query_as::<_, Message>(
        "SELECT id, chat_id, author_id, content, role, created_at
         FROM messages
         WHERE chat_id = $1
         ORDER BY created_at ASC",
    )
    .bind(chat_id)
    .fetch_all(&state.db_pool)
    .await
    .map_err(|e| {
        tracing::error!("Error fetching messages: {}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                message: "Failed to fetch messages".to_string(),
            }),
        )
    })?;

    Ok(Json(messages))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ai_message_event_shape() {
        let chat = Uuid::new_v4();
        let json = format!(
            r#"{{"type":"ai-message","chat":"{}","content":"hello"}}"#,
            chat
        );
        let event: ClientEvent = serde_json::from_str(&json).unwrap();
        let ClientEvent::AiMessage {
            chat: parsed_chat,
            content,
        } = event;
        assert_eq!(parsed_chat, chat);
        assert_eq!(content, "hello");
    }

    #[test]
    fn test_ai_response_event_shape() {
        let chat = Uuid::new_v4();
        let event = ServerEvent::AiResponse {
            chat,
            content: "hi".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "ai-response");
        assert_eq!(json["chat"], chat.to_string());
        assert_eq!(json["content"], "hi");
    }

    #[test]
    fn test_unknown_event_type_is_rejected() {
        let json = r#"{"type":"ping"}"#;
        assert!(serde_json::from_str::<ClientEvent>(json).is_err());
    }
}
