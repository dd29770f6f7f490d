//! Chats, messages and model turns.
//!
//! `send` and `stream` both store the user message first, then answer with
//! the chat history and the realm's system prompt. A streamed reply is
//! stored once the upstream stream ends or the client goes away, whichever
//! comes first.

use bytes::Bytes;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use pathfinder_core::llm::{ChatTurn, GenerateRequest, LlmBackend, TextStream};
use pathfinder_core::models::{Chat, ChatMessage, MessageRole};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::subsystems::metrics;

#[derive(Debug, Deserialize, Default)]
pub struct ChatFilter {
    pub realm_id: Option<Uuid>,
}

#[derive(Debug, Deserialize, Default)]
pub struct CreateChat {
    pub realm_id: Option<Uuid>,
    pub title: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct UpdateChat {
    pub realm_id: Option<Uuid>,
    pub title: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateMessage {
    pub role: MessageRole,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct SendMessage {
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct Exchange {
    pub user_message: ChatMessage,
    pub model_message: ChatMessage,
}

pub async fn list(pool: &PgPool, filter: ChatFilter) -> ApiResult<Vec<Chat>> {
    let chats = match filter.realm_id {
        Some(realm_id) => {
            sqlx::query_as("SELECT * FROM chats WHERE realm_id = $1 ORDER BY updated_at DESC")
                .bind(realm_id)
                .fetch_all(pool)
                .await?
        }
        None => {
            sqlx::query_as("SELECT * FROM chats ORDER BY updated_at DESC")
                .fetch_all(pool)
                .await?
        }
    };
    Ok(chats)
}

pub async fn get(pool: &PgPool, id: Uuid) -> ApiResult<Chat> {
    sqlx::query_as("SELECT * FROM chats WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ApiError::not_found("Chat"))
}

pub async fn create(pool: &PgPool, req: CreateChat) -> ApiResult<Chat> {
    if let Some(realm_id) = req.realm_id {
        crate::subsystems::realms::ensure_exists(pool, realm_id).await?;
    }

    let chat: Chat = sqlx::query_as(
        "INSERT INTO chats (id, realm_id, title) VALUES ($1, $2, $3) RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(req.realm_id)
    .bind(&req.title)
    .fetch_one(pool)
    .await?;

    tracing::info!(chat_id = %chat.id, realm_id = ?chat.realm_id, "Created chat");
    Ok(chat)
}

pub async fn update(pool: &PgPool, id: Uuid, req: UpdateChat) -> ApiResult<Chat> {
    if let Some(realm_id) = req.realm_id {
        crate::subsystems::realms::ensure_exists(pool, realm_id).await?;
    }

    sqlx::query_as(
        r#"
        UPDATE chats
        SET realm_id = COALESCE($2, realm_id),
            title = COALESCE($3, title),
            updated_at = now()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(req.realm_id)
    .bind(&req.title)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| ApiError::not_found("Chat"))
}

pub async fn delete(pool: &PgPool, id: Uuid) -> ApiResult<()> {
    let result = sqlx::query("DELETE FROM chats WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(ApiError::not_found("Chat"));
    }
    Ok(())
}

/// Oldest first.
pub async fn messages(pool: &PgPool, chat_id: Uuid) -> ApiResult<Vec<ChatMessage>> {
    get(pool, chat_id).await?;
    fetch_history(pool, chat_id).await
}

async fn fetch_history(pool: &PgPool, chat_id: Uuid) -> ApiResult<Vec<ChatMessage>> {
    let rows = sqlx::query_as(
        "SELECT * FROM chat_messages WHERE chat_id = $1 ORDER BY created_at, id",
    )
    .bind(chat_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Insert a message, bump the chat's metrics and touch `updated_at`.
pub async fn add_message(
    pool: &PgPool,
    chat: &Chat,
    role: MessageRole,
    content: &str,
) -> ApiResult<ChatMessage> {
    let mut tx = pool.begin().await?;

    let message: ChatMessage = sqlx::query_as(
        r#"
        INSERT INTO chat_messages (id, chat_id, role, content)
        VALUES ($1, $2, $3, $4)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(chat.id)
    .bind(role)
    .bind(content)
    .fetch_one(&mut *tx)
    .await?;

    metrics::record_message(&mut *tx, chat.id, chat.realm_id, role, content.chars().count())
        .await?;

    sqlx::query("UPDATE chats SET updated_at = now() WHERE id = $1")
        .bind(chat.id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(message)
}

pub async fn create_message(
    pool: &PgPool,
    chat_id: Uuid,
    req: CreateMessage,
) -> ApiResult<ChatMessage> {
    if req.content.trim().is_empty() {
        return Err(ApiError::bad_request("Message content must not be empty"));
    }
    let chat = get(pool, chat_id).await?;
    add_message(pool, &chat, req.role, &req.content).await
}

/// Map stored messages onto model turns.
pub fn history_to_turns(history: &[ChatMessage]) -> Vec<ChatTurn> {
    history
        .iter()
        .map(|m| ChatTurn {
            role: m.role,
            text: m.content.clone(),
        })
        .collect()
}

/// Store the user's message and build the model request for the chat.
async fn prepare_turn(
    pool: &PgPool,
    chat_id: Uuid,
    content: &str,
) -> ApiResult<(Chat, ChatMessage, GenerateRequest)> {
    if content.trim().is_empty() {
        return Err(ApiError::bad_request("Message content must not be empty"));
    }

    let chat = get(pool, chat_id).await?;
    let system_prompt = match chat.realm_id {
        Some(realm_id) => crate::subsystems::realms::get(pool, realm_id).await?.system_prompt,
        None => None,
    };

    let user_message = add_message(pool, &chat, MessageRole::User, content).await?;
    let history = fetch_history(pool, chat_id).await?;

    let request = GenerateRequest {
        system_instruction: None,
        turns: history_to_turns(&history),
    }
    .with_system_instruction(system_prompt);

    Ok((chat, user_message, request))
}

pub async fn send(
    pool: &PgPool,
    llm: &dyn LlmBackend,
    chat_id: Uuid,
    content: &str,
) -> ApiResult<Exchange> {
    let (chat, user_message, request) = prepare_turn(pool, chat_id, content).await?;

    let reply = llm.generate(&request).await?;
    let model_message = add_message(pool, &chat, MessageRole::Model, &reply).await?;

    tracing::info!(
        chat_id = %chat_id,
        reply_chars = reply.chars().count(),
        "Model replied"
    );

    Ok(Exchange {
        user_message,
        model_message,
    })
}

/// Body chunks of a streamed model reply.
pub type ReplyStream = mpsc::Receiver<Result<Bytes, std::io::Error>>;

/// Start a streamed reply. The upstream call is made before returning so
/// connection and API errors still map to a proper error response.
pub async fn stream(
    pool: &PgPool,
    llm: &dyn LlmBackend,
    chat_id: Uuid,
    content: &str,
) -> ApiResult<ReplyStream> {
    let (chat, _user_message, request) = prepare_turn(pool, chat_id, content).await?;
    let upstream = llm.stream(&request).await?;
    Ok(relay(pool.clone(), chat, upstream))
}

/// Forward `upstream` chunks to the returned body stream while accumulating
/// them, then persist the accumulated text as the model message.
fn relay(pool: PgPool, chat: Chat, mut upstream: TextStream) -> ReplyStream {
    let (mut tx, rx) = mpsc::channel(16);

    tokio::spawn(async move {
        let mut reply = String::new();

        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(text) => {
                    reply.push_str(&text);
                    if tx.send(Ok(Bytes::from(text))).await.is_err() {
                        tracing::info!(chat_id = %chat.id, "Client disconnected mid-stream");
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(chat_id = %chat.id, error = %e, "Upstream stream failed");
                    let _ = tx
                        .send(Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))
                        .await;
                    break;
                }
            }
        }
        drop(tx);

        if reply.trim().is_empty() {
            tracing::warn!(chat_id = %chat.id, "Stream ended without text, nothing stored");
            return;
        }

        match add_message(&pool, &chat, MessageRole::Model, &reply).await {
            Ok(message) => tracing::info!(
                chat_id = %chat.id,
                message_id = %message.id,
                reply_chars = reply.chars().count(),
                "Stored streamed reply"
            ),
            Err(e) => tracing::error!(chat_id = %chat.id, error = %e, "Failed to store streamed reply"),
        }
    });

    rx
}
