//! Downstream chat runner contract (consumed). spec.md §6: `StreamChat`
//! returns a lazy sequence of opaque JSON chunks plus a single terminal
//! error channel; closing the chunk stream without an error denotes normal
//! completion.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub bot_id: String,
    pub chat_id: String,
    pub route_id: String,
    pub user_id: Option<String>,
    pub channel_identity_id: Option<String>,
    pub text: String,
    pub user_message_persisted: bool,
}

/// One opaque frame from the runner; `chunk_type` drives the mapping table
/// in spec.md §4.4.
#[derive(Debug, Clone)]
pub struct RunnerChunk {
    pub chunk_type: String,
    pub data: Value,
}

pub struct ChatStream {
    pub chunks: mpsc::Receiver<RunnerChunk>,
    pub error: tokio::sync::oneshot::Receiver<String>,
}

#[async_trait]
pub trait Runner: Send + Sync {
    async fn stream_chat(&self, request: ChatRequest) -> Result<ChatStream>;
}
