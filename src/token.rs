//! Auth token issuer contract (consumed). spec.md §6.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn generate_token(&self, user_id: &str, secret: &str, ttl: Duration) -> Result<String>;
    async fn generate_chat_token(&self, claims: Value, secret: &str, ttl: Duration) -> Result<String>;
}
