//! Unified message model: the value types every adapter, the manager and
//! the inbound/outbound pipelines speak. See spec.md §3.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ChannelError, Result};

/// Lowercased platform identifier. String identity is the only canonical
/// form — `ChannelType::new("Feishu")` and `ChannelType::new("feishu")`
/// compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelType(String);

impl ChannelType {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<T: AsRef<str>> From<T> for ChannelType {
    fn from(raw: T) -> Self {
        Self::new(raw)
    }
}

/// The sender's stable identity on a platform.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub subject_id: String,
    pub display_name: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl Identity {
    /// At least one of `subject_id` or an attribute must be non-empty for
    /// resolution to succeed (spec.md §3, Identity invariant).
    pub fn is_resolvable(&self) -> bool {
        !self.subject_id.trim().is_empty() || self.attributes.values().any(|v| !v.trim().is_empty())
    }

    /// Ordered subject candidates used by phase 1 of identity resolution
    /// (spec.md §4.5): subject_id, open_id, user_id, username, display_name.
    pub fn subject_candidates(&self) -> Vec<String> {
        let mut candidates = Vec::new();
        if !self.subject_id.trim().is_empty() {
            candidates.push(self.subject_id.clone());
        }
        for key in ["open_id", "user_id", "username"] {
            if let Some(value) = self.attributes.get(key) {
                if !value.trim().is_empty() {
                    candidates.push(value.clone());
                }
            }
        }
        if !self.display_name.trim().is_empty() {
            candidates.push(self.display_name.clone());
        }
        candidates
    }
}

/// A conversation the message belongs to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    #[serde(rename = "type")]
    pub conv_type: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl Conversation {
    /// `p2p|private|direct` (case-insensitive) is direct; everything else,
    /// including empty, is treated as group-like except where the trigger
    /// policy explicitly special-cases an empty type as direct (spec.md §4.4
    /// step 5).
    pub fn is_direct(&self) -> bool {
        matches!(self.conv_type.to_lowercase().as_str(), "p2p" | "private" | "direct")
    }

    pub fn is_group(&self) -> bool {
        !self.is_direct()
    }
}

/// A single part of a rich message (spec.md §3: link/emoji substitution for
/// `PlainText()`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessagePart {
    Text { text: String },
    Link { url: String, #[serde(default)] title: Option<String> },
    Emoji { emoji: String },
    Mention { id: String, #[serde(default)] display_name: Option<String> },
}

impl MessagePart {
    /// The text that substitutes for this part in `Message::plain_text`.
    fn substitution(&self) -> String {
        match self {
            MessagePart::Text { text } => text.clone(),
            MessagePart::Link { url, .. } => url.clone(),
            MessagePart::Emoji { emoji } => emoji.clone(),
            MessagePart::Mention { display_name, id } => {
                display_name.clone().unwrap_or_else(|| id.clone())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageFormat {
    Plain,
    Markdown,
    Rich,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub label: String,
    pub value: String,
    #[serde(default)]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplyRef {
    pub message_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentType {
    Image,
    Audio,
    Video,
    Voice,
    File,
    Gif,
}

impl AttachmentType {
    pub fn requires_media_capability(self) -> bool {
        matches!(
            self,
            AttachmentType::Audio | AttachmentType::Video | AttachmentType::Voice | AttachmentType::Gif
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub attachment_type: Option<AttachmentType>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub platform_key: Option<String>,
    #[serde(default)]
    pub asset_id: Option<String>,
    #[serde(default)]
    pub base64: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub mime: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub duration: Option<u32>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub source_platform: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl Attachment {
    /// Outbound validation: at least one of `url`, `platform_key`,
    /// `asset_id` must be present, and `asset_id`-only references are not
    /// dispatchable (spec.md §3, §4.3).
    pub fn validate_dispatchable(&self) -> Result<()> {
        let has_url = self.url.as_deref().is_some_and(|v| !v.trim().is_empty());
        let has_key = self.platform_key.as_deref().is_some_and(|v| !v.trim().is_empty());
        let has_asset = self.asset_id.as_deref().is_some_and(|v| !v.trim().is_empty());

        if !has_url && !has_key && !has_asset {
            return Err(ChannelError::AttachmentReferenceRequired);
        }
        if has_asset && !has_url && !has_key {
            return Err(ChannelError::AssetIdOnlyNotDispatchable);
        }
        Ok(())
    }
}

/// The unified message envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub id: Option<String>,
    pub format: MessageFormat,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub thread: Option<String>,
    #[serde(default)]
    pub reply: Option<ReplyRef>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl Default for MessageFormat {
    fn default() -> Self {
        MessageFormat::Plain
    }
}

impl Message {
    /// A message is empty iff `text` is blank and parts, attachments and
    /// actions are all empty (spec.md §3, Message invariant).
    pub fn is_empty(&self) -> bool {
        self.text.as_deref().map(str::trim).unwrap_or("").is_empty()
            && self.parts.is_empty()
            && self.attachments.is_empty()
            && self.actions.is_empty()
    }

    /// Trimmed `text` when non-empty, else newline-joined substitutions of
    /// `parts` in order.
    pub fn plain_text(&self) -> String {
        if let Some(text) = self.text.as_deref() {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
        self.parts
            .iter()
            .map(MessagePart::substitution)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Boolean capability flags a channel type declares support for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelCapabilities {
    pub text: bool,
    pub markdown: bool,
    pub rich_text: bool,
    pub attachments: bool,
    pub media: bool,
    pub buttons: bool,
    pub threads: bool,
    pub reply: bool,
    pub edit: bool,
    pub streaming: bool,
    pub block_streaming: bool,
}

impl ChannelCapabilities {
    pub fn all() -> Self {
        Self {
            text: true,
            markdown: true,
            rich_text: true,
            attachments: true,
            media: true,
            buttons: true,
            threads: true,
            reply: true,
            edit: true,
            streaming: true,
            block_streaming: true,
        }
    }

    pub fn supports_any_streaming(&self) -> bool {
        self.streaming || self.block_streaming
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkerMode {
    Text,
    Markdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaOrder {
    MediaFirst,
    TextFirst,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OutboundPolicy {
    pub text_chunk_limit: usize,
    pub chunker_mode: ChunkerMode,
    pub media_order: MediaOrder,
    pub retry_max: u32,
    pub retry_backoff_ms: u64,
}

impl Default for OutboundPolicy {
    fn default() -> Self {
        Self {
            text_chunk_limit: 2000,
            chunker_mode: ChunkerMode::Text,
            media_order: MediaOrder::MediaFirst,
            retry_max: 3,
            retry_backoff_ms: 500,
        }
    }
}

impl OutboundPolicy {
    /// `NormalizeOutboundPolicy` is idempotent: applying it twice yields the
    /// same result as applying it once (spec.md §8). Since every field here
    /// already has a concrete value, normalisation is a no-op identity
    /// function that only exists to give callers a stable name to apply.
    pub fn normalize(self) -> Self {
        self
    }
}

/// Persisted channel configuration (spec.md §3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub id: String,
    pub bot_id: String,
    pub channel_type: ChannelType,
    #[serde(default)]
    pub credentials: Value,
    #[serde(default)]
    pub external_identity: Option<String>,
    #[serde(default)]
    pub self_identity: Value,
    #[serde(default)]
    pub routing: Value,
    pub disabled: bool,
    #[serde(default)]
    pub verified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    NotPresent,
    Running,
    Stopped,
}

/// Observability record maintained in parallel to the live connection map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub config_id: String,
    pub bot_id: String,
    pub channel_type: ChannelType,
    pub running: bool,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// An inbound envelope normalised from a platform-specific payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub channel: ChannelType,
    pub bot_id: String,
    pub message: Message,
    pub reply_target: String,
    #[serde(default)]
    pub route_key: Option<String>,
    pub sender: Identity,
    pub conversation: Conversation,
    pub received_at: DateTime<Utc>,
    pub source: String,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl InboundMessage {
    /// `platform:bot:conversation[:sender]` — sender is appended iff the
    /// conversation is group-like (spec.md §3).
    pub fn routing_key(&self) -> String {
        let mut key = format!("{}:{}:{}", self.channel, self.bot_id, self.conversation.id);
        if self.conversation.is_group() {
            key.push(':');
            key.push_str(&self.sender.subject_id);
        }
        key
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub target: String,
    pub message: Message,
}

impl OutboundMessage {
    pub fn validate_non_empty(&self) -> Result<()> {
        if self.message.is_empty() {
            return Err(ChannelError::EmptyOutboundMessage);
        }
        Ok(())
    }
}

/// One tool-call payload carried by `tool_call_start`/`tool_call_end`
/// stream events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCallPayload {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub result: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamPhase {
    Reasoning,
    Text,
}

/// Tagged variant over the reply-stream protocol (spec.md §3, §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Status { status: String },
    Delta { phase: StreamPhase, delta: String },
    PhaseStart { phase: StreamPhase },
    PhaseEnd { phase: StreamPhase },
    ToolCallStart { tool_call: ToolCallPayload },
    ToolCallEnd { tool_call: ToolCallPayload },
    Attachment { attachments: Vec<Attachment> },
    AgentStart { agent: String },
    AgentEnd { agent: String },
    ProcessingStarted,
    ProcessingCompleted,
    ProcessingFailed { error: String },
    Final { message: Message },
    Error { error: String },
}
