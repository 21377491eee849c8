//! Inbound processor: empty-message filter, identity resolution, trigger
//! policy, route resolution, attachment ingest, token issuance, streaming
//! reply loop, tool-call dedup, processing-status lifecycle. spec.md §4.4.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;
use tracing::{error, warn};

use crate::config::GatewayConfig;
use crate::error::{ChannelError, Result};
use crate::identity::{IdentityResolver, ResolveOutcome};
use crate::manager::{InboundHandler, ReplySender};
use crate::media::{MediaInput, MediaService};
use crate::model::{Attachment, ChannelConfig, InboundMessage, Message, MessageFormat, StreamEvent, StreamPhase};
use crate::registry::Registry;
use crate::runner::{ChatRequest, Runner, RunnerChunk};
use crate::store::{AssetRef, PersistedMessage, Store, TriggerMode};

/// External route resolver (consumed). Named as a pipeline step in
/// spec.md §4.4 step 4 but, like persistence, has no dedicated entry in
/// the §6 contract list — modeled as its own small trait. See DESIGN.md.
#[derive(Debug, Clone)]
pub struct RouteResolveRequest {
    pub bot_id: String,
    pub platform: String,
    pub conversation_id: String,
    pub thread_id: Option<String>,
    pub conversation_type: String,
    pub channel_identity_id: String,
    pub channel_config_id: Option<String>,
    pub reply_target: String,
    pub metadata: HashMap<String, Value>,
}

#[derive(Debug, Clone)]
pub struct RouteResolution {
    pub route_id: String,
    pub chat_id: Option<String>,
}

#[async_trait]
pub trait RouteResolver: Send + Sync {
    async fn resolve_route(&self, req: RouteResolveRequest) -> Result<RouteResolution>;
}

pub struct InboundProcessor {
    registry: std::sync::Arc<Registry>,
    store: std::sync::Arc<dyn Store>,
    identity: std::sync::Arc<IdentityResolver>,
    routes: std::sync::Arc<dyn RouteResolver>,
    runner: std::sync::Arc<dyn Runner>,
    media: std::sync::Arc<dyn MediaService>,
    tokens: Option<std::sync::Arc<dyn crate::token::TokenIssuer>>,
    config: GatewayConfig,
}

impl InboundProcessor {
    pub fn new(
        registry: std::sync::Arc<Registry>,
        store: std::sync::Arc<dyn Store>,
        identity: std::sync::Arc<IdentityResolver>,
        routes: std::sync::Arc<dyn RouteResolver>,
        runner: std::sync::Arc<dyn Runner>,
        media: std::sync::Arc<dyn MediaService>,
        tokens: Option<std::sync::Arc<dyn crate::token::TokenIssuer>>,
        config: GatewayConfig,
    ) -> Self {
        Self { registry, store, identity, routes, runner, media, tokens, config }
    }

    async fn notify_started(&self, cfg: &ChannelConfig) -> Option<crate::registry::ProcessingHandle> {
        let notifier = self.registry.status_notifier(&cfg.channel_type).await?;
        let info = serde_json::json!({ "config_id": cfg.id });
        match tokio::time::timeout(Duration::from_secs(60), notifier.started(&info)).await {
            Ok(Ok(handle)) => Some(handle),
            Ok(Err(e)) => {
                warn!(stage = "processing_started", error = %e, "status notify failed");
                None
            }
            Err(_) => {
                warn!(stage = "processing_started", "status notify timed out");
                None
            }
        }
    }

    async fn notify_completed(&self, cfg: &ChannelConfig, handle: &Option<crate::registry::ProcessingHandle>) {
        let Some(handle) = handle else { return };
        let Some(notifier) = self.registry.status_notifier(&cfg.channel_type).await else { return };
        if let Ok(Err(e)) = tokio::time::timeout(Duration::from_secs(60), notifier.completed(handle)).await {
            warn!(stage = "processing_completed", error = %e, "status notify failed");
        }
    }

    async fn notify_failed(&self, cfg: &ChannelConfig, handle: &Option<crate::registry::ProcessingHandle>, cause: &str) {
        let Some(handle) = handle else { return };
        let Some(notifier) = self.registry.status_notifier(&cfg.channel_type).await else { return };
        if let Ok(Err(e)) = tokio::time::timeout(Duration::from_secs(60), notifier.failed(handle, cause)).await {
            warn!(stage = "processing_failed", error = %e, "status notify failed");
        }
    }
}

#[async_trait]
impl InboundHandler for InboundProcessor {
    async fn handle(&self, cfg: &ChannelConfig, inbound: &InboundMessage, reply: &ReplySender) -> Result<()> {
        // Step 1: build query, drop silently when empty.
        let query = inbound.message.plain_text();
        if query.is_empty() && inbound.message.attachments.is_empty() {
            return Ok(());
        }

        // Step 2: identity resolution.
        let bot = self.config.bot(&inbound.bot_id).cloned();
        let descriptor = self.registry.descriptor(&cfg.channel_type).await.ok();
        let configless = descriptor.as_ref().is_some_and(|d| d.configless);
        let outcome = self
            .identity
            .resolve(
                &inbound.channel,
                &inbound.sender,
                &query,
                inbound.conversation.is_group(),
                Some(cfg.id.as_str()),
                configless,
                bot.as_ref(),
            )
            .await?;

        let resolved = match outcome {
            ResolveOutcome::Stop(Some(text)) => {
                reply.send(&inbound.reply_target, &Message { text: Some(text), ..Default::default() }).await?;
                return Ok(());
            }
            ResolveOutcome::Stop(None) => return Ok(()),
            ResolveOutcome::Continue(resolved) => resolved,
        };

        // Step 3: attachment ingest (best-effort; keep original on failure).
        let mut attachments = Vec::with_capacity(inbound.message.attachments.len());
        for att in inbound.message.attachments.clone() {
            attachments.push(self.ingest_attachment(att).await);
        }

        // Step 4: route resolution.
        let route = self
            .routes
            .resolve_route(RouteResolveRequest {
                bot_id: inbound.bot_id.clone(),
                platform: inbound.channel.to_string(),
                conversation_id: inbound.conversation.id.clone(),
                thread_id: inbound.conversation.thread_id.clone(),
                conversation_type: inbound.conversation.conv_type.clone(),
                channel_identity_id: resolved.channel_identity_id.clone(),
                channel_config_id: resolved.channel_config_id.clone(),
                reply_target: inbound.reply_target.clone(),
                metadata: inbound.metadata.clone(),
            })
            .await?;
        let chat_id = route.chat_id.clone().unwrap_or_else(|| inbound.bot_id.clone());

        // Step 5: trigger policy.
        let triggered = is_triggered(inbound, &query, &self.config, resolved.force_reply);
        if !triggered {
            if let Err(e) = self
                .store
                .persist_message(PersistedMessage {
                    bot_id: inbound.bot_id.clone(),
                    route_id: route.route_id.clone(),
                    trigger_mode: TriggerMode::PassiveSync,
                    sender_subject_id: inbound.sender.subject_id.clone(),
                    text: query.clone(),
                    asset_refs: Vec::new(),
                })
                .await
            {
                warn!(error = %e, "passive persistence failed");
            }
            return Ok(());
        }

        // Step 7: persist user message.
        let asset_refs: Vec<AssetRef> = attachments
            .iter()
            .enumerate()
            .filter_map(|(i, a)| {
                a.asset_id.clone().map(|id| AssetRef {
                    asset_id: id,
                    role: "attachment".into(),
                    ordinal: i as u32,
                    mime: a.mime.clone(),
                    size: a.size,
                })
            })
            .collect();
        if let Err(e) = self
            .store
            .persist_message(PersistedMessage {
                bot_id: inbound.bot_id.clone(),
                route_id: route.route_id.clone(),
                trigger_mode: TriggerMode::ActiveChat,
                sender_subject_id: inbound.sender.subject_id.clone(),
                text: query.clone(),
                asset_refs,
            })
            .await
        {
            warn!(error = %e, "active-chat persistence failed");
        }

        // Step 8: token issuance (best-effort).
        if let Some(issuer) = &self.tokens {
            if let Some(secret) = &self.config.auth.jwt_secret {
                let claims = serde_json::json!({
                    "bot": inbound.bot_id,
                    "chat": chat_id,
                    "route": route.route_id,
                    "user": resolved.linked_user_id,
                    "channel_identity": resolved.channel_identity_id,
                });
                if let Err(e) = issuer
                    .generate_chat_token(claims, secret, Duration::from_secs(self.config.auth.chat_token_ttl_secs))
                    .await
                {
                    warn!(error = %e, "chat token issuance failed");
                }
                if let Some(user_id) = &resolved.linked_user_id {
                    if let Err(e) = issuer
                        .generate_token(user_id, secret, Duration::from_secs(self.config.auth.user_token_ttl_secs))
                        .await
                    {
                        warn!(error = %e, "user token issuance failed");
                    }
                }
            }
        }

        // Step 9-10: processing-status lifecycle + open reply stream. An
        // empty reply target cannot produce a ReplyRef, so it fails here
        // rather than being checked up front.
        let handle = self.notify_started(cfg).await;
        let stream = if inbound.reply_target.trim().is_empty() {
            let e = ChannelError::TargetUnresolved;
            self.notify_failed(cfg, &handle, &e.to_string()).await;
            return Err(e);
        } else {
            match reply.open_stream(&inbound.reply_target).await {
                Ok(s) => s,
                Err(e) => {
                    self.notify_failed(cfg, &handle, &e.to_string()).await;
                    return Err(e);
                }
            }
        };
        if let Err(e) = stream.push(StreamEvent::Status { status: "started".into() }).await {
            warn!(error = %e, "failed to push started status event");
        }

        // Step 11: consume the runner's lazy chunk stream.
        let request = ChatRequest {
            bot_id: inbound.bot_id.clone(),
            chat_id: chat_id.clone(),
            route_id: route.route_id.clone(),
            user_id: resolved.linked_user_id.clone(),
            channel_identity_id: Some(resolved.channel_identity_id.clone()),
            text: query.clone(),
            user_message_persisted: true,
        };

        let mut chat_stream = match self.runner.stream_chat(request).await {
            Ok(s) => s,
            Err(e) => {
                let _ = stream.push(StreamEvent::Error { error: e.to_string() }).await;
                self.notify_failed(cfg, &handle, &e.to_string()).await;
                stream.close().await;
                return Err(e);
            }
        };

        let mut final_messages: Vec<Message> = Vec::new();
        let mut sent_texts: Vec<String> = Vec::new();

        // Drain the chunk sequence to completion first: the runner contract
        // says close-without-error is normal completion, so the terminal
        // error channel is only meaningful once chunks has closed (checking
        // it concurrently could observe a dropped-without-send sender and
        // abort before the last chunks are drained).
        while let Some(chunk) = chat_stream.chunks.recv().await {
            if let Some(messages) = extract_messages(&chunk) {
                final_messages = messages;
            }
            for event in self.map_chunk_with_ingest(&chunk).await {
                if let Err(e) = stream.push(event).await {
                    error!(error = %e, "failed to push stream event");
                }
            }
        }
        let terminal_error = chat_stream.error.try_recv().ok();

        if let Some(cause) = terminal_error {
            let _ = stream.push(StreamEvent::Error { error: cause.clone() }).await;
            self.notify_failed(cfg, &handle, &cause).await;
            stream.close().await;
            return Err(ChannelError::StreamError(cause));
        }

        // Step 13: tool-call suppression, collecting texts the agent already sent.
        let suppressed_targets = collect_tool_sent_texts(&final_messages, &inbound.reply_target, &inbound.channel.to_string());
        sent_texts.extend(suppressed_targets);

        // Steps 14-16: emit final messages, applying dedup and NO_REPLY suppression.
        let mut emitted_any = false;
        for msg in &final_messages {
            let text = msg.plain_text();
            if !text.is_empty() {
                if is_no_reply_token(&text) {
                    continue;
                }
                if is_duplicate_of_sent(&text, &sent_texts) {
                    continue;
                }
            }
            let mut out = msg.clone();
            if out.format == MessageFormat::Plain && looks_like_markdown(&text) {
                out.format = MessageFormat::Markdown;
            }
            if out.reply.is_none() {
                out.reply = Some(crate::model::ReplyRef { message_id: inbound.reply_target.clone() });
            }
            if out.is_empty() {
                continue;
            }
            if let Err(e) = stream.push(StreamEvent::Final { message: out }).await {
                error!(error = %e, "failed to push final event");
            }
            emitted_any = true;
        }
        let _ = emitted_any;

        // Step 17: close out.
        if let Err(e) = stream.push(StreamEvent::Status { status: "completed".into() }).await {
            warn!(error = %e, "failed to push completed status event");
        }
        self.notify_completed(cfg, &handle).await;
        stream.close().await;
        Ok(())
    }
}

impl InboundProcessor {
    /// spec.md §4.4 step 12: `attachment_delta` chunks carry whatever the
    /// agent produced, which may be raw base64 rather than a stored asset.
    /// Re-ingest those before replaying the event so downstream adapters
    /// only ever see dispatchable references.
    async fn map_chunk_with_ingest(&self, chunk: &RunnerChunk) -> Vec<StreamEvent> {
        if chunk.chunk_type == "attachment_delta" {
            let atts = parse_attachments(chunk);
            if atts.is_empty() {
                return vec![];
            }
            let mut ingested = Vec::with_capacity(atts.len());
            for att in atts {
                ingested.push(self.ingest_attachment(att).await);
            }
            return vec![StreamEvent::Attachment { attachments: ingested }];
        }
        map_chunk(chunk)
    }

    async fn ingest_attachment(&self, mut att: Attachment) -> Attachment {
        if att.asset_id.is_some() {
            return att;
        }
        let input = if let Some(url) = &att.url {
            MediaInput::Url(url.clone())
        } else if let Some(b64) = &att.base64 {
            use base64::Engine as _;
            match base64::engine::general_purpose::STANDARD.decode(b64) {
                Ok(bytes) => MediaInput::Bytes { data: bytes, mime: att.mime.clone(), name: att.name.clone() },
                Err(_) => return att,
            }
        } else {
            return att;
        };

        match self.media.ingest(input).await {
            Ok(asset) => {
                att.asset_id = Some(asset.id.clone());
                att.url = Some(self.media.access_path(&asset));
                att.mime = Some(asset.mime);
                att.size = Some(asset.size);
                att
            }
            Err(_) => att,
        }
    }
}

/// spec.md §4.4 step 5.
pub fn is_triggered(inbound: &InboundMessage, query: &str, config: &GatewayConfig, force_reply: bool) -> bool {
    if force_reply {
        return true;
    }
    if inbound.conversation.is_direct() || inbound.conversation.conv_type.trim().is_empty() {
        return true;
    }
    if metadata_bool(&inbound.metadata, "is_mentioned") {
        return true;
    }
    if metadata_bool(&inbound.metadata, "is_reply_to_bot") {
        return true;
    }
    let prefixes = command_prefixes(inbound, config);
    prefixes.iter().any(|p| query.starts_with(p.as_str()))
}

fn metadata_bool(metadata: &HashMap<String, Value>, key: &str) -> bool {
    metadata.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn command_prefixes(inbound: &InboundMessage, config: &GatewayConfig) -> Vec<String> {
    if let Some(Value::Array(values)) = inbound.metadata.get("command_prefixes") {
        let prefixes: Vec<String> = values.iter().filter_map(|v| v.as_str().map(str::to_string)).collect();
        if !prefixes.is_empty() {
            return prefixes;
        }
    }
    if let Some(Value::String(prefix)) = inbound.metadata.get("command_prefix") {
        if !prefix.is_empty() {
            return vec![prefix.clone()];
        }
    }
    vec![config.trigger.default_command_prefix.clone()]
}

/// spec.md §4.4 mapping table: chunk `type` -> zero or more `StreamEvent`s.
pub fn map_chunk(chunk: &RunnerChunk) -> Vec<StreamEvent> {
    let delta = || chunk.data.get("delta").and_then(Value::as_str).unwrap_or("").to_string();
    match chunk.chunk_type.as_str() {
        "text_delta" => {
            let d = delta();
            if d.is_empty() { vec![] } else { vec![StreamEvent::Delta { phase: StreamPhase::Text, delta: d }] }
        }
        "reasoning_delta" => {
            let d = delta();
            if d.is_empty() { vec![] } else { vec![StreamEvent::Delta { phase: StreamPhase::Reasoning, delta: d }] }
        }
        "text_start" => vec![StreamEvent::PhaseStart { phase: StreamPhase::Text }],
        "text_end" => vec![StreamEvent::PhaseEnd { phase: StreamPhase::Text }],
        "reasoning_start" => vec![StreamEvent::PhaseStart { phase: StreamPhase::Reasoning }],
        "reasoning_end" => vec![StreamEvent::PhaseEnd { phase: StreamPhase::Reasoning }],
        "tool_call_start" => vec![StreamEvent::ToolCallStart { tool_call: parse_tool_call(chunk) }],
        "tool_call_end" => vec![StreamEvent::ToolCallEnd { tool_call: parse_tool_call(chunk) }],
        "attachment_delta" => {
            let atts = parse_attachments(chunk);
            if atts.is_empty() { vec![] } else { vec![StreamEvent::Attachment { attachments: atts }] }
        }
        "agent_start" => vec![StreamEvent::AgentStart { agent: agent_name(chunk) }],
        "agent_end" => vec![StreamEvent::AgentEnd { agent: agent_name(chunk) }],
        "processing_started" => vec![StreamEvent::ProcessingStarted],
        "processing_completed" => vec![StreamEvent::ProcessingCompleted],
        "processing_failed" => vec![StreamEvent::ProcessingFailed { error: chunk_error_text(chunk) }],
        "error" => vec![StreamEvent::Error { error: chunk_error_text(chunk) }],
        _ => vec![],
    }
}

fn parse_tool_call(chunk: &RunnerChunk) -> crate::model::ToolCallPayload {
    crate::model::ToolCallPayload {
        id: chunk.data.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
        name: chunk.data.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
        input: chunk.data.get("input").cloned().unwrap_or(Value::Null),
        result: chunk.data.get("result").cloned(),
    }
}

fn parse_attachments(chunk: &RunnerChunk) -> Vec<Attachment> {
    chunk
        .data
        .get("attachments")
        .and_then(|v| serde_json::from_value::<Vec<Attachment>>(v.clone()).ok())
        .unwrap_or_default()
}

fn agent_name(chunk: &RunnerChunk) -> String {
    chunk.data.get("agent").and_then(Value::as_str).unwrap_or_default().to_string()
}

fn chunk_error_text(chunk: &RunnerChunk) -> String {
    chunk
        .data
        .get("error")
        .and_then(Value::as_str)
        .or_else(|| chunk.data.get("message").and_then(Value::as_str))
        .unwrap_or("stream error")
        .to_string()
}

fn extract_messages(chunk: &RunnerChunk) -> Option<Vec<Message>> {
    let raw = chunk
        .data
        .get("messages")
        .or_else(|| chunk.data.get("data").and_then(|d| d.get("messages")))?;
    serde_json::from_value(raw.clone()).ok()
}

/// spec.md §4.4 step 13: a tool-sent `send`/`send_message` call whose
/// resolved target matches the current reply target on the current
/// channel suppresses the processor's own reply for that text.
pub fn collect_tool_sent_texts(messages: &[Message], reply_target: &str, _channel: &str) -> Vec<String> {
    let mut texts = Vec::new();
    for msg in messages {
        for action in &msg.actions {
            if matches!(action.kind.as_deref(), Some("send") | Some("send_message")) && action.value == reply_target {
                texts.push(action.label.clone());
            }
        }
    }
    texts
}

fn normalize_for_compare(text: &str) -> String {
    text.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

/// spec.md §4.4 step 14.
pub fn is_duplicate_of_sent(candidate: &str, sent: &[String]) -> bool {
    let normalized_candidate = normalize_for_compare(candidate);
    if normalized_candidate.len() < 10 {
        return false;
    }
    sent.iter().any(|s| {
        let normalized_sent = normalize_for_compare(s);
        normalized_sent.len() >= 10
            && (normalized_candidate.contains(&normalized_sent) || normalized_sent.contains(&normalized_candidate))
    })
}

static NO_REPLY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(^|\W)NO_REPLY(\W|$)").expect("static regex is valid"));

/// spec.md §4.4 step 15.
pub fn is_no_reply_token(text: &str) -> bool {
    NO_REPLY_RE.is_match(text.trim())
}

static MARKDOWN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\*\*[^*]+\*\*|__[^_]+__|\*[^*]+\*|_[^_]+_|~~[^~]+~~|`[^`]+`|```|\[[^\]]+\]\([^)]+\)|^#{1,6}\s|^[-*]\s|^\d+\.\s)")
        .expect("static regex is valid")
});

/// spec.md §4.4 step 16: markdown detection by regex on bold/italic/
/// strikethrough/inline-code/fences/links/headings/bullets/ordered-lists.
pub fn looks_like_markdown(text: &str) -> bool {
    text.lines().any(|line| MARKDOWN_RE.is_match(line))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChannelType, Conversation, Identity};
    use chrono::Utc;

    fn msg_with_meta(meta: HashMap<String, Value>) -> InboundMessage {
        InboundMessage {
            channel: ChannelType::new("feishu"),
            bot_id: "bot1".into(),
            message: Message::default(),
            reply_target: "t1".into(),
            route_key: None,
            sender: Identity::default(),
            conversation: Conversation { id: "c1".into(), conv_type: "group".into(), ..Default::default() },
            received_at: Utc::now(),
            source: "feishu".into(),
            metadata: meta,
        }
    }

    #[test]
    fn trigger_policy_direct_conversation_always_triggers() {
        let config = GatewayConfig::default();
        let mut inbound = msg_with_meta(HashMap::new());
        inbound.conversation.conv_type = "p2p".into();
        assert!(is_triggered(&inbound, "hi", &config, false));
    }

    #[test]
    fn trigger_policy_group_untriggered_without_mention() {
        let config = GatewayConfig::default();
        let inbound = msg_with_meta(HashMap::new());
        assert!(!is_triggered(&inbound, "hello everyone", &config, false));
    }

    #[test]
    fn trigger_policy_mention_metadata_triggers() {
        let config = GatewayConfig::default();
        let mut meta = HashMap::new();
        meta.insert("is_mentioned".into(), Value::Bool(true));
        let inbound = msg_with_meta(meta);
        assert!(is_triggered(&inbound, "@bot ping", &config, false));
    }

    #[test]
    fn trigger_policy_command_prefix_triggers() {
        let config = GatewayConfig::default();
        let inbound = msg_with_meta(HashMap::new());
        assert!(is_triggered(&inbound, "/help", &config, false));
        assert!(!is_triggered(&inbound, "help", &config, false));
    }

    #[test]
    fn no_reply_token_detected_at_boundaries() {
        assert!(is_no_reply_token("NO_REPLY"));
        assert!(is_no_reply_token("ok NO_REPLY"));
        assert!(is_no_reply_token("NO_REPLY done"));
        assert!(!is_no_reply_token("NO_REPLYING"));
    }

    #[test]
    fn duplicate_suppression_requires_min_length_and_substring_relation() {
        let sent = vec!["the quick brown fox jumps".to_string()];
        assert!(is_duplicate_of_sent("The Quick Brown Fox Jumps", &sent));
        assert!(is_duplicate_of_sent("the quick brown fox jumps over the lazy dog", &sent));
        assert!(!is_duplicate_of_sent("short", &sent));
        assert!(!is_duplicate_of_sent("totally unrelated content here", &sent));
    }

    #[test]
    fn markdown_detection_matches_common_constructs() {
        assert!(looks_like_markdown("**bold**"));
        assert!(looks_like_markdown("# heading"));
        assert!(looks_like_markdown("- bullet"));
        assert!(looks_like_markdown("[link](https://example.com)"));
        assert!(!looks_like_markdown("plain text with no markers"));
    }

    #[test]
    fn map_chunk_drops_empty_deltas() {
        let chunk = RunnerChunk { chunk_type: "text_delta".into(), data: serde_json::json!({"delta": ""}) };
        assert!(map_chunk(&chunk).is_empty());

        let chunk = RunnerChunk { chunk_type: "text_delta".into(), data: serde_json::json!({"delta": "hi"}) };
        assert_eq!(map_chunk(&chunk).len(), 1);
    }

    #[test]
    fn map_chunk_unknown_type_yields_nothing() {
        let chunk = RunnerChunk { chunk_type: "mystery".into(), data: Value::Null };
        assert!(map_chunk(&chunk).is_empty());
    }

    struct RecordingMedia {
        ingested: std::sync::Mutex<Vec<crate::media::MediaInput>>,
    }

    #[async_trait]
    impl MediaService for RecordingMedia {
        async fn ingest(&self, input: MediaInput) -> Result<crate::media::Asset> {
            self.ingested.lock().unwrap().push(input);
            Ok(crate::media::Asset {
                id: "asset-ingested".into(),
                mime: "image/png".into(),
                storage_key: "key".into(),
                size: 3,
            })
        }
        fn access_path(&self, asset: &crate::media::Asset) -> String {
            format!("/assets/{}", asset.id)
        }
    }

    fn processor_with_media(media: std::sync::Arc<RecordingMedia>) -> InboundProcessor {
        use crate::identity::IdentityResolver;
        use crate::registry::Registry;

        struct NoopStore;
        #[async_trait]
        impl Store for NoopStore {
            async fn list_configs_by_type(&self, _channel: &crate::model::ChannelType) -> Result<Vec<ChannelConfig>> {
                Ok(vec![])
            }
            async fn resolve_effective_config(&self, _bot_id: &str, _channel: &crate::model::ChannelType) -> Result<Option<ChannelConfig>> {
                Ok(None)
            }
            async fn upsert_config(&self, cfg: ChannelConfig) -> Result<ChannelConfig> {
                Ok(cfg)
            }
            async fn update_config_disabled(&self, _id: &str, _disabled: bool) -> Result<()> {
                Ok(())
            }
            async fn delete_config(&self, _id: &str) -> Result<()> {
                Ok(())
            }
            async fn resolve_channel_identity_binding(
                &self,
                _criteria: &crate::store::ChannelIdentityCriteria,
            ) -> Result<Option<crate::store::ChannelIdentityBinding>> {
                Ok(None)
            }
            async fn get_channel_identity_config(&self, _id: &str, _channel: &crate::model::ChannelType) -> Result<Option<Value>> {
                Ok(None)
            }
            async fn link_channel_identity(&self, _channel_identity_id: &str, _user_id: &str) -> Result<()> {
                Ok(())
            }
            async fn persist_message(&self, _message: PersistedMessage) -> Result<()> {
                Ok(())
            }
        }

        struct NoopRunner;
        #[async_trait]
        impl Runner for NoopRunner {
            async fn stream_chat(&self, _request: ChatRequest) -> Result<crate::runner::ChatStream> {
                let (_tx, rx) = tokio::sync::mpsc::channel(1);
                let (_etx, erx) = tokio::sync::oneshot::channel();
                Ok(crate::runner::ChatStream { chunks: rx, error: erx })
            }
        }

        struct NoopRoutes;
        #[async_trait]
        impl RouteResolver for NoopRoutes {
            async fn resolve_route(&self, _req: RouteResolveRequest) -> Result<RouteResolution> {
                Ok(RouteResolution { route_id: "r1".into(), chat_id: None })
            }
        }

        InboundProcessor::new(
            std::sync::Arc::new(Registry::new()),
            std::sync::Arc::new(NoopStore),
            std::sync::Arc::new(IdentityResolver::new(std::sync::Arc::new(NoopStore))),
            std::sync::Arc::new(NoopRoutes),
            std::sync::Arc::new(NoopRunner),
            media,
            None,
            GatewayConfig::default(),
        )
    }

    #[tokio::test]
    async fn attachment_delta_chunk_is_reingested_before_replay() {
        let media = std::sync::Arc::new(RecordingMedia { ingested: std::sync::Mutex::new(Vec::new()) });
        let processor = processor_with_media(media.clone());

        let chunk = RunnerChunk {
            chunk_type: "attachment_delta".into(),
            data: serde_json::json!({
                "attachments": [{ "attachment_type": "image", "base64": "aGVsbG8=" }]
            }),
        };

        let events = processor.map_chunk_with_ingest(&chunk).await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::Attachment { attachments } => {
                assert_eq!(attachments.len(), 1);
                assert_eq!(attachments[0].asset_id.as_deref(), Some("asset-ingested"));
                assert_eq!(attachments[0].url.as_deref(), Some("/assets/asset-ingested"));
            }
            other => panic!("expected Attachment event, got {other:?}"),
        }
        assert_eq!(media.ingested.lock().unwrap().len(), 1);
    }
}
