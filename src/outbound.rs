//! Outbound pipeline: chunking, ordering, capability validation, retry,
//! attachment reference normalisation, stream-event validation. spec.md
//! §4.3.

use std::time::Duration;

use crate::error::{ChannelError, Result};
use crate::model::{
    Action, Attachment, AttachmentType, ChannelCapabilities, ChunkerMode, MediaOrder, Message,
    MessageFormat, OutboundPolicy, StreamEvent, StreamPhase,
};
use crate::registry::{AdapterDescriptor, AdapterEntry};

/// Splits `text` at `\n` boundaries into chunks whose rune length is at
/// most `limit`; a line longer than `limit` is itself rune-sliced. Empty
/// segments are dropped. Order is preserved and the function is idempotent
/// on already-short input.
pub fn chunk_text(text: &str, limit: usize) -> Vec<String> {
    if limit == 0 {
        return if text.is_empty() { Vec::new() } else { vec![text.to_string()] };
    }
    let mut chunks = Vec::new();
    for line in text.split('\n') {
        if line.is_empty() {
            continue;
        }
        let runes: Vec<char> = line.chars().collect();
        if runes.len() <= limit {
            chunks.push(line.to_string());
        } else {
            for slice in runes.chunks(limit) {
                chunks.push(slice.iter().collect());
            }
        }
    }
    chunks
}

/// First splits at `\n\n` paragraph boundaries, then recurses into
/// [`chunk_text`] for any paragraph that exceeds `limit`.
pub fn chunk_markdown_text(text: &str, limit: usize) -> Vec<String> {
    if limit == 0 {
        return if text.is_empty() { Vec::new() } else { vec![text.to_string()] };
    }
    let mut chunks = Vec::new();
    for para in text.split("\n\n") {
        if para.is_empty() {
            continue;
        }
        let runes: Vec<char> = para.chars().collect();
        if runes.len() <= limit {
            chunks.push(para.to_string());
        } else {
            chunks.extend(chunk_text(para, limit));
        }
    }
    chunks
}

fn chunk_by_mode(text: &str, policy: &OutboundPolicy) -> Vec<String> {
    match policy.chunker_mode {
        ChunkerMode::Text => chunk_text(text, policy.text_chunk_limit),
        ChunkerMode::Markdown => chunk_markdown_text(text, policy.text_chunk_limit),
    }
}

fn infer_format(message: &Message) -> MessageFormat {
    if !matches!(message.format, MessageFormat::Plain) {
        return message.format;
    }
    if !message.parts.is_empty() {
        MessageFormat::Rich
    } else {
        MessageFormat::Plain
    }
}

/// Given an outbound message and a normalised policy, produces a
/// non-empty ordered list of messages ready for per-item dispatch.
/// spec.md §4.3 "buildOutboundMessages".
pub fn build_outbound_messages(message: &Message, policy: &OutboundPolicy) -> Result<Vec<Message>> {
    let format = infer_format(message);
    let text = message.text.as_deref().unwrap_or("").trim();

    let mut text_messages = Vec::new();
    if !message.parts.is_empty() {
        text_messages.push(Message { format, attachments: Vec::new(), ..message.clone() });
    } else if policy.text_chunk_limit > 0 && !text.is_empty() {
        let chunks = chunk_by_mode(text, policy);
        let last_idx = chunks.len().saturating_sub(1);
        for (i, chunk) in chunks.into_iter().enumerate() {
            let actions: Vec<Action> = if i == last_idx { message.actions.clone() } else { Vec::new() };
            text_messages.push(Message {
                id: None,
                format,
                text: Some(chunk),
                parts: Vec::new(),
                attachments: Vec::new(),
                actions,
                thread: message.thread.clone(),
                reply: message.reply.clone(),
                metadata: message.metadata.clone(),
            });
        }
    } else if !text.is_empty() {
        text_messages.push(Message {
            format,
            text: Some(text.to_string()),
            attachments: Vec::new(),
            ..message.clone()
        });
    }

    let attachment_message = if !message.attachments.is_empty() {
        Some(Message {
            id: None,
            format: MessageFormat::Plain,
            text: None,
            parts: Vec::new(),
            attachments: message.attachments.clone(),
            actions: Vec::new(),
            thread: message.thread.clone(),
            reply: None,
            metadata: message.metadata.clone(),
        })
    } else {
        None
    };

    let mut out = Vec::new();
    match policy.media_order {
        MediaOrder::MediaFirst => {
            out.extend(attachment_message);
            out.extend(text_messages);
        }
        MediaOrder::TextFirst => {
            out.extend(text_messages);
            out.extend(attachment_message);
        }
    }

    if out.is_empty() {
        return Err(ChannelError::EmptyOutboundMessage);
    }
    Ok(out)
}

/// Validates a message against the adapter's declared capabilities.
/// spec.md §4.3 "Capability validation".
pub fn validate_capabilities(message: &Message, caps: &ChannelCapabilities) -> Result<()> {
    let channel_cap_err = |capability: &'static str| ChannelError::CapabilityNotSupported {
        channel: crate::model::ChannelType::new("unknown"),
        capability,
    };

    match message.format {
        MessageFormat::Plain => {
            if !caps.text {
                return Err(channel_cap_err("Text"));
            }
        }
        MessageFormat::Markdown => {
            if !(caps.markdown || caps.rich_text) {
                return Err(channel_cap_err("Markdown"));
            }
        }
        MessageFormat::Rich => {
            if !caps.rich_text {
                return Err(channel_cap_err("RichText"));
            }
        }
    }

    if !message.attachments.is_empty() {
        if !caps.attachments {
            return Err(channel_cap_err("Attachments"));
        }
        for att in &message.attachments {
            if att.attachment_type.is_some_and(AttachmentType::requires_media_capability) && !caps.media {
                return Err(channel_cap_err("Media"));
            }
        }
    }
    if !message.actions.is_empty() && !caps.buttons {
        return Err(channel_cap_err("Buttons"));
    }
    if message.thread.is_some() && !caps.threads {
        return Err(channel_cap_err("Threads"));
    }
    if message.reply.is_some() && !caps.reply {
        return Err(channel_cap_err("Reply"));
    }
    if message.id.is_some() && !caps.edit {
        return Err(channel_cap_err("Edit"));
    }
    Ok(())
}

/// Validates against a specific channel's descriptor, attaching its channel
/// type to any capability error for a precise message.
pub fn validate_capabilities_for(message: &Message, descriptor: &AdapterDescriptor) -> Result<()> {
    validate_capabilities(message, &descriptor.capabilities).map_err(|e| match e {
        ChannelError::CapabilityNotSupported { capability, .. } => ChannelError::CapabilityNotSupported {
            channel: descriptor.channel_type.clone(),
            capability,
        },
        other => other,
    })
}

/// Trims fields and fills `source_platform` when missing; rejects
/// `asset_id`-only references at dispatch. spec.md §4.3 "Attachment
/// reference normalisation".
pub fn normalize_attachment(mut att: Attachment, channel_key: &str) -> Result<Attachment> {
    att.url = att.url.map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
    att.platform_key = att.platform_key.map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
    att.asset_id = att.asset_id.map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
    if att.source_platform.is_none() {
        att.source_platform = Some(channel_key.to_string());
    }
    att.validate_dispatchable()?;
    Ok(att)
}

/// `sendWithConfig`: retries up to `policy.retry_max` times with a linear
/// `attempt * backoff_ms` sleep between attempts; the last error is
/// returned. Messages carrying an id take the edit path and require a
/// `MessageEditor`.
pub async fn send_with_config(
    entry: &AdapterEntry,
    target: &str,
    message: &Message,
    policy: &OutboundPolicy,
) -> Result<()> {
    if message.id.is_some() {
        let editor = entry.editor.clone().ok_or_else(|| ChannelError::UnsupportedCapability {
            channel: entry.adapter.channel_type(),
            capability: "MessageEditor",
        })?;
        let message_id = message.id.clone().unwrap();
        return retry(policy, || {
            let editor = editor.clone();
            let target = target.to_string();
            let message_id = message_id.clone();
            let message = message.clone();
            async move { editor.edit(&target, &message_id, &message).await }
        })
        .await;
    }

    let sender = entry.sender.clone().ok_or_else(|| ChannelError::UnsupportedCapability {
        channel: entry.adapter.channel_type(),
        capability: "Sender",
    })?;
    retry(policy, || {
        let sender = sender.clone();
        let target = target.to_string();
        let message = message.clone();
        async move { sender.send(&target, &message).await }
    })
    .await
}

async fn retry<F, Fut>(policy: &OutboundPolicy, mut attempt_fn: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let mut last_err = None;
    for attempt in 1..=policy.retry_max.max(1) {
        match attempt_fn().await {
            Ok(()) => return Ok(()),
            Err(e) => {
                last_err = Some(e);
                if attempt < policy.retry_max {
                    tokio::time::sleep(Duration::from_millis(policy.retry_backoff_ms * attempt as u64)).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or(ChannelError::TargetUnresolved))
}

/// Validates a `StreamEvent` per the rules in spec.md §4.3.
pub fn validate_stream_event(caps: &ChannelCapabilities, event: &StreamEvent) -> Result<()> {
    match event {
        StreamEvent::Status { status } => {
            if status.trim().is_empty() {
                return Err(ChannelError::InvalidStreamEvent("status must be non-empty".into()));
            }
        }
        StreamEvent::Delta { .. } | StreamEvent::PhaseStart { .. } | StreamEvent::PhaseEnd { .. } => {
            if !caps.supports_any_streaming() {
                return Err(ChannelError::InvalidStreamEvent(
                    "channel does not support Streaming or BlockStreaming".into(),
                ));
            }
        }
        StreamEvent::ToolCallStart { .. } | StreamEvent::ToolCallEnd { .. } => {
            if !caps.supports_any_streaming() {
                return Err(ChannelError::InvalidStreamEvent(
                    "channel does not support Streaming or BlockStreaming".into(),
                ));
            }
        }
        StreamEvent::Attachment { attachments } => {
            if attachments.is_empty() {
                return Err(ChannelError::InvalidStreamEvent("attachment event requires attachments".into()));
            }
            for att in attachments {
                att.validate_dispatchable()?;
            }
        }
        StreamEvent::ProcessingFailed { error } | StreamEvent::Error { error } => {
            if error.trim().is_empty() {
                return Err(ChannelError::InvalidStreamEvent("error text must be non-empty".into()));
            }
        }
        StreamEvent::Final { message } => {
            validate_capabilities(message, caps)?;
        }
        StreamEvent::AgentStart { .. }
        | StreamEvent::AgentEnd { .. }
        | StreamEvent::ProcessingStarted
        | StreamEvent::ProcessingCompleted => {}
    }
    Ok(())
}

/// Distinguishes the streaming-requiring variants, used by callers who want
/// to skip delta noise for a channel without `Streaming`/`BlockStreaming`
/// before even calling [`validate_stream_event`].
pub fn requires_streaming(event: &StreamEvent) -> bool {
    matches!(
        event,
        StreamEvent::Delta { .. }
            | StreamEvent::PhaseStart { .. }
            | StreamEvent::PhaseEnd { .. }
            | StreamEvent::ToolCallStart { .. }
            | StreamEvent::ToolCallEnd { .. }
    )
}

pub fn phase_matches(event: &StreamEvent, phase: StreamPhase) -> bool {
    matches!(event, StreamEvent::Delta { phase: p, .. } if *p == phase)
}
