//! Adapter registry: capability-typed dispatch over registered platform
//! adapters. See spec.md §4.1 and Design Notes §9.
//!
//! The Go source checks "is this adapter also a `Sender`?" with a runtime
//! type assertion. That has no clean equivalent here, so capability lookup
//! is a table built at registration time: [`AdapterRegistration`] accepts
//! the mandatory [`Adapter`] plus whichever optional capability trait
//! objects the concrete adapter implements, and the registry stores them
//! together as an [`AdapterEntry`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::{ChannelError, Result};
use crate::model::{Attachment, ChannelCapabilities, ChannelType, Message, StreamEvent};

/// Mandatory interface every registered platform implements.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn channel_type(&self) -> ChannelType;
    fn descriptor(&self) -> AdapterDescriptor;
}

#[derive(Debug, Clone)]
pub struct AdapterDescriptor {
    pub channel_type: ChannelType,
    pub capabilities: ChannelCapabilities,
    pub configless: bool,
}

/// A one-shot outbound delivery.
#[async_trait]
pub trait Sender: Send + Sync {
    async fn send(&self, target: &str, message: &Message) -> Result<()>;
}

/// A single opened live stream to a platform target. `push`/`close` take
/// `&self`; adapters that need mutable per-stream state hold it behind
/// their own interior mutability (a channel, a mutex), matching how the
/// teacher's adapters wrap a `serenity`/`teloxide` handle.
#[async_trait]
pub trait LiveStream: Send + Sync {
    async fn push(&self, event: &StreamEvent) -> Result<()>;
    async fn close(&self);
}

/// Live streaming reply delivery: opens a platform-specific stream and
/// hands back the per-stream handle the manager pushes validated
/// `StreamEvent`s through.
#[async_trait]
pub trait StreamSender: Send + Sync {
    async fn open_stream(&self, target: &str) -> Result<Arc<dyn LiveStream>>;
}

/// Long-lived inbound connection lifecycle for a channel.
#[async_trait]
pub trait Receiver: Send + Sync {
    async fn connect(&self, cfg_id: &str) -> Result<()>;

    /// Returns `Ok(false)` for the "stop not supported" sentinel, which the
    /// manager treats as non-fatal (spec.md §4.2 step 3).
    async fn stop(&self, cfg_id: &str) -> Result<bool>;
}

#[async_trait]
pub trait Reactor: Send + Sync {
    async fn react(&self, target: &str, message_id: &str, emoji: Option<&str>) -> Result<()>;
}

#[async_trait]
pub trait MessageEditor: Send + Sync {
    async fn edit(&self, target: &str, message_id: &str, message: &Message) -> Result<()>;
}

#[async_trait]
pub trait SelfDiscoverer: Send + Sync {
    async fn discover_self(&self) -> Result<Value>;
}

#[async_trait]
pub trait ConfigNormalizer: Send + Sync {
    fn normalize_config(&self, raw: Value) -> Value;
    fn normalize_user_config(&self, raw: Value) -> Value;
}

#[async_trait]
pub trait TargetResolver: Send + Sync {
    async fn resolve_target_from_user_config(&self, user_config: &Value) -> Option<String>;
    fn normalize_target(&self, target: &str) -> String;
}

#[async_trait]
pub trait BindingMatcher: Send + Sync {
    fn match_user_binding(&self, criteria: &Value) -> Option<Value>;
    fn build_user_binding_config(&self, identity: &Value) -> Value;
}

#[async_trait]
pub trait AttachmentResolver: Send + Sync {
    async fn resolve_attachment(&self, att: &Attachment) -> Result<Vec<u8>>;
}

/// A processing-status handle; opaque to everyone but the issuing adapter.
#[derive(Debug, Clone)]
pub struct ProcessingHandle(pub String);

#[async_trait]
pub trait ProcessingStatusNotifier: Send + Sync {
    async fn started(&self, info: &Value) -> Result<ProcessingHandle>;
    async fn completed(&self, handle: &ProcessingHandle) -> Result<()>;
    async fn failed(&self, handle: &ProcessingHandle, cause: &str) -> Result<()>;
}

#[async_trait]
pub trait ChannelDirectoryAdapter: Send + Sync {
    async fn resolve_by_channel_identity(
        &self,
        subject: &str,
        display_name: &str,
        meta: &Value,
    ) -> Result<Option<String>>;
}

/// Everything a registered adapter contributes, gathered at registration
/// time rather than probed later with a downcast.
#[derive(Clone)]
pub struct AdapterEntry {
    pub adapter: Arc<dyn Adapter>,
    pub sender: Option<Arc<dyn Sender>>,
    pub stream_sender: Option<Arc<dyn StreamSender>>,
    pub receiver: Option<Arc<dyn Receiver>>,
    pub reactor: Option<Arc<dyn Reactor>>,
    pub editor: Option<Arc<dyn MessageEditor>>,
    pub self_discoverer: Option<Arc<dyn SelfDiscoverer>>,
    pub config_normalizer: Option<Arc<dyn ConfigNormalizer>>,
    pub target_resolver: Option<Arc<dyn TargetResolver>>,
    pub binding_matcher: Option<Arc<dyn BindingMatcher>>,
    pub attachment_resolver: Option<Arc<dyn AttachmentResolver>>,
    pub status_notifier: Option<Arc<dyn ProcessingStatusNotifier>>,
    pub directory: Option<Arc<dyn ChannelDirectoryAdapter>>,
}

/// Builder for an [`AdapterEntry`], so callers only set the capabilities
/// their concrete adapter actually has.
pub struct AdapterRegistration {
    entry: AdapterEntry,
}

impl AdapterRegistration {
    pub fn new(adapter: Arc<dyn Adapter>) -> Self {
        Self {
            entry: AdapterEntry {
                adapter,
                sender: None,
                stream_sender: None,
                receiver: None,
                reactor: None,
                editor: None,
                self_discoverer: None,
                config_normalizer: None,
                target_resolver: None,
                binding_matcher: None,
                attachment_resolver: None,
                status_notifier: None,
                directory: None,
            },
        }
    }

    pub fn with_sender(mut self, v: Arc<dyn Sender>) -> Self {
        self.entry.sender = Some(v);
        self
    }
    pub fn with_stream_sender(mut self, v: Arc<dyn StreamSender>) -> Self {
        self.entry.stream_sender = Some(v);
        self
    }
    pub fn with_receiver(mut self, v: Arc<dyn Receiver>) -> Self {
        self.entry.receiver = Some(v);
        self
    }
    pub fn with_reactor(mut self, v: Arc<dyn Reactor>) -> Self {
        self.entry.reactor = Some(v);
        self
    }
    pub fn with_editor(mut self, v: Arc<dyn MessageEditor>) -> Self {
        self.entry.editor = Some(v);
        self
    }
    pub fn with_self_discoverer(mut self, v: Arc<dyn SelfDiscoverer>) -> Self {
        self.entry.self_discoverer = Some(v);
        self
    }
    pub fn with_config_normalizer(mut self, v: Arc<dyn ConfigNormalizer>) -> Self {
        self.entry.config_normalizer = Some(v);
        self
    }
    pub fn with_target_resolver(mut self, v: Arc<dyn TargetResolver>) -> Self {
        self.entry.target_resolver = Some(v);
        self
    }
    pub fn with_binding_matcher(mut self, v: Arc<dyn BindingMatcher>) -> Self {
        self.entry.binding_matcher = Some(v);
        self
    }
    pub fn with_attachment_resolver(mut self, v: Arc<dyn AttachmentResolver>) -> Self {
        self.entry.attachment_resolver = Some(v);
        self
    }
    pub fn with_status_notifier(mut self, v: Arc<dyn ProcessingStatusNotifier>) -> Self {
        self.entry.status_notifier = Some(v);
        self
    }
    pub fn with_directory(mut self, v: Arc<dyn ChannelDirectoryAdapter>) -> Self {
        self.entry.directory = Some(v);
        self
    }

    pub fn build(self) -> AdapterEntry {
        self.entry
    }
}

/// Holds adapters keyed by normalised channel type, guarded by a read-write
/// lock so lookups never block behind each other, only behind a writer.
#[derive(Default)]
pub struct Registry {
    adapters: RwLock<HashMap<ChannelType, AdapterEntry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self { adapters: RwLock::new(HashMap::new()) }
    }

    pub async fn register(&self, entry: AdapterEntry) -> Result<()> {
        let channel = entry.adapter.channel_type();
        let mut guard = self.adapters.write().await;
        if guard.contains_key(&channel) {
            return Err(ChannelError::DuplicateAdapter(channel));
        }
        guard.insert(channel, entry);
        Ok(())
    }

    pub async fn get(&self, channel: &ChannelType) -> Option<AdapterEntry> {
        self.adapters.read().await.get(channel).cloned()
    }

    pub async fn list_types(&self) -> Vec<ChannelType> {
        self.adapters.read().await.keys().cloned().collect()
    }

    pub async fn descriptor(&self, channel: &ChannelType) -> Result<AdapterDescriptor> {
        self.get(channel)
            .await
            .map(|e| e.adapter.descriptor())
            .ok_or_else(|| ChannelError::AdapterNotFound(channel.clone()))
    }

    pub async fn sender(&self, channel: &ChannelType) -> Result<Arc<dyn Sender>> {
        self.capability(channel, |e| e.sender.clone(), "Sender").await
    }

    pub async fn stream_sender(&self, channel: &ChannelType) -> Result<Arc<dyn StreamSender>> {
        self.capability(channel, |e| e.stream_sender.clone(), "StreamSender").await
    }

    pub async fn receiver(&self, channel: &ChannelType) -> Result<Arc<dyn Receiver>> {
        self.capability(channel, |e| e.receiver.clone(), "Receiver").await
    }

    pub async fn reactor(&self, channel: &ChannelType) -> Result<Arc<dyn Reactor>> {
        self.capability(channel, |e| e.reactor.clone(), "Reactor").await
    }

    pub async fn editor(&self, channel: &ChannelType) -> Result<Arc<dyn MessageEditor>> {
        self.capability(channel, |e| e.editor.clone(), "MessageEditor").await
    }

    pub async fn attachment_resolver(&self, channel: &ChannelType) -> Option<Arc<dyn AttachmentResolver>> {
        self.get(channel).await.and_then(|e| e.attachment_resolver)
    }

    pub async fn status_notifier(&self, channel: &ChannelType) -> Option<Arc<dyn ProcessingStatusNotifier>> {
        self.get(channel).await.and_then(|e| e.status_notifier)
    }

    pub async fn directory(&self, channel: &ChannelType) -> Option<Arc<dyn ChannelDirectoryAdapter>> {
        self.get(channel).await.and_then(|e| e.directory)
    }

    async fn capability<T, F>(&self, channel: &ChannelType, pick: F, name: &'static str) -> Result<T>
    where
        F: FnOnce(&AdapterEntry) -> Option<T>,
    {
        let entry = self
            .get(channel)
            .await
            .ok_or_else(|| ChannelError::AdapterNotFound(channel.clone()))?;
        pick(&entry).ok_or(ChannelError::UnsupportedCapability { channel: channel.clone(), capability: name })
    }

    /// `NormalizeConfig` thin dispatch: identity when the adapter does not
    /// implement `ConfigNormalizer`.
    pub async fn normalize_config(&self, channel: &ChannelType, raw: Value) -> Value {
        match self.get(channel).await.and_then(|e| e.config_normalizer) {
            Some(n) => n.normalize_config(raw),
            None => raw,
        }
    }

    /// `NormalizeUserConfig` thin dispatch: identity when unsupported.
    pub async fn normalize_user_config(&self, channel: &ChannelType, raw: Value) -> Value {
        match self.get(channel).await.and_then(|e| e.config_normalizer) {
            Some(n) => n.normalize_user_config(raw),
            None => raw,
        }
    }

    /// `ResolveTargetFromUserConfig` thin dispatch: reports unsupported when
    /// the adapter has no `TargetResolver`.
    pub async fn resolve_target_from_user_config(
        &self,
        channel: &ChannelType,
        user_config: &Value,
    ) -> Result<Option<String>> {
        match self.get(channel).await.and_then(|e| e.target_resolver) {
            Some(r) => Ok(r.resolve_target_from_user_config(user_config).await),
            None => Err(ChannelError::UnsupportedCapability { channel: channel.clone(), capability: "TargetResolver" }),
        }
    }

    /// `NormalizeTarget` thin dispatch: identity when unsupported.
    pub async fn normalize_target(&self, channel: &ChannelType, target: &str) -> String {
        match self.get(channel).await.and_then(|e| e.target_resolver) {
            Some(r) => r.normalize_target(target),
            None => target.to_string(),
        }
    }

    /// `MatchUserBinding` thin dispatch: reports unsupported when the
    /// adapter has no `BindingMatcher`.
    pub async fn match_user_binding(&self, channel: &ChannelType, criteria: &Value) -> Result<Option<Value>> {
        match self.get(channel).await.and_then(|e| e.binding_matcher) {
            Some(m) => Ok(m.match_user_binding(criteria)),
            None => Err(ChannelError::UnsupportedCapability { channel: channel.clone(), capability: "BindingMatcher" }),
        }
    }

    /// `BuildUserBindingConfig` thin dispatch: reports unsupported when the
    /// adapter has no `BindingMatcher`.
    pub async fn build_user_binding_config(&self, channel: &ChannelType, identity: &Value) -> Result<Value> {
        match self.get(channel).await.and_then(|e| e.binding_matcher) {
            Some(m) => Ok(m.build_user_binding_config(identity)),
            None => Err(ChannelError::UnsupportedCapability { channel: channel.clone(), capability: "BindingMatcher" }),
        }
    }
}
