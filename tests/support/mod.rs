//! Shared in-memory fakes for integration tests: a `Store`, a `Runner`, a
//! `RouteResolver` and a recording channel adapter.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use chatbridge::error::Result;
use chatbridge::inbound::{RouteResolution, RouteResolveRequest, RouteResolver};
use chatbridge::media::{Asset, MediaInput, MediaService};
use chatbridge::model::{
    ChannelCapabilities, ChannelConfig, ChannelType, Message, StreamEvent,
};
use chatbridge::registry::{
    Adapter, AdapterDescriptor, AdapterRegistration, LiveStream, Registry, Sender, StreamSender,
};
use chatbridge::runner::{ChatRequest, ChatStream, Runner, RunnerChunk};
use chatbridge::store::{ChannelIdentityBinding, ChannelIdentityCriteria, PersistedMessage, Store};

pub struct FakeStore {
    pub configs: Mutex<Vec<ChannelConfig>>,
    pub bindings: Mutex<HashMap<String, ChannelIdentityBinding>>,
    pub persisted: Mutex<Vec<PersistedMessage>>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self { configs: Mutex::new(Vec::new()), bindings: Mutex::new(HashMap::new()), persisted: Mutex::new(Vec::new()) }
    }

    pub fn with_binding(self, subject: &str, channel_identity_id: &str, linked_user_id: Option<&str>) -> Self {
        self.bindings.lock().unwrap().insert(
            subject.to_string(),
            ChannelIdentityBinding { channel_identity_id: channel_identity_id.into(), linked_user_id: linked_user_id.map(String::from) },
        );
        self
    }
}

#[async_trait]
impl Store for FakeStore {
    async fn list_configs_by_type(&self, channel: &ChannelType) -> Result<Vec<ChannelConfig>> {
        Ok(self.configs.lock().unwrap().iter().filter(|c| &c.channel_type == channel).cloned().collect())
    }
    async fn resolve_effective_config(&self, bot_id: &str, channel: &ChannelType) -> Result<Option<ChannelConfig>> {
        Ok(self.configs.lock().unwrap().iter().find(|c| c.bot_id == bot_id && &c.channel_type == channel).cloned())
    }
    async fn upsert_config(&self, cfg: ChannelConfig) -> Result<ChannelConfig> {
        let mut configs = self.configs.lock().unwrap();
        configs.retain(|c| c.id != cfg.id);
        configs.push(cfg.clone());
        Ok(cfg)
    }
    async fn update_config_disabled(&self, id: &str, disabled: bool) -> Result<()> {
        if let Some(c) = self.configs.lock().unwrap().iter_mut().find(|c| c.id == id) {
            c.disabled = disabled;
        }
        Ok(())
    }
    async fn delete_config(&self, id: &str) -> Result<()> {
        self.configs.lock().unwrap().retain(|c| c.id != id);
        Ok(())
    }
    async fn resolve_channel_identity_binding(&self, criteria: &ChannelIdentityCriteria) -> Result<Option<ChannelIdentityBinding>> {
        Ok(self.bindings.lock().unwrap().get(&criteria.subject).cloned())
    }
    async fn get_channel_identity_config(&self, _channel_identity: &str, _channel: &ChannelType) -> Result<Option<serde_json::Value>> {
        Ok(None)
    }
    async fn link_channel_identity(&self, _channel_identity_id: &str, _user_id: &str) -> Result<()> {
        Ok(())
    }
    async fn persist_message(&self, message: PersistedMessage) -> Result<()> {
        self.persisted.lock().unwrap().push(message);
        Ok(())
    }
}

pub fn sample_config(id: &str, bot_id: &str, channel: &str) -> ChannelConfig {
    ChannelConfig {
        id: id.into(),
        bot_id: bot_id.into(),
        channel_type: ChannelType::new(channel),
        credentials: serde_json::Value::Null,
        external_identity: None,
        self_identity: serde_json::Value::Null,
        routing: serde_json::Value::Null,
        disabled: false,
        verified_at: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

/// A route resolver that always succeeds, deriving a deterministic route id
/// from the conversation id.
pub struct FakeRouteResolver;

#[async_trait]
impl RouteResolver for FakeRouteResolver {
    async fn resolve_route(&self, req: RouteResolveRequest) -> Result<RouteResolution> {
        Ok(RouteResolution { route_id: format!("route-{}", req.conversation_id), chat_id: None })
    }
}

/// A scripted runner: replays one canned sequence of chunks then either
/// closes cleanly or reports a terminal error.
pub struct FakeRunner {
    pub chunks: Mutex<Option<Vec<RunnerChunk>>>,
    pub terminal_error: Mutex<Option<String>>,
    pub calls: Mutex<u32>,
}

impl FakeRunner {
    pub fn with_final_text(text: &str) -> Self {
        let message = Message { text: Some(text.to_string()), ..Default::default() };
        let chunk = RunnerChunk { chunk_type: "final".into(), data: serde_json::json!({ "messages": [message] }) };
        Self { chunks: Mutex::new(Some(vec![chunk])), terminal_error: Mutex::new(None), calls: Mutex::new(0) }
    }

    pub fn with_error(error: &str) -> Self {
        Self { chunks: Mutex::new(Some(Vec::new())), terminal_error: Mutex::new(Some(error.to_string())), calls: Mutex::new(0) }
    }
}

#[async_trait]
impl Runner for FakeRunner {
    async fn stream_chat(&self, _request: ChatRequest) -> Result<ChatStream> {
        *self.calls.lock().unwrap() += 1;
        let chunks = self.chunks.lock().unwrap().take().unwrap_or_default();
        let error = self.terminal_error.lock().unwrap().take();

        let (tx, rx) = tokio::sync::mpsc::channel(16);
        let (err_tx, err_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            for chunk in chunks {
                if tx.send(chunk).await.is_err() {
                    return;
                }
            }
            if let Some(e) = error {
                let _ = err_tx.send(e);
            }
        });
        Ok(ChatStream { chunks: rx, error: err_rx })
    }
}

pub struct NoopMediaService;

#[async_trait]
impl MediaService for NoopMediaService {
    async fn ingest(&self, input: MediaInput) -> Result<Asset> {
        match input {
            MediaInput::Bytes { data, mime, .. } => Ok(Asset {
                id: "asset-1".into(),
                mime: mime.unwrap_or_else(|| "application/octet-stream".into()),
                storage_key: "key-1".into(),
                size: data.len() as u64,
            }),
            MediaInput::Url(url) => Ok(Asset { id: "asset-1".into(), mime: "application/octet-stream".into(), storage_key: url, size: 0 }),
        }
    }

    fn access_path(&self, asset: &Asset) -> String {
        format!("/assets/{}", asset.id)
    }
}

struct RecordingStream {
    events: Mutex<Vec<StreamEvent>>,
    closed: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl LiveStream for RecordingStream {
    async fn push(&self, event: &StreamEvent) -> Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
    async fn close(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

/// A channel adapter that records every one-shot send and every streamed
/// event so tests can assert on what the processor actually emitted.
pub struct RecordingAdapter {
    pub channel: ChannelType,
    pub sent: Mutex<Vec<(String, Message)>>,
    pub streams: Mutex<Vec<Arc<RecordingStream>>>,
}

impl RecordingAdapter {
    pub fn new(channel: &str) -> Arc<Self> {
        Arc::new(Self { channel: ChannelType::new(channel), sent: Mutex::new(Vec::new()), streams: Mutex::new(Vec::new()) })
    }

    /// Flattened events across every stream opened so far, in open order.
    pub fn all_stream_events(&self) -> Vec<StreamEvent> {
        self.streams.lock().unwrap().iter().flat_map(|s| s.events.lock().unwrap().clone()).collect()
    }
}

#[async_trait]
impl Adapter for RecordingAdapter {
    fn channel_type(&self) -> ChannelType {
        self.channel.clone()
    }
    fn descriptor(&self) -> AdapterDescriptor {
        AdapterDescriptor { channel_type: self.channel.clone(), capabilities: ChannelCapabilities::all(), configless: false }
    }
}

#[async_trait]
impl Sender for RecordingAdapter {
    async fn send(&self, target: &str, message: &Message) -> Result<()> {
        self.sent.lock().unwrap().push((target.to_string(), message.clone()));
        Ok(())
    }
}

#[async_trait]
impl StreamSender for RecordingAdapter {
    async fn open_stream(&self, _target: &str) -> Result<Arc<dyn LiveStream>> {
        let stream = Arc::new(RecordingStream { events: Mutex::new(Vec::new()), closed: std::sync::atomic::AtomicBool::new(false) });
        self.streams.lock().unwrap().push(stream.clone());
        Ok(stream)
    }
}

pub async fn build_registry(adapter: Arc<RecordingAdapter>) -> Arc<Registry> {
    let registry = Arc::new(Registry::new());
    let reg = AdapterRegistration::new(adapter.clone() as Arc<dyn Adapter>)
        .with_sender(adapter.clone() as Arc<dyn Sender>)
        .with_stream_sender(adapter as Arc<dyn StreamSender>);
    registry.register(reg.build()).await.unwrap();
    registry
}
