//! Connection-lifecycle manager: owns live connections, runs the reconcile
//! loop, dispatches outbound sends, hosts the inbound worker pool, wires
//! middleware. spec.md §4.2. Grounded in the teacher's `Channel::run`
//! `tokio::select!` event loop for the "never hold a lock across I/O"
//! discipline, generalised from one long-lived agent channel to a set of
//! reconciled connections.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use crate::config::GatewayConfig;
use crate::error::{ChannelError, Result};
use crate::middleware::{run_chain, Middleware};
use crate::model::{ChannelConfig, ChannelType, ConnectionStatus, InboundMessage, Message, OutboundMessage, StreamEvent};
use crate::outbound::{build_outbound_messages, send_with_config, validate_capabilities_for, validate_stream_event};
use crate::registry::{LiveStream, Registry};
use crate::store::Store;

/// An inbound handler is whatever ultimately processes a message once
/// middleware has run; the manager depends only on this trait so it never
/// needs to know about the inbound processor's identity resolution, route
/// resolution or runner plumbing.
#[async_trait::async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle(&self, cfg: &ChannelConfig, msg: &InboundMessage, reply: &ReplySender) -> Result<()>;
}

#[derive(Clone)]
struct ConnectionEntry {
    config: ChannelConfig,
}

#[derive(Default)]
struct ManagerState {
    connections: HashMap<String, ConnectionEntry>,
    meta: HashMap<String, ConnectionStatus>,
}

struct InboundJob {
    cfg: ChannelConfig,
    msg: InboundMessage,
    reply: ReplySender,
}

pub struct Manager {
    registry: Arc<Registry>,
    store: Arc<dyn Store>,
    state: Mutex<ManagerState>,
    reconcile_lock: Mutex<()>,
    middlewares: Vec<Arc<dyn Middleware>>,
    handler: Arc<dyn InboundHandler>,
    inbound_tx: mpsc::Sender<InboundJob>,
    worker_handles: Vec<tokio::task::JoinHandle<()>>,
}

impl Manager {
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<dyn Store>,
        handler: Arc<dyn InboundHandler>,
        middlewares: Vec<Arc<dyn Middleware>>,
        config: &GatewayConfig,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.worker.queue_depth);
        let manager = Arc::new(Self {
            registry,
            store,
            state: Mutex::new(ManagerState::default()),
            reconcile_lock: Mutex::new(()),
            middlewares,
            handler,
            inbound_tx: tx,
            worker_handles: Vec::new(),
        });
        Self::spawn_workers(manager.clone(), rx, config.worker.size)
    }

    fn spawn_workers(manager: Arc<Self>, rx: mpsc::Receiver<InboundJob>, size: usize) -> Arc<Self> {
        let rx = Arc::new(Mutex::new(rx));
        for _ in 0..size.max(1) {
            let manager = manager.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let job = { rx.lock().await.recv().await };
                    match job {
                        Some(job) => manager.process_job(job).await,
                        None => break,
                    }
                }
            });
        }
        manager
    }

    async fn process_job(&self, job: InboundJob) {
        let handler = self.handler.clone();
        let result = run_chain(&self.middlewares, &job.cfg, &job.msg, move |cfg, msg| {
            let handler = handler.clone();
            let reply = job.reply.clone();
            Box::pin(async move { handler.handle(cfg, msg, &reply).await })
        })
        .await;
        if let Err(e) = result {
            error!(error = %e, "inbound handling failed");
        }
    }

    /// Enqueues a message for pooled processing; blocks on a full queue so
    /// backpressure reaches the adapter (spec.md §4.2 "Inbound dispatch").
    pub async fn handle_inbound(&self, cfg: ChannelConfig, msg: InboundMessage) -> Result<()> {
        let reply = ReplySender { registry: self.registry.clone(), channel: cfg.channel_type.clone(), policy: Default::default() };
        self.inbound_tx
            .send(InboundJob { cfg, msg, reply })
            .await
            .map_err(|_| ChannelError::Other(anyhow::anyhow!("inbound queue closed")))
    }

    async fn mark_running(&self, cfg: &ChannelConfig) {
        let mut state = self.state.lock().await;
        state.meta.insert(
            cfg.id.clone(),
            ConnectionStatus {
                config_id: cfg.id.clone(),
                bot_id: cfg.bot_id.clone(),
                channel_type: cfg.channel_type.clone(),
                running: true,
                last_error: None,
                updated_at: Utc::now(),
            },
        );
    }

    async fn mark_failed(&self, cfg: &ChannelConfig, err: &str) {
        let mut state = self.state.lock().await;
        state.meta.insert(
            cfg.id.clone(),
            ConnectionStatus {
                config_id: cfg.id.clone(),
                bot_id: cfg.bot_id.clone(),
                channel_type: cfg.channel_type.clone(),
                running: false,
                last_error: Some(err.to_string()),
                updated_at: Utc::now(),
            },
        );
    }

    /// The critical-path connection reconciliation algorithm. spec.md §4.2
    /// "EnsureConnection algorithm".
    pub async fn ensure_connection(&self, cfg: ChannelConfig) -> Result<()> {
        // Step 1: no Receiver registered -> failed, not fatal to the caller.
        let receiver = match self.registry.receiver(&cfg.channel_type).await {
            Ok(r) => r,
            Err(_) => {
                self.mark_failed(&cfg, "no receiver registered for this channel type").await;
                return Ok(());
            }
        };

        // Step 2: unchanged config short-circuits.
        {
            let state = self.state.lock().await;
            if let Some(entry) = state.connections.get(&cfg.id) {
                if entry.config.updated_at >= cfg.updated_at {
                    drop(state);
                    self.mark_running(&cfg).await;
                    return Ok(());
                }
            }
        }

        // Step 3: detach old entry under lock, then stop it without holding the lock.
        let old_entry = {
            let mut state = self.state.lock().await;
            state.connections.remove(&cfg.id)
        };

        if let Some(old) = old_entry {
            match receiver.stop(&old.config.id).await {
                Ok(true) => {}
                Ok(false) => {
                    let mut state = self.state.lock().await;
                    state.connections.insert(cfg.id.clone(), old);
                    warn!(config_id = %cfg.id, "restart skipped: stop not supported");
                    return Ok(());
                }
                Err(e) => {
                    self.mark_failed(&cfg, &e.to_string()).await;
                    return Err(e);
                }
            }
        }

        // Step 4: re-check for a racer before connecting.
        {
            let state = self.state.lock().await;
            if state.connections.contains_key(&cfg.id) {
                return Ok(());
            }
        }

        // Step 5: connect without holding the lock.
        if let Err(e) = receiver.connect(&cfg.id).await {
            self.mark_failed(&cfg, &e.to_string()).await;
            return Err(e);
        }

        // Step 6: install unless a racer beat us to it.
        {
            let mut state = self.state.lock().await;
            if state.connections.contains_key(&cfg.id) {
                drop(state);
                let _ = receiver.stop(&cfg.id).await;
                return Ok(());
            }
            state.connections.insert(cfg.id.clone(), ConnectionEntry { config: cfg.clone() });
        }
        self.mark_running(&cfg).await;
        Ok(())
    }

    pub async fn remove_connection(&self, config_id: &str, channel: &ChannelType) -> Result<()> {
        let old_entry = {
            let mut state = self.state.lock().await;
            state.connections.remove(config_id)
        };
        if old_entry.is_some() {
            if let Ok(receiver) = self.registry.receiver(channel).await {
                match receiver.stop(config_id).await {
                    Ok(_) => {}
                    Err(e) => warn!(config_id, error = %e, "stop failed during removal"),
                }
            }
        }
        let mut state = self.state.lock().await;
        state.meta.remove(config_id);
        Ok(())
    }

    /// Lists all configs of every registered channel type, ensures
    /// connections for the enabled ones, then removes anything live whose
    /// config id fell out of the active set. spec.md §4.2 "Reconcile".
    pub async fn reconcile(&self) -> Result<()> {
        let _guard = self.reconcile_lock.lock().await;

        let mut active = HashSet::new();
        for channel in self.registry.list_types().await {
            let configs = match self.store.list_configs_by_type(&channel).await {
                Ok(c) => c,
                Err(e) => {
                    error!(channel = %channel, error = %e, "failed to list configs during reconcile");
                    continue;
                }
            };
            for cfg in configs {
                if cfg.disabled {
                    continue;
                }
                active.insert(cfg.id.clone());
                if let Err(e) = self.ensure_connection(cfg.clone()).await {
                    error!(config_id = %cfg.id, error = %e, "ensure_connection failed during reconcile");
                }
            }
        }

        let stale: Vec<(String, ChannelType)> = {
            let state = self.state.lock().await;
            state
                .connections
                .iter()
                .filter(|(id, _)| !active.contains(*id))
                .map(|(id, e)| (id.clone(), e.config.channel_type.clone()))
                .collect()
        };
        for (id, channel) in stale {
            let _ = self.remove_connection(&id, &channel).await;
        }
        Ok(())
    }

    pub async fn status(&self, config_id: &str) -> Option<ConnectionStatus> {
        self.state.lock().await.meta.get(config_id).cloned()
    }

    /// Resolves the effective config, sender, and delivery target, then
    /// dispatches the built outbound sequence. spec.md §4.2 "Outbound Send".
    pub async fn send(&self, bot_id: &str, channel: &ChannelType, message: OutboundMessage) -> Result<()> {
        let cfg = self
            .store
            .resolve_effective_config(bot_id, channel)
            .await?
            .ok_or_else(|| ChannelError::ConfigNotFound { bot_id: bot_id.to_string(), channel: channel.clone() })?;

        let entry = self.registry.get(channel).await.ok_or_else(|| ChannelError::AdapterNotFound(channel.clone()))?;
        let descriptor = entry.adapter.descriptor();

        let target = if !message.target.trim().is_empty() {
            message.target.clone()
        } else {
            self.registry
                .resolve_target_from_user_config(channel, &cfg.routing)
                .await?
                .ok_or(ChannelError::TargetUnresolved)?
        };
        let target = self.registry.normalize_target(channel, &target).await;

        let policy = crate::model::OutboundPolicy::default().normalize();
        let items = build_outbound_messages(&message.message, &policy)?;
        for item in &items {
            validate_capabilities_for(item, &descriptor)?;
        }
        for item in items {
            send_with_config(&entry, &target, &item, &policy).await?;
        }
        Ok(())
    }

    /// spec.md §4.2 "React": target + message id mandatory, emoji mandatory
    /// unless removing.
    pub async fn react(&self, channel: &ChannelType, target: &str, message_id: &str, emoji: Option<&str>) -> Result<()> {
        if target.trim().is_empty() || message_id.trim().is_empty() {
            return Err(ChannelError::TargetUnresolved);
        }
        let reactor = self.registry.reactor(channel).await?;
        reactor.react(target, message_id, emoji).await
    }

    pub async fn shutdown(&self) {
        let ids: Vec<(String, ChannelType)> = {
            let state = self.state.lock().await;
            state.connections.iter().map(|(id, e)| (id.clone(), e.config.channel_type.clone())).collect()
        };
        for (id, channel) in ids {
            let _ = self.remove_connection(&id, &channel).await;
        }
        info!("manager shutdown complete");
    }
}

/// The per-message reply sender the manager constructs and hands to the
/// inbound handler. Exposes `send` (one-shot outbound) and `open_stream`
/// (the live streaming reply channel). spec.md §4.4.
#[derive(Clone)]
pub struct ReplySender {
    registry: Arc<Registry>,
    channel: ChannelType,
    policy: crate::model::OutboundPolicy,
}

impl ReplySender {
    pub fn new(registry: Arc<Registry>, channel: ChannelType, policy: crate::model::OutboundPolicy) -> Self {
        Self { registry, channel, policy }
    }

    pub async fn send(&self, target: &str, message: &Message) -> Result<()> {
        let entry = self.registry.get(&self.channel).await.ok_or_else(|| ChannelError::AdapterNotFound(self.channel.clone()))?;
        let descriptor = entry.adapter.descriptor();
        let items = build_outbound_messages(message, &self.policy)?;
        for item in &items {
            validate_capabilities_for(item, &descriptor)?;
        }
        for item in items {
            send_with_config(&entry, target, &item, &self.policy).await?;
        }
        Ok(())
    }

    pub async fn open_stream(&self, target: &str) -> Result<ReplyStream> {
        let entry = self.registry.get(&self.channel).await.ok_or_else(|| ChannelError::AdapterNotFound(self.channel.clone()))?;
        let caps = entry.adapter.descriptor().capabilities;
        let stream_sender = entry
            .stream_sender
            .clone()
            .ok_or_else(|| ChannelError::UnsupportedCapability { channel: self.channel.clone(), capability: "StreamSender" })?;
        let live = stream_sender.open_stream(target).await?;
        Ok(ReplyStream { live, caps })
    }
}

/// A single opened streaming reply. `push` validates before delegating to
/// the adapter; `close` always releases adapter resources and never
/// propagates its own errors (spec.md §4.4).
pub struct ReplyStream {
    live: Arc<dyn LiveStream>,
    caps: crate::model::ChannelCapabilities,
}

impl ReplyStream {
    pub async fn push(&self, event: StreamEvent) -> Result<()> {
        validate_stream_event(&self.caps, &event)?;
        self.live.push(&event).await
    }

    pub async fn close(&self) {
        self.live.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ChannelCapabilities;
    use crate::registry::{Adapter, AdapterDescriptor, AdapterRegistration, Receiver};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeAdapter {
        channel: ChannelType,
    }
    #[async_trait]
    impl Adapter for FakeAdapter {
        fn channel_type(&self) -> ChannelType {
            self.channel.clone()
        }
        fn descriptor(&self) -> AdapterDescriptor {
            AdapterDescriptor { channel_type: self.channel.clone(), capabilities: ChannelCapabilities::all(), configless: false }
        }
    }

    struct CountingReceiver {
        connects: Arc<AtomicUsize>,
    }
    #[async_trait]
    impl Receiver for CountingReceiver {
        async fn connect(&self, _cfg_id: &str) -> Result<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn stop(&self, _cfg_id: &str) -> Result<bool> {
            Ok(true)
        }
    }

    struct FakeStore {
        configs: std::sync::Mutex<Vec<ChannelConfig>>,
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
        async fn get_channel_identity_config(&self, _id: &str, _channel: &ChannelType) -> Result<Option<serde_json::Value>> {
            Ok(None)
        }
        async fn link_channel_identity(&self, _channel_identity_id: &str, _user_id: &str) -> Result<()> {
            Ok(())
        }
        async fn persist_message(&self, _message: crate::store::PersistedMessage) -> Result<()> {
            Ok(())
        }
    }

    struct NoopHandler;
    #[async_trait]
    impl InboundHandler for NoopHandler {
        async fn handle(&self, _cfg: &ChannelConfig, _msg: &InboundMessage, _reply: &ReplySender) -> Result<()> {
            Ok(())
        }
    }

    fn sample_config(id: &str, channel: &str) -> ChannelConfig {
        ChannelConfig {
            id: id.into(),
            bot_id: "bot1".into(),
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

    async fn build_manager(connects: Arc<AtomicUsize>, configs: Vec<ChannelConfig>) -> (Arc<Manager>, Arc<FakeStore>) {
        let registry = Arc::new(Registry::new());
        let adapter: Arc<dyn Adapter> = Arc::new(FakeAdapter { channel: ChannelType::new("feishu") });
        let reg = AdapterRegistration::new(adapter).with_receiver(Arc::new(CountingReceiver { connects }));
        registry.register(reg.build()).await.unwrap();

        let store = Arc::new(FakeStore { configs: std::sync::Mutex::new(configs) });
        let config = GatewayConfig::default();
        (Manager::new(registry, store.clone(), Arc::new(NoopHandler), Vec::new(), &config), store)
    }

    #[tokio::test]
    async fn ensure_connection_connects_once_for_unchanged_config() {
        let connects = Arc::new(AtomicUsize::new(0));
        let cfg = sample_config("c1", "feishu");
        let (manager, _store) = build_manager(connects.clone(), vec![cfg.clone()]).await;

        manager.ensure_connection(cfg.clone()).await.unwrap();
        manager.ensure_connection(cfg.clone()).await.unwrap();
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reconcile_installs_only_enabled_configs_with_receivers() {
        let connects = Arc::new(AtomicUsize::new(0));
        let mut enabled = sample_config("c1", "feishu");
        enabled.updated_at = Utc::now();
        let mut disabled = sample_config("c2", "feishu");
        disabled.disabled = true;
        let (manager, _store) = build_manager(connects.clone(), vec![enabled, disabled]).await;

        manager.reconcile().await.unwrap();
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert!(manager.status("c1").await.unwrap().running);
        assert!(manager.status("c2").await.is_none());
    }

    #[tokio::test]
    async fn reconcile_removes_stale_connections() {
        let connects = Arc::new(AtomicUsize::new(0));
        let cfg = sample_config("c1", "feishu");
        let (manager, store) = build_manager(connects.clone(), vec![cfg.clone()]).await;
        manager.reconcile().await.unwrap();
        assert!(manager.status("c1").await.is_some());

        store.configs.lock().unwrap().clear();
        manager.reconcile().await.unwrap();
        assert!(manager.status("c1").await.is_none());
    }

    #[tokio::test]
    async fn react_requires_target_and_message_id() {
        let connects = Arc::new(AtomicUsize::new(0));
        let (manager, _store) = build_manager(connects, vec![]).await;
        let err = manager.react(&ChannelType::new("feishu"), "", "m1", Some("👍")).await.unwrap_err();
        assert!(matches!(err, ChannelError::TargetUnresolved));
    }
}
