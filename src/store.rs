//! Store contract consumed from persistence. spec.md §6. This crate ships
//! no concrete implementation; see `tests/support` for an in-memory fake
//! used by integration tests.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::model::ChannelType;
use crate::model::ChannelConfig;

#[derive(Debug, Clone)]
pub struct ChannelIdentityBinding {
    pub channel_identity_id: String,
    pub linked_user_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ChannelIdentityCriteria {
    pub channel: ChannelType,
    pub subject: String,
    pub display_name: String,
    pub metadata: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    PassiveSync,
    ActiveChat,
}

#[derive(Debug, Clone)]
pub struct AssetRef {
    pub asset_id: String,
    pub role: String,
    pub ordinal: u32,
    pub mime: Option<String>,
    pub size: Option<u64>,
}

/// A user-role message persisted by the inbound processor (spec.md §4.4
/// step 7). Persistence is named as a pipeline step but, like route
/// resolution, has no dedicated external contract in spec.md §6 — it is
/// modeled as part of the same `Store` abstraction rather than inventing a
/// separate interface. See DESIGN.md.
#[derive(Debug, Clone)]
pub struct PersistedMessage {
    pub bot_id: String,
    pub route_id: String,
    pub trigger_mode: TriggerMode,
    pub sender_subject_id: String,
    pub text: String,
    pub asset_refs: Vec<AssetRef>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn list_configs_by_type(&self, channel: &ChannelType) -> Result<Vec<ChannelConfig>>;

    /// Returns `Ok(None)` for "not found" rather than a typed error, so
    /// callers distinguish "config missing" from a real store failure and
    /// the lifecycle coordinator can take its "no previous config" branch.
    async fn resolve_effective_config(&self, bot_id: &str, channel: &ChannelType) -> Result<Option<ChannelConfig>>;

    async fn upsert_config(&self, cfg: ChannelConfig) -> Result<ChannelConfig>;
    async fn update_config_disabled(&self, id: &str, disabled: bool) -> Result<()>;
    async fn delete_config(&self, id: &str) -> Result<()>;

    async fn resolve_channel_identity_binding(
        &self,
        criteria: &ChannelIdentityCriteria,
    ) -> Result<Option<ChannelIdentityBinding>>;

    async fn get_channel_identity_config(
        &self,
        channel_identity_id: &str,
        channel: &ChannelType,
    ) -> Result<Option<Value>>;

    /// Best-effort link used by the identity resolver's configless side
    /// channel (spec.md §4.5): link an unlinked channel identity to a user.
    async fn link_channel_identity(&self, channel_identity_id: &str, user_id: &str) -> Result<()>;

    /// spec.md §4.4 step 7. Persistence failures are logged by the caller
    /// and never abort processing.
    async fn persist_message(&self, message: PersistedMessage) -> Result<()>;
}
