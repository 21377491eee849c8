//! Two-phase identity resolution and authorisation policy chain. spec.md
//! §4.5. The bind-code / membership / preauth backing services are not
//! named among the external interfaces in spec.md §6 (only their policy
//! effect is), so they are modeled here as small optional trait objects —
//! a deployment that does not support bind codes or preauth keys for a bot
//! simply does not wire one in, and that phase is a no-op. See DESIGN.md.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::config::BotConfig;
use crate::error::Result;
use crate::model::{ChannelType, Identity};
use crate::store::{ChannelIdentityCriteria, Store};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindCodeOutcome {
    NoMatch,
    Success,
    Used,
    Expired,
    Mismatch,
    LinkConflict,
}

#[async_trait]
pub trait BindCodeService: Send + Sync {
    async fn try_consume(&self, bot_id: &str, channel_identity_id: &str, text: &str) -> BindCodeOutcome;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreauthOutcome {
    NoMatch,
    Success,
    Used,
    Expired,
    Mismatch,
}

#[async_trait]
pub trait PreauthKeyService: Send + Sync {
    async fn try_consume(&self, bot_id: &str, user_id: &str, text: &str) -> PreauthOutcome;
}

#[async_trait]
pub trait MembershipService: Send + Sync {
    async fn is_member(&self, bot_id: &str, user_id: &str) -> bool;
}

/// What phase 1 resolved before authorisation is applied.
#[derive(Debug, Clone)]
pub struct ResolvedIdentity {
    pub channel_identity_id: String,
    pub linked_user_id: Option<String>,
    pub channel_config_id: Option<String>,
    pub force_reply: bool,
}

/// The outcome of running the full resolver over an inbound message.
#[derive(Debug, Clone)]
pub enum ResolveOutcome {
    Continue(ResolvedIdentity),
    /// `None` means drop silently; `Some(text)` means send that reply and
    /// stop.
    Stop(Option<String>),
}

pub struct IdentityResolver {
    store: Arc<dyn Store>,
    bind_codes: Option<Arc<dyn BindCodeService>>,
    preauth: Option<Arc<dyn PreauthKeyService>>,
    membership: Option<Arc<dyn MembershipService>>,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store, bind_codes: None, preauth: None, membership: None }
    }

    pub fn with_bind_codes(mut self, svc: Arc<dyn BindCodeService>) -> Self {
        self.bind_codes = Some(svc);
        self
    }
    pub fn with_preauth(mut self, svc: Arc<dyn PreauthKeyService>) -> Self {
        self.preauth = Some(svc);
        self
    }
    pub fn with_membership(mut self, svc: Arc<dyn MembershipService>) -> Self {
        self.membership = Some(svc);
        self
    }

    /// Phase 1: resolve `sender` to a channel identity by trying each
    /// subject candidate in order, returning on first success.
    pub async fn resolve_channel_identity(
        &self,
        channel: &ChannelType,
        sender: &Identity,
        channel_config_id: Option<&str>,
        configless: bool,
    ) -> Result<Option<ResolvedIdentity>> {
        for candidate in sender.subject_candidates() {
            let criteria = ChannelIdentityCriteria {
                channel: channel.clone(),
                subject: candidate,
                display_name: sender.display_name.clone(),
                metadata: serde_json::Value::Null,
            };
            if let Some(binding) = self.store.resolve_channel_identity_binding(&criteria).await? {
                let mut linked_user_id = binding.linked_user_id.clone();

                // Side channel: configless channels best-effort link an
                // unlinked identity carrying a user_id attribute.
                if configless && linked_user_id.is_none() {
                    if let Some(user_id) = sender.attributes.get("user_id") {
                        match self.store.link_channel_identity(&binding.channel_identity_id, user_id).await {
                            Ok(()) => linked_user_id = Some(user_id.clone()),
                            Err(e) => log_link_failure(e),
                        }
                    }
                }

                return Ok(Some(ResolvedIdentity {
                    channel_identity_id: binding.channel_identity_id,
                    linked_user_id,
                    channel_config_id: if configless { None } else { channel_config_id.map(str::to_string) },
                    force_reply: false,
                }));
            }
        }
        Ok(None)
    }

    /// Runs the full two-phase resolution described in spec.md §4.5.
    pub async fn resolve(
        &self,
        channel: &ChannelType,
        sender: &Identity,
        text: &str,
        is_group: bool,
        channel_config_id: Option<&str>,
        configless: bool,
        bot: Option<&BotConfig>,
    ) -> Result<ResolveOutcome> {
        if !sender.is_resolvable() {
            return Ok(ResolveOutcome::Stop(None));
        }

        let resolved = match self.resolve_channel_identity(channel, sender, channel_config_id, configless).await? {
            Some(r) => r,
            None => return Ok(ResolveOutcome::Stop(None)),
        };

        let trimmed = text.trim();

        // 1. Bind-code.
        if let Some(svc) = &self.bind_codes {
            if let Some(bot) = bot {
                match svc.try_consume(&bot.id, &resolved.channel_identity_id, trimmed).await {
                    BindCodeOutcome::NoMatch => {}
                    BindCodeOutcome::Success => {
                        return Ok(ResolveOutcome::Stop(Some("Account linked successfully.".into())))
                    }
                    BindCodeOutcome::Used => {
                        return Ok(ResolveOutcome::Stop(Some("This bind code has already been used.".into())))
                    }
                    BindCodeOutcome::Expired => {
                        return Ok(ResolveOutcome::Stop(Some("This bind code has expired.".into())))
                    }
                    BindCodeOutcome::Mismatch => {
                        return Ok(ResolveOutcome::Stop(Some("This bind code is not valid.".into())))
                    }
                    BindCodeOutcome::LinkConflict => {
                        return Ok(ResolveOutcome::Stop(Some(
                            "This account is already linked to a different user.".into(),
                        )))
                    }
                }
            }
        }

        let Some(bot) = bot else {
            // No bot policy configured at all: fall through to unbound reply.
            return Ok(ResolveOutcome::Stop(Some(
                "You are not authorized to use this bot.".into(),
            )));
        };

        // 2. Personal-bot ownership.
        if bot.personal {
            let is_owner = resolved.linked_user_id.as_deref().is_some()
                && resolved.linked_user_id.as_deref() == bot.owner_user_id.as_deref();
            if !is_owner {
                return Ok(ResolveOutcome::Stop(None));
            }
            return Ok(ResolveOutcome::Continue(resolved));
        }

        // 3. Membership.
        if let (Some(svc), Some(user_id)) = (&self.membership, resolved.linked_user_id.as_deref()) {
            if svc.is_member(&bot.id, user_id).await {
                return Ok(ResolveOutcome::Continue(resolved));
            }
        }

        // 4. Owner bypass.
        if resolved.linked_user_id.as_deref().is_some() && resolved.linked_user_id.as_deref() == bot.owner_user_id.as_deref() {
            return Ok(ResolveOutcome::Continue(resolved));
        }

        // 5. Guest policy.
        if bot.allow_guests {
            return Ok(ResolveOutcome::Continue(resolved));
        }

        // 6. Preauth key.
        if let (Some(svc), Some(user_id)) = (&self.preauth, resolved.linked_user_id.as_deref()) {
            match svc.try_consume(&bot.id, user_id, trimmed).await {
                PreauthOutcome::NoMatch => {}
                PreauthOutcome::Success => {
                    return Ok(ResolveOutcome::Stop(Some("Access granted.".into())))
                }
                PreauthOutcome::Used => {
                    return Ok(ResolveOutcome::Stop(Some("This preauth key has already been used.".into())))
                }
                PreauthOutcome::Expired => {
                    return Ok(ResolveOutcome::Stop(Some("This preauth key has expired.".into())))
                }
                PreauthOutcome::Mismatch => {
                    return Ok(ResolveOutcome::Stop(Some("This preauth key is not valid.".into())))
                }
            }
        }

        // 7. Group silence.
        if is_group {
            return Ok(ResolveOutcome::Stop(None));
        }

        // 8. Unbound reply.
        Ok(ResolveOutcome::Stop(Some(bot.unbound_reply.clone())))
    }
}

pub(crate) fn log_link_failure(err: impl std::fmt::Display) {
    warn!(error = %err, "best-effort channel identity link failed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ChannelIdentityBinding;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct FakeStore {
        bindings: HashMap<String, ChannelIdentityBinding>,
    }

    #[async_trait]
    impl Store for FakeStore {
        async fn list_configs_by_type(&self, _channel: &ChannelType) -> Result<Vec<crate::model::ChannelConfig>> {
            Ok(Vec::new())
        }
        async fn resolve_effective_config(
            &self,
            _bot_id: &str,
            _channel: &ChannelType,
        ) -> Result<Option<crate::model::ChannelConfig>> {
            Ok(None)
        }
        async fn upsert_config(&self, cfg: crate::model::ChannelConfig) -> Result<crate::model::ChannelConfig> {
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
            criteria: &ChannelIdentityCriteria,
        ) -> Result<Option<ChannelIdentityBinding>> {
            Ok(self.bindings.get(&criteria.subject).cloned())
        }
        async fn get_channel_identity_config(
            &self,
            _channel_identity: &str,
            _channel: &ChannelType,
        ) -> Result<Option<serde_json::Value>> {
            Ok(None)
        }
        async fn link_channel_identity(&self, _channel_identity_id: &str, _user_id: &str) -> Result<()> {
            Ok(())
        }
        async fn persist_message(&self, _message: crate::store::PersistedMessage) -> Result<()> {
            Ok(())
        }
    }

    fn identity(subject: &str) -> Identity {
        Identity { subject_id: subject.into(), display_name: String::new(), attributes: HashMap::new() }
    }

    #[tokio::test]
    async fn unresolvable_candidates_stop_without_reply() {
        let store = Arc::new(FakeStore { bindings: HashMap::new() });
        let resolver = IdentityResolver::new(store);
        let outcome = resolver
            .resolve(&ChannelType::new("feishu"), &identity("ghost"), "hi", false, None, false, None)
            .await
            .unwrap();
        assert!(matches!(outcome, ResolveOutcome::Stop(None)));
    }

    #[tokio::test]
    async fn owner_bypass_allows_regardless_of_membership() {
        let mut bindings = HashMap::new();
        bindings.insert(
            "owner1".to_string(),
            ChannelIdentityBinding { channel_identity_id: "ci1".into(), linked_user_id: Some("u1".into()) },
        );
        let store = Arc::new(FakeStore { bindings });
        let resolver = IdentityResolver::new(store);
        let bot = BotConfig { id: "bot1".into(), owner_user_id: Some("u1".into()), ..Default::default() };
        let outcome = resolver
            .resolve(&ChannelType::new("feishu"), &identity("owner1"), "hi", false, None, false, Some(&bot))
            .await
            .unwrap();
        assert!(matches!(outcome, ResolveOutcome::Continue(_)));
    }

    #[tokio::test]
    async fn personal_bot_drops_non_owner_in_group() {
        let mut bindings = HashMap::new();
        bindings.insert(
            "other".to_string(),
            ChannelIdentityBinding { channel_identity_id: "ci2".into(), linked_user_id: Some("u2".into()) },
        );
        let store = Arc::new(FakeStore { bindings });
        let resolver = IdentityResolver::new(store);
        let bot = BotConfig { id: "bot1".into(), personal: true, owner_user_id: Some("u1".into()), ..Default::default() };
        let outcome = resolver
            .resolve(&ChannelType::new("feishu"), &identity("other"), "hi", true, None, false, Some(&bot))
            .await
            .unwrap();
        assert!(matches!(outcome, ResolveOutcome::Stop(None)));
    }

    #[tokio::test]
    async fn group_silence_drops_unauthorized_without_reply() {
        let mut bindings = HashMap::new();
        bindings.insert(
            "stranger".to_string(),
            ChannelIdentityBinding { channel_identity_id: "ci3".into(), linked_user_id: Some("u3".into()) },
        );
        let store = Arc::new(FakeStore { bindings });
        let resolver = IdentityResolver::new(store);
        let bot = BotConfig { id: "bot1".into(), owner_user_id: Some("u1".into()), ..Default::default() };
        let outcome = resolver
            .resolve(&ChannelType::new("feishu"), &identity("stranger"), "hi", true, None, false, Some(&bot))
            .await
            .unwrap();
        assert!(matches!(outcome, ResolveOutcome::Stop(None)));
    }

    #[tokio::test]
    async fn unbound_reply_in_direct_conversation() {
        let mut bindings = HashMap::new();
        bindings.insert(
            "stranger".to_string(),
            ChannelIdentityBinding { channel_identity_id: "ci4".into(), linked_user_id: Some("u4".into()) },
        );
        let store = Arc::new(FakeStore { bindings });
        let resolver = IdentityResolver::new(store);
        let bot = BotConfig { id: "bot1".into(), owner_user_id: Some("u1".into()), unbound_reply: "nope".into(), ..Default::default() };
        let outcome = resolver
            .resolve(&ChannelType::new("feishu"), &identity("stranger"), "hi", false, None, false, Some(&bot))
            .await
            .unwrap();
        assert!(matches!(outcome, ResolveOutcome::Stop(Some(ref s)) if s == "nope"));
    }
}
