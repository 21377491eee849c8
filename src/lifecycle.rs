//! Lifecycle coordinator: wraps store + manager so every admin mutation
//! (upsert / delete / enable / disable) atomically reconciles persisted
//! state and the runtime connection, with rollback on partial failure.
//! spec.md §4.6.

use std::sync::Arc;

use tracing::{error, warn};

use crate::error::{ChannelError, Result};
use crate::manager::Manager;
use crate::model::{ChannelConfig, ChannelType};
use crate::store::Store;

pub struct LifecycleCoordinator {
    store: Arc<dyn Store>,
    manager: Arc<Manager>,
}

impl LifecycleCoordinator {
    pub fn new(store: Arc<dyn Store>, manager: Arc<Manager>) -> Self {
        Self { store, manager }
    }

    /// spec.md §4.6 "Upsert algorithm".
    pub async fn upsert_bot_channel_config(&self, bot_id: &str, channel: &ChannelType, req: ChannelConfig) -> Result<ChannelConfig> {
        let previous = self.store.resolve_effective_config(bot_id, channel).await?;

        let disabled = req.disabled;
        let persisted = self.store.upsert_config(req).await?;

        if disabled {
            self.manager.remove_connection(&persisted.id, channel).await?;
            return Ok(persisted);
        }

        match self.manager.ensure_connection(persisted.clone()).await {
            Ok(()) => Ok(persisted),
            Err(cause) => {
                let rollback_cause = self.rollback_upsert(&persisted, previous, channel).await.err();
                match rollback_cause {
                    Some(rollback) => Err(ChannelError::enable_failed_with_rollback(cause, rollback)),
                    None => Err(ChannelError::enable_failed(cause)),
                }
            }
        }
    }

    async fn rollback_upsert(&self, persisted: &ChannelConfig, previous: Option<ChannelConfig>, channel: &ChannelType) -> Result<()> {
        match previous {
            Some(prev) => {
                let restored = self.store.upsert_config(prev.clone()).await?;
                if restored.disabled {
                    self.manager.remove_connection(&restored.id, channel).await?;
                } else {
                    self.manager.ensure_connection(restored).await?;
                }
                Ok(())
            }
            None => {
                self.store.delete_config(&persisted.id).await?;
                self.manager.remove_connection(&persisted.id, channel).await?;
                Ok(())
            }
        }
    }

    /// spec.md §4.6 "Set-status": flip back and stop the connection on
    /// enable failure, with the same error-wrap semantics as upsert.
    pub async fn set_bot_channel_status(&self, bot_id: &str, channel: &ChannelType, disabled: bool) -> Result<()> {
        let cfg = self
            .store
            .resolve_effective_config(bot_id, channel)
            .await?
            .ok_or_else(|| ChannelError::ConfigNotFound { bot_id: bot_id.to_string(), channel: channel.clone() })?;

        self.store.update_config_disabled(&cfg.id, disabled).await?;

        if disabled {
            self.manager.remove_connection(&cfg.id, channel).await?;
            return Ok(());
        }

        match self.manager.ensure_connection(ChannelConfig { disabled: false, ..cfg.clone() }).await {
            Ok(()) => Ok(()),
            Err(cause) => {
                let rollback_cause = match self.store.update_config_disabled(&cfg.id, true).await {
                    Ok(()) => {
                        if let Err(e) = self.manager.remove_connection(&cfg.id, channel).await {
                            warn!(config_id = %cfg.id, error = %e, "remove_connection failed during status rollback");
                        }
                        None
                    }
                    Err(e) => Some(e),
                };
                match rollback_cause {
                    Some(rollback) => Err(ChannelError::enable_failed_with_rollback(cause, rollback)),
                    None => Err(ChannelError::enable_failed(cause)),
                }
            }
        }
    }

    /// spec.md §4.6 "Delete": delete persisted config then remove the
    /// connection.
    pub async fn delete_bot_channel_config(&self, bot_id: &str, channel: &ChannelType) -> Result<()> {
        let cfg = self
            .store
            .resolve_effective_config(bot_id, channel)
            .await?
            .ok_or_else(|| ChannelError::ConfigNotFound { bot_id: bot_id.to_string(), channel: channel.clone() })?;

        self.store.delete_config(&cfg.id).await?;
        if let Err(e) = self.manager.remove_connection(&cfg.id, channel).await {
            error!(config_id = %cfg.id, error = %e, "remove_connection failed during delete");
            return Err(e);
        }
        Ok(())
    }
}
