//! Typed error kinds for the channel gateway core.
//!
//! Every kind named in the design's error handling section gets its own
//! variant so callers can match on it instead of parsing strings. Only the
//! `Other` escape hatch carries an opaque `anyhow::Error`, for the glue code
//! at process boundaries (config loading, adapter plumbing) where a typed
//! variant would not add anything a caller could act on.

use crate::model::ChannelType;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, ChannelError>;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel config not found for bot {bot_id} / channel {channel}")]
    ConfigNotFound { bot_id: String, channel: ChannelType },

    #[error("adapter for channel {0} does not support stop")]
    StopNotSupported(ChannelType),

    #[error("enabling channel failed: {cause}")]
    EnableChannelFailed {
        cause: Box<ChannelError>,
        /// Set when the upsert rollback itself failed after the enable path failed.
        rollback_cause: Option<Box<ChannelError>>,
    },

    #[error("channel {channel} does not support capability {capability}")]
    CapabilityNotSupported {
        channel: ChannelType,
        capability: &'static str,
    },

    #[error("attachment reference required: at least one of url, platform_key, asset_id must be set")]
    AttachmentReferenceRequired,

    #[error("attachment with only asset_id is not dispatchable until resolved to url or platform_key")]
    AssetIdOnlyNotDispatchable,

    #[error("asset exceeds the media service's size cap")]
    AssetTooLarge,

    #[error("stream error: {0}")]
    StreamError(String),

    #[error("processing-status notification failed: {0}")]
    StatusNotifyFailed(String),

    #[error("no adapter registered for channel {0}")]
    AdapterNotFound(ChannelType),

    #[error("adapter for channel {channel} does not implement capability {capability}")]
    UnsupportedCapability {
        channel: ChannelType,
        capability: &'static str,
    },

    #[error("duplicate adapter registration for channel {0}")]
    DuplicateAdapter(ChannelType),

    #[error("invalid stream event: {0}")]
    InvalidStreamEvent(String),

    #[error("empty outbound message")]
    EmptyOutboundMessage,

    #[error("delivery target could not be resolved")]
    TargetUnresolved,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ChannelError {
    pub fn enable_failed(cause: ChannelError) -> Self {
        ChannelError::EnableChannelFailed {
            cause: Box::new(cause),
            rollback_cause: None,
        }
    }

    pub fn enable_failed_with_rollback(cause: ChannelError, rollback_cause: ChannelError) -> Self {
        ChannelError::EnableChannelFailed {
            cause: Box::new(cause),
            rollback_cause: Some(Box::new(rollback_cause)),
        }
    }

    /// `true` for errors that map to the store's "not found" condition, per
    /// the design's rollback-branch selection in the lifecycle coordinator.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ChannelError::ConfigNotFound { .. })
    }
}
