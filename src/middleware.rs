//! Middleware composed around the manager's inbound handling (spec.md §4.2,
//! §4.4). Modeled on the teacher's `PromptHook` pattern: observe, then
//! continue — a middleware that wants to short-circuit still has to call
//! (or deliberately not call) `next`, it cannot silently swallow the result.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::error::Result;
use crate::model::{ChannelConfig, InboundMessage};

/// The rest of the chain, boxed so middleware can be stored as trait
/// objects in a `Vec` and composed in reverse registration order.
pub type Next<'a> = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> + Send + 'a>;

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, cfg: &ChannelConfig, msg: &InboundMessage, next: Next<'_>) -> Result<()>;
}

/// The one concrete middleware the core ships: structured before/after
/// logging around the wrapped call, grounded in the teacher's
/// `tracing::info!(channel_id = %..., "...")` call sites.
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn handle(&self, cfg: &ChannelConfig, msg: &InboundMessage, next: Next<'_>) -> Result<()> {
        info!(config_id = %cfg.id, channel = %msg.channel, bot_id = %msg.bot_id, "inbound message received");
        let result = next().await;
        match &result {
            Ok(()) => info!(config_id = %cfg.id, "inbound message handled"),
            Err(e) => tracing::warn!(config_id = %cfg.id, error = %e, "inbound message handling failed"),
        }
        result
    }
}

/// Builds the composed handler by wrapping `terminal` in `middlewares`
/// reverse registration order, i.e. the first-registered middleware runs
/// outermost. spec.md §4.2 step 5.
pub async fn run_chain<'a, F>(
    middlewares: &'a [Arc<dyn Middleware>],
    cfg: &'a ChannelConfig,
    msg: &'a InboundMessage,
    terminal: F,
) -> Result<()>
where
    F: Fn(&'a ChannelConfig, &'a InboundMessage) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>
        + Send
        + Sync
        + 'a,
{
    fn build<'a>(
        mws: &'a [Arc<dyn Middleware>],
        idx: usize,
        cfg: &'a ChannelConfig,
        msg: &'a InboundMessage,
        terminal: &'a (dyn Fn(&'a ChannelConfig, &'a InboundMessage) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>
              + Send
              + Sync),
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        if idx >= mws.len() {
            return terminal(cfg, msg);
        }
        let mw = mws[idx].clone();
        Box::pin(async move {
            let next: Next<'a> = Box::new(move || build(mws, idx + 1, cfg, msg, terminal));
            mw.handle(cfg, msg, next).await
        })
    }

    build(middlewares, 0, cfg, msg, &terminal).await
}
