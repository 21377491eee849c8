//! Configuration loading and validation.
//!
//! Mirrors the teacher's raw-TOML / resolved-config split: `TomlConfig` and
//! friends deserialize exactly what's on disk (optional fields, "env:VAR"
//! indirection strings), and `GatewayConfig::from_toml` resolves them
//! against defaults into the struct the rest of the crate actually reads.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::Deserialize;

use crate::error::{ChannelError, Result};
use crate::model::{ChunkerMode, MediaOrder, OutboundPolicy};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Instance root directory (`~/.chatbridge` or `CHATBRIDGE_DIR`).
    pub instance_dir: PathBuf,
    pub worker: WorkerPoolConfig,
    pub outbound: OutboundPolicy,
    pub auth: AuthConfig,
    pub trigger: TriggerConfig,
    pub bots: Vec<BotConfig>,
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerPoolConfig {
    pub size: usize,
    pub queue_depth: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self { size: 4, queue_depth: 256 }
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: Option<String>,
    pub chat_token_ttl_secs: u64,
    pub user_token_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self { jwt_secret: None, chat_token_ttl_secs: 3600, user_token_ttl_secs: 86_400 }
    }
}

#[derive(Debug, Clone)]
pub struct TriggerConfig {
    pub default_command_prefix: String,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self { default_command_prefix: "/".into() }
    }
}

/// Per-bot policy consulted by the identity resolver (spec.md §4.5).
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub id: String,
    pub personal: bool,
    pub owner_user_id: Option<String>,
    pub allow_guests: bool,
    pub unbound_reply: String,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            personal: false,
            owner_user_id: None,
            allow_guests: false,
            unbound_reply: "You are not authorized to use this bot.".into(),
        }
    }
}

#[derive(Deserialize, Default)]
struct TomlConfig {
    #[serde(default)]
    worker: Option<TomlWorkerConfig>,
    #[serde(default)]
    outbound: Option<TomlOutboundConfig>,
    #[serde(default)]
    auth: Option<TomlAuthConfig>,
    #[serde(default)]
    trigger: Option<TomlTriggerConfig>,
    #[serde(default)]
    bots: Vec<TomlBotConfig>,
}

#[derive(Deserialize)]
struct TomlWorkerConfig {
    size: Option<usize>,
    queue_depth: Option<usize>,
}

#[derive(Deserialize)]
struct TomlOutboundConfig {
    text_chunk_limit: Option<usize>,
    chunker_mode: Option<String>,
    media_order: Option<String>,
    retry_max: Option<u32>,
    retry_backoff_ms: Option<u64>,
}

#[derive(Deserialize)]
struct TomlAuthConfig {
    jwt_secret: Option<String>,
    chat_token_ttl_secs: Option<u64>,
    user_token_ttl_secs: Option<u64>,
}

#[derive(Deserialize)]
struct TomlTriggerConfig {
    default_command_prefix: Option<String>,
}

#[derive(Deserialize)]
struct TomlBotConfig {
    id: String,
    #[serde(default)]
    personal: bool,
    owner_user_id: Option<String>,
    #[serde(default)]
    allow_guests: bool,
    unbound_reply: Option<String>,
}

/// Resolve a value that might be an "env:VAR_NAME" reference.
fn resolve_env_value(value: &str) -> Option<String> {
    if let Some(var_name) = value.strip_prefix("env:") {
        std::env::var(var_name).ok()
    } else {
        Some(value.to_string())
    }
}

fn parse_chunker_mode(raw: &str) -> ChunkerMode {
    match raw {
        "markdown" => ChunkerMode::Markdown,
        _ => ChunkerMode::Text,
    }
}

fn parse_media_order(raw: &str) -> MediaOrder {
    match raw {
        "text_first" => MediaOrder::TextFirst,
        _ => MediaOrder::MediaFirst,
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            instance_dir: PathBuf::from("./.chatbridge"),
            worker: WorkerPoolConfig::default(),
            outbound: OutboundPolicy::default(),
            auth: AuthConfig::default(),
            trigger: TriggerConfig::default(),
            bots: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Load from the default config file, falling back to environment
    /// variables only when no file is present.
    pub fn load() -> Result<Self> {
        let instance_dir = std::env::var("CHATBRIDGE_DIR").map(PathBuf::from).unwrap_or_else(|_| {
            dirs::data_dir().map(|d| d.join("chatbridge")).unwrap_or_else(|| PathBuf::from("./.chatbridge"))
        });

        let config_path = instance_dir.join("config.toml");
        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Ok(Self::from_env(instance_dir))
        }
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let instance_dir = path.parent().map(|p| p.to_path_buf()).unwrap_or_else(|| PathBuf::from("."));

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))
            .map_err(ChannelError::Other)?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))
            .map_err(ChannelError::Other)?;

        Self::from_toml(toml_config, instance_dir)
    }

    /// No config file present: everything falls back to built-in defaults
    /// plus whatever the environment supplies for the JWT secret.
    fn from_env(instance_dir: PathBuf) -> Self {
        Self {
            instance_dir,
            worker: WorkerPoolConfig::default(),
            outbound: OutboundPolicy::default(),
            auth: AuthConfig { jwt_secret: std::env::var("CHATBRIDGE_JWT_SECRET").ok(), ..AuthConfig::default() },
            trigger: TriggerConfig::default(),
            bots: Vec::new(),
        }
    }

    fn from_toml(toml: TomlConfig, instance_dir: PathBuf) -> Result<Self> {
        let base_worker = WorkerPoolConfig::default();
        let worker = toml
            .worker
            .map(|w| WorkerPoolConfig {
                size: w.size.unwrap_or(base_worker.size),
                queue_depth: w.queue_depth.unwrap_or(base_worker.queue_depth),
            })
            .unwrap_or(base_worker);

        let base_outbound = OutboundPolicy::default();
        let outbound = toml
            .outbound
            .map(|o| OutboundPolicy {
                text_chunk_limit: o.text_chunk_limit.unwrap_or(base_outbound.text_chunk_limit),
                chunker_mode: o.chunker_mode.as_deref().map(parse_chunker_mode).unwrap_or(base_outbound.chunker_mode),
                media_order: o.media_order.as_deref().map(parse_media_order).unwrap_or(base_outbound.media_order),
                retry_max: o.retry_max.unwrap_or(base_outbound.retry_max),
                retry_backoff_ms: o.retry_backoff_ms.unwrap_or(base_outbound.retry_backoff_ms),
            })
            .unwrap_or(base_outbound);

        let base_auth = AuthConfig::default();
        let auth = toml
            .auth
            .map(|a| AuthConfig {
                jwt_secret: a
                    .jwt_secret
                    .as_deref()
                    .and_then(resolve_env_value)
                    .or_else(|| std::env::var("CHATBRIDGE_JWT_SECRET").ok()),
                chat_token_ttl_secs: a.chat_token_ttl_secs.unwrap_or(base_auth.chat_token_ttl_secs),
                user_token_ttl_secs: a.user_token_ttl_secs.unwrap_or(base_auth.user_token_ttl_secs),
            })
            .unwrap_or_else(|| AuthConfig {
                jwt_secret: std::env::var("CHATBRIDGE_JWT_SECRET").ok(),
                ..base_auth
            });

        let trigger = toml
            .trigger
            .map(|t| TriggerConfig {
                default_command_prefix: t.default_command_prefix.unwrap_or_else(|| "/".into()),
            })
            .unwrap_or_default();

        let bots = toml
            .bots
            .into_iter()
            .map(|b| {
                let defaults = BotConfig::default();
                BotConfig {
                    id: b.id,
                    personal: b.personal,
                    owner_user_id: b.owner_user_id,
                    allow_guests: b.allow_guests,
                    unbound_reply: b.unbound_reply.unwrap_or(defaults.unbound_reply),
                }
            })
            .collect();

        Ok(GatewayConfig { instance_dir, worker, outbound, auth, trigger, bots })
    }

    pub fn bot(&self, bot_id: &str) -> Option<&BotConfig> {
        self.bots.iter().find(|b| b.id == bot_id)
    }
}
