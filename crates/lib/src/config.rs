//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.relay/config.json`) and environment.
//! The `dispatch` section is converted once into an immutable [`DispatchConfig`]
//! that the pipeline holds for its whole lifetime.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::dispatch::delivery::fit_marker;
use crate::dispatch::{ClassifierMode, HistoryStrategy};

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Health endpoint settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Channel settings (e.g. Discord).
    #[serde(default)]
    pub channels: ChannelsConfig,

    /// Dispatch pipeline limits and mode.
    #[serde(default)]
    pub dispatch: DispatchSettings,

    /// External task command.
    #[serde(default)]
    pub task: TaskConfig,
}

/// Gateway bind and port for the health endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for HTTP health (default 15152).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,
}

fn default_gateway_port() -> u16 {
    15152
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
        }
    }
}

/// Per-channel config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelsConfig {
    #[serde(default)]
    pub discord: DiscordChannelConfig,
}

/// Discord channel config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscordChannelConfig {
    /// Bot token. Overridden by DISCORD_BOT_TOKEN env when set.
    pub bot_token: Option<String>,
    /// REST API base URL (default https://discord.com/api/v10).
    pub api_base: Option<String>,
}

/// Dispatch section as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchSettings {
    /// Platform message size ceiling, in characters.
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,
    /// History window, including the triggering message.
    #[serde(default = "default_max_history_messages")]
    pub max_history_messages: usize,
    #[serde(default = "default_task_timeout_seconds")]
    pub task_timeout_seconds: u64,
    #[serde(default = "default_outbound_rate_per_second")]
    pub outbound_rate_per_second: u32,
    /// Accept exactly one automated caller (`designatedTestCallerId`). RELAY_TEST_MODE env forces it on.
    #[serde(default)]
    pub test_mode: bool,
    #[serde(default)]
    pub designated_test_caller_id: Option<String>,
    /// Prefix the first reply chunk with a mention of the author.
    #[serde(default)]
    pub mention_reply: bool,
    #[serde(default = "default_continuation_marker")]
    pub continuation_marker: String,
    /// History retrieval strategies, tried in order.
    #[serde(default = "default_history_strategies")]
    pub history_strategies: Vec<HistoryStrategy>,
    /// Text placed before the generated prompt (e.g. persona or house rules).
    #[serde(default)]
    pub prompt_preamble: Option<String>,
}

fn default_max_message_length() -> usize {
    2000
}

fn default_max_history_messages() -> usize {
    50
}

fn default_task_timeout_seconds() -> u64 {
    1800
}

fn default_outbound_rate_per_second() -> u32 {
    2
}

fn default_continuation_marker() -> String {
    "(continued) ".to_string()
}

fn default_history_strategies() -> Vec<HistoryStrategy> {
    vec![HistoryStrategy::Before, HistoryStrategy::Recent]
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_message_length: default_max_message_length(),
            max_history_messages: default_max_history_messages(),
            task_timeout_seconds: default_task_timeout_seconds(),
            outbound_rate_per_second: default_outbound_rate_per_second(),
            test_mode: false,
            designated_test_caller_id: None,
            mention_reply: false,
            continuation_marker: default_continuation_marker(),
            history_strategies: default_history_strategies(),
            prompt_preamble: None,
        }
    }
}

/// External task: the command run once per qualifying message. The prompt is written to stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskConfig {
    /// Binary name or path (default "claude").
    #[serde(default = "default_task_command")]
    pub command: String,
    /// Arguments passed before the prompt is streamed in (default ["-p"]).
    #[serde(default = "default_task_args")]
    pub args: Vec<String>,
    pub working_directory: Option<PathBuf>,
    /// Extra environment variables for the task.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_task_command() -> String {
    "claude".to_string()
}

fn default_task_args() -> Vec<String> {
    vec!["-p".to_string()]
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            command: default_task_command(),
            args: default_task_args(),
            working_directory: None,
            env: BTreeMap::new(),
        }
    }
}

/// Immutable dispatch settings handed to the pipeline at construction.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub max_message_length: usize,
    pub max_history_messages: usize,
    pub task_timeout: Duration,
    pub outbound_rate_per_second: u32,
    pub mode: ClassifierMode,
    pub mention_reply: bool,
    pub continuation_marker: String,
    pub history_strategies: Vec<HistoryStrategy>,
    pub prompt_preamble: Option<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        DispatchConfig::from(&DispatchSettings::default())
    }
}

impl From<&DispatchSettings> for DispatchConfig {
    fn from(s: &DispatchSettings) -> Self {
        let mode = if s.test_mode {
            ClassifierMode::Test {
                designated_caller_id: s
                    .designated_test_caller_id
                    .as_ref()
                    .map(|id| id.trim().to_string())
                    .filter(|id| !id.is_empty()),
            }
        } else {
            ClassifierMode::Normal
        };
        let max_message_length = s.max_message_length.max(1);
        let continuation_marker = fit_marker(&s.continuation_marker, max_message_length);
        if continuation_marker != s.continuation_marker {
            log::warn!(
                "config: continuation marker {:?} too long for maxMessageLength {}, using {:?}",
                s.continuation_marker,
                max_message_length,
                continuation_marker
            );
        }
        Self {
            max_message_length,
            max_history_messages: s.max_history_messages.max(1),
            task_timeout: Duration::from_secs(s.task_timeout_seconds.max(1)),
            outbound_rate_per_second: s.outbound_rate_per_second.max(1),
            mode,
            mention_reply: s.mention_reply,
            continuation_marker,
            history_strategies: s.history_strategies.clone(),
            prompt_preamble: s
                .prompt_preamble
                .as_ref()
                .filter(|p| !p.trim().is_empty())
                .cloned(),
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

/// Resolve the Discord bot token: env DISCORD_BOT_TOKEN overrides config.
pub fn resolve_discord_token(config: &Config) -> Option<String> {
    non_empty_env("DISCORD_BOT_TOKEN").or_else(|| {
        config
            .channels
            .discord
            .bot_token
            .as_ref()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

/// Apply RELAY_TEST_MODE (`1` / `true`) on top of the file setting.
pub fn apply_env_overrides(config: &mut Config) {
    if let Some(v) = non_empty_env("RELAY_TEST_MODE") {
        if v == "1" || v.eq_ignore_ascii_case("true") {
            config.dispatch.test_mode = true;
        }
    }
    if let Some(id) = non_empty_env("RELAY_TEST_CALLER_ID") {
        config.dispatch.designated_test_caller_id = Some(id);
    }
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("RELAY_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".relay").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path, RELAY_CONFIG_PATH, or the default. Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let mut config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    apply_env_overrides(&mut config);
    Ok((config, path))
}
