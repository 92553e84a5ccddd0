//! Application configuration for the bookmark processor.
//!
//! User config lives at `~/.bookmarks/bookmarks.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BookmarkError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "bookmarks.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".bookmarks";

// ---------------------------------------------------------------------------
// Config structs (matching bookmarks.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// HTTP client settings.
    #[serde(default)]
    pub http: HttpConfig,

    /// Headless-render bridge settings.
    #[serde(default)]
    pub render: RenderConfig,

    /// LLM backend settings.
    #[serde(default)]
    pub llm: LlmConfig,

    /// Retry policies per operation class.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Marker tags appended by the pipeline.
    #[serde(default)]
    pub tags: TagsConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Number of record pipelines allowed to run at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,

    /// Path of the cache database.
    #[serde(default = "default_cache_db")]
    pub cache_db: String,

    /// Path of the blessed-tag list (one tag per line).
    #[serde(default = "default_blessed_tags")]
    pub blessed_tags: String,

    /// Lifetime of cached operation results.
    #[serde(default = "default_cache_ttl_days")]
    pub cache_ttl_days: u32,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            cache_db: default_cache_db(),
            blessed_tags: default_blessed_tags(),
            cache_ttl_days: default_cache_ttl_days(),
        }
    }
}

fn default_concurrency() -> u32 {
    8
}
fn default_cache_db() -> String {
    "~/.bookmarks/cache.db".into()
}
fn default_blessed_tags() -> String {
    "config/blessed_tags.txt".into()
}
fn default_cache_ttl_days() -> u32 {
    7
}

/// `[http]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Maximum redirects followed by probe and fetch.
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,

    /// TCP/TLS connect timeout.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Bodies larger than this are rejected.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            max_redirects: default_max_redirects(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_max_redirects() -> usize {
    10
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_max_body_bytes() -> u64 {
    10 * 1024 * 1024
}

/// `[render]` section. Rendering is disabled while `command` is unset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RenderConfig {
    /// Bridge executable (e.g., "bun").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Arguments passed to the bridge executable.
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the bridge process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

/// `[llm]` section (OpenAI-compatible chat completions endpoint).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL of the API, without the `/chat/completions` suffix.
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    /// Model identifier sent with every request.
    #[serde(default = "default_llm_model")]
    pub model: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Input text beyond this many characters is truncated before prompting.
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            api_key_env: default_api_key_env(),
            max_input_chars: default_max_input_chars(),
        }
    }
}

fn default_llm_base_url() -> String {
    "http://localhost:11434/v1".into()
}
fn default_llm_model() -> String {
    "qwen3:8b".into()
}
fn default_api_key_env() -> String {
    "BOOKMARKS_LLM_API_KEY".into()
}
fn default_max_input_chars() -> usize {
    12_000
}

/// Delay growth between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Every retry waits `base_delay`.
    Fixed,
    /// Retry *n* waits `base_delay * 2^(n-1)`, capped at `max_delay`.
    Exponential,
}

/// One `[retry.<class>]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay_ms: u64,
    /// Delay growth between attempts.
    pub backoff: Backoff,
    /// Upper bound for a single delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Time budget of one attempt.
    pub timeout_ms: u64,
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl RetryPolicyConfig {
    fn new(max_attempts: u32, base_delay_ms: u64, backoff: Backoff, timeout_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            backoff,
            max_delay_ms: default_max_delay_ms(),
            timeout_ms,
        }
    }
}

/// `[retry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_probe_policy")]
    pub probe: RetryPolicyConfig,
    #[serde(default = "default_fetch_policy")]
    pub fetch: RetryPolicyConfig,
    #[serde(default = "default_render_policy")]
    pub render: RetryPolicyConfig,
    #[serde(default = "default_extract_policy")]
    pub extract: RetryPolicyConfig,
    #[serde(default = "default_llm_policy")]
    pub llm: RetryPolicyConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            probe: default_probe_policy(),
            fetch: default_fetch_policy(),
            render: default_render_policy(),
            extract: default_extract_policy(),
            llm: default_llm_policy(),
        }
    }
}

fn default_probe_policy() -> RetryPolicyConfig {
    RetryPolicyConfig::new(3, 5_000, Backoff::Fixed, 10_000)
}
fn default_fetch_policy() -> RetryPolicyConfig {
    RetryPolicyConfig::new(3, 10_000, Backoff::Fixed, 20_000)
}
fn default_render_policy() -> RetryPolicyConfig {
    RetryPolicyConfig::new(2, 30_000, Backoff::Fixed, 60_000)
}
fn default_extract_policy() -> RetryPolicyConfig {
    RetryPolicyConfig::new(1, 0, Backoff::Fixed, 30_000)
}
fn default_llm_policy() -> RetryPolicyConfig {
    RetryPolicyConfig::new(3, 2_000, Backoff::Exponential, 120_000)
}

/// `[tags]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagsConfig {
    /// Appended to records whose URL failed every liveness stage.
    #[serde(default = "default_offline_tag")]
    pub offline_tag: String,

    /// Appended to records whose URL redirected somewhere else.
    #[serde(default = "default_redirected_tag")]
    pub redirected_tag: String,
}

impl Default for TagsConfig {
    fn default() -> Self {
        Self {
            offline_tag: default_offline_tag(),
            redirected_tag: default_redirected_tag(),
        }
    }
}

fn default_offline_tag() -> String {
    "data:offline".into()
}
fn default_redirected_tag() -> String {
    "data:redirected".into()
}

// ---------------------------------------------------------------------------
// Retry policy (runtime, converted from config)
// ---------------------------------------------------------------------------

/// Runtime retry policy attached to one operation class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Delay growth between attempts.
    pub backoff: Backoff,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
    /// Time budget of one attempt.
    pub timeout: Duration,
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Exponential => {
                let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
                self.base_delay
                    .checked_mul(factor)
                    .unwrap_or(self.max_delay)
                    .min(self.max_delay)
            }
        }
    }
}

impl From<&RetryPolicyConfig> for RetryPolicy {
    fn from(config: &RetryPolicyConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            backoff: config.backoff,
            max_delay: Duration::from_millis(config.max_delay_ms.max(config.base_delay_ms)),
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.bookmarks/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| BookmarkError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.bookmarks/bookmarks.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| BookmarkError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        BookmarkError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let path = config_file_path()?;
    init_config_at(&path)?;
    Ok(path)
}

/// Write a default config file at `path`. An existing file is left untouched.
pub fn init_config_at(path: &Path) -> Result<()> {
    if path.exists() {
        return Err(BookmarkError::config(format!(
            "{} already exists; edit it or remove it first",
            path.display()
        )));
    }
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| BookmarkError::io(dir, e))?;
    }

    let content = toml::to_string_pretty(&AppConfig::default())
        .map_err(|e| BookmarkError::config(e.to_string()))?;
    std::fs::write(path, content).map_err(|e| BookmarkError::io(path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(())
}

/// Reject configurations the engine cannot run with.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    if config.defaults.concurrency == 0 {
        return Err(BookmarkError::config("defaults.concurrency must be at least 1"));
    }
    if config.defaults.cache_ttl_days == 0 {
        return Err(BookmarkError::config("defaults.cache_ttl_days must be at least 1"));
    }

    let policies = [
        ("probe", &config.retry.probe),
        ("fetch", &config.retry.fetch),
        ("render", &config.retry.render),
        ("extract", &config.retry.extract),
        ("llm", &config.retry.llm),
    ];
    for (name, policy) in policies {
        if policy.max_attempts == 0 {
            return Err(BookmarkError::config(format!(
                "retry.{name}.max_attempts must be at least 1"
            )));
        }
        if policy.timeout_ms == 0 {
            return Err(BookmarkError::config(format!(
                "retry.{name}.timeout_ms must be greater than 0"
            )));
        }
    }
    Ok(())
}

/// Read the LLM API key from the env var named in the config, if it is set.
pub fn resolve_api_key(config: &LlmConfig) -> Option<String> {
    std::env::var(&config.api_key_env)
        .ok()
        .filter(|val| !val.is_empty())
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}
