use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub forum: ForumConfig,
    pub llm: LlmConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub email: EmailConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ForumConfig {
    /// Base URL of the treehole API, e.g. `https://treehole.pku.edu.cn`.
    pub base_url: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Delay between consecutive searches, to stay polite to the forum.
    #[serde(default = "default_search_delay_ms")]
    pub search_delay_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// OpenAI-compatible API base, e.g. `https://api.deepseek.com`.
    pub base_url: String,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_response_tokens")]
    pub max_response_tokens: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_max_search_results")]
    pub max_search_results: u32,
    #[serde(default = "default_max_context_posts")]
    pub max_context_posts: usize,
    #[serde(default = "default_max_comments_per_post")]
    pub max_comments_per_post: usize,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_context_token_budget")]
    pub context_token_budget: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_search_results: 40,
            max_context_posts: 30,
            max_comments_per_post: 5,
            max_iterations: 3,
            context_token_budget: 10_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
    /// Cached search results older than this are refetched.
    #[serde(default = "default_cache_expiration_secs")]
    pub expiration_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_cache_dir(),
            expiration_secs: default_cache_expiration_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmailConfig {
    /// Only messages whose subject starts with this prefix are handled.
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            subject_prefix: default_subject_prefix(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    10
}
fn default_search_delay_ms() -> u64 {
    1000
}
fn default_temperature() -> f64 {
    0.7
}
fn default_max_response_tokens() -> u32 {
    4096
}
fn default_llm_timeout_secs() -> u64 {
    120
}
fn default_max_search_results() -> u32 {
    40
}
fn default_max_context_posts() -> usize {
    30
}
fn default_max_comments_per_post() -> usize {
    5
}
fn default_max_iterations() -> u32 {
    3
}
fn default_context_token_budget() -> usize {
    10_000
}
fn default_cache_enabled() -> bool {
    true
}
fn default_cache_dir() -> PathBuf {
    PathBuf::from("./cache")
}
fn default_cache_expiration_secs() -> u64 {
    86_400
}
fn default_bind() -> String {
    "127.0.0.1:5000".to_string()
}
fn default_subject_prefix() -> String {
    "树洞".to_string()
}
fn default_poll_interval_secs() -> u64 {
    60
}

impl SearchConfig {
    pub fn limits(&self) -> treehole_core::SearchLimits {
        treehole_core::SearchLimits {
            max_search_results: self.max_search_results,
            max_context_posts: self.max_context_posts,
            max_iterations: self.max_iterations,
            max_comments_per_post: self.max_comments_per_post,
            context_token_budget: self.context_token_budget,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.forum.base_url.is_empty() {
        anyhow::bail!("forum.base_url must not be empty");
    }
    if config.llm.base_url.is_empty() {
        anyhow::bail!("llm.base_url must not be empty");
    }
    if config.llm.model.is_empty() {
        anyhow::bail!("llm.model must not be empty");
    }
    if !(0.0..=2.0).contains(&config.llm.temperature) {
        anyhow::bail!("llm.temperature must be in [0.0, 2.0]");
    }
    if config.search.max_iterations == 0 {
        anyhow::bail!("search.max_iterations must be >= 1");
    }
    if config.search.max_context_posts == 0 {
        anyhow::bail!("search.max_context_posts must be >= 1");
    }

    Ok(config)
}
