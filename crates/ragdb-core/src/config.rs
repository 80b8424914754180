//! Layered configuration loader and path helpers.
//!
//! Figment merges serialized defaults, `config.toml`, `config.<env>.toml`
//! (env from `RUST_ENV`) and `APP_*` environment variables, in that order.
//! Nested keys use a double underscore in the environment:
//! `APP_QUERY__RRF_K=30`.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

use crate::chunker::ChunkingConfig;
use crate::error::{Error, Result};

pub struct Config {
    figment: Figment,
}

impl Config {
    pub fn load() -> Result<Self> {
        let env_name = env::var("RUST_ENV").unwrap_or_else(|_| "dev".to_string());
        Self::load_for_env(&env_name)
    }

    pub fn load_for_env(env_name: &str) -> Result<Self> {
        let mut figment = Figment::new().merge(Toml::file("config.toml"));
        match env_name {
            "dev" | "development" => figment = figment.merge(Toml::file("config.dev.toml")),
            "prod" | "production" => figment = figment.merge(Toml::file("config.prod.toml")),
            "test" | "testing" => figment = figment.merge(Toml::file("config.test.toml")),
            _ => {}
        }
        figment = figment.merge(Env::prefixed("APP_").split("__"));
        Self::from_figment(figment)
    }

    /// Build from an arbitrary provider stack layered over the defaults.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config = Self { figment: Figment::from(Serialized::defaults(Settings::default())).merge(figment) };
        config.settings()?;
        Ok(config)
    }

    pub fn get<T>(&self, key: &str) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.figment
            .extract_inner(key)
            .map_err(|e| Error::InvalidConfig(format!("Failed to get '{}': {}", key, e)))
    }

    /// Typed, validated view of the whole configuration.
    pub fn settings(&self) -> Result<Settings> {
        let settings: Settings = self
            .figment
            .extract()
            .map_err(|e| Error::InvalidConfig(format!("Failed to parse settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub chunking: ChunkingConfig,
    pub encoder: EncoderConfig,
    pub index: IndexConfig,
    pub retry: RetryConfig,
    pub query: QueryConfig,
    pub data: DataConfig,
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        self.chunking.validate()?;
        if self.encoder.dim == 0 {
            return Err(Error::InvalidConfig("encoder.dim must be positive".into()));
        }
        if self.chunking.max_chunk_tokens > self.encoder.max_tokens {
            return Err(Error::InvalidConfig(format!(
                "chunking.max_chunk_tokens ({}) exceeds encoder.max_tokens ({})",
                self.chunking.max_chunk_tokens, self.encoder.max_tokens
            )));
        }
        self.index.validate()?;
        self.retry.validate()?;
        self.query.validate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderBackend {
    Analyzer,
    Fake,
    Model,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub backend: EncoderBackend,
    pub dim: usize,
    pub max_tokens: usize,
    /// Model directory for the `model` backend (tokenizer.json, config.json,
    /// model.safetensors).
    pub model_dir: Option<String>,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self { backend: EncoderBackend::Analyzer, dim: 384, max_tokens: 512, model_dir: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Live entries needed before compaction builds the dense ANN graph.
    pub min_graph_size: usize,
    /// Beam width of a dense graph search.
    pub ef_search: usize,
    /// Links per graph node.
    pub max_connections: usize,
    /// Tombstoned / physical ratio above which compaction is due.
    pub compaction_tombstone_ratio: f32,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self { min_graph_size: 1024, ef_search: 64, max_connections: 16, compaction_tombstone_ratio: 0.3 }
    }
}

impl IndexConfig {
    pub fn validate(&self) -> Result<()> {
        if self.ef_search == 0 {
            return Err(Error::InvalidConfig("index.ef_search must be at least 1".into()));
        }
        if !(1..=256).contains(&self.max_connections) {
            return Err(Error::InvalidConfig("index.max_connections must be within [1, 256]".into()));
        }
        if !(0.0..=1.0).contains(&self.compaction_tombstone_ratio) {
            return Err(Error::InvalidConfig("index.compaction_tombstone_ratio must be within [0, 1]".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_attempts: 3, initial_backoff_ms: 10, max_backoff_ms: 250 }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::InvalidConfig("retry.max_attempts must be at least 1".into()));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(Error::InvalidConfig("retry.initial_backoff_ms exceeds retry.max_backoff_ms".into()));
        }
        Ok(())
    }
}

/// What a query does when exactly one sub-search fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialFailurePolicy {
    #[default]
    FailFast,
    Degrade,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub default_top_k: usize,
    pub max_top_k: usize,
    pub overfetch_factor: usize,
    pub rrf_k: u32,
    pub sub_search_timeout_ms: u64,
    pub partial_failure: PartialFailurePolicy,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_top_k: 10,
            max_top_k: 200,
            overfetch_factor: 1,
            rrf_k: 60,
            sub_search_timeout_ms: 2_000,
            partial_failure: PartialFailurePolicy::FailFast,
        }
    }
}

impl QueryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.default_top_k == 0 || self.default_top_k > self.max_top_k {
            return Err(Error::InvalidConfig("query.default_top_k must be within 1..=query.max_top_k".into()));
        }
        if self.overfetch_factor == 0 {
            return Err(Error::InvalidConfig("query.overfetch_factor must be at least 1".into()));
        }
        if self.sub_search_timeout_ms == 0 {
            return Err(Error::InvalidConfig("query.sub_search_timeout_ms must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub raw_txt_dir: String,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self { raw_txt_dir: "dev_data/txt".into() }
    }
}

impl DataConfig {
    pub fn raw_txt_path(&self, base: &Path) -> PathBuf {
        resolve_with_base(base, &self.raw_txt_dir)
    }
}

/// Expand a user-provided path string:
/// - Expands leading '~' to the user's home directory
/// - Expands ${VAR} and $VAR environment variables
/// - Returns a PathBuf without attempting to canonicalize
pub fn expand_path<S: AsRef<str>>(input: S) -> PathBuf {
    let s = input.as_ref();
    let expanded_env = shellexpand::env(s).unwrap_or(std::borrow::Cow::Borrowed(s));
    let expanded = shellexpand::tilde(&expanded_env);
    PathBuf::from(expanded.as_ref())
}

/// Resolve a possibly relative path against a given base directory after expansion.
pub fn resolve_with_base<S: AsRef<str>>(base: &Path, p: S) -> PathBuf {
    let p = expand_path(p);
    if p.is_absolute() { p } else { base.join(p) }
}
