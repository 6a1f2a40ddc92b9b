//! Configuration loader, typed settings and path helpers.
//!
//! Uses Figment to merge `config.toml` + `config.<env>.toml` + `APP_*` env vars
//! (`__` separates nested keys, e.g. `APP_RERANK__TIMEOUT_MS=500`).

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub struct Config {
    figment: Figment,
}

impl Config {
    pub fn load() -> Result<Self> {
        let env_name = env::var("RUST_ENV").unwrap_or_else(|_| "dev".to_string());
        Self::from_figment(Self::figment_for(&env_name))
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config = Self { figment };
        config.settings()?.validate()?;
        Ok(config)
    }

    fn figment_for(env_name: &str) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Settings::default())).merge(Toml::file("config.toml"));
        match env_name {
            "dev" | "development" => figment = figment.merge(Toml::file("config.dev.toml")),
            "prod" | "production" => figment = figment.merge(Toml::file("config.prod.toml")),
            "test" | "testing" => figment = figment.merge(Toml::file("config.test.toml")),
            _ => {}
        }
        figment.merge(Env::prefixed("APP_").split("__"))
    }

    pub fn get<T>(&self, key: &str) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.figment
            .extract_inner(key)
            .map_err(|e| Error::InvalidConfig(format!("Failed to get '{key}': {e}")))
    }

    pub fn settings(&self) -> Result<Settings> {
        self.figment.extract().map_err(|e| Error::InvalidConfig(e.to_string()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub data: DataSettings,
    pub keyword: KeywordSettings,
    pub vector: VectorSettings,
    pub preprocess: PreprocessSettings,
    pub retrieval: RetrievalSettings,
    pub rerank: RerankSettings,
    pub aggregate: AggregateSettings,
    pub embed: EmbedSettings,
    pub log: LogSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSettings {
    /// JSON file backing the chunk store; `~` and `$VAR` are expanded.
    pub store_path: String,
}

impl Default for DataSettings {
    fn default() -> Self { Self { store_path: ".jobrag/chunks.jsonl".into() } }
}

impl DataSettings {
    pub fn store_path(&self, base: &Path) -> PathBuf { resolve_with_base(base, &self.store_path) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeywordSettings {
    pub k1: f64,
    pub b: f64,
}

impl Default for KeywordSettings {
    fn default() -> Self { Self { k1: 1.5, b: 0.75 } }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorSettings {
    pub similarity_threshold: f32,
}

impl Default for VectorSettings {
    fn default() -> Self { Self { similarity_threshold: 0.25 } }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessSettings {
    /// Total phrasings including the original question.
    pub expansion_limit: usize,
}

impl Default for PreprocessSettings {
    fn default() -> Self { Self { expansion_limit: 3 } }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalSettings {
    pub candidate_limit: usize,
    pub final_top_k: usize,
    pub backend_timeout_ms: u64,
}

impl Default for RetrievalSettings {
    fn default() -> Self { Self { candidate_limit: 20, final_top_k: 5, backend_timeout_ms: 2000 } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RerankProvider {
    None,
    Heuristic,
    Http,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankSettings {
    pub enabled: bool,
    pub provider: RerankProvider,
    pub top_n: usize,
    pub timeout_ms: u64,
    pub endpoint: Option<String>,
    pub model: Option<String>,
    /// Name of the environment variable holding the bearer token.
    pub api_key_env: Option<String>,
}

impl Default for RerankSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: RerankProvider::Heuristic,
            top_n: 15,
            timeout_ms: 3000,
            endpoint: None,
            model: None,
            api_key_env: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregateSettings {
    pub dedup_threshold: f64,
    pub max_documents: usize,
    pub max_chunks_per_document: usize,
    pub max_context_words: usize,
}

impl Default for AggregateSettings {
    fn default() -> Self {
        Self { dedup_threshold: 0.85, max_documents: 10, max_chunks_per_document: 3, max_context_words: 2000 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedProvider {
    Hashed,
    Http,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedSettings {
    pub provider: EmbedProvider,
    pub dim: usize,
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub api_key_env: Option<String>,
    pub timeout_ms: u64,
    pub batch_size: usize,
}

impl Default for EmbedSettings {
    fn default() -> Self {
        Self {
            provider: EmbedProvider::Hashed,
            dim: 384,
            endpoint: None,
            model: None,
            api_key_env: None,
            timeout_ms: 10_000,
            batch_size: 32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
}

impl Default for LogSettings {
    fn default() -> Self { Self { level: "info".into() } }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(Error::InvalidConfig(msg));
        if !(self.keyword.k1 > 0.0 && self.keyword.k1.is_finite()) {
            return bad(format!("keyword.k1 must be positive, got {}", self.keyword.k1));
        }
        if !(0.0..=1.0).contains(&self.keyword.b) {
            return bad(format!("keyword.b must be within [0, 1], got {}", self.keyword.b));
        }
        if !(-1.0..=1.0).contains(&self.vector.similarity_threshold) {
            return bad(format!("vector.similarity_threshold must be within [-1, 1], got {}", self.vector.similarity_threshold));
        }
        if !(self.aggregate.dedup_threshold > 0.0 && self.aggregate.dedup_threshold <= 1.0) {
            return bad(format!("aggregate.dedup_threshold must be within (0, 1], got {}", self.aggregate.dedup_threshold));
        }
        let limits = [
            ("preprocess.expansion_limit", self.preprocess.expansion_limit),
            ("retrieval.candidate_limit", self.retrieval.candidate_limit),
            ("retrieval.final_top_k", self.retrieval.final_top_k),
            ("rerank.top_n", self.rerank.top_n),
            ("aggregate.max_documents", self.aggregate.max_documents),
            ("aggregate.max_chunks_per_document", self.aggregate.max_chunks_per_document),
            ("aggregate.max_context_words", self.aggregate.max_context_words),
            ("embed.dim", self.embed.dim),
            ("embed.batch_size", self.embed.batch_size),
        ];
        if let Some((name, _)) = limits.iter().find(|(_, v)| *v == 0) {
            return bad(format!("{name} must be greater than zero"));
        }
        if self.retrieval.backend_timeout_ms == 0 || self.rerank.timeout_ms == 0 || self.embed.timeout_ms == 0 {
            return bad("timeouts must be greater than zero".into());
        }
        if self.rerank.enabled && self.rerank.provider == RerankProvider::Http && self.rerank.endpoint.is_none() {
            return bad("rerank.endpoint is required for the http reranker".into());
        }
        if self.embed.provider == EmbedProvider::Http && self.embed.endpoint.is_none() {
            return bad("embed.endpoint is required for the http embedder".into());
        }
        Ok(())
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

/// Resolve a possibly relative path against `base` after expansion.
pub fn resolve_with_base<S: AsRef<str>>(base: &Path, p: S) -> PathBuf {
    let p = expand_path(p);
    if p.is_absolute() { p } else { base.join(p) }
}
