use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    /// Connection pool size. Ingestion and query traffic share the pool.
    #[serde(default = "default_db_connections")]
    pub max_connections: u32,
}

fn default_db_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    500
}
fn default_chunk_overlap() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: i64,
    /// Minimum cosine similarity for a chunk to be retrieved. No cutoff
    /// when absent.
    #[serde(default)]
    pub threshold: Option<f32>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            threshold: None,
        }
    }
}

fn default_top_k() -> i64 {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContextConfig {
    /// Maximum aggregate tokens of context included in a prompt.
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,
    /// Chunks from the same document whose spans overlap by more than this
    /// fraction collapse to the higher-scored one.
    #[serde(default = "default_dedup_overlap_fraction")]
    pub dedup_overlap_fraction: f32,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: default_max_context_tokens(),
            dedup_overlap_fraction: default_dedup_overlap_fraction(),
        }
    }
}

fn default_max_context_tokens() -> usize {
    2000
}
fn default_dedup_overlap_fraction() -> f32 {
    0.5
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Concurrent provider calls allowed across both pipelines.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            dims: default_dims(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

fn default_embedding_provider() -> String {
    "openai".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_dims() -> usize {
    1536
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_concurrency() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    #[serde(default = "default_generation_model")]
    pub model: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            model: default_generation_model(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_generation_provider() -> String {
    "openai".to_string()
}
fn default_generation_model() -> String {
    "gpt-4o-mini".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate storage
    if config.db.max_connections == 0 {
        anyhow::bail!("db.max_connections must be > 0");
    }

    // Validate chunking
    if config.chunking.chunk_size == 0 {
        anyhow::bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        anyhow::bail!("chunking.chunk_overlap must be < chunking.chunk_size");
    }

    // Validate retrieval
    if config.retrieval.top_k < 1 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if let Some(t) = config.retrieval.threshold {
        if !(-1.0..=1.0).contains(&t) {
            anyhow::bail!("retrieval.threshold must be in [-1.0, 1.0]");
        }
    }

    // Validate context assembly
    if config.context.max_context_tokens == 0 {
        anyhow::bail!("context.max_context_tokens must be > 0");
    }
    if !(0.0..=1.0).contains(&config.context.dedup_overlap_fraction) {
        anyhow::bail!("context.dedup_overlap_fraction must be in [0.0, 1.0]");
    }

    // Validate providers
    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if config.embedding.max_concurrency == 0 {
        anyhow::bail!("embedding.max_concurrency must be > 0");
    }
    match config.embedding.provider.as_str() {
        "openai" => {}
        other => anyhow::bail!("Unknown embedding provider: '{}'. Must be openai.", other),
    }
    match config.generation.provider.as_str() {
        "openai" => {}
        other => anyhow::bail!("Unknown generation provider: '{}'. Must be openai.", other),
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let f = write_config(
            r#"
[db]
path = "/tmp/nrag.sqlite"

[server]
bind = "127.0.0.1:7431"
"#,
        );
        let config = load_config(f.path()).unwrap();
        assert_eq!(config.db.max_connections, 5);
        assert_eq!(config.chunking.chunk_size, 500);
        assert_eq!(config.chunking.chunk_overlap, 50);
        assert_eq!(config.retrieval.top_k, 4);
        assert_eq!(config.retrieval.threshold, None);
        assert_eq!(config.embedding.dims, 1536);
        assert_eq!(config.embedding.model, "text-embedding-3-small");
        assert_eq!(config.context.max_context_tokens, 2000);
    }

    #[test]
    fn test_overlap_must_be_smaller_than_chunk() {
        let f = write_config(
            r#"
[db]
path = "/tmp/nrag.sqlite"

[chunking]
chunk_size = 50
chunk_overlap = 50

[server]
bind = "127.0.0.1:7431"
"#,
        );
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let f = write_config(
            r#"
[db]
path = "/tmp/nrag.sqlite"

[embedding]
provider = "quantum"

[server]
bind = "127.0.0.1:7431"
"#,
        );
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn test_threshold_range_validated() {
        let f = write_config(
            r#"
[db]
path = "/tmp/nrag.sqlite"

[retrieval]
threshold = 1.5

[server]
bind = "127.0.0.1:7431"
"#,
        );
        assert!(load_config(f.path()).is_err());
    }
}
