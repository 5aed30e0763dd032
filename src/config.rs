use anyhow::{Context, Result};
use std::path::PathBuf;

/// Runtime configuration, read from the environment.
///
/// A `.env` file in the working directory is loaded first, but a variable
/// that is already set in the real environment always wins.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bearer token required by the HTTP transport.
    pub auth_token: String,

    /// Upstream dataset URL (resolved to the canonical Parquet shard when it
    /// points at the dataset hub).
    pub parquet_url: String,
    pub data_dir: PathBuf,
    pub parquet_path: PathBuf,
    pub metadata_path: PathBuf,
    pub lock_path: PathBuf,

    /// Background refresh period in seconds; `0` disables the refresh loop.
    pub refresh_interval_secs: u64,
    /// Skip the remote freshness probe when a local snapshot exists.
    pub disable_remote_check: bool,
    /// Force-remove a leftover lock file before acquiring.
    pub ignore_lock: bool,

    pub port: u16,
    /// `"development"` enables verbose error propagation to clients.
    pub environment: String,

    pub duckdb: DuckDbConfig,
}

/// Tuning knobs for the embedded DuckDB engine, all overridable via
/// `DUCKDB_*` environment variables.
#[derive(Debug, Clone)]
pub struct DuckDbConfig {
    pub memory_limit: String,
    pub threads: u32,
    pub checkpoint_threshold: String,
    pub preserve_insertion_order: bool,
    pub max_open_conns: usize,
    pub max_idle_conns: usize,
    pub conn_max_lifetime_minutes: u64,
    pub object_cache: bool,
    pub http_metadata_cache: bool,
}

impl Default for DuckDbConfig {
    fn default() -> Self {
        Self {
            memory_limit: "4GB".to_string(),
            threads: 4,
            checkpoint_threshold: "1GB".to_string(),
            preserve_insertion_order: false,
            max_open_conns: 4,
            max_idle_conns: 2,
            conn_max_lifetime_minutes: 30,
            object_cache: true,
            http_metadata_cache: true,
        }
    }
}

const DEFAULT_PARQUET_URL: &str =
    "https://huggingface.co/datasets/openfoodfacts/product-database/resolve/main/product-database.parquet";

impl Config {
    pub fn is_development(&self) -> bool {
        self.environment == "development"
    }

    /// Loads configuration from the environment, applying `.env` first.
    pub fn load() -> Result<Config> {
        // Never overrides variables already present in the environment.
        dotenvy::dotenv().ok();
        Self::from_env()
    }

    /// Reads configuration from the current environment without touching
    /// `.env`. Split out so tests can drive it directly.
    pub fn from_env() -> Result<Config> {
        let data_dir = PathBuf::from(env_or("DATA_DIR", "./data"));

        let parquet_path = env_path("PARQUET_PATH", data_dir.join("product-database.parquet"));
        let metadata_path = env_path("METADATA_PATH", data_dir.join("metadata.json"));
        let lock_path = env_path("LOCK_FILE", data_dir.join("refresh.lock"));

        let port: u16 = env_or("PORT", "8080")
            .parse()
            .context("PORT must be a valid port number")?;

        Ok(Config {
            auth_token: env_or("OPENFOODFACTS_MCP_TOKEN", "super-secret-token"),
            parquet_url: env_or("PARQUET_URL", DEFAULT_PARQUET_URL),
            data_dir,
            parquet_path,
            metadata_path,
            lock_path,
            refresh_interval_secs: env_parse("REFRESH_INTERVAL_SECONDS", 86_400),
            disable_remote_check: env_bool("DISABLE_REMOTE_CHECK", false),
            ignore_lock: env_bool("IGNORE_LOCK", false),
            port,
            environment: env_or("ENV", "production"),
            duckdb: DuckDbConfig::from_env(),
        })
    }
}

impl DuckDbConfig {
    pub fn from_env() -> DuckDbConfig {
        let d = DuckDbConfig::default();
        DuckDbConfig {
            memory_limit: env_or("DUCKDB_MEMORY_LIMIT", &d.memory_limit),
            threads: env_parse("DUCKDB_THREADS", d.threads),
            checkpoint_threshold: env_or("DUCKDB_CHECKPOINT_THRESHOLD", &d.checkpoint_threshold),
            preserve_insertion_order: env_bool(
                "DUCKDB_PRESERVE_INSERTION_ORDER",
                d.preserve_insertion_order,
            ),
            max_open_conns: env_parse("DUCKDB_MAX_OPEN_CONNS", d.max_open_conns),
            max_idle_conns: env_parse("DUCKDB_MAX_IDLE_CONNS", d.max_idle_conns),
            conn_max_lifetime_minutes: env_parse(
                "DUCKDB_CONN_MAX_LIFETIME_MINUTES",
                d.conn_max_lifetime_minutes,
            ),
            object_cache: env_bool("DUCKDB_OBJECT_CACHE", d.object_cache),
            http_metadata_cache: env_bool("DUCKDB_HTTP_METADATA_CACHE", d.http_metadata_cache),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => PathBuf::from(v),
        _ => default,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(v) => v.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}
