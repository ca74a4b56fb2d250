//! Configuration for modelout paths and server settings.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (MODELOUT_HOME, MODELOUT_CACHE_OUTPUT_FILES)
//! 2. Config file (.modelout/config.yaml)
//! 3. Defaults (~/.modelout)
//!
//! Config file discovery:
//! - Searches current directory and parents for .modelout/config.yaml
//! - `paths.home` is relative to the .modelout/ directory
//! - `paths.database` and `paths.cache` are relative to home

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

pub const ENV_HOME: &str = "MODELOUT_HOME";
pub const ENV_CACHE_OUTPUT_FILES: &str = "MODELOUT_CACHE_OUTPUT_FILES";

const DEFAULT_REPLAY_CHUNK_SIZE: usize = 64 * 1024;

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub server: Option<ServerConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .modelout/)
    pub home: Option<String>,
    /// SQLite database file (relative to home)
    pub database: Option<String>,
    /// Output cache directory (relative to home)
    pub cache: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub cache_output_files: Option<bool>,
    pub replay_chunk_size: Option<usize>,
    pub username: Option<String>,
}

/// Server-wide settings consulted per request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerSettings {
    /// Store cacheable serializer output for replay
    pub cache_output_files: bool,

    /// Read size when replaying cached output
    pub replay_chunk_size: usize,

    /// User recorded on checkouts made from this process
    pub username: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            cache_output_files: true,
            replay_chunk_size: DEFAULT_REPLAY_CHUNK_SIZE,
            username: default_username(),
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// State directory
    pub home: PathBuf,
    /// SQLite database file
    pub database: PathBuf,
    /// Output cache directory
    pub cache_dir: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub server: ServerSettings,
}

fn default_username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "anonymous".to_string())
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".modelout").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("Invalid boolean for {}: '{}'", name, other),
    }
}

/// Combine config file, environment and defaults
fn resolve(
    config_file: Option<PathBuf>,
    env: impl Fn(&str) -> Option<String>,
    default_home: PathBuf,
) -> Result<ResolvedConfig> {
    let file = match config_file {
        Some(ref path) => Some(load_config_file(path)?),
        None => None,
    };

    let home = if let Some(env_home) = env(ENV_HOME) {
        PathBuf::from(env_home)
    } else if let (Some(path), Some(home)) = (
        config_file.as_ref(),
        file.as_ref().and_then(|f| f.paths.home.as_ref()),
    ) {
        let modelout_dir = path.parent().unwrap_or(Path::new("."));
        resolve_path(modelout_dir, home)
    } else {
        default_home
    };

    let paths = file.as_ref().map(|f| f.paths.clone()).unwrap_or_default();
    let database = paths
        .database
        .as_deref()
        .map(|p| resolve_path(&home, p))
        .unwrap_or_else(|| home.join("modelout.db"));
    let cache_dir = paths
        .cache
        .as_deref()
        .map(|p| resolve_path(&home, p))
        .unwrap_or_else(|| home.join("cache"));

    let mut server = ServerSettings::default();
    if let Some(config) = file.as_ref().and_then(|f| f.server.as_ref()) {
        if let Some(cache_output_files) = config.cache_output_files {
            server.cache_output_files = cache_output_files;
        }
        if let Some(chunk_size) = config.replay_chunk_size {
            server.replay_chunk_size = chunk_size.max(1);
        }
        if let Some(ref username) = config.username {
            server.username = username.clone();
        }
    }
    if let Some(value) = env(ENV_CACHE_OUTPUT_FILES) {
        server.cache_output_files = parse_bool(ENV_CACHE_OUTPUT_FILES, &value)?;
    }

    Ok(ResolvedConfig {
        home,
        database,
        cache_dir,
        config_file,
        server,
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".modelout");

    resolve(find_config_file(), |key| std::env::var(key).ok(), default_home)
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Get the database path ($MODELOUT_HOME/modelout.db)
pub fn database_path() -> Result<PathBuf> {
    Ok(config()?.database.clone())
}
