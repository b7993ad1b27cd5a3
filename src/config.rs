//! Runtime configuration.
//!
//! Two layers: process-wide properties read from the environment (cleaner
//! pool, allocator, leak detection, poll batch size) collected in
//! [`RuntimeConfig`], and the demo server's own configuration merged from
//! CLI arguments and an optional TOML file, CLI taking precedence.
//!
//! [`Runtime`] owns the objects those properties configure: the allocator,
//! the cleaner pool, and the leak detector. Nothing here is a process
//! global; tests build their own `Runtime` and swap pieces freely.

use crate::buffer::{Allocator, AllocatorType, LeakDetector, LeakLevel};
use crate::cleaner::{CleanerPool, CleanerPoolConfig};
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

/// Property: shared cleaner count.
pub const PROP_CLEANER_POOL_SIZE: &str = "cleanerpool.size";
/// Property: event-loop threads share the cleaner pool.
pub const PROP_CLEANER_EVENTLOOP_USEPOOL: &str = "cleanerpool.eventloop.usepool";
/// Property: use green threads where the platform supports them.
pub const PROP_CLEANER_GREEN_THREADS: &str = "cleanerpool.use_green_threads";
/// Property: `pooled` or `unpooled`.
pub const PROP_ALLOCATOR_TYPE: &str = "allocator.type";
/// Property: chunk size exponent.
pub const PROP_ALLOCATOR_MAX_ORDER: &str = "allocator.maxOrder";
/// Property: leak detection level.
pub const PROP_LEAK_DETECTION_LEVEL: &str = "leakDetection.level";
/// Property: backend event batch size.
pub const PROP_MAX_EVENTS_PER_POLL: &str = "io.max.events.per.poll";

/// Process-wide runtime properties.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Cleaner pool policy.
    pub cleaner_pool: CleanerPoolConfig,
    /// Default buffer allocator type.
    pub allocator_type: AllocatorType,
    /// Arena chunk size exponent: chunks hold `page << max_order` bytes.
    pub max_order: u32,
    /// Buffer leak detection level.
    pub leak_level: LeakLevel,
    /// Backend event batch size per poll.
    pub max_events_per_poll: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            cleaner_pool: CleanerPoolConfig::default(),
            allocator_type: AllocatorType::Pooled,
            max_order: 11,
            leak_level: LeakLevel::Simple,
            max_events_per_poll: 1024,
        }
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(property = key, value = %raw, "unparseable runtime property ignored");
            None
        }
    }
}

impl RuntimeConfig {
    /// Read the property table from the process environment, falling back
    /// to defaults per key.
    pub fn from_env() -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        if let Some(size) = env_parsed::<usize>(PROP_CLEANER_POOL_SIZE) {
            config.cleaner_pool.pool_size = size;
        }
        if let Some(use_pool) = env_parsed::<bool>(PROP_CLEANER_EVENTLOOP_USEPOOL) {
            config.cleaner_pool.event_loop_uses_pool = use_pool;
        }
        if let Some(green) = env_parsed::<bool>(PROP_CLEANER_GREEN_THREADS) {
            config.cleaner_pool.use_green_threads = green;
        }
        if let Ok(raw) = std::env::var(PROP_ALLOCATOR_TYPE) {
            match AllocatorType::parse(&raw) {
                Some(kind) => config.allocator_type = kind,
                None => warn!(value = %raw, "unknown allocator.type ignored"),
            }
        }
        if let Some(order) = env_parsed::<u32>(PROP_ALLOCATOR_MAX_ORDER) {
            config.max_order = order.min(14);
        }
        if let Ok(raw) = std::env::var(PROP_LEAK_DETECTION_LEVEL) {
            match LeakLevel::parse(&raw) {
                Some(level) => config.leak_level = level,
                None => warn!(value = %raw, "unknown leakDetection.level ignored"),
            }
        }
        if let Some(batch) = env_parsed::<usize>(PROP_MAX_EVENTS_PER_POLL) {
            config.max_events_per_poll = batch.max(1);
        }
        config
    }

    /// Deterministic settings for tests: unpooled buffers, paranoid leak
    /// tracking, one shared cleaner.
    pub fn for_tests() -> RuntimeConfig {
        RuntimeConfig {
            cleaner_pool: CleanerPoolConfig {
                pool_size: 1,
                event_loop_uses_pool: true,
                use_green_threads: false,
            },
            allocator_type: AllocatorType::Unpooled,
            max_order: 4,
            leak_level: LeakLevel::Paranoid,
            max_events_per_poll: 64,
        }
    }
}

/// The runtime context: allocator, cleaner pool, and leak detector built
/// from one [`RuntimeConfig`].
pub struct Runtime {
    config: RuntimeConfig,
    allocator: Allocator,
    cleaners: Arc<CleanerPool>,
    leak: Arc<LeakDetector>,
}

impl Runtime {
    /// Build the context objects for the given properties.
    pub fn new(config: RuntimeConfig) -> Runtime {
        let leak = LeakDetector::new(config.leak_level);
        let cleaners = CleanerPool::new(&config.cleaner_pool);
        let allocator = match config.allocator_type {
            AllocatorType::Pooled => Allocator::pooled(
                config.max_order,
                Arc::clone(&leak),
                Some(Arc::clone(&cleaners)),
            ),
            AllocatorType::Unpooled => Allocator::unpooled(Arc::clone(&leak)),
        };
        Runtime {
            config,
            allocator,
            cleaners,
            leak,
        }
    }

    /// Build from the process environment.
    pub fn from_env() -> Runtime {
        Runtime::new(RuntimeConfig::from_env())
    }

    /// The resolved properties.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The default allocator for channels of this runtime.
    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    /// The cleaner pool.
    pub fn cleaners(&self) -> &Arc<CleanerPool> {
        &self.cleaners
    }

    /// The leak detector observing this runtime's buffers.
    pub fn leak_detector(&self) -> &Arc<LeakDetector> {
        &self.leak
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Runtime::from_env()
    }
}

// ---- demo server configuration (CLI + TOML, CLI wins) ----

/// Command-line arguments for the echo server binary.
#[derive(Parser, Debug)]
#[command(name = "hawser")]
#[command(version = "0.1.0")]
#[command(about = "Echo server on the hawser runtime", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:7000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of worker loops (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// I/O backend: auto, poll, uring
    #[arg(short = 'b', long)]
    pub backend: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure for the binary.
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Server-related configuration.
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of worker loops
    pub workers: Option<usize>,
    /// I/O backend: auto, poll, uring
    #[serde(default = "default_backend")]
    pub backend: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        ServerSection {
            listen: default_listen(),
            workers: None,
            backend: default_backend(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        LoggingSection {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:7000".to_string()
}

fn default_backend() -> String {
    "auto".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration for the binary.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: String,
    pub workers: usize,
    pub backend: String,
    pub log_level: String,
}

impl ServerConfig {
    /// Load from CLI args and optional TOML file; CLI wins.
    pub fn load() -> Result<ServerConfig, ConfigError> {
        let cli = CliArgs::parse();
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };
        Ok(ServerConfig {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            workers: cli.workers.or(toml_config.server.workers).unwrap_or(0),
            backend: cli.backend.unwrap_or(toml_config.server.backend),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors for the binary.
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
