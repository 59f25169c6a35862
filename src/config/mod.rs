//! Configuration for the gateway.
//!
//! Loaded in order of precedence:
//! 1. Environment variables (highest priority)
//! 2. Config file (`~/.config/llm-gateway/config.toml` or `--config`)
//! 3. Built-in defaults (lowest priority)

use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

pub mod providers;
pub mod routing;
mod serialization;

pub use providers::ProviderConfig;
pub use routing::RouteConfig;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".parse().unwrap(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DebugConfig {
    pub enabled: bool,
    pub log_level: String,
    pub trace_requests: bool,
    pub log_dir: Option<PathBuf>,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_level: "info".to_string(),
            trace_requests: false,
            log_dir: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoutingConfig {
    pub routes: HashMap<String, RouteConfig>,
    /// Resolved open question (section 9): strict per-conversation FIFO
    /// unless explicitly relaxed. Never the default.
    pub loose_ordering: bool,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            routes: HashMap::new(),
            loose_ordering: false,
        }
    }
}

/// Application configuration, assembled from [`FileConfig`] plus environment
/// overrides by [`Config::from_env`].
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub providers: HashMap<String, ProviderConfig>,
    pub routing: RoutingConfig,
    pub debug: DebugConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            providers: HashMap::new(),
            routing: RoutingConfig::default(),
            debug: DebugConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct FileServerConfig {
    bind_addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct FileDebugConfig {
    enabled: Option<bool>,
    #[serde(rename = "logLevel")]
    log_level: Option<String>,
    #[serde(rename = "traceRequests")]
    trace_requests: Option<bool>,
    #[serde(rename = "logDir")]
    log_dir: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct FileRoutingConfig {
    #[serde(default)]
    routes: HashMap<String, RouteConfig>,
    #[serde(rename = "looseOrdering", default)]
    loose_ordering: bool,
}

/// Config file structure (subset of [`Config`] that makes sense to persist).
#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileConfig {
    server: Option<FileServerConfig>,
    #[serde(default)]
    providers: HashMap<String, ProviderConfig>,
    routing: Option<FileRoutingConfig>,
    debug: Option<FileDebugConfig>,
}

impl Config {
    /// Config file path: `~/.config/llm-gateway/config.toml`.
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("llm-gateway").join("config.toml"))
    }

    /// Load a config file from an explicit path (the CLI's `--config` flag).
    /// Unlike the default-location lookup, a missing file here is fatal: the
    /// caller named this specific file.
    pub fn load_from_path(path: &std::path::Path) -> anyhow::Result<FileConfig> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read config file {}: {}", path.display(), e))?;
        toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("cannot parse config file {}: {}", path.display(), e))
    }

    /// Load the file config from the default location if present.
    ///
    /// A config file that exists but fails to parse is a fatal startup
    /// error: printed with a clear banner and the process exits rather than
    /// silently falling back to defaults while the operator debugs the wrong
    /// thing.
    fn load_file_config() -> FileConfig {
        let Some(path) = Self::config_path() else {
            return FileConfig::default();
        };

        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!(
                        "\n╔══════════════════════════════════════════════════════════════╗"
                    );
                    eprintln!(
                        "║  CONFIG ERROR - Failed to parse configuration file              ║"
                    );
                    eprintln!(
                        "╚══════════════════════════════════════════════════════════════╝\n"
                    );
                    eprintln!("  File: {}\n", path.display());
                    eprintln!("  Error: {}\n", e);
                    eprintln!("  Tip: Check for:\n");
                    eprintln!("    - Missing quotes around string values");
                    eprintln!("    - Invalid boolean values (use true/false)");
                    eprintln!("    - Malformed array syntax");
                    eprintln!("    - Typos in section names\n");
                    std::process::exit(1);
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => FileConfig::default(),
            Err(e) => {
                eprintln!("\n╔══════════════════════════════════════════════════════════════╗");
                eprintln!("║  CONFIG ERROR - Cannot read configuration file                  ║");
                eprintln!("╚══════════════════════════════════════════════════════════════╝\n");
                eprintln!("  File: {}\n", path.display());
                eprintln!("  Error: {}\n", e);
                std::process::exit(1);
            }
        }
    }

    fn assemble(file: FileConfig) -> Self {
        let bind_addr = std::env::var("GATEWAY_SERVER_BIND_ADDR")
            .ok()
            .or(file.server.and_then(|s| s.bind_addr))
            .unwrap_or_else(|| "127.0.0.1:8080".to_string())
            .parse()
            .expect("invalid bind address");

        let file_debug = file.debug.unwrap_or_default();
        let log_level = std::env::var("GATEWAY_DEBUG_LOGLEVEL")
            .ok()
            .or(file_debug.log_level)
            .unwrap_or_else(|| "info".to_string());
        let enabled = std::env::var("GATEWAY_DEBUG_ENABLED")
            .ok()
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .or(file_debug.enabled)
            .unwrap_or(false);
        let trace_requests = file_debug.trace_requests.unwrap_or(false);
        let log_dir = std::env::var("GATEWAY_DEBUG_LOGDIR")
            .ok()
            .or(file_debug.log_dir)
            .map(PathBuf::from);

        let file_routing = file.routing.unwrap_or_default();
        let loose_ordering = std::env::var("GATEWAY_ROUTING_LOOSEORDERING")
            .ok()
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(file_routing.loose_ordering);

        Self {
            server: ServerConfig { bind_addr },
            providers: file.providers,
            routing: RoutingConfig {
                routes: file_routing.routes,
                loose_ordering,
            },
            debug: DebugConfig {
                enabled,
                log_level,
                trace_requests,
                log_dir,
            },
        }
    }

    /// Load configuration: an explicit `--config` path (fatal if missing)
    /// takes precedence; otherwise default location -> env vars -> defaults.
    pub fn from_env_with_override(
        explicit_path: Option<&std::path::Path>,
    ) -> anyhow::Result<Self> {
        let file = match explicit_path {
            Some(path) => Self::load_from_path(path)?,
            None => Self::load_file_config(),
        };
        Ok(Self::assemble(file))
    }

    pub fn from_env() -> Self {
        let file = Self::load_file_config();
        Self::assemble(file)
    }
}
