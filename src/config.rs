//! Configuration management for Gatekeeper.
//!
//! Settings are layered: built-in defaults, then an optional YAML file, then
//! `GATEKEEPER__*` environment variables (e.g.
//! `GATEKEEPER__RATE_LIMITING__REFILL_INTERVAL_SECS=10`).

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{GatekeeperError, Result};
use crate::ratelimit::{
    default_rules, MaintenanceSchedule, PolicySpec, RouteRule, RouteTable, DEFAULT_SAMPLE_SIZE,
};

const ENV_PREFIX: &str = "GATEKEEPER";
const ENV_SEPARATOR: &str = "__";

/// Main configuration for the Gatekeeper service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Admin listen address for stats and resets. Keep it private.
    #[serde(default = "default_admin_addr")]
    pub admin_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            admin_addr: default_admin_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_admin_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8081))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Period of the refill sweep in seconds
    #[serde(default = "default_refill_interval")]
    pub refill_interval_secs: u64,

    /// Period of the idle-eviction sweep in seconds
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Buckets idle for longer than this many seconds are evicted
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Number of buckets included in stats snapshots
    #[serde(default = "default_sample_size")]
    pub stats_sample_size: usize,

    /// Use X-Forwarded-For / X-Real-IP when keying anonymous clients
    #[serde(default = "default_trust_forwarded_headers")]
    pub trust_forwarded_headers: bool,

    /// Path to a standalone route rules file. Overrides `routes`.
    pub routes_path: Option<String>,

    /// Inline route rules, checked in order
    #[serde(default = "default_rules")]
    pub routes: Vec<RouteRule>,

    /// Policy for paths no route matches
    #[serde(default)]
    pub default_policy: PolicySpec,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            refill_interval_secs: default_refill_interval(),
            cleanup_interval_secs: default_cleanup_interval(),
            idle_timeout_secs: default_idle_timeout(),
            stats_sample_size: default_sample_size(),
            trust_forwarded_headers: default_trust_forwarded_headers(),
            routes_path: None,
            routes: default_rules(),
            default_policy: PolicySpec::default(),
        }
    }
}

fn default_refill_interval() -> u64 {
    5
}

fn default_cleanup_interval() -> u64 {
    30 * 60
}

fn default_idle_timeout() -> u64 {
    60 * 60
}

fn default_sample_size() -> usize {
    DEFAULT_SAMPLE_SIZE
}

fn default_trust_forwarded_headers() -> bool {
    true
}

impl RateLimitingConfig {
    /// Timing for the background sweeps.
    pub fn maintenance_schedule(&self) -> MaintenanceSchedule {
        MaintenanceSchedule {
            refill_interval: Duration::from_secs(self.refill_interval_secs),
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
        }
    }

    /// Build the route table, from `routes_path` when set.
    pub fn route_table(&self) -> Result<RouteTable> {
        match &self.routes_path {
            Some(path) => RouteTable::from_file(path),
            None => RouteTable::compile(&self.routes, &self.default_policy),
        }
    }
}

impl GatekeeperConfig {
    /// Load configuration from defaults, an optional file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(File::from(path).required(true));
        }

        let config: GatekeeperConfig = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator(ENV_SEPARATOR)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        Ok(config)
    }

    /// Load configuration from a YAML string, without environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GatekeeperConfig = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize()?;

        Ok(config)
    }

    /// Reject settings the service cannot run with.
    ///
    /// Returns the compiled route table so it is only built once.
    pub fn validate(&self) -> Result<RouteTable> {
        if self.server.http_addr == self.server.admin_addr {
            return Err(GatekeeperError::Config(format!(
                "server.admin_addr must differ from server.http_addr ({})",
                self.server.http_addr
            )));
        }

        let rl = &self.rate_limiting;

        for (name, value) in [
            ("refill_interval_secs", rl.refill_interval_secs),
            ("cleanup_interval_secs", rl.cleanup_interval_secs),
            ("idle_timeout_secs", rl.idle_timeout_secs),
        ] {
            if value == 0 {
                return Err(GatekeeperError::Config(format!(
                    "rate_limiting.{} must be greater than zero",
                    name
                )));
            }
        }

        rl.route_table()
    }
}
