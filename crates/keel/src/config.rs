//! CLI configuration with environment variable priority
//!
//! Settings are resolved in this order (first found wins):
//! 1. Command-line flags (applied by the caller)
//! 2. Environment variables (KEEL_*)
//! 3. Config file (`~/.config/keel/config.toml`)
//! 4. Default values

use std::path::{Path, PathBuf};

use keel_kube::{KubeOptions, DEFAULT_SIDECAR_HTTP_PORT};
use keel_tunnel::relay::DEFAULT_API_VERSION;
use keel_tunnel::{InvokerSettings, Route, DEFAULT_BIND_HOST};
use serde::Deserialize;

/// Environment variable prefix
const ENV_PREFIX: &str = "KEEL";

/// Config file contents; every field is optional
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KeelConfig {
    /// Invoke API version rendered into `/v<version>/invoke/...`
    pub api_version: Option<String>,

    /// Local host tunnels bind to
    pub bind_host: Option<String>,

    /// HTTP port of the app sidecar inside each pod
    pub sidecar_http_port: Option<u16>,

    /// "auto", "proxy", "tunnel" or "direct"
    pub route: Option<String>,

    /// Log every forwarded connection at info level
    pub emit_forward_logs: Option<bool>,

    /// Kubeconfig context to use
    pub context: Option<String>,

    /// Namespace to search for apps (all namespaces if unset)
    pub namespace: Option<String>,
}

/// Fully resolved settings
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub api_version: String,
    pub bind_host: String,
    pub sidecar_http_port: u16,
    pub route: Route,
    pub emit_forward_logs: bool,
    pub context: Option<String>,
    pub namespace: Option<String>,
}

impl ResolvedConfig {
    pub fn invoker_settings(&self) -> InvokerSettings {
        InvokerSettings {
            api_version: self.api_version.clone(),
            bind_host: self.bind_host.clone(),
            emit_logs: self.emit_forward_logs,
            route: self.route,
        }
    }

    pub fn kube_options(&self) -> KubeOptions {
        KubeOptions {
            context: self.context.clone(),
            namespace: self.namespace.clone(),
            sidecar_http_port: self.sidecar_http_port,
        }
    }
}

/// Read an environment variable with the KEEL_ prefix
fn get_env(name: &str) -> Option<String> {
    std::env::var(format!("{}_{}", ENV_PREFIX, name)).ok()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl KeelConfig {
    /// Get the default config directory path
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("keel")
    }

    /// Get the default config file path
    pub fn default_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Load configuration from a TOML file; a missing file yields defaults
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        tracing::debug!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Resolve against the process environment
    pub fn resolve(self) -> anyhow::Result<ResolvedConfig> {
        self.resolve_with(get_env)
    }

    /// Resolve with `env` looking up unprefixed names (e.g. "ROUTE")
    pub fn resolve_with<F>(self, env: F) -> anyhow::Result<ResolvedConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        // API version: ENV > config > default "1"
        let api_version = env("API_VERSION")
            .or(self.api_version)
            .unwrap_or_else(|| DEFAULT_API_VERSION.to_string());

        // Bind host: ENV > config > 127.0.0.1
        let bind_host = env("BIND_HOST")
            .or(self.bind_host)
            .unwrap_or_else(|| DEFAULT_BIND_HOST.to_string());

        // Sidecar port: ENV > config > 3500
        let sidecar_http_port = match env("SIDECAR_HTTP_PORT") {
            Some(v) => v
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid KEEL_SIDECAR_HTTP_PORT: {}", v))?,
            None => self.sidecar_http_port.unwrap_or(DEFAULT_SIDECAR_HTTP_PORT),
        };

        let route = env("ROUTE")
            .or(self.route)
            .map(|r| r.parse::<Route>().map_err(anyhow::Error::msg))
            .transpose()?
            .unwrap_or_default();

        let emit_forward_logs = match env("EMIT_FORWARD_LOGS") {
            Some(v) => parse_bool(&v)
                .ok_or_else(|| anyhow::anyhow!("Invalid KEEL_EMIT_FORWARD_LOGS: {}", v))?,
            None => self.emit_forward_logs.unwrap_or(false),
        };

        let resolved = ResolvedConfig {
            api_version,
            bind_host,
            sidecar_http_port,
            route,
            emit_forward_logs,
            context: env("CONTEXT").or(self.context),
            namespace: env("NAMESPACE").or(self.namespace),
        };

        if let Err(errors) = resolved.validate() {
            anyhow::bail!("Invalid configuration: {}", errors.join("; "));
        }
        Ok(resolved)
    }
}

impl ResolvedConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.api_version.is_empty() {
            errors.push("API version is required".to_string());
        }

        if self.bind_host.parse::<std::net::IpAddr>().is_err() {
            errors.push(format!("Bind host '{}' is not an IP address", self.bind_host));
        }

        if self.sidecar_http_port == 0 {
            errors.push("Sidecar HTTP port must not be 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
