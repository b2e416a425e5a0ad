//! Gateway configuration: TOML file + environment + CLI overrides.
//!
//! Precedence, lowest to highest: file defaults, config file, environment
//! variables (`UPSTREAM_BASE_URL`, `LISTEN_PORT`, ...), CLI flags.

use crate::proxy::UpstreamSpec;
use crate::tunnel::LinkSpec;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tgate_core::{BackoffPolicy, Credential, GateError, GateResult, Secret};
use tracing::info;
use url::Url;

/// Top-level config file structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    pub upstream: Option<UpstreamSection>,
    #[serde(default)]
    pub tunnel: TunnelSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            listen_port: default_listen_port(),
            startup_timeout_ms: default_startup_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

/// `[upstream]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamSection {
    pub base_url: String,
    #[serde(default = "default_upstream_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,
    #[serde(default)]
    pub api_key: Option<Secret>,
}

/// `[tunnel]` section of the config TOML.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TunnelSection {
    /// PEM bundle of roots trusted for link TLS. Required when hops exist.
    #[serde(default)]
    pub ca_file: Option<String>,
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    #[serde(default = "default_retry_multiplier")]
    pub reconnect_multiplier: f64,
    #[serde(default)]
    pub hops: Vec<HopSection>,
}

/// One `[[tunnel.hops]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct HopSection {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_local_bind_addr")]
    pub local_bind_addr: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    pub auth: Credential,
}

fn default_listen_addr() -> String {
    "0.0.0.0".to_string()
}
fn default_listen_port() -> u16 {
    4000
}
fn default_startup_timeout_ms() -> u64 {
    30_000
}
fn default_shutdown_grace_ms() -> u64 {
    10_000
}
fn default_upstream_timeout_ms() -> u64 {
    10_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_initial_ms() -> u64 {
    250
}
fn default_retry_max_ms() -> u64 {
    5_000
}
fn default_retry_multiplier() -> f64 {
    2.0
}
fn default_reconnect_initial_ms() -> u64 {
    1_000
}
fn default_reconnect_max_ms() -> u64 {
    30_000
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_local_bind_addr() -> String {
    "127.0.0.1".to_string()
}

/// CLI overrides applied on top of file + environment.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub listen_port: Option<u16>,
    pub upstream_url: Option<String>,
}

/// Resolved gateway configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub listen_port: u16,
    pub startup_timeout: Duration,
    pub shutdown_grace: Duration,
    pub upstream: UpstreamSpec,
    pub hops: Vec<LinkSpec>,
    pub link_backoff: BackoffPolicy,
    pub tls_ca_file: Option<PathBuf>,
}

impl Config {
    /// Load config from a TOML file, then apply environment and CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> GateResult<Self> {
        Self::load_with_env(config_path, cli, |name| std::env::var(name).ok())
    }

    /// Same as [`Config::load`] but with an injectable environment lookup.
    pub fn load_with_env(
        config_path: Option<&Path>,
        cli: CliOverrides,
        env: impl Fn(&str) -> Option<String>,
    ) -> GateResult<Self> {
        let mut file = if let Some(path) = config_path {
            let expanded = expand_tilde(path);
            if expanded.exists() {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| GateError::Config(format!("config parse error: {e}")))?
            } else {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
        } else {
            ConfigFile::default()
        };

        apply_env(&mut file, &env)?;

        // Merge CLI overrides
        if let Some(port) = cli.listen_port {
            file.server.listen_port = port;
        }
        if let Some(url) = cli.upstream_url {
            match file.upstream.as_mut() {
                Some(upstream) => upstream.base_url = url,
                None => {
                    file.upstream = Some(UpstreamSection {
                        base_url: url,
                        timeout_ms: default_upstream_timeout_ms(),
                        max_retries: default_max_retries(),
                        retry_initial_ms: default_retry_initial_ms(),
                        retry_max_ms: default_retry_max_ms(),
                        retry_multiplier: default_retry_multiplier(),
                        api_key: None,
                    })
                }
            }
        }

        resolve(file)
    }
}

/// Apply the recognized environment variables onto the file config.
fn apply_env(
    file: &mut ConfigFile,
    env: &impl Fn(&str) -> Option<String>,
) -> GateResult<()> {
    if let Some(url) = env("UPSTREAM_BASE_URL") {
        match file.upstream.as_mut() {
            Some(upstream) => upstream.base_url = url,
            None => {
                file.upstream = Some(UpstreamSection {
                    base_url: url,
                    timeout_ms: default_upstream_timeout_ms(),
                    max_retries: default_max_retries(),
                    retry_initial_ms: default_retry_initial_ms(),
                    retry_max_ms: default_retry_max_ms(),
                    retry_multiplier: default_retry_multiplier(),
                    api_key: None,
                })
            }
        }
    }
    if let Some(value) = env("UPSTREAM_TIMEOUT_MS") {
        let upstream = file
            .upstream
            .as_mut()
            .ok_or_else(|| GateError::Config("UPSTREAM_TIMEOUT_MS set but no upstream configured".into()))?;
        upstream.timeout_ms = parse_env("UPSTREAM_TIMEOUT_MS", &value)?;
    }
    if let Some(value) = env("UPSTREAM_MAX_RETRIES") {
        let upstream = file
            .upstream
            .as_mut()
            .ok_or_else(|| GateError::Config("UPSTREAM_MAX_RETRIES set but no upstream configured".into()))?;
        upstream.max_retries = parse_env("UPSTREAM_MAX_RETRIES", &value)?;
    }
    if let Some(value) = env("LISTEN_PORT") {
        file.server.listen_port = parse_env("LISTEN_PORT", &value)?;
    }
    if let Some(value) = env("STARTUP_TIMEOUT_MS") {
        file.server.startup_timeout_ms = parse_env("STARTUP_TIMEOUT_MS", &value)?;
    }
    if let Some(value) = env("SHUTDOWN_GRACE_MS") {
        file.server.shutdown_grace_ms = parse_env("SHUTDOWN_GRACE_MS", &value)?;
    }
    if let Some(value) = env("TUNNEL_HOPS") {
        apply_tunnel_hops(file, &value)?;
    }
    Ok(())
}

/// `TUNNEL_HOPS` is a comma-separated `host:port` list overriding the remote
/// endpoints of the configured hops, in order. Credentials always come from
/// the config file.
fn apply_tunnel_hops(file: &mut ConfigFile, value: &str) -> GateResult<()> {
    let entries: Vec<&str> = value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    if entries.len() > file.tunnel.hops.len() {
        return Err(GateError::Config(format!(
            "TUNNEL_HOPS lists {} endpoints but only {} hops are configured",
            entries.len(),
            file.tunnel.hops.len()
        )));
    }

    for (hop, entry) in file.tunnel.hops.iter_mut().zip(entries) {
        let (host, port) = entry.rsplit_once(':').ok_or_else(|| {
            GateError::Config(format!("TUNNEL_HOPS entry {entry:?} is not host:port"))
        })?;
        if host.is_empty() {
            return Err(GateError::Config(format!(
                "TUNNEL_HOPS entry {entry:?} has an empty host"
            )));
        }
        hop.remote_host = host.to_string();
        hop.remote_port = parse_env("TUNNEL_HOPS", port)?;
    }
    Ok(())
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> GateResult<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| GateError::Config(format!("invalid {name} value {value:?}: {e}")))
}

/// Validate the merged file config and resolve it into runtime types.
fn resolve(file: ConfigFile) -> GateResult<Config> {
    let upstream_section = file
        .upstream
        .ok_or_else(|| GateError::Config("no upstream configured (set [upstream] base_url or UPSTREAM_BASE_URL)".into()))?;

    let base_url = Url::parse(&upstream_section.base_url)
        .map_err(|e| GateError::Config(format!("invalid upstream base_url: {e}")))?;
    if !matches!(base_url.scheme(), "http" | "https") {
        return Err(GateError::Config(format!(
            "upstream base_url must be http or https, got {:?}",
            base_url.scheme()
        )));
    }
    if base_url.host_str().is_none() {
        return Err(GateError::Config("upstream base_url has no host".into()));
    }

    let upstream = UpstreamSpec {
        base_url,
        default_timeout: Duration::from_millis(upstream_section.timeout_ms),
        max_retries: upstream_section.max_retries,
        retry_backoff: BackoffPolicy {
            initial: Duration::from_millis(upstream_section.retry_initial_ms),
            max: Duration::from_millis(upstream_section.retry_max_ms),
            multiplier: upstream_section.retry_multiplier,
        },
        api_key: upstream_section.api_key,
    };

    let mut hops = Vec::with_capacity(file.tunnel.hops.len());
    for (i, hop) in file.tunnel.hops.into_iter().enumerate() {
        if hop.local_port == 0 {
            return Err(GateError::Config(format!(
                "hop {} has local_port 0; chain ports must be fixed",
                i + 1
            )));
        }
        if hop.remote_port == 0 {
            return Err(GateError::Config(format!("hop {} has remote_port 0", i + 1)));
        }
        hops.push(LinkSpec {
            name: hop.name.unwrap_or_else(|| format!("hop{}", i + 1)),
            local_bind_addr: hop.local_bind_addr,
            local_port: hop.local_port,
            remote_host: hop.remote_host,
            remote_port: hop.remote_port,
            auth: hop.auth,
            connect_timeout: Duration::from_millis(hop.connect_timeout_ms),
        });
    }

    // Hop ordering: every hop after the first must dial through its
    // predecessor's local port.
    for i in 1..hops.len() {
        let prev_port = hops[i - 1].local_port;
        let hop = &hops[i];
        if hop.remote_host != "localhost" && hop.remote_host != "127.0.0.1" {
            return Err(GateError::Config(format!(
                "hop {} ({}) must dial localhost or 127.0.0.1 (through hop {}), got {:?}",
                i + 1,
                hop.name,
                i,
                hop.remote_host
            )));
        }
        if hop.remote_port != prev_port {
            return Err(GateError::Config(format!(
                "hop {} ({}) dials port {} but hop {} listens on {}",
                i + 1,
                hop.name,
                hop.remote_port,
                i,
                prev_port
            )));
        }
    }

    let tls_ca_file = file.tunnel.ca_file.map(|s| expand_tilde_str(&s));
    if !hops.is_empty() && tls_ca_file.is_none() {
        return Err(GateError::Config(
            "tunnel.ca_file is required when tunnel hops are configured".into(),
        ));
    }

    Ok(Config {
        listen_addr: file.server.listen_addr,
        listen_port: file.server.listen_port,
        startup_timeout: Duration::from_millis(file.server.startup_timeout_ms),
        shutdown_grace: Duration::from_millis(file.server.shutdown_grace_ms),
        upstream,
        hops,
        link_backoff: BackoffPolicy {
            initial: Duration::from_millis(file.tunnel.reconnect_initial_ms),
            max: Duration::from_millis(file.tunnel.reconnect_max_ms),
            multiplier: file.tunnel.reconnect_multiplier,
        },
        tls_ca_file,
    })
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
