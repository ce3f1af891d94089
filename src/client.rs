//! HTTP client construction.
//!
//! One `reqwest::Client` is built per sweep and shared by every worker; its
//! connection pool is read-mostly shared state. Concurrency is bounded by the
//! level runner, never by the pool settings here.

use std::net::SocketAddr;
use tokio::time::Duration;
use tracing::{info, warn};

use crate::errors::FatalError;

/// Connection pool configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Maximum idle connections to keep per host
    pub max_idle_per_host: usize,

    /// How long idle connections stay in the pool before cleanup
    pub idle_timeout: Duration,

    /// TCP keepalive duration
    pub tcp_keepalive: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 32,
            idle_timeout: Duration::from_secs(90),
            tcp_keepalive: Some(Duration::from_secs(60)),
        }
    }
}

impl PoolConfig {
    /// Size the idle pool so the highest level can reuse its connections.
    pub fn for_max_level(max_level: u32) -> Self {
        Self {
            max_idle_per_host: (max_level as usize).max(Self::default().max_idle_per_host),
            ..Self::default()
        }
    }

    /// Apply this configuration to a reqwest ClientBuilder.
    pub fn apply_to_builder(&self, builder: reqwest::ClientBuilder) -> reqwest::ClientBuilder {
        let mut builder = builder
            .pool_max_idle_per_host(self.max_idle_per_host)
            .pool_idle_timeout(self.idle_timeout);

        if let Some(keepalive) = self.tcp_keepalive {
            builder = builder.tcp_keepalive(keepalive);
        }

        builder
    }
}

/// Configuration for building the HTTP client.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub skip_tls_verify: bool,
    /// DNS override in `hostname:ip:port` form
    pub resolve_target_addr: Option<String>,
    pub pool: PoolConfig,
}

/// Builds a reqwest HTTP client with the specified configuration.
pub fn build_client(config: &ClientConfig) -> Result<reqwest::Client, FatalError> {
    let mut client_builder =
        reqwest::Client::builder().user_agent(concat!("rust_apisweep/", env!("CARGO_PKG_VERSION")));

    if let Some(resolve_str) = config.resolve_target_addr.as_deref() {
        if resolve_str.is_empty() {
            warn!("DNS override is set but empty, no override will be applied");
        } else {
            let (host, addr) = parse_dns_override(resolve_str).map_err(FatalError::ClientBuild)?;
            info!(host = %host, addr = %addr, "Configured DNS override");
            client_builder = client_builder.resolve(&host, addr);
        }
    }

    client_builder = config.pool.apply_to_builder(client_builder);
    info!(
        max_idle_per_host = config.pool.max_idle_per_host,
        idle_timeout = ?config.pool.idle_timeout,
        "Connection pool configured"
    );

    if config.skip_tls_verify {
        warn!("Skipping TLS certificate verification");
        client_builder = client_builder
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true);
    }

    client_builder
        .build()
        .map_err(|e| FatalError::ClientBuild(e.to_string()))
}

/// Parse `hostname:ip:port` into a host and socket address.
fn parse_dns_override(resolve_str: &str) -> Result<(String, SocketAddr), String> {
    let parts: Vec<&str> = resolve_str.split(':').map(str::trim).collect();
    if parts.len() != 3 {
        return Err(format!(
            "DNS override '{}' is not in the expected format 'hostname:ip:port'",
            resolve_str
        ));
    }

    let (host, ip, port) = (parts[0], parts[1], parts[2]);
    if host.is_empty() || ip.is_empty() || port.is_empty() {
        return Err(format!(
            "DNS override '{}' has an empty part. Format: 'hostname:ip:port'",
            resolve_str
        ));
    }

    let port: u16 = port
        .parse()
        .map_err(|e| format!("Failed to parse port '{}' in DNS override: {}", port, e))?;
    let addr: SocketAddr = format!("{}:{}", ip, port)
        .parse()
        .map_err(|e| format!("Failed to parse address '{}:{}': {}", ip, port, e))?;

    Ok((host.to_string(), addr))
}
