use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    net::{SocketAddr, ToSocketAddrs},
    path::PathBuf,
    time::Duration,
};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub api_key: Option<String>,
    pub clickhouse_url: String,
    pub clickhouse_user: String,
    pub clickhouse_password: Option<String>,
    pub clickhouse_database: String,
    pub clickhouse_timeout: Duration,
    pub subquery_cache_ttl: Duration,
    pub subquery_cache_entries: usize,
    pub language: String,
    pub tag_taxonomy_path: Option<PathBuf>,
    pub prometheus_registry_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    querier_listen_addr: Option<String>,
    #[serde(default)]
    querier_listen_host: Option<String>,
    #[serde(default)]
    querier_listen_port: Option<u16>,
    #[serde(default)]
    querier_api_key: Option<String>,
    #[serde(default)]
    querier_clickhouse_url: Option<String>,
    #[serde(default)]
    querier_clickhouse_user: Option<String>,
    #[serde(default)]
    querier_clickhouse_password: Option<String>,
    #[serde(default)]
    querier_clickhouse_database: Option<String>,
    #[serde(default = "default_timeout_secs")]
    querier_clickhouse_timeout_secs: u64,
    #[serde(default = "default_cache_timeout_secs")]
    querier_prometheus_id_subquery_lru_timeout_secs: u64,
    #[serde(default = "default_cache_entries")]
    querier_prometheus_id_subquery_lru_entries: usize,
    #[serde(default)]
    querier_language: Option<String>,
    #[serde(default)]
    querier_tag_taxonomy_path: Option<PathBuf>,
    #[serde(default)]
    querier_prometheus_registry_path: Option<PathBuf>,
}

const fn default_timeout_secs() -> u64 {
    30
}

const fn default_cache_timeout_secs() -> u64 {
    60
}

const fn default_cache_entries() -> usize {
    100_000
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let raw: RawConfig =
            envy::from_env().context("failed to parse QUERIER_* environment variables")?;

        let listen_addr = resolve_addr(
            raw.querier_listen_addr,
            raw.querier_listen_host,
            raw.querier_listen_port,
        )?;

        let api_key = raw.querier_api_key.filter(|key| !key.trim().is_empty());

        Ok(Self {
            listen_addr,
            api_key,
            clickhouse_url: raw
                .querier_clickhouse_url
                .unwrap_or_else(|| "http://127.0.0.1:8123".to_string()),
            clickhouse_user: raw
                .querier_clickhouse_user
                .unwrap_or_else(|| "default".to_string()),
            clickhouse_password: raw.querier_clickhouse_password,
            clickhouse_database: raw
                .querier_clickhouse_database
                .unwrap_or_else(|| "flow_tag".to_string()),
            clickhouse_timeout: Duration::from_secs(raw.querier_clickhouse_timeout_secs.max(1)),
            subquery_cache_ttl: Duration::from_secs(
                raw.querier_prometheus_id_subquery_lru_timeout_secs,
            ),
            subquery_cache_entries: raw.querier_prometheus_id_subquery_lru_entries.max(1),
            language: raw.querier_language.unwrap_or_else(|| "en".to_string()),
            tag_taxonomy_path: raw.querier_tag_taxonomy_path,
            prometheus_registry_path: raw.querier_prometheus_registry_path,
        })
    }
}

fn resolve_addr(
    addr: Option<String>,
    host: Option<String>,
    port: Option<u16>,
) -> Result<SocketAddr> {
    if let Some(addr) = addr {
        return addr
            .to_socket_addrs()
            .context("invalid QUERIER_LISTEN_ADDR value")?
            .next()
            .context("QUERIER_LISTEN_ADDR resolved to no addresses");
    }

    let host = host.unwrap_or_else(|| "0.0.0.0".to_string());
    let port = port.unwrap_or(20416);
    format!("{host}:{port}")
        .to_socket_addrs()
        .context("invalid querier listen host/port combination")?
        .next()
        .context("listen address resolved to no targets")
}
