use crate::config::AppConfig;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

pub type Row = Vec<Value>;

/// Executes SQL against the column store and returns positional rows.
#[async_trait]
pub trait QueryClient: Send + Sync {
    async fn query(&self, sql: &str) -> Result<Vec<Row>>;
}

/// ClickHouse HTTP interface client (`FORMAT JSONCompact`).
#[derive(Clone)]
pub struct ClickHouseClient {
    client: Client,
    url: String,
    database: String,
    user: String,
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JsonCompact {
    #[serde(default)]
    data: Vec<Row>,
}

impl ClickHouseClient {
    pub fn new(config: &AppConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.clickhouse_timeout)
            .build()
            .context("failed to create ClickHouse HTTP client")?;

        Ok(Self {
            client,
            url: config.clickhouse_url.trim_end_matches('/').to_string(),
            database: config.clickhouse_database.clone(),
            user: config.clickhouse_user.clone(),
            password: config.clickhouse_password.clone(),
        })
    }
}

#[async_trait]
impl QueryClient for ClickHouseClient {
    async fn query(&self, sql: &str) -> Result<Vec<Row>> {
        debug!(sql, "executing backing-store query");
        let response = self
            .client
            .post(format!("{}/", self.url))
            .query(&[("database", self.database.as_str())])
            .basic_auth(&self.user, self.password.as_deref())
            .body(format!("{sql} FORMAT JSONCompact"))
            .send()
            .await
            .context("ClickHouse request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("ClickHouse returned {status}: {}", body.trim()));
        }

        let payload: JsonCompact = response
            .json()
            .await
            .context("invalid ClickHouse JSONCompact response")?;
        Ok(payload.data)
    }
}

/// Reads an unsigned id cell; ClickHouse quotes 64-bit integers in JSON output.
pub fn value_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.parse().ok(),
        _ => None,
    }
}
