use crate::{
    config::AppConfig,
    db::ClickHouseClient,
    engine::{FilterEngine, TranslateRequest, TranslateResponse},
    error::{QuerierError, Result},
    state::AppState,
};
use axum::{
    extract::State,
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

pub struct Server {
    config: Arc<AppConfig>,
    state: AppState,
}

impl Server {
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let client = ClickHouseClient::new(&config)?;
        let engine = FilterEngine::new(&config, Arc::new(client))?;
        Ok(Self::from_parts(config, engine))
    }

    /// Server over a prebuilt engine, e.g. one backed by a stub query client.
    pub fn from_parts(config: AppConfig, engine: FilterEngine) -> Self {
        let config = Arc::new(config);
        let state = AppState::new(Arc::clone(&config), engine);
        Self { config, state }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/healthz", get(Self::health))
            .route("/api/filter/translate", post(Self::translate))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.config.listen_addr;
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "querier listening");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    async fn health() -> Json<serde_json::Value> {
        Json(json!({ "status": "ok" }))
    }

    async fn translate(
        State(state): State<AppState>,
        headers: HeaderMap,
        Json(request): Json<TranslateRequest>,
    ) -> Result<Json<TranslateResponse>> {
        enforce_api_key(&headers, &state.config)?;
        let response = state.engine.translate(request).await?;
        Ok(Json(response))
    }
}

fn enforce_api_key(headers: &HeaderMap, config: &AppConfig) -> Result<()> {
    if let Some(expected) = &config.api_key {
        let provided = headers
            .get("x-api-key")
            .and_then(|value| value.to_str().ok());

        if provided != Some(expected.as_str()) {
            return Err(QuerierError::Auth);
        }
    }

    Ok(())
}
