//! Axum JSON API over the acquisition pipeline.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use radar_core::{AnalysisPayload, Page, ProductFilter, ProductRecord};
use radar_sync::{PipelineError, RadarConfig, RadarPipeline};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "radar-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<RadarPipeline>,
    pub default_domain: String,
}

impl AppState {
    pub fn new(pipeline: Arc<RadarPipeline>, default_domain: impl Into<String>) -> Self {
        Self {
            pipeline,
            default_domain: default_domain.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ProductsQuery {
    page: Option<usize>,
    per_page: Option<usize>,
    roots: Option<bool>,
    brand: Option<String>,
    domain: Option<String>,
}

impl ProductsQuery {
    fn filter(&self) -> Option<ProductFilter> {
        if self.roots.is_none() && self.brand.is_none() && self.domain.is_none() {
            return None;
        }
        let mut filter = match self.roots {
            Some(true) => ProductFilter::roots(),
            Some(false) => ProductFilter::competitors(),
            None => ProductFilter::default(),
        };
        if let Some(brand) = &self.brand {
            filter = filter.with_brand(brand.clone());
        }
        if let Some(domain) = &self.domain {
            filter = filter.with_domain(domain.clone());
        }
        Some(filter)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct AcquireBody {
    id: String,
    domain: Option<String>,
    geo: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct CompetitorsQuery {
    #[serde(default)]
    refresh: bool,
    domain: Option<String>,
    geo: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct CompetitorsResponse {
    parent_id: String,
    count: usize,
    competitors: Vec<ProductRecord>,
}

#[derive(Debug, Clone, Serialize)]
struct AnalysisResponse {
    parent_id: String,
    analysis: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/products", get(products_handler).post(acquire_handler))
        .route("/products/{id}", get(product_detail_handler))
        .route("/products/{id}/competitors", get(competitors_handler))
        .route("/products/{id}/analysis/payload", get(analysis_payload_handler))
        .route("/products/{id}/analysis", post(analysis_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: &RadarConfig) -> anyhow::Result<()> {
    let pipeline = Arc::new(radar_sync::build_pipeline(config).await?);
    let state = AppState::new(Arc::clone(&pipeline), config.default_domain.clone());
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    pipeline.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "ctrl-c handler failed; serving until killed");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = RadarConfig::load()?;
    serve(&config).await
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "status": "ok",
        "source": state.pipeline.source_id(),
    }))
    .into_response()
}

async fn products_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProductsQuery>,
) -> Response {
    let store = state.pipeline.store();
    let all = match query.filter() {
        Some(filter) => store.search(&filter).await,
        None => store.list_all().await,
    };
    match all {
        Ok(all) => Json(Page::paginate(all, query.page, query.per_page)).into_response(),
        Err(err) => pipeline_error(PipelineError::Storage(err)),
    }
}

async fn acquire_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AcquireBody>,
) -> Response {
    let domain = body.domain.as_deref().unwrap_or(&state.default_domain);
    match state
        .pipeline
        .acquire_product(&body.id, body.geo.as_deref(), domain)
        .await
    {
        Ok(record) => (StatusCode::CREATED, Json(record)).into_response(),
        Err(err) => pipeline_error(err),
    }
}

async fn product_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    match state.pipeline.store().get(&id).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => pipeline_error(PipelineError::NotFound { id }),
        Err(err) => pipeline_error(PipelineError::Storage(err)),
    }
}

async fn competitors_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    Query(query): Query<CompetitorsQuery>,
) -> Response {
    let domain = query.domain.as_deref().unwrap_or(&state.default_domain);
    match state
        .pipeline
        .resolve_competitors(&id, domain, query.geo.as_deref(), query.refresh)
        .await
    {
        Ok(competitors) => Json(CompetitorsResponse {
            parent_id: id,
            count: competitors.len(),
            competitors,
        })
        .into_response(),
        Err(err) => pipeline_error(err),
    }
}

async fn analysis_payload_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    match state.pipeline.build_analysis_payload(&id).await {
        Ok(payload) => Json::<AnalysisPayload>(payload).into_response(),
        Err(err) => pipeline_error(err),
    }
}

async fn analysis_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    match state.pipeline.analyze_competitors(&id).await {
        Ok(analysis) => Json(AnalysisResponse {
            parent_id: id,
            analysis,
        })
        .into_response(),
        Err(err) => pipeline_error(err),
    }
}

fn status_for(err: &PipelineError) -> StatusCode {
    if err.is_invalid_request() {
        return StatusCode::BAD_REQUEST;
    }
    match err {
        PipelineError::NotFound { .. } => StatusCode::NOT_FOUND,
        PipelineError::Normalization(_) => StatusCode::UNPROCESSABLE_ENTITY,
        PipelineError::Acquisition(_)
        | PipelineError::Discovery(_)
        | PipelineError::Summarization(_) => StatusCode::BAD_GATEWAY,
        PipelineError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn pipeline_error(err: PipelineError) -> Response {
    let status = status_for(&err);
    if status.is_server_error() {
        error!(error = %err, "request failed");
    }
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}
