//! Axum JSON API for Munich Discovery.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::{header, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use mdisc_core::{total_pages, Venue, DEFAULT_PAGE_SIZE};
use mdisc_storage::{SqliteVenueStore, StoreError, VenueQueryService, VenueStore};
use mdisc_sync::{IngestionService, RefreshScheduler, SyncConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "mdisc-web";

pub const BANNER: &str = "Munich Discovery API - Server is running!";

/// Set to `true` on refresh responses that carry stored rather than fresh venues.
pub const STALE_HEADER: &str = "x-venues-stale";

/// The refresh endpoint always answers with the first page at this size.
pub const REFRESH_PAGE_SIZE: u32 = 15;

/// What a refresh request answers when the provider could not be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefreshFailurePolicy {
    /// 200 with the stored venues; only the stale header tells them apart.
    #[default]
    Mask,
    /// 503 with the stored venues as body.
    Surface,
}

impl FromStr for RefreshFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mask" => Ok(Self::Mask),
            "surface" => Ok(Self::Surface),
            other => Err(format!("unknown refresh failure policy `{other}`")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
    pub refresh_failure: RefreshFailurePolicy,
}

impl WebConfig {
    pub fn from_env() -> Self {
        let refresh_failure = match std::env::var("MDISC_REFRESH_FAILURE") {
            Ok(raw) => raw.parse().unwrap_or_else(|err| {
                warn!(%err, "falling back to masking refresh failures");
                RefreshFailurePolicy::Mask
            }),
            Err(_) => RefreshFailurePolicy::Mask,
        };
        Self {
            port: std::env::var("MDISC_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),
            refresh_failure,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub queries: VenueQueryService,
    pub ingestion: Arc<IngestionService>,
    pub refresh_failure: RefreshFailurePolicy,
}

impl AppState {
    pub fn new(ingestion: Arc<IngestionService>, refresh_failure: RefreshFailurePolicy) -> Self {
        Self {
            queries: VenueQueryService::new(Arc::clone(ingestion.store())),
            ingestion,
            refresh_failure,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VenuesResponse {
    pub venues: Vec<Venue>,
    pub last_updated: String,
    pub page: u32,
    pub page_size: u32,
    pub total_count: u64,
    pub total_pages: u64,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct VenuesQuery {
    page: Option<i64>,
    page_size: Option<i64>,
    search: Option<String>,
    category: Option<String>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!(error = %self, "request failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": self.to_string() })),
        )
            .into_response()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/venues", get(list_venues_handler))
        .route("/api/venues/refresh", get(refresh_handler))
        .route("/api/venues/categories", get(categories_handler))
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
}

/// Bind `config.port` and serve until Ctrl-C.
pub async fn serve(config: &WebConfig, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("binding port {}", config.port))?;
    info!(port = config.port, "serving venue API");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let sync_config = SyncConfig::from_env();
    let web_config = WebConfig::from_env();

    let store = SqliteVenueStore::connect(&sync_config.database_url).await?;
    store.migrate().await?;
    let store: Arc<dyn VenueStore> = Arc::new(store);
    let ingestion = Arc::new(IngestionService::from_config(&sync_config, store)?);

    let scheduler = RefreshScheduler::new(Arc::clone(&ingestion), sync_config.refresh_interval());
    if sync_config.scheduler_enabled {
        scheduler.start().await;
    } else {
        info!("refresh scheduler disabled");
    }

    let result = serve(&web_config, AppState::new(ingestion, web_config.refresh_failure)).await;
    scheduler.stop().await;
    result
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "listening for ctrl-c failed");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

async fn index_handler() -> &'static str {
    BANNER
}

async fn list_venues_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<VenuesQuery>,
) -> Result<Json<VenuesResponse>, ApiError> {
    let listing = state
        .queries
        .list_venues(
            query.page.unwrap_or(1),
            query.page_size.unwrap_or(i64::from(DEFAULT_PAGE_SIZE)),
            query.search.as_deref(),
            query.category.as_deref(),
        )
        .await?;

    Ok(Json(VenuesResponse {
        venues: listing.venues,
        last_updated: state.ingestion.last_update_time().await,
        page: listing.page.page,
        page_size: listing.page.page_size,
        total_count: listing.total_count,
        total_pages: listing.total_pages,
    }))
}

async fn refresh_handler(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let outcome = state.ingestion.fetch_and_store().await?;
    let stale = outcome.is_stale();
    let venues = outcome.into_venues();
    let total_count = venues.len() as u64;

    let body = VenuesResponse {
        venues: venues.into_iter().take(REFRESH_PAGE_SIZE as usize).collect(),
        last_updated: state.ingestion.last_update_time().await,
        page: 1,
        page_size: REFRESH_PAGE_SIZE,
        total_count,
        total_pages: total_pages(total_count, REFRESH_PAGE_SIZE),
    };

    if !stale {
        return Ok(Json(body).into_response());
    }

    let status = match state.refresh_failure {
        RefreshFailurePolicy::Mask => StatusCode::OK,
        RefreshFailurePolicy::Surface => StatusCode::SERVICE_UNAVAILABLE,
    };
    Ok((
        status,
        [(
            HeaderName::from_static(STALE_HEADER),
            HeaderValue::from_static("true"),
        )],
        Json(body),
    )
        .into_response())
}

async fn categories_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<BTreeMap<String, u64>>, ApiError> {
    let counts = state.queries.category_counts().await?;
    Ok(Json(
        counts
            .into_iter()
            .map(|(category, count)| (category.as_str().to_string(), count))
            .collect(),
    ))
}
