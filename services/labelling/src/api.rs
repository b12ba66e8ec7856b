use crate::config::ApiConfig;
use crate::export::ExportService;
use crate::media_catalog::CatalogError;
use crate::selection::{Rank, RankMapping, SelectionError};
use crate::selection_store::SelectionFilter;
use crate::service::{LabellingError, LabellingService};
use anyhow::{Context, Result};
use axum::{
    async_trait,
    extract::{FromRequestParts, Path, Query, State},
    http::{header, request::Parts, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

/// State handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub labelling: Arc<LabellingService>,
    /// Header carrying the authenticated labeller
    pub actor_header: HeaderName,
}

impl AppState {
    pub fn new(labelling: Arc<LabellingService>, config: &ApiConfig) -> Result<Self> {
        let actor_header = HeaderName::try_from(config.actor_header.to_ascii_lowercase())
            .with_context(|| format!("Invalid actor header name {:?}", config.actor_header))?;

        Ok(Self {
            labelling,
            actor_header,
        })
    }
}

/// Labeller identity resolved by the upstream identity proxy
#[derive(Debug, Clone)]
pub struct Actor(pub String);

#[async_trait]
impl FromRequestParts<AppState> for Actor {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let actor = parts
            .headers
            .get(&state.actor_header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                ApiError::Unauthorized(format!("Missing {} header", state.actor_header))
            })?;

        Ok(Actor(actor.to_string()))
    }
}

/// JSON body of every error reply
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Errors returned by handlers
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Unsupported export format {0:?}: expected json or csv")]
    InvalidFormat(String),

    #[error(transparent)]
    Labelling(#[from] LabellingError),
}

impl From<SelectionError> for ApiError {
    fn from(e: SelectionError) -> Self {
        ApiError::Labelling(e.into())
    }
}

impl From<CatalogError> for ApiError {
    fn from(e: CatalogError) -> Self {
        ApiError::Labelling(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            ApiError::InvalidFormat(_) => {
                (StatusCode::BAD_REQUEST, "INVALID_FORMAT", self.to_string())
            }
            ApiError::Labelling(LabellingError::Selection(SelectionError::InvalidRank(_))) => {
                (StatusCode::BAD_REQUEST, "INVALID_RANK", self.to_string())
            }
            ApiError::Labelling(LabellingError::Selection(SelectionError::StorageConflict {
                ..
            })) => {
                warn!(error = %self, "Selection conflict surfaced to caller");
                (
                    StatusCode::CONFLICT,
                    "STORAGE_CONFLICT",
                    "Selection was modified concurrently, retry the request".to_string(),
                )
            }
            ApiError::Labelling(LabellingError::Catalog(CatalogError::NotFound(_))) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND", self.to_string())
            }
            ApiError::Labelling(LabellingError::Catalog(CatalogError::InvalidName(_))) => {
                (StatusCode::BAD_REQUEST, "INVALID_NAME", self.to_string())
            }
            ApiError::Labelling(_) => {
                error!(error = %self, "Request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        (
            status,
            Json(ErrorResponse {
                error: message,
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}

/// Category list response
#[derive(Debug, Serialize, Deserialize)]
pub struct CategoriesResponse {
    pub categories: Vec<String>,
}

/// Videos still to label in a category
#[derive(Debug, Serialize, Deserialize)]
pub struct VideosResponse {
    pub category: String,
    pub videos: Vec<String>,
}

/// Frames of one video
#[derive(Debug, Serialize, Deserialize)]
pub struct FramesResponse {
    pub category: String,
    pub video: String,
    pub frames: Vec<String>,
}

/// Current picks for one video
#[derive(Debug, Serialize, Deserialize)]
pub struct SelectionResponse {
    pub category: String,
    pub video: String,
    /// Rank → frame, e.g. `{"1": "a.jpg", "3": "c.jpg"}`
    pub selections: RankMapping,
    /// All three ranks are filled
    pub complete: bool,
    pub missing_ranks: Vec<Rank>,
}

impl SelectionResponse {
    fn new(category: String, video: String, selections: RankMapping) -> Self {
        Self {
            complete: selections.is_complete(),
            missing_ranks: selections.missing_ranks(),
            category,
            video,
            selections,
        }
    }
}

/// Body of a rank assignment
#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    pub frame: String,
}

/// Query parameters for export
#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    pub actor: Option<String>,
    pub category: Option<String>,
    /// `json` (default) or `csv`
    pub format: Option<String>,
}

/// CORS policy: permissive when no origins are listed
fn cors_layer(config: &ApiConfig) -> CorsLayer {
    if !config.cors_enabled {
        return CorsLayer::new();
    }

    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if config.cors_origins.is_empty() {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring malformed CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(origins)
}

/// Build the labelling router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let selections = Router::new()
        .route("/", get(get_selections))
        .route("/:rank", put(assign_selection).delete(unassign_selection));

    let api = Router::new()
        .route("/categories", get(list_categories))
        .route("/categories/:category/videos", get(list_videos))
        .route("/categories/:category/videos/:video/frames", get(list_frames))
        .nest("/categories/:category/videos/:video/selections", selections)
        .route("/export", get(export_selections));

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(config))
        .with_state(state)
}

/// Probe response for `/health` and `/ready`
#[derive(Debug, Serialize)]
struct ProbeResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    store: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Liveness: the process is serving requests
async fn health_check() -> Json<ProbeResponse> {
    Json(ProbeResponse {
        status: "healthy",
        store: None,
        error: None,
    })
}

/// Readiness: the selection store answers a ping
async fn readiness_check(State(state): State<AppState>) -> (StatusCode, Json<ProbeResponse>) {
    match state.labelling.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(ProbeResponse {
                status: "ready",
                store: Some("reachable"),
                error: None,
            }),
        ),
        Err(e) => {
            warn!(error = %e, "Selection store unreachable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ProbeResponse {
                    status: "not_ready",
                    store: Some("unreachable"),
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

async fn list_categories(
    State(state): State<AppState>,
    _actor: Actor,
) -> Result<Json<CategoriesResponse>, ApiError> {
    let categories = state.labelling.catalog().list_categories().await?;
    Ok(Json(CategoriesResponse { categories }))
}

/// Videos in a category the caller has not labeled yet
#[instrument(skip(state))]
async fn list_videos(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(category): Path<String>,
) -> Result<Json<VideosResponse>, ApiError> {
    let videos = state
        .labelling
        .get_unlabeled_videos(&actor, &category)
        .await?;

    Ok(Json(VideosResponse { category, videos }))
}

async fn list_frames(
    State(state): State<AppState>,
    _actor: Actor,
    Path((category, video)): Path<(String, String)>,
) -> Result<Json<FramesResponse>, ApiError> {
    let frames = state
        .labelling
        .catalog()
        .list_frames(&category, &video)
        .await?;

    Ok(Json(FramesResponse {
        category,
        video,
        frames,
    }))
}

#[instrument(skip(state))]
async fn get_selections(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path((category, video)): Path<(String, String)>,
) -> Result<Json<SelectionResponse>, ApiError> {
    let selections = state
        .labelling
        .get_selections(&actor, &category, &video)
        .await?;

    Ok(Json(SelectionResponse::new(category, video, selections)))
}

/// Put a listed frame at a rank
#[instrument(skip(state, request), fields(frame = %request.frame))]
async fn assign_selection(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path((category, video, rank)): Path<(String, String, i64)>,
    Json(request): Json<AssignRequest>,
) -> Result<Json<SelectionResponse>, ApiError> {
    // Reject bad ranks before touching the catalog or the store
    Rank::new(rank)?;

    let frames = state
        .labelling
        .catalog()
        .list_frames(&category, &video)
        .await?;
    if !frames.iter().any(|f| f == &request.frame) {
        return Err(ApiError::NotFound(format!(
            "Frame {} not found in {}/{}",
            request.frame, category, video
        )));
    }

    let selections = state
        .labelling
        .assign_selection(&actor, &category, &video, rank, &request.frame)
        .await?;

    Ok(Json(SelectionResponse::new(category, video, selections)))
}

#[instrument(skip(state))]
async fn unassign_selection(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path((category, video, rank)): Path<(String, String, i64)>,
) -> Result<Json<SelectionResponse>, ApiError> {
    let selections = state
        .labelling
        .unassign_selection(&actor, &category, &video, rank)
        .await?;

    Ok(Json(SelectionResponse::new(category, video, selections)))
}

enum ExportFormat {
    Json,
    Csv,
}

/// Export picks as JSON rows or a CSV attachment
#[instrument(skip(state))]
async fn export_selections(
    State(state): State<AppState>,
    _actor: Actor,
    Query(params): Query<ExportQuery>,
) -> Result<Response, ApiError> {
    let format = match params.format.as_deref() {
        None | Some("json") => ExportFormat::Json,
        Some("csv") => ExportFormat::Csv,
        Some(other) => return Err(ApiError::InvalidFormat(other.to_string())),
    };

    let filter = SelectionFilter {
        actor: params.actor,
        category: params.category,
    };

    let rows = state.labelling.export_selections(&filter).await?;

    let response = match format {
        ExportFormat::Json => Json(rows).into_response(),
        ExportFormat::Csv => (
            [
                (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
                (
                    header::CONTENT_DISPOSITION,
                    "attachment; filename=\"selections.csv\"",
                ),
            ],
            ExportService::to_csv(&rows),
        )
            .into_response(),
    };

    Ok(response)
}

/// Start the labelling API server and serve until `shutdown` resolves
pub async fn start_api_server<F>(state: AppState, config: &ApiConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind labelling API to {addr}"))?;

    info!(address = %addr, "Labelling API listening");

    axum::serve(listener, create_router(state, config))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Labelling API server failed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selection_response_reports_missing_ranks() {
        let mut selections = RankMapping::new();
        selections.insert(Rank::SECOND, "b.jpg");

        let response = SelectionResponse::new("catX".to_string(), "vidY".to_string(), selections);

        assert!(!response.complete);
        assert_eq!(response.missing_ranks, vec![Rank::FIRST, Rank::THIRD]);
        assert_eq!(
            serde_json::to_value(&response).unwrap()["selections"],
            serde_json::json!({ "2": "b.jpg" })
        );
    }

    #[test]
    fn test_invalid_rank_maps_to_bad_request() {
        let response = ApiError::from(SelectionError::InvalidRank(5)).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_invalid_name_maps_to_bad_request() {
        let response = ApiError::from(CatalogError::InvalidName("..".to_string())).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_invalid_format_maps_to_bad_request() {
        let response = ApiError::InvalidFormat("xml".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_unauthorized_maps_to_401() {
        let response = ApiError::Unauthorized("Missing x-labeller header".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
