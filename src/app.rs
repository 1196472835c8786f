//! HTTP routes for browsing and extracting datasets.

use crate::app_state::SharedAppState;
use crate::dataset::base_name;
use crate::error::H5LensError;
use crate::explorer;
use crate::metrics::{metrics_handler, record_response_metrics, request_counter};
use crate::models::DatasetInfo;
use crate::request::{
    ExportRequest, HeatmapRequest, LineRequest, MatrixRequest, NodeRequest, PreviewRequest,
};
use crate::validated_query::ValidatedQuery;

use axum::{
    body::StreamBody,
    extract::State,
    http::header,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

/// Serialized JSON returned by the cached explorer operations.
struct JsonBytes(Bytes);

impl IntoResponse for JsonBytes {
    fn into_response(self) -> Response {
        (
            [(header::CONTENT_TYPE, mime::APPLICATION_JSON.to_string())],
            self.0,
        )
            .into_response()
    }
}

/// Returns the h5lens router, serving `state`.
pub fn router(state: SharedAppState) -> Router {
    fn v1() -> Router<SharedAppState> {
        Router::new()
            .route("/info", get(info))
            .route("/children", get(children))
            .route("/metadata", get(metadata))
            .route("/preview", get(preview))
            .route("/matrix", get(matrix))
            .route("/line", get(line))
            .route("/heatmap", get(heatmap))
            .route("/export", get(export))
    }

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .nest("/v1", v1())
        .layer(
            ServiceBuilder::new().layer(
                TraceLayer::new_for_http()
                    .on_request(request_counter)
                    .on_response(record_response_metrics),
            ),
        )
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

async fn info(
    State(state): State<SharedAppState>,
    ValidatedQuery(request): ValidatedQuery<NodeRequest>,
) -> Result<Json<DatasetInfo>, H5LensError> {
    explorer::get_dataset_info(&state, &request).await.map(Json)
}

async fn children(
    State(state): State<SharedAppState>,
    ValidatedQuery(request): ValidatedQuery<NodeRequest>,
) -> Result<JsonBytes, H5LensError> {
    explorer::get_children(&state, &request).await.map(JsonBytes)
}

async fn metadata(
    State(state): State<SharedAppState>,
    ValidatedQuery(request): ValidatedQuery<NodeRequest>,
) -> Result<JsonBytes, H5LensError> {
    explorer::get_metadata(&state, &request).await.map(JsonBytes)
}

async fn preview(
    State(state): State<SharedAppState>,
    ValidatedQuery(request): ValidatedQuery<PreviewRequest>,
) -> Result<JsonBytes, H5LensError> {
    explorer::get_preview(&state, &request).await.map(JsonBytes)
}

async fn matrix(
    State(state): State<SharedAppState>,
    ValidatedQuery(request): ValidatedQuery<MatrixRequest>,
) -> Result<JsonBytes, H5LensError> {
    explorer::get_matrix(&state, &request).await.map(JsonBytes)
}

async fn line(
    State(state): State<SharedAppState>,
    ValidatedQuery(request): ValidatedQuery<LineRequest>,
) -> Result<JsonBytes, H5LensError> {
    explorer::get_line(&state, &request).await.map(JsonBytes)
}

async fn heatmap(
    State(state): State<SharedAppState>,
    ValidatedQuery(request): ValidatedQuery<HeatmapRequest>,
) -> Result<JsonBytes, H5LensError> {
    explorer::get_heatmap(&state, &request).await.map(JsonBytes)
}

async fn export(
    State(state): State<SharedAppState>,
    ValidatedQuery(request): ValidatedQuery<ExportRequest>,
) -> Result<Response, H5LensError> {
    let stream = explorer::export_stream(&state, &request).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, attachment(&request)),
        ],
        StreamBody::new(stream),
    )
        .into_response())
}

/// Content disposition naming the CSV after the dataset and export mode.
fn attachment(request: &ExportRequest) -> String {
    let name: String = base_name(&request.path)
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let name = if name.is_empty() { "root".to_string() } else { name };
    format!("attachment; filename=\"{}_{}.csv\"", name, request.mode)
}
