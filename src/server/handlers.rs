use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use axum::middleware::Next;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::catalog::{CatalogRecord, CatalogStore, SearchPage, SearchQuery};
use crate::pipeline::Pipeline;

use super::models::{AnalyzeResponse, ErrorResponse, LikeResponse};
use super::state::ServerState;

type HandlerError = (StatusCode, Json<ErrorResponse>);

pub async fn run_server(
    pipeline: Pipeline,
    catalog: Arc<dyn CatalogStore>,
    addr: String,
) -> Result<()> {
    let state = Arc::new(ServerState { pipeline, catalog });
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| "failed to bind server address")?;
    info!(%addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}

fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/analyze", post(analyze))
        .route("/pills", get(list_pills))
        .route("/pills/:id", get(get_pill))
        .route("/pills/:id/like", post(like_pill))
        .with_state(state)
        .layer(axum::middleware::from_fn(cors_middleware))
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

async fn cors_middleware(req: Request<Body>, next: Next) -> Result<Response<Body>, StatusCode> {
    if req.method() == Method::OPTIONS {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::NO_CONTENT;
        apply_cors_headers(response.headers_mut());
        return Ok(response);
    }
    let mut response = next.run(req).await;
    apply_cors_headers(response.headers_mut());
    Ok(response)
}

fn apply_cors_headers(headers: &mut HeaderMap) {
    headers.insert("access-control-allow-origin", HeaderValue::from_static("*"));
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static("GET,POST,OPTIONS"),
    );
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static("content-type,authorization"),
    );
}

async fn analyze(
    State(state): State<Arc<ServerState>>,
    multipart: Multipart,
) -> Result<Json<AnalyzeResponse>, HandlerError> {
    let bytes = read_image_field(multipart).await?;
    ensure_image_mime(&bytes)?;

    let analysis = state
        .pipeline
        .analyze(&bytes)
        .await
        .map_err(|err| bad_request(format!("failed to decode image: {}", err)))?;
    Ok(Json(AnalyzeResponse::from(analysis)))
}

/// Pull the uploaded image out of the multipart body. The field is
/// expected to be named `image`; a sole unnamed file field is accepted.
async fn read_image_field(mut multipart: Multipart) -> Result<Vec<u8>, HandlerError> {
    let mut fallback: Option<Vec<u8>> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| bad_request(format!("invalid multipart body: {}", err)))?
    {
        let name = field.name().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|err| bad_request(format!("failed to read upload: {}", err)))?
            .to_vec();
        match name.as_deref() {
            Some("image") => return Ok(bytes),
            _ => fallback = fallback.or(Some(bytes)),
        }
    }
    fallback.ok_or_else(|| bad_request("image field is required".to_string()))
}

fn ensure_image_mime(bytes: &[u8]) -> Result<(), HandlerError> {
    let is_image = infer::get(bytes)
        .is_some_and(|kind| kind.mime_type().starts_with("image/"));
    if !is_image {
        return Err((
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Json(ErrorResponse {
                error: "upload is not a recognized image format".to_string(),
            }),
        ));
    }
    Ok(())
}

async fn list_pills(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<SearchPage>, HandlerError> {
    validate_page(&query)?;
    let page = state
        .catalog
        .search(&query)
        .map_err(|err| internal(err.to_string()))?;
    Ok(Json(page))
}

fn validate_page(query: &SearchQuery) -> Result<(), HandlerError> {
    if query.page == Some(0) {
        return Err(bad_request("page must be 1 or greater".to_string()));
    }
    Ok(())
}

async fn get_pill(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Json<CatalogRecord>, HandlerError> {
    let record = state
        .catalog
        .get(&id)
        .map_err(|err| internal(err.to_string()))?
        .ok_or_else(|| not_found(format!("no pill with id {}", id)))?;

    // The view counter is best effort; a failed bump never fails the read.
    let catalog = state.catalog.clone();
    let record_id = record.id.clone();
    tokio::spawn(async move {
        if let Err(err) = catalog.increment_view_count(&record_id) {
            warn!(error = %err, id = %record_id, "view count update failed");
        }
    });

    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
struct LikeQuery {
    user_id: String,
}

async fn like_pill(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Query(query): Query<LikeQuery>,
) -> Result<Json<LikeResponse>, HandlerError> {
    if query.user_id.trim().is_empty() {
        return Err(bad_request("user_id is required".to_string()));
    }
    if state
        .catalog
        .get(&id)
        .map_err(|err| internal(err.to_string()))?
        .is_none()
    {
        return Err(not_found(format!("no pill with id {}", id)));
    }
    let is_liked = state
        .catalog
        .record_like(&query.user_id, &id)
        .map_err(|err| internal(err.to_string()))?;
    Ok(Json(LikeResponse { is_liked }))
}

fn bad_request(message: String) -> HandlerError {
    (StatusCode::BAD_REQUEST, Json(ErrorResponse { error: message }))
}

fn not_found(message: String) -> HandlerError {
    (StatusCode::NOT_FOUND, Json(ErrorResponse { error: message }))
}

fn internal(message: String) -> HandlerError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse { error: message }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn png_magic_passes_the_mime_gate() {
        let png = [0x89u8, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0, 0, 0, 0];
        assert!(ensure_image_mime(&png).is_ok());
    }

    #[test]
    fn zero_page_is_a_bad_request() {
        let query = SearchQuery {
            page: Some(0),
            ..SearchQuery::default()
        };
        let (status, _) = validate_page(&query).expect_err("should reject");
        assert_eq!(status, StatusCode::BAD_REQUEST);

        assert!(validate_page(&SearchQuery::default()).is_ok());
        let query = SearchQuery {
            page: Some(1),
            ..SearchQuery::default()
        };
        assert!(validate_page(&query).is_ok());
    }

    #[test]
    fn text_upload_is_rejected_before_decoding() {
        let result = ensure_image_mime(b"just some text pretending to be a pill");
        let (status, _) = result.expect_err("should reject");
        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }
}
