//! HTTP surface
//!
//! Uploads (media ingestion), static blob/thumbnail serving, project CRUD
//! with the navigation-state patch endpoint, and the operational
//! database/health endpoints. The collaboration protocol itself lives on the
//! WebSocket port; everything here is the supporting REST surface.

use crate::server::ServerContext;
use axum::extract::{Multipart, Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use easel_media::THUMBNAIL_SIZES;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

pub fn router(ctx: Arc<ServerContext>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/uploads", post(upload))
        .route("/uploads/:name", get(serve_upload))
        .route("/thumbnails/:size/:name", get(serve_thumbnail))
        .route("/projects", get(list_projects).post(create_project))
        .route(
            "/projects/:id",
            get(get_project).put(update_project).delete(delete_project),
        )
        .route("/projects/:id/canvas", get(get_canvas).patch(patch_canvas))
        .route("/database/size", get(database_size))
        .route("/database/cleanup", post(database_cleanup))
        .layer(axum::extract::DefaultBodyLimit::max(
            easel_protocol::MAX_FRAME_BYTES,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

struct ApiError(StatusCode, String);

impl ApiError {
    fn not_found(what: &str) -> Self {
        Self(StatusCode::NOT_FOUND, format!("{what} not found"))
    }

    fn bad_request(detail: impl Into<String>) -> Self {
        Self(StatusCode::BAD_REQUEST, detail.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({"error": self.1}))).into_response()
    }
}

impl From<easel_store::StoreError> for ApiError {
    fn from(e: easel_store::StoreError) -> Self {
        match e {
            easel_store::StoreError::NotFound(what) => Self::not_found(what),
            easel_store::StoreError::PatchPathNotAllowed(path) => {
                Self::bad_request(format!("patch path not allowed: {path}"))
            }
            other => {
                warn!(error = %other, "store error on http surface");
                Self(StatusCode::INTERNAL_SERVER_ERROR, "internal error".into())
            }
        }
    }
}

impl From<easel_media::MediaError> for ApiError {
    fn from(e: easel_media::MediaError) -> Self {
        match e {
            easel_media::MediaError::HashMismatch { .. } | easel_media::MediaError::EmptyUpload => {
                Self::bad_request(e.to_string())
            }
            other => {
                warn!(error = %other, "media error on http surface");
                Self(StatusCode::INTERNAL_SERVER_ERROR, "internal error".into())
            }
        }
    }
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "features": ["collaboration", "media", "thumbnails", "sync"],
    }))
}

async fn upload(
    State(ctx): State<Arc<ServerContext>>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let mut file: Option<(Bytes, Option<String>, Option<String>)> = None;
    let mut declared_hash: Option<String> = None;
    let mut project_id: Option<i64> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let filename = field.file_name().map(str::to_owned);
                let mime = field.content_type().map(str::to_owned);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(e.to_string()))?;
                file = Some((bytes, filename, mime));
            }
            "hash" => {
                declared_hash = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::bad_request(e.to_string()))?,
                );
            }
            "projectId" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(e.to_string()))?;
                project_id = text.parse().ok();
            }
            _ => {}
        }
    }

    let (bytes, original_name, mime) = file.ok_or_else(|| ApiError::bad_request("missing file field"))?;
    ctx.metrics.ingest_bytes.inc_by(bytes.len() as u64);

    let outcome = ctx
        .media
        .ingest(
            bytes,
            mime.as_deref(),
            original_name.as_deref(),
            declared_hash.as_deref(),
            project_id,
        )
        .await?;

    Ok(Json(json!({
        "url": outcome.url,
        "hash": outcome.hash,
        "filename": outcome.filename,
        "size": outcome.size,
        "thumbnails": outcome.thumbnails,
    })))
}

async fn serve_upload(
    State(ctx): State<Arc<ServerContext>>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    serve_file(ctx.media.media_dir().join(safe_name(&name)?), mime_of(&name)).await
}

async fn serve_thumbnail(
    State(ctx): State<Arc<ServerContext>>,
    Path((size, name)): Path<(u32, String)>,
) -> Result<Response, ApiError> {
    if !THUMBNAIL_SIZES.contains(&size) {
        return Err(ApiError::not_found("thumbnail size"));
    }
    let path = ctx
        .media
        .thumb_dir()
        .join(size.to_string())
        .join(safe_name(&name)?);
    serve_file(path, "image/jpeg").await
}

fn safe_name(name: &str) -> Result<&str, ApiError> {
    if name.is_empty() || name.contains("..") || name.contains('/') || name.contains('\\') {
        return Err(ApiError::bad_request("invalid file name"));
    }
    Ok(name)
}

async fn serve_file(path: std::path::PathBuf, mime: &str) -> Result<Response, ApiError> {
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok((
            [
                (header::CONTENT_TYPE, mime.to_string()),
                (header::CACHE_CONTROL, "public, max-age=31536000".to_string()),
            ],
            bytes,
        )
            .into_response()),
        Err(_) => Err(ApiError::not_found("file")),
    }
}

fn mime_of(name: &str) -> &'static str {
    match name.rsplit('.').next().unwrap_or_default() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        _ => "application/octet-stream",
    }
}

fn project_json(project: &easel_store::ProjectRecord) -> Value {
    json!({
        "id": project.id,
        "name": project.name,
        "ownerId": project.owner_id,
        "description": project.description,
        "lastModified": project.last_modified,
    })
}

async fn list_projects(State(ctx): State<Arc<ServerContext>>) -> Result<Json<Value>, ApiError> {
    let projects = ctx.store.list_projects().await?;
    Ok(Json(Value::Array(
        projects.iter().map(project_json).collect(),
    )))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateProjectBody {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default = "default_owner")]
    username: String,
    #[serde(default)]
    display_name: Option<String>,
}

fn default_owner() -> String {
    "admin".to_string()
}

async fn create_project(
    State(ctx): State<Arc<ServerContext>>,
    Json(body): Json<CreateProjectBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if body.name.trim().is_empty() {
        return Err(ApiError::bad_request("project name must not be empty"));
    }
    let display_name = body.display_name.clone().unwrap_or_else(|| body.username.clone());
    let owner = ctx.store.upsert_user(&body.username, &display_name).await?;
    let project = ctx
        .store
        .create_project(&body.name, owner.id, body.description.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(project_json(&project))))
}

async fn get_project(
    State(ctx): State<Arc<ServerContext>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let project = ctx
        .store
        .get_project(id)
        .await?
        .ok_or_else(|| ApiError::not_found("project"))?;
    Ok(Json(project_json(&project)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateProjectBody {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

async fn update_project(
    State(ctx): State<Arc<ServerContext>>,
    Path(id): Path<i64>,
    Json(body): Json<UpdateProjectBody>,
) -> Result<Json<Value>, ApiError> {
    let project = ctx
        .store
        .update_project(id, body.name.as_deref(), body.description.as_deref())
        .await?;
    Ok(Json(project_json(&project)))
}

async fn delete_project(
    State(ctx): State<Arc<ServerContext>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    ctx.store.delete_project(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_canvas(
    State(ctx): State<Arc<ServerContext>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    // A live room is fresher than the persisted snapshot.
    if let Some(room) = ctx.rooms.get(id) {
        let canvas = room.lock_canvas().await;
        return Ok(Json(json!({
            "canvas": canvas.to_value(),
            "stateVersion": room.seq(),
        })));
    }
    let snapshot = ctx.store.load_snapshot(id).await?;
    let (canvas, version) = match snapshot {
        Some((blob, seq)) => (blob, seq),
        None => (Value::Null, 0),
    };
    Ok(Json(json!({"canvas": canvas, "stateVersion": version})))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NavigationPatch {
    #[serde(default)]
    scale: Option<f64>,
    #[serde(default)]
    offset: Option<[f64; 2]>,
    #[serde(default)]
    timestamp: Option<i64>,
}

async fn patch_canvas(
    State(ctx): State<Arc<ServerContext>>,
    Path(id): Path<i64>,
    Json(patch): Json<NavigationPatch>,
) -> Result<StatusCode, ApiError> {
    if patch.scale.is_none() && patch.offset.is_none() && patch.timestamp.is_none() {
        return Err(ApiError::bad_request("empty navigation patch"));
    }

    if let Some(scale) = patch.scale {
        if !scale.is_finite() || scale <= 0.0 || scale > 10.0 {
            return Err(ApiError::bad_request("scale must be in (0, 10]"));
        }
        ctx.store
            .patch_snapshot(id, "navigation.scale", json!(scale))
            .await?;
    }
    if let Some(offset) = patch.offset {
        if !offset[0].is_finite() || !offset[1].is_finite() {
            return Err(ApiError::bad_request("offset must be finite"));
        }
        ctx.store
            .patch_snapshot(id, "navigation.offset", json!(offset))
            .await?;
    }
    if let Some(timestamp) = patch.timestamp {
        if timestamp <= 0 {
            return Err(ApiError::bad_request("timestamp must be positive"));
        }
        ctx.store
            .patch_snapshot(id, "navigation.timestamp", json!(timestamp))
            .await?;
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn database_size(State(ctx): State<Arc<ServerContext>>) -> Result<Json<Value>, ApiError> {
    let size = ctx.store.database_size().await?;
    Ok(Json(json!({"sizeBytes": size})))
}

async fn database_cleanup(
    State(ctx): State<Arc<ServerContext>>,
) -> Result<Json<Value>, ApiError> {
    // VACUUM only when nothing is live; the checkpoint always runs.
    let vacuum = ctx.rooms.room_count() == 0;
    let report = ctx.store.cleanup(vacuum).await?;
    ctx.media.remove_blobs(&report.removed_filenames).await;
    Ok(Json(json!({
        "filesRemoved": report.files_removed,
        "vacuumed": report.vacuumed,
    })))
}
