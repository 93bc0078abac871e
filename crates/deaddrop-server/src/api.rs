use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{header, HeaderMap, Method},
    middleware,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use deaddrop_shared::protocol::FileDescriptor;
use deaddrop_shared::types::{PairingCode, UploadId};

use crate::access;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::session::SessionManager;
use crate::storage::FileStore;
use crate::upload::{UploadEngine, UploadProgress};
use crate::ws;

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub uploads: Arc<UploadEngine>,
    pub store: Arc<FileStore>,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    // Multipart framing adds overhead on top of the file bytes.
    let body_limit = state.config.max_file_bytes as usize + 1024 * 1024;

    let api = Router::new()
        .route("/api/code", get(mint_code))
        .route("/api/upload", post(upload_single))
        .route("/api/upload/init", post(upload_init))
        .route("/api/upload/chunk", post(upload_chunk))
        .route("/api/upload/complete", post(upload_complete))
        .route("/api/upload/progress/{upload_id}", get(upload_progress))
        .route("/api/upload/{upload_id}", delete(upload_cancel))
        .route("/api/session/{code}/storage", get(session_storage))
        .route("/api/server/stats", get(server_stats))
        .layer(middleware::from_fn_with_state(
            state.config.clone(),
            access::access_policy,
        ));

    Router::new()
        .merge(api)
        .route("/downloads/{code}/{filename}", get(download))
        .route("/ws", get(ws::ws_upgrade))
        .route("/health", get(health_check))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "HTTP server listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct CodeResponse {
    code: PairingCode,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadInitRequest {
    file_name: String,
    file_size: u64,
    total_chunks: u32,
    #[serde(default = "default_mime")]
    mime_type: String,
}

fn default_mime() -> String {
    "application/octet-stream".to_string()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadInitResponse {
    upload_id: UploadId,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChunkResponse {
    success: bool,
    progress: UploadProgress,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadCompleteRequest {
    upload_id: UploadId,
}

#[derive(Serialize)]
struct CancelResponse {
    success: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StorageResponse {
    current_usage: u64,
    limit: i64,
    file_count: u64,
    formatted_usage: String,
    formatted_limit: String,
    usage_percentage: f64,
    is_unlimited: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    active_sessions: usize,
    max_sessions: i64,
    available_slots: i64,
    usage_percentage: f64,
    is_unlimited: bool,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// GET /api/code — mint a pairing code and register the session.
async fn mint_code(State(state): State<AppState>) -> Result<Json<CodeResponse>, ServerError> {
    let code = state.sessions.create_session().await?;
    Ok(Json(CodeResponse { code }))
}

/// The session every upload belongs to is named by this header.
fn session_code(headers: &HeaderMap) -> Result<PairingCode, ServerError> {
    let raw = headers
        .get("x-session-id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ServerError::BadRequest("Missing X-Session-Id header".to_string()))?;
    PairingCode::parse(raw)
        .map_err(|_| ServerError::BadRequest("Invalid X-Session-Id header".to_string()))
}

/// POST /api/upload — single-shot multipart upload.
async fn upload_single(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<FileDescriptor>, ServerError> {
    let code = session_code(&headers)?;
    if !state.sessions.session_exists(&code).await {
        return Err(ServerError::SessionNotFound(code.to_string()));
    }

    let mut file: Option<(String, String, Bytes)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::BadRequest(format!("Multipart error: {e}")))?
    {
        if field.name() == Some("file") {
            let name = field.file_name().unwrap_or("file").to_string();
            let mime = field
                .content_type()
                .unwrap_or("application/octet-stream")
                .to_string();
            let data = field
                .bytes()
                .await
                .map_err(|e| ServerError::BadRequest(format!("Failed to read field: {e}")))?;
            file = Some((name, mime, data));
            break;
        }
    }
    let Some((name, mime, data)) = file else {
        return Err(ServerError::BadRequest(
            "Missing 'file' field in multipart form".to_string(),
        ));
    };

    let size = data.len() as u64;
    if size > state.config.max_file_bytes {
        return Err(ServerError::FileTooLarge {
            size,
            max: state.config.max_file_bytes,
        });
    }
    state.sessions.check_quota(&code, size).await?;

    state.store.create_session_tree(&code).await?;
    let dest = state.store.allocate_file_path(&code, &name);
    if let Err(e) = tokio::fs::write(&dest.path, &data).await {
        let _ = tokio::fs::remove_file(&dest.path).await;
        return Err(ServerError::Storage(format!("Failed to store upload: {e}")));
    }
    state.sessions.account_storage(&code, size).await?;

    info!(code = %code, file = %dest.stored_name, size, "File uploaded");
    Ok(Json(FileDescriptor {
        name,
        size,
        mime_type: mime,
        download_url: dest.download_url,
    }))
}

/// POST /api/upload/init — begin a chunked upload.
async fn upload_init(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<UploadInitRequest>,
) -> Result<Json<UploadInitResponse>, ServerError> {
    let code = session_code(&headers)?;
    if !state.sessions.session_exists(&code).await {
        return Err(ServerError::SessionNotFound(code.to_string()));
    }

    if req.file_size > state.config.max_file_bytes {
        return Err(ServerError::FileTooLarge {
            size: req.file_size,
            max: state.config.max_file_bytes,
        });
    }
    state.sessions.check_quota(&code, req.file_size).await?;

    let upload_id = state
        .uploads
        .init(
            code,
            req.file_name,
            req.file_size,
            req.total_chunks,
            req.mime_type,
        )
        .await?;

    Ok(Json(UploadInitResponse { upload_id }))
}

/// POST /api/upload/chunk — multipart `{uploadId, chunkIndex, chunk}`.
async fn upload_chunk(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ChunkResponse>, ServerError> {
    let mut upload_id: Option<UploadId> = None;
    let mut chunk_index: Option<u32> = None;
    let mut data: Option<Bytes> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::BadRequest(format!("Multipart error: {e}")))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "uploadId" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ServerError::BadRequest(format!("Bad uploadId field: {e}")))?;
                upload_id = Some(
                    UploadId::parse(&text)
                        .map_err(|_| ServerError::BadRequest("Invalid uploadId".to_string()))?,
                );
            }
            "chunkIndex" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ServerError::BadRequest(format!("Bad chunkIndex field: {e}")))?;
                chunk_index = Some(
                    text.trim()
                        .parse::<u32>()
                        .map_err(|_| ServerError::BadRequest("Invalid chunkIndex".to_string()))?,
                );
            }
            "chunk" => {
                data = Some(field.bytes().await.map_err(|e| {
                    ServerError::BadRequest(format!("Failed to read chunk field: {e}"))
                })?);
            }
            _ => {}
        }
    }

    let upload_id =
        upload_id.ok_or_else(|| ServerError::BadRequest("Missing uploadId".to_string()))?;
    let chunk_index =
        chunk_index.ok_or_else(|| ServerError::BadRequest("Missing chunkIndex".to_string()))?;
    let data = data.ok_or_else(|| ServerError::BadRequest("Missing chunk".to_string()))?;

    let progress = state.uploads.put_chunk(upload_id, chunk_index, &data).await?;
    Ok(Json(ChunkResponse {
        success: true,
        progress,
    }))
}

/// POST /api/upload/complete — assemble and publish the file.
async fn upload_complete(
    State(state): State<AppState>,
    Json(req): Json<UploadCompleteRequest>,
) -> Result<Json<FileDescriptor>, ServerError> {
    let finished = state.uploads.complete(req.upload_id).await?;

    // The file is on disk either way; a session that expired mid-assembly
    // only loses the accounting update.
    if let Err(e) = state
        .sessions
        .account_storage(&finished.code, finished.file.size)
        .await
    {
        warn!(code = %finished.code, error = %e, "Could not account completed upload");
    }

    Ok(Json(finished.file))
}

/// GET /api/upload/progress/{upload_id}
async fn upload_progress(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> Result<Json<UploadProgress>, ServerError> {
    let id = UploadId::parse(&upload_id)
        .map_err(|_| ServerError::BadRequest("Invalid uploadId".to_string()))?;
    let progress = state.uploads.progress(id).await?;
    Ok(Json(progress))
}

/// DELETE /api/upload/{upload_id} — cancel; unknown ids are a no-op.
async fn upload_cancel(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> Result<Json<CancelResponse>, ServerError> {
    let id = UploadId::parse(&upload_id)
        .map_err(|_| ServerError::BadRequest("Invalid uploadId".to_string()))?;
    state.uploads.cancel(id).await;
    Ok(Json(CancelResponse { success: true }))
}

/// GET /api/session/{code}/storage
async fn session_storage(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<StorageResponse>, ServerError> {
    let code =
        PairingCode::parse(&code).map_err(|_| ServerError::BadRequest("Invalid code".to_string()))?;
    let status = state.sessions.storage_status(&code).await?;

    let usage_percentage = if status.unlimited || status.limit <= 0 {
        0.0
    } else {
        let pct = status.current as f64 * 100.0 / status.limit as f64;
        (pct * 100.0).round() / 100.0
    };

    Ok(Json(StorageResponse {
        current_usage: status.current,
        limit: status.limit,
        file_count: status.file_count,
        formatted_usage: format_bytes(status.current),
        formatted_limit: if status.unlimited {
            "Unlimited".to_string()
        } else {
            format_bytes(status.limit as u64)
        },
        usage_percentage,
        is_unlimited: status.unlimited,
    }))
}

/// GET /api/server/stats
async fn server_stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let stats = state.sessions.stats().await;
    Json(StatsResponse {
        active_sessions: stats.active,
        max_sessions: stats.max,
        available_slots: stats.available,
        usage_percentage: (stats.usage_percent * 100.0).round() / 100.0,
        is_unlimited: stats.unlimited,
    })
}

/// GET /downloads/{code}/{filename} — stream stored ciphertext.
async fn download(
    State(state): State<AppState>,
    Path((code, filename)): Path<(String, String)>,
) -> Result<impl axum::response::IntoResponse, ServerError> {
    let code = PairingCode::parse(&code).map_err(|_| ServerError::InvalidPath(code))?;
    let (file, len) = state.store.open_file(&code, &filename).await?;

    let headers = [
        (
            header::CONTENT_TYPE,
            "application/octet-stream".to_string(),
        ),
        (header::CONTENT_LENGTH, len.to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        ),
    ];
    let body = Body::from_stream(ReaderStream::new(file));
    Ok((headers, body))
}

/// Human-readable byte counts for the storage endpoint.
fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
