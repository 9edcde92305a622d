//! Chunked resumable uploads, the direct-upload fast path, and
//! range-capable downloads (spec.md §4.7, §6).

use std::path::PathBuf;

use axum::body::Bytes;
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::{require_toggle, DeviceAuth, DeviceIdentity};
use crate::state::AppState;
use pclink_core::hub::{EventEnvelope, SubscriberClass};
use pclink_core::transfer::ConflictPolicy;

fn owner_id(identity: &DeviceIdentity) -> Uuid {
    match identity {
        DeviceIdentity::Device(id) => *id,
        DeviceIdentity::Server => Uuid::nil(),
    }
}

fn default_conflict_policy() -> ConflictPolicy {
    ConflictPolicy::Abort
}

#[derive(Debug, Deserialize)]
pub struct InitUploadBody {
    path: PathBuf,
    total_size: u64,
    #[serde(default = "default_conflict_policy")]
    conflict_policy: ConflictPolicy,
}

#[derive(Debug, Serialize)]
pub struct InitUploadResponse {
    transfer_id: Uuid,
    chunk_size: u64,
}

/// `POST /files/upload`: begin a resumable upload (spec.md §4.7.2).
///
/// # Errors
///
/// Returns [`AppError::forbidden`] if the `file_browser` toggle is off,
/// or the path-safety/conflict errors from
/// [`pclink_core::transfer::TransferEngine::init_upload`].
pub async fn init_upload(
    State(state): State<AppState>,
    DeviceAuth(identity): DeviceAuth,
    Json(body): Json<InitUploadBody>,
) -> Result<Json<InitUploadResponse>, AppError> {
    require_toggle(&state, "file_browser").await?;
    let session = state
        .transfers
        .init_upload(owner_id(&identity), &body.path, body.total_size, body.conflict_policy)
        .await?;
    Ok(Json(InitUploadResponse {
        transfer_id: session.transfer_id,
        chunk_size: session.chunk_size,
    }))
}

#[derive(Debug, Serialize)]
pub struct ChunkWrittenResponse {
    received_bytes: u64,
}

#[derive(Debug, Serialize)]
struct ResumableMetadata {
    transfer_id: Uuid,
    received_bytes: u64,
    total_size: u64,
    chunk_size: u64,
}

/// Publish a `transfer_update` event to subscribed devices and operators
/// (spec.md §4.6, §4.7.2).
async fn publish_transfer_update(state: &AppState, session: &pclink_core::transfer::TransferSession) {
    let payload = serde_json::json!({
        "transfer_id": session.transfer_id,
        "state": session.state,
        "received_bytes": session.received_bytes,
        "total_size": session.total_size,
    });
    state
        .hub
        .publish(SubscriberClass::Device, EventEnvelope::new("transfer_update", payload.clone()))
        .await;
    state
        .hub
        .publish(SubscriberClass::Operator, EventEnvelope::new("transfer_update", payload))
        .await;
}

/// `PUT /files/upload/{id}/{chunk_index}`: write one chunk. Once the
/// last chunk lands, finalizes the transfer automatically (spec.md
/// §4.7.2).
///
/// # Errors
///
/// Returns a 409 carrying resumable metadata if the session is paused,
/// or the error taxonomy of
/// [`pclink_core::transfer::TransferEngine::write_chunk`]/
/// [`pclink_core::transfer::TransferEngine::finalize`] otherwise.
pub async fn write_chunk(
    State(state): State<AppState>,
    DeviceAuth(_identity): DeviceAuth,
    AxumPath((transfer_id, chunk_index)): AxumPath<(Uuid, u64)>,
    bytes: Bytes,
) -> Result<Json<ChunkWrittenResponse>, Response> {
    match state.transfers.write_chunk(transfer_id, chunk_index, &bytes).await {
        Ok(received_bytes) => {
            if let Some(session) = state.transfers.get(transfer_id).await {
                publish_transfer_update(&state, &session).await;
                if session.is_fully_received() {
                    match state.transfers.finalize(transfer_id).await {
                        Ok(finalized) => publish_transfer_update(&state, &finalized).await,
                        Err(err) => return Err(AppError::from(err).into_response()),
                    }
                }
            }
            Ok(Json(ChunkWrittenResponse { received_bytes }))
        },
        Err(err @ pclink_core::CoreError::TransferPaused) => {
            let session = state.transfers.get(transfer_id).await;
            let app_err: AppError = err.into();
            Err(match session {
                Some(session) => (
                    app_err.into_response().status(),
                    Json(ResumableMetadata {
                        transfer_id,
                        received_bytes: session.received_bytes,
                        total_size: session.total_size,
                        chunk_size: session.chunk_size,
                    }),
                )
                    .into_response(),
                None => app_err.into_response(),
            })
        },
        Err(err) => Err(AppError::from(err).into_response()),
    }
}

/// `POST /files/upload/{id}/pause`: pause an active upload (spec.md
/// §4.7.2).
///
/// # Errors
///
/// Returns [`AppError::not_found`] if `transfer_id` is unknown.
pub async fn pause_upload(
    State(state): State<AppState>,
    DeviceAuth(_identity): DeviceAuth,
    AxumPath(transfer_id): AxumPath<Uuid>,
) -> Result<(), AppError> {
    state.transfers.pause(transfer_id).await?;
    Ok(())
}

/// `POST /files/upload/{id}/resume`: resume a paused upload.
///
/// # Errors
///
/// Returns [`AppError::not_found`] if `transfer_id` is unknown.
pub async fn resume_upload(
    State(state): State<AppState>,
    DeviceAuth(_identity): DeviceAuth,
    AxumPath(transfer_id): AxumPath<Uuid>,
) -> Result<(), AppError> {
    state.transfers.resume(transfer_id).await?;
    Ok(())
}

/// `DELETE /files/upload/{id}`: cancel an in-flight upload, emitting
/// `transfer_update` (spec.md §4.7.2).
///
/// # Errors
///
/// Returns [`AppError::not_found`] if `transfer_id` is unknown.
pub async fn cancel_upload(
    State(state): State<AppState>,
    DeviceAuth(_identity): DeviceAuth,
    AxumPath(transfer_id): AxumPath<Uuid>,
) -> Result<(), AppError> {
    let session = state.transfers.get(transfer_id).await;
    state.transfers.cancel(transfer_id).await?;
    if let Some(mut session) = session {
        session.state = pclink_core::transfer::TransferState::Cancelled;
        publish_transfer_update(&state, &session).await;
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct DirectUploadQuery {
    #[serde(default = "default_conflict_policy")]
    conflict_policy: ConflictPolicy,
}

/// `PUT /files/{path}`: single-request upload with no resumption
/// (spec.md §4.7.4).
///
/// # Errors
///
/// Returns [`AppError::forbidden`] if the `file_browser` toggle is off,
/// or the path-safety/conflict errors from
/// [`pclink_core::transfer::TransferEngine::write_direct`].
pub async fn put_direct(
    State(state): State<AppState>,
    DeviceAuth(_identity): DeviceAuth,
    AxumPath(path): AxumPath<PathBuf>,
    Query(query): Query<DirectUploadQuery>,
    bytes: Bytes,
) -> Result<(), AppError> {
    require_toggle(&state, "file_browser").await?;
    state.transfers.write_direct(&path, &bytes, query.conflict_policy).await?;
    Ok(())
}

struct ByteRange {
    start: u64,
    end: u64,
}

fn parse_range(header: &str, len: u64) -> Option<Result<ByteRange, ()>> {
    let spec = header.strip_prefix("bytes=")?;
    let (start_str, end_str) = spec.split_once('-')?;
    if start_str.is_empty() {
        let suffix_len: u64 = end_str.parse().ok()?;
        if suffix_len == 0 || suffix_len > len {
            return Some(Ok(ByteRange { start: 0, end: len.saturating_sub(1) }));
        }
        return Some(Ok(ByteRange { start: len - suffix_len, end: len - 1 }));
    }
    let start: u64 = start_str.parse().ok()?;
    let end = if end_str.is_empty() {
        len.saturating_sub(1)
    } else {
        end_str.parse().ok()?
    };
    if start > end || start >= len {
        return Some(Err(()));
    }
    Some(Ok(ByteRange { start, end: end.min(len - 1) }))
}

async fn serve_file(path: PathBuf, headers: HeaderMap) -> Result<Response, AppError> {
    let metadata = tokio::fs::metadata(&path)
        .await
        .map_err(|_| AppError::not_found("file not found"))?;
    let len = metadata.len();

    let range_header = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);

    let mime = mime_guess::from_path(&path).first_or_octet_stream();

    let Some(range_header) = range_header else {
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            tracing::error!(error = %e, "failed reading file for download");
            AppError::from(pclink_core::CoreError::internal())
        })?;
        let mut response = (StatusCode::OK, bytes).into_response();
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_str(mime.as_ref()).unwrap_or(HeaderValue::from_static("application/octet-stream")));
        response.headers_mut().insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        return Ok(response);
    };

    match parse_range(&range_header, len) {
        None => {
            let bytes = tokio::fs::read(&path).await.map_err(|_| AppError::not_found("file not found"))?;
            Ok((StatusCode::OK, bytes).into_response())
        },
        Some(Err(())) => {
            let mut response = StatusCode::RANGE_NOT_SATISFIABLE.into_response();
            response.headers_mut().insert(
                header::CONTENT_RANGE,
                HeaderValue::from_str(&format!("bytes */{len}")).unwrap_or(HeaderValue::from_static("")),
            );
            Ok(response)
        },
        Some(Ok(range)) => {
            use tokio::io::{AsyncReadExt, AsyncSeekExt};
            let mut file = tokio::fs::File::open(&path).await.map_err(|_| AppError::not_found("file not found"))?;
            file.seek(std::io::SeekFrom::Start(range.start))
                .await
                .map_err(|_| AppError::from(pclink_core::CoreError::internal()))?;
            let take = range.end - range.start + 1;
            let mut buf = vec![0u8; take as usize];
            file.read_exact(&mut buf)
                .await
                .map_err(|_| AppError::from(pclink_core::CoreError::internal()))?;

            let mut response = (StatusCode::PARTIAL_CONTENT, buf).into_response();
            let h = response.headers_mut();
            h.insert(
                header::CONTENT_RANGE,
                HeaderValue::from_str(&format!("bytes {}-{}/{len}", range.start, range.end))
                    .unwrap_or(HeaderValue::from_static("")),
            );
            h.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
            h.insert(header::CONTENT_TYPE, HeaderValue::from_str(mime.as_ref()).unwrap_or(HeaderValue::from_static("application/octet-stream")));
            Ok(response)
        },
    }
}

/// `GET /files/download/{path}`: serve a file, honoring `Range`
/// (spec.md §4.7.3, P5).
///
/// # Errors
///
/// Returns [`AppError::not_found`] if the path doesn't resolve to an
/// existing file within the allow-list.
pub async fn download(
    State(state): State<AppState>,
    DeviceAuth(_identity): DeviceAuth,
    AxumPath(path): AxumPath<PathBuf>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    require_toggle(&state, "file_browser").await?;
    let resolved = state.transfers.resolve_download_path(&path)?;
    serve_file(resolved, headers).await
}

/// `GET /files/stream`: identical to `download` but intended for media
/// players that issue many small range requests (spec.md §4.7.3).
///
/// # Errors
///
/// Returns [`AppError::not_found`] if the `path` query param doesn't
/// resolve within the allow-list.
pub async fn stream(
    State(state): State<AppState>,
    DeviceAuth(_identity): DeviceAuth,
    Query(query): Query<std::collections::HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    require_toggle(&state, "media").await?;
    let path = query.get("path").ok_or_else(|| AppError::bad_request("missing path query param"))?;
    let resolved = state.transfers.resolve_download_path(PathBuf::from(path).as_path())?;
    serve_file(resolved, headers).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use pclink_core::hub::SessionHub;
    use pclink_core::transfer::{ConflictPolicy, TransferConfig, TransferEngine, TransferState};
    use std::sync::Arc;

    fn test_state(allowed_root: &std::path::Path, transfers_dir: &std::path::Path) -> AppState {
        let identity = Arc::new(pclink_core::identity::ServerIdentity::generate().expect("generate"));
        let devices = Arc::new(
            pclink_core::devices::DeviceRegistry::load_or_init(
                &transfers_dir.join("devices.json"),
                identity.clone(),
            )
            .expect("devices"),
        );
        let config = TransferConfig::new().with_chunk_size(4).with_allowed_root(allowed_root);
        let transfers = Arc::new(TransferEngine::load_or_init(transfers_dir, config.clone()).expect("transfers"));
        let mut full_config = pclink_core::config::Config::new();
        full_config.transfer = config;
        AppState::new(
            identity,
            devices,
            Arc::new(pclink_core::pairing::PairingBroker::new(5, std::time::Duration::from_secs(60), 100)),
            Arc::new(SessionHub::new()),
            Arc::new(pclink_core::auth::OperatorAuth::new()),
            transfers,
            Arc::new(pclink_core::ratelimit::RateLimiter::new(5, std::time::Duration::from_secs(900), 1000)),
            Arc::new(tokio::sync::RwLock::new(full_config)),
            Arc::new(transfers_dir.join("config.json")),
            Arc::new(pclink_core::listener::ListenerControl::new()),
        )
    }

    #[tokio::test]
    async fn write_chunk_auto_finalizes_once_every_byte_lands() {
        let allowed = tempfile::tempdir().expect("tempdir");
        let transfers_dir = tempfile::tempdir().expect("tempdir");
        let state = test_state(allowed.path(), transfers_dir.path());
        let dest = allowed.path().join("out.bin");
        let session = state
            .transfers
            .init_upload(Uuid::new_v4(), &dest, 4, ConflictPolicy::Abort)
            .await
            .expect("init");

        let (_key, mut device_rx) = state.hub.subscribe(pclink_core::hub::SubscriberClass::Device, Uuid::nil()).await;

        let response = write_chunk(
            State(state.clone()),
            DeviceAuth(DeviceIdentity::Server),
            AxumPath((session.transfer_id, 0)),
            Bytes::from_static(b"abcd"),
        )
        .await
        .expect("write_chunk");
        assert_eq!(response.0.received_bytes, 4);

        assert!(state.transfers.get(session.transfer_id).await.is_none());
        assert_eq!(std::fs::read(&dest).expect("read"), b"abcd");

        let event = device_rx.recv().await.expect("event");
        assert_eq!(event.event_type, "transfer_update");
        let final_event = device_rx.recv().await.expect("finalize event");
        assert_eq!(final_event.payload["state"], serde_json::json!("completed"));
    }

    #[tokio::test]
    async fn cancel_upload_emits_transfer_update() {
        let allowed = tempfile::tempdir().expect("tempdir");
        let transfers_dir = tempfile::tempdir().expect("tempdir");
        let state = test_state(allowed.path(), transfers_dir.path());
        let dest = allowed.path().join("out.bin");
        let session = state
            .transfers
            .init_upload(Uuid::new_v4(), &dest, 8, ConflictPolicy::Abort)
            .await
            .expect("init");

        let (_key, mut op_rx) = state.hub.subscribe(pclink_core::hub::SubscriberClass::Operator, Uuid::nil()).await;

        cancel_upload(State(state.clone()), DeviceAuth(DeviceIdentity::Server), AxumPath(session.transfer_id))
            .await
            .expect("cancel");

        let event = op_rx.recv().await.expect("event");
        assert_eq!(event.event_type, "transfer_update");
        assert_eq!(event.payload["state"], serde_json::json!(TransferState::Cancelled));
        assert!(state.transfers.get(session.transfer_id).await.is_none());
    }

    #[test]
    fn parse_range_suffix_form() {
        let range = parse_range("bytes=-10", 100).expect("some").expect("ok");
        assert_eq!((range.start, range.end), (90, 99));
    }

    #[test]
    fn parse_range_open_ended() {
        let range = parse_range("bytes=50-", 100).expect("some").expect("ok");
        assert_eq!((range.start, range.end), (50, 99));
    }

    #[test]
    fn parse_range_rejects_start_past_end() {
        let result = parse_range("bytes=200-300", 100).expect("some");
        assert!(result.is_err());
    }

    #[test]
    fn parse_range_clamps_end_to_len() {
        let range = parse_range("bytes=0-1000", 100).expect("some").expect("ok");
        assert_eq!((range.start, range.end), (0, 99));
    }
}
