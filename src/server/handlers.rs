// ABOUTME: Handler bodies for the bridge routes, run after authentication succeeded
// ABOUTME: Site-mutating work is spawned so it finishes even if the caller hangs up

use std::convert::Infallible;
use std::io::ErrorKind;
use std::path::PathBuf;

use futures::Stream;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};
use warp::http::header::{
    HeaderValue, CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_TYPE, EXPIRES, PRAGMA,
};
use warp::hyper::body::Bytes;
use warp::hyper::Body;
use warp::reply::Response;
use warp::Reply;

use super::{error_reply, SharedState};
use crate::cleanup::cleanup_dir;
use crate::error::{BridgeError, Result};
use crate::remote::models::{
    CleanupRequest, CleanupResponse, DownloadQuery, FinalizeBatchRequest, FinalizeBatchResponse,
    FinalizeRequest, FinalizeResponse, HandshakeRequest, HandshakeResponse, ProcessStepRequest,
    ProcessStepResponse, ARTIFACT_SIZE_HEADER,
};
use crate::rewrite::{normalize_origin, BatchBudget};
use crate::types::{MigrationState, StepKind};

const DOWNLOAD_CHUNK: usize = 64 * 1024;

fn respond<T: Serialize>(result: Result<T>) -> std::result::Result<Response, Infallible> {
    Ok(match result {
        Ok(body) => warp::reply::json(&body).into_response(),
        Err(e) => {
            warn!("Request failed: {}", e);
            error_reply(&e)
        }
    })
}

fn task_failed(operation: &str, e: tokio::task::JoinError) -> BridgeError {
    BridgeError::Io(std::io::Error::other(format!("{operation} task failed: {e}")))
}

pub(super) async fn handshake(
    _request: HandshakeRequest,
    state: SharedState,
) -> std::result::Result<Response, Infallible> {
    info!("Handshake accepted");
    respond(Ok(HandshakeResponse {
        success: true,
        version: crate::VERSION.to_string(),
        site_name: state.config.site_name(),
        site_url: state.config.site_url(),
    }))
}

pub(super) async fn download(
    query: DownloadQuery,
    state: SharedState,
) -> std::result::Result<Response, Infallible> {
    Ok(match serve_artifact(query, state).await {
        Ok(response) => response,
        Err(e) => {
            warn!("Download failed: {}", e);
            error_reply(&e)
        }
    })
}

async fn serve_artifact(query: DownloadQuery, state: SharedState) -> Result<Response> {
    let kind: StepKind = query
        .file_type
        .as_deref()
        .ok_or_else(|| BridgeError::MalformedInput("file_type is required".to_string()))?
        .parse()?;

    let artifact = match state.packager.existing(kind) {
        Some(artifact) => artifact,
        None if state.config.bridge.repackage_missing => {
            info!("{} artifact missing, packaging it again", kind);
            let packager = state.packager.clone();
            tokio::task::spawn_blocking(move || packager.package(kind))
                .await
                .map_err(|e| task_failed("packaging", e))??
        }
        None => return Err(BridgeError::ArtifactNotFound(kind)),
    };

    let file = tokio::fs::File::open(&artifact.path)
        .await
        .map_err(|e| match e.kind() {
            ErrorKind::NotFound => BridgeError::ArtifactNotFound(kind),
            _ => BridgeError::Io(e),
        })?;
    info!("Sending {} ({})", kind.file_name(), artifact.human_size());

    let body = Body::wrap_stream(stream_then_delete(file, artifact.path.clone()));
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(kind.content_type()));
    let disposition = format!("attachment; filename=\"{}\"", kind.file_name());
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&disposition)
            .map_err(|e| BridgeError::Io(std::io::Error::other(e.to_string())))?,
    );
    headers.insert(
        CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(EXPIRES, HeaderValue::from_static("0"));
    headers.insert(ARTIFACT_SIZE_HEADER, HeaderValue::from(artifact.size_bytes));
    Ok(response)
}

/// Streams `file` and removes it once the last chunk has been handed to the connection.
/// A stream dropped early (client gone, read error) leaves the file in place.
fn stream_then_delete(
    file: tokio::fs::File,
    path: PathBuf,
) -> impl Stream<Item = std::io::Result<Bytes>> + Send + 'static {
    futures::stream::unfold(Some((file, path)), |state| async move {
        let (mut file, path) = state?;
        let mut buf = vec![0u8; DOWNLOAD_CHUNK];
        match file.read(&mut buf).await {
            Ok(0) => {
                drop(file);
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => info!("Artifact {} sent and removed", path.display()),
                    Err(e) => warn!("Could not remove {}: {}", path.display(), e),
                }
                None
            }
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(Bytes::from(buf)), Some((file, path))))
            }
            Err(e) => Some((Err(e), None)),
        }
    })
}

pub(super) async fn process_step(
    request: ProcessStepRequest,
    state: SharedState,
) -> std::result::Result<Response, Infallible> {
    respond(run_step(request, state).await)
}

async fn run_step(request: ProcessStepRequest, state: SharedState) -> Result<ProcessStepResponse> {
    let step: StepKind = request.step.parse()?;
    let permit = state.guard.try_begin("process_step")?;
    let worker = state.clone();
    let task = tokio::spawn(async move {
        let _permit = permit;
        worker
            .restorer
            .process_step(step, &request.source_url, &request.source_token)
            .await
    });
    let message = task
        .await
        .map_err(|e| BridgeError::step(step, format!("step task failed: {e}")))??;
    Ok(ProcessStepResponse {
        success: true,
        step: step.as_str().to_string(),
        message,
    })
}

/// Marks the migration finished once the canonical URL has moved.
fn mark_finished(state: &SharedState) -> Result<()> {
    let mut status = state.credentials.migration_status()?;
    status.status = MigrationState::Completed;
    status.current_step = None;
    status.error = None;
    status.last_update = Some(chrono::Utc::now().timestamp());
    state.credentials.save_migration_status(&status)
}

pub(super) async fn finalize(
    request: FinalizeRequest,
    state: SharedState,
) -> std::result::Result<Response, Infallible> {
    respond(run_finalize(request, state).await)
}

async fn run_finalize(request: FinalizeRequest, state: SharedState) -> Result<FinalizeResponse> {
    let old_url = normalize_origin(&request.old_url)?;
    let new_url = state.config.site_url();
    let permit = state.guard.try_begin("finalize_migration")?;

    let worker = state.clone();
    let (from, to) = (old_url.clone(), new_url.clone());
    let summary = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        let conn = worker.site.open_db()?;
        let summary =
            worker
                .rewriter
                .run_all(&conn, &from, &to, worker.config.bridge.batch_rows)?;
        worker.rewriter.complete(&conn, &to)?;
        mark_finished(&worker)?;
        Ok::<_, BridgeError>(summary)
    })
    .await
    .map_err(|e| task_failed("finalize", e))??;

    info!(
        "Finalized {} -> {}: {} rows updated in {} batches",
        old_url, new_url, summary.rows_updated, summary.batches
    );
    let mut message = format!("Migration finalized: {} rows updated.", summary.rows_updated);
    if summary.values_skipped > 0 {
        message.push_str(&format!(
            " {} values were left unchanged because they could not be rewritten safely.",
            summary.values_skipped
        ));
    }
    Ok(FinalizeResponse {
        success: true,
        old_url,
        new_url,
        rows_updated: summary.rows_updated,
        values_skipped: summary.values_skipped,
        message,
    })
}

pub(super) async fn finalize_batch(
    request: FinalizeBatchRequest,
    state: SharedState,
) -> std::result::Result<Response, Infallible> {
    respond(run_finalize_batch(request, state).await)
}

async fn run_finalize_batch(
    request: FinalizeBatchRequest,
    state: SharedState,
) -> Result<FinalizeBatchResponse> {
    let old_url = normalize_origin(&request.old_url)?;
    let new_url = state.config.site_url();
    let permit = state.guard.try_begin("finalize_migration_batch")?;
    let budget = BatchBudget {
        rows: state.config.bridge.batch_rows,
        time: state.config.batch_time_budget(),
    };

    let worker = state.clone();
    let to = new_url.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        let conn = worker.site.open_db()?;
        let outcome = worker.rewriter.run_batch(
            &conn,
            &old_url,
            &to,
            request.table_name.as_deref(),
            request.offset,
            budget,
        )?;
        if outcome.completed {
            worker.rewriter.complete(&conn, &to)?;
            mark_finished(&worker)?;
        }
        Ok::<_, BridgeError>(outcome)
    })
    .await
    .map_err(|e| task_failed("finalize batch", e))??;

    Ok(FinalizeBatchResponse {
        success: true,
        completed: outcome.completed,
        next_table_name: outcome.next_table,
        next_offset: outcome.next_offset,
        rows_updated: outcome.rows_updated,
        values_skipped: outcome.values_skipped,
        new_url: outcome.completed.then_some(new_url),
    })
}

pub(super) async fn cleanup(
    _request: CleanupRequest,
    state: SharedState,
) -> std::result::Result<Response, Infallible> {
    respond(run_cleanup(state).await)
}

async fn run_cleanup(state: SharedState) -> Result<CleanupResponse> {
    let permit = state.guard.try_begin("cleanup")?;
    let dir = state.config.bridge.temp_dir.clone();
    let removed = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        cleanup_dir(&dir)
    })
    .await
    .map_err(|e| task_failed("cleanup", e))??;
    Ok(CleanupResponse {
        success: true,
        message: format!("Temporary files cleaned up ({removed} removed)."),
    })
}

pub(super) async fn migration_status(
    state: SharedState,
) -> std::result::Result<Response, Infallible> {
    respond(state.credentials.migration_status())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn artifact(dir: &std::path::Path, len: usize) -> PathBuf {
        let path = dir.join("uploads.zip");
        std::fs::write(&path, vec![7u8; len]).unwrap();
        path
    }

    #[tokio::test]
    async fn test_dropped_download_keeps_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let path = artifact(dir.path(), DOWNLOAD_CHUNK * 3);
        let file = tokio::fs::File::open(&path).await.unwrap();

        let mut stream = Box::pin(stream_then_delete(file, path.clone()));
        let first = stream.next().await.unwrap().unwrap();
        assert!(!first.is_empty() && first.len() <= DOWNLOAD_CHUNK);
        drop(stream);

        assert!(path.exists());
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            (DOWNLOAD_CHUNK * 3) as u64
        );
    }

    #[tokio::test]
    async fn test_finished_download_removes_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let path = artifact(dir.path(), DOWNLOAD_CHUNK + 10);
        let file = tokio::fs::File::open(&path).await.unwrap();

        let chunks: Vec<Bytes> = stream_then_delete(file, path.clone())
            .map(|chunk| chunk.unwrap())
            .collect()
            .await;
        let total: usize = chunks.iter().map(Bytes::len).sum();
        assert_eq!(total, DOWNLOAD_CHUNK + 10);
        assert!(!path.exists());
    }
}
