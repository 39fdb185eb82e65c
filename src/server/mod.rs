// ABOUTME: warp HTTP surface of a bridge host (handshake, download, steps, finalize, cleanup, status)
// ABOUTME: Bearer tokens and site role are checked in a filter before any handler runs

mod handlers;

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::{debug, info};
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::config::BridgeConfig;
use crate::credentials::CredentialStore;
use crate::error::{BridgeError, Result};
use crate::guard::MigrationGuard;
use crate::packager::Packager;
use crate::remote::models::{Authenticated, ErrorBody};
use crate::restore::Restorer;
use crate::rewrite::Rewriter;
use crate::site::Site;
use crate::store::OptionStore;
use crate::types::Role;

const MAX_JSON_BODY: u64 = 64 * 1024;

/// Which secret a request must present.
#[derive(Debug, Clone, Copy)]
enum Authority {
    /// Token half of the migration key this destination generated.
    MigrationKey,
    /// Token this source hands to its destination for downloads.
    SourceToken,
}

/// Services shared by every request, built once at startup.
pub struct AppState {
    pub config: BridgeConfig,
    pub credentials: CredentialStore,
    pub site: Site,
    pub packager: Packager,
    pub restorer: Restorer,
    pub rewriter: Rewriter,
    pub guard: MigrationGuard,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(config: BridgeConfig, store: Arc<dyn OptionStore>) -> Self {
        let credentials = CredentialStore::new(store);
        let site = Site::from_config(&config.site);
        let temp_dir = config.bridge.temp_dir.clone();
        Self {
            packager: Packager::new(site.clone(), &temp_dir),
            restorer: Restorer::new(
                site.clone(),
                &temp_dir,
                credentials.clone(),
                config.timeouts.clone(),
                config.bridge.stale_migration_secs,
            ),
            rewriter: Rewriter::new(site.clone()),
            guard: MigrationGuard::new(),
            credentials,
            site,
            config,
        }
    }

    fn authorize(&self, role: Role, authority: Authority, token: Option<&str>) -> Result<()> {
        match authority {
            Authority::MigrationKey => self.credentials.verify_token(token)?,
            Authority::SourceToken => self.credentials.verify_source_token(token)?,
        }
        self.credentials.require_role(role)
    }
}

#[derive(Debug)]
struct ApiRejection(BridgeError);

impl warp::reject::Reject for ApiRejection {}

fn with_state(state: SharedState) -> impl Filter<Extract = (SharedState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

fn json_body<T: DeserializeOwned + Send>() -> impl Filter<Extract = (T,), Error = Rejection> + Clone {
    warp::body::content_length_limit(MAX_JSON_BODY).and(warp::body::json())
}

/// Extracts `T` and lets it through only if its token and this host's role check out.
fn authorized<F, T>(
    extract: F,
    state: SharedState,
    role: Role,
    authority: Authority,
) -> impl Filter<Extract = (T,), Error = Rejection> + Clone
where
    F: Filter<Extract = (T,), Error = Rejection> + Clone + Send + Sync + 'static,
    T: Authenticated + Send + 'static,
{
    extract
        .and(with_state(state))
        .and_then(move |request: T, state: SharedState| async move {
            match state.authorize(role, authority, request.token()) {
                Ok(()) => Ok(request),
                Err(e) => {
                    debug!("Rejected request: {}", e);
                    Err(warp::reject::custom(ApiRejection(e)))
                }
            }
        })
}

pub(crate) fn error_reply(err: &BridgeError) -> warp::reply::Response {
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = ErrorBody {
        code: err.code().to_string(),
        message: err.to_string(),
    };
    warp::reply::with_status(warp::reply::json(&body), status).into_response()
}

fn plain_error(status: StatusCode, code: &str, message: String) -> warp::reply::Response {
    let body = ErrorBody {
        code: code.to_string(),
        message,
    };
    warp::reply::with_status(warp::reply::json(&body), status).into_response()
}

async fn handle_rejection(err: Rejection) -> std::result::Result<warp::reply::Response, Infallible> {
    if let Some(ApiRejection(e)) = err.find::<ApiRejection>() {
        return Ok(error_reply(e));
    }
    if err.is_not_found() {
        return Ok(plain_error(
            StatusCode::NOT_FOUND,
            "not_found",
            "No such bridge operation".to_string(),
        ));
    }
    if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        return Ok(plain_error(
            StatusCode::BAD_REQUEST,
            "invalid_input",
            format!("Invalid request body: {e}"),
        ));
    }
    if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
        return Ok(plain_error(
            StatusCode::BAD_REQUEST,
            "invalid_input",
            format!("Invalid query: {e}"),
        ));
    }
    if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        return Ok(plain_error(
            StatusCode::PAYLOAD_TOO_LARGE,
            "invalid_input",
            "Request body too large".to_string(),
        ));
    }
    if err.find::<warp::reject::LengthRequired>().is_some() {
        return Ok(plain_error(
            StatusCode::LENGTH_REQUIRED,
            "invalid_input",
            "Request body needs a Content-Length".to_string(),
        ));
    }
    if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        return Ok(plain_error(
            StatusCode::METHOD_NOT_ALLOWED,
            "method_not_allowed",
            "Method not allowed".to_string(),
        ));
    }
    Ok(plain_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal_error",
        format!("Unhandled rejection: {err:?}"),
    ))
}

/// All bridge routes under `/bridge/v1/`.
pub fn routes(
    state: SharedState,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let api = warp::path("bridge").and(warp::path("v1"));

    let handshake = api
        .and(warp::path("handshake"))
        .and(warp::path::end())
        .and(warp::post())
        .and(authorized(
            json_body(),
            state.clone(),
            Role::Destination,
            Authority::MigrationKey,
        ))
        .and(with_state(state.clone()))
        .and_then(handlers::handshake);

    let download = api
        .and(warp::path("download"))
        .and(warp::path::end())
        .and(warp::get())
        .and(authorized(
            warp::query(),
            state.clone(),
            Role::Source,
            Authority::SourceToken,
        ))
        .and(with_state(state.clone()))
        .and_then(handlers::download);

    let process_step = api
        .and(warp::path("process_step"))
        .and(warp::path::end())
        .and(warp::post())
        .and(authorized(
            json_body(),
            state.clone(),
            Role::Destination,
            Authority::MigrationKey,
        ))
        .and(with_state(state.clone()))
        .and_then(handlers::process_step);

    let finalize = api
        .and(warp::path("finalize_migration"))
        .and(warp::path::end())
        .and(warp::post())
        .and(authorized(
            json_body(),
            state.clone(),
            Role::Destination,
            Authority::MigrationKey,
        ))
        .and(with_state(state.clone()))
        .and_then(handlers::finalize);

    let finalize_batch = api
        .and(warp::path("finalize_migration_batch"))
        .and(warp::path::end())
        .and(warp::post())
        .and(authorized(
            json_body(),
            state.clone(),
            Role::Destination,
            Authority::MigrationKey,
        ))
        .and(with_state(state.clone()))
        .and_then(handlers::finalize_batch);

    let cleanup = api
        .and(warp::path("cleanup"))
        .and(warp::path::end())
        .and(warp::post())
        .and(authorized(
            json_body(),
            state.clone(),
            Role::Destination,
            Authority::MigrationKey,
        ))
        .and(with_state(state.clone()))
        .and_then(handlers::cleanup);

    let status = api
        .and(warp::path("migration_status"))
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state))
        .and_then(handlers::migration_status);

    handshake
        .or(download)
        .unify()
        .or(process_step)
        .unify()
        .or(finalize)
        .unify()
        .or(finalize_batch)
        .unify()
        .or(cleanup)
        .unify()
        .or(status)
        .unify()
        .recover(handle_rejection)
        .unify()
        .with(warp::trace::request())
}

/// Binds `addr` (port 0 picks a free one) and returns the bound address plus the server future.
pub fn bind(
    state: SharedState,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(SocketAddr, impl Future<Output = ()>)> {
    let (bound, server) = warp::serve(routes(state))
        .try_bind_with_graceful_shutdown(addr, shutdown)
        .map_err(|e| BridgeError::Config(format!("failed to bind {addr}: {e}")))?;
    info!("Bridge API listening on http://{}", bound);
    Ok((bound, server))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SiteConfig;
    use crate::remote::models::{FinalizeBatchResponse, HandshakeResponse, ARTIFACT_SIZE_HEADER};
    use crate::store::MemoryOptionStore;
    use crate::types::{MigrationStatus, StepKind};
    use std::path::Path;

    fn state(dir: &Path, role: Role) -> SharedState {
        let mut config = BridgeConfig {
            site: SiteConfig {
                url: "https://dest.test/".to_string(),
                name: "Dest Site".to_string(),
                database: dir.join("site.db"),
                plugins_dir: dir.join("plugins"),
                themes_dir: dir.join("themes"),
                uploads_dir: dir.join("uploads"),
                ..SiteConfig::default()
            },
            ..BridgeConfig::default()
        };
        config.bridge.temp_dir = dir.join("temp");
        let state = AppState::new(config, Arc::new(MemoryOptionStore::new()));
        state.credentials.set_role(role).unwrap();
        Arc::new(state)
    }

    fn destination_token(state: &SharedState) -> String {
        state
            .credentials
            .generate_migration_key(&state.config.site_url())
            .unwrap();
        state.credentials.migration_key().unwrap().unwrap().token
    }

    fn error_code(body: &[u8]) -> String {
        serde_json::from_slice::<ErrorBody>(body).unwrap().code
    }

    #[tokio::test]
    async fn test_handshake_distinguishes_missing_and_invalid_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path(), Role::Destination);
        let token = destination_token(&state);
        let api = routes(state);

        let missing = warp::test::request()
            .method("POST")
            .path("/bridge/v1/handshake")
            .json(&serde_json::json!({}))
            .reply(&api)
            .await;
        assert_eq!(missing.status(), 400);
        assert_eq!(error_code(missing.body()), "missing_token");

        let invalid = warp::test::request()
            .method("POST")
            .path("/bridge/v1/handshake")
            .json(&serde_json::json!({ "token": "wrong" }))
            .reply(&api)
            .await;
        assert_eq!(invalid.status(), 403);
        assert_eq!(error_code(invalid.body()), "invalid_token");

        let ok = warp::test::request()
            .method("POST")
            .path("/bridge/v1/handshake")
            .json(&serde_json::json!({ "token": token }))
            .reply(&api)
            .await;
        assert_eq!(ok.status(), 200);
        let body: HandshakeResponse = serde_json::from_slice(ok.body()).unwrap();
        assert!(body.success);
        assert_eq!(body.site_name, "Dest Site");
        assert_eq!(body.site_url, "https://dest.test");
    }

    #[tokio::test]
    async fn test_download_requires_source_role() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path(), Role::Source);
        let token = state.credentials.source_token().unwrap();
        state.credentials.set_role(Role::Destination).unwrap();
        let api = routes(state);

        let res = warp::test::request()
            .path(&format!(
                "/bridge/v1/download?file_type=database&token={token}"
            ))
            .reply(&api)
            .await;
        assert_eq!(res.status(), 403);
        assert_eq!(error_code(res.body()), "wrong_role");
    }

    #[tokio::test]
    async fn test_download_streams_then_deletes_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path(), Role::Source);
        let token = state.credentials.source_token().unwrap();
        {
            let conn = state.site.open_db().unwrap();
            conn.execute_batch("CREATE TABLE posts (id INTEGER PRIMARY KEY, body TEXT);")
                .unwrap();
        }
        let artifact = state.packager.package(StepKind::Database).unwrap();
        let api = routes(state);

        let res = warp::test::request()
            .path(&format!(
                "/bridge/v1/download?file_type=database&token={token}"
            ))
            .reply(&api)
            .await;
        assert_eq!(res.status(), 200);
        assert_eq!(
            res.headers()[ARTIFACT_SIZE_HEADER].to_str().unwrap(),
            artifact.size_bytes.to_string()
        );
        let body = String::from_utf8(res.body().to_vec()).unwrap();
        assert!(body.contains("CREATE TABLE"));
        assert!(!artifact.path.exists());
    }

    #[tokio::test]
    async fn test_missing_artifact_without_repackaging_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BridgeConfig {
            site: SiteConfig {
                database: dir.path().join("site.db"),
                ..SiteConfig::default()
            },
            ..BridgeConfig::default()
        };
        config.bridge.temp_dir = dir.path().join("temp");
        config.bridge.repackage_missing = false;
        let state = AppState::new(config, Arc::new(MemoryOptionStore::new()));
        let token = state.credentials.source_token().unwrap();
        let api = routes(Arc::new(state));

        let res = warp::test::request()
            .path(&format!("/bridge/v1/download?file_type=uploads&token={token}"))
            .reply(&api)
            .await;
        assert_eq!(res.status(), 404);
        assert_eq!(error_code(res.body()), "artifact_not_found");

        let res = warp::test::request()
            .path(&format!("/bridge/v1/download?file_type=media&token={token}"))
            .reply(&api)
            .await;
        assert_eq!(res.status(), 400);
        assert_eq!(error_code(res.body()), "invalid_input");
    }

    #[tokio::test]
    async fn test_finalize_batch_rejected_while_busy() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path(), Role::Destination);
        let token = destination_token(&state);
        let held = state.guard.try_begin("process_step").unwrap();
        let api = routes(state.clone());

        let body = serde_json::json!({ "old_url": "https://src.test", "token": token });
        let res = warp::test::request()
            .method("POST")
            .path("/bridge/v1/finalize_migration_batch")
            .json(&body)
            .reply(&api)
            .await;
        assert_eq!(res.status(), 409);
        assert_eq!(error_code(res.body()), "migration_in_progress");

        drop(held);
        let res = warp::test::request()
            .method("POST")
            .path("/bridge/v1/finalize_migration_batch")
            .json(&body)
            .reply(&api)
            .await;
        assert_eq!(res.status(), 200);
        let outcome: FinalizeBatchResponse = serde_json::from_slice(res.body()).unwrap();
        assert!(outcome.completed);
        assert_eq!(outcome.new_url.as_deref(), Some("https://dest.test"));

        let conn = state.site.open_db().unwrap();
        assert_eq!(
            state.site.canonical_url(&conn).unwrap().as_deref(),
            Some("https://dest.test")
        );
    }

    #[tokio::test]
    async fn test_status_is_public_and_unknown_routes_are_json() {
        let dir = tempfile::tempdir().unwrap();
        let api = routes(state(dir.path(), Role::Destination));

        let res = warp::test::request()
            .path("/bridge/v1/migration_status")
            .reply(&api)
            .await;
        assert_eq!(res.status(), 200);
        let status: MigrationStatus = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(status, MigrationStatus::default());

        let res = warp::test::request()
            .path("/bridge/v1/nope")
            .reply(&api)
            .await;
        assert_eq!(res.status(), 404);
        assert_eq!(error_code(res.body()), "not_found");
    }
}
