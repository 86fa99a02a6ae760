//! The streaming RPC surface (spec.md §6/§10.6): five operations mapped
//! onto an `axum::Router` bound to an ephemeral loopback port. The wire
//! framing itself is an implementation detail filled in to make the crate
//! buildable and testable — per spec.md §1 it is not a load-bearing
//! contract of the core.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::{Router, http::StatusCode};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::actor::{ALREADY_INDEXING, IndexProgress, ProjectStatus};
use crate::path::AbsDirPath;
use crate::server::{DaemonStatus, LogEntry, Server};

/// Build the router for the daemon's RPC surface.
pub fn router(server: Arc<Server>) -> Router {
    Router::new()
        .route("/api/v1/index", post(index))
        .route("/api/v1/status", get(status))
        .route("/api/v1/logs", get(logs))
        .route("/api/v1/projects/unregister", post(unregister))
        .route("/api/v1/shutdown", post(shutdown))
        .layer(TraceLayer::new_for_http())
        .with_state(server)
}

/// A structured error body preserving the underlying message, per spec.md
/// §7's propagation rule ("The Server translates internal errors into RPC
/// error responses, preserving the underlying message").
struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

impl From<color_eyre::Report> for ApiError {
    fn from(err: color_eyre::Report) -> Self {
        let message = err.to_string();
        let status = if message == ALREADY_INDEXING {
            StatusCode::CONFLICT
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        ApiError(status, message)
    }
}

fn parse_absolute_dir(path: &str) -> Result<AbsDirPath, ApiError> {
    AbsDirPath::try_from(path).map_err(|err| ApiError(StatusCode::BAD_REQUEST, err.to_string()))
}

#[derive(Debug, Deserialize)]
struct IndexRequest {
    project_path: String,
}

/// `Index({project_path}) → stream IndexProgress` (spec.md §6 op 1).
#[instrument(name = "rpc::index", skip(server))]
async fn index(
    State(server): State<Arc<Server>>,
    Json(request): Json<IndexRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let project_path = parse_absolute_dir(&request.project_path)?;

    let actor = server.get_or_create_actor(&project_path).await?;
    server.log(project_path.as_str_lossy(), "INFO", "index requested");

    let subscriber_id = Uuid::new_v4().to_string();
    let progress_rx = actor.subscribe_progress(subscriber_id.clone());

    let kickoff = {
        let actor = actor.clone();
        tokio::spawn(async move { actor.index().await })
    };

    let initial: Result<IndexProgress, ApiError> = match kickoff.await {
        Ok(Ok(progress)) => Ok(progress),
        Ok(Err(err)) => Err(err.into()),
        Err(join_err) => Err(ApiError(StatusCode::INTERNAL_SERVER_ERROR, join_err.to_string())),
    };
    actor.unsubscribe_progress(&subscriber_id);

    match &initial {
        Ok(_) => server.log(project_path.as_str_lossy(), "INFO", "index complete"),
        Err(err) => server.log(project_path.as_str_lossy(), "ERROR", format!("index failed: {}", err.1)),
    }

    // Drain whatever progress frames the subscriber collected during the
    // run (spec.md §4.9 broadcasts `PHASE_COMPLETE`), then emit the final
    // terminal frame (success or error) and end the stream.
    let mut buffered: Vec<IndexProgress> = Vec::new();
    while let Ok(progress) = progress_rx.try_recv() {
        buffered.push(progress);
    }

    let events = buffered
        .into_iter()
        .map(|progress| Ok(Event::default().json_data(progress).unwrap_or_default()))
        .chain(std::iter::once(match initial {
            Ok(progress) => Ok(Event::default().json_data(progress).unwrap_or_default()),
            Err(err) => Ok(Event::default().event("error").data(err.1)),
        }));

    Ok(Sse::new(stream::iter(events)).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    daemon: DaemonStatus,
    projects: Vec<ProjectStatus>,
}

/// `GetStatus() → {Daemon, Projects[]}` (spec.md §6 op 2).
#[instrument(name = "rpc::status", skip(server))]
async fn status(State(server): State<Arc<Server>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        daemon: server.daemon_status(),
        projects: server.status_of_all_projects().await,
    })
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    project_path: Option<String>,
    #[serde(default)]
    follow: bool,
}

/// `StreamLogs({project_path?, follow}) → stream LogEntry` (spec.md §6 op 3).
///
/// When `follow` is false, returns the buffered ring as a single JSON
/// array. When true, keeps the connection open as an SSE stream of new
/// entries until the client disconnects or the server shuts down.
#[instrument(name = "rpc::logs", skip(server))]
async fn logs(State(server): State<Arc<Server>>, Query(query): Query<LogsQuery>) -> Result<Response, ApiError> {
    if let Some(path) = &query.project_path {
        parse_absolute_dir(path)?;
    }

    let buffered = server.collect_buffered_logs(query.project_path.as_deref());

    if !query.follow {
        return Ok(Json(buffered).into_response());
    }

    let subscriber_id = Uuid::new_v4().to_string();
    let rx = server.subscribe_logs(subscriber_id.clone());
    let project_filter = query.project_path.clone();
    let shutdown = server.shutdown_signal();

    let backlog = stream::iter(buffered.into_iter().map(entry_to_event));
    let live = stream::unfold(
        (rx, shutdown, project_filter, server.clone(), subscriber_id),
        |(rx, mut shutdown, project_filter, server, subscriber_id)| async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            server.unsubscribe_logs(&subscriber_id);
                            return None;
                        }
                    }
                    received = rx.recv_async() => {
                        match received {
                            Ok(entry) if project_filter.as_deref().is_none_or(|p| entry.project == p) => {
                                let event = entry_to_event(entry);
                                return Some((event, (rx, shutdown, project_filter, server, subscriber_id)));
                            }
                            Ok(_) => continue,
                            Err(_) => {
                                server.unsubscribe_logs(&subscriber_id);
                                return None;
                            }
                        }
                    }
                }
            }
        },
    );

    let combined = backlog.chain(live);
    Ok(Sse::new(combined)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response())
}

fn entry_to_event(entry: LogEntry) -> Result<Event, Infallible> {
    Ok(Event::default().json_data(entry).unwrap_or_default())
}

#[derive(Debug, Deserialize)]
struct UnregisterRequest {
    project_path: String,
    #[serde(default)]
    remove_cache: bool,
}

#[derive(Debug, Serialize)]
struct UnregisterResponse {
    success: bool,
    message: String,
}

/// `UnregisterProject({project_path, remove_cache}) → {success, message}`
/// (spec.md §6 op 4).
#[instrument(name = "rpc::unregister", skip(server))]
async fn unregister(
    State(server): State<Arc<Server>>,
    Json(request): Json<UnregisterRequest>,
) -> Result<Json<UnregisterResponse>, ApiError> {
    let project_path = parse_absolute_dir(&request.project_path)?;
    let message = server.unregister_project(&project_path, request.remove_cache).await?;
    Ok(Json(UnregisterResponse { success: true, message }))
}

#[derive(Debug, Serialize)]
struct ShutdownResponse {
    success: bool,
    message: String,
}

/// `Shutdown() → {success, message}` (spec.md §6 op 5).
#[instrument(name = "rpc::shutdown", skip(server))]
async fn shutdown(State(server): State<Arc<Server>>) -> Json<ShutdownResponse> {
    info!("shutdown requested over rpc");
    server.shutdown_internal().await;
    Json(ShutdownResponse {
        success: true,
        message: "shutting down".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::Request;
    use pretty_assertions::assert_eq;
    use tower::ServiceExt;

    use super::*;
    use crate::indexer::{NullEmbedder, NullIndexer};
    use crate::registry::Registry;

    async fn test_app() -> (Router, tempfile::TempDir, tempfile::TempDir) {
        let cortex_dir = tempfile::tempdir().expect("tempdir");
        let cache_root_dir = tempfile::tempdir().expect("tempdir");
        let cortex_path = AbsDirPath::try_from(cortex_dir.path().to_path_buf()).unwrap();
        let cache_root = AbsDirPath::try_from(cache_root_dir.path().to_path_buf()).unwrap();
        let registry = Registry::load(cortex_path).await.expect("load registry");
        let server = Arc::new(Server::new(
            "127.0.0.1:0".to_string(),
            cache_root,
            registry,
            Arc::new(NullIndexer::default()),
            Arc::new(NullEmbedder),
        ));
        (router(server), cortex_dir, cache_root_dir)
    }

    #[test_log::test(tokio::test)]
    async fn status_reports_empty_projects_initially() {
        let (app, _cortex, _cache) = test_app().await;
        let response = app
            .oneshot(Request::get("/api/v1/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test_log::test(tokio::test)]
    async fn index_rejects_relative_path() {
        let (app, _cortex, _cache) = test_app().await;
        let body = serde_json::to_vec(&json!({ "project_path": "relative/path" })).unwrap();
        let response = app
            .oneshot(
                Request::post("/api/v1/index")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test_log::test(tokio::test)]
    async fn unregister_unknown_project_succeeds_idempotently() {
        let (app, _cortex, _cache) = test_app().await;
        let project = tempfile::tempdir().expect("tempdir");
        let body = serde_json::to_vec(&json!({
            "project_path": project.path().to_string_lossy(),
            "remove_cache": false,
        }))
        .unwrap();

        let response = app
            .oneshot(
                Request::post("/api/v1/projects/unregister")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test_log::test(tokio::test)]
    async fn shutdown_reports_success() {
        let (app, _cortex, _cache) = test_app().await;
        let response = app
            .oneshot(Request::post("/api/v1/shutdown").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
