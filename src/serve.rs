//! Read-only HTTP view of a running supervisor.
use crate::config::WatchdogConfig;
use crate::heartbeat::HeartbeatLog;
use crate::status::StatusFile;
use std::path::PathBuf;
use std::sync::Arc;

/// Default and maximum number of entries returned by `/api/segments`.
const DEFAULT_SEGMENT_LIMIT: usize = 20;
const MAX_SEGMENT_LIMIT: usize = 500;

#[derive(Clone)]
struct AppState {
    status_path: PathBuf,
    log_path: PathBuf,
}

#[derive(Debug, serde::Deserialize)]
struct SegmentQuery {
    limit: Option<usize>,
}

fn router(state: AppState) -> axum::Router {
    use axum::routing::get;
    use tower_http::cors::CorsLayer;

    axum::Router::new()
        .route("/api/health", get(health))
        .route("/api/status", get(api_status))
        .route("/api/segments", get(api_segments))
        .with_state(Arc::new(state))
        .layer(CorsLayer::permissive())
}

pub async fn run(config: &WatchdogConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let state = AppState {
        status_path: config.status_path(),
        log_path: config.log_path(),
    };

    let addr = format!("{}:{}", config.serve.bind, config.serve.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!("serve listening on {local_addr}");

    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn health() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({"ok": true}))
}

async fn api_status(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> Result<axum::Json<serde_json::Value>, axum::http::StatusCode> {
    let status = StatusFile::new(state.status_path.clone())
        .read()
        .map_err(|e| {
            tracing::warn!(error = %e, "serve: cannot read status file");
            axum::http::StatusCode::INTERNAL_SERVER_ERROR
        })?;
    match status {
        Some(data) => serde_json::to_value(data)
            .map(axum::Json)
            .map_err(|_| axum::http::StatusCode::INTERNAL_SERVER_ERROR),
        None => Ok(axum::Json(serde_json::json!({"state": "stopped"}))),
    }
}

async fn api_segments(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
    axum::extract::Query(query): axum::extract::Query<SegmentQuery>,
) -> Result<axum::Json<Vec<crate::heartbeat::LogEntry>>, axum::http::StatusCode> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_SEGMENT_LIMIT)
        .min(MAX_SEGMENT_LIMIT);
    // No log yet is an empty list, not an error.
    if !state.log_path.exists() {
        return Ok(axum::Json(Vec::new()));
    }
    let log = HeartbeatLog::open(state.log_path.clone())
        .map_err(|_| axum::http::StatusCode::INTERNAL_SERVER_ERROR)?;
    let mut entries = log
        .tail(limit)
        .map_err(|_| axum::http::StatusCode::INTERNAL_SERVER_ERROR)?;
    entries.reverse();
    Ok(axum::Json(entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heartbeat::{LogEntry, TIMESTAMP_FORMAT};
    use crate::status::{StatusData, SupervisorState};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::NaiveDateTime;
    use tempfile::tempdir;
    use tower::ServiceExt;

    async fn get_json(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn state(dir: &std::path::Path) -> AppState {
        AppState {
            status_path: dir.join("watchdog.status"),
            log_path: dir.join("heartbeat.log"),
        }
    }

    #[tokio::test]
    async fn test_health() {
        let dir = tempdir().unwrap();
        let (code, body) = get_json(router(state(dir.path())), "/api/health").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn test_status_without_file_reports_stopped() {
        let dir = tempdir().unwrap();
        let (code, body) = get_json(router(state(dir.path())), "/api/status").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["state"], "stopped");
    }

    #[tokio::test]
    async fn test_status_reflects_file() {
        let dir = tempdir().unwrap();
        let st = state(dir.path());
        StatusFile::new(st.status_path.clone())
            .write(&StatusData {
                pid: 1,
                state: SupervisorState::Restarting,
                session_pid: None,
                session_started_at: None,
                session_token: None,
                restarts: 4,
                consecutive_failures: 2,
                last_segment: None,
                last_segment_at: None,
                last_update: chrono::Utc::now(),
            })
            .unwrap();

        let (_, body) = get_json(router(st), "/api/status").await;
        assert_eq!(body["state"], "restarting");
        assert_eq!(body["restarts"], 4);
        assert_eq!(body["consecutive_failures"], 2);
    }

    #[tokio::test]
    async fn test_segments_newest_first_with_limit() {
        let dir = tempdir().unwrap();
        let st = state(dir.path());
        let log = HeartbeatLog::open(st.log_path.clone()).unwrap();
        for (i, ts) in ["2024-01-01 10:00:00", "2024-01-01 10:00:15", "2024-01-01 10:00:30"]
            .iter()
            .enumerate()
        {
            log.append(&LogEntry::new(
                format!("seg_a_{i:05}.mp4"),
                NaiveDateTime::parse_from_str(ts, TIMESTAMP_FORMAT).unwrap(),
            ))
            .unwrap();
        }

        let (code, body) = get_json(router(st), "/api/segments?limit=2").await;
        assert_eq!(code, StatusCode::OK);
        let items = body.as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["filename"], "seg_a_00002.mp4");
        assert_eq!(items[1]["filename"], "seg_a_00001.mp4");
    }

    #[tokio::test]
    async fn test_segments_without_log_is_empty() {
        let dir = tempdir().unwrap();
        let (code, body) = get_json(router(state(dir.path())), "/api/segments").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body, serde_json::json!([]));
    }
}
