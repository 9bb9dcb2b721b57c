//! JSON-over-HTTP control surface.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use super::Control;
use crate::supervise::WorkerSnapshot;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusEntry {
    pub program_name: String,
    pub process_number: usize,
    pub process_id: Option<u32>,
    pub state: String,
    pub start_time: Option<String>,
    pub restart_count: u32,
}

impl From<&WorkerSnapshot> for StatusEntry {
    fn from(snapshot: &WorkerSnapshot) -> Self {
        let start_time = snapshot
            .started_at
            .map(|at| DateTime::<Local>::from(at).to_rfc3339());
        Self {
            program_name: snapshot.program.clone(),
            process_number: snapshot.index,
            process_id: snapshot.pid,
            state: snapshot.state.as_str().to_string(),
            start_time,
            restart_count: snapshot.restart_count,
        }
    }
}

pub async fn serve(listener: TcpListener, control: Arc<Control>) {
    let token = control.shutdown_token();
    let app = router(control);
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await;
    if let Err(error) = result {
        tracing::warn!(%error, "http server terminated");
    }
}

pub fn router(control: Arc<Control>) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/programs/{name}/start", post(start))
        .route("/api/programs/{name}/stop", post(stop))
        .route("/api/programs/{name}/restart", post(restart))
        .route("/api/reload", post(reload))
        .route("/api/shutdown", post(shutdown))
        .with_state(control)
}

async fn status(State(control): State<Arc<Control>>) -> Json<Vec<StatusEntry>> {
    let snapshots = control.supervisor().status().await;
    Json(snapshots.iter().map(StatusEntry::from).collect())
}

async fn start(
    State(control): State<Arc<Control>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    ack(control.supervisor().start(&name).await.is_ok())
}

async fn stop(
    State(control): State<Arc<Control>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    ack(control.supervisor().stop(&name).await.is_ok())
}

async fn restart(
    State(control): State<Arc<Control>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    ack(control.supervisor().restart(&name).await.is_ok())
}

async fn reload(State(control): State<Arc<Control>>) -> impl IntoResponse {
    ack(control.reload().await.is_ok())
}

async fn shutdown(State(control): State<Arc<Control>>) -> impl IntoResponse {
    // The reply flushes before the graceful-shutdown drain closes the
    // server.
    control.begin_shutdown();
    (StatusCode::OK, "shutting down")
}

fn ack(ok: bool) -> (StatusCode, &'static str) {
    if ok {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "error")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervise::WorkerState;
    use std::time::{Duration, SystemTime};

    fn snapshot() -> WorkerSnapshot {
        WorkerSnapshot {
            program: "web".to_string(),
            index: 2,
            pid: Some(31337),
            state: WorkerState::Running,
            started_at: Some(SystemTime::now()),
            uptime: Some(Duration::from_secs(5)),
            restart_count: 1,
        }
    }

    #[test]
    fn status_entry_uses_camel_case_field_names() {
        let entry = StatusEntry::from(&snapshot());
        let json = serde_json::to_value(&entry).expect("serializes");

        assert_eq!(json["programName"], "web");
        assert_eq!(json["processNumber"], 2);
        assert_eq!(json["processId"], 31337);
        assert_eq!(json["state"], "Running");
        assert_eq!(json["restartCount"], 1);
        assert!(json["startTime"].is_string());
    }

    #[test]
    fn status_entry_round_trips_through_json() {
        let entry = StatusEntry::from(&snapshot());
        let json = serde_json::to_string(&entry).expect("serializes");
        let back: StatusEntry = serde_json::from_str(&json).expect("deserializes");
        let json_again = serde_json::to_string(&back).expect("re-serializes");
        assert_eq!(json, json_again);
    }

    #[test]
    fn idle_worker_has_no_process_id() {
        let mut idle = snapshot();
        idle.pid = None;
        idle.started_at = None;
        let entry = StatusEntry::from(&idle);
        assert_eq!(entry.process_id, None);
        assert_eq!(entry.start_time, None);
    }
}
