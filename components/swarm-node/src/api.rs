use crate::types::*;
use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Router,
};
use base64::{engine::general_purpose, Engine as _};
use hive::{HardwareUsage, PoolError, Task};
use std::sync::Arc;
use synapse::{LinkError, SessionId};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Link(e) => match e {
                LinkError::UnknownPeer(_) => StatusCode::NOT_FOUND,
                LinkError::ChannelUnavailable | LinkError::RelayClosed => StatusCode::SERVICE_UNAVAILABLE,
                LinkError::DuplicateRequest(_) => StatusCode::CONFLICT,
                _ => StatusCode::BAD_GATEWAY,
            },
            ApiError::Pool(e) => match e {
                PoolError::TaskTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                PoolError::UploadFailed { .. } | PoolError::TaskExecution { .. } => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                PoolError::PoolClosed => StatusCode::SERVICE_UNAVAILABLE,
                PoolError::Spawn(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!("request failed: {self}");
        }
        (status, Json(ErrorResponse { error: self.to_string() })).into_response()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(dashboard))
        .route("/api/v1/peers", get(list_peers))
        .route("/api/v1/peers/:id/programs", post(upload_program))
        .route("/api/v1/peers/:id/tasks", post(execute_task))
        .route("/api/v1/usage", get(local_usage))
        .with_state(state)
}

async fn list_peers(State(state): State<Arc<AppState>>) -> Json<PeersResponse> {
    Json(PeersResponse {
        version: VERSION,
        local: state.mesh.local().clone(),
        peers: state.mesh.table().snapshot(),
    })
}

async fn local_usage(State(state): State<Arc<AppState>>) -> Json<HardwareUsage> {
    Json(state.pool.query_usage().await)
}

/// Uploads to a connected peer, or to our own pool when the id is ours.
async fn upload_program(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<UploadRequest>,
) -> Result<(StatusCode, Json<UploadResponse>), ApiError> {
    let code = general_purpose::STANDARD
        .decode(payload.code.as_bytes())
        .map_err(|e| ApiError::BadRequest(format!("code is not base64: {e}")))?;
    let peer = SessionId::from(id);

    if &peer == state.mesh.local() {
        state.pool.upload_program(&payload.prog_id, code).await?;
    } else {
        let link = state.mesh.link(&peer).await?;
        link.upload_program(&payload.prog_id, &code).await?;
    }

    info!(%peer, prog = %payload.prog_id, "program uploaded");
    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            prog_id: payload.prog_id,
            status: "created",
        }),
    ))
}

async fn execute_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<TaskRequest>,
) -> Result<Json<TaskResponse>, ApiError> {
    let task_id = payload.task_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let task = Task::new(payload.prog_id, task_id.clone(), payload.func_args);
    let peer = SessionId::from(id);

    let result = if &peer == state.mesh.local() {
        state.pool.enqueue_task(task).await?
    } else {
        let link = state.mesh.link(&peer).await?;
        link.execute(task).await?
    };

    Ok(Json(TaskResponse { task_id, result }))
}

async fn dashboard(State(state): State<Arc<AppState>>) -> Html<String> {
    Html(format!(
        r#"
        <div style="font-family: sans-serif; padding: 2rem;">
            <h1>Swarm Node</h1>
            <p><strong>Version:</strong> v{VERSION}</p>
            <p><strong>Session:</strong> <code>{local}</code></p>
            <hr>
            <h3>Peers</h3>
            <table id="peers" cellpadding="6">
                <tr><th>Peer</th><th>Status</th><th>Route</th><th>CPU</th><th>Up (kbit/s)</th><th>Down (kbit/s)</th></tr>
            </table>
            <h3>Available API Endpoints:</h3>
            <ul>
                <li><strong>GET</strong> <code>/api/v1/peers</code> - Connected peers and their telemetry</li>
                <li><strong>POST</strong> <code>/api/v1/peers/:id/programs</code> - Upload a program to a peer</li>
                <li><strong>POST</strong> <code>/api/v1/peers/:id/tasks</code> - Run a task on a peer</li>
                <li><strong>GET</strong> <code>/api/v1/usage</code> - Local hardware usage</li>
            </ul>
        </div>
        <script>
            async function refresh() {{
                const res = await fetch('/api/v1/peers');
                const body = await res.json();
                const table = document.getElementById('peers');
                while (table.rows.length > 1) table.deleteRow(1);
                for (const p of body.peers) {{
                    const row = table.insertRow();
                    const conn = p.connection || {{}};
                    const pair = conn.pair ? conn.pair.local + ' / ' + conn.pair.remote : '';
                    const cpu = p.hardware ? p.hardware.cpus_usage.toFixed(1) : '';
                    const up = p.traffic ? (p.traffic.up / 1000).toFixed(1) : '';
                    const down = p.traffic ? (p.traffic.down / 1000).toFixed(1) : '';
                    for (const cell of [p.peerId, conn.status || '', pair, cpu, up, down]) {{
                        row.insertCell().textContent = cell;
                    }}
                }}
            }}
            refresh();
            setInterval(refresh, 1000);
        </script>
    "#,
        local = state.mesh.local(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive::{PoolConfig, UnitFactory, WorkerPool};
    use judge::{ExecutionUnit, Judge};
    use serde_json::json;
    use synapse::transport::MemoryNetwork;
    use synapse::{Mesh, MeshConfig};
    use tokio::sync::mpsc;

    fn state() -> (Arc<AppState>, mpsc::UnboundedSender<synapse::SignalMessage>) {
        let factory: UnitFactory = Arc::new(|| Box::new(Judge::with_builtins()) as Box<dyn ExecutionUnit>);
        let pool = Arc::new(WorkerPool::new(PoolConfig::with_size(1), factory).unwrap());
        let (relay, _sent) = mpsc::unbounded_channel();
        let (mesh, handle) = Mesh::new(
            "local".into(),
            MeshConfig::default(),
            Arc::new(MemoryNetwork::new()),
            pool.clone(),
            relay,
        );
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        tokio::spawn(mesh.run(inbound));
        (Arc::new(AppState { mesh: handle, pool }), inbound_tx)
    }

    #[tokio::test]
    async fn test_local_upload_and_execute() {
        let (state, _inbound) = state();
        let code = general_purpose::STANDARD.encode("native:sha512x5000");

        let (status, _) = upload_program(
            State(state.clone()),
            Path("local".to_string()),
            Json(UploadRequest {
                prog_id: "digest".into(),
                code,
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);

        let Json(response) = execute_task(
            State(state.clone()),
            Path("local".to_string()),
            Json(TaskRequest {
                prog_id: "digest".into(),
                task_id: None,
                func_args: vec![json!("hello")],
            }),
        )
        .await
        .unwrap();
        assert!(Uuid::parse_str(&response.task_id).is_ok());
        assert_eq!(
            response.result,
            judge::native::sha512x5000(&[json!("hello")]).unwrap()
        );
        state.mesh.shutdown();
    }

    #[tokio::test]
    async fn test_unknown_peer_is_not_found() {
        let (state, _inbound) = state();
        let err = execute_task(
            State(state.clone()),
            Path("nobody".to_string()),
            Json(TaskRequest {
                prog_id: "digest".into(),
                task_id: Some("t-1".into()),
                func_args: vec![],
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);

        let Json(peers) = list_peers(State(state.clone())).await;
        assert_eq!(peers.local.as_str(), "local");
        assert!(peers.peers.is_empty());
        state.mesh.shutdown();
    }

    #[tokio::test]
    async fn test_bad_base64_is_rejected() {
        let (state, _inbound) = state();
        let err = upload_program(
            State(state.clone()),
            Path("local".to_string()),
            Json(UploadRequest {
                prog_id: "digest".into(),
                code: "***".into(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        state.mesh.shutdown();
    }

    #[test]
    fn test_error_status_mapping() {
        let timeout = ApiError::from(PoolError::TaskTimeout {
            task_id: "t".into(),
            elapsed: std::time::Duration::from_millis(5000),
        });
        assert_eq!(timeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            ApiError::from(LinkError::ChannelUnavailable).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::from(LinkError::DuplicateRequest("t".into())).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(LinkError::Remote("boom".into())).status(),
            StatusCode::BAD_GATEWAY
        );
    }
}
