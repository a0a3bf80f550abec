use hive::WorkerPool;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use synapse::{MeshHandle, PeerInfo, SessionId};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct AppState {
    pub mesh: MeshHandle,
    pub pool: Arc<WorkerPool>,
}

#[derive(Serialize)]
pub struct PeersResponse {
    pub version: &'static str,
    pub local: SessionId,
    pub peers: Vec<PeerInfo>,
}

#[derive(Deserialize)]
pub struct UploadRequest {
    #[serde(rename = "progId")]
    pub prog_id: String,
    /// Program code, base64 encoded.
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    #[serde(rename = "progId")]
    pub prog_id: String,
    pub status: &'static str,
}

#[derive(Deserialize)]
pub struct TaskRequest {
    #[serde(rename = "progId")]
    pub prog_id: String,
    #[serde(rename = "taskId", default)]
    pub task_id: Option<String>,
    #[serde(rename = "funcArgs", default)]
    pub func_args: Vec<Value>,
}

#[derive(Debug, Serialize)]
pub struct TaskResponse {
    #[serde(rename = "taskId")]
    pub task_id: String,
    pub result: Value,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}
