use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub relay_url: String,
    pub identity_path: PathBuf,
    pub workers: usize,
    pub task_timeout: Duration,
    pub http_port: u16,
    pub bind: IpAddr,
    pub advertise: Vec<IpAddr>,
    pub storage_path: PathBuf,
}
