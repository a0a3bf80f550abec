use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Command;
use sysinfo::{Disks, System};
use tracing::{debug, warn};

/// Utilization snapshot exchanged between peers once per second.
///
/// `cpus_usage` is the sum of every worker's busy fraction scaled to a
/// percentage, so a fully loaded pool of four reports 400.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareUsage {
    pub cpus: usize,
    pub cpus_usage: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<GpuInfo>,
    pub gpu_usage: f64,
    #[serde(rename = "storageLimit")]
    pub storage_limit: u64,
    #[serde(rename = "storageUsed")]
    pub storage_used: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub name: Option<String>,
    pub memory_mb: Option<u64>,
    pub driver_version: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageEstimate {
    pub quota: u64,
    pub usage: u64,
}

/// Host facts the pool cannot measure itself. Calls may block.
pub trait HostProbe: Send + Sync + 'static {
    fn cpus(&self) -> usize;

    fn gpu(&self) -> Option<GpuInfo>;

    fn storage(&self) -> StorageEstimate;
}

/// Probe backed by `sysinfo` and `nvidia-smi`.
#[derive(Debug, Clone)]
pub struct SystemProbe {
    cpus: usize,
    storage_path: PathBuf,
}

impl SystemProbe {
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        let sys = System::new_all();
        let cpus = sys.cpus().len().max(1);
        Self {
            cpus,
            storage_path: storage_path.into(),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new(std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")))
    }
}

impl HostProbe for SystemProbe {
    fn cpus(&self) -> usize {
        self.cpus
    }

    fn gpu(&self) -> Option<GpuInfo> {
        match query_nvidia_smi() {
            Ok(info) => Some(info),
            Err(e) => {
                debug!("GPU probe found nothing: {e}");
                None
            }
        }
    }

    fn storage(&self) -> StorageEstimate {
        let disks = Disks::new_with_refreshed_list();
        let disk = disks
            .list()
            .iter()
            .filter(|d| self.storage_path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len());

        match disk {
            Some(d) => StorageEstimate {
                quota: d.total_space(),
                usage: d.total_space().saturating_sub(d.available_space()),
            },
            None => {
                warn!(path = %self.storage_path.display(), "no disk found for storage estimate");
                StorageEstimate::default()
            }
        }
    }
}

fn query_nvidia_smi() -> Result<GpuInfo, String> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=name,memory.total,driver_version", "--format=csv,noheader,nounits"])
        .output()
        .map_err(|e| e.to_string())?;

    if !output.status.success() {
        return Err("nvidia-smi failed".to_string());
    }

    parse_gpu_line(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| "no GPU listed".to_string())
}

fn parse_gpu_line(stdout: &str) -> Option<GpuInfo> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();

    Some(GpuInfo {
        name: parts.first().map(|s| s.to_string()),
        memory_mb: parts.get(1).and_then(|s| s.parse().ok()),
        driver_version: parts.get(2).map(|s| s.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_gpu_line() {
        let info = parse_gpu_line("NVIDIA GeForce RTX 4070, 12282, 550.54.14\n").unwrap();
        assert_eq!(info.name.as_deref(), Some("NVIDIA GeForce RTX 4070"));
        assert_eq!(info.memory_mb, Some(12282));
        assert_eq!(info.driver_version.as_deref(), Some("550.54.14"));
        assert!(parse_gpu_line("\n").is_none());
    }

    #[test]
    fn test_usage_wire_names() {
        let usage = HardwareUsage {
            cpus: 8,
            cpus_usage: 150.0,
            gpu: None,
            gpu_usage: 0.0,
            storage_limit: 1000,
            storage_used: 10,
        };
        let json = serde_json::to_value(&usage).unwrap();
        assert_eq!(json["storageLimit"], 1000);
        assert_eq!(json["storageUsed"], 10);
        assert_eq!(json["cpus_usage"], 150.0);
        assert!(json.get("gpu").is_none());
    }
}
