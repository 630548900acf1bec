//! Builds `wandb-metadata.json`: a snapshot of the run's environment,
//! augmented locally with host facts the client can't see from its side
//! of the wire.

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use sysinfo::{Disks, System};

use crate::proto::MetadataRequest;

pub const METADATA_FILE: &str = "wandb-metadata.json";

#[derive(Debug, Serialize)]
struct MetadataFile {
    os: String,
    python: String,
    host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cuda: Option<String>,
    program: String,
    #[serde(rename = "startedAt")]
    started_at: f64,
    executable: String,
    args: Vec<String>,
    #[serde(rename = "cpu_count")]
    cpu_count: usize,
    #[serde(rename = "cpu_count_logical")]
    cpu_count_logical: usize,
    #[serde(rename = "memory")]
    memory: MemoryInfo,
    disk: DiskInfo,
}

#[derive(Debug, Serialize)]
struct MemoryInfo {
    total: u64,
}

#[derive(Debug, Serialize)]
struct DiskInfo {
    total: u64,
    used: u64,
}

pub fn write_metadata_file(files_dir: &Utf8Path, request: &MetadataRequest) -> std::io::Result<Utf8PathBuf> {
    let system = System::new_all();
    let disks = Disks::new_with_refreshed_list();
    let (total, used) = disks
        .iter()
        .map(|disk| (disk.total_space(), disk.total_space() - disk.available_space()))
        .fold((0, 0), |(total_acc, used_acc), (total, used)| (total_acc + total, used_acc + used));

    let metadata = MetadataFile {
        os: request.os.clone(),
        python: request.python.clone(),
        host: request.host.clone(),
        cuda: request.cuda.clone(),
        program: request.program.clone(),
        started_at: request.started_at,
        executable: std::env::current_exe()
            .ok()
            .and_then(|p| p.to_str().map(str::to_owned))
            .unwrap_or_default(),
        args: std::env::args().skip(1).collect(),
        cpu_count: system.physical_core_count().unwrap_or(0),
        cpu_count_logical: system.cpus().len(),
        memory: MemoryInfo {
            total: system.total_memory(),
        },
        disk: DiskInfo { total, used },
    };

    std::fs::create_dir_all(files_dir)?;
    let path = files_dir.join(METADATA_FILE);
    let json = serde_json::to_vec_pretty(&metadata)?;
    std::fs::write(&path, json)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_metadata_file_with_requested_fields() {
        let dir = tempfile::tempdir().unwrap();
        let files_dir = Utf8Path::from_path(dir.path()).unwrap();
        let request = MetadataRequest {
            os: "linux".to_owned(),
            python: "3.11".to_owned(),
            host: "box".to_owned(),
            cuda: None,
            program: "train.py".to_owned(),
            started_at: 100.0,
        };

        let path = write_metadata_file(files_dir, &request).unwrap();
        let contents = std::fs::read_to_string(path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed["os"], "linux");
        assert_eq!(parsed["startedAt"], 100.0);
    }
}
