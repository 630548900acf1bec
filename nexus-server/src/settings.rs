use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

/// Per-stream configuration resolved at `InformInit` time and carried over
/// the wire. Immutable for the life of a Stream; `InformAttach` hands back a
/// read-only copy.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub offline: bool,
    pub sync_file: Utf8PathBuf,
    pub files_dir: Utf8PathBuf,
    pub stats_sample_rate_seconds: f64,
    pub stats_samples_to_average: u32,
    pub run_id: String,
    pub project: String,
    pub entity: String,
}

impl Settings {
    pub fn file_stream_url(&self) -> String {
        format!(
            "{}/files/{}/{}/{}/file_stream",
            self.base_url.trim_end_matches('/'),
            self.entity,
            self.project,
            self.run_id
        )
    }
}
