//! Wire-level data model: the tagged unions exchanged between client and
//! server, and the `Record`/`Result` envelopes that flow through the
//! per-run pipeline.

use serde::{Deserialize, Serialize};

use crate::settings::Settings;

/// Every Record carries this block. Internal stages may annotate it
/// (`connection_id`, `stamp`) but must never rewrite the semantic fields a
/// client set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Control {
    pub always_send: bool,
    pub mailbox_slot: String,
    pub connection_id: String,
    pub uuid: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    pub run_id: String,
    pub entity: String,
    pub project: String,
    pub display_name: String,
    /// Microseconds since epoch, stored as float seconds (matches the
    /// upstream wire format this pipeline is compatible with).
    pub start_time: f64,
    pub config: ConfigRecord,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigRecord {
    pub update: Vec<ConfigItem>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigItem {
    pub key: String,
    pub value_json: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HistoryItem {
    pub key: String,
    pub value_json: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HistoryRecord {
    pub step: i64,
    pub items: Vec<HistoryItem>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HistoryAction {
    pub flush: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PartialHistoryRequest {
    pub step: Option<i64>,
    pub items: Vec<HistoryItem>,
    pub action: Option<HistoryAction>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatsItem {
    pub key: String,
    pub value_json: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatsRecord {
    pub items: Vec<StatsItem>,
    pub timestamp_seconds: f64,
    pub timestamp_nanos: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OutputSource {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputRawRecord {
    pub source: OutputSource,
    pub line: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FilesRecord {
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AlertRecord {
    pub title: String,
    pub text: String,
    pub wait_duration_seconds: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExitRecord {
    pub exit_code: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ArtifactManifestEntry {
    pub path: String,
    pub local_path: String,
    pub digest: String,
    pub size: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ArtifactRecord {
    pub artifact_type: String,
    pub name: String,
    pub digest: String,
    pub base_id: Option<String>,
    pub manifest: Vec<ArtifactManifestEntry>,
}

/// States advance monotonically; see `sender::defer` for side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum DeferState {
    Begin = 0,
    FlushStats = 1,
    FlushPartialHistory = 2,
    FlushTb = 3,
    FlushSum = 4,
    FlushDebouncer = 5,
    FlushOutput = 6,
    FlushDir = 7,
    FlushFp = 8,
    JoinFp = 9,
    FlushFs = 10,
    FlushFinal = 11,
    End = 12,
}

impl DeferState {
    pub fn next(self) -> Option<Self> {
        use DeferState::*;
        Some(match self {
            Begin => FlushStats,
            FlushStats => FlushPartialHistory,
            FlushPartialHistory => FlushTb,
            FlushTb => FlushSum,
            FlushSum => FlushDebouncer,
            FlushDebouncer => FlushOutput,
            FlushOutput => FlushDir,
            FlushDir => FlushFp,
            FlushFp => JoinFp,
            JoinFp => FlushFs,
            FlushFs => FlushFinal,
            FlushFinal => End,
            End => return None,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetadataRequest {
    pub os: String,
    pub python: String,
    pub host: String,
    pub cuda: Option<String>,
    pub program: String,
    pub started_at: f64,
}

/// The second tagged union, wrapped inside a `Record::Request`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Request {
    RunStart,
    Defer { state: DeferState },
    PartialHistory(PartialHistoryRequest),
    GetSummary,
    Attach,
    NetworkStatus,
    Metadata(MetadataRequest),
    PollExit,
    SampledHistory,
    ServerInfo,
    Shutdown,
    StopStatus,
    JobInfo,
    CheckVersion,
    Keepalive,
}

/// The universal unit of communication flowing through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum RecordKind {
    Run(RunRecord),
    History(HistoryRecord),
    Files(FilesRecord),
    Stats(StatsRecord),
    OutputRaw(OutputRawRecord),
    Config(ConfigRecord),
    Summary,
    Exit(ExitRecord),
    Alert(AlertRecord),
    Artifact(ArtifactRecord),
    Telemetry,
    Metric,
    Request(Request),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub control: Control,
    pub kind: RecordKind,
}

impl Record {
    pub fn is_request(&self) -> bool {
        matches!(self.kind, RecordKind::Request(_))
    }
}

/// Responses produced for `RecordCommunicate` requests; Control mirrors the
/// originating Record so the dispatcher can route it back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ResultKind {
    RunResult(RunRecord),
    ExitResult,
    SummaryResult(Vec<(String, String)>),
    AttachResult(RunRecord),
    AttachInformResult(Settings),
    Empty,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordResult {
    pub control: Control,
    pub kind: ResultKind,
}

/// Inbound client→server wire messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ServerRequest {
    InformInit { stream_id: String, settings: Settings },
    InformStart { stream_id: String },
    InformAttach { stream_id: String },
    InformFinish { stream_id: String },
    InformTeardown { exit_code: i32 },
    RecordPublish(Record),
    RecordCommunicate(Record),
}

/// Outbound server→client wire messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ServerResponse {
    ResultCommunicate(RecordResult),
    InformAttachResponse { settings: Settings },
}
