//! Talks to the backend: upserts the run, batches scalars through
//! [`FileStream`], uploads files and artifacts, and drives the shutdown
//! defer state machine that drains everything before the stream closes.

use tokio::sync::mpsc;

use crate::artifact::ArtifactSaver;
use crate::filestream::FileStream;
use crate::graphql::GraphQlClient;
use crate::proto::{
    Control, ConfigRecord, DeferState, ExitRecord, FilesRecord, OutputRawRecord, Record, RecordKind, RecordResult,
    Request, ResultKind, RunRecord,
};
use crate::retry::RetryingTransport;
use crate::settings::Settings;
use crate::uploader::Uploader;

pub struct Sender {
    input: mpsc::Receiver<Record>,
    to_dispatcher: mpsc::Sender<RecordResult>,
    /// Clone of the Handler's input sender; used to re-inject the next
    /// Defer state. Taking this to `None` at `DeferState::End` is what
    /// finally lets the pipeline's channel cascade close.
    record_in_tx: Option<mpsc::Sender<Record>>,
    settings: Settings,
    transport: RetryingTransport,
    graphql: GraphQlClient,
    filestream: Option<FileStream>,
    uploader: Option<Uploader>,
    run: Option<RunRecord>,
}

impl Sender {
    pub fn new(
        input: mpsc::Receiver<Record>,
        to_dispatcher: mpsc::Sender<RecordResult>,
        record_in_tx: mpsc::Sender<Record>,
        settings: Settings,
    ) -> Self {
        let transport = RetryingTransport::new(settings.api_key.clone());
        let graphql = GraphQlClient::new(transport.clone(), &settings.base_url);
        Self {
            input,
            to_dispatcher,
            record_in_tx: Some(record_in_tx),
            settings,
            transport,
            graphql,
            filestream: None,
            uploader: None,
            run: None,
        }
    }

    pub async fn run(mut self) {
        while let Some(record) = self.input.recv().await {
            self.handle(record).await;
        }
        if let Some(uploader) = self.uploader.take() {
            uploader.close().await;
        }
        if let Some(filestream) = self.filestream.take() {
            filestream.close().await;
        }
    }

    async fn handle(&mut self, record: Record) {
        match record.kind {
            RecordKind::Run(run) => self.handle_run(record.control, run).await,
            RecordKind::History(history) => {
                self.ensure_started();
                if let Some(filestream) = &self.filestream {
                    filestream.push_history(&history).await;
                }
            }
            RecordKind::Stats(stats) => {
                self.ensure_started();
                let start_time = self.run.as_ref().map(|r| r.start_time).unwrap_or(0.0);
                if let Some(filestream) = &self.filestream {
                    filestream.push_stats(&stats, start_time).await;
                }
            }
            RecordKind::OutputRaw(output) => self.handle_output(output).await,
            RecordKind::Files(files) => self.handle_files(files).await,
            RecordKind::Alert(alert) => {
                let run_id = self.run.as_ref().map(|r| r.run_id.clone()).unwrap_or_default();
                if let Err(error) = self.graphql.notify_scriptable_run_alert(&run_id, &alert.title, &alert.text).await {
                    error!(%error, "failed to send alert");
                }
            }
            RecordKind::Artifact(artifact) => {
                self.ensure_started();
                let uploader = self.uploader.as_ref().expect("ensure_started");
                let saver = ArtifactSaver::new(&self.graphql, uploader, &self.settings.files_dir);
                if let Err(error) = saver.save(&artifact).await {
                    error!(%error, "artifact upload failed");
                }
            }
            RecordKind::Exit(exit) => self.handle_exit(record.control, exit).await,
            RecordKind::Request(Request::RunStart) => self.ensure_started(),
            RecordKind::Request(Request::Defer { state }) => self.handle_defer(record.control, state).await,
            RecordKind::Request(Request::Metadata(metadata)) => self.handle_metadata(metadata).await,
            RecordKind::Request(_) | RecordKind::Config(_) | RecordKind::Summary | RecordKind::Telemetry | RecordKind::Metric => {}
        }
    }

    fn ensure_started(&mut self) {
        if self.filestream.is_none() {
            self.filestream = Some(FileStream::spawn(self.transport.clone(), self.settings.file_stream_url()));
        }
        if self.uploader.is_none() {
            self.uploader = Some(Uploader::spawn(self.transport.clone()));
        }
    }

    async fn handle_run(&mut self, control: Control, run: RunRecord) {
        let mut run = run;
        let config_json = build_config_json(&run.config);
        match self.graphql.upsert_bucket(&run.run_id, &config_json, &run.tags).await {
            Ok(bucket) => {
                run.display_name = bucket.display_name;
                run.project = bucket.project;
                run.entity = bucket.entity;
            }
            Err(error) => error!(%error, run_id = %run.run_id, "failed to upsert run on backend"),
        }
        self.run = Some(run.clone());
        self.reply(&control, ResultKind::RunResult(run)).await;
    }

    async fn handle_output(&mut self, output: OutputRawRecord) {
        if output.line == "\n" {
            return;
        }
        self.ensure_started();
        let stamp = time::OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_default();
        let line = format!("{stamp} {}", output.line);
        if let Some(filestream) = &self.filestream {
            filestream.push_output(line).await;
        }
    }

    async fn handle_files(&mut self, files: FilesRecord) {
        let run_id = self.run.as_ref().map(|r| r.run_id.clone()).unwrap_or_default();
        let upload_urls = match self.graphql.run_upload_urls(&run_id, &files.paths).await {
            Ok(urls) => urls,
            Err(error) => {
                error!(%error, "failed to fetch file upload urls");
                return;
            }
        };

        self.ensure_started();
        let uploader = self.uploader.as_ref().expect("ensure_started");
        for (name, url) in upload_urls {
            let local_path = self.settings.files_dir.join(&name);
            if let Err(error) = uploader.upload_file(local_path, url, Vec::new()).await {
                error!(%error, file = %name, "file upload failed");
            }
        }
    }

    async fn handle_metadata(&mut self, metadata: crate::proto::MetadataRequest) {
        self.ensure_started();
        let path = match crate::metadata::write_metadata_file(&self.settings.files_dir, &metadata) {
            Ok(path) => path,
            Err(error) => {
                error!(%error, "failed to write metadata file");
                return;
            }
        };

        let run_id = self.run.as_ref().map(|r| r.run_id.clone()).unwrap_or_default();
        let urls = match self
            .graphql
            .run_upload_urls(&run_id, &[crate::metadata::METADATA_FILE.to_owned()])
            .await
        {
            Ok(urls) => urls,
            Err(error) => {
                error!(%error, "failed to fetch metadata upload url");
                return;
            }
        };

        if let Some((_, url)) = urls.into_iter().next() {
            let uploader = self.uploader.as_ref().expect("ensure_started");
            if let Err(error) = uploader.upload_file(path, url, Vec::new()).await {
                error!(%error, "failed to upload metadata file");
            }
        }
    }

    async fn handle_exit(&mut self, control: Control, exit: ExitRecord) {
        self.ensure_started();
        if let Some(filestream) = &self.filestream {
            filestream.push_exit(exit.exit_code).await;
        }
        self.reply(&control, ResultKind::ExitResult).await;
        self.reinject_defer(&control, DeferState::Begin).await;
    }

    /// Runs the side effect for `state`, then either advances to the next
    /// state or, at `DeferState::End`, drops this Sender's own clone of the
    /// Handler's input channel.
    async fn handle_defer(&mut self, control: Control, state: DeferState) {
        match state {
            DeferState::FlushFp => {
                if let Some(uploader) = self.uploader.take() {
                    uploader.close().await;
                }
            }
            DeferState::FlushFs => {
                if let Some(filestream) = self.filestream.take() {
                    filestream.close().await;
                }
            }
            _ => {}
        }

        match state.next() {
            Some(next) => self.reinject_defer(&control, next).await,
            None => self.record_in_tx = None,
        }
    }

    async fn reinject_defer(&self, control: &Control, state: DeferState) {
        let Some(tx) = &self.record_in_tx else { return };
        let record = Record {
            control: Control {
                always_send: true,
                connection_id: control.connection_id.clone(),
                ..Default::default()
            },
            kind: RecordKind::Request(Request::Defer { state }),
        };
        if tx.send(record).await.is_err() {
            warn!("handler channel closed while sender still draining defer states");
        }
    }

    async fn reply(&self, control: &Control, kind: ResultKind) {
        let result = RecordResult {
            control: control.clone(),
            kind,
        };
        if self.to_dispatcher.send(result).await.is_err() {
            warn!("dispatcher channel closed while sender still producing results");
        }
    }
}

/// Builds the backend config JSON: each `config.update[i]` lands under
/// `{key: {"value": v}}`, with `_wandb.cli_version` injected alongside.
fn build_config_json(config: &ConfigRecord) -> String {
    let mut map = serde_json::Map::new();
    for item in &config.update {
        let value: serde_json::Value = serde_json::from_str(&item.value_json).unwrap_or(serde_json::Value::Null);
        map.insert(item.key.clone(), serde_json::json!({ "value": value }));
    }
    map.insert(
        "_wandb".to_owned(),
        serde_json::json!({ "value": { "cli_version": env!("CARGO_PKG_VERSION") } }),
    );
    serde_json::to_string(&map).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn defer_cascade_emits_successive_states_then_drops_reinjection_channel() {
        let (_in_tx, in_rx) = mpsc::channel(8);
        let (d_tx, _d_rx) = mpsc::channel(8);
        let (reinject_tx, mut reinject_rx) = mpsc::channel(32);
        let mut sender = Sender::new(in_rx, d_tx, reinject_tx, Settings::default());

        let mut state = DeferState::Begin;
        loop {
            sender
                .handle(Record {
                    control: Control::default(),
                    kind: RecordKind::Request(Request::Defer { state }),
                })
                .await;

            match state.next() {
                Some(next) => {
                    let record = reinject_rx.recv().await.expect("cascade continues");
                    match record.kind {
                        RecordKind::Request(Request::Defer { state: got }) => assert_eq!(got, next),
                        _ => panic!("expected a Defer record"),
                    }
                    state = next;
                }
                None => break,
            }
        }

        drop(sender);
        assert!(reinject_rx.recv().await.is_none());
    }
}
