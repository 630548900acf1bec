//! Consumes the handler's record channel, persists non-Request records to
//! the [`crate::store::Store`], and applies the offline-suppression filter
//! before forwarding to the Sender.

use tokio::sync::mpsc;

use crate::proto::{Record, RecordKind};
use crate::settings::Settings;
use crate::store::Store;

pub struct Writer {
    input: mpsc::Receiver<Record>,
    to_sender: mpsc::Sender<Record>,
    settings: Settings,
    store: Option<Store>,
}

impl Writer {
    pub fn new(input: mpsc::Receiver<Record>, to_sender: mpsc::Sender<Record>, settings: Settings) -> Self {
        Self {
            input,
            to_sender,
            settings,
            store: None,
        }
    }

    pub async fn run(mut self) {
        while let Some(record) = self.input.recv().await {
            self.handle(record).await;
        }
    }

    async fn handle(&mut self, record: Record) {
        if !record.is_request() {
            if let Err(error) = self.append(&record) {
                // Fatal per the error-handling design: store write failure
                // after retry is unrecoverable for this stream.
                error!(%error, "fatal: failed to append record to store");
                return;
            }
        }

        if self.should_forward(&record) && self.to_sender.send(record).await.is_err() {
            warn!("sender channel closed while writer still producing records");
        }
    }

    fn should_forward(&self, record: &Record) -> bool {
        if record.is_request() {
            return true;
        }
        !(self.settings.offline && !record.control.always_send)
    }

    fn append(&mut self, record: &Record) -> Result<(), crate::store::StoreError> {
        if self.store.is_none() {
            if let Some(parent) = self.settings.sync_file.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            self.store = Some(Store::create(&self.settings.sync_file)?);
        }
        self.store.as_mut().expect("just initialized").append(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{Control, RunRecord};

    fn settings_with_tempdir(offline: bool) -> (tempfile::TempDir, Settings) {
        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8Path::from_path(dir.path()).unwrap().join("run.log");
        let settings = Settings {
            offline,
            sync_file: path,
            ..Default::default()
        };
        (dir, settings)
    }

    #[tokio::test]
    async fn offline_suppresses_non_always_send_records() {
        let (_dir, settings) = settings_with_tempdir(true);
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let writer = Writer::new(in_rx, out_tx, settings);
        let join = tokio::spawn(writer.run());

        in_tx
            .send(Record {
                control: Control::default(),
                kind: RecordKind::Run(RunRecord::default()),
            })
            .await
            .unwrap();
        drop(in_tx);
        join.await.unwrap();

        assert!(out_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn always_send_bypasses_offline_filter() {
        let (_dir, settings) = settings_with_tempdir(true);
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let writer = Writer::new(in_rx, out_tx, settings);
        let join = tokio::spawn(writer.run());

        in_tx
            .send(Record {
                control: Control {
                    always_send: true,
                    ..Default::default()
                },
                kind: RecordKind::Run(RunRecord::default()),
            })
            .await
            .unwrap();
        drop(in_tx);
        join.await.unwrap();

        assert!(out_rx.recv().await.is_some());
    }
}
