//! The per-run pipeline instance: Handler → Writer → Sender → Dispatcher,
//! plus the set of connection responders eligible to receive its results.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::handler::Handler;
use crate::monitor::MetricsMonitor;
use crate::proto::{Control, ExitRecord, Record, RecordKind, RecordResult};
use crate::sender::Sender;
use crate::settings::Settings;
use crate::writer::Writer;

const CHANNEL_CAPACITY: usize = 32;

pub type ResponderTx = mpsc::Sender<RecordResult>;

/// Holds the connections eligible to receive this stream's results, keyed
/// by `connection_id`, as described in the Mailbox/responder design notes:
/// a Stream holds strong references for response routing, and a closing
/// connection must remove itself.
#[derive(Default, Clone)]
pub struct Responders(Arc<RwLock<HashMap<String, ResponderTx>>>);

impl Responders {
    pub fn register(&self, connection_id: String, tx: ResponderTx) {
        self.0.write().insert(connection_id, tx);
    }

    pub fn unregister(&self, connection_id: &str) {
        self.0.write().remove(connection_id);
    }

    pub fn get(&self, connection_id: &str) -> Option<ResponderTx> {
        self.0.read().get(connection_id).cloned()
    }
}

pub struct Stream {
    pub settings: Settings,
    pub responders: Responders,
    record_in_tx: parking_lot::Mutex<Option<mpsc::Sender<Record>>>,
    tasks: parking_lot::Mutex<Option<PipelineTasks>>,
    monitor: parking_lot::Mutex<Option<MetricsMonitor>>,
}

struct PipelineTasks {
    handler: JoinHandle<()>,
    writer: JoinHandle<()>,
    sender: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

impl Stream {
    pub fn spawn(settings: Settings) -> Self {
        let (record_in_tx, record_in_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (h2w_tx, h2w_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (w2s_tx, w2s_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (h2d_tx, h2d_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (s2d_tx, s2d_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let responders = Responders::default();

        let handler = Handler::new(record_in_rx, h2w_tx, h2d_tx, settings.clone());
        let writer = Writer::new(h2w_rx, w2s_tx, settings.clone());
        let sender = Sender::new(w2s_rx, s2d_tx, record_in_tx.clone(), settings.clone());
        let dispatcher_responders = responders.clone();
        let monitor = MetricsMonitor::spawn(record_in_tx.clone(), settings.clone());

        let handler = tokio::spawn(handler.run());
        let writer = tokio::spawn(writer.run());
        let sender = tokio::spawn(sender.run());
        let dispatcher = tokio::spawn(run_dispatcher(h2d_rx, s2d_rx, dispatcher_responders));

        Self {
            settings,
            responders,
            record_in_tx: parking_lot::Mutex::new(Some(record_in_tx)),
            tasks: parking_lot::Mutex::new(Some(PipelineTasks {
                handler,
                writer,
                sender,
                dispatcher,
            })),
            monitor: parking_lot::Mutex::new(Some(monitor)),
        }
    }

    #[cfg(test)]
    pub fn spawn_for_test(mut settings: Settings) -> Self {
        settings.offline = true;
        Self::spawn(settings)
    }

    pub async fn handle_record(&self, record: Record) {
        let tx = self.record_in_tx.lock().clone();
        match tx {
            Some(tx) if tx.send(record).await.is_ok() => {}
            _ => warn!("tried to hand a record to a stream whose pipeline already closed"),
        }
    }

    /// Graceful drain for `InformFinish`: inject an Exit record, drop this
    /// Stream's own handle to the input channel (the Sender's clone, used
    /// to re-inject Defer records, closes the channel once it reaches
    /// `DeferState::End`), then wait for the whole pipeline to close.
    pub async fn close(&self) {
        self.finish_with_exit_code(0).await;
    }

    /// Used by `StreamMux::finish_and_close_all_streams` during teardown.
    pub async fn finish_with_exit_code(&self, exit_code: i32) {
        // The monitor holds its own clone of `record_in_tx`; it has to be
        // closed before Handler's input channel can ever observe EOF.
        let monitor = self.monitor.lock().take();
        if let Some(monitor) = monitor {
            monitor.close().await;
        }

        let exit = Record {
            control: Control {
                always_send: true,
                ..Default::default()
            },
            kind: RecordKind::Exit(ExitRecord { exit_code }),
        };
        let tx = self.record_in_tx.lock().take();
        if let Some(tx) = tx {
            let _ = tx.send(exit).await;
            // Drop our own clone now; the Sender holds the other one and
            // drops it at DeferState::End, which is what finally closes
            // Handler's input channel and cascades the pipeline shutdown.
        }

        let tasks = self.tasks.lock().take();
        if let Some(tasks) = tasks {
            let _ = tokio::join!(tasks.handler, tasks.writer, tasks.sender, tasks.dispatcher);
        }
    }
}

async fn run_dispatcher(
    mut handler_results: mpsc::Receiver<RecordResult>,
    mut sender_results: mpsc::Receiver<RecordResult>,
    responders: Responders,
) {
    let mut handler_open = true;
    let mut sender_open = true;

    while handler_open || sender_open {
        let result = tokio::select! {
            result = handler_results.recv(), if handler_open => {
                if result.is_none() { handler_open = false; }
                result
            }
            result = sender_results.recv(), if sender_open => {
                if result.is_none() { sender_open = false; }
                result
            }
        };

        let Some(result) = result else { continue };

        let connection_id = result.control.connection_id.clone();
        if let Some(responder) = responders.get(&connection_id) {
            if responder.send(result).await.is_err() {
                debug!(connection_id, "responder dropped before result delivery");
            }
        } else {
            debug!(connection_id, "no responder registered for result");
        }
    }
}
