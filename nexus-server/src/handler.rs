//! Single-threaded processor of the inbound record feed for one run:
//! run lifecycle, partial-history folding, the defer hand-off, and the
//! no-op request placeholders that still unblock mailbox callers.

use tokio::sync::mpsc;

use crate::proto::{
    Control, DeferState, HistoryItem, HistoryRecord, MetadataRequest, Record, RecordKind, RecordResult, Request,
    ResultKind, RunRecord,
};
use crate::settings::Settings;

pub struct Handler {
    input: mpsc::Receiver<Record>,
    to_writer: mpsc::Sender<Record>,
    to_dispatcher: mpsc::Sender<RecordResult>,
    settings: Settings,
    run: Option<RunRecord>,
    start_time: Option<f64>,
    summary: Vec<(String, String)>,
    active_history: Option<HistoryRecord>,
}

impl Handler {
    pub fn new(
        input: mpsc::Receiver<Record>,
        to_writer: mpsc::Sender<Record>,
        to_dispatcher: mpsc::Sender<RecordResult>,
        settings: Settings,
    ) -> Self {
        Self {
            input,
            to_writer,
            to_dispatcher,
            settings,
            run: None,
            start_time: None,
            summary: Vec::new(),
            active_history: None,
        }
    }

    pub async fn run(mut self) {
        while let Some(record) = self.input.recv().await {
            self.handle(record).await;
        }
        // Dropping `self` here closes both downstream senders, which is
        // what lets Writer/Dispatcher observe end-of-stream.
    }

    async fn handle(&mut self, record: Record) {
        match &record.kind {
            RecordKind::Run(run) => {
                let mut run = run.clone();
                let start_time = now_seconds();
                run.start_time = start_time;
                self.start_time = Some(start_time);
                self.run = Some(run.clone());

                self.forward(record.clone()).await;

                let metadata = Record {
                    control: Control {
                        always_send: record.control.always_send,
                        connection_id: record.control.connection_id.clone(),
                        ..Default::default()
                    },
                    kind: RecordKind::Request(Request::Metadata(MetadataRequest {
                        os: std::env::consts::OS.to_owned(),
                        python: String::new(),
                        host: hostname::get()
                            .ok()
                            .and_then(|h| h.into_string().ok())
                            .unwrap_or_default(),
                        cuda: None,
                        program: std::env::args().next().unwrap_or_default(),
                        started_at: start_time,
                    })),
                };
                self.forward(metadata).await;
            }
            RecordKind::Exit(_) => {
                self.forward(record).await;
            }
            RecordKind::Request(request) => self.handle_request(request.clone(), record).await,
            _ => {
                self.forward(record).await;
            }
        }
    }

    async fn handle_request(&mut self, request: Request, record: Record) {
        match request {
            Request::Attach => {
                let run = self.run.clone().unwrap_or_default();
                self.reply(&record.control, ResultKind::AttachResult(run)).await;
            }
            Request::GetSummary => {
                self.reply(&record.control, ResultKind::SummaryResult(self.summary.clone()))
                    .await;
            }
            Request::PartialHistory(partial) => {
                self.handle_partial_history(partial).await;
                self.reply(&record.control, ResultKind::Empty).await;
            }
            Request::Defer { state } => {
                if state == DeferState::FlushPartialHistory {
                    self.flush_history().await;
                }
                self.forward(record).await;
            }
            Request::RunStart => {
                self.forward(record).await;
            }
            Request::NetworkStatus
            | Request::PollExit
            | Request::SampledHistory
            | Request::ServerInfo
            | Request::Shutdown
            | Request::StopStatus
            | Request::JobInfo
            | Request::CheckVersion
            | Request::Keepalive
            | Request::Metadata(_) => {
                self.reply(&record.control, ResultKind::Empty).await;
                self.forward(record).await;
            }
        }
    }

    async fn handle_partial_history(&mut self, partial: crate::proto::PartialHistoryRequest) {
        let incoming_step = partial.step;

        match (&mut self.active_history, incoming_step) {
            (None, step) => {
                self.active_history = Some(HistoryRecord {
                    step: step.unwrap_or(0),
                    items: partial.items,
                });
            }
            (Some(active), Some(step)) if step > active.step => {
                self.flush_history().await;
                self.active_history = Some(HistoryRecord {
                    step,
                    items: partial.items,
                });
            }
            (Some(active), Some(step)) if step < active.step => {
                warn!(step, active_step = active.step, "dropping out-of-order partial history request");
                return;
            }
            (Some(active), _) => {
                active.items.extend(partial.items);
            }
        }

        let should_flush = partial.step.is_none()
            && partial.action.as_ref().map(|a| a.flush).unwrap_or(true);
        if should_flush {
            let flushed_step = self.active_history.as_ref().map(|active| active.step).unwrap_or(0);
            self.flush_history().await;
            self.active_history = Some(HistoryRecord {
                step: flushed_step + 1,
                items: Vec::new(),
            });
        }
    }

    async fn flush_history(&mut self) {
        let Some(mut active) = self.active_history.take() else {
            return;
        };

        let timestamp = active
            .items
            .iter()
            .find(|item| item.key == "_timestamp")
            .and_then(|item| item.value_json.parse::<f64>().ok());

        let runtime = match (timestamp, self.start_time) {
            (Some(t), Some(start)) => t - start,
            (Some(_), None) | (None, _) => {
                if timestamp.is_some() {
                    error!("start_time unset while flushing history; defaulting _runtime to 0");
                }
                0.0
            }
        };

        active.items.push(HistoryItem {
            key: "_runtime".to_owned(),
            value_json: runtime.to_string(),
        });
        active.items.push(HistoryItem {
            key: "_step".to_owned(),
            value_json: active.step.to_string(),
        });

        for item in &active.items {
            if let Some(existing) = self.summary.iter_mut().find(|(k, _)| k == &item.key) {
                existing.1 = item.value_json.clone();
            } else {
                self.summary.push((item.key.clone(), item.value_json.clone()));
            }
        }

        let record = Record {
            control: Control::default(),
            kind: RecordKind::History(active),
        };
        self.forward(record).await;
    }

    async fn forward(&self, record: Record) {
        if self.to_writer.send(record).await.is_err() {
            warn!("writer channel closed while handler still producing records");
        }
    }

    async fn reply(&self, control: &Control, kind: ResultKind) {
        let result = RecordResult {
            control: control.clone(),
            kind,
        };
        if self.to_dispatcher.send(result).await.is_err() {
            warn!("dispatcher channel closed while handler still producing results");
        }
    }
}

fn now_seconds() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::HistoryAction;

    fn partial(step: Option<i64>, key: &str, value: &str, flush: bool) -> Request {
        Request::PartialHistory(crate::proto::PartialHistoryRequest {
            step,
            items: vec![HistoryItem {
                key: key.to_owned(),
                value_json: value.to_owned(),
            }],
            action: Some(HistoryAction { flush }),
        })
    }

    async fn run_handler() -> (mpsc::Sender<Record>, mpsc::Receiver<Record>, tokio::task::JoinHandle<()>) {
        let (in_tx, in_rx) = mpsc::channel(32);
        let (w_tx, w_rx) = mpsc::channel(32);
        let (d_tx, _d_rx) = mpsc::channel(32);
        let handler = Handler::new(in_rx, w_tx, d_tx, Settings::default());
        let join = tokio::spawn(handler.run());
        (in_tx, w_rx, join)
    }

    #[tokio::test]
    async fn out_of_order_step_is_dropped() {
        let (in_tx, mut w_rx, join) = run_handler().await;

        for (step, value) in [(0, "0.0"), (2, "2.0"), (1, "1.0")] {
            let record = Record {
                control: Control::default(),
                kind: RecordKind::Request(partial(Some(step), "_timestamp", value, false)),
            };
            in_tx.send(record).await.unwrap();
        }
        // Scenario 3 flushes the final active record via the defer hand-off
        // rather than on channel close.
        in_tx
            .send(Record {
                control: Control::default(),
                kind: RecordKind::Request(Request::Defer {
                    state: DeferState::FlushPartialHistory,
                }),
            })
            .await
            .unwrap();
        drop(in_tx);

        let mut emitted_steps = Vec::new();
        while let Some(record) = w_rx.recv().await {
            if let RecordKind::History(history) = record.kind {
                emitted_steps.push(history.step);
            }
        }

        join.await.unwrap();
        assert_eq!(emitted_steps, vec![0, 2]);
    }
}
