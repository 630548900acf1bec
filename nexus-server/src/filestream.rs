//! Batches `wandb-history.jsonl`, `wandb-events.jsonl`, and `output.log`
//! into POST bodies sent to the backend's file_stream endpoint.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::proto::{HistoryRecord, StatsRecord};
use crate::retry::RetryingTransport;

pub const HISTORY_FILE: &str = "wandb-history.jsonl";
pub const EVENTS_FILE: &str = "wandb-events.jsonl";
pub const OUTPUT_FILE: &str = "output.log";

const MAX_BATCH_LINES: usize = 5_000;
const BATCH_DELAY: Duration = Duration::from_millis(20);
const HEARTBEAT: Duration = Duration::from_secs(2);

enum Chunk {
    Line { file: &'static str, line: String },
    /// Events flush immediately, one per POST.
    Event { line: String },
    Control { complete: bool, exit_code: Option<i32> },
}

#[derive(Default)]
struct FileState {
    sent_offset: usize,
    pending: Vec<String>,
    first_pending_at: Option<Instant>,
}

pub struct FileStream {
    tx: mpsc::Sender<Chunk>,
    join: tokio::task::JoinHandle<()>,
}

impl FileStream {
    pub fn spawn(transport: RetryingTransport, url: String) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let join = tokio::spawn(run(transport, url, rx));
        Self { tx, join }
    }

    pub async fn push_history(&self, history: &HistoryRecord) {
        let line = jsonify_items(history.items.iter().map(|item| (&item.key, &item.value_json)));
        let _ = self.tx.send(Chunk::Line { file: HISTORY_FILE, line }).await;
    }

    pub async fn push_output(&self, line: String) {
        let _ = self.tx.send(Chunk::Line { file: OUTPUT_FILE, line }).await;
    }

    pub async fn push_stats(&self, stats: &StatsRecord, start_time: f64) {
        let t = stats.timestamp_seconds + f64::from(stats.timestamp_nanos) / 1e9;
        let mut object = serde_json::Map::new();
        object.insert("_wandb".to_owned(), Value::Bool(true));
        object.insert("_timestamp".to_owned(), json!(t));
        object.insert("_runtime".to_owned(), json!(t - start_time));
        for item in &stats.items {
            let value: Value = serde_json::from_str(&item.value_json).unwrap_or(Value::Null);
            object.insert(format!("system.{}", item.key), value);
        }
        let line = Value::Object(object).to_string();
        let _ = self.tx.send(Chunk::Event { line }).await;
    }

    pub async fn push_exit(&self, exit_code: i32) {
        let _ = self
            .tx
            .send(Chunk::Control {
                complete: true,
                exit_code: Some(exit_code),
            })
            .await;
    }

    pub async fn close(self) {
        drop(self.tx);
        let _ = self.join.await;
    }
}

/// For each item, unmarshal `value_json`, assemble `{key: value}`, and
/// marshal to a one-line JSON string.
fn jsonify_items<'a>(items: impl Iterator<Item = (&'a String, &'a String)>) -> String {
    let mut object = serde_json::Map::new();
    for (key, value_json) in items {
        let value: Value = serde_json::from_str(value_json).unwrap_or(Value::Null);
        object.insert(key.clone(), value);
    }
    Value::Object(object).to_string()
}

async fn run(transport: RetryingTransport, url: String, mut rx: mpsc::Receiver<Chunk>) {
    let mut files: BTreeMap<&'static str, FileState> = BTreeMap::new();
    let mut pending_complete = None;
    let mut pending_exit_code = None;
    let mut heartbeat = tokio::time::interval(HEARTBEAT);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let earliest_delay_deadline = files
            .values()
            .filter(|f| !f.pending.is_empty())
            .filter_map(|f| f.first_pending_at)
            .min()
            .map(|started| started + BATCH_DELAY);

        tokio::select! {
            chunk = rx.recv() => {
                match chunk {
                    Some(Chunk::Line { file, line }) => {
                        let state = files.entry(file).or_default();
                        if state.first_pending_at.is_none() {
                            state.first_pending_at = Some(Instant::now());
                        }
                        state.pending.push(line);
                        if state.pending.len() >= MAX_BATCH_LINES {
                            flush_file(&transport, &url, file, state, &mut pending_complete, &mut pending_exit_code).await;
                        }
                    }
                    Some(Chunk::Event { line }) => {
                        let state = files.entry(EVENTS_FILE).or_default();
                        state.pending.push(line);
                        flush_file(&transport, &url, EVENTS_FILE, state, &mut pending_complete, &mut pending_exit_code).await;
                    }
                    Some(Chunk::Control { complete, exit_code }) => {
                        pending_complete = Some(complete);
                        pending_exit_code = exit_code;
                        post_control_if_no_pending_lines(&transport, &url, &files, &mut pending_complete, &mut pending_exit_code).await;
                    }
                    None => {
                        flush_all(&transport, &url, &mut files, &mut pending_complete, &mut pending_exit_code).await;
                        break;
                    }
                }
            }
            _ = async { tokio::time::sleep_until(earliest_delay_deadline.unwrap()).await }, if earliest_delay_deadline.is_some() => {
                flush_all(&transport, &url, &mut files, &mut pending_complete, &mut pending_exit_code).await;
            }
            _ = heartbeat.tick() => {
                if files.values().any(|f| !f.pending.is_empty()) {
                    flush_all(&transport, &url, &mut files, &mut pending_complete, &mut pending_exit_code).await;
                }
            }
        }
    }
}

async fn flush_all(
    transport: &RetryingTransport,
    url: &str,
    files: &mut BTreeMap<&'static str, FileState>,
    pending_complete: &mut Option<bool>,
    pending_exit_code: &mut Option<i32>,
) {
    let names: Vec<&'static str> = files.keys().copied().collect();
    for name in names {
        let state = files.get_mut(name).expect("just listed");
        if !state.pending.is_empty() {
            flush_file(transport, url, name, state, pending_complete, pending_exit_code).await;
        }
    }
    // No file had pending lines but a control flag is still owed.
    post_control_if_no_pending_lines(transport, url, files, pending_complete, pending_exit_code).await;
}

async fn post_control_if_no_pending_lines(
    transport: &RetryingTransport,
    url: &str,
    files: &BTreeMap<&'static str, FileState>,
    pending_complete: &mut Option<bool>,
    pending_exit_code: &mut Option<i32>,
) {
    if pending_complete.is_none() && pending_exit_code.is_none() {
        return;
    }
    if files.values().any(|f| !f.pending.is_empty()) {
        return;
    }
    post(transport, url, &json!({}), pending_complete, pending_exit_code).await;
}

async fn flush_file(
    transport: &RetryingTransport,
    url: &str,
    name: &'static str,
    state: &mut FileState,
    pending_complete: &mut Option<bool>,
    pending_exit_code: &mut Option<i32>,
) {
    if state.pending.is_empty() {
        return;
    }
    let content: Vec<String> = std::mem::take(&mut state.pending);
    state.first_pending_at = None;
    let offset = state.sent_offset;
    state.sent_offset += content.len();

    let files_field = json!({ name: { "offset": offset, "content": content } });
    post(transport, url, &files_field, pending_complete, pending_exit_code).await;
}

async fn post(
    transport: &RetryingTransport,
    url: &str,
    files_field: &Value,
    pending_complete: &mut Option<bool>,
    pending_exit_code: &mut Option<i32>,
) {
    let mut body = serde_json::Map::new();
    if let Value::Object(map) = files_field {
        if !map.is_empty() {
            body.insert("files".to_owned(), files_field.clone());
        }
    }
    if let Some(complete) = pending_complete.take() {
        body.insert("complete".to_owned(), json!(complete));
    }
    if let Some(exit_code) = pending_exit_code.take() {
        body.insert("exitcode".to_owned(), json!(exit_code));
    }

    if let Err(error) = transport.post_json(url, Value::Object(body)).await {
        error!(%error, "fatal: file_stream POST failed after retries");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jsonify_items_round_trips() {
        let items = vec![("loss".to_owned(), "0.5".to_owned()), ("_step".to_owned(), "0".to_owned())];
        let line = jsonify_items(items.iter().map(|(k, v)| (k, v)));
        let parsed: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["loss"], json!(0.5));
        assert_eq!(parsed["_step"], json!(0));
    }
}
