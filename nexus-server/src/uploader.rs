//! A small worker pool that PUTs file bytes to pre-signed URLs. Files and
//! artifact manifests both enqueue work here so retries and backoff are
//! shared in one place.

use camino::Utf8PathBuf;
use tokio::sync::{mpsc, oneshot};

use crate::retry::{RetryError, RetryingTransport};

const WORKER_COUNT: usize = 4;

pub struct UploadTask {
    pub path: Utf8PathBuf,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub respond: oneshot::Sender<Result<(), UploadError>>,
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Transport(#[from] RetryError),
    #[error("upload worker dropped without responding")]
    WorkerGone,
}

/// Fans uploads out across a fixed worker pool; `close()` drains whatever
/// is already queued before returning.
pub struct Uploader {
    tx: mpsc::Sender<UploadTask>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl Uploader {
    pub fn spawn(transport: RetryingTransport) -> Self {
        let (tx, rx) = mpsc::channel(256);
        let rx = std::sync::Arc::new(tokio::sync::Mutex::new(rx));

        let workers = (0..WORKER_COUNT)
            .map(|_| {
                let transport = transport.clone();
                let rx = rx.clone();
                tokio::spawn(worker_loop(transport, rx))
            })
            .collect();

        Self { tx, workers }
    }

    pub async fn enqueue(&self, task: UploadTask) {
        if self.tx.send(task).await.is_err() {
            warn!("uploader channel closed while still enqueuing work");
        }
    }

    pub async fn upload_file(&self, path: Utf8PathBuf, url: String, headers: Vec<(String, String)>) -> Result<(), UploadError> {
        let (respond, await_result) = oneshot::channel();
        self.enqueue(UploadTask {
            path,
            url,
            headers,
            respond,
        })
        .await;
        await_result.await.unwrap_or(Err(UploadError::WorkerGone))
    }

    pub async fn close(self) {
        drop(self.tx);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

async fn worker_loop(transport: RetryingTransport, rx: std::sync::Arc<tokio::sync::Mutex<mpsc::Receiver<UploadTask>>>) {
    loop {
        let task = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(task) = task else { break };

        let result = upload_one(&transport, &task.path, &task.url, &task.headers).await;
        let _ = task.respond.send(result);
    }
}

async fn upload_one(
    transport: &RetryingTransport,
    path: &Utf8PathBuf,
    url: &str,
    headers: &[(String, String)],
) -> Result<(), UploadError> {
    let bytes = tokio::fs::read(path).await.map_err(|source| UploadError::Read {
        path: path.clone(),
        source,
    })?;
    transport.put_bytes(url, bytes, headers).await?;
    Ok(())
}
