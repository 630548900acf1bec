//! One TCP client: a reader loop decoding [`ServerRequest`] frames, a
//! writer loop encoding [`ServerResponse`] frames, and the dispatch logic
//! that ties incoming requests to the right [`Stream`].

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::NexusState;
use crate::proto::{RecordResult, ServerRequest, ServerResponse};
use crate::stream::Stream;
use crate::wire::{FrameError, FrameReader, FrameWriter};

const CHANNEL_CAPACITY: usize = 32;

pub struct Connection {
    stream: TcpStream,
    state: NexusState,
    peer_addr: SocketAddr,
}

impl Connection {
    pub fn new(stream: TcpStream, state: NexusState, peer_addr: SocketAddr) -> Self {
        Self { stream, state, peer_addr }
    }

    pub async fn serve(self) -> anyhow::Result<()> {
        let connection_id = uuid::Uuid::new_v4().to_string();
        let (read_half, write_half) = tokio::io::split(self.stream);
        let mut reader = FrameReader::new(read_half);
        let writer = FrameWriter::new(write_half);

        let (out_tx, out_rx) = mpsc::channel::<ServerResponse>(CHANNEL_CAPACITY);
        let (result_tx, result_rx) = mpsc::channel::<RecordResult>(CHANNEL_CAPACITY);

        let writer_task = tokio::spawn(run_writer(writer, out_rx));
        let result_forward_task = tokio::spawn(forward_results(result_rx, out_tx.clone()));

        let mut current_stream: Option<Arc<Stream>> = None;

        let dispatch_result = loop {
            match reader.read_frame::<ServerRequest>().await {
                Ok(request) => {
                    let outcome = self
                        .handle_request(request, &connection_id, &mut current_stream, &out_tx, &result_tx)
                        .await;
                    if let Err(error) = outcome {
                        break Err(error);
                    }
                }
                Err(FrameError::Closed) => break Ok(()),
                Err(error) => break Err(error.into()),
            }
        };

        if let Some(stream) = &current_stream {
            stream.responders.unregister(&connection_id);
        }
        drop(out_tx);
        drop(result_tx);
        let _ = writer_task.await;
        let _ = result_forward_task.await;

        dispatch_result
    }

    async fn handle_request(
        &self,
        request: ServerRequest,
        connection_id: &str,
        current_stream: &mut Option<Arc<Stream>>,
        out_tx: &mpsc::Sender<ServerResponse>,
        result_tx: &mpsc::Sender<RecordResult>,
    ) -> anyhow::Result<()> {
        match request {
            ServerRequest::InformInit { stream_id, mut settings } => {
                if settings.api_key.is_none() {
                    settings.api_key = resolve_api_key(&settings.base_url);
                }
                let stream = Arc::new(Stream::spawn(settings));
                stream.responders.register(connection_id.to_owned(), result_tx.clone());
                self.state
                    .streams
                    .add_stream(stream_id, stream.clone())
                    .map_err(anyhow::Error::new)?;
                *current_stream = Some(stream);
            }
            ServerRequest::InformStart { .. } => {
                // Reserved: the client drives RunStart itself via
                // RecordCommunicate(Request::RunStart).
            }
            ServerRequest::InformAttach { stream_id } => {
                if let Ok(stream) = self.state.streams.get_stream(&stream_id) {
                    stream.responders.register(connection_id.to_owned(), result_tx.clone());
                    let settings = stream.settings.clone();
                    *current_stream = Some(stream);
                    let _ = out_tx.send(ServerResponse::InformAttachResponse { settings }).await;
                }
            }
            ServerRequest::InformFinish { stream_id } => {
                if let Ok(stream) = self.state.streams.get_stream(&stream_id) {
                    stream.close().await;
                    let _ = self.state.streams.remove_stream(&stream_id);
                }
            }
            ServerRequest::InformTeardown { exit_code } => {
                self.state.streams.finish_and_close_all_streams(exit_code).await;
                self.state.shutdown_handle.signal();
            }
            ServerRequest::RecordPublish(mut record) => {
                record.control.connection_id = connection_id.to_owned();
                if let Some(stream) = current_stream {
                    stream.handle_record(record).await;
                } else {
                    warn!(peer_addr = %self.peer_addr, "RecordPublish before InformInit/InformAttach");
                }
            }
            ServerRequest::RecordCommunicate(mut record) => {
                record.control.connection_id = connection_id.to_owned();
                if let Some(stream) = current_stream {
                    stream.handle_record(record).await;
                } else {
                    warn!(peer_addr = %self.peer_addr, "RecordCommunicate before InformInit/InformAttach");
                }
            }
        }
        Ok(())
    }
}

fn resolve_api_key(base_url: &str) -> Option<String> {
    let host = url::Url::parse(base_url).ok()?.host_str()?.to_owned();
    crate::netrc::lookup_password(&host).ok().flatten()
}

async fn run_writer<W: tokio::io::AsyncWrite + Unpin>(mut writer: FrameWriter<W>, mut out_rx: mpsc::Receiver<ServerResponse>) {
    while let Some(response) = out_rx.recv().await {
        if let Err(error) = writer.write_frame(&response).await {
            error!(%error, "failed to write response frame");
            break;
        }
    }
}

async fn forward_results(mut result_rx: mpsc::Receiver<RecordResult>, out_tx: mpsc::Sender<ServerResponse>) {
    while let Some(result) = result_rx.recv().await {
        if out_tx.send(ServerResponse::ResultCommunicate(result)).await.is_err() {
            break;
        }
    }
}
