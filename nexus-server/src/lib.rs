#[macro_use]
extern crate tracing;

pub mod artifact;
pub mod config;
pub mod connection;
pub mod filestream;
pub mod graphql;
pub mod handler;
pub mod log;
pub mod metadata;
pub mod monitor;
pub mod netrc;
pub mod portfile;
pub mod proto;
pub mod record_log;
pub mod retry;
pub mod sender;
pub mod server;
pub mod service;
pub mod settings;
pub mod store;
pub mod stream;
pub mod stream_mux;
pub mod uploader;
pub mod wire;
pub mod writer;

use std::sync::Arc;

use config::ConfHandle;
use nexus_task::{ShutdownHandle, ShutdownSignal};
use stream_mux::StreamMux;

/// Shared state handed to every task spawned by the service.
#[derive(Clone)]
pub struct NexusState {
    pub conf_handle: ConfHandle,
    pub streams: Arc<StreamMux>,
    pub shutdown_signal: ShutdownSignal,
    pub shutdown_handle: ShutdownHandle,
}
