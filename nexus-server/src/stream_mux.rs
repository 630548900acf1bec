//! Process-wide registry from `stream_id` to [`crate::stream::Stream`].
//!
//! Guarded by a reader/writer lock rather than an actor/mailbox pattern:
//! lookups vastly outnumber inserts/removals, and every operation here is a
//! plain map access with no suspension point, so there is nothing an actor
//! would buy beyond indirection.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::stream::Stream;

#[derive(Debug, thiserror::Error)]
pub enum StreamMuxError {
    #[error("stream {0} already exists")]
    AlreadyExists(String),
    #[error("stream {0} not found")]
    NotFound(String),
}

#[derive(Default)]
pub struct StreamMux {
    streams: RwLock<HashMap<String, Arc<Stream>>>,
}

impl StreamMux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_stream(&self, id: String, stream: Arc<Stream>) -> Result<(), StreamMuxError> {
        let mut streams = self.streams.write();
        if streams.contains_key(&id) {
            return Err(StreamMuxError::AlreadyExists(id));
        }
        streams.insert(id, stream);
        Ok(())
    }

    pub fn get_stream(&self, id: &str) -> Result<Arc<Stream>, StreamMuxError> {
        self.streams
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StreamMuxError::NotFound(id.to_owned()))
    }

    pub fn remove_stream(&self, id: &str) -> Result<Arc<Stream>, StreamMuxError> {
        self.streams
            .write()
            .remove(id)
            .ok_or_else(|| StreamMuxError::NotFound(id.to_owned()))
    }

    pub fn len(&self) -> usize {
        self.streams.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.read().is_empty()
    }

    /// Drains every remaining stream in parallel: inject a synthetic Exit
    /// record with `always_send=true`, wait for its pipeline to drain, then
    /// remove it from the registry.
    pub async fn finish_and_close_all_streams(&self, exit_code: i32) {
        let remaining: Vec<(String, Arc<Stream>)> = {
            let streams = self.streams.read();
            streams.iter().map(|(id, s)| (id.clone(), Arc::clone(s))).collect()
        };

        let closes = remaining.iter().map(|(_, stream)| stream.finish_with_exit_code(exit_code));
        futures::future::join_all(closes).await;

        let mut streams = self.streams.write();
        for (id, _) in remaining {
            streams.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;

    fn noop_stream() -> Arc<Stream> {
        Arc::new(Stream::spawn_for_test(Settings::default()))
    }

    #[test]
    fn add_then_get_round_trips() {
        let mux = StreamMux::new();
        let stream = noop_stream();
        mux.add_stream("s1".to_owned(), Arc::clone(&stream)).unwrap();
        assert!(mux.get_stream("s1").is_ok());
    }

    #[test]
    fn duplicate_add_fails() {
        let mux = StreamMux::new();
        mux.add_stream("s1".to_owned(), noop_stream()).unwrap();
        let err = mux.add_stream("s1".to_owned(), noop_stream()).unwrap_err();
        assert!(matches!(err, StreamMuxError::AlreadyExists(id) if id == "s1"));
    }

    #[test]
    fn missing_get_fails() {
        let mux = StreamMux::new();
        let err = mux.get_stream("missing").unwrap_err();
        assert!(matches!(err, StreamMuxError::NotFound(id) if id == "missing"));
    }
}
