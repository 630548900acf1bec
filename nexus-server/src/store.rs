//! Append-only per-run record log, persisted via [`crate::record_log`].
//!
//! The Store is single-writer: the only caller is [`crate::writer::Writer`],
//! which already serializes access through its own task, so no internal
//! locking is needed here.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write as _};

use camino::Utf8Path;

use crate::proto::Record;
use crate::record_log;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to open store file {path}: {source}")]
    Open {
        path: camino::Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize record: {0}")]
    Encode(#[from] bincode::Error),
    #[error("failed to append record: {0}")]
    Append(#[source] std::io::Error),
}

pub struct Store {
    file: BufWriter<File>,
}

impl Store {
    pub fn create(path: &Utf8Path) -> Result<Self, StoreError> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|source| StoreError::Open {
                path: path.to_owned(),
                source,
            })?;

        record_log::write_header(&mut file).map_err(StoreError::Append)?;
        file.flush().map_err(StoreError::Append)?;

        Ok(Self {
            file: BufWriter::new(file),
        })
    }

    /// Appends exactly one serialized Record as one logical log record.
    pub fn append(&mut self, record: &Record) -> Result<(), StoreError> {
        let payload = bincode::serialize(record)?;
        record_log::write_record(&mut self.file, &payload).map_err(StoreError::Append)?;
        self.file.flush().map_err(StoreError::Append)?;
        Ok(())
    }
}

/// Reads every record back out of a store file, in append order. Used by
/// tests exercising the round-trip property in the testable-properties
/// section of the design.
pub fn replay(path: &Utf8Path) -> Result<Vec<Record>, StoreError> {
    use std::io::BufReader;

    let file = File::open(path).map_err(|source| StoreError::Open {
        path: path.to_owned(),
        source,
    })?;
    let mut reader = BufReader::new(file);
    record_log::read_header(&mut reader).map_err(StoreError::Append)?;

    let mut records = Vec::new();
    while let Some(payload) = record_log::read_record(&mut reader).map_err(StoreError::Append)? {
        records.push(bincode::deserialize(&payload)?);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{Control, RecordKind, RunRecord};

    fn sample_record(run_id: &str) -> Record {
        Record {
            control: Control {
                connection_id: "c1".to_owned(),
                ..Default::default()
            },
            kind: RecordKind::Run(RunRecord {
                run_id: run_id.to_owned(),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn append_then_replay_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(dir.path()).unwrap().join("run.log");

        let mut store = Store::create(&path).unwrap();
        store.append(&sample_record("r1")).unwrap();
        store.append(&sample_record("r2")).unwrap();
        drop(store);

        let records = replay(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], sample_record("r1"));
        assert_eq!(records[1], sample_record("r2"));
    }
}
