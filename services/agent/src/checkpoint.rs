//! Durable record streams.
//!
//! Checkpoints are length-prefixed streams of self-describing records: a
//! little-endian `u32` byte count followed by the record serialised as
//! tagged JSON. Per-node info files hold exactly one record and are
//! written atomically (write-aside then rename); update logs are
//! append-only and fsynced per record.
//!
//! A torn trailing record (crash mid-append) is expected and tolerated
//! on read: the stream ends at the last complete record.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use skiff_id::UpdateId;
use skiff_messages::{Endpoint, ExecutorInfo, FrameworkInfo, SlaveInfo, StatusUpdate, Task};

/// Everything the agent ever writes durably.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Record {
    /// The slave id behind the `latest` marker.
    SlaveId { slave_id: skiff_id::SlaveId },
    SlaveInfo(SlaveInfo),
    FrameworkInfo(FrameworkInfo),
    FrameworkPid { pid: Endpoint },
    ExecutorInfo(ExecutorInfo),
    /// The endpoint a registered executor spoke from, for reconnecting.
    ExecutorEndpoint { endpoint: Endpoint },
    Task(Task),
    Update(StatusUpdate),
    Ack { update_id: UpdateId },
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint serialisation error at {path}: {source}")]
    Serde {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl CheckpointError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn serde(path: &Path, source: serde_json::Error) -> Self {
        Self::Serde {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Atomically replaces the single-record file at `path`.
pub fn checkpoint(path: &Path, record: &Record) -> Result<(), CheckpointError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| CheckpointError::io(path, e))?;
    }

    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp).map_err(|e| CheckpointError::io(&tmp, e))?;
        write_record(&mut file, path, record)?;
        file.sync_data().map_err(|e| CheckpointError::io(&tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| CheckpointError::io(path, e))
}

/// Reads a single-record file; `Ok(None)` if it does not exist.
pub fn read_checkpoint(path: &Path) -> Result<Option<Record>, CheckpointError> {
    match read_records(path) {
        Ok(mut records) => Ok(records.pop()),
        Err(CheckpointError::Io { source, .. }) if source.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// An append-only record log.
pub struct RecordWriter {
    path: PathBuf,
    file: File,
}

impl RecordWriter {
    /// Opens the log for appending, creating parents as needed.
    pub fn open(path: &Path) -> Result<Self, CheckpointError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| CheckpointError::io(path, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| CheckpointError::io(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Appends one record and syncs it to disk.
    pub fn append(&mut self, record: &Record) -> Result<(), CheckpointError> {
        let path = self.path.clone();
        write_record(&mut self.file, &path, record)?;
        self.file
            .sync_data()
            .map_err(|e| CheckpointError::io(&path, e))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_record<W: Write>(w: &mut W, path: &Path, record: &Record) -> Result<(), CheckpointError> {
    let payload = serde_json::to_vec(record).map_err(|e| CheckpointError::serde(path, e))?;
    let len = payload.len() as u32;
    w.write_all(&len.to_le_bytes())
        .and_then(|_| w.write_all(&payload))
        .map_err(|e| CheckpointError::io(path, e))
}

/// Reads every complete record in the stream at `path`.
///
/// A truncated tail (torn write) ends the stream with a warning rather
/// than an error; a record that fails to deserialise is a real error.
pub fn read_records(path: &Path) -> Result<Vec<Record>, CheckpointError> {
    let mut file = File::open(path).map_err(|e| CheckpointError::io(path, e))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)
        .map_err(|e| CheckpointError::io(path, e))?;

    let mut records = Vec::new();
    let mut offset = 0usize;

    while offset < bytes.len() {
        if bytes.len() - offset < 4 {
            warn!(path = %path.display(), offset, "Truncated length prefix, dropping tail");
            break;
        }
        let len = u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap()) as usize;
        let start = offset + 4;
        if bytes.len() - start < len {
            warn!(path = %path.display(), offset, "Truncated record, dropping tail");
            break;
        }

        let record: Record = serde_json::from_slice(&bytes[start..start + len])
            .map_err(|e| CheckpointError::serde(path, e))?;
        records.push(record);
        offset = start + len;
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    use skiff_id::SlaveId;

    fn slave_info() -> SlaveInfo {
        SlaveInfo {
            hostname: "node-1".to_string(),
            resources: skiff_resources::Resources::parse("cpus:4;mem:1024").unwrap(),
            attributes: Default::default(),
            checkpoint: true,
        }
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("slave.info");

        let record = Record::SlaveInfo(slave_info());
        checkpoint(&path, &record).unwrap();

        assert_eq!(read_checkpoint(&path).unwrap(), Some(record));
    }

    #[test]
    fn test_checkpoint_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("latest");

        let first = SlaveId::new();
        let second = SlaveId::new();
        checkpoint(&path, &Record::SlaveId { slave_id: first }).unwrap();
        checkpoint(&path, &Record::SlaveId { slave_id: second }).unwrap();

        assert_eq!(
            read_checkpoint(&path).unwrap(),
            Some(Record::SlaveId { slave_id: second })
        );
    }

    #[test]
    fn test_read_checkpoint_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_checkpoint(&dir.path().join("absent")).unwrap().is_none());
    }

    #[test]
    fn test_record_log_appends_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("updates");

        let first = UpdateId::new();
        let second = UpdateId::new();
        {
            let mut writer = RecordWriter::open(&path).unwrap();
            writer.append(&Record::Ack { update_id: first }).unwrap();
            writer.append(&Record::Ack { update_id: second }).unwrap();
        }
        // Reopen appends rather than truncating.
        let third = UpdateId::new();
        {
            let mut writer = RecordWriter::open(&path).unwrap();
            writer.append(&Record::Ack { update_id: third }).unwrap();
        }

        let records = read_records(&path).unwrap();
        assert_eq!(
            records,
            vec![
                Record::Ack { update_id: first },
                Record::Ack { update_id: second },
                Record::Ack { update_id: third },
            ]
        );
    }

    #[test]
    fn test_torn_tail_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("updates");

        let update_id = UpdateId::new();
        {
            let mut writer = RecordWriter::open(&path).unwrap();
            writer.append(&Record::Ack { update_id }).unwrap();
        }

        // Simulate a crash mid-append: a length prefix promising more
        // bytes than were written.
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&100u32.to_le_bytes()).unwrap();
            file.write_all(b"{\"type\"").unwrap();
        }

        let records = read_records(&path).unwrap();
        assert_eq!(records, vec![Record::Ack { update_id }]);
    }
}
