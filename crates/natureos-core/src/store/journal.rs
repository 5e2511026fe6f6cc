// ── Append-only store journal ──
//
// One JSON object per line. Records are written before the in-memory
// change becomes visible; command records are fsynced so a queued
// command survives a crash. Replay applies records in file order, and an
// unreadable line (typically a torn final write) is skipped with a warning.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::CoreError;
use crate::model::{Cursor, Entity, EntityKey, SensorReading, SeriesKey, Versioned};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum JournalRecord {
    Put {
        key: EntityKey,
        record: Versioned<Entity>,
    },
    Remove {
        key: EntityKey,
    },
    Reading {
        reading: SensorReading,
    },
    Evict {
        series: SeriesKey,
        before: Cursor,
    },
}

pub(crate) struct Journal {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl Journal {
    /// Open (creating if needed) and return every readable record.
    pub(crate) fn open(path: &Path) -> Result<(Self, Vec<JournalRecord>), CoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| CoreError::persistence("creating journal directory", e))?;
        }

        let records = if path.exists() {
            read_records(path)?
        } else {
            Vec::new()
        };

        let file = append_handle(path)?;
        Ok((
            Self {
                path: path.to_owned(),
                writer: Mutex::new(BufWriter::new(file)),
            },
            records,
        ))
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record. `durable` forces it to stable storage.
    pub(crate) fn append(&self, record: &JournalRecord, durable: bool) -> Result<(), CoreError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut writer = self.lock()?;
        writer
            .write_all(&line)
            .and_then(|()| writer.flush())
            .map_err(|e| CoreError::persistence("writing journal", e))?;
        if durable {
            writer
                .get_ref()
                .sync_data()
                .map_err(|e| CoreError::persistence("syncing journal", e))?;
        }
        Ok(())
    }

    /// Replace the journal with `records`, atomically via rename.
    pub(crate) fn rewrite(&self, records: &[JournalRecord]) -> Result<(), CoreError> {
        let mut writer = self.lock()?;
        let tmp = self.path.with_extension("compact");
        {
            let file = File::create(&tmp).map_err(|e| CoreError::persistence("creating compacted journal", e))?;
            let mut out = BufWriter::new(file);
            for record in records {
                serde_json::to_writer(&mut out, record)?;
                out.write_all(b"\n")
                    .map_err(|e| CoreError::persistence("writing compacted journal", e))?;
            }
            out.flush()
                .and_then(|()| out.get_ref().sync_all())
                .map_err(|e| CoreError::persistence("syncing compacted journal", e))?;
        }
        fs::rename(&tmp, &self.path).map_err(|e| CoreError::persistence("replacing journal", e))?;
        *writer = BufWriter::new(append_handle(&self.path)?);
        debug!(path = %self.path.display(), records = records.len(), "journal compacted");
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BufWriter<File>>, CoreError> {
        self.writer
            .lock()
            .map_err(|_| CoreError::Internal("journal writer lock poisoned".into()))
    }
}

fn append_handle(path: &Path) -> Result<File, CoreError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| CoreError::persistence("opening journal", e))
}

fn read_records(path: &Path) -> Result<Vec<JournalRecord>, CoreError> {
    let file = File::open(path).map_err(|e| CoreError::persistence("reading journal", e))?;
    let mut records = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| CoreError::persistence("reading journal", e))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(record) => records.push(record),
            Err(e) => warn!(
                path = %path.display(),
                line = index + 1,
                error = %e,
                "skipping unreadable journal record"
            ),
        }
    }
    Ok(records)
}
