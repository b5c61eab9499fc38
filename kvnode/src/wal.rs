//! Write-ahead log: every mutating command is appended here, fsynced, and
//! only then applied to the store. On startup the log is replayed in full
//! before the node accepts any client connection.
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::Path;
use std::sync::Mutex;

use wire::resp::{self, RespCodecError};
use wire::CommandError;

/// One decoded WAL entry: the command name plus its arguments, exactly as
/// they were appended.
pub struct WalRecord {
    pub fields: Vec<Vec<u8>>,
}

impl WalRecord {
    pub fn command(&self) -> Option<&[u8]> {
        self.fields.first().map(|f| f.as_slice())
    }
}

/// Append-only handle to the log file. `append` does not return until the
/// bytes are fsynced, so a caller that has received `Ok` from `append` knows
/// the record will survive a crash.
pub struct WalWriter {
    file: Mutex<File>,
}

impl WalWriter {
    pub fn open(path: &Path) -> Result<Self, CommandError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| CommandError::Wal(format!("cannot open WAL file: {e}")))?;
        Ok(WalWriter {
            file: Mutex::new(file),
        })
    }

    pub fn append(&self, fields: &[Vec<u8>]) -> Result<(), CommandError> {
        let record = resp::encode_record(fields);
        let mut file = self.file.lock().expect("WAL writer lock poisoned");
        file.write_all(&record)
            .map_err(|e| CommandError::Wal(format!("WAL append failed: {e}")))?;
        file.flush()
            .map_err(|e| CommandError::Wal(format!("WAL flush failed: {e}")))?;
        file.sync_all()
            .map_err(|e| CommandError::Wal(format!("WAL fsync failed: {e}")))?;
        Ok(())
    }
}

/// Reads every record from a WAL file in order. A truncated or malformed
/// tail fails the whole replay rather than silently dropping the bad
/// record — a corrupt log is a reason to stop and investigate, not guess.
pub fn replay(path: &Path) -> Result<Vec<WalRecord>, CommandError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path)
        .map_err(|e| CommandError::Wal(format!("cannot open WAL file for replay: {e}")))?;
    let mut reader = BufReader::new(file);
    let mut records = Vec::new();
    loop {
        match resp::decode_record(&mut reader) {
            Ok(fields) => records.push(WalRecord { fields }),
            Err(RespCodecError::Eof) => break,
            Err(other) => {
                return Err(CommandError::Wal(format!(
                    "WAL replay stopped at record {}: {other}",
                    records.len()
                )));
            }
        }
    }
    Ok(records)
}
