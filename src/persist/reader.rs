//! Journal reader
//!
//! Reads the journal back for startup replay. A truncated or corrupt tail
//! record marks the end of the recoverable prefix: everything before it is
//! returned, the tail is discarded (the documented partial-durability
//! window under non-`always` sync levels).

use super::record::{JournalRecord, RecordError};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use tracing::{info, warn};

/// Result of scanning a journal file.
pub struct JournalScan {
    /// Records up to the last valid one, in append order
    pub records: Vec<JournalRecord>,
    /// Bytes covered by the valid prefix
    pub valid_bytes: usize,
    /// True when the file ended mid-record or on a corrupt record
    pub truncated: bool,
}

/// Journal reader
pub struct JournalReader {
    data: Vec<u8>,
}

impl JournalReader {
    /// Load a journal file into memory.
    pub fn load<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        Ok(JournalReader { data })
    }

    /// Parse all records, stopping at the first invalid one.
    pub fn scan(&self) -> JournalScan {
        let mut records = Vec::new();
        let mut pos = 0;
        let mut truncated = false;

        while pos < self.data.len() {
            match JournalRecord::from_bytes(&self.data[pos..]) {
                Ok((record, size)) => {
                    records.push(record);
                    pos += size;
                }
                Err(RecordError::Truncated) => {
                    warn!(
                        offset = pos,
                        trailing = self.data.len() - pos,
                        "journal ends mid-record; discarding partial tail"
                    );
                    truncated = true;
                    break;
                }
                Err(RecordError::Corrupt(reason)) => {
                    warn!(
                        offset = pos,
                        %reason,
                        "corrupt journal record; replay stops at the last valid record"
                    );
                    truncated = true;
                    break;
                }
            }
        }

        if !truncated {
            info!(records = records.len(), "journal loaded cleanly");
        }

        JournalScan {
            records,
            valid_bytes: pos,
            truncated,
        }
    }

    /// Total size of the loaded journal data.
    pub fn size(&self) -> usize {
        self.data.len()
    }
}
