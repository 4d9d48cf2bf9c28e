//! Downloaded log files
//!
//! Layout under the data directory:
//!
//! ```text
//! logs/
//!   <indexer>.json         one JSON encoded log per line, ascending
//!   <indexer>.index.json   BlockIdentifier the file is complete up to
//! ```
//!
//! The log file is append-only. The index file is replaced atomically after
//! each fetch, so a file with logs past its index only means a fetch was
//! interrupted; the next fetch resumes after the last log.

use crate::provider::Log;
use chainstore_core::error::{Error, Result};
use chainstore_core::BlockIdentifier;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Lines, Write};
use std::path::{Path, PathBuf};

/// Per-indexer log files under one data directory.
#[derive(Debug, Clone)]
pub struct LogStorage {
    dir: PathBuf,
}

impl LogStorage {
    /// Log files of the data directory `data_dir`.
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: data_dir.as_ref().join("logs"),
        }
    }

    /// Directory holding the log files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of `indexer`'s log file.
    pub fn logs_path(&self, indexer: &str) -> PathBuf {
        self.dir.join(format!("{}.json", indexer))
    }

    /// Path of `indexer`'s index file.
    pub fn index_path(&self, indexer: &str) -> PathBuf {
        self.dir.join(format!("{}.index.json", indexer))
    }

    /// Block `indexer`'s logs are complete up to, if fetched before.
    pub fn load_last_index(&self, indexer: &str) -> Result<Option<BlockIdentifier>> {
        match fs::read(self.index_path(indexer)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace `indexer`'s index file.
    pub fn write_index(&self, indexer: &str, block: &BlockIdentifier) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.index_path(indexer);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(block)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Last log in `indexer`'s file.
    pub fn load_last_log(&self, indexer: &str) -> Result<Option<Log>> {
        let mut last = None;
        for log in self.read_logs(indexer)? {
            last = Some(log?);
        }
        Ok(last)
    }

    /// Open `indexer`'s log file for appending, creating it if needed.
    pub fn appender(&self, indexer: &str) -> Result<LogAppender> {
        fs::create_dir_all(&self.dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.logs_path(indexer))?;
        Ok(LogAppender {
            out: BufWriter::new(file),
            written: 0,
        })
    }

    /// `indexer`'s logs in file order. A missing file reads as empty.
    pub fn read_logs(&self, indexer: &str) -> Result<LogReader> {
        let lines = match File::open(self.logs_path(indexer)) {
            Ok(file) => Some(BufReader::new(file).lines()),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(LogReader {
            indexer: indexer.to_string(),
            lines,
            line_no: 0,
        })
    }

    /// All `indexers`' logs merged by `(block, transaction index, log index)`.
    pub fn merged_logs<'n>(
        &self,
        indexers: impl IntoIterator<Item = &'n str>,
    ) -> Result<MergedLogs> {
        let sources = indexers
            .into_iter()
            .map(|name| self.read_logs(name))
            .collect::<Result<Vec<_>>>()?;
        Ok(MergedLogs::new(sources))
    }
}

/// Buffered appender to one log file.
#[derive(Debug)]
pub struct LogAppender {
    out: BufWriter<File>,
    written: usize,
}

impl LogAppender {
    /// Append one log as a JSON line.
    pub fn append(&mut self, log: &Log) -> Result<()> {
        let mut line = serde_json::to_vec(log)?;
        line.push(b'\n');
        self.out.write_all(&line)?;
        self.written += 1;
        Ok(())
    }

    /// Logs appended through this appender.
    pub fn written(&self) -> usize {
        self.written
    }

    /// Flush buffered lines and sync the file.
    pub fn finish(mut self) -> Result<usize> {
        self.out.flush()?;
        self.out.get_ref().sync_data()?;
        Ok(self.written)
    }
}

/// Iterator over one log file.
#[derive(Debug)]
pub struct LogReader {
    indexer: String,
    lines: Option<Lines<BufReader<File>>>,
    line_no: usize,
}

impl Iterator for LogReader {
    type Item = Result<Log>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.as_mut()?.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(e.into())),
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            return Some(serde_json::from_str(&line).map_err(|e| {
                Error::Decode(format!(
                    "{} line {}: {}",
                    self.indexer, self.line_no, e
                ))
            }));
        }
    }
}

// ============================================================================
// K-way merge
// ============================================================================

struct Head {
    log: Log,
    source: usize,
}

impl Head {
    fn sort_key(&self) -> ((u64, u64, u64), usize) {
        (self.log.ordinal(), self.source)
    }
}

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}

impl Eq for Head {}

impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Head {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

/// Several log files merged in chain order.
///
/// Each file must already be sorted; only one log per file is buffered.
pub struct MergedLogs {
    sources: Vec<LogReader>,
    heap: BinaryHeap<Reverse<Head>>,
    primed: bool,
}

impl MergedLogs {
    fn new(sources: Vec<LogReader>) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(sources.len()),
            sources,
            primed: false,
        }
    }

    fn pull(&mut self, source: usize) -> Result<()> {
        if let Some(log) = self.sources[source].next().transpose()? {
            self.heap.push(Reverse(Head { log, source }));
        }
        Ok(())
    }
}

impl Iterator for MergedLogs {
    type Item = Result<Log>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.primed {
            self.primed = true;
            for source in 0..self.sources.len() {
                if let Err(e) = self.pull(source) {
                    return Some(Err(e));
                }
            }
        }

        let Reverse(head) = self.heap.pop()?;
        if let Err(e) = self.pull(head.source) {
            return Some(Err(e));
        }
        Some(Ok(head.log))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, Bytes};
    use tempfile::TempDir;

    fn log(block_number: u64, transaction_index: u64, log_index: u64) -> Log {
        Log {
            address: Address::ZERO,
            topics: Vec::new(),
            data: Bytes::new(),
            block_number,
            block_hash: format!("0x{:x}", block_number),
            transaction_index,
            log_index,
            transaction_hash: None,
        }
    }

    fn write(storage: &LogStorage, indexer: &str, logs: &[Log]) {
        let mut appender = storage.appender(indexer).unwrap();
        for log in logs {
            appender.append(log).unwrap();
        }
        appender.finish().unwrap();
    }

    #[test]
    fn test_missing_files_read_as_empty() {
        let tmp = TempDir::new().unwrap();
        let storage = LogStorage::new(tmp.path());
        assert!(storage.load_last_index("token").unwrap().is_none());
        assert!(storage.load_last_log("token").unwrap().is_none());
        assert_eq!(storage.read_logs("token").unwrap().count(), 0);
    }

    #[test]
    fn test_append_resumes_and_index_round_trips() {
        let tmp = TempDir::new().unwrap();
        let storage = LogStorage::new(tmp.path());
        write(&storage, "token", &[log(1, 0, 0), log(2, 0, 0)]);
        write(&storage, "token", &[log(5, 1, 3)]);

        assert_eq!(storage.load_last_log("token").unwrap(), Some(log(5, 1, 3)));
        assert_eq!(storage.read_logs("token").unwrap().count(), 3);

        let block = BlockIdentifier::new(9, "0x9");
        storage.write_index("token", &block).unwrap();
        assert_eq!(storage.load_last_index("token").unwrap(), Some(block));
        assert!(tmp.path().join("logs/token.index.json").exists());
    }

    #[test]
    fn test_merged_logs_in_chain_order() {
        let tmp = TempDir::new().unwrap();
        let storage = LogStorage::new(tmp.path());
        write(&storage, "a", &[log(1, 0, 0), log(3, 2, 5), log(7, 0, 0)]);
        write(&storage, "b", &[log(1, 1, 1), log(3, 0, 2), log(4, 0, 0)]);
        write(&storage, "c", &[]);

        let merged: Vec<(u64, u64, u64)> = storage
            .merged_logs(["a", "b", "c"])
            .unwrap()
            .map(|l| l.unwrap().ordinal())
            .collect();
        assert_eq!(
            merged,
            vec![(1, 0, 0), (1, 1, 1), (3, 0, 2), (3, 2, 5), (4, 0, 0), (7, 0, 0)]
        );
    }

    #[test]
    fn test_corrupt_line_is_decode_error() {
        let tmp = TempDir::new().unwrap();
        let storage = LogStorage::new(tmp.path());
        write(&storage, "token", &[log(1, 0, 0)]);
        fs::write(storage.logs_path("token"), "{not json}\n").unwrap();

        let err = storage.load_last_log("token").unwrap_err();
        assert!(err.to_string().contains("token line 1"));
    }
}
