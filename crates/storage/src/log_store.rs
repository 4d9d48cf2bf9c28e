//! Ordered on-disk log-structured backend
//!
//! All keys live in an ordered in-memory map. Every committed batch is first
//! appended to `segment.log` as one CRC-framed record (see [`crate::segment`])
//! and only then applied to the map, so the map can always be rebuilt by
//! replaying the segment. A torn or corrupt record at the tail is cut off on
//! open; everything before it was acknowledged and survives.
//!
//! An append that fails part way is cut back to the last acknowledged record
//! before the error is returned, so a torn record never sits in front of
//! later batches. If the cut fails as well the store refuses further writes.
//!
//! The segment only grows. [`LogStructuredStorage::compact`] rewrites it as a
//! single record holding the live entries.

use crate::kv::{collect_page, range_bounds, KeyValueStorage, Mutation, ScanStart};
use crate::segment::{decode_segment, encode_record, SegmentRecord};
use chainstore_core::error::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Segment file name inside the store directory.
pub const SEGMENT_FILE_NAME: &str = "segment.log";

const COMPACT_FILE_NAME: &str = "segment.log.compact";

/// Options for [`LogStructuredStorage`].
#[derive(Debug, Clone, Copy)]
pub struct LogStoreOptions {
    /// fsync the segment after every batch
    pub sync_writes: bool,
}

impl Default for LogStoreOptions {
    fn default() -> Self {
        Self { sync_writes: true }
    }
}

/// Log-structured key-value store backed by one append-only segment.
pub struct LogStructuredStorage {
    dir: PathBuf,
    options: LogStoreOptions,
    data: RwLock<BTreeMap<String, Vec<u8>>>,
    writer: Mutex<SegmentWriter>,
}

/// File operations the segment writer needs.
trait SegmentFile: Write + Send {
    fn sync_data(&self) -> io::Result<()>;
    fn set_len(&self, len: u64) -> io::Result<()>;
}

impl SegmentFile for File {
    fn sync_data(&self) -> io::Result<()> {
        File::sync_data(self)
    }

    fn set_len(&self, len: u64) -> io::Result<()> {
        File::set_len(self, len)
    }
}

/// Append handle on the segment.
///
/// `len` is the length of the acknowledged prefix of the file.
struct SegmentWriter {
    file: Box<dyn SegmentFile>,
    len: u64,
    poisoned: bool,
}

impl SegmentWriter {
    fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Box::new(file),
            len,
            poisoned: false,
        })
    }

    fn append(&mut self, bytes: &[u8], sync: bool) -> Result<()> {
        if self.poisoned {
            return Err(Error::Storage(
                "segment holds a torn record that could not be truncated; reopen the store"
                    .to_string(),
            ));
        }
        if let Err(e) = self.write_record(bytes, sync) {
            self.rollback();
            return Err(e.into());
        }
        self.len += bytes.len() as u64;
        Ok(())
    }

    fn write_record(&mut self, bytes: &[u8], sync: bool) -> io::Result<()> {
        self.file.write_all(bytes)?;
        self.file.flush()?;
        if sync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    fn rollback(&mut self) {
        match self.file.set_len(self.len) {
            Ok(()) => warn!(
                target: "chainstore::storage",
                len = self.len,
                "Truncated segment after failed append"
            ),
            Err(e) => {
                self.poisoned = true;
                error!(
                    target: "chainstore::storage",
                    len = self.len,
                    error = %e,
                    "Could not truncate segment after failed append, refusing writes"
                );
            }
        }
    }
}

impl LogStructuredStorage {
    /// Open or create a store in `dir`, replaying its segment.
    pub fn open(dir: impl AsRef<Path>, options: LogStoreOptions) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let path = dir.join(SEGMENT_FILE_NAME);

        let mut data = BTreeMap::new();
        if path.exists() {
            let mut bytes = Vec::new();
            File::open(&path)?.read_to_end(&mut bytes)?;

            let (records, valid_len, failure) = decode_segment(&bytes);
            if let Some(failure) = failure {
                warn!(
                    target: "chainstore::storage",
                    path = %path.display(),
                    valid_len,
                    file_len = bytes.len(),
                    ?failure,
                    "Discarding torn segment tail"
                );
                let file = OpenOptions::new().write(true).open(&path)?;
                file.set_len(valid_len as u64)?;
                file.sync_all()?;
            }

            for record in &records {
                apply_record(&mut data, record);
            }
            info!(
                target: "chainstore::storage",
                records = records.len(),
                keys = data.len(),
                "Replayed segment"
            );
        }

        let writer = SegmentWriter::open(&path)?;

        Ok(Self {
            dir,
            options,
            data: RwLock::new(data),
            writer: Mutex::new(writer),
        })
    }

    /// Directory holding the segment.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// True if the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Size of the segment on disk in bytes.
    pub fn segment_len(&self) -> Result<u64> {
        Ok(fs::metadata(self.dir.join(SEGMENT_FILE_NAME))?.len())
    }

    /// Rewrite the segment as one record of live entries.
    ///
    /// The new segment is written beside the old one and renamed over it, so
    /// a crash during compaction leaves the old segment intact.
    pub fn compact(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        let data = self.data.read();

        let live: Vec<Mutation> = data
            .iter()
            .map(|(k, v)| Mutation::put(k.clone(), v.clone()))
            .collect();
        let bytes = encode_record(&SegmentRecord::Batch(live))?;

        let tmp_path = self.dir.join(COMPACT_FILE_NAME);
        let path = self.dir.join(SEGMENT_FILE_NAME);
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&bytes)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;
        *writer = SegmentWriter::open(&path)?;

        info!(
            target: "chainstore::storage",
            keys = data.len(),
            bytes = bytes.len(),
            "Compacted segment"
        );
        Ok(())
    }

    fn append(&self, record: SegmentRecord) -> Result<()> {
        let bytes = encode_record(&record)?;

        // Writer lock is held across the map update so that map order
        // matches segment order.
        let mut writer = self.writer.lock();
        writer.append(&bytes, self.options.sync_writes)?;

        let mut data = self.data.write();
        apply_record(&mut data, &record);
        debug!(target: "chainstore::storage", bytes = bytes.len(), "Appended segment record");
        Ok(())
    }
}

fn apply_record(data: &mut BTreeMap<String, Vec<u8>>, record: &SegmentRecord) {
    match record {
        SegmentRecord::Batch(mutations) => {
            for mutation in mutations {
                match mutation {
                    Mutation::Put { key, value } => {
                        data.insert(key.clone(), value.clone());
                    }
                    Mutation::Delete { key } => {
                        data.remove(key);
                    }
                }
            }
        }
        SegmentRecord::Clear => data.clear(),
    }
}

impl KeyValueStorage for LogStructuredStorage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        let data = self.data.read();
        Ok(keys.iter().map(|k| data.get(k).cloned()).collect())
    }

    fn apply_batch(&self, mutations: &[Mutation]) -> Result<()> {
        if mutations.is_empty() {
            return Ok(());
        }
        self.append(SegmentRecord::Batch(mutations.to_vec()))
    }

    fn scan_page(
        &self,
        start: ScanStart<'_>,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        let data = self.data.read();
        Ok(collect_page(data.range(range_bounds(start)), prefix, limit))
    }

    fn clear(&self) -> Result<()> {
        self.append(SegmentRecord::Clear)
    }
}

impl std::fmt::Debug for LogStructuredStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStructuredStorage")
            .field("dir", &self.dir)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
