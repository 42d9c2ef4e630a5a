//! A single-file, multi-bucket, single-writer log-structured store.
//!
//! This is the concrete (and only) implementor of the external bucket
//! engine contract the flag manager is built against: one flat keyspace per
//! named bucket, all sharing one log file, with write-batch transactions (a
//! sequence of puts/deletes across any number of buckets, made durable
//! atomically by a trailing commit marker) since the flag manager needs to
//! write several buckets together and have the whole batch survive a crash
//! or none of it.
//!
//! Like `LogCask`, all live keys must fit in memory: an index maps
//! `(bucket, key) -> (value_pos, value_len)` in the log file, and reads
//! fetch the value bytes from disk on demand.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use fs4::FileExt;

use crate::error::CResult;
use crate::storage::record::{self, PendingOp, Record};
use crate::storage::Status;

type Index = BTreeMap<Vec<u8>, BTreeMap<Vec<u8>, (u64, u32)>>;

pub struct BucketEngine {
    path: PathBuf,
    file: File,
    index: Index,
}

impl BucketEngine {
    /// Opens or creates a bucket file, taking out an exclusive lock that is
    /// held until the engine is dropped.
    pub fn open(path: PathBuf) -> CResult<Self> {
        Self::open_with_lock(path, true)
    }

    pub fn open_with_lock(path: PathBuf, try_lock: bool) -> CResult<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let file = std::fs::OpenOptions::new().read(true).write(true).create(true).open(&path)?;
        if try_lock {
            file.try_lock_exclusive()?;
        }

        let mut engine = Self { path, file, index: Index::new() };
        engine.rebuild_index()?;
        Ok(engine)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replays the log, folding each committed batch into the index and
    /// truncating any trailing, never-committed batch — the multi-bucket
    /// analogue of `Log::build_keydir`'s truncate-on-incomplete-entry logic.
    fn rebuild_index(&mut self) -> CResult<()> {
        let file_len = self.file.metadata()?.len();
        let mut r = BufReader::new(&mut self.file);
        r.seek(SeekFrom::Start(0))?;

        let mut pos = 0u64;
        let mut last_good_pos = 0u64;
        let mut pending: Vec<(Vec<u8>, Vec<u8>, Option<(u64, u32)>)> = Vec::new();
        let mut index = Index::new();

        loop {
            match record::read_record(&mut r, pos) {
                Ok(Some((Record::Data(d), end_pos))) => {
                    pending.push((d.bucket, d.key, d.value_pos_len));
                    pos = end_pos;
                }
                Ok(Some((Record::Commit, end_pos))) => {
                    for (bucket, key, value_pos_len) in pending.drain(..) {
                        let b = index.entry(bucket).or_default();
                        match value_pos_len {
                            Some(pl) => {
                                b.insert(key, pl);
                            }
                            None => {
                                b.remove(&key);
                            }
                        }
                    }
                    pos = end_pos;
                    last_good_pos = pos;
                }
                Ok(None) => {
                    if !pending.is_empty() {
                        log::warn!(
                            "{}: discarding uncommitted tail at offset {}, truncating to {}",
                            self.path.display(),
                            pos,
                            last_good_pos
                        );
                    }
                    break;
                }
                Err(err) => {
                    log::warn!(
                        "{}: {} at offset {}, truncating to {}",
                        self.path.display(),
                        err,
                        pos,
                        last_good_pos
                    );
                    break;
                }
            }
        }

        drop(r);
        if last_good_pos < file_len {
            self.file.set_len(last_good_pos)?;
        }
        self.index = index;
        Ok(())
    }

    pub fn create_bucket_if_absent(&mut self, bucket: &[u8]) {
        self.index.entry(bucket.to_vec()).or_default();
    }

    pub fn get_bucket(&self, bucket: &[u8]) -> Option<&BTreeMap<Vec<u8>, (u64, u32)>> {
        self.index.get(bucket)
    }

    pub fn bucket_names(&self) -> impl Iterator<Item = &Vec<u8>> {
        self.index.keys()
    }

    pub fn get(&mut self, bucket: &[u8], key: &[u8]) -> CResult<Option<Vec<u8>>> {
        let Some((pos, len)) = self.index.get(bucket).and_then(|b| b.get(key)).copied() else {
            return Ok(None);
        };
        Ok(Some(self.read_value(pos, len)?))
    }

    fn read_value(&mut self, pos: u64, len: u32) -> CResult<Vec<u8>> {
        let mut value = vec![0u8; len as usize];
        self.file.seek(SeekFrom::Start(pos))?;
        self.file.read_exact(&mut value)?;
        Ok(value)
    }

    /// First key in bucket order, or `None` if the bucket is empty/absent.
    pub fn cursor_first(&self, bucket: &[u8]) -> Option<Vec<u8>> {
        self.index.get(bucket)?.keys().next().cloned()
    }

    /// Key directly after `prev` in the bucket. If `prev` is empty, returns
    /// the first key. If `prev` is non-empty and isn't itself present in
    /// the bucket, returns `None` (this is a seek, not a "next after or
    /// equal" scan).
    pub fn cursor_next(&self, bucket: &[u8], prev: &[u8]) -> Option<Vec<u8>> {
        let map = self.index.get(bucket)?;
        if prev.is_empty() {
            return map.keys().next().cloned();
        }
        if !map.contains_key(prev) {
            return None;
        }
        map.range::<[u8], _>((
            std::ops::Bound::Excluded(prev),
            std::ops::Bound::Unbounded,
        ))
        .next()
        .map(|(k, _)| k.clone())
    }

    pub fn last_key(&self, bucket: &[u8]) -> Option<Vec<u8>> {
        self.index.get(bucket)?.keys().next_back().cloned()
    }

    pub fn foreach_in_bucket(
        &mut self,
        bucket: &[u8],
        mut f: impl FnMut(&[u8], &[u8]) -> CResult<()>,
    ) -> CResult<()> {
        let entries: Vec<(Vec<u8>, (u64, u32))> = match self.index.get(bucket) {
            Some(b) => b.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            None => return Ok(()),
        };
        for (key, (pos, len)) in entries {
            let value = self.read_value(pos, len)?;
            f(&key, &value)?;
        }
        Ok(())
    }

    pub fn begin_write(&mut self) -> WriteBatch<'_> {
        WriteBatch { engine: self, ops: Vec::new() }
    }

    pub fn flush(&mut self) -> CResult<()> {
        Ok(self.file.sync_all()?)
    }

    pub fn status(&self) -> CResult<Status> {
        let keys: u64 = self.index.values().map(|b| b.len() as u64).sum();
        let size: u64 = self
            .index
            .iter()
            .flat_map(|(bucket, b)| b.iter().map(move |(k, (_, len))| bucket.len() as u64 + k.len() as u64 + *len as u64))
            .sum();
        Ok(Status { name: "bucket engine".to_string(), keys, size })
    }
}

impl Drop for BucketEngine {
    fn drop(&mut self) {
        if let Err(error) = self.flush() {
            log::error!("{}: failed to flush on drop: {}", self.path.display(), error);
        }
    }
}

/// A batch of puts/deletes across any number of buckets, applied atomically
/// on `commit`. Dropping a `WriteBatch` without calling `commit` is a
/// rollback: nothing was ever written to the file.
pub struct WriteBatch<'a> {
    engine: &'a mut BucketEngine,
    ops: Vec<PendingOp>,
}

impl<'a> WriteBatch<'a> {
    pub fn create_bucket_if_absent(&mut self, bucket: &[u8]) {
        self.engine.create_bucket_if_absent(bucket);
    }

    pub fn put(&mut self, bucket: &[u8], key: &[u8], value: &[u8]) {
        self.ops.push(PendingOp { bucket: bucket.to_vec(), key: key.to_vec(), value: Some(value.to_vec()) });
    }

    pub fn delete(&mut self, bucket: &[u8], key: &[u8]) {
        self.ops.push(PendingOp { bucket: bucket.to_vec(), key: key.to_vec(), value: None });
    }

    /// Appends the whole batch to the log followed by a commit marker,
    /// fsyncs, then folds the batch into the in-memory index.
    pub fn commit(self) -> CResult<()> {
        if self.ops.is_empty() {
            return Ok(());
        }
        let positions = record::write_batch(&mut self.engine.file, &self.ops)?;
        self.engine.file.sync_all()?;
        for (op, (pos, len)) in self.ops.into_iter().zip(positions) {
            let bucket_index = self.engine.index.entry(op.bucket).or_default();
            match op.value {
                Some(value) => {
                    let value_len = value.len() as u32;
                    bucket_index.insert(op.key, (pos + len as u64 - value_len as u64, value_len));
                }
                None => {
                    bucket_index.remove(&op.key);
                }
            }
        }
        Ok(())
    }

    /// Explicit rollback, for symmetry with the §6.1 contract. Equivalent to
    /// dropping the batch.
    pub fn rollback(self) {}
}
