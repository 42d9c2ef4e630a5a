//! The per-tenant committed-flag registry.
//!
//! A single bucket, keyed by 8-byte big-endian integers. Key `0` mirrors the
//! most recently committed flag (the sentinel); keys `1..N` are committed
//! flags in commit order.

use std::path::PathBuf;

use crate::error::CResult;
use crate::storage::bucket_engine::BucketEngine;

const BUCKET: &[u8] = b"flag_list";

pub struct Registry {
    engine: BucketEngine,
}

fn encode_key(n: u64) -> [u8; 8] {
    n.to_be_bytes()
}

fn decode_key(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_be_bytes(buf)
}

impl Registry {
    pub fn open(path: PathBuf) -> CResult<Self> {
        let mut engine = BucketEngine::open(path)?;
        engine.create_bucket_if_absent(BUCKET);
        Ok(Self { engine })
    }

    /// Numeric keys present in the registry, excluding the sentinel, sorted
    /// descending (highest/most recent first).
    fn committed_keys_desc(&self) -> Vec<u64> {
        let Some(bucket) = self.engine.get_bucket(BUCKET) else { return Vec::new() };
        let mut keys: Vec<u64> =
            bucket.keys().map(|k| decode_key(k)).filter(|&n| n != 0).collect();
        keys.sort_unstable_by(|a, b| b.cmp(a));
        keys
    }

    /// Value mirrored at the sentinel key `0`.
    pub fn sentinel(&mut self) -> CResult<Option<Vec<u8>>> {
        self.engine.get(BUCKET, &encode_key(0))
    }

    /// The highest-numbered committed entry, if any.
    pub fn max_entry(&mut self) -> CResult<Option<(u64, Vec<u8>)>> {
        let Some(&n) = self.committed_keys_desc().first() else { return Ok(None) };
        let flag = self.engine.get(BUCKET, &encode_key(n))?.unwrap_or_default();
        Ok(Some((n, flag)))
    }

    pub fn flag_at(&mut self, n: u64) -> CResult<Option<Vec<u8>>> {
        self.engine.get(BUCKET, &encode_key(n))
    }

    /// Returns the flag that needs rolling back if the sentinel and the
    /// max-numbered entry disagree — including the case where the sentinel
    /// was never written at all (a crash on the very first commit, before
    /// `finalize_sentinel` ever ran).
    pub fn crash_recovery_target(&mut self) -> CResult<Option<Vec<u8>>> {
        let Some((_, max_flag)) = self.max_entry()? else { return Ok(None) };
        let sentinel = self.sentinel()?;
        if sentinel.as_deref() == Some(max_flag.as_slice()) {
            Ok(None)
        } else {
            Ok(Some(max_flag))
        }
    }

    /// Commit step 1: reserves registry slot `next = max + 1` for `flag`,
    /// returning `next` and, if ring-buffer eviction is due, the flag whose
    /// history file the caller should remove.
    pub fn reserve_next(&mut self, flag: &[u8], history_max: u64) -> CResult<(u64, Option<Vec<u8>>)> {
        let next = self.committed_keys_desc().first().map_or(1, |&n| n + 1);
        let evict = if next > history_max { self.flag_at(next - history_max)? } else { None };

        let mut tx = self.engine.begin_write();
        tx.put(BUCKET, &encode_key(next), flag);
        tx.commit()?;
        Ok((next, evict))
    }

    /// Commit step 5: points the sentinel at the just-committed flag.
    pub fn finalize_sentinel(&mut self, flag: &[u8]) -> CResult<()> {
        let mut tx = self.engine.begin_write();
        tx.put(BUCKET, &encode_key(0), flag);
        tx.commit()
    }

    /// Rollback step 3: deletes the max-numbered entry and re-points the
    /// sentinel at the new head (empty if none remain).
    pub fn pop_head(&mut self) -> CResult<()> {
        let keys = self.committed_keys_desc();
        let Some(&head) = keys.first() else { return Ok(()) };
        let new_head_flag = match keys.get(1) {
            Some(&n) => self.engine.get(BUCKET, &encode_key(n))?.unwrap_or_default(),
            None => Vec::new(),
        };

        let mut tx = self.engine.begin_write();
        tx.delete(BUCKET, &encode_key(head));
        tx.put(BUCKET, &encode_key(0), &new_head_flag);
        tx.commit()
    }

    pub fn flush(&mut self) -> CResult<()> {
        self.engine.flush()
    }
}
