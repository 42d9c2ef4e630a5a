//! On-disk record framing for the bucketed log file.
//!
//! Each record is one of:
//!
//! - a **data record**: tag byte `0`, bucket-name length as big-endian u16,
//!   bucket-name bytes, key length as big-endian u32, value length as
//!   big-endian i32 (`-1` for tombstones), key bytes, value bytes (omitted
//!   for tombstones).
//! - a **commit marker**: tag byte `1`, no payload.
//!
//! A write batch is durable only once its commit marker has been read back;
//! data records between two commit markers (or between the start of the
//! file and the first marker) that are never followed by a marker are
//! discarded on recovery as a torn trailing write.

use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::{CResult, Error};

pub const TAG_DATA: u8 = 0;
pub const TAG_COMMIT: u8 = 1;

/// One pending write, as queued by a `WriteBatch`.
pub struct PendingOp {
    pub bucket: Vec<u8>,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

/// Writes a full batch of data records followed by a commit marker, then
/// flushes. Returns the position and length of each record written, in
/// order.
pub fn write_batch<W: Write + Seek>(
    w: &mut W,
    ops: &[PendingOp],
) -> CResult<Vec<(u64, u32)>> {
    let mut positions = Vec::with_capacity(ops.len());
    for op in ops {
        let pos = w.seek(SeekFrom::End(0))?;
        let len = write_data_record(w, &op.bucket, &op.key, op.value.as_deref())?;
        positions.push((pos, len));
    }
    write_commit_marker(w)?;
    w.flush()?;
    Ok(positions)
}

fn write_data_record<W: Write>(
    w: &mut W,
    bucket: &[u8],
    key: &[u8],
    value: Option<&[u8]>,
) -> CResult<u32> {
    let bucket_len = bucket.len() as u16;
    let key_len = key.len() as u32;
    let value_len_or_tombstone = value.map_or(-1i32, |v| v.len() as i32);

    w.write_all(&[TAG_DATA])?;
    w.write_all(&bucket_len.to_be_bytes())?;
    w.write_all(bucket)?;
    w.write_all(&key_len.to_be_bytes())?;
    w.write_all(&value_len_or_tombstone.to_be_bytes())?;
    w.write_all(key)?;
    if let Some(value) = value {
        w.write_all(value)?;
    }

    let total = 1 + 2 + bucket.len() + 4 + 4 + key.len() + value.map_or(0, |v| v.len());
    Ok(total as u32)
}

fn write_commit_marker<W: Write>(w: &mut W) -> CResult<()> {
    w.write_all(&[TAG_COMMIT])?;
    Ok(())
}

/// One decoded data record, with the value's position/length left as an
/// offset into the file rather than read eagerly.
pub struct DecodedRecord {
    pub bucket: Vec<u8>,
    pub key: Vec<u8>,
    /// `None` for tombstones.
    pub value_pos_len: Option<(u64, u32)>,
}

/// Reads the next record starting at the reader's current position.
/// Returns `Ok(None)` at a clean end-of-file (no bytes at all before the
/// tag). Any error reading a *partial* record is surfaced via the
/// `Err(Error::IOFailure)` unexpected-eof path so the caller can truncate.
pub enum Record {
    Data(DecodedRecord),
    Commit,
}

pub fn read_record<R: Read + Seek>(r: &mut R, base_pos: u64) -> CResult<Option<(Record, u64)>> {
    let mut tag = [0u8; 1];
    match r.read_exact(&mut tag) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    match tag[0] {
        TAG_COMMIT => Ok(Some((Record::Commit, base_pos + 1))),
        TAG_DATA => {
            let mut u16_buf = [0u8; 2];
            read_exact_or_eof(r, &mut u16_buf)?;
            let bucket_len = u16::from_be_bytes(u16_buf) as usize;

            let mut bucket = vec![0u8; bucket_len];
            read_exact_or_eof(r, &mut bucket)?;

            let mut u32_buf = [0u8; 4];
            read_exact_or_eof(r, &mut u32_buf)?;
            let key_len = u32::from_be_bytes(u32_buf) as usize;

            let mut i32_buf = [0u8; 4];
            read_exact_or_eof(r, &mut i32_buf)?;
            let value_len_or_tombstone = i32::from_be_bytes(i32_buf);

            let mut key = vec![0u8; key_len];
            read_exact_or_eof(r, &mut key)?;

            let header_len = 1 + 2 + bucket_len + 4 + 4 + key_len;
            let value_pos = base_pos + header_len as u64;

            let value_pos_len = if value_len_or_tombstone >= 0 {
                let value_len = value_len_or_tombstone as u32;
                r.seek(SeekFrom::Current(value_len as i64))
                    .map_err(|_| eof_error())?;
                Some((value_pos, value_len))
            } else {
                None
            };

            let end_pos = value_pos + value_pos_len.map_or(0, |(_, l)| l as u64);
            Ok(Some((Record::Data(DecodedRecord { bucket, key, value_pos_len }), end_pos)))
        }
        other => Err(Error::IOFailure(format!("unknown record tag {other}"))),
    }
}

fn read_exact_or_eof<R: Read>(r: &mut R, buf: &mut [u8]) -> CResult<()> {
    r.read_exact(buf).map_err(|_| eof_error())
}

fn eof_error() -> Error {
    Error::IOFailure("unexpected eof mid-record".to_string())
}
