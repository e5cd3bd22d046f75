//! Random I/O over a value's full logical byte range, bound to an open
//! transaction. Physical segments are stitched together transparently:
//! cached handles are consumed first, remaining segments are queried in
//! offset order and their handles opened and cached on demand.

use crate::conn::{
    blob_read_at, blob_write_at, cache_err_from_blob_io, io_err_invalidated_handle,
    query_single_row,
};
use crate::error::CacheError;
use crate::handle_cache::CachedHandle;
use crate::tx::Tx;
use rusqlite::{params, Connection, DatabaseName};
use std::io;

/// A handle pinned to its transaction; invalid once the transaction ends or
/// the handle is closed.
pub struct PinnedBlob<'t, 'c> {
    key: String,
    value_id: i64,
    write: bool,
    tx: Option<&'t Tx<'c>>,
}

enum IoBuf<'b> {
    Read(&'b mut [u8]),
    Write(&'b [u8]),
}

impl IoBuf<'_> {
    fn total(&self) -> usize {
        match self {
            IoBuf::Read(buf) => buf.len(),
            IoBuf::Write(buf) => buf.len(),
        }
    }

    fn remaining(&self, done: usize) -> usize {
        self.total() - done
    }
}

impl<'t, 'c> PinnedBlob<'t, 'c> {
    pub(crate) fn new(tx: &'t Tx<'c>, key: String, value_id: i64, write: bool) -> Self {
        Self {
            key,
            value_id,
            write,
            tx: Some(tx),
        }
    }

    /// Internal handle for value-id-addressed reads, e.g. read_full.
    pub(crate) fn for_value(tx: &'t Tx<'c>, value_id: i64, write: bool) -> Self {
        Self::new(tx, String::new(), value_id, write)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_writable(&self) -> bool {
        self.write
    }

    fn tx(&self) -> Result<&'t Tx<'c>, CacheError> {
        self.tx.ok_or(CacheError::Closed)
    }

    /// Total logical length, straight from the keys row.
    pub fn length(&self) -> Result<i64, CacheError> {
        let tx = self.tx()?;
        value_length(tx.conn, self.value_id)
    }

    /// Detaches from the transaction. Idempotent; all later operations fail
    /// Closed.
    pub fn close(&mut self) -> Result<(), CacheError> {
        self.tx = None;
        Ok(())
    }

    /// Reads into `buf` starting at logical offset `off`. A short count is
    /// the end of the value; reading at or past the end returns zero.
    pub fn read_at(&self, buf: &mut [u8], off: i64) -> Result<usize, CacheError> {
        let tx = self.tx()?;
        if off < 0 {
            return Err(CacheError::Io(io::ErrorKind::InvalidInput.into()));
        }
        let len = value_length(tx.conn, self.value_id)?;
        if off >= len || buf.is_empty() {
            return Ok(0);
        }
        let n = self.io_at(tx, IoBuf::Read(buf), off, len)?;
        if n > 0 {
            tx.record_access(self.value_id);
        }
        Ok(n)
    }

    /// Writes `buf` at logical offset `off`. Values never grow: a write
    /// that would extend past the preallocated length fails OutOfBounds
    /// with nothing written.
    pub fn write_at(&self, buf: &[u8], off: i64) -> Result<usize, CacheError> {
        let tx = self.tx()?;
        let len = value_length(tx.conn, self.value_id)?;
        if off < 0 || off.saturating_add(buf.len() as i64) > len {
            return Err(CacheError::OutOfBounds);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let n = self.io_at(tx, IoBuf::Write(buf), off, len)?;
        if n > 0 {
            tx.record_access(self.value_id);
        }
        Ok(n)
    }

    fn io_at(
        &self,
        tx: &'t Tx<'c>,
        mut op: IoBuf<'_>,
        mut off: i64,
        len: i64,
    ) -> Result<usize, CacheError> {
        let total = op.total();
        let mut n = 0usize;
        'outer: while n < total && off < len {
            // Cached handles first: a single predecessor lookup finds the
            // segment that may contain the current offset.
            let cached = tx.handles.borrow().containing(self.value_id, off);
            if let Some(key) = cached {
                let t = self.segment_io(tx, key, &mut op, n, off)?;
                if t == 0 {
                    break;
                }
                n += t;
                off += t as i64;
                continue;
            }
            // Then everything the database still has from this offset on,
            // opening and caching each handle as it is consumed.
            let segments = remaining_segments(tx.conn, self.value_id, off)?;
            if segments.is_empty() {
                break;
            }
            for (seg_off, blob_id, _size) in segments {
                if n >= total || off >= len {
                    break 'outer;
                }
                if seg_off > off {
                    // Gap in the segment chain: nothing can satisfy this
                    // offset.
                    break 'outer;
                }
                self.ensure_handle(tx, seg_off, blob_id)?;
                let t = self.segment_io(tx, (self.value_id, seg_off), &mut op, n, off)?;
                if t == 0 {
                    break 'outer;
                }
                n += t;
                off += t as i64;
            }
            break;
        }
        Ok(n)
    }

    fn ensure_handle(&self, tx: &'t Tx<'c>, seg_off: i64, blob_id: i64) -> Result<(), CacheError> {
        let mut handles = tx.handles.borrow_mut();
        if handles.get_mut((self.value_id, seg_off)).is_none() {
            let handle = open_segment_handle(tx.conn, blob_id, self.write)?;
            handles.insert(self.value_id, seg_off, handle);
        }
        Ok(())
    }

    /// One physical transfer against the cached handle for `key`, with a
    /// single transparent reopen when the engine reports the handle was
    /// invalidated by a peer writer.
    fn segment_io(
        &self,
        tx: &'t Tx<'c>,
        key: (i64, i64),
        op: &mut IoBuf<'_>,
        done: usize,
        off: i64,
    ) -> Result<usize, CacheError> {
        let mut handles = tx.handles.borrow_mut();

        if matches!(op, IoBuf::Write(_)) {
            // A handle cached by an earlier reader may be read-only.
            let needs_upgrade = handles.get_mut(key).map_or(false, |h| !h.writable);
            if needs_upgrade {
                let old = handles.remove(key).expect("handle checked above");
                let fresh = open_segment_handle(tx.conn, old.blob_id, true)?;
                handles.insert(key.0, key.1, fresh);
            }
        }

        let handle = handles.get_mut(key).expect("segment handle must be cached");
        let seg_off = key.1;
        let read_off = off - seg_off;
        let size = handle.size();
        if read_off >= size {
            return Ok(0);
        }
        let want = op.remaining(done).min((size - read_off) as usize);
        let blob_id = handle.blob_id;
        let writable = handle.writable;

        match transfer(handle, op, done, want, read_off as u64) {
            Ok(t) => Ok(t),
            Err(err) if io_err_invalidated_handle(&err) => {
                // A peer modified the row under this handle; reopen the same
                // blob and resume from the progress already counted.
                handles.remove(key);
                let fresh = open_segment_handle(tx.conn, blob_id, writable)?;
                handles.insert(key.0, key.1, fresh);
                let handle = handles.get_mut(key).expect("reopened handle");
                transfer(handle, op, done, want, read_off as u64)
                    .map_err(cache_err_from_blob_io)
            }
            Err(err) => Err(cache_err_from_blob_io(err)),
        }
    }
}

fn transfer(
    handle: &mut CachedHandle<'_>,
    op: &mut IoBuf<'_>,
    done: usize,
    want: usize,
    read_off: u64,
) -> io::Result<usize> {
    match op {
        IoBuf::Read(buf) => blob_read_at(&mut handle.blob, &mut buf[done..done + want], read_off),
        IoBuf::Write(buf) => blob_write_at(&mut handle.blob, &buf[done..done + want], read_off),
    }
}

fn open_segment_handle(
    conn: &Connection,
    blob_id: i64,
    writable: bool,
) -> Result<CachedHandle<'_>, CacheError> {
    let blob = conn.blob_open(DatabaseName::Main, "blobs", "blob", blob_id, !writable)?;
    Ok(CachedHandle {
        blob_id,
        writable,
        blob,
    })
}

fn value_length(conn: &Connection, value_id: i64) -> Result<i64, CacheError> {
    query_single_row(
        conn,
        "select length from keys where key_id = ?1",
        [value_id],
        |row| row.get(0),
    )?
    .ok_or(CacheError::NotFound)
}

/// Segments of `value_id` that may contain byte `off` or anything after it,
/// in ascending offset order.
fn remaining_segments(
    conn: &Connection,
    value_id: i64,
    off: i64,
) -> Result<Vec<(i64, i64, i64)>, CacheError> {
    let rows = conn
        .prepare(
            "select v.offset, v.blob_id, length(b.blob) from \"values\" v \
             join blobs b on b.blob_id = v.blob_id \
             where v.value_id = ?1 and v.offset + length(b.blob) > ?2 \
             order by v.offset",
        )?
        .query_map(params![value_id, off], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?
        .collect::<Result<_, _>>()?;
    Ok(rows)
}
