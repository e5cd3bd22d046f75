//! Transaction scope over one leased connection: key operations, the
//! deferred access-time bookkeeping, and the commit sequence.

use crate::config::CacheConfig;
use crate::conn::{now_ms, query_single_row};
use crate::error::CacheError;
use crate::evict;
use crate::handle_cache::HandleCache;
use crate::pinned::PinnedBlob;
use rusqlite::types::Value;
use rusqlite::{params, Connection, ToSql};
use std::cell::RefCell;
use std::collections::HashSet;
use std::io;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxLevel {
    Deferred,
    Immediate,
}

impl TxLevel {
    pub(crate) fn begin_sql(self) -> &'static str {
        match self {
            TxLevel::Deferred => "begin deferred",
            TxLevel::Immediate => "begin immediate",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CreateOpts {
    pub length: i64,
}

/// A transaction borrows exactly one pooled connection for its lifetime.
/// Interior mutability lets pinned blobs share it immutably while the
/// handle cache and accessed-keys set evolve underneath.
pub struct Tx<'c> {
    pub(crate) conn: &'c Connection,
    cfg: &'c CacheConfig,
    write: bool,
    pub(crate) handles: RefCell<HandleCache<'c>>,
    accessed: RefCell<HashSet<i64>>,
}

impl<'c> Tx<'c> {
    pub(crate) fn new(conn: &'c Connection, cfg: &'c CacheConfig, write: bool) -> Self {
        Self {
            conn,
            cfg,
            write,
            handles: RefCell::new(HandleCache::new()),
            accessed: RefCell::new(HashSet::new()),
        }
    }

    pub fn is_writer(&self) -> bool {
        self.write
    }

    pub(crate) fn record_access(&self, key_id: i64) {
        self.accessed.borrow_mut().insert(key_id);
    }

    fn key_cols(&self, name: &str) -> Result<Option<(i64, i64)>, CacheError> {
        query_single_row(
            self.conn,
            "select key_id, length from keys where key = ?1",
            [name],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
    }

    fn require_key(&self, name: &str) -> Result<(i64, i64), CacheError> {
        let cols = self.key_cols(name)?.ok_or(CacheError::NotFound)?;
        self.record_access(cols.0);
        Ok(cols)
    }

    /// Creates `name` with a zero-filled value of `opts.length` bytes and
    /// returns a writable pinned handle. An existing key of the same
    /// length is reset in place, keeping its key row; a different length
    /// replaces the key. The value is laid out as `max_blob_size` segments
    /// with a possibly shorter final one.
    pub fn create(&self, name: &str, opts: CreateOpts) -> Result<PinnedBlob<'_, 'c>, CacheError> {
        if let Some((key_id, length)) = self.key_cols(name)? {
            if length == opts.length {
                // Unchanged length: the key row survives, key_id and
                // create_time included; only the payload is zeroed. Cached
                // handles go first, while they are still valid to close.
                self.handles.borrow_mut().remove_value(key_id)?;
                self.conn.execute(
                    "update blobs set blob = zeroblob(length(blob)) where blob_id in \
                     (select blob_id from \"values\" where value_id = ?1)",
                    [key_id],
                )?;
                self.record_access(key_id);
                return Ok(PinnedBlob::new(self, name.to_owned(), key_id, true));
            }
            self.delete(name)?;
        }
        let now = now_ms();
        self.conn.execute(
            "insert into keys (key, length, create_time, last_used, access_count) \
             values (?1, ?2, ?3, ?3, 0)",
            params![name, opts.length, now],
        )?;
        let key_id = self.conn.last_insert_rowid();
        let mut off = 0;
        while off < opts.length {
            let seg_len = (opts.length - off).min(self.cfg.max_blob_size);
            self.conn
                .execute("insert into blobs (blob) values (zeroblob(?1))", [seg_len])?;
            let blob_id = self.conn.last_insert_rowid();
            self.conn.execute(
                "insert into \"values\" (value_id, offset, blob_id) values (?1, ?2, ?3)",
                params![key_id, off, blob_id],
            )?;
            off += seg_len;
        }
        self.record_access(key_id);
        Ok(PinnedBlob::new(self, name.to_owned(), key_id, true))
    }

    /// Opens an existing key for writing. Equivalent to [`Tx::open_pinned`].
    pub fn open(&self, name: &str) -> Result<PinnedBlob<'_, 'c>, CacheError> {
        self.open_pinned(name)
    }

    pub fn open_pinned(&self, name: &str) -> Result<PinnedBlob<'_, 'c>, CacheError> {
        self.open_pinned_inner(name, true)
    }

    pub fn open_pinned_read_only(&self, name: &str) -> Result<PinnedBlob<'_, 'c>, CacheError> {
        self.open_pinned_inner(name, false)
    }

    fn open_pinned_inner(&self, name: &str, write: bool) -> Result<PinnedBlob<'_, 'c>, CacheError> {
        let (key_id, _) = self.require_key(name)?;
        Ok(PinnedBlob::new(self, name.to_owned(), key_id, write))
    }

    /// Replaces any existing value under `name` with `bytes`.
    pub fn put(&self, name: &str, bytes: &[u8]) -> Result<(), CacheError> {
        match self.delete(name) {
            Ok(()) | Err(CacheError::NotFound) => {}
            Err(err) => return Err(err),
        }
        let mut pb = self.create(
            name,
            CreateOpts {
                length: bytes.len() as i64,
            },
        )?;
        let wrote = pb.write_at(bytes, 0).map(drop);
        match (wrote, pb.close()) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(err), Ok(())) | (Ok(()), Err(err)) => Err(err),
            (Err(err), Err(close_err)) => Err(err.join(close_err)),
        }
    }

    /// Fills `buf` from the start of the value, failing with an unexpected
    /// end-of-input when the value is shorter than the buffer.
    pub fn read_full(&self, name: &str, buf: &mut [u8]) -> Result<usize, CacheError> {
        let (key_id, _) = self.require_key(name)?;
        self.read_full_value(key_id, buf)
    }

    pub(crate) fn read_full_value(
        &self,
        value_id: i64,
        buf: &mut [u8],
    ) -> Result<usize, CacheError> {
        let pb = PinnedBlob::for_value(self, value_id, false);
        let n = pb.read_at(buf, 0)?;
        if n < buf.len() {
            return Err(CacheError::Io(io::ErrorKind::UnexpectedEof.into()));
        }
        Ok(n)
    }

    /// Reads the entire value, reusing `buf`'s allocation where possible.
    pub fn read_all(&self, name: &str, mut buf: Vec<u8>) -> Result<Vec<u8>, CacheError> {
        let (key_id, length) = self.require_key(name)?;
        buf.resize(length as usize, 0);
        let n = self.read_full_value(key_id, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    pub fn set_tag<V: ToSql>(&self, name: &str, tag: &str, value: V) -> Result<(), CacheError> {
        let (key_id, _) = self.require_key(name)?;
        self.conn.execute(
            "insert or replace into tags (key_id, tag_name, value) values (?1, ?2, ?3)",
            params![key_id, tag, value],
        )?;
        Ok(())
    }

    /// Absent keys and absent tags both read back as `None`.
    pub fn get_tag(&self, name: &str, tag: &str) -> Result<Option<Value>, CacheError> {
        query_single_row(
            self.conn,
            "select t.value from tags t join keys k on k.key_id = t.key_id \
             where k.key = ?1 and t.tag_name = ?2",
            params![name, tag],
            |row| row.get::<_, Value>(0),
        )
    }

    pub fn delete(&self, name: &str) -> Result<(), CacheError> {
        let Some((key_id, _)) = self.key_cols(name)? else {
            return Err(CacheError::NotFound);
        };
        delete_key_by_id(self.conn, self.cfg.no_triggers, key_id)?;
        // The rowid may be reused by the next create; stale handles must not
        // alias onto it.
        self.handles.borrow_mut().remove_value(key_id)?;
        self.accessed.borrow_mut().remove(&key_id);
        Ok(())
    }

    /// Last-used time of `name`. Keys already touched by this transaction
    /// report the current time, since their update is pending until commit.
    pub fn last_used(&self, name: &str) -> Result<i64, CacheError> {
        let Some((key_id, _)) = self.key_cols(name)? else {
            return Err(CacheError::NotFound);
        };
        if self.accessed.borrow().contains(&key_id) {
            return Ok(now_ms());
        }
        query_single_row(
            self.conn,
            "select last_used from keys where key_id = ?1",
            [key_id],
            |row| row.get(0),
        )?
        .ok_or(CacheError::NotFound)
    }

    /// Ends the transaction: on a successful body, runs the commit sequence
    /// (close handles, trim capacity for writers, flush access updates,
    /// commit); otherwise rolls back. Rollback failures are joined onto the
    /// original error.
    pub(crate) fn finish<T>(mut self, result: Result<T, CacheError>) -> Result<T, CacheError> {
        let conn = self.conn;
        match result {
            Ok(value) => match self.prepare_commit() {
                Ok(()) => match conn.execute_batch("commit") {
                    Ok(()) => Ok(value),
                    Err(err) => Err(rollback_joining(conn, err.into())),
                },
                Err(err) => Err(rollback_joining(conn, err)),
            },
            Err(err) => Err(rollback_joining(conn, err)),
        }
    }

    fn prepare_commit(&mut self) -> Result<(), CacheError> {
        self.handles.borrow_mut().close_all()?;
        if self.write {
            evict::trim_to_capacity(self.conn, self.cfg, &mut self.accessed.borrow_mut())?;
        }
        self.flush_access_updates()
    }

    fn flush_access_updates(&self) -> Result<(), CacheError> {
        let now = now_ms();
        for key_id in self.accessed.borrow().iter() {
            let updated = self.conn.execute(
                "update keys set last_used = ?1, access_count = access_count + 1 \
                 where key_id = ?2",
                params![now, key_id],
            );
            match updated {
                Ok(_) => {}
                Err(err) => {
                    let err: CacheError = err.into();
                    if !self.write && matches!(err, CacheError::Busy) {
                        // Best-effort bookkeeping: a reader never waits on a
                        // competing writer just to bump access counters.
                        debug!(key_id, "skipping access update, writer holds the lock");
                        continue;
                    }
                    return Err(err);
                }
            }
        }
        Ok(())
    }
}

/// Deletes one key row and everything hanging off it. With triggers the
/// cascade handles segments and orphan blobs; without, the cleanup is
/// explicit and ordered so the blob FK is never violated.
pub(crate) fn delete_key_by_id(
    conn: &Connection,
    no_triggers: bool,
    key_id: i64,
) -> Result<(), CacheError> {
    if no_triggers {
        let blob_ids: Vec<i64> = conn
            .prepare("select blob_id from \"values\" where value_id = ?1")?
            .query_map([key_id], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        conn.execute("delete from \"values\" where value_id = ?1", [key_id])?;
        for blob_id in blob_ids {
            conn.execute("delete from blobs where blob_id = ?1", [blob_id])?;
        }
    }
    let deleted = conn.execute("delete from keys where key_id = ?1", [key_id])?;
    if deleted == 0 {
        return Err(CacheError::NotFound);
    }
    if deleted > 1 {
        panic!("deleted {deleted} key rows for key_id {key_id}");
    }
    Ok(())
}

fn rollback_joining(conn: &Connection, err: CacheError) -> CacheError {
    match conn.execute_batch("rollback") {
        Ok(()) => err,
        Err(rollback_err) => {
            warn!(error = %rollback_err, "rollback failed after transaction error");
            err.join(rollback_err.into())
        }
    }
}
