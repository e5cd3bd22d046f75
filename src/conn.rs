//! Thin adapter over the embedded storage engine: connection opening,
//! pragma application with set-and-verify, positional blob I/O, and
//! classification of the engine's failure codes.

use crate::config::CacheConfig;
use crate::error::CacheError;
use rusqlite::blob::Blob;
use rusqlite::limits::Limit;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode, OpenFlags, OptionalExtension};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

static MEMORY_DB_SEQ: AtomicU64 = AtomicU64::new(0);

/// A shared-cache in-memory target unique to one cache instance, so every
/// pooled connection sees the same database and separate caches stay apart.
pub(crate) fn shared_memory_uri() -> String {
    format!(
        "file:blobcache-mem-{}?mode=memory&cache=shared",
        MEMORY_DB_SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

pub(crate) fn open_conn(target: &str, cfg: &CacheConfig) -> Result<Connection, CacheError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(target, flags)?;
    conn.busy_timeout(cfg.busy_timeout)?;
    Ok(conn)
}

/// Applies the per-connection pragmas. Runs on every pooled connection,
/// after the one-time schema init.
pub(crate) fn init_conn(conn: &Connection, cfg: &CacheConfig) -> Result<(), CacheError> {
    set_pragma(conn, "foreign_keys", "on")?;
    // Required so the orphan-blob trigger still fires for deletes cascaded
    // from the keys table.
    set_pragma(conn, "recursive_triggers", "on")?;
    if let Some(level) = cfg.set_synchronous {
        set_and_verify_pragma(conn, "synchronous", &level.to_string())?;
    }
    if let Some(mode) = &cfg.set_journal_mode {
        set_journal_mode(conn, mode)?;
    }
    if let Some(mode) = &cfg.set_locking_mode {
        set_and_verify_pragma(conn, "locking_mode", mode)?;
    }
    if cfg.mmap_size >= 0 {
        // The engine clamps this to its hard limit; not verified.
        set_pragma(conn, "mmap_size", &cfg.mmap_size.to_string())?;
    }
    if let Some(cache_size) = cfg.cache_size {
        set_and_verify_pragma(conn, "cache_size", &cache_size.to_string())?;
    }
    if let Some(limit) = cfg.journal_size_limit {
        set_and_verify_pragma(conn, "journal_size_limit", &limit.to_string())?;
    }
    if let Some(max_pages) = cfg.max_page_count {
        // Clamped to the current page count when set below it; not verified.
        set_pragma(conn, "max_page_count", &max_pages.to_string())?;
    }
    if let Some(limit) = cfg.length_limit {
        let _ = conn.set_limit(Limit::SQLITE_LIMIT_LENGTH, limit);
    }
    Ok(())
}

/// Retries `f` while it fails Busy, firing the config's one-shot signal the
/// first time so a blocking writer can be coordinated away. Used only for
/// initial schema/pragma work on fresh connections.
pub(crate) fn retry_busy_on_init<T>(
    cfg: &CacheConfig,
    mut f: impl FnMut() -> Result<T, CacheError>,
) -> Result<T, CacheError> {
    let mut fired = false;
    loop {
        match f() {
            Err(CacheError::Busy) => {
                if !fired {
                    fired = true;
                    if let Some(signal) = &cfg.conn_blocked_on_busy {
                        let _ = signal.try_send(());
                    }
                }
                warn!("connection init blocked on a competing writer, retrying");
            }
            other => return other,
        }
    }
}

/// Runs a query that must produce at most one row. A second row can only
/// mean the schema or the storage layer is corrupt, so it halts the
/// process instead of silently reading a wrong row.
pub(crate) fn query_single_row<T>(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
    map: impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
) -> Result<Option<T>, CacheError> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query_map(params, map)?;
    let first = match rows.next() {
        None => return Ok(None),
        Some(row) => row?,
    };
    if rows.next().is_some() {
        panic!("{sql:?} returned more than one row");
    }
    Ok(Some(first))
}

fn value_ref_text(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => String::new(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(r) => r.to_string(),
        ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned(),
        ValueRef::Blob(_) => "<blob>".to_owned(),
    }
}

/// Runs a pragma statement, returning the first column of its result row
/// if the engine produced one.
fn exec_pragma(conn: &Connection, sql: &str) -> Result<Option<String>, CacheError> {
    let row = conn
        .query_row(sql, [], |row| row.get_ref(0).map(value_ref_text))
        .optional()?;
    Ok(row)
}

pub(crate) fn set_pragma(conn: &Connection, name: &str, value: &str) -> Result<(), CacheError> {
    exec_pragma(conn, &format!("pragma {name}={value}"))?;
    Ok(())
}

pub(crate) fn read_pragma(conn: &Connection, name: &str) -> Result<Option<String>, CacheError> {
    exec_pragma(conn, &format!("pragma {name}"))
}

pub(crate) fn read_pragma_i64(conn: &Connection, name: &str) -> Result<i64, CacheError> {
    let value = conn.query_row(&format!("pragma {name}"), [], |row| row.get::<_, i64>(0))?;
    Ok(value)
}

/// Sets a pragma and reads the applied value back, failing on mismatch.
/// Pragmas the engine documents as silently clamped go through
/// [`set_pragma`] instead.
pub(crate) fn set_and_verify_pragma(
    conn: &Connection,
    name: &str,
    value: &str,
) -> Result<(), CacheError> {
    let mut actual = exec_pragma(conn, &format!("pragma {name}={value}"))?;
    if actual.is_none() {
        actual = read_pragma(conn, name)?;
    }
    let Some(actual) = actual else {
        return Err(CacheError::PragmaMismatch {
            name: name.to_owned(),
            requested: value.to_owned(),
            actual: "<no value returned>".to_owned(),
        });
    };
    if !actual.eq_ignore_ascii_case(value) {
        return Err(CacheError::PragmaMismatch {
            name: name.to_owned(),
            requested: value.to_owned(),
            actual,
        });
    }
    Ok(())
}

/// Journal mode gets its own error so callers can match on the mode the
/// engine actually settled on.
pub(crate) fn set_journal_mode(conn: &Connection, mode: &str) -> Result<(), CacheError> {
    let actual = exec_pragma(conn, &format!("pragma journal_mode={mode}"))?
        .unwrap_or_default();
    if !actual.eq_ignore_ascii_case(mode) {
        return Err(CacheError::UnexpectedJournalMode(actual));
    }
    Ok(())
}

/// True when the engine reports the blob handle was invalidated by a peer
/// modifying its row (abort) or by the handle being expired (invalid blob).
/// The caller reopens the handle and resumes.
pub(crate) fn sqlite_err_invalidated_handle(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(failure, msg) => {
            failure.code == ErrorCode::OperationAborted
                || msg
                    .as_deref()
                    .map_or(false, |m| m.contains("invalid blob"))
        }
        _ => false,
    }
}

pub(crate) fn io_err_invalidated_handle(err: &io::Error) -> bool {
    err.get_ref()
        .and_then(|inner| inner.downcast_ref::<rusqlite::Error>())
        .map(sqlite_err_invalidated_handle)
        .unwrap_or(false)
}

/// Converts a blob I/O failure back into the cache taxonomy, unwrapping the
/// engine error the bindings stuffed into the io::Error so Busy and Full
/// keep their identities.
pub(crate) fn cache_err_from_blob_io(err: io::Error) -> CacheError {
    let kind = err.kind();
    match err.into_inner() {
        Some(inner) => match inner.downcast::<rusqlite::Error>() {
            Ok(sqlite_err) => CacheError::from(*sqlite_err),
            Err(other) => CacheError::Io(io::Error::new(kind, other)),
        },
        None => CacheError::Io(kind.into()),
    }
}

/// Positional read against one blob handle. A short count means the
/// physical end of this segment.
pub(crate) fn blob_read_at(blob: &mut Blob<'_>, buf: &mut [u8], off: u64) -> io::Result<usize> {
    blob.seek(SeekFrom::Start(off))?;
    let mut n = 0;
    while n < buf.len() {
        let got = blob.read(&mut buf[n..])?;
        if got == 0 {
            break;
        }
        n += got;
    }
    Ok(n)
}

/// Positional write against one blob handle. Segments are never resized, so
/// a short count means the write ran into the end of the segment.
pub(crate) fn blob_write_at(blob: &mut Blob<'_>, buf: &[u8], off: u64) -> io::Result<usize> {
    blob.seek(SeekFrom::Start(off))?;
    let mut n = 0;
    while n < buf.len() {
        let put = blob.write(&buf[n..])?;
        if put == 0 {
            break;
        }
        n += put;
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::{
        blob_read_at, blob_write_at, query_single_row, set_and_verify_pragma, set_journal_mode,
    };
    use crate::error::{CacheError, CacheErrorCode};
    use rusqlite::{Connection, DatabaseName};

    #[test]
    fn single_row_queries_pass_through_zero_or_one_row() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch("create table t (x integer)").expect("ddl");
        let none =
            query_single_row(&conn, "select x from t", [], |row| row.get::<_, i64>(0))
                .expect("empty");
        assert_eq!(none, None);

        conn.execute("insert into t values (7)", []).expect("insert");
        let one =
            query_single_row(&conn, "select x from t", [], |row| row.get::<_, i64>(0))
                .expect("single");
        assert_eq!(one, Some(7));
    }

    #[test]
    #[should_panic(expected = "more than one row")]
    fn single_row_queries_halt_on_a_second_row() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch("create table t (x integer); insert into t values (1), (2);")
            .expect("ddl");
        let _ = query_single_row(&conn, "select x from t", [], |row| row.get::<_, i64>(0));
    }

    #[test]
    fn set_and_verify_roundtrips_synchronous() {
        let conn = Connection::open_in_memory().expect("open");
        set_and_verify_pragma(&conn, "synchronous", "2").expect("verify");
    }

    #[test]
    fn journal_mode_mismatch_is_reported() {
        // In-memory databases only support the memory journal, so asking
        // for wal must surface the mode the engine actually kept.
        let conn = Connection::open_in_memory().expect("open");
        let err = set_journal_mode(&conn, "wal").expect_err("must not be honored");
        match &err {
            CacheError::UnexpectedJournalMode(mode) => {
                assert!(mode.eq_ignore_ascii_case("memory"), "got {mode:?}")
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.code(), CacheErrorCode::UnexpectedJournalMode);
    }

    #[test]
    fn positional_blob_io_roundtrips() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch("create table b (data blob)").expect("ddl");
        conn.execute("insert into b (data) values (zeroblob(16))", [])
            .expect("insert");
        let rowid = conn.last_insert_rowid();

        let mut blob = conn
            .blob_open(DatabaseName::Main, "b", "data", rowid, false)
            .expect("open blob");
        assert_eq!(blob_write_at(&mut blob, b"hello", 3).expect("write"), 5);

        let mut back = [0u8; 5];
        assert_eq!(blob_read_at(&mut blob, &mut back, 3).expect("read"), 5);
        assert_eq!(&back, b"hello");

        // Reads past the end of the segment come back short.
        let mut tail = [0u8; 8];
        assert_eq!(blob_read_at(&mut blob, &mut tail, 12).expect("read"), 4);
    }
}
