pub mod config;
mod conn;
pub mod error;
mod evict;
mod handle_cache;
#[cfg(test)]
mod lib_tests;
mod pinned;
mod pool;
pub mod schema;
mod tx;

pub use crate::config::{AutoVacuum, CacheConfig, EvictionHook};
pub use crate::error::{CacheError, CacheErrorCode};
pub use crate::pinned::PinnedBlob;
pub use crate::tx::{CreateOpts, Tx, TxLevel};

use crate::pool::ConnPool;
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::ToSql;
use std::sync::mpsc::{self, Sender, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tempfile::TempDir;
use tracing::{info, warn};

/// The operations shared by single-shot and transactional surfaces, so
/// generic helpers compose either a [`Cache`] or a [`Tx`].
pub trait CacheOps {
    fn set_tag<V: ToSql>(&self, key: &str, tag: &str, value: V) -> Result<(), CacheError>;
    fn read_full(&self, key: &str, buf: &mut [u8]) -> Result<usize, CacheError>;
    fn read_all(&self, key: &str, buf: Vec<u8>) -> Result<Vec<u8>, CacheError>;
}

struct CacheInner {
    cfg: Arc<CacheConfig>,
    pool: ConnPool,
    /// Serializes immediate transactions across the whole cache so at most
    /// one writer is outstanding per instance.
    single_writer: Mutex<()>,
    /// Anonymous caches own the directory their database lives in.
    _anon_dir: Option<TempDir>,
}

impl CacheInner {
    fn run_tx<T>(
        &self,
        level: TxLevel,
        f: impl FnOnce(&Tx<'_>) -> Result<T, CacheError>,
    ) -> Result<T, CacheError> {
        let _writer = match level {
            TxLevel::Immediate => Some(self.single_writer.lock()),
            TxLevel::Deferred => None,
        };
        self.pool.with_conn(|conn| {
            conn.execute_batch(level.begin_sql())?;
            let tx = Tx::new(conn, self.cfg.as_ref(), level == TxLevel::Immediate);
            let result = f(&tx);
            tx.finish(result)
        })
    }
}

/// An embedded key→blob cache backed by a single database file. Values of
/// arbitrary size are stored as fixed-size segments and read or written
/// through byte-addressable handles; a persisted capacity bound is enforced
/// by least-recently-used eviction when writers commit.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

impl Cache {
    pub fn open(cfg: CacheConfig) -> Result<Cache, CacheError> {
        let mut anon_dir = None;
        let target = if cfg.memory {
            conn::shared_memory_uri()
        } else if cfg.path.as_os_str().is_empty() {
            let dir = TempDir::new()?;
            let target = dir.path().join("cache.db").to_string_lossy().into_owned();
            anon_dir = Some(dir);
            target
        } else {
            cfg.path.to_string_lossy().into_owned()
        };
        info!(db = %target, capacity = cfg.capacity, "opening cache");
        let cfg = Arc::new(cfg);
        let first = conn::open_conn(&target, &cfg)?;
        conn::retry_busy_on_init(&cfg, || schema::init_db(&first, &cfg))?;
        conn::retry_busy_on_init(&cfg, || conn::init_conn(&first, &cfg))?;
        let pool = ConnPool::new(target, cfg.clone(), first);
        Ok(Cache {
            inner: Arc::new(CacheInner {
                cfg,
                pool,
                single_writer: Mutex::new(()),
                _anon_dir: anon_dir,
            }),
        })
    }

    /// Runs `f` inside one transaction at the given isolation level.
    /// Immediate transactions hold the cache-wide writer lock for the whole
    /// call; deferred transactions may still upgrade on first write, in
    /// which case they block on the engine's own locking.
    pub fn run_tx<T>(
        &self,
        level: TxLevel,
        f: impl FnOnce(&Tx<'_>) -> Result<T, CacheError>,
    ) -> Result<T, CacheError> {
        self.inner.run_tx(level, f)
    }

    pub fn put(&self, key: &str, bytes: &[u8]) -> Result<(), CacheError> {
        self.run_tx(TxLevel::Immediate, |tx| tx.put(key, bytes))
    }

    pub fn read_full(&self, key: &str, buf: &mut [u8]) -> Result<usize, CacheError> {
        self.run_tx(TxLevel::Deferred, |tx| tx.read_full(key, buf))
    }

    pub fn read_all(&self, key: &str, buf: Vec<u8>) -> Result<Vec<u8>, CacheError> {
        self.run_tx(TxLevel::Deferred, |tx| tx.read_all(key, buf))
    }

    pub fn set_tag<V: ToSql>(&self, key: &str, tag: &str, value: V) -> Result<(), CacheError> {
        self.run_tx(TxLevel::Immediate, |tx| tx.set_tag(key, tag, value))
    }

    pub fn get_tag(&self, key: &str, tag: &str) -> Result<Option<Value>, CacheError> {
        self.run_tx(TxLevel::Deferred, |tx| tx.get_tag(key, tag))
    }

    pub fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.run_tx(TxLevel::Immediate, |tx| tx.delete(key))
    }

    /// A detached handle whose writes lazily create the key with the given
    /// length.
    pub fn blob_with_length(&self, key: &str, length: i64) -> BlobRef {
        BlobRef {
            cache: self.clone(),
            name: key.to_owned(),
            length: Some(length),
        }
    }

    /// A detached handle over an existing (or future) key. Every method
    /// runs its own transaction.
    pub fn blob_ref(&self, key: &str) -> BlobRef {
        BlobRef {
            cache: self.clone(),
            name: key.to_owned(),
            length: None,
        }
    }

    /// Creates `key` with a zero-filled value and returns a writable pinned
    /// handle holding its transaction open until closed. An existing value
    /// of the same length is reset in place; a different length replaces
    /// the key.
    pub fn create(&self, key: &str, opts: CreateOpts) -> Result<CachePinnedBlob, CacheError> {
        self.spawn_pinned(key.to_owned(), Some(opts))
    }

    /// A read-only pinned handle holding a deferred transaction open until
    /// closed, so repeated reads see one consistent snapshot.
    pub fn open_pinned_read_only(&self, key: &str) -> Result<CachePinnedBlob, CacheError> {
        self.spawn_pinned(key.to_owned(), None)
    }

    /// The persisted capacity in bytes; `None` means unlimited.
    pub fn get_capacity(&self) -> Result<Option<i64>, CacheError> {
        self.run_tx(TxLevel::Deferred, |tx| schema::read_capacity(tx.conn))
    }

    /// Closes the cache, waiting for outstanding transactions to finish.
    pub fn close(&self) -> Result<(), CacheError> {
        self.inner.pool.close()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.pool.is_closed()
    }

    /// A pinned handle is bound to one connection, so the facade keeps a
    /// dedicated task alive for its whole lifetime; requests are relayed to
    /// the task and the transaction ends when the handle closes.
    fn spawn_pinned(
        &self,
        name: String,
        create: Option<CreateOpts>,
    ) -> Result<CachePinnedBlob, CacheError> {
        let inner = self.inner.clone();
        let (req_tx, req_rx) = mpsc::channel::<PinnedReq>();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<i64, CacheError>>(1);
        let level = if create.is_some() {
            TxLevel::Immediate
        } else {
            TxLevel::Deferred
        };
        let task_name = name.clone();
        let join = thread::Builder::new()
            .name("blobcache-pinned".to_owned())
            .spawn(move || {
                let mut ready_slot = Some(ready_tx);
                let mut close_reply: Option<SyncSender<Result<(), CacheError>>> = None;
                let result = inner.run_tx(level, |tx| {
                    let opened = match create {
                        Some(opts) => tx.create(&task_name, opts),
                        None => tx.open_pinned_read_only(&task_name),
                    };
                    let pb = match opened.and_then(|pb| pb.length().map(|len| (pb, len))) {
                        Ok((pb, length)) => {
                            if let Some(ready) = ready_slot.take() {
                                let _ = ready.send(Ok(length));
                            }
                            pb
                        }
                        Err(err) => {
                            if let Some(ready) = ready_slot.take() {
                                let _ = ready.send(Err(err));
                            }
                            return Ok(());
                        }
                    };
                    loop {
                        match req_rx.recv() {
                            Ok(PinnedReq::ReadAt { off, len, reply }) => {
                                let mut buf = vec![0u8; len];
                                let res = match pb.read_at(&mut buf, off) {
                                    Ok(n) => {
                                        buf.truncate(n);
                                        Ok(buf)
                                    }
                                    Err(err) => Err(err),
                                };
                                let _ = reply.send(res);
                            }
                            Ok(PinnedReq::WriteAt { off, data, reply }) => {
                                let _ = reply.send(pb.write_at(&data, off));
                            }
                            Ok(PinnedReq::Close { reply }) => {
                                close_reply = Some(reply);
                                return Ok(());
                            }
                            // Handle dropped without close; commit whatever
                            // was done.
                            Err(_) => return Ok(()),
                        }
                    }
                });
                if let Some(ready) = ready_slot.take() {
                    let err = match result {
                        Ok(()) => CacheError::Closed,
                        Err(err) => err,
                    };
                    let _ = ready.send(Err(err));
                } else if let Some(reply) = close_reply {
                    let _ = reply.send(result);
                } else if let Err(err) = result {
                    warn!(error = %err, "pinned transaction ended with error");
                }
            })
            .map_err(CacheError::Io)?;

        match ready_rx.recv() {
            Ok(Ok(length)) => Ok(CachePinnedBlob {
                name,
                length,
                req: req_tx,
                join: Some(join),
                closed: false,
            }),
            Ok(Err(err)) => {
                let _ = join.join();
                Err(err)
            }
            Err(_) => {
                let _ = join.join();
                Err(CacheError::Closed)
            }
        }
    }
}

impl CacheOps for Cache {
    fn set_tag<V: ToSql>(&self, key: &str, tag: &str, value: V) -> Result<(), CacheError> {
        Cache::set_tag(self, key, tag, value)
    }

    fn read_full(&self, key: &str, buf: &mut [u8]) -> Result<usize, CacheError> {
        Cache::read_full(self, key, buf)
    }

    fn read_all(&self, key: &str, buf: Vec<u8>) -> Result<Vec<u8>, CacheError> {
        Cache::read_all(self, key, buf)
    }
}

impl CacheOps for Tx<'_> {
    fn set_tag<V: ToSql>(&self, key: &str, tag: &str, value: V) -> Result<(), CacheError> {
        Tx::set_tag(self, key, tag, value)
    }

    fn read_full(&self, key: &str, buf: &mut [u8]) -> Result<usize, CacheError> {
        Tx::read_full(self, key, buf)
    }

    fn read_all(&self, key: &str, buf: Vec<u8>) -> Result<Vec<u8>, CacheError> {
        Tx::read_all(self, key, buf)
    }
}

/// A detached handle to one key; every method opens its own transaction.
/// When constructed with a length, writes lazily create the key at that
/// length.
pub struct BlobRef {
    cache: Cache,
    name: String,
    length: Option<i64>,
}

impl BlobRef {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn length(&self) -> Result<i64, CacheError> {
        if let Some(length) = self.length {
            return Ok(length);
        }
        self.cache.run_tx(TxLevel::Deferred, |tx| {
            tx.open_pinned_read_only(&self.name)?.length()
        })
    }

    pub fn read_at(&self, buf: &mut [u8], off: i64) -> Result<usize, CacheError> {
        self.cache.run_tx(TxLevel::Deferred, |tx| {
            tx.open_pinned_read_only(&self.name)?.read_at(buf, off)
        })
    }

    pub fn write_at(&self, data: &[u8], off: i64) -> Result<usize, CacheError> {
        self.cache.run_tx(TxLevel::Immediate, |tx| {
            let pb = match tx.open_pinned(&self.name) {
                Ok(pb) => pb,
                Err(CacheError::NotFound) => match self.length {
                    Some(length) => tx.create(&self.name, CreateOpts { length })?,
                    None => return Err(CacheError::NotFound),
                },
                Err(err) => return Err(err),
            };
            pb.write_at(data, off)
        })
    }

    pub fn set_tag<V: ToSql>(&self, tag: &str, value: V) -> Result<(), CacheError> {
        self.cache
            .run_tx(TxLevel::Immediate, |tx| tx.set_tag(&self.name, tag, value))
    }

    pub fn get_tag(&self, tag: &str) -> Result<Option<Value>, CacheError> {
        self.cache
            .run_tx(TxLevel::Deferred, |tx| tx.get_tag(&self.name, tag))
    }

    pub fn delete(&self) -> Result<(), CacheError> {
        self.cache
            .run_tx(TxLevel::Immediate, |tx| tx.delete(&self.name))
    }
}

enum PinnedReq {
    ReadAt {
        off: i64,
        len: usize,
        reply: SyncSender<Result<Vec<u8>, CacheError>>,
    },
    WriteAt {
        off: i64,
        data: Vec<u8>,
        reply: SyncSender<Result<usize, CacheError>>,
    },
    Close {
        reply: SyncSender<Result<(), CacheError>>,
    },
}

/// A pinned handle detached from any borrow of the cache: a background task
/// holds its transaction open and serves the I/O. `close` ends the
/// transaction and reports its commit result; dropping without closing
/// commits best-effort.
#[derive(Debug)]
pub struct CachePinnedBlob {
    name: String,
    length: i64,
    req: Sender<PinnedReq>,
    join: Option<JoinHandle<()>>,
    closed: bool,
}

impl CachePinnedBlob {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Length is fixed for the life of the handle.
    pub fn length(&self) -> i64 {
        self.length
    }

    pub fn read_at(&self, buf: &mut [u8], off: i64) -> Result<usize, CacheError> {
        if self.closed {
            return Err(CacheError::Closed);
        }
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.req
            .send(PinnedReq::ReadAt {
                off,
                len: buf.len(),
                reply: reply_tx,
            })
            .map_err(|_| CacheError::Closed)?;
        let data = reply_rx.recv().map_err(|_| CacheError::Closed)??;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    pub fn write_at(&self, data: &[u8], off: i64) -> Result<usize, CacheError> {
        if self.closed {
            return Err(CacheError::Closed);
        }
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.req
            .send(PinnedReq::WriteAt {
                off,
                data: data.to_vec(),
                reply: reply_tx,
            })
            .map_err(|_| CacheError::Closed)?;
        reply_rx.recv().map_err(|_| CacheError::Closed)?
    }

    /// Ends the pinned transaction and returns its commit result.
    /// Idempotent; later calls are no-ops.
    pub fn close(&mut self) -> Result<(), CacheError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        let result = match self.req.send(PinnedReq::Close { reply: reply_tx }) {
            Ok(()) => reply_rx.recv().unwrap_or(Err(CacheError::Closed)),
            Err(_) => Err(CacheError::Closed),
        };
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
        result
    }
}

impl Drop for CachePinnedBlob {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(err) = self.close() {
                warn!(key = %self.name, error = %err, "closing dropped pinned handle");
            }
        }
    }
}
