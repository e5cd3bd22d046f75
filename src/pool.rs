//! A bounded-by-demand pool of storage connections. Leases hand the caller
//! exclusive use of one connection; `close` drains the idle stack and waits
//! for every lease to come back.

use crate::config::CacheConfig;
use crate::conn::{init_conn, open_conn, retry_busy_on_init};
use crate::error::CacheError;
use parking_lot::{Condvar, Mutex};
use rusqlite::Connection;
use std::sync::Arc;
use tracing::debug;

pub(crate) struct ConnPool {
    target: String,
    cfg: Arc<CacheConfig>,
    state: Mutex<PoolState>,
    cond: Condvar,
}

struct PoolState {
    idle: Vec<Connection>,
    in_use: usize,
    closed: bool,
}

impl ConnPool {
    /// The pool starts with the connection that ran the schema init, so the
    /// first lease never pays the open cost twice.
    pub(crate) fn new(target: String, cfg: Arc<CacheConfig>, first: Connection) -> Self {
        Self {
            target,
            cfg,
            state: Mutex::new(PoolState {
                idle: vec![first],
                in_use: 0,
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    fn new_conn(&self) -> Result<Connection, CacheError> {
        debug!(db = %self.target, "opening additional pooled connection");
        let conn = open_conn(&self.target, &self.cfg)?;
        retry_busy_on_init(&self.cfg, || init_conn(&conn, &self.cfg))?;
        Ok(conn)
    }

    /// Leases a connection for the duration of `f`. The pool lock is not
    /// held across `f`.
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, CacheError>,
    ) -> Result<T, CacheError> {
        let reused = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(CacheError::Closed);
            }
            state.in_use += 1;
            state.idle.pop()
        };
        let conn = match reused {
            Some(conn) => conn,
            None => match self.new_conn() {
                Ok(conn) => conn,
                Err(err) => {
                    self.release(None);
                    return Err(err);
                }
            },
        };
        let result = f(&conn);
        self.release(Some(conn));
        result
    }

    fn release(&self, conn: Option<Connection>) {
        let mut state = self.state.lock();
        state.in_use -= 1;
        if let Some(conn) = conn {
            if state.closed {
                // close() already drained the idle stack; finish this one
                // here rather than leaking it back in.
                let _ = conn.close();
            } else {
                state.idle.push(conn);
            }
        }
        self.cond.notify_all();
    }

    /// Marks the pool closed, closes idle connections, and waits for every
    /// lease to return. Close failures are joined so none is lost.
    pub(crate) fn close(&self) -> Result<(), CacheError> {
        let idle = {
            let mut state = self.state.lock();
            state.closed = true;
            std::mem::take(&mut state.idle)
        };
        let mut joined: Option<CacheError> = None;
        for conn in idle {
            if let Err((_, err)) = conn.close() {
                let err: CacheError = err.into();
                joined = Some(match joined {
                    Some(prev) => prev.join(err),
                    None => err,
                });
            }
        }
        let mut state = self.state.lock();
        while state.in_use > 0 {
            self.cond.wait(&mut state);
        }
        match joined {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}
