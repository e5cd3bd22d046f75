//! Per-connection cache of open blob handles, keyed by
//! `(value_id, segment_offset)` and ordered so the segment that may contain
//! a logical offset is one predecessor lookup away.

use crate::error::CacheError;
use rusqlite::blob::Blob;
use std::collections::BTreeMap;

pub(crate) struct CachedHandle<'c> {
    pub(crate) blob_id: i64,
    pub(crate) writable: bool,
    pub(crate) blob: Blob<'c>,
}

impl CachedHandle<'_> {
    pub(crate) fn size(&self) -> i64 {
        i64::from(self.blob.size())
    }
}

#[derive(Default)]
pub(crate) struct HandleCache<'c> {
    map: BTreeMap<(i64, i64), CachedHandle<'c>>,
}

impl<'c> HandleCache<'c> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Key of the cached segment containing logical offset `off` of
    /// `value_id`, found by seeking to `(value_id, off)` and stepping back
    /// one entry.
    pub(crate) fn containing(&self, value_id: i64, off: i64) -> Option<(i64, i64)> {
        let (&(vid, seg_off), entry) = self.map.range(..=(value_id, off)).next_back()?;
        if vid != value_id {
            return None;
        }
        if seg_off + entry.size() > off {
            Some((vid, seg_off))
        } else {
            None
        }
    }

    pub(crate) fn get_mut(&mut self, key: (i64, i64)) -> Option<&mut CachedHandle<'c>> {
        self.map.get_mut(&key)
    }

    pub(crate) fn insert(&mut self, value_id: i64, seg_off: i64, handle: CachedHandle<'c>) {
        self.map.insert((value_id, seg_off), handle);
    }

    /// Drops a single handle, e.g. after the engine reported it invalidated.
    pub(crate) fn remove(&mut self, key: (i64, i64)) -> Option<CachedHandle<'c>> {
        self.map.remove(&key)
    }

    /// Closes every handle belonging to `value_id`. Needed when the value's
    /// rows are deleted mid-transaction, since the engine may hand the same
    /// rowid to the next key.
    pub(crate) fn remove_value(&mut self, value_id: i64) -> Result<(), CacheError> {
        let keys: Vec<(i64, i64)> = self
            .map
            .range((value_id, i64::MIN)..=(value_id, i64::MAX))
            .map(|(key, _)| *key)
            .collect();
        let mut joined: Option<CacheError> = None;
        for key in keys {
            if let Some(handle) = self.map.remove(&key) {
                if let Err(err) = handle.blob.close() {
                    let err: CacheError = err.into();
                    joined = Some(match joined {
                        Some(prev) => prev.join(err),
                        None => err,
                    });
                }
            }
        }
        match joined {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    /// Closes every cached handle, joining close failures. Runs at
    /// transaction end before commit.
    pub(crate) fn close_all(&mut self) -> Result<(), CacheError> {
        let mut joined: Option<CacheError> = None;
        for (_, handle) in std::mem::take(&mut self.map) {
            if let Err(err) = handle.blob.close() {
                let err: CacheError = err.into();
                joined = Some(match joined {
                    Some(prev) => prev.join(err),
                    None => err,
                });
            }
        }
        match joined {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
