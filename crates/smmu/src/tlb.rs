//! Translation cache shared by every stream.
//!
//! Entries are independent copies of resolved translations keyed by
//! `(stream, PASID, page, security state)`. Nothing here points back into stream state; an entry
//! disappears only through explicit invalidation, LRU eviction, or ageing.
//!
//! The primary LRU map and the per-stream/per-PASID key index live under one mutex so they can
//! never disagree. Every invalidation bumps an epoch under that same mutex; a translation
//! resolved before an invalidation finished is refused by [`TlbCache::insert_if_current`].

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use lru::LruCache;
use serde::Serialize;
use smmu_types::{
    page_base, page_offset, PagePermissions, Pasid, SecurityState, StreamId, TranslationResult,
};

use crate::clock::Clock;
use crate::sync::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TlbKey {
    pub stream_id: StreamId,
    pub pasid: Pasid,
    /// Page-aligned input address.
    pub page: u64,
    pub security_state: SecurityState,
}

impl TlbKey {
    pub fn new(stream_id: StreamId, pasid: Pasid, iova: u64, security_state: SecurityState) -> Self {
        Self {
            stream_id,
            pasid,
            page: page_base(iova),
            security_state,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbEntry {
    pub stream_id: StreamId,
    pub pasid: Pasid,
    /// Page-aligned input address.
    pub iova: u64,
    /// Page-aligned output address.
    pub physical_address: u64,
    /// Page-aligned Stage-1 output when both stages contributed.
    pub intermediate_address: Option<u64>,
    /// Effective permissions (intersection across stages).
    pub permissions: PagePermissions,
    pub security_state: SecurityState,
    pub valid: bool,
    pub timestamp: u64,
}

impl TlbEntry {
    pub fn new(
        stream_id: StreamId,
        pasid: Pasid,
        iova: u64,
        physical_address: u64,
        permissions: PagePermissions,
        security_state: SecurityState,
    ) -> Self {
        Self {
            stream_id,
            pasid,
            iova: page_base(iova),
            physical_address: page_base(physical_address),
            intermediate_address: None,
            permissions,
            security_state,
            valid: true,
            timestamp: 0,
        }
    }

    pub fn from_translation(
        stream_id: StreamId,
        pasid: Pasid,
        iova: u64,
        result: &TranslationResult,
    ) -> Self {
        let mut entry = Self::new(
            stream_id,
            pasid,
            iova,
            result.physical_address,
            result.permissions,
            result.security_state,
        );
        entry.intermediate_address = result.intermediate_address.map(page_base);
        entry
    }

    pub fn key(&self) -> TlbKey {
        TlbKey::new(self.stream_id, self.pasid, self.iova, self.security_state)
    }

    /// Rebuilds the translation for an address inside this entry's page.
    pub fn to_translation(&self, iova: u64) -> TranslationResult {
        let offset = page_offset(iova);
        TranslationResult {
            physical_address: self.physical_address | offset,
            intermediate_address: self.intermediate_address.map(|ipa| ipa | offset),
            permissions: self.permissions,
            security_state: self.security_state,
            cache_hit: true,
            bypassed: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatistics {
    pub hit_count: u64,
    pub miss_count: u64,
    pub total_lookups: u64,
    /// `hit_count / total_lookups`, or 0 before the first lookup.
    pub hit_rate: f64,
    pub current_size: usize,
    pub capacity: usize,
    pub evictions: u64,
    pub invalidations: u64,
}

struct TlbInner {
    entries: LruCache<TlbKey, TlbEntry>,
    by_stream: HashMap<StreamId, HashMap<Pasid, HashSet<TlbKey>>>,
    max_age_ns: u64,
}

impl TlbInner {
    fn index(&mut self, key: TlbKey) {
        self.by_stream
            .entry(key.stream_id)
            .or_default()
            .entry(key.pasid)
            .or_default()
            .insert(key);
    }

    fn unindex(&mut self, key: &TlbKey) {
        let Some(pasids) = self.by_stream.get_mut(&key.stream_id) else {
            return;
        };
        if let Some(keys) = pasids.get_mut(&key.pasid) {
            keys.remove(key);
            if keys.is_empty() {
                pasids.remove(&key.pasid);
            }
        }
        if pasids.is_empty() {
            self.by_stream.remove(&key.stream_id);
        }
    }

    fn remove(&mut self, key: &TlbKey) -> bool {
        let removed = self.entries.pop(key).is_some();
        if removed {
            self.unindex(key);
        }
        removed
    }

    fn keys_for(&self, stream_id: StreamId, pasid: Option<Pasid>) -> Vec<TlbKey> {
        let Some(pasids) = self.by_stream.get(&stream_id) else {
            return Vec::new();
        };
        match pasid {
            Some(pasid) => pasids
                .get(&pasid)
                .map(|keys| keys.iter().copied().collect())
                .unwrap_or_default(),
            None => pasids.values().flatten().copied().collect(),
        }
    }
}

pub struct TlbCache {
    inner: Mutex<TlbInner>,
    clock: Arc<Clock>,
    epoch: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
}

impl core::fmt::Debug for TlbCache {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TlbCache")
            .field("statistics", &self.statistics())
            .finish()
    }
}

impl TlbCache {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        Self::with_clock(capacity, Clock::new_shared())
    }

    pub fn with_clock(capacity: usize, clock: Arc<Clock>) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(TlbInner {
                entries: LruCache::new(capacity),
                by_stream: HashMap::new(),
                max_age_ns: 0,
            }),
            clock,
            epoch: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        lock(&self.inner).entries.cap().get()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries older than `max_age_ms` are treated as misses. `0` disables ageing.
    pub fn set_max_age_ms(&self, max_age_ms: u64) {
        lock(&self.inner).max_age_ns = max_age_ms.saturating_mul(1_000_000);
    }

    /// Shrinking evicts least-recently-used entries first.
    pub fn resize(&self, capacity: usize) {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        let mut inner = lock(&self.inner);
        while inner.entries.len() > capacity.get() {
            let Some((key, _)) = inner.entries.pop_lru() else {
                break;
            };
            inner.unindex(&key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        inner.entries.resize(capacity);
    }

    /// Adds or replaces the entry for its key, evicting the least-recently-used entry when full.
    /// Returns the evicted entry, if any.
    pub fn insert(&self, mut entry: TlbEntry) -> Option<TlbEntry> {
        let mut inner = lock(&self.inner);
        entry.timestamp = self.clock.now_ns();
        self.insert_locked(&mut inner, entry)
    }

    /// Inserts only if no invalidation ran since `epoch` was read with [`TlbCache::epoch`].
    pub fn insert_if_current(&self, mut entry: TlbEntry, epoch: u64) -> bool {
        let mut inner = lock(&self.inner);
        if self.epoch.load(Ordering::Acquire) != epoch {
            return false;
        }
        entry.timestamp = self.clock.now_ns();
        self.insert_locked(&mut inner, entry);
        true
    }

    fn insert_locked(&self, inner: &mut TlbInner, entry: TlbEntry) -> Option<TlbEntry> {
        let key = entry.key();
        let displaced = inner.entries.push(key, entry);
        inner.index(key);
        match displaced {
            Some((old_key, old)) if old_key != key => {
                inner.unindex(&old_key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                Some(old)
            }
            _ => None,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Looks up the page containing `iova`, updating hit/miss counters and LRU order.
    pub fn lookup(
        &self,
        stream_id: StreamId,
        pasid: Pasid,
        iova: u64,
        security_state: SecurityState,
    ) -> Option<TlbEntry> {
        let key = TlbKey::new(stream_id, pasid, iova, security_state);
        let mut inner = lock(&self.inner);
        let max_age_ns = inner.max_age_ns;
        let found = inner.entries.get(&key).copied();
        let found = match found {
            Some(entry)
                if max_age_ns != 0
                    && self.clock.now_ns().saturating_sub(entry.timestamp) > max_age_ns =>
            {
                inner.remove(&key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                None
            }
            Some(entry) if entry.valid => Some(entry),
            _ => None,
        };
        drop(inner);

        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Presence check that leaves counters and LRU order untouched.
    pub fn contains(
        &self,
        stream_id: StreamId,
        pasid: Pasid,
        iova: u64,
        security_state: SecurityState,
    ) -> bool {
        let key = TlbKey::new(stream_id, pasid, iova, security_state);
        lock(&self.inner).entries.contains(&key)
    }

    pub fn entries_for_stream(&self, stream_id: StreamId) -> usize {
        lock(&self.inner)
            .by_stream
            .get(&stream_id)
            .map(|pasids| pasids.values().map(HashSet::len).sum())
            .unwrap_or(0)
    }

    fn bump_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn invalidate_all(&self) -> usize {
        let mut inner = lock(&self.inner);
        let removed = inner.entries.len();
        inner.entries.clear();
        inner.by_stream.clear();
        self.bump_epoch();
        removed
    }

    pub fn invalidate_stream(&self, stream_id: StreamId) -> usize {
        let mut inner = lock(&self.inner);
        let keys = inner.keys_for(stream_id, None);
        for key in &keys {
            inner.entries.pop(key);
        }
        inner.by_stream.remove(&stream_id);
        self.bump_epoch();
        keys.len()
    }

    pub fn invalidate_pasid(&self, stream_id: StreamId, pasid: Pasid) -> usize {
        let mut inner = lock(&self.inner);
        let keys = inner.keys_for(stream_id, Some(pasid));
        for key in &keys {
            inner.remove(key);
        }
        self.bump_epoch();
        keys.len()
    }

    /// Drops pages of `stream_id`/`pasid` overlapping `[start, end)`. An empty range names the
    /// single page containing `start`.
    pub fn invalidate_range(&self, stream_id: StreamId, pasid: Pasid, start: u64, end: u64) -> usize {
        let first = page_base(start);
        let mut inner = lock(&self.inner);
        let keys: Vec<TlbKey> = inner
            .keys_for(stream_id, Some(pasid))
            .into_iter()
            .filter(|key| {
                if end <= start {
                    key.page == first
                } else {
                    key.page >= first && key.page < end
                }
            })
            .collect();
        for key in &keys {
            inner.remove(key);
        }
        self.bump_epoch();
        keys.len()
    }

    pub fn statistics(&self) -> CacheStatistics {
        let hit_count = self.hits.load(Ordering::Relaxed);
        let miss_count = self.misses.load(Ordering::Relaxed);
        let total_lookups = hit_count + miss_count;
        let hit_rate = if total_lookups == 0 {
            0.0
        } else {
            hit_count as f64 / total_lookups as f64
        };
        let (current_size, capacity) = {
            let inner = lock(&self.inner);
            (inner.entries.len(), inner.entries.cap().get())
        };
        CacheStatistics {
            hit_count,
            miss_count,
            total_lookups,
            hit_rate,
            current_size,
            capacity,
            evictions: self.evictions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }

    pub fn reset_statistics(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.invalidations.store(0, Ordering::Relaxed);
    }
}
