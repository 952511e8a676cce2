/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! A bounded, per-device store of resident values keyed by particle.
//!
//! Entries can be pinned while an operation is in flight; pinned entries are
//! never chosen for eviction. Unpinned entries are kept on an intrusive
//! recency list ordered by release time, so promoting an entry and finding
//! the oldest evictable one are both constant time.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::PoisonError;

use push_messages::DeviceIndex;
use push_messages::Pid;

/// Shared access to a resident value. The cache owns residency; holders of a
/// handle only borrow the value for the duration of an operation.
pub type Handle<T> = Arc<Mutex<T>>;

/// Brings values into a cache on a miss and disposes of them on eviction.
/// Eviction has no side effects beyond `teardown`.
pub trait ResourceLoader<T>: Send + Sync {
    fn load(&self, pid: Pid, device: DeviceIndex) -> anyhow::Result<T>;

    fn teardown(&self, pid: Pid, device: DeviceIndex, value: T) -> anyhow::Result<()>;
}

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum CacheError {
    #[error("cache capacity on {0} must be at least 1")]
    ZeroCapacity(DeviceIndex),

    #[error("{pid} is already resident on {device}")]
    AlreadyResident { pid: Pid, device: DeviceIndex },

    #[error("{pid} is not resident on {device}")]
    NotResident { pid: Pid, device: DeviceIndex },

    #[error("every entry on {0} is pinned")]
    Exhausted(DeviceIndex),

    #[error("{pid} is pinned on {device}")]
    Pinned { pid: Pid, device: DeviceIndex },

    #[error("loading {pid} on {device}")]
    Load {
        pid: Pid,
        device: DeviceIndex,
        #[source]
        source: anyhow::Error,
    },

    #[error("tearing down {pid} on {device}")]
    Teardown {
        pid: Pid,
        device: DeviceIndex,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Debug, Clone, Copy, Default)]
struct Link {
    prev: Option<Pid>,
    next: Option<Pid>,
}

/// Doubly linked list threaded through a map, oldest at the head.
#[derive(Debug, Default)]
struct Recency {
    links: HashMap<Pid, Link>,
    head: Option<Pid>,
    tail: Option<Pid>,
}

impl Recency {
    fn push_back(&mut self, pid: Pid) {
        debug_assert!(!self.links.contains_key(&pid));
        let link = Link {
            prev: self.tail,
            next: None,
        };
        match self.tail {
            Some(tail) => self.links.get_mut(&tail).unwrap().next = Some(pid),
            None => self.head = Some(pid),
        }
        self.tail = Some(pid);
        self.links.insert(pid, link);
    }

    fn remove(&mut self, pid: Pid) -> bool {
        let Some(link) = self.links.remove(&pid) else {
            return false;
        };
        match link.prev {
            Some(prev) => self.links.get_mut(&prev).unwrap().next = link.next,
            None => self.head = link.next,
        }
        match link.next {
            Some(next) => self.links.get_mut(&next).unwrap().prev = link.prev,
            None => self.tail = link.prev,
        }
        true
    }

    fn pop_front(&mut self) -> Option<Pid> {
        let head = self.head?;
        self.remove(head);
        Some(head)
    }

    #[cfg(test)]
    fn order(&self) -> Vec<Pid> {
        let mut order = Vec::new();
        let mut cursor = self.head;
        while let Some(pid) = cursor {
            order.push(pid);
            cursor = self.links[&pid].next;
        }
        order
    }
}

struct Entry<T> {
    handle: Handle<T>,
    pinned: bool,
}

struct CacheState<T> {
    entries: HashMap<Pid, Entry<T>>,
    recency: Recency,
}

pub struct ParticleCache<T> {
    device: DeviceIndex,
    capacity: usize,
    loader: Box<dyn ResourceLoader<T>>,
    state: Mutex<CacheState<T>>,
    released: Condvar,
}

impl<T> std::fmt::Debug for ParticleCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParticleCache")
            .field("device", &self.device)
            .field("capacity", &self.capacity)
            .field("resident", &self.resident())
            .finish()
    }
}

impl<T> ParticleCache<T> {
    pub fn new(
        device: DeviceIndex,
        capacity: usize,
        loader: impl ResourceLoader<T> + 'static,
    ) -> Result<Self, CacheError> {
        if capacity == 0 {
            return Err(CacheError::ZeroCapacity(device));
        }
        Ok(Self {
            device,
            capacity,
            loader: Box::new(loader),
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                recency: Recency::default(),
            }),
            released: Condvar::new(),
        })
    }

    pub fn device(&self) -> DeviceIndex {
        self.device
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.lock().entries.contains_key(&pid)
    }

    pub fn is_pinned(&self, pid: Pid) -> bool {
        self.lock().entries.get(&pid).is_some_and(|e| e.pinned)
    }

    /// Resident pids, in ascending order.
    pub fn resident(&self) -> Vec<Pid> {
        let mut pids: Vec<_> = self.lock().entries.keys().copied().collect();
        pids.sort();
        pids
    }

    /// Insert a value built by the caller, making room if needed.
    pub fn create(&self, pid: Pid, value: T) -> Result<Handle<T>, CacheError> {
        let mut state = self.lock();
        if state.entries.contains_key(&pid) {
            return Err(CacheError::AlreadyResident {
                pid,
                device: self.device,
            });
        }
        while state.entries.len() >= self.capacity {
            if self.evict_locked(&mut state)?.is_none() {
                return Err(CacheError::Exhausted(self.device));
            }
        }
        Ok(self.insert_locked(&mut state, pid, value, false))
    }

    /// Non-blocking read. A miss is loaded when there is room; otherwise
    /// `None` tells the caller to free capacity and retry.
    pub fn try_read(&self, pid: Pid, pin: bool) -> Result<Option<Handle<T>>, CacheError> {
        let mut state = self.lock();
        self.try_read_locked(&mut state, pid, pin)
    }

    /// Blocking read: evicts unpinned entries as needed, and waits for a
    /// release when everything resident is pinned.
    pub fn read(&self, pid: Pid) -> Result<Handle<T>, CacheError> {
        let mut state = self.lock();
        loop {
            if let Some(handle) = self.try_read_locked(&mut state, pid, false)? {
                return Ok(handle);
            }
            if self.evict_locked(&mut state)?.is_some() {
                continue;
            }
            tracing::debug!("{}: waiting for a release to read {}", self.device, pid);
            state = self
                .released
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Unpin `pid` and mark it most recently used.
    pub fn release(&self, pid: Pid) -> Result<(), CacheError> {
        let mut state = self.lock();
        let CacheState { entries, recency } = &mut *state;
        let entry = entries.get_mut(&pid).ok_or(CacheError::NotResident {
            pid,
            device: self.device,
        })?;
        entry.pinned = false;
        recency.remove(pid);
        recency.push_back(pid);
        drop(state);
        self.released.notify_all();
        Ok(())
    }

    /// Evict the least recently released unpinned entry.
    pub fn evict_oldest_unpinned(&self) -> Result<Option<Pid>, CacheError> {
        let mut state = self.lock();
        let evicted = self.evict_locked(&mut state)?;
        drop(state);
        if evicted.is_some() {
            self.released.notify_all();
        }
        Ok(evicted)
    }

    /// Drop `pid`'s entry out of recency order. Returns whether it was
    /// resident.
    pub fn invalidate(&self, pid: Pid) -> Result<bool, CacheError> {
        let mut state = self.lock();
        match state.entries.get(&pid) {
            None => return Ok(false),
            Some(entry) if entry.pinned => {
                return Err(CacheError::Pinned {
                    pid,
                    device: self.device,
                });
            }
            Some(_) => {}
        }
        state.recency.remove(pid);
        if let Some(entry) = state.entries.remove(&pid) {
            self.dispose(pid, entry)?;
        }
        drop(state);
        self.released.notify_all();
        Ok(true)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_read_locked(
        &self,
        state: &mut CacheState<T>,
        pid: Pid,
        pin: bool,
    ) -> Result<Option<Handle<T>>, CacheError> {
        let CacheState { entries, recency } = state;
        if let Some(entry) = entries.get_mut(&pid) {
            if pin && !entry.pinned {
                entry.pinned = true;
                recency.remove(pid);
            }
            return Ok(Some(entry.handle.clone()));
        }
        if entries.len() >= self.capacity {
            return Ok(None);
        }
        let value = self
            .loader
            .load(pid, self.device)
            .map_err(|source| CacheError::Load {
                pid,
                device: self.device,
                source,
            })?;
        Ok(Some(self.insert_locked(state, pid, value, pin)))
    }

    fn insert_locked(&self, state: &mut CacheState<T>, pid: Pid, value: T, pin: bool) -> Handle<T> {
        let handle = Arc::new(Mutex::new(value));
        state.entries.insert(
            pid,
            Entry {
                handle: handle.clone(),
                pinned: pin,
            },
        );
        if !pin {
            state.recency.push_back(pid);
        }
        handle
    }

    fn evict_locked(&self, state: &mut CacheState<T>) -> Result<Option<Pid>, CacheError> {
        let Some(pid) = state.recency.pop_front() else {
            return Ok(None);
        };
        let entry = state
            .entries
            .remove(&pid)
            .expect("recency list names a pid with no entry");
        tracing::debug!("{}: evicting {}", self.device, pid);
        self.dispose(pid, entry)?;
        Ok(Some(pid))
    }

    fn dispose(&self, pid: Pid, entry: Entry<T>) -> Result<(), CacheError> {
        match Arc::try_unwrap(entry.handle) {
            Ok(value) => {
                let value = value.into_inner().unwrap_or_else(PoisonError::into_inner);
                self.loader
                    .teardown(pid, self.device, value)
                    .map_err(|source| CacheError::Teardown {
                        pid,
                        device: self.device,
                        source,
                    })?;
            }
            Err(_) => {
                tracing::debug!(
                    "{}: {} is still borrowed; dropping without teardown",
                    self.device,
                    pid
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    /// Values are the pid itself; teardowns are recorded in order.
    #[derive(Clone, Default)]
    struct Recorder {
        torn_down: Arc<Mutex<Vec<Pid>>>,
        loads: Arc<Mutex<Vec<Pid>>>,
    }

    impl ResourceLoader<u64> for Recorder {
        fn load(&self, pid: Pid, _device: DeviceIndex) -> anyhow::Result<u64> {
            self.loads.lock().unwrap().push(pid);
            Ok(pid.0)
        }

        fn teardown(&self, pid: Pid, _device: DeviceIndex, value: u64) -> anyhow::Result<()> {
            assert_eq!(pid.0, value);
            self.torn_down.lock().unwrap().push(pid);
            Ok(())
        }
    }

    fn cache(capacity: usize) -> (ParticleCache<u64>, Recorder) {
        let recorder = Recorder::default();
        (
            ParticleCache::new(DeviceIndex(0), capacity, recorder.clone()).unwrap(),
            recorder,
        )
    }

    #[test]
    fn test_zero_capacity_fails_fast() {
        assert!(matches!(
            ParticleCache::new(DeviceIndex(2), 0, Recorder::default()),
            Err(CacheError::ZeroCapacity(DeviceIndex(2)))
        ));
    }

    #[test]
    fn test_create_rejects_duplicates() {
        let (cache, _) = cache(2);
        cache.create(Pid(1), 1).unwrap();
        assert!(matches!(
            cache.create(Pid(1), 1),
            Err(CacheError::AlreadyResident { pid: Pid(1), .. })
        ));
    }

    #[test]
    fn test_try_read_loads_until_full() {
        let (cache, recorder) = cache(2);
        assert_eq!(*cache.try_read(Pid(1), false).unwrap().unwrap().lock().unwrap(), 1);
        assert!(cache.try_read(Pid(2), false).unwrap().is_some());
        assert!(cache.try_read(Pid(3), false).unwrap().is_none());
        // Resident reads don't load again.
        assert!(cache.try_read(Pid(1), false).unwrap().is_some());
        assert_eq!(*recorder.loads.lock().unwrap(), vec![Pid(1), Pid(2)]);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_evicts_least_recently_released() {
        let (cache, recorder) = cache(3);
        for pid in 1..=3 {
            cache.try_read(Pid(pid), false).unwrap();
        }
        cache.release(Pid(1)).unwrap();
        assert_eq!(cache.state.lock().unwrap().recency.order(), vec![Pid(2), Pid(3), Pid(1)]);
        assert_eq!(cache.evict_oldest_unpinned().unwrap(), Some(Pid(2)));
        assert_eq!(cache.evict_oldest_unpinned().unwrap(), Some(Pid(3)));
        assert_eq!(*recorder.torn_down.lock().unwrap(), vec![Pid(2), Pid(3)]);
        assert_eq!(cache.resident(), vec![Pid(1)]);
    }

    #[test]
    fn test_pinned_entries_are_never_evicted() {
        let (cache, _) = cache(2);
        cache.try_read(Pid(1), true).unwrap();
        cache.try_read(Pid(2), false).unwrap();
        assert!(cache.is_pinned(Pid(1)));
        assert_eq!(cache.evict_oldest_unpinned().unwrap(), Some(Pid(2)));
        assert_eq!(cache.evict_oldest_unpinned().unwrap(), None);
        assert!(cache.contains(Pid(1)));

        cache.release(Pid(1)).unwrap();
        assert!(!cache.is_pinned(Pid(1)));
        assert_eq!(cache.evict_oldest_unpinned().unwrap(), Some(Pid(1)));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_create_makes_room_but_not_from_pinned() {
        let (cache, recorder) = cache(1);
        cache.create(Pid(1), 1).unwrap();
        cache.create(Pid(2), 2).unwrap();
        assert_eq!(*recorder.torn_down.lock().unwrap(), vec![Pid(1)]);

        cache.try_read(Pid(2), true).unwrap();
        assert!(matches!(
            cache.create(Pid(3), 3),
            Err(CacheError::Exhausted(DeviceIndex(0)))
        ));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_capacity_is_never_exceeded() {
        let (cache, _) = cache(3);
        for round in 0..20u64 {
            let pid = Pid(round % 7);
            while cache.try_read(pid, round % 3 == 0).unwrap().is_none() {
                if cache.evict_oldest_unpinned().unwrap().is_none() {
                    let pinned = cache.resident().into_iter().find(|p| cache.is_pinned(*p));
                    cache.release(pinned.unwrap()).unwrap();
                }
            }
            assert!(cache.len() <= cache.capacity());
        }
    }

    #[test]
    fn test_release_of_unknown_pid() {
        let (cache, _) = cache(1);
        assert!(matches!(
            cache.release(Pid(9)),
            Err(CacheError::NotResident { pid: Pid(9), .. })
        ));
    }

    #[test]
    fn test_read_blocks_until_release() {
        let (cache, _) = cache(1);
        let cache = Arc::new(cache);
        cache.try_read(Pid(1), true).unwrap();

        let (tx, rx) = mpsc::channel();
        let reader = thread::spawn({
            let cache = cache.clone();
            move || {
                let handle = cache.read(Pid(2)).unwrap();
                tx.send(*handle.lock().unwrap()).unwrap();
            }
        });

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        cache.release(Pid(1)).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap(), 2);
        reader.join().unwrap();
        assert_eq!(cache.resident(), vec![Pid(2)]);
    }

    #[test]
    fn test_invalidate() {
        let (cache, recorder) = cache(2);
        cache.try_read(Pid(1), false).unwrap();
        cache.try_read(Pid(2), true).unwrap();
        assert!(cache.invalidate(Pid(1)).unwrap());
        assert!(!cache.invalidate(Pid(1)).unwrap());
        assert!(matches!(
            cache.invalidate(Pid(2)),
            Err(CacheError::Pinned { pid: Pid(2), .. })
        ));
        assert_eq!(*recorder.torn_down.lock().unwrap(), vec![Pid(1)]);
        assert_eq!(cache.resident(), vec![Pid(2)]);
    }

    #[test]
    fn test_borrowed_entry_is_dropped_without_teardown() {
        let (cache, recorder) = cache(1);
        let held = cache.try_read(Pid(1), false).unwrap().unwrap();
        assert_eq!(cache.evict_oldest_unpinned().unwrap(), Some(Pid(1)));
        assert!(recorder.torn_down.lock().unwrap().is_empty());
        assert_eq!(*held.lock().unwrap(), 1);
    }
}
