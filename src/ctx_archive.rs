use crate::error::{LciError, LciResult};

use crossbeam::utils::CachePadded;

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

/// A fixed-capacity, lock-free table that parks owned values under small
/// integer keys.
///
/// Keys come from a monotonically increasing counter modulo the capacity; a
/// slot is claimed with a compare-and-swap against the empty (null) sentinel.
pub(crate) struct ContextArchive<T> {
    slots: Box<[CachePadded<AtomicPtr<T>>]>,
    head: AtomicU64,
    mask: u64,
}

impl<T> ContextArchive<T> {
    pub(crate) fn new(nbits: u32) -> ContextArchive<T> {
        let capacity = 1usize << nbits;
        ContextArchive {
            slots: (0..capacity)
                .map(|_| CachePadded::new(AtomicPtr::new(ptr::null_mut())))
                .collect(),
            head: AtomicU64::new(0),
            mask: capacity as u64 - 1,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Parks `value` and returns its key. If the slot the counter landed on is
    /// still occupied the value is handed back with `Retry`.
    pub(crate) fn put(&self, value: Box<T>) -> Result<u64, (LciError, Box<T>)> {
        let key = self.head.fetch_add(1, Ordering::SeqCst) & self.mask;
        let raw = Box::into_raw(value);
        match self.slots[key as usize].compare_exchange(
            ptr::null_mut(),
            raw,
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => Ok(key),
            // Safety: raw came from Box::into_raw above and was never published
            Err(_) => Err((LciError::Retry, unsafe { Box::from_raw(raw) })),
        }
    }

    /// Removes and returns the value parked under `key`.
    pub(crate) fn remove(&self, key: u64) -> LciResult<Box<T>> {
        let slot = self
            .slots
            .get(key as usize)
            .ok_or(LciError::Fatal)?;
        let raw = slot.swap(ptr::null_mut(), Ordering::AcqRel);
        if raw.is_null() {
            Err(LciError::Fatal)
        } else {
            // Safety: non-null slots only ever hold pointers produced by
            // Box::into_raw in `put`, and the swap transferred ownership to us
            Ok(unsafe { Box::from_raw(raw) })
        }
    }

    #[cfg(test)]
    pub(crate) fn is_occupied(&self, key: u64) -> bool {
        self.slots
            .get(key as usize)
            .map_or(false, |slot| !slot.load(Ordering::Acquire).is_null())
    }
}

impl<T> Drop for ContextArchive<T> {
    fn drop(&mut self) {
        for slot in self.slots.iter() {
            let raw = slot.swap(ptr::null_mut(), Ordering::AcqRel);
            if !raw.is_null() {
                // Safety: see `remove`
                drop(unsafe { Box::from_raw(raw) });
            }
        }
    }
}

// the archive owns its values and only moves them between threads
unsafe impl<T: Send> Send for ContextArchive<T> {}
unsafe impl<T: Send> Sync for ContextArchive<T> {}
