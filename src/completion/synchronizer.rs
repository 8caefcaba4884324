use crate::context::Request;
use crate::error::{fatal, LciError, LciResult};

use crossbeam::utils::{Backoff, CachePadded};
use parking_lot::Mutex;

use std::sync::atomic::{AtomicU64, Ordering};

/// Becomes ready once it has received `threshold` signals.
///
/// A synchronizer with a threshold of one behaves like a classic request
/// handle. Waiting never blocks the thread in the OS: it spins, running the
/// supplied progress callback, so the waiter keeps other operations moving.
///
/// Signals for the next round must not arrive before the current round has
/// been consumed by [test][Synchronizer::test] or [wait][Synchronizer::wait].
pub struct Synchronizer {
    threshold: u64,
    // slot reservations
    top: AtomicU64,
    // completed signals
    top2: CachePadded<AtomicU64>,
    // signals consumed by test/wait
    tail: CachePadded<AtomicU64>,
    slots: Box<[Mutex<Option<Request>>]>,
}

impl Synchronizer {
    pub fn new(threshold: usize) -> Synchronizer {
        if threshold == 0 {
            fatal!("synchronizer threshold must be positive");
        }
        Synchronizer {
            threshold: threshold as u64,
            top: AtomicU64::new(0),
            top2: CachePadded::new(AtomicU64::new(0)),
            tail: CachePadded::new(AtomicU64::new(0)),
            slots: (0..threshold).map(|_| Mutex::new(None)).collect(),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold as usize
    }

    /// Records one completed operation.
    pub fn signal(&self, request: Request) {
        let pos = self.top.fetch_add(1, Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if pos >= tail + self.threshold {
            fatal!(
                "synchronizer received more signals than its threshold of {}",
                self.threshold
            );
        }
        *self.slots[(pos - tail) as usize].lock() = Some(request);
        self.top2.fetch_add(1, Ordering::Release);
    }

    /// Returns the requests of a completed round, or `Retry` if fewer than
    /// `threshold` signals have arrived.
    pub fn test(&self) -> LciResult<Vec<Request>> {
        let top2 = self.top2.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        if top2 != tail + self.threshold {
            return Err(LciError::Retry);
        }
        self.tail
            .compare_exchange(tail, top2, Ordering::AcqRel, Ordering::Relaxed)
            .map_err(|_| LciError::Retry)?;
        Ok(self
            .slots
            .iter()
            .filter_map(|slot| slot.lock().take())
            .collect())
    }

    /// Spins until the synchronizer is ready, calling `progress` between polls.
    pub fn wait(&self, mut progress: impl FnMut()) -> Vec<Request> {
        let backoff = Backoff::new();
        loop {
            match self.test() {
                Ok(requests) => return requests,
                Err(_) => {
                    progress();
                    backoff.snooze();
                }
            }
        }
    }
}

impl std::fmt::Debug for Synchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Synchronizer")
            .field("threshold", &self.threshold)
            .field("signaled", &self.top2.load(Ordering::Relaxed))
            .field("consumed", &self.tail.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RequestData;
    use std::sync::Arc;

    fn request(tag: u16) -> Request {
        Request {
            rank: 0,
            tag,
            data: RequestData::None,
            user_context: 0,
        }
    }

    #[test]
    fn ready_after_threshold() {
        let sync = Synchronizer::new(3);
        sync.signal(request(1));
        sync.signal(request(2));
        assert_eq!(sync.test().unwrap_err(), LciError::Retry);
        sync.signal(request(3));
        let mut tags: Vec<_> = sync.test().unwrap().iter().map(|r| r.tag).collect();
        tags.sort();
        assert_eq!(tags, vec![1, 2, 3]);
        // consumed, not ready again until three more signals
        assert!(sync.test().is_err());
    }

    #[test]
    fn reusable_across_rounds() {
        let sync = Synchronizer::new(1);
        for round in 0..5 {
            sync.signal(request(round));
            let reqs = sync.test().unwrap();
            assert_eq!(reqs.len(), 1);
            assert_eq!(reqs[0].tag, round);
        }
    }

    #[test]
    #[should_panic(expected = "more signals")]
    fn over_signal_is_fatal() {
        let sync = Synchronizer::new(1);
        sync.signal(request(0));
        sync.signal(request(1));
    }

    #[test]
    fn wait_runs_progress() {
        let sync = Arc::new(Synchronizer::new(4));
        let signaler = sync.clone();
        let mut calls = 0;
        let reqs = sync.wait(|| {
            calls += 1;
            if calls <= 4 {
                signaler.signal(request(calls as u16));
            }
        });
        assert_eq!(reqs.len(), 4);
        assert!(calls >= 4);
    }

    #[test]
    fn concurrent_signals() {
        let sync = Arc::new(Synchronizer::new(64));
        let threads: Vec<_> = (0..4)
            .map(|t| {
                let sync = sync.clone();
                std::thread::spawn(move || {
                    for i in 0..16 {
                        sync.signal(request(t * 16 + i));
                    }
                })
            })
            .collect();
        let reqs = sync.wait(|| {});
        for t in threads {
            t.join().unwrap();
        }
        let mut tags: Vec<_> = reqs.iter().map(|r| r.tag).collect();
        tags.sort();
        assert_eq!(tags, (0..64).collect::<Vec<u16>>());
    }
}
