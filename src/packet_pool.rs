use crate::error::fatal;
use crate::packet::Packet;
use crate::spinlock::SpinMutex;

use crossbeam::utils::{Backoff, CachePadded};
use rand::distributions::{Distribution, Uniform};
use thread_local::ThreadLocal;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

struct LocalPool {
    packets: SpinMutex<VecDeque<Box<Packet>>>,
    // readable without the lock, used to pick steal victims
    len: AtomicUsize,
}

impl LocalPool {
    fn new() -> LocalPool {
        LocalPool {
            packets: SpinMutex::new(VecDeque::new()),
            len: AtomicUsize::new(0),
        }
    }
}

/// Per-thread deques of fixed-size packets with work stealing.
///
/// A thread is assigned its own pool the first time it touches this
/// `PacketPool`. Packets remember the pool they should return to, so a packet
/// acquired on one thread and released on another goes back where it came
/// from.
pub(crate) struct PacketPool {
    pools: Vec<CachePadded<LocalPool>>,
    npools: AtomicUsize,
    local_id: ThreadLocal<usize>,
    packet_size: usize,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl PacketPool {
    pub(crate) fn new(max_pools: usize, packet_size: usize) -> PacketPool {
        PacketPool {
            pools: (0..max_pools.max(1))
                .map(|_| CachePadded::new(LocalPool::new()))
                .collect(),
            npools: AtomicUsize::new(0),
            local_id: ThreadLocal::new(),
            packet_size,
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        }
    }

    /// creates `count` fresh packets and stores them in pool `pool_id`
    pub(crate) fn populate(&self, pool_id: usize, count: usize) {
        let pool = &self.pools[pool_id];
        let mut packets = pool.packets.lock();
        for _ in 0..count {
            packets.push_back(Packet::new(self.packet_size));
        }
        pool.len.store(packets.len(), Ordering::SeqCst);
        drop(packets);
        self.npools.fetch_max(pool_id + 1, Ordering::SeqCst);
    }

    /// id of the calling thread's pool, assigned on first use
    pub(crate) fn local_id(&self) -> usize {
        *self.local_id.get_or(|| {
            let id = self.npools.fetch_add(1, Ordering::SeqCst);
            if id >= self.pools.len() {
                fatal!(
                    "too many threads use the packet pool (max {}), raise LCI_MAX_PACKET_POOLS",
                    self.pools.len()
                );
            }
            id
        })
    }

    /// Non-blocking acquire: the local pool first, then one steal attempt.
    pub(crate) fn acquire(&self) -> Option<Box<Packet>> {
        let local = self.local_id();
        let pool = &self.pools[local];
        let mut packets = pool.packets.lock();
        let packet = match packets.pop_front() {
            Some(packet) => Some(packet),
            None => self.steal_into(local, &mut packets),
        };
        pool.len.store(packets.len(), Ordering::SeqCst);
        drop(packets);
        packet.map(|mut packet| {
            packet.header.return_pool = Some(local);
            packet.header.length = 0;
            self.acquired.fetch_add(1, Ordering::SeqCst);
            packet
        })
    }

    /// Spins until a packet is available, calling `progress` between attempts.
    pub(crate) fn acquire_blocking(&self, mut progress: impl FnMut()) -> Box<Packet> {
        let backoff = Backoff::new();
        loop {
            if let Some(packet) = self.acquire() {
                return packet;
            }
            progress();
            backoff.snooze();
        }
    }

    fn steal_into(&self, local: usize, packets: &mut VecDeque<Box<Packet>>) -> Option<Box<Packet>> {
        let npools = self.npools.load(Ordering::SeqCst).min(self.pools.len());
        if npools < 2 {
            return None;
        }
        // a random peer, never the local pool
        let mut target = Uniform::from(0..npools - 1).sample(&mut rand::thread_rng());
        if target >= local {
            target += 1;
        }
        let victim = &self.pools[target];
        if victim.len.load(Ordering::SeqCst) == 0 {
            return None;
        }
        let mut victim_packets = victim.packets.try_lock()?;
        if victim_packets.is_empty() {
            return None;
        }
        let n = std::cmp::max(1, victim_packets.len() / 2);
        let start = victim_packets.len() - n;
        packets.extend(victim_packets.drain(start..));
        victim.len.store(victim_packets.len(), Ordering::SeqCst);
        drop(victim_packets);
        packets.pop_front()
    }

    /// Returns a packet to the pool it names, or to the caller's pool when it
    /// names none.
    pub(crate) fn release(&self, packet: Box<Packet>) {
        let pool_id = match packet.header.return_pool {
            Some(id) => id,
            None => self.local_id(),
        };
        self.put_to(pool_id, packet);
    }

    pub(crate) fn put_to(&self, pool_id: usize, packet: Box<Packet>) {
        let pool = &self.pools[pool_id];
        let mut packets = pool.packets.lock();
        packets.push_front(packet);
        pool.len.store(packets.len(), Ordering::SeqCst);
        drop(packets);
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    /// packets currently held by all pools
    pub(crate) fn available(&self) -> usize {
        self.pools
            .iter()
            .map(|pool| pool.len.load(Ordering::SeqCst))
            .sum()
    }

    /// (successful acquires, releases) since construction
    pub(crate) fn counters(&self) -> (usize, usize) {
        (
            self.acquired.load(Ordering::SeqCst),
            self.released.load(Ordering::SeqCst),
        )
    }
}

impl std::fmt::Debug for PacketPool {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let (acquired, released) = self.counters();
        f.debug_struct("PacketPool")
            .field("npools", &self.npools.load(Ordering::SeqCst))
            .field("available", &self.available())
            .field("acquired", &acquired)
            .field("released", &released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn pool_with(count: usize) -> PacketPool {
        let pool = PacketPool::new(8, 64);
        pool.populate(pool.local_id(), count);
        pool
    }

    #[test]
    fn exhausted_pool_returns_none() {
        let pool = pool_with(2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.counters(), (2, 2));
    }

    #[test]
    fn release_goes_to_origin_pool() {
        let pool = Arc::new(PacketPool::new(8, 64));
        // the test thread owns pool 0
        pool.populate(pool.local_id(), 4);
        let packet = pool.acquire().unwrap();
        assert_eq!(packet.header.return_pool, Some(0));

        let remote = pool.clone();
        std::thread::spawn(move || {
            let id = remote.local_id();
            assert_ne!(id, 0);
            remote.release(packet);
            assert_eq!(remote.pools[id].len.load(Ordering::SeqCst), 0);
        })
        .join()
        .unwrap();
        assert_eq!(pool.pools[0].len.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn cleared_return_pool_goes_to_releaser() {
        let pool = Arc::new(PacketPool::new(8, 64));
        pool.populate(pool.local_id(), 1);
        let mut packet = pool.acquire().unwrap();
        packet.header.return_pool = None;
        let remote = pool.clone();
        std::thread::spawn(move || {
            let id = remote.local_id();
            remote.release(packet);
            assert_eq!(remote.pools[id].len.load(Ordering::SeqCst), 1);
        })
        .join()
        .unwrap();
        assert_eq!(pool.pools[0].len.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn empty_thread_steals_from_peer() {
        let pool = Arc::new(PacketPool::new(8, 64));
        pool.populate(pool.local_id(), 16);
        let remote = pool.clone();
        std::thread::spawn(move || {
            let mut got = Vec::new();
            // the steal target is random, keep trying until the only
            // non-empty peer is picked
            while got.is_empty() {
                if let Some(packet) = remote.acquire() {
                    got.push(packet);
                }
            }
            let id = remote.local_id();
            // half of the victim's packets moved over, one was handed out
            assert_eq!(remote.pools[id].len.load(Ordering::SeqCst), 7);
            for packet in got {
                remote.release(packet);
            }
        })
        .join()
        .unwrap();
        assert_eq!(pool.available(), 16);
    }

    #[test]
    fn lone_packet_in_peer_pool_is_stolen() {
        let pool = Arc::new(PacketPool::new(8, 64));
        pool.populate(pool.local_id(), 1);
        let remote = pool.clone();
        std::thread::spawn(move || {
            let packet = remote.acquire().unwrap();
            assert_eq!(remote.available(), 0);
            assert!(remote.acquire().is_none());
            remote.release(packet);
        })
        .join()
        .unwrap();
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.counters(), (1, 1));
    }

    #[test]
    fn steal_picks_any_nonempty_peer() {
        let pool = Arc::new(PacketPool::new(8, 64));
        // pools 0 and 1 stay empty, pool 2 holds the only packet
        let _ = pool.local_id();
        let middle = pool.clone();
        std::thread::spawn(move || {
            let _ = middle.local_id();
        })
        .join()
        .unwrap();
        let owner = pool.clone();
        std::thread::spawn(move || owner.populate(owner.local_id(), 1))
            .join()
            .unwrap();
        let mut attempts = 0;
        let packet = loop {
            attempts += 1;
            if let Some(packet) = pool.acquire() {
                break packet;
            }
            assert!(attempts < 10_000, "free packet never acquired");
        };
        pool.release(packet);
    }

    #[test]
    fn blocking_acquire_waits_for_release() {
        let pool = Arc::new(PacketPool::new(8, 64));
        pool.populate(pool.local_id(), 1);
        let held = pool.acquire().unwrap();
        let mut held = Some(held);
        let mut calls = 0;
        // the progress callback frees the only packet on its third call
        let packet = pool.acquire_blocking(|| {
            calls += 1;
            if calls == 3 {
                if let Some(packet) = held.take() {
                    pool.release(packet);
                }
            }
        });
        assert_eq!(calls, 3);
        pool.release(packet);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn blocking_acquire_steals_from_peer() {
        let pool = Arc::new(PacketPool::new(8, 64));
        pool.populate(pool.local_id(), 1);
        let remote = pool.clone();
        std::thread::spawn(move || {
            let packet = remote.acquire_blocking(|| {});
            assert_eq!(packet.header.return_pool, Some(remote.local_id()));
            remote.release(packet);
        })
        .join()
        .unwrap();
        assert_eq!(pool.counters(), (1, 1));
    }

    #[test]
    fn conservation_under_contention() {
        let pool = Arc::new(PacketPool::new(16, 64));
        pool.populate(pool.local_id(), 64);
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    let mut held = Vec::new();
                    for i in 0..10_000 {
                        if let Some(packet) = pool.acquire() {
                            held.push(packet);
                        }
                        if i % 3 == 0 {
                            if let Some(packet) = held.pop() {
                                pool.release(packet);
                            }
                        }
                    }
                    for packet in held {
                        pool.release(packet);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        let (acquired, released) = pool.counters();
        assert_eq!(acquired, released);
        assert_eq!(pool.available(), 64);
    }
}
