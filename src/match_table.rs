use crate::spinlock::SpinMutex;
use crate::Tag;

const SLOTS_PER_NODE: usize = 3;
const EMPTY: u64 = u64::MAX;

const FNV_SEED: u32 = 0x811C_9DC5;
const FNV_PRIME: u32 = 0x0100_0193;
const FOLD_BITS: u32 = 16;

/// Which side of a match an insert comes from.
#[repr(u64)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum MatchSide {
    /// a posted receive
    Recv = 0,
    /// an arrived message
    Send = 1,
}

impl MatchSide {
    fn opposite(self) -> MatchSide {
        match self {
            MatchSide::Recv => MatchSide::Send,
            MatchSide::Send => MatchSide::Recv,
        }
    }
}

/// How an endpoint pairs incoming messages with posted receives.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub enum MatchType {
    /// source rank and tag must both agree
    #[default]
    RankTag,
    /// only the tag must agree, any source matches
    Tag,
}

/// The message kinds that go through matching, two bits of the key.
#[repr(u64)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum MatchKind {
    Short = 0,
    Medium = 1,
    Long = 2,
}

/// `rank << 32 | kind << 30 | gid << 16 | tag`, rank is all ones for tag-only matching
pub(crate) fn make_key(
    rank: usize,
    gid: u16,
    tag: Tag,
    kind: MatchKind,
    match_type: MatchType,
) -> u64 {
    let rank = match match_type {
        MatchType::RankTag => rank as u64 & 0xFFFF_FFFF,
        MatchType::Tag => 0xFFFF_FFFF,
    };
    rank << 32 | (kind as u64) << 30 | (gid as u64 & 0x3FFF) << 16 | tag as u64
}

#[derive(Debug)]
pub(crate) enum MatchOutcome<V> {
    /// the opposite side was waiting, it has been removed from the table
    Matched { stored: V, incoming: V },
    Inserted,
}

struct Slot<V> {
    tag: u64,
    value: Option<V>,
}

struct Node<V> {
    slots: [Slot<V>; SLOTS_PER_NODE],
    next: Option<Box<Node<V>>>,
}

impl<V> Node<V> {
    fn new() -> Node<V> {
        Node {
            slots: std::array::from_fn(|_| Slot {
                tag: EMPTY,
                value: None,
            }),
            next: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.slots.iter().all(|slot| slot.tag == EMPTY)
    }
}

/// A concurrent insert-or-match hash table.
///
/// Each bucket is a spinlock-guarded chain of three-slot nodes. The stored tag
/// is `key << 1 | side`, so an insert only ever matches an entry that was
/// stored by the opposite side.
pub(crate) struct MatchTable<V> {
    buckets: Box<[SpinMutex<Node<V>>]>,
    mask: u32,
}

impl<V> MatchTable<V> {
    pub(crate) fn new(nbits: u32) -> MatchTable<V> {
        let nbuckets = 1usize << nbits;
        MatchTable {
            buckets: (0..nbuckets).map(|_| SpinMutex::new(Node::new())).collect(),
            mask: (nbuckets - 1) as u32,
        }
    }

    fn hash(&self, key: u64) -> usize {
        let mut hash = FNV_SEED;
        for byte in key.to_le_bytes() {
            hash = hash.wrapping_mul(FNV_PRIME) ^ byte as u32;
        }
        (((hash >> FOLD_BITS) ^ hash) & self.mask) as usize
    }

    /// Matches `value` against an entry from the opposite side, or stores it.
    ///
    /// The bucket lock is held only for the scan and the slot update.
    pub(crate) fn insert_or_match(&self, key: u64, value: V, side: MatchSide) -> MatchOutcome<V> {
        let wanted = key << 1 | side.opposite() as u64;
        let mine = key << 1 | side as u64;
        debug_assert!(mine != EMPTY && wanted != EMPTY, "key {:x} collides with the empty tag", key);

        let mut head = self.buckets[self.hash(key)].lock();

        // pass one: look for the opposite side anywhere in the chain
        let mut node: &mut Node<V> = &mut head;
        let mut depth = 0;
        loop {
            if let Some(slot) = node.slots.iter_mut().find(|slot| slot.tag == wanted) {
                slot.tag = EMPTY;
                let stored = slot.value.take();
                drop(unlink_if_empty(&mut head, depth));
                return match stored {
                    Some(stored) => MatchOutcome::Matched {
                        stored,
                        incoming: value,
                    },
                    None => unreachable!("occupied match table slot without a value"),
                };
            }
            match node.next {
                Some(ref mut next) => {
                    node = &mut **next;
                    depth += 1;
                }
                None => break,
            }
        }

        // pass two: store into the first free slot, growing the chain if needed
        let mut node: &mut Node<V> = &mut head;
        loop {
            if let Some(slot) = node.slots.iter_mut().find(|slot| slot.tag == EMPTY) {
                slot.tag = mine;
                slot.value = Some(value);
                return MatchOutcome::Inserted;
            }
            node = &mut **node.next.get_or_insert_with(|| Box::new(Node::new()));
        }
    }

    /// number of stored entries, locks every bucket in turn
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.buckets
            .iter()
            .map(|bucket| {
                let head = bucket.lock();
                let mut count = 0;
                let mut node: Option<&Node<V>> = Some(&head);
                while let Some(n) = node {
                    count += n.slots.iter().filter(|slot| slot.tag != EMPTY).count();
                    node = n.next.as_deref();
                }
                count
            })
            .sum()
    }
}

/// Unlinks the overflow node at `depth` if it no longer holds any entry.
/// The head node is never freed.
fn unlink_if_empty<V>(head: &mut Node<V>, depth: usize) -> Option<Box<Node<V>>> {
    if depth == 0 {
        return None;
    }
    let mut parent: &mut Node<V> = head;
    for _ in 1..depth {
        parent = parent.next.as_deref_mut()?;
    }
    let empty = parent.next.as_ref().map_or(false, |node| node.is_empty());
    if empty {
        let mut removed = parent.next.take()?;
        parent.next = removed.next.take();
        Some(removed)
    } else {
        None
    }
}
