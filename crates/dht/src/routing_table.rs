use std::{
    collections::VecDeque,
    net::SocketAddr,
    ops::RangeInclusive,
    time::{Duration, Instant},
};

use serde::Serialize;

use crate::{
    id20::{ID_BITS, Id20},
    utils::serialize_id20,
};

#[derive(Debug, Clone, Serialize)]
pub struct Peer {
    #[serde(serialize_with = "serialize_id20")]
    pub id: Id20,
    pub addr: SocketAddr,
    #[serde(skip)]
    pub last_seen: Instant,
    pub fail_count: u32,
}

#[derive(Debug, Serialize)]
struct Bucket {
    // Least recently seen at the front.
    peers: VecDeque<Peer>,
    #[serde(skip)]
    last_changed: Instant,
}

impl Bucket {
    fn new(now: Instant) -> Self {
        Self {
            peers: VecDeque::new(),
            last_changed: now,
        }
    }

    fn position(&self, id: &Id20) -> Option<usize> {
        self.peers.iter().position(|p| &p.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertResult {
    Added,
    Refreshed,
    /// The bucket is full and can't be split. The stale peer should be pinged;
    /// if it doesn't answer call [`RoutingTable::replace`].
    Probe { stale: Peer },
    Ignored,
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.addr == other.addr
    }
}

impl Eq for Peer {}

/// Buckets of peers keyed by the length of the prefix shared with our own id.
///
/// Bucket `i` holds peers whose id shares exactly `i` leading bits with ours,
/// except for the last bucket which holds everything sharing at least that
/// many. Only the last bucket ever gets split, so the buckets always partition
/// the whole id space.
#[derive(Debug, Serialize)]
pub struct RoutingTable {
    #[serde(serialize_with = "serialize_id20")]
    id: Id20,
    #[serde(skip)]
    k: usize,
    #[serde(skip)]
    max_fail_count: u32,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(id: Id20, k: usize, max_fail_count: u32, now: Instant) -> Self {
        Self {
            id,
            k,
            max_fail_count,
            buckets: vec![Bucket::new(now)],
        }
    }

    pub fn id(&self) -> Id20 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.peers.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.peers.is_empty())
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.buckets.iter().flat_map(|b| b.peers.iter())
    }

    fn bucket_idx(&self, id: &Id20) -> usize {
        self.id
            .common_prefix_len(id)
            .min(self.buckets.len().saturating_sub(1))
    }

    pub fn get(&self, id: &Id20) -> Option<&Peer> {
        let bucket = &self.buckets[self.bucket_idx(id)];
        bucket.peers.iter().find(|p| &p.id == id)
    }

    pub fn insert(&mut self, id: Id20, addr: SocketAddr, now: Instant) -> InsertResult {
        if id == self.id {
            return InsertResult::Ignored;
        }
        loop {
            let idx = self.bucket_idx(&id);
            // The last bucket contains our own id.
            let can_split = idx + 1 == self.buckets.len() && self.buckets.len() < ID_BITS;
            let k = self.k;
            let bucket = &mut self.buckets[idx];

            if let Some(pos) = bucket.position(&id) {
                if let Some(mut peer) = bucket.peers.remove(pos) {
                    peer.addr = addr;
                    peer.last_seen = now;
                    peer.fail_count = 0;
                    bucket.peers.push_back(peer);
                }
                bucket.last_changed = now;
                return InsertResult::Refreshed;
            }

            if bucket.peers.len() < k {
                bucket.peers.push_back(Peer {
                    id,
                    addr,
                    last_seen: now,
                    fail_count: 0,
                });
                bucket.last_changed = now;
                return InsertResult::Added;
            }

            if can_split {
                self.split_last(now);
                continue;
            }

            return match bucket.peers.front() {
                Some(stale) => InsertResult::Probe {
                    stale: stale.clone(),
                },
                None => InsertResult::Ignored,
            };
        }
    }

    fn split_last(&mut self, now: Instant) {
        let split_at = self.buckets.len();
        let own = self.id;
        let mut new_bucket = Bucket::new(now);
        if let Some(last) = self.buckets.last_mut() {
            let (stay, go): (VecDeque<Peer>, VecDeque<Peer>) = last
                .peers
                .drain(..)
                .partition(|p| own.common_prefix_len(&p.id) < split_at);
            last.peers = stay;
            new_bucket.peers = go;
        }
        self.buckets.push(new_bucket);
    }

    /// Evicts `stale` in favor of a new peer after a failed liveness probe.
    pub fn replace(
        &mut self,
        stale: &Id20,
        id: Id20,
        addr: SocketAddr,
        now: Instant,
    ) -> InsertResult {
        self.remove(stale);
        self.insert(id, addr, now)
    }

    pub fn remove(&mut self, id: &Id20) -> Option<Peer> {
        let idx = self.bucket_idx(id);
        let bucket = &mut self.buckets[idx];
        let pos = bucket.position(id)?;
        bucket.peers.remove(pos)
    }

    /// Records a response from a peer that's already in the table.
    pub fn mark_seen(&mut self, id: &Id20, now: Instant) -> bool {
        let idx = self.bucket_idx(id);
        let bucket = &mut self.buckets[idx];
        let Some(pos) = bucket.position(id) else {
            return false;
        };
        if let Some(mut peer) = bucket.peers.remove(pos) {
            peer.last_seen = now;
            peer.fail_count = 0;
            bucket.peers.push_back(peer);
        }
        bucket.last_changed = now;
        true
    }

    /// Returns true if the peer was removed for failing too many times in a row.
    pub fn mark_failed(&mut self, id: &Id20) -> bool {
        let idx = self.bucket_idx(id);
        let max_fail_count = self.max_fail_count;
        let bucket = &mut self.buckets[idx];
        let Some(pos) = bucket.position(id) else {
            return false;
        };
        let remove = match bucket.peers.get_mut(pos) {
            Some(peer) => {
                peer.fail_count += 1;
                peer.fail_count >= max_fail_count
            }
            None => false,
        };
        if remove {
            bucket.peers.remove(pos);
        }
        remove
    }

    pub fn closest(&self, target: &Id20, n: usize) -> Vec<Peer> {
        let mut result: Vec<&Peer> = self.iter().collect();
        result.sort_by_key(|p| target.distance(&p.id));
        result.into_iter().take(n).cloned().collect()
    }

    pub fn stale_buckets(&self, now: Instant, interval: Duration) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| now.saturating_duration_since(b.last_changed) >= interval)
            .map(|(idx, _)| idx)
            .collect()
    }

    pub fn touch_bucket(&mut self, idx: usize, now: Instant) {
        if let Some(b) = self.buckets.get_mut(idx) {
            b.last_changed = now;
        }
    }

    /// A random id falling into bucket `idx`.
    pub fn random_id_in_bucket(&self, idx: usize) -> Id20 {
        let mut id = self.id.random_with_prefix(idx);
        if idx + 1 < self.buckets.len() && idx < ID_BITS {
            id.set_bit(idx, !self.id.get_bit(idx));
        }
        id
    }

    /// The inclusive id range covered by bucket `idx`.
    pub fn bucket_range(&self, idx: usize) -> RangeInclusive<Id20> {
        let mut lo = self.id;
        let mut hi = self.id;
        let free_from = if idx + 1 < self.buckets.len() {
            lo.set_bit(idx, !self.id.get_bit(idx));
            hi.set_bit(idx, !self.id.get_bit(idx));
            idx + 1
        } else {
            idx
        };
        lo.set_bits_range(free_from..ID_BITS, false);
        hi.set_bits_range(free_from..ID_BITS, true);
        lo..=hi
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{Ipv4Addr, SocketAddr},
        time::{Duration, Instant},
    };

    use super::*;

    fn addr(n: u32) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::from(n), 8337))
    }

    fn next(id: &Id20) -> Option<Id20> {
        let mut out = *id;
        for byte in out.0.iter_mut().rev() {
            let (v, overflow) = byte.overflowing_add(1);
            *byte = v;
            if !overflow {
                return Some(out);
            }
        }
        None
    }

    fn assert_partition(rt: &RoutingTable) {
        let mut ranges: Vec<_> = (0..rt.bucket_count()).map(|i| rt.bucket_range(i)).collect();
        ranges.sort_by_key(|r| *r.start());
        assert_eq!(*ranges[0].start(), Id20::default());
        assert_eq!(*ranges[ranges.len() - 1].end(), Id20::MAX);
        for w in ranges.windows(2) {
            assert_eq!(next(w[0].end()), Some(*w[1].start()));
        }
        for (idx, bucket) in rt.buckets.iter().enumerate() {
            let range = rt.bucket_range(idx);
            assert!(bucket.peers.len() <= rt.k);
            for p in bucket.peers.iter() {
                assert!(range.contains(&p.id), "{:?} not in bucket {idx}", p.id);
            }
        }
        assert!(rt.len() <= rt.bucket_count() * rt.k);
    }

    #[test]
    fn test_buckets_partition_id_space() {
        let now = Instant::now();
        let mut rt = RoutingTable::new(Id20::random(), 8, 3, now);
        assert_partition(&rt);
        for i in 0..2000 {
            rt.insert(Id20::random(), addr(i), now);
        }
        // Ids close to ours force deep splits.
        for bits in (0..60).step_by(3) {
            rt.insert(rt.id().random_with_prefix(bits), addr(bits as u32), now);
        }
        assert!(rt.bucket_count() > 1);
        assert_partition(&rt);
    }

    #[test]
    fn test_insert_is_idempotent() {
        let now = Instant::now();
        let mut rt = RoutingTable::new(Id20::random(), 8, 3, now);
        let id = Id20::random();
        assert_eq!(rt.insert(id, addr(1), now), InsertResult::Added);
        assert_eq!(
            rt.insert(id, addr(1), now + Duration::from_secs(1)),
            InsertResult::Refreshed
        );
        assert_eq!(rt.len(), 1);
        assert_eq!(rt.get(&id).unwrap().last_seen, now + Duration::from_secs(1));
        assert_eq!(rt.insert(rt.id(), addr(2), now), InsertResult::Ignored);
        assert_eq!(rt.len(), 1);
    }

    // Fills the bucket of ids not sharing the first bit with ours.
    fn full_far_bucket(k: usize) -> (RoutingTable, Vec<Id20>, Instant) {
        let now = Instant::now();
        let own = Id20::default();
        let mut rt = RoutingTable::new(own, k, 3, now);
        let mut far = Vec::new();
        for i in 0..k {
            let mut id = Id20::random();
            id.set_bit(0, true);
            rt.insert(id, addr(i as u32), now + Duration::from_secs(i as u64));
            far.push(id);
        }
        // Force a split so the far bucket no longer contains our id.
        for i in 0..k {
            let mut id = Id20::random();
            id.set_bit(0, false);
            rt.insert(id, addr(100 + i as u32), now);
        }
        assert!(rt.bucket_count() >= 2);
        (rt, far, now)
    }

    #[test]
    fn test_full_bucket_probes_least_recently_seen() {
        let (mut rt, far, now) = full_far_bucket(4);
        let mut newcomer = Id20::random();
        newcomer.set_bit(0, true);

        let stale = match rt.insert(newcomer, addr(999), now) {
            InsertResult::Probe { stale } => stale,
            other => panic!("expected a probe, got {other:?}"),
        };
        assert_eq!(stale.id, far[0]);

        // Probe failed: evict the stale one.
        assert_eq!(
            rt.replace(&stale.id, newcomer, addr(999), now),
            InsertResult::Added
        );
        assert!(rt.get(&far[0]).is_none());
        assert!(rt.get(&newcomer).is_some());
    }

    #[test]
    fn test_full_bucket_keeps_responsive_peer() {
        let (mut rt, far, now) = full_far_bucket(4);
        let mut newcomer = Id20::random();
        newcomer.set_bit(0, true);

        let stale = match rt.insert(newcomer, addr(999), now) {
            InsertResult::Probe { stale } => stale,
            other => panic!("expected a probe, got {other:?}"),
        };
        // Probe answered: the stale peer stays and becomes most recently seen.
        assert!(rt.mark_seen(&stale.id, now + Duration::from_secs(60)));
        assert!(rt.get(&newcomer).is_none());
        assert!(far.iter().all(|id| rt.get(id).is_some()));
        match rt.insert(newcomer, addr(999), now) {
            InsertResult::Probe { stale } => assert_eq!(stale.id, far[1]),
            other => panic!("expected a probe, got {other:?}"),
        }
    }

    #[test]
    fn test_mark_failed_threshold() {
        let now = Instant::now();
        let mut rt = RoutingTable::new(Id20::random(), 8, 3, now);
        let id = Id20::random();
        rt.insert(id, addr(1), now);
        assert!(!rt.mark_failed(&id));
        assert!(!rt.mark_failed(&id));
        assert!(rt.mark_failed(&id));
        assert!(rt.get(&id).is_none());
        assert!(!rt.mark_failed(&id));
    }

    #[test]
    fn test_closest() {
        let now = Instant::now();
        let mut rt = RoutingTable::new(Id20::random(), 8, 3, now);
        let mut all = Vec::new();
        for i in 0..200 {
            let id = Id20::random();
            if rt.insert(id, addr(i), now) == InsertResult::Added {
                all.push(id);
            }
        }
        let target = Id20::random();
        all.sort_by_key(|id| target.distance(id));
        let closest: Vec<_> = rt.closest(&target, 5).into_iter().map(|p| p.id).collect();
        assert_eq!(closest, all[..5]);
    }

    #[test]
    fn test_stale_buckets_and_random_ids() {
        let now = Instant::now();
        let (rt, _, _) = full_far_bucket(4);
        let later = now + Duration::from_secs(3600);
        let stale = rt.stale_buckets(later, Duration::from_secs(900));
        assert_eq!(stale.len(), rt.bucket_count());
        assert!(rt.stale_buckets(now, Duration::from_secs(900)).is_empty());
        for idx in 0..rt.bucket_count() {
            for _ in 0..10 {
                let id = rt.random_id_in_bucket(idx);
                assert!(rt.bucket_range(idx).contains(&id));
                assert_eq!(rt.bucket_idx(&id), idx);
            }
        }
    }
}
