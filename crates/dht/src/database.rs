use std::{
    collections::{BTreeSet, HashMap},
    net::IpAddr,
    time::{Duration, Instant},
};

use tracing::trace;

use crate::id20::Id20;

pub const DEFAULT_CAPACITY: usize = 16384;

#[derive(Debug, Clone, Copy)]
struct Record {
    addr: IpAddr,
    expires: Instant,
}

/// Records this node serves for others, each with an expiry.
pub struct Database {
    records: HashMap<Id20, Record>,
    by_expiry: BTreeSet<(Instant, Id20)>,
    max_ttl: Duration,
    capacity: usize,
}

impl Database {
    pub fn new(max_ttl: Duration, capacity: usize) -> Self {
        Self {
            records: HashMap::new(),
            by_expiry: BTreeSet::new(),
            max_ttl,
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Inserts or replaces a record. `ttl` is in seconds and capped to the
    /// maximum; returns the ttl actually applied. A zero ttl removes the record.
    pub fn store(&mut self, id: Id20, addr: IpAddr, ttl: u32, now: Instant) -> Duration {
        let ttl = Duration::from_secs(u64::from(ttl).min(self.max_ttl.as_secs()));
        self.remove(&id);
        if ttl.is_zero() {
            return ttl;
        }
        if self.records.len() >= self.capacity {
            // Full: drop the record closest to expiring.
            if let Some((_, victim)) = self.by_expiry.first().copied() {
                trace!(?victim, "database full, evicting");
                self.remove(&victim);
            }
        }
        let expires = now + ttl;
        self.records.insert(id, Record { addr, expires });
        self.by_expiry.insert((expires, id));
        ttl
    }

    fn remove(&mut self, id: &Id20) {
        if let Some(old) = self.records.remove(id) {
            self.by_expiry.remove(&(old.expires, *id));
        }
    }

    pub fn lookup(&self, id: &Id20, now: Instant) -> Option<IpAddr> {
        self.records
            .get(id)
            .filter(|r| r.expires > now)
            .map(|r| r.addr)
    }

    /// Removes every expired record, returning how many were removed.
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        while let Some((expires, id)) = self.by_expiry.first().copied() {
            if expires > now {
                break;
            }
            self.by_expiry.remove(&(expires, id));
            self.records.remove(&id);
            removed += 1;
        }
        removed
    }
}
