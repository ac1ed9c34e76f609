use std::{collections::HashMap, net::IpAddr, time::Instant};

use tokio::sync::oneshot;
use tracing::debug;

use crate::id20::Id20;

pub type LookupSender = oneshot::Sender<Option<IpAddr>>;

/// The result of [`crate::DhtState::lookup`]: either known right away or
/// pending on a network search.
#[derive(Debug)]
pub enum LookupHandle {
    Ready(Option<IpAddr>),
    Pending(oneshot::Receiver<Option<IpAddr>>),
}

impl LookupHandle {
    pub async fn wait(self) -> Option<IpAddr> {
        match self {
            LookupHandle::Ready(addr) => addr,
            // A dropped sender means the DHT shut down.
            LookupHandle::Pending(rx) => rx.await.ok().flatten(),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PutResult {
    /// First waiter for this id, a search should be started.
    New,
    /// Joined a search already in flight.
    Attached,
}

struct LookupRequest {
    waiters: Vec<LookupSender>,
    deadline: Instant,
}

/// Pending lookups keyed by target, so that concurrent lookups of the same id
/// share one search.
#[derive(Default)]
pub struct LookupRegistry {
    pending: HashMap<Id20, LookupRequest>,
}

impl LookupRegistry {
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, id: &Id20) -> bool {
        self.pending.contains_key(id)
    }

    pub fn put(&mut self, id: Id20, waiter: LookupSender, deadline: Instant) -> PutResult {
        match self.pending.get_mut(&id) {
            Some(req) => {
                req.waiters.push(waiter);
                PutResult::Attached
            }
            None => {
                self.pending.insert(
                    id,
                    LookupRequest {
                        waiters: vec![waiter],
                        deadline,
                    },
                );
                PutResult::New
            }
        }
    }

    /// Fires every waiter of `id` and forgets it. Returns how many were waiting.
    pub fn resolve(&mut self, id: &Id20, result: Option<IpAddr>) -> usize {
        let Some(req) = self.pending.remove(id) else {
            return 0;
        };
        let count = req.waiters.len();
        for waiter in req.waiters {
            // The receiver may have given up, that's fine.
            let _ = waiter.send(result);
        }
        count
    }

    /// Resolves every pending lookup as not found. Returns how many waiters
    /// there were.
    pub fn fail_all(&mut self) -> usize {
        let ids: Vec<Id20> = self.pending.keys().copied().collect();
        ids.iter().map(|id| self.resolve(id, None)).sum()
    }

    /// Resolves as not found every lookup past its deadline.
    pub fn expire(&mut self, now: Instant) -> Vec<Id20> {
        let expired: Vec<Id20> = self
            .pending
            .iter()
            .filter(|(_, req)| req.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired.iter() {
            debug!(?id, "lookup deadline exceeded");
            self.resolve(id, None);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{IpAddr, Ipv4Addr},
        time::{Duration, Instant},
    };

    use tokio::sync::oneshot;

    use super::*;

    #[tokio::test]
    async fn test_fan_in() {
        let now = Instant::now();
        let mut reg = LookupRegistry::default();
        let id = Id20::random();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        assert_eq!(reg.put(id, tx1, now), PutResult::New);
        assert_eq!(reg.put(id, tx2, now), PutResult::Attached);
        assert_eq!(reg.len(), 1);

        let ip = IpAddr::from(Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(reg.resolve(&id, Some(ip)), 2);
        assert!(reg.is_empty());
        assert_eq!(rx1.await.unwrap(), Some(ip));
        assert_eq!(rx2.await.unwrap(), Some(ip));

        // Already resolved.
        assert_eq!(reg.resolve(&id, None), 0);
    }

    #[tokio::test]
    async fn test_expire() {
        let now = Instant::now();
        let mut reg = LookupRegistry::default();
        let early = Id20::random();
        let late = Id20::random();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        reg.put(early, tx1, now + Duration::from_secs(5));
        reg.put(late, tx2, now + Duration::from_secs(20));

        assert!(reg.expire(now).is_empty());
        assert_eq!(reg.expire(now + Duration::from_secs(10)), vec![early]);
        assert_eq!(rx1.await.unwrap(), None);
        assert!(reg.contains(&late));
    }

    #[tokio::test]
    async fn test_fail_all() {
        let now = Instant::now();
        let mut reg = LookupRegistry::default();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        let (tx3, rx3) = oneshot::channel();
        let id = Id20::random();
        reg.put(id, tx1, now + Duration::from_secs(20));
        reg.put(id, tx2, now + Duration::from_secs(20));
        reg.put(Id20::random(), tx3, now + Duration::from_secs(20));

        assert_eq!(reg.fail_all(), 3);
        assert!(reg.is_empty());
        assert_eq!(rx1.await.unwrap(), None);
        assert_eq!(rx2.await.unwrap(), None);
        assert_eq!(rx3.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_handle() {
        let ip = IpAddr::from(Ipv4Addr::LOCALHOST);
        assert_eq!(LookupHandle::Ready(Some(ip)).wait().await, Some(ip));

        let (tx, rx) = oneshot::channel::<Option<IpAddr>>();
        drop(tx);
        assert_eq!(LookupHandle::Pending(rx).wait().await, None);
    }

    #[test]
    fn test_dropped_receiver_is_fine() {
        let mut reg = LookupRegistry::default();
        let id = Id20::random();
        let (tx, rx) = oneshot::channel();
        reg.put(id, tx, Instant::now());
        drop(rx);
        assert_eq!(reg.resolve(&id, None), 1);
    }
}
