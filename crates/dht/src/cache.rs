use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    time::{Duration, Instant},
};

use bencode::ByteBufOwned;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheVerdict {
    Fresh,
    /// A retransmission of a request seen within the window.
    Duplicate,
    /// The source sent too many requests within the window.
    RateLimited,
}

type RequestKey = (SocketAddr, &'static str, ByteBufOwned);

struct SourceWindow {
    started: Instant,
    requests: usize,
}

/// Short-lived memory of inbound requests. Losing an entry only costs
/// reprocessing a request, never a wrong answer.
pub struct RequestCache {
    window: Duration,
    max_requests_per_window: usize,
    seen: HashMap<RequestKey, Instant>,
    sources: HashMap<IpAddr, SourceWindow>,
}

impl RequestCache {
    pub fn new(window: Duration, max_requests_per_window: usize) -> Self {
        Self {
            window,
            max_requests_per_window,
            seen: HashMap::new(),
            sources: HashMap::new(),
        }
    }

    pub fn check(
        &mut self,
        source: SocketAddr,
        method: &'static str,
        transaction_id: &ByteBufOwned,
        now: Instant,
    ) -> CacheVerdict {
        let key = (source, method, transaction_id.clone());
        if let Some(seen) = self.seen.get(&key) {
            if now.saturating_duration_since(*seen) < self.window {
                return CacheVerdict::Duplicate;
            }
        }

        let window = self
            .sources
            .entry(source.ip())
            .or_insert(SourceWindow {
                started: now,
                requests: 0,
            });
        if now.saturating_duration_since(window.started) >= self.window {
            window.started = now;
            window.requests = 0;
        }
        if window.requests >= self.max_requests_per_window {
            return CacheVerdict::RateLimited;
        }
        window.requests += 1;
        self.seen.insert(key, now);
        CacheVerdict::Fresh
    }

    pub fn expire(&mut self, now: Instant) {
        let window = self.window;
        self.seen
            .retain(|_, seen| now.saturating_duration_since(*seen) < window);
        self.sources
            .retain(|_, w| now.saturating_duration_since(w.started) < window);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
