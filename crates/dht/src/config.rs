use std::{net::SocketAddr, path::PathBuf, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::{announce::LocalRecord, id20::Id20};

/// Protocol policy. The defaults are what the rest of the network expects;
/// changing them changes convergence behavior.
#[derive(Debug, Clone)]
pub struct DhtTunables {
    /// Bucket size and neighborhood size.
    pub k: usize,
    /// Queries per search round.
    pub alpha: usize,
    /// Consecutive timeouts after which a peer is dropped.
    pub max_fail_count: u32,
    pub query_timeout: Duration,
    pub search_deadline: Duration,
    pub lookup_deadline: Duration,
    pub bucket_refresh_interval: Duration,
    pub announce_interval: Duration,
    pub announce_ttl: Duration,
    /// Upper bound applied to ttls of incoming announces.
    pub max_ttl: Duration,
    pub cache_window: Duration,
    pub cache_max_requests_per_window: usize,
    pub tick_interval: Duration,
}

impl Default for DhtTunables {
    fn default() -> Self {
        Self {
            k: 8,
            alpha: 3,
            max_fail_count: 3,
            query_timeout: Duration::from_secs(2),
            search_deadline: Duration::from_secs(10),
            lookup_deadline: Duration::from_secs(20),
            bucket_refresh_interval: Duration::from_secs(15 * 60),
            announce_interval: Duration::from_secs(5 * 60),
            announce_ttl: Duration::from_secs(30 * 60),
            max_ttl: Duration::from_secs(2 * 60 * 60),
            cache_window: Duration::from_secs(5),
            cache_max_requests_per_window: 64,
            tick_interval: Duration::from_millis(500),
        }
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum InvalidTunables {
    #[error("announce interval ({interval:?}) must be shorter than the announce ttl ({ttl:?})")]
    AnnounceInterval { interval: Duration, ttl: Duration },
    #[error("{0} must be positive")]
    Zero(&'static str),
}

impl DhtTunables {
    pub fn validate(&self) -> Result<(), InvalidTunables> {
        if self.k == 0 {
            return Err(InvalidTunables::Zero("k"));
        }
        if self.alpha == 0 {
            return Err(InvalidTunables::Zero("alpha"));
        }
        if self.max_fail_count == 0 {
            return Err(InvalidTunables::Zero("max_fail_count"));
        }
        if self.tick_interval.is_zero() {
            return Err(InvalidTunables::Zero("tick_interval"));
        }
        if self.announce_interval >= self.announce_ttl {
            return Err(InvalidTunables::AnnounceInterval {
                interval: self.announce_interval,
                ttl: self.announce_ttl,
            });
        }
        Ok(())
    }

    /// The announce ttl in whole seconds, as sent on the wire.
    pub fn announce_ttl_secs(&self) -> u32 {
        u32::try_from(self.announce_ttl.as_secs()).unwrap_or(u32::MAX)
    }
}

#[derive(Default, Clone, Debug)]
pub struct DhtConfig {
    /// Overrides the id derived from the identity file.
    pub node_id: Option<Id20>,
    /// Where the host identity is persisted. Without it (and without
    /// `node_id`) a random id is used for this run only.
    pub identity_file: Option<PathBuf>,
    /// Defaults to [`crate::DEFAULT_LISTEN_ADDR`].
    pub listen_addr: Option<SocketAddr>,
    /// `host:port` strings. Defaults to [`crate::DHT_BOOTSTRAP`].
    pub bootstrap_addrs: Option<Vec<String>>,
    /// Namespace mixed into every identifier.
    pub realm: Option<String>,
    /// Names this node announces.
    pub records: Vec<LocalRecord>,
    pub tunables: DhtTunables,
    /// Cancelling it stops the node. A fresh token is used if unset.
    pub cancellation_token: Option<CancellationToken>,
}
