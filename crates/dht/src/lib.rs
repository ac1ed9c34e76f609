//! Kademlia DHT mapping 160-bit name digests to IP addresses, the core of the
//! masala name resolver.
//!
//! ```no_run
//! # async fn run() -> anyhow::Result<()> {
//! let dht = masala_dht::DhtBuilder::new().await?;
//! dht.announce("printer.p2p", None)?;
//! let addr = dht.lookup_name("nas.p2p")?.wait().await;
//! # Ok(())
//! # }
//! ```

mod announce;
pub mod bprotocol;
mod cache;
mod compact;
mod config;
mod database;
mod dht;
mod error;
mod id20;
mod lookups;
mod neighborhood;
mod persistence;
mod routing_table;
mod search;
mod spawn_utils;
mod utils;

#[cfg(test)]
mod tests;

use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

pub use crate::announce::LocalRecord;
pub use crate::compact::{Compact, CompactList, CompactSerialize};
pub use crate::config::{DhtConfig, DhtTunables, InvalidTunables};
pub use crate::dht::{DhtState, DhtStats};
pub use crate::error::{Error, Result};
pub use crate::id20::{Id20, InvalidName, is_valid_name};
pub use crate::lookups::LookupHandle;
pub use crate::persistence::{default_identity_path, load_or_create_host_identity, node_id_for};
pub use crate::routing_table::{Peer, RoutingTable};

pub type Dht = Arc<DhtState>;

pub const DEFAULT_PORT: u16 = 8337;

pub const DEFAULT_LISTEN_ADDR: SocketAddr =
    SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), DEFAULT_PORT);

/// The realm used by the public network.
pub const DEFAULT_REALM: &str = "open.p2p";

pub struct DhtBuilder {}

impl DhtBuilder {
    #[allow(clippy::new_ret_no_self)]
    pub async fn new() -> Result<Dht> {
        DhtState::with_config(DhtConfig::default()).await
    }

    pub async fn with_config(config: DhtConfig) -> Result<Dht> {
        DhtState::with_config(config).await
    }
}

pub static DHT_BOOTSTRAP: &[&str] = &["[ff0e::1]:8337"];
