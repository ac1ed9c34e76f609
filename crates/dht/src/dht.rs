use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use backon::{ExponentialBuilder, Retryable};
use bencode::ByteBufOwned;
use futures::{StreamExt, stream::FuturesUnordered};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{
    net::UdpSocket,
    sync::{
        mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
        oneshot,
    },
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, error_span, info, trace, warn};

use crate::{
    DEFAULT_LISTEN_ADDR, DHT_BOOTSTRAP, Dht,
    announce::{Announcer, LocalRecord},
    bprotocol::{
        self, AnnounceRequest, ErrorDescription, FindNodeRequest, GetRequest, Message,
        MessageKind, Node, PingRequest, Response,
    },
    cache::{CacheVerdict, RequestCache},
    compact::Compact,
    config::{DhtConfig, DhtTunables},
    database::{DEFAULT_CAPACITY, Database},
    error::{Error, Result},
    id20::{Id20, InvalidName},
    lookups::{LookupHandle, LookupRegistry, PutResult},
    persistence::{load_or_create_host_identity, node_id_for},
    routing_table::{InsertResult, RoutingTable},
    search::{Search, SearchKind, SearchOutcome, SearchStep},
    spawn_utils::{self, spawn_with_cancel},
    utils::serialize_id20,
};

const MAX_DATAGRAM_SIZE: usize = 16384;
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
enum RequestKind {
    Search { kind: SearchKind, target: Id20 },
    /// Liveness check of `stale`, which `candidate` replaces if it times out.
    Probe { stale: Id20, candidate: Node<SocketAddr> },
    Bootstrap,
    Announce,
}

#[derive(Debug)]
struct OutstandingRequest {
    addr: SocketAddr,
    // Unknown for bootstrap nodes.
    node_id: Option<Id20>,
    kind: RequestKind,
    sent_at: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct DhtStats {
    #[serde(serialize_with = "serialize_id20")]
    pub id: Id20,
    pub routing_table_size: usize,
    pub buckets: usize,
    pub searches: usize,
    pub pending_lookups: usize,
    pub records: usize,
    pub outstanding_requests: usize,
    pub received: u64,
    pub dropped: u64,
    pub sent: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    dropped: AtomicU64,
    sent: AtomicU64,
}

struct DhtInner {
    id: Id20,
    tunables: DhtTunables,
    routing_table: RoutingTable,
    searches: HashMap<(SearchKind, Id20), Search>,
    lookups: LookupRegistry,
    database: Database,
    cache: RequestCache,
    announcer: Announcer,
    outstanding: HashMap<u16, OutstandingRequest>,
    next_transaction_id: u16,
    bootstrap_nodes: Vec<SocketAddr>,
    last_bootstrap: Option<Instant>,

    // Unbounded so that nothing behind the lock ever waits on the socket.
    sender: UnboundedSender<(Message, SocketAddr)>,
}

impl DhtInner {
    fn new(
        id: Id20,
        tunables: DhtTunables,
        records: Vec<LocalRecord>,
        sender: UnboundedSender<(Message, SocketAddr)>,
        now: Instant,
    ) -> Self {
        Self {
            id,
            routing_table: RoutingTable::new(id, tunables.k, tunables.max_fail_count, now),
            searches: HashMap::new(),
            lookups: LookupRegistry::default(),
            database: Database::new(tunables.max_ttl, DEFAULT_CAPACITY),
            cache: RequestCache::new(tunables.cache_window, tunables.cache_max_requests_per_window),
            announcer: Announcer::new(records, tunables.announce_interval),
            outstanding: HashMap::new(),
            next_transaction_id: 0,
            bootstrap_nodes: Vec::new(),
            last_bootstrap: None,
            sender,
            tunables,
        }
    }

    fn send(&self, msg: Message, addr: SocketAddr) {
        trace!(?addr, ?msg, "sending");
        if self.sender.send((msg, addr)).is_err() {
            debug!(?addr, "{}", Error::DhtDead);
        }
    }

    fn allocate_transaction_id(&mut self) -> u16 {
        let mut tid = self.next_transaction_id;
        for _ in 0..=u16::MAX {
            tid = self.next_transaction_id;
            self.next_transaction_id = self.next_transaction_id.wrapping_add(1);
            if !self.outstanding.contains_key(&tid) {
                break;
            }
        }
        tid
    }

    fn send_request(
        &mut self,
        kind: MessageKind,
        addr: SocketAddr,
        node_id: Option<Id20>,
        request: RequestKind,
        now: Instant,
    ) {
        let tid = self.allocate_transaction_id();
        self.outstanding.insert(
            tid,
            OutstandingRequest {
                addr,
                node_id,
                kind: request,
                sent_at: now,
            },
        );
        self.send(
            Message {
                kind,
                transaction_id: ByteBufOwned::from(&tid.to_be_bytes()),
                version: None,
            },
            addr,
        );
    }

    /// Something we know the answer for without asking the network.
    fn local_answer(&self, id: &Id20, now: Instant) -> Option<IpAddr> {
        self.database.lookup(id, now).or_else(|| {
            self.announcer
                .records()
                .iter()
                .find(|r| &r.id == id)
                .and_then(|r| r.addr)
        })
    }

    fn closest_nodes(&self, target: &Id20) -> Vec<Node<SocketAddr>> {
        self.routing_table
            .closest(target, self.tunables.k)
            .into_iter()
            .map(|p| Node {
                id: p.id,
                addr: p.addr,
            })
            .collect()
    }

    /// Every message from a peer updates the routing table.
    fn on_contact(&mut self, id: Id20, addr: SocketAddr, now: Instant) {
        let stale = match self.routing_table.insert(id, addr, now) {
            InsertResult::Probe { stale } => stale,
            InsertResult::Added => {
                trace!(?id, ?addr, "added to routing table");
                return;
            }
            InsertResult::Refreshed | InsertResult::Ignored => return,
        };
        let already_probing = self
            .outstanding
            .values()
            .any(|r| matches!(r.kind, RequestKind::Probe { stale: s, .. } if s == stale.id));
        if already_probing {
            return;
        }
        trace!(stale=?stale.id, candidate=?id, "bucket full, probing least recently seen peer");
        let own_id = self.id;
        self.send_request(
            MessageKind::PingRequest(PingRequest { id: own_id }),
            stale.addr,
            Some(stale.id),
            RequestKind::Probe {
                stale: stale.id,
                candidate: Node { id, addr },
            },
            now,
        );
    }

    fn start_search(&mut self, kind: SearchKind, target: Id20, now: Instant) {
        let key = (kind, target);
        if self.searches.contains_key(&key) {
            return;
        }
        let mut search = Search::new(
            kind,
            target,
            self.tunables.k,
            self.tunables.alpha,
            now + self.tunables.search_deadline,
        );
        let step = search.start(self.closest_nodes(&target));
        debug!(?kind, id = ?target, "starting search");
        self.searches.insert(key, search);
        self.drive_search(key, step, now);
    }

    fn drive_search(&mut self, key: (SearchKind, Id20), step: SearchStep, now: Instant) {
        let (kind, target) = key;
        match step {
            SearchStep::Continue(nodes) => {
                let own_id = self.id;
                for node in nodes {
                    let msg = match kind {
                        SearchKind::Lookup => MessageKind::GetRequest(GetRequest { id: own_id, target }),
                        SearchKind::Announce | SearchKind::Refresh => {
                            MessageKind::FindNodeRequest(FindNodeRequest { id: own_id, target })
                        }
                    };
                    self.send_request(
                        msg,
                        node.addr,
                        Some(node.id),
                        RequestKind::Search { kind, target },
                        now,
                    );
                }
            }
            SearchStep::Done(outcome) => {
                if let Some(search) = self.searches.remove(&key) {
                    self.on_search_done(search, outcome, now);
                }
            }
        }
    }

    fn on_search_done(&mut self, search: Search, outcome: SearchOutcome, now: Instant) {
        let target = search.target();
        match search.kind() {
            SearchKind::Lookup => {
                let result = match outcome {
                    SearchOutcome::Found(addr) => Some(addr),
                    SearchOutcome::NotFound | SearchOutcome::TimedOut => None,
                };
                let waiters = self.lookups.resolve(&target, result);
                debug!(id = ?target, ?result, waiters, "lookup finished");
            }
            SearchKind::Announce => {
                let Some(record) = self
                    .announcer
                    .records()
                    .iter()
                    .find(|r| r.id == target)
                    .cloned()
                else {
                    return;
                };
                let request = AnnounceRequest {
                    id: self.id,
                    target,
                    ttl: self.tunables.announce_ttl_secs(),
                    addr: record.addr.map(Compact),
                };
                let peers: Vec<Node<SocketAddr>> = search
                    .neighborhood()
                    .responded()
                    .map(|c| Node {
                        id: c.id,
                        addr: c.addr,
                    })
                    .collect();
                for peer in peers.iter() {
                    self.send_request(
                        MessageKind::AnnounceRequest(request.clone()),
                        peer.addr,
                        Some(peer.id),
                        RequestKind::Announce,
                        now,
                    );
                }
                debug!(name = %record.name, peers = peers.len(), ?outcome, "announced");
            }
            SearchKind::Refresh => {
                trace!(id = ?target, ?outcome, rounds = search.rounds(), "refresh finished");
            }
        }
    }

    fn on_request(&mut self, msg: Message, src: SocketAddr, now: Instant) -> bool {
        let Some(method) = msg.kind.method_name() else {
            return false;
        };
        match self.cache.check(src, method, &msg.transaction_id, now) {
            CacheVerdict::Fresh => {}
            verdict => {
                debug!(?src, method, ?verdict, "ignoring request");
                return false;
            }
        }
        if let Some(id) = msg.kind.sender_id() {
            self.on_contact(id, src, now);
        }

        let response = Response {
            id: self.id,
            ..Default::default()
        };
        let response = match msg.kind {
            MessageKind::PingRequest(_) => response,
            MessageKind::FindNodeRequest(req) => response.with_nodes(self.closest_nodes(&req.target)),
            MessageKind::GetRequest(req) => match self.local_answer(&req.target, now) {
                Some(addr) => Response {
                    addr: Some(Compact(addr)),
                    ..response
                },
                None => response.with_nodes(self.closest_nodes(&req.target)),
            },
            MessageKind::AnnounceRequest(req) => {
                let addr = req.addr.map(|a| a.0).unwrap_or(src.ip());
                let ttl = self.database.store(req.target, addr, req.ttl, now);
                debug!(id = ?req.target, ?addr, ?ttl, from = ?src, "stored record");
                response
            }
            MessageKind::Response(_) | MessageKind::Error(_) => return false,
        };
        self.send(
            Message {
                kind: MessageKind::Response(response),
                transaction_id: msg.transaction_id,
                version: None,
            },
            src,
        );
        true
    }

    fn on_response(&mut self, msg: Message, src: SocketAddr, now: Instant) -> bool {
        let Some(tid) = msg.get_our_transaction_id() else {
            debug!(?src, tid = ?msg.transaction_id, "response with a foreign transaction id");
            return false;
        };
        let matches = self
            .outstanding
            .get(&tid)
            .map(|r| r.addr == src)
            .unwrap_or(false);
        if !matches {
            debug!(?src, tid, "response doesn't match any outstanding request");
            return false;
        }
        let Some(request) = self.outstanding.remove(&tid) else {
            return false;
        };
        match msg.kind {
            MessageKind::Response(resp) => {
                self.on_contact(resp.id, src, now);
                self.on_request_answered(request, resp, now);
            }
            MessageKind::Error(e) => {
                debug!(?src, code = e.code, description = ?e.description, "error response");
                // The peer is alive, it just didn't like the request.
                if let Some(id) = request.node_id {
                    self.routing_table.mark_seen(&id, now);
                }
                self.on_request_failed(request, false, now);
            }
            _ => return false,
        }
        true
    }

    fn on_request_answered(&mut self, request: OutstandingRequest, resp: Response, now: Instant) {
        match request.kind {
            RequestKind::Search { kind, target } => {
                let key = (kind, target);
                let from = request.node_id.unwrap_or(resp.id);
                let own_id = self.id;
                let nodes: Vec<Node<SocketAddr>> =
                    resp.all_nodes().filter(|n| n.id != own_id).collect();
                let answer = resp.addr.map(|a| a.0);
                if let Some(search) = self.searches.get_mut(&key) {
                    let step = search.on_response(&from, nodes, answer);
                    self.drive_search(key, step, now);
                }
            }
            RequestKind::Bootstrap => self.start_search(SearchKind::Refresh, self.id, now),
            RequestKind::Probe { .. } | RequestKind::Announce => {}
        }
    }

    fn on_request_failed(&mut self, request: OutstandingRequest, timed_out: bool, now: Instant) {
        if let (true, Some(id)) = (timed_out, request.node_id) {
            if self.routing_table.mark_failed(&id) {
                debug!(?id, addr = ?request.addr, "removed unresponsive peer");
            }
        }
        match request.kind {
            RequestKind::Search { kind, target } => {
                let key = (kind, target);
                let Some(id) = request.node_id else {
                    return;
                };
                if let Some(search) = self.searches.get_mut(&key) {
                    let step = search.on_failure(&id);
                    self.drive_search(key, step, now);
                }
            }
            RequestKind::Probe { stale, candidate } if timed_out => {
                let result = self
                    .routing_table
                    .replace(&stale, candidate.id, candidate.addr, now);
                debug!(?stale, ?candidate, ?result, "replaced unresponsive peer");
            }
            RequestKind::Bootstrap => debug!(addr = ?request.addr, timed_out, "bootstrap request failed"),
            RequestKind::Probe { .. } | RequestKind::Announce => {}
        }
    }

    fn bootstrap(&mut self, addr: SocketAddr, now: Instant) {
        if !self.bootstrap_nodes.contains(&addr) {
            self.bootstrap_nodes.push(addr);
        }
        self.last_bootstrap = Some(now);
        let own_id = self.id;
        self.send_request(
            MessageKind::FindNodeRequest(FindNodeRequest {
                id: own_id,
                target: own_id,
            }),
            addr,
            None,
            RequestKind::Bootstrap,
            now,
        );
    }

    // Nothing will drive searches any more, so nobody should wait on them.
    fn close(&mut self) {
        self.searches.clear();
        self.outstanding.clear();
        let waiters = self.lookups.fail_all();
        debug!(waiters, "DHT closed");
    }

    fn tick(&mut self, now: Instant) {
        let query_timeout = self.tunables.query_timeout;
        let timed_out: Vec<u16> = self
            .outstanding
            .iter()
            .filter(|(_, r)| now.saturating_duration_since(r.sent_at) >= query_timeout)
            .map(|(tid, _)| *tid)
            .collect();
        for tid in timed_out {
            if let Some(request) = self.outstanding.remove(&tid) {
                trace!(addr = ?request.addr, kind = ?request.kind, "request timed out");
                self.on_request_failed(request, true, now);
            }
        }

        let keys: Vec<(SearchKind, Id20)> = self.searches.keys().copied().collect();
        for key in keys {
            let Some(search) = self.searches.get_mut(&key) else {
                continue;
            };
            let step = search.poll(now);
            if matches!(step, SearchStep::Done(_)) {
                self.drive_search(key, step, now);
            }
        }

        self.lookups.expire(now);
        let expired = self.database.expire(now);
        if expired > 0 {
            trace!(expired, "expired records");
        }
        self.cache.expire(now);

        if self.routing_table.is_empty() {
            let retry_due = self
                .last_bootstrap
                .map(|t| now.saturating_duration_since(t) >= self.tunables.search_deadline)
                .unwrap_or(false);
            if retry_due {
                debug!("routing table is empty, bootstrapping again");
                for addr in self.bootstrap_nodes.clone() {
                    self.bootstrap(addr, now);
                }
            }
            return;
        }

        for idx in self
            .routing_table
            .stale_buckets(now, self.tunables.bucket_refresh_interval)
        {
            let target = self.routing_table.random_id_in_bucket(idx);
            self.routing_table.touch_bucket(idx, now);
            self.start_search(SearchKind::Refresh, target, now);
        }

        for record in self.announcer.due(now) {
            self.start_search(SearchKind::Announce, record.id, now);
        }
    }
}

/// A running DHT node. Obtain one with [`crate::DhtBuilder`] or
/// [`DhtState::with_config`].
pub struct DhtState {
    id: Id20,
    realm: Option<String>,
    listen_addr: Option<SocketAddr>,
    lookup_deadline: Duration,
    tick_interval: Duration,
    inner: Mutex<DhtInner>,
    counters: Counters,
    cancellation_token: CancellationToken,
}

fn resolve_node_id(config: &DhtConfig) -> Result<Id20> {
    if let Some(id) = config.node_id {
        return Ok(id);
    }
    match config.identity_file.as_ref() {
        Some(path) => {
            let host_identity = load_or_create_host_identity(path).map_err(Error::Persistence)?;
            Ok(node_id_for(config.realm.as_deref(), &host_identity))
        }
        None => Ok(Id20::random()),
    }
}

impl DhtState {
    fn new_internal(
        id: Id20,
        config: DhtConfig,
        listen_addr: Option<SocketAddr>,
        sender: UnboundedSender<(Message, SocketAddr)>,
        now: Instant,
    ) -> Self {
        let DhtConfig {
            realm,
            records,
            tunables,
            cancellation_token,
            ..
        } = config;
        Self {
            id,
            realm,
            listen_addr,
            lookup_deadline: tunables.lookup_deadline,
            tick_interval: tunables.tick_interval,
            inner: Mutex::new(DhtInner::new(id, tunables, records, sender, now)),
            counters: Counters::default(),
            cancellation_token: cancellation_token.unwrap_or_default(),
        }
    }

    /// Binds the socket and starts the node in the background.
    pub async fn with_config(config: DhtConfig) -> Result<Dht> {
        config.tunables.validate()?;
        let socket = UdpSocket::bind(config.listen_addr.unwrap_or(DEFAULT_LISTEN_ADDR))
            .await
            .map_err(Error::Bind)?;
        let listen_addr = socket.local_addr().map_err(Error::Bind)?;
        let id = resolve_node_id(&config)?;
        let bootstrap_addrs = config
            .bootstrap_addrs
            .clone()
            .unwrap_or_else(|| DHT_BOOTSTRAP.iter().map(|s| s.to_string()).collect());

        let (tx, rx) = unbounded_channel();
        let state = Arc::new(Self::new_internal(
            id,
            config,
            Some(listen_addr),
            tx,
            Instant::now(),
        ));
        info!(?id, ?listen_addr, realm = ?state.realm, "starting DHT");

        spawn_with_cancel(
            error_span!("dht", ?listen_addr),
            state.cancellation_token.clone(),
            {
                let state = state.clone();
                async move {
                    let token = state.cancellation_token.clone();
                    let worker = DhtWorker {
                        socket,
                        dht: state,
                        socket_is_v6: listen_addr.is_ipv6(),
                    };
                    let result = worker.start(rx, &bootstrap_addrs).await;
                    token.cancel();
                    result
                }
            },
        );

        // However the worker ended, pending lookups must not outlive it.
        spawn_utils::spawn(debug_span!("dht_close", ?listen_addr), {
            let state = state.clone();
            async move {
                state.cancellation_token.cancelled().await;
                state.close();
                Ok(())
            }
        });
        Ok(state)
    }

    /// A node without a socket. Outgoing datagrams show up on the returned
    /// receiver and incoming ones are fed with [`Self::handle_datagram_at`].
    pub fn new_detached(
        config: DhtConfig,
        now: Instant,
    ) -> Result<(Dht, UnboundedReceiver<(Message, SocketAddr)>)> {
        config.tunables.validate()?;
        let id = resolve_node_id(&config)?;
        let (tx, rx) = unbounded_channel();
        Ok((Arc::new(Self::new_internal(id, config, None, tx, now)), rx))
    }

    pub fn id(&self) -> Id20 {
        self.id
    }

    pub fn realm(&self) -> Option<&str> {
        self.realm.as_deref()
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Stops the node. Pending lookups resolve as not found, and so does
    /// every later one.
    pub fn shutdown(&self) {
        self.cancellation_token.cancel();
        self.close();
    }

    fn close(&self) {
        self.inner.lock().close();
    }

    pub fn handle_datagram(&self, buf: &[u8], src: SocketAddr) -> Result<()> {
        self.handle_datagram_at(buf, src, Instant::now())
    }

    /// Processes one inbound datagram. Errors are only informational: the
    /// datagram was dropped, and a malformed request was answered with an error.
    pub fn handle_datagram_at(&self, buf: &[u8], src: SocketAddr, now: Instant) -> Result<()> {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        let msg = match bprotocol::deserialize_message(buf) {
            Ok(msg) => msg,
            Err(e) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                if let Some(tid) = e.request_transaction_id.clone() {
                    let mut inner = self.inner.lock();
                    if inner.cache.check(src, "error", &tid, now) == CacheVerdict::Fresh {
                        inner.send(
                            Message {
                                kind: MessageKind::Error(ErrorDescription::new(
                                    e.code(),
                                    &e.to_string(),
                                )),
                                transaction_id: tid,
                                version: None,
                            },
                            src,
                        );
                    }
                }
                return Err(e.into());
            }
        };
        trace!(?src, ?msg, "received");
        let handled = {
            let mut inner = self.inner.lock();
            match msg.kind {
                MessageKind::Response(_) | MessageKind::Error(_) => inner.on_response(msg, src, now),
                _ => inner.on_request(msg, src, now),
            }
        };
        if !handled {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn lookup(&self, id: Id20) -> LookupHandle {
        self.lookup_at(id, Instant::now())
    }

    /// Resolves `id` from local records if possible, otherwise starts (or
    /// joins) a network search.
    pub fn lookup_at(&self, id: Id20, now: Instant) -> LookupHandle {
        if self.cancellation_token.is_cancelled() {
            return LookupHandle::Ready(None);
        }
        let mut inner = self.inner.lock();
        if let Some(addr) = inner.local_answer(&id, now) {
            return LookupHandle::Ready(Some(addr));
        }
        let (tx, rx) = oneshot::channel();
        if inner.lookups.put(id, tx, now + self.lookup_deadline) == PutResult::New {
            inner.start_search(SearchKind::Lookup, id, now);
        }
        LookupHandle::Pending(rx)
    }

    pub fn lookup_name(&self, name: &str) -> std::result::Result<LookupHandle, InvalidName> {
        let id = Id20::from_name(self.realm(), name)?;
        Ok(self.lookup(id))
    }

    /// Starts announcing `name`. Without `addr` receivers store the address
    /// our announces come from.
    pub fn announce(
        &self,
        name: &str,
        addr: Option<IpAddr>,
    ) -> std::result::Result<Id20, InvalidName> {
        let record = LocalRecord::new(self.realm(), name, addr)?;
        let id = record.id;
        info!(name, ?id, ?addr, "announcing");
        self.inner.lock().announcer.add(record);
        Ok(id)
    }

    /// Stops announcing `name`. Copies on other nodes expire with their ttl.
    pub fn withdraw(&self, name: &str) -> std::result::Result<bool, InvalidName> {
        let id = Id20::from_name(self.realm(), name)?;
        Ok(self.inner.lock().announcer.remove(&id))
    }

    pub fn add_bootstrap_node(&self, addr: SocketAddr) {
        self.add_bootstrap_node_at(addr, Instant::now())
    }

    pub fn add_bootstrap_node_at(&self, addr: SocketAddr, now: Instant) {
        self.inner.lock().bootstrap(addr, now)
    }

    /// Runs timeouts and periodic jobs due at `now`.
    pub fn tick_at(&self, now: Instant) {
        self.inner.lock().tick(now)
    }

    pub fn stats(&self) -> DhtStats {
        let inner = self.inner.lock();
        DhtStats {
            id: self.id,
            routing_table_size: inner.routing_table.len(),
            buckets: inner.routing_table.bucket_count(),
            searches: inner.searches.len(),
            pending_lookups: inner.lookups.len(),
            records: inner.database.len(),
            outstanding_requests: inner.outstanding.len(),
            received: self.counters.received.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            sent: self.counters.sent.load(Ordering::Relaxed),
        }
    }

    pub fn with_routing_table<R, F: FnOnce(&RoutingTable) -> R>(&self, f: F) -> R {
        f(&self.inner.lock().routing_table)
    }
}

// IPv4 peers reach a dual-stack socket as v4-mapped IPv6 addresses.
fn canonical_addr(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(ip) => SocketAddr::new(IpAddr::V4(ip), v6.port()),
            None => addr,
        },
        SocketAddr::V4(_) => addr,
    }
}

fn addr_for_socket(addr: SocketAddr, socket_is_v6: bool) -> Option<SocketAddr> {
    match (addr, socket_is_v6) {
        (SocketAddr::V4(v4), true) => Some(SocketAddr::new(
            IpAddr::V6(v4.ip().to_ipv6_mapped()),
            v4.port(),
        )),
        (SocketAddr::V6(v6), false) => v6
            .ip()
            .to_ipv4_mapped()
            .map(|ip| SocketAddr::new(IpAddr::V4(ip), v6.port())),
        _ => Some(addr),
    }
}

struct DhtWorker {
    socket: UdpSocket,
    dht: Dht,
    socket_is_v6: bool,
}

impl DhtWorker {
    async fn writer(&self, mut rx: UnboundedReceiver<(Message, SocketAddr)>) -> Result<()> {
        let mut buf = Vec::new();
        while let Some((msg, addr)) = rx.recv().await {
            let Some(addr) = addr_for_socket(addr, self.socket_is_v6) else {
                debug!(?addr, "can't send to this address family");
                continue;
            };
            buf.clear();
            if let Err(e) = bprotocol::serialize_message(&mut buf, msg) {
                warn!(?addr, "{e:#}");
                continue;
            }
            match self.socket.send_to(&buf, addr).await {
                Ok(_) => {
                    self.dht.counters.sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => debug!(?addr, "{:#}", Error::Send(e)),
            }
        }
        Ok(())
    }

    async fn reader(&self) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (size, addr) = match self.socket.recv_from(&mut buf).await {
                Ok(r) => r,
                // ICMP errors of earlier sends surface here on some platforms.
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::ConnectionReset
                            | std::io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    trace!("{:#}", Error::Recv(e));
                    continue;
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::NotConnected | std::io::ErrorKind::BrokenPipe
                    ) =>
                {
                    return Err(Error::Recv(e));
                }
                Err(e) => {
                    warn!("{:#}", Error::Recv(e));
                    tokio::time::sleep(RECV_ERROR_BACKOFF).await;
                    continue;
                }
            };
            let addr = canonical_addr(addr);
            if let Err(e) = self.dht.handle_datagram(&buf[..size], addr) {
                debug!(?addr, "{e:#}");
            }
        }
    }

    async fn timer(&self) -> Result<()> {
        let mut interval = tokio::time::interval(self.dht.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.dht.tick_at(Instant::now());
        }
    }

    async fn bootstrap(&self, addrs: &[String]) -> Result<()> {
        let mut futs = FuturesUnordered::new();
        for addr in addrs.iter() {
            let addr = addr.as_str();
            futs.push(async move {
                let resolved = (move || tokio::net::lookup_host(addr))
                    .retry(
                        ExponentialBuilder::new()
                            .with_max_times(5)
                            .with_min_delay(Duration::from_secs(1))
                            .with_max_delay(Duration::from_secs(30))
                            .with_jitter(),
                    )
                    .notify(|err, retry_in| debug!(?retry_in, addr, "error resolving: {err:#}"))
                    .await
                    .map_err(|e| Error::lookup(addr, e))?;
                let mut count = 0;
                for resolved in resolved {
                    self.dht.add_bootstrap_node(canonical_addr(resolved));
                    count += 1;
                }
                debug!(addr, count, "bootstrapping");
                Ok::<_, Error>(count)
            });
        }
        let mut nodes = 0;
        while let Some(result) = futs.next().await {
            match result {
                Ok(count) => nodes += count,
                Err(e) => warn!("{e:#}"),
            }
        }
        if nodes == 0 && !addrs.is_empty() {
            warn!("no bootstrap node could be resolved");
        }
        Ok(())
    }

    async fn start(
        self,
        rx: UnboundedReceiver<(Message, SocketAddr)>,
        bootstrap_addrs: &[String],
    ) -> Result<()> {
        let writer = self.writer(rx);
        let reader = self.reader();
        let timer = self.timer();
        let bootstrap = self
            .bootstrap(bootstrap_addrs)
            .instrument(debug_span!("bootstrap"));

        tokio::pin!(writer);
        tokio::pin!(reader);
        tokio::pin!(timer);
        tokio::pin!(bootstrap);
        let mut bootstrap_done = false;

        loop {
            tokio::select! {
                r = &mut writer => return Error::task_finished(&"writer", r),
                r = &mut reader => return Error::task_finished(&"reader", r),
                r = &mut timer => return Error::task_finished(&"timer", r),
                r = &mut bootstrap, if !bootstrap_done => {
                    bootstrap_done = true;
                    if let Err(e) = r {
                        warn!("bootstrap failed: {e:#}");
                    }
                }
            }
        }
    }
}
