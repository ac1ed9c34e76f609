// Many detached nodes wired together through their outbound channels. Time
// only moves when a test says so, and every datagram goes through the codec.

use std::{
    collections::{HashMap, HashSet},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::{Duration, Instant},
};

use tokio::sync::mpsc::UnboundedReceiver;

use crate::{
    Dht, DhtConfig, DhtState, DhtTunables, Id20, LookupHandle,
    bprotocol::{self, ERROR_METHOD_UNKNOWN, Message, MessageKind, PingRequest},
};

use super::setup_test_logging;

struct SimNode {
    dht: Dht,
    rx: UnboundedReceiver<(Message, SocketAddr)>,
    addr: SocketAddr,
}

struct Sim {
    nodes: Vec<SimNode>,
    by_addr: HashMap<SocketAddr, usize>,
    dead: HashSet<usize>,
    now: Instant,
}

fn sim_tunables() -> DhtTunables {
    DhtTunables {
        cache_max_requests_per_window: 100_000,
        ..Default::default()
    }
}

fn node_addr(idx: usize) -> SocketAddr {
    SocketAddr::from((
        Ipv4Addr::new(10, 0, (idx >> 8) as u8, (idx & 0xff) as u8 + 1),
        8337,
    ))
}

impl Sim {
    fn new(n: usize, tunables: DhtTunables) -> Self {
        setup_test_logging();
        let now = Instant::now();
        let mut nodes = Vec::new();
        let mut by_addr = HashMap::new();
        for idx in 0..n {
            let (dht, rx) = DhtState::new_detached(
                DhtConfig {
                    node_id: Some(Id20::random()),
                    tunables: tunables.clone(),
                    ..Default::default()
                },
                now,
            )
            .unwrap();
            let addr = node_addr(idx);
            by_addr.insert(addr, idx);
            nodes.push(SimNode { dht, rx, addr });
        }
        Self {
            nodes,
            by_addr,
            dead: HashSet::new(),
            now,
        }
    }

    fn dht(&self, idx: usize) -> &Dht {
        &self.nodes[idx].dht
    }

    /// Delivers datagrams until everyone is quiet.
    fn pump(&mut self) -> usize {
        let mut delivered = 0;
        loop {
            let mut batch = Vec::new();
            for node in self.nodes.iter_mut() {
                while let Ok((msg, to)) = node.rx.try_recv() {
                    batch.push((node.addr, msg, to));
                }
            }
            if batch.is_empty() {
                return delivered;
            }
            for (from, msg, to) in batch {
                let mut buf = Vec::new();
                bprotocol::serialize_message(&mut buf, msg).unwrap();
                let Some(&idx) = self.by_addr.get(&to) else {
                    continue;
                };
                if self.dead.contains(&idx) {
                    continue;
                }
                self.nodes[idx]
                    .dht
                    .handle_datagram_at(&buf, from, self.now)
                    .unwrap();
                delivered += 1;
            }
            assert!(delivered < 1_000_000, "the network never settles");
        }
    }

    /// Every node joins through node 0, one after another.
    fn bootstrap(&mut self) {
        let entry = self.nodes[0].addr;
        for idx in 1..self.nodes.len() {
            self.nodes[idx].dht.add_bootstrap_node_at(entry, self.now);
            self.pump();
        }
    }

    fn tick_all(&mut self, advance: Duration) {
        self.now += advance;
        for (idx, node) in self.nodes.iter().enumerate() {
            if !self.dead.contains(&idx) {
                node.dht.tick_at(self.now);
            }
        }
        self.pump();
    }
}

#[test]
fn test_bootstrap_fills_routing_tables() {
    let mut sim = Sim::new(24, sim_tunables());
    sim.bootstrap();
    for node in sim.nodes.iter() {
        let stats = node.dht.stats();
        assert!(stats.routing_table_size > 0, "{stats:?}");
        assert_eq!(stats.outstanding_requests, 0);
        assert_eq!(stats.searches, 0);
    }
    // Everyone went through the entry node, so its table is as full as it gets.
    let entry = sim.dht(0).stats();
    assert!(entry.routing_table_size >= sim_tunables().k, "{entry:?}");
}

#[tokio::test]
async fn test_lookup_finds_announced_record() {
    let mut sim = Sim::new(32, sim_tunables());
    sim.bootstrap();

    let ip = IpAddr::from(Ipv4Addr::new(192, 0, 2, 7));
    let id = sim.dht(5).announce("printer.p2p", Some(ip)).unwrap();
    sim.tick_all(Duration::from_secs(1));

    let stored: usize = sim.nodes.iter().map(|n| n.dht.stats().records).sum();
    assert!(stored > 0 && stored <= sim_tunables().k, "stored {stored}");

    let handle = sim.dht(20).lookup_at(id, sim.now);
    sim.pump();
    assert_eq!(handle.wait().await, Some(ip));
    assert_eq!(sim.dht(20).stats().pending_lookups, 0);

    // By name as well, from a node that might not hold the record.
    let handle = sim.dht(27).lookup_name("Printer.p2p").unwrap();
    sim.pump();
    assert_eq!(handle.wait().await, Some(ip));
}

#[tokio::test]
async fn test_lookup_unknown_is_not_found() {
    let mut sim = Sim::new(16, sim_tunables());
    sim.bootstrap();
    let handle = sim.dht(3).lookup_name("nobody.p2p").unwrap();
    sim.pump();
    assert_eq!(handle.wait().await, None);
    assert_eq!(sim.dht(3).stats().searches, 0);
}

#[tokio::test]
async fn test_concurrent_lookups_share_a_search() {
    let mut sim = Sim::new(12, sim_tunables());
    sim.bootstrap();
    let target = Id20::random();
    let first = sim.dht(4).lookup_at(target, sim.now);
    let queued = sim.nodes[4].rx.len();
    let second = sim.dht(4).lookup_at(target, sim.now);
    assert_eq!(sim.nodes[4].rx.len(), queued);
    let stats = sim.dht(4).stats();
    assert_eq!(stats.searches, 1);
    assert_eq!(stats.pending_lookups, 1);

    sim.pump();
    assert_eq!(first.wait().await, None);
    assert_eq!(second.wait().await, None);
}

#[tokio::test]
async fn test_announced_record_expires() {
    let tunables = DhtTunables {
        announce_interval: Duration::from_secs(30),
        announce_ttl: Duration::from_secs(60),
        ..sim_tunables()
    };
    let mut sim = Sim::new(2, tunables);
    sim.bootstrap();
    let start = sim.now;

    // No address: the receiver serves the address the announce came from.
    let id = sim.dht(0).announce("a.p2p", None).unwrap();
    sim.dht(0).tick_at(start);
    sim.pump();
    assert_eq!(sim.dht(1).stats().records, 1);

    let announcer_ip = sim.nodes[0].addr.ip();
    assert!(matches!(
        sim.dht(1).lookup_at(id, start + Duration::from_secs(30)),
        LookupHandle::Ready(Some(ip)) if ip == announcer_ip
    ));

    let later = start + Duration::from_secs(90);
    sim.now = later;
    sim.dht(1).tick_at(later);
    assert_eq!(sim.dht(1).stats().records, 0);
    let handle = sim.dht(1).lookup_at(id, later);
    assert!(matches!(handle, LookupHandle::Pending(_)));
    sim.pump();
    assert_eq!(handle.wait().await, None);
}

#[tokio::test]
async fn test_dead_peers_dont_stall_lookups() {
    let mut sim = Sim::new(24, sim_tunables());
    sim.bootstrap();
    let ip = IpAddr::from(Ipv4Addr::new(192, 0, 2, 9));
    let id = sim.dht(2).announce("nas.p2p", Some(ip)).unwrap();
    sim.tick_all(Duration::from_secs(1));

    for idx in [6, 7, 8, 9, 10] {
        sim.dead.insert(idx);
    }
    let handle = sim.dht(15).lookup_at(id, sim.now);
    sim.pump();
    // Unanswered queries only move on once they time out.
    for _ in 0..4 {
        sim.tick_all(sim_tunables().query_timeout);
    }
    assert_eq!(handle.wait().await, Some(ip));
}

#[test]
fn test_unknown_method_gets_error_reply() {
    let mut sim = Sim::new(1, sim_tunables());
    let from = node_addr(100);
    let res = sim.dht(0).handle_datagram_at(
        b"d1:ad2:id20:xxxxxxxxxxxxxxxxxxxxe1:q3:foo1:t2:aa1:y1:qe",
        from,
        sim.now,
    );
    assert!(res.is_err());
    let (msg, to) = sim.nodes[0].rx.try_recv().unwrap();
    assert_eq!(to, from);
    assert_eq!(msg.transaction_id.as_ref(), b"aa");
    match msg.kind {
        MessageKind::Error(e) => assert_eq!(e.code, ERROR_METHOD_UNKNOWN),
        other => panic!("expected an error, got {other:?}"),
    }

    // Garbage isn't answered.
    assert!(sim.dht(0).handle_datagram_at(b"garbage", from, sim.now).is_err());
    assert!(sim.nodes[0].rx.try_recv().is_err());
    assert_eq!(sim.dht(0).stats().dropped, 2);
}

#[test]
fn test_responses_must_come_from_the_queried_address() {
    let mut sim = Sim::new(1, sim_tunables());
    let bootstrap = node_addr(50);
    sim.dht(0).add_bootstrap_node_at(bootstrap, sim.now);
    let (request, to) = sim.nodes[0].rx.try_recv().unwrap();
    assert_eq!(to, bootstrap);
    assert!(matches!(request.kind, MessageKind::FindNodeRequest(_)));

    let response = Message {
        kind: MessageKind::Response(bprotocol::Response {
            id: Id20::random(),
            ..Default::default()
        }),
        transaction_id: request.transaction_id.clone(),
        version: None,
    };
    let mut buf = Vec::new();
    bprotocol::serialize_message(&mut buf, response).unwrap();

    sim.dht(0)
        .handle_datagram_at(&buf, node_addr(51), sim.now)
        .unwrap();
    assert_eq!(sim.dht(0).stats().routing_table_size, 0);
    assert_eq!(sim.dht(0).stats().dropped, 1);

    sim.dht(0).handle_datagram_at(&buf, bootstrap, sim.now).unwrap();
    assert_eq!(sim.dht(0).stats().routing_table_size, 1);
    // Answered only once.
    sim.dht(0).handle_datagram_at(&buf, bootstrap, sim.now).unwrap();
    assert_eq!(sim.dht(0).stats().dropped, 2);
}

#[test]
fn test_unanswered_requests_time_out() {
    let mut sim = Sim::new(1, sim_tunables());
    sim.dht(0).add_bootstrap_node_at(node_addr(50), sim.now);
    assert_eq!(sim.dht(0).stats().outstanding_requests, 1);
    sim.tick_all(Duration::from_secs(1));
    assert_eq!(sim.dht(0).stats().outstanding_requests, 1);
    sim.tick_all(Duration::from_secs(1));
    assert_eq!(sim.dht(0).stats().outstanding_requests, 0);

    // Still alone: the bootstrap node is asked again later.
    sim.tick_all(sim_tunables().search_deadline);
    assert_eq!(sim.dht(0).stats().outstanding_requests, 1);
}

#[tokio::test]
async fn test_shutdown_fails_pending_lookups() {
    let mut sim = Sim::new(2, sim_tunables());
    sim.bootstrap();
    sim.dead.insert(1);

    let handle = sim.dht(0).lookup_at(Id20::random(), sim.now);
    assert!(matches!(handle, LookupHandle::Pending(_)));
    sim.pump();
    assert_eq!(sim.dht(0).stats().outstanding_requests, 1);

    sim.dht(0).shutdown();
    assert_eq!(handle.wait().await, None);
    let stats = sim.dht(0).stats();
    assert_eq!(stats.pending_lookups, 0);
    assert_eq!(stats.searches, 0);
    assert_eq!(stats.outstanding_requests, 0);

    assert!(matches!(
        sim.dht(0).lookup_at(Id20::random(), sim.now),
        LookupHandle::Ready(None)
    ));
}

// Ids sharing no prefix bit with the all-zero node id all land in bucket 0.
fn far_id(n: u8) -> Id20 {
    let mut id = [0u8; 20];
    id[0] = 0x80;
    id[19] = n;
    Id20(id)
}

fn deliver(dht: &Dht, msg: Message, from: SocketAddr, now: Instant) {
    let mut buf = Vec::new();
    bprotocol::serialize_message(&mut buf, msg).unwrap();
    dht.handle_datagram_at(&buf, from, now).unwrap();
}

fn ping(id: Id20) -> Message {
    Message {
        kind: MessageKind::PingRequest(PingRequest { id }),
        transaction_id: b"pp".into(),
        version: None,
    }
}

// Pings the node sent on its own, not replies to ours.
fn sent_pings(rx: &mut UnboundedReceiver<(Message, SocketAddr)>) -> Vec<(Message, SocketAddr)> {
    let mut pings = Vec::new();
    while let Ok((msg, to)) = rx.try_recv() {
        if matches!(msg.kind, MessageKind::PingRequest(_)) {
            pings.push((msg, to));
        }
    }
    pings
}

fn full_bucket_node(now: Instant) -> (Dht, UnboundedReceiver<(Message, SocketAddr)>) {
    let (dht, mut rx) = DhtState::new_detached(
        DhtConfig {
            node_id: Some(Id20::default()),
            tunables: DhtTunables {
                k: 2,
                ..sim_tunables()
            },
            ..Default::default()
        },
        now,
    )
    .unwrap();
    deliver(&dht, ping(far_id(1)), node_addr(1), now);
    deliver(&dht, ping(far_id(2)), node_addr(2), now + Duration::from_secs(1));
    assert_eq!(dht.stats().routing_table_size, 2);
    assert!(sent_pings(&mut rx).is_empty());
    (dht, rx)
}

fn in_table(dht: &Dht, id: Id20) -> bool {
    dht.with_routing_table(|rt| rt.get(&id).is_some())
}

#[test]
fn test_full_bucket_keeps_live_peer() {
    let now = Instant::now();
    let (dht, mut rx) = full_bucket_node(now);

    deliver(&dht, ping(far_id(3)), node_addr(3), now + Duration::from_secs(2));
    let mut pings = sent_pings(&mut rx);
    assert_eq!(pings.len(), 1);
    let (probe, to) = pings.remove(0);
    // The least recently seen peer is asked.
    assert_eq!(to, node_addr(1));

    // Another newcomer while the question is open doesn't ask again.
    deliver(&dht, ping(far_id(4)), node_addr(4), now + Duration::from_secs(2));
    assert!(sent_pings(&mut rx).is_empty());
    assert_eq!(dht.stats().outstanding_requests, 1);

    let answer = Message {
        kind: MessageKind::Response(bprotocol::Response {
            id: far_id(1),
            ..Default::default()
        }),
        transaction_id: probe.transaction_id,
        version: None,
    };
    deliver(&dht, answer, node_addr(1), now + Duration::from_secs(3));
    assert_eq!(dht.stats().outstanding_requests, 0);
    assert!(in_table(&dht, far_id(1)));
    assert!(in_table(&dht, far_id(2)));
    assert!(!in_table(&dht, far_id(3)));

    // Nothing left to time out.
    dht.tick_at(now + Duration::from_secs(10));
    assert!(in_table(&dht, far_id(1)));
    assert!(!in_table(&dht, far_id(3)));
}

#[test]
fn test_full_bucket_replaces_dead_peer() {
    let now = Instant::now();
    let (dht, mut rx) = full_bucket_node(now);

    deliver(&dht, ping(far_id(3)), node_addr(3), now + Duration::from_secs(2));
    let pings = sent_pings(&mut rx);
    assert_eq!(pings.len(), 1);
    assert_eq!(pings[0].1, node_addr(1));

    dht.tick_at(now + Duration::from_secs(2) + sim_tunables().query_timeout);
    assert_eq!(dht.stats().outstanding_requests, 0);
    assert!(!in_table(&dht, far_id(1)));
    assert!(in_table(&dht, far_id(2)));
    assert!(in_table(&dht, far_id(3)));
    assert_eq!(dht.stats().routing_table_size, 2);
}
