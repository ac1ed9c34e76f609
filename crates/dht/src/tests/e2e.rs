use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::{Duration, Instant},
};

use tokio::time::timeout;

use crate::{
    DhtConfig, DhtState, DhtTunables, LocalRecord, LookupHandle, load_or_create_host_identity,
    node_id_for,
};

use super::setup_test_logging;

fn loopback_config(bootstrap: Vec<String>) -> DhtConfig {
    DhtConfig {
        listen_addr: Some(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))),
        bootstrap_addrs: Some(bootstrap),
        tunables: DhtTunables {
            tick_interval: Duration::from_millis(50),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn test_loopback_lookup() {
    setup_test_logging();

    let a = DhtState::with_config(loopback_config(Vec::new()))
        .await
        .unwrap();
    let a_addr = a.listen_addr().unwrap();

    let ip = IpAddr::from(Ipv4Addr::new(192, 0, 2, 33));
    let b = DhtState::with_config(DhtConfig {
        records: vec![LocalRecord::new(None, "b.p2p", Some(ip)).unwrap()],
        ..loopback_config(vec![a_addr.to_string()])
    })
    .await
    .unwrap();

    timeout(Duration::from_secs(10), async {
        while a.stats().routing_table_size == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("b never reached a");

    let found = timeout(
        Duration::from_secs(10),
        a.lookup_name("b.p2p").unwrap().wait(),
    )
    .await
    .unwrap();
    assert_eq!(found, Some(ip));

    let stats = b.stats();
    assert!(stats.sent > 0 && stats.received > 0, "{stats:?}");

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn test_stopped_node_fails_lookups() {
    setup_test_logging();

    let a = DhtState::with_config(loopback_config(Vec::new()))
        .await
        .unwrap();
    let b = DhtState::with_config(loopback_config(vec![a.listen_addr().unwrap().to_string()]))
        .await
        .unwrap();
    timeout(Duration::from_secs(10), async {
        while a.stats().routing_table_size == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("b never reached a");

    let handle = a.lookup_name("x.p2p").unwrap();
    assert!(matches!(&handle, LookupHandle::Pending(_)));
    // Stopped from outside, the same way a failed worker stops it.
    a.cancellation_token().cancel();

    let found = timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("lookup outlived the node");
    assert_eq!(found, None);
    let stats = a.stats();
    assert_eq!(stats.pending_lookups, 0, "{stats:?}");
    assert_eq!(stats.searches, 0, "{stats:?}");
    assert!(matches!(
        a.lookup_name("x.p2p").unwrap(),
        LookupHandle::Ready(None)
    ));

    b.shutdown();
}

#[tokio::test]
async fn test_bind_conflict_is_an_error() {
    let a = DhtState::with_config(loopback_config(Vec::new()))
        .await
        .unwrap();
    let res = DhtState::with_config(DhtConfig {
        listen_addr: a.listen_addr(),
        ..loopback_config(Vec::new())
    })
    .await;
    assert!(matches!(res, Err(crate::Error::Bind(_))));
    a.shutdown();
}

#[test]
fn test_node_id_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("identity.json");
    let config = DhtConfig {
        identity_file: Some(path.clone()),
        realm: Some("open.p2p".to_owned()),
        ..Default::default()
    };
    let now = Instant::now();
    let (first, _rx) = DhtState::new_detached(config.clone(), now).unwrap();
    let (second, _rx) = DhtState::new_detached(config, now).unwrap();
    assert_eq!(first.id(), second.id());

    let host = load_or_create_host_identity(&path).unwrap();
    assert_eq!(first.id(), node_id_for(Some("open.p2p"), &host));
}
