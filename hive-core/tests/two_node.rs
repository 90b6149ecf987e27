use std::net::SocketAddr;
use std::time::Duration;

use hive_core::{encode_announcement, status, NetConfig, NetError, PeerId, TransportSelector};

fn loopback() -> SocketAddr {
    "127.0.0.1:9999".parse().unwrap()
}

fn config(message_ports: Vec<u16>) -> NetConfig {
    NetConfig {
        message_ports,
        connect_timeout: Duration::from_millis(500),
        ..NetConfig::default()
    }
}

async fn node(name: &str, ports: Vec<u16>) -> (TransportSelector, PeerId) {
    let sel = TransportSelector::new(config(ports), None);
    let id = PeerId::generate();
    sel.initialize(name, id.clone()).await;
    (sel, id)
}

/// Feed `sel` the announcement `peer` would broadcast, as if received from loopback.
fn hear(sel: &TransportSelector, peer: &PeerId, name: &str, port: u16) {
    let datagram = encode_announcement(peer, name, port).unwrap();
    sel.broadcast()
        .unwrap()
        .discovery()
        .ingest(&datagram, loopback())
        .unwrap();
}

fn port_of(sel: &TransportSelector) -> u16 {
    sel.broadcast().unwrap().active_port().unwrap()
}

async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..300 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

fn occupied_port() -> (std::net::TcpListener, u16) {
    let l = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
    let port = l.local_addr().unwrap().port();
    (l, port)
}

#[tokio::test]
async fn two_nodes_exchange_messages() {
    let (a, a_id) = node("Alice", vec![0]).await;
    let (b, b_id) = node("Bob", vec![0]).await;

    hear(&a, &b_id, "Bob", port_of(&b));
    wait_for(|| a.peers().len() == 1).await;
    assert_eq!(a.peers()[0].name, "Bob");
    assert_eq!(a.peers()[0].address, "127.0.0.1");

    let sent = a.send_message(&b_id, "hello").await.unwrap();
    assert!(sent.is_local);
    wait_for(|| a.messages_for(&b_id).len() == 1).await;
    assert_eq!(a.messages_for(&b_id)[0].id, sent.id);
    assert_eq!(a.unread_for(&b_id), 0);

    wait_for(|| b.messages_for(&a_id).len() == 1).await;
    let got = &b.messages_for(&a_id)[0];
    assert_eq!(got.id, sent.id);
    assert_eq!(got.text, "hello");
    assert_eq!(got.sender_name, "Alice");
    assert!(!got.is_local);
    assert_eq!(b.unread_for(&a_id), 1);

    // Replies go over Bob's own outbound connection.
    hear(&b, &a_id, "Alice", port_of(&a));
    b.send_message(&a_id, "hi back").await.unwrap();
    wait_for(|| a.messages_for(&b_id).len() == 2).await;
    let log = a.messages_for(&b_id);
    assert!(log[0].is_local);
    assert!(!log[1].is_local);
    assert_eq!(log[1].text, "hi back");
    assert_eq!(a.unread_for(&b_id), 1);

    b.clear_unread(&a_id);
    wait_for(|| b.unread_for(&a_id) == 0).await;
    assert_eq!(b.messages_for(&a_id).len(), 2);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn messages_keep_send_order() {
    let (a, a_id) = node("Alice", vec![0]).await;
    let (b, b_id) = node("Bob", vec![0]).await;
    hear(&a, &b_id, "Bob", port_of(&b));

    for i in 0..20 {
        a.send_message(&b_id, &format!("m{i}")).await.unwrap();
    }
    wait_for(|| b.messages_for(&a_id).len() == 20).await;
    let texts: Vec<_> = b.messages_for(&a_id).iter().map(|m| m.text.clone()).collect();
    let expected: Vec<_> = (0..20).map(|i| format!("m{i}")).collect();
    assert_eq!(texts, expected);
    assert_eq!(b.unread_for(&a_id), 20);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn server_falls_back_past_taken_ports() {
    let (_l1, p1) = occupied_port();
    let (_l2, p2) = occupied_port();
    let (l3, p3) = occupied_port();
    drop(l3);

    let (a, _) = node("Alice", vec![p1, p2, p3]).await;
    assert_eq!(port_of(&a), p3);
    assert_eq!(a.status(), status::server_running(p3));
    assert!(!a.is_network_restricted());
    a.shutdown().await;
}

#[tokio::test]
async fn sender_falls_back_when_advertised_port_is_closed() {
    let (b, b_id) = node("Bob", vec![0]).await;
    let b_port = port_of(&b);
    let (dead_l, dead) = occupied_port();
    drop(dead_l);

    // Alice's candidate list knows Bob's real port; his announcement points elsewhere.
    let (a, a_id) = node("Alice", vec![0, b_port]).await;
    hear(&a, &b_id, "Bob", dead);
    a.send_message(&b_id, "found you").await.unwrap();
    wait_for(|| b.messages_for(&a_id).len() == 1).await;

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn unreachable_peer_is_reported_and_nothing_logged() {
    let (dead_l, dead) = occupied_port();
    drop(dead_l);
    let (a, _) = node("Alice", vec![0]).await;
    let ghost = PeerId::generate();
    hear(&a, &ghost, "Ghost", dead);

    let res = a.send_message(&ghost, "anyone?").await;
    assert!(matches!(res, Err(NetError::ConnectFailed { .. })));
    wait_for(|| a.status() == status::unreachable_peer("Ghost")).await;
    assert!(a.messages_for(&ghost).is_empty());
    a.shutdown().await;
}

#[tokio::test]
async fn every_port_taken_means_restricted_network() {
    let (_l1, p1) = occupied_port();
    let (_l2, p2) = occupied_port();
    let (a, _) = node("Alice", vec![p1, p2]).await;

    assert!(a.is_network_restricted());
    assert!(status::is_restricted(&a.status()));
    assert!(a.status().contains(hive_core::RESTRICTED_NETWORK_TOKEN));
    assert!(matches!(a.start_discovery(), Err(NetError::NotReady)));
    wait_for(|| a.status() == status::CANNOT_DISCOVER).await;
    assert!(!a.is_discovering());
    a.shutdown().await;
}
