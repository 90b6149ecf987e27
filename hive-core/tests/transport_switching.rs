use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hive_core::{
    encode_announcement, status, LinkError, LinkEvent, LinkLayer, LinkPeer, NetConfig, NetError, NetworkMode,
    PeerId, TransportSelector,
};
use tokio::sync::mpsc;

#[derive(Default)]
struct MockLink {
    calls: Mutex<Vec<String>>,
    events: Mutex<Option<mpsc::UnboundedSender<LinkEvent>>>,
}

impl MockLink {
    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    /// Deliver an event; dropped silently once the transport stopped listening.
    fn emit(&self, event: LinkEvent) {
        let _ = self.events.lock().unwrap().as_ref().unwrap().send(event);
    }
}

impl LinkLayer for MockLink {
    fn register(&self, events: mpsc::UnboundedSender<LinkEvent>) -> Result<(), LinkError> {
        self.record("register");
        *self.events.lock().unwrap() = Some(events);
        Ok(())
    }
    fn unregister(&self) -> Result<(), LinkError> {
        self.record("unregister");
        Ok(())
    }
    fn start_peer_discovery(&self) -> Result<(), LinkError> {
        self.record("start_peer_discovery");
        Ok(())
    }
    fn stop_peer_discovery(&self) -> Result<(), LinkError> {
        self.record("stop_peer_discovery");
        Ok(())
    }
    fn connect(&self, device_address: &str) -> Result<(), LinkError> {
        self.record(format!("connect {device_address}"));
        Ok(())
    }
    fn remove_group(&self) -> Result<(), LinkError> {
        self.record("remove_group");
        Ok(())
    }
}

fn config(message_ports: Vec<u16>) -> NetConfig {
    NetConfig {
        message_ports,
        connect_timeout: Duration::from_millis(500),
        ..NetConfig::default()
    }
}

async fn node_with_link(ports: Vec<u16>) -> (TransportSelector, Arc<MockLink>) {
    let link = Arc::new(MockLink::default());
    let sel = TransportSelector::new(config(ports), Some(link.clone() as Arc<dyn LinkLayer>));
    sel.initialize("Alice", PeerId::generate()).await;
    (sel, link)
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

fn phone() -> LinkPeer {
    LinkPeer {
        device_address: "02:00:00:aa:bb:cc".into(),
        device_name: "Phone".into(),
    }
}

#[tokio::test]
async fn switch_to_direct_and_back() {
    let (sel, link) = node_with_link(vec![0]).await;
    let mut mode = sel.subscribe_mode();

    sel.switch_transport(NetworkMode::Secondary).await.unwrap();
    assert_eq!(sel.mode(), NetworkMode::Secondary);
    assert!(mode.has_changed().unwrap());
    assert_eq!(*mode.borrow_and_update(), NetworkMode::Secondary);
    assert_eq!(sel.status(), status::SWITCHED_TO_LINK);
    assert!(sel.peers().is_empty());
    assert_eq!(link.count("register"), 1);

    sel.start_discovery().unwrap();
    assert_eq!(link.count("start_peer_discovery"), 1);
    wait_for(|| sel.is_discovering()).await;
    link.emit(LinkEvent::PeersChanged(vec![phone()]));
    wait_for(|| sel.peers().len() == 1).await;
    assert_eq!(sel.peers()[0].name, "Phone");

    sel.connect_direct_peer("02:00:00:aa:bb:cc").unwrap();
    assert!(link.calls().contains(&"connect 02:00:00:aa:bb:cc".to_string()));
    assert!(matches!(sel.connect_direct_peer("nope"), Err(NetError::UnknownPeer(_))));

    // Nothing to write to yet.
    let res = sel.send_message(&PeerId::new("02:00:00:aa:bb:cc"), "hi").await;
    assert!(matches!(res, Err(NetError::NotConnected)));

    sel.switch_transport(NetworkMode::Primary).await.unwrap();
    assert_eq!(sel.mode(), NetworkMode::Primary);
    assert_eq!(sel.status(), status::SWITCHED_TO_BROADCAST);
    assert!(sel.peers().is_empty());
    assert!(!sel.is_discovering());
    for call in ["stop_peer_discovery", "remove_group", "unregister"] {
        assert!(link.count(call) >= 1, "missing {call}");
    }

    // A late event from the torn-down link must not show up.
    link.emit(LinkEvent::PeersChanged(vec![phone()]));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(sel.peers().is_empty());

    sel.shutdown().await;
}

#[tokio::test]
async fn switching_to_current_mode_is_a_noop() {
    let (sel, link) = node_with_link(vec![0]).await;
    sel.switch_transport(NetworkMode::Primary).await.unwrap();
    assert!(link.calls().is_empty());

    sel.switch_transport(NetworkMode::Secondary).await.unwrap();
    sel.switch_transport(NetworkMode::Secondary).await.unwrap();
    assert_eq!(link.count("register"), 1);
    sel.shutdown().await;
    assert_eq!(link.count("unregister"), 1);
    sel.shutdown().await;
    assert_eq!(link.count("unregister"), 1);
}

#[tokio::test]
async fn inactive_transport_state_does_not_leak() {
    let (a, _) = node_with_link(vec![0]).await;
    let a_port = a.broadcast().unwrap().active_port().unwrap();
    let a_id = a.local_peer_id().unwrap();

    let b = TransportSelector::new(config(vec![0]), None);
    let b_id = PeerId::generate();
    b.initialize("Bob", b_id.clone()).await;
    let from: SocketAddr = "127.0.0.1:9999".parse().unwrap();
    let datagram = encode_announcement(&a_id, "Alice", a_port).unwrap();
    b.broadcast().unwrap().discovery().ingest(&datagram, from).unwrap();

    a.switch_transport(NetworkMode::Secondary).await.unwrap();
    b.send_message(&a_id, "while you were away").await.unwrap();

    // Alice's broadcast server still receives, but the selector shows the link transport.
    let primary = a.broadcast().unwrap().clone();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(a.messages_for(&b_id).is_empty());
    assert_eq!(a.unread_for(&b_id), 0);

    a.switch_transport(NetworkMode::Primary).await.unwrap();
    wait_for(|| a.messages_for(&b_id).len() == 1).await;
    assert_eq!(a.unread_for(&b_id), 1);
    assert!(!primary.is_unbound());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn returning_to_broadcast_retries_port_search() {
    let held = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
    let port = held.local_addr().unwrap().port();
    let (sel, _link) = node_with_link(vec![port]).await;
    assert!(sel.is_network_restricted());

    sel.switch_transport(NetworkMode::Secondary).await.unwrap();
    assert!(!sel.is_network_restricted());

    drop(held);
    sel.switch_transport(NetworkMode::Primary).await.unwrap();
    assert!(!sel.is_network_restricted());
    assert_eq!(sel.status(), status::server_running(port));
    sel.shutdown().await;
}
