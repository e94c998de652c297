//! End-to-end lifecycle tests over loopback sockets.

use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use warpgrid_replica::dial::DialFuture;
use warpgrid_replica::{
    Connection, DialContext, DialFunc, Node, NodeError, NodeInfo, NodeState, Role, tcp_dialer,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A loopback address nothing is listening on (at the time of the call).
fn free_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}

fn counting(inner: DialFunc) -> (DialFunc, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let dial: DialFunc = Arc::new(move |ctx: DialContext, address: String| -> DialFuture {
        counter.fetch_add(1, Ordering::SeqCst);
        inner(ctx, address)
    });
    (dial, calls)
}

fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(20));
    }
}

fn read_handshake(mut stream: TcpStream) -> (u64, u64, String) {
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut word = [0u8; 8];
    stream.read_exact(&mut word).unwrap();
    let version = u64::from_le_bytes(word);
    stream.read_exact(&mut word).unwrap();
    let id = u64::from_le_bytes(word);
    stream.read_exact(&mut word).unwrap();
    let mut address = vec![0u8; u64::from_le_bytes(word) as usize];
    stream.read_exact(&mut address).unwrap();
    (version, id, String::from_utf8(address).unwrap())
}

#[test]
fn dial_func_reaches_peer_through_bridge() {
    init_tracing();
    let peer = TcpListener::bind("127.0.0.1:0").unwrap();
    let peer_address = peer.local_addr().unwrap().to_string();
    let accepted = std::thread::spawn(move || {
        let (stream, _) = peer.accept().unwrap();
        read_handshake(stream)
    });

    let dir = tempfile::tempdir().unwrap();
    let own_address = "127.0.0.1:9001";
    let mut node: Node = Node::create(1, own_address, dir.path()).unwrap();
    let (dial, calls) = counting(tcp_dialer());
    node.set_dial_func(dial).unwrap();
    node.set_bind_address("127.0.0.1:0").unwrap();
    node.recover(&[
        NodeInfo::voter(1, own_address),
        NodeInfo::voter(2, peer_address.clone()),
    ])
    .unwrap();

    node.start().unwrap();
    assert_eq!(node.state(), NodeState::Running);

    let (version, id, address) = accepted.join().unwrap();
    assert_eq!(version, 1);
    assert_eq!(id, 1);
    assert_eq!(address, own_address);
    assert!(calls.load(Ordering::SeqCst) >= 1);
    wait_for("outbound connection", || node.engine().connected_peers() == vec![2]);

    node.stop().unwrap();
    assert_eq!(node.state(), NodeState::Stopped);
    node.destroy();
}

#[test]
fn two_nodes_connect_to_each_other() {
    init_tracing();
    let a_address = free_address();
    let b_address = free_address();
    let cluster = vec![
        NodeInfo::voter(1, a_address.clone()),
        NodeInfo::voter(2, b_address.clone()),
    ];

    let a_dir = tempfile::tempdir().unwrap();
    let b_dir = tempfile::tempdir().unwrap();
    let mut a: Node = Node::create(1, &a_address, a_dir.path()).unwrap();
    let mut b: Node = Node::create(2, &b_address, b_dir.path()).unwrap();
    for node in [&mut a, &mut b] {
        node.set_dial_func(tcp_dialer()).unwrap();
        node.set_network_latency(Duration::from_millis(5)).unwrap();
        node.recover(&cluster).unwrap();
    }

    a.start().unwrap();
    b.start().unwrap();
    assert_eq!(a.bind_address(), a_address);

    wait_for("a → b", || a.engine().connected_peers() == vec![2]);
    wait_for("b → a", || b.engine().connected_peers() == vec![1]);
    wait_for("a accepted b", || a.engine().inbound_peers() == vec![2]);
    wait_for("b accepted a", || b.engine().inbound_peers() == vec![1]);

    a.stop().unwrap();
    b.stop().unwrap();
}

#[test]
fn unresponsive_dial_is_bounded_by_timeout() {
    init_tracing();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let hang: DialFunc = Arc::new(move |_ctx: DialContext, _address: String| -> DialFuture {
        counter.fetch_add(1, Ordering::SeqCst);
        Box::pin(std::future::pending::<io::Result<Box<dyn Connection>>>())
    });

    let dir = tempfile::tempdir().unwrap();
    let mut node: Node = Node::create(1, "127.0.0.1:9001", dir.path()).unwrap();
    node.set_dial_func(hang).unwrap();
    node.set_dial_timeout(Duration::from_millis(200)).unwrap();
    node.recover(&[
        NodeInfo::voter(1, "127.0.0.1:9001"),
        NodeInfo::new(2, "192.0.2.1:9001", Role::StandBy),
    ])
    .unwrap();
    node.set_bind_address("127.0.0.1:0").unwrap();
    node.start().unwrap();

    wait_for("first dial attempt", || calls.load(Ordering::SeqCst) >= 1);
    let begun = Instant::now();
    node.stop().unwrap();
    assert!(begun.elapsed() < Duration::from_secs(2));
    assert!(node.engine().connected_peers().is_empty());
}

#[test]
fn recovered_membership_survives_restart() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let cluster = vec![
        NodeInfo::voter(1, "10.0.0.1:9000"),
        NodeInfo::new(2, "10.0.0.2:9000", Role::StandBy),
        NodeInfo::new(3, "10.0.0.3:9000", Role::Spare),
    ];

    let mut node: Node = Node::create(1, "10.0.0.1:9000", dir.path()).unwrap();
    node.recover_ext(&cluster).unwrap();
    node.destroy();

    let node: Node = Node::create(1, "10.0.0.1:9000", dir.path()).unwrap();
    assert_eq!(node.engine().cluster().unwrap(), cluster);
}

#[test]
fn recover_after_stop() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mut node: Node = Node::create(1, "127.0.0.1:9001", dir.path()).unwrap();
    node.set_bind_address("127.0.0.1:0").unwrap();
    node.start().unwrap();
    assert_eq!(
        node.engine().cluster().unwrap(),
        vec![NodeInfo::voter(1, "127.0.0.1:9001")]
    );
    node.stop().unwrap();

    node.recover(&[NodeInfo::voter(1, "127.0.0.1:9001"), NodeInfo::voter(4, "h:4")])
        .unwrap();
    assert_eq!(node.engine().cluster().unwrap().len(), 2);
}

#[test]
fn recover_rejects_invalid_lists() {
    let dir = tempfile::tempdir().unwrap();
    let mut node: Node = Node::create(1, "127.0.0.1:9001", dir.path()).unwrap();

    assert!(matches!(node.recover(&[]), Err(NodeError::Membership(_))));
    assert!(matches!(
        node.recover_ext(&[NodeInfo::voter(1, "a:1"), NodeInfo::voter(1, "b:1")]),
        Err(NodeError::Membership(_))
    ));
    assert!(node.engine().cluster().unwrap().is_empty());
}

#[test]
fn dropping_running_node_stops_it() {
    let dir = tempfile::tempdir().unwrap();
    let mut node: Node = Node::create(1, "127.0.0.1:9001", dir.path()).unwrap();
    node.set_bind_address("127.0.0.1:0").unwrap();
    node.start().unwrap();
    let bound: SocketAddr = node.bind_address().parse().unwrap();
    drop(node);

    wait_for("listener release", || TcpListener::bind(bound).is_ok());
}
