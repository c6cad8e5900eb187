use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

use rakudp::config::RakUdpConfig;
use rakudp::disconnect::DisconnectReason;
use rakudp::end_point::EndPoint;
use rakudp::message_dispatcher::{QueueDispatcher, TransportEvent};
use rakudp::seq::SequenceNumber;
use rakudp::wire::{Datagram, Frame, Reliability};

#[ctor::ctor]
fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init()
        .ok();
}

struct TestNode {
    end_point: Arc<EndPoint>,
    events: mpsc::Receiver<TransportEvent>,
    addr: SocketAddr,
}

async fn node(accept_incoming: bool) -> TestNode {
    node_with_config(accept_incoming, RakUdpConfig::default_ipv4()).await
}

async fn node_with_config(accept_incoming: bool, config: RakUdpConfig) -> TestNode {
    let (dispatcher, events) = QueueDispatcher::new(256);
    let end_point = Arc::new(
        EndPoint::new(
            "127.0.0.1:0".parse().unwrap(),
            accept_incoming,
            Arc::new(dispatcher),
            Arc::new(config),
        )
        .await
        .unwrap(),
    );
    let addr = end_point.self_addr();

    let recv_ep = end_point.clone();
    tokio::spawn(async move { recv_ep.recv_loop().await });

    TestNode { end_point, events, addr }
}

async fn next_message(events: &mut mpsc::Receiver<TransportEvent>) -> (u8, Bytes) {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for a transport event")
            .expect("event queue closed");
        match event {
            TransportEvent::Message { channel, msg, .. } => return (channel, msg),
            other => panic!("unexpected event {:?}", other),
        }
    }
}

async fn eventually<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_reliable_ordered_delivery() {
    let client = node(false).await;
    let mut server = node(true).await;

    let session = client.end_point.connect(server.addr).await.unwrap();
    for i in 0..5u8 {
        session
            .send(Bytes::from(vec![i]), Reliability::ReliableOrdered, 3)
            .await
            .unwrap();
    }

    for i in 0..5u8 {
        let (channel, msg) = next_message(&mut server.events).await;
        assert_eq!(channel, 3);
        assert_eq!(msg, Bytes::from(vec![i]));
    }
}

#[tokio::test]
async fn test_oversized_message_reassembled() {
    let client = node(false).await;
    let mut server = node(true).await;

    let payload = Bytes::from((0..10_000u32).map(|i| i as u8).collect::<Vec<_>>());
    let session = client.end_point.connect(server.addr).await.unwrap();
    session
        .send(payload.clone(), Reliability::Reliable, 0)
        .await
        .unwrap();

    let (_, msg) = next_message(&mut server.events).await;
    assert_eq!(msg, payload);
}

#[tokio::test]
async fn test_ack_receipt_confirmed() {
    let mut client = node(false).await;
    let server = node(true).await;

    let session = client.end_point.connect(server.addr).await.unwrap();
    let receipt_id = session
        .send_with_receipt(Bytes::from_static(b"confirm me"), Reliability::Reliable, 0)
        .await
        .unwrap();

    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), client.events.recv())
            .await
            .expect("timed out waiting for the ack receipt")
            .expect("event queue closed");
        if let TransportEvent::AckReceipt { receipt_id: confirmed, .. } = event {
            assert_eq!(confirmed, receipt_id);
            return;
        }
    }
}

#[tokio::test]
async fn test_disconnect_reported_to_dispatcher() {
    let mut client = node(false).await;
    let server = node(true).await;

    let session = client.end_point.connect(server.addr).await.unwrap();
    session.disconnect(DisconnectReason::Disconnected).await;

    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), client.events.recv())
            .await
            .expect("timed out waiting for the disconnect event")
            .expect("event queue closed");
        if let TransportEvent::Disconnect { reason, peer_addr } = event {
            assert_eq!(reason, DisconnectReason::Disconnected);
            assert_eq!(peer_addr, server.addr);
            return;
        }
    }
}

#[tokio::test]
async fn test_unknown_peers_ignored_when_not_accepting() {
    let client = node(false).await;
    let loner = node(false).await;

    let session = client.end_point.connect(loner.addr).await.unwrap();
    session
        .send(Bytes::from_static(b"anyone there?"), Reliability::Unreliable, 0)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(loner.end_point.get_session(client.addr).await.is_none());
}

#[tokio::test]
async fn test_sessions_on_both_ends() {
    let client = node(false).await;
    let server = node(true).await;

    let session = client.end_point.connect(server.addr).await.unwrap();
    session
        .send(Bytes::from_static(b"hi"), Reliability::Reliable, 0)
        .await
        .unwrap();

    let server_ep = server.end_point.clone();
    let client_addr = client.addr;
    eventually(|| {
        let ep = server_ep.clone();
        async move { ep.get_session(client_addr).await.is_some() }
    })
    .await;
}

#[tokio::test]
async fn test_timed_out_session_frees_its_connection_slot() {
    let mut config = RakUdpConfig::default_ipv4();
    config.idle_timeout = Duration::from_millis(200);
    config.max_incoming_connections = 1;
    config.incoming_connection_cooldown = None;
    let server = node_with_config(true, config).await;

    let client1 = node(false).await;
    let session1 = client1.end_point.connect(server.addr).await.unwrap();
    session1
        .send(Bytes::from_static(b"one"), Reliability::Reliable, 0)
        .await
        .unwrap();

    let server_ep = server.end_point.clone();
    let client1_addr = client1.addr;
    eventually(|| {
        let ep = server_ep.clone();
        async move { ep.get_session(client1_addr).await.is_some() }
    })
    .await;

    // client1 goes silent from here on; the server must time its session out and
    //  free the single connection slot for client2, whose reliable send keeps
    //  knocking via retransmission
    let client2 = node(false).await;
    let session2 = client2.end_point.connect(server.addr).await.unwrap();
    session2
        .send(Bytes::from_static(b"two"), Reliability::Reliable, 0)
        .await
        .unwrap();

    let server_ep = server.end_point.clone();
    let client2_addr = client2.addr;
    eventually(|| {
        let ep = server_ep.clone();
        async move { ep.get_session(client2_addr).await.is_some() }
    })
    .await;
}

#[tokio::test]
async fn test_garbage_from_known_peer_closes_its_session() {
    let server = node(true).await;

    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let from_addr = socket.local_addr().unwrap();

    let hello = Datagram::Data {
        is_resend: false,
        sequence_number: SequenceNumber::ZERO,
        frames: vec![Frame {
            reliability: Reliability::Unreliable,
            ack_receipt: false,
            reliable_index: None,
            ordering: None,
            split: None,
            payload: Bytes::from_static(b"hello"),
        }],
    };
    let mut buf = BytesMut::new();
    hello.ser(&mut buf);
    socket.send_to(&buf, server.addr).await.unwrap();

    let server_ep = server.end_point.clone();
    eventually(|| {
        let ep = server_ep.clone();
        async move { ep.get_session(from_addr).await.is_some() }
    })
    .await;

    // bytes without the valid-datagram flag void trust in the rest of the stream
    socket.send_to(&[0x12, 0x34], server.addr).await.unwrap();

    let server_ep = server.end_point.clone();
    eventually(|| {
        let ep = server_ep.clone();
        async move { ep.get_session(from_addr).await.is_none() }
    })
    .await;
}
