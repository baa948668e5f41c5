//! Integration tests for the WebSocket socket channel.

use std::time::{Duration, Instant};

use narrowband_transport::{
    inbound_queue, ChannelAdapter, ChannelType, PeerAddress, SocketChannel,
    TransportError,
};

async fn recv_with_timeout(
    rx: &mut narrowband_transport::InboundReceiver,
) -> narrowband_transport::InboundPacket {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("should receive within timeout")
        .expect("queue should stay open")
}

#[tokio::test]
async fn test_send_raw_opens_connection_and_delivers() {
    let (a_tx, _a_rx) = inbound_queue();
    let (b_tx, mut b_rx) = inbound_queue();
    let a = SocketChannel::bind("127.0.0.1:0", a_tx).await.unwrap();
    let b = SocketChannel::bind("127.0.0.1:0", b_tx).await.unwrap();

    a.send_raw(b.address(), b"first").await.expect("send should work");

    let pkt = recv_with_timeout(&mut b_rx).await;
    assert_eq!(pkt.bytes, b"first");
    assert_eq!(&pkt.from, a.address());
    assert_eq!(pkt.channel, ChannelType::P2p);
}

#[tokio::test]
async fn test_reply_reuses_accepted_connection() {
    let (a_tx, mut a_rx) = inbound_queue();
    let (b_tx, mut b_rx) = inbound_queue();
    let a = SocketChannel::bind("127.0.0.1:0", a_tx).await.unwrap();
    let b = SocketChannel::bind("127.0.0.1:0", b_tx).await.unwrap();

    a.send_raw(b.address(), b"ping").await.unwrap();
    let pkt = recv_with_timeout(&mut b_rx).await;

    // B answers the address it learned from the hello frame.
    b.send_raw(&pkt.from, b"pong").await.unwrap();
    let reply = recv_with_timeout(&mut a_rx).await;
    assert_eq!(reply.bytes, b"pong");
    assert_eq!(&reply.from, b.address());

    assert_eq!(b.connected_peers().await, vec![a.address().clone()]);
}

#[tokio::test]
async fn test_send_to_closed_port_is_unreachable() {
    let (tx, _rx) = inbound_queue();
    let a = SocketChannel::bind("127.0.0.1:0", tx).await.unwrap();

    // Grab a free port, then release it so nothing listens there.
    let port = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    };
    let nobody = PeerAddress::new(format!("127.0.0.1:{port}"));

    let result = a.send_raw(&nobody, b"x").await;
    assert!(matches!(result, Err(TransportError::Unreachable(_))));
}

#[tokio::test]
async fn test_silent_peer_does_not_hold_up_other_peers() {
    let (a_tx, _a_rx) = inbound_queue();
    let (b_tx, mut b_rx) = inbound_queue();
    let a = SocketChannel::bind("127.0.0.1:0", a_tx)
        .await
        .unwrap()
        .with_io_timeout(Duration::from_millis(500));
    let b = SocketChannel::bind("127.0.0.1:0", b_tx).await.unwrap();

    // Completes TCP connects from its backlog but never speaks WebSocket.
    let silent = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let stalled = PeerAddress::new(silent.local_addr().unwrap().to_string());

    let (stuck, (healthy, took)) = tokio::join!(a.send_raw(&stalled, b"lost"), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let started = Instant::now();
        (a.send_raw(b.address(), b"through").await, started.elapsed())
    });

    assert!(healthy.is_ok());
    assert!(took < Duration::from_millis(400), "healthy send waited {took:?}");
    assert!(matches!(stuck, Err(TransportError::Unreachable(_))));
    assert_eq!(recv_with_timeout(&mut b_rx).await.bytes, b"through");
    assert_eq!(a.connected_peers().await, vec![b.address().clone()]);
}
