//! Listener admission and routing over an in-memory datagram network

mod common;

use common::{eventually, push_packet, MemoryNetwork, MemoryTransport};
use kcp::{CancellationToken, EngineState, KcpConfig, KcpConversation, KcpListener, Transport};
use std::time::Duration;
use tokio::time::timeout;

const LISTEN_PORT: u16 = 100;

fn listener(network: &MemoryNetwork, config: KcpConfig) -> KcpListener<MemoryTransport> {
    KcpListener::with_transport(network.bind(LISTEN_PORT), config).unwrap()
}

async fn accept(listener: &mut KcpListener<MemoryTransport>) -> KcpConversation<MemoryTransport> {
    let cancel = CancellationToken::new();
    timeout(Duration::from_secs(5), listener.accept(&cancel))
        .await
        .expect("accept timed out")
        .unwrap()
}

#[tokio::test]
async fn test_backlog_limits_admission() {
    let network = MemoryNetwork::new();
    let mut listener = listener(&network, KcpConfig::new().fast_mode().backlog(1));
    let first = network.bind(1);
    let second = network.bind(2);

    first
        .send_to(&push_packet(42, 0, b"hello"), &LISTEN_PORT)
        .await
        .unwrap();
    second
        .send_to(&push_packet(43, 0, b"world"), &LISTEN_PORT)
        .await
        .unwrap();

    assert!(eventually(Duration::from_secs(2), || listener.conversation_count() == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    // The second endpoint found the backlog full and was dropped
    assert_eq!(listener.conversation_count(), 1);

    let conversation = accept(&mut listener).await;
    assert_eq!(conversation.conv(), 42);
    assert_eq!(*conversation.peer(), 1);
    assert_eq!(conversation.try_peek(), Some(5));

    // With room in the backlog the retry gets through
    second
        .send_to(&push_packet(43, 0, b"world"), &LISTEN_PORT)
        .await
        .unwrap();
    let retried = accept(&mut listener).await;
    assert_eq!(retried.conv(), 43);
    assert_eq!(*retried.peer(), 2);
    assert_eq!(listener.conversation_count(), 2);

    let cancel = CancellationToken::new();
    let mut buf = [0u8; 16];
    let n = retried.receive(&mut buf, &cancel).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"world");
}

#[tokio::test]
async fn test_packets_route_to_existing_conversation() {
    let network = MemoryNetwork::new();
    let mut listener = listener(&network, KcpConfig::new().fast_mode());
    let endpoint = network.bind(1);

    endpoint
        .send_to(&push_packet(9, 0, b"one"), &LISTEN_PORT)
        .await
        .unwrap();
    let conversation = accept(&mut listener).await;

    endpoint
        .send_to(&push_packet(9, 1, b"two"), &LISTEN_PORT)
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let mut buf = [0u8; 8];
    for expected in [b"one", b"two"] {
        let n = timeout(Duration::from_secs(5), conversation.receive(&mut buf, &cancel))
            .await
            .expect("receive timed out")
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], expected);
    }
    assert_eq!(listener.conversation_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_echo_with_client_conversation() {
    let network = MemoryNetwork::new();
    let config = KcpConfig::new().fast_mode();
    let mut listener = listener(&network, config.clone());

    let server = tokio::spawn(async move {
        let cancel = CancellationToken::new();
        let conversation = listener.accept(&cancel).await.unwrap();
        let mut buf = [0u8; 1024];
        for _ in 0..3 {
            let n = conversation.receive(&mut buf, &cancel).await.unwrap().unwrap();
            conversation.send(&buf[..n], &cancel).await.unwrap();
        }
        listener
    });

    let client = KcpConversation::connect(network.bind(5), LISTEN_PORT, 77, config).unwrap();
    let cancel = CancellationToken::new();
    let mut buf = [0u8; 1024];
    for message in [&b"ping"[..], &[1u8; 700][..], b"last"] {
        client.send(message, &cancel).await.unwrap();
        let n = timeout(Duration::from_secs(5), client.receive(&mut buf, &cancel))
            .await
            .expect("echo timed out")
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], message);
    }

    let listener = timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
    assert_eq!(listener.conversation_count(), 1);
}

#[tokio::test]
async fn test_remove_checks_identity() {
    let network = MemoryNetwork::new();
    let mut listener = listener(&network, KcpConfig::new().fast_mode());
    let endpoint = network.bind(1);

    endpoint
        .send_to(&push_packet(1, 0, b"a"), &LISTEN_PORT)
        .await
        .unwrap();
    let conversation = accept(&mut listener).await;

    assert!(listener.remove(&conversation));
    assert!(!listener.remove(&conversation));
    assert_eq!(listener.conversation_count(), 0);
    // Removing only stops routing; the handle keeps working
    assert!(conversation.is_active());
}

#[tokio::test]
async fn test_inactive_conversation_is_replaced() {
    let network = MemoryNetwork::new();
    let mut listener = listener(&network, KcpConfig::new().fast_mode());
    let endpoint = network.bind(1);

    endpoint
        .send_to(&push_packet(1, 0, b"a"), &LISTEN_PORT)
        .await
        .unwrap();
    let old = accept(&mut listener).await;
    old.dispose();

    endpoint
        .send_to(&push_packet(2, 0, b"b"), &LISTEN_PORT)
        .await
        .unwrap();
    let new = accept(&mut listener).await;
    assert_eq!(new.conv(), 2);
    assert!(!new.ptr_eq(&old));
    assert_eq!(listener.conversation_count(), 1);
}

#[tokio::test]
async fn test_cleanup_drops_inactive_conversations() {
    let network = MemoryNetwork::new();
    let config = KcpConfig::new()
        .fast_mode()
        .cleanup_interval(Duration::from_millis(20));
    let mut listener = listener(&network, config);
    let endpoint = network.bind(1);

    endpoint
        .send_to(&push_packet(1, 0, b"a"), &LISTEN_PORT)
        .await
        .unwrap();
    let conversation = accept(&mut listener).await;
    conversation.set_transport_closed();

    assert!(eventually(Duration::from_secs(2), || listener.conversation_count() == 0).await);
}

#[tokio::test]
async fn test_close_fails_accept_and_closes_conversations() {
    let network = MemoryNetwork::new();
    let mut listener = listener(&network, KcpConfig::new().fast_mode());
    let endpoint = network.bind(1);

    endpoint
        .send_to(&push_packet(1, 0, b"a"), &LISTEN_PORT)
        .await
        .unwrap();
    let conversation = accept(&mut listener).await;

    listener.close().await;
    assert_eq!(conversation.state(), EngineState::TransportClosed);
    assert_eq!(listener.conversation_count(), 0);

    let cancel = CancellationToken::new();
    let err = listener.accept(&cancel).await.unwrap_err();
    assert!(err.is_closed());

    // Already queued data is still readable
    let mut buf = [0u8; 4];
    assert_eq!(conversation.receive(&mut buf, &cancel).await.unwrap(), Some(1));
    assert_eq!(conversation.receive(&mut buf, &cancel).await.unwrap(), None);
}

#[tokio::test]
async fn test_accept_can_be_canceled() {
    let network = MemoryNetwork::new();
    let mut listener = listener(&network, KcpConfig::new());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let err = listener.accept(&cancel).await.unwrap_err();
    assert!(err.is_canceled());
    assert_eq!(*listener.local_addr(), LISTEN_PORT);
}

#[tokio::test]
async fn test_garbage_from_unknown_endpoint_is_ignored() {
    let network = MemoryNetwork::new();
    let listener = listener(&network, KcpConfig::new());
    let endpoint = network.bind(1);

    endpoint.send_to(&[1, 2, 3], &LISTEN_PORT).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(listener.conversation_count(), 0);
}
