//! Delivery guarantees over a lossy network, plus several concurrent
//! conversations sharing one listener.

mod common;

use common::{MemoryNetwork, MemoryTransport};
use kcp::{CancellationToken, KcpConfig, KcpConversation, KcpListener};
use rand::Rng;
use std::time::Duration;
use tokio::time::timeout;

fn messages(count: usize) -> Vec<Vec<u8>> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|i| {
            let len = rng.gen_range(1..4000);
            (0..len).map(|j| ((i + j) % 256) as u8).collect()
        })
        .collect()
}

async fn receive_all(
    conversation: &KcpConversation<MemoryTransport>,
    expected: &[Vec<u8>],
) {
    let cancel = CancellationToken::new();
    let mut buf = vec![0u8; 8192];
    for (i, message) in expected.iter().enumerate() {
        let n = timeout(Duration::from_secs(30), conversation.receive(&mut buf, &cancel))
            .await
            .unwrap_or_else(|_| panic!("message {i} never arrived"))
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], &message[..], "message {i} corrupted");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_datagrams_survive_packet_loss() {
    let network = MemoryNetwork::with_loss(0.2);
    let config = KcpConfig::new().fast_mode().window_size(64, 64);
    let server = KcpConversation::connect(network.bind(1), 2, 11, config.clone()).unwrap();
    let client = KcpConversation::connect(network.bind(2), 1, 11, config).unwrap();

    let outgoing = messages(30);
    let expected = outgoing.clone();

    let writer = tokio::spawn(async move {
        let cancel = CancellationToken::new();
        for message in &outgoing {
            client.send(message, &cancel).await.unwrap();
        }
        client
    });

    receive_all(&server, &expected).await;
    let client = writer.await.unwrap();
    let stats = client.stats();
    assert!(stats.retransmissions + stats.fast_retransmissions > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stream_survives_packet_loss() {
    let network = MemoryNetwork::with_loss(0.1);
    let config = KcpConfig::new().fast_mode().stream_mode(true);
    let server = KcpConversation::connect(network.bind(1), 2, 12, config.clone()).unwrap();
    let client = KcpConversation::connect(network.bind(2), 1, 12, config).unwrap();

    let payload: Vec<u8> = (0..50_000u32).map(|i| (i * 7 % 256) as u8).collect();
    let expected = payload.clone();
    tokio::spawn(async move {
        let cancel = CancellationToken::new();
        for chunk in payload.chunks(3000) {
            client.send(chunk, &cancel).await.unwrap();
        }
        // Keep the handle alive until the reader is done
        tokio::time::sleep(Duration::from_secs(60)).await;
        drop(client);
    });

    let cancel = CancellationToken::new();
    let mut received = Vec::new();
    let mut buf = [0u8; 2048];
    while received.len() < expected.len() {
        let n = timeout(Duration::from_secs(30), server.receive(&mut buf, &cancel))
            .await
            .expect("stream stalled")
            .unwrap()
            .unwrap();
        received.extend_from_slice(&buf[..n]);
    }
    assert_eq!(received, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_conversations_on_one_listener() {
    let network = MemoryNetwork::new();
    let config = KcpConfig::new().fast_mode();
    let mut listener =
        KcpListener::with_transport(network.bind(100), config.clone()).unwrap();

    let mut clients = Vec::new();
    for port in 1..=5u16 {
        let client =
            KcpConversation::connect(network.bind(port), 100, u32::from(port), config.clone())
                .unwrap();
        clients.push(tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let mut buf = [0u8; 64];
            for round in 0..10u8 {
                let message = [port as u8, round];
                client.send(&message, &cancel).await.unwrap();
                let n = timeout(Duration::from_secs(10), client.receive(&mut buf, &cancel))
                    .await
                    .expect("echo timed out")
                    .unwrap()
                    .unwrap();
                assert_eq!(&buf[..n], &message);
            }
        }));
    }

    let cancel = CancellationToken::new();
    let mut servers = Vec::new();
    for _ in 0..5 {
        let conversation = timeout(Duration::from_secs(5), listener.accept(&cancel))
            .await
            .expect("accept timed out")
            .unwrap();
        servers.push(tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let mut buf = [0u8; 64];
            for _ in 0..10 {
                let n = conversation.receive(&mut buf, &cancel).await.unwrap().unwrap();
                assert_eq!(u32::from(buf[0]), conversation.conv());
                conversation.send(&buf[..n], &cancel).await.unwrap();
            }
            conversation
        }));
    }

    for client in clients {
        client.await.unwrap();
    }
    let mut accepted = Vec::new();
    for server in servers {
        accepted.push(server.await.unwrap());
    }
    assert_eq!(listener.conversation_count(), 5);
}
