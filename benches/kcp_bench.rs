//! Criterion benchmarks for KCP engine throughput and wire codec cost.

use bytes::BytesMut;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use kcp::kcp_core::{Command, KcpCoreConfig, KcpEngine, KcpHeader, NodeDelayConfig, Segment};

/// Perfect transfer: all packets from src delivered to dst.
fn transfer(src: &mut KcpEngine, dst: &mut KcpEngine, now: u32) {
    for packet in src.drain_output() {
        let _ = dst.input(&packet, now);
    }
}

/// Run bidirectional update/transfer rounds, draining the receiver each
/// round to keep the receive window open.
fn run_rounds(kcp1: &mut KcpEngine, kcp2: &mut KcpEngine, rounds: usize, buf: &mut [u8]) -> usize {
    let mut received = 0;
    let mut now = 0u32;
    for _ in 0..rounds {
        now += 10;
        let _ = kcp1.update(now);
        transfer(kcp1, kcp2, now);

        while let Ok(Some(_)) = kcp2.try_receive(buf) {
            received += 1;
        }

        let _ = kcp2.update(now);
        transfer(kcp2, kcp1, now);
    }
    received
}

fn config(wnd: u32) -> KcpCoreConfig {
    KcpCoreConfig {
        snd_wnd: wnd,
        rcv_wnd: wnd,
        nodelay: NodeDelayConfig::fast(),
        ..KcpCoreConfig::default()
    }
}

fn engine_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_throughput");

    for &msg_count in &[10, 100, 500] {
        let msg_size = 1024;
        group.throughput(Throughput::Bytes((msg_count * msg_size) as u64));

        group.bench_with_input(
            BenchmarkId::new("1KB_messages", msg_count),
            &msg_count,
            |b, &count| {
                let payload = vec![0xABu8; msg_size];
                let mut buf = vec![0u8; msg_size];
                b.iter(|| {
                    let mut kcp1 = KcpEngine::new(0xBEEF0001, config(128));
                    let mut kcp2 = KcpEngine::new(0xBEEF0001, config(128));

                    for _ in 0..count {
                        kcp1.try_send(&payload).unwrap();
                    }

                    let received = run_rounds(&mut kcp1, &mut kcp2, count * 2, &mut buf);
                    assert_eq!(received, count);
                });
            },
        );
    }

    group.finish();
}

fn engine_large_message(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_large_message");

    for &size_kb in &[16, 64, 256] {
        let size = size_kb * 1024;
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(
            BenchmarkId::new("single_message", format!("{}KB", size_kb)),
            &size,
            |b, &sz| {
                let payload: Vec<u8> = (0..sz).map(|i| (i % 256) as u8).collect();
                let mut buf = vec![0u8; sz];
                b.iter(|| {
                    let mut kcp1 = KcpEngine::new(0xBEEF0003, config(256));
                    let mut kcp2 = KcpEngine::new(0xBEEF0003, config(256));

                    kcp1.try_send(&payload).unwrap();

                    let received = run_rounds(&mut kcp1, &mut kcp2, 200, &mut buf);
                    assert_eq!(received, 1);
                });
            },
        );
    }

    group.finish();
}

fn segment_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("segment_codec");
    let payload = vec![0x5Au8; 1376];
    let mut header = KcpHeader::new(0xBEEF0004, Command::Push);
    header.sn = 42;
    header.wnd = 128;
    let segment = Segment::new(header, &payload);
    group.throughput(Throughput::Bytes(segment.size() as u64));

    group.bench_function("encode", |b| {
        let mut buf = BytesMut::with_capacity(segment.size());
        b.iter(|| {
            buf.clear();
            segment.encode(&mut buf);
        });
    });

    let mut encoded = BytesMut::new();
    segment.encode(&mut encoded);
    group.bench_function("decode", |b| {
        b.iter(|| {
            let mut rest: &[u8] = &encoded;
            Segment::decode(&mut rest).unwrap()
        });
    });

    group.finish();
}

criterion_group!(benches, engine_throughput, engine_large_message, segment_codec);
criterion_main!(benches);
