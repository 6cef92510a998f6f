//! Criterion benchmarks: engine throughput over a perfect in-memory link,
//! plus the raw segment codec.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use arq_core::{Cmd, ControlBlock, DelayConfig, EngineConfig, NoDelayLevel, Segment};
use bytes::{Bytes, BytesMut};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

type Outbox = Arc<Mutex<VecDeque<Bytes>>>;

fn engine_pair(conv: u32) -> (ControlBlock, Outbox, ControlBlock, Outbox) {
    let config = EngineConfig {
        snd_wnd: 256,
        rcv_wnd: 256,
        delay: DelayConfig::custom(NoDelayLevel::On, 10, 2, true),
        ..EngineConfig::default()
    };
    let mut a = ControlBlock::new(conv, config.clone());
    let mut b = ControlBlock::new(conv, config);
    let a_out = attach(&mut a);
    let b_out = attach(&mut b);
    (a, a_out, b, b_out)
}

fn attach(cb: &mut ControlBlock) -> Outbox {
    let outbox: Outbox = Arc::new(Mutex::new(VecDeque::new()));
    let tx = outbox.clone();
    cb.set_output(move |datagram| {
        tx.lock().unwrap().push_back(Bytes::copy_from_slice(datagram));
    });
    outbox
}

/// Perfect transfer: every datagram from `from` delivered to `to`.
fn transfer(from: &Outbox, to: &mut ControlBlock) {
    let datagrams: Vec<Bytes> = from.lock().unwrap().drain(..).collect();
    for dg in datagrams {
        let _ = to.input(dg);
    }
}

fn engine_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_throughput");

    for &msg_count in &[10usize, 100, 500] {
        let msg_size = 1024usize;
        group.throughput(Throughput::Bytes((msg_count * msg_size) as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(msg_count),
            &msg_count,
            |bench, &count| {
                bench.iter(|| {
                    let (mut a, a_out, mut b, b_out) = engine_pair(1);
                    let payload = vec![0xCDu8; msg_size];
                    let mut now = 0u32;
                    let mut sent = 0usize;
                    let mut received = 0usize;
                    while received < count {
                        while sent < count && a.wait_snd() < 128 {
                            a.send(&payload).unwrap();
                            sent += 1;
                        }
                        a.update(now);
                        transfer(&a_out, &mut b);
                        b.update(now);
                        while b.recv_bytes().is_some() {
                            received += 1;
                        }
                        transfer(&b_out, &mut a);
                        now += 10;
                    }
                });
            },
        );
    }

    group.finish();
}

fn segment_codec(c: &mut Criterion) {
    let mut seg = Segment::with_payload(42, Cmd::Push, Bytes::from(vec![0xA5u8; 1376]));
    seg.sn = 7;
    seg.ts = 123_456;
    seg.wnd = 128;

    c.bench_function("segment_encode_decode", |bench| {
        bench.iter(|| {
            let mut buf = BytesMut::with_capacity(seg.encoded_len());
            seg.encode_into(&mut buf);
            let mut wire = buf.freeze();
            Segment::decode(&mut wire, 42).unwrap()
        });
    });
}

criterion_group!(benches, engine_throughput, segment_codec);
criterion_main!(benches);
