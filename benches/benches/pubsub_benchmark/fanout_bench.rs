use std::{
    hint::black_box,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use simbus::{
    pubsub::name::{decode_topic_name, normalize_namespace},
    AdvertiseOptions, Bus, BusMessage, Node, Publisher, StringMsg, Subscriber,
};

/// Шина с одним издателем и `subscribers` узлами-подписчиками одной
/// темы. Узлы и подписки держатся в структуре, иначе их Drop снял бы
/// регистрацию ещё до замеров.
struct FanoutBus {
    bus: Bus,
    publisher: Publisher<StringMsg>,
    received: Arc<AtomicU64>,
    _pub_node: Node,
    _sub_nodes: Vec<Node>,
    _subs: Vec<Subscriber>,
}

fn build_fanout_bus(subscribers: usize) -> FanoutBus {
    let bus = Bus::new();
    let pub_node = bus.node("bench").unwrap();
    let publisher = pub_node
        .advertise::<StringMsg>("~/fanout", AdvertiseOptions::default())
        .unwrap();

    let received = Arc::new(AtomicU64::new(0));
    let mut sub_nodes = Vec::with_capacity(subscribers);
    let mut subs = Vec::with_capacity(subscribers);
    for i in 0..subscribers {
        let node = bus.node(format!("viewer{i}").as_str()).unwrap();
        let counter = received.clone();
        let sub = node
            .subscribe::<StringMsg, _>("/bench/fanout", move |_msg| {
                counter.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        sub_nodes.push(node);
        subs.push(sub);
    }

    FanoutBus {
        bus,
        publisher,
        received,
        _pub_node: pub_node,
        _sub_nodes: sub_nodes,
        _subs: subs,
    }
}

/// Полный цикл: публикация и прокачка шины до доставки подписчикам.
pub fn bench_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("fanout_publish_cycle");
    group.warm_up_time(Duration::from_secs(2));
    group.measurement_time(Duration::from_secs(5));

    for &subscribers in &[1usize, 8, 64] {
        let fanout = build_fanout_bus(subscribers);
        let msg = StringMsg::new("bench payload");

        group.throughput(Throughput::Elements(subscribers as u64));
        group.bench_with_input(
            BenchmarkId::new("subscribers", subscribers),
            &fanout,
            |b, f| {
                b.iter(|| {
                    f.publisher.publish(black_box(&msg)).unwrap();
                    f.bus.process_nodes();
                });
            },
        );

        assert!(fanout.received.load(Ordering::Relaxed) > 0);
    }
    group.finish();
}

/// Разворачивание имён тем: тильда, абсолютные и scoped-имена.
pub fn bench_name_decoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("topic_name_decode");
    let ns = normalize_namespace("bench/world").unwrap();

    for raw in ["~/pose", "/bench/world/pose", "model::link::sensor"] {
        group.bench_with_input(BenchmarkId::new("raw", raw), &raw, |b, r| {
            b.iter(|| {
                let name = decode_topic_name(black_box(&ns), black_box(r)).unwrap();
                black_box(name);
            });
        });
    }
    group.finish();
}

/// Кодек конвертов: сериализация и разбор `StringMsg`.
pub fn bench_envelope_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope_codec");

    for &size in &[16usize, 256, 4096] {
        let msg = StringMsg::new("x".repeat(size));
        let encoded = StringMsg::encode(&msg).unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("encode", size), &msg, |b, m| {
            b.iter(|| black_box(StringMsg::encode(black_box(m)).unwrap()));
        });
        group.bench_with_input(BenchmarkId::new("decode", size), &encoded, |b, e| {
            b.iter(|| black_box(StringMsg::decode(black_box(e)).unwrap()));
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_fanout,
    bench_name_decoding,
    bench_envelope_codec
);
criterion_main!(benches);
