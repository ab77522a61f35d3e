use criterion::{BatchSize, Criterion, Throughput};
use libiot_mqtt::network::application::mqtt::codec::{self, Publish, QoS};
use std::hint::black_box;

fn sample(payload: &[u8]) -> Publish<'_> {
    Publish {
        dup: false,
        qos: QoS::AtLeastOnce,
        retain: false,
        topic: "libiot/bench-topic",
        packet_id: Some(42),
        payload,
    }
}

pub fn bench_encode_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_publish");
    for size in [16usize, 1024, 16 * 1024] {
        let payload = vec![0xA5; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("{size}B"), |b| {
            b.iter_batched_ref(
                || Vec::with_capacity(size + 32),
                |buf| {
                    buf.clear();
                    codec::encode_publish(buf, black_box(&sample(&payload))).expect("encode");
                },
                BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

pub fn bench_decode_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_publish");
    let payload = vec![0x5A; 1024];
    let mut packet = Vec::new();
    codec::encode_publish(&mut packet, &sample(&payload)).expect("encode");
    let (header, used) = codec::decode_fixed_header(&packet)
        .expect("header")
        .expect("complete header");
    let body = &packet[used..];

    group.throughput(Throughput::Bytes(packet.len() as u64));
    group.bench_function("1024B", |b| {
        b.iter(|| codec::decode_publish(header.flags, black_box(body)).expect("decode"))
    });
    group.finish();
}
