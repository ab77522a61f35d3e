use criterion::{criterion_group, criterion_main};

mod network;

criterion_group!(
    benches,
    network::application::mqtt::codec::bench_encode_publish,
    network::application::mqtt::codec::bench_decode_publish,
    network::application::mqtt::registry::bench_topic_match,
    network::application::mqtt::registry::bench_ack_round_trip
);
criterion_main!(benches);
