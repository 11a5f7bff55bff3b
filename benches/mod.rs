use criterion::{criterion_group, criterion_main};

mod network;

criterion_group!(
    benches,
    network::application::mqtt::codec::bench_encode_publish,
    network::application::mqtt::codec::bench_decode_publish,
    network::application::mqtt::codec::bench_remaining_length,
    network::application::mqtt::codec::bench_encode_control
);
criterion_main!(benches);
