use criterion::{BenchmarkId, Criterion, Throughput};
use libmqtt::network::application::mqtt::codec::{Publish, mbi};
use libmqtt::network::application::mqtt::{Packet, QoS};
use std::hint::black_box;

const PAYLOAD_SIZES: [usize; 4] = [0, 128, 4 * 1024, 256 * 1024];

fn publish(size: usize) -> Packet {
    let mut publish = Publish::new("devices/7/telemetry", vec![0xA5; size], QoS::AtLeastOnce);
    publish.message_id = 42;
    Packet::Publish(publish)
}

pub fn bench_encode_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_publish");
    for size in PAYLOAD_SIZES {
        let packet = publish(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &packet, |b, packet| {
            b.iter(|| black_box(packet).encode().unwrap())
        });
    }
    group.finish();
}

pub fn bench_decode_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_publish");
    for size in PAYLOAD_SIZES {
        let frame = publish(size).encode().unwrap();
        group.throughput(Throughput::Bytes(frame.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, frame| {
            b.iter(|| Packet::decode(black_box(frame)).unwrap())
        });
    }
    group.finish();
}

pub fn bench_remaining_length(c: &mut Criterion) {
    let values = [0usize, 127, 16_383, 2_097_151, 268_435_455];
    let encoded: Vec<_> = values.iter().map(|v| mbi::encode(*v).unwrap()).collect();

    c.bench_function("mbi_encode", |b| {
        b.iter(|| {
            for value in values {
                black_box(mbi::encode(black_box(value)).unwrap());
            }
        })
    });
    c.bench_function("mbi_decode", |b| {
        b.iter(|| {
            for bytes in &encoded {
                black_box(mbi::decode(black_box(bytes)).unwrap());
            }
        })
    });
}

pub fn bench_encode_control(c: &mut Criterion) {
    let packets = [
        Packet::Pingreq,
        Packet::Puback { message_id: 1 },
        Packet::Pubrel { message_id: 2 },
        Packet::Disconnect,
    ];
    c.bench_function("encode_control", |b| {
        b.iter(|| {
            for packet in &packets {
                black_box(packet.encode().unwrap());
            }
        })
    });
}
