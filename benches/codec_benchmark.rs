//! Hot-path codec benchmarks: packet framing, length-encoded integers,
//! row decode.

use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

use shard_proxy::mysql::packet::Packet;
use shard_proxy::mysql::protocol::{read_lenenc_int_slice, write_lenenc_int};
use shard_proxy::mysql::rows::{BinaryRow, Field, ResultSet, TextRow};
use shard_proxy::mysql::value::Value;
use shard_proxy::mysql::FieldType;

fn bench_packet_framing(c: &mut Criterion) {
    let payload = Bytes::from(vec![0x5a; 512]);

    c.bench_function("packet_encode_512b", |b| {
        b.iter(|| {
            let packet = Packet::new(1, payload.clone());
            black_box(packet.encode());
        })
    });

    let encoded = Packet::new(1, payload).encode();
    c.bench_function("packet_decode_512b", |b| {
        b.iter(|| {
            let mut buf = BytesMut::from(&encoded[..]);
            black_box(Packet::decode(&mut buf).unwrap());
        })
    });
}

fn bench_lenenc(c: &mut Criterion) {
    c.bench_function("lenenc_int_round_trip", |b| {
        b.iter(|| {
            for v in [1u64, 250, 300, 70_000, 20_000_000, u64::MAX / 2] {
                let mut buf = BytesMut::new();
                write_lenenc_int(&mut buf, black_box(v));
                black_box(read_lenenc_int_slice(&buf));
            }
        })
    });
}

fn bench_row_decode(c: &mut Criterion) {
    let rs = ResultSet::new(vec![
        Field::new("id", FieldType::LongLong),
        Field::new("name", FieldType::VarChar),
        Field::new("score", FieldType::Double),
        Field::new("note", FieldType::VarString),
    ]);
    let values = vec![
        Value::Int(123456789),
        Value::Bytes(b"a-plausible-user-name".to_vec()),
        Value::Double(98.25),
        Value::Null,
    ];

    let text_row = TextRow::encode(&values, rs.clone());
    c.bench_function("text_row_decode_4col", |b| {
        b.iter(|| black_box(text_row.decode().unwrap()))
    });

    let binary_row = BinaryRow::encode(&values, rs).unwrap();
    c.bench_function("binary_row_decode_4col", |b| {
        b.iter(|| black_box(binary_row.decode().unwrap()))
    });
}

criterion_group!(
    benches,
    bench_packet_framing,
    bench_lenenc,
    bench_row_decode
);
criterion_main!(benches);
