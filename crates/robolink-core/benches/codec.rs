//! Codec benchmarks

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use robolink_core::codec::{self, FrameContext};
use robolink_core::{DeviceIdentity, ProtocolVersion, RequestMessage};
use serde_json::json;

fn identity() -> DeviceIdentity {
    DeviceIdentity::new("bench-duid", b"0123456789abcdef", ProtocolVersion::V1)
}

fn encode_benchmark(c: &mut Criterion) {
    let identity = identity();
    let req = RequestMessage::new("app_segment_clean")
        .with_params(json!([{"segments": [16, 17, 18], "repeat": 2}]));

    c.bench_function("encode_plain_request", |b| {
        b.iter(|| {
            black_box(codec::encode_request(&identity, None, FrameContext::new(1, 2, 3), 12345, &req).unwrap())
        })
    });

    let secure = req.clone().secure();
    c.bench_function("encode_sealed_request", |b| {
        b.iter(|| {
            black_box(
                codec::encode_request(&identity, Some(77), FrameContext::new(1, 2, 3), 12345, &secure)
                    .unwrap(),
            )
        })
    });
}

fn decode_benchmark(c: &mut Criterion) {
    let identity = identity();
    let encoded = codec::encode_response(
        &identity,
        None,
        FrameContext::new(1, 2, 3),
        12345,
        json!({"result": [{"state": 8, "battery": 100, "error_code": 0}]}),
    )
    .unwrap();

    c.bench_function("decode_status_response", |b| {
        b.iter(|| black_box(codec::decode(&identity, None, &encoded).unwrap()))
    });
}

criterion_group!(benches, encode_benchmark, decode_benchmark);
criterion_main!(benches);
