use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use shape_pack::{Construction, Context, Scalar, Serializer, ShapeGraph, Value};
use std::sync::Arc;

fn int_array(n: u64) -> Value {
    Value::Array((0..n).map(|v| Value::from(v.wrapping_mul(0x9e37_79b9))).collect())
}

fn bench_encode(c: &mut Criterion) {
    let mut graph = ShapeGraph::new();
    let element = graph.scalar(Scalar::U64);
    let numbers = graph.sequence(element, Construction::Sized);
    let any = graph.scalar(Scalar::Any);
    let serializer = Serializer::new(Arc::new(graph));
    let ctx = Context::new();

    let value = int_array(4096);
    let bytes = serializer.serialize_to_vec(&value, numbers, &ctx).unwrap();

    let mut group = c.benchmark_group("codec");
    group.throughput(Throughput::Bytes(bytes.len() as u64));
    group.bench_function("encode_u64_array", |b| {
        b.iter(|| {
            black_box(
                serializer
                    .serialize_to_vec(black_box(&value), numbers, &ctx)
                    .unwrap(),
            )
        })
    });
    group.bench_function("decode_u64_array", |b| {
        b.iter(|| {
            black_box(
                serializer
                    .deserialize(black_box(&bytes), numbers, &ctx)
                    .unwrap(),
            )
        })
    });
    group.bench_function("decode_self_describing", |b| {
        b.iter(|| {
            black_box(
                serializer
                    .deserialize(black_box(&bytes), any, &ctx)
                    .unwrap(),
            )
        })
    });
    group.finish();
}

criterion_group!(benches, bench_encode);
criterion_main!(benches);
