use criterion::{Criterion, criterion_group, criterion_main};
use med_codec::{Algorithm, BlockMeta, CodecDirectives, CodecEngine};
use rand::Rng;
use std::hint::black_box;

fn eeg_like(n: usize) -> Vec<i32> {
    let mut rng = rand::rng();
    (0..n)
        .map(|i| {
            let t = i as f64 / 1000.0;
            let slow = 6_000.0 * (2.0 * std::f64::consts::PI * 3.0 * t).sin();
            let alpha = 1_500.0 * (2.0 * std::f64::consts::PI * 10.0 * t).sin();
            let noise: f64 = rng.random_range(-200.0..200.0);
            (slow + alpha + noise) as i32
        })
        .collect()
}

fn bench_encode(c: &mut Criterion) {
    let samples = eeg_like(30_000);
    let meta = BlockMeta::default();
    let mut group = c.benchmark_group("encode_30k");
    for algorithm in [Algorithm::Red2, Algorithm::Pred2, Algorithm::Mbe] {
        group.bench_function(format!("{algorithm:?}"), |b| {
            let mut engine = CodecEngine::with_directives(CodecDirectives {
                algorithm,
                ..Default::default()
            });
            b.iter(|| engine.encode_block(black_box(&samples), &meta).unwrap());
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let samples = eeg_like(30_000);
    let meta = BlockMeta::default();
    let mut group = c.benchmark_group("decode_30k");
    for algorithm in [Algorithm::Red2, Algorithm::Pred2, Algorithm::Mbe] {
        let mut engine = CodecEngine::with_directives(CodecDirectives {
            algorithm,
            ..Default::default()
        });
        let block = engine.encode_block(&samples, &meta).unwrap();
        group.bench_function(format!("{algorithm:?}"), |b| {
            b.iter(|| engine.decode_block(black_box(&block)).unwrap());
        });
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
