use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tenuki_engine::{decode_policy, encode_policy};

const N: usize = 361;

/// A realistic policy head: a couple dozen live moves, the rest zero.
fn sparse_policy(rng: &mut StdRng) -> Vec<f32> {
    let mut policy = vec![0.0f32; N];
    for _ in 0..24 {
        let at = rng.gen_range(0..N);
        policy[at] = rng.gen_range(0.0..0.4);
    }
    policy
}

fn bench_encode(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(7);
    let policies: Vec<Vec<f32>> = (0..64).map(|_| sparse_policy(&mut rng)).collect();
    let mut i = 0usize;
    c.bench_function("encode_sparse_policy", |b| {
        b.iter(|| {
            let bits = encode_policy(black_box(&policies[i % policies.len()]));
            i += 1;
            bits
        })
    });
}

fn bench_decode(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(7);
    let encoded: Vec<_> = (0..64)
        .map(|_| encode_policy(&sparse_policy(&mut rng)))
        .collect();
    let mut i = 0usize;
    c.bench_function("decode_sparse_policy", |b| {
        b.iter(|| {
            let policy = decode_policy(black_box(&encoded[i % encoded.len()]), N).unwrap();
            i += 1;
            policy
        })
    });
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
