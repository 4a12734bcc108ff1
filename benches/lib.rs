use criterion::{criterion_group, criterion_main};


criterion_group!(
    benches,
    solve::bench_unfold,
    solve::bench_fisher,
    solve::bench_sparse
);
criterion_main!(benches);
