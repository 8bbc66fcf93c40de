use std::collections::HashMap;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use ndarray::{Array1, Array2};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use treebp::{Distribution, FactorGraph, Messages};

fn gen_chain(n: usize, nc: usize) -> Arc<FactorGraph> {
    let description: String = std::iter::once("p(x0)".to_owned())
        .chain((1..n).map(|i| format!("p(x{}|x{})", i, i - 1)))
        .collect();
    let mut graph = FactorGraph::from_factorization(&description).unwrap();
    let mut tables = HashMap::new();
    tables.insert(
        "p(x0)".to_owned(),
        Distribution::from_vector(Array1::random(nc, Uniform::new(0.0, 1.0)), "x0").unwrap(),
    );
    for i in 1..n {
        let (cur, prev) = (format!("x{}", i), format!("x{}", i - 1));
        tables.insert(
            format!("p({}|{})", cur, prev),
            Distribution::new(
                Array2::random((nc, nc), Uniform::new(0.0, 1.0)).into_dyn(),
                [cur, prev],
            )
            .unwrap(),
        );
    }
    graph.bind_distributions(tables).unwrap();
    Arc::new(graph)
}

fn bench_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("belief_propagation");
    for nc in [2, 16, 256] {
        group.bench_with_input(BenchmarkId::new("chain_100", nc), &nc, |b, nc| {
            let graph = gen_chain(100, *nc);
            b.iter(|| {
                let mut msgs = Messages::new(graph.clone());
                msgs.belief_propagation().unwrap();
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_chain);
criterion_main!(benches);
