use brainchat_common::MergeOrder;
use brainchat_engine::{fixtures, tokenize, ModelGenerator, ModelLoader, ResponseDispatcher};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::io::Write;
use std::sync::Arc;

fn bench_respond(c: &mut Criterion) {
    let mut file = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
    file.write_all(&fixtures::gguf_bytes()).unwrap();
    let model = ModelLoader::load(file.path()).unwrap();

    let input = "the quick brown fox jumps over the lazy dog ".repeat(16);
    let tokens = tokenize(&input);

    let mut group = c.benchmark_group("respond");
    for workers in [1usize, 2, 4, 8] {
        let dispatcher = ResponseDispatcher::with_workers(workers, Arc::new(ModelGenerator))
            .unwrap()
            .with_merge_order(MergeOrder::WorkerIndex);

        group.bench_with_input(BenchmarkId::from_parameter(workers), &tokens, |b, tokens| {
            b.iter(|| dispatcher.respond(black_box(tokens), &model).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_respond);
criterion_main!(benches);
