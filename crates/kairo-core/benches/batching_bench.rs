use candle_core::Device;
use criterion::{Criterion, black_box, criterion_group, criterion_main};
use kairo_core::data::{BatchSetGenerator, BatchingConfig, DummyDataset, ExternData, FeedBuilder};

fn bench_batching(c: &mut Criterion) {
    let dataset = DummyDataset::new(40, 10, 200, 50);
    let mut extern_data = ExternData::new();
    extern_data.init_from_dataset(&dataset).unwrap();

    let plain = BatchingConfig {
        batch_size: 1000,
        max_seqs: 32,
        ..BatchingConfig::default()
    };
    let chunked = BatchingConfig {
        chunking: Some((20, 10)),
        ..plain.clone()
    };

    c.bench_function("batch_assembly_200_seqs", |b| {
        b.iter(|| {
            let generator = BatchSetGenerator::new(&dataset, black_box(plain.clone())).unwrap();
            generator.map(|batch| batch.unwrap().num_spans()).sum::<usize>()
        });
    });

    c.bench_function("batch_assembly_chunked", |b| {
        b.iter(|| {
            let generator = BatchSetGenerator::new(&dataset, black_box(chunked.clone())).unwrap();
            generator.map(|batch| batch.unwrap().num_spans()).sum::<usize>()
        });
    });

    let builder = FeedBuilder::new(&dataset, &extern_data, Device::Cpu).unwrap();
    let batches: Vec<_> = BatchSetGenerator::new(&dataset, plain)
        .unwrap()
        .map(|batch| batch.unwrap())
        .collect();

    c.bench_function("feed_build_all_batches", |b| {
        b.iter(|| {
            for batch in &batches {
                let _ = builder.build(black_box(batch)).unwrap();
            }
        });
    });
}

criterion_group!(benches, bench_batching);
criterion_main!(benches);
