//! Benchmarks for experiment metadata writes and listing on a disk repository

use std::collections::BTreeMap;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use keepsake_core::id::random_id;
use keepsake_core::{time, Checkpoint, Config, Experiment, Goal, ParamValue, PrimaryMetric};
use keepsake_storage::{DiskRepository, Repository};
use keepsake_tracking::MetadataStore;
use tempfile::TempDir;

fn experiment(checkpoints: usize) -> Experiment {
    let id = random_id();
    Experiment {
        id: id.clone(),
        created: time::now(),
        params: BTreeMap::from([
            ("lr".to_string(), ParamValue::Float(0.001)),
            ("layers".to_string(), ParamValue::Int(12)),
        ]),
        user: "bench".to_string(),
        host: String::new(),
        command: "train.py".to_string(),
        config: Config::default(),
        path: Some(".".to_string()),
        python_packages: BTreeMap::new(),
        python_version: "3.11.4".to_string(),
        keepsake_version: env!("CARGO_PKG_VERSION").to_string(),
        checkpoints: (0..checkpoints)
            .map(|step| Checkpoint {
                id: random_id(),
                created: time::now(),
                path: Some("weights".to_string()),
                metrics: BTreeMap::from([(
                    "loss".to_string(),
                    ParamValue::Float(1.0 / (step + 1) as f64),
                )]),
                primary_metric: Some(PrimaryMetric {
                    name: "loss".to_string(),
                    goal: Goal::Minimize,
                }),
                step: Some(step as i64),
                experiment_id: id.clone(),
            })
            .collect(),
    }
}

fn store(dir: &TempDir) -> MetadataStore {
    let repository: Arc<dyn Repository> = Arc::new(DiskRepository::new(dir.path(), 8));
    MetadataStore::new(repository, 16)
}

fn save_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("save_experiment");

    for checkpoints in [0, 100, 1_000] {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let record = experiment(checkpoints);

        group.bench_with_input(
            BenchmarkId::from_parameter(checkpoints),
            &record,
            |b, record| {
                b.to_async(&rt)
                    .iter(|| async { store.save_experiment(record).await.unwrap() });
            },
        );
    }

    group.finish();
}

fn list_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("list_experiments");
    group.sample_size(20);

    for count in [10, 100, 500] {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        rt.block_on(async {
            for _ in 0..count {
                store.save_experiment(&experiment(20)).await.unwrap();
            }
        });

        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.to_async(&rt).iter(|| async {
                let experiments = store.list_experiments().await.unwrap();
                assert_eq!(experiments.len(), count);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, save_benchmark, list_benchmark);
criterion_main!(benches);
