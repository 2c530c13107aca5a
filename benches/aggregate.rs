use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use gnomestep::{
    aggregate, merge_step_outputs, ActiveModel, InMemorySessionRegistry, MissingFieldPolicy,
    OrchestratorConfig, ReferenceModel, ReferenceModelConfig, ReferenceUncertainty, SessionId,
    SessionRegistry, StepOrchestrator, StepOutput, StepTimings, WeatheringRecord,
};

const FIELDS: [&str; 8] = [
    "amount_released",
    "beached",
    "dissolution",
    "evaporated",
    "floating",
    "natural_dispersion",
    "off_maps",
    "sedimentation",
];

fn record(step: u32, scale: f64) -> WeatheringRecord {
    let ts = NaiveDate::from_ymd_opt(2014, 8, 6)
        .and_then(|d| d.and_hms_opt(8, 0, 0))
        .unwrap();
    FIELDS
        .iter()
        .enumerate()
        .fold(WeatheringRecord::new(step, ts), |r, (i, name)| {
            r.with_field(*name, scale * f64::from(u32::try_from(i).unwrap() + step))
        })
}

fn replicas(count: usize) -> Vec<WeatheringRecord> {
    (0..count)
        .map(|i| record(10, 1.0 + f64::from(u32::try_from(i).unwrap()) * 0.01))
        .collect()
}

fn bench_aggregate(c: &mut Criterion) {
    let nominal = record(10, 1.0);
    let mut group = c.benchmark_group("aggregate");
    for count in [0usize, 4, 16, 64] {
        let uncertain = replicas(count);
        group.throughput(Throughput::Elements(count.max(1) as u64));
        group.bench_with_input(BenchmarkId::new("skip", count), &uncertain, |b, uncertain| {
            b.iter(|| aggregate(&nominal, uncertain, MissingFieldPolicy::Skip).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("reject", count), &uncertain, |b, uncertain| {
            b.iter(|| aggregate(&nominal, uncertain, MissingFieldPolicy::Reject).unwrap());
        });
    }
    group.finish();
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_step_outputs");
    group.throughput(Throughput::Elements(1));
    group.bench_function("16_replicas", |b| {
        b.iter_batched(
            || {
                let nominal = StepOutput::weathering(record(10, 1.0));
                let uncertain: Vec<StepOutput> =
                    replicas(16).into_iter().map(StepOutput::weathering).collect();
                (nominal, uncertain)
            },
            |(nominal, uncertain)| {
                merge_step_outputs(
                    nominal,
                    uncertain,
                    MissingFieldPolicy::Skip,
                    StepTimings {
                        uncertain: Duration::from_millis(3),
                        total: Duration::from_millis(5),
                    },
                )
                .unwrap()
            },
            criterion::BatchSize::SmallInput,
        );
    });
    group.finish();
}

fn bench_step_overhead(c: &mut Criterion) {
    let mut group = c.benchmark_group("step_overhead");
    group.throughput(Throughput::Elements(1));
    group.bench_function("reference_4_replicas", |b| {
        let registry = Arc::new(InMemorySessionRegistry::default());
        let orchestrator =
            StepOrchestrator::new(registry.clone(), OrchestratorConfig::default()).unwrap();
        let config = ReferenceModelConfig {
            num_time_steps: 100_000,
            replicas: 4,
            ..ReferenceModelConfig::default()
        };
        let session = SessionId::new();
        registry
            .set_active_model(
                session,
                ActiveModel::new(
                    Box::new(ReferenceModel::new(config.clone()).unwrap()),
                    Arc::new(ReferenceUncertainty::new(config)),
                ),
            )
            .unwrap();

        b.iter(|| {
            if orchestrator.advance_step(session).is_err() {
                orchestrator.rewind(session).unwrap();
            }
        });
    });
    group.finish();
}

criterion_group!(aggregation, bench_aggregate, bench_merge, bench_step_overhead);
criterion_main!(aggregation);
