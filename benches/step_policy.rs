//! Criterion benchmarks for step enumeration and step-file naming.
//!
//! The sequencer asks the policy for one step at a time, so `parameters_at` and
//! `step_path` sit on the per-step path; `values` is what previews and dry runs
//! call for the whole sweep.
//!
//! Run with: cargo bench --bench step_policy

use chrono::NaiveDate;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use lab_daq::experiment::{OutputNaming, StepPolicy, SuffixMode};

fn policies() -> Vec<(&'static str, StepPolicy)> {
    vec![
        (
            "linear_1k",
            StepPolicy::LinearSweep {
                start: -1.0,
                stop: 1.0,
                step: 0.002,
            },
        ),
        (
            "log_6_decades",
            StepPolicy::LogSweep {
                start: 1e-9,
                stop: 1e-3,
                points_per_decade: 100,
            },
        ),
        (
            "ramp_300",
            StepPolicy::TemperatureRamp {
                start: 4.0,
                stop: 304.0,
                step: 1.0,
            },
        ),
    ]
}

fn policy_values(c: &mut Criterion) {
    let mut group = c.benchmark_group("policy_values");
    for (name, policy) in policies() {
        group.bench_with_input(BenchmarkId::from_parameter(name), &policy, |b, policy| {
            b.iter(|| black_box(policy.values()))
        });
    }
    group.finish();
}

fn per_step_parameters(c: &mut Criterion) {
    let policy = StepPolicy::LogSweep {
        start: 1e-9,
        stop: 1e-3,
        points_per_decade: 100,
    };
    let count = policy.count();
    c.bench_function("parameters_at", |b| {
        let mut index = 0;
        b.iter(|| {
            index = (index + 1) % count;
            black_box(policy.parameters_at(black_box(index)))
        })
    });
}

fn step_file_names(c: &mut Criterion) {
    let naming = OutputNaming::new("/data", "S1", "iv").with_value_label("V");
    let params = StepPolicy::LinearSweep {
        start: 0.0,
        stop: 1.0,
        step: 0.25,
    }
    .parameters_at(2)
    .unwrap_or_default();
    let started = NaiveDate::from_ymd_opt(2024, 1, 31)
        .and_then(|d| d.and_hms_micro_opt(14, 5, 9, 123_456))
        .unwrap_or_default();

    let mut group = c.benchmark_group("step_path");
    for mode in [SuffixMode::Counter, SuffixMode::StepValue, SuffixMode::Timestamp] {
        group.bench_with_input(BenchmarkId::from_parameter(format!("{mode:?}")), &mode, |b, mode| {
            b.iter(|| black_box(naming.step_path(*mode, 2, &params, started)))
        });
    }
    group.finish();
}

criterion_group!(benches, policy_values, per_step_parameters, step_file_names);
criterion_main!(benches);
