//! Benchmarks for aggregation throughput.
//!
//! Measures rolling minute records up into hourly and daily windows for a
//! growing number of series.
//!
//! Run with: `cargo bench -p tally -- aggregate`

#![allow(missing_docs)]

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use tally::record::BillingRecord;
use tally::{AggregationPolicy, Aggregator, Range};

const BASE: i64 = 1_700_000_000;

/// One record per minute and pod over `minutes`, with an unrelated label
/// that the policy drops.
fn minute_records(pods: usize, minutes: i64) -> Vec<BillingRecord> {
    let mut records = Vec::with_capacity(pods * usize::try_from(minutes).unwrap_or(0));
    for minute in 0..minutes {
        let start = BASE + minute * 60;
        let range = Range::from_unix_secs(start, start + 60).unwrap();
        for pod in 0..pods {
            records.push(
                BillingRecord::new("cpu", "tenant-a", range, 1.5).with_labels([
                    ("pod", format!("web-{pod}")),
                    ("node", format!("n-{}", pod % 4)),
                ]),
            );
        }
    }
    records
}

fn bench_hourly_rollup(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregate_hour");
    let target = Range::from_unix_secs(BASE, BASE + 3600).unwrap();
    let aggregator = Aggregator::new(AggregationPolicy::new(["pod"]));

    for pods in [1usize, 10, 100] {
        let records = minute_records(pods, 60);
        group.throughput(Throughput::Elements(records.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(pods), &records, |b, records| {
            b.iter(|| aggregator.aggregate(black_box(records), black_box(&target)).unwrap());
        });
    }
    group.finish();
}

fn bench_prorated_window(c: &mut Criterion) {
    // Window edges fall mid-record, so the first and last minutes are prorated.
    let records = minute_records(10, 24 * 60);
    let target = Range::from_unix_secs(BASE + 30, BASE + 24 * 3600 - 30).unwrap();
    let aggregator = Aggregator::new(AggregationPolicy::new(["pod"]));

    c.bench_function("aggregate_day_prorated", |b| {
        b.iter(|| aggregator.aggregate(black_box(&records), black_box(&target)).unwrap());
    });
}

criterion_group!(benches, bench_hourly_rollup, bench_prorated_window);
criterion_main!(benches);
