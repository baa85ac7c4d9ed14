//! Benchmarks for list line classification and merging.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use pbr_keeper::classify::{parse_entries, ParsedList};
use std::hint::black_box;

/// Mixed list content: addresses, CIDRs, domains, comments and junk.
fn generate_list(count: usize) -> String {
    (0..count)
        .map(|i| match i % 5 {
            0 => format!("{}.{}.{}.1\n", i % 223 + 1, (i / 256) % 256, i % 256),
            1 => format!("{}.{}.0.0/16\n", i % 223 + 1, (i / 256) % 256),
            2 => format!("host{}.example.com\n", i),
            3 => format!("2001:db8:{:x}::/48\n", i % 65536),
            _ => "# comment\n".to_string(),
        })
        .collect()
}

fn bench_parse_entries(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_entries");

    for size in [100, 1000, 10000, 50000] {
        let content = generate_list(size);
        group.bench_with_input(BenchmarkId::new("mixed", size), &content, |b, content| {
            b.iter(|| black_box(parse_entries(content, "#")));
        });
    }

    // Second half is all duplicates
    let doubled = generate_list(10000).repeat(2);
    group.bench_function("duplicates_20000", |b| {
        b.iter(|| black_box(parse_entries(&doubled, "#")));
    });

    group.finish();
}

fn bench_extend_unique(c: &mut Criterion) {
    let mut group = c.benchmark_group("extend_unique");

    for size in [1000, 10000] {
        let first = parse_entries(&generate_list(size), "#");
        let second = parse_entries(&generate_list(size * 2), "#");
        group.bench_with_input(
            BenchmarkId::new("overlapping", size),
            &(first, second),
            |b, (first, second)| {
                b.iter(|| {
                    let mut merged: ParsedList = first.clone();
                    merged.extend_unique(second);
                    black_box(merged)
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_parse_entries, bench_extend_unique);
criterion_main!(benches);
