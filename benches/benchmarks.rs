//! Performance benchmarks for Agentrun.
//!
//! This module contains benchmarks for:
//! - Requirement parsing with growing documents
//! - Worker ranking with and without performance history
//! - Task graph planning and wave computation
//! - Error signature normalization
//!
//! Run with: `cargo bench`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use agentrun::workflow::{
    execution_waves, normalize_signature, DocumentFormat, PerformanceHistory, PlanBuilder,
    RequirementParser, WorkerDescriptor, WorkerSelector,
};

// ============================================================================
// Fixtures
// ============================================================================

mod fixtures {
    use std::fmt::Write;

    const DESCRIPTIONS: [&str; 8] = [
        "REST API endpoint for orders",
        "Checkout page with responsive layout",
        "Database migration for the users table",
        "Unit and integration test coverage",
        "Deploy pipeline to the staging cluster",
        "Encrypt stored tokens and audit logins",
        "Cache hot product queries",
        "Write the onboarding documentation",
    ];

    /// A YAML document with `n` features, each depending on the previous one
    /// every third entry.
    pub fn requirements_yaml(n: usize) -> String {
        let mut doc = String::from("project: bench\nfeatures:\n");
        for i in 0..n {
            let _ = writeln!(doc, "  - description: \"{} #{i}\"", DESCRIPTIONS[i % DESCRIPTIONS.len()]);
            if i % 3 == 2 {
                let _ = writeln!(doc, "    depends_on: [REQ-{i:03}]");
            }
        }
        doc.push_str("technical:\n  - \"Keep p99 latency under 200ms\"\n");
        doc
    }
}

// ============================================================================
// Parser Benchmarks
// ============================================================================

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");
    let parser = RequirementParser::new();

    for n in &[10usize, 100, 500] {
        let doc = fixtures::requirements_yaml(*n);
        group.throughput(Throughput::Elements(*n as u64));
        group.bench_with_input(BenchmarkId::new("yaml", n), &doc, |b, doc| {
            b.iter(|| parser.parse_str(black_box(doc), DocumentFormat::Yaml).unwrap());
        });
    }
    group.finish();
}

// ============================================================================
// Selector Benchmarks
// ============================================================================

fn bench_select(c: &mut Criterion) {
    let mut group = c.benchmark_group("select");
    let workers = WorkerDescriptor::builtin_roster();
    let plain = WorkerSelector::new();

    let mut history = PerformanceHistory::new();
    for worker in &workers {
        for tag in &worker.tags {
            for i in 0..10 {
                history.record(&worker.id, tag, i % 4 != 0);
            }
        }
    }
    let informed = WorkerSelector::new().with_history(history);

    let description = "REST API endpoint with database migration and integration tests";
    group.bench_function("categorize", |b| {
        b.iter(|| plain.categorize(black_box(description)));
    });

    let categories = plain.categorize(description);
    group.bench_function("rank", |b| {
        b.iter(|| plain.rank(black_box(&categories), &workers));
    });
    group.bench_function("rank_with_history", |b| {
        b.iter(|| informed.rank(black_box(&categories), &workers));
    });
    group.finish();
}

// ============================================================================
// Planning Benchmarks
// ============================================================================

fn bench_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan");
    let parser = RequirementParser::new();
    let builder = PlanBuilder::new(WorkerDescriptor::builtin_roster());

    for n in &[10usize, 100, 500] {
        let parsed = parser.parse_str(&fixtures::requirements_yaml(*n), DocumentFormat::Yaml).unwrap();
        group.throughput(Throughput::Elements(*n as u64));
        group.bench_with_input(BenchmarkId::new("build", n), &parsed, |b, parsed| {
            b.iter(|| builder.build(black_box(parsed.clone())).unwrap());
        });

        let state = builder.build(parsed).unwrap();
        group.bench_with_input(BenchmarkId::new("waves", n), &state.tasks, |b, tasks| {
            b.iter(|| execution_waves(black_box(tasks)));
        });
    }
    group.finish();
}

// ============================================================================
// Escalation Benchmarks
// ============================================================================

fn bench_signature(c: &mut Criterion) {
    let message = "Connection to 10.0.0.12:5432 refused after 3 attempts (request 8f14e45f-ea7b-4c2b-9a1b-0c6d1f3e2a11) at /srv/app/db.rs:118";
    c.bench_function("normalize_signature", |b| {
        b.iter(|| normalize_signature(black_box(message)));
    });
}

criterion_group!(benches, bench_parse, bench_select, bench_plan, bench_signature);
criterion_main!(benches);
