//! Benchmarks for airtek-infra core operations.
//!
//! Run with: cargo bench
//!
//! Results include 95% confidence intervals via Criterion.

use airtek_infra::components::stack;
use airtek_infra::core::{parser, resolver, types::Properties};
use airtek_infra::provider::memory::MemoryProvider;
use airtek_infra::tripwire::hasher;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;

const STACK_YAML: &str = r#"
project: air-tek
stack: bench
region: us-east-1
config:
  network:name: bench
  network:vpcRange: 10.1.0.0/16
tagging:
  standard_tags: true
  prefix: air-tek
"#;

fn bench_hash_properties(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash_properties");
    for n in [4, 16, 64] {
        let props: Properties = (0..n)
            .map(|i| {
                (
                    format!("key-{i:03}"),
                    json!({ "cidr": format!("10.1.{i}.0/24"), "zone": i % 2 }),
                )
            })
            .collect();
        group.bench_with_input(BenchmarkId::from_parameter(n), &props, |b, props| {
            b.iter(|| black_box(hasher::hash_properties(black_box(props))));
        });
    }
    group.finish();
}

fn bench_yaml_parse(c: &mut Criterion) {
    c.bench_function("yaml_parse_stack", |b| {
        b.iter(|| {
            let config = parser::parse_config(black_box(STACK_YAML)).unwrap();
            black_box(config);
        });
    });
}

fn bench_compose(c: &mut Criterion) {
    let config = parser::parse_config(STACK_YAML).unwrap();
    let provider = MemoryProvider::new(&config.region);
    c.bench_function("compose_stack", |b| {
        b.iter(|| black_box(stack::compose(black_box(&config), &provider).unwrap()));
    });
}

fn bench_execution_order(c: &mut Criterion) {
    let config = parser::parse_config(STACK_YAML).unwrap();
    let provider = MemoryProvider::new(&config.region);
    let graph = stack::compose(&config, &provider).unwrap();
    c.bench_function("build_execution_order", |b| {
        b.iter(|| black_box(resolver::build_execution_order(black_box(&graph)).unwrap()));
    });
}

criterion_group!(
    benches,
    bench_hash_properties,
    bench_yaml_parse,
    bench_compose,
    bench_execution_order
);
criterion_main!(benches);
