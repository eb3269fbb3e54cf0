//! Benchmarks for kiln core operations.
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use kiln::core::graph::OutputGraph;
use kiln::core::types::{OutputResource, OutputResourceType, Provider, ResourceIdentity};
use kiln::tripwire::hasher;
use serde_json::json;

/// A chain of `n` output resources, each depending on the previous one.
fn chain(n: usize) -> Vec<OutputResource> {
    (0..n)
        .map(|i| OutputResource {
            local_id: format!("bench/node-{}", i),
            resource_type: OutputResourceType {
                kind: "Microsoft.Cache/redis".into(),
                provider: Provider::Azure,
            },
            identity: ResourceIdentity::Arm {
                id: format!(
                    "/subscriptions/s/resourceGroups/g/providers/Microsoft.Cache/redis/c{}",
                    i
                ),
            },
            radius_managed: i % 2 == 0,
            dependencies: if i == 0 {
                Vec::new()
            } else {
                vec![format!("bench/node-{}", i - 1)]
            },
            resource: json!({"sku": "Basic", "index": i}),
        })
        .collect()
}

fn bench_graph_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("graph_build");
    for n in [10, 100, 1000] {
        let nodes = chain(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &nodes, |b, nodes| {
            b.iter(|| {
                let g = OutputGraph::build(black_box(nodes.clone())).unwrap();
                black_box(g.order_ids().len());
            });
        });
    }
    group.finish();
}

fn bench_graph_waves(c: &mut Criterion) {
    let g = OutputGraph::build(chain(500)).unwrap();
    c.bench_function("graph_waves_500", |b| {
        b.iter(|| black_box(g.waves()));
    });
}

fn bench_hash_output_resource(c: &mut Criterion) {
    let nodes = chain(1);
    c.bench_function("hash_output_resource", |b| {
        b.iter(|| black_box(hasher::hash_output_resource(black_box(&nodes[0]))));
    });
}

fn bench_manifest_parse(c: &mut Criterion) {
    let yaml = r#"
version: "1.0"
environment: bench
runtime:
  kind: kubernetes
  namespace: bench
recipes:
  - name: default
    resource_type: Applications.Datastores/mongoDatabases
    driver: terraform
    template_path: Azure/cosmos/azurerm
resources:
  - name: cache
    type: Applications.Datastores/redisCaches
    provisioning: manual
    properties:
      resource: /subscriptions/s/resourceGroups/g/providers/Microsoft.Cache/redis/c1
  - name: docs
    type: Applications.Datastores/mongoDatabases
"#;
    c.bench_function("manifest_parse", |b| {
        b.iter(|| {
            let m = kiln::core::parser::parse_manifest(black_box(yaml)).unwrap();
            black_box(kiln::core::parser::validate_manifest(&m));
        });
    });
}

criterion_group!(
    benches,
    bench_graph_build,
    bench_graph_waves,
    bench_hash_output_resource,
    bench_manifest_parse
);
criterion_main!(benches);
