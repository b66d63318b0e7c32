use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use kbflow::engine::{ExecuteOptions, WorkflowEngine};
use kbflow::models::{ExecutionStatus, WorkflowDefinition};
use kbflow::runner::{NodeRegistry, PassthroughExecutor, PortMap};
use kbflow::scheduler::CheckpointPolicy;
use kbflow::state::StateStore;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::runtime::Runtime;

fn definition(nodes: Vec<Value>, edges: Vec<Value>, parallel: bool) -> WorkflowDefinition {
    serde_json::from_value(json!({
        "id": "bench",
        "name": "bench",
        "global_config": {
            "enable_parallel_execution": parallel,
            "max_parallel_workers": 16
        },
        "nodes": nodes,
        "edges": edges,
    }))
    .unwrap()
}

fn edge(source: &str, target: &str, input: &str) -> Value {
    json!({
        "id": format!("{}_{}", source, target),
        "source": source,
        "target": target,
        "source_output": "value",
        "target_input": input,
    })
}

fn chain(count: usize) -> WorkflowDefinition {
    let nodes = (0..count).map(|i| json!({"id": format!("n{}", i), "type": "pass"})).collect();
    let edges = (1..count)
        .map(|i| edge(&format!("n{}", i - 1), &format!("n{}", i), "value"))
        .collect();
    definition(nodes, edges, true)
}

fn fanout(width: usize, parallel: bool) -> WorkflowDefinition {
    let mut nodes = vec![json!({"id": "root", "type": "input"})];
    let mut edges = Vec::new();
    for i in 0..width {
        let id = format!("w{}", i);
        nodes.push(json!({"id": id, "type": "pass"}));
        edges.push(edge("root", &id, "value"));
        edges.push(edge(&id, "merge", &format!("from_{}", id)));
    }
    nodes.push(json!({"id": "merge", "type": "output"}));
    definition(nodes, edges, parallel)
}

fn engine(store: StateStore) -> WorkflowEngine {
    let mut registry = NodeRegistry::with_builtins();
    registry.register("pass", PassthroughExecutor);
    WorkflowEngine::builder(store).registry(registry).build().unwrap()
}

fn input() -> PortMap {
    json!({"value": "payload"}).as_object().cloned().unwrap()
}

/// Scheduling overhead with trivial nodes and an in-memory store
fn bench_chain(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let engine = {
        let _guard = rt.enter();
        engine(StateStore::in_memory().unwrap())
    };
    let mut group = c.benchmark_group("chain");

    for size in [3, 10, 50] {
        let def = chain(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &def, |b, def| {
            b.to_async(&rt).iter(|| async {
                let ctx = engine
                    .execute_workflow(black_box(def), input(), ExecuteOptions::default())
                    .await
                    .unwrap();
                assert_eq!(ctx.status, ExecutionStatus::Completed);
            });
        });
    }

    group.finish();
}

fn bench_fanout(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let engine = {
        let _guard = rt.enter();
        engine(StateStore::in_memory().unwrap())
    };
    let mut group = c.benchmark_group("fanout");

    for width in [4, 16, 64] {
        for parallel in [true, false] {
            let def = fanout(width, parallel);
            let label = if parallel { "parallel" } else { "serial" };
            group.bench_with_input(BenchmarkId::new(label, width), &def, |b, def| {
                b.to_async(&rt).iter(|| async {
                    let ctx = engine
                        .execute_workflow(black_box(def), input(), ExecuteOptions::default())
                        .await
                        .unwrap();
                    assert_eq!(ctx.status, ExecutionStatus::Completed);
                });
            });
        }
    }

    group.finish();
}

/// Cost of checkpointing every step against a database file
fn bench_checkpointed_chain(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let dir = TempDir::new().unwrap();
    let engine = {
        let _guard = rt.enter();
        engine(StateStore::new(dir.path().join("bench.db")).unwrap())
    };
    let def = chain(10);
    let mut group = c.benchmark_group("checkpointed_chain");

    for every in [1, 5] {
        let options = ExecuteOptions {
            checkpoint: Some(CheckpointPolicy::every(every)),
            ..ExecuteOptions::default()
        };
        group.bench_with_input(BenchmarkId::new("every", every), &options, |b, options| {
            b.to_async(&rt).iter(|| async {
                let ctx = engine
                    .execute_workflow(&def, input(), options.clone())
                    .await
                    .unwrap();
                assert_eq!(ctx.status, ExecutionStatus::Completed);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_chain, bench_fanout, bench_checkpointed_chain);
criterion_main!(benches);
