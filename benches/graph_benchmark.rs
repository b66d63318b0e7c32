use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use kbflow::budget::{BudgetCapacity, ResourceBudget, ResourceCost};
use kbflow::expr::{ExpressionEnv, ExpressionRegistry};
use kbflow::graph::WorkflowGraph;
use kbflow::models::WorkflowDefinition;
use serde_json::{json, Map, Value};

fn definition(nodes: Vec<Value>, edges: Vec<Value>) -> WorkflowDefinition {
    serde_json::from_value(json!({
        "id": "bench",
        "name": "bench",
        "nodes": nodes,
        "edges": edges,
    }))
    .unwrap()
}

fn edge(source: &str, target: &str) -> Value {
    json!({
        "id": format!("{}_{}", source, target),
        "source": source,
        "target": target,
        "source_output": "value",
        "target_input": format!("from_{}", source),
    })
}

/// n0 -> n1 -> ... : maximum depth, no parallelism
fn linear_chain(count: usize) -> WorkflowDefinition {
    let nodes = (0..count).map(|i| json!({"id": format!("n{}", i), "type": "work"})).collect();
    let edges = (1..count)
        .map(|i| edge(&format!("n{}", i - 1), &format!("n{}", i)))
        .collect();
    definition(nodes, edges)
}

/// root -> w0..wN -> sink : one wide level
fn wide_fanout(width: usize) -> WorkflowDefinition {
    let mut nodes = vec![json!({"id": "root", "type": "input"})];
    let mut edges = Vec::new();
    for i in 0..width {
        let id = format!("w{}", i);
        nodes.push(json!({"id": id, "type": "work"}));
        edges.push(edge("root", &id));
        edges.push(edge(&id, "sink"));
    }
    nodes.push(json!({"id": "sink", "type": "output"}));
    definition(nodes, edges)
}

/// Repeated diamonds: each layer fans out to 4 branches and joins again
fn diamonds(layers: usize) -> WorkflowDefinition {
    let mut nodes = vec![json!({"id": "j0", "type": "input"})];
    let mut edges = Vec::new();
    for layer in 0..layers {
        let join = format!("j{}", layer);
        let next = format!("j{}", layer + 1);
        for branch in 0..4 {
            let id = format!("b{}_{}", layer, branch);
            nodes.push(json!({"id": id, "type": "work"}));
            edges.push(edge(&join, &id));
            edges.push(edge(&id, &next));
        }
        nodes.push(json!({"id": next, "type": "work"}));
    }
    definition(nodes, edges)
}

/// Building validates acyclicity, ports and expressions in one pass
fn bench_graph_build(c: &mut Criterion) {
    let expressions = ExpressionRegistry::new();
    let mut group = c.benchmark_group("graph_build");

    for size in [10, 100, 500, 1000] {
        let def = linear_chain(size);
        group.bench_with_input(BenchmarkId::new("linear", size), &def, |b, def| {
            b.iter(|| WorkflowGraph::build(black_box(def), &expressions).unwrap());
        });
    }

    for width in [10, 100, 500] {
        let def = wide_fanout(width);
        group.bench_with_input(BenchmarkId::new("fanout", width), &def, |b, def| {
            b.iter(|| WorkflowGraph::build(black_box(def), &expressions).unwrap());
        });
    }

    group.finish();
}

fn bench_parallel_levels(c: &mut Criterion) {
    let expressions = ExpressionRegistry::new();
    let mut group = c.benchmark_group("parallel_levels");

    for layers in [5, 25, 100] {
        let graph = WorkflowGraph::build(&diamonds(layers), &expressions).unwrap();
        group.bench_with_input(BenchmarkId::new("diamonds", layers), &graph, |b, graph| {
            b.iter(|| black_box(graph.parallel_levels()));
        });
    }

    let graph = WorkflowGraph::build(&linear_chain(1000), &expressions).unwrap();
    group.bench_function("topological_order_1000", |b| {
        b.iter(|| black_box(graph.topological_order().unwrap()));
    });

    group.finish();
}

fn bench_budget(c: &mut Criterion) {
    let mut group = c.benchmark_group("budget");
    let budget = ResourceBudget::new(BudgetCapacity::default());
    let cost = ResourceCost::for_type("llm");

    group.bench_function("reserve_release", |b| {
        b.iter(|| {
            assert!(budget.try_reserve(black_box(&cost)));
            budget.release(black_box(&cost));
        });
    });

    // Rejections are the common case under saturation
    let saturated = ResourceBudget::new(BudgetCapacity {
        cpu: 1.0,
        memory: 1024.0,
        network: 100.0,
    });
    group.bench_function("reject_when_full", |b| {
        b.iter(|| assert!(!saturated.try_reserve(black_box(&cost))));
    });

    group.finish();
}

fn bench_edge_condition(c: &mut Criterion) {
    let expressions = ExpressionRegistry::new();
    let value = json!(3);
    let mut output = Map::new();
    output.insert("status_code".to_string(), json!(200));
    let mut context = Map::new();
    context.insert("docs_retrieved".to_string(), json!(3));
    context.insert("embedding_generated".to_string(), json!(true));
    let input = Map::new();
    let env = ExpressionEnv {
        value: &value,
        output: &output,
        context: &context,
        input: &input,
    };

    let mut group = c.benchmark_group("edge_condition");
    for expression in [
        "context.docs_retrieved > 0",
        "output.status_code == 200 && context.embedding_generated",
        "(context.embedding_generated)|not",
    ] {
        group.bench_with_input(BenchmarkId::from_parameter(expression), expression, |b, expression| {
            b.iter(|| expressions.evaluate_bool(black_box(expression), &env).unwrap());
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_graph_build,
    bench_parallel_levels,
    bench_budget,
    bench_edge_condition
);
criterion_main!(benches);
