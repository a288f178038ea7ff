use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use factsync::prelude::*;
use factsync::invert;
use std::time::Duration;
use tokio::runtime::Runtime;

fn list() -> JsonValue {
    json!({ "type": "List", "name": "Groceries" })
}

fn task(i: usize) -> JsonValue {
    json!({ "type": "Task", "description": format!("item{}", i), "list": list() })
}

fn uncompleted_tasks_in_list(l: Placeholder) -> Specification {
    matching(Template::of_type("Task").with("list", l.has_type("List")))
        .such_that(|t| not_exists(Template::of_type("Completion").with("task", t)))
}

/// Benchmark: Inverting a query with a negative condition
fn bench_invert(c: &mut Criterion) {
    let query = Preposition::for_template(uncompleted_tasks_in_list)
        .unwrap()
        .into_query();

    c.bench_function("invert_uncompleted", |b| {
        b.iter(|| black_box(invert(black_box(&query))))
    });
}

/// Benchmark: Saving a fact with no watches registered
fn bench_fact_unwatched(c: &mut Criterion) {
    c.bench_function("fact_unwatched", |b| {
        b.to_async(Runtime::new().unwrap()).iter(|| async {
            let coordinator = Coordinator::in_memory();
            black_box(coordinator.fact(&task(0)).await.unwrap())
        })
    });
}

/// Benchmark: One saved fact fanning out to many watches
fn bench_fact_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("fact_fanout");

    for watches in [1, 10, 100] {
        group.throughput(Throughput::Elements(watches as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(watches),
            &watches,
            |b, &watches| {
                b.to_async(Runtime::new().unwrap()).iter(|| async move {
                    let coordinator = Coordinator::in_memory();
                    let groceries = coordinator.fact(&list()).await.unwrap();
                    for _ in 0..watches {
                        coordinator
                            .watch_template(&groceries, uncompleted_tasks_in_list, |_| {}, |_| {})
                            .await
                            .unwrap();
                    }
                    black_box(coordinator.fact(&task(1)).await.unwrap())
                });
            },
        );
    }

    group.finish();
}

/// Benchmark: Seeding a watch over a populated list
fn bench_seed(c: &mut Criterion) {
    let mut group = c.benchmark_group("seed");

    for tasks in [10, 100] {
        group.throughput(Throughput::Elements(tasks as u64));
        group.bench_with_input(BenchmarkId::from_parameter(tasks), &tasks, |b, &tasks| {
            b.to_async(Runtime::new().unwrap()).iter(|| async move {
                let coordinator = Coordinator::in_memory();
                let groceries = coordinator.fact(&list()).await.unwrap();
                for i in 0..tasks {
                    coordinator.fact(&task(i)).await.unwrap();
                }
                let handle = coordinator
                    .watch_template(&groceries, uncompleted_tasks_in_list, |_| {}, |_| {})
                    .await
                    .unwrap();
                handle.stop();
            });
        });
    }

    group.finish();
}

criterion_group! {
    name = benches;
    config = Criterion::default().measurement_time(Duration::from_secs(5));
    targets = bench_invert, bench_fact_unwatched, bench_fact_fanout, bench_seed
}
criterion_main!(benches);
