//! Session runtime benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use futures::future::join_all;
use rscx_core::{ChartDefinition, Event, EventName};
use rscx_runtime::{Config, DispatchRouter, SessionOptions};
use std::sync::Arc;
use tokio::runtime::Runtime;

fn setup_router() -> Arc<DispatchRouter> {
    let mut config = Config::default();
    config.session.idle_timeout_ms = 0;
    let router = DispatchRouter::new(config).unwrap();

    let chart = serde_json::json!({
        "datamodel": [{"id": "count", "value": 0}],
        "states": [
            {"id": "counting", "transitions": [
                {"event": "inc", "actions": [{"assign": {"location": "count", "expr": "count + 1"}}]},
                {"event": "stop", "target": "done"}
            ]},
            {"id": "done", "type": "final", "donedata": {"expr": "count"}}
        ]
    });
    let model = ChartDefinition::from_json(&chart)
        .unwrap()
        .compile()
        .unwrap();
    router.register_chart("counter", model);
    router
}

fn event(name: &str) -> Event {
    Event::external(EventName::parse(name).unwrap())
}

fn bench_session_lifecycle(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let router = setup_router();

    c.bench_function("session_start_stop", |b| {
        b.to_async(&rt).iter(|| async {
            let session = router
                .create_session("counter", SessionOptions::default())
                .unwrap();
            session.start().await.unwrap();
            session.send(event("stop")).unwrap();
            black_box(session.result().await.unwrap())
        });
    });
}

fn bench_mailbox_throughput(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let router = setup_router();
    let mut group = c.benchmark_group("session_mailbox");

    for count in [100usize, 1000, 10_000] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.to_async(&rt).iter(|| async {
                let session = router
                    .create_session("counter", SessionOptions::default())
                    .unwrap();
                session.start().await.unwrap();
                for _ in 0..count {
                    session.send(event("inc")).unwrap();
                }
                session.send(event("stop")).unwrap();
                black_box(session.result().await.unwrap())
            });
        });
    }

    group.finish();
}

fn bench_concurrent_sessions(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let router = setup_router();
    let mut group = c.benchmark_group("concurrent_sessions");

    for sessions in [10usize, 100] {
        group.throughput(Throughput::Elements(sessions as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(sessions),
            &sessions,
            |b, &sessions| {
                b.to_async(&rt).iter(|| async {
                    let runs = (0..sessions).map(|_| {
                        let router = Arc::clone(&router);
                        async move {
                            let session = router
                                .create_session("counter", SessionOptions::default())
                                .unwrap();
                            session.start().await.unwrap();
                            for _ in 0..10 {
                                session.send(event("inc")).unwrap();
                            }
                            session.send(event("stop")).unwrap();
                            session.result().await.unwrap()
                        }
                    });
                    black_box(join_all(runs).await)
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_session_lifecycle,
    bench_mailbox_throughput,
    bench_concurrent_sessions
);
criterion_main!(benches);
