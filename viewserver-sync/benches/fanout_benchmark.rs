use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use viewserver_core::{CellChange, CellValue, ViewId};
use viewserver_sync::{ChannelHandle, Payload, ServiceConfig, ViewService};

fn bench_fanout_to_subscribers(c: &mut Criterion) {
    let service = ViewService::new(ServiceConfig::default());
    let id = ViewId::compose("bench", "fanout");
    service.create_view(&id, 10_000, 100).unwrap();

    // Receivers are drained in the loop so sends never backlog.
    let mut receivers = Vec::new();
    for _ in 0..20 {
        let (handle, rx) = ChannelHandle::new(1024);
        service.subscriptions().subscribe(&id, handle);
        receivers.push(rx);
    }

    let changes: Vec<CellChange> = (0..120)
        .map(|i| CellChange::new(i, i % 100, CellValue::Number(f64::from(i))))
        .collect();

    c.bench_function("fanout_120_changes_20_subscribers", |b| {
        b.iter(|| {
            black_box(service.fanout().apply(&id, black_box(&changes)).unwrap());
            for rx in receivers.iter_mut() {
                while rx.try_recv().is_ok() {}
            }
        })
    });
}

fn bench_broadcast_payload(c: &mut Criterion) {
    let service = ViewService::new(ServiceConfig::default());
    let id = ViewId::compose("bench", "broadcast");

    let mut receivers = Vec::new();
    for _ in 0..100 {
        let (handle, rx) = ChannelHandle::new(1024);
        service.subscriptions().subscribe(&id, handle);
        receivers.push(rx);
    }
    let payload: Payload = Arc::from("{\"type\":\"CELL_UPDATE\",\"gridId\":\"bench_broadcast\",\"updates\":[]}");

    c.bench_function("broadcast_100_subscribers", |b| {
        b.iter(|| {
            black_box(service.subscriptions().broadcast(&id, &payload));
            for rx in receivers.iter_mut() {
                while rx.try_recv().is_ok() {}
            }
        })
    });
}

criterion_group!(benches, bench_fanout_to_subscribers, bench_broadcast_payload);
criterion_main!(benches);
