use criterion::{black_box, criterion_group, criterion_main, Criterion};
use viewserver_core::{CellChange, CellValue, GridView, SizeGovernor, ViewId};

fn bench_set_cell(c: &mut Criterion) {
    let view = GridView::new(ViewId::compose("bench", "grid"), 10_000, 100).unwrap();
    let mut i: u32 = 0;

    c.bench_function("set_cell_integer", |b| {
        b.iter(|| {
            i = i.wrapping_add(1);
            view.set_cell(
                black_box(i % 10_000),
                black_box(i % 100),
                CellValue::Integer(i64::from(i)),
            )
            .unwrap();
        })
    });
}

fn bench_all_cells_copy(c: &mut Criterion) {
    let view = GridView::new(ViewId::compose("bench", "snapshot"), 100, 100).unwrap();
    view.seed_demo_pattern();

    c.bench_function("all_cells_10k", |b| {
        b.iter(|| black_box(view.all_cells()))
    });
}

fn bench_split_for_egress(c: &mut Criterion) {
    let governor = SizeGovernor::default();
    let changes: Vec<CellChange> = (0..500)
        .map(|i| CellChange::new(i, 0, CellValue::Number(f64::from(i))))
        .collect();

    c.bench_function("split_500_into_egress", |b| {
        b.iter(|| black_box(governor.split_for_egress(black_box(&changes))))
    });
}

criterion_group!(benches, bench_set_cell, bench_all_cells_copy, bench_split_for_egress);
criterion_main!(benches);
