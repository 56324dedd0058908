//! Per-packet dispatch latency benchmarks.
//!
//! Measures:
//! - `select_link` in both selection modes for 2, 4 and 8 links
//! - `select_link` right after a weight publish (credit reset path)
//! - one EWMA rebalance tick over 4 links
//!
//! Run with: cargo bench --package strata-dispatch

use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use strata_dispatch::{
    BitrateConfig, BondingConfig, BondingContext, Dispatcher, PacketContext, RebalanceScheduler,
    SelectionMode,
};

fn context(links: usize) -> Arc<BondingContext> {
    let weights = (0..links).map(|i| 0.5 + i as f64 * 0.25).collect();
    let mut cfg = BondingConfig::with_weights(weights);
    cfg.auto_balance = false;
    BondingContext::new(cfg, BitrateConfig::default()).unwrap()
}

fn bench_select_link(c: &mut Criterion) {
    let mut group = c.benchmark_group("select_link");
    group.throughput(Throughput::Elements(1));
    let pkt = PacketContext::new(1316);

    for links in [2, 4, 8] {
        for (name, mode) in [
            ("swrr", SelectionMode::SmoothWeightedRoundRobin),
            ("random", SelectionMode::WeightedRandom),
        ] {
            let mut d = Dispatcher::with_mode(context(links), mode);
            group.bench_with_input(BenchmarkId::new(name, links), &links, |b, _| {
                b.iter(|| black_box(d.select_link(&pkt).unwrap()));
            });
        }
    }
    group.finish();
}

fn bench_select_after_publish(c: &mut Criterion) {
    let ctx = context(4);
    let mut d = Dispatcher::new(ctx.clone());
    let pkt = PacketContext::new(1316);
    let mut flip = false;

    c.bench_function("select_link_after_publish_4links", |b| {
        b.iter(|| {
            flip = !flip;
            ctx.set_link_weight(3, if flip { 1.0 } else { 1.25 }).unwrap();
            black_box(d.select_link(&pkt).unwrap());
        });
    });
}

fn bench_rebalance_tick(c: &mut Criterion) {
    let cfg = BondingConfig::with_weights(vec![2.0, 1.5, 1.0, 0.5]);
    let ctx = BondingContext::new(cfg, BitrateConfig::default()).unwrap();
    for _ in 0..16 {
        for link in 0..4 {
            ctx.record_sample(link, 30.0 + link as f64 * 15.0, 0.002 * link as f64, 4000.0);
        }
    }
    let mut scheduler = RebalanceScheduler::new(ctx);

    c.bench_function("rebalance_tick_ewma_4links", |b| {
        b.iter(|| black_box(scheduler.tick()));
    });
}

criterion_group!(
    benches,
    bench_select_link,
    bench_select_after_publish,
    bench_rebalance_tick,
);
criterion_main!(benches);
