//! Scenario: centralized greedy load balancing of a skewed load. Rank 0
//! holds half the total load; one balancer run must flatten the
//! distribution, and a follow-up run on the balanced input must migrate
//! nothing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use plenum_test::{init_logger, Cluster};

use plenum::{
    block_map, ByteReader, ByteWriter, Element, ElementEvent, LbStrategy, RuntimeConfig, TimeSec,
    Wire, WireErr,
};

const ELEMENTS: u64 = 128;
const RANKS: u32 = 8;

struct Slab;

impl Element for Slab {
    fn pack(&self, _writer: &mut ByteWriter) {}

    fn unpack(_reader: &mut ByteReader) -> Result<Self, WireErr> {
        Ok(Slab)
    }
}

/// Rank 0's sixteen elements carry half the total load; everyone else's
/// elements are light.
fn load_of(index: u64) -> f64 {
    if block_map(index, ELEMENTS, RANKS).0 == 0 {
        3.5
    } else {
        0.5
    }
}

fn config() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.lb.strategy = LbStrategy::Greedy;
    // fixed fine-grained threshold so the backfill can level precisely
    config.lb.auto_threshold = false;
    config.lb.min_threshold = 0.05;
    config
}

#[test]
fn greedy_lb_flattens_a_skewed_load() {
    init_logger();
    let migrations = Arc::new(AtomicU64::new(0));
    let rank_loads = Arc::new(Mutex::new(HashMap::<u32, f64>::new()));
    let migrations_outer = migrations.clone();
    let rank_loads_outer = rank_loads.clone();

    Cluster::run(RANKS, config(), move |rt| {
        rt.start();
        let proxy = rt
            .make_collective::<Slab>("slabs")
            .bounds(ELEMENTS)
            .mapper(block_map)
            .constructor(|_| Slab)
            .bulk_insert(rt);

        let migrations = migrations_outer.clone();
        rt.register_element_listener(proxy, move |_rt, event, _index, _node| {
            if event == ElementEvent::MigratedIn {
                migrations.fetch_add(1, Ordering::SeqCst);
            }
        });

        // phase 0: the skewed load
        for index in rt.local_elements(proxy) {
            rt.record_load(proxy, index, TimeSec(load_of(index)));
        }
        rt.next_phase_collective();

        let moved_after_first = migrations_outer.load(Ordering::SeqCst);
        assert!(moved_after_first > 0, "skewed input must migrate something");

        let local_load: f64 = rt.local_elements(proxy).iter().map(|&i| load_of(i)).sum();
        rank_loads_outer
            .lock()
            .unwrap()
            .insert(rt.node().0, local_load);
        rt.barrier();

        if rt.node().0 == 0 {
            let loads = rank_loads_outer.lock().unwrap();
            let max = loads.values().copied().fold(0.0, f64::max);
            let avg: f64 = loads.values().sum::<f64>() / loads.len() as f64;
            assert!(
                max / avg < 1.05,
                "post-migration imbalance too high: max={max}, avg={avg}"
            );
        }

        // phase 1: the now-balanced load; the balancer must skip
        for index in rt.local_elements(proxy) {
            rt.record_load(proxy, index, TimeSec(load_of(index)));
        }
        rt.next_phase_collective();
        assert_eq!(
            migrations_outer.load(Ordering::SeqCst),
            moved_after_first,
            "a balanced input must not migrate"
        );
        rt.finalize();
    });
}
