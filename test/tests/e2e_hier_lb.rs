//! Scenario: hierarchical balancer with the one-each extract strategy on
//! a geometric load distribution over sixteen ranks. One round must cut
//! the imbalance ratio at least in half.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use plenum_test::{init_logger, Cluster};

use plenum::{
    block_map, ByteReader, ByteWriter, Element, LbExtract, LbStrategy, RuntimeConfig, TimeSec,
    Wire, WireErr,
};

const ELEMENTS: u64 = 512;
const RANKS: u32 = 16;

struct Slab;

impl Element for Slab {
    fn pack(&self, _writer: &mut ByteWriter) {}

    fn unpack(_reader: &mut ByteReader) -> Result<Self, WireErr> {
        Ok(Slab)
    }
}

/// Geometric decay by home rank: rank r's elements are 2^-r as heavy as
/// rank 0's.
fn load_of(index: u64) -> f64 {
    let rank = block_map(index, ELEMENTS, RANKS).0;
    (1.0 / 32.0) * 0.5_f64.powi(rank as i32)
}

fn imbalance(loads: &HashMap<u32, f64>) -> f64 {
    let max = loads.values().copied().fold(0.0, f64::max);
    let avg: f64 = loads.values().sum::<f64>() / loads.len() as f64;
    (max - avg) / avg
}

#[test]
fn hierarchical_lb_halves_the_imbalance() {
    init_logger();
    let mut config = RuntimeConfig::default();
    config.lb.strategy = LbStrategy::Hierarchical;
    config.lb.extract = LbExtract::LoadOverOneEach;

    let before = Arc::new(Mutex::new(HashMap::<u32, f64>::new()));
    let after = Arc::new(Mutex::new(HashMap::<u32, f64>::new()));
    let before_outer = before.clone();
    let after_outer = after.clone();

    Cluster::run(RANKS, config, move |rt| {
        rt.start();
        let proxy = rt
            .make_collective::<Slab>("geometric")
            .bounds(ELEMENTS)
            .mapper(block_map)
            .constructor(|_| Slab)
            .bulk_insert(rt);

        let pre_load: f64 = rt.local_elements(proxy).iter().map(|&i| load_of(i)).sum();
        before_outer.lock().unwrap().insert(rt.node().0, pre_load);

        for index in rt.local_elements(proxy) {
            rt.record_load(proxy, index, TimeSec(load_of(index)));
        }
        rt.next_phase_collective();

        let post_load: f64 = rt.local_elements(proxy).iter().map(|&i| load_of(i)).sum();
        after_outer.lock().unwrap().insert(rt.node().0, post_load);
        rt.barrier();

        if rt.node().0 == 0 {
            let before = before_outer.lock().unwrap();
            let after = after_outer.lock().unwrap();
            let pre = imbalance(&before);
            let post = imbalance(&after);
            assert!(
                post <= pre / 2.0,
                "one hierarchical round must halve the imbalance: pre={pre:.3}, post={post:.3}"
            );
        }
        rt.finalize();
    });
}
