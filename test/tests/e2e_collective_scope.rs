//! Scenario: sequenced collective scopes under reordered delivery. Every
//! process must execute the scope's planned operations in the same global
//! order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use plenum_test::{init_logger, Cluster};

use plenum::RuntimeConfig;

#[test]
fn scope_operations_run_in_agreed_order() {
    init_logger();
    let executed = Arc::new(Mutex::new(HashMap::<u32, Vec<u64>>::new()));
    let executed_outer = executed.clone();

    Cluster::run_scrambled(4, RuntimeConfig::default(), move |rt| {
        rt.start();
        let scope = rt.make_collective_scope(Some(9));

        let mut last_tag = 0;
        for _ in 0..3 {
            let executed = executed_outer.clone();
            last_tag = rt.mpi_collective_async(scope, move |rt| {
                let rank = rt.node().0;
                let mut executed = executed.lock().unwrap();
                let sequence = executed.entry(rank).or_default();
                let next = sequence.len() as u64;
                sequence.push(next);
            });
        }
        rt.wait_collective(scope, last_tag);
        assert!(rt.is_collective_done(scope, last_tag));
        rt.finalize();
    });

    let executed = executed.lock().unwrap();
    assert_eq!(executed.len(), 4);
    for sequence in executed.values() {
        // tags ran in ascending order on every rank: same global order
        assert_eq!(*sequence, vec![0, 1, 2]);
    }
}

#[test]
fn wait_inside_an_epoch_holds_the_epoch_open() {
    init_logger();
    Cluster::run(2, RuntimeConfig::default(), |rt| {
        rt.start();
        let scope = rt.make_collective_scope(None);
        rt.run_in_epoch_collective("scoped-op", move |rt| {
            rt.mpi_collective_wait(scope, |_| {});
        });
        rt.finalize();
    });
}
