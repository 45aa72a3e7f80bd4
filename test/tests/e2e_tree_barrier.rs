//! Scenario: unnamed tree barrier across four ranks (fan-out 2), plus the
//! zero-work epoch boundary behavior.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use plenum_test::{init_logger, Cluster};

use plenum::RuntimeConfig;

#[test]
fn tree_barrier_on_four_ranks() {
    init_logger();
    let arrived = Arc::new(AtomicU32::new(0));
    let seen = arrived.clone();
    Cluster::run(4, RuntimeConfig::default(), move |rt| {
        rt.start();
        seen.fetch_add(1, Ordering::SeqCst);
        rt.barrier();
        // the barrier released only after every rank arrived
        assert_eq!(seen.load(Ordering::SeqCst), 4);
        rt.finalize();
    });
}

#[test]
fn named_barrier_releases_all_ranks() {
    init_logger();
    let arrived = Arc::new(AtomicU32::new(0));
    let seen = arrived.clone();
    Cluster::run(4, RuntimeConfig::default(), move |rt| {
        rt.start();
        seen.fetch_add(1, Ordering::SeqCst);
        rt.named_barrier(0xBEEF);
        assert_eq!(seen.load(Ordering::SeqCst), 4);
        rt.finalize();
    });
}

#[test]
fn zero_work_epoch_terminates_on_the_first_wave() {
    init_logger();
    Cluster::run(4, RuntimeConfig::default(), |rt| {
        rt.start();
        let epoch = rt.run_in_epoch_collective("noop", |_| {});
        assert!(rt.term_is_terminated(epoch));
        let (produced, consumed) = rt.epoch_counts(epoch);
        assert_eq!(produced, consumed);
        assert_eq!(produced, 0);
        rt.finalize();
    });
}

#[test]
fn sequential_barriers_stay_aligned() {
    init_logger();
    let arrived = Arc::new(AtomicU32::new(0));
    let seen = arrived.clone();
    Cluster::run(3, RuntimeConfig::default(), move |rt| {
        rt.start();
        for round in 1..=4u32 {
            seen.fetch_add(1, Ordering::SeqCst);
            rt.barrier();
            assert!(seen.load(Ordering::SeqCst) >= round * 3);
        }
        rt.finalize();
    });
}
