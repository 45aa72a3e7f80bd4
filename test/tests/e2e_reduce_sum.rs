//! Scenario: sum reduction of doubles over eight ranks, on a fabric that
//! reorders delivery. Expected root result: 0 + 1 + ... + 7 = 28.0.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use plenum_test::{init_logger, Cluster};

use plenum::{NodeId, ReduceAction, ReduceScope, RuntimeConfig};

#[test]
fn reduce_sum_of_ranks() {
    init_logger();
    let result = Arc::new(Mutex::new(None::<f64>));
    let done = Arc::new(AtomicBool::new(false));
    let result_outer = result.clone();
    let done_outer = done.clone();

    Cluster::run_scrambled(8, RuntimeConfig::default(), move |rt| {
        let plus = rt.register_op::<f64>("test.plus.f64", |a, b| a + b);
        rt.start();

        let value = rt.node().0 as f64;
        let result = result_outer.clone();
        let done = done_outer.clone();
        rt.reduce::<f64>(
            ReduceScope::UserId(7),
            None,
            plus,
            NodeId(0),
            &value,
            ReduceAction::Callback(Box::new(move |_rt, combined| {
                let sum = plenum_wire::from_bytes::<f64>(combined).unwrap();
                *result.lock().unwrap() = Some(sum);
                done.store(true, Ordering::SeqCst);
            })),
        );

        let done = done_outer.clone();
        rt.run_scheduler_while(move |_| !done.load(Ordering::SeqCst));
        if rt.node() == NodeId(0) {
            assert_eq!(result_outer.lock().unwrap().unwrap(), 28.0);
        }
        rt.finalize();
    });
}

#[test]
fn reduce_to_a_nonzero_root() {
    init_logger();
    let done = Arc::new(AtomicBool::new(false));
    let root_saw = Arc::new(AtomicU32::new(u32::MAX));
    let done_outer = done.clone();
    let root_saw_outer = root_saw.clone();

    Cluster::run(4, RuntimeConfig::default(), move |rt| {
        let max = rt.register_op::<u64>("test.max.u64", |a, b| a.max(b));
        rt.start();

        let value = rt.node().0 as u64;
        let done = done_outer.clone();
        let root_saw = root_saw_outer.clone();
        rt.reduce::<u64>(
            ReduceScope::UserId(11),
            None,
            max,
            NodeId(2),
            &value,
            ReduceAction::Callback(Box::new(move |rt, combined| {
                // fires on the chosen root only
                assert_eq!(rt.node(), NodeId(2));
                root_saw.store(
                    plenum_wire::from_bytes::<u64>(combined).unwrap() as u32,
                    Ordering::SeqCst,
                );
                done.store(true, Ordering::SeqCst);
            })),
        );

        let done = done_outer.clone();
        rt.run_scheduler_while(move |_| !done.load(Ordering::SeqCst));
        rt.finalize();
    });
    assert_eq!(root_saw.load(Ordering::SeqCst), 3);
}

#[test]
fn sequenced_reductions_deliver_in_stamp_order() {
    init_logger();
    let order = Arc::new(Mutex::new(Vec::<u64>::new()));
    let done = Arc::new(AtomicBool::new(false));
    let order_outer = order.clone();
    let done_outer = done.clone();

    Cluster::run_scrambled(4, RuntimeConfig::default(), move |rt| {
        let plus = rt.register_op::<u64>("test.plus.u64", |a, b| a + b);
        rt.start();

        for round in 0..4u64 {
            let order = order_outer.clone();
            let done = done_outer.clone();
            rt.reduce::<u64>(
                ReduceScope::UserId(3),
                None,
                plus,
                NodeId(0),
                &round,
                ReduceAction::Callback(Box::new(move |_rt, combined| {
                    let sum = plenum_wire::from_bytes::<u64>(combined).unwrap();
                    let mut order = order.lock().unwrap();
                    order.push(sum);
                    if order.len() == 4 {
                        done.store(true, Ordering::SeqCst);
                    }
                })),
            );
        }

        let done = done_outer.clone();
        rt.run_scheduler_while(move |_| !done.load(Ordering::SeqCst));
        rt.finalize();
    });
    // round r sums to 4r; root actions fired in stamp order
    assert_eq!(*order.lock().unwrap(), vec![0, 4, 8, 12]);
}
