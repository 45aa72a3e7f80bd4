//! Boundary: a one-process job. Every collective must succeed with zero
//! cross-process messages.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use plenum_test::{init_logger, Cluster};

use plenum::{
    block_map, ByteReader, ByteWriter, Element, LockLevel, NodeId, ReduceAction, ReduceScope,
    RuntimeConfig, TimeSec, Wire, WireErr,
};

struct Lone;

impl Element for Lone {
    fn pack(&self, _writer: &mut ByteWriter) {}

    fn unpack(_reader: &mut ByteReader) -> Result<Self, WireErr> {
        Ok(Lone)
    }
}

struct Group;

#[test]
fn every_collective_works_alone() {
    init_logger();
    let reduced = Arc::new(AtomicBool::new(false));
    let reduced_outer = reduced.clone();

    Cluster::run(1, RuntimeConfig::default(), move |rt| {
        let plus = rt.register_op::<f64>("solo.plus.f64", |a, b| a + b);
        rt.start();

        rt.barrier();

        let reduced = reduced_outer.clone();
        rt.reduce::<f64>(
            ReduceScope::UserId(1),
            None,
            plus,
            NodeId(0),
            &1.25,
            ReduceAction::Callback(Box::new(move |_rt, combined| {
                assert_eq!(plenum_wire::from_bytes::<f64>(combined).unwrap(), 1.25);
                reduced.store(true, Ordering::SeqCst);
            })),
        );
        assert!(reduced_outer.load(Ordering::SeqCst));

        let epoch = rt.run_in_epoch_collective("solo", |_| {});
        assert!(rt.term_is_terminated(epoch));

        let proxy = rt
            .make_collective::<Lone>("solo-collection")
            .bounds(3)
            .mapper(block_map)
            .constructor(|_| Lone)
            .bulk_insert(rt);
        assert_eq!(rt.local_elements(proxy), vec![0, 1, 2]);
        for index in rt.local_elements(proxy) {
            rt.record_load(proxy, index, TimeSec(0.5));
        }
        rt.next_phase_collective();
        assert_eq!(rt.cur_phase(), 1);
        rt.next_phase_collective();
        assert_eq!(rt.cur_phase(), 2);

        let group = rt.make_objgroup_collective("solo-group", Group);
        let handle = rt.make_handle_objgroup::<Group, u64>(group, 2, true);
        rt.rdma_wait_ready(handle);
        rt.rdma_put(handle, NodeId(0), 0, &[11, 22], LockLevel::Exclusive);
        assert_eq!(
            rt.rdma_get(handle, NodeId(0), 0, 2, LockLevel::Shared),
            vec![11, 22]
        );
        rt.destroy_handle(handle);

        rt.finalize();
    });
}
