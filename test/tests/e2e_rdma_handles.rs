//! Node-scoped RDMA handles: collective construction (including zero-size
//! windows), put/get across ranks, locked accumulate.

use plenum_test::{init_logger, Cluster};

use plenum::{LockLevel, NodeId, RuntimeConfig};

struct Group;

#[test]
fn put_get_and_accum_across_ranks() {
    init_logger();
    Cluster::run(4, RuntimeConfig::default(), |rt| {
        rt.start();
        let group = rt.make_objgroup_collective("rdma-test", Group);
        let values = rt.make_handle_objgroup::<Group, f64>(group, 2, true);
        let sums = rt.make_handle_objgroup::<Group, f64>(group, 1, true);
        rt.rdma_wait_ready(values);
        rt.rdma_wait_ready(sums);
        assert!(rt.rdma_is_ready(values));
        assert_eq!(rt.rdma_local_count(values), 2);
        assert!(rt.rdma_is_uniform(values));

        // each rank writes into its right neighbor's window
        let me = rt.node().0;
        let right = NodeId((me + 1) % 4);
        rt.rdma_put(
            values,
            right,
            0,
            &[me as f64, me as f64 + 0.5],
            LockLevel::Exclusive,
        );
        rt.barrier();

        let left = ((me + 3) % 4) as f64;
        let local = rt.rdma_get(values, rt.node(), 0, 2, LockLevel::Shared);
        assert_eq!(local, vec![left, left + 0.5]);

        // everyone accumulates into rank 0's single slot
        rt.rdma_accum(sums, NodeId(0), 0, &[1.0], LockLevel::Exclusive);
        rt.barrier();
        if me == 0 {
            let total = rt.rdma_get(sums, NodeId(0), 0, 1, LockLevel::Shared);
            assert_eq!(total, vec![4.0]);
        }

        rt.destroy_handle(values);
        rt.destroy_handle(sums);
        rt.finalize();
    });
}

#[test]
fn zero_count_ranks_still_participate() {
    init_logger();
    Cluster::run(4, RuntimeConfig::default(), |rt| {
        rt.start();
        let group = rt.make_objgroup_collective("rdma-zero", Group);
        // rank r holds r elements; rank 0 holds none
        let count = rt.node().0 as usize;
        let handle = rt.make_handle_objgroup::<Group, u64>(group, count, false);
        rt.rdma_wait_ready(handle);
        assert_eq!(rt.rdma_local_count(handle), count);

        if rt.node().0 == 0 {
            // a zero-size window is valid; remote windows are reachable
            let remote = rt.rdma_get(handle, NodeId(3), 0, 3, LockLevel::Shared);
            assert_eq!(remote, vec![0, 0, 0]);
        }
        rt.destroy_handle(handle);
        rt.finalize();
    });
}
