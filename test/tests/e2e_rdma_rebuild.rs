//! Scenario: index-scoped handles survive load-balancing migrations. Four
//! elements each back one integer (their index); after force-migrating
//! 1 -> 0 and 2 -> 3 and running the post-migration rebuild, every index
//! still reads its own value from its new location.

use plenum_test::{init_logger, Cluster};

use plenum::{
    cyclic_map, ByteReader, ByteWriter, Element, LockLevel, NodeId, RuntimeConfig, Wire, WireErr,
};

struct Block;

impl Element for Block {
    fn pack(&self, _writer: &mut ByteWriter) {}

    fn unpack(_reader: &mut ByteReader) -> Result<Self, WireErr> {
        Ok(Block)
    }
}

#[test]
fn rebuild_preserves_values_across_migration() {
    init_logger();
    Cluster::run(4, RuntimeConfig::default(), |rt| {
        rt.start();
        // element i lives on rank i
        let proxy = rt
            .make_collective::<Block>("blocks")
            .bounds(4)
            .mapper(cyclic_map)
            .constructor(|_| Block)
            .bulk_insert(rt);

        for index in rt.local_elements(proxy) {
            rt.make_indexed_handle::<Block, u64>(proxy, index, 1);
        }
        let handle = rt.commit_indexed_handle::<Block, u64>(proxy);
        rt.indexed_wait_ready(handle);

        // seed every block with its own index
        for index in rt.local_elements(proxy) {
            rt.indexed_put(handle, index, &[index], LockLevel::Exclusive);
        }
        rt.barrier();

        // remote reads resolve through the descriptor windows
        let probe = (rt.node().0 as u64 + 2) % 4;
        assert_eq!(
            rt.indexed_get(handle, probe, LockLevel::Shared),
            vec![probe]
        );

        // force-migrate 1 -> 0 and 2 -> 3, then run the phase boundary
        // that triggers the rebuild
        rt.run_in_epoch_collective("force-migrate", move |rt| {
            if rt.node() == NodeId(1) {
                rt.migrate_element(proxy, 1, NodeId(0));
            }
            if rt.node() == NodeId(2) {
                rt.migrate_element(proxy, 2, NodeId(3));
            }
        });
        rt.next_phase_collective();

        // residency moved
        let expected_here: Vec<u64> = match rt.node().0 {
            0 => vec![0, 1],
            1 => vec![],
            2 => vec![],
            3 => vec![2, 3],
            _ => unreachable!(),
        };
        assert_eq!(rt.local_elements(proxy), expected_here);

        // every value survived the rebuild, wherever it lives now
        for index in 0..4u64 {
            assert_eq!(
                rt.indexed_get(handle, index, LockLevel::Shared),
                vec![index],
                "index {index} lost its value in the rebuild"
            );
        }

        rt.destroy_indexed_handle(handle);
        rt.finalize();
    });
}
