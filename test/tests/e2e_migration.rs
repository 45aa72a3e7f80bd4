//! Migration and routing: messages reach an element after it moves, via
//! both the eager (route-through-home) and non-eager (resolve-first)
//! paths, and the home directory self-heals stale senders.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use plenum_test::{init_logger, Cluster};

use plenum::{
    cyclic_map, ByteReader, ByteWriter, Element, ElementEvent, NodeId, Runtime, RuntimeConfig,
    Wire, WireErr,
};

struct Counter {
    hits: u64,
    bytes_seen: u64,
}

impl Element for Counter {
    fn pack(&self, writer: &mut ByteWriter) {
        self.hits.ser(writer);
        self.bytes_seen.ser(writer);
    }

    fn unpack(reader: &mut ByteReader) -> Result<Self, WireErr> {
        Ok(Self {
            hits: u64::de(reader)?,
            bytes_seen: u64::de(reader)?,
        })
    }
}

struct BulkMsg {
    data: Vec<u8>,
}

impl Wire for BulkMsg {
    fn ser(&self, writer: &mut ByteWriter) {
        self.data.ser(writer);
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        Ok(Self {
            data: Vec::<u8>::de(reader)?,
        })
    }
}

fn on_bulk(counter: &mut Counter, _rt: &mut Runtime, _index: u64, msg: BulkMsg) {
    counter.hits += 1;
    counter.bytes_seen += msg.data.len() as u64;
}

#[test]
fn messages_follow_a_migrated_element() {
    init_logger();
    let mut config = RuntimeConfig::default();
    // small threshold so the bulk message takes the non-eager path
    config.eager_threshold_bytes = 256;

    let moved_in = Arc::new(AtomicU64::new(0));
    let moved_in_outer = moved_in.clone();

    Cluster::run(2, config, move |rt| {
        let bulk = rt.register_elem_handler::<Counter, BulkMsg>("counter.bulk", on_bulk);
        rt.start();
        let proxy = rt
            .make_collective::<Counter>("counters")
            .bounds(2)
            .mapper(cyclic_map)
            .constructor(|_| Counter {
                hits: 0,
                bytes_seen: 0,
            })
            .bulk_insert(rt);

        let moved_in = moved_in_outer.clone();
        rt.register_element_listener(proxy, move |_rt, event, index, _node| {
            if event == ElementEvent::MigratedIn {
                assert_eq!(index, 0);
                moved_in.fetch_add(1, Ordering::SeqCst);
            }
        });

        // move element 0 from its home (rank 0) to rank 1
        rt.run_in_epoch_collective("migrate", move |rt| {
            if rt.node() == NodeId(0) {
                rt.migrate_element(proxy, 0, NodeId(1));
            }
        });
        let expected_here: Vec<u64> = if rt.node().0 == 0 { vec![] } else { vec![0, 1] };
        assert_eq!(rt.local_elements(proxy), expected_here);

        // both routing policies must find the moved element
        rt.run_in_epoch_collective("send-after-move", move |rt| {
            if rt.node() == NodeId(0) {
                rt.collection_send(proxy, 0, bulk, &BulkMsg { data: vec![7u8; 16] });
                rt.collection_send(proxy, 0, bulk, &BulkMsg { data: vec![7u8; 4096] });
            }
        });

        if rt.node() == NodeId(1) {
            let (hits, bytes) = rt
                .peek_element(proxy, 0, |c: &Counter| (c.hits, c.bytes_seen))
                .expect("element 0 resides here now");
            assert_eq!(hits, 2);
            assert_eq!(bytes, 16 + 4096);
        }
        rt.finalize();
    });
    assert_eq!(moved_in.load(Ordering::SeqCst), 1);
}

#[test]
fn registration_round_trip_restores_the_coordinator() {
    init_logger();
    Cluster::run(1, RuntimeConfig::default(), |rt| {
        rt.start();
        let entity = plenum::EntityId::new(plenum::ClassId(900), 5);
        let home = rt.node();
        rt.register_entity(entity, home);
        let resolved = Arc::new(AtomicU64::new(u64::MAX));
        let seen = resolved.clone();
        rt.get_location(entity, home, move |rt, node| {
            assert_eq!(node, rt.node());
            seen.store(node.0 as u64, Ordering::SeqCst);
        });
        assert_eq!(resolved.load(Ordering::SeqCst), 0);
        rt.unregister_entity(entity, home);
        rt.finalize();
    });
}
