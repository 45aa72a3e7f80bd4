//! Scenario: a 1-D Jacobi analog on a 16-element collection over four
//! ranks. Three sweeps; every element averages its neighbors' values.
//! Expected: per-element handler counts match the traffic exactly, and
//! the MaxOp residual reduction converges monotonically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use plenum_test::{init_logger, Cluster};

use plenum::{
    block_map, ByteReader, ByteWriter, CollectionProxy, Element, HandlerId, NodeId, ReduceAction,
    Runtime, RuntimeConfig, Wire, WireErr,
};

const CELLS: u64 = 16;
const SWEEPS: u64 = 3;

fn neighbors(index: u64) -> Vec<u64> {
    let mut result = Vec::new();
    if index > 0 {
        result.push(index - 1);
    }
    if index + 1 < CELLS {
        result.push(index + 1);
    }
    result
}

struct Cell {
    value: f64,
    acc: f64,
    got: u32,
    handled: u64,
    residual: f64,
}

impl Cell {
    fn new(index: u64) -> Self {
        Self {
            value: index as f64,
            acc: 0.0,
            got: 0,
            handled: 0,
            residual: 0.0,
        }
    }
}

impl Element for Cell {
    fn pack(&self, writer: &mut ByteWriter) {
        self.value.ser(writer);
        self.acc.ser(writer);
        self.got.ser(writer);
        self.handled.ser(writer);
        self.residual.ser(writer);
    }

    fn unpack(reader: &mut ByteReader) -> Result<Self, WireErr> {
        Ok(Self {
            value: f64::de(reader)?,
            acc: f64::de(reader)?,
            got: u32::de(reader)?,
            handled: u64::de(reader)?,
            residual: f64::de(reader)?,
        })
    }
}

struct SweepMsg;

impl Wire for SweepMsg {
    fn ser(&self, _writer: &mut ByteWriter) {}

    fn de(_reader: &mut ByteReader) -> Result<Self, WireErr> {
        Ok(SweepMsg)
    }
}

struct ValueMsg {
    value: f64,
}

impl Wire for ValueMsg {
    fn ser(&self, writer: &mut ByteWriter) {
        self.value.ser(writer);
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        Ok(Self {
            value: f64::de(reader)?,
        })
    }
}

static CTX: OnceLock<(CollectionProxy<Cell>, HandlerId)> = OnceLock::new();

fn on_sweep(cell: &mut Cell, rt: &mut Runtime, index: u64, _msg: SweepMsg) {
    cell.handled += 1;
    let (proxy, value_handler) = *CTX.get().expect("context installed");
    for neighbor in neighbors(index) {
        rt.collection_send(
            proxy,
            neighbor,
            value_handler,
            &ValueMsg { value: cell.value },
        );
    }
}

fn on_value(cell: &mut Cell, _rt: &mut Runtime, index: u64, msg: ValueMsg) {
    cell.handled += 1;
    cell.got += 1;
    cell.acc += msg.value;
    let expected = neighbors(index).len() as u32;
    if cell.got == expected {
        let updated = cell.acc / expected as f64;
        cell.residual = (updated - cell.value).abs();
        cell.value = updated;
        cell.got = 0;
        cell.acc = 0.0;
    }
}

#[test]
fn jacobi_ring_three_sweeps() {
    init_logger();
    let residuals = Arc::new(Mutex::new(Vec::<f64>::new()));
    let handled_total = Arc::new(AtomicU64::new(0));
    let residuals_outer = residuals.clone();
    let handled_outer = handled_total.clone();

    Cluster::run(4, RuntimeConfig::default(), move |rt| {
        let sweep_handler = rt.register_elem_handler::<Cell, SweepMsg>("cell.sweep", on_sweep);
        let value_handler = rt.register_elem_handler::<Cell, ValueMsg>("cell.value", on_value);
        let max = rt.register_op::<f64>("test.max.f64", |a, b| a.max(b));
        rt.start();

        let proxy = rt
            .make_collective::<Cell>("jacobi-ring")
            .bounds(CELLS)
            .mapper(block_map)
            .constructor(Cell::new)
            .bulk_insert(rt);
        let _ = CTX.set((proxy, value_handler));

        for _sweep in 0..SWEEPS {
            rt.run_in_epoch_collective("jacobi-sweep", move |rt| {
                rt.collection_broadcast(proxy, sweep_handler, &SweepMsg);
            });

            // reduce the max residual of this sweep to rank 0
            let residuals = residuals_outer.clone();
            let phase = rt.cur_phase();
            rt.run_in_epoch_collective("jacobi-residual", move |rt| {
                for index in rt.local_elements(proxy) {
                    let residual = rt
                        .peek_element(proxy, index, |cell: &Cell| cell.residual)
                        .expect("resident element");
                    let residuals = residuals.clone();
                    rt.collection_reduce::<Cell, f64>(
                        proxy,
                        phase,
                        max,
                        NodeId(0),
                        &residual,
                        ReduceAction::Callback(Box::new(move |_rt, combined| {
                            let value = plenum_wire::from_bytes::<f64>(combined).unwrap();
                            residuals.lock().unwrap().push(value);
                        })),
                    );
                }
            });

            rt.next_phase_collective();
        }

        // every element saw one sweep start plus one message per neighbor,
        // per sweep
        for index in rt.local_elements(proxy) {
            let handled = rt
                .peek_element(proxy, index, |cell: &Cell| cell.handled)
                .expect("resident element");
            assert_eq!(handled, SWEEPS * (1 + neighbors(index).len() as u64));
            handled_outer.fetch_add(handled, Ordering::SeqCst);
        }
        rt.finalize();
    });

    let residuals = residuals.lock().unwrap();
    assert_eq!(residuals.len(), SWEEPS as usize);
    for pair in residuals.windows(2) {
        assert!(
            pair[1] <= pair[0],
            "residuals must converge monotonically: {residuals:?}"
        );
    }
    // 16 cells: 14 interior with 2 neighbors, 2 ends with 1
    assert_eq!(handled_total.load(Ordering::SeqCst), SWEEPS * (16 + 30));
}
