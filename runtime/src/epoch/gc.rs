//! Distributed garbage collection of terminated epoch sequences.
//!
//! When a window crosses its watermark, every node contributes its
//! terminated set to an intersection reduction stamped by the archetype;
//! the common prefix (terminated everywhere) is broadcast back and
//! returned to the free pool. The window's pending flag debounces
//! concurrent attempts.

use log::debug;

use plenum_wire::{ByteReader, ByteWriter, Wire, WireErr};

use crate::collective::reduce::manager::ReduceAction;
use crate::collective::reduce::scope::{ReduceScope, ReduceStamp};
use crate::epoch::Epoch;
use crate::messaging::envelope::Envelope;
use crate::runtime::Runtime;
use crate::types::NodeId;
use crate::util::IntervalSet;

/// Component ID for epoch-GC reductions.
const COMPONENT_EPOCH: u32 = 1;

struct GcBroadcastMsg {
    archetype: Epoch,
    agreed: IntervalSet,
}

impl Wire for GcBroadcastMsg {
    fn ser(&self, writer: &mut ByteWriter) {
        self.archetype.ser(writer);
        self.agreed.ser(writer);
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        Ok(Self {
            archetype: Epoch::de(reader)?,
            agreed: IntervalSet::de(reader)?,
        })
    }
}

impl Runtime {
    /// Contributes this node's terminated set for `archetype` to the
    /// collection agreement. Termination is globally broadcast, so every
    /// node crosses the watermark for the same archetype and contributes.
    pub(crate) fn start_epoch_gc(&mut self, archetype: Epoch, candidate: IntervalSet) {
        debug!(
            "epoch gc: contributing {} terminated sequences for archetype {}",
            candidate.len(),
            archetype
        );
        let gc_handler = self.sys.epoch_gc;
        self.with_no_epoch(|rt| {
            rt.reduce::<IntervalSet>(
                ReduceScope::Component(COMPONENT_EPOCH),
                Some(ReduceStamp::Epoch(archetype)),
                rt.sysops.isect_iset,
                NodeId(0),
                &candidate,
                ReduceAction::Callback(Box::new(move |rt, combined| {
                    let agreed = plenum_wire::from_bytes::<IntervalSet>(combined)
                        .unwrap_or_else(|e| panic!("corrupt gc agreement: {e}"));
                    rt.broadcast_system(gc_handler, &GcBroadcastMsg { archetype, agreed });
                })),
            );
        });
    }
}

pub(crate) fn on_gc_broadcast(runtime: &mut Runtime, _envelope: &Envelope, reader: &mut ByteReader) {
    let msg = GcBroadcastMsg::de(reader).unwrap_or_else(|e| panic!("corrupt gc broadcast: {e}"));
    runtime
        .epochs
        .terminated_window(msg.archetype)
        .garbage_collect(&msg.agreed);
}
