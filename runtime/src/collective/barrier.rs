use std::collections::HashMap;

use log::trace;

use plenum_wire::{ByteReader, ByteWriter, Wire, WireErr};

use crate::epoch::Epoch;
use crate::messaging::envelope::Envelope;
use crate::runtime::Runtime;
use crate::types::Tag;

type Continuation = Box<dyn FnOnce(&mut Runtime)>;

#[derive(Default)]
struct BarrierState {
    triggers: usize,
    released: bool,
    continuation: Option<Continuation>,
}

/// Named and unnamed spanning-tree barriers. Unnamed barriers draw from a
/// per-process sequence (call order must match collectively); named
/// barriers use caller-chosen 64-bit tags kept in a separate state map.
pub struct BarrierManager {
    unnamed: HashMap<Tag, BarrierState>,
    named: HashMap<Tag, BarrierState>,
    next_unnamed: Tag,
    next_named_seq: Tag,
}

impl BarrierManager {
    pub fn new() -> Self {
        Self {
            unnamed: HashMap::new(),
            named: HashMap::new(),
            next_unnamed: 0,
            next_named_seq: 0,
        }
    }

    fn state(&mut self, named: bool, tag: Tag) -> &mut BarrierState {
        let map = if named { &mut self.named } else { &mut self.unnamed };
        map.entry(tag).or_default()
    }

    fn is_released(&self, named: bool, tag: Tag) -> bool {
        let map = if named { &self.named } else { &self.unnamed };
        map.get(&tag).is_some_and(|s| s.released)
    }

    fn retire(&mut self, named: bool, tag: Tag) {
        let map = if named { &mut self.named } else { &mut self.unnamed };
        map.remove(&tag);
    }
}

impl Default for BarrierManager {
    fn default() -> Self {
        Self::new()
    }
}

struct BarrierUpMsg {
    named: bool,
    tag: Tag,
    skip_term: bool,
}

struct BarrierDownMsg {
    named: bool,
    tag: Tag,
}

impl Wire for BarrierUpMsg {
    fn ser(&self, writer: &mut ByteWriter) {
        self.named.ser(writer);
        self.tag.ser(writer);
        self.skip_term.ser(writer);
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        Ok(Self {
            named: bool::de(reader)?,
            tag: Tag::de(reader)?,
            skip_term: bool::de(reader)?,
        })
    }
}

impl Wire for BarrierDownMsg {
    fn ser(&self, writer: &mut ByteWriter) {
        self.named.ser(writer);
        self.tag.ser(writer);
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        Ok(Self {
            named: bool::de(reader)?,
            tag: Tag::de(reader)?,
        })
    }
}

impl Runtime {
    /// Blocking unnamed barrier across all processes, participating in
    /// termination accounting of the current epoch.
    pub fn barrier(&mut self) {
        let tag = self.barriers.next_unnamed;
        self.barriers.next_unnamed += 1;
        self.barrier_blocking(false, tag, false);
    }

    /// Blocking unnamed barrier excluded from termination accounting;
    /// runtime-internal synchronization uses this so system traffic never
    /// holds an epoch open.
    pub(crate) fn system_barrier(&mut self) {
        let tag = self.barriers.next_unnamed;
        self.barriers.next_unnamed += 1;
        self.barrier_blocking(false, tag, true);
    }

    /// A process-unique tag for a named barrier: the node ID stamped into
    /// the high bits over a local sequence.
    pub fn make_barrier_tag(&mut self) -> Tag {
        let seq = self.barriers.next_named_seq;
        self.barriers.next_named_seq += 1;
        ((self.node().0 as u64) << 40) | (seq & ((1 << 40) - 1))
    }

    /// Blocking named barrier. Every process must pass the same tag.
    pub fn named_barrier(&mut self, tag: Tag) {
        self.barrier_blocking(true, tag, false);
    }

    /// Non-blocking named barrier: `continuation` fires here when every
    /// process has arrived.
    pub fn named_barrier_then(
        &mut self,
        tag: Tag,
        continuation: impl FnOnce(&mut Runtime) + 'static,
    ) {
        self.barriers.state(true, tag).continuation = Some(Box::new(continuation));
        self.barrier_trigger(true, tag, false);
    }

    fn barrier_blocking(&mut self, named: bool, tag: Tag, skip_term: bool) {
        trace!(
            "barrier enter: named={named}, tag={tag:#x}, skip_term={skip_term}, node={}",
            self.node()
        );
        self.barrier_trigger(named, tag, skip_term);
        self.run_scheduler_while(move |rt| !rt.barriers.is_released(named, tag));
        self.barriers.retire(named, tag);
        trace!("barrier exit: named={named}, tag={tag:#x}, node={}", self.node());
    }

    /// One local arrival (own or a child subtree's). At
    /// `num_children + 1` triggers the subtree is complete: forward up,
    /// or release downward from the root.
    fn barrier_trigger(&mut self, named: bool, tag: Tag, skip_term: bool) {
        let tree = self.tree();
        let expected = tree.num_children() + 1;
        let state = self.barriers.state(named, tag);
        state.triggers += 1;
        if state.triggers < expected {
            return;
        }
        let epoch = if skip_term {
            Epoch::NO_EPOCH
        } else {
            self.current_epoch()
        };
        if tree.is_root() {
            self.broadcast_in_epoch(self.sys.barrier_down, epoch, &BarrierDownMsg { named, tag });
        } else {
            let parent = tree.parent();
            self.send_in_epoch(
                parent,
                self.sys.barrier_up,
                epoch,
                &BarrierUpMsg {
                    named,
                    tag,
                    skip_term,
                },
            );
        }
    }
}

pub(crate) fn on_barrier_up(runtime: &mut Runtime, _envelope: &Envelope, reader: &mut ByteReader) {
    let msg = BarrierUpMsg::de(reader).unwrap_or_else(|e| panic!("corrupt barrier message: {e}"));
    runtime.barrier_trigger(msg.named, msg.tag, msg.skip_term);
}

pub(crate) fn on_barrier_down(runtime: &mut Runtime, _envelope: &Envelope, reader: &mut ByteReader) {
    let msg = BarrierDownMsg::de(reader).unwrap_or_else(|e| panic!("corrupt barrier message: {e}"));
    let state = runtime.barriers.state(msg.named, msg.tag);
    state.released = true;
    let continuation = state.continuation.take();
    trace!(
        "barrier released: named={}, tag={:#x}, node={}",
        msg.named,
        msg.tag,
        runtime.node()
    );
    if let Some(continuation) = continuation {
        continuation(runtime);
        runtime.barriers.retire(msg.named, msg.tag);
    }
}
