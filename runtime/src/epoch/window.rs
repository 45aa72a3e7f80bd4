use log::{debug, trace};
use thiserror::Error;

use crate::epoch::{Epoch, FIRST_SEQ, LAST_SEQ};
use crate::util::{IntervalSet, RangedCounter};

/// Errors from epoch window bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EpochError {
    /// Every sequence in the window is active or awaiting garbage collection
    #[error("Epoch window {archetype:#x} exhausted: no free sequences (gc pending: {gc_pending})")]
    Exhausted { archetype: u64, gc_pending: bool },

    /// The epoch belongs to a different archetype than this window
    #[error("Epoch {epoch:#x} does not belong to window {archetype:#x}")]
    WrongArchetype { epoch: u64, archetype: u64 },
}

/// Per-archetype allocation state: which sequences are free, which have
/// terminated, and where the allocation cursor sits.
///
/// `free` and `terminated` are disjoint at all times. A sequence that is in
/// neither set is *active*: allocated and not yet terminated.
pub struct EpochWindow {
    archetype: Epoch,
    free: IntervalSet,
    terminated: IntervalSet,
    counter: RangedCounter,
    total_terminated: u64,
    gc_watermark: f64,
    gc_pending: bool,
}

impl EpochWindow {
    pub fn new(archetype: Epoch, gc_watermark: f64) -> Self {
        debug_assert_eq!(archetype.seq(), 0, "archetype must have a clear sequence");
        debug!(
            "initialize epoch window: archetype={}, range=[{:#x}, {:#x}]",
            archetype, FIRST_SEQ, LAST_SEQ
        );
        Self {
            archetype,
            free: IntervalSet::from_range(FIRST_SEQ, LAST_SEQ),
            terminated: IntervalSet::new(),
            counter: RangedCounter::new(FIRST_SEQ, LAST_SEQ),
            total_terminated: 0,
            gc_watermark,
            gc_pending: false,
        }
    }

    pub fn archetype(&self) -> Epoch {
        self.archetype
    }

    fn is_archetypal(&self, epoch: Epoch) -> bool {
        epoch.archetype() == self.archetype
    }

    /// Allocates the next free sequence, scanning forward from the cursor.
    ///
    /// # Panics
    ///
    /// Panics if the window is exhausted; configuration must widen the
    /// range or reduce concurrently outstanding epochs.
    pub fn allocate(&mut self) -> Epoch {
        self.try_allocate().unwrap_or_else(|error| panic!("{error}"))
    }

    pub fn try_allocate(&mut self) -> Result<Epoch, EpochError> {
        if self.free.is_empty() {
            return Err(EpochError::Exhausted {
                archetype: self.archetype.0,
                gc_pending: self.gc_pending,
            });
        }
        loop {
            let seq = self.counter.next();
            if self.free.contains(seq) {
                self.free.erase(seq);
                let epoch = self.archetype.with_seq(seq);
                trace!(
                    "allocate epoch: epoch={}, free={}, compression={:.1}",
                    epoch,
                    self.free.len(),
                    self.free.compression()
                );
                return Ok(epoch);
            }
        }
    }

    /// Marks a sequence terminated. Monotone until garbage collection
    /// returns it to `free`. Rooted epochs are allocated only on their
    /// root node, so other nodes activate the sequence implicitly here;
    /// `free` and `terminated` stay disjoint either way.
    pub fn mark_terminated(&mut self, epoch: Epoch) -> Result<(), EpochError> {
        if !self.is_archetypal(epoch) {
            return Err(EpochError::WrongArchetype {
                epoch: epoch.0,
                archetype: self.archetype.0,
            });
        }
        self.free.erase(epoch.seq());
        if self.terminated.insert(epoch.seq()) {
            self.total_terminated += 1;
        }
        trace!(
            "epoch terminated: epoch={}, terminated={}, compression={:.1}",
            epoch,
            self.terminated.len(),
            self.terminated.compression()
        );
        Ok(())
    }

    pub fn is_terminated(&self, epoch: Epoch) -> bool {
        // a garbage-collected sequence terminated in the past
        self.terminated.contains(epoch.seq()) || self.free.contains(epoch.seq())
    }

    pub fn is_free(&self, epoch: Epoch) -> bool {
        self.free.contains(epoch.seq())
    }

    pub fn num_terminated(&self) -> u64 {
        self.terminated.len()
    }

    pub fn total_terminated(&self) -> u64 {
        self.total_terminated
    }

    /// Whether the terminated set has crossed the collection watermark.
    /// When it has, returns the candidate set to be intersected across all
    /// nodes, and debounces further attempts until
    /// [`EpochWindow::garbage_collect`] runs. The caller owns driving the
    /// distributed agreement.
    pub fn check_gc(&mut self) -> Option<IntervalSet> {
        if self.gc_pending {
            return None;
        }
        let watermark = (self.counter.range() as f64 * self.gc_watermark) as u64;
        if watermark == 0 || self.terminated.len() < watermark {
            return None;
        }
        self.gc_pending = true;
        debug!(
            "epoch gc triggered: archetype={}, terminated={}, watermark={}",
            self.archetype,
            self.terminated.len(),
            watermark
        );
        Some(self.terminated.clone())
    }

    /// Returns the agreed set of sequences (terminated on every node) to
    /// the free pool.
    pub fn garbage_collect(&mut self, agreed: &IntervalSet) {
        for value in agreed.values() {
            self.terminated.erase(value);
            self.free.insert(value);
        }
        self.gc_pending = false;
        debug!(
            "epoch gc done: archetype={}, collected={}, free={}",
            self.archetype,
            agreed.len(),
            self.free.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoch::{generate_epoch, EpochCategory};
    use crate::types::NodeId;

    fn window() -> EpochWindow {
        let archetype = generate_epoch(false, NodeId::UNINITIALIZED, EpochCategory::NoCategory);
        EpochWindow::new(archetype, 0.10)
    }

    #[test]
    fn allocate_activates_sequences_in_order() {
        let mut w = window();
        let a = w.allocate();
        let b = w.allocate();
        assert_eq!(a.seq(), FIRST_SEQ);
        assert_eq!(b.seq(), FIRST_SEQ + 1);
        assert!(!w.is_free(a));
        assert!(!w.is_terminated(a));
    }

    #[test]
    fn terminate_then_collect_frees_the_sequence() {
        let mut w = window();
        let a = w.allocate();
        w.mark_terminated(a).unwrap();
        assert!(w.is_terminated(a));

        let mut agreed = IntervalSet::new();
        agreed.insert(a.seq());
        w.garbage_collect(&agreed);
        assert!(w.is_free(a));
        // still reported terminated: the sequence completed in the past
        assert!(w.is_terminated(a));
    }

    #[test]
    fn terminating_a_free_sequence_activates_it_implicitly() {
        // a non-root node learns of a rooted epoch only at termination
        let mut w = window();
        let remote = w.archetype().with_seq(FIRST_SEQ + 5);
        w.mark_terminated(remote).unwrap();
        assert!(w.is_terminated(remote));
        assert!(!w.is_free(remote));
    }

    #[test]
    fn wrong_archetype_is_rejected() {
        let mut w = window();
        let rooted = generate_epoch(true, NodeId(0), EpochCategory::NoCategory).with_seq(1);
        assert!(matches!(
            w.mark_terminated(rooted),
            Err(EpochError::WrongArchetype { .. })
        ));
    }

    #[test]
    fn terminated_and_free_stay_disjoint() {
        let mut w = window();
        let epochs: Vec<_> = (0..64).map(|_| w.allocate()).collect();
        for epoch in &epochs {
            w.mark_terminated(*epoch).unwrap();
        }
        for epoch in &epochs {
            assert!(!w.is_free(*epoch));
            assert!(w.is_terminated(*epoch));
        }
        assert_eq!(w.num_terminated(), 64);
    }

    #[test]
    fn gc_debounces_until_collect() {
        let archetype = generate_epoch(false, NodeId::UNINITIALIZED, EpochCategory::NoCategory);
        // tiny watermark so a few terminations trip it
        let mut w = EpochWindow::new(archetype, 1e-10);
        let a = w.allocate();
        w.mark_terminated(a).unwrap();
        let first = w.check_gc();
        assert!(first.is_some());
        // pending flag debounces a second attempt
        assert!(w.check_gc().is_none());
        w.garbage_collect(&first.unwrap());
        assert!(w.is_free(a));
    }
}
