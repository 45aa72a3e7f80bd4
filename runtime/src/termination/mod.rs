//! Termination detection: four counters per epoch (local produce/consume,
//! summed globally over spanning-tree waves), with termination declared
//! when two successive waves agree on balanced totals.

use std::collections::HashMap;

use log::{debug, trace};

use plenum_wire::{ByteReader, ByteWriter, Wire, WireErr};

use crate::epoch::Epoch;
use crate::messaging::envelope::Envelope;
use crate::runtime::{BufferedMsg, Runtime};
use crate::types::NodeId;

type Action = Box<dyn FnOnce(&mut Runtime)>;

#[derive(Default)]
struct EpochTermState {
    produced: u64,
    consumed: u64,
    terminated: bool,
    suspended: bool,
    actions: Vec<Action>,
    buffered: Vec<BufferedMsg>,
    /// wave currently requested at this node
    requested_wave: Option<u64>,
    /// child subtree reports keyed by wave
    wave_reports: HashMap<u64, Vec<(u64, u64)>>,
    // arbitrator-only fields
    wave_in_flight: bool,
    waves_run: u64,
    last_totals: Option<(u64, u64)>,
}

/// Per-process detector state for every epoch this process has seen.
pub struct TerminationDetector {
    epochs: HashMap<Epoch, EpochTermState>,
}

impl TerminationDetector {
    pub fn new() -> Self {
        Self {
            epochs: HashMap::new(),
        }
    }

    fn state(&mut self, epoch: Epoch) -> &mut EpochTermState {
        self.epochs.entry(epoch).or_default()
    }

    /// Registers local interest in an epoch so the arbitrator runs waves
    /// for it even before any message flows.
    pub fn activate(&mut self, epoch: Epoch) {
        self.state(epoch);
    }

    pub fn produce(&mut self, epoch: Epoch, units: u64) {
        let state = self.state(epoch);
        assert!(
            !state.terminated,
            "produce on terminated epoch {epoch}: produced={}, consumed={}",
            state.produced, state.consumed
        );
        state.produced += units;
    }

    pub fn consume(&mut self, epoch: Epoch, units: u64) {
        let state = self.state(epoch);
        assert!(
            !state.terminated,
            "consume on terminated epoch {epoch}: produced={}, consumed={}",
            state.produced, state.consumed
        );
        state.consumed += units;
    }

    pub fn counts(&self, epoch: Epoch) -> (u64, u64) {
        self.epochs
            .get(&epoch)
            .map_or((0, 0), |s| (s.produced, s.consumed))
    }

    pub fn is_terminated(&self, epoch: Epoch) -> bool {
        self.epochs.get(&epoch).is_some_and(|s| s.terminated)
    }

    pub fn is_suspended(&self, epoch: Epoch) -> bool {
        self.epochs.get(&epoch).is_some_and(|s| s.suspended)
    }
}

impl Default for TerminationDetector {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) struct WaveRequestMsg {
    pub epoch: Epoch,
    pub wave: u64,
}

pub(crate) struct WaveUpMsg {
    pub epoch: Epoch,
    pub wave: u64,
    pub produced: u64,
    pub consumed: u64,
}

pub(crate) struct EpochTerminatedMsg {
    pub epoch: Epoch,
}

impl Wire for WaveRequestMsg {
    fn ser(&self, writer: &mut ByteWriter) {
        self.epoch.ser(writer);
        self.wave.ser(writer);
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        Ok(Self {
            epoch: Epoch::de(reader)?,
            wave: u64::de(reader)?,
        })
    }
}

impl Wire for WaveUpMsg {
    fn ser(&self, writer: &mut ByteWriter) {
        self.epoch.ser(writer);
        self.wave.ser(writer);
        self.produced.ser(writer);
        self.consumed.ser(writer);
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        Ok(Self {
            epoch: Epoch::de(reader)?,
            wave: u64::de(reader)?,
            produced: u64::de(reader)?,
            consumed: u64::de(reader)?,
        })
    }
}

impl Wire for EpochTerminatedMsg {
    fn ser(&self, writer: &mut ByteWriter) {
        self.epoch.ser(writer);
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        Ok(Self {
            epoch: Epoch::de(reader)?,
        })
    }
}

impl Runtime {
    /// The node that runs termination waves for an epoch: the embedded
    /// root for rooted epochs, node 0 otherwise.
    pub(crate) fn epoch_arbitrator(&self, epoch: Epoch) -> NodeId {
        if epoch.is_rooted() {
            epoch.node()
        } else {
            NodeId(0)
        }
    }

    pub fn term_is_terminated(&self, epoch: Epoch) -> bool {
        self.term.is_terminated(epoch)
    }

    /// This process's (produced, consumed) tallies for an epoch.
    pub fn epoch_counts(&self, epoch: Epoch) -> (u64, u64) {
        self.term.counts(epoch)
    }

    /// Runs `action` on this process exactly once, after the epoch
    /// terminates globally. Fires immediately if it already has.
    pub fn add_action(&mut self, epoch: Epoch, action: impl FnOnce(&mut Runtime) + 'static) {
        if self.term.is_terminated(epoch) {
            action(self);
            return;
        }
        self.term.state(epoch).actions.push(Box::new(action));
    }

    /// Suspends delivery into `epoch`: arriving messages are buffered
    /// unconsumed, so the epoch cannot terminate until released.
    pub fn suspend_epoch(&mut self, epoch: Epoch) {
        self.term.state(epoch).suspended = true;
    }

    /// Releases a suspended epoch and replays its buffered messages.
    pub fn release_epoch(&mut self, epoch: Epoch) {
        let state = self.term.state(epoch);
        state.suspended = false;
        let buffered = std::mem::take(&mut state.buffered);
        debug!(
            "release epoch {epoch}: replaying {} buffered messages",
            buffered.len()
        );
        self.replay_queue.extend(buffered);
    }

    pub(crate) fn buffer_unreleased(&mut self, epoch: Epoch, msg: BufferedMsg) {
        self.term.state(epoch).buffered.push(msg);
    }

    /// Allocates a fresh collective epoch, runs `body` inside it, then
    /// blocks the scheduler until the epoch terminates globally. Must be
    /// called on every process.
    pub fn run_in_epoch_collective(
        &mut self,
        label: &str,
        body: impl FnOnce(&mut Runtime),
    ) -> Epoch {
        let epoch = self
            .epochs
            .next_collective_epoch(crate::epoch::EpochCategory::NoCategory);
        debug!("run_in_epoch_collective: label={label}, epoch={epoch}");
        self.term.activate(epoch);
        self.with_epoch(epoch, body);
        self.run_scheduler_while(move |rt| !rt.term.is_terminated(epoch));
        epoch
    }

    /// Allocates a rooted epoch on the calling process, runs `body`, and
    /// blocks until global termination. Only the caller blocks; other
    /// processes participate through their own scheduler loops.
    pub fn run_in_epoch_rooted(&mut self, label: &str, body: impl FnOnce(&mut Runtime)) -> Epoch {
        let epoch = self
            .epochs
            .next_rooted_epoch(crate::epoch::EpochCategory::NoCategory);
        debug!("run_in_epoch_rooted: label={label}, epoch={epoch}");
        self.term.activate(epoch);
        self.with_epoch(epoch, body);
        self.run_scheduler_while(move |rt| !rt.term.is_terminated(epoch));
        epoch
    }

    /// Idle hook: the arbitrator starts a counter-collection wave for
    /// every live epoch it knows about.
    pub(crate) fn term_on_idle(&mut self) {
        let me = self.node();
        let candidates: Vec<Epoch> = self
            .term
            .epochs
            .iter()
            .filter(|(epoch, state)| {
                !state.terminated
                    && !state.wave_in_flight
                    && self.epoch_arbitrator(**epoch) == me
            })
            .map(|(epoch, _)| *epoch)
            .collect();
        for epoch in candidates {
            let state = self.term.state(epoch);
            state.wave_in_flight = true;
            state.waves_run += 1;
            let wave = state.waves_run;
            trace!("term wave start: epoch={epoch}, wave={wave}");
            self.broadcast_system(self.sys.term_wave_req, &WaveRequestMsg { epoch, wave });
        }
    }

    fn term_try_report(&mut self, epoch: Epoch, wave: u64) {
        let arbitrator = self.epoch_arbitrator(epoch);
        let tree = self.tree_rooted_at(arbitrator);
        let expected = tree.num_children();
        let state = self.term.state(epoch);
        if state.requested_wave != Some(wave) {
            return;
        }
        let have = state.wave_reports.get(&wave).map_or(0, |r| r.len());
        if have < expected {
            return;
        }
        let reports = state.wave_reports.remove(&wave).unwrap_or_default();
        let produced: u64 = state.produced + reports.iter().map(|r| r.0).sum::<u64>();
        let consumed: u64 = state.consumed + reports.iter().map(|r| r.1).sum::<u64>();
        state.requested_wave = None;

        if tree.is_root() {
            self.term_evaluate(epoch, wave, produced, consumed);
        } else {
            let parent = tree.parent();
            self.send_system(
                parent,
                self.sys.term_wave_up,
                &WaveUpMsg {
                    epoch,
                    wave,
                    produced,
                    consumed,
                },
            );
        }
    }

    fn term_evaluate(&mut self, epoch: Epoch, wave: u64, produced: u64, consumed: u64) {
        // consumed > produced is a legal transient: rank snapshots within
        // one wave are not simultaneous, so a consume can be counted while
        // its produce was missed by an earlier snapshot. The two-wave
        // stability rule filters it out.
        let quiesced = {
            let state = self.term.state(epoch);
            state.wave_in_flight = false;
            let stable = state.last_totals == Some((produced, consumed));
            state.last_totals = Some((produced, consumed));
            produced == consumed && ((wave == 1 && produced == 0) || stable)
        };
        trace!(
            "term wave done: epoch={epoch}, wave={wave}, produced={produced}, \
             consumed={consumed}, quiesced={quiesced}"
        );
        if quiesced {
            self.broadcast_system(self.sys.term_terminated, &EpochTerminatedMsg { epoch });
        }
    }

    fn term_on_terminated(&mut self, epoch: Epoch) {
        let state = self.term.state(epoch);
        if state.terminated {
            return;
        }
        state.terminated = true;
        // drop transient wave bookkeeping; only the flag and tallies remain
        state.wave_reports.clear();
        state.requested_wave = None;
        let actions = std::mem::take(&mut state.actions);
        debug!(
            "epoch terminated: epoch={epoch}, firing {} actions",
            actions.len()
        );
        for action in actions {
            action(self);
        }
        // retire the sequence; may trip the window's gc watermark
        let window = self.epochs.terminated_window(epoch);
        window
            .mark_terminated(epoch)
            .unwrap_or_else(|error| panic!("{error}"));
        if let Some(candidate) = window.check_gc() {
            self.start_epoch_gc(epoch.archetype(), candidate);
        }
    }
}

pub(crate) fn on_wave_request(runtime: &mut Runtime, _envelope: &Envelope, reader: &mut ByteReader) {
    let msg = WaveRequestMsg::de(reader).unwrap_or_else(|e| panic!("corrupt wave request: {e}"));
    let state = runtime.term.state(msg.epoch);
    state.requested_wave = Some(msg.wave);
    runtime.term_try_report(msg.epoch, msg.wave);
}

pub(crate) fn on_wave_up(runtime: &mut Runtime, envelope: &Envelope, reader: &mut ByteReader) {
    let msg = WaveUpMsg::de(reader).unwrap_or_else(|e| panic!("corrupt wave report: {e}"));
    trace!(
        "term wave report from {}: epoch={}, wave={}",
        envelope.source,
        msg.epoch,
        msg.wave
    );
    let state = runtime.term.state(msg.epoch);
    state
        .wave_reports
        .entry(msg.wave)
        .or_default()
        .push((msg.produced, msg.consumed));
    runtime.term_try_report(msg.epoch, msg.wave);
}

pub(crate) fn on_epoch_terminated(
    runtime: &mut Runtime,
    _envelope: &Envelope,
    reader: &mut ByteReader,
) {
    let msg =
        EpochTerminatedMsg::de(reader).unwrap_or_else(|e| panic!("corrupt termination notice: {e}"));
    runtime.term_on_terminated(msg.epoch);
}
