//! Per-element execution-time and communication statistics, keyed by
//! phase and subphase. The load balancers consume these at phase
//! boundaries; an optional sink persists one record per element and per
//! communication edge per phase.

use std::collections::HashMap;
use std::io::Write;

use log::{debug, warn};

use plenum_wire::{ByteReader, ByteWriter, Wire, WireErr};

use crate::timing::{Stopwatch, TimeSec};
use crate::types::{EntityId, NodeId, Phase, SubPhase, NO_SUBPHASE};

/// One side of a communication edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CommEndpoint {
    Entity(EntityId),
    Node(NodeId),
}

/// A communication edge: who sent to whom, and whether it came in via a
/// broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommKey {
    pub from: CommEndpoint,
    pub to: CommEndpoint,
    pub broadcast: bool,
}

impl CommKey {
    pub fn new(
        from_elm: Option<EntityId>,
        source: NodeId,
        to: EntityId,
        broadcast: bool,
    ) -> Self {
        Self {
            from: match from_elm {
                Some(entity) => CommEndpoint::Entity(entity),
                None => CommEndpoint::Node(source),
            },
            to: CommEndpoint::Entity(to),
            broadcast,
        }
    }
}

/// Byte and message totals for one edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommVolume {
    pub bytes: u64,
    pub messages: u64,
}

#[derive(Default)]
struct ElmStats {
    phase_timings: HashMap<Phase, TimeSec>,
    subphase_timings: HashMap<(Phase, SubPhase), TimeSec>,
    comm: HashMap<Phase, HashMap<CommKey, CommVolume>>,
    subphase_comm: HashMap<(Phase, SubPhase), HashMap<CommKey, CommVolume>>,
    active: Option<Stopwatch>,
}

/// Collector for every element resident on this process.
pub struct StatsCollector {
    elems: HashMap<EntityId, ElmStats>,
    cur_subphase: SubPhase,
    sink: Option<std::io::BufWriter<std::fs::File>>,
    sink_failed: bool,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            elems: HashMap::new(),
            cur_subphase: NO_SUBPHASE,
            sink: None,
            sink_failed: false,
        }
    }

    pub fn cur_subphase(&self) -> SubPhase {
        self.cur_subphase
    }

    /// Sets the subphase subsequent records land in; `NO_SUBPHASE` returns
    /// to whole-phase accounting.
    pub fn set_subphase(&mut self, subphase: SubPhase) {
        self.cur_subphase = subphase;
    }

    /// Starts the bracket around one handler invocation.
    pub fn start_time(&mut self, entity: EntityId) {
        self.elems.entry(entity).or_default().active = Some(Stopwatch::start());
    }

    /// Closes the bracket and accumulates into the phase (and subphase)
    /// timing.
    pub fn stop_time(&mut self, entity: EntityId, phase: Phase) {
        let subphase = self.cur_subphase;
        let elapsed = match self.elems.entry(entity).or_default().active.take() {
            Some(watch) => watch.elapsed(),
            None => return,
        };
        self.add_load(entity, phase, subphase, elapsed);
    }

    /// Adds a measured (or injected) load sample.
    pub fn add_load(&mut self, entity: EntityId, phase: Phase, subphase: SubPhase, load: TimeSec) {
        let stats = self.elems.entry(entity).or_default();
        *stats.phase_timings.entry(phase).or_insert(TimeSec::ZERO) += load;
        if subphase != NO_SUBPHASE {
            *stats
                .subphase_timings
                .entry((phase, subphase))
                .or_insert(TimeSec::ZERO) += load;
        }
    }

    /// Records received bytes on a communication edge.
    pub fn recv_comm(&mut self, phase: Phase, subphase: SubPhase, key: CommKey, bytes: u64) {
        let CommEndpoint::Entity(to) = key.to else {
            return;
        };
        let stats = self.elems.entry(to).or_default();
        let volume = stats.comm.entry(phase).or_default().entry(key).or_default();
        volume.bytes += bytes;
        volume.messages += 1;
        if subphase != NO_SUBPHASE {
            let volume = stats
                .subphase_comm
                .entry((phase, subphase))
                .or_default()
                .entry(key)
                .or_default();
            volume.bytes += bytes;
            volume.messages += 1;
        }
    }

    /// The load the balancer should see for one element: the focused
    /// subphase's share when set, the whole phase otherwise.
    pub fn reported_load(
        &self,
        entity: EntityId,
        phase: Phase,
        focused: Option<SubPhase>,
    ) -> TimeSec {
        let Some(stats) = self.elems.get(&entity) else {
            return TimeSec::ZERO;
        };
        match focused {
            Some(subphase) => stats
                .subphase_timings
                .get(&(phase, subphase))
                .copied()
                .unwrap_or(TimeSec::ZERO),
            None => stats
                .phase_timings
                .get(&phase)
                .copied()
                .unwrap_or(TimeSec::ZERO),
        }
    }

    /// Forgets an element that migrated away.
    pub fn forget(&mut self, entity: EntityId) {
        self.elems.remove(&entity);
    }

    /// Discards history older than `phase - look_back` phases.
    pub fn release_stats_from_unneeded_phases(&mut self, phase: Phase, look_back: Phase) {
        let keep_from = phase.saturating_sub(look_back);
        for stats in self.elems.values_mut() {
            stats.phase_timings.retain(|p, _| *p >= keep_from);
            stats.subphase_timings.retain(|(p, _), _| *p >= keep_from);
            stats.comm.retain(|p, _| *p >= keep_from);
            stats.subphase_comm.retain(|(p, _), _| *p >= keep_from);
        }
    }

    pub(crate) fn open_sink(&mut self, path: &std::path::Path, node: NodeId) {
        let file = path.with_extension(format!("{}.csv", node.0));
        match std::fs::File::create(&file) {
            Ok(file) => self.sink = Some(std::io::BufWriter::new(file)),
            Err(error) => {
                warn!("stats sink {} could not be opened: {error}", file.display());
                self.sink_failed = true;
            }
        }
    }

    /// Emits one record per element and per communication edge for the
    /// finished phase.
    pub(crate) fn emit_phase_records(&mut self, phase: Phase) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        let mut entities: Vec<EntityId> = self.elems.keys().copied().collect();
        entities.sort_unstable();
        let mut result = Ok(());
        for entity in entities {
            let stats = &self.elems[&entity];
            let load = stats
                .phase_timings
                .get(&phase)
                .copied()
                .unwrap_or(TimeSec::ZERO);
            result = result.and(writeln!(
                sink,
                "{phase},{}:{},{}",
                entity.class.0,
                entity.index,
                load.seconds()
            ));
            if let Some(edges) = stats.comm.get(&phase) {
                let mut keys: Vec<&CommKey> = edges.keys().collect();
                keys.sort_unstable();
                for key in keys {
                    let volume = edges[key];
                    result = result.and(writeln!(
                        sink,
                        "{phase},{},{},{},{}",
                        endpoint_str(key.to),
                        endpoint_str(key.from),
                        volume.bytes,
                        if key.broadcast { "bcast" } else { "p2p" }
                    ));
                }
            }
        }
        if let Err(error) = result {
            if !self.sink_failed {
                warn!("stats sink write failed: {error}");
                self.sink_failed = true;
            }
        }
        debug!("stats records emitted for phase {phase}");
    }

    pub(crate) fn flush_sink(&mut self) {
        if let Some(sink) = self.sink.as_mut() {
            let _ = sink.flush();
        }
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn endpoint_str(endpoint: CommEndpoint) -> String {
    match endpoint {
        CommEndpoint::Entity(entity) => format!("{}:{}", entity.class.0, entity.index),
        CommEndpoint::Node(node) => format!("n{}", node.0),
    }
}

impl Wire for CommEndpoint {
    fn ser(&self, writer: &mut ByteWriter) {
        match self {
            CommEndpoint::Entity(entity) => {
                writer.write_byte(0);
                entity.ser(writer);
            }
            CommEndpoint::Node(node) => {
                writer.write_byte(1);
                node.ser(writer);
            }
        }
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        match reader.read_byte()? {
            0 => Ok(CommEndpoint::Entity(EntityId::de(reader)?)),
            1 => Ok(CommEndpoint::Node(NodeId::de(reader)?)),
            value => Err(WireErr::BadDiscriminant {
                value: value as u64,
                type_name: "CommEndpoint",
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ClassId;

    fn entity(index: u64) -> EntityId {
        EntityId::new(ClassId(0), index)
    }

    #[test]
    fn loads_accumulate_per_phase_and_subphase() {
        let mut stats = StatsCollector::new();
        stats.add_load(entity(1), 0, 2, TimeSec(0.5));
        stats.add_load(entity(1), 0, 2, TimeSec(0.25));
        stats.add_load(entity(1), 1, NO_SUBPHASE, TimeSec(1.0));

        assert_eq!(stats.reported_load(entity(1), 0, None), TimeSec(0.75));
        assert_eq!(stats.reported_load(entity(1), 0, Some(2)), TimeSec(0.75));
        assert_eq!(stats.reported_load(entity(1), 0, Some(3)), TimeSec::ZERO);
        assert_eq!(stats.reported_load(entity(1), 1, None), TimeSec(1.0));
    }

    #[test]
    fn unknown_element_reports_zero() {
        let stats = StatsCollector::new();
        assert_eq!(stats.reported_load(entity(9), 0, None), TimeSec::ZERO);
    }

    #[test]
    fn comm_volume_counts_bytes_and_messages() {
        let mut stats = StatsCollector::new();
        let key = CommKey::new(Some(entity(1)), NodeId(0), entity(2), false);
        stats.recv_comm(0, NO_SUBPHASE, key, 100);
        stats.recv_comm(0, NO_SUBPHASE, key, 50);
        let volume = stats.elems[&entity(2)].comm[&0][&key];
        assert_eq!(volume.bytes, 150);
        assert_eq!(volume.messages, 2);
    }

    #[test]
    fn release_discards_old_phases() {
        let mut stats = StatsCollector::new();
        for phase in 0..10 {
            stats.add_load(entity(1), phase, NO_SUBPHASE, TimeSec(1.0));
        }
        stats.release_stats_from_unneeded_phases(10, 3);
        assert_eq!(stats.reported_load(entity(1), 5, None), TimeSec::ZERO);
        assert_eq!(stats.reported_load(entity(1), 8, None), TimeSec(1.0));
    }

    #[test]
    fn start_stop_bracket_records_something() {
        let mut stats = StatsCollector::new();
        stats.start_time(entity(3));
        stats.stop_time(entity(3), 0);
        // the bracket is nonnegative and recorded
        assert!(stats.reported_load(entity(3), 0, None).seconds() >= 0.0);
        // unmatched stop is a no-op
        stats.stop_time(entity(3), 0);
    }
}
