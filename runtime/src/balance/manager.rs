//! Load-balancing framework: at each phase boundary, reduce per-node load
//! summaries, decide whether rebalancing is worthwhile, and drive the
//! configured balancer inside a collective epoch so migrations quiesce
//! before the phase advances.

use log::{debug, info};

use plenum_wire::{ByteReader, ByteWriter, Wire, WireErr};

use crate::balance::greedy::GreedyState;
use crate::balance::hierarchical::HierState;
use crate::balance::sampler::{LoadSampler, ObjLoad};
use crate::balance::NodeLoadSummary;
use crate::collective::reduce::manager::ReduceAction;
use crate::collective::reduce::scope::{ReduceScope, ReduceStamp};
use crate::config::LbStrategy;
use crate::messaging::envelope::Envelope;
use crate::runtime::Runtime;
use crate::types::{EntityId, NodeId, Phase};

/// Component ID for load-summary reductions.
const COMPONENT_LB: u32 = 3;

/// What the last phase boundary measured and did; the phase manager's
/// summary line reads this.
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseInfo {
    pub phase: Phase,
    pub ran_lb: bool,
    pub migration_count: u64,
    pub max_load: f64,
    pub avg_load: f64,
    pub imb_load: f64,
    pub max_obj: f64,
    pub max_load_post_lb: f64,
    pub avg_load_post_lb: f64,
}

pub struct LbManager {
    pub(crate) last_phase_info: PhaseInfo,
    pub(crate) greedy: GreedyState,
    pub(crate) hier: HierState,
}

impl LbManager {
    pub fn new() -> Self {
        Self {
            last_phase_info: PhaseInfo::default(),
            greedy: GreedyState::default(),
            hier: HierState::default(),
        }
    }
}

impl Default for LbManager {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) struct LbSummaryMsg {
    pub phase: Phase,
    pub summary: NodeLoadSummary,
}

impl Wire for LbSummaryMsg {
    fn ser(&self, writer: &mut ByteWriter) {
        self.phase.ser(writer);
        self.summary.ser(writer);
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        Ok(Self {
            phase: Phase::de(reader)?,
            summary: NodeLoadSummary::de(reader)?,
        })
    }
}

impl Runtime {
    /// Loads of every element resident here for `phase`, honoring each
    /// collection's focused subphase.
    pub(crate) fn lb_local_loads(&mut self, phase: Phase) -> Vec<ObjLoad> {
        let me = self.node();
        let mut loads = Vec::new();
        let classes: Vec<_> = self.collections.collections.keys().copied().collect();
        for class in classes {
            let instance = self.collections.instance_mut(class);
            let focused = instance.focused_subphase;
            let mut indices: Vec<u64> = instance.elements.keys().copied().collect();
            indices.sort_unstable();
            for index in indices {
                let entity = EntityId::new(class, index);
                let load = self.stats.reported_load(entity, phase, focused);
                loads.push(ObjLoad {
                    entity,
                    node: me,
                    load: load.seconds(),
                });
            }
        }
        loads
    }

    /// Phase-boundary entry: collect the load summary and run the
    /// configured balancer. Collective; returns once all resulting
    /// migrations have quiesced.
    pub(crate) fn lb_run(&mut self, phase: Phase) {
        self.lb.last_phase_info = PhaseInfo {
            phase,
            ..PhaseInfo::default()
        };
        self.lb.greedy.reset(self.num_nodes());
        self.lb.hier.reset();

        self.run_in_epoch_collective("lb-phase-boundary", |rt| {
            let loads = rt.lb_local_loads(phase);
            let this_load: f64 = loads.iter().map(|o| o.load).sum();
            let max_elem = loads.iter().map(|o| o.load).fold(0.0, f64::max);
            let summary = NodeLoadSummary {
                total: this_load,
                max_node: this_load,
                nodes: 1,
                max_elem,
            };
            let summary_handler = rt.sys.lb_summary;
            rt.reduce::<NodeLoadSummary>(
                ReduceScope::Component(COMPONENT_LB),
                Some(ReduceStamp::Tag(phase)),
                rt.sysops.lb_stats,
                NodeId(0),
                &summary,
                ReduceAction::Callback(Box::new(move |rt, combined| {
                    let summary = plenum_wire::from_bytes::<NodeLoadSummary>(combined)
                        .unwrap_or_else(|e| panic!("corrupt load summary: {e}"));
                    rt.broadcast_msg(summary_handler, &LbSummaryMsg { phase, summary });
                })),
            );
        });

        let info = &self.lb.last_phase_info;
        if info.ran_lb {
            info!(
                "lb done: phase={}, migrations={}, pre max/avg={:.6}/{:.6}, \
                 post max/avg={:.6}/{:.6}",
                phase,
                info.migration_count,
                info.max_load,
                info.avg_load,
                info.max_load_post_lb,
                info.avg_load_post_lb
            );
        }
    }

    /// The peel threshold: `clamp(1 - I, min, max) * avg` under auto
    /// thresholding, `min * avg` otherwise.
    pub(crate) fn lb_threshold(&self, summary: &NodeLoadSummary) -> f64 {
        let lb = &self.config.lb;
        let avg = summary.avg();
        if lb.auto_threshold {
            (1.0 - summary.imbalance()).clamp(lb.min_threshold, lb.max_threshold) * avg
        } else {
            lb.min_threshold * avg
        }
    }
}

/// Broadcast of the global load summary: every process decides (with
/// identical inputs) whether to rebalance, then peels its over-threshold
/// load and feeds the configured balancer.
pub(crate) fn on_summary(runtime: &mut Runtime, _envelope: &Envelope, reader: &mut ByteReader) {
    let msg = LbSummaryMsg::de(reader).unwrap_or_else(|e| panic!("corrupt lb summary: {e}"));
    let summary = msg.summary;
    let phase = msg.phase;

    {
        let info = &mut runtime.lb.last_phase_info;
        info.max_load = summary.max_node;
        info.avg_load = summary.avg();
        info.imb_load = summary.imbalance();
        info.max_obj = summary.max_elem;
    }

    let strategy = runtime.config.lb.strategy;
    let tolerance = runtime.config.lb.tolerance;
    if strategy == LbStrategy::None {
        return;
    }
    if summary.imbalance() < tolerance {
        debug!(
            "skipped rebalancing: phase={phase}, imbalance {:.4} under tolerance {:.4}",
            summary.imbalance(),
            tolerance
        );
        return;
    }

    let threshold = runtime.lb_threshold(&summary);
    let extract = runtime.config.lb.extract;
    let mut sampler = LoadSampler::new();
    for obj in runtime.lb_local_loads(phase) {
        sampler.sample(obj);
    }
    let (load_over, remaining) = sampler.calc_load_over(threshold, extract);
    debug!(
        "lb peel: phase={phase}, threshold={threshold:.6}, over={}, remaining={remaining:.6}",
        load_over.len()
    );

    match strategy {
        LbStrategy::Greedy => {
            crate::balance::greedy::start(runtime, phase, load_over, remaining)
        }
        LbStrategy::Hierarchical => {
            crate::balance::hierarchical::start(runtime, phase, threshold, load_over, remaining)
        }
        LbStrategy::None => unreachable!(),
    }
}
