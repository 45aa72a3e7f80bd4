//! Centralized greedy balancer: every process peels its over-threshold
//! elements and reports them (with its residual load profile) to rank 0,
//! which assigns the heaviest unplaced element to the lightest process
//! with a max-heap / min-heap sweep, then broadcasts the full plan; each
//! process filters and enacts its own migrations.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use log::debug;

use plenum_wire::{ByteReader, ByteWriter, Wire, WireErr};

use crate::balance::sampler::ObjLoad;
use crate::messaging::envelope::Envelope;
use crate::runtime::Runtime;
use crate::types::{EntityId, NodeId, Phase};

/// Root-side collection state for one balancer run.
#[derive(Default)]
pub struct GreedyState {
    expected: u32,
    reports: Vec<(NodeId, f64, Vec<ObjLoad>)>,
}

impl GreedyState {
    pub(crate) fn reset(&mut self, num_nodes: u32) {
        self.expected = num_nodes;
        self.reports.clear();
    }
}

struct GreedyCollectMsg {
    phase: Phase,
    this_load: f64,
    load_over: Vec<ObjLoad>,
}

/// One migration order; `broadcast + filter` distribution means every
/// process sees the whole plan and enacts the orders it sources.
pub(crate) struct MigrateOrder {
    pub entity: EntityId,
    pub from: NodeId,
    pub to: NodeId,
}

struct GreedyPlanMsg {
    phase: Phase,
    plan: Vec<MigrateOrder>,
    post_max: f64,
    post_avg: f64,
}

impl Wire for GreedyCollectMsg {
    fn ser(&self, writer: &mut ByteWriter) {
        self.phase.ser(writer);
        self.this_load.ser(writer);
        self.load_over.ser(writer);
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        Ok(Self {
            phase: Phase::de(reader)?,
            this_load: f64::de(reader)?,
            load_over: Vec::<ObjLoad>::de(reader)?,
        })
    }
}

impl Wire for MigrateOrder {
    fn ser(&self, writer: &mut ByteWriter) {
        self.entity.ser(writer);
        self.from.ser(writer);
        self.to.ser(writer);
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        Ok(Self {
            entity: EntityId::de(reader)?,
            from: NodeId::de(reader)?,
            to: NodeId::de(reader)?,
        })
    }
}

impl Wire for GreedyPlanMsg {
    fn ser(&self, writer: &mut ByteWriter) {
        self.phase.ser(writer);
        self.plan.ser(writer);
        self.post_max.ser(writer);
        self.post_avg.ser(writer);
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        Ok(Self {
            phase: Phase::de(reader)?,
            plan: Vec::<MigrateOrder>::de(reader)?,
            post_max: f64::de(reader)?,
            post_avg: f64::de(reader)?,
        })
    }
}

/// A process's projected load while the root assigns elements; min-heap
/// ordering with the node ID as a stable tie-break.
#[derive(Debug, Clone, Copy, PartialEq)]
struct ProcLoad {
    load: f64,
    node: NodeId,
}

impl Eq for ProcLoad {}

impl PartialOrd for ProcLoad {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ProcLoad {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.load
            .total_cmp(&other.load)
            .then_with(|| self.node.cmp(&other.node))
    }
}

/// Every participating process reports once to rank 0.
pub(crate) fn start(runtime: &mut Runtime, phase: Phase, load_over: Vec<ObjLoad>, this_load: f64) {
    let collect = runtime.sys.lb_greedy_collect;
    runtime.send_msg(
        NodeId(0),
        collect,
        &GreedyCollectMsg {
            phase,
            this_load,
            load_over,
        },
    );
}

pub(crate) fn on_collect(runtime: &mut Runtime, envelope: &Envelope, reader: &mut ByteReader) {
    let msg = GreedyCollectMsg::de(reader).unwrap_or_else(|e| panic!("corrupt greedy report: {e}"));
    runtime
        .lb
        .greedy
        .reports
        .push((envelope.source, msg.this_load, msg.load_over));
    if runtime.lb.greedy.reports.len() < runtime.lb.greedy.expected as usize {
        return;
    }
    let reports = std::mem::take(&mut runtime.lb.greedy.reports);
    run_balancer(runtime, msg.phase, reports);
}

/// Root only: the max-heap / min-heap assignment.
fn run_balancer(runtime: &mut Runtime, phase: Phase, reports: Vec<(NodeId, f64, Vec<ObjLoad>)>) {
    let mut elements = BinaryHeap::new();
    let mut procs = BinaryHeap::new();
    for (node, residual, load_over) in reports {
        procs.push(Reverse(ProcLoad {
            load: residual,
            node,
        }));
        for obj in load_over {
            elements.push(obj);
        }
    }

    let mut plan = Vec::new();
    while let Some(obj) = elements.pop() {
        let Reverse(mut lightest) = procs.pop().expect("at least one process");
        lightest.load += obj.load;
        if lightest.node != obj.node {
            plan.push(MigrateOrder {
                entity: obj.entity,
                from: obj.node,
                to: lightest.node,
            });
        }
        procs.push(Reverse(lightest));
    }

    let loads: Vec<f64> = procs.iter().map(|Reverse(p)| p.load).collect();
    let post_max = loads.iter().copied().fold(0.0, f64::max);
    let post_avg = loads.iter().sum::<f64>() / loads.len().max(1) as f64;
    debug!(
        "greedy plan: phase={phase}, migrations={}, post max/avg={post_max:.6}/{post_avg:.6}",
        plan.len()
    );

    let plan_handler = runtime.sys.lb_greedy_plan;
    runtime.broadcast_msg(
        plan_handler,
        &GreedyPlanMsg {
            phase,
            plan,
            post_max,
            post_avg,
        },
    );
}

pub(crate) fn on_plan(runtime: &mut Runtime, _envelope: &Envelope, reader: &mut ByteReader) {
    let msg = GreedyPlanMsg::de(reader).unwrap_or_else(|e| panic!("corrupt greedy plan: {e}"));
    {
        let info = &mut runtime.lb.last_phase_info;
        info.ran_lb = true;
        info.migration_count = msg.plan.len() as u64;
        info.max_load_post_lb = msg.post_max;
        info.avg_load_post_lb = msg.post_avg;
    }
    if msg.plan.is_empty() {
        debug!("skipped rebalancing: greedy produced no migrations");
        return;
    }
    let me = runtime.node();
    for order in msg.plan {
        if order.from == me {
            runtime.migrate_element_raw(order.entity.class, order.entity.index, order.to);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ClassId;

    #[test]
    fn proc_heap_orders_by_load_then_node() {
        let mut heap = BinaryHeap::new();
        heap.push(Reverse(ProcLoad {
            load: 2.0,
            node: NodeId(0),
        }));
        heap.push(Reverse(ProcLoad {
            load: 1.0,
            node: NodeId(2),
        }));
        heap.push(Reverse(ProcLoad {
            load: 1.0,
            node: NodeId(1),
        }));
        assert_eq!(heap.pop().unwrap().0.node, NodeId(1));
        assert_eq!(heap.pop().unwrap().0.node, NodeId(2));
        assert_eq!(heap.pop().unwrap().0.node, NodeId(0));
    }

    #[test]
    fn element_heap_pops_heaviest_first() {
        let mut heap = BinaryHeap::new();
        for (index, load) in [(0u64, 0.1), (1, 0.9), (2, 0.5)] {
            heap.push(ObjLoad {
                entity: EntityId::new(ClassId(0), index),
                node: NodeId(0),
                load,
            });
        }
        assert_eq!(heap.pop().unwrap().entity.index, 1);
        assert_eq!(heap.pop().unwrap().entity.index, 2);
        assert_eq!(heap.pop().unwrap().entity.index, 0);
    }
}
