//! Hierarchical balancer: a 4-ary tree over processes. Leaves report
//! their over-threshold elements upward; interior nodes absorb what their
//! subtree has capacity for (repeatedly granting to the child with the
//! smallest load/weight ratio) and pass the residual up; the root
//! performs a final redistribution. Assignments descend the same tree,
//! and each final holder pulls its elements from their current owners.

use std::collections::HashMap;

use log::debug;

use plenum_wire::{ByteReader, ByteWriter, Wire, WireErr};

use crate::balance::sampler::ObjLoad;
use crate::collective::tree::SpanningTree;
use crate::messaging::envelope::Envelope;
use crate::runtime::Runtime;
use crate::types::{EntityId, NodeId, Phase};

/// Internal tree fan-out; fixed, independent of the messaging tree.
const HIER_FANOUT: u32 = 4;

/// Per-run state at one process.
#[derive(Default)]
pub struct HierState {
    threshold: f64,
    /// residual load at this process after peeling
    own_load: f64,
    own_excess: Vec<ObjLoad>,
    reports: Vec<SubtreeReport>,
    /// projected (load, weight) per child subtree, kept current through
    /// the descent so later grants see earlier ones
    child_meta: HashMap<NodeId, (f64, u64)>,
    /// set once the local peel has run; child reports may arrive first
    started: bool,
    reported_up: bool,
}

impl HierState {
    pub(crate) fn reset(&mut self) {
        *self = HierState::default();
    }
}

#[derive(Clone)]
struct SubtreeReport {
    child: NodeId,
    load: f64,
    weight: u64,
    excess: Vec<ObjLoad>,
}

enum HierUpMsg {
    /// A child subtree's residual report
    Report {
        phase: Phase,
        load: f64,
        weight: u64,
        excess: Vec<ObjLoad>,
    },
    /// A final holder pulling its assigned elements from their owner
    Pull { entities: Vec<EntityId> },
}

struct HierDownMsg {
    phase: Phase,
    objs: Vec<ObjLoad>,
}

impl Wire for HierUpMsg {
    fn ser(&self, writer: &mut ByteWriter) {
        match self {
            HierUpMsg::Report {
                phase,
                load,
                weight,
                excess,
            } => {
                writer.write_byte(0);
                phase.ser(writer);
                load.ser(writer);
                weight.ser(writer);
                excess.ser(writer);
            }
            HierUpMsg::Pull { entities } => {
                writer.write_byte(1);
                entities.ser(writer);
            }
        }
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        match reader.read_byte()? {
            0 => Ok(HierUpMsg::Report {
                phase: Phase::de(reader)?,
                load: f64::de(reader)?,
                weight: u64::de(reader)?,
                excess: Vec::<ObjLoad>::de(reader)?,
            }),
            1 => Ok(HierUpMsg::Pull {
                entities: Vec::<EntityId>::de(reader)?,
            }),
            value => Err(WireErr::BadDiscriminant {
                value: value as u64,
                type_name: "HierUpMsg",
            }),
        }
    }
}

impl Wire for HierDownMsg {
    fn ser(&self, writer: &mut ByteWriter) {
        self.phase.ser(writer);
        self.objs.ser(writer);
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        Ok(Self {
            phase: Phase::de(reader)?,
            objs: Vec::<ObjLoad>::de(reader)?,
        })
    }
}

fn hier_tree(runtime: &Runtime) -> SpanningTree {
    SpanningTree::default_tree(runtime.num_nodes(), HIER_FANOUT, runtime.node())
}

impl Runtime {
    fn hier_try_combine(&mut self, phase: Phase) {
        let tree = hier_tree(self);
        let expected = tree.num_children();
        let state = &self.lb.hier;
        if !state.started || state.reports.len() < expected || state.reported_up {
            return;
        }
        self.lb.hier.reported_up = true;

        // pool everything this subtree could not place below
        let me = self.node();
        let state = &mut self.lb.hier;
        let mut pool: Vec<ObjLoad> = std::mem::take(&mut state.own_excess);
        let mut targets: Vec<SubtreeReport> = vec![SubtreeReport {
            child: me,
            load: state.own_load,
            weight: 1,
            excess: Vec::new(),
        }];
        for report in state.reports.drain(..) {
            pool.extend(report.excess.iter().copied());
            targets.push(SubtreeReport {
                child: report.child,
                load: report.load,
                weight: report.weight,
                excess: Vec::new(),
            });
        }
        let threshold = state.threshold;
        let is_root = tree.is_root();

        let (assignments, residual, totals) =
            distribute(pool, &mut targets, threshold, is_root);

        // remember the projected subtree loads for the descent phase
        for target in &targets {
            if target.child == me {
                self.lb.hier.own_load = target.load;
            } else {
                self.lb
                    .hier
                    .child_meta
                    .insert(target.child, (target.load, target.weight));
            }
        }

        for (child, objs) in assignments {
            if child == me {
                self.hier_finalize(objs);
            } else {
                let down = self.sys.lb_hier_down;
                self.send_msg(child, down, &HierDownMsg { phase, objs });
            }
        }

        if !is_root {
            let parent = tree.parent();
            let up = self.sys.lb_hier_up;
            self.send_msg(
                parent,
                up,
                &HierUpMsg::Report {
                    phase,
                    load: totals.0,
                    weight: totals.1,
                    excess: residual,
                },
            );
        } else {
            debug_assert!(residual.is_empty(), "root redistribution leaves no residual");
        }
    }

    /// Assignments that ended here: pull each element from its current
    /// owner (no-op for elements already local).
    fn hier_finalize(&mut self, objs: Vec<ObjLoad>) {
        let me = self.node();
        let mut pulls: HashMap<NodeId, Vec<EntityId>> = HashMap::new();
        for obj in objs {
            if obj.node != me {
                pulls.entry(obj.node).or_default().push(obj.entity);
            }
        }
        for (owner, entities) in pulls {
            let up = self.sys.lb_hier_up;
            self.send_msg(owner, up, &HierUpMsg::Pull { entities });
        }
    }
}

/// Grants pool elements to the target with the smallest load/weight ratio
/// until targets saturate at the threshold (non-root) or the pool drains
/// (root). Returns per-target assignments, the residual, and this
/// subtree's (load, weight) totals.
fn distribute(
    mut pool: Vec<ObjLoad>,
    targets: &mut [SubtreeReport],
    threshold: f64,
    assign_all: bool,
) -> (Vec<(NodeId, Vec<ObjLoad>)>, Vec<ObjLoad>, (f64, u64)) {
    // heaviest first so large grains land where there is the most room
    pool.sort_unstable_by(|a, b| b.cmp(a));
    let mut assignments: HashMap<NodeId, Vec<ObjLoad>> = HashMap::new();
    let mut residual = Vec::new();

    for obj in pool {
        let target = targets
            .iter_mut()
            .min_by(|a, b| {
                (a.load / a.weight as f64).total_cmp(&(b.load / b.weight as f64))
            })
            .expect("at least the local target");
        let ratio = target.load / target.weight as f64;
        if !assign_all && ratio >= threshold {
            residual.push(obj);
            continue;
        }
        target.load += obj.load;
        assignments.entry(target.child).or_default().push(obj);
    }

    let load: f64 = targets.iter().map(|t| t.load).sum();
    let weight: u64 = targets.iter().map(|t| t.weight).sum();
    let mut ordered: Vec<(NodeId, Vec<ObjLoad>)> = assignments.into_iter().collect();
    ordered.sort_unstable_by_key(|(node, _)| *node);
    (ordered, residual, (load, weight))
}

/// Entry after the summary broadcast: prime the local state and, at the
/// leaves, report immediately.
pub(crate) fn start(
    runtime: &mut Runtime,
    phase: Phase,
    threshold: f64,
    load_over: Vec<ObjLoad>,
    this_load: f64,
) {
    {
        let state = &mut runtime.lb.hier;
        state.threshold = threshold;
        state.own_load = this_load;
        state.own_excess = load_over;
        state.started = true;
    }
    runtime.lb.last_phase_info.ran_lb = true;
    debug!(
        "hier start: phase={phase}, threshold={threshold:.6}, excess={}",
        runtime.lb.hier.own_excess.len()
    );
    runtime.hier_try_combine(phase);
}

pub(crate) fn on_tree_up(runtime: &mut Runtime, envelope: &Envelope, reader: &mut ByteReader) {
    let msg = HierUpMsg::de(reader).unwrap_or_else(|e| panic!("corrupt hierarchy message: {e}"));
    match msg {
        HierUpMsg::Report {
            phase,
            load,
            weight,
            excess,
        } => {
            runtime.lb.hier.reports.push(SubtreeReport {
                child: envelope.source,
                load,
                weight,
                excess,
            });
            runtime.hier_try_combine(phase);
        }
        HierUpMsg::Pull { entities } => {
            let dest = envelope.source;
            runtime.lb.last_phase_info.migration_count += entities.len() as u64;
            for entity in entities {
                runtime.migrate_element_raw(entity.class, entity.index, dest);
            }
        }
    }
}

/// Assignments descending into this subtree: redistribute among self and
/// children, assigning everything (capacity was already accounted above).
pub(crate) fn on_tree_down(runtime: &mut Runtime, _envelope: &Envelope, reader: &mut ByteReader) {
    let msg = HierDownMsg::de(reader).unwrap_or_else(|e| panic!("corrupt hierarchy message: {e}"));
    let tree = hier_tree(runtime);
    let me = runtime.node();

    let mut targets = vec![SubtreeReport {
        child: me,
        load: runtime.lb.hier.own_load,
        weight: 1,
        excess: Vec::new(),
    }];
    for child in tree.children() {
        let (load, weight) = runtime
            .lb
            .hier
            .child_meta
            .get(&child)
            .copied()
            .unwrap_or_else(|| {
                let child_tree =
                    SpanningTree::default_tree(runtime.num_nodes(), HIER_FANOUT, child);
                (0.0, child_tree.num_descendants() as u64 + 1)
            });
        targets.push(SubtreeReport {
            child,
            load,
            weight,
            excess: Vec::new(),
        });
    }

    let (assignments, residual, _) =
        distribute(msg.objs, &mut targets, runtime.lb.hier.threshold, true);
    debug_assert!(residual.is_empty());

    for target in &targets {
        if target.child == me {
            runtime.lb.hier.own_load = target.load;
        } else {
            runtime
                .lb
                .hier
                .child_meta
                .insert(target.child, (target.load, target.weight));
        }
    }

    for (child, objs) in assignments {
        if child == me {
            runtime.hier_finalize(objs);
        } else {
            let down = runtime.sys.lb_hier_down;
            runtime.send_msg(child, down, &HierDownMsg {
                phase: msg.phase,
                objs,
            });
        }
    }
}
