use std::collections::{BTreeMap, HashMap};

use log::trace;

use plenum_wire::{to_bytes, ByteReader, Wire};

use crate::collective::reduce::scope::{ReduceScope, ReduceStamp};
use crate::collective::tree::SpanningTree;
use crate::messaging::envelope::{Dest, Envelope, ReduceBlock};
use crate::messaging::kinds::HandlerKind;
use crate::runtime::Runtime;
use crate::types::{HandlerId, NodeId, OpId};

/// What happens to the combined value on the reduction root.
pub enum ReduceAction {
    None,
    /// Dispatch a registered handler on the root (which typically
    /// broadcasts the result)
    Handler(HandlerId),
    /// Invoke a root-local callback with the combined bytes
    Callback(Box<dyn FnOnce(&mut Runtime, &[u8])>),
}

struct ReduceState {
    contributions: Vec<Vec<u8>>,
    local_contributed: bool,
    action: ReduceAction,
}

impl ReduceState {
    fn new() -> Self {
        Self {
            contributions: Vec::new(),
            local_contributed: false,
            action: ReduceAction::None,
        }
    }
}

/// Scope- and stamp-keyed reduction engine. One contribution per process
/// per `(scope, stamp)`; sub-tree results collapse upward through the
/// registered combine operator until the root delivers.
pub struct Reducer {
    states: HashMap<(ReduceScope, ReduceStamp), ReduceState>,
    next_seq: HashMap<ReduceScope, u64>,
    /// Root side: completed seq-stamped reductions held until their
    /// predecessors deliver
    held_at_root: HashMap<ReduceScope, BTreeMap<u64, (Vec<u8>, ReduceAction)>>,
    next_root_seq: HashMap<ReduceScope, u64>,
    /// Explicit member lists for group scopes; everything else uses the
    /// default tree rotated to the reduction root
    groups: HashMap<u64, Vec<NodeId>>,
}

impl Reducer {
    pub fn new() -> Self {
        Self {
            states: HashMap::new(),
            next_seq: HashMap::new(),
            held_at_root: HashMap::new(),
            next_root_seq: HashMap::new(),
            groups: HashMap::new(),
        }
    }

    fn generate_stamp(&mut self, scope: ReduceScope) -> ReduceStamp {
        let seq = self.next_seq.entry(scope).or_insert(0);
        let stamp = ReduceStamp::Seq(*seq);
        *seq += 1;
        stamp
    }
}

impl Default for Reducer {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    /// Registers the member list backing a group reduce scope. Group
    /// scopes never form lazily: their spanning tree is not the default
    /// one, so the membership must be declared identically on every
    /// member first.
    pub fn register_reduce_group(&mut self, group: u64, members: Vec<NodeId>) {
        self.reducer.groups.insert(group, members);
    }

    /// Contributes this process's value to the reduction identified by
    /// `(scope, stamp)`. With `stamp == None` a per-scope sequence stamp
    /// is generated; call order per scope must then be identical on every
    /// process. Returns the stamp in use.
    pub fn reduce<T: Wire>(
        &mut self,
        scope: ReduceScope,
        stamp: Option<ReduceStamp>,
        op: OpId,
        root: NodeId,
        value: &T,
        action: ReduceAction,
    ) -> ReduceStamp {
        self.reduce_raw(scope, stamp, op, root, to_bytes(value), action)
    }

    pub fn reduce_raw(
        &mut self,
        scope: ReduceScope,
        stamp: Option<ReduceStamp>,
        op: OpId,
        root: NodeId,
        value: Vec<u8>,
        action: ReduceAction,
    ) -> ReduceStamp {
        let stamp = match stamp {
            Some(stamp) => stamp,
            None => self.reducer.generate_stamp(scope),
        };
        trace!(
            "reduce contribute: scope={:?}, stamp={:?}, op={}, root={}",
            scope,
            stamp,
            op.0,
            root
        );
        let state = self
            .reducer
            .states
            .entry((scope, stamp))
            .or_insert_with(ReduceState::new);
        assert!(
            !state.local_contributed,
            "process {} contributed twice to reduction (scope {:?}, stamp {:?})",
            self.node(),
            scope,
            stamp
        );
        state.local_contributed = true;
        state.contributions.push(value);
        state.action = action;
        self.try_complete_reduce(scope, stamp, op, root);
        stamp
    }

    fn reduce_tree(&self, scope: ReduceScope, root: NodeId) -> SpanningTree {
        match scope {
            ReduceScope::Group(group) => {
                let members = self
                    .reducer
                    .groups
                    .get(&group)
                    .unwrap_or_else(|| panic!("group scope {group} used before registration"))
                    .clone();
                SpanningTree::for_group(members, self.config.tree_fanout, self.node())
            }
            _ => SpanningTree::rooted_at(
                self.num_nodes(),
                self.config.tree_fanout,
                self.node(),
                root,
            ),
        }
    }

    fn try_complete_reduce(
        &mut self,
        scope: ReduceScope,
        stamp: ReduceStamp,
        op: OpId,
        root: NodeId,
    ) {
        let tree = self.reduce_tree(scope, root);
        let expected = tree.num_children() + 1;
        {
            let state = self
                .reducer
                .states
                .get(&(scope, stamp))
                .expect("reduce state exists");
            if !state.local_contributed || state.contributions.len() < expected {
                return;
            }
            assert!(
                state.contributions.len() == expected,
                "reduction (scope {:?}, stamp {:?}) received {} contributions, expected {}",
                scope,
                stamp,
                state.contributions.len(),
                expected
            );
        }
        let state = self
            .reducer
            .states
            .remove(&(scope, stamp))
            .expect("reduce state exists");

        let combine = self
            .ops
            .get(op)
            .unwrap_or_else(|error| panic!("{error}"));
        let mut contributions = state.contributions.into_iter();
        let mut combined = contributions.next().expect("at least the local contribution");
        for contribution in contributions {
            combined = combine(&combined, &contribution);
        }

        if tree.is_root() {
            self.deliver_reduce_root(scope, stamp, combined, state.action);
        } else {
            let envelope = Envelope {
                source: self.node(),
                dest: Dest::Node(tree.parent()),
                handler: self.sys.reduce_contrib,
                epoch: self.current_epoch(),
                reduce: Some(ReduceBlock {
                    root,
                    scope,
                    stamp,
                    op,
                }),
                hops: 0,
                from_elm: None,
                payload_len: combined.len() as u32,
            };
            self.post(tree.parent(), envelope, &combined);
        }
    }

    fn deliver_reduce_root(
        &mut self,
        scope: ReduceScope,
        stamp: ReduceStamp,
        combined: Vec<u8>,
        action: ReduceAction,
    ) {
        // seq stamps deliver in order; everything else is independent
        if let ReduceStamp::Seq(seq) = stamp {
            let next = self.reducer.next_root_seq.entry(scope).or_insert(0);
            if seq != *next {
                trace!(
                    "reduce root: holding out-of-order stamp {seq} (next is {next}) for {:?}",
                    scope
                );
                self.reducer
                    .held_at_root
                    .entry(scope)
                    .or_default()
                    .insert(seq, (combined, action));
                return;
            }
        }
        self.run_reduce_action(scope, stamp, combined, action);
        if matches!(stamp, ReduceStamp::Seq(_)) {
            loop {
                let next = *self.reducer.next_root_seq.entry(scope).or_insert(0);
                let held = match self
                    .reducer
                    .held_at_root
                    .get_mut(&scope)
                    .and_then(|held| held.remove(&next))
                {
                    Some(held) => held,
                    None => break,
                };
                self.run_reduce_action(scope, ReduceStamp::Seq(next), held.0, held.1);
            }
        }
    }

    fn run_reduce_action(
        &mut self,
        scope: ReduceScope,
        stamp: ReduceStamp,
        combined: Vec<u8>,
        action: ReduceAction,
    ) {
        if let ReduceStamp::Seq(_) = stamp {
            *self.reducer.next_root_seq.entry(scope).or_insert(0) += 1;
        }
        trace!("reduce root deliver: scope={:?}, stamp={:?}", scope, stamp);
        match action {
            ReduceAction::None => {}
            ReduceAction::Callback(callback) => callback(self, &combined),
            ReduceAction::Handler(handler) => {
                let kind = self
                    .handlers
                    .get(handler)
                    .unwrap_or_else(|error| panic!("{error}"));
                let HandlerKind::Plain(f) = kind else {
                    panic!("reduce root action handler must be a plain handler");
                };
                let envelope = Envelope {
                    source: self.node(),
                    dest: Dest::Node(self.node()),
                    handler,
                    epoch: self.current_epoch(),
                    reduce: None,
                    hops: 0,
                    from_elm: None,
                    payload_len: combined.len() as u32,
                };
                let mut reader = ByteReader::new(&combined);
                f(self, &envelope, &mut reader);
            }
        }
    }
}

/// System handler: a combined contribution arriving from a child in the
/// spanning tree.
pub(crate) fn on_contribution(runtime: &mut Runtime, envelope: &Envelope, reader: &mut ByteReader) {
    let block = envelope
        .reduce
        .expect("reduce contribution without a reduce block");
    let value = reader
        .read_bytes(reader.remaining())
        .expect("payload readable")
        .to_vec();
    let state = runtime
        .reducer
        .states
        .entry((block.scope, block.stamp))
        .or_insert_with(ReduceState::new);
    state.contributions.push(value);
    runtime.try_complete_reduce(block.scope, block.stamp, block.op, block.root);
}
