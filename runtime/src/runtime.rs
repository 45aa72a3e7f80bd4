//! The runtime arena: one [`Runtime`] per process owns every manager and
//! is the only access point to them. All cross-manager flows are methods
//! on `Runtime`, implemented in the modules they belong to.

use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;

use log::{info, trace};

use plenum_transport::{Payload, Transport};
use plenum_wire::{to_bytes, ByteReader, ByteWriter, Wire};

use crate::balance::manager::LbManager;
use crate::balance::stats::StatsCollector;
use crate::balance::NodeLoadSummary;
use crate::collective::barrier::BarrierManager;
use crate::collective::reduce::manager::Reducer;
use crate::collective::reduce::ops::{combine_of, CombineOps};
use crate::collective::scope::ScopeManager;
use crate::collective::tree::SpanningTree;
use crate::collection::CollectionManager;
use crate::config::RuntimeConfig;
use crate::epoch::{Epoch, EpochManip};
use crate::location::LocationManager;
use crate::messaging::envelope::{Dest, Envelope};
use crate::messaging::kinds::{HandlerKind, HandlerKinds};
use crate::objgroup::ObjGroupManager;
use crate::pending::PendingEvents;
use crate::phase::PhaseManager;
use crate::rdma::{IndexDesc, RdmaManager};
use crate::scheduler::{Scheduler, SchedulerEvent, TriggerFn};
use crate::termination::TerminationDetector;
use crate::types::{EntityId, HandlerId, NodeId, OpId};
use crate::util::IntervalSet;

/// A message parked while its epoch is suspended; replayed on release.
pub(crate) struct BufferedMsg {
    pub envelope: Envelope,
    pub buffer: Payload,
    pub offset: usize,
}

/// Handler IDs for the runtime's own protocol messages, registered first
/// and in a fixed order so they agree on every node.
pub(crate) struct SystemHandlers {
    pub term_wave_req: HandlerId,
    pub term_wave_up: HandlerId,
    pub term_terminated: HandlerId,
    pub reduce_contrib: HandlerId,
    pub barrier_up: HandlerId,
    pub barrier_down: HandlerId,
    pub scope_run: HandlerId,
    pub epoch_gc: HandlerId,
    pub loc_request: HandlerId,
    pub loc_response: HandlerId,
    pub loc_update: HandlerId,
    pub coll_bcast: HandlerId,
    pub coll_migrate: HandlerId,
    pub rdma_ready: HandlerId,
    pub rdma_layout: HandlerId,
    pub lb_summary: HandlerId,
    pub lb_greedy_collect: HandlerId,
    pub lb_greedy_plan: HandlerId,
    pub lb_hier_up: HandlerId,
    pub lb_hier_down: HandlerId,
}

/// Combine-operator IDs the runtime itself depends on.
pub(crate) struct SystemOps {
    pub none: OpId,
    pub max_u64: OpId,
    pub or_bool: OpId,
    pub isect_iset: OpId,
    pub plus_f64: OpId,
    pub lb_stats: OpId,
    pub merge_layout: OpId,
}

pub struct Runtime {
    pub(crate) transport: Box<dyn Transport>,
    node: NodeId,
    num_nodes: u32,
    pub(crate) config: RuntimeConfig,
    pub(crate) handlers: HandlerKinds,
    pub(crate) ops: CombineOps,
    pub(crate) sched: Scheduler,
    pub(crate) events: PendingEvents,
    pub(crate) epochs: EpochManip,
    pub(crate) term: TerminationDetector,
    pub(crate) reducer: Reducer,
    pub(crate) barriers: BarrierManager,
    pub(crate) scopes: ScopeManager,
    pub(crate) locations: LocationManager,
    pub(crate) collections: CollectionManager,
    pub(crate) objgroups: ObjGroupManager,
    pub(crate) rdma: RdmaManager,
    pub(crate) stats: StatsCollector,
    pub(crate) lb: LbManager,
    pub(crate) phases: PhaseManager,
    pub(crate) sys: SystemHandlers,
    pub(crate) sysops: SystemOps,
    pub(crate) epoch_stack: Vec<Epoch>,
    pub(crate) local_queue: VecDeque<Payload>,
    pub(crate) replay_queue: VecDeque<BufferedMsg>,
    /// The element currently executing a handler; source side of
    /// entity-to-entity communication edges
    pub(crate) current_elm: Option<EntityId>,
    /// Shared entity-class sequence across collections and object groups;
    /// collective allocation order keeps IDs aligned on every node
    next_class: u32,
    /// Data of completed async one-sided gets, keyed by event
    pub(crate) rdma_results: std::collections::HashMap<u64, Vec<u8>>,
    started: bool,
}

impl Runtime {
    pub fn new(transport: Box<dyn Transport>, config: RuntimeConfig) -> Self {
        let node = NodeId(transport.rank());
        let num_nodes = transport.num_ranks();
        assert!(num_nodes > 0, "job must have at least one rank");

        let mut handlers = HandlerKinds::new();
        let sys = SystemHandlers {
            term_wave_req: handlers.register(
                "sys.term.wave_req",
                HandlerKind::Plain(Rc::new(crate::termination::on_wave_request)),
            ),
            term_wave_up: handlers.register(
                "sys.term.wave_up",
                HandlerKind::Plain(Rc::new(crate::termination::on_wave_up)),
            ),
            term_terminated: handlers.register(
                "sys.term.terminated",
                HandlerKind::Plain(Rc::new(crate::termination::on_epoch_terminated)),
            ),
            reduce_contrib: handlers.register(
                "sys.reduce.contrib",
                HandlerKind::Plain(Rc::new(crate::collective::reduce::manager::on_contribution)),
            ),
            barrier_up: handlers.register(
                "sys.barrier.up",
                HandlerKind::Plain(Rc::new(crate::collective::barrier::on_barrier_up)),
            ),
            barrier_down: handlers.register(
                "sys.barrier.down",
                HandlerKind::Plain(Rc::new(crate::collective::barrier::on_barrier_down)),
            ),
            scope_run: handlers.register(
                "sys.scope.run",
                HandlerKind::Plain(Rc::new(crate::collective::scope::on_scope_run)),
            ),
            epoch_gc: handlers.register(
                "sys.epoch.gc",
                HandlerKind::Plain(Rc::new(crate::epoch::gc::on_gc_broadcast)),
            ),
            loc_request: handlers.register(
                "sys.loc.request",
                HandlerKind::Plain(Rc::new(crate::location::on_loc_request)),
            ),
            loc_response: handlers.register(
                "sys.loc.response",
                HandlerKind::Plain(Rc::new(crate::location::on_loc_response)),
            ),
            loc_update: handlers.register(
                "sys.loc.update",
                HandlerKind::Plain(Rc::new(crate::location::on_loc_update)),
            ),
            coll_bcast: handlers.register(
                "sys.coll.bcast",
                HandlerKind::Plain(Rc::new(crate::collection::on_coll_broadcast)),
            ),
            coll_migrate: handlers.register(
                "sys.coll.migrate",
                HandlerKind::Plain(Rc::new(crate::collection::on_migrate_arrival)),
            ),
            rdma_ready: handlers.register(
                "sys.rdma.ready",
                HandlerKind::Plain(Rc::new(crate::rdma::on_handle_ready)),
            ),
            rdma_layout: handlers.register(
                "sys.rdma.layout",
                HandlerKind::Plain(Rc::new(crate::rdma::on_layout_broadcast)),
            ),
            lb_summary: handlers.register(
                "sys.lb.summary",
                HandlerKind::Plain(Rc::new(crate::balance::manager::on_summary)),
            ),
            lb_greedy_collect: handlers.register(
                "sys.lb.greedy.collect",
                HandlerKind::Plain(Rc::new(crate::balance::greedy::on_collect)),
            ),
            lb_greedy_plan: handlers.register(
                "sys.lb.greedy.plan",
                HandlerKind::Plain(Rc::new(crate::balance::greedy::on_plan)),
            ),
            lb_hier_up: handlers.register(
                "sys.lb.hier.up",
                HandlerKind::Plain(Rc::new(crate::balance::hierarchical::on_tree_up)),
            ),
            lb_hier_down: handlers.register(
                "sys.lb.hier.down",
                HandlerKind::Plain(Rc::new(crate::balance::hierarchical::on_tree_down)),
            ),
        };

        let mut ops = CombineOps::new();
        let sysops = SystemOps {
            none: ops.register("sys.op.none", combine_of::<()>(|_, _| ())),
            max_u64: ops.register("sys.op.max.u64", combine_of::<u64>(|a, b| a.max(b))),
            or_bool: ops.register("sys.op.or.bool", combine_of::<bool>(|a, b| a || b)),
            isect_iset: ops.register(
                "sys.op.isect.iset",
                combine_of::<IntervalSet>(|a, b| a.intersect(&b)),
            ),
            plus_f64: ops.register("sys.op.plus.f64", combine_of::<f64>(|a, b| a + b)),
            lb_stats: ops.register(
                "sys.op.lb.stats",
                combine_of::<NodeLoadSummary>(NodeLoadSummary::merge),
            ),
            merge_layout: ops.register(
                "sys.op.merge.layout",
                combine_of::<Vec<IndexDesc>>(|mut a, mut b| {
                    a.append(&mut b);
                    a
                }),
            ),
        };

        Self {
            node,
            num_nodes,
            handlers,
            ops,
            sched: Scheduler::new(config.num_collective_workers),
            events: PendingEvents::new(),
            epochs: EpochManip::new(node, config.epoch_gc_watermark),
            term: TerminationDetector::new(),
            reducer: Reducer::new(),
            barriers: BarrierManager::new(),
            scopes: ScopeManager::new(),
            locations: LocationManager::new(config.loc_cache_size),
            collections: CollectionManager::new(),
            objgroups: ObjGroupManager::new(),
            rdma: RdmaManager::new(),
            stats: StatsCollector::new(),
            lb: LbManager::new(),
            phases: PhaseManager::new(),
            sys,
            sysops,
            epoch_stack: Vec::new(),
            local_queue: VecDeque::new(),
            replay_queue: VecDeque::new(),
            current_elm: None,
            next_class: 0,
            rdma_results: std::collections::HashMap::new(),
            started: false,
            config,
            transport,
        }
    }

    pub(crate) fn alloc_class(&mut self) -> crate::types::ClassId {
        let class = crate::types::ClassId(self.next_class);
        self.next_class += 1;
        class
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn num_nodes(&self) -> u32 {
        self.num_nodes
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Freezes registries and synchronizes all ranks. Handler, operator,
    /// mapper and constructor registration must be complete (and identical
    /// everywhere) before this.
    pub fn start(&mut self) {
        assert!(!self.started, "Runtime::start called twice");
        self.handlers.freeze();
        self.ops.freeze();
        if let Some(path) = self.config.stats_file.clone() {
            let node = self.node;
            self.stats.open_sink(&path, node);
        }
        self.started = true;
        self.transport.system_sync();
        info!(
            "runtime started: node={}, num_nodes={}, handlers={}",
            self.node,
            self.num_nodes,
            self.handlers.len()
        );
    }

    /// Collective teardown: drains outstanding work and synchronizes.
    pub fn finalize(&mut self) {
        self.barrier();
        self.stats.flush_sink();
        self.transport.system_sync();
        info!("runtime finalized: node={}", self.node);
    }

    // ---- epoch context ------------------------------------------------

    /// The epoch new sends are stamped with: top of the context stack, or
    /// no-epoch outside any `run_in_epoch*` body.
    pub fn current_epoch(&self) -> Epoch {
        self.epoch_stack.last().copied().unwrap_or(Epoch::NO_EPOCH)
    }

    /// Runs `body` with `epoch` as the current epoch; the pop is
    /// guaranteed on every exit path of `body`.
    pub fn with_epoch(&mut self, epoch: Epoch, body: impl FnOnce(&mut Runtime)) {
        self.epoch_stack.push(epoch);
        let depth = self.epoch_stack.len();
        body(self);
        assert_eq!(
            self.epoch_stack.len(),
            depth,
            "epoch stack imbalance inside with_epoch body"
        );
        self.epoch_stack.pop();
    }

    /// Runs `body` outside any epoch (system context).
    pub(crate) fn with_no_epoch(&mut self, body: impl FnOnce(&mut Runtime)) {
        self.with_epoch(Epoch::NO_EPOCH, body);
    }

    // ---- trees --------------------------------------------------------

    pub(crate) fn tree(&self) -> SpanningTree {
        SpanningTree::default_tree(self.num_nodes, self.config.tree_fanout, self.node)
    }

    pub(crate) fn tree_rooted_at(&self, root: NodeId) -> SpanningTree {
        SpanningTree::rooted_at(self.num_nodes, self.config.tree_fanout, self.node, root)
    }

    // ---- send plumbing ------------------------------------------------

    fn build_buffer(envelope: &Envelope, payload: &[u8]) -> Payload {
        let mut writer = ByteWriter::with_capacity(64 + payload.len());
        envelope.ser(&mut writer);
        writer.write_bytes(payload);
        Arc::from(writer.into_bytes().into_boxed_slice())
    }

    /// Hands a prebuilt buffer to the transport (or the local queue) with
    /// no termination accounting; callers own the produce balance.
    pub(crate) fn send_raw(&mut self, dest: NodeId, envelope: &Envelope, buffer: Payload) {
        if dest == self.node {
            self.local_queue.push_back(buffer);
        } else {
            self.transport
                .send(dest.0, envelope.handler.0, buffer)
                .unwrap_or_else(|error| panic!("transport send failed: {error}"));
        }
    }

    /// Serializes and sends with no termination accounting.
    pub(crate) fn send_raw_bytes(&mut self, dest: NodeId, envelope: &Envelope, payload: &[u8]) {
        let mut envelope = envelope.clone();
        envelope.payload_len = payload.len() as u32;
        let buffer = Self::build_buffer(&envelope, payload);
        self.send_raw(dest, &envelope, buffer);
    }

    /// Sends a prebuilt buffer. Produces to the envelope's epoch: exactly
    /// one produce per message hop, matched by one consume at dispatch.
    pub(crate) fn post_shared(&mut self, dest: NodeId, envelope: &Envelope, buffer: Payload) {
        if envelope.is_term_counted() {
            self.term.produce(envelope.epoch, 1);
        }
        self.send_raw(dest, envelope, buffer);
    }

    pub(crate) fn post(&mut self, dest: NodeId, mut envelope: Envelope, payload: &[u8]) {
        envelope.payload_len = payload.len() as u32;
        let buffer = Self::build_buffer(&envelope, payload);
        self.post_shared(dest, &envelope, buffer);
    }

    /// Sends a typed message to a handler on `dest`, stamped with the
    /// current epoch.
    pub fn send_msg<M: Wire>(&mut self, dest: NodeId, handler: HandlerId, msg: &M) {
        self.send_in_epoch(dest, handler, self.current_epoch(), msg);
    }

    /// Sends outside any epoch (runtime-internal traffic).
    pub(crate) fn send_system<M: Wire>(&mut self, dest: NodeId, handler: HandlerId, msg: &M) {
        self.send_in_epoch(dest, handler, Epoch::NO_EPOCH, msg);
    }

    pub(crate) fn send_in_epoch<M: Wire>(
        &mut self,
        dest: NodeId,
        handler: HandlerId,
        epoch: Epoch,
        msg: &M,
    ) {
        assert!(dest.is_valid(), "send to uninitialized destination");
        let payload = to_bytes(msg);
        let envelope = Envelope {
            source: self.node,
            dest: Dest::Node(dest),
            handler,
            epoch,
            reduce: None,
            hops: 0,
            from_elm: self.current_elm,
            payload_len: payload.len() as u32,
        };
        trace!(
            "send: dest={}, handler={}, epoch={}, bytes={}",
            dest,
            handler.0,
            epoch,
            payload.len()
        );
        self.post(dest, envelope, &payload);
    }

    /// Broadcasts a typed message to every node (including this one),
    /// relayed down the spanning tree rooted here.
    pub fn broadcast_msg<M: Wire>(&mut self, handler: HandlerId, msg: &M) {
        self.broadcast_in_epoch(handler, self.current_epoch(), msg);
    }

    pub(crate) fn broadcast_system<M: Wire>(&mut self, handler: HandlerId, msg: &M) {
        self.broadcast_in_epoch(handler, Epoch::NO_EPOCH, msg);
    }

    pub(crate) fn broadcast_in_epoch<M: Wire>(&mut self, handler: HandlerId, epoch: Epoch, msg: &M) {
        let payload = to_bytes(msg);
        let envelope = Envelope {
            source: self.node,
            dest: Dest::Broadcast { root: self.node },
            handler,
            epoch,
            reduce: None,
            hops: 0,
            from_elm: self.current_elm,
            payload_len: payload.len() as u32,
        };
        let buffer = Self::build_buffer(&envelope, &payload);
        let children = self.tree_rooted_at(self.node).children();
        trace!(
            "broadcast: handler={}, epoch={}, children={:?}",
            handler.0,
            epoch,
            children
        );
        for child in children {
            self.post_shared(child, &envelope, buffer.clone());
        }
        // the local delivery; never relayed again because root == this node
        self.post_shared(self.node, &envelope, buffer);
    }

    // ---- progress -----------------------------------------------------

    /// One unit of progress: replay one released message, or deliver one
    /// local/arrived buffer. Returns whether anything was done.
    pub(crate) fn progress_once(&mut self) -> bool {
        if let Some(buffered) = self.replay_queue.pop_front() {
            self.deliver_parsed(buffered.envelope, buffered.buffer, buffered.offset, false);
            return true;
        }
        if let Some(buffer) = self.local_queue.pop_front() {
            self.deliver(buffer);
            return true;
        }
        if let Some((_, buffer)) = self.transport.probe() {
            self.deliver(buffer);
            return true;
        }
        false
    }

    fn deliver(&mut self, buffer: Payload) {
        let mut reader = ByteReader::new(&buffer);
        let envelope =
            Envelope::de(&mut reader).unwrap_or_else(|error| panic!("corrupt envelope: {error}"));
        let offset = buffer.len() - reader.remaining();
        drop(reader);
        self.deliver_parsed(envelope, buffer, offset, true);
    }

    pub(crate) fn deliver_parsed(
        &mut self,
        envelope: Envelope,
        buffer: Payload,
        offset: usize,
        relay: bool,
    ) {
        if relay {
            if let Dest::Broadcast { root } = envelope.dest {
                if root != self.node {
                    let children = self.tree_rooted_at(root).children();
                    for child in children {
                        self.post_shared(child, &envelope, buffer.clone());
                    }
                }
            }
        }

        // suspended-epoch gate: park unconsumed so the epoch stays open
        if envelope.is_term_counted() && self.term.is_suspended(envelope.epoch) {
            trace!("buffering message for suspended epoch {}", envelope.epoch);
            let epoch = envelope.epoch;
            self.buffer_unreleased(
                epoch,
                BufferedMsg {
                    envelope,
                    buffer,
                    offset,
                },
            );
            return;
        }

        match envelope.dest {
            Dest::Entity { .. } => crate::location::on_entity_arrival(self, envelope, buffer, offset),
            _ => self.dispatch(envelope, &buffer[offset..]),
        }
    }

    /// Consumes from the envelope's epoch and runs the handler with that
    /// epoch as current context.
    pub(crate) fn dispatch(&mut self, envelope: Envelope, payload: &[u8]) {
        if envelope.is_term_counted() {
            self.term.consume(envelope.epoch, 1);
        }
        let kind = self
            .handlers
            .get(envelope.handler)
            .unwrap_or_else(|error| panic!("{error}"));
        let pushed = !envelope.epoch.is_no_epoch();
        if pushed {
            self.epoch_stack.push(envelope.epoch);
        }
        match kind {
            HandlerKind::Plain(f) => {
                let mut reader = ByteReader::new(payload);
                f(self, &envelope, &mut reader);
            }
            HandlerKind::Instance(_) => {
                panic!(
                    "handler '{}' is instance-bound and requires an entity destination",
                    self.handlers.name_of(envelope.handler).unwrap_or("?")
                );
            }
        }
        if pushed {
            self.epoch_stack.pop();
        }
    }

    fn fire_event(&mut self, event: SchedulerEvent) {
        if event == SchedulerEvent::BeginIdle {
            self.term_on_idle();
        }
        let triggers = self.sched.triggers_for(event);
        for trigger in triggers {
            trigger(self);
        }
    }

    /// Registers a scheduler-event trigger.
    pub fn register_trigger(&mut self, event: SchedulerEvent, f: impl Fn(&mut Runtime) + 'static) {
        self.sched.register_trigger(event, Rc::new(f) as TriggerFn);
    }

    /// Drives progress until the currently available work drains.
    pub fn run_scheduler(&mut self) {
        self.fire_event(SchedulerEvent::PendingSchedulerLoop);
        self.sched.enter();
        self.fire_event(SchedulerEvent::BeginSchedulerLoop);
        while self.progress_once() {}
        if let Some(edge) = self.sched.note(false) {
            self.fire_event(edge);
        }
        self.fire_event(SchedulerEvent::EndSchedulerLoop);
        self.sched.exit();
    }

    /// Drives progress until `pred` turns false. Nesting is legal; this is
    /// how every blocking primitive is built.
    pub fn run_scheduler_while(&mut self, mut pred: impl FnMut(&mut Runtime) -> bool) {
        self.fire_event(SchedulerEvent::PendingSchedulerLoop);
        self.sched.enter();
        self.fire_event(SchedulerEvent::BeginSchedulerLoop);
        while pred(self) {
            let did_work = self.progress_once();
            if let Some(edge) = self.sched.note(did_work) {
                self.fire_event(edge);
            }
            if !did_work {
                // let sibling ranks run; single-threaded per process
                std::thread::yield_now();
            }
        }
        self.fire_event(SchedulerEvent::EndSchedulerLoop);
        self.sched.exit();
    }

    // ---- registration -------------------------------------------------

    /// Registers a plain active handler for messages of type `M`.
    /// Collective: every node must register the same name in the same
    /// order, before [`Runtime::start`].
    pub fn register_handler<M: Wire + 'static>(
        &mut self,
        name: &str,
        f: fn(&mut Runtime, &Envelope, M),
    ) -> HandlerId {
        let owned = name.to_string();
        self.handlers.register(
            name,
            HandlerKind::Plain(Rc::new(move |rt, envelope, reader| {
                let msg = M::de(reader).unwrap_or_else(|error| {
                    panic!("corrupt payload for handler '{owned}': {error}")
                });
                f(rt, envelope, msg);
            })),
        )
    }

    /// Registers a commutative-associative combine operator for type `T`.
    pub fn register_op<T: Wire + 'static>(&mut self, name: &str, f: fn(T, T) -> T) -> OpId {
        self.ops.register(name, combine_of::<T>(f))
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("node", &self.node)
            .field("num_nodes", &self.num_nodes)
            .field("depth", &self.sched.depth())
            .finish()
    }
}
