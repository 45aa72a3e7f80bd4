//! Indexed collections: overdecomposed elements distributed over all
//! processes by a mapping function, constructed collectively, routed
//! through the location layer, and migrated for load balancing.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::rc::Rc;

use log::{debug, trace};

use plenum_wire::{to_bytes, ByteReader, ByteWriter, Wire, WireErr};

use crate::balance::stats::CommKey;
use crate::collective::reduce::manager::ReduceAction;
use crate::collective::reduce::scope::{ReduceScope, ReduceStamp};
use crate::messaging::envelope::{Dest, Envelope};
use crate::messaging::kinds::HandlerKind;
use crate::runtime::Runtime;
use crate::types::{ClassId, EntityId, HandlerId, NodeId, OpId, Phase, SubPhase};

/// A collection element: migratable state addressed by index.
pub trait Element: 'static {
    /// Serializes the element for migration.
    fn pack(&self, writer: &mut ByteWriter);
    /// Reconstructs the element on the destination process.
    fn unpack(reader: &mut ByteReader) -> Result<Self, WireErr>
    where
        Self: Sized;
}

/// Maps an index to its home node given the collection bounds and the job
/// size. Must be pure; every process evaluates it identically.
pub type MapperFn = fn(u64, u64, u32) -> NodeId;

/// Block (round-robin remainder) distribution; the default mapper.
pub fn block_map(index: u64, bounds: u64, num_nodes: u32) -> NodeId {
    let num_nodes = num_nodes as u64;
    let per_node = bounds.div_ceil(num_nodes.max(1));
    NodeId(((index / per_node.max(1)).min(num_nodes - 1)) as u32)
}

/// Cyclic distribution.
pub fn cyclic_map(index: u64, _bounds: u64, num_nodes: u32) -> NodeId {
    NodeId((index % num_nodes as u64) as u32)
}

/// Element lifecycle events observed by registered listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementEvent {
    MigratedOut,
    MigratedIn,
}

type PackFn = fn(&dyn Any, &mut ByteWriter);
type UnpackFn = fn(&mut ByteReader) -> Result<Box<dyn Any>, WireErr>;
pub(crate) type ListenerFn = Rc<dyn Fn(&mut Runtime, ElementEvent, u64, NodeId)>;

fn pack_element<C: Element>(any: &dyn Any, writer: &mut ByteWriter) {
    any.downcast_ref::<C>()
        .expect("element type mismatch in pack")
        .pack(writer)
}

fn unpack_element<C: Element>(reader: &mut ByteReader) -> Result<Box<dyn Any>, WireErr> {
    Ok(Box::new(C::unpack(reader)?))
}

pub(crate) struct CollectionInstance {
    pub(crate) name: String,
    pub(crate) elements: HashMap<u64, Box<dyn Any>>,
    bounds: u64,
    mapper: MapperFn,
    pack: PackFn,
    unpack: UnpackFn,
    pub(crate) listeners: Vec<ListenerFn>,
    pub(crate) focused_subphase: Option<SubPhase>,
    /// Partial per-node accumulations for collection reductions, keyed by
    /// (epoch bits, phase)
    reduce_acc: HashMap<(u64, u64), (usize, Vec<u8>)>,
}

/// Registry of collections resident on this process.
pub struct CollectionManager {
    pub(crate) collections: HashMap<ClassId, CollectionInstance>,
}

impl CollectionManager {
    pub fn new() -> Self {
        Self {
            collections: HashMap::new(),
        }
    }

    pub(crate) fn has(&self, class: ClassId) -> bool {
        self.collections.contains_key(&class)
    }

    pub(crate) fn instance_mut(&mut self, class: ClassId) -> &mut CollectionInstance {
        self.collections
            .get_mut(&class)
            .unwrap_or_else(|| panic!("collection class {} does not exist", class.0))
    }
}

impl Default for CollectionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Typed proxy to a collection.
pub struct CollectionProxy<C> {
    pub(crate) class: ClassId,
    _marker: PhantomData<fn() -> C>,
}

impl<C> Clone for CollectionProxy<C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C> Copy for CollectionProxy<C> {}

impl<C> CollectionProxy<C> {
    pub fn class(&self) -> ClassId {
        self.class
    }
}

/// Collective construction chain:
/// `make_collective().bounds(n).mapper(f).constructor(c).bulk_insert(rt)`.
pub struct MakeCollective<C: Element> {
    name: String,
    bounds: u64,
    mapper: MapperFn,
    constructor: Option<fn(u64) -> C>,
}

impl<C: Element> MakeCollective<C> {
    pub fn bounds(mut self, bounds: u64) -> Self {
        self.bounds = bounds;
        self
    }

    pub fn mapper(mut self, mapper: MapperFn) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn constructor(mut self, constructor: fn(u64) -> C) -> Self {
        self.constructor = Some(constructor);
        self
    }

    /// Collective: every process iterates the bounds through the mapper
    /// and constructs the elements it owns, then waits for all processes
    /// to finish inserting.
    pub fn bulk_insert(self, runtime: &mut Runtime) -> CollectionProxy<C> {
        let constructor = self
            .constructor
            .unwrap_or_else(|| panic!("collection '{}' has no element constructor", self.name));
        let class = runtime.alloc_class();
        debug!(
            "make collection '{}': class={}, bounds={}",
            self.name, class.0, self.bounds
        );
        runtime.collections.collections.insert(
            class,
            CollectionInstance {
                name: self.name,
                elements: HashMap::new(),
                bounds: self.bounds,
                mapper: self.mapper,
                pack: pack_element::<C>,
                unpack: unpack_element::<C>,
                listeners: Vec::new(),
                focused_subphase: None,
                reduce_acc: HashMap::new(),
            },
        );
        let me = runtime.node();
        let num_nodes = runtime.num_nodes();
        for index in 0..self.bounds {
            if (self.mapper)(index, self.bounds, num_nodes) != me {
                continue;
            }
            let element = constructor(index);
            runtime
                .collections
                .instance_mut(class)
                .elements
                .insert(index, Box::new(element));
            runtime.register_entity(EntityId::new(class, index), me);
        }
        // the wait: all processes have inserted before any message routes
        runtime.system_barrier();
        CollectionProxy {
            class,
            _marker: PhantomData,
        }
    }
}

pub(crate) struct CollBcastMsg {
    pub class: ClassId,
    pub handler: HandlerId,
    pub inner: Vec<u8>,
}

impl Wire for CollBcastMsg {
    fn ser(&self, writer: &mut ByteWriter) {
        self.class.ser(writer);
        self.handler.ser(writer);
        self.inner.ser(writer);
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        Ok(Self {
            class: ClassId::de(reader)?,
            handler: HandlerId::de(reader)?,
            inner: Vec::<u8>::de(reader)?,
        })
    }
}

struct MigrateMsg {
    class: ClassId,
    index: u64,
    home: NodeId,
    bytes: Vec<u8>,
}

impl Wire for MigrateMsg {
    fn ser(&self, writer: &mut ByteWriter) {
        self.class.ser(writer);
        self.index.ser(writer);
        self.home.ser(writer);
        self.bytes.ser(writer);
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        Ok(Self {
            class: ClassId::de(reader)?,
            index: u64::de(reader)?,
            home: NodeId::de(reader)?,
            bytes: Vec::<u8>::de(reader)?,
        })
    }
}

impl Runtime {
    /// Starts collective construction of a collection.
    pub fn make_collective<C: Element>(&mut self, name: &str) -> MakeCollective<C> {
        MakeCollective {
            name: name.to_string(),
            bounds: 0,
            mapper: block_map,
            constructor: None,
        }
    }

    /// Registers a handler invoked on a located collection element.
    pub fn register_elem_handler<C: Element, M: Wire + 'static>(
        &mut self,
        name: &str,
        f: fn(&mut C, &mut Runtime, u64, M),
    ) -> HandlerId {
        let owned = name.to_string();
        self.handlers.register(
            name,
            HandlerKind::Instance(Rc::new(move |element, rt, index, reader| {
                let element = element
                    .downcast_mut::<C>()
                    .unwrap_or_else(|| panic!("element type mismatch in '{owned}'"));
                let msg = M::de(reader)
                    .unwrap_or_else(|error| panic!("corrupt payload for handler '{owned}': {error}"));
                f(element, rt, index, msg);
            })),
        )
    }

    /// Registers a listener fired with (event, index, peer node) when
    /// elements of this collection migrate in or out.
    pub fn register_element_listener<C: Element>(
        &mut self,
        proxy: CollectionProxy<C>,
        f: impl Fn(&mut Runtime, ElementEvent, u64, NodeId) + 'static,
    ) {
        self.collections
            .instance_mut(proxy.class)
            .listeners
            .push(Rc::new(f));
    }

    /// Adds a load sample for an element outside the automatic handler
    /// bracketing (synthetic workloads, external timers).
    pub fn record_load<C: Element>(
        &mut self,
        proxy: CollectionProxy<C>,
        index: u64,
        load: crate::timing::TimeSec,
    ) {
        let phase = self.phases.cur_phase();
        let subphase = self.stats.cur_subphase();
        self.stats
            .add_load(EntityId::new(proxy.class, index), phase, subphase, load);
    }

    /// Directs this collection's load reporting at a single subphase
    /// instead of the whole-phase total.
    pub fn set_focused_subphase<C: Element>(
        &mut self,
        proxy: CollectionProxy<C>,
        subphase: Option<SubPhase>,
    ) {
        self.collections.instance_mut(proxy.class).focused_subphase = subphase;
    }

    /// Runs a read-only closure over a resident element; `None` if the
    /// element is not here.
    pub fn peek_element<C: Element, R>(
        &mut self,
        proxy: CollectionProxy<C>,
        index: u64,
        f: impl FnOnce(&C) -> R,
    ) -> Option<R> {
        self.collections
            .instance_mut(proxy.class)
            .elements
            .get(&index)
            .map(|element| {
                f(element
                    .downcast_ref::<C>()
                    .expect("element type mismatch in peek"))
            })
    }

    /// Indices of the elements currently resident here, sorted.
    pub fn local_elements<C: Element>(&mut self, proxy: CollectionProxy<C>) -> Vec<u64> {
        let mut indices: Vec<u64> = self
            .collections
            .instance_mut(proxy.class)
            .elements
            .keys()
            .copied()
            .collect();
        indices.sort_unstable();
        indices
    }

    pub(crate) fn collection_home(&mut self, class: ClassId, index: u64) -> NodeId {
        let num_nodes = self.num_nodes();
        let instance = self.collections.instance_mut(class);
        (instance.mapper)(index, instance.bounds, num_nodes)
    }

    /// Sends a typed message to one element, routed through the location
    /// layer (eager or non-eager by payload size).
    pub fn collection_send<C: Element, M: Wire>(
        &mut self,
        proxy: CollectionProxy<C>,
        index: u64,
        handler: HandlerId,
        msg: &M,
    ) {
        let home = self.collection_home(proxy.class, index);
        let payload = to_bytes(msg);
        let envelope = Envelope {
            source: self.node(),
            dest: Dest::Entity {
                class: proxy.class,
                index,
                home,
            },
            handler,
            epoch: self.current_epoch(),
            reduce: None,
            hops: 0,
            from_elm: self.current_elm,
            payload_len: payload.len() as u32,
        };
        self.route_to_entity(envelope, payload);
    }

    /// Invokes the handler on every element of the collection, wherever it
    /// currently resides.
    pub fn collection_broadcast<C: Element, M: Wire>(
        &mut self,
        proxy: CollectionProxy<C>,
        handler: HandlerId,
        msg: &M,
    ) {
        let bcast = CollBcastMsg {
            class: proxy.class,
            handler,
            inner: to_bytes(msg),
        };
        let coll_bcast = self.sys.coll_bcast;
        self.broadcast_msg(coll_bcast, &bcast);
    }

    /// Contributes one element's value to a collection-scoped reduction
    /// stamped by (current epoch, phase). The node-level contribution goes
    /// up the tree once every resident element has contributed.
    pub fn collection_reduce<C: Element, V: Wire>(
        &mut self,
        proxy: CollectionProxy<C>,
        phase: Phase,
        op: OpId,
        root: NodeId,
        value: &V,
        action: ReduceAction,
    ) {
        let epoch = self.current_epoch();
        let combine = self.ops.get(op).unwrap_or_else(|error| panic!("{error}"));
        let expected = self
            .locations
            .coordinator(proxy.class)
            .local_count();
        let key = (epoch.0, phase);
        let instance = self.collections.instance_mut(proxy.class);
        let entry = instance.reduce_acc.entry(key).or_insert((0, Vec::new()));
        let bytes = to_bytes(value);
        entry.1 = if entry.0 == 0 {
            bytes
        } else {
            combine(&entry.1, &bytes)
        };
        entry.0 += 1;
        trace!(
            "collection reduce contribute: class={}, phase={phase}, {}/{expected}",
            proxy.class.0,
            entry.0
        );
        if entry.0 < expected {
            return;
        }
        let (_, combined) = instance
            .reduce_acc
            .remove(&key)
            .expect("entry just inserted");
        self.reduce_raw(
            ReduceScope::Collection(proxy.class),
            Some(ReduceStamp::TagPair(epoch.0, phase)),
            op,
            root,
            combined,
            action,
        );
    }

    /// Serializes an element, transfers it to `dest`, destroys the local
    /// copy, updates the location directory, and notifies listeners.
    pub fn migrate_element<C: Element>(
        &mut self,
        proxy: CollectionProxy<C>,
        index: u64,
        dest: NodeId,
    ) {
        self.migrate_element_raw(proxy.class, index, dest);
    }

    /// Untyped migration entry used by the load balancers.
    pub(crate) fn migrate_element_raw(&mut self, class: ClassId, index: u64, dest: NodeId) {
        let me = self.node();
        if dest == me {
            return;
        }
        let home = self.collection_home(class, index);
        let entity = EntityId::new(class, index);
        let instance = self.collections.instance_mut(class);
        let element = instance
            .elements
            .remove(&index)
            .unwrap_or_else(|| panic!("migrate of non-resident element {index} of '{}'", instance.name));
        let mut writer = ByteWriter::new();
        (instance.pack)(element.as_ref(), &mut writer);
        let bytes = writer.into_bytes();
        drop(element);
        trace!("migrate element {index} of class {} to {dest}", class.0);

        let listeners = instance.listeners.clone();
        for listener in listeners {
            listener(self, ElementEvent::MigratedOut, index, dest);
        }
        self.stats.forget(entity);
        self.entity_migrated(entity, home, dest);
        let migrate_handler = self.sys.coll_migrate;
        self.send_msg(
            dest,
            migrate_handler,
            &MigrateMsg {
                class,
                index,
                home,
                bytes,
            },
        );
    }

    /// Dispatches an instance-bound handler on a resident entity, with
    /// timing and communication statistics for collection elements.
    pub(crate) fn dispatch_instance(
        &mut self,
        class: ClassId,
        index: u64,
        handler: HandlerId,
        from_elm: Option<EntityId>,
        source: NodeId,
        payload: &[u8],
        broadcast: bool,
    ) {
        let kind = self
            .handlers
            .get(handler)
            .unwrap_or_else(|error| panic!("{error}"));
        let HandlerKind::Instance(f) = kind else {
            panic!(
                "handler '{}' is not instance-bound but was sent to an entity",
                self.handlers.name_of(handler).unwrap_or("?")
            );
        };

        if self.objgroups.has(class) {
            let group = self.objgroups.groups.get_mut(&class).expect("checked");
            let mut instance = group
                .instance
                .take()
                .unwrap_or_else(|| panic!("objgroup instance re-entered"));
            let mut reader = ByteReader::new(payload);
            f(instance.as_mut(), self, 0, &mut reader);
            self.objgroups.groups.get_mut(&class).expect("checked").instance = Some(instance);
            return;
        }

        let entity = EntityId::new(class, index);
        let mut element = {
            let instance = self.collections.instance_mut(class);
            instance.elements.remove(&index).unwrap_or_else(|| {
                panic!(
                    "element {index} of '{}' dispatched while not resident",
                    instance.name
                )
            })
        };
        let previous = self.current_elm.replace(entity);
        self.stats.start_time(entity);
        {
            let mut reader = ByteReader::new(payload);
            f(element.as_mut(), self, index, &mut reader);
        }
        let phase = self.phases.cur_phase();
        self.stats.stop_time(entity, phase);
        self.current_elm = previous;
        self.collections
            .instance_mut(class)
            .elements
            .insert(index, element);

        let subphase = self.stats.cur_subphase();
        let key = CommKey::new(from_elm, source, entity, broadcast);
        self.stats
            .recv_comm(phase, subphase, key, payload.len() as u64);
    }

    /// Local-entity delivery: the single consume matching the message's
    /// produce, with the envelope's epoch as context.
    pub(crate) fn deliver_to_local_entity(&mut self, envelope: &Envelope, payload: &[u8]) {
        let Dest::Entity { class, index, .. } = envelope.dest else {
            panic!("local entity delivery without an entity destination");
        };
        if envelope.is_term_counted() {
            self.term.consume(envelope.epoch, 1);
        }
        let pushed = !envelope.epoch.is_no_epoch();
        if pushed {
            self.epoch_stack.push(envelope.epoch);
        }
        self.dispatch_instance(
            class,
            index,
            envelope.handler,
            envelope.from_elm,
            envelope.source,
            payload,
            envelope.is_broadcast(),
        );
        if pushed {
            self.epoch_stack.pop();
        }
    }
}

/// System handler: a collection (or object-group) broadcast arriving on
/// this process; fan out to every resident element.
pub(crate) fn on_coll_broadcast(runtime: &mut Runtime, envelope: &Envelope, reader: &mut ByteReader) {
    let msg = CollBcastMsg::de(reader).unwrap_or_else(|e| panic!("corrupt collection broadcast: {e}"));
    if runtime.objgroups.has(msg.class) {
        runtime.dispatch_instance(
            msg.class,
            0,
            msg.handler,
            envelope.from_elm,
            envelope.source,
            &msg.inner,
            true,
        );
        return;
    }
    let mut indices: Vec<u64> = runtime
        .collections
        .instance_mut(msg.class)
        .elements
        .keys()
        .copied()
        .collect();
    indices.sort_unstable();
    for index in indices {
        runtime.dispatch_instance(
            msg.class,
            index,
            msg.handler,
            envelope.from_elm,
            envelope.source,
            &msg.inner,
            true,
        );
    }
}

/// System handler: a migrated element arriving on its new process.
pub(crate) fn on_migrate_arrival(runtime: &mut Runtime, envelope: &Envelope, reader: &mut ByteReader) {
    let msg = MigrateMsg::de(reader).unwrap_or_else(|e| panic!("corrupt migration payload: {e}"));
    let element = {
        let instance = runtime.collections.instance_mut(msg.class);
        let mut element_reader = ByteReader::new(&msg.bytes);
        (instance.unpack)(&mut element_reader)
            .unwrap_or_else(|e| panic!("corrupt migrated element {}: {e}", msg.index))
    };
    runtime
        .collections
        .instance_mut(msg.class)
        .elements
        .insert(msg.index, element);
    let entity = EntityId::new(msg.class, msg.index);
    runtime.register_entity_migrated(entity, msg.home, envelope.source);
    let listeners = runtime
        .collections
        .instance_mut(msg.class)
        .listeners
        .clone();
    for listener in listeners {
        listener(runtime, ElementEvent::MigratedIn, msg.index, envelope.source);
    }
}
