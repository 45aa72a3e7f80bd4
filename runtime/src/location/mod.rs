//! Entity location management: per-class coordinators holding the
//! authoritative directory on an entity's home node, LRU caches
//! everywhere else, pending lookups and buffered messages for entities
//! not yet registered, and eager / non-eager routing of entity-addressed
//! messages.

pub mod cache;

pub use cache::LocationCache;

use std::collections::{HashMap, HashSet};

use log::{trace, warn};

use plenum_transport::Payload;
use plenum_wire::{ByteReader, ByteWriter, Wire, WireErr};

use crate::messaging::envelope::{Dest, Envelope};
use crate::runtime::Runtime;
use crate::types::{ClassId, EntityId, NodeId};

type ResolveAction = Box<dyn FnOnce(&mut Runtime, NodeId)>;

/// Per-entity-class location state.
pub(crate) struct LocationCoordinator {
    /// Entities whose current residence is this process
    local_registered: HashSet<EntityId>,
    /// Authoritative current-node map; populated only for entities whose
    /// home is this process
    directory: HashMap<EntityId, NodeId>,
    /// Stale-tolerated records learned from responses and forwards
    cache: LocationCache,
    /// Home side: remote lookups waiting for the entity to register
    pending_lookups: HashMap<EntityId, Vec<(u64, NodeId)>>,
    /// Home side: eager messages waiting for the entity to register
    pending_msgs: HashMap<EntityId, Vec<(Envelope, Payload, usize)>>,
}

impl LocationCoordinator {
    fn new(cache_capacity: usize) -> Self {
        Self {
            local_registered: HashSet::new(),
            directory: HashMap::new(),
            cache: LocationCache::new(cache_capacity),
            pending_lookups: HashMap::new(),
            pending_msgs: HashMap::new(),
        }
    }

    pub(crate) fn is_local(&self, entity: EntityId) -> bool {
        self.local_registered.contains(&entity)
    }

    pub(crate) fn local_count(&self) -> usize {
        self.local_registered.len()
    }
}

/// All coordinators plus the cross-class pending-resolution table.
pub struct LocationManager {
    coordinators: HashMap<ClassId, LocationCoordinator>,
    pending_actions: HashMap<u64, ResolveAction>,
    next_event: u64,
    cache_capacity: usize,
}

impl LocationManager {
    pub fn new(cache_capacity: usize) -> Self {
        Self {
            coordinators: HashMap::new(),
            pending_actions: HashMap::new(),
            next_event: 0,
            cache_capacity,
        }
    }

    pub(crate) fn coordinator(&mut self, class: ClassId) -> &mut LocationCoordinator {
        let capacity = self.cache_capacity;
        self.coordinators
            .entry(class)
            .or_insert_with(|| LocationCoordinator::new(capacity))
    }

    fn new_event(&mut self) -> u64 {
        let event = self.next_event;
        self.next_event += 1;
        event
    }
}

struct LocRequestMsg {
    entity: EntityId,
    event: u64,
}

struct LocResponseMsg {
    entity: EntityId,
    event: u64,
    node: NodeId,
}

struct LocUpdateMsg {
    entity: EntityId,
    node: NodeId,
}

impl Wire for LocRequestMsg {
    fn ser(&self, writer: &mut ByteWriter) {
        self.entity.ser(writer);
        self.event.ser(writer);
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        Ok(Self {
            entity: EntityId::de(reader)?,
            event: u64::de(reader)?,
        })
    }
}

impl Wire for LocResponseMsg {
    fn ser(&self, writer: &mut ByteWriter) {
        self.entity.ser(writer);
        self.event.ser(writer);
        self.node.ser(writer);
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        Ok(Self {
            entity: EntityId::de(reader)?,
            event: u64::de(reader)?,
            node: NodeId::de(reader)?,
        })
    }
}

impl Wire for LocUpdateMsg {
    fn ser(&self, writer: &mut ByteWriter) {
        self.entity.ser(writer);
        self.node.ser(writer);
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        Ok(Self {
            entity: EntityId::de(reader)?,
            node: NodeId::de(reader)?,
        })
    }
}

impl Runtime {
    /// Installs an entity as resident on this process. On the home node
    /// this also seeds the authoritative directory and flushes anything
    /// parked waiting for the registration. Message dispatch for the
    /// entity is keyed by its class (collection / object-group manager).
    pub fn register_entity(&mut self, entity: EntityId, home: NodeId) {
        let me = self.node();
        let coordinator = self.locations.coordinator(entity.class);
        coordinator.local_registered.insert(entity);
        if home == me {
            coordinator.directory.insert(entity, me);
        }
        trace!("register entity {:?} (home {home}) on {me}", entity);
        self.flush_pending_for(entity);
    }

    /// Reverses [`Runtime::register_entity`], returning the coordinator to
    /// its prior state for this entity.
    pub fn unregister_entity(&mut self, entity: EntityId, home: NodeId) {
        let me = self.node();
        let coordinator = self.locations.coordinator(entity.class);
        coordinator.local_registered.remove(&entity);
        if home == me {
            coordinator.directory.remove(&entity);
        }
        coordinator.cache.remove(entity);
    }

    /// On the *old* node after a migration: erases the local registration
    /// and routes the directory update to the home node.
    pub fn entity_migrated(&mut self, entity: EntityId, home: NodeId, new_node: NodeId) {
        let me = self.node();
        let coordinator = self.locations.coordinator(entity.class);
        coordinator.local_registered.remove(&entity);
        coordinator.cache.insert(entity, new_node);
        if home == me {
            coordinator.directory.insert(entity, new_node);
        } else {
            self.send_system(
                home,
                self.sys.loc_update,
                &LocUpdateMsg {
                    entity,
                    node: new_node,
                },
            );
        }
    }

    /// On the *new* node after a migration: installs the registration and
    /// notifies the home directory that this process is now current.
    pub fn register_entity_migrated(&mut self, entity: EntityId, home: NodeId, from: NodeId) {
        let me = self.node();
        let coordinator = self.locations.coordinator(entity.class);
        coordinator.local_registered.insert(entity);
        coordinator.cache.remove(entity);
        trace!(
            "register migrated entity {:?} on {me} (home {home}, from {from})"
            , entity
        );
        if home == me {
            coordinator.directory.insert(entity, me);
        } else {
            self.send_system(home, self.sys.loc_update, &LocUpdateMsg { entity, node: me });
        }
        self.flush_pending_for(entity);
    }

    /// Resolves the entity's current node and fires `action` with it.
    /// Resolution order: local registration, then cached record, then the
    /// home node's directory (parking the request if the entity has not
    /// registered yet).
    pub fn get_location(
        &mut self,
        entity: EntityId,
        home: NodeId,
        action: impl FnOnce(&mut Runtime, NodeId) + 'static,
    ) {
        let me = self.node();
        let coordinator = self.locations.coordinator(entity.class);
        if coordinator.is_local(entity) {
            action(self, me);
            return;
        }
        if let Some(node) = coordinator.cache.get(entity) {
            action(self, node);
            return;
        }
        if home == me {
            if let Some(node) = coordinator.directory.get(&entity).copied() {
                action(self, node);
                return;
            }
            // home directory miss: the entity has not registered anywhere
            // yet; park until it does
            let event = self.locations.new_event();
            self.locations
                .pending_actions
                .insert(event, Box::new(action));
            self.locations
                .coordinator(entity.class)
                .pending_lookups
                .entry(entity)
                .or_default()
                .push((event, me));
            return;
        }
        let event = self.locations.new_event();
        self.locations
            .pending_actions
            .insert(event, Box::new(action));
        self.send_system(home, self.sys.loc_request, &LocRequestMsg { entity, event });
    }

    /// Routes an entity-addressed envelope. Small payloads go eagerly to
    /// the home node (which delivers, forwards, or buffers); large ones
    /// resolve the location first and send the payload once.
    pub(crate) fn route_to_entity(&mut self, envelope: Envelope, payload: Vec<u8>) {
        let Dest::Entity { class, index, home } = envelope.dest else {
            panic!("route_to_entity requires an entity destination");
        };
        let entity = EntityId::new(class, index);

        // the logical send: one produce, consumed wherever the message is
        // finally dispatched
        if envelope.is_term_counted() {
            self.term.produce(envelope.epoch, 1);
        }

        if self.locations.coordinator(class).is_local(entity) {
            // enqueue even for local residents: handlers stay
            // run-to-completion and never re-enter a held element
            let me = self.node();
            self.send_raw_bytes(me, &envelope, &payload);
            return;
        }

        if payload.len() < self.config.eager_threshold_bytes {
            // eager: ship the payload toward home (or a cached current)
            let target = self
                .locations
                .coordinator(class)
                .cache
                .get(entity)
                .unwrap_or(home);
            self.send_raw_bytes(target, &envelope, &payload);
        } else {
            // non-eager: resolve first, then send the payload once
            self.get_location(entity, home, move |rt, node| {
                rt.send_raw_bytes(node, &envelope, &payload);
            });
        }
    }

    /// Home-side flush once an entity registers: answer parked lookups and
    /// re-route buffered messages.
    fn flush_pending_for(&mut self, entity: EntityId) {
        let me = self.node();
        let coordinator = self.locations.coordinator(entity.class);
        let current = if coordinator.is_local(entity) {
            me
        } else {
            match coordinator.directory.get(&entity).copied() {
                Some(node) => node,
                None => return,
            }
        };
        let lookups = coordinator.pending_lookups.remove(&entity).unwrap_or_default();
        let msgs = coordinator.pending_msgs.remove(&entity).unwrap_or_default();
        for (event, requester) in lookups {
            if requester == me {
                self.resolve_event(event, current);
            } else {
                self.send_system(
                    requester,
                    self.sys.loc_response,
                    &LocResponseMsg {
                        entity,
                        event,
                        node: current,
                    },
                );
            }
        }
        for (envelope, buffer, offset) in msgs {
            on_entity_arrival(self, envelope, buffer, offset);
        }
    }

    fn resolve_event(&mut self, event: u64, node: NodeId) {
        if let Some(action) = self.locations.pending_actions.remove(&event) {
            action(self, node);
        }
    }
}

/// Arrival of an entity-addressed envelope on this process: deliver if
/// the entity is resident, chain-forward on a (possibly stale) record,
/// buffer on the home node until registration, or ask home.
pub(crate) fn on_entity_arrival(
    runtime: &mut Runtime,
    envelope: Envelope,
    buffer: Payload,
    offset: usize,
) {
    let Dest::Entity { class, index, home } = envelope.dest else {
        panic!("entity arrival without an entity destination");
    };
    let entity = EntityId::new(class, index);
    let me = runtime.node();

    if runtime.locations.coordinator(class).is_local(entity) {
        runtime.deliver_to_local_entity(&envelope, &buffer[offset..]);
        return;
    }

    // resident somewhere else (or not yet known); self-heal by forwarding
    let known = {
        let coordinator = runtime.locations.coordinator(class);
        coordinator
            .cache
            .get(entity)
            .or_else(|| coordinator.directory.get(&entity).copied())
            .filter(|node| *node != me)
    };
    if let Some(node) = known {
        warn!(
            "entity {:?} not resident on {me}; chain-forwarding to {node} (hop {})",
            entity,
            envelope.hops + 1
        );
        runtime.forward_entity_msg(envelope, &buffer[offset..], node);
        return;
    }

    if home == me {
        // not registered anywhere yet; hold until it is
        trace!("buffering message for unregistered entity {:?}", entity);
        runtime
            .locations
            .coordinator(class)
            .pending_msgs
            .entry(entity)
            .or_default()
            .push((envelope, buffer, offset));
        return;
    }

    // no record at all: ask home and forward on the answer
    let payload = buffer[offset..].to_vec();
    runtime.get_location(entity, home, move |rt, node| {
        if node == rt.node() {
            rt.deliver_to_local_entity(&envelope, &payload);
        } else {
            rt.forward_entity_msg(envelope, &payload, node);
        }
    });
}

impl Runtime {
    /// One forwarding hop: balance the original produce with a consume
    /// here and a fresh produce for the onward send.
    pub(crate) fn forward_entity_msg(
        &mut self,
        mut envelope: Envelope,
        payload: &[u8],
        target: NodeId,
    ) {
        envelope.hops += 1;
        assert!(
            envelope.hops <= self.config.max_forward_hops as u8,
            "message for entity {:?} exceeded forwarding hop limit {}",
            envelope.dest,
            self.config.max_forward_hops
        );
        if envelope.is_term_counted() {
            self.term.consume(envelope.epoch, 1);
        }
        self.post(target, envelope, payload);
    }
}

pub(crate) fn on_loc_request(runtime: &mut Runtime, envelope: &Envelope, reader: &mut ByteReader) {
    let msg = LocRequestMsg::de(reader).unwrap_or_else(|e| panic!("corrupt location request: {e}"));
    let requester = envelope.source;
    let me = runtime.node();
    let current = {
        let coordinator = runtime.locations.coordinator(msg.entity.class);
        if coordinator.is_local(msg.entity) {
            Some(me)
        } else {
            coordinator.directory.get(&msg.entity).copied()
        }
    };
    match current {
        Some(node) => {
            runtime.send_system(
                requester,
                runtime.sys.loc_response,
                &LocResponseMsg {
                    entity: msg.entity,
                    event: msg.event,
                    node,
                },
            );
        }
        None => {
            runtime
                .locations
                .coordinator(msg.entity.class)
                .pending_lookups
                .entry(msg.entity)
                .or_default()
                .push((msg.event, requester));
        }
    }
}

pub(crate) fn on_loc_response(runtime: &mut Runtime, _envelope: &Envelope, reader: &mut ByteReader) {
    let msg = LocResponseMsg::de(reader).unwrap_or_else(|e| panic!("corrupt location response: {e}"));
    runtime
        .locations
        .coordinator(msg.entity.class)
        .cache
        .insert(msg.entity, msg.node);
    runtime.resolve_event(msg.event, msg.node);
}

pub(crate) fn on_loc_update(runtime: &mut Runtime, _envelope: &Envelope, reader: &mut ByteReader) {
    let msg = LocUpdateMsg::de(reader).unwrap_or_else(|e| panic!("corrupt location update: {e}"));
    let coordinator = runtime.locations.coordinator(msg.entity.class);
    coordinator.directory.insert(msg.entity, msg.node);
    coordinator.cache.insert(msg.entity, msg.node);
    runtime.flush_pending_for(msg.entity);
}
