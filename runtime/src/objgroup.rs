//! Object groups: per-process singletons constructed collectively, with a
//! proxy that resolves on every process to the local instance.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::rc::Rc;

use log::debug;

use plenum_wire::Wire;

use crate::collective::reduce::manager::ReduceAction;
use crate::collective::reduce::scope::{ReduceScope, ReduceStamp};
use crate::messaging::envelope::{Dest, Envelope};
use crate::messaging::kinds::HandlerKind;
use crate::runtime::Runtime;
use crate::types::{ClassId, EntityId, HandlerId, NodeId, OpId};

pub(crate) struct ObjGroupInstance {
    name: String,
    pub(crate) instance: Option<Box<dyn Any>>,
}

/// Registry of the local instances of every object group.
pub struct ObjGroupManager {
    pub(crate) groups: HashMap<ClassId, ObjGroupInstance>,
}

impl ObjGroupManager {
    pub fn new() -> Self {
        Self {
            groups: HashMap::new(),
        }
    }

    pub(crate) fn has(&self, class: ClassId) -> bool {
        self.groups.contains_key(&class)
    }
}

impl Default for ObjGroupManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Typed proxy to an object group; resolves to the local instance on
/// whichever process uses it.
pub struct ObjGroupProxy<T> {
    pub(crate) class: ClassId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for ObjGroupProxy<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ObjGroupProxy<T> {}

impl<T> ObjGroupProxy<T> {
    pub fn class(&self) -> ClassId {
        self.class
    }
}

impl Runtime {
    /// Collectively constructs an object group from this process's local
    /// instance. Every process must call this in the same order with the
    /// same name.
    pub fn make_objgroup_collective<T: 'static>(
        &mut self,
        name: &str,
        instance: T,
    ) -> ObjGroupProxy<T> {
        let class = self.alloc_class();
        debug!("make objgroup '{name}': class={}", class.0);
        self.objgroups.groups.insert(
            class,
            ObjGroupInstance {
                name: name.to_string(),
                instance: Some(Box::new(instance)),
            },
        );
        // the singleton is always resident here; home is this process
        let me = self.node();
        self.register_entity(EntityId::new(class, 0), me);
        ObjGroupProxy {
            class,
            _marker: PhantomData,
        }
    }

    /// Registers a handler invoked on the destination's local instance.
    pub fn register_objgroup_handler<T: 'static, M: Wire + 'static>(
        &mut self,
        name: &str,
        f: fn(&mut T, &mut Runtime, M),
    ) -> HandlerId {
        let owned = name.to_string();
        self.handlers.register(
            name,
            HandlerKind::Instance(Rc::new(move |instance, rt, _index, reader| {
                let instance = instance
                    .downcast_mut::<T>()
                    .unwrap_or_else(|| panic!("objgroup instance type mismatch in '{owned}'"));
                let msg = M::de(reader)
                    .unwrap_or_else(|error| panic!("corrupt payload for handler '{owned}': {error}"));
                f(instance, rt, msg);
            })),
        )
    }

    /// Borrows the local instance of an object group.
    pub fn objgroup_local<T: 'static>(&mut self, proxy: ObjGroupProxy<T>) -> &mut T {
        let group = self
            .objgroups
            .groups
            .get_mut(&proxy.class)
            .unwrap_or_else(|| panic!("objgroup class {} does not exist", proxy.class.0));
        group
            .instance
            .as_mut()
            .unwrap_or_else(|| panic!("objgroup '{}' instance is in use", group.name))
            .downcast_mut::<T>()
            .unwrap_or_else(|| panic!("objgroup '{}' instance type mismatch", group.name))
    }

    /// Sends a message to the group's instance on `dest`.
    pub fn objgroup_send<T: 'static, M: Wire>(
        &mut self,
        proxy: ObjGroupProxy<T>,
        dest: NodeId,
        handler: HandlerId,
        msg: &M,
    ) {
        let payload = plenum_wire::to_bytes(msg);
        let envelope = Envelope {
            source: self.node(),
            dest: Dest::Entity {
                class: proxy.class,
                index: 0,
                home: dest,
            },
            handler,
            epoch: self.current_epoch(),
            reduce: None,
            hops: 0,
            from_elm: self.current_elm,
            payload_len: payload.len() as u32,
        };
        self.post(dest, envelope, &payload);
    }

    /// Invokes the handler on every process's instance.
    pub fn objgroup_broadcast<T: 'static, M: Wire>(
        &mut self,
        proxy: ObjGroupProxy<T>,
        handler: HandlerId,
        msg: &M,
    ) {
        let bcast = crate::collection::CollBcastMsg {
            class: proxy.class,
            handler,
            inner: plenum_wire::to_bytes(msg),
        };
        let coll_bcast = self.sys.coll_bcast;
        self.broadcast_msg(coll_bcast, &bcast);
    }

    /// Reduction over the object group: one contribution per process.
    pub fn objgroup_reduce<T: 'static, V: Wire>(
        &mut self,
        proxy: ObjGroupProxy<T>,
        stamp: Option<ReduceStamp>,
        op: OpId,
        root: NodeId,
        value: &V,
        action: ReduceAction,
    ) -> ReduceStamp {
        self.reduce(
            ReduceScope::ObjGroup(proxy.class),
            stamp,
            op,
            root,
            value,
            action,
        )
    }
}
