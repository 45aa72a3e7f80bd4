//! Collective scopes: agreement-sequenced execution of blocking
//! ("MPI-style") operations. The runtime delivers messages out of order,
//! so every process may reach its blocking operations at different times;
//! a `MaxOp` tag reduction plus an authorization broadcast guarantees all
//! processes agree on which operation runs next within a scope.

use std::collections::{BTreeMap, HashMap};

use log::trace;

use plenum_wire::{ByteReader, ByteWriter, Wire, WireErr};

use crate::collective::reduce::manager::ReduceAction;
use crate::collective::reduce::scope::{ReduceScope, ReduceStamp};
use crate::epoch::Epoch;
use crate::messaging::envelope::Envelope;
use crate::runtime::Runtime;
use crate::types::{NodeId, Tag};

/// Component ID for scope-agreement reductions.
const COMPONENT_SCOPE: u32 = 2;

type ScopeAction = Box<dyn FnOnce(&mut Runtime)>;

struct Planned {
    action: ScopeAction,
    epoch: Epoch,
}

struct ScopeImpl {
    live: bool,
    next_tag: Tag,
    planned: BTreeMap<Tag, Planned>,
    max_authorized: Option<Tag>,
}

impl ScopeImpl {
    fn new() -> Self {
        Self {
            live: true,
            next_tag: 0,
            planned: BTreeMap::new(),
            max_authorized: None,
        }
    }
}

/// Handle to a collective scope. Many independent scopes may exist; each
/// sequences its own operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CollectiveScope {
    is_user: bool,
    scope: Tag,
}

pub struct ScopeManager {
    user: HashMap<Tag, ScopeImpl>,
    system: HashMap<Tag, ScopeImpl>,
    next_system: Tag,
}

impl ScopeManager {
    pub fn new() -> Self {
        Self {
            user: HashMap::new(),
            system: HashMap::new(),
            next_system: 0,
        }
    }

    fn get(&mut self, scope: CollectiveScope) -> &mut ScopeImpl {
        let map = if scope.is_user { &mut self.user } else { &mut self.system };
        map.get_mut(&scope.scope)
            .unwrap_or_else(|| panic!("collective scope {:?} does not exist", scope))
    }
}

impl Default for ScopeManager {
    fn default() -> Self {
        Self::new()
    }
}

struct ScopeRunMsg {
    is_user: bool,
    scope: Tag,
    max_tag: Tag,
}

impl Wire for ScopeRunMsg {
    fn ser(&self, writer: &mut ByteWriter) {
        self.is_user.ser(writer);
        self.scope.ser(writer);
        self.max_tag.ser(writer);
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        Ok(Self {
            is_user: bool::de(reader)?,
            scope: Tag::de(reader)?,
            max_tag: Tag::de(reader)?,
        })
    }
}

impl Runtime {
    /// Creates a collective scope. With a user tag, every process must
    /// pass the same tag; otherwise a system scope is drawn from a
    /// deterministic sequence.
    pub fn make_collective_scope(&mut self, user_tag: Option<Tag>) -> CollectiveScope {
        match user_tag {
            Some(tag) => {
                self.scopes.user.entry(tag).or_insert_with(ScopeImpl::new);
                CollectiveScope {
                    is_user: true,
                    scope: tag,
                }
            }
            None => {
                let tag = self.scopes.next_system;
                self.scopes.next_system += 1;
                self.scopes.system.insert(tag, ScopeImpl::new());
                CollectiveScope {
                    is_user: false,
                    scope: tag,
                }
            }
        }
    }

    /// Plans `action` as the scope's next collective operation and starts
    /// the agreement protocol. Returns the operation's tag; the action
    /// runs once every process has authorized it. Produces to the active
    /// epoch so it cannot terminate before the operation runs.
    pub fn mpi_collective_async(
        &mut self,
        scope: CollectiveScope,
        action: impl FnOnce(&mut Runtime) + 'static,
    ) -> Tag {
        let epoch = self.current_epoch();
        let state = self.scopes.get(scope);
        assert!(state.live, "operation planned on a dead collective scope");
        let tag = state.next_tag;
        state.next_tag += 1;
        state.planned.insert(
            tag,
            Planned {
                action: Box::new(action),
                epoch,
            },
        );
        if !epoch.is_no_epoch() {
            self.term.produce(epoch, 1);
        }
        trace!(
            "collective scope plan: scope={:?}, tag={}, epoch={}",
            scope,
            tag,
            epoch
        );

        // agreement: everyone learns the max planned tag, then runs every
        // operation up to it in tag order
        let is_user = scope.is_user;
        let scope_tag = scope.scope;
        let run_handler = self.sys.scope_run;
        self.with_no_epoch(|rt| {
            rt.reduce::<u64>(
                ReduceScope::Component(COMPONENT_SCOPE),
                Some(ReduceStamp::TagPair(
                    pack_scope(is_user, scope_tag),
                    tag,
                )),
                rt.sysops.max_u64,
                NodeId(0),
                &tag,
                ReduceAction::Callback(Box::new(move |rt, combined| {
                    let max_tag = plenum_wire::from_bytes::<u64>(combined)
                        .unwrap_or_else(|e| panic!("corrupt scope agreement: {e}"));
                    rt.broadcast_system(
                        run_handler,
                        &ScopeRunMsg {
                            is_user,
                            scope: scope_tag,
                            max_tag,
                        },
                    );
                })),
            );
        });
        tag
    }

    /// Whether the operation with `tag` has run on this process.
    pub fn is_collective_done(&mut self, scope: CollectiveScope, tag: Tag) -> bool {
        !self.scopes.get(scope).planned.contains_key(&tag)
    }

    /// Spins the scheduler until the operation with `tag` has run.
    pub fn wait_collective(&mut self, scope: CollectiveScope, tag: Tag) {
        self.run_scheduler_while(move |rt| !rt.is_collective_done(scope, tag));
    }

    /// Plans and waits in one step.
    pub fn mpi_collective_wait(
        &mut self,
        scope: CollectiveScope,
        action: impl FnOnce(&mut Runtime) + 'static,
    ) {
        let tag = self.mpi_collective_async(scope, action);
        self.wait_collective(scope, tag);
    }

    /// Marks the scope dead; operations already planned still run, new
    /// ones are a contract violation.
    pub fn destroy_scope(&mut self, scope: CollectiveScope) {
        let state = self.scopes.get(scope);
        state.live = false;
        if state.planned.is_empty() {
            let map = if scope.is_user {
                &mut self.scopes.user
            } else {
                &mut self.scopes.system
            };
            map.remove(&scope.scope);
        }
    }

    fn scope_run_authorized(&mut self, scope: CollectiveScope, max_tag: Tag) {
        let state = self.scopes.get(scope);
        state.max_authorized = Some(match state.max_authorized {
            Some(current) => current.max(max_tag),
            None => max_tag,
        });
        loop {
            let state = self.scopes.get(scope);
            let authorized = state.max_authorized.expect("just set");
            let next = match state.planned.keys().next().copied() {
                Some(next) if next <= authorized => next,
                _ => break,
            };
            let planned = state.planned.remove(&next).expect("key just observed");
            trace!("collective scope run: scope={:?}, tag={}", scope, next);
            self.with_epoch(planned.epoch, |rt| (planned.action)(rt));
            if !planned.epoch.is_no_epoch() {
                self.term.consume(planned.epoch, 1);
            }
        }
    }
}

fn pack_scope(is_user: bool, scope: Tag) -> u64 {
    // user and system scopes share the agreement component; disambiguate
    // in the stamp's first tag
    (scope << 1) | (is_user as u64)
}

pub(crate) fn on_scope_run(runtime: &mut Runtime, _envelope: &Envelope, reader: &mut ByteReader) {
    let msg = ScopeRunMsg::de(reader).unwrap_or_else(|e| panic!("corrupt scope broadcast: {e}"));
    runtime.scope_run_authorized(
        CollectiveScope {
            is_user: msg.is_user,
            scope: msg.scope,
        },
        msg.max_tag,
    );
}
