//! Index-scoped handles: one typed block per collection element, a
//! descriptor ("location") window per process, lazy location resolution
//! with a per-process cache, and the collective rebuild that preserves
//! per-index values across load-balancing migrations.

use std::collections::{BTreeMap, HashMap};

use log::{debug, trace};

use plenum_transport::LockLevel;
use plenum_wire::{ByteReader, ByteWriter, FixedWire, Wire};

use crate::collection::{CollectionProxy, Element};
use crate::collective::reduce::manager::ReduceAction;
use crate::collective::reduce::scope::{ReduceScope, ReduceStamp};
use crate::messaging::envelope::Envelope;
use crate::phase::PhaseHook;
use crate::runtime::Runtime;
use crate::types::NodeId;

use super::{
    decode_elems, encode_elems, AccumElem, IndexDesc, IndexInfo, IndexedHandle, RdmaLayoutMsg,
    RdmaReadyMsg, SubHandleState, COMPONENT_RDMA,
};

/// Bytes per entry in a location window: (index, offset, size) as u64.
const LOC_ENTRY_BYTES: usize = 24;

impl Runtime {
    /// Registers this element's block for an index-scoped handle. Called
    /// independently on each owning process for each local element,
    /// before the collective [`Runtime::commit_indexed_handle`].
    pub fn make_indexed_handle<C: Element, T: FixedWire>(
        &mut self,
        proxy: CollectionProxy<C>,
        index: u64,
        size: usize,
    ) {
        self.rdma
            .pending_indexed
            .entry(proxy.class())
            .or_default()
            .insert(index, size);
    }

    /// Collective: agrees on the global layout of all registered blocks,
    /// allocates the data and location windows, and wires up migration
    /// tracking plus the post-LB rebuild hook. The handle becomes ready
    /// once every process has its windows.
    ///
    /// Window allocation is collective and ordered: wait for readiness
    /// before constructing any other handle, so every process allocates
    /// windows in the same sequence.
    pub fn commit_indexed_handle<C: Element, T: FixedWire>(
        &mut self,
        proxy: CollectionProxy<C>,
    ) -> IndexedHandle<T> {
        let class = proxy.class();
        let id = self.rdma.next_handle;
        self.rdma.next_handle += 1;
        let pending = self
            .rdma
            .pending_indexed
            .remove(&class)
            .unwrap_or_default();
        debug!(
            "commit indexed handle {id}: class={}, local blocks={}",
            class.0,
            pending.len()
        );
        let descs: Vec<IndexDesc> = pending
            .iter()
            .map(|(&index, &size)| IndexDesc {
                index,
                node: self.node(),
                size: size as u64,
            })
            .collect();
        self.rdma.subs.insert(
            id,
            SubHandleState {
                class,
                elem_bytes: T::BYTES,
                data_window: None,
                loc_window: None,
                local: BTreeMap::new(),
                universe: BTreeMap::new(),
                cache: HashMap::new(),
                ready: false,
                rebuild_round: 0,
                rebuild_decision: None,
                migrate_in: Default::default(),
                migrate_out: Default::default(),
            },
        );

        // track which blocks this process gains and loses through the LB
        self.collections
            .instance_mut(class)
            .listeners
            .push(std::rc::Rc::new(move |rt, event, index, _node| {
                let Some(state) = rt.rdma.subs.get_mut(&id) else {
                    return;
                };
                match event {
                    crate::collection::ElementEvent::MigratedOut => {
                        state.migrate_out.insert(index);
                    }
                    crate::collection::ElementEvent::MigratedIn => {
                        state.migrate_in.insert(index);
                    }
                }
            }));

        // if any process's block set changed during the phase, all rebuild
        self.register_hook_collective(PhaseHook::EndPostMigration, move |rt| {
            rt.rebuild_indexed(id);
        });

        // layout agreement: everyone learns every block's owner and size
        let layout_handler = self.sys.rdma_layout;
        self.with_no_epoch(|rt| {
            rt.reduce::<Vec<IndexDesc>>(
                ReduceScope::Component(COMPONENT_RDMA),
                Some(ReduceStamp::TagPair(id, 0)),
                rt.sysops.merge_layout,
                NodeId(0),
                &descs,
                ReduceAction::Callback(Box::new(move |rt, combined| {
                    let descs = plenum_wire::from_bytes::<Vec<IndexDesc>>(combined)
                        .unwrap_or_else(|e| panic!("corrupt rdma layout: {e}"));
                    rt.broadcast_system(layout_handler, &RdmaLayoutMsg { handle: id, descs });
                })),
            );
        });

        IndexedHandle {
            id,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn indexed_is_ready<T>(&mut self, handle: IndexedHandle<T>) -> bool {
        self.rdma.sub_state_mut(handle.id).ready
    }

    pub fn indexed_wait_ready<T>(&mut self, handle: IndexedHandle<T>) {
        let id = handle.id;
        self.run_scheduler_while(move |rt| !rt.rdma.sub_state_mut(id).ready);
    }

    /// Lays out this process's blocks and (re)creates its windows from
    /// the agreed descriptor set.
    fn build_indexed_windows(&mut self, id: u64, descs: &[IndexDesc]) {
        let me = self.node();
        let state = self.rdma.sub_state_mut(id);
        let elem_bytes = state.elem_bytes;

        state.universe.clear();
        for desc in descs {
            state.universe.insert(desc.index, desc.size as usize);
        }

        // offsets are prefix sums over each owner's indices in ascending
        // order, so every process can compute every other's layout
        let mut per_node_offset: HashMap<NodeId, usize> = HashMap::new();
        let mut sorted: Vec<&IndexDesc> = descs.iter().collect();
        sorted.sort_unstable_by_key(|d| (d.node, d.index));
        state.local.clear();
        state.cache.clear();
        for desc in sorted {
            let offset = per_node_offset.entry(desc.node).or_insert(0);
            let info = IndexInfo {
                node: desc.node,
                offset: *offset,
                size: desc.size as usize,
            };
            state.cache.insert(desc.index, info);
            if desc.node == me {
                state.local.insert(desc.index, (*offset, desc.size as usize));
            }
            *offset += desc.size as usize * elem_bytes;
        }

        let data_bytes = per_node_offset.get(&me).copied().unwrap_or(0);
        let local = state.local.clone();

        let data_window = self
            .transport
            .alloc_window(data_bytes)
            .unwrap_or_else(|error| panic!("window allocation failed: {error}"));
        let loc_window = self
            .transport
            .alloc_window(8 + local.len() * LOC_ENTRY_BYTES)
            .unwrap_or_else(|error| panic!("window allocation failed: {error}"));

        // publish the descriptor table: count, then (index, offset, size)
        let mut table = ByteWriter::with_capacity(8 + local.len() * LOC_ENTRY_BYTES);
        (local.len() as u64).ser(&mut table);
        for (&index, &(offset, size)) in &local {
            index.ser(&mut table);
            (offset as u64).ser(&mut table);
            (size as u64).ser(&mut table);
        }
        self.transport
            .put(loc_window, me.0, 0, table.as_slice())
            .unwrap_or_else(|error| panic!("descriptor publish failed: {error}"));

        let state = self.rdma.sub_state_mut(id);
        state.data_window = Some(data_window);
        state.loc_window = Some(loc_window);
        trace!(
            "indexed handle {id} windows built: {} local blocks, {} data bytes",
            state.local.len(),
            data_bytes
        );
    }

    /// Resolves an index to its owner / offset / size: local cache first,
    /// then the likely owner's descriptor window, then a sweep of every
    /// process's window.
    pub(crate) fn resolve_index(&mut self, id: u64, index: u64) -> IndexInfo {
        if let Some(info) = self.rdma.sub_state_mut(id).cache.get(&index) {
            return *info;
        }
        let class = self.rdma.sub_state_mut(id).class;
        let guess = self.collection_home(class, index);
        if let Some(info) = self.read_descriptor(id, guess, index) {
            self.rdma.sub_state_mut(id).cache.insert(index, info);
            return info;
        }
        for rank in 0..self.num_nodes() {
            let node = NodeId(rank);
            if node == guess {
                continue;
            }
            if let Some(info) = self.read_descriptor(id, node, index) {
                self.rdma.sub_state_mut(id).cache.insert(index, info);
                return info;
            }
        }
        panic!("index {index} is not mapped by indexed handle {id}");
    }

    /// Reads one process's descriptor window looking for `index`.
    fn read_descriptor(&mut self, id: u64, node: NodeId, index: u64) -> Option<IndexInfo> {
        let loc_window = self.rdma.sub_state_mut(id).loc_window?;
        let mut count_buf = [0u8; 8];
        self.transport
            .get(loc_window, node.0, 0, &mut count_buf)
            .ok()?;
        let count = u64::from_le_bytes(count_buf) as usize;
        if count == 0 {
            return None;
        }
        let mut table = vec![0u8; count * LOC_ENTRY_BYTES];
        self.transport.get(loc_window, node.0, 8, &mut table).ok()?;
        let mut reader = ByteReader::new(&table);
        for _ in 0..count {
            let entry_index = u64::de(&mut reader).ok()?;
            let offset = u64::de(&mut reader).ok()?;
            let size = u64::de(&mut reader).ok()?;
            if entry_index == index {
                return Some(IndexInfo {
                    node,
                    offset: offset as usize,
                    size: size as usize,
                });
            }
        }
        None
    }

    /// Reads the whole block of one index.
    pub fn indexed_get<T: FixedWire>(
        &mut self,
        handle: IndexedHandle<T>,
        index: u64,
        lock: LockLevel,
    ) -> Vec<T> {
        assert!(
            self.rdma.sub_state_mut(handle.id).ready,
            "indexed handle {} is not ready",
            handle.id
        );
        let info = self.resolve_index(handle.id, index);
        let window = self
            .rdma
            .sub_state_mut(handle.id)
            .data_window
            .expect("ready handle has windows");
        self.with_lock(window, info.node, lock, |rt| {
            let mut buf = vec![0u8; info.size * T::BYTES];
            rt.transport
                .get(window, info.node.0, info.offset, &mut buf)
                .unwrap_or_else(|error| panic!("indexed get failed: {error}"));
            decode_elems(&buf)
        })
    }

    /// Overwrites the block of one index.
    pub fn indexed_put<T: FixedWire>(
        &mut self,
        handle: IndexedHandle<T>,
        index: u64,
        values: &[T],
        lock: LockLevel,
    ) {
        assert!(
            self.rdma.sub_state_mut(handle.id).ready,
            "indexed handle {} is not ready",
            handle.id
        );
        let info = self.resolve_index(handle.id, index);
        assert!(
            values.len() <= info.size,
            "put of {} elements into block of {} at index {index}",
            values.len(),
            info.size
        );
        let window = self
            .rdma
            .sub_state_mut(handle.id)
            .data_window
            .expect("ready handle has windows");
        let bytes = encode_elems(values);
        self.with_lock(window, info.node, lock, |rt| {
            rt.transport
                .put(window, info.node.0, info.offset, &bytes)
                .unwrap_or_else(|error| panic!("indexed put failed: {error}"));
        });
    }

    /// Element-wise accumulate into the block of one index.
    pub fn indexed_accum<T: AccumElem>(
        &mut self,
        handle: IndexedHandle<T>,
        index: u64,
        values: &[T],
        lock: LockLevel,
    ) {
        assert!(
            self.rdma.sub_state_mut(handle.id).ready,
            "indexed handle {} is not ready",
            handle.id
        );
        let info = self.resolve_index(handle.id, index);
        let window = self
            .rdma
            .sub_state_mut(handle.id)
            .data_window
            .expect("ready handle has windows");
        let bytes = encode_elems(values);
        self.with_lock(window, info.node, lock, |rt| {
            rt.transport
                .accum(window, info.node.0, info.offset, &bytes, T::KIND)
                .unwrap_or_else(|error| panic!("indexed accum failed: {error}"));
        });
    }

    /// Collective destruction of an index-scoped handle; the state goes
    /// away with the last mapped block.
    pub fn destroy_indexed_handle<T>(&mut self, handle: IndexedHandle<T>) {
        self.system_barrier();
        if let Some(state) = self.rdma.subs.remove(&handle.id) {
            if let Some(window) = state.data_window {
                let _ = self.transport.free_window(window);
            }
            if let Some(window) = state.loc_window {
                let _ = self.transport.free_window(window);
            }
        }
    }

    /// Post-LB rebuild. All-or-none: an OR-reduction of "did my block set
    /// change"; when any process changed, every process fetches the data
    /// of its newly-owned blocks from the stale layout, tears its windows
    /// down, re-lays out, invalidates its cache, and restores the data.
    pub(crate) fn rebuild_indexed(&mut self, id: u64) {
        let changed = {
            let state = self.rdma.sub_state_mut(id);
            state.rebuild_decision = None;
            state.rebuild_round += 1;
            !state.migrate_in.is_empty() || !state.migrate_out.is_empty()
        };
        let round = self.rdma.sub_state_mut(id).rebuild_round;
        let ready_handler = self.sys.rdma_ready;
        self.with_no_epoch(|rt| {
            rt.reduce::<bool>(
                ReduceScope::Component(COMPONENT_RDMA),
                Some(ReduceStamp::TagPair(id, round)),
                rt.sysops.or_bool,
                NodeId(0),
                &changed,
                ReduceAction::Callback(Box::new(move |rt, combined| {
                    let any = plenum_wire::from_bytes::<bool>(combined)
                        .unwrap_or_else(|e| panic!("corrupt rebuild agreement: {e}"));
                    rt.broadcast_system(
                        ready_handler,
                        &RdmaReadyMsg {
                            handle: id,
                            kind: if any { 1 } else { 2 },
                        },
                    );
                })),
            );
        });
        self.run_scheduler_while(move |rt| {
            rt.rdma.sub_state_mut(id).rebuild_decision.is_none()
        });
        let rebuild = self.rdma.sub_state_mut(id).rebuild_decision == Some(true);
        if !rebuild {
            return;
        }
        debug!("rebuilding indexed handle {id} after migration");

        // the new block set is whatever the collection now holds here
        let (class, elem_bytes, universe) = {
            let state = self.rdma.sub_state_mut(id);
            (state.class, state.elem_bytes, state.universe.clone())
        };
        let mut new_local: Vec<u64> = Vec::new();
        {
            let instance = self.collections.instance_mut(class);
            for &index in universe.keys() {
                if instance.elements.contains_key(&index) {
                    new_local.push(index);
                }
            }
        }

        // stage every newly-owned block's data out of the stale layout
        let mut staged: BTreeMap<u64, Vec<u8>> = BTreeMap::new();
        for &index in &new_local {
            let info = self.resolve_index(id, index);
            let window = self
                .rdma
                .sub_state_mut(id)
                .data_window
                .expect("windows exist before rebuild");
            let mut buf = vec![0u8; info.size * elem_bytes];
            self.transport
                .get(window, info.node.0, info.offset, &mut buf)
                .unwrap_or_else(|error| panic!("rebuild staging failed: {error}"));
            staged.insert(index, buf);
        }
        self.system_barrier();

        // tear down and re-create with the post-migration layout
        {
            let state = self.rdma.sub_state_mut(id);
            let data_window = state.data_window.take();
            let loc_window = state.loc_window.take();
            if let Some(window) = data_window {
                let _ = self.transport.free_window(window);
            }
            if let Some(window) = loc_window {
                let _ = self.transport.free_window(window);
            }
        }
        let me = self.node();
        let descs: Vec<IndexDesc> = new_local
            .iter()
            .map(|&index| IndexDesc {
                index,
                node: me,
                size: universe[&index] as u64,
            })
            .collect();
        // every process needs the full new layout; gather it the same way
        // construction did
        let layout_handler = self.sys.rdma_layout;
        self.with_no_epoch(|rt| {
            rt.reduce::<Vec<IndexDesc>>(
                ReduceScope::Component(COMPONENT_RDMA),
                Some(ReduceStamp::TagPair(id, u64::MAX - round)),
                rt.sysops.merge_layout,
                NodeId(0),
                &descs,
                ReduceAction::Callback(Box::new(move |rt, combined| {
                    let descs = plenum_wire::from_bytes::<Vec<IndexDesc>>(combined)
                        .unwrap_or_else(|e| panic!("corrupt rdma layout: {e}"));
                    rt.broadcast_system(layout_handler, &RdmaLayoutMsg { handle: id, descs });
                })),
            );
        });
        self.run_scheduler_while(move |rt| rt.rdma.sub_state_mut(id).data_window.is_none());

        // restore the staged values into the new local positions
        let data_window = self
            .rdma
            .sub_state_mut(id)
            .data_window
            .expect("windows rebuilt");
        for (index, bytes) in staged {
            let (offset, _) = self.rdma.sub_state_mut(id).local[&index];
            self.transport
                .put(data_window, me.0, offset, &bytes)
                .unwrap_or_else(|error| panic!("rebuild restore failed: {error}"));
        }
        let state = self.rdma.sub_state_mut(id);
        state.migrate_in.clear();
        state.migrate_out.clear();
        self.system_barrier();
        debug!("indexed handle {id} rebuilt");
    }
}

/// The agreed global layout arriving at each process: build (or rebuild)
/// the local windows from it.
pub(crate) fn on_layout_broadcast(
    runtime: &mut Runtime,
    _envelope: &Envelope,
    reader: &mut ByteReader,
) {
    let msg = RdmaLayoutMsg::de(reader).unwrap_or_else(|e| panic!("corrupt rdma layout: {e}"));
    let first_build = runtime
        .rdma
        .sub_state_mut(msg.handle)
        .data_window
        .is_none();
    runtime.build_indexed_windows(msg.handle, &msg.descs);
    if first_build && !runtime.rdma.sub_state_mut(msg.handle).ready {
        runtime.rdma_agree_ready(msg.handle);
    }
}
