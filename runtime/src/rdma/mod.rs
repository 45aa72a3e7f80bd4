//! Typed RDMA handles over one-sided windows: node-scoped handles (one
//! block per process) and index-scoped handles (one block per collection
//! element), with lock-bracketed access, a descriptor window plus cache
//! for index location, and a collective rebuild after load balancing.

mod indexed;

pub(crate) use indexed::on_layout_broadcast;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::marker::PhantomData;

use log::{debug, trace};

use plenum_transport::{AccumKind, FenceAssert, LockLevel, WindowId};
use plenum_wire::{ByteReader, ByteWriter, FixedWire, Wire, WireErr};

use crate::collective::reduce::manager::ReduceAction;
use crate::collective::reduce::scope::{ReduceScope, ReduceStamp};
use crate::messaging::envelope::Envelope;
use crate::pending::RequestHolder;
use crate::runtime::Runtime;
use crate::types::{ClassId, NodeId};

/// Component ID for handle-construction agreements.
const COMPONENT_RDMA: u32 = 4;

/// Element types accepted by accumulate operations; maps onto the
/// transport's element interpretation (MPI_SUM over a datatype).
pub trait AccumElem: FixedWire {
    const KIND: AccumKind;
}

impl AccumElem for f64 {
    const KIND: AccumKind = AccumKind::F64;
}

impl AccumElem for u64 {
    const KIND: AccumKind = AccumKind::U64;
}

impl AccumElem for i64 {
    const KIND: AccumKind = AccumKind::I64;
}

/// Node-scoped handle: one local block of `T` per process.
pub struct RdmaHandle<T> {
    pub(crate) id: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for RdmaHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for RdmaHandle<T> {}

/// Index-scoped handle: one block of `T` per collection element.
pub struct IndexedHandle<T> {
    pub(crate) id: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for IndexedHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for IndexedHandle<T> {}

/// Resolved placement of one index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexInfo {
    pub node: NodeId,
    /// Byte offset inside the owner's data window
    pub offset: usize,
    /// Element count
    pub size: usize,
}

/// One index's descriptor in the construction / layout agreement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexDesc {
    pub index: u64,
    pub node: NodeId,
    pub size: u64,
}

impl Wire for IndexDesc {
    fn ser(&self, writer: &mut ByteWriter) {
        self.index.ser(writer);
        self.node.ser(writer);
        self.size.ser(writer);
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        Ok(Self {
            index: u64::de(reader)?,
            node: NodeId::de(reader)?,
            size: u64::de(reader)?,
        })
    }
}

struct NodeHandleState {
    data_window: WindowId,
    count: usize,
    elem_bytes: usize,
    uniform: bool,
    ready: bool,
}

struct SubHandleState {
    class: ClassId,
    elem_bytes: usize,
    data_window: Option<WindowId>,
    loc_window: Option<WindowId>,
    /// index -> (byte offset, element count) in the local data window
    local: BTreeMap<u64, (usize, usize)>,
    /// every index in the handle with its element count, agreed at commit
    universe: BTreeMap<u64, usize>,
    cache: HashMap<u64, IndexInfo>,
    ready: bool,
    rebuild_round: u64,
    rebuild_decision: Option<bool>,
    migrate_in: HashSet<u64>,
    migrate_out: HashSet<u64>,
}

/// Registry of all handles on this process.
pub struct RdmaManager {
    nodes: HashMap<u64, NodeHandleState>,
    subs: HashMap<u64, SubHandleState>,
    /// per-class indexed registrations awaiting their collective commit
    pending_indexed: HashMap<ClassId, BTreeMap<u64, usize>>,
    next_handle: u64,
}

impl RdmaManager {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            subs: HashMap::new(),
            pending_indexed: HashMap::new(),
            next_handle: 0,
        }
    }

    fn node_state(&self, id: u64) -> &NodeHandleState {
        self.nodes
            .get(&id)
            .unwrap_or_else(|| panic!("rdma handle {id} does not exist"))
    }

    fn sub_state_mut(&mut self, id: u64) -> &mut SubHandleState {
        self.subs
            .get_mut(&id)
            .unwrap_or_else(|| panic!("indexed rdma handle {id} does not exist"))
    }
}

impl Default for RdmaManager {
    fn default() -> Self {
        Self::new()
    }
}

struct RdmaReadyMsg {
    handle: u64,
    /// 0 = construction done; 1 = rebuild; 2 = no rebuild needed
    kind: u8,
}

impl Wire for RdmaReadyMsg {
    fn ser(&self, writer: &mut ByteWriter) {
        self.handle.ser(writer);
        self.kind.ser(writer);
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        Ok(Self {
            handle: u64::de(reader)?,
            kind: u8::de(reader)?,
        })
    }
}

struct RdmaLayoutMsg {
    handle: u64,
    descs: Vec<IndexDesc>,
}

impl Wire for RdmaLayoutMsg {
    fn ser(&self, writer: &mut ByteWriter) {
        self.handle.ser(writer);
        self.descs.ser(writer);
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        Ok(Self {
            handle: u64::de(reader)?,
            descs: Vec::<IndexDesc>::de(reader)?,
        })
    }
}

fn encode_elems<T: FixedWire>(values: &[T]) -> Vec<u8> {
    let mut writer = ByteWriter::with_capacity(values.len() * T::BYTES);
    for value in values {
        value.ser(&mut writer);
    }
    writer.into_bytes()
}

fn decode_elems<T: FixedWire>(bytes: &[u8]) -> Vec<T> {
    let mut reader = ByteReader::new(bytes);
    let mut values = Vec::with_capacity(bytes.len() / T::BYTES.max(1));
    while !reader.is_empty() {
        values.push(T::de(&mut reader).unwrap_or_else(|e| panic!("corrupt window data: {e}")));
    }
    values
}

impl Runtime {
    fn rdma_agree_ready(&mut self, handle: u64) {
        let ready_handler = self.sys.rdma_ready;
        self.with_no_epoch(|rt| {
            rt.reduce::<()>(
                ReduceScope::Component(COMPONENT_RDMA),
                Some(ReduceStamp::TagPair(handle, 0)),
                rt.sysops.none,
                NodeId(0),
                &(),
                ReduceAction::Callback(Box::new(move |rt, _| {
                    rt.broadcast_system(ready_handler, &RdmaReadyMsg { handle, kind: 0 });
                })),
            );
        });
    }

    /// Collectively creates a node-scoped handle backing `count` elements
    /// of `T` on each process (`uniform` asserts every process passes the
    /// same count). The handle becomes ready once every process has
    /// allocated its window; poll [`Runtime::rdma_is_ready`] or block on
    /// [`Runtime::rdma_wait_ready`].
    pub fn make_handle_objgroup<O: 'static, T: FixedWire>(
        &mut self,
        _proxy: crate::objgroup::ObjGroupProxy<O>,
        count: usize,
        uniform: bool,
    ) -> RdmaHandle<T> {
        let id = self.rdma.next_handle;
        self.rdma.next_handle += 1;
        let data_window = self
            .transport
            .alloc_window(count * T::BYTES)
            .unwrap_or_else(|error| panic!("window allocation failed: {error}"));
        debug!(
            "make rdma handle {id}: count={count}, elem_bytes={}, uniform={uniform}",
            T::BYTES
        );
        self.rdma.nodes.insert(
            id,
            NodeHandleState {
                data_window,
                count,
                elem_bytes: T::BYTES,
                uniform,
                ready: false,
            },
        );
        self.rdma_agree_ready(id);
        RdmaHandle {
            id,
            _marker: PhantomData,
        }
    }

    pub fn rdma_is_ready<T>(&self, handle: RdmaHandle<T>) -> bool {
        self.rdma.node_state(handle.id).ready
    }

    pub fn rdma_wait_ready<T>(&mut self, handle: RdmaHandle<T>) {
        let id = handle.id;
        self.run_scheduler_while(move |rt| !rt.rdma.node_state(id).ready);
    }

    /// Local element count of a node-scoped handle on this process.
    pub fn rdma_local_count<T>(&self, handle: RdmaHandle<T>) -> usize {
        self.rdma.node_state(handle.id).count
    }

    /// Whether the handle was declared uniform (equal counts everywhere).
    pub fn rdma_is_uniform<T>(&self, handle: RdmaHandle<T>) -> bool {
        self.rdma.node_state(handle.id).uniform
    }

    fn with_lock<R>(
        &mut self,
        window: WindowId,
        node: NodeId,
        lock: LockLevel,
        op: impl FnOnce(&mut Self) -> R,
    ) -> R {
        if lock != LockLevel::None {
            self.transport
                .lock(window, node.0, lock)
                .unwrap_or_else(|error| panic!("window lock failed: {error}"));
        }
        let result = op(self);
        if lock != LockLevel::None {
            self.transport
                .unlock(window, node.0)
                .unwrap_or_else(|error| panic!("window unlock failed: {error}"));
        }
        result
    }

    /// Reads `count` elements starting at `offset` from `node`'s block.
    pub fn rdma_get<T: FixedWire>(
        &mut self,
        handle: RdmaHandle<T>,
        node: NodeId,
        offset: usize,
        count: usize,
        lock: LockLevel,
    ) -> Vec<T> {
        let state = self.rdma.node_state(handle.id);
        assert!(state.ready, "rdma handle {} is not ready", handle.id);
        let window = state.data_window;
        let elem_bytes = state.elem_bytes;
        self.with_lock(window, node, lock, |rt| {
            let mut buf = vec![0u8; count * elem_bytes];
            rt.transport
                .get(window, node.0, offset * elem_bytes, &mut buf)
                .unwrap_or_else(|error| panic!("rdma get failed: {error}"));
            decode_elems(&buf)
        })
    }

    /// Writes elements into `node`'s block starting at `offset`.
    pub fn rdma_put<T: FixedWire>(
        &mut self,
        handle: RdmaHandle<T>,
        node: NodeId,
        offset: usize,
        values: &[T],
        lock: LockLevel,
    ) {
        let state = self.rdma.node_state(handle.id);
        assert!(state.ready, "rdma handle {} is not ready", handle.id);
        let window = state.data_window;
        let elem_bytes = state.elem_bytes;
        let bytes = encode_elems(values);
        self.with_lock(window, node, lock, |rt| {
            rt.transport
                .put(window, node.0, offset * elem_bytes, &bytes)
                .unwrap_or_else(|error| panic!("rdma put failed: {error}"));
        });
    }

    /// Element-wise accumulate (sum) into `node`'s block.
    pub fn rdma_accum<T: AccumElem>(
        &mut self,
        handle: RdmaHandle<T>,
        node: NodeId,
        offset: usize,
        values: &[T],
        lock: LockLevel,
    ) {
        let state = self.rdma.node_state(handle.id);
        assert!(state.ready, "rdma handle {} is not ready", handle.id);
        let window = state.data_window;
        let elem_bytes = state.elem_bytes;
        let bytes = encode_elems(values);
        self.with_lock(window, node, lock, |rt| {
            rt.transport
                .accum(window, node.0, offset * elem_bytes, &bytes, T::KIND)
                .unwrap_or_else(|error| panic!("rdma accum failed: {error}"));
        });
    }

    /// Async get: completes through the request holder; fetch the data
    /// with [`Runtime::rdma_request_result`].
    pub fn rdma_rget<T: FixedWire>(
        &mut self,
        handle: RdmaHandle<T>,
        node: NodeId,
        offset: usize,
        count: usize,
        lock: LockLevel,
    ) -> RequestHolder {
        let data = self.rdma_get(handle, node, offset, count, lock);
        self.finish_request(Some(encode_elems(&data)))
    }

    pub fn rdma_rput<T: FixedWire>(
        &mut self,
        handle: RdmaHandle<T>,
        node: NodeId,
        offset: usize,
        values: &[T],
        lock: LockLevel,
    ) -> RequestHolder {
        self.rdma_put(handle, node, offset, values, lock);
        self.finish_request(None)
    }

    pub fn rdma_raccum<T: AccumElem>(
        &mut self,
        handle: RdmaHandle<T>,
        node: NodeId,
        offset: usize,
        values: &[T],
        lock: LockLevel,
    ) -> RequestHolder {
        self.rdma_accum(handle, node, offset, values, lock);
        self.finish_request(None)
    }

    fn finish_request(&mut self, result: Option<Vec<u8>>) -> RequestHolder {
        let event = self.events.create();
        if let Some(bytes) = result {
            self.rdma_results.insert(event.0, bytes);
        }
        self.complete_event(event);
        RequestHolder::new(event)
    }

    /// Retrieves the data of a completed async get.
    pub fn rdma_request_result<T: FixedWire>(&mut self, request: RequestHolder) -> Vec<T> {
        let bytes = self
            .rdma_results
            .remove(&request.event.0)
            .unwrap_or_else(|| panic!("request has no pending result"));
        decode_elems(&bytes)
    }

    pub fn rdma_fence<T>(&mut self, handle: RdmaHandle<T>, asserts: FenceAssert) {
        let window = self.rdma.node_state(handle.id).data_window;
        self.transport
            .fence(window, asserts)
            .unwrap_or_else(|error| panic!("window fence failed: {error}"));
    }

    pub fn rdma_sync<T>(&mut self, handle: RdmaHandle<T>) {
        let window = self.rdma.node_state(handle.id).data_window;
        self.transport
            .sync(window)
            .unwrap_or_else(|error| panic!("window sync failed: {error}"));
    }

    pub fn rdma_flush<T>(&mut self, handle: RdmaHandle<T>, node: NodeId) {
        let window = self.rdma.node_state(handle.id).data_window;
        self.transport
            .flush(window, node.0)
            .unwrap_or_else(|error| panic!("window flush failed: {error}"));
    }

    pub fn rdma_flush_local<T>(&mut self, handle: RdmaHandle<T>, node: NodeId) {
        let window = self.rdma.node_state(handle.id).data_window;
        self.transport
            .flush_local(window, node.0)
            .unwrap_or_else(|error| panic!("window flush failed: {error}"));
    }

    pub fn rdma_flush_all<T>(&mut self, handle: RdmaHandle<T>) {
        let window = self.rdma.node_state(handle.id).data_window;
        self.transport
            .flush_all(window)
            .unwrap_or_else(|error| panic!("window flush failed: {error}"));
    }

    /// Collective destruction of a node-scoped handle.
    pub fn destroy_handle<T>(&mut self, handle: RdmaHandle<T>) {
        self.system_barrier();
        if let Some(state) = self.rdma.nodes.remove(&handle.id) {
            let _ = self.transport.free_window(state.data_window);
        }
    }
}

/// Agreement broadcast for handle lifecycle: construction-ready, or the
/// all-or-none rebuild decision after load balancing.
pub(crate) fn on_handle_ready(runtime: &mut Runtime, _envelope: &Envelope, reader: &mut ByteReader) {
    let msg = RdmaReadyMsg::de(reader).unwrap_or_else(|e| panic!("corrupt rdma agreement: {e}"));
    match msg.kind {
        0 => {
            if let Some(state) = runtime.rdma.nodes.get_mut(&msg.handle) {
                state.ready = true;
            }
            if let Some(state) = runtime.rdma.subs.get_mut(&msg.handle) {
                state.ready = true;
            }
            trace!("rdma handle {} ready", msg.handle);
        }
        1 => runtime.rdma.sub_state_mut(msg.handle).rebuild_decision = Some(true),
        2 => runtime.rdma.sub_state_mut(msg.handle).rebuild_decision = Some(false),
        kind => panic!("unknown rdma agreement kind {kind}"),
    }
}
