//! # Plenum Transport
//! The three contracts the runtime core depends on, and an in-memory
//! implementation of all of them for multi-rank testing:
//!
//! 1. [`Endpoint`] — unordered, reliable two-sided point-to-point.
//! 2. [`OneSided`] — MPI-3-style RMA windows with locks, fences and flushes.
//! 3. [`ProcessContext`] — rank identity and a process-wide sync.

mod error;
mod memory;
mod window;

pub use error::TransportError;
pub use memory::{MemoryEndpoint, MemoryFabric};
pub use window::{AccumKind, FenceAssert, LockLevel, Request, WindowId};

use std::sync::Arc;

/// A buffer handed to the transport. Shared ownership: the enqueueing site
/// and the transport both hold the payload until the send has been copied
/// out or delivered.
pub type Payload = Arc<[u8]>;

/// Two-sided point-to-point. Delivery is reliable but unordered; nothing
/// above this layer may assume program order between sends.
pub trait Endpoint {
    fn send(&mut self, dest: u32, handler: u32, payload: Payload) -> Result<(), TransportError>;

    /// Surfaces one arrived buffer, if any. Non-blocking.
    fn probe(&mut self) -> Option<(u32, Payload)>;
}

/// One-sided memory windows. Semantics follow MPI-3 RMA: a window is
/// allocated collectively (every rank calls [`OneSided::alloc_window`] in
/// the same program order), accesses target `(window, rank, byte offset)`,
/// and must be bracketed by lock/unlock or synchronized with
/// fence/sync/flush.
pub trait OneSided {
    fn alloc_window(&mut self, bytes: usize) -> Result<WindowId, TransportError>;
    fn free_window(&mut self, window: WindowId) -> Result<(), TransportError>;

    fn get(
        &mut self,
        window: WindowId,
        rank: u32,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<(), TransportError>;
    fn put(
        &mut self,
        window: WindowId,
        rank: u32,
        offset: usize,
        data: &[u8],
    ) -> Result<(), TransportError>;
    /// Element-wise sum into the target region, like `MPI_Accumulate` with
    /// `MPI_SUM`. `data.len()` must be a multiple of the element width.
    fn accum(
        &mut self,
        window: WindowId,
        rank: u32,
        offset: usize,
        data: &[u8],
        kind: AccumKind,
    ) -> Result<(), TransportError>;

    fn rget(
        &mut self,
        window: WindowId,
        rank: u32,
        offset: usize,
        len: usize,
    ) -> Result<Request, TransportError>;
    fn rput(
        &mut self,
        window: WindowId,
        rank: u32,
        offset: usize,
        data: &[u8],
    ) -> Result<Request, TransportError>;
    fn raccum(
        &mut self,
        window: WindowId,
        rank: u32,
        offset: usize,
        data: &[u8],
        kind: AccumKind,
    ) -> Result<Request, TransportError>;

    /// Polls an outstanding request. `rget` requests yield their data once;
    /// `rput`/`raccum` requests yield an empty buffer when complete.
    fn try_complete(&mut self, request: Request) -> Result<Option<Vec<u8>>, TransportError>;

    fn lock(&mut self, window: WindowId, rank: u32, level: LockLevel)
        -> Result<(), TransportError>;
    fn unlock(&mut self, window: WindowId, rank: u32) -> Result<(), TransportError>;

    fn fence(&mut self, window: WindowId, asserts: FenceAssert) -> Result<(), TransportError>;
    fn sync(&mut self, window: WindowId) -> Result<(), TransportError>;
    fn flush(&mut self, window: WindowId, rank: u32) -> Result<(), TransportError>;
    fn flush_local(&mut self, window: WindowId, rank: u32) -> Result<(), TransportError>;
    fn flush_all(&mut self, window: WindowId) -> Result<(), TransportError>;
}

/// Rank identity and process-wide synchronization.
pub trait ProcessContext {
    fn rank(&self) -> u32;
    fn num_ranks(&self) -> u32;

    /// Process-wide barrier across every rank of the job. Blocking; used
    /// only at startup/shutdown edges, never from inside the scheduler.
    fn system_sync(&self);
}

/// The full transport stack the runtime is constructed over.
pub trait Transport: Endpoint + OneSided + ProcessContext + Send {}

impl<T: Endpoint + OneSided + ProcessContext + Send> Transport for T {}
