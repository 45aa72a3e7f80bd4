//! In-memory fabric: routes buffers between N simulated ranks without any
//! network I/O, and backs one-sided windows with plain byte vectors.
//!
//! Coherence is immediate (a `put` is visible to the next `get` on any
//! rank), so `fence`/`sync`/`flush` only have ordering meaning here and
//! complete without blocking. Lock semantics are real: shared locks admit
//! concurrent holders, exclusive locks block until the target is free.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Barrier, Condvar, Mutex};

use log::trace;

use crate::error::TransportError;
use crate::window::{AccumKind, FenceAssert, LockLevel, Request, WindowId};
use crate::{Endpoint, OneSided, Payload, ProcessContext};

#[derive(Default)]
struct LockState {
    sharers: usize,
    exclusive: bool,
}

struct FabricShared {
    num_ranks: u32,
    scramble: bool,
    inboxes: Vec<Mutex<VecDeque<(u32, Payload)>>>,
    windows: Mutex<HashMap<(u64, u32), Vec<u8>>>,
    locks: Mutex<HashMap<(u64, u32), LockState>>,
    lock_waiters: Condvar,
    sync: Barrier,
}

/// Factory for connected [`MemoryEndpoint`]s. Hand one endpoint to each
/// simulated rank (usually one OS thread per rank).
pub struct MemoryFabric {
    shared: Arc<FabricShared>,
}

impl MemoryFabric {
    pub fn new(num_ranks: u32) -> Self {
        Self::build(num_ranks, false)
    }

    /// A fabric that deliberately reorders delivery, for exercising the
    /// no-ordering assumption of everything above it.
    pub fn with_scramble(num_ranks: u32) -> Self {
        Self::build(num_ranks, true)
    }

    fn build(num_ranks: u32, scramble: bool) -> Self {
        let inboxes = (0..num_ranks)
            .map(|_| Mutex::new(VecDeque::new()))
            .collect();
        Self {
            shared: Arc::new(FabricShared {
                num_ranks,
                scramble,
                inboxes,
                windows: Mutex::new(HashMap::new()),
                locks: Mutex::new(HashMap::new()),
                lock_waiters: Condvar::new(),
                sync: Barrier::new(num_ranks as usize),
            }),
        }
    }

    pub fn endpoint(&self, rank: u32) -> MemoryEndpoint {
        assert!(
            rank < self.shared.num_ranks,
            "rank {} out of bounds for fabric of {} ranks",
            rank,
            self.shared.num_ranks
        );
        MemoryEndpoint {
            shared: self.shared.clone(),
            rank,
            next_window: 0,
            next_request: 0,
            completed: HashMap::new(),
            held_locks: HashMap::new(),
            rng: fastrand::Rng::with_seed(0x9E37_79B9 ^ rank as u64),
        }
    }
}

/// One rank's view of the fabric.
pub struct MemoryEndpoint {
    shared: Arc<FabricShared>,
    rank: u32,
    next_window: u64,
    next_request: u64,
    completed: HashMap<u64, Vec<u8>>,
    held_locks: HashMap<(u64, u32), LockLevel>,
    rng: fastrand::Rng,
}

impl MemoryEndpoint {
    fn check_rank(&self, rank: u32) -> Result<(), TransportError> {
        if rank >= self.shared.num_ranks {
            return Err(TransportError::RankOutOfBounds {
                rank,
                num_ranks: self.shared.num_ranks,
            });
        }
        Ok(())
    }

    fn with_region<R>(
        &self,
        window: WindowId,
        rank: u32,
        offset: usize,
        len: usize,
        op: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, TransportError> {
        self.check_rank(rank)?;
        let mut windows = self.shared.windows.lock().expect("fabric poisoned");
        let block = windows
            .get_mut(&(window.0, rank))
            .ok_or(TransportError::WindowNotReady {
                window: window.0,
                rank,
            })?;
        if offset + len > block.len() {
            return Err(TransportError::RangeOutOfBounds {
                window: window.0,
                rank,
                offset,
                len,
                size: block.len(),
            });
        }
        Ok(op(&mut block[offset..offset + len]))
    }

    fn apply_accum(
        target: &mut [u8],
        data: &[u8],
        kind: AccumKind,
    ) -> Result<(), TransportError> {
        let width = kind.width();
        if data.len() % width != 0 {
            return Err(TransportError::BadAccumLength {
                len: data.len(),
                width,
            });
        }
        for (chunk_target, chunk_data) in target.chunks_exact_mut(width).zip(data.chunks_exact(width)) {
            let mut array = [0u8; 8];
            array.copy_from_slice(chunk_target);
            let mut incoming = [0u8; 8];
            incoming.copy_from_slice(chunk_data);
            let summed: [u8; 8] = match kind {
                AccumKind::F64 => {
                    (f64::from_le_bytes(array) + f64::from_le_bytes(incoming)).to_le_bytes()
                }
                AccumKind::U64 => u64::from_le_bytes(array)
                    .wrapping_add(u64::from_le_bytes(incoming))
                    .to_le_bytes(),
                AccumKind::I64 => i64::from_le_bytes(array)
                    .wrapping_add(i64::from_le_bytes(incoming))
                    .to_le_bytes(),
            };
            chunk_target.copy_from_slice(&summed);
        }
        Ok(())
    }

    fn stash_request(&mut self, data: Vec<u8>) -> Request {
        let id = self.next_request;
        self.next_request += 1;
        self.completed.insert(id, data);
        Request(id)
    }
}

impl Endpoint for MemoryEndpoint {
    fn send(&mut self, dest: u32, handler: u32, payload: Payload) -> Result<(), TransportError> {
        self.check_rank(dest)?;
        let mut inbox = self.shared.inboxes[dest as usize]
            .lock()
            .expect("fabric poisoned");
        if self.shared.scramble && !inbox.is_empty() {
            let position = self.rng.usize(0..=inbox.len());
            inbox.insert(position, (handler, payload));
        } else {
            inbox.push_back((handler, payload));
        }
        Ok(())
    }

    fn probe(&mut self) -> Option<(u32, Payload)> {
        let mut inbox = self.shared.inboxes[self.rank as usize]
            .lock()
            .expect("fabric poisoned");
        inbox.pop_front()
    }
}

impl OneSided for MemoryEndpoint {
    fn alloc_window(&mut self, bytes: usize) -> Result<WindowId, TransportError> {
        let id = self.next_window;
        self.next_window += 1;
        trace!("rank {} alloc window {} of {} bytes", self.rank, id, bytes);
        let mut windows = self.shared.windows.lock().expect("fabric poisoned");
        windows.insert((id, self.rank), vec![0u8; bytes]);
        Ok(WindowId(id))
    }

    fn free_window(&mut self, window: WindowId) -> Result<(), TransportError> {
        let mut windows = self.shared.windows.lock().expect("fabric poisoned");
        windows.remove(&(window.0, self.rank));
        Ok(())
    }

    fn get(
        &mut self,
        window: WindowId,
        rank: u32,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<(), TransportError> {
        self.with_region(window, rank, offset, buf.len(), |region| {
            buf.copy_from_slice(region);
        })
    }

    fn put(
        &mut self,
        window: WindowId,
        rank: u32,
        offset: usize,
        data: &[u8],
    ) -> Result<(), TransportError> {
        self.with_region(window, rank, offset, data.len(), |region| {
            region.copy_from_slice(data);
        })
    }

    fn accum(
        &mut self,
        window: WindowId,
        rank: u32,
        offset: usize,
        data: &[u8],
        kind: AccumKind,
    ) -> Result<(), TransportError> {
        self.with_region(window, rank, offset, data.len(), |region| {
            Self::apply_accum(region, data, kind)
        })?
    }

    fn rget(
        &mut self,
        window: WindowId,
        rank: u32,
        offset: usize,
        len: usize,
    ) -> Result<Request, TransportError> {
        let mut buf = vec![0u8; len];
        self.get(window, rank, offset, &mut buf)?;
        Ok(self.stash_request(buf))
    }

    fn rput(
        &mut self,
        window: WindowId,
        rank: u32,
        offset: usize,
        data: &[u8],
    ) -> Result<Request, TransportError> {
        self.put(window, rank, offset, data)?;
        Ok(self.stash_request(Vec::new()))
    }

    fn raccum(
        &mut self,
        window: WindowId,
        rank: u32,
        offset: usize,
        data: &[u8],
        kind: AccumKind,
    ) -> Result<Request, TransportError> {
        self.accum(window, rank, offset, data, kind)?;
        Ok(self.stash_request(Vec::new()))
    }

    fn try_complete(&mut self, request: Request) -> Result<Option<Vec<u8>>, TransportError> {
        match self.completed.remove(&request.0) {
            Some(data) => Ok(Some(data)),
            None => Err(TransportError::UnknownRequest { request: request.0 }),
        }
    }

    fn lock(
        &mut self,
        window: WindowId,
        rank: u32,
        level: LockLevel,
    ) -> Result<(), TransportError> {
        self.check_rank(rank)?;
        if level == LockLevel::None {
            return Ok(());
        }
        let mut locks = self.shared.locks.lock().expect("fabric poisoned");
        loop {
            let state = locks.entry((window.0, rank)).or_default();
            match level {
                LockLevel::Shared if !state.exclusive => {
                    state.sharers += 1;
                    break;
                }
                LockLevel::Exclusive if !state.exclusive && state.sharers == 0 => {
                    state.exclusive = true;
                    break;
                }
                _ => {
                    locks = self
                        .shared
                        .lock_waiters
                        .wait(locks)
                        .expect("fabric poisoned");
                }
            }
        }
        self.held_locks.insert((window.0, rank), level);
        Ok(())
    }

    fn unlock(&mut self, window: WindowId, rank: u32) -> Result<(), TransportError> {
        let level = self.held_locks.remove(&(window.0, rank)).ok_or(
            TransportError::UnbalancedUnlock {
                window: window.0,
                rank,
            },
        )?;
        let mut locks = self.shared.locks.lock().expect("fabric poisoned");
        let state = locks.entry((window.0, rank)).or_default();
        match level {
            LockLevel::Shared => state.sharers = state.sharers.saturating_sub(1),
            LockLevel::Exclusive => state.exclusive = false,
            LockLevel::None => {}
        }
        drop(locks);
        self.shared.lock_waiters.notify_all();
        Ok(())
    }

    fn fence(&mut self, _window: WindowId, _asserts: FenceAssert) -> Result<(), TransportError> {
        Ok(())
    }

    fn sync(&mut self, _window: WindowId) -> Result<(), TransportError> {
        Ok(())
    }

    fn flush(&mut self, _window: WindowId, _rank: u32) -> Result<(), TransportError> {
        Ok(())
    }

    fn flush_local(&mut self, _window: WindowId, _rank: u32) -> Result<(), TransportError> {
        Ok(())
    }

    fn flush_all(&mut self, _window: WindowId) -> Result<(), TransportError> {
        Ok(())
    }
}

impl ProcessContext for MemoryEndpoint {
    fn rank(&self) -> u32 {
        self.rank
    }

    fn num_ranks(&self) -> u32 {
        self.shared.num_ranks
    }

    fn system_sync(&self) {
        self.shared.sync.wait();
    }
}
