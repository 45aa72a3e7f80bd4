use thiserror::Error;

/// Errors surfaced by a transport implementation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Destination rank is outside `[0, num_ranks)`
    #[error("Rank {rank} out of bounds for job of {num_ranks} ranks")]
    RankOutOfBounds { rank: u32, num_ranks: u32 },

    /// The target rank has not allocated its side of the window yet
    #[error("Window {window} not ready on rank {rank}")]
    WindowNotReady { window: u64, rank: u32 },

    /// An access ran past the end of the target window
    #[error("Access at offset {offset} + {len} exceeds window {window} of {size} bytes on rank {rank}")]
    RangeOutOfBounds {
        window: u64,
        rank: u32,
        offset: usize,
        len: usize,
        size: usize,
    },

    /// Accumulate data length is not a multiple of the element width
    #[error("Accumulate data of {len} bytes is not a multiple of element width {width}")]
    BadAccumLength { len: usize, width: usize },

    /// Unlock without a matching lock
    #[error("Unbalanced unlock of window {window} targeting rank {rank}")]
    UnbalancedUnlock { window: u64, rank: u32 },

    /// Request handle is unknown or already completed
    #[error("Unknown or already-completed request {request}")]
    UnknownRequest { request: u64 },

    /// The fabric has shut down underneath this endpoint
    #[error("Transport disconnected")]
    Disconnected,
}
