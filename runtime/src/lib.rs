//! # Plenum
//! Core distributed runtime for overdecomposed applications: collections
//! of indexed elements and process-wide object groups exchange active
//! messages, participate in spanning-tree collectives, and migrate
//! between processes for load balancing, while epoch-based termination
//! detection tracks completion of distributed work.
//!
//! Every process constructs one [`Runtime`] over a
//! [`plenum_transport::Transport`] and drives it cooperatively; all
//! blocking primitives are nested scheduler loops.

#![deny(trivial_numeric_casts, unstable_features, unused_import_braces)]

pub mod balance;
pub mod collection;
pub mod collective;
pub mod config;
pub mod epoch;
pub mod location;
pub mod messaging;
pub mod objgroup;
pub mod pending;
pub mod phase;
pub mod rdma;
pub mod runtime;
pub mod scheduler;
pub mod termination;
pub mod timing;
pub mod types;
pub mod util;

pub use balance::manager::PhaseInfo;
pub use balance::stats::{CommEndpoint, CommKey, CommVolume, StatsCollector};
pub use balance::NodeLoadSummary;
pub use collection::{
    block_map, cyclic_map, CollectionManager, CollectionProxy, Element, ElementEvent, MakeCollective,
    MapperFn,
};
pub use collective::reduce::{
    combine_of, CombineFn, CombineOps, OpError, ReduceAction, ReduceScope, ReduceStamp, Reducer,
};
pub use collective::{BarrierManager, CollectiveScope, ScopeManager, SpanningTree};
pub use config::{DataDist, LbConfig, LbExtract, LbStrategy, RuntimeConfig};
pub use epoch::{generate_epoch, Epoch, EpochCategory, EpochError, EpochManip, EpochWindow};
pub use location::{LocationCache, LocationManager};
pub use messaging::{Dest, Envelope, HandlerError, HandlerKind, HandlerKinds, ReduceBlock};
pub use objgroup::{ObjGroupManager, ObjGroupProxy};
pub use pending::RequestHolder;
pub use phase::{PhaseHook, PhaseHookId, PhaseManager};
pub use rdma::{AccumElem, IndexDesc, IndexInfo, IndexedHandle, RdmaHandle, RdmaManager};
pub use runtime::Runtime;
pub use scheduler::{Scheduler, SchedulerEvent};
pub use termination::TerminationDetector;
pub use timing::{Stopwatch, TimeSec};
pub use types::{
    ClassId, EntityId, HandlerId, NodeId, OpId, Phase, SubPhase, Tag, NO_SUBPHASE, NO_TAG,
};
pub use util::{IntervalSet, RangedCounter};

pub use plenum_transport::{
    AccumKind, FenceAssert, LockLevel, MemoryEndpoint, MemoryFabric, Transport, TransportError,
};
pub use plenum_wire::{ByteReader, ByteWriter, FixedWire, Wire, WireErr};
