//! End-to-end test support for the plenum runtime: a thread-per-rank
//! cluster harness over the in-memory fabric.

pub mod helpers;

pub use helpers::*;
