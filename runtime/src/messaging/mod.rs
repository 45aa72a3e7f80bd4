pub mod envelope;
pub mod kinds;

pub use envelope::{Dest, Envelope, ReduceBlock};
pub use kinds::{HandlerError, HandlerKind, HandlerKinds};
