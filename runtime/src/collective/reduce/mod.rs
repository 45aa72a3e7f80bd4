pub mod manager;
pub mod ops;
pub mod scope;

pub use manager::{ReduceAction, Reducer};
pub use ops::{combine_of, CombineFn, CombineOps, OpError};
pub use scope::{ReduceScope, ReduceStamp};
