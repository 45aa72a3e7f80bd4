pub mod barrier;
pub mod reduce;
pub mod scope;
pub mod tree;

pub use barrier::BarrierManager;
pub use scope::{CollectiveScope, ScopeManager};
pub use tree::SpanningTree;
