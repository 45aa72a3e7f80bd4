pub mod cluster;

pub use cluster::Cluster;

/// Initializes logging once per test binary; respects `RUST_LOG`.
pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}
