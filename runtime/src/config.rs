//! Runtime configuration. The runtime takes an already-parsed
//! [`RuntimeConfig`]; argument parsing is an external collaborator's job.

/// Which load balancer runs at phase boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LbStrategy {
    #[default]
    None,
    Greedy,
    Hierarchical,
}

/// Bin-peel order when extracting over-threshold load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LbExtract {
    /// Peel lightest elements first
    #[default]
    LoadOverLessThan,
    /// Peel heaviest elements first
    LoadOverGreaterThan,
    /// Take one element from each bin per sweep
    LoadOverOneEach,
}

/// How a centralized plan reaches its destinations. Scatter and
/// point-to-point are accepted for compatibility but normalized to
/// broadcast: every rank receives the full plan and filters its own part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataDist {
    #[default]
    Broadcast,
    Scatter,
    Pt2Pt,
}

/// Load-balancing knobs.
#[derive(Debug, Clone)]
pub struct LbConfig {
    pub strategy: LbStrategy,
    /// Load-threshold floor, as a fraction of the average load
    pub min_threshold: f64,
    /// Load-threshold ceiling, as a fraction of the average load
    pub max_threshold: f64,
    /// Derive the threshold from the measured imbalance
    pub auto_threshold: bool,
    /// Imbalance below which a balancer run is skipped outright
    pub tolerance: f64,
    pub extract: LbExtract,
    pub data_dist: DataDist,
}

impl Default for LbConfig {
    fn default() -> Self {
        Self {
            strategy: LbStrategy::None,
            min_threshold: 0.8,
            max_threshold: 1.004,
            auto_threshold: true,
            tolerance: 0.05,
            extract: LbExtract::LoadOverLessThan,
            data_dist: DataDist::Broadcast,
        }
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Maximum nested scheduler depth
    pub num_collective_workers: usize,
    /// Fan-out of the default spanning tree
    pub tree_fanout: u32,
    /// Payload size in bytes below which route-via-home is preferred
    pub eager_threshold_bytes: usize,
    /// Max LRU entries per entity class in the location cache
    pub loc_cache_size: usize,
    /// Fraction of terminated sequences per epoch window before a garbage
    /// collection is attempted
    pub epoch_gc_watermark: f64,
    /// Forwarding hops before a routed message is declared lost
    pub max_forward_hops: u32,
    pub lb: LbConfig,
    /// Per-phase statistics records are emitted when set
    pub stats_file: Option<std::path::PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            num_collective_workers: 8,
            tree_fanout: 2,
            eager_threshold_bytes: 4096,
            loc_cache_size: 4096,
            epoch_gc_watermark: 0.10,
            max_forward_hops: 8,
            lb: LbConfig::default(),
            stats_file: None,
        }
    }
}
