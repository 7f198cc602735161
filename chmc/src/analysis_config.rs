//! Flags and knobs that impact the cache analysis.
//!
//! Library entry points take an [`AnalysisConfig`] explicitly. The binary builds one from the
//! command line and installs it into the global [`CONFIG`](static@CONFIG) once, before analysis
//! starts.

use crate::resolver::DEFAULT_BACKTRACK_NODE_BUDGET;

/// Default base address assumed for stack-relative accesses
pub const DEFAULT_STACK_BASE_ADDRESS: u64 = 0x7fff_f000;

/// The analysis configuration store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnalysisConfig {
    /// Maximum number of predecessor nodes visited while resolving the address of a single
    /// load/store. Exceeding it degrades the access to the unknown address.
    pub backtrack_node_budget: usize,
    /// Address that stack-relative accesses are offset from. Only relative placement matters, so
    /// any value far from the data segments works.
    pub stack_base_address: u64,
    /// Register-indexed accesses (`ldr x0, [x1, x2]`) may touch any line of the segment they
    /// resolve into.
    pub treat_indexed_accesses_as_ranges: bool,
    /// Every access that resolves into a segment is treated as touching the whole segment. Very
    /// pessimistic; useful to bound the damage of a wrong base resolution.
    pub treat_all_segment_accesses_as_ranges: bool,
    /// Use the exact resolved address of a non-range access, rather than approximating it by the
    /// lower bound of the segment it falls into.
    pub use_exact_segment_addresses: bool,
    /// Procedures that nothing calls start from an empty cache. Otherwise every procedure starts
    /// from an unknown cache.
    pub assume_cold_cache_at_roots: bool,
    /// Calls to procedures with no computed footprint (external, or closing a recursion cycle)
    /// clobber the whole cache. If disabled, such calls are assumed to touch nothing.
    pub unknown_callees_clobber_cache: bool,
    /// Run the persistence analysis that discovers first-miss accesses
    pub enable_persistence_analysis: bool,
}

impl AnalysisConfig {
    /// Install `config` as the global configuration. Should only be called once, and should only
    /// be called from `main`.
    pub fn initialize(config: AnalysisConfig) {
        let mut init = INTERNAL_CONFIG_INITIALIZER
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        assert!(init.is_none(), "Performed double initialization");
        *init = Some(config);
        drop(init);
        lazy_static::initialize(&CONFIG);
    }

    /// Internal method: sets up initialization
    fn from_initialized() -> Self {
        INTERNAL_CONFIG_INITIALIZER
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .unwrap_or_default()
    }
}

lazy_static::lazy_static! {
    /// Internal initialization detail.
    static ref INTERNAL_CONFIG_INITIALIZER: std::sync::Mutex<Option<AnalysisConfig>> =
        std::sync::Mutex::new(None);

    /// The global configuration store
    pub static ref CONFIG: AnalysisConfig = AnalysisConfig::from_initialized();
}

#[derive(clap::ArgEnum, Clone, Debug)]
/// Analysis configuration parameters
pub enum CommandLineAnalysisConfig {
    DisableRangeForIndexedAccesses,
    TreatAllSegmentAccessesAsRanges,
    UseExactSegmentAddresses,
    DisableColdCacheAtRoots,
    IgnoreUnknownCallees,
    DisablePersistenceAnalysis,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        AnalysisConfig {
            backtrack_node_budget: DEFAULT_BACKTRACK_NODE_BUDGET,
            stack_base_address: DEFAULT_STACK_BASE_ADDRESS,
            treat_indexed_accesses_as_ranges: true,
            treat_all_segment_accesses_as_ranges: false,
            use_exact_segment_addresses: false,
            assume_cold_cache_at_roots: true,
            unknown_callees_clobber_cache: true,
            enable_persistence_analysis: true,
        }
    }
}

impl From<Vec<CommandLineAnalysisConfig>> for AnalysisConfig {
    fn from(v: Vec<CommandLineAnalysisConfig>) -> Self {
        use CommandLineAnalysisConfig::*;
        let mut r = AnalysisConfig::default();
        for v in v {
            match v {
                DisableRangeForIndexedAccesses => {
                    r.treat_indexed_accesses_as_ranges = false;
                }
                TreatAllSegmentAccessesAsRanges => {
                    r.treat_all_segment_accesses_as_ranges = true;
                }
                UseExactSegmentAddresses => {
                    r.use_exact_segment_addresses = true;
                }
                DisableColdCacheAtRoots => {
                    r.assume_cold_cache_at_roots = false;
                }
                IgnoreUnknownCallees => {
                    // XXX: unsound whenever such a callee does touch memory
                    r.unknown_callees_clobber_cache = false;
                }
                DisablePersistenceAnalysis => {
                    r.enable_persistence_analysis = false;
                }
            }
        }
        r
    }
}
