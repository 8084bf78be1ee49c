//! Tuning Profiles - Advisory Workload Configuration
//!
//! A [`Tuning`] record biases allocation affinity and transfer batching for
//! a known workload shape. Five named presets are exposed; a custom record
//! can be installed at any time. The record is advisory: runtime
//! correctness never depends on any tuning value.
//!
//! Preset intent:
//! - `Mcf` - pointer-chasing, latency sensitive: local placement, tiny
//!   transfers, aggressive prefetch.
//! - `Llama` - bandwidth-bound streaming: interleaved placement, large
//!   batched transfers, asynchronous preference.
//! - `Gromacs` - neighbor-list driven exchange: local placement with
//!   medium async transfers and neighbor-list prefetch.
//! - `Graph` - irregular frontier-driven access: local placement, small
//!   transfers, no prefetch.

use crate::region::cacheline::Consistency;
use serde::{Deserialize, Serialize};

/// Placement preference for new allocations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Affinity {
    /// Place on the calling node
    Local,
    /// Place on the next node in the ring
    Remote,
    /// Round-robin across all nodes
    Interleave,
    /// Declared for read-heavy data; placed locally, collaborators
    /// replicate explicitly
    Replicate,
}

/// Data distribution scheme used by collaborators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionScheme {
    Block,
    Cyclic,
    BlockCyclic,
    Hash,
    Custom,
}

/// Prefetch behavior hint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrefetchMode {
    None,
    Sequential,
    Strided,
    Aggressive,
    NeighborList,
}

/// Named tuning presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Profile {
    Default,
    Mcf,
    Llama,
    Gromacs,
    Graph,
}

impl Profile {
    pub const ALL: [Profile; 5] = [
        Profile::Default,
        Profile::Mcf,
        Profile::Llama,
        Profile::Gromacs,
        Profile::Graph,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Profile::Default => "DEFAULT",
            Profile::Mcf => "MCF",
            Profile::Llama => "LLAMA",
            Profile::Gromacs => "GROMACS",
            Profile::Graph => "GRAPH",
        }
    }
}

impl std::str::FromStr for Profile {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DEFAULT" => Ok(Profile::Default),
            "MCF" => Ok(Profile::Mcf),
            "LLAMA" => Ok(Profile::Llama),
            "GROMACS" => Ok(Profile::Gromacs),
            "GRAPH" => Ok(Profile::Graph),
            other => Err(format!("unknown tuning profile '{}'", other)),
        }
    }
}

/// Advisory configuration bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tuning {
    pub affinity: Affinity,
    pub partition_scheme: PartitionScheme,
    pub cache_line_align: bool,
    pub numa_bind: bool,
    /// Operations batched per round trip
    pub batch_size: usize,
    /// Preferred transfer granularity in bytes
    pub transfer_size: usize,
    pub prefetch_mode: PrefetchMode,
    pub consistency: Consistency,
    /// Worker threads; 0 means auto-detect
    pub num_threads: usize,
    pub bandwidth_priority: bool,
    pub async_transfer: bool,
}

impl Tuning {
    /// The frozen record for a named preset
    pub fn preset(profile: Profile) -> Tuning {
        match profile {
            Profile::Default => DEFAULT_TUNING,
            Profile::Mcf => MCF_TUNING,
            Profile::Llama => LLAMA_TUNING,
            Profile::Gromacs => GROMACS_TUNING,
            Profile::Graph => GRAPH_TUNING,
        }
    }

    /// Resolve `num_threads`, replacing 0 with the detected CPU count
    pub fn resolved_threads(&self) -> usize {
        if self.num_threads == 0 {
            num_cpus::get()
        } else {
            self.num_threads
        }
    }
}

impl Default for Tuning {
    fn default() -> Self {
        DEFAULT_TUNING
    }
}

const DEFAULT_TUNING: Tuning = Tuning {
    affinity: Affinity::Local,
    partition_scheme: PartitionScheme::Block,
    cache_line_align: true,
    numa_bind: false,
    batch_size: 64,
    transfer_size: 4096,
    prefetch_mode: PrefetchMode::Sequential,
    consistency: Consistency::Relaxed,
    num_threads: 0,
    bandwidth_priority: false,
    async_transfer: false,
};

const MCF_TUNING: Tuning = Tuning {
    affinity: Affinity::Local,
    partition_scheme: PartitionScheme::Block,
    cache_line_align: true,
    numa_bind: true,
    batch_size: 1,
    transfer_size: 64,
    prefetch_mode: PrefetchMode::Aggressive,
    consistency: Consistency::Relaxed,
    num_threads: 0,
    bandwidth_priority: false,
    async_transfer: false,
};

const LLAMA_TUNING: Tuning = Tuning {
    affinity: Affinity::Interleave,
    partition_scheme: PartitionScheme::Block,
    cache_line_align: true,
    numa_bind: false,
    batch_size: 4096,
    transfer_size: 1 << 20,
    prefetch_mode: PrefetchMode::Sequential,
    consistency: Consistency::Relaxed,
    num_threads: 0,
    bandwidth_priority: true,
    async_transfer: true,
};

const GROMACS_TUNING: Tuning = Tuning {
    affinity: Affinity::Local,
    partition_scheme: PartitionScheme::Block,
    cache_line_align: true,
    numa_bind: true,
    batch_size: 512,
    transfer_size: 8192,
    prefetch_mode: PrefetchMode::NeighborList,
    consistency: Consistency::Release,
    num_threads: 0,
    bandwidth_priority: false,
    async_transfer: true,
};

const GRAPH_TUNING: Tuning = Tuning {
    affinity: Affinity::Local,
    partition_scheme: PartitionScheme::Cyclic,
    cache_line_align: true,
    numa_bind: false,
    batch_size: 16,
    transfer_size: 512,
    prefetch_mode: PrefetchMode::None,
    consistency: Consistency::Relaxed,
    num_threads: 0,
    bandwidth_priority: false,
    async_transfer: false,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matches_preset() {
        assert_eq!(Tuning::default(), Tuning::preset(Profile::Default));
    }

    #[test]
    fn test_preset_distinctions() {
        let mcf = Tuning::preset(Profile::Mcf);
        assert_eq!(mcf.affinity, Affinity::Local);
        assert_eq!(mcf.transfer_size, 64);
        assert_eq!(mcf.prefetch_mode, PrefetchMode::Aggressive);

        let llama = Tuning::preset(Profile::Llama);
        assert_eq!(llama.affinity, Affinity::Interleave);
        assert_eq!(llama.transfer_size, 1 << 20);
        assert_eq!(llama.batch_size, 4096);
        assert!(llama.bandwidth_priority);
        assert!(llama.async_transfer);

        let gromacs = Tuning::preset(Profile::Gromacs);
        assert_eq!(gromacs.prefetch_mode, PrefetchMode::NeighborList);
        assert_eq!(gromacs.transfer_size, 8192);

        let graph = Tuning::preset(Profile::Graph);
        assert_eq!(graph.prefetch_mode, PrefetchMode::None);
        assert_eq!(graph.transfer_size, 512);
    }

    #[test]
    fn test_resolved_threads() {
        let tuning = Tuning::default();
        assert!(tuning.resolved_threads() >= 1);

        let fixed = Tuning {
            num_threads: 3,
            ..Tuning::default()
        };
        assert_eq!(fixed.resolved_threads(), 3);
    }

    #[test]
    fn test_profile_names() {
        let names: Vec<&str> = Profile::ALL.iter().map(|p| p.name()).collect();
        assert_eq!(names, ["DEFAULT", "MCF", "LLAMA", "GROMACS", "GRAPH"]);
    }

    #[test]
    fn test_profile_from_str() {
        for profile in Profile::ALL {
            assert_eq!(profile.name().parse::<Profile>().unwrap(), profile);
            assert_eq!(
                profile.name().to_lowercase().parse::<Profile>().unwrap(),
                profile
            );
        }
        assert!("turbo".parse::<Profile>().is_err());
    }
}
