//! # PGAS - Partitioned Global Address Space Runtime
//!
//! A runtime for a small cluster of processes that share memory through
//! CXL-attached or emulated memory-mapped regions. Each participating
//! process (a "node") contributes one contiguous byte region; together the
//! regions form one logical address space carved into per-node partitions.
//! Local partition accesses bypass the network entirely; remote reads,
//! writes, and atomic updates travel over a small request/response protocol
//! on TCP.
//!
//! ## Quick Start
//!
//! ```no_run
//! use pgas::{Affinity, Runtime, ClusterConfig};
//!
//! fn main() -> pgas::Result<()> {
//!     let config = ClusterConfig::from_file("cluster.conf")?;
//!     let runtime = Runtime::new(config)?;
//!
//!     // Allocate 4 KiB on this node and write to it
//!     let ptr = runtime.alloc(4096, Affinity::Local)?;
//!     runtime.put(ptr, &[0xAA; 4096])?;
//!
//!     // Any node holding `ptr` can read the same bytes
//!     let mut buf = vec![0u8; 4096];
//!     runtime.get(&mut buf, ptr)?;
//!
//!     runtime.barrier()?;
//!     runtime.free(ptr)?;
//!     runtime.finalize();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                     Runtime (public API)                   │
//! │   alloc/free   get/put   atomics   fence/barrier   stats   │
//! └──────┬──────────────┬──────────────────────┬───────────────┘
//!        │ local        │ remote               │
//! ┌──────▼──────┐ ┌─────▼──────────┐  ┌────────▼────────┐
//! │  Allocator  │ │ Message Engine │  │ Tuning Profiles │
//! │ (first-fit) │ │   send_recv    │  └─────────────────┘
//! └──────┬──────┘ └─────┬──────────┘
//! ┌──────▼──────┐ ┌─────▼──────────────────────────────┐
//! │Shared Region│ │ Connection Manager                  │
//! │ dax / mmap  │ │ listener + peer socket pairs        │
//! └─────────────┘ │ one handler task per accepted peer  │
//!                 └─────────────────────────────────────┘
//! ```
//!
//! Every ordered node pair is joined by exactly two TCP connections, one
//! initiated in each direction. A node sends requests and receives the
//! matching responses on the socket it initiated; the peer's handler task
//! serves that same socket. Atomic updates of one 64-bit word are
//! linearizable per target address; barriers are the only ensemble-wide
//! ordering point.
//!
//! ## Pointers
//!
//! A [`GlobalPtr`] is a plain 16-byte value `{node, segment, flags,
//! offset}`. It can be stored, copied, and shipped to any peer; only the
//! owning node can translate it to a host address (via
//! [`Runtime::local_ptr`]).
//!
//! ## Modules
//!
//! - [`config`]: ensemble configuration file parsing
//! - [`region`]: shared-region acquisition and cache-line primitives
//! - [`allocator`]: first-fit block allocator over the region
//! - [`segment`]: per-node segments and address translation
//! - [`comm`]: wire format, connection bring-up, remote-op handlers
//! - [`runtime`]: the collaborator-facing surface
//! - [`tuning`]: advisory workload profiles
//! - [`partition`]: element-to-node placement helpers
//! - [`stats`]: per-runtime operation counters
//! - [`error`]: error taxonomy

pub mod allocator;
pub mod comm;
pub mod config;
pub mod error;
pub mod partition;
pub mod ptr;
pub mod region;
pub mod runtime;
pub mod segment;
pub mod stats;
pub mod tuning;
pub mod util;

pub use config::ClusterConfig;
pub use error::{PgasError, Result};
pub use ptr::GlobalPtr;
pub use region::cacheline::Consistency;
pub use runtime::{NodeInfo, Runtime};
pub use stats::StatsSnapshot;
pub use tuning::{Affinity, PartitionScheme, PrefetchMode, Profile, Tuning};

/// Maximum ensemble size
pub const MAX_NODES: usize = 16;

/// Assumed page size for region alignment fallbacks
pub const PAGE_SIZE: usize = 4096;

/// Cache line size; allocation sizes round up to this
pub const CACHE_LINE_SIZE: usize = 64;

/// Region size used when the configuration does not say otherwise
pub const DEFAULT_REGION_SIZE: usize = 1 << 30;

/// Device-reported region sizes are capped here
pub const REGION_SIZE_CAP: usize = 4 << 30;

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Bring up a runtime from a configuration file
///
/// Convenience wrapper: parse, validate, construct.
pub fn init<P: AsRef<std::path::Path>>(config_path: P) -> Result<Runtime> {
    let config = ClusterConfig::from_file(config_path)?;
    Runtime::new(config)
}

/// Bring up a runtime from an already-built configuration
pub fn init_with_config(config: ClusterConfig) -> Result<Runtime> {
    Runtime::new(config)
}
