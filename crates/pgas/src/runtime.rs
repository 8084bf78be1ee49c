//! Runtime - The Public PGAS Surface
//!
//! A [`Runtime`] is one node's handle on the ensemble: it owns the shared
//! region, the allocator over it, the segment table, and the peer socket
//! pairs. All collaborator-facing operations live here.
//!
//! Operation routing:
//!
//! ```text
//! alloc/get/put/atomic
//!        |
//!   local pointer? ----yes----> region + allocator + cache-line flush
//!        |
//!        no
//!        |
//!   frame -> send_recv on the initiated socket -> peer handler -> reply
//! ```
//!
//! Statistics are updated at every edge. The interleave counter, the tuning
//! slot, and the counters are all state of this handle; two runtimes in one
//! process do not share anything.

use crate::allocator::{AllocatorStats, RegionAllocator, DEFAULT_ALIGNMENT};
use crate::comm::wire::{Frame, MsgType};
use crate::comm::CommEngine;
use crate::config::ClusterConfig;
use crate::error::{PgasError, Result};
use crate::ptr::GlobalPtr;
use crate::region::cacheline::{self, Consistency};
use crate::region::SharedRegion;
use crate::segment::SegmentTable;
use crate::stats::{RuntimeStats, StatsSnapshot};
use crate::tuning::{Affinity, Profile, Tuning};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Local state shared with the handler tasks
#[derive(Debug)]
pub(crate) struct NodeCore {
    pub region: Arc<SharedRegion>,
    pub allocator: Arc<RegionAllocator>,
    pub segments: SegmentTable,
    pub local_id: u16,
}

/// Everything a collaborator sees about one ensemble member
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub node_id: u16,
    pub hostname: String,
    pub port: u16,
    pub is_local: bool,
    pub is_active: bool,
    pub region_base: u64,
    pub region_size: u64,
}

/// One node's handle on the partitioned global address space
#[derive(Debug)]
pub struct Runtime {
    config: ClusterConfig,
    core: Arc<NodeCore>,
    comm: Arc<CommEngine>,
    stats: Arc<RuntimeStats>,
    tuning: RwLock<Tuning>,
    interleave: AtomicUsize,
    finalized: AtomicBool,
}

impl Runtime {
    /// Bring up this node: region, allocator, segments, then peers
    pub fn new(config: ClusterConfig) -> Result<Runtime> {
        config.validate()?;

        let local = config.local_node();
        let region = Arc::new(SharedRegion::open(local.region_size as usize)?);
        let allocator = Arc::new(RegionAllocator::new(Arc::clone(&region))?);
        let segments = SegmentTable::new(&config, &region);

        let core = Arc::new(NodeCore {
            region,
            allocator,
            segments,
            local_id: config.local_node_id,
        });

        let comm = CommEngine::start(&config, Arc::clone(&core))?;

        log::info!(
            "PGAS initialized: node {} of {}",
            config.local_node_id,
            config.num_nodes
        );

        Ok(Runtime {
            config,
            core,
            comm,
            stats: Arc::new(RuntimeStats::new()),
            tuning: RwLock::new(Tuning::default()),
            interleave: AtomicUsize::new(0),
            finalized: AtomicBool::new(false),
        })
    }

    /// This node's id
    pub fn my_node(&self) -> u16 {
        self.config.local_node_id
    }

    /// Ensemble size
    pub fn num_nodes(&self) -> u16 {
        self.config.num_nodes
    }

    /// Static record plus liveness for one member
    pub fn node_info(&self, node_id: u16) -> Option<NodeInfo> {
        let node = self.config.nodes.get(node_id as usize)?;
        let is_local = node_id == self.config.local_node_id;
        Some(NodeInfo {
            node_id,
            hostname: node.hostname.clone(),
            port: node.port,
            is_local,
            is_active: is_local || self.comm.is_active(node_id),
            region_base: if is_local {
                self.core.region.base() as u64
            } else {
                node.region_base
            },
            region_size: node.region_size,
        })
    }

    /// The local shared region
    pub fn region(&self) -> &SharedRegion {
        &self.core.region
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Allocate with an affinity hint
    ///
    /// LOCAL places on this node, REMOTE on the next node in the ring,
    /// INTERLEAVE round-robins across the ensemble. REPLICATE is routed as
    /// LOCAL here; collaborators replicate explicitly.
    pub fn alloc(&self, size: usize, affinity: Affinity) -> Result<GlobalPtr> {
        let target = match affinity {
            Affinity::Local | Affinity::Replicate => self.config.local_node_id,
            Affinity::Remote => (self.config.local_node_id + 1) % self.config.num_nodes,
            Affinity::Interleave => {
                (self.interleave.fetch_add(1, Ordering::Relaxed) % self.config.num_nodes as usize)
                    as u16
            }
        };
        self.alloc_on_node(size, target)
    }

    /// Allocate on a specific node
    pub fn alloc_on_node(&self, size: usize, node_id: u16) -> Result<GlobalPtr> {
        if node_id >= self.config.num_nodes {
            return Err(PgasError::InvalidArgument(format!(
                "node {} out of range for {} nodes",
                node_id, self.config.num_nodes
            )));
        }

        if node_id == self.config.local_node_id {
            let offset = self.core.allocator.alloc(size, DEFAULT_ALIGNMENT)?;
            return Ok(GlobalPtr::new(node_id, offset));
        }

        let mut request = self.request(MsgType::Alloc, node_id);
        request.size = size as u64;

        let response = self.exchange(node_id, &request)?;
        if response.msg_type != MsgType::AllocResp {
            self.stats.record_comm_failure();
            return Err(self.protocol_error(node_id, MsgType::AllocResp, response.msg_type));
        }
        if response.ptr.is_null() {
            return Err(PgasError::OutOfMemory {
                requested: size,
                available: 0,
            });
        }
        if response.ptr.node_id != node_id {
            return Err(PgasError::InvalidRemoteMetadata(format!(
                "node {} answered an allocation with pointer {}",
                node_id, response.ptr
            )));
        }
        Ok(response.ptr)
    }

    /// Release an allocation anywhere in the ensemble
    ///
    /// Remote frees are fire-and-forget; freeing the null pointer is a
    /// no-op.
    pub fn free(&self, ptr: GlobalPtr) -> Result<()> {
        if ptr.is_null() {
            return Ok(());
        }

        if self.is_local(ptr) {
            self.core.segments.translate(ptr)?;
            return self.core.allocator.free(ptr.offset);
        }

        let mut request = self.request(MsgType::Free, ptr.node_id);
        request.ptr = ptr;
        self.comm.send(ptr.node_id, &request).inspect_err(|_| {
            self.stats.record_comm_failure();
        })
    }

    // ------------------------------------------------------------------
    // Data movement
    // ------------------------------------------------------------------

    /// Check whether a pointer is owned by this node
    pub fn is_local(&self, ptr: GlobalPtr) -> bool {
        self.core.segments.is_local(ptr)
    }

    /// Host address of a local pointer
    pub fn local_ptr(&self, ptr: GlobalPtr) -> Result<*mut u8> {
        Ok(self.core.segments.translate(ptr)? as *mut u8)
    }

    /// Read `dest.len()` bytes from a global pointer
    ///
    /// On a communication failure the destination is zero-filled and the
    /// error is returned; there is no retry.
    pub fn get(&self, dest: &mut [u8], src: GlobalPtr) -> Result<()> {
        if self.is_local(src) {
            let addr = self.core.segments.translate_range(src, dest.len())?;
            unsafe {
                std::ptr::copy_nonoverlapping(addr as *const u8, dest.as_mut_ptr(), dest.len());
            }
            self.stats.record_local_read();
            return Ok(());
        }

        let mut request = self.request(MsgType::Get, src.node_id);
        request.ptr = src;
        request.size = dest.len() as u64;

        let start = Instant::now();
        let response = match self.exchange(src.node_id, &request) {
            Ok(response) => response,
            Err(e) => {
                dest.fill(0);
                return Err(e);
            }
        };

        if response.msg_type != MsgType::GetResp || response.payload.len() != dest.len() {
            dest.fill(0);
            self.stats.record_comm_failure();
            return Err(self.protocol_error(src.node_id, MsgType::GetResp, response.msg_type));
        }

        dest.copy_from_slice(&response.payload);
        self.stats
            .record_remote_read(dest.len() as u64, start.elapsed());
        Ok(())
    }

    /// Write `src` to a global pointer
    pub fn put(&self, dest: GlobalPtr, src: &[u8]) -> Result<()> {
        if self.is_local(dest) {
            let addr = self.core.segments.translate_range(dest, src.len())?;
            unsafe {
                std::ptr::copy_nonoverlapping(src.as_ptr(), addr as *mut u8, src.len());
            }
            cacheline::flush(addr, src.len());
            self.stats.record_local_write();
            return Ok(());
        }

        let mut request = self.request(MsgType::Put, dest.node_id);
        request.ptr = dest;
        request.size = src.len() as u64;
        request.payload = src.to_vec();

        let start = Instant::now();
        let response = self.exchange(dest.node_id, &request)?;
        if response.msg_type != MsgType::PutResp {
            self.stats.record_comm_failure();
            return Err(self.protocol_error(dest.node_id, MsgType::PutResp, response.msg_type));
        }

        self.stats
            .record_remote_write(src.len() as u64, start.elapsed());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Atomics
    // ------------------------------------------------------------------

    /// Atomic 64-bit fetch-add, returning the prior value
    ///
    /// Remote atomics are linearizable per target address: the owner's
    /// handler task serializes them.
    pub fn atomic_fetch_add(&self, ptr: GlobalPtr, value: u64) -> Result<u64> {
        if self.is_local(ptr) {
            self.core.segments.translate_range(ptr, 8)?;
            let word = self.core.region.atomic_u64(ptr.offset)?;
            self.stats.record_atomic();
            return Ok(word.fetch_add(value, Ordering::SeqCst));
        }

        let mut request = self.request(MsgType::AtomicFaa, ptr.node_id);
        request.ptr = ptr;
        request.value = value;

        let start = Instant::now();
        let response = self.exchange(ptr.node_id, &request)?;
        if response.msg_type != MsgType::AtomicResp {
            self.stats.record_comm_failure();
            return Err(self.protocol_error(ptr.node_id, MsgType::AtomicResp, response.msg_type));
        }

        self.stats.record_remote_atomic(start.elapsed());
        Ok(response.value)
    }

    /// Atomic 64-bit compare-and-swap, returning the observed prior value
    pub fn atomic_cas(&self, ptr: GlobalPtr, expected: u64, desired: u64) -> Result<u64> {
        if self.is_local(ptr) {
            self.core.segments.translate_range(ptr, 8)?;
            let word = self.core.region.atomic_u64(ptr.offset)?;
            self.stats.record_atomic();
            let prior = match word.compare_exchange(
                expected,
                desired,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(prior) => prior,
                Err(prior) => prior,
            };
            return Ok(prior);
        }

        let mut request = self.request(MsgType::AtomicCas, ptr.node_id);
        request.ptr = ptr;
        request.value = expected;
        // The desired word travels in the size field
        request.size = desired;

        let start = Instant::now();
        let response = self.exchange(ptr.node_id, &request)?;
        if response.msg_type != MsgType::AtomicResp {
            self.stats.record_comm_failure();
            return Err(self.protocol_error(ptr.node_id, MsgType::AtomicResp, response.msg_type));
        }

        self.stats.record_remote_atomic(start.elapsed());
        Ok(response.value)
    }

    // ------------------------------------------------------------------
    // Synchronization
    // ------------------------------------------------------------------

    /// Issue a memory fence of the given flavor
    pub fn fence(&self, kind: Consistency) {
        cacheline::fence(kind);
    }

    /// Ensemble-wide barrier
    ///
    /// Announce to every active peer, collect an acknowledgment from each,
    /// then send the release round. Completion requires both directions of
    /// messaging on every pair; every operation completed before any node
    /// entered the barrier is observable after any node exits it.
    ///
    /// Must not race with remote operations issued by other threads of this
    /// process; call it at a quiescent point.
    pub fn barrier(&self) -> Result<()> {
        let peers: Vec<u16> = (0..self.config.num_nodes)
            .filter(|&n| n != self.config.local_node_id && self.comm.is_active(n))
            .collect();

        for &peer in &peers {
            let request = self.request(MsgType::Barrier, peer);
            self.comm.send(peer, &request).inspect_err(|_| {
                self.stats.record_comm_failure();
            })?;
        }

        for &peer in &peers {
            let response = self.comm.recv(peer).inspect_err(|_| {
                self.stats.record_comm_failure();
            })?;
            if response.msg_type != MsgType::BarrierResp {
                self.stats.record_comm_failure();
                return Err(self.protocol_error(peer, MsgType::BarrierResp, response.msg_type));
            }
        }

        for &peer in &peers {
            let release = self.request(MsgType::BarrierResp, peer);
            self.comm.send(peer, &release).inspect_err(|_| {
                self.stats.record_comm_failure();
            })?;
        }

        self.stats.record_barrier();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Statistics and tuning
    // ------------------------------------------------------------------

    /// Snapshot the operation counters
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Zero the operation counters
    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    /// Allocator counters for the local region
    pub fn allocator_stats(&self) -> AllocatorStats {
        self.core.allocator.stats()
    }

    /// Install a named preset into the tuning slot
    pub fn load_profile(&self, profile: Profile) {
        *self.tuning.write() = Tuning::preset(profile);
        log::info!("tuning profile {} loaded", profile.name());
    }

    /// Install a custom tuning record
    pub fn set_tuning(&self, tuning: Tuning) {
        *self.tuning.write() = tuning;
    }

    /// The currently installed tuning record
    pub fn tuning(&self) -> Tuning {
        *self.tuning.read()
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Close peer sockets and stop service tasks
    ///
    /// Idempotent; also runs on drop. Outstanding calls on other threads
    /// are aborted by the closing sockets.
    pub fn finalize(&self) {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return;
        }
        self.comm.shutdown();
        log::info!("PGAS finalized: node {}", self.config.local_node_id);
    }

    // ------------------------------------------------------------------

    fn request(&self, msg_type: MsgType, dst: u16) -> Frame {
        Frame::new(
            msg_type,
            self.config.local_node_id,
            dst,
            self.comm.next_request_id(),
        )
    }

    fn exchange(&self, node_id: u16, request: &Frame) -> Result<Frame> {
        self.comm.send_recv(node_id, request).inspect_err(|_| {
            self.stats.record_comm_failure();
        })
    }

    fn protocol_error(&self, node_id: u16, expected: MsgType, got: MsgType) -> PgasError {
        PgasError::Communication {
            node_id,
            reason: format!("expected {:?}, got {:?}", expected, got),
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.finalize();
    }
}
