//! Shared-Region Provider
//!
//! Each process contributes one contiguous byte region to the ensemble. The
//! provider acquires it in decreasing order of fidelity:
//!
//! 1. A device-DAX character device (`/dev/daxX.Y`), memory-mapped shared at
//!    offset 0. Size and NUMA binding come from sysfs.
//! 2. A memory device on the CXL bus; its reported size feeds the anonymous
//!    fallback below.
//! 3. An anonymous huge-page mapping of the configured size.
//! 4. A plain anonymous mapping.
//!
//! Device-reported sizes are capped at 4 GiB. The region's base address is
//! private to this process; only offsets from the base are meaningful to
//! peers. Cross-process visibility of the backing bytes is produced by the
//! cache-line primitives in [`cacheline`] together with the RPC
//! acknowledgments of the message engine.

pub mod cacheline;
pub mod discovery;

use crate::error::{PgasError, Result};
use crate::REGION_SIZE_CAP;
use discovery::DaxDevice;
use memmap2::{MmapMut, MmapOptions};
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;

/// How the region is backed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionBacking {
    /// Memory-mapped device-DAX character device
    DevDax(PathBuf),
    /// Anonymous mapping with huge pages
    HugePages,
    /// Plain anonymous mapping
    Anonymous,
}

/// The process's shared byte region
///
/// Mutated concurrently by local threads and by handler tasks serving remote
/// peers. Plain byte copies are unsynchronized by design; 64-bit aligned
/// words accessed through [`SharedRegion::atomic_u64`] are atomic.
pub struct SharedRegion {
    /// Keeps the mapping alive; all access goes through `base`
    _map: MmapMut,
    base: usize,
    size: usize,
    numa_node: i32,
    backing: RegionBacking,
}

impl SharedRegion {
    /// Acquire a region of at least `requested_size` bytes
    pub fn open(requested_size: usize) -> Result<Self> {
        if requested_size == 0 {
            return Err(PgasError::RegionOpen("requested size is zero".to_string()));
        }

        for device in discovery::enumerate_dax() {
            match Self::map_dax(&device) {
                Ok(region) => {
                    log::info!(
                        "region: mapped {} ({} MB, numa {})",
                        device.path.display(),
                        region.size / (1024 * 1024),
                        region.numa_node
                    );
                    return Ok(region);
                }
                Err(e) => {
                    log::warn!("region: {} unusable: {}", device.path.display(), e);
                }
            }
        }

        let mut size = requested_size;
        if let Some(bus_size) = discovery::cxl_bus_size() {
            log::info!("region: cxl bus reports {} bytes", bus_size);
            size = bus_size as usize;
        }
        if size > REGION_SIZE_CAP {
            log::info!(
                "region: capping {} bytes to {} bytes",
                size,
                REGION_SIZE_CAP
            );
            size = REGION_SIZE_CAP;
        }
        let size = align_to_page(size);

        match Self::map_anonymous(size, true) {
            Ok(region) => {
                log::info!("region: huge-page mapping of {} MB", size / (1024 * 1024));
                return Ok(region);
            }
            Err(e) => {
                log::warn!("region: huge pages unavailable ({}), falling back", e);
            }
        }

        let region = Self::map_anonymous(size, false)?;
        log::info!("region: anonymous mapping of {} MB", size / (1024 * 1024));
        Ok(region)
    }

    fn map_dax(device: &DaxDevice) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&device.path)
            .map_err(|e| PgasError::RegionOpen(format!("open failed: {}", e)))?;

        let size = align_to_page((device.size.min(REGION_SIZE_CAP as u64)) as usize);

        // Shared mapping at offset 0: peers mapping the same device observe
        // the same bytes at the same offsets, at different virtual addresses.
        let mut map = unsafe {
            MmapOptions::new()
                .len(size)
                .map_mut(&file)
                .map_err(|e| PgasError::RegionOpen(format!("mmap failed: {}", e)))?
        };

        let base = map.as_mut_ptr() as usize;
        Ok(Self {
            _map: map,
            base,
            size,
            numa_node: device.numa_node,
            backing: RegionBacking::DevDax(device.path.clone()),
        })
    }

    fn map_anonymous(size: usize, huge: bool) -> Result<Self> {
        let mut options = MmapOptions::new();
        options.len(size);

        #[cfg(target_os = "linux")]
        if huge {
            options.huge(None);
        }
        #[cfg(not(target_os = "linux"))]
        if huge {
            return Err(PgasError::RegionOpen(
                "huge pages not supported on this platform".to_string(),
            ));
        }

        let mut map = options
            .map_anon()
            .map_err(|e| PgasError::RegionOpen(format!("anonymous mmap failed: {}", e)))?;

        let base = map.as_mut_ptr() as usize;
        if !huge {
            advise_transparent_huge_pages(base, size);
        }
        Ok(Self {
            _map: map,
            base,
            size,
            numa_node: 0,
            backing: if huge {
                RegionBacking::HugePages
            } else {
                RegionBacking::Anonymous
            },
        })
    }

    /// Base address of the region in this process
    pub fn base(&self) -> usize {
        self.base
    }

    /// Region size in bytes
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// NUMA node of the backing memory, 0 when unknown
    pub fn numa_node(&self) -> i32 {
        self.numa_node
    }

    pub fn backing(&self) -> &RegionBacking {
        &self.backing
    }

    /// Check that `[offset, offset + len)` lies inside the region
    pub fn contains_range(&self, offset: u64, len: usize) -> bool {
        match offset.checked_add(len as u64) {
            Some(end) => end <= self.size as u64,
            None => false,
        }
    }

    /// Host address of `offset`, without a bounds check
    pub(crate) fn host_addr(&self, offset: u64) -> usize {
        self.base + offset as usize
    }

    /// Copy bytes out of the region
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if !self.contains_range(offset, buf.len()) {
            return Err(PgasError::InvalidArgument(format!(
                "read out of bounds: offset={}, len={}, size={}",
                offset,
                buf.len(),
                self.size
            )));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.host_addr(offset) as *const u8,
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        Ok(())
    }

    /// Copy bytes into the region
    ///
    /// Visibility to other processes additionally requires
    /// [`cacheline::flush`] of the written range.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        if !self.contains_range(offset, data.len()) {
            return Err(PgasError::InvalidArgument(format!(
                "write out of bounds: offset={}, len={}, size={}",
                offset,
                data.len(),
                self.size
            )));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.host_addr(offset) as *mut u8,
                data.len(),
            );
        }
        Ok(())
    }

    /// View the 64-bit word at `offset` as an atomic
    ///
    /// The offset must be 8-byte aligned and in bounds.
    pub fn atomic_u64(&self, offset: u64) -> Result<&AtomicU64> {
        if !self.contains_range(offset, 8) {
            return Err(PgasError::InvalidArgument(format!(
                "atomic access out of bounds: offset={}, size={}",
                offset, self.size
            )));
        }
        if offset % 8 != 0 {
            return Err(PgasError::InvalidArgument(format!(
                "atomic access requires 8-byte alignment, got offset {}",
                offset
            )));
        }
        // In bounds, aligned, and the mapping lives as long as &self.
        Ok(unsafe { AtomicU64::from_ptr(self.host_addr(offset) as *mut u64) })
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("base", &format_args!("{:#x}", self.base))
            .field("size", &self.size)
            .field("numa_node", &self.numa_node)
            .field("backing", &self.backing)
            .finish()
    }
}

fn align_to_page(size: usize) -> usize {
    crate::util::align_up(size, page_size::get())
}

/// Ask the kernel to back a regular mapping with transparent huge pages
#[cfg(target_os = "linux")]
fn advise_transparent_huge_pages(base: usize, size: usize) {
    let ret = unsafe { libc::madvise(base as *mut libc::c_void, size, libc::MADV_HUGEPAGE) };
    if ret != 0 {
        log::debug!(
            "madvise(MADV_HUGEPAGE) failed: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn advise_transparent_huge_pages(_base: usize, _size: usize) {}
