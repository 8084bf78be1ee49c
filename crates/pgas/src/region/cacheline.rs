//! Cache-Line Primitives
//!
//! Line-granular flush, invalidate, and write-back plus the four fence
//! flavors. These are the visibility half of the shared-region contract:
//! after a local write, `flush` of the written bytes followed by
//! `fence(Consistency::Release)` makes the bytes observable to any reader on
//! the owning node that fences with `Acquire` before reading.
//!
//! On x86_64 the operations compile to `clflushopt`/`clflush` loops and
//! `sfence`/`lfence`/`mfence`. Other architectures fall back to the
//! strongest equivalent the standard library offers.

use crate::CACHE_LINE_SIZE;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{compiler_fence, Ordering};

#[cfg(not(target_arch = "x86_64"))]
use std::sync::atomic::fence as atomic_fence;

/// Memory consistency flavor for [`fence`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Consistency {
    Relaxed,
    Acquire,
    Release,
    SeqCst,
}

/// Flush the cache lines covering `[addr, addr + len)` and drain the store
/// buffer
pub fn flush(addr: usize, len: usize) {
    if len == 0 {
        return;
    }

    #[cfg(target_arch = "x86_64")]
    {
        flush_lines(addr, len);
        unsafe { std::arch::x86_64::_mm_sfence() };
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = addr;
        atomic_fence(Ordering::Release);
    }
}

/// Invalidate the cache lines covering `[addr, addr + len)`
///
/// Stronger than [`flush`]: also orders subsequent loads.
pub fn invalidate(addr: usize, len: usize) {
    if len == 0 {
        return;
    }

    #[cfg(target_arch = "x86_64")]
    {
        unsafe { clflush_lines(addr, addr + len) };
        unsafe { std::arch::x86_64::_mm_mfence() };
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = addr;
        atomic_fence(Ordering::SeqCst);
    }
}

/// Write dirty lines back without ordering guarantees beyond [`flush`]
pub fn writeback(addr: usize, len: usize) {
    flush(addr, len);
}

/// Issue a fence of the given flavor
pub fn fence(kind: Consistency) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        use std::arch::x86_64::{_mm_lfence, _mm_mfence, _mm_sfence};
        match kind {
            Consistency::Relaxed => compiler_fence(Ordering::SeqCst),
            Consistency::Acquire => _mm_lfence(),
            Consistency::Release => _mm_sfence(),
            Consistency::SeqCst => _mm_mfence(),
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    match kind {
        Consistency::Relaxed => compiler_fence(Ordering::SeqCst),
        Consistency::Acquire => atomic_fence(Ordering::Acquire),
        Consistency::Release => atomic_fence(Ordering::Release),
        Consistency::SeqCst => atomic_fence(Ordering::SeqCst),
    }
}

#[cfg(target_arch = "x86_64")]
fn flush_lines(addr: usize, len: usize) {
    let start = crate::util::align_down(addr, CACHE_LINE_SIZE);
    let end = addr + len;

    if clflushopt_available() {
        unsafe { clflushopt_lines(start, end) };
    } else {
        unsafe { clflush_lines(start, end) };
    }
}

/// Detect CLFLUSHOPT support via CPUID.(EAX=7,ECX=0):EBX.CLFLUSHOPT[bit 23]
///
/// Equivalent to `is_x86_feature_detected!("clflushopt")`, used directly
/// because this toolchain's stdarch does not expose that feature name to
/// the macro.
#[cfg(target_arch = "x86_64")]
fn clflushopt_available() -> bool {
    let regs = std::arch::x86_64::__cpuid_count(7, 0);
    (regs.ebx >> 23) & 1 == 1
}

/// Issues the `clflushopt` instruction via inline asm because this
/// toolchain's stdarch does not expose a stable `_mm_clflushopt` intrinsic.
#[cfg(target_arch = "x86_64")]
unsafe fn clflushopt_lines(start: usize, end: usize) {
    let mut line = start;
    while line < end {
        std::arch::asm!("clflushopt [{0}]", in(reg) line as *mut u8);
        line += CACHE_LINE_SIZE;
    }
}

#[cfg(target_arch = "x86_64")]
unsafe fn clflush_lines(start: usize, end: usize) {
    use std::arch::x86_64::_mm_clflush;
    let mut line = crate::util::align_down(start, CACHE_LINE_SIZE);
    while line < end {
        _mm_clflush(line as *const u8);
        line += CACHE_LINE_SIZE;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_preserves_contents() {
        let buf = vec![0x5Au8; 4 * CACHE_LINE_SIZE];
        flush(buf.as_ptr() as usize, buf.len());
        assert!(buf.iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn test_flush_unaligned_range() {
        let buf = vec![7u8; 3 * CACHE_LINE_SIZE];
        flush(buf.as_ptr() as usize + 13, CACHE_LINE_SIZE + 5);
        invalidate(buf.as_ptr() as usize + 13, CACHE_LINE_SIZE + 5);
        assert!(buf.iter().all(|&b| b == 7));
    }

    #[test]
    fn test_zero_length_is_noop() {
        flush(0, 0);
        invalidate(0, 0);
        writeback(0, 0);
    }

    #[test]
    fn test_all_fence_flavors() {
        fence(Consistency::Relaxed);
        fence(Consistency::Acquire);
        fence(Consistency::Release);
        fence(Consistency::SeqCst);
    }

    #[test]
    fn test_flush_then_read_roundtrip() {
        let mut buf = vec![0u8; 2 * CACHE_LINE_SIZE];
        buf[CACHE_LINE_SIZE] = 0xAB;
        flush(buf.as_ptr() as usize, buf.len());
        fence(Consistency::Release);
        fence(Consistency::Acquire);
        assert_eq!(buf[CACHE_LINE_SIZE], 0xAB);
    }
}
