use crate::consts::{ALIGN, GC_PREFIX_BYTES, HDR_RESERVED};
use crate::errors::{Result, SnapError};
use crate::utils::checked_align_up;
use tracing::trace;

/// Monotonic bump allocator over archive offsets. Nothing is ever freed.
#[derive(Debug, Clone)]
pub struct BumpAllocator {
    used: u64,
    max: u64,
    count: u64,
}

impl BumpAllocator {
    /// Allocator for an archive of `max` bytes; the header area is already taken.
    pub fn new(max: u64) -> Self {
        Self { used: HDR_RESERVED, max, count: 0 }
    }

    pub fn used(&self) -> u64 { self.used }
    pub fn max(&self) -> u64 { self.max }
    pub fn allocations(&self) -> u64 { self.count }

    /// Bytes one request of `size` consumes, prefix included. `None` if that overflows.
    pub fn footprint(size: u64) -> Option<u64> {
        checked_align_up(size.max(1), ALIGN)?.checked_add(GC_PREFIX_BYTES)
    }

    /// Reserve `size` bytes and return their offset. On overflow `used` is left untouched.
    pub fn allocate(&mut self, size: u64) -> Result<u64> {
        let end = Self::footprint(size)
            .and_then(|need| self.used.checked_add(need))
            .filter(|end| *end <= self.max)
            .ok_or(SnapError::Capacity { requested: size, used: self.used, max: self.max })?;
        let off = self.used + GC_PREFIX_BYTES;
        trace!(off, end, "shared alloc");
        self.used = end;
        self.count += 1;
        Ok(off)
    }
}
