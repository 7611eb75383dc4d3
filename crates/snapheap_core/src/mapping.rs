//! Mapping strategies.
//!
//! `FixedAddress` maps the archive exactly at a requested address and fails
//! otherwise. `AnyAddress` lets the kernel choose and relies on the relocator
//! to shift node references by the difference.

use crate::errors::{Result, SnapError};
use memmap2::{MmapMut, MmapOptions};
use std::fs::File;
use tracing::debug;

pub trait MapStrategy: Default {
    fn name(&self) -> &'static str;

    /// Shared read-write mapping of `len` bytes used while building.
    fn map_for_build(&self, file: &File, len: u64, requested: u64) -> Result<Mapping>;

    /// Private (copy-on-write) mapping of `len` bytes used while loading.
    /// Patches never reach the file.
    fn map_for_load(&self, file: &File, len: u64, recorded_base: u64) -> Result<Mapping>;
}

/// A mapped archive region. Unmapped on drop.
pub struct Mapping {
    region: Region,
}

enum Region {
    #[cfg(unix)]
    Raw(RawRegion),
    Mem(MmapMut),
}

impl Mapping {
    pub fn base(&self) -> u64 {
        match &self.region {
            #[cfg(unix)]
            Region::Raw(r) => r.ptr as u64,
            Region::Mem(m) => m.as_ptr() as u64,
        }
    }

    pub fn len(&self) -> usize {
        match &self.region {
            #[cfg(unix)]
            Region::Raw(r) => r.len,
            Region::Mem(m) => m.len(),
        }
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn as_slice(&self) -> &[u8] {
        match &self.region {
            #[cfg(unix)]
            Region::Raw(r) => unsafe { std::slice::from_raw_parts(r.ptr, r.len) },
            Region::Mem(m) => &m[..],
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.region {
            #[cfg(unix)]
            Region::Raw(r) => unsafe { std::slice::from_raw_parts_mut(r.ptr, r.len) },
            Region::Mem(m) => &mut m[..],
        }
    }

    /// Write dirty pages of a shared mapping back to the file.
    pub fn flush(&self) -> Result<()> {
        match &self.region {
            #[cfg(unix)]
            Region::Raw(r) => r.flush(),
            Region::Mem(m) => Ok(m.flush()?),
        }
    }
}

impl std::fmt::Debug for Mapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapping").field("base", &format_args!("{:#x}", self.base())).field("len", &self.len()).finish()
    }
}

#[cfg(unix)]
struct RawRegion {
    ptr: *mut u8,
    len: usize,
}

#[cfg(unix)]
impl RawRegion {
    fn flush(&self) -> Result<()> {
        let rc = unsafe { libc::msync(self.ptr as *mut libc::c_void, self.len, libc::MS_SYNC) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }
}

#[cfg(unix)]
impl Drop for RawRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

fn map_len(len: u64) -> Result<usize> {
    usize::try_from(len).map_err(|_| SnapError::InvalidConfig(format!("mapping length {len} too large")))
}

/// Map at exactly `addr` or fail.
#[derive(Debug, Default, Clone, Copy)]
pub struct FixedAddress;

impl MapStrategy for FixedAddress {
    fn name(&self) -> &'static str { "fixed" }

    fn map_for_build(&self, file: &File, len: u64, requested: u64) -> Result<Mapping> {
        map_fixed(file, len, requested, true)
    }

    fn map_for_load(&self, file: &File, len: u64, recorded_base: u64) -> Result<Mapping> {
        map_fixed(file, len, recorded_base, false)
    }
}

#[cfg(unix)]
fn map_fixed(file: &File, len: u64, addr: u64, shared: bool) -> Result<Mapping> {
    use std::os::unix::io::AsRawFd;

    let len = map_len(len)?;
    #[allow(unused_mut)]
    let mut flags = if shared { libc::MAP_SHARED } else { libc::MAP_PRIVATE };
    // NOREPLACE refuses an occupied range instead of clobbering it; kernels
    // without it treat the address as a hint, which the check below catches.
    #[cfg(target_os = "linux")]
    {
        flags |= libc::MAP_FIXED_NOREPLACE;
        if !shared {
            flags |= libc::MAP_POPULATE;
        }
    }
    let ptr = unsafe {
        libc::mmap(
            addr as *mut libc::c_void,
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            flags,
            file.as_raw_fd(),
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(SnapError::MapFailed { addr, source: std::io::Error::last_os_error() });
    }
    let region = RawRegion { ptr: ptr as *mut u8, len };
    if ptr as u64 != addr {
        let actual = ptr as u64;
        drop(region);
        return Err(SnapError::Relocated { requested: addr, actual });
    }
    debug!(addr = %format!("{addr:#x}"), len, shared, "fixed mapping");
    Ok(Mapping { region: Region::Raw(region) })
}

#[cfg(not(unix))]
fn map_fixed(_file: &File, _len: u64, _addr: u64, _shared: bool) -> Result<Mapping> {
    Err(SnapError::Unsupported("fixed-address mapping"))
}

/// Map wherever the kernel chooses.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnyAddress;

impl MapStrategy for AnyAddress {
    fn name(&self) -> &'static str { "portable" }

    fn map_for_build(&self, file: &File, len: u64, _requested: u64) -> Result<Mapping> {
        let mmap = unsafe { MmapOptions::new().len(map_len(len)?).map_mut(file)? };
        debug!(base = %format!("{:#x}", mmap.as_ptr() as u64), len, "portable mapping (shared)");
        Ok(Mapping { region: Region::Mem(mmap) })
    }

    fn map_for_load(&self, file: &File, len: u64, _recorded_base: u64) -> Result<Mapping> {
        let mmap = unsafe { MmapOptions::new().len(map_len(len)?).map_copy(file)? };
        debug!(base = %format!("{:#x}", mmap.as_ptr() as u64), len, "portable mapping (private)");
        Ok(Mapping { region: Region::Mem(mmap) })
    }
}
