use crate::errors::{Result, SnapError};
use byteorder::{ByteOrder, LittleEndian as LE};
use std::path::Path;

pub fn crc32(data: &[u8]) -> u32 { crc32fast::hash(data) }

#[inline]
pub const fn align_up(n: u64, to: u64) -> u64 { (n + to - 1) / to * to }

/// `align_up` that reports overflow instead of wrapping.
#[inline]
pub const fn checked_align_up(n: u64, to: u64) -> Option<u64> {
    match n.checked_add(to - 1) {
        Some(v) => Some(v / to * to),
        None => None,
    }
}

/// fsync the directory holding `path` so a rename into it is durable.
#[cfg(unix)]
pub fn fsync_dir(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;
    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d,
        _ => Path::new("."),
    };
    let f = std::fs::OpenOptions::new().read(true).custom_flags(libc::O_DIRECTORY).open(dir)?;
    f.sync_all()
}
#[cfg(not(unix))]
pub fn fsync_dir(_path: &Path) -> std::io::Result<()> { Ok(()) }

#[inline]
fn span(buf: &[u8], off: usize, len: usize) -> Result<std::ops::Range<usize>> {
    match off.checked_add(len) {
        Some(end) if end <= buf.len() => Ok(off..end),
        _ => Err(SnapError::Corrupt(format!("read of {len} bytes at {off:#x} past end {:#x}", buf.len()))),
    }
}

pub fn read_u64_at(buf: &[u8], off: usize) -> Result<u64> { Ok(LE::read_u64(&buf[span(buf, off, 8)?])) }
pub fn read_i64_at(buf: &[u8], off: usize) -> Result<i64> { Ok(LE::read_i64(&buf[span(buf, off, 8)?])) }
pub fn read_u32_at(buf: &[u8], off: usize) -> Result<u32> { Ok(LE::read_u32(&buf[span(buf, off, 4)?])) }
pub fn read_i32_at(buf: &[u8], off: usize) -> Result<i32> { Ok(LE::read_i32(&buf[span(buf, off, 4)?])) }
pub fn read_f64_at(buf: &[u8], off: usize) -> Result<f64> { Ok(LE::read_f64(&buf[span(buf, off, 8)?])) }
pub fn read_u8_at(buf: &[u8], off: usize) -> Result<u8> {
    buf.get(off).copied().ok_or_else(|| SnapError::Corrupt(format!("read at {off:#x} past end")))
}
pub fn bytes_at(buf: &[u8], off: usize, len: usize) -> Result<&[u8]> { Ok(&buf[span(buf, off, len)?]) }

// Writers index directly: callers only write inside ranges handed out by the allocator.
pub fn write_u64_at(buf: &mut [u8], off: usize, v: u64) { LE::write_u64(&mut buf[off..off + 8], v) }
pub fn write_i64_at(buf: &mut [u8], off: usize, v: i64) { LE::write_i64(&mut buf[off..off + 8], v) }
pub fn write_u32_at(buf: &mut [u8], off: usize, v: u32) { LE::write_u32(&mut buf[off..off + 4], v) }
pub fn write_i32_at(buf: &mut [u8], off: usize, v: i32) { LE::write_i32(&mut buf[off..off + 4], v) }
pub fn write_f64_at(buf: &mut [u8], off: usize, v: f64) { LE::write_f64(&mut buf[off..off + 8], v) }
