//! Archive header (LE, fields region 88 bytes, payload starts at 4096):
//!
//!   mapped_base[8]      = virtual address the archive was built at
//!   sentinel[4 * 8]     = build-time addresses of None/True/False/Ellipsis
//!   used_bytes[8]       = allocator high-water mark (valid bytes)
//!   serialized_count[4] = deferred entry count, then 4 bytes pad
//!   serialized_array[8] = reference word of the deferred entry array
//!   root[8]             = reference word of the root node
//!   magic[4] = "SNPH", version[2], flags[2]
//!   crc[4]              = crc32 of bytes 0..80, then 4 bytes pad

use crate::consts::{HDR_FIELDS_SIZE, HDR_RESERVED, MAGIC_ARCHIVE, PAGE_SIZE, VERSION};
use crate::errors::{Result, SnapError};
use crate::utils::crc32;
use byteorder::{LittleEndian as LE, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};

pub const OFF_USED: usize = 40;
pub const OFF_SERIALIZED_COUNT: usize = 48;
pub const OFF_SERIALIZED_ARRAY: usize = 56;
pub const OFF_ROOT: usize = 64;
const OFF_CRC: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ArchiveHeader {
    pub mapped_base: u64,
    pub sentinels: [u64; 4],
    pub used_bytes: u64,
    pub serialized_count: i32,
    pub serialized_array: u64,
    pub root: u64,
}

impl ArchiveHeader {
    /// Header of a freshly created archive mapped at `mapped_base`.
    pub fn new(mapped_base: u64, sentinels: [u64; 4]) -> Self {
        Self {
            mapped_base,
            sentinels,
            used_bytes: HDR_RESERVED,
            serialized_count: 0,
            serialized_array: 0,
            root: 0,
        }
    }

    pub fn encode(&self) -> [u8; HDR_FIELDS_SIZE] {
        let mut out = [0u8; HDR_FIELDS_SIZE];
        // writes into a fixed-size buffer of the right length cannot fail
        let _ = self.write_fields(&mut Cursor::new(&mut out[..]));
        let crc = crc32(&out[..OFF_CRC]);
        out[OFF_CRC..OFF_CRC + 4].copy_from_slice(&crc.to_le_bytes());
        out
    }

    fn write_fields(&self, w: &mut Cursor<&mut [u8]>) -> io::Result<()> {
        w.write_u64::<LE>(self.mapped_base)?;
        for s in self.sentinels {
            w.write_u64::<LE>(s)?;
        }
        w.write_u64::<LE>(self.used_bytes)?;
        w.write_i32::<LE>(self.serialized_count)?;
        w.write_u32::<LE>(0)?; // pad
        w.write_u64::<LE>(self.serialized_array)?;
        w.write_u64::<LE>(self.root)?;
        w.write_all(MAGIC_ARCHIVE)?;
        w.write_u16::<LE>(VERSION)?;
        w.write_u16::<LE>(0)?; // flags
        Ok(())
    }

    /// Decode and check magic, version and crc.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HDR_FIELDS_SIZE {
            return Err(SnapError::BadHeader(format!("{} bytes, need {HDR_FIELDS_SIZE}", bytes.len())));
        }
        let want = u32::from_le_bytes([bytes[OFF_CRC], bytes[OFF_CRC + 1], bytes[OFF_CRC + 2], bytes[OFF_CRC + 3]]);
        if crc32(&bytes[..OFF_CRC]) != want {
            return Err(SnapError::BadHeader("crc mismatch".into()));
        }
        let mut r = Cursor::new(bytes);
        let mapped_base = r.read_u64::<LE>()?;
        let mut sentinels = [0u64; 4];
        for s in sentinels.iter_mut() {
            *s = r.read_u64::<LE>()?;
        }
        let used_bytes = r.read_u64::<LE>()?;
        let serialized_count = r.read_i32::<LE>()?;
        let _pad = r.read_u32::<LE>()?;
        let serialized_array = r.read_u64::<LE>()?;
        let root = r.read_u64::<LE>()?;
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC_ARCHIVE {
            return Err(SnapError::BadHeader("bad magic".into()));
        }
        let version = r.read_u16::<LE>()?;
        if version != VERSION {
            return Err(SnapError::BadHeader(format!("unsupported version {version}")));
        }
        Ok(Self { mapped_base, sentinels, used_bytes, serialized_count, serialized_array, root })
    }

    /// Read only the header prefix of an archive stream.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let mut buf = [0u8; HDR_FIELDS_SIZE];
        r.read_exact(&mut buf).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => SnapError::BadHeader("short header".into()),
            _ => SnapError::Io(e),
        })?;
        Self::decode(&buf)
    }

    pub fn validate(&self) -> Result<()> {
        if self.used_bytes < HDR_RESERVED {
            return Err(SnapError::BadHeader(format!("used_bytes {} below header size", self.used_bytes)));
        }
        if self.mapped_base % PAGE_SIZE != 0 {
            return Err(SnapError::BadHeader(format!("base {:#x} not page aligned", self.mapped_base)));
        }
        if self.serialized_count < 0 {
            return Err(SnapError::BadHeader(format!("negative serialized_count {}", self.serialized_count)));
        }
        if self.serialized_count > 0 && self.serialized_array == 0 {
            return Err(SnapError::BadHeader("deferred entries without an array".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ArchiveHeader {
        let mut h = ArchiveHeader::new(0x2_8000_0000, [0x1000, 0x1010, 0x1020, 0x1030]);
        h.used_bytes = 8192;
        h.root = 0x2_8000_1010;
        h
    }

    #[test]
    fn header_roundtrip() {
        let h = sample();
        let bytes = h.encode();
        assert_eq!(&bytes[72..76], MAGIC_ARCHIVE);
        assert_eq!(u64::from_le_bytes(bytes[OFF_ROOT..OFF_ROOT + 8].try_into().unwrap()), h.root);
        let back = ArchiveHeader::decode(&bytes).unwrap();
        assert_eq!(back, h);
        assert!(back.validate().is_ok());
        let mut cur = Cursor::new(bytes.to_vec());
        assert_eq!(ArchiveHeader::read_from(&mut cur).unwrap(), h);
    }

    #[test]
    fn header_rejects_damage() {
        let mut bytes = sample().encode();
        bytes[OFF_USED] ^= 1;
        assert!(matches!(ArchiveHeader::decode(&bytes), Err(SnapError::BadHeader(_))));
        assert!(matches!(ArchiveHeader::decode(&bytes[..10]), Err(SnapError::BadHeader(_))));
        let mut short = Cursor::new(vec![0u8; 12]);
        assert!(matches!(ArchiveHeader::read_from(&mut short), Err(SnapError::BadHeader(_))));

        let mut h = sample();
        h.used_bytes = 10;
        assert!(h.validate().is_err());
    }
}
