//! Graph serializer ("move-in"): deep-copies a live object into archive storage.

use crate::alloc::BumpAllocator;
use crate::codec::*;
use crate::consts::{NodeKind, DEFERRED_ENTRY_SIZE, GC_PREFIX_BYTES, GC_UNTRACKED, HASH_UNKNOWN};
use crate::deferred::{DeferredEntry, DeferredList};
use crate::errors::{Result, SnapError};
use crate::object::{CodeUnit, Int, Object};
use crate::reference::RefWord;
use crate::runtime::{type_address, Sentinel};
use crate::trace::TraceSink;
use crate::utils::{align_up, write_f64_at, write_i32_at, write_i64_at, write_u32_at, write_u64_at};
use tracing::trace;

/// One move-in pass over an archive image.
///
/// `image` is the whole archive region and `base` the address it is mapped
/// at; every reference written is `base + offset`.
pub struct MoveIn<'a> {
    image: &'a mut [u8],
    base: u64,
    alloc: &'a mut BumpAllocator,
    deferred: &'a mut DeferredList,
    trace: Option<&'a mut TraceSink>,
    nodes: u64,
}

impl<'a> MoveIn<'a> {
    pub fn new(image: &'a mut [u8], base: u64, alloc: &'a mut BumpAllocator, deferred: &'a mut DeferredList) -> Result<Self> {
        if alloc.max() > image.len() as u64 {
            return Err(SnapError::Corrupt(format!(
                "allocator ceiling {} exceeds image of {} bytes",
                alloc.max(),
                image.len()
            )));
        }
        Ok(Self { image, base, alloc, deferred, trace: None, nodes: 0 })
    }

    pub fn with_trace(mut self, sink: &'a mut TraceSink) -> Self {
        self.trace = Some(sink);
        self
    }

    /// Nodes allocated by this pass.
    pub fn nodes(&self) -> u64 { self.nodes }

    pub fn address_of(&self, off: usize) -> u64 { self.base + off as u64 }

    /// Copy `obj` and everything it references into the archive.
    pub fn move_in(&mut self, obj: &Object) -> Result<RefWord> {
        if let Some(sink) = self.trace.as_deref_mut() {
            sink.record(obj)?;
        }
        let off = match obj {
            Object::Absent => return Ok(RefWord::sentinel(Sentinel::Absent)),
            Object::Bool(true) => return Ok(RefWord::sentinel(Sentinel::True)),
            Object::Bool(false) => return Ok(RefWord::sentinel(Sentinel::False)),
            Object::Ellipsis => return Ok(RefWord::sentinel(Sentinel::Ellipsis)),
            Object::Int(i) => self.move_int(i)?,
            Object::Float(v) => {
                let off = self.alloc_node(FLOAT_NODE, NodeKind::Float)?;
                write_f64_at(self.image, off + FLOAT_VALUE, *v);
                off
            }
            Object::Complex { real, imag } => {
                let off = self.alloc_node(COMPLEX_NODE, NodeKind::Complex)?;
                write_f64_at(self.image, off + COMPLEX_REAL, *real);
                write_f64_at(self.image, off + COMPLEX_IMAG, *imag);
                off
            }
            Object::Bytes(b) => self.move_bytes(b)?,
            Object::Str(s) => self.move_text(s)?,
            // a frozen set is materialized in iteration order and archived as a plain sequence
            Object::Tuple(items) | Object::FrozenSet(items) => self.move_sequence(items)?,
            Object::Code(code) => self.move_code(code)?,
            Object::List(_) | Object::Dict(_) => return Err(SnapError::Unsupported(obj.type_name())),
        };
        trace!(kind = obj.type_name(), addr = self.address_of(off), "move in");
        Ok(RefWord::node(self.address_of(off)))
    }

    /// Record a slot to be filled after load. Returns the entry as recorded.
    pub fn defer(&mut self, patch_target: u64, raw: RefWord, kind: NodeKind) -> DeferredEntry {
        let e = DeferredEntry { patch_target, raw, type_ref: type_address(kind) };
        self.deferred.push(e);
        e
    }

    /// Write the deferred list (newest first) as an archived array.
    /// Returns the array reference and entry count; null and 0 when empty.
    pub fn finish_deferred(&mut self) -> Result<(RefWord, i32)> {
        if self.deferred.is_empty() {
            return Ok((RefWord::NULL, 0));
        }
        let n = self.deferred.len();
        let count = i32::try_from(n).map_err(|_| SnapError::Corrupt(format!("{n} deferred entries")))?;
        let off = self.alloc_raw(n * DEFERRED_ENTRY_SIZE)?;
        for (i, e) in self.deferred.flattened().enumerate() {
            let at = off + i * DEFERRED_ENTRY_SIZE;
            write_u64_at(self.image, at, e.patch_target);
            write_u64_at(self.image, at + 8, e.raw.0);
            write_u64_at(self.image, at + 16, e.type_ref);
        }
        Ok((RefWord::node(self.address_of(off)), count))
    }

    fn sized(&self, footprint: Option<usize>) -> Result<usize> {
        footprint.ok_or(SnapError::Capacity { requested: u64::MAX, used: self.alloc.used(), max: self.alloc.max() })
    }

    fn alloc_raw(&mut self, size: usize) -> Result<usize> {
        let off = self.alloc.allocate(size as u64)? as usize;
        let start = off - GC_PREFIX_BYTES as usize;
        let end = off + align_up(size.max(1) as u64, 8) as usize;
        self.image[start..end].fill(0);
        Ok(off)
    }

    fn alloc_node(&mut self, size: usize, kind: NodeKind) -> Result<usize> {
        let off = self.alloc_raw(size)?;
        write_u64_at(self.image, off + HEAD_TYPE, type_address(kind));
        self.image[off + HEAD_KIND] = kind as u8;
        self.image[off + HEAD_GC] = GC_UNTRACKED;
        self.nodes += 1;
        Ok(off)
    }

    fn move_int(&mut self, i: &Int) -> Result<usize> {
        let digits = i.digits();
        let size = self.sized(int_footprint(digits.len()))?;
        let off = self.alloc_node(size, NodeKind::Int)?;
        write_i64_at(self.image, off + INT_SIZE, i.signed_size());
        for (k, d) in digits.iter().enumerate() {
            write_u32_at(self.image, off + INT_DIGITS + 4 * k, *d);
        }
        Ok(off)
    }

    fn move_bytes(&mut self, b: &[u8]) -> Result<usize> {
        let size = self.sized(bytes_footprint(b.len()))?;
        let off = self.alloc_node(size, NodeKind::Bytes)?;
        write_i64_at(self.image, off + BYTES_LEN, b.len() as i64);
        write_i64_at(self.image, off + BYTES_HASH, HASH_UNKNOWN);
        let data = off + BYTES_DATA;
        self.image[data..data + b.len()].copy_from_slice(b);
        self.image[data + b.len()] = 0;
        Ok(off)
    }

    fn move_text(&mut self, s: &str) -> Result<usize> {
        let max_char = s.chars().map(u32::from).max().unwrap_or(0);
        let state = TextState::for_max_char(max_char);
        let width = state.width as usize;
        let len = s.chars().count();
        let size = self.sized(text_footprint(len, width))?;
        let off = self.alloc_node(size, NodeKind::Text)?;
        write_i64_at(self.image, off + TEXT_LEN, len as i64);
        write_i64_at(self.image, off + TEXT_HASH, HASH_UNKNOWN);
        write_u32_at(self.image, off + TEXT_STATE, state.encode());
        let data = off + TEXT_DATA;
        for (k, c) in s.chars().enumerate() {
            let at = data + k * width;
            match width {
                1 => self.image[at] = c as u32 as u8,
                2 => self.image[at..at + 2].copy_from_slice(&(c as u32 as u16).to_le_bytes()),
                _ => write_u32_at(self.image, at, c as u32),
            }
        }
        // NUL terminator is already in place: the range was zeroed on allocation
        Ok(off)
    }

    fn move_sequence(&mut self, items: &[Object]) -> Result<usize> {
        let size = self.sized(seq_footprint(items.len()))?;
        let off = self.alloc_node(size, NodeKind::Sequence)?;
        write_i64_at(self.image, off + SEQ_LEN, items.len() as i64);
        for (k, item) in items.iter().enumerate() {
            let w = self.move_in(item)?;
            write_u64_at(self.image, off + SEQ_ITEMS + 8 * k, w.0);
        }
        Ok(off)
    }

    fn move_code(&mut self, code: &CodeUnit) -> Result<usize> {
        let off = self.alloc_node(CODE_NODE, NodeKind::Code)?;
        for field in CODE_FIELDS.iter() {
            match &field.access {
                FieldAccess::Scalar { get, .. } => write_i32_at(self.image, off + field.offset, get(code)),
                FieldAccess::Ref { get, .. } => {
                    let w = self.move_in(get(code))?;
                    write_u64_at(self.image, off + field.offset, w.0);
                }
            }
        }
        let first_instr = first_instr_for(self.image, self.base, off)?;
        write_u64_at(self.image, off + CODE_FIRST_INSTR, first_instr);
        write_u64_at(self.image, off + CODE_WEAKREFLIST, 0);
        write_u64_at(self.image, off + CODE_EXTRA, 0);
        write_u64_at(self.image, off + CODE_QUICKENED, 0);
        Ok(off)
    }
}

/// Address of the first instruction of the code node at `off`: the data of its
/// bytecode bytes node, or 0 when the bytecode field is not a bytes node.
pub(crate) fn first_instr_for(image: &[u8], base: u64, off: usize) -> Result<u64> {
    let w = RefWord(crate::utils::read_u64_at(image, off + CODE_BYTECODE_REF)?);
    if !w.is_node() {
        return Ok(0);
    }
    let target = w.0.checked_sub(base).map(|o| o as usize);
    match target {
        Some(t) if node_kind(image, t)? == NodeKind::Bytes => Ok(w.0 + BYTES_DATA as u64),
        _ => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::HDR_RESERVED;
    use crate::utils::{read_i64_at, read_u64_at};

    const BASE: u64 = 0x4000_0000;

    fn image() -> (Vec<u8>, BumpAllocator, DeferredList) {
        (vec![0u8; 1 << 16], BumpAllocator::new(1 << 16), DeferredList::new())
    }

    #[test]
    fn sentinels_do_not_allocate() {
        let (mut img, mut a, mut d) = image();
        let mut m = MoveIn::new(&mut img, BASE, &mut a, &mut d).unwrap();
        for obj in [Object::Absent, Object::Bool(true), Object::Bool(false), Object::Ellipsis] {
            let w = m.move_in(&obj).unwrap();
            assert!(!w.is_node());
        }
        assert_eq!(m.nodes(), 0);
        drop(m);
        assert_eq!(a.used(), HDR_RESERVED);
    }

    #[test]
    fn bytes_layout() {
        let (mut img, mut a, mut d) = image();
        let w = MoveIn::new(&mut img, BASE, &mut a, &mut d).unwrap().move_in(&Object::Bytes(b"abc".to_vec())).unwrap();
        let off = (w.0 - BASE) as usize;
        assert_eq!(read_u64_at(&img, off).unwrap(), type_address(NodeKind::Bytes));
        assert_eq!(img[off + HEAD_KIND], NodeKind::Bytes as u8);
        assert_eq!(read_i64_at(&img, off + BYTES_LEN).unwrap(), 3);
        assert_eq!(read_i64_at(&img, off + BYTES_HASH).unwrap(), HASH_UNKNOWN);
        assert_eq!(&img[off + BYTES_DATA..off + BYTES_DATA + 4], b"abc\0");
    }

    #[test]
    fn text_picks_narrowest_width() {
        let (mut img, mut a, mut d) = image();
        let mut m = MoveIn::new(&mut img, BASE, &mut a, &mut d).unwrap();
        let hi = m.move_in(&Object::str("hi")).unwrap();
        let euro = m.move_in(&Object::str("a€")).unwrap();
        drop(m);
        let off = (hi.0 - BASE) as usize;
        let st = TextState::decode(crate::utils::read_u32_at(&img, off + TEXT_STATE).unwrap()).unwrap();
        assert_eq!(st, TextState { width: 1, ascii: true });
        assert_eq!(&img[off + TEXT_DATA..off + TEXT_DATA + 3], b"hi\0");
        let off = (euro.0 - BASE) as usize;
        assert_eq!(read_i64_at(&img, off + TEXT_LEN).unwrap(), 2);
        assert_eq!(&img[off + TEXT_DATA..off + TEXT_DATA + 6], &[b'a', 0, 0xac, 0x20, 0, 0]);
    }

    #[test]
    fn unsupported_kind_aborts() {
        let (mut img, mut a, mut d) = image();
        let mut m = MoveIn::new(&mut img, BASE, &mut a, &mut d).unwrap();
        let err = m.move_in(&Object::tuple(vec![Object::int(1), Object::List(vec![])])).unwrap_err();
        assert!(matches!(err, SnapError::Unsupported("list")));
    }

    #[test]
    fn code_derived_fields() {
        let (mut img, mut a, mut d) = image();
        let mut unit = CodeUnit::new("f", "m.py");
        unit.code = Object::Bytes(vec![0x64, 0x00, 0x53, 0x00]);
        unit.argcount = 2;
        let w = MoveIn::new(&mut img, BASE, &mut a, &mut d).unwrap().move_in(&Object::Code(Box::new(unit))).unwrap();
        let off = (w.0 - BASE) as usize;
        let bytecode = read_u64_at(&img, off + CODE_BYTECODE_REF).unwrap();
        assert_eq!(read_u64_at(&img, off + CODE_FIRST_INSTR).unwrap(), bytecode + BYTES_DATA as u64);
        assert_eq!(read_u64_at(&img, off + CODE_WEAKREFLIST).unwrap(), 0);
        assert_eq!(crate::utils::read_i32_at(&img, off + CODE_SCALARS).unwrap(), 2);
    }

    #[test]
    fn deferred_array_is_newest_first() {
        let (mut img, mut a, mut d) = image();
        let mut m = MoveIn::new(&mut img, BASE, &mut a, &mut d).unwrap();
        m.defer(BASE + 0x2000, RefWord::NULL, NodeKind::Int);
        m.defer(BASE + 0x3000, RefWord::NULL, NodeKind::Text);
        let (arr, count) = m.finish_deferred().unwrap();
        drop(m);
        assert_eq!(count, 2);
        let off = (arr.0 - BASE) as usize;
        assert_eq!(read_u64_at(&img, off).unwrap(), BASE + 0x3000);
        assert_eq!(read_u64_at(&img, off + 16).unwrap(), type_address(NodeKind::Text));
        assert_eq!(read_u64_at(&img, off + DEFERRED_ENTRY_SIZE).unwrap(), BASE + 0x2000);
    }
}
