//! Zero-copy access to archived nodes.

use crate::codec::*;
use crate::consts::{NodeKind, HDR_RESERVED};
use crate::errors::{Result, SnapError};
use crate::object::{CodeUnit, Int, Object};
use crate::reference::{RefTarget, RefWord};
use crate::runtime::Sentinel;
use crate::utils::{bytes_at, read_f64_at, read_i32_at, read_i64_at, read_u32_at, read_u64_at};

/// Read-only window over a relocated archive mapped at `base`.
#[derive(Debug, Clone, Copy)]
pub struct ArchiveView<'a> {
    image: &'a [u8],
    base: u64,
}

#[derive(Debug, Clone, Copy)]
pub enum Archived<'a> {
    Sentinel(Sentinel),
    Int(IntRef<'a>),
    Float(f64),
    Complex { real: f64, imag: f64 },
    Bytes(&'a [u8]),
    Text(TextRef<'a>),
    Sequence(SequenceRef<'a>),
    Code(CodeRef<'a>),
}

impl<'a> ArchiveView<'a> {
    pub fn new(image: &'a [u8], base: u64) -> Self { Self { image, base } }

    pub fn base(&self) -> u64 { self.base }
    pub fn image(&self) -> &'a [u8] { self.image }

    /// Image offset of an archive address.
    pub fn offset_of(&self, addr: u64) -> Result<usize> {
        match addr.checked_sub(self.base) {
            Some(off) if off >= HDR_RESERVED && (off as usize) < self.image.len() => Ok(off as usize),
            _ => Err(SnapError::Corrupt(format!("address {addr:#x} outside archive at {:#x}", self.base))),
        }
    }

    pub fn resolve(&self, w: RefWord) -> Result<Archived<'a>> {
        match w.target() {
            Some(RefTarget::Sentinel(s)) => Ok(Archived::Sentinel(s)),
            Some(RefTarget::Node(addr)) => self.node(self.offset_of(addr)?),
            Some(RefTarget::Null) => Err(SnapError::Corrupt("null reference".into())),
            None => Err(SnapError::Corrupt(format!("bad reference word {:#x}", w.0))),
        }
    }

    fn node(&self, off: usize) -> Result<Archived<'a>> {
        let img = self.image;
        let kind = node_kind(img, off)?;
        Ok(match kind {
            NodeKind::Int => {
                let size = read_i64_at(img, off + INT_SIZE)?;
                let n = usize::try_from(size.unsigned_abs()).unwrap_or(usize::MAX);
                let digits = bytes_at(img, off + INT_DIGITS, scaled(n, 4, off)?)?;
                Archived::Int(IntRef { negative: size < 0, digits })
            }
            NodeKind::Float => Archived::Float(read_f64_at(img, off + FLOAT_VALUE)?),
            NodeKind::Complex => Archived::Complex {
                real: read_f64_at(img, off + COMPLEX_REAL)?,
                imag: read_f64_at(img, off + COMPLEX_IMAG)?,
            },
            NodeKind::Bytes => {
                let len = read_len(img, off + BYTES_LEN)?;
                Archived::Bytes(bytes_at(img, off + BYTES_DATA, len)?)
            }
            NodeKind::Text => {
                let len = read_len(img, off + TEXT_LEN)?;
                let state = TextState::decode(read_u32_at(img, off + TEXT_STATE)?)?;
                let data = bytes_at(img, off + TEXT_DATA, scaled(len, state.width as usize, off)?)?;
                Archived::Text(TextRef { data, len, state })
            }
            NodeKind::Sequence => {
                let len = read_len(img, off + SEQ_LEN)?;
                bytes_at(img, off + SEQ_ITEMS, scaled(len, 8, off)?)?;
                Archived::Sequence(SequenceRef { view: *self, items: off + SEQ_ITEMS, len })
            }
            NodeKind::Code => {
                bytes_at(img, off, CODE_NODE)?;
                Archived::Code(CodeRef { view: *self, off })
            }
        })
    }
}

fn scaled(len: usize, unit: usize, off: usize) -> Result<usize> {
    len.checked_mul(unit).ok_or_else(|| SnapError::Corrupt(format!("length {len} of node at {off:#x} overflows")))
}

fn read_len(img: &[u8], at: usize) -> Result<usize> {
    let v = read_i64_at(img, at)?;
    usize::try_from(v).map_err(|_| SnapError::Corrupt(format!("negative length {v} at {at:#x}")))
}

#[derive(Debug, Clone, Copy)]
pub struct IntRef<'a> {
    negative: bool,
    digits: &'a [u8],
}

impl IntRef<'_> {
    pub fn to_int(&self) -> Int {
        let digits = self.digits.chunks_exact(4).map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect();
        Int::from_parts(self.negative, digits)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TextRef<'a> {
    data: &'a [u8],
    len: usize,
    state: TextState,
}

impl<'a> TextRef<'a> {
    pub fn len(&self) -> usize { self.len }
    pub fn is_empty(&self) -> bool { self.len == 0 }
    pub fn width(&self) -> u8 { self.state.width }
    pub fn is_ascii(&self) -> bool { self.state.ascii }

    /// Borrowed text, available for ASCII strings only.
    pub fn as_str(&self) -> Option<&'a str> {
        if self.state.ascii { std::str::from_utf8(self.data).ok() } else { None }
    }

    pub fn code_unit(&self, i: usize) -> Option<u32> {
        let w = self.state.width as usize;
        let c = self.data.get(i * w..(i + 1) * w)?;
        Some(match w {
            1 => c[0] as u32,
            2 => u16::from_le_bytes([c[0], c[1]]) as u32,
            _ => u32::from_le_bytes([c[0], c[1], c[2], c[3]]),
        })
    }

    pub fn to_string_lossless(&self) -> Result<String> {
        (0..self.len)
            .map(|i| {
                self.code_unit(i)
                    .and_then(char::from_u32)
                    .ok_or_else(|| SnapError::Corrupt(format!("invalid code unit at index {i}")))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SequenceRef<'a> {
    view: ArchiveView<'a>,
    items: usize,
    len: usize,
}

impl<'a> SequenceRef<'a> {
    pub fn len(&self) -> usize { self.len }
    pub fn is_empty(&self) -> bool { self.len == 0 }

    pub fn word(&self, i: usize) -> Option<RefWord> {
        if i >= self.len {
            return None;
        }
        read_u64_at(self.view.image, self.items + 8 * i).ok().map(RefWord)
    }

    pub fn get(&self, i: usize) -> Option<Result<Archived<'a>>> {
        self.word(i).map(|w| self.view.resolve(w))
    }

    pub fn iter(&self) -> impl Iterator<Item = Result<Archived<'a>>> + '_ {
        (0..self.len).filter_map(move |i| self.get(i))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CodeRef<'a> {
    view: ArchiveView<'a>,
    off: usize,
}

impl<'a> CodeRef<'a> {
    pub fn scalar(&self, name: &str) -> Option<i32> {
        let f = code_field(name).filter(|f| !f.is_ref())?;
        read_i32_at(self.view.image, self.off + f.offset).ok()
    }

    pub fn field(&self, name: &str) -> Option<Result<Archived<'a>>> {
        let f = code_field(name).filter(|f| f.is_ref())?;
        Some(read_u64_at(self.view.image, self.off + f.offset).and_then(|w| self.view.resolve(RefWord(w))))
    }

    /// Live address of the first bytecode instruction (0 if the unit has none).
    pub fn first_instr(&self) -> u64 {
        read_u64_at(self.view.image, self.off + CODE_FIRST_INSTR).unwrap_or(0)
    }

    pub fn bytecode(&self) -> Result<&'a [u8]> {
        match self.field("code") {
            Some(Ok(Archived::Bytes(b))) => Ok(b),
            Some(Err(e)) => Err(e),
            _ => Err(SnapError::Corrupt("code unit without bytecode".into())),
        }
    }

    pub fn to_unit(&self) -> Result<CodeUnit> {
        let mut unit = CodeUnit::default();
        for f in CODE_FIELDS.iter() {
            let at = self.off + f.offset;
            match &f.access {
                FieldAccess::Scalar { set, .. } => set(&mut unit, read_i32_at(self.view.image, at)?),
                FieldAccess::Ref { slot, .. } => {
                    *slot(&mut unit) = self.view.resolve(RefWord(read_u64_at(self.view.image, at)?))?.to_object()?;
                }
            }
        }
        Ok(unit)
    }
}

impl Archived<'_> {
    pub fn type_name(&self) -> &'static str {
        match self {
            Archived::Sentinel(s) => Object::from_sentinel(*s).type_name(),
            Archived::Int(_) => "int",
            Archived::Float(_) => "float",
            Archived::Complex { .. } => "complex",
            Archived::Bytes(_) => "bytes",
            Archived::Text(_) => "str",
            Archived::Sequence(_) => "tuple",
            Archived::Code(_) => "code",
        }
    }

    /// Rebuild a live object from the archived node graph.
    pub fn to_object(&self) -> Result<Object> {
        Ok(match self {
            Archived::Sentinel(s) => Object::from_sentinel(*s),
            Archived::Int(i) => Object::Int(i.to_int()),
            Archived::Float(v) => Object::Float(*v),
            Archived::Complex { real, imag } => Object::Complex { real: *real, imag: *imag },
            Archived::Bytes(b) => Object::Bytes(b.to_vec()),
            Archived::Text(t) => Object::Str(t.to_string_lossless()?),
            Archived::Sequence(s) => Object::Tuple(s.iter().map(|a| a.and_then(|a| a.to_object())).collect::<Result<_>>()?),
            Archived::Code(c) => Object::Code(Box::new(c.to_unit()?)),
        })
    }
}
