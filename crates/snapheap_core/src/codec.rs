//! Type codec registry: node layouts and per-field descriptor tables.
//!
//! Every node starts with a 16-byte head:
//!
//!   type_ref[8] = address of the live type descriptor (patched by the runtime shift)
//!   kind[1]     = NodeKind tag
//!   gc_state[1] = 0 (untracked)
//!   pad[6]
//!
//! Per-kind payload after the head:
//!
//!   Int      : size[i64] (signed digit count), digits[u32 * |size|]
//!   Float    : value[f64]
//!   Complex  : real[f64], imag[f64]
//!   Bytes    : len[i64], hash[i64] = -1, data[len], NUL
//!   Text     : length[i64], hash[i64] = -1, state[u32], pad[u32], data[(length + 1) * width]
//!   Sequence : len[i64], items[RefWord * len]
//!   Code     : 12 scalar i32, 15 RefWord, 4 derived u64 (see `CODE_FIELDS`)
//!
//! The serializer, the relocator and the reader all walk the same tables, so a
//! field added here is copied, patched and read without further changes.

use crate::consts::{NodeKind, NODE_HEAD_SIZE};
use crate::errors::{Result, SnapError};
use crate::object::{CodeUnit, Object};
use crate::utils::{read_i64_at, read_u8_at};

pub const HEAD_TYPE: usize = 0;
pub const HEAD_KIND: usize = 8;
pub const HEAD_GC: usize = 9;

pub const INT_SIZE: usize = NODE_HEAD_SIZE;
pub const INT_DIGITS: usize = NODE_HEAD_SIZE + 8;

pub const FLOAT_VALUE: usize = NODE_HEAD_SIZE;
pub const FLOAT_NODE: usize = NODE_HEAD_SIZE + 8;

pub const COMPLEX_REAL: usize = NODE_HEAD_SIZE;
pub const COMPLEX_IMAG: usize = NODE_HEAD_SIZE + 8;
pub const COMPLEX_NODE: usize = NODE_HEAD_SIZE + 16;

pub const BYTES_LEN: usize = NODE_HEAD_SIZE;
pub const BYTES_HASH: usize = NODE_HEAD_SIZE + 8;
pub const BYTES_DATA: usize = NODE_HEAD_SIZE + 16;

pub const TEXT_LEN: usize = NODE_HEAD_SIZE;
pub const TEXT_HASH: usize = NODE_HEAD_SIZE + 8;
pub const TEXT_STATE: usize = NODE_HEAD_SIZE + 16;
pub const TEXT_DATA: usize = NODE_HEAD_SIZE + 24;

pub const SEQ_LEN: usize = NODE_HEAD_SIZE;
pub const SEQ_ITEMS: usize = NODE_HEAD_SIZE + 8;

pub const CODE_SCALARS: usize = NODE_HEAD_SIZE;
pub const CODE_REFS: usize = CODE_SCALARS + 12 * 4;
pub const CODE_FIRST_INSTR: usize = CODE_REFS + 15 * 8;
pub const CODE_WEAKREFLIST: usize = CODE_FIRST_INSTR + 8;
pub const CODE_EXTRA: usize = CODE_FIRST_INSTR + 16;
pub const CODE_QUICKENED: usize = CODE_FIRST_INSTR + 24;
pub const CODE_NODE: usize = CODE_FIRST_INSTR + 32;

// Node sizes for a given length; `None` when the size does not fit in usize.
pub fn int_footprint(ndigits: usize) -> Option<usize> { ndigits.checked_mul(4)?.checked_add(INT_DIGITS) }
pub fn bytes_footprint(len: usize) -> Option<usize> { len.checked_add(BYTES_DATA + 1) }
pub fn text_footprint(len: usize, width: usize) -> Option<usize> { len.checked_add(1)?.checked_mul(width)?.checked_add(TEXT_DATA) }
pub fn seq_footprint(len: usize) -> Option<usize> { len.checked_mul(8)?.checked_add(SEQ_ITEMS) }

/// Text state word, laid out like a compact runtime string:
/// interned bits 0-1, kind (code unit width) bits 2-4, compact bit 5, ascii bit 6, ready bit 7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextState {
    pub width: u8,
    pub ascii: bool,
}

impl TextState {
    /// Narrowest encoding able to hold `max_char`.
    pub fn for_max_char(max_char: u32) -> Self {
        match max_char {
            0..=0x7f => Self { width: 1, ascii: true },
            0x80..=0xff => Self { width: 1, ascii: false },
            0x100..=0xffff => Self { width: 2, ascii: false },
            _ => Self { width: 4, ascii: false },
        }
    }

    pub fn encode(self) -> u32 {
        ((self.width as u32) << 2) | (1 << 5) | ((self.ascii as u32) << 6) | (1 << 7)
    }

    pub fn decode(word: u32) -> Result<Self> {
        let width = ((word >> 2) & 0b111) as u8;
        if !matches!(width, 1 | 2 | 4) || word & (1 << 5) == 0 {
            return Err(SnapError::Corrupt(format!("bad text state {word:#x}")));
        }
        Ok(Self { width, ascii: word & (1 << 6) != 0 })
    }
}

pub enum FieldAccess {
    Scalar { get: fn(&CodeUnit) -> i32, set: fn(&mut CodeUnit, i32) },
    Ref { get: fn(&CodeUnit) -> &Object, slot: fn(&mut CodeUnit) -> &mut Object },
}

pub struct CodeField {
    pub name: &'static str,
    pub offset: usize,
    pub access: FieldAccess,
}

impl CodeField {
    pub fn is_ref(&self) -> bool { matches!(self.access, FieldAccess::Ref { .. }) }
}

macro_rules! scalar_field {
    ($field:ident, $idx:expr) => {
        CodeField {
            name: stringify!($field),
            offset: CODE_SCALARS + 4 * $idx,
            access: FieldAccess::Scalar {
                get: { fn get(c: &CodeUnit) -> i32 { c.$field } get },
                set: { fn set(c: &mut CodeUnit, v: i32) { c.$field = v } set },
            },
        }
    };
}

macro_rules! ref_field {
    ($field:ident, $idx:expr) => {
        CodeField {
            name: stringify!($field),
            offset: CODE_REFS + 8 * $idx,
            access: FieldAccess::Ref {
                get: { fn get(c: &CodeUnit) -> &Object { &c.$field } get },
                slot: { fn slot(c: &mut CodeUnit) -> &mut Object { &mut c.$field } slot },
            },
        }
    };
}

/// Field table for code nodes. Derived fields (first_instr, weakreflist,
/// extra, quickened) are not listed: they are never copied.
pub static CODE_FIELDS: [CodeField; 27] = [
    scalar_field!(argcount, 0),
    scalar_field!(posonlyargcount, 1),
    scalar_field!(kwonlyargcount, 2),
    scalar_field!(stacksize, 3),
    scalar_field!(flags, 4),
    scalar_field!(firstlineno, 5),
    scalar_field!(nlocalsplus, 6),
    scalar_field!(nlocals, 7),
    scalar_field!(nplaincellvars, 8),
    scalar_field!(ncellvars, 9),
    scalar_field!(nfreevars, 10),
    scalar_field!(warmup, 11),
    ref_field!(consts, 0),
    ref_field!(names, 1),
    ref_field!(code, 2),
    ref_field!(exceptiontable, 3),
    ref_field!(localsplusnames, 4),
    ref_field!(localspluskinds, 5),
    ref_field!(filename, 6),
    ref_field!(name, 7),
    ref_field!(qualname, 8),
    ref_field!(linetable, 9),
    ref_field!(endlinetable, 10),
    ref_field!(columntable, 11),
    ref_field!(varnames, 12),
    ref_field!(freevars, 13),
    ref_field!(cellvars, 14),
];

/// Offset of the `code` reference inside a code node.
pub const CODE_BYTECODE_REF: usize = CODE_REFS + 8 * 2;

pub fn code_field(name: &str) -> Option<&'static CodeField> {
    CODE_FIELDS.iter().find(|f| f.name == name)
}

/// Kind tag of the node at `off`.
pub fn node_kind(image: &[u8], off: usize) -> Result<NodeKind> {
    let tag = read_u8_at(image, off + HEAD_KIND)?;
    NodeKind::from_tag(tag).ok_or_else(|| SnapError::Corrupt(format!("unknown node tag {tag} at {off:#x}")))
}

fn non_negative(v: i64, what: &str, off: usize) -> Result<usize> {
    usize::try_from(v).map_err(|_| SnapError::Corrupt(format!("negative {what} {v} at {off:#x}")))
}

/// Exact byte size of the node at `off`, head included. The node must fit
/// inside `image`.
pub fn node_extent(image: &[u8], off: usize, kind: NodeKind) -> Result<usize> {
    let size = match kind {
        NodeKind::Int => {
            let size = read_i64_at(image, off + INT_SIZE)?;
            int_footprint(usize::try_from(size.unsigned_abs()).unwrap_or(usize::MAX))
        }
        NodeKind::Float => Some(FLOAT_NODE),
        NodeKind::Complex => Some(COMPLEX_NODE),
        NodeKind::Bytes => bytes_footprint(non_negative(read_i64_at(image, off + BYTES_LEN)?, "bytes length", off)?),
        NodeKind::Text => {
            let len = non_negative(read_i64_at(image, off + TEXT_LEN)?, "text length", off)?;
            let state = TextState::decode(crate::utils::read_u32_at(image, off + TEXT_STATE)?)?;
            text_footprint(len, state.width as usize)
        }
        NodeKind::Sequence => seq_footprint(non_negative(read_i64_at(image, off + SEQ_LEN)?, "sequence length", off)?),
        NodeKind::Code => Some(CODE_NODE),
    };
    match size {
        Some(n) if off.checked_add(n).is_some_and(|end| end <= image.len()) => Ok(n),
        _ => Err(SnapError::Corrupt(format!("{kind:?} node at {off:#x} runs past the image"))),
    }
}

/// Offsets (relative to the node) of every reference field of the node at `off`.
pub fn ref_slots(image: &[u8], off: usize, kind: NodeKind) -> Result<Vec<usize>> {
    Ok(match kind {
        NodeKind::Sequence => {
            // bounds the slot count by the image before anything is collected
            node_extent(image, off, kind)?;
            let len = non_negative(read_i64_at(image, off + SEQ_LEN)?, "sequence length", off)?;
            (0..len).map(|i| SEQ_ITEMS + 8 * i).collect()
        }
        NodeKind::Code => CODE_FIELDS.iter().filter(|f| f.is_ref()).map(|f| f.offset).collect(),
        _ => Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn footprints_report_overflow() {
        assert_eq!(seq_footprint(2), Some(SEQ_ITEMS + 16));
        assert_eq!(seq_footprint(usize::MAX / 4), None);
        assert_eq!(int_footprint(usize::MAX / 2), None);
        assert_eq!(bytes_footprint(usize::MAX), None);
        assert_eq!(text_footprint(usize::MAX / 2, 4), None);
    }

    #[test]
    fn code_table_is_dense_and_ordered() {
        let mut scalar_off = CODE_SCALARS;
        let mut ref_off = CODE_REFS;
        for f in CODE_FIELDS.iter() {
            if f.is_ref() {
                assert_eq!(f.offset, ref_off, "{}", f.name);
                ref_off += 8;
            } else {
                assert_eq!(f.offset, scalar_off, "{}", f.name);
                scalar_off += 4;
            }
        }
        assert_eq!(scalar_off, CODE_REFS);
        assert_eq!(ref_off, CODE_FIRST_INSTR);
        assert_eq!(code_field("code").map(|f| f.offset), Some(CODE_BYTECODE_REF));
    }

    #[test]
    fn table_accessors_reach_the_named_field() {
        let mut unit = CodeUnit::new("f", "m.py");
        for f in CODE_FIELDS.iter() {
            if let FieldAccess::Scalar { set, .. } = f.access {
                set(&mut unit, f.offset as i32);
            }
        }
        assert_eq!(unit.argcount, CODE_SCALARS as i32);
        assert_eq!(unit.warmup, (CODE_SCALARS + 44) as i32);
        match &code_field("filename").unwrap().access {
            FieldAccess::Ref { get, .. } => assert_eq!(get(&unit), &Object::str("m.py")),
            _ => panic!("filename is a reference"),
        }
    }

    #[test]
    fn text_state_widths() {
        assert_eq!(TextState::for_max_char('h' as u32), TextState { width: 1, ascii: true });
        assert_eq!(TextState::for_max_char(0xe9), TextState { width: 1, ascii: false });
        assert_eq!(TextState::for_max_char(0x20ac).width, 2);
        assert_eq!(TextState::for_max_char(0x1f600).width, 4);
        let s = TextState { width: 2, ascii: false };
        assert_eq!(TextState::decode(s.encode()).unwrap(), s);
        assert!(TextState::decode(0).is_err());
    }
}
