// crates/snapheap_core/src/consts.rs

pub const MAGIC_ARCHIVE: &[u8; 4] = b"SNPH";
pub const VERSION: u16 = 1;

/// Bytes of header fields actually encoded at offset 0.
pub const HDR_FIELDS_SIZE: usize = 88;
/// Bytes reserved for the header; the payload starts here.
pub const HDR_RESERVED: u64 = 4096;

/// Reserved ahead of every allocation (two machine words, like a GC link header).
pub const GC_PREFIX_BYTES: u64 = 16;
pub const ALIGN: u64 = 8;
pub const PAGE_SIZE: u64 = 4096;

pub const DEFAULT_MAX_SIZE: u64 = 256 * 1024 * 1024;
pub const DEFAULT_REQUESTED_ADDR: u64 = 0x2_8000_0000;

/// Size of the common node head: type_ref(8) kind(1) gc_state(1) pad(6).
pub const NODE_HEAD_SIZE: usize = 16;
pub const GC_UNTRACKED: u8 = 0;

/// Cached hash value meaning "not computed yet".
pub const HASH_UNKNOWN: i64 = -1;

/// Size of one archived deferred entry: patch_target, raw, type_ref.
pub const DEFERRED_ENTRY_SIZE: usize = 24;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum NodeKind {
    Int      = 1,
    Float    = 2,
    Complex  = 3,
    Bytes    = 4,
    Text     = 5,
    Sequence = 6,
    Code     = 7,
}

impl NodeKind {
    pub const ALL: [NodeKind; 7] = [
        NodeKind::Int,
        NodeKind::Float,
        NodeKind::Complex,
        NodeKind::Bytes,
        NodeKind::Text,
        NodeKind::Sequence,
        NodeKind::Code,
    ];

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(NodeKind::Int),
            2 => Some(NodeKind::Float),
            3 => Some(NodeKind::Complex),
            4 => Some(NodeKind::Bytes),
            5 => Some(NodeKind::Text),
            6 => Some(NodeKind::Sequence),
            7 => Some(NodeKind::Code),
            _ => None,
        }
    }
}

const _: () = { assert!(HDR_FIELDS_SIZE as u64 <= HDR_RESERVED); };
const _: () = { assert!(HDR_RESERVED % ALIGN == 0 && GC_PREFIX_BYTES % ALIGN == 0); };
