//! Host-runtime shim: process-global singletons and type descriptors.
//!
//! Archives store the addresses of these statics. They live in the binary's
//! data segment, so their addresses move together when the loader process is
//! placed at a different base (ASLR); comparing a recorded address with the
//! live one yields the runtime shift.

use crate::consts::NodeKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sentinel {
    Absent,
    True,
    False,
    Ellipsis,
}

impl Sentinel {
    pub const ALL: [Sentinel; 4] = [Sentinel::Absent, Sentinel::True, Sentinel::False, Sentinel::Ellipsis];

    pub fn index(self) -> usize {
        match self {
            Sentinel::Absent => 0,
            Sentinel::True => 1,
            Sentinel::False => 2,
            Sentinel::Ellipsis => 3,
        }
    }

    pub fn from_index(i: u64) -> Option<Self> {
        Self::ALL.get(i as usize).copied()
    }

    /// The live singleton for this sentinel.
    pub fn object(self) -> &'static SentinelObject {
        &SENTINELS[self.index()]
    }

    pub fn address(self) -> u64 {
        self.object() as *const SentinelObject as u64
    }
}

#[derive(Debug)]
pub struct SentinelObject {
    pub name: &'static str,
    pub sentinel: Sentinel,
}

static SENTINELS: [SentinelObject; 4] = [
    SentinelObject { name: "None", sentinel: Sentinel::Absent },
    SentinelObject { name: "True", sentinel: Sentinel::True },
    SentinelObject { name: "False", sentinel: Sentinel::False },
    SentinelObject { name: "Ellipsis", sentinel: Sentinel::Ellipsis },
];

/// Live addresses of all four singletons, in header order.
pub fn sentinel_addresses() -> [u64; 4] {
    Sentinel::ALL.map(Sentinel::address)
}

#[derive(Debug)]
pub struct TypeDescriptor {
    pub name: &'static str,
    pub kind: NodeKind,
}

static TYPES: [TypeDescriptor; 7] = [
    TypeDescriptor { name: "int", kind: NodeKind::Int },
    TypeDescriptor { name: "float", kind: NodeKind::Float },
    TypeDescriptor { name: "complex", kind: NodeKind::Complex },
    TypeDescriptor { name: "bytes", kind: NodeKind::Bytes },
    TypeDescriptor { name: "str", kind: NodeKind::Text },
    TypeDescriptor { name: "tuple", kind: NodeKind::Sequence },
    TypeDescriptor { name: "code", kind: NodeKind::Code },
];

pub fn type_descriptor(kind: NodeKind) -> &'static TypeDescriptor {
    &TYPES[kind as usize - 1]
}

pub fn type_address(kind: NodeKind) -> u64 {
    type_descriptor(kind) as *const TypeDescriptor as u64
}

/// Reverse lookup used to validate patched type references.
pub fn descriptor_at(addr: u64) -> Option<&'static TypeDescriptor> {
    TYPES.iter().find(|t| *t as *const TypeDescriptor as u64 == addr)
}
