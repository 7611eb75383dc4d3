use crate::runtime::Sentinel;

/// One archived reference field.
///
/// `0` is null, an odd word is a sentinel tag `(index << 1) | 1`, anything else
/// is the 8-byte aligned address of a node inside the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RefWord(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefTarget {
    Null,
    Sentinel(Sentinel),
    Node(u64),
}

impl RefWord {
    pub const NULL: RefWord = RefWord(0);

    pub fn sentinel(s: Sentinel) -> Self {
        RefWord(((s.index() as u64) << 1) | 1)
    }

    pub fn node(addr: u64) -> Self {
        debug_assert!(addr != 0 && addr % 8 == 0);
        RefWord(addr)
    }

    pub fn is_node(self) -> bool { self.0 != 0 && self.0 & 1 == 0 }

    /// `None` for an odd word whose tag names no sentinel.
    pub fn target(self) -> Option<RefTarget> {
        match self.0 {
            0 => Some(RefTarget::Null),
            w if w & 1 == 1 => Sentinel::from_index(w >> 1).map(RefTarget::Sentinel),
            w => Some(RefTarget::Node(w)),
        }
    }

    /// Shift a node reference by `delta`; null and sentinel words are identity.
    pub fn shifted(self, delta: i64) -> Self {
        if self.is_node() { RefWord(self.0.wrapping_add(delta as u64)) } else { self }
    }
}
