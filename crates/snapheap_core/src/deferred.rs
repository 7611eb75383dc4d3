//! Deferred reconstruction queue.
//!
//! Entries are recorded during move-in for slots whose live value can only be
//! rebuilt after the archive is patched. The archived array holds them in
//! reverse insertion order and the loader walks it back to front, so the
//! earliest recorded (deepest) entries are reconstructed first.
//!
//! Archived entry (LE, 24 bytes): patch_target[8] raw[8] type_ref[8]

use crate::view::ArchiveView;
use crate::errors::{Result, SnapError};
use crate::reference::RefWord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeferredEntry {
    /// Archive address of the reference slot to fill.
    pub patch_target: u64,
    /// Archived raw form the live value is rebuilt from.
    pub raw: RefWord,
    /// Address of the type descriptor that knows how to rebuild it.
    pub type_ref: u64,
}

/// Build-side list, in insertion order.
#[derive(Debug, Default)]
pub struct DeferredList {
    entries: Vec<DeferredEntry>,
}

impl DeferredList {
    pub fn new() -> Self { Self::default() }
    pub fn push(&mut self, e: DeferredEntry) { self.entries.push(e); }
    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Entries in the order they are archived: newest first.
    pub fn flattened(&self) -> impl Iterator<Item = &DeferredEntry> {
        self.entries.iter().rev()
    }
}

/// Turns an archived deferred entry into the word stored at its patch target.
pub trait Reconstructor {
    fn reconstruct(&mut self, view: &ArchiveView<'_>, entry: &DeferredEntry) -> Result<RefWord>;
}

/// Default: archives are expected to carry no deferred entries.
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectDeferred;

impl Reconstructor for RejectDeferred {
    fn reconstruct(&mut self, _view: &ArchiveView<'_>, _entry: &DeferredEntry) -> Result<RefWord> {
        Err(SnapError::DeferredUnresolved(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flattened_is_reverse_insertion() {
        let mut l = DeferredList::new();
        for i in 1..=3u64 {
            l.push(DeferredEntry { patch_target: i * 8, raw: RefWord::NULL, type_ref: 0 });
        }
        let order: Vec<u64> = l.flattened().map(|e| e.patch_target).collect();
        assert_eq!(order, vec![24, 16, 8]);
        assert_eq!(l.len(), 3);
    }
}
