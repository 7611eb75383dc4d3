//! Relocator: patches an archive image after it is mapped.
//!
//! Two independent shifts apply:
//! - `runtime_delta` moves every type reference (the host binary's statics moved);
//! - `archive_delta` moves every node reference (the archive itself moved).
//!
//! Sentinel words are tags and never change. The walk is iterative and visits
//! each node once; every offset it follows is bounds-checked against `used_bytes`.

use crate::codec::{node_extent, node_kind, ref_slots, CODE_FIRST_INSTR, HEAD_TYPE};
use crate::consts::{NodeKind, DEFERRED_ENTRY_SIZE, HDR_RESERVED};
use crate::errors::{Result, SnapError};
use crate::header::{ArchiveHeader, OFF_ROOT, OFF_SERIALIZED_ARRAY};
use crate::reference::RefWord;
use crate::runtime::{sentinel_addresses, type_address};
use crate::serialize::first_instr_for;
use crate::utils::{read_u64_at, write_u64_at};
use serde::Serialize;
use std::collections::HashSet;
use tracing::debug;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Relocation {
    pub archive_delta: i64,
    pub runtime_delta: i64,
}

impl Relocation {
    /// Runtime shift of this process relative to the one that built `header`.
    /// All four sentinels must have moved by the same amount.
    pub fn runtime_delta(header: &ArchiveHeader) -> Result<i64> {
        let live = sentinel_addresses();
        let mut deltas = live.iter().zip(header.sentinels.iter()).map(|(l, r)| l.wrapping_sub(*r) as i64);
        let first = deltas.next().unwrap_or(0);
        if deltas.any(|d| d != first) {
            return Err(SnapError::ShiftMismatch);
        }
        Ok(first)
    }

    /// Both shifts for an archive recorded by `header` and mapped at `actual_base`.
    pub fn compute(header: &ArchiveHeader, actual_base: u64) -> Result<Self> {
        Ok(Self {
            archive_delta: actual_base.wrapping_sub(header.mapped_base) as i64,
            runtime_delta: Self::runtime_delta(header)?,
        })
    }

    pub fn is_identity(&self) -> bool { self.archive_delta == 0 && self.runtime_delta == 0 }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RelocationStats {
    pub skipped: bool,
    pub nodes: u64,
    pub node_refs: u64,
    pub type_refs: u64,
    pub deferred_entries: u64,
}

struct Walk<'a> {
    image: &'a mut [u8],
    used: usize,
    new_base: u64,
    reloc: Relocation,
    validate: bool,
    visited: HashSet<usize>,
    work: Vec<usize>,
    stats: RelocationStats,
}

impl Walk<'_> {
    fn offset_of(&self, addr: u64) -> Result<usize> {
        match addr.checked_sub(self.new_base) {
            Some(off) if off >= HDR_RESERVED && (off as usize) < self.used && off % 8 == 0 => Ok(off as usize),
            _ => Err(SnapError::Corrupt(format!("reference {addr:#x} outside archive at {:#x}", self.new_base))),
        }
    }

    /// Shift the reference word stored at `at` and queue its node.
    fn patch_ref(&mut self, at: usize) -> Result<()> {
        let w = RefWord(read_u64_at(self.image, at)?);
        if w.target().is_none() {
            return Err(SnapError::Corrupt(format!("bad reference word {:#x} at {at:#x}", w.0)));
        }
        if !w.is_node() {
            return Ok(());
        }
        let nw = w.shifted(self.reloc.archive_delta);
        if nw != w {
            write_u64_at(self.image, at, nw.0);
        }
        self.stats.node_refs += 1;
        let off = self.offset_of(nw.0)?;
        self.work.push(off);
        Ok(())
    }

    fn patch_type(&mut self, at: usize, kind: Option<NodeKind>) -> Result<()> {
        let old = read_u64_at(self.image, at)?;
        let new = old.wrapping_add(self.reloc.runtime_delta as u64);
        if new != old {
            write_u64_at(self.image, at, new);
        }
        self.stats.type_refs += 1;
        if let (true, Some(kind)) = (self.validate, kind) {
            let expected = type_address(kind);
            if new != expected {
                return Err(SnapError::TypeMismatch { found: new, expected });
            }
        }
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        while let Some(off) = self.work.pop() {
            if !self.visited.insert(off) {
                continue;
            }
            let kind = node_kind(self.image, off)?;
            let end = off.checked_add(node_extent(self.image, off, kind)?);
            if end.map_or(true, |end| end > self.used) {
                return Err(SnapError::Corrupt(format!("{kind:?} node at {off:#x} runs past used bytes")));
            }
            self.patch_type(off + HEAD_TYPE, Some(kind))?;
            for slot in ref_slots(self.image, off, kind)? {
                self.patch_ref(off + slot)?;
            }
            if kind == NodeKind::Code {
                let fi = first_instr_for(self.image, self.new_base, off)?;
                write_u64_at(self.image, off + CODE_FIRST_INSTR, fi);
            }
            self.stats.nodes += 1;
        }
        Ok(())
    }
}

/// Patch `image` (the whole mapped archive, header included) in place.
///
/// `header` is updated to the live addresses and written back into the image
/// fields it mirrors; the stored crc is left as built. With `validate`, every
/// patched type reference must equal the live descriptor for its node kind.
pub fn relocate_image(image: &mut [u8], header: &mut ArchiveHeader, reloc: Relocation, validate: bool) -> Result<RelocationStats> {
    let used = usize::try_from(header.used_bytes).map_err(|_| SnapError::Corrupt("used_bytes overflow".into()))?;
    if used > image.len() {
        return Err(SnapError::Corrupt(format!("used_bytes {used} beyond mapped {}", image.len())));
    }
    if reloc.is_identity() {
        return Ok(RelocationStats { skipped: true, ..Default::default() });
    }
    let new_base = header.mapped_base.wrapping_add(reloc.archive_delta as u64);
    let mut walk = Walk {
        image: &mut *image,
        used,
        new_base,
        reloc,
        validate,
        visited: HashSet::new(),
        work: Vec::new(),
        stats: RelocationStats::default(),
    };

    let root = RefWord(header.root).shifted(reloc.archive_delta);
    if root.target().is_none() {
        return Err(SnapError::Corrupt(format!("bad root word {:#x}", header.root)));
    }
    if root.is_node() {
        let off = walk.offset_of(root.0)?;
        walk.work.push(off);
    }

    let array = RefWord(header.serialized_array).shifted(reloc.archive_delta);
    if header.serialized_count > 0 {
        let arr_off = walk.offset_of(array.0)?;
        let count = header.serialized_count as usize;
        if arr_off + count * DEFERRED_ENTRY_SIZE > used {
            return Err(SnapError::Corrupt("deferred array runs past used bytes".into()));
        }
        for i in 0..count {
            let at = arr_off + i * DEFERRED_ENTRY_SIZE;
            let target = read_u64_at(walk.image, at)?.wrapping_add(reloc.archive_delta as u64);
            walk.offset_of(target)?;
            write_u64_at(walk.image, at, target);
            walk.patch_ref(at + 8)?;
            walk.patch_type(at + 16, None)?;
            walk.stats.deferred_entries += 1;
        }
    }

    walk.run()?;
    let stats = walk.stats;

    header.mapped_base = new_base;
    header.root = root.0;
    header.serialized_array = array.0;
    for s in header.sentinels.iter_mut() {
        *s = s.wrapping_add(reloc.runtime_delta as u64);
    }
    write_u64_at(image, 0, header.mapped_base);
    for (i, s) in header.sentinels.iter().enumerate() {
        write_u64_at(image, 8 + 8 * i, *s);
    }
    write_u64_at(image, OFF_ROOT, header.root);
    write_u64_at(image, OFF_SERIALIZED_ARRAY, header.serialized_array);
    debug!(?reloc, nodes = stats.nodes, node_refs = stats.node_refs, type_refs = stats.type_refs, "relocated");
    Ok(stats)
}
