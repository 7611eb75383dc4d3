//! Archive loader: header probe, private mapping, relocation, deferred resolution.

use crate::consts::{DEFERRED_ENTRY_SIZE, PAGE_SIZE};
use crate::deferred::{DeferredEntry, Reconstructor, RejectDeferred};
use crate::errors::{Result, SnapError};
use crate::header::ArchiveHeader;
use crate::mapping::{FixedAddress, MapStrategy, Mapping};
use crate::object::Object;
use crate::reference::RefWord;
use crate::runtime::Sentinel;
use crate::relocate::{relocate_image, Relocation, RelocationStats};
use crate::utils::{align_up, read_u64_at, write_u64_at};
use crate::view::{ArchiveView, Archived};
use serde::Serialize;
use std::fs::File;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoadState {
    Unopened,
    HeaderRead,
    Mapped,
    Relocated,
    Ready,
    Failed,
}

pub struct Loader<S: MapStrategy = FixedAddress, R: Reconstructor = RejectDeferred> {
    strategy: S,
    reconstructor: R,
    state: LoadState,
}

impl<S: MapStrategy> Loader<S, RejectDeferred> {
    pub fn new() -> Self {
        Self { strategy: S::default(), reconstructor: RejectDeferred, state: LoadState::Unopened }
    }
}

impl<S: MapStrategy> Default for Loader<S, RejectDeferred> {
    fn default() -> Self { Self::new() }
}

impl<S: MapStrategy, R: Reconstructor> Loader<S, R> {
    pub fn with_reconstructor<R2: Reconstructor>(self, reconstructor: R2) -> Loader<S, R2> {
        Loader { strategy: self.strategy, reconstructor, state: self.state }
    }

    /// State reached by the last `load` call.
    pub fn state(&self) -> LoadState { self.state }

    pub fn reconstructor(&self) -> &R { &self.reconstructor }

    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<LoadedArchive> {
        let path = path.as_ref();
        self.state = LoadState::Unopened;
        match self.try_load(path) {
            Ok(archive) => {
                self.state = LoadState::Ready;
                Ok(archive)
            }
            Err(e) => {
                warn!(path = %path.display(), stage = ?self.state, error = %e, "archive load failed");
                self.state = LoadState::Failed;
                Err(e)
            }
        }
    }

    fn try_load(&mut self, path: &Path) -> Result<LoadedArchive> {
        let t0 = Instant::now();
        let mut file = File::open(path)?;
        let mut header = ArchiveHeader::read_from(&mut file)?;
        header.validate()?;
        let file_len = file.metadata()?.len();
        if file_len < header.used_bytes {
            return Err(SnapError::BadHeader(format!("file holds {file_len} bytes, header claims {}", header.used_bytes)));
        }
        // checked before anything is mapped or written
        let runtime_delta = Relocation::runtime_delta(&header)?;
        self.state = LoadState::HeaderRead;

        let t1 = Instant::now();
        let mut mapping = self.strategy.map_for_load(&file, align_up(header.used_bytes, PAGE_SIZE), header.mapped_base)?;
        drop(file);
        self.state = LoadState::Mapped;

        let t2 = Instant::now();
        let reloc = Relocation {
            archive_delta: mapping.base().wrapping_sub(header.mapped_base) as i64,
            runtime_delta,
        };
        let used = header.used_bytes as usize;
        let stats = relocate_image(&mut mapping.as_mut_slice()[..used], &mut header, reloc, true)?;
        self.state = LoadState::Relocated;

        let t3 = Instant::now();
        let resolved = self.resolve_deferred(&mut mapping, &header)?;

        info!(
            path = %path.display(),
            strategy = self.strategy.name(),
            base = %format!("{:#x}", header.mapped_base),
            used = header.used_bytes,
            relocated = !stats.skipped,
            nodes = stats.nodes,
            deferred = resolved,
            probe_ns = (t1 - t0).as_nanos() as u64,
            map_ns = (t2 - t1).as_nanos() as u64,
            patch_ns = (t3 - t2).as_nanos() as u64,
            total_ns = t0.elapsed().as_nanos() as u64,
            "archive loaded"
        );
        Ok(LoadedArchive { mapping, header, stats, deferred_resolved: resolved })
    }

    /// Hand every archived deferred entry to the reconstructor, last array
    /// slot first, and store the returned word at its patch target.
    fn resolve_deferred(&mut self, mapping: &mut Mapping, header: &ArchiveHeader) -> Result<usize> {
        let count = header.serialized_count as usize;
        if count == 0 {
            return Ok(0);
        }
        let used = header.used_bytes as usize;
        let mut patches = Vec::with_capacity(count);
        {
            let view = ArchiveView::new(&mapping.as_slice()[..used], header.mapped_base);
            let arr = view.offset_of(header.serialized_array)?;
            for i in (0..count).rev() {
                let at = arr + i * DEFERRED_ENTRY_SIZE;
                let entry = DeferredEntry {
                    patch_target: read_u64_at(view.image(), at)?,
                    raw: RefWord(read_u64_at(view.image(), at + 8)?),
                    type_ref: read_u64_at(view.image(), at + 16)?,
                };
                let word = self.reconstructor.reconstruct(&view, &entry).map_err(|e| match e {
                    SnapError::DeferredUnresolved(_) => SnapError::DeferredUnresolved(i + 1),
                    other => other,
                })?;
                patches.push((view.offset_of(entry.patch_target)?, word));
            }
        }
        let image = mapping.as_mut_slice();
        for (off, word) in &patches {
            write_u64_at(image, *off, word.0);
        }
        debug!(count, "deferred entries resolved");
        Ok(patches.len())
    }
}

/// A mapped, relocated archive. The mapping lives as long as this value.
#[derive(Debug)]
pub struct LoadedArchive {
    mapping: Mapping,
    header: ArchiveHeader,
    stats: RelocationStats,
    deferred_resolved: usize,
}

impl LoadedArchive {
    /// Header with live addresses (base, sentinels, root) after relocation.
    pub fn header(&self) -> &ArchiveHeader { &self.header }
    pub fn stats(&self) -> RelocationStats { self.stats }
    pub fn base(&self) -> u64 { self.mapping.base() }
    pub fn deferred_resolved(&self) -> usize { self.deferred_resolved }

    pub fn view(&self) -> ArchiveView<'_> {
        ArchiveView::new(&self.mapping.as_slice()[..self.header.used_bytes as usize], self.mapping.base())
    }

    /// Whether `addr` lies inside the archive's used bytes.
    pub fn contains(&self, addr: u64) -> bool {
        addr.checked_sub(self.base()).is_some_and(|off| off < self.header.used_bytes)
    }

    /// The archived root. An archive finalized without a root reads as `Absent`.
    pub fn root(&self) -> Result<Archived<'_>> {
        match RefWord(self.header.root) {
            RefWord::NULL => Ok(Archived::Sentinel(Sentinel::Absent)),
            w => self.view().resolve(w),
        }
    }

    pub fn root_object(&self) -> Result<Object> {
        self.root()?.to_object()
    }
}
