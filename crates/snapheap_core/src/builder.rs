//! Archive builder.
//!
//! The archive is built in a temp file next to the destination, mapped shared
//! at the requested address, and published with an atomic rename by
//! `finalize`. Dropping a builder without finalizing leaves nothing behind.

use crate::alloc::BumpAllocator;
use crate::config::ArchiveConfig;
use crate::consts::{NodeKind, HDR_FIELDS_SIZE, HDR_RESERVED};
use crate::deferred::{DeferredEntry, DeferredList};
use crate::errors::{Result, SnapError};
use crate::header::ArchiveHeader;
use crate::mapping::{FixedAddress, MapStrategy, Mapping};
use crate::object::Object;
use crate::reference::RefWord;
use crate::runtime::sentinel_addresses;
use crate::serialize::MoveIn;
use crate::trace::TraceSink;
use crate::utils::fsync_dir;
use serde::Serialize;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildSummary {
    pub path: PathBuf,
    pub mapped_base: u64,
    pub used_bytes: u64,
    pub nodes: u64,
    pub allocations: u64,
    pub deferred: i32,
    pub root: u64,
    pub elapsed_us: u64,
}

pub struct ArchiveBuilder<S: MapStrategy = FixedAddress> {
    path_final: PathBuf,
    map: Mapping,
    tmp: NamedTempFile,
    header: ArchiveHeader,
    alloc: BumpAllocator,
    deferred: DeferredList,
    trace: Option<TraceSink>,
    nodes: u64,
    abandoned: bool,
    started: Instant,
    _strategy: PhantomData<S>,
}

impl<S: MapStrategy> ArchiveBuilder<S> {
    /// Create the archive region for `path` sized to `cfg.max_size`.
    pub fn create(path: impl AsRef<Path>, cfg: &ArchiveConfig) -> Result<Self> {
        cfg.validate()?;
        let started = Instant::now();
        let path_final = path.as_ref().to_path_buf();
        let dir = match path_final.parent() {
            Some(d) if !d.as_os_str().is_empty() => d,
            _ => Path::new("."),
        };
        let tmp = tempfile::Builder::new().prefix("snapheap_").tempfile_in(dir)?;
        tmp.as_file().set_len(cfg.max_size)?;

        let strategy = S::default();
        let mut map = strategy.map_for_build(tmp.as_file(), cfg.max_size, cfg.requested_address)?;
        let header = ArchiveHeader::new(map.base(), sentinel_addresses());
        map.as_mut_slice()[..HDR_FIELDS_SIZE].copy_from_slice(&header.encode());

        let trace = cfg.trace_path.as_ref().map(|p| TraceSink::create(p)).transpose()?;
        debug!(
            path = %path_final.display(),
            strategy = strategy.name(),
            base = %format!("{:#x}", map.base()),
            max = cfg.max_size,
            "archive created"
        );
        Ok(Self {
            path_final,
            map,
            tmp,
            header,
            alloc: BumpAllocator::new(cfg.max_size),
            deferred: DeferredList::new(),
            trace,
            nodes: 0,
            abandoned: false,
            started,
            _strategy: PhantomData,
        })
    }

    pub fn base(&self) -> u64 { self.map.base() }
    pub fn used(&self) -> u64 { self.alloc.used() }
    pub fn header(&self) -> &ArchiveHeader { &self.header }

    /// Move `root` into the archive and record it as the archive root.
    /// Any failure abandons the build.
    pub fn serialize(&mut self, root: &Object) -> Result<RefWord> {
        if self.abandoned {
            return Err(SnapError::Abandoned);
        }
        let base = self.map.base();
        let res = {
            let mut m = MoveIn::new(self.map.as_mut_slice(), base, &mut self.alloc, &mut self.deferred)?;
            if let Some(t) = self.trace.as_mut() {
                m = m.with_trace(t);
            }
            m.move_in(root).map(|w| (w, m.nodes()))
        };
        match res {
            Ok((w, nodes)) => {
                self.nodes += nodes;
                self.header.root = w.0;
                Ok(w)
            }
            Err(e) => {
                warn!(error = %e, "archive build abandoned");
                self.abandoned = true;
                Err(e)
            }
        }
    }

    /// Record a slot inside the archive to be filled by the loader's reconstructor.
    pub fn defer(&mut self, patch_target: u64, raw: RefWord, kind: NodeKind) -> Result<DeferredEntry> {
        if self.abandoned {
            return Err(SnapError::Abandoned);
        }
        let base = self.map.base();
        if patch_target < base + HDR_RESERVED || patch_target >= base + self.alloc.used() || patch_target % 8 != 0 {
            return Err(SnapError::Corrupt(format!("deferred slot {patch_target:#x} outside archive")));
        }
        Ok(MoveIn::new(self.map.as_mut_slice(), base, &mut self.alloc, &mut self.deferred)?.defer(patch_target, raw, kind))
    }

    /// Write the deferred array and header, then truncate to `used_bytes` and publish.
    pub fn finalize(mut self) -> Result<BuildSummary> {
        if self.abandoned {
            return Err(SnapError::Abandoned);
        }
        let base = self.map.base();
        let (array, count) =
            MoveIn::new(self.map.as_mut_slice(), base, &mut self.alloc, &mut self.deferred)?.finish_deferred()?;
        self.header.serialized_array = array.0;
        self.header.serialized_count = count;
        self.header.used_bytes = self.alloc.used();
        self.map.as_mut_slice()[..HDR_FIELDS_SIZE].copy_from_slice(&self.header.encode());
        self.map.flush()?;
        if let Some(t) = self.trace.as_mut() {
            t.flush()?;
        }

        let Self { path_final, map, tmp, header, alloc, nodes, started, .. } = self;
        drop(map);
        tmp.as_file().set_len(header.used_bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path_final)?;
        let _ = fsync_dir(&path_final);

        let summary = BuildSummary {
            path: path_final,
            mapped_base: header.mapped_base,
            used_bytes: header.used_bytes,
            nodes,
            allocations: alloc.allocations(),
            deferred: header.serialized_count,
            root: header.root,
            elapsed_us: started.elapsed().as_micros() as u64,
        };
        info!(
            path = %summary.path.display(),
            base = %format!("{:#x}", summary.mapped_base),
            used = summary.used_bytes,
            nodes = summary.nodes,
            deferred = summary.deferred,
            elapsed_us = summary.elapsed_us,
            "archive written"
        );
        Ok(summary)
    }
}
