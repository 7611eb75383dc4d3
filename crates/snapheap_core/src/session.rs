//! Config-driven entry points.
//!
//! `dump` builds an archive when the config asks for one. `share` loads it and
//! turns every failure into `None` so the caller can take its normal path.

use crate::builder::{ArchiveBuilder, BuildSummary};
use crate::config::{ArchiveConfig, ArchiveMode, StrategyKind};
use crate::deferred::{Reconstructor, RejectDeferred};
use crate::errors::Result;
use crate::loader::{LoadedArchive, Loader};
use crate::mapping::{AnyAddress, FixedAddress, MapStrategy};
use crate::object::Object;
use std::path::Path;
use tracing::{debug, warn};

/// Build an archive of `root` if `config` is in dump mode with a path set.
pub fn dump(config: &ArchiveConfig, root: &Object) -> Result<Option<BuildSummary>> {
    if config.mode != ArchiveMode::Dump {
        return Ok(None);
    }
    let Some(path) = config.archive_path.as_deref() else {
        debug!("dump requested without an archive path");
        return Ok(None);
    };
    let summary = match config.strategy {
        StrategyKind::Fixed => build::<FixedAddress>(path, config, root)?,
        StrategyKind::Portable => build::<AnyAddress>(path, config, root)?,
    };
    Ok(Some(summary))
}

fn build<S: MapStrategy>(path: &Path, config: &ArchiveConfig, root: &Object) -> Result<BuildSummary> {
    let mut builder = ArchiveBuilder::<S>::create(path, config)?;
    builder.serialize(root)?;
    builder.finalize()
}

/// Load the archive named by `config` if it is in share mode.
pub fn share(config: &ArchiveConfig) -> Option<LoadedArchive> {
    share_with(config, RejectDeferred)
}

pub fn share_with<R: Reconstructor>(config: &ArchiveConfig, reconstructor: R) -> Option<LoadedArchive> {
    if config.mode != ArchiveMode::Share {
        return None;
    }
    let path = config.archive_path.as_deref()?;
    let res = match config.strategy {
        StrategyKind::Fixed => Loader::<FixedAddress>::new().with_reconstructor(reconstructor).load(path),
        StrategyKind::Portable => Loader::<AnyAddress>::new().with_reconstructor(reconstructor).load(path),
    };
    match res {
        Ok(archive) => Some(archive),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "shared archive unavailable, falling back");
            None
        }
    }
}
