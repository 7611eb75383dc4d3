pub mod consts;
pub mod errors;
pub mod utils;
pub mod runtime;
pub mod object;
pub mod header;
pub mod alloc;
pub mod reference;
pub mod codec;
pub mod serialize;
pub mod deferred;
pub mod mapping;
pub mod builder;
pub mod relocate;
pub mod loader;
pub mod view;
pub mod config;
pub mod session;
pub mod trace;

pub use builder::{ArchiveBuilder, BuildSummary};
pub use config::{ArchiveConfig, ArchiveMode, StrategyKind};
pub use consts::NodeKind;
pub use deferred::{DeferredEntry, Reconstructor, RejectDeferred};
pub use errors::{Result, SnapError};
pub use header::ArchiveHeader;
pub use loader::{LoadState, LoadedArchive, Loader};
pub use mapping::{AnyAddress, FixedAddress, MapStrategy};
pub use object::{CodeUnit, Int, Object};
pub use reference::RefWord;
pub use relocate::{relocate_image, Relocation, RelocationStats};
pub use view::{ArchiveView, Archived};
