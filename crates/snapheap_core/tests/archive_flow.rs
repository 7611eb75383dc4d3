use snapheap_core::codec::SEQ_ITEMS;
use snapheap_core::runtime::{sentinel_addresses, Sentinel};
use snapheap_core::view::{ArchiveView, Archived};
use snapheap_core::{
    relocate_image, AnyAddress, ArchiveBuilder, ArchiveConfig, ArchiveHeader, CodeUnit, DeferredEntry, FixedAddress,
    Int, LoadState, Loader, NodeKind, Object, Reconstructor, RefWord, Relocation, SnapError,
};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tempfile::tempdir;

static NEXT: AtomicU64 = AtomicU64::new(0);

/// A distinct, page-aligned base per test so parallel tests never collide.
fn config() -> ArchiveConfig {
    let n = NEXT.fetch_add(1, Ordering::Relaxed);
    ArchiveConfig { max_size: 16 << 20, requested_address: 0x3_0000_0000 + n * 0x1000_0000, ..Default::default() }
}

fn build_fixed(path: &Path, cfg: &ArchiveConfig, root: &Object) {
    let mut b = ArchiveBuilder::<FixedAddress>::create(path, cfg).unwrap();
    b.serialize(root).unwrap();
    b.finalize().unwrap();
}

fn sample_code() -> CodeUnit {
    let mut unit = CodeUnit::new("main", "demo.py");
    unit.argcount = 1;
    unit.stacksize = 4;
    unit.code = Object::Bytes(vec![0x97, 0x00, 0x64, 0x00, 0x53, 0x00]);
    unit.consts = Object::tuple(vec![
        Object::int(1),
        Object::str("hi"),
        Object::Absent,
        Object::tuple(vec![Object::int(2), Object::int(3)]),
    ]);
    unit.names = Object::tuple(vec![Object::str("print")]);
    unit
}

fn every_kind() -> Vec<Object> {
    vec![
        Object::int(0),
        Object::int(-42),
        Object::Int(Int::parse("123456789012345678901234567890").unwrap()),
        Object::Float(3.25),
        Object::Complex { real: 1.0, imag: -0.5 },
        Object::Bytes(b"raw\x00bytes".to_vec()),
        Object::str(""),
        Object::str("ascii"),
        Object::str("latin é"),
        Object::str("bmp €"),
        Object::str("astral 😀"),
        Object::tuple(vec![]),
        Object::Code(Box::new(sample_code())),
        Object::Bool(true),
        Object::Ellipsis,
    ]
}

#[test]
fn round_trip_every_kind_at_fixed_address() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("heap.snap");
    let cfg = config();
    for obj in every_kind() {
        build_fixed(&path, &cfg, &obj);
        let mut loader = Loader::<FixedAddress>::new();
        let archive = loader.load(&path).unwrap();
        assert_eq!(loader.state(), LoadState::Ready);
        assert!(archive.stats().skipped, "same process and address needs no patching");
        assert_eq!(archive.base(), cfg.requested_address);
        assert_eq!(archive.root_object().unwrap(), obj);
    }
}

#[test]
fn round_trip_with_archive_shift() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("heap.snap");
    let root = Object::tuple(every_kind());
    let mut b = ArchiveBuilder::<AnyAddress>::create(&path, &config()).unwrap();
    b.serialize(&root).unwrap();
    let summary = b.finalize().unwrap();

    // the first mapping holds the recorded range, so the second one must move
    let first = Loader::<AnyAddress>::new().load(&path).unwrap();
    let second = Loader::<AnyAddress>::new().load(&path).unwrap();
    assert_ne!(first.base(), second.base());
    let moved = if first.base() == summary.mapped_base { &second } else { &first };
    assert!(!moved.stats().skipped);
    assert_eq!(moved.stats().nodes, summary.nodes);
    assert_eq!(moved.header().mapped_base, moved.base());
    assert_eq!(first.root_object().unwrap(), root);
    assert_eq!(second.root_object().unwrap(), root);
}

#[test]
fn simulated_runtime_shift_is_patched_back() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("heap.snap");
    let root = Object::tuple(vec![Object::Code(Box::new(sample_code())), Object::Float(1.5)]);
    build_fixed(&path, &config(), &root);

    // pretend the archive was built by a process whose statics sat 64 KiB higher
    let skew = 0x1_0000i64;
    let mut bytes = std::fs::read(&path).unwrap();
    let mut header = ArchiveHeader::decode(&bytes).unwrap();
    relocate_image(&mut bytes, &mut header, Relocation { archive_delta: 0, runtime_delta: skew }, false).unwrap();
    bytes[..88].copy_from_slice(&header.encode());
    std::fs::write(&path, &bytes).unwrap();

    let mut loader = Loader::<FixedAddress>::new();
    let archive = loader.load(&path).unwrap();
    let stats = archive.stats();
    assert!(!stats.skipped);
    assert_eq!(stats.type_refs, stats.nodes);
    assert_eq!(archive.header().sentinels, sentinel_addresses());
    assert_eq!(archive.root_object().unwrap(), root);
}

#[test]
fn inconsistent_sentinels_fail_before_mapping() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("heap.snap");
    build_fixed(&path, &config(), &Object::int(5));
    let mut bytes = std::fs::read(&path).unwrap();
    let mut header = ArchiveHeader::decode(&bytes).unwrap();
    header.sentinels[3] += 16;
    bytes[..88].copy_from_slice(&header.encode());
    std::fs::write(&path, &bytes).unwrap();

    let mut loader = Loader::<FixedAddress>::new();
    assert!(matches!(loader.load(&path), Err(SnapError::ShiftMismatch)));
    assert_eq!(loader.state(), LoadState::Failed);
}

#[test]
fn finalize_is_deterministic() {
    let tmp = tempdir().unwrap();
    let cfg = config();
    let root = Object::tuple(every_kind());
    let a = tmp.path().join("a.snap");
    let b = tmp.path().join("b.snap");
    build_fixed(&a, &cfg, &root);
    build_fixed(&b, &cfg, &root);
    let (a, b) = (std::fs::read(a).unwrap(), std::fs::read(b).unwrap());
    assert_eq!(a.len() as u64, ArchiveHeader::decode(&a).unwrap().used_bytes);
    assert_eq!(a, b);
}

#[test]
fn sentinels_resolve_to_live_singletons() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("heap.snap");
    let root = Object::tuple(vec![Object::Absent, Object::Bool(true), Object::Bool(false), Object::Ellipsis]);
    let mut b = ArchiveBuilder::<FixedAddress>::create(&path, &config()).unwrap();
    b.serialize(&root).unwrap();
    let summary = b.finalize().unwrap();
    assert_eq!(summary.allocations, 1, "only the tuple allocates");

    let archive = Loader::<FixedAddress>::new().load(&path).unwrap();
    let Archived::Sequence(seq) = archive.root().unwrap() else { panic!("root is a tuple") };
    for (i, item) in seq.iter().enumerate() {
        let Archived::Sentinel(s) = item.unwrap() else { panic!("item {i} is a sentinel") };
        assert_eq!(s, Sentinel::ALL[i]);
        assert!(std::ptr::eq(s.object(), Sentinel::ALL[i].object()));
    }
}

#[test]
fn code_object_constants_survive() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("heap.snap");
    let root = Object::Code(Box::new(sample_code()));
    build_fixed(&path, &config(), &root);

    let archive = Loader::<FixedAddress>::new().load(&path).unwrap();
    let Archived::Code(code) = archive.root().unwrap() else { panic!("root is a code unit") };
    assert_eq!(code.scalar("argcount"), Some(1));
    assert_eq!(code.scalar("stacksize"), Some(4));
    let consts = code.field("consts").unwrap().unwrap().to_object().unwrap();
    assert_eq!(consts.repr(), "(1, 'hi', None, (2, 3))");
    let bytecode = code.bytecode().unwrap();
    assert_eq!(code.first_instr(), bytecode.as_ptr() as u64);
    assert_eq!(archive.root_object().unwrap(), root);
}

#[test]
fn fixed_load_over_occupied_range_fails() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("heap.snap");
    build_fixed(&path, &config(), &Object::str("occupied"));

    let mut first = Loader::<FixedAddress>::new();
    let held = first.load(&path).unwrap();
    assert_eq!(first.state(), LoadState::Ready);

    let mut second = Loader::<FixedAddress>::new();
    let err = second.load(&path).unwrap_err();
    assert!(matches!(err, SnapError::MapFailed { .. } | SnapError::Relocated { .. }), "{err}");
    assert_eq!(second.state(), LoadState::Failed);
    drop(held);

    assert!(second.load(&path).is_ok());
    assert_eq!(second.state(), LoadState::Ready);
}

#[test]
fn capacity_overflow_abandons_build() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("heap.snap");
    let cfg = ArchiveConfig { max_size: 8192, ..config() };
    let mut b = ArchiveBuilder::<FixedAddress>::create(&path, &cfg).unwrap();
    b.serialize(&Object::Bytes(vec![1; 1000])).unwrap();
    let used = b.used();
    let err = b.serialize(&Object::Bytes(vec![2; 8000])).unwrap_err();
    assert!(matches!(err, SnapError::Capacity { max: 8192, .. }));
    assert_eq!(b.used(), used);
    assert!(matches!(b.serialize(&Object::int(1)), Err(SnapError::Abandoned)));
    assert!(matches!(b.finalize(), Err(SnapError::Abandoned)));
    assert!(!path.exists());
}

#[test]
fn unsupported_kind_abandons_build() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("heap.snap");
    let mut b = ArchiveBuilder::<FixedAddress>::create(&path, &config()).unwrap();
    let root = Object::tuple(vec![Object::int(1), Object::Dict(vec![(Object::str("k"), Object::int(2))])]);
    assert!(matches!(b.serialize(&root), Err(SnapError::Unsupported("dict"))));
    drop(b);
    assert!(!path.exists());
}

#[test]
fn truncated_archive_is_rejected() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("heap.snap");
    build_fixed(&path, &config(), &Object::tuple(vec![Object::int(7); 8]));
    let bytes = std::fs::read(&path).unwrap();
    std::fs::write(&path, &bytes[..bytes.len() - 8]).unwrap();
    assert!(matches!(Loader::<FixedAddress>::new().load(&path), Err(SnapError::BadHeader(_))));
    std::fs::write(&path, &bytes[..40]).unwrap();
    assert!(matches!(Loader::<FixedAddress>::new().load(&path), Err(SnapError::BadHeader(_))));
}

#[derive(Default)]
struct Recorder {
    seen: Vec<u64>,
}

impl Reconstructor for Recorder {
    fn reconstruct(&mut self, view: &ArchiveView<'_>, entry: &DeferredEntry) -> snapheap_core::Result<RefWord> {
        assert!(view.offset_of(entry.patch_target).is_ok());
        self.seen.push(entry.patch_target - view.base());
        Ok(RefWord::sentinel(Sentinel::True))
    }
}

fn build_deferred(path: &Path, cfg: &ArchiveConfig) -> Vec<u64> {
    let mut b = ArchiveBuilder::<FixedAddress>::create(path, cfg).unwrap();
    let root = b.serialize(&Object::tuple(vec![Object::int(1), Object::int(2), Object::int(3)])).unwrap();
    let mut slots = Vec::new();
    for i in [2u64, 0, 1] {
        let target = root.0 + SEQ_ITEMS as u64 + 8 * i;
        b.defer(target, RefWord::NULL, NodeKind::Int).unwrap();
        slots.push(target - b.base());
    }
    let summary = b.finalize().unwrap();
    assert_eq!(summary.deferred, 3);
    slots
}

#[test]
fn deferred_entries_resolve_in_insertion_order() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("heap.snap");
    let slots = build_deferred(&path, &config());

    let mut loader = Loader::<FixedAddress>::new().with_reconstructor(Recorder::default());
    let archive = loader.load(&path).unwrap();
    assert_eq!(loader.reconstructor().seen, slots);
    assert_eq!(archive.deferred_resolved(), 3);
    assert_eq!(archive.root_object().unwrap().repr(), "(True, True, True)");
}

#[test]
fn deferred_entries_follow_an_archive_shift() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("heap.snap");
    let cfg = config();
    let slots = build_deferred(&path, &cfg);

    let _held = Loader::<FixedAddress>::new().with_reconstructor(Recorder::default()).load(&path).unwrap();
    let mut loader = Loader::<AnyAddress>::new().with_reconstructor(Recorder::default());
    let archive = loader.load(&path).unwrap();
    assert_ne!(archive.base(), cfg.requested_address);
    assert_eq!(loader.reconstructor().seen, slots);
    assert_eq!(archive.root_object().unwrap().repr(), "(True, True, True)");
}

#[test]
fn default_loader_rejects_deferred_entries() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("heap.snap");
    build_deferred(&path, &config());
    let mut loader = Loader::<FixedAddress>::new();
    assert!(matches!(loader.load(&path), Err(SnapError::DeferredUnresolved(3))));
    assert_eq!(loader.state(), LoadState::Failed);
}

/// `t = (t, i, 1)` repeated `depth` times around an empty tuple.
fn deep_tuple(depth: i64) -> Object {
    (0..depth).fold(Object::tuple(vec![]), |t, i| Object::tuple(vec![t, Object::int(i), Object::int(1)]))
}

#[test]
fn deep_tuple_round_trips_at_fixed_address() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("heap.snap");
    let root = deep_tuple(100);
    build_fixed(&path, &config(), &root);

    let archive = Loader::<FixedAddress>::new().load(&path).unwrap();
    assert!(archive.stats().skipped);
    assert_eq!(archive.root_object().unwrap(), root);

    // walk the spine in place: depth 100 down to the empty tuple
    let mut node = archive.root().unwrap();
    let mut levels = 0;
    while let Archived::Sequence(seq) = node {
        if seq.is_empty() {
            break;
        }
        assert_eq!(seq.len(), 3);
        levels += 1;
        node = seq.get(0).unwrap().unwrap();
    }
    assert_eq!(levels, 100);
}

#[test]
fn deep_tuple_round_trips_with_archive_shift() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("heap.snap");
    let root = deep_tuple(100);
    let mut b = ArchiveBuilder::<AnyAddress>::create(&path, &config()).unwrap();
    b.serialize(&root).unwrap();
    let summary = b.finalize().unwrap();
    assert_eq!(summary.nodes, 1 + 100 * 3);

    let first = Loader::<AnyAddress>::new().load(&path).unwrap();
    let second = Loader::<AnyAddress>::new().load(&path).unwrap();
    let moved = if first.base() == summary.mapped_base { &second } else { &first };
    assert!(!moved.stats().skipped);
    assert_eq!(moved.stats().nodes, summary.nodes);
    assert_eq!(moved.stats().node_refs, summary.nodes - 1);
    assert_eq!(moved.root_object().unwrap(), root);
}

#[test]
fn archive_without_root_reads_as_absent() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("heap.snap");
    let b = ArchiveBuilder::<FixedAddress>::create(&path, &config()).unwrap();
    let summary = b.finalize().unwrap();
    assert_eq!(summary.root, 0);

    let archive = Loader::<FixedAddress>::new().load(&path).unwrap();
    assert!(matches!(archive.root().unwrap(), Archived::Sentinel(Sentinel::Absent)));
    assert_eq!(archive.root_object().unwrap(), Object::Absent);
}

#[test]
fn contains_covers_used_bytes_only() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("heap.snap");
    let cfg = config();
    build_fixed(&path, &cfg, &Object::str("shared"));

    let archive = Loader::<FixedAddress>::new().load(&path).unwrap();
    let used = archive.header().used_bytes;
    assert!(archive.contains(archive.header().root));
    assert!(archive.contains(cfg.requested_address));
    assert!(archive.contains(cfg.requested_address + used - 1));
    assert!(!archive.contains(cfg.requested_address + used));
    assert!(!archive.contains(cfg.requested_address - 1));
    assert!(!archive.contains(sentinel_addresses()[0]));
}
