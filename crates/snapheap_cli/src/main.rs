use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use serde::Deserialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::Level;

use snapheap_core::{
    config::ENV_VERBOSE, relocate::Relocation, trace::TraceSink, AnyAddress, ArchiveBuilder, ArchiveConfig,
    ArchiveHeader, BuildSummary, FixedAddress, LoadedArchive, Loader, MapStrategy, Object, StrategyKind,
};

#[derive(Parser)]
#[command(name = "snapheap", about = "snapheap CLI: build, load and inspect heap archives")]
struct Cli {
    /// -v info, -vv debug, -vvv trace
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Build an archive from a JSON object graph
    Dump {
        #[arg(long)]
        archive: PathBuf,
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        max_size: Option<u64>,
        /// Requested base address (hex)
        #[arg(long, value_parser = parse_addr)]
        address: Option<u64>,
        /// Map anywhere and rely on relocation
        #[arg(long, default_value_t = false)]
        portable: bool,
        /// Write one line per moved object to this file
        #[arg(long)]
        trace: Option<PathBuf>,
    },

    /// Map an archive, relocate it and print its root
    Load {
        #[arg(long)]
        archive: PathBuf,
        #[arg(long, default_value_t = false)]
        portable: bool,
        /// Print the root as JSON instead of its repr
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Print the archive header
    Info {
        #[arg(long)]
        archive: PathBuf,
    },

    /// Write the trace lines for a JSON object graph without building
    Trace {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        out: PathBuf,
    },
}

/// Deepest JSON nesting accepted for an object graph. Each tuple level takes two.
const MAX_GRAPH_DEPTH: usize = 1024;
/// Stack for the graph parser thread; deep graphs recurse once per level.
const PARSE_STACK_BYTES: usize = 256 << 20;

fn parse_addr(s: &str) -> std::result::Result<u64, String> {
    let hex = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    u64::from_str_radix(hex, 16).map_err(|e| format!("bad address {s:?}: {e}"))
}

fn init_logging(verbose: u8) {
    let env_level = std::env::var(ENV_VERBOSE).ok().and_then(|v| v.trim().parse::<u8>().ok()).unwrap_or(0);
    let level = match verbose.max(env_level) {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).with_writer(std::io::stderr).init();
}

/// Maximum bracket nesting of a JSON document, ignoring brackets inside strings.
fn json_depth(src: &[u8]) -> usize {
    let (mut depth, mut max) = (0usize, 0usize);
    let (mut in_str, mut escaped) = (false, false);
    for &b in src {
        if in_str {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_str = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_str = true,
            b'[' | b'{' => {
                depth += 1;
                max = max.max(depth);
            }
            b']' | b'}' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    max
}

fn read_graph(path: &Path) -> Result<Object> {
    let src = std::fs::read(path).with_context(|| format!("open {}", path.display()))?;
    let depth = json_depth(&src);
    if depth > MAX_GRAPH_DEPTH {
        bail!("object graph {} nests {depth} levels deep (limit {MAX_GRAPH_DEPTH})", path.display());
    }
    // serde_json's own limit (128) is below what nested tuples need; the
    // depth check above bounds recursion instead
    let parsed = std::thread::Builder::new()
        .name("graph-parse".into())
        .stack_size(PARSE_STACK_BYTES)
        .spawn(move || -> serde_json::Result<Object> {
            let mut de = serde_json::Deserializer::from_slice(&src);
            de.disable_recursion_limit();
            let obj = Object::deserialize(&mut de)?;
            de.end()?;
            Ok(obj)
        })?
        .join()
        .map_err(|_| anyhow!("graph parser panicked"))?;
    parsed.with_context(|| format!("parse object graph {}", path.display()))
}

fn build<S: MapStrategy>(archive: &Path, cfg: &ArchiveConfig, root: &Object) -> Result<BuildSummary> {
    let mut b = ArchiveBuilder::<S>::create(archive, cfg)?;
    b.serialize(root)?;
    Ok(b.finalize()?)
}

fn load(archive: &Path, portable: bool) -> Result<LoadedArchive> {
    let res = if portable {
        Loader::<AnyAddress>::new().load(archive)
    } else {
        Loader::<FixedAddress>::new().load(archive)
    };
    res.with_context(|| format!("load {}", archive.display()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match cli.cmd {
        Cmd::Dump { archive, input, max_size, address, portable, trace } => {
            let root = read_graph(&input)?;
            let mut cfg = ArchiveConfig::default();
            if let Some(n) = max_size {
                cfg.max_size = n;
            }
            if let Some(a) = address {
                cfg.requested_address = a;
            }
            if portable {
                cfg.strategy = StrategyKind::Portable;
            }
            cfg.trace_path = trace;
            let s = match cfg.strategy {
                StrategyKind::Fixed => build::<FixedAddress>(&archive, &cfg, &root)?,
                StrategyKind::Portable => build::<AnyAddress>(&archive, &cfg, &root)?,
            };
            println!(
                "dumped: {} base={:#x} used={} nodes={} deferred={}",
                s.path.display(),
                s.mapped_base,
                s.used_bytes,
                s.nodes,
                s.deferred
            );
        }
        Cmd::Load { archive, portable, json } => {
            let a = load(&archive, portable)?;
            let stats = a.stats();
            println!(
                "loaded: {} base={:#x} relocated={} nodes={}",
                archive.display(),
                a.base(),
                if stats.skipped { "no" } else { "yes" },
                stats.nodes
            );
            let root = a.root_object()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&root)?);
            } else {
                println!("root: {}", root.repr());
            }
        }
        Cmd::Info { archive } => {
            let mut f = File::open(&archive).with_context(|| format!("open {}", archive.display()))?;
            let h = ArchiveHeader::read_from(&mut f)?;
            h.validate()?;
            println!("{}", serde_json::to_string_pretty(&h)?);
            match Relocation::runtime_delta(&h) {
                Ok(0) => println!("runtime shift: none"),
                Ok(d) => println!("runtime shift: {d} bytes"),
                Err(e) => return Err(anyhow!("sentinel check: {e}")),
            }
        }
        Cmd::Trace { input, out } => {
            let root = read_graph(&input)?;
            let mut sink = TraceSink::create(&out)?;
            sink.record_graph(&root)?;
            sink.flush()?;
            println!("traced: {} lines -> {}", sink.lines(), out.display());
        }
    }
    Ok(())
}
