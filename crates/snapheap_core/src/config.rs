use crate::consts::{DEFAULT_MAX_SIZE, DEFAULT_REQUESTED_ADDR, HDR_RESERVED, PAGE_SIZE};
use crate::errors::{Result, SnapError};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

pub const ENV_ARCHIVE: &str = "SNAPHEAP_ARCHIVE";
pub const ENV_MODE: &str = "SNAPHEAP_MODE";
pub const ENV_MAX_SIZE: &str = "SNAPHEAP_MAX_SIZE";
pub const ENV_ADDRESS: &str = "SNAPHEAP_ADDRESS";
pub const ENV_PORTABLE: &str = "SNAPHEAP_PORTABLE";
pub const ENV_TRACE: &str = "SNAPHEAP_TRACE";
pub const ENV_VERBOSE: &str = "SNAPHEAP_VERBOSE";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveMode {
    #[default]
    Off,
    Dump,
    Share,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    Fixed,
    Portable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub archive_path: Option<PathBuf>,
    pub mode: ArchiveMode,
    pub max_size: u64,
    pub requested_address: u64,
    pub strategy: StrategyKind,
    pub trace_path: Option<PathBuf>,
    pub verbose: u8,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            archive_path: None,
            mode: ArchiveMode::Off,
            max_size: DEFAULT_MAX_SIZE,
            requested_address: DEFAULT_REQUESTED_ADDR,
            strategy: StrategyKind::Fixed,
            trace_path: None,
            verbose: 0,
        }
    }
}

impl ArchiveConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let f = File::open(path)?;
        let cfg: Self = serde_json::from_reader(BufReader::new(f))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build a config from any key lookup; unset keys keep their defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::default();
        cfg.archive_path = get(ENV_ARCHIVE).filter(|s| !s.is_empty()).map(PathBuf::from);
        if let Some(raw) = get(ENV_MODE) {
            cfg.mode = match raw.trim().to_ascii_uppercase().as_str() {
                "DUMP" => ArchiveMode::Dump,
                "SHARE" => ArchiveMode::Share,
                "" | "OFF" => ArchiveMode::Off,
                other => return Err(invalid(ENV_MODE, other, "DUMP, SHARE, OFF")),
            };
        }
        if let Some(raw) = get(ENV_MAX_SIZE) {
            cfg.max_size = parse_u64(&raw).ok_or_else(|| invalid(ENV_MAX_SIZE, &raw, "a byte count"))?;
        }
        if let Some(raw) = get(ENV_ADDRESS) {
            cfg.requested_address = parse_u64(&raw).ok_or_else(|| invalid(ENV_ADDRESS, &raw, "a hex or decimal address"))?;
        }
        if let Some(raw) = get(ENV_PORTABLE) {
            if parse_bool(ENV_PORTABLE, &raw)? {
                cfg.strategy = StrategyKind::Portable;
            }
        }
        cfg.trace_path = get(ENV_TRACE).filter(|s| !s.is_empty()).map(PathBuf::from);
        if let Some(raw) = get(ENV_VERBOSE) {
            cfg.verbose = raw.trim().parse().map_err(|_| invalid(ENV_VERBOSE, &raw, "0-255"))?;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_size % PAGE_SIZE != 0 || self.max_size <= HDR_RESERVED {
            return Err(SnapError::InvalidConfig(format!(
                "max_size {} must be a multiple of {PAGE_SIZE} above {HDR_RESERVED}",
                self.max_size
            )));
        }
        if self.requested_address % PAGE_SIZE != 0 {
            return Err(SnapError::InvalidConfig(format!("requested_address {:#x} not page aligned", self.requested_address)));
        }
        Ok(())
    }
}

fn invalid(name: &str, raw: &str, expected: &str) -> SnapError {
    SnapError::InvalidConfig(format!("{name}={raw:?} (expected {expected})"))
}

fn parse_u64(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => raw.parse().ok(),
    }
}

fn parse_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.trim() {
        "1" | "true" | "TRUE" | "yes" | "YES" => Ok(true),
        "" | "0" | "false" | "FALSE" | "no" | "NO" => Ok(false),
        other => Err(invalid(name, other, "1, 0, true, false, yes, no")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn env_defaults_to_off() {
        let cfg = ArchiveConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg, ArchiveConfig::default());
    }

    #[test]
    fn env_overrides() {
        let cfg = ArchiveConfig::from_lookup(lookup(&[
            (ENV_ARCHIVE, "/tmp/heap.snap"),
            (ENV_MODE, "share"),
            (ENV_MAX_SIZE, "16777216"),
            (ENV_ADDRESS, "0x300000000"),
            (ENV_PORTABLE, "yes"),
            (ENV_VERBOSE, "2"),
        ]))
        .unwrap();
        assert_eq!(cfg.archive_path.as_deref(), Some(Path::new("/tmp/heap.snap")));
        assert_eq!(cfg.mode, ArchiveMode::Share);
        assert_eq!(cfg.max_size, 16 << 20);
        assert_eq!(cfg.requested_address, 0x3_0000_0000);
        assert_eq!(cfg.strategy, StrategyKind::Portable);
        assert_eq!(cfg.verbose, 2);
    }

    #[test]
    fn env_rejects_garbage() {
        assert!(ArchiveConfig::from_lookup(lookup(&[(ENV_MODE, "LOAD")])).is_err());
        assert!(ArchiveConfig::from_lookup(lookup(&[(ENV_ADDRESS, "0x1234")])).is_err());
        assert!(ArchiveConfig::from_lookup(lookup(&[(ENV_PORTABLE, "maybe")])).is_err());
    }

    #[test]
    fn json_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("snapheap.json");
        std::fs::write(&path, r#"{"archive_path":"a.snap","mode":"dump","strategy":"portable"}"#).unwrap();
        let cfg = ArchiveConfig::load(&path).unwrap();
        assert_eq!(cfg.mode, ArchiveMode::Dump);
        assert_eq!(cfg.strategy, StrategyKind::Portable);
        assert_eq!(cfg.max_size, DEFAULT_MAX_SIZE);
    }
}
