use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Overlay new-code placement sentinel: keep the overlay's current RAM
/// address.
pub const ADDRESS_KEEP: u32 = 0xFFFFFFFF;

fn deserialize_hex<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct HexVisitor;

    impl serde::de::Visitor<'_> for HexVisitor {
        type Value = u32;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("an address as a number or a \"0x\" hex string")
        }

        fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<u32, E> {
            u32::try_from(v).map_err(|_| E::custom(format!("address out of range: {v}")))
        }

        fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<u32, E> {
            let parsed = match v.strip_prefix("0x").or_else(|| v.strip_prefix("0X")) {
                Some(hex) => u32::from_str_radix(hex, 16),
                None => v.parse(),
            };
            parsed.map_err(|_| E::custom(format!("invalid address: \"{v}\"")))
        }
    }

    deserializer.deserialize_any(HexVisitor)
}

fn default_address() -> u32 {
    ADDRESS_KEEP
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Append,
    Replace,
    Create,
}

/// A span reserved for new code in one destination binary.
#[derive(Debug, Clone, Deserialize)]
pub struct Region {
    #[serde(rename = "dest")]
    pub destination: i32,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default = "default_address", deserialize_with = "deserialize_hex")]
    pub address: u32,
    #[serde(deserialize_with = "deserialize_hex")]
    pub length: u32,
    pub sources: Vec<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BuildTarget {
    pub symbols: PathBuf,
    #[serde(rename = "ld-flags", default)]
    pub ld_flags: String,
    #[serde(rename = "arena-lo", deserialize_with = "deserialize_hex")]
    pub arena_lo: u32,
    pub regions: Vec<Region>,
    #[serde(skip)]
    pub is_arm9: bool,
}

impl BuildTarget {
    pub fn load(path: impl AsRef<Path>, is_arm9: bool) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Could not read \"{}\"", path.display()))?;
        let mut target: BuildTarget = serde_json::from_str(&text)
            .with_context(|| format!("Could not parse \"{}\"", path.display()))?;
        target.is_arm9 = is_arm9;
        Ok(target)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetRef {
    pub target: PathBuf,
    pub build: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BuildConfig {
    pub toolchain: String,
    #[serde(rename = "filesystem")]
    pub filesystem_dir: PathBuf,
    #[serde(rename = "backup")]
    pub backup_dir: PathBuf,
    pub arm9: Option<TargetRef>,
    pub arm7: Option<TargetRef>,
    #[serde(rename = "pre-build", default)]
    pub pre_build: Vec<String>,
    #[serde(rename = "post-build", default)]
    pub post_build: Vec<String>,
}

impl BuildConfig {
    pub const FILE_NAME: &'static str = "nitropatch.json";

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Could not read \"{}\"", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Could not parse \"{}\"", path.display()))
    }
}

/// State carried between runs: which overlays a previous run patched, so
/// they are reloaded from backup before patching again.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RebuildConfig {
    #[serde(default)]
    pub arm9_patched_overlays: Vec<u32>,
    #[serde(default)]
    pub arm7_patched_overlays: Vec<u32>,
}

impl RebuildConfig {
    pub const FILE_NAME: &'static str = "nitropatch-rebuild.json";

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Could not read \"{}\"", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Could not parse \"{}\"", path.display()))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)
            .with_context(|| format!("Could not write \"{}\"", path.display()))
    }

    pub fn patched_overlays(&self, is_arm9: bool) -> &[u32] {
        if is_arm9 {
            &self.arm9_patched_overlays
        } else {
            &self.arm7_patched_overlays
        }
    }

    pub fn set_patched_overlays(&mut self, is_arm9: bool, overlays: Vec<u32>) {
        if is_arm9 {
            self.arm9_patched_overlays = overlays;
        } else {
            self.arm7_patched_overlays = overlays;
        }
    }
}
