//! ROM file set loading.
//!
//! One directory per title:
//!
//! - `internal_flash.bin`: required; first 128 KiB go to flash bank 1, the
//!   remainder to bank 2.
//! - `external_flash.bin` or `external_flash_decrypted.bin`: optional; the
//!   `decrypted` filename substring selects passthrough reads.
//! - `itcm.bin`: optional snapshot, installed only after reset.
//! - `(Key Info).json`: OTFDEC/AES-GCM key descriptor; scalar values are
//!   accepted as integers or `"0x..."` strings.

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::{self, Deserializer};
use serde::Deserialize;
use thiserror::Error;

use memory::{GcmConfig, OtfConfig, SystemBus};

pub const INTERNAL_FLASH: &str = "internal_flash.bin";
pub const EXTERNAL_FLASH: &str = "external_flash.bin";
pub const EXTERNAL_FLASH_DECRYPTED: &str = "external_flash_decrypted.bin";
pub const ITCM_SNAPSHOT: &str = "itcm.bin";
pub const KEY_INFO: &str = "(Key Info).json";

#[derive(Debug, Error)]
pub enum RomError {
    #[error("no {INTERNAL_FLASH} found under {0}")]
    MissingInternalFlash(PathBuf),
    #[error("external flash image is encrypted but {KEY_INFO} is missing in {0}")]
    MissingKeyInfo(PathBuf),
    #[error("malformed {KEY_INFO}: {0}")]
    MalformedKeyInfo(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A 32-bit scalar that deserializes from an integer or a hex string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HexWord(pub u32);

impl<'de> Deserialize<'de> for HexWord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Visitor;

        impl de::Visitor<'_> for Visitor {
            type Value = HexWord;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("an integer or a hex string like \"0x1234\"")
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<HexWord, E> {
                Ok(HexWord(value as u32))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<HexWord, E> {
                Ok(HexWord(value as u32))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<HexWord, E> {
                let trimmed = value.trim();
                let parsed = if let Some(hex) = trimmed
                    .strip_prefix("0x")
                    .or_else(|| trimmed.strip_prefix("0X"))
                {
                    u32::from_str_radix(hex, 16)
                } else {
                    trimmed.parse()
                };
                parsed
                    .map(HexWord)
                    .map_err(|_| E::custom(format!("bad numeric value {value:?}")))
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}

/// `(Key Info).json` as dumped by the extraction tooling.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KeyInfo {
    #[serde(rename = "OtfDecKey")]
    pub otf_key: Vec<HexWord>,
    #[serde(rename = "OtfDecNonce")]
    pub otf_nonce: Vec<HexWord>,
    #[serde(rename = "OtfDecVersion")]
    pub otf_version: HexWord,
    #[serde(rename = "OtfDecRegion")]
    pub otf_region: HexWord,
    #[serde(rename = "OtfDecStart")]
    pub otf_start: HexWord,
    #[serde(rename = "OtfDecEnd")]
    pub otf_end: HexWord,
    #[serde(rename = "AesGcmKey")]
    pub gcm_key: Vec<HexWord>,
    #[serde(rename = "AesGcmIv")]
    pub gcm_iv: Vec<HexWord>,
    #[serde(rename = "AesGcmBase")]
    pub gcm_base: HexWord,
    #[serde(rename = "AesGcmRegionLength")]
    pub gcm_region_length: HexWord,
    #[serde(rename = "AesGcmDataLength")]
    pub gcm_data_length: HexWord,
}

fn words<const N: usize>(values: &[HexWord]) -> Option<[u32; N]> {
    if values.len() < N {
        return None;
    }
    let mut out = [0u32; N];
    for (slot, value) in out.iter_mut().zip(values) {
        *slot = value.0;
    }
    Some(out)
}

impl KeyInfo {
    pub fn parse(json: &str) -> Result<KeyInfo, RomError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn otf_config(&self) -> Option<OtfConfig> {
        Some(OtfConfig {
            key: words::<4>(&self.otf_key)?,
            nonce: words::<2>(&self.otf_nonce)?,
            version: self.otf_version.0 as u16,
            region: self.otf_region.0 as u8,
            start: self.otf_start.0,
            end: self.otf_end.0,
        })
    }

    pub fn gcm_config(&self) -> Option<GcmConfig> {
        Some(GcmConfig {
            key: words::<4>(&self.gcm_key)?,
            iv: words::<3>(&self.gcm_iv)?,
            base: self.gcm_base.0,
            region_len: self.gcm_region_length.0,
            data_len: self.gcm_data_length.0,
        })
    }
}

/// An in-memory ROM set, decoupled from the filesystem for tests.
#[derive(Debug)]
pub struct RomSet {
    pub internal_flash: Vec<u8>,
    pub external_flash: Option<ExternalImage>,
    pub itcm: Option<Vec<u8>>,
    pub key_info: Option<KeyInfo>,
}

#[derive(Debug)]
pub struct ExternalImage {
    pub data: Vec<u8>,
    pub decrypted: bool,
}

impl RomSet {
    /// Load a ROM directory. `path` may also point directly at an
    /// `internal_flash.bin`-style file.
    pub fn load(path: &Path) -> Result<RomSet, RomError> {
        if path.is_file() {
            return Ok(RomSet {
                internal_flash: fs::read(path)?,
                external_flash: None,
                itcm: None,
                key_info: None,
            });
        }

        let root = find_rom_root(path)?;
        let internal_flash = fs::read(root.join(INTERNAL_FLASH))?;

        // Prefer the decrypted dump when both are present.
        let external_flash = [EXTERNAL_FLASH_DECRYPTED, EXTERNAL_FLASH]
            .iter()
            .map(|name| root.join(name))
            .find(|p| p.exists())
            .map(|p| -> Result<ExternalImage, RomError> {
                let decrypted = p
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map_or(false, |n| n.to_ascii_lowercase().contains("decrypted"));
                Ok(ExternalImage {
                    data: fs::read(&p)?,
                    decrypted,
                })
            })
            .transpose()?;

        let itcm = {
            let p = root.join(ITCM_SNAPSHOT);
            if p.exists() {
                Some(fs::read(p)?)
            } else {
                None
            }
        };

        let key_info = {
            let p = root.join(KEY_INFO);
            if p.exists() {
                Some(KeyInfo::parse(&fs::read_to_string(p)?)?)
            } else {
                None
            }
        };

        // An encrypted external image without keys cannot boot.
        if let Some(image) = &external_flash {
            if !image.decrypted && key_info.is_none() {
                return Err(RomError::MissingKeyInfo(root));
            }
        }

        Ok(RomSet {
            internal_flash,
            external_flash,
            itcm,
            key_info,
        })
    }

    /// Install the set into the bus: flash banks, external flash with keys,
    /// and the deferred ITCM snapshot. The reset vector fetch must happen
    /// before `SystemBus::apply_itcm_override`.
    pub fn install(&self, bus: &mut SystemBus) {
        bus.load_internal_flash(&self.internal_flash);
        check_vector_table(&self.internal_flash);

        if let Some(image) = &self.external_flash {
            bus.ext_flash.load(&image.data, image.decrypted);
            if !image.decrypted {
                if let Some(keys) = &self.key_info {
                    if let Some(otf) = keys.otf_config() {
                        bus.ext_flash.configure_otf(&otf);
                    }
                    if let Some(gcm) = keys.gcm_config() {
                        bus.ext_flash.configure_gcm(&gcm);
                    }
                }
            }
        }

        if let Some(itcm) = &self.itcm {
            bus.stash_itcm_override(itcm.clone());
        }
        bus.set_boot_from_flash(true);
    }
}

/// Walk a directory tree for the folder holding `internal_flash.bin`.
pub fn find_rom_root(path: &Path) -> Result<PathBuf, RomError> {
    fn walk(dir: &Path) -> Option<PathBuf> {
        if dir.join(INTERNAL_FLASH).is_file() {
            return Some(dir.to_path_buf());
        }
        let entries = fs::read_dir(dir).ok()?;
        let mut dirs: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();
        dirs.iter().find_map(|d| walk(d))
    }
    walk(path).ok_or_else(|| RomError::MissingInternalFlash(path.to_path_buf()))
}

/// A malformed vector table logs a warning but does not refuse to start.
fn check_vector_table(internal_flash: &[u8]) {
    if internal_flash.len() < 8 {
        tracing::warn!("internal flash too small to hold a vector table");
        return;
    }
    let sp = u32::from_le_bytes(internal_flash[0..4].try_into().unwrap());
    let pc = u32::from_le_bytes(internal_flash[4..8].try_into().unwrap());
    if !(0x2000_0000..=0x2002_0000).contains(&sp) {
        tracing::warn!("initial SP {sp:#010x} outside DTCM");
    }
    if !(0x0800_0000..0x0820_0000).contains(&(pc & !1)) {
        tracing::warn!("reset vector {pc:#010x} outside flash");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, bytes: &[u8]) {
        let mut f = File::create(dir.join(name)).unwrap();
        f.write_all(bytes).unwrap();
    }

    #[test]
    fn hex_word_accepts_both_spellings() {
        let parsed: Vec<HexWord> = serde_json::from_str(r#"["0x10", 32, "48"]"#).unwrap();
        assert_eq!(parsed, vec![HexWord(0x10), HexWord(32), HexWord(48)]);
    }

    #[test]
    fn key_info_parses_mixed_forms() {
        let json = r#"{
            "OtfDecKey": ["0xA0A1A2A3", "0xB0B1B2B3", "0xC0C1C2C3", "0xD0D1D2D3"],
            "OtfDecNonce": ["0x11223344", "0x55667788"],
            "OtfDecVersion": "0x0001",
            "OtfDecRegion": 3,
            "OtfDecStart": "0x90000000",
            "OtfDecEnd": "0x900FDFFF",
            "AesGcmKey": [1, 2, 3, 4],
            "AesGcmIv": [5, 6, 7],
            "AesGcmBase": "0x900FE000",
            "AesGcmRegionLength": "0x1000",
            "AesGcmDataLength": "0x40"
        }"#;
        let info = KeyInfo::parse(json).unwrap();
        let otf = info.otf_config().unwrap();
        assert_eq!(otf.key[0], 0xA0A1_A2A3);
        assert_eq!(otf.version, 1);
        assert_eq!(otf.region, 3);
        assert_eq!(otf.start, 0x9000_0000);
        assert_eq!(otf.end, 0x900F_DFFF);
        let gcm = info.gcm_config().unwrap();
        assert_eq!(gcm.base, 0x900F_E000);
        assert_eq!(gcm.data_len, 0x40);
    }

    #[test]
    fn key_info_without_gcm_section() {
        let json = r#"{
            "OtfDecKey": [1, 2, 3, 4],
            "OtfDecNonce": [5, 6],
            "OtfDecVersion": 1,
            "OtfDecRegion": 0,
            "OtfDecStart": "0x90000000",
            "OtfDecEnd": "0x900FDFFF"
        }"#;
        let info = KeyInfo::parse(json).unwrap();
        assert!(info.otf_config().is_some());
        assert!(info.gcm_config().is_none());
    }

    #[test]
    fn load_prefers_decrypted_external_image() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), INTERNAL_FLASH, &[0u8; 0x200]);
        write_file(dir.path(), EXTERNAL_FLASH, &[0x11; 16]);
        write_file(dir.path(), EXTERNAL_FLASH_DECRYPTED, &[0x22; 16]);
        let set = RomSet::load(dir.path()).unwrap();
        let ext = set.external_flash.unwrap();
        assert!(ext.decrypted);
        assert_eq!(ext.data[0], 0x22);
    }

    #[test]
    fn encrypted_image_without_keys_refuses() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), INTERNAL_FLASH, &[0u8; 0x200]);
        write_file(dir.path(), EXTERNAL_FLASH, &[0x11; 16]);
        let err = RomSet::load(dir.path()).unwrap_err();
        assert!(matches!(err, RomError::MissingKeyInfo(_)));
    }

    #[test]
    fn missing_internal_flash_refuses() {
        let dir = tempfile::tempdir().unwrap();
        let err = RomSet::load(dir.path()).unwrap_err();
        assert!(matches!(err, RomError::MissingInternalFlash(_)));
    }

    #[test]
    fn discovery_walks_nested_directories() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("titles").join("zelda");
        fs::create_dir_all(&nested).unwrap();
        write_file(&nested, INTERNAL_FLASH, &[0u8; 0x100]);
        let root = find_rom_root(dir.path()).unwrap();
        assert_eq!(root, nested);
    }

    #[test]
    fn install_defers_itcm_and_loads_banks() {
        let mut image = vec![0u8; 0x100];
        image[0..4].copy_from_slice(&0x2001_0000u32.to_le_bytes());
        image[4..8].copy_from_slice(&0x0800_0101u32.to_le_bytes());
        let set = RomSet {
            internal_flash: image,
            external_flash: None,
            itcm: Some(vec![0x77; 0x40]),
            key_info: None,
        };
        let mut bus = SystemBus::new();
        set.install(&mut bus);
        // Vector fetch still sees flash; the override waits for reset.
        use memory::CpuBus;
        assert_eq!(bus.read_u32(0).unwrap(), 0x2001_0000);
        bus.apply_itcm_override();
        assert_eq!(bus.read_u32(0).unwrap(), 0x7777_7777);
    }
}
