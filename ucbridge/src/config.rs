use crate::backend::Backend;
use crate::engine::Unicorn;
use crate::marshal::{Arch, Mode, Permission, TlbMode};
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, sync::Arc};
use tracing::debug;

/// Engine profile: what to open and how to tune it before the first run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub arch: Arch,

    /// Mode flags in text form, e.g. `"MODE_64"` or `"ARM | THUMB"`
    pub mode: Mode,

    /// Page size override (hex string like "0x1000")
    #[serde(default, skip_serializing_if = "Option::is_none", with = "option_hex")]
    pub page_size: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_model: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tlb_mode: Option<TlbMode>,

    /// Addresses that end emulation (hex strings). Enables exits when set.
    #[serde(default, skip_serializing_if = "Vec::is_empty", with = "hex_list")]
    pub exits: Vec<u64>,

    /// Memory mapped right after open
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub regions: Vec<RegionConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionConfig {
    /// Base address (hex string like "0x1000")
    #[serde(with = "hex_string")]
    pub address: u64,

    /// Size in bytes (hex string like "0x1000")
    #[serde(with = "hex_string")]
    pub size: u64,

    /// Permissions in text form, e.g. `"READ | EXEC"`
    #[serde(default = "RegionConfig::default_perms")]
    pub perms: Permission,
}

impl RegionConfig {
    fn default_perms() -> Permission {
        Permission::ALL
    }
}

impl EngineConfig {
    pub fn new(arch: Arch, mode: Mode) -> Self {
        Self {
            arch,
            mode,
            page_size: None,
            cpu_model: None,
            tlb_mode: None,
            exits: Vec::new(),
            regions: Vec::new(),
        }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| anyhow!("Failed to parse engine config: {}", e))
    }

    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| anyhow!("Failed to read config file {:?}: {}", path.as_ref(), e))?;

        let config: EngineConfig = toml::from_str(&contents)
            .map_err(|e| anyhow!("Failed to parse config file {:?}: {}", path.as_ref(), e))?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| anyhow!("Failed to serialize config: {}", e))?;

        fs::write(&path, contents)
            .map_err(|e| anyhow!("Failed to write config file {:?}: {}", path.as_ref(), e))?;

        Ok(())
    }

    /// Opens an engine on `backend` and applies the profile to it.
    pub fn open(&self, backend: Arc<dyn Backend>) -> crate::Result<Unicorn> {
        let uc = Unicorn::open(backend, self.arch, self.mode)?;
        self.apply(&uc)?;
        Ok(uc)
    }

    /// Applies tuning and the initial memory map to an open engine.
    pub fn apply(&self, uc: &Unicorn) -> crate::Result<()> {
        if let Some(page_size) = self.page_size {
            let page_size = u32::try_from(page_size).map_err(|_| {
                crate::Error::contract(format!("page size {page_size:#x} does not fit in 32 bits"))
            })?;
            uc.ctl_set_page_size(page_size)?;
        }
        if let Some(model) = self.cpu_model {
            uc.ctl_set_cpu_model(model)?;
        }
        if let Some(mode) = self.tlb_mode {
            uc.ctl_tlb_mode(mode)?;
        }
        if !self.exits.is_empty() {
            uc.ctl_exits_enabled(true)?;
            uc.ctl_set_exits(&self.exits)?;
        }
        for region in &self.regions {
            let size = usize::try_from(region.size).map_err(|_| {
                crate::Error::contract(format!("region size {:#x} is too large", region.size))
            })?;
            uc.mem_map(region.address, size, region.perms)?;
        }
        debug!(
            arch = ?self.arch,
            regions = self.regions.len(),
            exits = self.exits.len(),
            "engine config applied"
        );
        Ok(())
    }

    pub fn create_sample() -> Self {
        Self {
            arch: Arch::X86,
            mode: Mode::MODE_64,
            page_size: Some(0x1000),
            cpu_model: None,
            tlb_mode: Some(TlbMode::Cpu),
            exits: vec![0x1010],
            regions: vec![
                RegionConfig {
                    address: 0x1000,
                    size: 0x1000,
                    perms: Permission::READ | Permission::EXEC,
                },
                RegionConfig {
                    address: 0x7fff_0000,
                    size: 0x10000,
                    perms: Permission::READ | Permission::WRITE,
                },
            ],
        }
    }
}

fn parse_hex(s: &str) -> Result<u64> {
    // Remove underscores for readability
    let cleaned = s.replace('_', "");

    if let Some(hex_str) = cleaned.strip_prefix("0x") {
        u64::from_str_radix(hex_str, 16).map_err(|e| anyhow!("Invalid hex string '{}': {}", s, e))
    } else {
        u64::from_str_radix(&cleaned, 16).map_err(|e| anyhow!("Invalid hex string '{}': {}", s, e))
    }
}

mod hex_string {
    use super::parse_hex;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        let hex_str: String = String::deserialize(deserializer)?;
        parse_hex(&hex_str).map_err(serde::de::Error::custom)
    }

    pub fn serialize<S>(value: &u64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        format!("0x{:x}", value).serialize(serializer)
    }
}

mod option_hex {
    use super::parse_hex;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let hex_str: Option<String> = Option::deserialize(deserializer)?;
        hex_str
            .map(|s| parse_hex(&s).map_err(serde::de::Error::custom))
            .transpose()
    }

    pub fn serialize<S>(value: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        value.map(|v| format!("0x{:x}", v)).serialize(serializer)
    }
}

mod hex_list {
    use super::parse_hex;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let strings: Vec<String> = Vec::deserialize(deserializer)?;
        strings
            .iter()
            .map(|s| parse_hex(s).map_err(serde::de::Error::custom))
            .collect()
    }

    pub fn serialize<S>(values: &[u64], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        values
            .iter()
            .map(|v| format!("0x{:x}", v))
            .collect::<Vec<_>>()
            .serialize(serializer)
    }
}
