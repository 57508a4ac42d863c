use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;
use crate::region::{header_len, ADDRESS_MASK};
use crate::table::TableSpec;

/// One past the highest 24-bit address
pub const ADDRESS_SPACE_END: u32 = ADDRESS_MASK + 1;

/// Live-tune region bounds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveTuneConfig {
    /// First byte of the region
    #[serde(default = "default_region_start")]
    pub region_start: u32,
    /// One past the last byte of the region
    #[serde(default = "default_region_end")]
    pub region_end: u32,
}

const fn default_region_start() -> u32 {
    0xFF_A000
}

const fn default_region_end() -> u32 {
    0xFF_B000
}

impl Default for LiveTuneConfig {
    fn default() -> Self {
        Self {
            region_start: default_region_start(),
            region_end: default_region_end(),
        }
    }
}

impl LiveTuneConfig {
    /// Clamp the bounds to the address space and fall back to the defaults
    /// if the region cannot hold an empty header
    pub fn validate(&mut self) {
        if self.region_start > ADDRESS_MASK {
            warn!("region_start 0x{:X} is not a 24-bit address, masking", self.region_start);
            self.region_start &= ADDRESS_MASK;
        }
        if self.region_end > ADDRESS_SPACE_END {
            warn!("Clamping region_end from 0x{:X} to 0x{ADDRESS_SPACE_END:X}", self.region_end);
            self.region_end = ADDRESS_SPACE_END;
        }
        if (self.region_end as usize) < self.region_start as usize + header_len(0) {
            warn!(
                "Region 0x{:06X}..0x{:06X} is too small, using defaults",
                self.region_start, self.region_end
            );
            *self = Self::default();
        }
    }

    #[must_use]
    pub const fn region_size(&self) -> u32 {
        self.region_end.saturating_sub(self.region_start)
    }

    /// Load from a JSON file without validating.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!("Loading live-tune config from {}", path.display());
        let json = std::fs::read(path)?;
        Ok(serde_json::from_slice(&json)?)
    }

    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(mut config) => {
                info!("Loaded live-tune config from {}", path.display());
                config.validate();
                config
            }
            Err(e) => {
                warn!("Failed to load live-tune config from {}: {e}, using defaults", path.display());
                Self::default()
            }
        }
    }
}

/// Load table definitions from a JSON array.
///
/// # Errors
///
/// Returns a [`ConfigError`] if the file cannot be read or parsed.
pub fn load_tables(path: &Path) -> Result<Vec<TableSpec>, ConfigError> {
    let json = std::fs::read(path)?;
    let tables: Vec<TableSpec> = serde_json::from_slice(&json)?;
    info!("Loaded {} table definitions from {}", tables.len(), path.display());
    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_json() {
        let config: LiveTuneConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, LiveTuneConfig::default());
        assert_eq!(config.region_size(), 0x1000);
    }

    #[test]
    fn test_validate_clamps() {
        let mut config = LiveTuneConfig {
            region_start: 0x01FF_0000,
            region_end: 0x0200_0000,
        };
        config.validate();
        assert_eq!(config.region_start, 0xFF_0000);
        assert_eq!(config.region_end, ADDRESS_SPACE_END);
    }

    #[test]
    fn test_validate_rejects_tiny_region() {
        let mut config = LiveTuneConfig {
            region_start: 0xFF_A000,
            region_end: 0xFF_A004,
        };
        config.validate();
        assert_eq!(config, LiveTuneConfig::default());
    }

    #[test]
    fn test_tables_from_json() {
        let tables: Vec<TableSpec> = serde_json::from_str(
            r#"[{ "name": "Fuel", "rom_address": 256, "length": 16 }]"#,
        )
        .unwrap();
        assert_eq!(tables, vec![TableSpec::new("Fuel", 0x100, 16)]);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = LiveTuneConfig::load_or_default(Path::new("/nonexistent/ssmtune-livetune.json"));
        assert_eq!(config, LiveTuneConfig::default());
    }
}
