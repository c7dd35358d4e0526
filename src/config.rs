use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;

/// Knobs shared by the partition resolver and both engines.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ParseOptions {
    /// Read the second FAT copy and count entries that disagree with the first.
    pub read_fat2: bool,
    /// Walk into `System Volume Information` instead of only listing it.
    pub recurse_system_volume_information: bool,
    /// Upper bound on extended boot records followed in one chain.
    pub max_ebr_chain: usize,
    /// Resolved directory paths kept by the NTFS path memo.
    pub path_cache_size: usize,
    /// Parent records kept by the NTFS record cache.
    pub record_cache_size: usize,
    /// Do not emit rows for MFT extension records (non-zero base reference).
    pub skip_extension_records: bool,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            read_fat2: false,
            recurse_system_volume_information: false,
            max_ebr_chain: 64,
            path_cache_size: 1024,
            record_cache_size: 1024,
            skip_extension_records: true,
        }
    }
}

impl ParseOptions {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let opts = ParseOptions::from_json_str(r#"{ "read_fat2": true }"#).unwrap();
        assert!(opts.read_fat2);
        assert_eq!(opts.max_ebr_chain, 64);
        assert!(opts.skip_extension_records);
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(ParseOptions::from_json_str("{ read_fat2 ").is_err());
    }
}
