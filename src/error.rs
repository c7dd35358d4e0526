use thiserror::Error;

use crate::mbr::PartitionType;

/// Every failure the reconstruction engines can report.
///
/// Structural variants (`BadMagic`, `Truncated`, `InvalidBootSector`,
/// `InvalidFat`) abort the partition being parsed. `InvalidRecord` is local:
/// callers skip the record and keep walking. `Exhausted` is the normal end of
/// a cluster chain or of the MFT.
#[derive(Error, Debug)]
pub enum ExhumeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{structure}: bad magic at 0x{offset:X}, expected {expected:02X?}, found {found:02X?}")]
    BadMagic {
        structure: &'static str,
        offset: usize,
        expected: Vec<u8>,
        found: Vec<u8>,
    },

    #[error("{structure}: need {needed} bytes, only {available} available")]
    Truncated {
        structure: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("{structure}: no field named '{field}'")]
    MissingField {
        structure: &'static str,
        field: &'static str,
    },

    #[error("Invalid boot sector: {0}")]
    InvalidBootSector(String),

    #[error("Invalid file allocation table: {0}")]
    InvalidFat(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("stream exhausted")]
    Exhausted,

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("no engine for partition type {0:?}")]
    UnsupportedPartition(PartitionType),
}

pub type Result<T> = std::result::Result<T, ExhumeError>;
