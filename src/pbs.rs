// Sources:
// - https://en.wikipedia.org/wiki/NTFS
// - https://dubeyko.com/development/FileSystems/NTFS/ntfsdoc.pdf

//! NTFS partition boot sector.

use prettytable::{Table, row};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{ExhumeError, Result};
use crate::layout::{Field, FieldKind, Layout};
use crate::mbr::MAGIC_END_SECTION;

pub const NTFS_BOOT_SECTOR: Layout = Layout::new(
    "NTFS boot sector",
    &[
        Field::seq("jump_instruction", FieldKind::Bytes(3)),
        Field::seq("oem_id", FieldKind::Bytes(8)),
        /* -- BIOS Parameter Block -- */
        Field::seq("bytes_per_sector", FieldKind::U16), // 0x0B
        Field::seq("sectors_per_cluster", FieldKind::U8), // 0x0D
        Field::seq("reserved_sectors", FieldKind::U16), // 0x0E
        Field::skip(5),
        Field::seq("media_descriptor", FieldKind::U8), // 0x15
        Field::skip(2),
        Field::seq("sectors_per_track", FieldKind::U16), // 0x18
        Field::seq("number_of_heads", FieldKind::U16),   // 0x1A
        Field::seq("hidden_sectors", FieldKind::U32),    // 0x1C
        /* -- Extended BPB -- */
        Field::at("total_sectors", 0x28, FieldKind::U64),
        Field::seq("mft_cluster", FieldKind::U64),        // 0x30
        Field::seq("mft_mirror_cluster", FieldKind::U64), // 0x38
        Field::seq("clusters_per_file_record", FieldKind::I8), // 0x40, may be negative
        Field::skip(3),
        Field::seq("clusters_per_index_buffer", FieldKind::I8), // 0x44
        Field::skip(3),
        Field::seq("volume_serial_number", FieldKind::U64), // 0x48
        Field::seq("checksum", FieldKind::U32),             // 0x50
    ],
)
.with_magic(0x1FE, &MAGIC_END_SECTION);

/// File and index records are powers of two within these bounds.
const RECORD_SIZE_RANGE: std::ops::RangeInclusive<u64> = 256..=65_536;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PartitionBootSector {
    pub oem_id: String,
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub media_descriptor: u8,
    pub sectors_per_track: u16,
    pub number_of_heads: u16,
    pub hidden_sectors: u32,
    pub total_sectors: u64,
    pub mft_cluster: u64,
    pub mft_mirror_cluster: u64,
    pub clusters_per_file_record: i8,
    pub clusters_per_index_buffer: i8,
    pub volume_serial_number: u64,
    pub checksum: u32,
}

impl PartitionBootSector {
    pub const NTFS_OEM_ID: &'static str = "NTFS";

    /// Parse the first sector of the volume.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let rec = NTFS_BOOT_SECTOR.decode(buf)?;
        let pbs = Self {
            oem_id: rec.text("oem_id")?,
            bytes_per_sector: rec.uint("bytes_per_sector")? as u16,
            sectors_per_cluster: rec.uint("sectors_per_cluster")? as u8,
            reserved_sectors: rec.uint("reserved_sectors")? as u16,
            media_descriptor: rec.uint("media_descriptor")? as u8,
            sectors_per_track: rec.uint("sectors_per_track")? as u16,
            number_of_heads: rec.uint("number_of_heads")? as u16,
            hidden_sectors: rec.uint("hidden_sectors")? as u32,
            total_sectors: rec.uint("total_sectors")?,
            mft_cluster: rec.uint("mft_cluster")?,
            mft_mirror_cluster: rec.uint("mft_mirror_cluster")?,
            clusters_per_file_record: rec.int("clusters_per_file_record")? as i8,
            clusters_per_index_buffer: rec.int("clusters_per_index_buffer")? as i8,
            volume_serial_number: rec.uint("volume_serial_number")?,
            checksum: rec.uint("checksum")? as u32,
        };

        if !pbs.oem_id_is_valid() {
            return Err(ExhumeError::InvalidBootSector(format!(
                "OEM id '{}' is not NTFS",
                pbs.oem_id
            )));
        }
        if !pbs.bytes_per_sector.is_power_of_two()
            || pbs.bytes_per_sector < 256
            || !pbs.sectors_per_cluster.is_power_of_two()
        {
            return Err(ExhumeError::InvalidBootSector(format!(
                "{} bytes per sector, {} sectors per cluster",
                pbs.bytes_per_sector, pbs.sectors_per_cluster
            )));
        }
        if pbs.total_sectors == 0
            || pbs
                .total_sectors
                .checked_mul(pbs.bytes_per_sector as u64)
                .is_none()
        {
            return Err(ExhumeError::InvalidBootSector(format!(
                "{} total sectors",
                pbs.total_sectors
            )));
        }
        for (what, size) in [
            ("file record", pbs.file_record_size()),
            ("index record", pbs.index_record_size()),
        ] {
            if !size.is_power_of_two() || !RECORD_SIZE_RANGE.contains(&size) {
                return Err(ExhumeError::InvalidBootSector(format!(
                    "{} size of {} bytes",
                    what, size
                )));
            }
        }
        if pbs.mft_cluster >= pbs.total_clusters() {
            return Err(ExhumeError::InvalidBootSector(format!(
                "$MFT at cluster {} past the {} clusters of the volume",
                pbs.mft_cluster,
                pbs.total_clusters()
            )));
        }
        Ok(pbs)
    }

    /// Check if the oem_id is valid
    pub fn oem_id_is_valid(&self) -> bool {
        self.oem_id == Self::NTFS_OEM_ID
    }

    pub fn cluster_size(&self) -> u64 {
        self.bytes_per_sector as u64 * self.sectors_per_cluster as u64
    }

    pub fn total_clusters(&self) -> u64 {
        self.total_sectors / self.sectors_per_cluster as u64
    }

    /// Positive: that many clusters. Negative: `2^|v|` bytes.
    fn clusters_or_shift(&self, v: i8) -> u64 {
        if v > 0 {
            v as u64 * self.cluster_size()
        } else {
            1u64 << v.unsigned_abs().min(63)
        }
    }

    /// Compute actual bytes per file-record segment
    pub fn file_record_size(&self) -> u64 {
        self.clusters_or_shift(self.clusters_per_file_record)
    }

    pub fn index_record_size(&self) -> u64 {
        self.clusters_or_shift(self.clusters_per_index_buffer)
    }

    /// Byte offset of `$MFT` from the start of the volume.
    pub fn mft_address(&self) -> u64 {
        self.mft_cluster * self.cluster_size()
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }

    pub fn to_string(&self) -> String {
        let mut t = Table::new();
        t.add_row(row![b -> "OEM id", self.oem_id]);
        t.add_row(row![b -> "Bytes per sector", self.bytes_per_sector]);
        t.add_row(row![b -> "Sectors per cluster", self.sectors_per_cluster]);
        t.add_row(row![b -> "Total sectors", self.total_sectors]);
        t.add_row(row![b -> "$MFT cluster", self.mft_cluster]);
        t.add_row(row![b -> "$MFTMirr cluster", self.mft_mirror_cluster]);
        t.add_row(row![b -> "File record size", self.file_record_size()]);
        t.add_row(row![b -> "Index record size", self.index_record_size()]);
        t.add_row(row![b -> "Serial number", format!("0x{:016X}", self.volume_serial_number)]);
        t.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sector(record: i8, index: i8) -> Vec<u8> {
        let mut s = vec![0u8; 512];
        s[3..11].copy_from_slice(b"NTFS    ");
        s[0x0B..0x0D].copy_from_slice(&512u16.to_le_bytes());
        s[0x0D] = 8;
        s[0x28..0x30].copy_from_slice(&20_000u64.to_le_bytes());
        s[0x30..0x38].copy_from_slice(&4u64.to_le_bytes());
        s[0x38..0x40].copy_from_slice(&10_000u64.to_le_bytes());
        s[0x40] = record as u8;
        s[0x44] = index as u8;
        s[0x48..0x50].copy_from_slice(&0xDEAD_BEEF_u64.to_le_bytes());
        s[0x1FE] = 0x55;
        s[0x1FF] = 0xAA;
        s
    }

    #[test]
    fn negative_sizes_are_powers_of_two() {
        let pbs = PartitionBootSector::from_bytes(&sector(-10, 1)).unwrap();
        assert_eq!(pbs.cluster_size(), 4096);
        assert_eq!(pbs.file_record_size(), 1024);
        assert_eq!(pbs.index_record_size(), 4096);
        assert_eq!(pbs.mft_address(), 4 * 4096);
        assert_eq!(pbs.volume_serial_number, 0xDEAD_BEEF);
    }

    #[test]
    fn positive_sizes_count_clusters() {
        let pbs = PartitionBootSector::from_bytes(&sector(2, -12)).unwrap();
        assert_eq!(pbs.file_record_size(), 8192);
        assert_eq!(pbs.index_record_size(), 4096);
    }

    #[test]
    fn wrong_oem_or_signature_is_rejected() {
        let mut s = sector(-10, 1);
        s[3..11].copy_from_slice(b"MSDOS5.0");
        assert!(matches!(
            PartitionBootSector::from_bytes(&s),
            Err(ExhumeError::InvalidBootSector(_))
        ));

        let mut s = sector(-10, 1);
        s[0x1FE] = 0;
        assert!(matches!(
            PartitionBootSector::from_bytes(&s),
            Err(ExhumeError::BadMagic { .. })
        ));
    }

    #[test]
    fn out_of_range_geometry_is_rejected() {
        // 2^63, 2^0 and 2^7 byte records, then 127 clusters of index
        for (record, index) in [(-128, 1), (0, 1), (-7, 1), (-10, 127)] {
            assert!(
                matches!(
                    PartitionBootSector::from_bytes(&sector(record, index)),
                    Err(ExhumeError::InvalidBootSector(_))
                ),
                "record byte {} index byte {}",
                record,
                index
            );
        }

        let mut s = sector(-10, 1);
        s[0x30..0x38].copy_from_slice(&u64::MAX.to_le_bytes());
        assert!(PartitionBootSector::from_bytes(&s).is_err());

        let mut s = sector(-10, 1);
        s[0x28..0x30].copy_from_slice(&u64::MAX.to_le_bytes());
        assert!(PartitionBootSector::from_bytes(&s).is_err());

        let mut s = sector(-10, 1);
        s[0x0B..0x0D].copy_from_slice(&0u16.to_le_bytes());
        assert!(PartitionBootSector::from_bytes(&s).is_err());
    }
}
