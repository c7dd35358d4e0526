// Sources:
// - https://en.wikipedia.org/wiki/Master_boot_record
// - https://en.wikipedia.org/wiki/Extended_boot_record

//! Classical MBR and extended boot record chains.

use log::{debug, info, warn};
use prettytable::{Table, row};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use std::collections::HashSet;
use std::io::{Read, Seek, SeekFrom};

use crate::config::ParseOptions;
use crate::error::{ExhumeError, Result};
use crate::layout::{Field, FieldKind, Layout, Value};
use crate::stream::fill;

pub const SECTOR_SIZE: u64 = 512;
pub const MAGIC_END_SECTION: [u8; 2] = [0x55, 0xAA];

const PARTITION_TABLE_OFFSET: usize = 0x1BE;
const PARTITION_ENTRY_SIZE: usize = 16;

pub const BOOT_RECORD: Layout = Layout::new(
    "boot record",
    &[Field::at(
        "partition_entries",
        PARTITION_TABLE_OFFSET,
        FieldKind::Bytes(4 * PARTITION_ENTRY_SIZE),
    )],
)
.with_magic(0x1FE, &MAGIC_END_SECTION);

pub const PARTITION_ENTRY: Layout = Layout::new(
    "partition entry",
    &[
        Field::seq("status", FieldKind::U8),
        Field::seq("starting_chs_address", FieldKind::Bytes(3)),
        Field::seq("partition_type", FieldKind::U8),
        Field::seq("ending_chs_address", FieldKind::Bytes(3)),
        Field::seq("first_sector_address", FieldKind::U32),
        Field::seq("number_of_sectors", FieldKind::U32),
    ],
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum PartitionType {
    Fat32,
    Ntfs,
    Extended,
    Ignored,
    Unknown(u8),
}

impl From<u8> for PartitionType {
    fn from(raw: u8) -> Self {
        match raw {
            0x00 => PartitionType::Ignored,
            0x05 | 0x0F => PartitionType::Extended,
            0x0B | 0x0C => PartitionType::Fat32,
            0x07 => PartitionType::Ntfs,
            other => PartitionType::Unknown(other),
        }
    }
}

/// Legacy cylinder-head-sector address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct ChsAddress {
    pub cylinder: u16,
    pub head: u8,
    pub sector: u8,
}

impl ChsAddress {
    /// Bytes are stored as `head, sector | cylinder high bits, cylinder low`.
    pub fn from_bytes(raw: &[u8]) -> Self {
        let (h, s, c) = (raw[0], raw[1], raw[2]);
        Self {
            cylinder: ((s as u16 & 0xC0) << 2) | c as u16,
            head: h,
            sector: s & 0x3F,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PartitionDescriptor {
    pub kind: PartitionType,
    pub raw_type: u8,
    pub bootable: bool,
    pub start_chs: ChsAddress,
    pub end_chs: ChsAddress,
    /// LBA as stored in the table, relative to the record's base.
    pub first_sector: u32,
    /// Absolute position in the image.
    pub first_byte_offset: u64,
    pub sector_count: u32,
}

impl PartitionDescriptor {
    /// Decode one 16-byte entry; `preceding_bytes` is the base its LBA is relative to.
    pub fn from_bytes(raw: &[u8], preceding_bytes: u64) -> Result<Self> {
        let mut rec = PARTITION_ENTRY.decode(raw)?;
        rec.derive("first_byte_address", |r| {
            Ok(Value::Unsigned(
                r.uint("first_sector_address")? * SECTOR_SIZE + preceding_bytes,
            ))
        })?;

        let raw_type = rec.uint("partition_type")? as u8;
        Ok(Self {
            kind: PartitionType::from(raw_type),
            raw_type,
            bootable: rec.uint("status")? == 0x80,
            start_chs: ChsAddress::from_bytes(rec.bytes("starting_chs_address")?),
            end_chs: ChsAddress::from_bytes(rec.bytes("ending_chs_address")?),
            first_sector: rec.uint("first_sector_address")? as u32,
            first_byte_offset: rec.uint("first_byte_address")?,
            sector_count: rec.uint("number_of_sectors")? as u32,
        })
    }

    pub fn size_bytes(&self) -> u64 {
        self.sector_count as u64 * SECTOR_SIZE
    }

    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }
}

/// Render a partition list as a table, one row per descriptor.
pub fn partitions_to_string(partitions: &[PartitionDescriptor]) -> String {
    let mut t = Table::new();
    t.add_row(row![b => "#", "Type", "Raw", "Boot", "First sector", "Offset", "Sectors"]);
    for (i, p) in partitions.iter().enumerate() {
        t.add_row(row![
            i,
            format!("{:?}", p.kind),
            format!("0x{:02X}", p.raw_type),
            if p.bootable { "*" } else { "" },
            p.first_sector,
            format!("0x{:X}", p.first_byte_offset),
            p.sector_count
        ]);
    }
    t.to_string()
}

/// Read the boot-sector-shaped structure at `at` and return its four raw entries.
pub fn read_boot_record<T: Read + Seek>(body: &mut T, at: u64) -> Result<Vec<Vec<u8>>> {
    body.seek(SeekFrom::Start(at))?;
    let mut sector = vec![0u8; SECTOR_SIZE as usize];
    let got = fill(body, &mut sector)?;
    sector.truncate(got);

    let rec = BOOT_RECORD.decode(&sector)?;
    Ok(rec
        .bytes("partition_entries")?
        .chunks_exact(PARTITION_ENTRY_SIZE)
        .map(|c| c.to_vec())
        .collect())
}

/// Identify a volume boot sector sitting at offset 0 (an image of a single partition).
fn detect_bare_volume(sector: &[u8]) -> Option<PartitionType> {
    if sector.len() < SECTOR_SIZE as usize || sector[0x1FE..0x200] != MAGIC_END_SECTION {
        return None;
    }
    let oem = &sector[3..11];
    if oem.windows(4).any(|w| w == b"NTFS") {
        Some(PartitionType::Ntfs)
    } else if oem.windows(5).any(|w| w == b"MSDOS") || &sector[0x52..0x5A] == b"FAT32   " {
        Some(PartitionType::Fat32)
    } else {
        None
    }
}

/// Flatten the partition table into concrete partitions, in on-disk order.
pub fn read_partition_table<T: Read + Seek>(
    body: &mut T,
    options: &ParseOptions,
) -> Result<Vec<PartitionDescriptor>> {
    body.seek(SeekFrom::Start(0))?;
    let mut sector = vec![0u8; SECTOR_SIZE as usize];
    let got = fill(body, &mut sector)?;
    sector.truncate(got);

    if let Some(kind) = detect_bare_volume(&sector) {
        let len = body.seek(SeekFrom::End(0))?;
        info!("Sector 0 is a {:?} volume boot sector, no partition table", kind);
        return Ok(vec![PartitionDescriptor {
            kind,
            raw_type: 0,
            bootable: false,
            start_chs: ChsAddress::from_bytes(&[0, 0, 0]),
            end_chs: ChsAddress::from_bytes(&[0, 0, 0]),
            first_sector: 0,
            first_byte_offset: 0,
            sector_count: (len / SECTOR_SIZE).min(u32::MAX as u64) as u32,
        }]);
    }

    let mut out = Vec::new();
    for raw in read_boot_record(body, 0)? {
        let entry = PartitionDescriptor::from_bytes(&raw, 0)?;
        match entry.kind {
            PartitionType::Ignored => continue,
            PartitionType::Extended => walk_extended(body, &entry, options, &mut out)?,
            _ => {
                debug!(
                    "Partition {:?} at 0x{:X} ({} sectors)",
                    entry.kind, entry.first_byte_offset, entry.sector_count
                );
                out.push(entry)
            }
        }
    }
    info!("Found {} partition(s)", out.len());
    Ok(out)
}

/// Follow the EBR chain of one extended partition.
///
/// Slot 0 of each EBR is relative to that EBR, slot 1 (the next EBR) is
/// relative to the start of the first extended partition.
fn walk_extended<T: Read + Seek>(
    body: &mut T,
    extended: &PartitionDescriptor,
    options: &ParseOptions,
    out: &mut Vec<PartitionDescriptor>,
) -> Result<()> {
    let ext_start = extended.first_byte_offset;
    let mut ebr_at = ext_start;
    let mut visited = HashSet::new();

    for _ in 0..options.max_ebr_chain {
        if !visited.insert(ebr_at) {
            warn!("EBR chain loops back to 0x{:X}, stopping", ebr_at);
            return Ok(());
        }

        let entries = match read_boot_record(body, ebr_at) {
            Ok(e) => e,
            Err(e @ (ExhumeError::BadMagic { .. } | ExhumeError::Truncated { .. })) => {
                warn!("Unreadable EBR at 0x{:X}: {}", ebr_at, e);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let real = PartitionDescriptor::from_bytes(&entries[0], ebr_at)?;
        let next = PartitionDescriptor::from_bytes(&entries[1], ext_start)?;

        match real.kind {
            PartitionType::Ignored => debug!("Empty EBR at 0x{:X}", ebr_at),
            PartitionType::Extended => warn!("Nested extended entry in EBR at 0x{:X}", ebr_at),
            _ => {
                debug!(
                    "Logical partition {:?} at 0x{:X}",
                    real.kind, real.first_byte_offset
                );
                out.push(real);
            }
        }

        if next.kind == PartitionType::Ignored {
            return Ok(());
        }
        ebr_at = next.first_byte_offset;
    }

    warn!(
        "EBR chain longer than {} records, truncating",
        options.max_ebr_chain
    );
    Ok(())
}
