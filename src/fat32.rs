// Sources:
// - https://en.wikipedia.org/wiki/Design_of_the_FAT_file_system
// - https://academy.cba.mit.edu/classes/networking_communications/SD/FAT.pdf

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info, warn};
use prettytable::{Table, row};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::io::{Read, Seek, SeekFrom};

use crate::config::ParseOptions;
use crate::entry::{ClusterRun, Entry, EntryTable, FsKind, average_cluster};
use crate::error::{ExhumeError, Result};
use crate::fdt::{ATTR_LONG_NAME, ENTRY_SIZE, LfnEntry, LfnOutcome, LfnState, ShortEntry};
use crate::layout::{Field, FieldKind, Layout};
use crate::mbr::MAGIC_END_SECTION;
use crate::stream::{ClusterGeometry, ClusterStream, fill};

pub const FAT_ENTRY_MASK: u32 = 0x0FFF_FFFF;
pub const END_OF_CHAIN: u32 = 0x0FFF_FFF8;
pub const BAD_CLUSTER: u32 = 0x0FFF_FFF7;
pub const FREE_CLUSTER: u32 = 0;

const FS_INFO_LEAD_SIGNATURE: &[u8; 4] = b"RRaA";
const SYSTEM_VOLUME_INFORMATION: &str = "System Volume Information";
const FAT_READ_CHUNK: usize = 1 << 20;

pub const FAT32_BOOT_SECTOR: Layout = Layout::new(
    "FAT32 boot sector",
    &[
        Field::seq("jump_instruction", FieldKind::Bytes(3)),
        Field::seq("oem_name", FieldKind::Bytes(8)),
        Field::seq("bytes_per_sector", FieldKind::U16),
        Field::seq("sectors_per_cluster", FieldKind::U8),
        Field::seq("reserved_sectors", FieldKind::U16),
        Field::seq("number_of_fats", FieldKind::U8),
        Field::skip(4),
        Field::seq("media_descriptor", FieldKind::U8),
        Field::skip(2),
        Field::seq("sectors_per_track", FieldKind::U16),
        Field::seq("number_of_heads", FieldKind::U16),
        Field::seq("hidden_sectors", FieldKind::U32),
        Field::seq("total_sectors", FieldKind::U32),
        Field::seq("sectors_per_fat", FieldKind::U32),
        Field::seq("drive_description", FieldKind::U16Be),
        Field::seq("version", FieldKind::U16),
        Field::seq("root_cluster", FieldKind::U32),
        Field::seq("fs_info_sector", FieldKind::U16),
        Field::seq("backup_boot_sector", FieldKind::U16),
        Field::skip(12),
        Field::seq("drive_number", FieldKind::U8),
        Field::skip(1),
        Field::seq("extended_boot_signature", FieldKind::U8),
        Field::seq("volume_id", FieldKind::U32),
        Field::seq("volume_label", FieldKind::Bytes(11)),
        Field::seq("filesystem_type", FieldKind::Bytes(8)),
    ],
)
.with_magic(0x1FE, &MAGIC_END_SECTION);

pub const FS_INFO_SECTOR: Layout = Layout::new(
    "FS information sector",
    &[
        Field::at("lead_signature", 0x000, FieldKind::Bytes(4)),
        Field::at("free_cluster_count", 0x1E8, FieldKind::U32),
        Field::at("next_free_cluster", 0x1EC, FieldKind::U32),
        Field::at("trail_signature", 0x1FE, FieldKind::Bytes(2)),
    ],
);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Fat32BootSector {
    pub oem_name: String,
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub number_of_fats: u8,
    pub media_descriptor: u8,
    pub sectors_per_track: u16,
    pub number_of_heads: u16,
    pub hidden_sectors: u32,
    pub total_sectors: u32,
    pub sectors_per_fat: u32,
    /// Raw big-endian word; mirroring flags live in it.
    pub drive_description: u16,
    pub version: u16,
    pub root_cluster: u32,
    pub fs_info_sector: u16,
    pub backup_boot_sector: u16,
    pub drive_number: u8,
    pub extended_boot_signature: u8,
    pub volume_id: u32,
    pub volume_label: String,
    pub filesystem_type: String,
}

impl Fat32BootSector {
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let rec = FAT32_BOOT_SECTOR.decode(buf)?;
        let bs = Self {
            oem_name: rec.text("oem_name")?,
            bytes_per_sector: rec.uint("bytes_per_sector")? as u16,
            sectors_per_cluster: rec.uint("sectors_per_cluster")? as u8,
            reserved_sectors: rec.uint("reserved_sectors")? as u16,
            number_of_fats: rec.uint("number_of_fats")? as u8,
            media_descriptor: rec.uint("media_descriptor")? as u8,
            sectors_per_track: rec.uint("sectors_per_track")? as u16,
            number_of_heads: rec.uint("number_of_heads")? as u16,
            hidden_sectors: rec.uint("hidden_sectors")? as u32,
            total_sectors: rec.uint("total_sectors")? as u32,
            sectors_per_fat: rec.uint("sectors_per_fat")? as u32,
            drive_description: rec.uint("drive_description")? as u16,
            version: rec.uint("version")? as u16,
            root_cluster: rec.uint("root_cluster")? as u32,
            fs_info_sector: rec.uint("fs_info_sector")? as u16,
            backup_boot_sector: rec.uint("backup_boot_sector")? as u16,
            drive_number: rec.uint("drive_number")? as u8,
            extended_boot_signature: rec.uint("extended_boot_signature")? as u8,
            volume_id: rec.uint("volume_id")? as u32,
            volume_label: rec.text("volume_label")?,
            filesystem_type: rec.text("filesystem_type")?,
        };
        bs.validate()?;
        Ok(bs)
    }

    fn validate(&self) -> Result<()> {
        if !matches!(self.bytes_per_sector, 512 | 1024 | 2048 | 4096) {
            return Err(ExhumeError::InvalidBootSector(format!(
                "{} bytes per sector",
                self.bytes_per_sector
            )));
        }
        if !self.sectors_per_cluster.is_power_of_two() {
            return Err(ExhumeError::InvalidBootSector(format!(
                "{} sectors per cluster",
                self.sectors_per_cluster
            )));
        }
        if self.sectors_per_fat == 0 || self.number_of_fats == 0 {
            return Err(ExhumeError::InvalidBootSector(
                "no file allocation table (zero sized or zero copies)".into(),
            ));
        }
        let fat_sectors = self.number_of_fats as u64 * self.sectors_per_fat as u64;
        if self.reserved_sectors as u64 + fat_sectors > self.total_sectors as u64 {
            return Err(ExhumeError::InvalidBootSector(format!(
                "{} FAT(s) of {} sectors do not fit in {} sectors",
                self.number_of_fats, self.sectors_per_fat, self.total_sectors
            )));
        }
        if self.root_cluster < 2 {
            return Err(ExhumeError::InvalidBootSector(format!(
                "root directory at cluster {}",
                self.root_cluster
            )));
        }
        Ok(())
    }

    pub fn bytes_per_cluster(&self) -> u64 {
        self.bytes_per_sector as u64 * self.sectors_per_cluster as u64
    }

    pub fn bytes_per_fat(&self) -> u64 {
        self.sectors_per_fat as u64 * self.bytes_per_sector as u64
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }

    pub fn to_string(&self) -> String {
        let mut t = Table::new();
        t.add_row(row![b -> "OEM name", self.oem_name]);
        t.add_row(row![b -> "Bytes per sector", self.bytes_per_sector]);
        t.add_row(row![b -> "Sectors per cluster", self.sectors_per_cluster]);
        t.add_row(row![b -> "Reserved sectors", self.reserved_sectors]);
        t.add_row(row![b -> "Number of FATs", self.number_of_fats]);
        t.add_row(row![b -> "Sectors per FAT", self.sectors_per_fat]);
        t.add_row(row![b -> "Total sectors", self.total_sectors]);
        t.add_row(row![b -> "Drive description", format!("0x{:04X}", self.drive_description)]);
        t.add_row(row![b -> "Root cluster", self.root_cluster]);
        t.add_row(row![b -> "FS info sector", self.fs_info_sector]);
        t.add_row(row![b -> "Backup boot sector", self.backup_boot_sector]);
        t.add_row(row![b -> "Volume id", format!("0x{:08X}", self.volume_id)]);
        t.add_row(row![b -> "Volume label", self.volume_label]);
        t.add_row(row![b -> "Filesystem type", self.filesystem_type]);
        t.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FsInfo {
    pub signature_valid: bool,
    pub free_cluster_count: u32,
    pub next_free_cluster: u32,
}

impl FsInfo {
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let rec = FS_INFO_SECTOR.decode(buf)?;
        let signature_valid = rec.bytes("lead_signature")? == FS_INFO_LEAD_SIGNATURE
            && rec.bytes("trail_signature")? == MAGIC_END_SECTION;
        if !signature_valid {
            warn!("FS information sector signature mismatch, hints are unreliable");
        }
        Ok(Self {
            signature_valid,
            free_cluster_count: rec.uint("free_cluster_count")? as u32,
            next_free_cluster: rec.uint("next_free_cluster")? as u32,
        })
    }
}

/// Ordered runs of one file plus their weighted mean position.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClusterChain {
    pub runs: Vec<ClusterRun>,
    pub average_cluster: f64,
}

impl ClusterChain {
    fn from_runs(runs: Vec<ClusterRun>) -> Self {
        let average_cluster = average_cluster(&runs);
        Self {
            runs,
            average_cluster,
        }
    }
}

fn push_cluster(runs: &mut Vec<ClusterRun>, cluster: u64) {
    match runs.last_mut() {
        Some(last) if last.end + 1 == cluster => last.end = cluster,
        _ => runs.push(ClusterRun::new(cluster, cluster)),
    }
}

/// Every cluster chain of one FAT copy, keyed by head cluster.
#[derive(Debug, Clone)]
pub struct ClusterMap {
    table: Vec<u32>,
    chains: BTreeMap<u64, Vec<ClusterRun>>,
}

impl ClusterMap {
    /// Build the map from raw FAT entries (index = cluster number).
    pub fn build(raw: Vec<u32>) -> Result<Self> {
        let table: Vec<u32> = raw.into_iter().map(|v| v & FAT_ENTRY_MASK).collect();
        match table.first() {
            Some(&media) if media & END_OF_CHAIN == END_OF_CHAIN => {}
            Some(&media) => {
                return Err(ExhumeError::InvalidFat(format!(
                    "entry 0 is 0x{:08X}, expected an end-of-chain marker",
                    media
                )));
            }
            None => return Err(ExhumeError::InvalidFat("empty table".into())),
        }

        let n = table.len();
        let mut has_predecessor = vec![false; n];
        for c in 2..n {
            if let Some(next) = Self::next_of(&table, c as u64) {
                has_predecessor[next as usize] = true;
            }
        }

        let mut claimed = vec![false; n];
        let mut chains = BTreeMap::new();
        for head in 2..n {
            if has_predecessor[head] || !Self::is_allocated(table[head]) {
                continue;
            }
            let mut runs = Vec::new();
            let mut cur = head;
            loop {
                if claimed[cur] {
                    warn!("Cluster {} is cross-linked, chain of {} cut", cur, head);
                    break;
                }
                claimed[cur] = true;
                push_cluster(&mut runs, cur as u64);
                match Self::next_of(&table, cur as u64) {
                    Some(next) => cur = next as usize,
                    None => break,
                }
            }
            chains.insert(head as u64, runs);
        }

        debug!("FAT holds {} entries and {} chains", n, chains.len());
        Ok(Self { table, chains })
    }

    fn is_allocated(value: u32) -> bool {
        value != FREE_CLUSTER && value != BAD_CLUSTER
    }

    /// Next cluster of `cluster`, or `None` when its chain ends here.
    fn next_of(table: &[u32], cluster: u64) -> Option<u32> {
        let value = *table.get(cluster as usize)?;
        if value & END_OF_CHAIN == END_OF_CHAIN
            || value == BAD_CLUSTER
            || value == FREE_CLUSTER
            || value < 2
            || value as usize >= table.len()
        {
            return None;
        }
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn chain_count(&self) -> usize {
        self.chains.len()
    }

    pub fn raw_entries(&self) -> &[u32] {
        &self.table
    }

    pub fn chain(&self, head: u64) -> Option<&[ClusterRun]> {
        self.chains.get(&head).map(|v| v.as_slice())
    }

    /// Runs of the chain starting at `first`, empty for free or
    /// out-of-range clusters.
    pub fn resolve(&self, first: u64) -> ClusterChain {
        if let Some(runs) = self.chains.get(&first) {
            return ClusterChain::from_runs(runs.clone());
        }
        if first < 2 || first as usize >= self.table.len() || !Self::is_allocated(self.table[first as usize]) {
            return ClusterChain::default();
        }

        // mid-chain start or a headless cycle
        let mut runs = Vec::new();
        let mut seen = HashSet::new();
        let mut cur = first;
        while seen.insert(cur) {
            push_cluster(&mut runs, cur);
            match Self::next_of(&self.table, cur) {
                Some(next) => cur = next as u64,
                None => break,
            }
        }
        ClusterChain::from_runs(runs)
    }
}

pub struct FAT32<T: Read + Seek> {
    pub body: T,
    pub base_offset: u64,
    pub boot_sector: Fat32BootSector,
    pub fs_info: Option<FsInfo>,
    /// Entries where the second FAT copy disagrees with the first.
    pub fat_mismatches: Option<u64>,
    options: ParseOptions,
    fat: Option<ClusterMap>,
}

impl<T: Read + Seek> FAT32<T> {
    /// Read the boot sector found `base_offset` bytes into `body`.
    pub fn new(mut body: T, base_offset: u64, options: &ParseOptions) -> Result<Self> {
        body.seek(SeekFrom::Start(base_offset))?;
        let mut sector = vec![0u8; 512];
        let got = fill(&mut body, &mut sector)?;
        sector.truncate(got);
        let boot_sector = Fat32BootSector::from_bytes(&sector)?;
        info!(
            "FAT32 volume at 0x{:X}: {} bytes per sector, {} bytes per cluster",
            base_offset,
            boot_sector.bytes_per_sector,
            boot_sector.bytes_per_cluster()
        );

        let mut fs = Self {
            body,
            base_offset,
            boot_sector,
            fs_info: None,
            fat_mismatches: None,
            options: options.clone(),
            fat: None,
        };
        fs.fs_info = fs.read_fs_info()?;
        Ok(fs)
    }

    fn read_fs_info(&mut self) -> Result<Option<FsInfo>> {
        let sector = self.boot_sector.fs_info_sector;
        if sector == 0 || sector == 0xFFFF {
            debug!("No FS information sector");
            return Ok(None);
        }
        let at = self.base_offset + sector as u64 * self.boot_sector.bytes_per_sector as u64;
        self.body.seek(SeekFrom::Start(at))?;
        let mut buf = vec![0u8; 512];
        let got = fill(&mut self.body, &mut buf)?;
        buf.truncate(got);
        match FsInfo::from_bytes(&buf) {
            Ok(info) => Ok(Some(info)),
            Err(e) => {
                warn!("FS information sector at 0x{:X} unreadable: {}", at, e);
                Ok(None)
            }
        }
    }

    pub fn fat_offset(&self) -> u64 {
        self.base_offset
            + self.boot_sector.reserved_sectors as u64 * self.boot_sector.bytes_per_sector as u64
    }

    pub fn geometry(&self) -> ClusterGeometry {
        ClusterGeometry {
            data_offset: self.fat_offset()
                + self.boot_sector.number_of_fats as u64 * self.boot_sector.bytes_per_fat(),
            bytes_per_cluster: self.boot_sector.bytes_per_cluster(),
        }
    }

    /// Absolute byte offset of a cluster in the image.
    pub fn cluster_to_byte(&self, cluster: u64) -> u64 {
        self.geometry().cluster_to_byte(cluster)
    }

    fn read_fat_copy(&mut self, copy: u8) -> Result<Vec<u32>> {
        let size = self.boot_sector.bytes_per_fat();
        let at = self.fat_offset() + copy as u64 * size;
        self.body.seek(SeekFrom::Start(at))?;
        debug!("Reading FAT #{} at 0x{:X} ({} bytes)", copy + 1, at, size);

        let mut entries = Vec::with_capacity((size.min(FAT_READ_CHUNK as u64) / 4) as usize);
        let mut remaining = size as usize;
        let mut chunk = vec![0u8; FAT_READ_CHUNK.min(remaining)];
        while remaining > 0 {
            let want = chunk.len().min(remaining);
            let got = fill(&mut self.body, &mut chunk[..want])?;
            entries.extend(chunk[..got - got % 4].chunks_exact(4).map(LittleEndian::read_u32));
            if got < want {
                warn!(
                    "FAT #{} truncated after {} entries",
                    copy + 1,
                    entries.len()
                );
                break;
            }
            remaining -= got;
        }
        Ok(entries)
    }

    /// Load and index the first FAT if not loaded yet.
    pub fn ensure_fat(&mut self) -> Result<&ClusterMap> {
        if self.fat.is_none() {
            info!("Reading file allocation table");
            let raw = self.read_fat_copy(0)?;
            if self.options.read_fat2 && self.boot_sector.number_of_fats > 1 {
                let second = self.read_fat_copy(1)?;
                let mismatches = raw
                    .iter()
                    .zip(second.iter())
                    .filter(|(a, b)| (**a & FAT_ENTRY_MASK) != (**b & FAT_ENTRY_MASK))
                    .count() as u64
                    + raw.len().abs_diff(second.len()) as u64;
                if mismatches > 0 {
                    warn!("FAT copies disagree on {} entries", mismatches);
                } else {
                    info!("FAT copies agree");
                }
                self.fat_mismatches = Some(mismatches);
            }
            self.fat = Some(ClusterMap::build(raw)?);
        }
        self.fat
            .as_ref()
            .ok_or(ExhumeError::InvalidFat("table not loaded".into()))
    }

    /// Walk the directory tree breadth first and build the entry table.
    pub fn entries(&mut self) -> Result<EntryTable> {
        self.ensure_fat()?;
        let geometry = self.geometry();
        let root = self.boot_sector.root_cluster as u64;

        let Self {
            body, fat, options, ..
        } = self;
        let fat = fat
            .as_ref()
            .ok_or(ExhumeError::InvalidFat("table not loaded".into()))?;

        let root_chain = fat.resolve(root);
        if root_chain.runs.is_empty() {
            return Err(ExhumeError::InvalidFat(format!(
                "root directory cluster {} is not allocated",
                root
            )));
        }

        let mut walker = DirectoryWalker {
            body,
            fat,
            geometry,
            options,
            table: EntryTable::new(FsKind::Fat32),
            queue: VecDeque::new(),
            visited: HashSet::from([root]),
            next_id: 0,
        };
        walker.queue.push_back(("/".to_string(), root_chain.runs));

        while let Some((path, runs)) = walker.queue.pop_front() {
            if let Err(e) = walker.walk(&path, &runs) {
                warn!("Directory '{}' abandoned: {}", path, e);
                walker.table.skip(path, e.to_string());
            }
        }

        info!(
            "Found {} files and directories, {} skipped",
            walker.table.len(),
            walker.table.skipped.len()
        );
        Ok(walker.table)
    }
}

/// Child path under `parent`, the root being `/`.
fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

struct DirectoryWalker<'a, T: Read + Seek> {
    body: &'a mut T,
    fat: &'a ClusterMap,
    geometry: ClusterGeometry,
    options: &'a ParseOptions,
    table: EntryTable,
    queue: VecDeque<(String, Vec<ClusterRun>)>,
    visited: HashSet<u64>,
    next_id: u64,
}

impl<T: Read + Seek> DirectoryWalker<'_, T> {
    fn walk(&mut self, path: &str, runs: &[ClusterRun]) -> Result<()> {
        debug!("Walking '{}' ({} runs)", path, runs.len());
        let mut stream = ClusterStream::new(&mut *self.body, runs, self.geometry);
        let mut lfn = LfnState::default();

        loop {
            let raw = match stream.read(ENTRY_SIZE) {
                Ok(raw) => raw,
                Err(ExhumeError::Exhausted) => break,
                Err(e) => return Err(e),
            };
            if raw.len() < ENTRY_SIZE || raw[0] == 0 {
                continue;
            }

            if raw[11] == ATTR_LONG_NAME {
                let fragment = LfnEntry::from_bytes(&raw)?;
                if lfn.feed(&fragment) == LfnOutcome::Abort {
                    warn!("Long filename checksums disagree in '{}', directory abandoned", path);
                    self.table
                        .skip(path, "long filename fragments disagree on checksum");
                    break;
                }
                continue;
            }

            let short = ShortEntry::from_bytes(&raw)?;
            let long = lfn.take();

            if short.is_volume_label() {
                if !short.is_deleted() {
                    debug!("Volume label '{}'", short.label());
                    self.table.volume_label = Some(short.label());
                }
                continue;
            }

            let name = match long {
                Some((checksum, _)) if !short.is_deleted() && checksum != short.checksum() => {
                    let location = child_path(path, &short.short_name());
                    warn!(
                        "'{}': long filename checksum 0x{:02X} != 0x{:02X}, entry dropped",
                        location,
                        checksum,
                        short.checksum()
                    );
                    self.table.skip(location, "long filename checksum mismatch");
                    continue;
                }
                Some((_, name)) => name,
                None => short.short_name(),
            };
            if name == "." || name == ".." {
                continue;
            }

            let name = if short.is_deleted() {
                format!("(deleted) {}", name)
            } else {
                name
            };
            let full_path = child_path(path, &name);

            let (Some(created), Some(modified), Some(accessed)) =
                (short.created(), short.modified(), short.accessed())
            else {
                warn!("'{}': invalid timestamp, entry dropped", full_path);
                self.table.skip(full_path, "invalid date or time");
                continue;
            };

            let first_cluster = short.first_cluster as u64;
            let chain = self.fat.resolve(first_cluster);

            if short.is_directory() && !short.is_deleted() && !chain.runs.is_empty() {
                if name == SYSTEM_VOLUME_INFORMATION
                    && !self.options.recurse_system_volume_information
                {
                    debug!("Not descending into '{}'", full_path);
                } else if !self.visited.insert(first_cluster) {
                    warn!(
                        "'{}' points back to directory cluster {}, not walked again",
                        full_path, first_cluster
                    );
                } else {
                    self.queue.push_back((full_path.clone(), chain.runs.clone()));
                }
            }

            self.table.entries.push(Entry {
                id: self.next_id,
                full_path,
                is_directory: short.is_directory(),
                is_deleted: short.is_deleted(),
                first_cluster,
                clusters: chain.runs,
                average_cluster: chain.average_cluster,
                size: if short.is_directory() { 0 } else { short.file_length as u64 },
                create_time: Some(created),
                modify_time: Some(modified),
                access_time: Some(accessed),
                ntfs: None,
            });
            self.next_id += 1;
        }
        Ok(())
    }
}
