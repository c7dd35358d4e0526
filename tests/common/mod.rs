//! In-memory FAT32 and NTFS images for the integration tests.
#![allow(dead_code)]

pub const SECTOR: usize = 512;

/// 2020-01-15
pub const FAT_DATE: u16 = (40 << 9) | (1 << 5) | 15;
/// 10:30:00
pub const FAT_TIME: u16 = (10 << 11) | (30 << 5);
pub const FAT_EOC: u32 = 0x0FFF_FFFF;

/// A classical MBR with up to four `(type, first LBA, sector count)` entries.
pub fn mbr(entries: &[(u8, u32, u32)]) -> Vec<u8> {
    let mut s = vec![0u8; SECTOR];
    for (i, (ptype, lba, count)) in entries.iter().enumerate() {
        let at = 0x1BE + i * 16;
        s[at + 4] = *ptype;
        s[at + 8..at + 12].copy_from_slice(&lba.to_le_bytes());
        s[at + 12..at + 16].copy_from_slice(&count.to_le_bytes());
    }
    s[0x1FE] = 0x55;
    s[0x1FF] = 0xAA;
    s
}

/// Install an update sequence array: the last two bytes of every sector are
/// saved at `usa_offset` and replaced with the sequence number.
pub fn protect(buf: &mut [u8], usa_offset: usize, usn: u16) {
    let sectors = buf.len() / SECTOR;
    buf[4..6].copy_from_slice(&(usa_offset as u16).to_le_bytes());
    buf[6..8].copy_from_slice(&((sectors + 1) as u16).to_le_bytes());
    buf[usa_offset..usa_offset + 2].copy_from_slice(&usn.to_le_bytes());
    for i in 1..=sectors {
        let end = i * SECTOR - 2;
        buf[usa_offset + 2 * i] = buf[end];
        buf[usa_offset + 2 * i + 1] = buf[end + 1];
        buf[end..end + 2].copy_from_slice(&usn.to_le_bytes());
    }
}

/* ---------------------------------------------------------------- FAT32 */

pub fn dos_checksum(raw_name: &[u8; 11]) -> u8 {
    let mut sum = 0u8;
    for &c in raw_name {
        sum = (if sum & 1 != 0 { 0x80u8 } else { 0 })
            .wrapping_add(sum >> 1)
            .wrapping_add(c);
    }
    sum
}

pub fn short_entry(name: &[u8; 11], attr: u8, cluster: u32, size: u32) -> [u8; 32] {
    let mut e = [0u8; 32];
    e[..11].copy_from_slice(name);
    e[11] = attr;
    e[13] = 100;
    e[14..16].copy_from_slice(&FAT_TIME.to_le_bytes());
    e[16..18].copy_from_slice(&FAT_DATE.to_le_bytes());
    e[18..20].copy_from_slice(&FAT_DATE.to_le_bytes());
    e[20..22].copy_from_slice(&((cluster >> 16) as u16).to_le_bytes());
    e[22..24].copy_from_slice(&FAT_TIME.to_le_bytes());
    e[24..26].copy_from_slice(&FAT_DATE.to_le_bytes());
    e[26..28].copy_from_slice(&(cluster as u16).to_le_bytes());
    e[28..32].copy_from_slice(&size.to_le_bytes());
    e
}

/// LFN fragments for `long`, in on-disk order (last fragment first).
pub fn long_entries(long: &str, checksum: u8) -> Vec<[u8; 32]> {
    let mut units: Vec<u16> = long.encode_utf16().collect();
    if units.len() % 13 != 0 {
        units.push(0);
    }
    while units.len() % 13 != 0 {
        units.push(0xFFFF);
    }
    let count = units.len() / 13;

    let mut out = Vec::new();
    for n in (1..=count).rev() {
        let bytes: Vec<u8> = units[(n - 1) * 13..n * 13]
            .iter()
            .flat_map(|u| u.to_le_bytes())
            .collect();
        let mut e = [0u8; 32];
        e[0] = n as u8 | if n == count { 0x40 } else { 0 };
        e[1..11].copy_from_slice(&bytes[0..10]);
        e[11] = 0x0F;
        e[13] = checksum;
        e[14..26].copy_from_slice(&bytes[10..22]);
        e[28..32].copy_from_slice(&bytes[22..26]);
        out.push(e);
    }
    out
}

pub struct Fat32Image {
    pub data: Vec<u8>,
    pub sectors_per_cluster: usize,
    pub reserved: usize,
    pub sectors_per_fat: usize,
}

impl Fat32Image {
    /// Empty volume of `total_bytes`, one-sector clusters, root directory at cluster 2.
    pub fn new(total_bytes: usize) -> Self {
        let total_sectors = total_bytes / SECTOR;
        let sectors_per_fat = (total_sectors * 4).div_ceil(SECTOR);
        let mut img = Self {
            data: vec![0u8; total_bytes],
            sectors_per_cluster: 1,
            reserved: 32,
            sectors_per_fat,
        };

        let s = &mut img.data[..SECTOR];
        s[0..3].copy_from_slice(&[0xEB, 0x58, 0x90]);
        s[3..11].copy_from_slice(b"MSWIN4.1");
        s[0x0B..0x0D].copy_from_slice(&(SECTOR as u16).to_le_bytes());
        s[0x0D] = 1;
        s[0x0E..0x10].copy_from_slice(&32u16.to_le_bytes());
        s[0x10] = 2;
        s[0x15] = 0xF8;
        s[0x20..0x24].copy_from_slice(&(total_sectors as u32).to_le_bytes());
        s[0x24..0x28].copy_from_slice(&(sectors_per_fat as u32).to_le_bytes());
        s[0x2C..0x30].copy_from_slice(&2u32.to_le_bytes());
        s[0x30..0x32].copy_from_slice(&1u16.to_le_bytes());
        s[0x32..0x34].copy_from_slice(&6u16.to_le_bytes());
        s[0x40] = 0x80;
        s[0x42] = 0x29;
        s[0x43..0x47].copy_from_slice(&0x1234_ABCDu32.to_le_bytes());
        s[0x47..0x52].copy_from_slice(b"NO NAME    ");
        s[0x52..0x5A].copy_from_slice(b"FAT32   ");
        s[0x1FE] = 0x55;
        s[0x1FF] = 0xAA;

        let info = &mut img.data[SECTOR..2 * SECTOR];
        info[0..4].copy_from_slice(b"RRaA");
        info[0x1E4..0x1E8].copy_from_slice(b"rrAa");
        info[0x1E8..0x1EC].copy_from_slice(&1000u32.to_le_bytes());
        info[0x1EC..0x1F0].copy_from_slice(&6u32.to_le_bytes());
        info[0x1FE] = 0x55;
        info[0x1FF] = 0xAA;

        img.set_fat(0, 0x0FFF_FFF8);
        img.set_fat(1, FAT_EOC);
        img.set_fat(2, FAT_EOC);
        img
    }

    pub fn set_fat_copy(&mut self, copy: usize, cluster: u32, value: u32) {
        let at = (self.reserved + copy * self.sectors_per_fat) * SECTOR + cluster as usize * 4;
        self.data[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn set_fat(&mut self, cluster: u32, value: u32) {
        self.set_fat_copy(0, cluster, value);
        self.set_fat_copy(1, cluster, value);
    }

    /// Link `clusters` in order and terminate the chain.
    pub fn chain(&mut self, clusters: &[u32]) {
        for pair in clusters.windows(2) {
            self.set_fat(pair[0], pair[1]);
        }
        if let Some(last) = clusters.last() {
            self.set_fat(*last, FAT_EOC);
        }
    }

    pub fn cluster_offset(&self, cluster: u32) -> usize {
        (self.reserved + 2 * self.sectors_per_fat) * SECTOR
            + (cluster as usize - 2) * self.sectors_per_cluster * SECTOR
    }

    /// Write directory records from the start of `cluster`.
    pub fn write_dir(&mut self, cluster: u32, entries: &[[u8; 32]]) {
        let mut at = self.cluster_offset(cluster);
        for e in entries {
            self.data[at..at + 32].copy_from_slice(e);
            at += 32;
        }
    }

    /// The volume with `/A.TXT` (cluster 3), `/SUB` (cluster 4) and `/SUB/B.TXT` (cluster 5).
    pub fn scenario(total_bytes: usize) -> Self {
        let mut img = Self::new(total_bytes);
        img.chain(&[3]);
        img.chain(&[4]);
        img.chain(&[5]);
        img.write_dir(
            2,
            &[
                short_entry(b"EVIDENCE   ", 0x08, 0, 0),
                short_entry(b"A       TXT", 0x20, 3, 10),
                short_entry(b"SUB        ", 0x10, 4, 0),
            ],
        );
        img.write_dir(
            4,
            &[
                short_entry(b".          ", 0x10, 4, 0),
                short_entry(b"..         ", 0x10, 0, 0),
                short_entry(b"B       TXT", 0x20, 5, 42),
            ],
        );
        img
    }
}

/* ----------------------------------------------------------------- NTFS */

pub const NTFS_CLUSTER: usize = 4096;
pub const MFT_CLUSTER: usize = 4;
pub const RECORD_SIZE: usize = 1024;
/// `$MFT` spans 16 clusters, so 64 records.
pub const MFT_RECORDS: usize = 64;
pub const FILETIME_2019: u64 = 132_000_000_000_000_000;
/// Size the boot sector claims. Only the clusters in use are materialised.
pub const VOLUME_CLUSTERS: u64 = 4096;

fn attribute_resident(kind: u32, value: &[u8]) -> Vec<u8> {
    let len = (0x18 + value.len() + 7) & !7;
    let mut a = vec![0u8; len];
    a[0..4].copy_from_slice(&kind.to_le_bytes());
    a[4..8].copy_from_slice(&(len as u32).to_le_bytes());
    a[0x10..0x14].copy_from_slice(&(value.len() as u32).to_le_bytes());
    a[0x14..0x16].copy_from_slice(&0x18u16.to_le_bytes());
    a[0x18..0x18 + value.len()].copy_from_slice(value);
    a
}

fn attribute_non_resident(kind: u32, run_list: &[u8], real_size: u64) -> Vec<u8> {
    let len = (0x40 + run_list.len() + 1 + 7) & !7;
    let mut a = vec![0u8; len];
    a[0..4].copy_from_slice(&kind.to_le_bytes());
    a[4..8].copy_from_slice(&(len as u32).to_le_bytes());
    a[8] = 1;
    a[0x20..0x22].copy_from_slice(&0x40u16.to_le_bytes());
    a[0x28..0x30].copy_from_slice(&real_size.next_multiple_of(NTFS_CLUSTER as u64).to_le_bytes());
    a[0x30..0x38].copy_from_slice(&real_size.to_le_bytes());
    a[0x38..0x40].copy_from_slice(&real_size.to_le_bytes());
    a[0x40..0x40 + run_list.len()].copy_from_slice(run_list);
    a
}

fn standard_information(filetime: u64) -> Vec<u8> {
    let mut v = vec![0u8; 0x48];
    for at in [0, 8, 16, 24] {
        v[at..at + 8].copy_from_slice(&filetime.to_le_bytes());
    }
    v
}

/// A `$FILE_NAME` value, also used as an index entry key.
pub fn file_name_value(parent: u64, parent_seq: u16, namespace: u8, name: &str) -> Vec<u8> {
    let mut v = vec![0u8; 66];
    v[0..8].copy_from_slice(&(parent | (parent_seq as u64) << 48).to_le_bytes());
    for at in [8, 16, 24, 32] {
        v[at..at + 8].copy_from_slice(&(FILETIME_2019 + 10_000_000).to_le_bytes());
    }
    v[64] = name.encode_utf16().count() as u8;
    v[65] = namespace;
    v.extend(name.encode_utf16().flat_map(|u| u.to_le_bytes()));
    v
}

/// Index entries `(record, sequence, name)` laid out as one node, closed by the last-entry marker.
fn index_node_entries(entries: &[(u64, u16, &str)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (record, seq, name) in entries {
        let key = file_name_value(5, 5, 1, name);
        let len = (0x10 + key.len() + 7) & !7;
        let mut e = vec![0u8; len];
        e[0..8].copy_from_slice(&(record | (*seq as u64) << 48).to_le_bytes());
        e[8..10].copy_from_slice(&(len as u16).to_le_bytes());
        e[10..12].copy_from_slice(&(key.len() as u16).to_le_bytes());
        e[0x10..0x10 + key.len()].copy_from_slice(&key);
        out.extend(e);
    }
    let mut last = vec![0u8; 0x10];
    last[8..10].copy_from_slice(&0x10u16.to_le_bytes());
    last[12] = 0x02;
    out.extend(last);
    out
}

fn index_root_value(entries: &[(u64, u16, &str)], large: bool) -> Vec<u8> {
    let body = index_node_entries(entries);
    let mut v = vec![0u8; 0x20];
    v[0..4].copy_from_slice(&0x30u32.to_le_bytes());
    v[4..8].copy_from_slice(&1u32.to_le_bytes());
    v[8..12].copy_from_slice(&(NTFS_CLUSTER as u32).to_le_bytes());
    v[12] = 1;
    v[0x10..0x14].copy_from_slice(&0x10u32.to_le_bytes());
    v[0x14..0x18].copy_from_slice(&((0x10 + body.len()) as u32).to_le_bytes());
    v[0x18..0x1C].copy_from_slice(&((0x10 + body.len()) as u32).to_le_bytes());
    v[0x1C] = large as u8;
    v.extend(body);
    v
}

/// One `INDX` block of a cluster holding `entries`, fixups applied.
pub fn index_block(entries: &[(u64, u16, &str)]) -> Vec<u8> {
    index_block_with_slack(entries, &[])
}

/// Like [`index_block`], with stale `slack` entries left past the used part of the node.
pub fn index_block_with_slack(entries: &[(u64, u16, &str)], slack: &[(u64, u16, &str)]) -> Vec<u8> {
    let body = index_node_entries(entries);
    let stale = if slack.is_empty() { Vec::new() } else { index_node_entries(slack) };
    let mut b = vec![0u8; NTFS_CLUSTER];
    let at = 0x58 + body.len();
    b[at..at + stale.len()].copy_from_slice(&stale);
    b[0..4].copy_from_slice(b"INDX");
    b[0x18..0x1C].copy_from_slice(&0x40u32.to_le_bytes());
    b[0x1C..0x20].copy_from_slice(&((0x40 + body.len()) as u32).to_le_bytes());
    b[0x20..0x24].copy_from_slice(&((NTFS_CLUSTER - 0x18) as u32).to_le_bytes());
    b[0x58..0x58 + body.len()].copy_from_slice(&body);
    protect(&mut b, 0x28, 0x0007);
    b
}

/// What goes in one MFT record.
#[derive(Clone, Default)]
pub struct RecordTemplate {
    pub flags: u16,
    pub sequence: u16,
    pub link_count: u16,
    pub base_record: u64,
    pub names: Vec<(u64, u16, u8, String)>,
    pub data: Option<(Vec<u8>, u64)>,
    pub volume_name: Option<String>,
    pub index_root: Option<Vec<(u64, u16, String)>>,
    pub index_allocation: Option<Vec<u8>>,
    pub magic: Option<[u8; 4]>,
}

impl RecordTemplate {
    pub fn file(sequence: u16, parent: u64, parent_seq: u16, name: &str) -> Self {
        Self {
            flags: 0x01,
            sequence,
            link_count: 1,
            names: vec![(parent, parent_seq, 3, name.to_string())],
            ..Default::default()
        }
    }

    pub fn directory(sequence: u16, parent: u64, parent_seq: u16, name: &str) -> Self {
        Self {
            flags: 0x03,
            ..Self::file(sequence, parent, parent_seq, name)
        }
    }

    pub fn deleted(mut self) -> Self {
        self.flags &= !0x01;
        self
    }

    pub fn with_data(mut self, run_list: &[u8], real_size: u64) -> Self {
        self.data = Some((run_list.to_vec(), real_size));
        self
    }

    pub fn with_index(mut self, entries: &[(u64, u16, &str)]) -> Self {
        self.index_root = Some(
            entries
                .iter()
                .map(|(r, s, n)| (*r, *s, n.to_string()))
                .collect(),
        );
        self
    }

    pub fn encode(&self, number: u64) -> Vec<u8> {
        let mut buf = vec![0u8; RECORD_SIZE];
        buf[0..4].copy_from_slice(&self.magic.unwrap_or(*b"FILE"));
        buf[0x08..0x10].copy_from_slice(&(0x1000 + number).to_le_bytes());
        buf[0x10..0x12].copy_from_slice(&self.sequence.to_le_bytes());
        buf[0x12..0x14].copy_from_slice(&self.link_count.to_le_bytes());
        buf[0x14..0x16].copy_from_slice(&0x38u16.to_le_bytes());
        buf[0x16..0x18].copy_from_slice(&self.flags.to_le_bytes());
        buf[0x1C..0x20].copy_from_slice(&(RECORD_SIZE as u32).to_le_bytes());
        buf[0x20..0x28].copy_from_slice(&self.base_record.to_le_bytes());
        buf[0x2C..0x30].copy_from_slice(&(number as u32).to_le_bytes());

        let mut attrs = vec![attribute_resident(0x10, &standard_information(FILETIME_2019))];
        for (parent, seq, ns, name) in &self.names {
            attrs.push(attribute_resident(0x30, &file_name_value(*parent, *seq, *ns, name)));
        }
        if let Some(label) = &self.volume_name {
            let units: Vec<u8> = label.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
            attrs.push(attribute_resident(0x60, &units));
        }
        if let Some((run_list, size)) = &self.data {
            attrs.push(attribute_non_resident(0x80, run_list, *size));
        }
        if let Some(entries) = &self.index_root {
            let entries: Vec<(u64, u16, &str)> =
                entries.iter().map(|(r, s, n)| (*r, *s, n.as_str())).collect();
            attrs.push(attribute_resident(
                0x90,
                &index_root_value(&entries, self.index_allocation.is_some()),
            ));
        }
        if let Some(run_list) = &self.index_allocation {
            attrs.push(attribute_non_resident(0xA0, run_list, NTFS_CLUSTER as u64));
        }

        let mut off = 0x38;
        for a in attrs {
            buf[off..off + a.len()].copy_from_slice(&a);
            off += a.len();
        }
        buf[off..off + 4].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        buf[0x18..0x1C].copy_from_slice(&((off + 8) as u32).to_le_bytes());
        protect(&mut buf, 0x30, 0x0001);
        buf
    }
}

pub struct NtfsImage {
    pub records: Vec<Option<RecordTemplate>>,
    /// Raw clusters written after the MFT, by cluster number.
    pub clusters: Vec<(usize, Vec<u8>)>,
}

impl NtfsImage {
    /// The sixteen-cluster `$MFT` with the system records 0..=11 and a volume label.
    pub fn new() -> Self {
        const SYSTEM: [&str; 12] = [
            "$MFT", "$MFTMirr", "$LogFile", "$Volume", "$AttrDef", ".", "$Bitmap", "$Boot",
            "$BadClus", "$Secure", "$UpCase", "$Extend",
        ];
        let mut records = vec![None; MFT_RECORDS];
        for (n, name) in SYSTEM.iter().enumerate() {
            let seq = n.max(1) as u16;
            let template = if n == 5 || n == 11 {
                RecordTemplate::directory(seq, 5, 5, name)
            } else {
                RecordTemplate::file(seq, 5, 5, name)
            };
            records[n] = Some(template);
        }
        if let Some(mft) = records[0].as_mut() {
            // 16 clusters at LCN 4
            mft.data = Some((vec![0x11, 0x10, 0x04, 0x00], (MFT_RECORDS * RECORD_SIZE) as u64));
        }
        if let Some(volume) = records[3].as_mut() {
            volume.volume_name = Some("EVIDENCE".to_string());
        }
        Self {
            records,
            clusters: Vec::new(),
        }
    }

    pub fn set(&mut self, number: usize, template: RecordTemplate) -> &mut Self {
        self.records[number] = Some(template);
        self
    }

    pub fn write_cluster(&mut self, cluster: usize, bytes: Vec<u8>) -> &mut Self {
        self.clusters.push((cluster, bytes));
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mft_start = MFT_CLUSTER * NTFS_CLUSTER;
        let mut len = mft_start + MFT_RECORDS * RECORD_SIZE;
        for (cluster, bytes) in &self.clusters {
            len = len.max(cluster * NTFS_CLUSTER + bytes.len());
        }
        let mut img = vec![0u8; len];

        let s = &mut img[..SECTOR];
        s[0..3].copy_from_slice(&[0xEB, 0x52, 0x90]);
        s[3..11].copy_from_slice(b"NTFS    ");
        s[0x0B..0x0D].copy_from_slice(&(SECTOR as u16).to_le_bytes());
        s[0x0D] = (NTFS_CLUSTER / SECTOR) as u8;
        s[0x15] = 0xF8;
        let total_sectors = VOLUME_CLUSTERS * (NTFS_CLUSTER / SECTOR) as u64;
        s[0x28..0x30].copy_from_slice(&total_sectors.to_le_bytes());
        s[0x30..0x38].copy_from_slice(&(MFT_CLUSTER as u64).to_le_bytes());
        s[0x38..0x40].copy_from_slice(&2u64.to_le_bytes());
        s[0x40] = 0xF6;
        s[0x44] = 1;
        s[0x48..0x50].copy_from_slice(&0x1C2D_3E4F_5A6B_7C8Du64.to_le_bytes());
        s[0x1FE] = 0x55;
        s[0x1FF] = 0xAA;

        for (n, template) in self.records.iter().enumerate() {
            if let Some(template) = template {
                let at = mft_start + n * RECORD_SIZE;
                img[at..at + RECORD_SIZE].copy_from_slice(&template.encode(n as u64));
            }
        }
        for (cluster, bytes) in &self.clusters {
            let at = cluster * NTFS_CLUSTER;
            img[at..at + bytes.len()].copy_from_slice(bytes);
        }
        img
    }
}
