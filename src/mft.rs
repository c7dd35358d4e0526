// Sources:
// - https://dubeyko.com/development/FileSystems/NTFS/ntfsdoc.pdf
// - https://en.wikipedia.org/wiki/NTFS
// - https://flatcap.github.io/linux-ntfs/ntfs/concepts/data_runs.html

use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, Datelike, TimeZone, Utc};
use log::{debug, warn};
use prettytable::{Table, row};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::entry::{ClusterRun, MacbTimes};
use crate::error::{ExhumeError, Result};
use crate::layout::{Field, FieldKind, Layout};

pub const RECORD_IN_USE: u16 = 0x0001;
pub const RECORD_IS_DIRECTORY: u16 = 0x0002;
const END_OF_ATTRIBUTES: u32 = 0xFFFF_FFFF;
const MFT_REFERENCE_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;
/// Update sequence arrays protect 512-byte strides whatever the sector size.
pub const UPDATE_SEQUENCE_STRIDE: usize = 512;

/// Namespaces of a `$FILE_NAME`, see [`MFTRecord::best_file_name`].
pub const NAMESPACE_POSIX: u8 = 0;
pub const NAMESPACE_WIN32: u8 = 1;
pub const NAMESPACE_DOS: u8 = 2;
pub const NAMESPACE_WIN32_AND_DOS: u8 = 3;

pub const FILE_RECORD_HEADER: Layout = Layout::new(
    "MFT record header",
    &[
        Field::seq("signature", FieldKind::Bytes(4)),
        Field::seq("usa_offset", FieldKind::U16),
        Field::seq("usa_count", FieldKind::U16),
        Field::seq("lsn", FieldKind::U64),
        Field::seq("sequence_number", FieldKind::U16),
        Field::seq("hard_link_count", FieldKind::U16),
        Field::seq("attrs_offset", FieldKind::U16),
        Field::seq("flags", FieldKind::U16),
        Field::seq("bytes_in_use", FieldKind::U32),
        Field::seq("bytes_allocated", FieldKind::U32),
        Field::seq("base_file_record", FieldKind::U64),
        Field::seq("next_attr_id", FieldKind::U16),
        Field::skip(2),
        Field::seq("record_number", FieldKind::U32),
    ],
);

pub const ATTRIBUTE_HEADER: Layout = Layout::new(
    "attribute header",
    &[
        Field::seq("type", FieldKind::U32),
        Field::seq("length", FieldKind::U32),
        Field::seq("non_resident", FieldKind::U8),
        Field::seq("name_length", FieldKind::U8),
        Field::seq("name_offset", FieldKind::U16),
        Field::seq("flags", FieldKind::U16),
        Field::seq("id", FieldKind::U16),
    ],
);

pub const RESIDENT_HEADER: Layout = Layout::new(
    "resident attribute header",
    &[
        Field::at("value_length", 0x10, FieldKind::U32),
        Field::seq("value_offset", FieldKind::U16),
        Field::seq("resident_flags", FieldKind::U8),
        Field::skip(1),
    ],
);

pub const NON_RESIDENT_HEADER: Layout = Layout::new(
    "non-resident attribute header",
    &[
        Field::at("lowest_vcn", 0x10, FieldKind::U64),
        Field::seq("highest_vcn", FieldKind::U64),
        Field::seq("mapping_pairs_offset", FieldKind::U16),
        Field::seq("compression_unit", FieldKind::U16),
        Field::skip(4),
        Field::seq("allocated_size", FieldKind::U64),
        Field::seq("real_size", FieldKind::U64),
        Field::seq("initialized_size", FieldKind::U64),
    ],
);

pub const STANDARD_INFORMATION: Layout = Layout::new(
    "$STANDARD_INFORMATION",
    &[
        Field::seq("created", FieldKind::U64),
        Field::seq("modified", FieldKind::U64),
        Field::seq("mft_modified", FieldKind::U64),
        Field::seq("accessed", FieldKind::U64),
        Field::seq("file_attrs", FieldKind::U32),
        Field::seq("max_versions", FieldKind::U32),
        Field::seq("version_number", FieldKind::U32),
        Field::seq("class_id", FieldKind::U32),
    ],
);

pub const FILE_NAME: Layout = Layout::new(
    "$FILE_NAME",
    &[
        Field::seq("parent_reference", FieldKind::U64),
        Field::seq("created", FieldKind::U64),
        Field::seq("modified", FieldKind::U64),
        Field::seq("mft_modified", FieldKind::U64),
        Field::seq("accessed", FieldKind::U64),
        Field::seq("allocated_size", FieldKind::U64),
        Field::seq("real_size", FieldKind::U64),
        Field::seq("flags", FieldKind::U32),
        Field::seq("reparse_value", FieldKind::U32),
        Field::seq("name_length", FieldKind::U8),
        Field::seq("namespace", FieldKind::U8),
    ],
);

pub const INDEX_ENTRY_HEADER: Layout = Layout::new(
    "index entry",
    &[
        Field::seq("file_reference", FieldKind::U64),
        Field::seq("entry_length", FieldKind::U16),
        Field::seq("key_length", FieldKind::U16),
        Field::seq("flags", FieldKind::U32),
    ],
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum AttributeType {
    StandardInformation,
    AttributeList,
    FileName,
    ObjectId,
    SecurityDescriptor,
    VolumeName,
    VolumeInformation,
    Data,
    IndexRoot,
    IndexAllocation,
    Bitmap,
    ReparsePoint,
    EaInformation,
    Ea,
    PropertySet,
    LoggedUtilityStream,
    Unknown(u32),
}

impl From<u32> for AttributeType {
    fn from(value: u32) -> Self {
        use AttributeType::*;
        match value {
            0x10 => StandardInformation,
            0x20 => AttributeList,
            0x30 => FileName,
            0x40 => ObjectId,
            0x50 => SecurityDescriptor,
            0x60 => VolumeName,
            0x70 => VolumeInformation,
            0x80 => Data,
            0x90 => IndexRoot,
            0xA0 => IndexAllocation,
            0xB0 => Bitmap,
            0xC0 => ReparsePoint,
            0xD0 => EaInformation,
            0xE0 => Ea,
            0xF0 => PropertySet,
            0x100 => LoggedUtilityStream,
            other => Unknown(other),
        }
    }
}

impl AttributeType {
    pub fn code(&self) -> u32 {
        use AttributeType::*;
        match self {
            StandardInformation => 0x10,
            AttributeList => 0x20,
            FileName => 0x30,
            ObjectId => 0x40,
            SecurityDescriptor => 0x50,
            VolumeName => 0x60,
            VolumeInformation => 0x70,
            Data => 0x80,
            IndexRoot => 0x90,
            IndexAllocation => 0xA0,
            Bitmap => 0xB0,
            ReparsePoint => 0xC0,
            EaInformation => 0xD0,
            Ea => 0xE0,
            PropertySet => 0xF0,
            LoggedUtilityStream => 0x100,
            Unknown(code) => *code,
        }
    }
}

/// Header found at the very beginning of every **FILE** record (offset 0).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FileRecordHeader {
    pub usa_offset: u16,
    pub usa_count: u16,
    pub lsn: u64,
    pub sequence_number: u16,
    pub hard_link_count: u16,
    pub attrs_offset: u16,
    pub flags: u16,
    pub bytes_in_use: u32,
    pub bytes_allocated: u32,
    pub base_file_record: u64,
    pub next_attr_id: u16,
    pub record_number: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AttributeHeaderCommon {
    pub attr_type: AttributeType,
    pub length: u32,
    pub non_resident: bool,
    pub name_length: u8,
    pub name_offset: u16,
    pub flags: u16,
    pub id: u16,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ResidentHeader {
    pub value_length: u32,
    pub value_offset: u16,
    pub resident_flags: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct NonResidentHeader {
    pub lowest_vcn: u64,
    pub highest_vcn: u64,
    pub mapping_pairs_offset: u16,
    pub compression_unit: u16,
    pub allocated_size: u64,
    pub real_size: u64,
    pub initialized_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub enum Attribute {
    Resident {
        header: AttributeHeaderCommon,
        resident: ResidentHeader,
        value: Vec<u8>,
    },
    NonResident {
        header: AttributeHeaderCommon,
        non_resident: NonResidentHeader,
        run_list: Vec<u8>,
    },
}

impl Attribute {
    pub fn header(&self) -> &AttributeHeaderCommon {
        match self {
            Attribute::Resident { header, .. } | Attribute::NonResident { header, .. } => header,
        }
    }

    /// Content size: value length when resident, real size otherwise.
    pub fn size(&self) -> u64 {
        match self {
            Attribute::Resident { resident, .. } => resident.value_length as u64,
            Attribute::NonResident { non_resident, .. } => non_resident.real_size,
        }
    }

    fn is(&self, kind: AttributeType) -> bool {
        self.header().attr_type == kind
    }

    fn resident_value(&self) -> Option<&[u8]> {
        match self {
            Attribute::Resident { value, .. } => Some(value),
            Attribute::NonResident { .. } => None,
        }
    }
}

/// One extent of a non-resident attribute. `lcn` is `None` for sparse runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct DataRun {
    pub lcn: Option<u64>,
    pub length: u64,
}

impl DataRun {
    pub fn to_cluster_run(&self) -> Option<ClusterRun> {
        match self.lcn {
            Some(lcn) if self.length > 0 => lcn
                .checked_add(self.length - 1)
                .map(|end| ClusterRun::new(lcn, end)),
            _ => None,
        }
    }
}

/// Decode a mapping-pairs array.
///
/// Each run starts with a header byte: the low nibble is the size of the
/// length field, the high nibble the size of the signed LCN delta (relative
/// to the previous run). A zero header ends the list.
pub fn decode_run_list(raw: &[u8]) -> Result<Vec<DataRun>> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    let mut cur_lcn: i64 = 0;

    while pos < raw.len() && raw[pos] != 0 {
        let hdr = raw[pos];
        pos += 1;
        let len_sz = (hdr & 0x0F) as usize;
        let ofs_sz = (hdr >> 4) as usize;
        if len_sz == 0 || len_sz > 8 || ofs_sz > 8 {
            return Err(ExhumeError::InvalidRecord(format!(
                "run header 0x{:02X} at {}",
                hdr,
                pos - 1
            )));
        }
        if pos + len_sz + ofs_sz > raw.len() {
            return Err(ExhumeError::InvalidRecord(format!(
                "run at {} overruns the mapping pairs",
                pos - 1
            )));
        }

        let length = LittleEndian::read_uint(&raw[pos..], len_sz);
        pos += len_sz;

        if ofs_sz == 0 {
            out.push(DataRun { lcn: None, length });
            continue;
        }
        let delta = LittleEndian::read_int(&raw[pos..], ofs_sz);
        pos += ofs_sz;

        cur_lcn = cur_lcn.checked_add(delta).ok_or_else(|| {
            ExhumeError::InvalidRecord("run-list LCN overflows".into())
        })?;
        if cur_lcn < 0 {
            return Err(ExhumeError::InvalidRecord(format!(
                "negative LCN {} in run-list",
                cur_lcn
            )));
        }
        if (cur_lcn as u64).checked_add(length).is_none() {
            return Err(ExhumeError::InvalidRecord(format!(
                "run of {} clusters at LCN {} overflows",
                length, cur_lcn
            )));
        }
        out.push(DataRun {
            lcn: Some(cur_lcn as u64),
            length,
        });
    }
    Ok(out)
}

/// Windows FILETIME (100 ns ticks since 1601) to UTC; 0 means unset.
pub fn filetime_to_datetime(ft: u64) -> Option<DateTime<Utc>> {
    const EPOCH_DELTA_SECS: i64 = 11_644_473_600;
    if ft == 0 {
        return None;
    }
    let secs = (ft / 10_000_000) as i64 - EPOCH_DELTA_SECS;
    let nanos = (ft % 10_000_000) as u32 * 100;
    Utc.timestamp_opt(secs, nanos).single()
}

fn utf16le(raw: &[u8]) -> String {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

/// Parsed $STANDARD_INFORMATION (covers v1.2 and v3.x).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandardInformation {
    pub times: MacbTimes,
    pub file_attrs: u32,
    pub owner_id: Option<u32>,
    pub security_id: Option<u32>,
    pub usn: Option<u64>,
}

impl StandardInformation {
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        let rec = STANDARD_INFORMATION.decode(raw)?;
        let optional_u32 = |at: usize| raw.get(at..at + 4).map(LittleEndian::read_u32);
        Ok(Self {
            times: MacbTimes {
                created: filetime_to_datetime(rec.uint("created")?),
                modified: filetime_to_datetime(rec.uint("modified")?),
                mft_modified: filetime_to_datetime(rec.uint("mft_modified")?),
                accessed: filetime_to_datetime(rec.uint("accessed")?),
            },
            file_attrs: rec.uint("file_attrs")? as u32,
            owner_id: optional_u32(0x30),
            security_id: optional_u32(0x34),
            usn: raw.get(0x40..0x48).map(LittleEndian::read_u64),
        })
    }
}

/// Parsed $FILE_NAME attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNameAttr {
    pub parent_ref: u64,
    pub parent_seq: u16,
    pub times: MacbTimes,
    pub allocated_size: u64,
    pub real_size: u64,
    pub flags: u32,
    pub namespace: u8,
    pub name: String,
}

impl FileNameAttr {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let rec = FILE_NAME.decode(raw)?;
        let name_len = rec.uint("name_length")? as usize;
        let name_raw = raw.get(66..66 + name_len * 2).ok_or(ExhumeError::Truncated {
            structure: "$FILE_NAME name",
            needed: 66 + name_len * 2,
            available: raw.len(),
        })?;
        let parent = rec.uint("parent_reference")?;

        Ok(Self {
            parent_ref: parent & MFT_REFERENCE_MASK,
            parent_seq: (parent >> 48) as u16,
            times: MacbTimes {
                created: filetime_to_datetime(rec.uint("created")?),
                modified: filetime_to_datetime(rec.uint("modified")?),
                mft_modified: filetime_to_datetime(rec.uint("mft_modified")?),
                accessed: filetime_to_datetime(rec.uint("accessed")?),
            },
            allocated_size: rec.uint("allocated_size")?,
            real_size: rec.uint("real_size")?,
            flags: rec.uint("flags")? as u32,
            namespace: rec.uint("namespace")? as u8,
            name: utf16le(name_raw),
        })
    }

    /// Lower is better: Win32+DOS, Win32, POSIX, DOS.
    fn namespace_rank(&self) -> u8 {
        match self.namespace {
            NAMESPACE_WIN32_AND_DOS => 0,
            NAMESPACE_WIN32 => 1,
            NAMESPACE_POSIX => 2,
            NAMESPACE_DOS => 3,
            _ => 4,
        }
    }
}

/// Apply the update sequence array: the last two bytes of every `stride`
/// bytes are checked against the USN and replaced by the saved words.
///
/// Returns the number of strides whose check failed. Those are still patched.
pub fn apply_fixups(buf: &mut [u8], usa_offset: usize, usa_count: usize, stride: usize) -> usize {
    if usa_count < 2 || stride < 2 {
        return 0;
    }
    if usa_offset + 2 * usa_count > buf.len() {
        warn!("Update sequence array lies outside the record, not applied");
        return 0;
    }

    let usn = [buf[usa_offset], buf[usa_offset + 1]];
    let mut mismatches = 0;
    for i in 1..usa_count {
        let sector_end = i * stride - 2;
        if sector_end + 2 > buf.len() {
            warn!("Update sequence array covers {} sectors past the buffer", usa_count - i);
            break;
        }
        if buf[sector_end..sector_end + 2] != usn {
            mismatches += 1;
        }
        let fix_pos = usa_offset + 2 * i;
        buf[sector_end] = buf[fix_pos];
        buf[sector_end + 1] = buf[fix_pos + 1];
    }
    if mismatches > 0 {
        warn!("{} sector(s) failed the update sequence check", mismatches);
    }
    mismatches
}

/// A parsed MFT record.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MFTRecord {
    pub id: u64,
    pub header: FileRecordHeader,
    pub attributes: Vec<Attribute>,
    /// Sectors whose update sequence check failed.
    pub fixup_mismatches: usize,
}

impl MFTRecord {
    /// Parse one raw record.
    ///
    /// `BAAD` records fail with [`ExhumeError::InvalidRecord`]; any other
    /// signature than `FILE` means the end of the table ([`ExhumeError::Exhausted`]).
    pub fn from_bytes(raw: &[u8], identifier: Option<u64>) -> Result<Self> {
        match raw.get(0..4) {
            Some(b"FILE") => {}
            Some(b"BAAD") => {
                return Err(ExhumeError::InvalidRecord(
                    "record marked BAAD by chkdsk".into(),
                ));
            }
            _ => return Err(ExhumeError::Exhausted),
        }

        let mut buf = raw.to_vec();
        let rec = FILE_RECORD_HEADER.decode(&buf)?;
        let header = FileRecordHeader {
            usa_offset: rec.uint("usa_offset")? as u16,
            usa_count: rec.uint("usa_count")? as u16,
            lsn: rec.uint("lsn")?,
            sequence_number: rec.uint("sequence_number")? as u16,
            hard_link_count: rec.uint("hard_link_count")? as u16,
            attrs_offset: rec.uint("attrs_offset")? as u16,
            flags: rec.uint("flags")? as u16,
            bytes_in_use: rec.uint("bytes_in_use")? as u32,
            bytes_allocated: rec.uint("bytes_allocated")? as u32,
            base_file_record: rec.uint("base_file_record")? & MFT_REFERENCE_MASK,
            next_attr_id: rec.uint("next_attr_id")? as u16,
            record_number: rec.uint("record_number")? as u32,
        };

        let fixup_mismatches = apply_fixups(
            &mut buf,
            header.usa_offset as usize,
            header.usa_count as usize,
            UPDATE_SEQUENCE_STRIDE,
        );

        let attributes = parse_attributes(&buf, &header);
        Ok(Self {
            id: identifier.unwrap_or(header.record_number as u64),
            header,
            attributes,
            fixup_mismatches,
        })
    }

    pub fn is_in_use(&self) -> bool {
        self.header.flags & RECORD_IN_USE != 0
    }

    pub fn is_dir(&self) -> bool {
        self.header.flags & RECORD_IS_DIRECTORY != 0
    }

    /// Extension records point at the base record holding their `$STANDARD_INFORMATION`.
    pub fn is_extension(&self) -> bool {
        self.header.base_file_record != 0
    }

    fn resident_values(&self, kind: AttributeType) -> impl Iterator<Item = &[u8]> {
        self.attributes
            .iter()
            .filter(move |a| a.is(kind))
            .filter_map(|a| a.resident_value())
    }

    /// Every $FILE_NAME attribute found (there may be 2: long and DOS).
    pub fn file_names(&self) -> Vec<FileNameAttr> {
        self.resident_values(AttributeType::FileName)
            .filter_map(|v| match FileNameAttr::parse(v) {
                Ok(f) => Some(f),
                Err(e) => {
                    warn!("Record {}: unreadable $FILE_NAME: {}", self.id, e);
                    None
                }
            })
            .collect()
    }

    /// The `$FILE_NAME` to show, by namespace preference.
    pub fn best_file_name(&self) -> Option<FileNameAttr> {
        self.file_names()
            .into_iter()
            .min_by_key(FileNameAttr::namespace_rank)
    }

    pub fn standard_information(&self) -> Option<StandardInformation> {
        let value = self.resident_values(AttributeType::StandardInformation).next()?;
        StandardInformation::from_bytes(value)
            .map_err(|e| warn!("Record {}: unreadable $STANDARD_INFORMATION: {}", self.id, e))
            .ok()
    }

    /// `$OBJECT_ID` as a GUID string.
    pub fn object_id(&self) -> Option<String> {
        let v = self.resident_values(AttributeType::ObjectId).next()?;
        let g = v.get(0..16)?;
        Some(format!(
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{}",
            LittleEndian::read_u32(&g[0..4]),
            LittleEndian::read_u16(&g[4..6]),
            LittleEndian::read_u16(&g[6..8]),
            g[8],
            g[9],
            g[10..16].iter().map(|b| format!("{:02x}", b)).collect::<String>()
        ))
    }

    pub fn volume_name(&self) -> Option<String> {
        self.resident_values(AttributeType::VolumeName)
            .next()
            .map(utf16le)
    }

    /// The unnamed `$DATA` attribute.
    pub fn data_attribute(&self) -> Option<&Attribute> {
        self.attributes
            .iter()
            .find(|a| a.is(AttributeType::Data) && a.header().name_length == 0)
    }

    /// Extents of the unnamed `$DATA`; empty when it is resident or absent.
    pub fn data_runs(&self) -> Result<Vec<DataRun>> {
        match self.data_attribute() {
            Some(Attribute::NonResident { run_list, .. }) => decode_run_list(run_list),
            _ => Ok(Vec::new()),
        }
    }

    pub fn data_size(&self) -> u64 {
        self.data_attribute().map(Attribute::size).unwrap_or(0)
    }

    fn index_root(&self) -> Option<&[u8]> {
        self.resident_values(AttributeType::IndexRoot).next()
    }

    /// Entries held directly in `$INDEX_ROOT`.
    pub fn directory_entries(&self) -> Option<Vec<DirectoryEntry>> {
        if !self.is_dir() {
            return None;
        }
        parse_index_root(self.index_root()?)
    }

    /// Size of an index record for large directories.
    pub fn index_record_size(&self, default: u64) -> u64 {
        self.index_root()
            .and_then(|root| root.get(8..12))
            .map(|b| LittleEndian::read_u32(b) as u64)
            .filter(|sz| sz.is_power_of_two() && (512..=65_536).contains(sz))
            .unwrap_or(default)
    }

    /// Convert record to a human-readable table string.
    pub fn to_string(&self) -> String {
        let mut out = String::new();

        let mut hdr = Table::new();
        hdr.add_row(row!["MFT Entry Header Values"]);
        hdr.add_row(row![b -> "Record", self.id]);
        hdr.add_row(row![b -> "Sequence", self.header.sequence_number]);
        hdr.add_row(row![b -> "$LogFile Sequence Number", self.header.lsn]);
        hdr.add_row(row![b -> "Flags", record_flags_to_string(self.header.flags)]);
        hdr.add_row(row![b -> "Links", self.header.hard_link_count]);
        hdr.add_row(row![b -> "Base record", self.header.base_file_record]);
        if self.fixup_mismatches > 0 {
            hdr.add_row(row![b -> "Fixup mismatches", self.fixup_mismatches]);
        }
        out.push_str(&hdr.to_string());

        let mut attrs = Table::new();
        attrs.add_row(row!["Attributes", "Name", "Status", "Size"]);
        for a in &self.attributes {
            let h = a.header();
            attrs.add_row(row![
                format!("{:?} (0x{:X}-#{})", h.attr_type, h.attr_type.code(), h.id),
                h.name.clone().unwrap_or_else(|| "N/A".to_string()),
                if h.non_resident { "Non-resident" } else { "Resident" },
                a.size()
            ]);
        }
        out.push('\n');
        out.push_str(&attrs.to_string());

        let fmt = |t: Option<DateTime<Utc>>| t.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into());

        if let Some(si) = self.standard_information() {
            let mut t = Table::new();
            t.add_row(row!["$STANDARD_INFORMATION"]);
            t.add_row(row![b -> "Created", fmt(si.times.created)]);
            t.add_row(row![b -> "File Modified", fmt(si.times.modified)]);
            t.add_row(row![b -> "MFT Modified", fmt(si.times.mft_modified)]);
            t.add_row(row![b -> "Accessed", fmt(si.times.accessed)]);
            t.add_row(row![b -> "Flags", si_flags_to_string(si.file_attrs)]);
            if let Some(u) = si.usn {
                t.add_row(row![b -> "Last USN", u]);
            }
            out.push('\n');
            out.push_str(&t.to_string());
        }

        let names = self.file_names();
        if !names.is_empty() {
            let mut t = Table::new();
            t.add_row(row!["$FILE_NAME Attributes"]);
            for fname in names {
                t.add_row(row![b -> "Name", fname.name]);
                t.add_row(row![b -> "Namespace", fname.namespace]);
                t.add_row(row![b -> "Parent MFT", format!("{} (seq {})", fname.parent_ref, fname.parent_seq)]);
                t.add_row(row![b -> "Actual", fname.real_size]);
                t.add_row(row!["- Created", fmt(fname.times.created)]);
                t.add_row(row!["- Modified", fmt(fname.times.modified)]);
                t.add_row(row!["- MFT Mod", fmt(fname.times.mft_modified)]);
                t.add_row(row!["- Accessed", fmt(fname.times.accessed)]);
            }
            out.push('\n');
            out.push_str(&t.to_string());
        }

        if let Ok(runs) = self.data_runs() {
            if !runs.is_empty() {
                let mut t = Table::new();
                t.add_row(row!["$DATA runs", "Length"]);
                for r in runs {
                    t.add_row(row![r.lcn.map_or("sparse".into(), |l| l.to_string()), r.length]);
                }
                out.push('\n');
                out.push_str(&t.to_string());
            }
        }

        out
    }

    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "header": &self.header,
            "attributes": self.attributes.iter().map(|a| {
                let h = a.header();
                json!({
                    "type": h.attr_type,
                    "name": h.name,
                    "non_resident": h.non_resident,
                    "size": a.size(),
                })
            }).collect::<Vec<_>>(),
            "standard_information": self.standard_information(),
            "file_names": self.file_names(),
            "object_id": self.object_id(),
            "volume_name": self.volume_name(),
            "data_runs": self.data_runs().unwrap_or_default(),
        })
    }
}

fn parse_attributes(buf: &[u8], header: &FileRecordHeader) -> Vec<Attribute> {
    let limit = (header.bytes_in_use as usize).min(buf.len());
    let mut off = header.attrs_offset as usize;
    let mut attributes = Vec::new();

    while off + 4 <= limit {
        if LittleEndian::read_u32(&buf[off..off + 4]) == END_OF_ATTRIBUTES {
            break;
        }
        let length = match buf.get(off + 4..off + 8) {
            Some(b) => LittleEndian::read_u32(b) as usize,
            None => break,
        };
        if length == 0 || off + length > limit {
            warn!(
                "Attribute at 0x{:X} declares length {}, attribute walk stopped",
                off, length
            );
            break;
        }

        match parse_attribute(&buf[off..off + length]) {
            Ok(attr) => attributes.push(attr),
            Err(e) => debug!("Attribute at 0x{:X} skipped: {}", off, e),
        }
        off += length;
    }
    attributes
}

/// Parse one attribute; `raw` spans exactly its declared length.
fn parse_attribute(raw: &[u8]) -> Result<Attribute> {
    let rec = ATTRIBUTE_HEADER.decode(raw)?;
    let name_length = rec.uint("name_length")? as u8;
    let name_offset = rec.uint("name_offset")? as u16;
    let name = if name_length > 0 {
        let start = name_offset as usize;
        raw.get(start..start + name_length as usize * 2).map(utf16le)
    } else {
        None
    };

    let header = AttributeHeaderCommon {
        attr_type: AttributeType::from(rec.uint("type")? as u32),
        length: rec.uint("length")? as u32,
        non_resident: rec.uint("non_resident")? != 0,
        name_length,
        name_offset,
        flags: rec.uint("flags")? as u16,
        id: rec.uint("id")? as u16,
        name,
    };

    if !header.non_resident {
        let r = RESIDENT_HEADER.decode(raw)?;
        let resident = ResidentHeader {
            value_length: r.uint("value_length")? as u32,
            value_offset: r.uint("value_offset")? as u16,
            resident_flags: r.uint("resident_flags")? as u8,
        };
        let start = resident.value_offset as usize;
        let value = raw
            .get(start..start + resident.value_length as usize)
            .ok_or_else(|| {
                ExhumeError::InvalidRecord(format!(
                    "{:?} value of {} bytes at {} overruns the attribute",
                    header.attr_type, resident.value_length, start
                ))
            })?
            .to_vec();
        Ok(Attribute::Resident {
            header,
            resident,
            value,
        })
    } else {
        let r = NON_RESIDENT_HEADER.decode(raw)?;
        let non_resident = NonResidentHeader {
            lowest_vcn: r.uint("lowest_vcn")?,
            highest_vcn: r.uint("highest_vcn")?,
            mapping_pairs_offset: r.uint("mapping_pairs_offset")? as u16,
            compression_unit: r.uint("compression_unit")? as u16,
            allocated_size: r.uint("allocated_size")?,
            real_size: r.uint("real_size")?,
            initialized_size: r.uint("initialized_size")?,
        };
        let run_list = raw
            .get(non_resident.mapping_pairs_offset as usize..)
            .ok_or_else(|| {
                ExhumeError::InvalidRecord(format!(
                    "mapping pairs at {} outside the attribute",
                    non_resident.mapping_pairs_offset
                ))
            })?
            .to_vec();
        Ok(Attribute::NonResident {
            header,
            non_resident,
            run_list,
        })
    }
}

/// Decode MFT record flags.
fn record_flags_to_string(flags: u16) -> String {
    const NAMES: &[(u16, &str)] = &[
        (0x0001, "Allocated"),
        (0x0002, "Directory"),
        (0x0004, "Extension"),
        (0x0008, "View index"),
    ];
    join_flags(NAMES.iter().map(|(b, n)| (*b as u32, *n)), flags as u32)
}

/// Decode FILE attribute flags inside $STANDARD_INFORMATION.
fn si_flags_to_string(flags: u32) -> String {
    const NAMES: &[(u32, &str)] = &[
        (0x0001, "READONLY"),
        (0x0002, "HIDDEN"),
        (0x0004, "SYSTEM"),
        (0x0020, "ARCHIVE"),
        (0x0100, "TEMPORARY"),
        (0x0200, "SPARSE_FILE"),
        (0x0400, "REPARSE_POINT"),
        (0x0800, "COMPRESSED"),
        (0x4000, "ENCRYPTED"),
    ];
    join_flags(NAMES.iter().copied(), flags)
}

fn join_flags(names: impl Iterator<Item = (u32, &'static str)>, flags: u32) -> String {
    let set: Vec<&str> = names.filter(|(bit, _)| flags & bit != 0).map(|(_, n)| n).collect();
    if set.is_empty() {
        "None".into()
    } else {
        set.join(" | ")
    }
}

/* Directory index helpers */

const INDEX_ENTRY_LAST: u32 = 0x02;
const INDEX_NODE_HEADER_IN_ROOT: usize = 0x10;
const INDEX_NODE_HEADER_IN_BLOCK: usize = 0x18;
/// Entry header plus the fixed part of a `$FILE_NAME` key.
const INDEX_ENTRY_MIN: usize = 0x10 + 0x42;
/// Years a recovered slack entry's timestamps must fall in.
const SLACK_YEARS: std::ops::Range<i32> = 1990..2100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub file_id: u64,
    pub sequence_number: u16,
    pub name: String,
    pub namespace: u8,
    /// Recovered from the slack space of an `INDX` block.
    #[serde(default)]
    pub deleted: bool,
}

impl DirectoryEntry {
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }
}

/// Walk the index entries of one node whose header starts at `node`.
fn walk_index_node(buf: &[u8], node: usize) -> Vec<DirectoryEntry> {
    let (Some(first), Some(total)) = (buf.get(node..node + 4), buf.get(node + 4..node + 8)) else {
        return Vec::new();
    };
    let mut off = node + LittleEndian::read_u32(first) as usize;
    let end = (node + LittleEndian::read_u32(total) as usize).min(buf.len());

    let mut out = Vec::new();
    while off + 0x10 <= end {
        let Ok(rec) = INDEX_ENTRY_HEADER.decode_at(buf, off) else {
            break;
        };
        let (Ok(reference), Ok(entry_len), Ok(key_len), Ok(flags)) = (
            rec.uint("file_reference"),
            rec.uint("entry_length"),
            rec.uint("key_length"),
            rec.uint("flags"),
        ) else {
            break;
        };
        if flags as u32 & INDEX_ENTRY_LAST != 0 || entry_len == 0 {
            break;
        }
        let key_start = off + 0x10;
        if let Some(Ok(fname)) = buf
            .get(key_start..key_start + key_len as usize)
            .map(FileNameAttr::parse)
        {
            if fname.name != "." && fname.name != ".." {
                out.push(DirectoryEntry {
                    file_id: reference & MFT_REFERENCE_MASK,
                    sequence_number: (reference >> 48) as u16,
                    name: fname.name,
                    namespace: fname.namespace,
                    deleted: false,
                });
            }
        }
        off += entry_len as usize;
    }
    out
}

/// Scan the bytes between the used and the allocated end of a node for
/// stale index entries, one byte at a time until one parses.
fn scan_index_slack(buf: &[u8], node: usize) -> Vec<DirectoryEntry> {
    let (Some(used), Some(allocated)) = (buf.get(node + 4..node + 8), buf.get(node + 8..node + 12))
    else {
        return Vec::new();
    };
    let mut off = node + LittleEndian::read_u32(used) as usize;
    let end = (node + LittleEndian::read_u32(allocated) as usize).min(buf.len());

    let plausible = |t: Option<DateTime<Utc>>| t.is_some_and(|t| SLACK_YEARS.contains(&t.year()));
    let mut out = Vec::new();
    while off + INDEX_ENTRY_MIN <= end {
        let reference = LittleEndian::read_u64(&buf[off..off + 8]);
        let found = FileNameAttr::parse(&buf[off + 0x10..end]).ok().filter(|f| {
            !f.name.is_empty()
                && f.namespace <= NAMESPACE_WIN32_AND_DOS
                && plausible(f.times.created)
                && plausible(f.times.modified)
                && plausible(f.times.mft_modified)
                && plausible(f.times.accessed)
        });
        match found {
            Some(fname) => {
                debug!("Slack index entry '{}' at 0x{:X}", fname.name, off);
                let key_len = 0x42 + 2 * fname.name.encode_utf16().count();
                off += (0x10 + key_len).next_multiple_of(8);
                if fname.name != "." && fname.name != ".." {
                    out.push(DirectoryEntry {
                        file_id: reference & MFT_REFERENCE_MASK,
                        sequence_number: (reference >> 48) as u16,
                        name: fname.name,
                        namespace: fname.namespace,
                        deleted: true,
                    });
                }
            }
            None => off += 1,
        }
    }
    out
}

/// Entries of a resident `$INDEX_ROOT` value.
pub fn parse_index_root(raw: &[u8]) -> Option<Vec<DirectoryEntry>> {
    if raw.len() < INDEX_NODE_HEADER_IN_ROOT + 0x10 {
        return None;
    }
    Some(walk_index_node(raw, INDEX_NODE_HEADER_IN_ROOT))
}

/// Entries of one `INDX` block from `$INDEX_ALLOCATION`, after fixups.
/// Live entries come first, then those recovered from slack.
pub fn parse_index_block(raw: &[u8]) -> Option<Vec<DirectoryEntry>> {
    if raw.get(0..4) != Some(&b"INDX"[..]) || raw.len() < INDEX_NODE_HEADER_IN_BLOCK + 0x10 {
        return None;
    }
    let mut buf = raw.to_vec();
    let usa_offset = LittleEndian::read_u16(&buf[4..6]) as usize;
    let usa_count = LittleEndian::read_u16(&buf[6..8]) as usize;
    apply_fixups(&mut buf, usa_offset, usa_count, UPDATE_SEQUENCE_STRIDE);
    let mut entries = walk_index_node(&buf, INDEX_NODE_HEADER_IN_BLOCK);
    entries.extend(scan_index_slack(&buf, INDEX_NODE_HEADER_IN_BLOCK));
    Some(entries)
}
