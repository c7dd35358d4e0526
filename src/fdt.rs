// Sources:
// - https://en.wikipedia.org/wiki/Design_of_the_FAT_file_system#Directory_entry
// - https://en.wikipedia.org/wiki/Design_of_the_FAT_file_system#VFAT_long_file_names

//! FAT directory table records: 8.3 short entries, VFAT long filename
//! fragments and the state machine that stitches fragments back together.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use log::warn;

use crate::error::Result;
use crate::layout::{Field, FieldKind, Layout};

pub const ENTRY_SIZE: usize = 32;

pub const ATTR_VOLUME_LABEL: u8 = 0x08;
pub const ATTR_DIRECTORY: u8 = 0x10;
pub const ATTR_LONG_NAME: u8 = 0x0F;

pub const DELETED_MARK: u8 = 0xE5;
/// Stand-in for a real leading 0xE5 in a live entry.
const KANJI_E5_MARK: u8 = 0x05;
const LFN_FIRST_FLAG: u8 = 0x40;

pub const SHORT_ENTRY: Layout = Layout::new(
    "directory entry",
    &[
        Field::seq("short_name", FieldKind::Bytes(8)),
        Field::seq("short_extension", FieldKind::Bytes(3)),
        Field::seq("attribute", FieldKind::U8),
        Field::skip(1),
        Field::seq("create_time_10ms", FieldKind::U8),
        Field::seq("create_time", FieldKind::U16),
        Field::seq("create_date", FieldKind::U16),
        Field::seq("access_date", FieldKind::U16),
        Field::seq("first_cluster_high", FieldKind::U16),
        Field::seq("modify_time", FieldKind::U16),
        Field::seq("modify_date", FieldKind::U16),
        Field::seq("first_cluster_low", FieldKind::U16),
        Field::seq("file_length", FieldKind::U32),
    ],
);

pub const LFN_ENTRY: Layout = Layout::new(
    "long filename entry",
    &[
        Field::seq("sequence_number", FieldKind::U8),
        Field::seq("name_1", FieldKind::Bytes(10)),
        Field::seq("attribute", FieldKind::U8),
        Field::seq("type", FieldKind::U8),
        Field::seq("checksum", FieldKind::U8),
        Field::seq("name_2", FieldKind::Bytes(12)),
        Field::skip(2),
        Field::seq("name_3", FieldKind::Bytes(4)),
    ],
);

/// DOS checksum of the 11 raw name bytes, as stored in every LFN fragment.
pub fn short_name_checksum(raw_name: &[u8]) -> u8 {
    raw_name.iter().fold(0u8, |sum, &c| {
        ((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(c)
    })
}

fn fat_date(word: u16) -> Option<NaiveDate> {
    let year = ((word & 0xFE00) >> 9) as i32 + 1980;
    let month = ((word & 0x01E0) >> 5) as u32;
    let day = (word & 0x001F) as u32;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Decode a FAT date/time pair. `tenths` is the create-time refinement byte
/// in 10 ms units (0..=199).
pub fn fat_datetime(date: u16, time: u16, tenths: u8) -> Option<DateTime<Utc>> {
    let hour = ((time & 0xF800) >> 11) as u32;
    let minute = ((time & 0x07E0) >> 5) as u32;
    let second = (time & 0x001F) as u32 * 2 + tenths as u32 / 100;
    let milli = (tenths as u32 % 100) * 10;
    let naive = fat_date(date)?.and_hms_milli_opt(hour, minute, second, milli)?;
    Some(Utc.from_utc_datetime(&naive))
}

/// Decode a FAT date at midnight (last access carries no time of day).
pub fn fat_date_midnight(date: u16) -> Option<DateTime<Utc>> {
    let naive = fat_date(date)?.and_hms_opt(0, 0, 0)?;
    Some(Utc.from_utc_datetime(&naive))
}

fn oem_chars(raw: &[u8]) -> String {
    raw.iter().map(|&b| char::from(b)).collect::<String>().trim_end().to_string()
}

/// An 8.3 directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortEntry {
    pub raw_name: [u8; 11],
    pub attribute: u8,
    pub create_time_10ms: u8,
    pub create_time: u16,
    pub create_date: u16,
    pub access_date: u16,
    pub modify_time: u16,
    pub modify_date: u16,
    pub first_cluster: u32,
    pub file_length: u32,
}

impl ShortEntry {
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        let rec = SHORT_ENTRY.decode(raw)?;
        let mut raw_name = [0u8; 11];
        raw_name[..8].copy_from_slice(rec.bytes("short_name")?);
        raw_name[8..].copy_from_slice(rec.bytes("short_extension")?);

        Ok(Self {
            raw_name,
            attribute: rec.uint("attribute")? as u8,
            create_time_10ms: rec.uint("create_time_10ms")? as u8,
            create_time: rec.uint("create_time")? as u16,
            create_date: rec.uint("create_date")? as u16,
            access_date: rec.uint("access_date")? as u16,
            modify_time: rec.uint("modify_time")? as u16,
            modify_date: rec.uint("modify_date")? as u16,
            first_cluster: (rec.uint("first_cluster_high")? as u32) << 16
                | rec.uint("first_cluster_low")? as u32,
            file_length: rec.uint("file_length")? as u32,
        })
    }

    pub fn is_deleted(&self) -> bool {
        self.raw_name[0] == DELETED_MARK
    }

    pub fn is_directory(&self) -> bool {
        self.attribute & ATTR_DIRECTORY != 0
    }

    pub fn is_volume_label(&self) -> bool {
        self.attribute & ATTR_VOLUME_LABEL != 0 && !self.is_directory()
    }

    pub fn checksum(&self) -> u8 {
        short_name_checksum(&self.raw_name)
    }

    /// `NAME.EXT` (directories: `NAME`), without the deletion prefix.
    /// Deleted entries lose their first character to the 0xE5 mark.
    pub fn short_name(&self) -> String {
        let mut base = self.raw_name[..8].to_vec();
        if base[0] == KANJI_E5_MARK {
            base[0] = DELETED_MARK;
        }
        let base = if self.is_deleted() { &base[1..] } else { &base[..] };
        let name = oem_chars(base);
        let ext = oem_chars(&self.raw_name[8..]);

        if self.is_directory() || ext.is_empty() {
            name
        } else {
            format!("{}.{}", name, ext)
        }
    }

    /// The 11 name bytes of a volume label entry.
    pub fn label(&self) -> String {
        oem_chars(&self.raw_name)
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        fat_datetime(self.create_date, self.create_time, self.create_time_10ms)
    }

    pub fn modified(&self) -> Option<DateTime<Utc>> {
        fat_datetime(self.modify_date, self.modify_time, 0)
    }

    pub fn accessed(&self) -> Option<DateTime<Utc>> {
        fat_date_midnight(self.access_date)
    }
}

/// One VFAT long filename fragment (13 UTF-16 units).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LfnEntry {
    pub sequence_number: u8,
    pub checksum: u8,
    pub fragment: String,
}

impl LfnEntry {
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        let rec = LFN_ENTRY.decode(raw)?;
        let units: Vec<u16> = [rec.bytes("name_1")?, rec.bytes("name_2")?, rec.bytes("name_3")?]
            .concat()
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .take_while(|&u| u != 0)
            .collect();

        Ok(Self {
            sequence_number: rec.uint("sequence_number")? as u8,
            checksum: rec.uint("checksum")? as u8,
            fragment: String::from_utf16_lossy(&units),
        })
    }

    pub fn is_deleted(&self) -> bool {
        self.sequence_number == DELETED_MARK
    }

    /// Physically first, logically last fragment of a name.
    pub fn starts_chain(&self) -> bool {
        !self.is_deleted() && self.sequence_number & LFN_FIRST_FLAG != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LfnState {
    #[default]
    Fresh,
    Accumulating { checksum: u8, name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LfnOutcome {
    Continue,
    /// Fragments of one chain disagree on the checksum: the rest of this
    /// directory cannot be trusted.
    Abort,
}

impl LfnState {
    pub fn feed(&mut self, lfn: &LfnEntry) -> LfnOutcome {
        if lfn.is_deleted() {
            // deleted fragments keep their text but lose the ordering byte
            match self {
                LfnState::Fresh => {
                    *self = LfnState::Accumulating {
                        checksum: lfn.checksum,
                        name: lfn.fragment.clone(),
                    }
                }
                LfnState::Accumulating { name, .. } => name.insert_str(0, &lfn.fragment),
            }
            return LfnOutcome::Continue;
        }

        if lfn.starts_chain() {
            if let LfnState::Accumulating { name, .. } = self {
                warn!("Overwritten long filename, dropping partial '{}'", name);
            }
            *self = LfnState::Accumulating {
                checksum: lfn.checksum,
                name: lfn.fragment.clone(),
            };
            return LfnOutcome::Continue;
        }

        match self {
            LfnState::Fresh => {
                warn!(
                    "Long filename continuation 0x{:02X} without a starting fragment",
                    lfn.sequence_number
                );
                *self = LfnState::Accumulating {
                    checksum: lfn.checksum,
                    name: lfn.fragment.clone(),
                };
                LfnOutcome::Continue
            }
            LfnState::Accumulating { checksum, name } => {
                if *checksum != lfn.checksum {
                    return LfnOutcome::Abort;
                }
                name.insert_str(0, &lfn.fragment);
                LfnOutcome::Continue
            }
        }
    }

    /// Hand over the accumulated `(checksum, name)` and reset.
    pub fn take(&mut self) -> Option<(u8, String)> {
        match std::mem::take(self) {
            LfnState::Fresh => None,
            LfnState::Accumulating { checksum, name } => Some((checksum, name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    fn short_raw(name: &[u8; 11], attr: u8) -> Vec<u8> {
        let mut raw = vec![0u8; ENTRY_SIZE];
        raw[..11].copy_from_slice(name);
        raw[11] = attr;
        raw[0x14..0x16].copy_from_slice(&0x0001u16.to_le_bytes());
        raw[0x1A..0x1C].copy_from_slice(&0x0002u16.to_le_bytes());
        raw
    }

    fn lfn_raw(seq: u8, checksum: u8, text: &str) -> Vec<u8> {
        let mut units: Vec<u16> = text.encode_utf16().collect();
        if units.len() < 13 {
            units.push(0);
        }
        units.resize(13, 0xFFFF);
        let bytes: Vec<u8> = units.iter().flat_map(|u| u.to_le_bytes()).collect();
        let mut raw = vec![0u8; ENTRY_SIZE];
        raw[0] = seq;
        raw[1..11].copy_from_slice(&bytes[0..10]);
        raw[11] = ATTR_LONG_NAME;
        raw[13] = checksum;
        raw[14..26].copy_from_slice(&bytes[10..22]);
        raw[28..32].copy_from_slice(&bytes[22..26]);
        raw
    }

    #[test]
    fn checksum_matches_dos_algorithm() {
        assert_eq!(short_name_checksum(b"A       TXT"), 0x5D);
        assert_eq!(short_name_checksum(b"LONGFI~1TXT"), 0xD4);
    }

    #[test]
    fn short_entry_fields() {
        let e = ShortEntry::from_bytes(&short_raw(b"README  TXT", 0x20)).unwrap();
        assert_eq!(e.short_name(), "README.TXT");
        assert_eq!(e.first_cluster, 0x0001_0002);
        assert!(!e.is_directory());

        let d = ShortEntry::from_bytes(&short_raw(b"SUB     D  ", ATTR_DIRECTORY)).unwrap();
        assert_eq!(d.short_name(), "SUB");

        let gone = ShortEntry::from_bytes(&short_raw(b"\xE5EMOVED TXT", 0x20)).unwrap();
        assert!(gone.is_deleted());
        assert_eq!(gone.short_name(), "EMOVED.TXT");

        let kanji = ShortEntry::from_bytes(&short_raw(b"\x05BC     TXT", 0x20)).unwrap();
        assert!(!kanji.is_deleted());
        assert_eq!(kanji.short_name(), "\u{e5}BC.TXT");

        let label = ShortEntry::from_bytes(&short_raw(b"MY DISK    ", ATTR_VOLUME_LABEL)).unwrap();
        assert!(label.is_volume_label());
        assert_eq!(label.label(), "MY DISK");
    }

    #[test]
    fn timestamps_decode_with_centiseconds() {
        // 2021-03-04 13:45:30 plus 1.50 s
        let date = ((2021 - 1980) << 9 | 3 << 5 | 4) as u16;
        let time = (13 << 11 | 45 << 5 | 15) as u16;
        let t = fat_datetime(date, time, 150).unwrap();
        assert_eq!((t.year(), t.month(), t.day()), (2021, 3, 4));
        assert_eq!((t.hour(), t.minute(), t.second()), (13, 45, 31));
        assert_eq!(t.timestamp_subsec_millis(), 500);

        assert!(fat_datetime(0, 0, 0).is_none());
        assert!(fat_date_midnight(date).unwrap().hour() == 0);
        // hour 31 does not exist
        assert!(fat_datetime(date, 31 << 11, 0).is_none());
    }

    #[test]
    fn lfn_chain_is_reassembled_in_reverse() {
        let mut state = LfnState::default();
        let tail = LfnEntry::from_bytes(&lfn_raw(0x42, 0xD4, "ame.txt")).unwrap();
        let head = LfnEntry::from_bytes(&lfn_raw(0x01, 0xD4, "A very long n")).unwrap();
        assert_eq!(tail.fragment, "ame.txt");
        assert!(tail.starts_chain());

        assert_eq!(state.feed(&tail), LfnOutcome::Continue);
        assert_eq!(state.feed(&head), LfnOutcome::Continue);
        assert_eq!(
            state.take(),
            Some((0xD4, "A very long name.txt".to_string()))
        );
        assert_eq!(state, LfnState::Fresh);
    }

    #[test]
    fn lfn_checksum_disagreement_aborts() {
        let mut state = LfnState::default();
        state.feed(&LfnEntry::from_bytes(&lfn_raw(0x42, 0x11, "tail")).unwrap());
        let bad = LfnEntry::from_bytes(&lfn_raw(0x01, 0x22, "head")).unwrap();
        assert_eq!(state.feed(&bad), LfnOutcome::Abort);
    }

    #[test]
    fn stale_partial_is_replaced_by_new_chain() {
        let mut state = LfnState::default();
        state.feed(&LfnEntry::from_bytes(&lfn_raw(0x43, 0x11, "stale")).unwrap());
        state.feed(&LfnEntry::from_bytes(&lfn_raw(0x41, 0x33, "fresh")).unwrap());
        assert_eq!(state.take(), Some((0x33, "fresh".to_string())));
    }

    #[test]
    fn deleted_fragments_accumulate_without_checks() {
        let mut state = LfnState::default();
        state.feed(&LfnEntry::from_bytes(&lfn_raw(DELETED_MARK, 0x10, "two")).unwrap());
        state.feed(&LfnEntry::from_bytes(&lfn_raw(DELETED_MARK, 0x99, "one-")).unwrap());
        assert_eq!(state.take().map(|(_, n)| n), Some("one-two".to_string()));
    }
}
