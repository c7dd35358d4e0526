//! The Entry Table: one normalized row per reconstructed file-system object.
//!
//! This is the only thing downstream rule evaluation and timeline rendering
//! ever see. Rows are produced once per parse pass and never mutated after.

use chrono::{DateTime, Utc};
use prettytable::{Table, row};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Inclusive `[start, end]` range of cluster numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct ClusterRun {
    pub start: u64,
    pub end: u64,
}

impl ClusterRun {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Number of clusters covered.
    pub fn count(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Run-length weighted mean cluster position, 0 for an empty list.
pub fn average_cluster(runs: &[ClusterRun]) -> f64 {
    let mut total_sum = 0f64;
    let mut total_n = 0u64;
    for r in runs {
        total_sum += r.count() as f64 * (r.start + r.end) as f64 / 2.0;
        total_n += r.count();
    }
    if total_n == 0 {
        0.0
    } else {
        total_sum / total_n as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum FsKind {
    Fat32,
    Ntfs,
}

/// Created / modified / MFT-changed / accessed quadruple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct MacbTimes {
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub mft_modified: Option<DateTime<Utc>>,
    pub accessed: Option<DateTime<Utc>>,
}

/// Columns only NTFS rows carry.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct NtfsDetails {
    pub record_number: u64,
    pub sequence_number: u16,
    pub lsn: u64,
    pub link_count: u16,
    pub orphaned: bool,
    pub si: Option<MacbTimes>,
    #[serde(rename = "fn")]
    pub fn_: Option<MacbTimes>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Entry {
    pub id: u64,
    pub full_path: String,
    pub is_directory: bool,
    pub is_deleted: bool,
    /// First cluster (FAT32) or first LCN of the unnamed `$DATA` (NTFS).
    pub first_cluster: u64,
    pub clusters: Vec<ClusterRun>,
    pub average_cluster: f64,
    pub size: u64,
    pub create_time: Option<DateTime<Utc>>,
    pub modify_time: Option<DateTime<Utc>>,
    pub access_time: Option<DateTime<Utc>>,
    pub ntfs: Option<NtfsDetails>,
}

/// A row or record dropped because of local corruption.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Skipped {
    pub location: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EntryTable {
    pub fs: FsKind,
    pub volume_label: Option<String>,
    pub entries: Vec<Entry>,
    pub skipped: Vec<Skipped>,
}

fn fmt_time(t: &Option<DateTime<Utc>>) -> String {
    t.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into())
}

impl EntryTable {
    pub fn new(fs: FsKind) -> Self {
        Self {
            fs,
            volume_label: None,
            entries: Vec::new(),
            skipped: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Entry> {
        self.entries.iter()
    }

    pub fn find_by_path(&self, path: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| e.full_path == path)
    }

    pub(crate) fn skip(&mut self, location: impl Into<String>, reason: impl Into<String>) {
        self.skipped.push(Skipped {
            location: location.into(),
            reason: reason.into(),
        });
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }

    /// Render the table for a terminal.
    pub fn to_string(&self) -> String {
        let mut out = String::new();

        let mut t = Table::new();
        match self.fs {
            FsKind::Fat32 => {
                t.add_row(row![b -> "Id", b -> "Path", b -> "Dir", b -> "Deleted",
                    b -> "First cluster", b -> "Runs", b -> "Size",
                    b -> "Created", b -> "Modified", b -> "Accessed"]);
                for e in &self.entries {
                    t.add_row(row![
                        e.id,
                        e.full_path,
                        e.is_directory,
                        e.is_deleted,
                        e.first_cluster,
                        e.clusters.len(),
                        e.size,
                        fmt_time(&e.create_time),
                        fmt_time(&e.modify_time),
                        fmt_time(&e.access_time)
                    ]);
                }
            }
            FsKind::Ntfs => {
                t.add_row(row![b -> "Id", b -> "Record", b -> "Seq", b -> "LSN", b -> "Path",
                    b -> "Deleted", b -> "First LCN", b -> "$SI Created", b -> "$SI Modified",
                    b -> "$FN Created", b -> "$FN Modified"]);
                for e in &self.entries {
                    let (rec, seq, lsn, fn_c, fn_m) = match &e.ntfs {
                        Some(d) => (
                            d.record_number.to_string(),
                            d.sequence_number.to_string(),
                            d.lsn.to_string(),
                            d.fn_.map(|t| fmt_time(&t.created)).unwrap_or_default(),
                            d.fn_.map(|t| fmt_time(&t.modified)).unwrap_or_default(),
                        ),
                        None => Default::default(),
                    };
                    t.add_row(row![
                        e.id,
                        rec,
                        seq,
                        lsn,
                        e.full_path,
                        e.is_deleted,
                        e.first_cluster,
                        fmt_time(&e.create_time),
                        fmt_time(&e.modify_time),
                        fn_c,
                        fn_m
                    ]);
                }
            }
        }
        out.push_str(&t.to_string());

        if !self.skipped.is_empty() {
            let mut s = Table::new();
            s.add_row(row![b -> "Skipped", b -> "Reason"]);
            for item in &self.skipped {
                s.add_row(row![item.location, item.reason]);
            }
            out.push('\n');
            out.push_str(&s.to_string());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_is_run_length_weighted() {
        // clusters 2,3,4 and 10 -> (2+3+4+10)/4
        let runs = [ClusterRun::new(2, 4), ClusterRun::new(10, 10)];
        assert!((average_cluster(&runs) - 4.75).abs() < f64::EPSILON);
        assert_eq!(average_cluster(&[]), 0.0);
    }

    #[test]
    fn json_keeps_fn_column_name() {
        let mut table = EntryTable::new(FsKind::Ntfs);
        table.entries.push(Entry {
            id: 0,
            full_path: "/a".into(),
            is_directory: false,
            is_deleted: false,
            first_cluster: 0,
            clusters: vec![],
            average_cluster: 0.0,
            size: 0,
            create_time: None,
            modify_time: None,
            access_time: None,
            ntfs: Some(NtfsDetails {
                record_number: 64,
                sequence_number: 1,
                lsn: 0,
                link_count: 1,
                orphaned: false,
                si: None,
                fn_: None,
            }),
        });
        let v = table.to_json();
        assert!(v["entries"][0]["ntfs"].get("fn").is_some());
        assert!(table.to_string().contains("/a"));
    }
}
