// Sources:
// - https://dubeyko.com/development/FileSystems/NTFS/ntfsdoc.pdf
// - https://en.wikipedia.org/wiki/NTFS

use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::io::{Read, Seek, SeekFrom};

use crate::config::ParseOptions;
use crate::entry::{ClusterRun, Entry, EntryTable, FsKind, NtfsDetails, average_cluster};
use crate::error::{ExhumeError, Result};
use crate::mft::{Attribute, AttributeType, DataRun, DirectoryEntry, MFTRecord, decode_run_list, parse_index_block};
use crate::pbs::PartitionBootSector;
use crate::stream::fill;

pub const ROOT_RECORD: u64 = 5;
pub const VOLUME_RECORD: u64 = 3;
/// Records 12..16 are reserved and usually never initialised.
const RESERVED_RECORDS: std::ops::Range<u64> = 12..16;

pub const CYCLE_ENTRY: &str = "<CYCLE>";
pub const UNKNOWN_ENTRY: &str = "??";
pub const ORPHAN_ENTRY: &str = "$ORPHAN";

/// What path resolution needs from a parent record.
#[derive(Debug, Clone)]
struct ParentInfo {
    sequence_number: u16,
    link_count: u16,
    flags: u16,
    /// Best name with its own parent reference and sequence.
    name: Option<(String, u64, u16)>,
}

type PathKey = (u64, u16, u16, u16);

pub struct NTFS<T: Read + Seek> {
    pub pbs: PartitionBootSector,
    pub body: T,
    /// Absolute position of the volume in `body`.
    pub base_offset: u64,
    options: ParseOptions,
    /// `$DATA` runs of `$MFT`; empty when the table is read linearly.
    mft_runs: Option<Vec<DataRun>>,
    record_cache: HashMap<u64, Option<ParentInfo>>,
    /// Resolved directory paths with their orphaned bit.
    path_cache: HashMap<PathKey, (String, bool)>,
}

/// `prefix` joined with `components` given leaf first. An empty prefix is the root.
fn join_path(prefix: &str, components: &[String]) -> String {
    let tail = components
        .iter()
        .rev()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join("/");
    if prefix.is_empty() {
        format!("/{}", tail)
    } else if tail.is_empty() {
        prefix.to_string()
    } else {
        format!("{}/{}", prefix, tail)
    }
}

/// Allocated runs must end inside the volume. Sparse runs are not bounded.
fn check_runs(runs: &[DataRun], total_clusters: u64) -> Result<()> {
    for run in runs {
        let Some(lcn) = run.lcn else { continue };
        if lcn.checked_add(run.length).is_none_or(|end| end > total_clusters) {
            return Err(ExhumeError::InvalidRecord(format!(
                "run of {} clusters at LCN {} is past the {} clusters of the volume",
                run.length, lcn, total_clusters
            )));
        }
    }
    Ok(())
}

impl<T: Read + Seek> NTFS<T> {
    /// Read the boot sector found `base_offset` bytes into `body`.
    pub fn new(mut body: T, base_offset: u64, options: &ParseOptions) -> Result<Self> {
        body.seek(SeekFrom::Start(base_offset))?;
        let mut sector = vec![0u8; 512];
        let got = fill(&mut body, &mut sector)?;
        sector.truncate(got);
        let pbs = PartitionBootSector::from_bytes(&sector)?;
        info!(
            "NTFS volume at 0x{:X}: {} byte clusters, {} byte records, $MFT at cluster {}",
            base_offset,
            pbs.cluster_size(),
            pbs.file_record_size(),
            pbs.mft_cluster
        );

        Ok(Self {
            pbs,
            body,
            base_offset,
            options: options.clone(),
            mft_runs: None,
            record_cache: HashMap::new(),
            path_cache: HashMap::new(),
        })
    }

    /// Load the `$MFT` run-list if not loaded yet.
    fn ensure_mft_runs(&mut self) -> Result<()> {
        if self.mft_runs.is_some() {
            return Ok(());
        }
        debug!("Loading MFT run-list (not loaded).");

        // record 0 is always in the first extent
        let at = self.base_offset + self.pbs.mft_address();
        let total_clusters = self.pbs.total_clusters();
        let rec0 = self
            .read_record_at(at, 0)
            .and_then(|rec| rec.data_runs())
            .and_then(|runs| {
                check_runs(&runs, total_clusters)?;
                if runs.iter().any(|r| r.lcn.is_none() && r.length > total_clusters) {
                    return Err(ExhumeError::InvalidRecord(
                        "sparse run larger than the volume".into(),
                    ));
                }
                Ok(runs)
            });

        let runs = match rec0 {
            Ok(runs) if !runs.is_empty() => {
                debug!("$MFT spans {} run(s)", runs.len());
                runs
            }
            Ok(_) => {
                warn!("$MFT has no non-resident $DATA, assuming a contiguous table");
                Vec::new()
            }
            Err(e) => {
                warn!("$MFT record 0 unusable ({}), assuming a contiguous table", e);
                Vec::new()
            }
        };
        self.mft_runs = Some(runs);
        Ok(())
    }

    fn mft_runs(&mut self) -> Result<&[DataRun]> {
        self.ensure_mft_runs()?;
        Ok(self.mft_runs.as_deref().unwrap_or_default())
    }

    /// Number of records `$MFT` can hold, when its run-list is known.
    pub fn mft_records_count(&mut self) -> Result<Option<u64>> {
        let cluster_size = self.pbs.cluster_size();
        let rec_size = self.pbs.file_record_size();
        let runs = self.mft_runs()?;
        if runs.is_empty() {
            return Ok(None);
        }
        let bytes = runs
            .iter()
            .try_fold(0u64, |acc, r| acc.checked_add(r.length))
            .and_then(|clusters| clusters.checked_mul(cluster_size));
        Ok(bytes.map(|b| b / rec_size))
    }

    /// Absolute byte offset of record `file_id`.
    pub fn record_offset(&mut self, file_id: u64) -> Result<u64> {
        let cluster_size = self.pbs.cluster_size();
        let rec_size = self.pbs.file_record_size();
        let linear = self.base_offset + self.pbs.mft_address();
        let base_offset = self.base_offset;
        let runs = self.mft_runs()?;

        let wanted = file_id.checked_mul(rec_size).ok_or(ExhumeError::Exhausted)?;
        if runs.is_empty() {
            return linear.checked_add(wanted).ok_or(ExhumeError::Exhausted);
        }

        // byte position inside $MFT, then the run holding it
        let mut run_start = 0u64;
        for run in runs {
            let run_end = run
                .length
                .checked_mul(cluster_size)
                .and_then(|b| b.checked_add(run_start))
                .ok_or(ExhumeError::Exhausted)?;
            if wanted < run_end {
                let lcn = run.lcn.ok_or_else(|| {
                    ExhumeError::InvalidRecord(format!("record {} lies in a sparse $MFT run", file_id))
                })?;
                return Ok(base_offset + lcn * cluster_size + (wanted - run_start));
            }
            run_start = run_end;
        }
        Err(ExhumeError::Exhausted)
    }

    fn read_record_at(&mut self, at: u64, file_id: u64) -> Result<MFTRecord> {
        let rec_size = self.pbs.file_record_size() as usize;
        self.body.seek(SeekFrom::Start(at))?;
        let mut buf = vec![0u8; rec_size];
        if fill(&mut self.body, &mut buf)? < rec_size {
            return Err(ExhumeError::Exhausted);
        }
        MFTRecord::from_bytes(&buf, Some(file_id))
    }

    pub fn get_file_id(&mut self, file_id: u64) -> Result<MFTRecord> {
        let at = self.record_offset(file_id)?;
        debug!("MFT entry {} read from 0x{:X}", file_id, at);
        self.read_record_at(at, file_id)
    }

    fn parent_info(&mut self, file_id: u64) -> Option<ParentInfo> {
        if let Some(hit) = self.record_cache.get(&file_id) {
            return hit.clone();
        }
        let info = match self.get_file_id(file_id) {
            Ok(rec) => Some(ParentInfo {
                sequence_number: rec.header.sequence_number,
                link_count: rec.header.hard_link_count,
                flags: rec.header.flags,
                name: rec
                    .best_file_name()
                    .map(|f| (f.name, f.parent_ref, f.parent_seq)),
            }),
            Err(e) => {
                debug!("Parent record {} unreadable: {}", file_id, e);
                None
            }
        };
        if self.record_cache.len() >= self.options.record_cache_size {
            self.record_cache.clear();
        }
        self.record_cache.insert(file_id, info.clone());
        info
    }

    /// Rebuild the full path of `record` from parent back-references.
    ///
    /// Returns the path and whether a broken parent link was met.
    pub fn resolve_path(&mut self, record: &MFTRecord) -> (String, bool) {
        if record.id == ROOT_RECORD {
            return ("/".to_string(), false);
        }
        let Some(fname) = record.best_file_name() else {
            return (UNKNOWN_ENTRY.to_string(), false);
        };

        let mut components = vec![fname.name];
        let mut pending: Vec<(PathKey, usize)> = Vec::new();
        let mut visited = HashSet::from([record.id]);
        let mut cur = (fname.parent_ref, fname.parent_seq);
        let mut orphaned = false;

        let prefix = loop {
            let (parent, parent_seq) = cur;
            if parent == ROOT_RECORD {
                break String::new();
            }
            if !visited.insert(parent) {
                break CYCLE_ENTRY.to_string();
            }
            let Some(info) = self.parent_info(parent) else {
                orphaned = true;
                break ORPHAN_ENTRY.to_string();
            };
            if info.sequence_number != parent_seq {
                orphaned = true;
                break ORPHAN_ENTRY.to_string();
            }

            let key = (parent, info.sequence_number, info.link_count, info.flags);
            if let Some((known, known_orphaned)) = self.path_cache.get(&key) {
                orphaned |= *known_orphaned;
                break known.clone();
            }
            match info.name {
                Some((name, grand_parent, grand_parent_seq)) => {
                    components.push(name);
                    pending.push((key, components.len() - 1));
                    cur = (grand_parent, grand_parent_seq);
                }
                None => break UNKNOWN_ENTRY.to_string(),
            }
        };

        if !prefix.starts_with(CYCLE_ENTRY) {
            for (key, depth) in pending {
                if self.path_cache.len() >= self.options.path_cache_size {
                    self.path_cache.clear();
                }
                self.path_cache
                    .insert(key, (join_path(&prefix, &components[depth..]), orphaned));
            }
        }

        (join_path(&prefix, &components), orphaned)
    }

    /// Walk the MFT in record order and build the entry table.
    pub fn entries(&mut self) -> Result<EntryTable> {
        let mut table = EntryTable::new(FsKind::Ntfs);
        let limit = self.mft_records_count()?;
        if let Some(count) = limit {
            info!("$MFT holds up to {} records", count);
        }

        let mut file_id = 0u64;
        loop {
            if RESERVED_RECORDS.contains(&file_id) {
                file_id = RESERVED_RECORDS.end;
            }
            if limit.is_some_and(|count| file_id >= count) {
                break;
            }

            let record = match self.get_file_id(file_id) {
                Ok(rec) => rec,
                Err(ExhumeError::Exhausted) => break,
                Err(ExhumeError::InvalidRecord(reason)) => {
                    warn!("MFT record {} skipped: {}", file_id, reason);
                    table.skip(format!("MFT record {}", file_id), reason);
                    file_id += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            match self.build_entry(&record, table.entries.len() as u64, &mut table) {
                Ok(Some(entry)) => table.entries.push(entry),
                Ok(None) => {}
                Err(ExhumeError::InvalidRecord(reason)) => {
                    warn!("MFT record {} skipped: {}", file_id, reason);
                    table.skip(format!("MFT record {}", file_id), reason);
                }
                Err(e) => return Err(e),
            }
            file_id += 1;
        }

        info!(
            "Found {} records, {} skipped",
            table.len(),
            table.skipped.len()
        );
        Ok(table)
    }

    fn build_entry(
        &mut self,
        record: &MFTRecord,
        id: u64,
        table: &mut EntryTable,
    ) -> Result<Option<Entry>> {
        if record.id == VOLUME_RECORD {
            if let Some(label) = record.volume_name() {
                debug!("Volume label '{}'", label);
                table.volume_label = Some(label);
            }
        }
        if record.is_extension() && self.options.skip_extension_records {
            debug!(
                "Record {} extends record {}, not a row of its own",
                record.id, record.header.base_file_record
            );
            return Ok(None);
        }

        let runs = record.data_runs()?;
        check_runs(&runs, self.pbs.total_clusters())?;
        let (full_path, orphaned) = self.resolve_path(record);
        let clusters: Vec<ClusterRun> = runs.iter().filter_map(DataRun::to_cluster_run).collect();

        let si = record.standard_information().map(|s| s.times);
        let fn_ = record.best_file_name().map(|f| f.times);
        let pick = |si_t: Option<_>, fn_t| si_t.or(fn_t);

        Ok(Some(Entry {
            id,
            full_path,
            is_directory: record.is_dir(),
            is_deleted: !record.is_in_use(),
            first_cluster: clusters.first().map(|r| r.start).unwrap_or(0),
            average_cluster: average_cluster(&clusters),
            clusters,
            size: record.data_size(),
            create_time: pick(si.and_then(|t| t.created), fn_.and_then(|t| t.created)),
            modify_time: pick(si.and_then(|t| t.modified), fn_.and_then(|t| t.modified)),
            access_time: pick(si.and_then(|t| t.accessed), fn_.and_then(|t| t.accessed)),
            ntfs: Some(NtfsDetails {
                record_number: record.id,
                sequence_number: record.header.sequence_number,
                lsn: record.header.lsn,
                link_count: record.header.hard_link_count,
                orphaned,
                si,
                fn_,
            }),
        }))
    }

    /// List every child entry of the directory whose MFT record is `dir_id`.
    /// Works for both small (resident) and large (non-resident) directories.
    /// Entries recovered from `INDX` slack follow the live ones, flagged `deleted`.
    pub fn list_dir(&mut self, dir_id: u64) -> Result<Vec<DirectoryEntry>> {
        let rec = self.get_file_id(dir_id)?;
        if !rec.is_dir() {
            return Err(ExhumeError::InvalidRecord(format!(
                "record {} is not a directory",
                dir_id
            )));
        }
        let mut entries = rec.directory_entries().unwrap_or_default();

        let idx_alloc = rec.attributes.iter().find_map(|a| match a {
            Attribute::NonResident { header, run_list, .. }
                if header.attr_type == AttributeType::IndexAllocation =>
            {
                Some(run_list)
            }
            _ => None,
        });

        if let Some(run_list) = idx_alloc {
            info!("Directory {} uses a non-resident index, walking it", dir_id);
            let cluster_size = self.pbs.cluster_size();
            let block_size = rec.index_record_size(self.pbs.index_record_size());

            let runs = decode_run_list(run_list)?;
            check_runs(&runs, self.pbs.total_clusters())?;
            for run in runs {
                let Some(lcn) = run.lcn else { continue };
                let start = self.base_offset + lcn * cluster_size;
                let mut off = 0u64;
                while off + block_size <= run.length * cluster_size {
                    self.body.seek(SeekFrom::Start(start + off))?;
                    let mut buf = vec![0u8; block_size as usize];
                    if fill(&mut self.body, &mut buf)? < buf.len() {
                        warn!("Index block at 0x{:X} truncated", start + off);
                        break;
                    }
                    match parse_index_block(&buf) {
                        Some(found) => entries.extend(found),
                        None => debug!("No INDX block at 0x{:X}", start + off),
                    }
                    off += block_size;
                }
            }
        }

        // live entries win over their stale copies in slack
        entries.sort_by_key(|e| e.deleted);
        let mut seen = HashSet::<(u64, String)>::new();
        entries.retain(|e| seen.insert((e.file_id, e.name.clone())));
        Ok(entries)
    }
}
