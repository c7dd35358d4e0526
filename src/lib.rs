// Sources:
// - https://en.wikipedia.org/wiki/Design_of_the_FAT_file_system
// - https://dubeyko.com/development/FileSystems/NTFS/ntfsdoc.pdf

//! Offline reconstruction of FAT32 and NTFS metadata from raw disk images.
//!
//! [`read_partition_table`] finds the volumes of an image and
//! [`parse_partition`] turns one of them into an [`EntryTable`]: one row per
//! file or directory, deleted ones included, with their cluster runs and
//! timestamps.

use log::{error, info};
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;

pub mod config;
pub mod entry;
pub mod error;
pub mod fat32;
pub mod fdt;
pub mod layout;
pub mod mbr;
pub mod mft;
pub mod ntfs;
pub mod pbs;
pub mod stream;

pub use config::ParseOptions;
pub use entry::{ClusterRun, Entry, EntryTable, FsKind, MacbTimes, NtfsDetails, Skipped};
pub use error::{ExhumeError, Result};
pub use fat32::FAT32;
pub use mbr::{PartitionDescriptor, PartitionType, read_partition_table};
pub use ntfs::NTFS;
pub use stream::{ClusterStream, ImageStream};

/// Open a raw image file or block device read-only.
pub fn open_image<P: AsRef<Path>>(path: P) -> Result<ImageStream<BufReader<File>>> {
    ImageStream::open(path)
}

/// Reconstruct the entry table of one partition of `body`.
///
/// Structural errors (bad boot sector, unreadable FAT) abort this partition
/// only; the caller may go on with the next descriptor.
pub fn parse_partition<T: Read + Seek>(
    body: &mut T,
    partition: &PartitionDescriptor,
    options: &ParseOptions,
) -> Result<EntryTable> {
    info!(
        "Parsing {:?} partition at 0x{:X} ({} sectors)",
        partition.kind, partition.first_byte_offset, partition.sector_count
    );
    let table = match partition.kind {
        PartitionType::Fat32 => {
            FAT32::new(body, partition.first_byte_offset, options).and_then(|mut fs| fs.entries())
        }
        PartitionType::Ntfs => {
            NTFS::new(body, partition.first_byte_offset, options).and_then(|mut fs| fs.entries())
        }
        kind => Err(ExhumeError::UnsupportedPartition(kind)),
    };
    if let Err(e) = &table {
        error!(
            "Partition at 0x{:X} abandoned: {}",
            partition.first_byte_offset, e
        );
    }
    table
}
