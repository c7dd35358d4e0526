//! Read-only byte sources.
//!
//! [`ImageStream`] is the handle every engine reads from: a disk image, a raw
//! block device, or any other `Read + Seek` body (EWF containers through
//! `exhume_body`). Nothing in this crate ever writes to it.
//!
//! [`ClusterStream`] turns a list of cluster runs into one forward-only
//! sequence, which is how FAT directory tables are walked.

use log::{debug, warn};
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use crate::entry::ClusterRun;
use crate::error::{ExhumeError, Result};

pub struct ImageStream<R: Read + Seek> {
    inner: R,
}

impl ImageStream<BufReader<File>> {
    /// Open an image file or a raw device read-only.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        debug!("Opened '{}' read-only", path.as_ref().display());
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: Read + Seek> ImageStream<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Move to an absolute byte offset.
    pub fn seek_to(&mut self, offset: u64) -> Result<u64> {
        Ok(self.inner.seek(SeekFrom::Start(offset))?)
    }

    pub fn tell(&mut self) -> Result<u64> {
        Ok(self.inner.stream_position()?)
    }

    /// Read up to `n` bytes. Fewer are returned only at the end of the stream.
    pub fn read_upto(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        let got = fill(&mut self.inner, &mut buf)?;
        buf.truncate(got);
        Ok(buf)
    }

    pub fn close(self) -> R {
        self.inner
    }
}

impl<R: Read + Seek> Read for ImageStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl<R: Read + Seek> Seek for ImageStream<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

/// Read until `buf` is full or the source reports end of stream.
pub(crate) fn fill<R: Read>(src: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match src.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

/// Where cluster 2 starts and how large a cluster is, both in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterGeometry {
    pub data_offset: u64,
    pub bytes_per_cluster: u64,
}

impl ClusterGeometry {
    pub fn cluster_to_byte(&self, cluster: u64) -> u64 {
        self.data_offset + cluster.saturating_sub(2) * self.bytes_per_cluster
    }
}

/// Forward-only view over a chain of cluster runs with a one-cluster buffer.
pub struct ClusterStream<'a, T: Read + Seek> {
    body: &'a mut T,
    geometry: ClusterGeometry,
    runs: &'a [ClusterRun],
    run_idx: usize,
    next_cluster: Option<u64>,
    buffer: Vec<u8>,
    pos: usize,
}

impl<'a, T: Read + Seek> ClusterStream<'a, T> {
    pub fn new(body: &'a mut T, runs: &'a [ClusterRun], geometry: ClusterGeometry) -> Self {
        Self {
            body,
            geometry,
            runs,
            run_idx: 0,
            next_cluster: runs.first().map(|r| r.start),
            buffer: Vec::new(),
            pos: 0,
        }
    }

    fn advance(&mut self) -> Option<u64> {
        let cluster = self.next_cluster?;
        let run = self.runs[self.run_idx];
        self.next_cluster = if cluster < run.end {
            Some(cluster + 1)
        } else {
            self.run_idx += 1;
            self.runs.get(self.run_idx).map(|r| r.start)
        };
        Some(cluster)
    }

    fn load_next_cluster(&mut self) -> Result<()> {
        let cluster = self.advance().ok_or(ExhumeError::Exhausted)?;
        let at = self.geometry.cluster_to_byte(cluster);
        self.body.seek(SeekFrom::Start(at))?;

        let size = self.geometry.bytes_per_cluster as usize;
        self.buffer.clear();
        self.buffer.resize(size, 0);
        let got = fill(self.body, &mut self.buffer)?;
        if got < size {
            warn!(
                "Cluster {} at 0x{:X} is truncated ({} of {} bytes), zero padding",
                cluster, at, got, size
            );
        }
        self.pos = 0;
        Ok(())
    }

    /// Read exactly `n` bytes, crossing cluster boundaries as needed.
    ///
    /// Returns [`ExhumeError::Exhausted`] once the last run is consumed.
    pub fn read(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            if self.pos >= self.buffer.len() {
                self.load_next_cluster()?;
            }
            let take = (n - out.len()).min(self.buffer.len() - self.pos);
            out.extend_from_slice(&self.buffer[self.pos..self.pos + take]);
            self.pos += take;
        }
        Ok(out)
    }

    pub fn seek(&mut self, _offset: u64) -> Result<u64> {
        Err(ExhumeError::Unsupported("seek on a forward-only cluster stream"))
    }

    pub fn tell(&self) -> Result<u64> {
        Err(ExhumeError::Unsupported("tell on a forward-only cluster stream"))
    }
}
