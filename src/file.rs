//! Random-access file streams over a cluster chain.

use alloc::vec;
use alloc::vec::Vec;

use crate::dir::DirLocation;
use crate::dirent::{Attributes, RawDirEntry};
use crate::disk::Disk;
use crate::error::Error;
use crate::fat::Cluster;
use crate::fs::{raw_to_slot, FileSystem, FsCore, Resolved};
use crate::path::FilePath;

/// How a file is opened. At least one access mode must be requested;
/// `append` and `truncate` imply write access.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOptions {
    read: bool,
    write: bool,
    append: bool,
    truncate: bool,
    create: bool,
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(mut self, read: bool) -> Self {
        self.read = read;
        self
    }

    pub fn write(mut self, write: bool) -> Self {
        self.write = write;
        self
    }

    /// Position every write at the end of the file.
    pub fn append(mut self, append: bool) -> Self {
        self.append = append;
        self
    }

    /// Truncate the file to zero bytes on open.
    pub fn truncate(mut self, truncate: bool) -> Self {
        self.truncate = truncate;
        self
    }

    /// Create the file if it does not exist. Requires write access.
    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    fn writable(self) -> bool {
        self.write || self.append || self.truncate
    }
}

#[derive(Debug, Clone, Copy)]
pub enum SeekFrom {
    Start(u64),
    Current(i64),
    End(i64),
}

/// The stream's view of its directory entry: where the short entry lives
/// and the pending metadata to write back on flush.
pub(crate) struct FileState {
    pub(crate) parent: DirLocation,
    pub(crate) short_slot: usize,
    pub(crate) raw: RawDirEntry,
    pub(crate) dirty: bool,
}

/// Last known chain position of a stream, making sequential access linear
/// instead of quadratic: a forward seek resumes walking from here and only
/// a backward seek restarts from the first cluster.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChainPos {
    pub(crate) index: u32,
    pub(crate) cluster: Cluster,
}

/// An open file. Dropping the stream flushes pending metadata and FAT
/// state; errors during that implicit flush are logged and otherwise lost,
/// so callers that care should call [`File::flush`] themselves.
pub struct File<'fs, D: Disk> {
    fs: &'fs FileSystem<D>,
    state: FileState,
    pos: u64,
    cache: Option<ChainPos>,
    options: OpenOptions,
}

impl<'fs, D: Disk> File<'fs, D> {
    pub(crate) fn open(
        fs: &'fs FileSystem<D>,
        path: &str,
        options: OpenOptions,
    ) -> Result<Self, Error<D::Error>> {
        if !options.read && !options.writable() {
            return Err(Error::InvalidInput("no access mode requested"));
        }
        let path = FilePath::parse(path).map_err(Error::InvalidInput)?;

        let state = fs.with_core(|core| {
            if options.writable() && core.options.read_only {
                return Err(Error::ReadOnly);
            }
            let resolved = match core.resolve(&path) {
                Err(Error::NotFound) if options.create && options.writable() => {
                    core.create_file_at(&path)?;
                    core.resolve(&path)
                }
                other => other,
            }?;
            let Resolved::Entry { parent, entry } = resolved else {
                return Err(Error::IsDirectory);
            };
            if entry.raw.is_directory() {
                return Err(Error::IsDirectory);
            }
            if entry.raw.is_volume_label() {
                return Err(Error::NotFound);
            }
            if options.writable() && entry.raw.attributes.contains(Attributes::READ_ONLY) {
                return Err(Error::ReadOnly);
            }
            Ok(FileState {
                parent,
                short_slot: entry.slots.end - 1,
                raw: entry.raw,
                dirty: false,
            })
        })?;

        let mut file = Self {
            fs,
            state,
            pos: 0,
            cache: None,
            options,
        };
        if options.truncate {
            file.truncate(0)?;
        }
        if options.append {
            file.pos = u64::from(file.state.raw.size);
        }
        Ok(file)
    }

    /// Size of the file as this stream sees it, including writes not yet
    /// flushed to the directory entry.
    pub fn size(&self) -> u32 {
        self.state.raw.size
    }

    pub fn stream_position(&self) -> u64 {
        self.pos
    }

    /// Seek within the file. The position is clamped to the file size; FAT
    /// files cannot have holes, so growing happens through writes alone.
    pub fn seek(&mut self, from: SeekFrom) -> Result<u64, Error<D::Error>> {
        let size = i128::from(self.state.raw.size);
        let target = match from {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::Current(delta) => i128::from(self.pos) + i128::from(delta),
            SeekFrom::End(delta) => size + i128::from(delta),
        };
        if target < 0 {
            return Err(Error::InvalidInput("seek before the start of the file"));
        }
        self.pos = (target.min(size)) as u64;
        Ok(self.pos)
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error<D::Error>> {
        if !self.options.read {
            return Err(Error::InvalidInput("file not open for reading"));
        }
        let Self {
            fs,
            state,
            pos,
            cache,
            ..
        } = self;
        fs.with_core(|core| core.file_read(state, pos, cache, buf))
    }

    /// Read from the current position to the end of the file.
    pub fn read_to_end(&mut self, out: &mut Vec<u8>) -> Result<usize, Error<D::Error>> {
        let remaining = (u64::from(self.state.raw.size) - self.pos) as usize;
        let start = out.len();
        out.resize(start + remaining, 0);
        let n = self.read(&mut out[start..])?;
        out.truncate(start + n);
        Ok(n)
    }

    /// Write the whole buffer at the current position (or at the end in
    /// append mode), extending the file as needed.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, Error<D::Error>> {
        if !self.options.writable() {
            return Err(Error::ReadOnly);
        }
        if self.options.append {
            self.pos = u64::from(self.state.raw.size);
        }
        let Self {
            fs,
            state,
            pos,
            cache,
            ..
        } = self;
        fs.with_core(|core| core.file_write(state, pos, cache, buf))
    }

    /// Resize the file. Shrinking frees tail clusters; a shrink to zero
    /// keeps the first cluster allocated so the entry stays anchored.
    /// Growing zero-fills.
    pub fn truncate(&mut self, new_size: u32) -> Result<(), Error<D::Error>> {
        if !self.options.writable() {
            return Err(Error::ReadOnly);
        }
        let Self {
            fs,
            state,
            pos,
            cache,
            ..
        } = self;
        fs.with_core(|core| core.file_truncate(state, pos, cache, new_size))
    }

    /// Write back the directory entry (size, timestamps, first cluster) and
    /// flush the FAT.
    pub fn flush(&mut self) -> Result<(), Error<D::Error>> {
        let Self { fs, state, .. } = self;
        fs.with_core(|core| core.flush_file(state))
    }
}

impl<D: Disk> Drop for File<'_, D> {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            log::error!("error flushing file on close: {err}");
        }
    }
}

impl<D: Disk> FsCore<D> {
    /// Locate the cluster holding chain index `index`, resuming from the
    /// stream's cache when it lies at or before the target.
    fn cluster_at(
        &self,
        first: Cluster,
        cache: &mut Option<ChainPos>,
        index: u32,
    ) -> Result<Cluster, &'static str> {
        let mut pos = match cache {
            Some(cached) if cached.index <= index => *cached,
            _ => ChainPos {
                index: 0,
                cluster: first,
            },
        };
        while pos.index < index {
            match self.fat.next_cluster(pos.cluster)? {
                Some(next) => {
                    pos.cluster = next;
                    pos.index += 1;
                }
                None => return Err("file offset beyond the end of its cluster chain"),
            }
        }
        *cache = Some(pos);
        Ok(pos.cluster)
    }

    pub(crate) fn file_read(
        &mut self,
        state: &mut FileState,
        pos: &mut u64,
        cache: &mut Option<ChainPos>,
        buf: &mut [u8],
    ) -> Result<usize, Error<D::Error>> {
        let size = u64::from(state.raw.size);
        if *pos >= size || buf.is_empty() {
            return Ok(0);
        }
        let n = buf.len().min((size - *pos) as usize);
        let first = state.raw.first_cluster(self.geometry.fat_type);
        if first < 2 {
            return Err(Error::Corrupt("non-empty file without a first cluster"));
        }
        let first = Cluster(first);
        let bpc = u64::from(self.geometry.bytes_per_cluster);

        let mut done = 0usize;
        while done < n {
            let offset = *pos + done as u64;
            let index = (offset / bpc) as u32;
            let cluster = self.cluster_at(first, cache, index).map_err(Error::Corrupt)?;
            let intra = offset % bpc;

            // Clusters that happen to be consecutive on disk are served by
            // one backing-store read.
            let mut run_last = cluster;
            let mut run_bytes = bpc - intra;
            let remaining = (n - done) as u64;
            while run_bytes < remaining {
                match self.fat.next_cluster(run_last).map_err(Error::Corrupt)? {
                    Some(next) if next.0 == run_last.0 + 1 => {
                        run_last = next;
                        run_bytes += bpc;
                    }
                    _ => break,
                }
            }

            let chunk = remaining.min(run_bytes) as usize;
            let disk_offset = self.geometry.cluster_offset_bytes(cluster) + intra;
            self.read_at(disk_offset, &mut buf[done..done + chunk])?;
            done += chunk;
        }
        *pos += n as u64;

        if self.options.update_access_time && !self.options.read_only {
            let today = self.now().date;
            if state.raw.accessed() != today {
                state.raw.set_accessed(today);
                state.dirty = true;
            }
        }
        Ok(n)
    }

    pub(crate) fn file_write(
        &mut self,
        state: &mut FileState,
        pos: &mut u64,
        cache: &mut Option<ChainPos>,
        buf: &[u8],
    ) -> Result<usize, Error<D::Error>> {
        if buf.is_empty() {
            return Ok(0);
        }
        let size = u64::from(state.raw.size);
        debug_assert!(*pos <= size, "seek is clamped to the file size");
        let new_end = *pos + buf.len() as u64;
        if new_end > u64::from(u32::MAX) {
            return Err(Error::TooBig);
        }

        let fat_type = self.geometry.fat_type;
        let bpc = u64::from(self.geometry.bytes_per_cluster);
        let first_raw = state.raw.first_cluster(fat_type);
        let needed = new_end.div_ceil(bpc).max(1) as u32;

        let (first, have, last) = if first_raw >= 2 {
            let chain = self.fat.chain(Cluster(first_raw)).map_err(Error::Corrupt)?;
            let last = *chain.last().expect("a chain is never empty");
            (Some(Cluster(first_raw)), chain.len() as u32, Some(last))
        } else {
            (None, 0, None)
        };

        let allocation = if needed > have {
            Some(self.fat.allocate(needed - have, last).ok_or(Error::NoSpace)?)
        } else {
            None
        };
        let first = first.unwrap_or_else(|| {
            allocation
                .as_ref()
                .expect("a fresh file always allocates")
                .first()
        });

        let result = (|| {
            let mut done = 0usize;
            while done < buf.len() {
                let offset = *pos + done as u64;
                let index = (offset / bpc) as u32;
                let cluster = self.cluster_at(first, cache, index).map_err(Error::Corrupt)?;
                let intra = offset % bpc;
                let chunk = ((bpc - intra) as usize).min(buf.len() - done);
                let disk_offset = self.geometry.cluster_offset_bytes(cluster) + intra;
                self.write_at(disk_offset, &buf[done..done + chunk])?;
                done += chunk;
            }
            Ok(())
        })();

        if let Err(err) = result {
            // Put the FAT back the way it was; the allocation never becomes
            // visible to the caller.
            if let Some(allocation) = allocation {
                self.fat.rollback(allocation);
                *cache = None;
            }
            return Err(err);
        }

        if first_raw < 2 {
            state.raw.set_first_cluster(first.0);
        }
        if new_end > size {
            state.raw.size = new_end as u32;
        }
        state.raw.set_modified(self.now());
        state.dirty = true;
        *pos = new_end;
        Ok(buf.len())
    }

    pub(crate) fn file_truncate(
        &mut self,
        state: &mut FileState,
        pos: &mut u64,
        cache: &mut Option<ChainPos>,
        new_size: u32,
    ) -> Result<(), Error<D::Error>> {
        let size = state.raw.size;
        if new_size == size {
            return Ok(());
        }

        if new_size > size {
            // Grow by writing zeros at the old end.
            let zeros = vec![0u8; self.geometry.bytes_per_cluster as usize];
            let mut grow_pos = u64::from(size);
            let mut remaining = u64::from(new_size - size);
            while remaining > 0 {
                let chunk = remaining.min(zeros.len() as u64) as usize;
                self.file_write(state, &mut grow_pos, cache, &zeros[..chunk])?;
                remaining -= chunk as u64;
            }
            return Ok(());
        }

        let first = state.raw.first_cluster(self.geometry.fat_type);
        if first >= 2 {
            // Keep at least one cluster so the entry's first-cluster field
            // stays valid, even for a shrink to zero bytes.
            let keep = u64::from(new_size)
                .div_ceil(u64::from(self.geometry.bytes_per_cluster))
                .max(1) as u32;
            self.fat
                .truncate_chain(Cluster(first), keep)
                .map_err(Error::Corrupt)?;
        }
        state.raw.size = new_size;
        state.raw.set_modified(self.now());
        state.dirty = true;
        *cache = None;
        if *pos > u64::from(new_size) {
            *pos = u64::from(new_size);
        }
        Ok(())
    }

    pub(crate) fn flush_file(&mut self, state: &mut FileState) -> Result<(), Error<D::Error>> {
        if state.dirty {
            let slot = raw_to_slot(&state.raw);
            self.write_dir_slot(state.parent, state.short_slot, &slot)?;
            state.dirty = false;
        }
        self.flush_fat()
    }
}
