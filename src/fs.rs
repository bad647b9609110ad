//! The filesystem handle: mounting, the typed mount options, path
//! resolution and the directory-level operations of the public API.

use alloc::borrow::ToOwned;
use alloc::boxed::Box;
use alloc::collections::BTreeSet;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use spin::Mutex;
use zerocopy::{AsBytes, FromBytes};

use crate::boot::{BootSector, FatType, FsInfoSector, Geometry, BOOT_SECTOR_SIZE};
use crate::dir::{
    entry_slots, find_free_run, scan_entries, trailing_tombstones, DirLocation, ScannedEntry,
};
use crate::dirent::{
    encode_lfn, is_8dot3_conform, lfn_checksum, make_8dot3, pack_8dot3, sfn_case_flags,
    Attributes, EntryInfo, OemEncoding, RawDirEntry, RawLfnEntry, ShortName, DIR_ENTRY_SIZE,
    ENTRY_DELETED, ENTRY_E5_ESCAPE,
};
use crate::disk::Disk;
use crate::error::Error;
use crate::fat::{Cluster, Fat};
use crate::file::{File, OpenOptions};
use crate::path::{validate_name, FilePath};
use crate::time::{Clock, DosDateTime, EpochClock};

/// Typed mount configuration, parsed once before the handle exists.
pub struct MountOptions {
    /// Codec for the 8.3 name fields. Long names are always UCS-2.
    pub encoding: OemEncoding,
    /// Byte offset of the filesystem inside the backing store, for images
    /// with a partition table or other leading data.
    pub offset: u64,
    /// Force a long-name record for any name that is not exactly
    /// expressible as an upper-case 8.3 name.
    pub preserve_case: bool,
    /// Suppress every write, including the dirty-bit flip at mount.
    pub read_only: bool,
    /// Interpret and store timestamps in UTC instead of local time. The
    /// driver only records the choice; the supplied clock must honor it.
    pub utc: bool,
    /// Materialize directories on first access instead of walking the whole
    /// tree at mount.
    pub lazy_load: bool,
    /// Maintain the last-access date on reads.
    pub update_access_time: bool,
    /// Source for freshly written timestamps.
    pub clock: Box<dyn Clock>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            encoding: OemEncoding::default(),
            offset: 0,
            preserve_case: true,
            read_only: false,
            utc: false,
            lazy_load: true,
            update_access_time: false,
            clock: Box::new(EpochClock),
        }
    }
}

impl fmt::Debug for MountOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountOptions")
            .field("encoding", &self.encoding)
            .field("offset", &self.offset)
            .field("preserve_case", &self.preserve_case)
            .field("read_only", &self.read_only)
            .field("utc", &self.utc)
            .field("lazy_load", &self.lazy_load)
            .field("update_access_time", &self.update_access_time)
            .finish_non_exhaustive()
    }
}

/// A mount option key was recognized but its value is not usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidOption {
    pub key: String,
    pub value: String,
}

impl fmt::Display for InvalidOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid value {:?} for mount option {:?}", self.value, self.key)
    }
}

impl MountOptions {
    /// Build options from string key/value pairs. Unknown keys are silently
    /// discarded; known keys with unusable values are an error.
    pub fn from_pairs<'a>(
        pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<Self, InvalidOption> {
        let mut options = Self::default();
        for (key, value) in pairs {
            let invalid = || InvalidOption {
                key: key.to_owned(),
                value: value.to_owned(),
            };
            match key {
                "encoding" => {
                    options.encoding = match value {
                        "ibm437" => OemEncoding::Ibm437,
                        "ascii" => OemEncoding::Ascii,
                        _ => return Err(invalid()),
                    };
                }
                "offset" => options.offset = value.parse().map_err(|_| invalid())?,
                "preserve_case" => options.preserve_case = parse_bool(value).ok_or_else(invalid)?,
                "read_only" => options.read_only = parse_bool(value).ok_or_else(invalid)?,
                "utc" => options.utc = parse_bool(value).ok_or_else(invalid)?,
                "lazy_load" => options.lazy_load = parse_bool(value).ok_or_else(invalid)?,
                "atime" => {
                    options.update_access_time = parse_bool(value).ok_or_else(invalid)?;
                }
                _ => {}
            }
        }
        Ok(options)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

/// The result of walking a path to its final component.
pub(crate) enum Resolved {
    Root,
    Entry {
        parent: DirLocation,
        entry: ScannedEntry,
    },
}

/// All mutable state of a mounted volume. Shared by every stream opened
/// from the handle and only ever touched under the handle's lock.
pub(crate) struct FsCore<D: Disk> {
    pub(crate) disk: D,
    pub(crate) geometry: Geometry,
    pub(crate) fat: Fat,
    pub(crate) options: MountOptions,
}

impl<D: Disk> FsCore<D> {
    pub(crate) fn now(&self) -> DosDateTime {
        self.options.clock.now()
    }

    pub(crate) fn encoding(&self) -> OemEncoding {
        self.options.encoding
    }

    pub(crate) fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), Error<D::Error>> {
        self.disk
            .read_at(self.options.offset + offset, buf)
            .map_err(Error::Io)
    }

    pub(crate) fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), Error<D::Error>> {
        self.disk
            .write_at(self.options.offset + offset, buf)
            .map_err(Error::Io)
    }

    /// Write the in-memory FAT image back to every FAT copy. A failed
    /// mirror write is a hard error.
    pub(crate) fn flush_fat(&mut self) -> Result<(), Error<D::Error>> {
        if !self.fat.is_dirty() {
            return Ok(());
        }
        for copy in 0..self.geometry.fat_count {
            let offset = self.geometry.fat_offset_bytes(copy);
            let image = self.fat.image().to_vec();
            self.write_at(offset, &image)?;
        }
        self.fat.mark_flushed();
        Ok(())
    }

    /// Refresh the FSInfo sector from the in-memory counters (FAT32 only).
    pub(crate) fn write_fs_info(&mut self) -> Result<(), Error<D::Error>> {
        if self.geometry.fat_type != FatType::Fat32 || self.geometry.fs_info_sector == 0 {
            return Ok(());
        }
        let info = FsInfoSector::new_with(self.fat.free_count(), self.fat.free_hint());
        let offset =
            u64::from(self.geometry.fs_info_sector) * u64::from(self.geometry.bytes_per_sector);
        self.write_at(offset, info.as_bytes())
    }

    pub(crate) fn root_location(&self) -> DirLocation {
        match self.geometry.fat_type {
            FatType::Fat12 | FatType::Fat16 => DirLocation::FixedRoot,
            FatType::Fat32 => DirLocation::Chain(self.geometry.root_cluster),
        }
    }

    /// Cluster number to store in a `..` entry pointing at `parent`. The
    /// root is recorded as zero by convention, even on FAT32.
    fn dotdot_cluster(&self, parent: DirLocation) -> u32 {
        match parent {
            DirLocation::FixedRoot => 0,
            DirLocation::Chain(c) if c == self.geometry.root_cluster => 0,
            DirLocation::Chain(c) => c.0,
        }
    }

    /// Read a whole directory region into memory: the fixed root region or
    /// the concatenation of the directory's cluster chain.
    pub(crate) fn read_dir_buffer(&mut self, loc: DirLocation) -> Result<Vec<u8>, Error<D::Error>> {
        match loc {
            DirLocation::FixedRoot => {
                let mut buf = vec![0u8; self.geometry.root_dir_size_bytes() as usize];
                let offset = self.geometry.root_dir_offset_bytes();
                self.read_at(offset, &mut buf)?;
                Ok(buf)
            }
            DirLocation::Chain(first) => {
                let clusters = self.fat.chain(first).map_err(Error::Corrupt)?;
                let bpc = self.geometry.bytes_per_cluster as usize;
                let mut buf = vec![0u8; clusters.len() * bpc];
                for (i, &cluster) in clusters.iter().enumerate() {
                    let offset = self.geometry.cluster_offset_bytes(cluster);
                    self.read_at(offset, &mut buf[i * bpc..(i + 1) * bpc])?;
                }
                Ok(buf)
            }
        }
    }

    /// Absolute byte position of a directory slot.
    fn dir_slot_offset(&mut self, loc: DirLocation, slot: usize) -> Result<u64, Error<D::Error>> {
        let byte = (slot * DIR_ENTRY_SIZE) as u64;
        match loc {
            DirLocation::FixedRoot => {
                if byte >= self.geometry.root_dir_size_bytes() {
                    return Err(Error::Corrupt("slot outside the fixed root region"));
                }
                Ok(self.geometry.root_dir_offset_bytes() + byte)
            }
            DirLocation::Chain(first) => {
                let bpc = u64::from(self.geometry.bytes_per_cluster);
                let cluster_index = (byte / bpc) as usize;
                let clusters = self.fat.chain(first).map_err(Error::Corrupt)?;
                let cluster = *clusters
                    .get(cluster_index)
                    .ok_or(Error::Corrupt("slot outside the directory chain"))?;
                Ok(self.geometry.cluster_offset_bytes(cluster) + byte % bpc)
            }
        }
    }

    pub(crate) fn write_dir_slot(
        &mut self,
        loc: DirLocation,
        slot: usize,
        bytes: &[u8; DIR_ENTRY_SIZE],
    ) -> Result<(), Error<D::Error>> {
        let offset = self.dir_slot_offset(loc, slot)?;
        self.write_at(offset, bytes)
    }

    pub(crate) fn scan_dir(
        &mut self,
        loc: DirLocation,
    ) -> Result<Vec<ScannedEntry>, Error<D::Error>> {
        let buf = self.read_dir_buffer(loc)?;
        Ok(scan_entries(&buf, self.encoding()))
    }

    /// Walk `path` from the root to its final component.
    pub(crate) fn resolve(&mut self, path: &FilePath) -> Result<Resolved, Error<D::Error>> {
        let mut loc = self.root_location();
        let components = path.components();
        for (i, component) in components.iter().enumerate() {
            let entries = self.scan_dir(loc)?;
            let entry = entries
                .into_iter()
                .filter(|e| !e.raw.is_volume_label() && !e.raw.is_dot_entry())
                .find(|e| e.matches(component, self.options.encoding))
                .ok_or(Error::NotFound)?;

            if i + 1 == components.len() {
                return Ok(Resolved::Entry { parent: loc, entry });
            }
            loc = self.entry_dir_location(&entry)?;
        }
        Ok(Resolved::Root)
    }

    /// Resolve a path that must name a directory.
    pub(crate) fn resolve_dir(&mut self, path: &FilePath) -> Result<DirLocation, Error<D::Error>> {
        match self.resolve(path)? {
            Resolved::Root => Ok(self.root_location()),
            Resolved::Entry { entry, .. } => self.entry_dir_location(&entry),
        }
    }

    pub(crate) fn entry_dir_location(
        &self,
        entry: &ScannedEntry,
    ) -> Result<DirLocation, Error<D::Error>> {
        if !entry.raw.is_directory() {
            return Err(Error::NotADirectory);
        }
        let cluster = entry.raw.first_cluster(self.geometry.fat_type);
        if cluster < 2 || cluster > self.geometry.max_cluster().0 {
            return Err(Error::Corrupt("directory entry without a valid first cluster"));
        }
        Ok(DirLocation::Chain(Cluster(cluster)))
    }

    pub(crate) fn zero_cluster(&mut self, cluster: Cluster) -> Result<(), Error<D::Error>> {
        let offset = self.geometry.cluster_offset_bytes(cluster);
        let zeros = vec![0u8; self.geometry.bytes_per_cluster as usize];
        self.write_at(offset, &zeros)
    }

    /// Append one zeroed cluster to a directory chain, returning the slot
    /// index where the new space begins. The fixed FAT12/16 root region
    /// cannot grow.
    fn grow_dir(
        &mut self,
        loc: DirLocation,
        current_slots: usize,
    ) -> Result<usize, Error<D::Error>> {
        let DirLocation::Chain(first) = loc else {
            return Err(Error::NoSpace);
        };
        let chain = self.fat.chain(first).map_err(Error::Corrupt)?;
        let last = *chain.last().expect("a chain is never empty");
        let allocation = self.fat.allocate(1, Some(last)).ok_or(Error::NoSpace)?;
        let new_cluster = allocation.first();
        if let Err(err) = self.zero_cluster(new_cluster) {
            self.fat.rollback(allocation);
            return Err(err);
        }
        Ok(current_slots)
    }

    /// Insert a new logical entry named `name` into the directory at `loc`.
    /// `raw` supplies everything but the name fields. Returns the slot of
    /// the short entry.
    pub(crate) fn insert_entry(
        &mut self,
        loc: DirLocation,
        name: &str,
        mut raw: RawDirEntry,
    ) -> Result<usize, Error<D::Error>> {
        validate_name(name).map_err(Error::InvalidInput)?;

        let buf = self.read_dir_buffer(loc)?;
        let entries = scan_entries(&buf, self.encoding());
        for entry in &entries {
            if entry.raw.is_volume_label() || entry.raw.is_dot_entry() {
                continue;
            }
            if entry.matches(name, self.options.encoding) {
                return Err(Error::AlreadyExists);
            }
        }

        let taken: Vec<[u8; 11]> = entries.iter().map(|e| e.raw.name).collect();
        let (short, nt_flags, lfn) = self.name_representation(name, &taken)?;
        raw.name = short;
        raw.nt_reserved = nt_flags;

        let slots = entry_slots(&lfn, &raw);
        let start = match find_free_run(&buf, slots.len()) {
            Some(start) => start,
            None => self.grow_dir(loc, buf.len() / DIR_ENTRY_SIZE)?,
        };
        for (i, slot) in slots.iter().enumerate() {
            self.write_dir_slot(loc, start + i, slot)?;
        }
        Ok(start + slots.len() - 1)
    }

    /// Decide how `name` is stored: the packed short name, the NT case
    /// flags and the LFN chain (empty when the short entry suffices).
    fn name_representation(
        &self,
        name: &str,
        taken: &[[u8; 11]],
    ) -> Result<([u8; 11], u8, Vec<RawLfnEntry>), Error<D::Error>> {
        if is_8dot3_conform(name) {
            return Ok((pack_8dot3(name), 0, Vec::new()));
        }
        if !self.options.preserve_case {
            if let Some(flags) = sfn_case_flags(name) {
                let upper: String = name.chars().map(|c| c.to_ascii_uppercase()).collect();
                return Ok((pack_8dot3(&upper), flags, Vec::new()));
            }
        }
        let short = make_8dot3(name, taken).ok_or(Error::AlreadyExists)?;
        let lfn = encode_lfn(name, lfn_checksum(&short));
        Ok((short, 0, lfn))
    }

    /// Mark a logical entry's slots deleted and zero any tombstones left
    /// trailing the directory, so a stale LFN run cannot resurface.
    pub(crate) fn delete_entry_slots(
        &mut self,
        loc: DirLocation,
        entry: &ScannedEntry,
    ) -> Result<(), Error<D::Error>> {
        let mut buf = self.read_dir_buffer(loc)?;
        for slot in entry.slots.clone() {
            buf[slot * DIR_ENTRY_SIZE] = ENTRY_DELETED;
            let bytes: [u8; DIR_ENTRY_SIZE] = buf
                [slot * DIR_ENTRY_SIZE..(slot + 1) * DIR_ENTRY_SIZE]
                .try_into()
                .expect("slot slice is 32 bytes");
            self.write_dir_slot(loc, slot, &bytes)?;
        }
        for slot in trailing_tombstones(&buf) {
            self.write_dir_slot(loc, slot, &[0u8; DIR_ENTRY_SIZE])?;
        }
        Ok(())
    }

    pub(crate) fn create_file_at(&mut self, path: &FilePath) -> Result<(), Error<D::Error>> {
        let (parent_path, name) = path
            .split_dirname_filename()
            .ok_or(Error::InvalidInput("cannot create the root directory"))?;
        let parent = self.resolve_dir(&parent_path)?;
        let raw = RawDirEntry::new(*b"           ", Attributes::empty(), self.now());
        self.insert_entry(parent, name, raw)?;
        self.flush_fat()
    }

    fn create_dir_at(&mut self, path: &FilePath) -> Result<(), Error<D::Error>> {
        let (parent_path, name) = path
            .split_dirname_filename()
            .ok_or(Error::InvalidInput("cannot create the root directory"))?;
        let parent = self.resolve_dir(&parent_path)?;

        let allocation = self.fat.allocate(1, None).ok_or(Error::NoSpace)?;
        let first = allocation.first();
        let now = self.now();

        let result = (|| {
            self.zero_cluster(first)?;

            // The new directory starts with its dot and dotdot anchors.
            let mut dot = RawDirEntry::new(*b".          ", Attributes::DIRECTORY, now);
            dot.set_first_cluster(first.0);
            let mut dotdot = RawDirEntry::new(*b"..         ", Attributes::DIRECTORY, now);
            dotdot.set_first_cluster(self.dotdot_cluster(parent));
            self.write_dir_slot(DirLocation::Chain(first), 0, &raw_to_slot(&dot))?;
            self.write_dir_slot(DirLocation::Chain(first), 1, &raw_to_slot(&dotdot))?;

            let mut raw = RawDirEntry::new(*b"           ", Attributes::DIRECTORY, now);
            raw.set_first_cluster(first.0);
            self.insert_entry(parent, name, raw)?;
            Ok(())
        })();

        match result {
            Ok(()) => self.flush_fat(),
            Err(err) => {
                self.fat.rollback(allocation);
                Err(err)
            }
        }
    }

    fn remove_at(&mut self, path: &FilePath, dir: bool) -> Result<(), Error<D::Error>> {
        let resolved = self.resolve(path)?;
        let Resolved::Entry { parent, entry } = resolved else {
            return Err(Error::InvalidInput("cannot remove the root directory"));
        };

        if dir {
            let loc = self.entry_dir_location(&entry)?;
            let children = self.scan_dir(loc)?;
            let occupied = children
                .iter()
                .any(|e| !e.raw.is_dot_entry() && !e.raw.is_volume_label());
            if occupied {
                return Err(Error::DirectoryNotEmpty);
            }
        } else if entry.raw.is_directory() {
            return Err(Error::IsDirectory);
        }

        let first = entry.raw.first_cluster(self.geometry.fat_type);
        if first >= 2 {
            self.fat.free_chain(Cluster(first)).map_err(Error::Corrupt)?;
        }
        self.delete_entry_slots(parent, &entry)?;
        self.flush_fat()
    }

    fn rename_at(&mut self, from: &FilePath, to: &FilePath) -> Result<(), Error<D::Error>> {
        let Resolved::Entry {
            parent: src_parent,
            entry: src,
        } = self.resolve(from)?
        else {
            return Err(Error::InvalidInput("cannot rename the root directory"));
        };

        let (to_parent_path, to_name) = to
            .split_dirname_filename()
            .ok_or(Error::InvalidInput("cannot rename onto the root directory"))?;
        validate_name(to_name).map_err(Error::InvalidInput)?;
        let dst_parent = self.resolve_dir(&to_parent_path)?;

        // The destination must be free, except that an entry may be renamed
        // onto itself to change case.
        let dst_entries = self.scan_dir(dst_parent)?;
        for entry in &dst_entries {
            if entry.raw.is_volume_label() || entry.raw.is_dot_entry() {
                continue;
            }
            let is_self = dst_parent == src_parent && entry.slots == src.slots;
            if !is_self && entry.matches(to_name, self.options.encoding) {
                return Err(Error::AlreadyExists);
            }
        }

        // Capture the source slots so a failed insert can put them back.
        let src_buf = self.read_dir_buffer(src_parent)?;
        let saved: Vec<(usize, [u8; DIR_ENTRY_SIZE])> = src
            .slots
            .clone()
            .map(|slot| {
                let bytes: [u8; DIR_ENTRY_SIZE] = src_buf
                    [slot * DIR_ENTRY_SIZE..(slot + 1) * DIR_ENTRY_SIZE]
                    .try_into()
                    .expect("slot slice is 32 bytes");
                (slot, bytes)
            })
            .collect();

        self.delete_entry_slots(src_parent, &src)?;

        let mut raw = src.raw;
        raw.set_modified(self.now());
        match self.insert_entry(dst_parent, to_name, raw) {
            Ok(_) => {}
            Err(err) => {
                for (slot, bytes) in &saved {
                    self.write_dir_slot(src_parent, *slot, bytes)?;
                }
                return Err(err);
            }
        }

        // A directory moving to a new parent needs its dotdot anchor fixed.
        if raw.is_directory() && dst_parent != src_parent {
            let child = self.entry_dir_location(&src)?;
            let mut children = self.read_dir_buffer(child)?;
            if children.len() >= 2 * DIR_ENTRY_SIZE {
                let slot = &mut children[DIR_ENTRY_SIZE..2 * DIR_ENTRY_SIZE];
                if let Some(mut dotdot) = RawDirEntry::read_from(&*slot) {
                    if dotdot.name == *b"..         " {
                        dotdot.set_first_cluster(self.dotdot_cluster(dst_parent));
                        self.write_dir_slot(child, 1, &raw_to_slot(&dotdot))?;
                    } else {
                        log::warn!("moved directory has no dotdot entry; leaving it");
                    }
                }
            }
        }

        self.flush_fat()
    }

    /// Volume label: the root directory's label entry, with the boot-sector
    /// field as fallback.
    fn volume_label_impl(
        &mut self,
        boot_label: [u8; 11],
    ) -> Result<Option<String>, Error<D::Error>> {
        let root = self.root_location();
        let entries = self.scan_dir(root)?;
        let encoding = self.encoding();
        if let Some(label) = entries.iter().find(|e| e.raw.is_volume_label()) {
            return Ok(Some(decode_label(&label.raw.name, encoding)));
        }
        if boot_label != *b"           " {
            return Ok(Some(decode_label(&boot_label, encoding)));
        }
        Ok(None)
    }

    /// Validate the whole tree by walking it, the eager-load mode. Cycles
    /// cannot recurse: every directory is visited at most once.
    fn load_tree(&mut self) -> Result<(), Error<D::Error>> {
        let mut visited: BTreeSet<u32> = BTreeSet::new();
        let mut queue = vec![self.root_location()];
        while let Some(loc) = queue.pop() {
            for entry in self.scan_dir(loc)? {
                if !entry.raw.is_directory() || entry.raw.is_dot_entry() {
                    continue;
                }
                let cluster = entry.raw.first_cluster(self.geometry.fat_type);
                if cluster >= 2 && cluster <= self.geometry.max_cluster().0 && visited.insert(cluster) {
                    queue.push(DirLocation::Chain(Cluster(cluster)));
                }
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error<D::Error>> {
        if self.options.read_only {
            return Ok(());
        }
        self.fat.set_clean_shutdown(true);
        self.flush_fat()?;
        self.write_fs_info()
    }
}

pub(crate) fn raw_to_slot(raw: &RawDirEntry) -> [u8; DIR_ENTRY_SIZE] {
    let mut bytes = [0u8; DIR_ENTRY_SIZE];
    bytes.copy_from_slice(raw.as_bytes());
    if bytes[0] == ENTRY_DELETED {
        bytes[0] = ENTRY_E5_ESCAPE;
    }
    bytes
}

fn decode_label(bytes: &[u8; 11], encoding: OemEncoding) -> String {
    let mut label: String = bytes.iter().map(|&b| encoding.decode_byte(b)).collect();
    while label.ends_with(' ') {
        label.pop();
    }
    label
}

/// A mounted FAT volume.
///
/// All mutable state sits behind one lock, so file streams created from a
/// shared reference may be used from multiple threads; operations on one
/// handle serialize against each other.
pub struct FileSystem<D: Disk> {
    inner: Mutex<Option<FsCore<D>>>,
    geometry: Geometry,
    boot_label: [u8; 11],
}

impl<D: Disk> FileSystem<D> {
    /// Mount a volume: parse and validate the boot sector, load the FAT,
    /// adopt the FSInfo hints and flip the dirty bit (unless read-only).
    pub fn mount(mut disk: D, options: MountOptions) -> Result<Self, Error<D::Error>> {
        let mut sector = [0u8; BOOT_SECTOR_SIZE];
        disk.read_at(options.offset, &mut sector).map_err(Error::Io)?;
        let boot = BootSector::parse(&sector).map_err(Error::Corrupt)?;
        let geometry = boot.geometry;

        // Load FAT copy #0 and cross-check the mirrors.
        let fat_size = geometry.fat_size_bytes() as usize;
        let mut image = vec![0u8; fat_size];
        disk.read_at(options.offset + geometry.fat_offset_bytes(0), &mut image)
            .map_err(Error::Io)?;
        let mut mirror = vec![0u8; fat_size];
        for copy in 1..geometry.fat_count {
            disk.read_at(options.offset + geometry.fat_offset_bytes(copy), &mut mirror)
                .map_err(Error::Io)?;
            if mirror != image {
                log::warn!("FAT copy {copy} differs from copy 0; using copy 0");
            }
        }

        let mut fat = Fat::from_image(geometry.fat_type, image, geometry.cluster_count);

        // FSInfo is advisory: adopt the next-free hint, keep our own free
        // count when the stored one disagrees.
        if geometry.fat_type == FatType::Fat32 && geometry.fs_info_sector != 0 {
            let mut info_sector = [0u8; BOOT_SECTOR_SIZE];
            let offset = options.offset
                + u64::from(geometry.fs_info_sector) * u64::from(geometry.bytes_per_sector);
            disk.read_at(offset, &mut info_sector).map_err(Error::Io)?;
            let info = FsInfoSector::read_from(&info_sector[..])
                .expect("FsInfoSector is exactly one sector");
            if info.signatures_valid() {
                let stored = info.free_count;
                if stored != FsInfoSector::UNKNOWN && stored != fat.free_count() {
                    log::warn!(
                        "FSInfo free count {stored} disagrees with the FAT ({}); recomputed",
                        fat.free_count()
                    );
                }
                let hint = info.next_free;
                if hint != FsInfoSector::UNKNOWN {
                    fat.set_free_hint(hint);
                }
            } else {
                log::warn!("FSInfo sector has bad signatures; ignoring it");
            }
        }

        let boot_label = boot.volume_label();
        let mut core = FsCore {
            disk,
            geometry,
            fat,
            options,
        };

        if !core.options.read_only {
            if core.fat.clean_shutdown() == Some(false) {
                log::warn!("volume was not unmounted cleanly");
            }
            core.fat.set_clean_shutdown(false);
            core.flush_fat()?;
        }

        if !core.options.lazy_load {
            core.load_tree()?;
        }

        Ok(Self {
            inner: Mutex::new(Some(core)),
            geometry,
            boot_label,
        })
    }

    pub(crate) fn with_core<T>(
        &self,
        f: impl FnOnce(&mut FsCore<D>) -> Result<T, Error<D::Error>>,
    ) -> Result<T, Error<D::Error>> {
        let mut guard = self.inner.lock();
        let core = guard.as_mut().expect("filesystem core taken by unmount");
        f(core)
    }

    pub fn fat_type(&self) -> FatType {
        self.geometry.fat_type
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Free data clusters, from FSInfo accounting on FAT32 and a
    /// process-local count on FAT12/16.
    pub fn free_clusters(&self) -> u32 {
        let guard = self.inner.lock();
        let core = guard.as_ref().expect("filesystem core taken by unmount");
        core.fat.free_count()
    }

    pub fn volume_label(&self) -> Result<Option<String>, Error<D::Error>> {
        let boot_label = self.boot_label;
        self.with_core(|core| core.volume_label_impl(boot_label))
    }

    /// List a directory: every logical entry including the volume label,
    /// excluding the dot anchors.
    pub fn read_dir(&self, path: &str) -> Result<Vec<EntryInfo>, Error<D::Error>> {
        let path = FilePath::parse(path).map_err(Error::InvalidInput)?;
        self.with_core(|core| {
            let loc = core.resolve_dir(&path)?;
            let entries = core.scan_dir(loc)?;
            let fat_type = core.geometry.fat_type;
            let encoding = core.encoding();
            Ok(entries
                .iter()
                .filter(|e| !e.raw.is_dot_entry())
                .map(|e| e.info(fat_type, encoding))
                .collect())
        })
    }

    pub fn stat(&self, path: &str) -> Result<EntryInfo, Error<D::Error>> {
        let path = FilePath::parse(path).map_err(Error::InvalidInput)?;
        self.with_core(|core| match core.resolve(&path)? {
            Resolved::Root => Ok(EntryInfo {
                name: String::new(),
                short_name: ShortName::from_bytes(*b"           "),
                attributes: Attributes::DIRECTORY,
                size: 0,
                first_cluster: (core.geometry.fat_type == FatType::Fat32)
                    .then_some(core.geometry.root_cluster),
                created: DosDateTime::EPOCH,
                modified: DosDateTime::EPOCH,
                accessed: DosDateTime::EPOCH.date,
            }),
            Resolved::Entry { entry, .. } => {
                Ok(entry.info(core.geometry.fat_type, core.encoding()))
            }
        })
    }

    /// Create an empty file. The entry gets a zero size and no cluster; the
    /// first write allocates.
    pub fn create_file(&self, path: &str) -> Result<(), Error<D::Error>> {
        let path = FilePath::parse(path).map_err(Error::InvalidInput)?;
        self.check_writable()?;
        self.with_core(|core| core.create_file_at(&path))
    }

    pub fn create_dir(&self, path: &str) -> Result<(), Error<D::Error>> {
        let path = FilePath::parse(path).map_err(Error::InvalidInput)?;
        self.check_writable()?;
        self.with_core(|core| core.create_dir_at(&path))
    }

    pub fn remove_file(&self, path: &str) -> Result<(), Error<D::Error>> {
        let path = FilePath::parse(path).map_err(Error::InvalidInput)?;
        self.check_writable()?;
        self.with_core(|core| core.remove_at(&path, false))
    }

    /// Remove an empty directory.
    pub fn remove_dir(&self, path: &str) -> Result<(), Error<D::Error>> {
        let path = FilePath::parse(path).map_err(Error::InvalidInput)?;
        self.check_writable()?;
        self.with_core(|core| core.remove_at(&path, true))
    }

    /// Move and/or rename an entry within this filesystem.
    pub fn rename(&self, from: &str, to: &str) -> Result<(), Error<D::Error>> {
        let from = FilePath::parse(from).map_err(Error::InvalidInput)?;
        let to = FilePath::parse(to).map_err(Error::InvalidInput)?;
        self.check_writable()?;
        self.with_core(|core| core.rename_at(&from, &to))
    }

    pub fn open_file(&self, path: &str, options: OpenOptions) -> Result<File<'_, D>, Error<D::Error>> {
        File::open(self, path, options)
    }

    /// Write back any pending FAT and FSInfo state without unmounting.
    pub fn flush(&self) -> Result<(), Error<D::Error>> {
        self.with_core(|core| {
            core.flush_fat()?;
            if !core.options.read_only {
                core.write_fs_info()?;
            }
            Ok(())
        })
    }

    fn check_writable(&self) -> Result<(), Error<D::Error>> {
        let guard = self.inner.lock();
        let core = guard.as_ref().expect("filesystem core taken by unmount");
        if core.options.read_only {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    /// Clean unmount: clears the dirty bit, flushes the FAT and FSInfo and
    /// hands the backing store back.
    pub fn unmount(self) -> Result<D, Error<D::Error>> {
        let mut core = self
            .inner
            .lock()
            .take()
            .expect("filesystem core taken by unmount");
        core.close()?;
        Ok(core.disk)
    }
}

impl<D: Disk> Drop for FileSystem<D> {
    fn drop(&mut self) {
        if let Some(mut core) = self.inner.lock().take() {
            if let Err(err) = core.close() {
                log::error!("error while closing filesystem: {err}");
            }
        }
    }
}
