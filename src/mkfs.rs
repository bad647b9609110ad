//! Filesystem creation: lay down a boot sector, FAT copies, FSInfo and an
//! empty root so that a subsequent mount finds a consistent volume.
//! The layout is bit-compatible with `mkfs.fat`-produced images.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec;
use core::fmt;

use zerocopy::AsBytes;

use crate::boot::{
    BiosParameterBlock, ExtBootRecord, Fat32ExtBootRecord, FatType, FsInfoSector,
    BOOT_SECTOR_SIZE, EXTENDED_BOOT_SIGNATURE,
};
use crate::dirent::{Attributes, RawDirEntry};
use crate::disk::Disk;
use crate::error::Error;
use crate::fat::Fat;
use crate::time::{Clock, EpochClock};

const BYTES_PER_SECTOR: u32 = 512;

pub struct FormatOptions {
    /// Force a FAT variant instead of picking one from the volume size.
    pub fat_type: Option<FatType>,
    /// Volume label, stored both in the boot sector and as a root entry.
    pub label: Option<String>,
    pub oem_name: [u8; 8],
    /// Byte offset of the filesystem inside the backing store.
    pub offset: u64,
    /// Format only this many bytes instead of everything after `offset`.
    pub volume_size: Option<u64>,
    /// Source for the label timestamps and the volume serial.
    pub clock: Box<dyn Clock>,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            fat_type: None,
            label: None,
            oem_name: *b"MSWIN4.1",
            offset: 0,
            volume_size: None,
            clock: Box::new(EpochClock),
        }
    }
}

impl fmt::Debug for FormatOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormatOptions")
            .field("fat_type", &self.fat_type)
            .field("label", &self.label)
            .field("oem_name", &self.oem_name)
            .field("offset", &self.offset)
            .field("volume_size", &self.volume_size)
            .finish_non_exhaustive()
    }
}

/// Pick a FAT variant for a volume of `bytes` when the caller did not.
fn default_fat_type(bytes: u64) -> FatType {
    if bytes <= 4 * 1024 * 1024 {
        FatType::Fat12
    } else if bytes <= 512 * 1024 * 1024 {
        FatType::Fat16
    } else {
        FatType::Fat32
    }
}

/// Cluster size tables from the Microsoft FAT specification, keyed on the
/// total sector count. FAT12 instead picks the smallest power of two that
/// keeps the cluster count in FAT12 range, allowing media up to ~256 MiB
/// with 64 KiB clusters.
fn sectors_per_cluster(fat_type: FatType, total_sectors: u32) -> Result<u32, &'static str> {
    match fat_type {
        FatType::Fat12 => {
            let mut spc = 1u32;
            while total_sectors / spc > 4084 {
                spc *= 2;
                if spc > 128 {
                    return Err("volume too large for FAT12");
                }
            }
            Ok(spc)
        }
        FatType::Fat16 => match total_sectors {
            0..=8400 => Err("volume too small for FAT16"),
            8401..=32680 => Ok(2),
            32681..=262_144 => Ok(4),
            262_145..=524_288 => Ok(8),
            524_289..=1_048_576 => Ok(16),
            1_048_577..=2_097_152 => Ok(32),
            2_097_153..=4_194_304 => Ok(64),
            _ => Err("volume too large for FAT16"),
        },
        FatType::Fat32 => match total_sectors {
            0..=66600 => Err("volume too small for FAT32"),
            66601..=532_480 => Ok(1),
            532_481..=16_777_216 => Ok(8),
            16_777_217..=33_554_432 => Ok(16),
            33_554_433..=67_108_864 => Ok(32),
            _ => Ok(64),
        },
    }
}

struct Layout {
    fat_type: FatType,
    total_sectors: u32,
    sectors_per_cluster: u32,
    reserved_sectors: u32,
    root_dir_entries: u32,
    root_dir_sectors: u32,
    sectors_per_fat: u32,
    cluster_count: u32,
}

impl Layout {
    fn compute(fat_type: FatType, total_sectors: u32) -> Result<Self, &'static str> {
        let sectors_per_cluster = sectors_per_cluster(fat_type, total_sectors)?;
        let (reserved_sectors, root_dir_entries): (u32, u32) = match fat_type {
            FatType::Fat12 => (1, 224),
            FatType::Fat16 => (1, 512),
            FatType::Fat32 => (32, 0),
        };
        let root_dir_sectors = (root_dir_entries * 32).div_ceil(BYTES_PER_SECTOR);

        // The FAT must cover every data cluster plus the two reserved
        // entries, but the clusters available depend on the FAT size.
        // Iterate to the fixed point; it converges in a couple of rounds.
        let mut sectors_per_fat = 1u32;
        let cluster_count = loop {
            let data_start =
                reserved_sectors + 2 * sectors_per_fat + root_dir_sectors;
            if data_start + sectors_per_cluster > total_sectors {
                return Err("volume too small for its metadata");
            }
            let clusters = (total_sectors - data_start) / sectors_per_cluster;
            let entry_bytes = match fat_type {
                FatType::Fat12 => (u64::from(clusters) + 2) * 3 / 2 + 1,
                FatType::Fat16 => (u64::from(clusters) + 2) * 2,
                FatType::Fat32 => (u64::from(clusters) + 2) * 4,
            };
            let needed = entry_bytes.div_ceil(u64::from(BYTES_PER_SECTOR)) as u32;
            if needed <= sectors_per_fat {
                break clusters;
            }
            sectors_per_fat = needed;
        };

        if FatType::classify(cluster_count) != fat_type {
            return Err("volume size unsuitable for the requested FAT type");
        }

        Ok(Self {
            fat_type,
            total_sectors,
            sectors_per_cluster,
            reserved_sectors,
            root_dir_entries,
            root_dir_sectors,
            sectors_per_fat,
            cluster_count,
        })
    }

    fn fat_start_sector(&self) -> u32 {
        self.reserved_sectors
    }

    fn root_dir_start_sector(&self) -> u32 {
        self.reserved_sectors + 2 * self.sectors_per_fat
    }

    fn data_start_sector(&self) -> u32 {
        self.root_dir_start_sector() + self.root_dir_sectors
    }
}

fn pack_label(label: &str) -> [u8; 11] {
    let mut bytes = *b"           ";
    for (i, c) in label.chars().take(11).enumerate() {
        let c = c.to_ascii_uppercase();
        bytes[i] = if c.is_ascii() && c != '/' { c as u8 } else { b'_' };
    }
    bytes
}

/// Write a fresh FAT filesystem onto `disk` at the configured offset.
pub fn format_volume<D: Disk>(
    disk: &mut D,
    options: &FormatOptions,
) -> Result<(), Error<D::Error>> {
    let disk_size = disk.size_bytes().map_err(Error::Io)?;
    if options.offset >= disk_size {
        return Err(Error::InvalidInput("offset beyond the backing store"));
    }
    let available = disk_size - options.offset;
    let volume_bytes = options.volume_size.unwrap_or(available).min(available);

    let total_sectors_wide = volume_bytes / u64::from(BYTES_PER_SECTOR);
    if total_sectors_wide > u64::from(u32::MAX) {
        return Err(Error::InvalidInput("volume larger than 2 TiB"));
    }
    let total_sectors = total_sectors_wide as u32;

    let fat_type = options
        .fat_type
        .unwrap_or_else(|| default_fat_type(volume_bytes));
    let layout = Layout::compute(fat_type, total_sectors).map_err(Error::InvalidInput)?;

    let now = options.clock.now();
    let volume_id = (u32::from(u16::from(now.date)) << 16) | u32::from(u16::from(now.time));
    let boot_label = options
        .label
        .as_deref()
        .map_or(*b"NO NAME    ", pack_label);

    // --- Boot sector ---
    let use_small_total = total_sectors < 0x10000 && fat_type != FatType::Fat32;
    let bpb = BiosParameterBlock {
        jmp_boot: match fat_type {
            FatType::Fat12 | FatType::Fat16 => [0xEB, 0x3C, 0x90],
            FatType::Fat32 => [0xEB, 0x58, 0x90],
        },
        oem_name: options.oem_name,
        bytes_per_sector: BYTES_PER_SECTOR as u16,
        sectors_per_cluster: layout.sectors_per_cluster as u8,
        reserved_sectors: layout.reserved_sectors as u16,
        fat_count: 2,
        root_dir_entries: layout.root_dir_entries as u16,
        total_sectors: if use_small_total { total_sectors as u16 } else { 0 },
        media_descriptor: 0xF8,
        sectors_per_fat: if fat_type == FatType::Fat32 {
            0
        } else {
            layout.sectors_per_fat as u16
        },
        sectors_per_track: 63,
        head_count: 255,
        hidden_sectors: (options.offset / u64::from(BYTES_PER_SECTOR)) as u32,
        total_sectors_large: if use_small_total { 0 } else { total_sectors },
    };

    let mut sector = [0u8; BOOT_SECTOR_SIZE];
    sector[..36].copy_from_slice(bpb.as_bytes());
    match fat_type {
        FatType::Fat12 | FatType::Fat16 => {
            let ext = ExtBootRecord {
                drive_number: 0x80,
                reserved: 0,
                boot_signature: EXTENDED_BOOT_SIGNATURE,
                volume_id,
                volume_label: boot_label,
                fs_type_label: fat_type.fs_type_label(),
            };
            sector[36..62].copy_from_slice(ext.as_bytes());
        }
        FatType::Fat32 => {
            let ext = Fat32ExtBootRecord {
                sectors_per_fat: layout.sectors_per_fat,
                ext_flags: 0,
                fs_version: 0,
                root_cluster: 2,
                fs_info_sector: 1,
                backup_boot_sector: 6,
                reserved: [0; 12],
                drive_number: 0x80,
                reserved1: 0,
                boot_signature: EXTENDED_BOOT_SIGNATURE,
                volume_id,
                volume_label: boot_label,
                fs_type_label: fat_type.fs_type_label(),
            };
            sector[36..90].copy_from_slice(ext.as_bytes());
        }
    }
    sector[510] = 0x55;
    sector[511] = 0xAA;

    let mut write_sectors = |disk: &mut D, sector_index: u32, data: &[u8]| {
        let offset =
            options.offset + u64::from(sector_index) * u64::from(BYTES_PER_SECTOR);
        disk.write_at(offset, data).map_err(Error::Io)
    };

    write_sectors(disk, 0, &sector)?;

    // --- FAT copies ---
    // Entry 0 carries the media descriptor in its low byte with every other
    // bit set; entry 1 is the end marker with the clean-shutdown bit set.
    let fat_bytes = layout.sectors_per_fat as usize * BYTES_PER_SECTOR as usize;
    let mut fat = Fat::from_image(fat_type, vec![0u8; fat_bytes], layout.cluster_count);
    fat.set(0, (fat_type.end_of_chain() & !0xFF) | 0xF8);
    fat.set(1, fat_type.end_of_chain());
    if fat_type == FatType::Fat32 {
        // The root directory occupies cluster 2 from the start.
        fat.set(2, fat_type.end_of_chain());
    }
    let image = fat.image().to_vec();
    for copy in 0..2u32 {
        write_sectors(
            disk,
            layout.fat_start_sector() + copy * layout.sectors_per_fat,
            &image,
        )?;
    }

    // --- FSInfo and backup boot region (FAT32) ---
    if fat_type == FatType::Fat32 {
        let free = layout.cluster_count - 1;
        let info = FsInfoSector::new_with(free, 3);
        write_sectors(disk, 1, info.as_bytes())?;
        write_sectors(disk, 6, &sector)?;
        write_sectors(disk, 7, info.as_bytes())?;
    }

    // --- Root directory ---
    let zero_sector = [0u8; BOOT_SECTOR_SIZE];
    match fat_type {
        FatType::Fat12 | FatType::Fat16 => {
            for i in 0..layout.root_dir_sectors {
                write_sectors(disk, layout.root_dir_start_sector() + i, &zero_sector)?;
            }
        }
        FatType::Fat32 => {
            for i in 0..layout.sectors_per_cluster {
                write_sectors(disk, layout.data_start_sector() + i, &zero_sector)?;
            }
        }
    }

    // --- Volume label entry ---
    if let Some(label) = &options.label {
        let entry = RawDirEntry::new(pack_label(label), Attributes::VOLUME_ID, now);
        let root_offset = options.offset
            + u64::from(match fat_type {
                FatType::Fat12 | FatType::Fat16 => layout.root_dir_start_sector(),
                FatType::Fat32 => layout.data_start_sector(),
            }) * u64::from(BYTES_PER_SECTOR);
        disk.write_at(root_offset, entry.as_bytes()).map_err(Error::Io)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::boot::BootSector;
    use crate::disk::RamDisk;
    use crate::fat::Cluster;

    const MIB: usize = 1024 * 1024;

    fn format_and_parse(size: usize, options: &FormatOptions) -> (RamDisk, BootSector) {
        let mut disk = RamDisk::new(size);
        format_volume(&mut disk, options).unwrap();
        let mut sector = [0u8; BOOT_SECTOR_SIZE];
        use crate::disk::Disk;
        disk.read_at(options.offset, &mut sector).unwrap();
        let boot = BootSector::parse(&sector).unwrap();
        (disk, boot)
    }

    #[test]
    fn formats_fat12_by_size() {
        let (_, boot) = format_and_parse(2 * MIB, &FormatOptions::default());
        assert_eq!(boot.geometry.fat_type, FatType::Fat12);
        assert_eq!(boot.geometry.bytes_per_sector, 512);
        assert!(boot.geometry.cluster_count < 4085);
    }

    #[test]
    fn formats_fat16_by_size() {
        let (_, boot) = format_and_parse(16 * MIB, &FormatOptions::default());
        assert_eq!(boot.geometry.fat_type, FatType::Fat16);
        assert!(boot.geometry.cluster_count >= 4085);
        assert!(boot.geometry.cluster_count < 65525);
    }

    #[test]
    fn formats_fat32_when_forced() {
        let options = FormatOptions {
            fat_type: Some(FatType::Fat32),
            ..FormatOptions::default()
        };
        let (disk, boot) = format_and_parse(64 * MIB, &options);
        assert_eq!(boot.geometry.fat_type, FatType::Fat32);
        assert!(boot.geometry.cluster_count >= 65525);
        assert_eq!(boot.geometry.root_cluster, Cluster(2));

        // The backup boot sector is a byte-for-byte copy.
        let data = disk.as_bytes();
        assert_eq!(&data[..512], &data[6 * 512..7 * 512]);
        // FSInfo carries the expected free count.
        let info = &data[512..1024];
        assert_eq!(&info[0..4], &0x4161_5252u32.to_le_bytes());
        assert_eq!(&info[508..512], &0xAA55_0000u32.to_le_bytes());
    }

    #[test]
    fn fat_covers_every_cluster() {
        for (size, forced, fat_type) in [
            (2 * MIB, None, FatType::Fat12),
            (16 * MIB, None, FatType::Fat16),
            (64 * MIB, Some(FatType::Fat32), FatType::Fat32),
        ] {
            let options = FormatOptions {
                fat_type: forced,
                ..FormatOptions::default()
            };
            let (_, boot) = format_and_parse(size, &options);
            assert_eq!(boot.geometry.fat_type, fat_type);
            let entries = u64::from(boot.geometry.cluster_count) + 2;
            let entry_bits = match fat_type {
                FatType::Fat12 => 12,
                FatType::Fat16 => 16,
                FatType::Fat32 => 32,
            };
            let fat_bits = boot.geometry.fat_size_bytes() * 8;
            assert!(fat_bits >= entries * entry_bits);
        }
    }

    #[test]
    fn respects_partition_offset() {
        let options = FormatOptions {
            offset: 1024 * 1024,
            label: Some(String::from("PARTED")),
            ..FormatOptions::default()
        };
        let (disk, boot) = format_and_parse(8 * MIB, &options);
        assert_eq!(boot.geometry.fat_type, FatType::Fat16);
        // Nothing before the offset was touched.
        assert!(disk.as_bytes()[..MIB].iter().all(|&b| b == 0));
    }

    #[test]
    fn forced_type_on_wrong_size_is_rejected() {
        let mut disk = RamDisk::new(2 * MIB);
        let options = FormatOptions {
            fat_type: Some(FatType::Fat16),
            ..FormatOptions::default()
        };
        assert!(matches!(
            format_volume(&mut disk, &options),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn cluster_size_tables() {
        assert_eq!(sectors_per_cluster(FatType::Fat12, 4096), Ok(1));
        // A 256 MiB FAT12 volume needs 64 KiB clusters.
        assert_eq!(sectors_per_cluster(FatType::Fat12, 510_000), Ok(128));
        assert!(sectors_per_cluster(FatType::Fat12, 600_000).is_err());

        assert!(sectors_per_cluster(FatType::Fat16, 8000).is_err());
        assert_eq!(sectors_per_cluster(FatType::Fat16, 32768), Ok(4));
        assert_eq!(sectors_per_cluster(FatType::Fat16, 1_000_000), Ok(16));

        assert!(sectors_per_cluster(FatType::Fat32, 60000).is_err());
        assert_eq!(sectors_per_cluster(FatType::Fat32, 131_072), Ok(1));
        assert_eq!(sectors_per_cluster(FatType::Fat32, 70_000_000), Ok(64));
    }
}
