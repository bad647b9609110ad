//! Boot sector parsing: the BIOS parameter block, the FAT12/16 and FAT32
//! extended boot records, the FSInfo sector, and the geometry derived from
//! them at mount time.

use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::fat::Cluster;

/// Every FAT boot sector and the FSInfo sector are laid out within the first
/// 512 bytes of their sector regardless of the real sector size.
pub(crate) const BOOT_SECTOR_SIZE: usize = 512;

pub(crate) const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];

/// Value of `boot_signature` announcing that the volume id/label/type fields
/// of the extended boot record are populated. Absence is tolerated; the
/// fields just read as zero/blank.
pub(crate) const EXTENDED_BOOT_SIGNATURE: u8 = 0x29;

/// The BIOS parameter block is the first part of the boot sector, common to
/// all three FAT variants.
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes)]
#[repr(C, packed)]
pub(crate) struct BiosParameterBlock {
    pub(crate) jmp_boot: [u8; 3],
    pub(crate) oem_name: [u8; 8],
    pub(crate) bytes_per_sector: u16,
    pub(crate) sectors_per_cluster: u8,
    pub(crate) reserved_sectors: u16,
    pub(crate) fat_count: u8,
    pub(crate) root_dir_entries: u16,
    pub(crate) total_sectors: u16,
    pub(crate) media_descriptor: u8,
    pub(crate) sectors_per_fat: u16,
    pub(crate) sectors_per_track: u16,
    pub(crate) head_count: u16,
    pub(crate) hidden_sectors: u32,
    pub(crate) total_sectors_large: u32,
}

/// Tail of the boot sector on FAT12/16 volumes, at offset 36.
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes)]
#[repr(C, packed)]
pub(crate) struct ExtBootRecord {
    pub(crate) drive_number: u8,
    pub(crate) reserved: u8,
    pub(crate) boot_signature: u8,
    pub(crate) volume_id: u32,
    pub(crate) volume_label: [u8; 11],
    pub(crate) fs_type_label: [u8; 8],
}

/// Tail of the boot sector on FAT32 volumes, at offset 36.
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes)]
#[repr(C, packed)]
pub(crate) struct Fat32ExtBootRecord {
    pub(crate) sectors_per_fat: u32,
    pub(crate) ext_flags: u16,
    pub(crate) fs_version: u16,
    pub(crate) root_cluster: u32,
    pub(crate) fs_info_sector: u16,
    pub(crate) backup_boot_sector: u16,
    pub(crate) reserved: [u8; 12],
    pub(crate) drive_number: u8,
    pub(crate) reserved1: u8,
    pub(crate) boot_signature: u8,
    pub(crate) volume_id: u32,
    pub(crate) volume_label: [u8; 11],
    pub(crate) fs_type_label: [u8; 8],
}

/// FAT32-only sector carrying the advisory free-cluster count and next-free
/// hint. Both fields may lie; the driver validates them against the FAT on
/// mount and recomputes on a mismatch.
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes)]
#[repr(C, packed)]
pub(crate) struct FsInfoSector {
    pub(crate) lead_signature: u32,
    pub(crate) reserved: [u8; 480],
    pub(crate) struct_signature: u32,
    pub(crate) free_count: u32,
    pub(crate) next_free: u32,
    pub(crate) reserved1: [u8; 12],
    pub(crate) trail_signature: u32,
}

impl FsInfoSector {
    pub(crate) const LEAD_SIGNATURE: u32 = 0x4161_5252;
    pub(crate) const STRUCT_SIGNATURE: u32 = 0x6141_7272;
    pub(crate) const TRAIL_SIGNATURE: u32 = 0xAA55_0000;

    /// Either field may be set to this to mean "unknown".
    pub(crate) const UNKNOWN: u32 = 0xFFFF_FFFF;

    pub(crate) fn signatures_valid(&self) -> bool {
        let lead = self.lead_signature;
        let mid = self.struct_signature;
        let trail = self.trail_signature;
        lead == Self::LEAD_SIGNATURE && mid == Self::STRUCT_SIGNATURE && trail == Self::TRAIL_SIGNATURE
    }

    pub(crate) fn new_with(free_count: u32, next_free: u32) -> Self {
        let mut info = Self::new_zeroed();
        info.lead_signature = Self::LEAD_SIGNATURE;
        info.struct_signature = Self::STRUCT_SIGNATURE;
        info.trail_signature = Self::TRAIL_SIGNATURE;
        info.free_count = free_count;
        info.next_free = next_free;
        info
    }
}

/// The three on-disk FAT variants. Classification is by data cluster count,
/// never by the `fs_type_label` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatType {
    Fat12,
    Fat16,
    Fat32,
}

impl FatType {
    /// Microsoft's classification rule over the count of data clusters.
    pub fn classify(cluster_count: u32) -> Self {
        if cluster_count < 4085 {
            Self::Fat12
        } else if cluster_count < 65525 {
            Self::Fat16
        } else {
            Self::Fat32
        }
    }

    /// Largest entry value that is a pointer to another data cluster.
    pub(crate) fn max_data_value(self) -> u32 {
        match self {
            Self::Fat12 => 0xFEF,
            Self::Fat16 => 0xFFEF,
            Self::Fat32 => 0x0FFF_FFEF,
        }
    }

    pub(crate) fn bad_value(self) -> u32 {
        match self {
            Self::Fat12 => 0xFF7,
            Self::Fat16 => 0xFFF7,
            Self::Fat32 => 0x0FFF_FFF7,
        }
    }

    pub(crate) fn end_of_chain_min(self) -> u32 {
        match self {
            Self::Fat12 => 0xFF8,
            Self::Fat16 => 0xFFF8,
            Self::Fat32 => 0x0FFF_FFF8,
        }
    }

    /// The canonical end-of-chain marker written by this driver.
    pub(crate) fn end_of_chain(self) -> u32 {
        match self {
            Self::Fat12 => 0xFFF,
            Self::Fat16 => 0xFFFF,
            Self::Fat32 => 0x0FFF_FFFF,
        }
    }

    /// Mask of the clean-shutdown bit within FAT entry 1, where the variant
    /// has one. FAT12 volumes carry no dirty flag on disk.
    pub(crate) fn clean_shutdown_mask(self) -> Option<u32> {
        match self {
            Self::Fat12 => None,
            Self::Fat16 => Some(0x8000),
            Self::Fat32 => Some(0x0800_0000),
        }
    }

    pub(crate) fn fs_type_label(self) -> [u8; 8] {
        match self {
            Self::Fat12 => *b"FAT12   ",
            Self::Fat16 => *b"FAT16   ",
            Self::Fat32 => *b"FAT32   ",
        }
    }
}

impl core::fmt::Display for FatType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Fat12 => write!(f, "FAT12"),
            Self::Fat16 => write!(f, "FAT16"),
            Self::Fat32 => write!(f, "FAT32"),
        }
    }
}

/// Volume geometry, derived once from the boot sector at mount and immutable
/// for the life of the handle.
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    pub fat_type: FatType,
    pub bytes_per_sector: u32,
    pub sectors_per_cluster: u32,
    pub bytes_per_cluster: u32,
    pub reserved_sectors: u32,
    pub fat_count: u8,
    pub sectors_per_fat: u32,
    pub root_dir_entries: u32,
    pub root_dir_sectors: u32,
    /// First sector of the fixed root directory region (FAT12/16 only).
    pub root_dir_start_sector: u32,
    pub data_start_sector: u32,
    pub total_sectors: u32,
    /// Count of data clusters; cluster numbering covers `2..cluster_count + 2`.
    pub cluster_count: u32,
    /// First cluster of the root directory (FAT32 only, zero otherwise).
    pub root_cluster: Cluster,
    /// Sector holding the FSInfo structure (FAT32 only, zero otherwise).
    pub fs_info_sector: u16,
}

impl Geometry {
    pub(crate) fn fat_offset_bytes(&self, copy: u8) -> u64 {
        u64::from(self.reserved_sectors) * u64::from(self.bytes_per_sector)
            + u64::from(copy) * self.fat_size_bytes()
    }

    pub(crate) fn fat_size_bytes(&self) -> u64 {
        u64::from(self.sectors_per_fat) * u64::from(self.bytes_per_sector)
    }

    pub(crate) fn root_dir_offset_bytes(&self) -> u64 {
        u64::from(self.root_dir_start_sector) * u64::from(self.bytes_per_sector)
    }

    pub(crate) fn root_dir_size_bytes(&self) -> u64 {
        u64::from(self.root_dir_sectors) * u64::from(self.bytes_per_sector)
    }

    /// Absolute byte position of a data cluster. The first two FAT entries
    /// are reserved, so cluster 2 sits right at the start of the data region.
    pub(crate) fn cluster_offset_bytes(&self, cluster: Cluster) -> u64 {
        let sector = u64::from(cluster.0 - 2) * u64::from(self.sectors_per_cluster)
            + u64::from(self.data_start_sector);
        sector * u64::from(self.bytes_per_sector)
    }

    /// Highest valid data cluster number.
    pub(crate) fn max_cluster(&self) -> Cluster {
        Cluster(self.cluster_count + 1)
    }
}

/// Parsed boot sector: the raw headers plus the geometry derived from them.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BootSector {
    pub(crate) bpb: BiosParameterBlock,
    pub(crate) ext: ExtRecord,
    pub(crate) geometry: Geometry,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum ExtRecord {
    Fat12or16(ExtBootRecord),
    Fat32(Fat32ExtBootRecord),
}

impl BootSector {
    /// Parse and validate the first sector of a volume.
    pub(crate) fn parse(sector: &[u8]) -> Result<Self, &'static str> {
        if sector.len() < BOOT_SECTOR_SIZE {
            return Err("boot sector shorter than 512 bytes");
        }
        if sector[510..512] != BOOT_SIGNATURE {
            return Err("missing 0x55AA boot signature");
        }

        let bpb = BiosParameterBlock::read_from_prefix(sector)
            .ok_or("boot sector too short for BPB")?;
        verify_bpb(&bpb)?;

        // The FAT size and total sector count each have a 16-bit field and a
        // larger fallback used when the small one is zero.
        let sectors_per_fat_16 = bpb.sectors_per_fat;
        let fat32_ext = Fat32ExtBootRecord::read_from_prefix(&sector[36..])
            .ok_or("boot sector too short for extended boot record")?;
        let sectors_per_fat = if sectors_per_fat_16 != 0 {
            u32::from(sectors_per_fat_16)
        } else {
            let large = fat32_ext.sectors_per_fat;
            if large == 0 {
                return Err("FAT size is zero in both the 16-bit and 32-bit fields");
            }
            large
        };
        let total_sectors = if bpb.total_sectors != 0 {
            u32::from(bpb.total_sectors)
        } else {
            bpb.total_sectors_large
        };

        let bytes_per_sector = u32::from(bpb.bytes_per_sector);
        let root_dir_entries = u32::from(bpb.root_dir_entries);
        let root_dir_sectors = (root_dir_entries * 32).div_ceil(bytes_per_sector);
        let reserved_sectors = u32::from(bpb.reserved_sectors);
        let fat_sectors = u32::from(bpb.fat_count) * sectors_per_fat;
        let root_dir_start_sector = reserved_sectors + fat_sectors;
        let data_start_sector = root_dir_start_sector + root_dir_sectors;
        if total_sectors <= data_start_sector {
            return Err("total sector count smaller than the metadata regions");
        }
        let cluster_count =
            (total_sectors - data_start_sector) / u32::from(bpb.sectors_per_cluster);

        let fat_type = classify_lenient(cluster_count, sectors_per_fat_16, &fat32_ext);

        let (ext, root_cluster, fs_info_sector) = match fat_type {
            FatType::Fat12 | FatType::Fat16 => {
                if root_dir_entries == 0 {
                    return Err("FAT12/16 volume with an empty root directory region");
                }
                let ext = ExtBootRecord::read_from_prefix(&sector[36..])
                    .ok_or("boot sector too short for extended boot record")?;
                (ExtRecord::Fat12or16(ext), Cluster(0), 0)
            }
            FatType::Fat32 => {
                if sectors_per_fat_16 != 0 {
                    return Err("FAT32 volume with a non-zero 16-bit FAT size");
                }
                if root_dir_entries != 0 {
                    return Err("FAT32 volume with a non-zero root entry count");
                }
                let root_cluster = fat32_ext.root_cluster;
                if root_cluster < 2 || root_cluster >= cluster_count + 2 {
                    return Err("FAT32 root cluster outside the data region");
                }
                let fs_info = fat32_ext.fs_info_sector;
                (ExtRecord::Fat32(fat32_ext), Cluster(root_cluster), fs_info)
            }
        };

        let geometry = Geometry {
            fat_type,
            bytes_per_sector,
            sectors_per_cluster: u32::from(bpb.sectors_per_cluster),
            bytes_per_cluster: bytes_per_sector * u32::from(bpb.sectors_per_cluster),
            reserved_sectors,
            fat_count: bpb.fat_count,
            sectors_per_fat,
            root_dir_entries,
            root_dir_sectors,
            root_dir_start_sector,
            data_start_sector,
            total_sectors,
            cluster_count,
            root_cluster,
            fs_info_sector,
        };

        Ok(Self { bpb, ext, geometry })
    }

    /// The volume label from the extended boot record, or blank when the
    /// 0x29 extended signature is absent.
    pub(crate) fn volume_label(&self) -> [u8; 11] {
        match &self.ext {
            ExtRecord::Fat12or16(ext) if ext.boot_signature == EXTENDED_BOOT_SIGNATURE => {
                ext.volume_label
            }
            ExtRecord::Fat32(ext) if ext.boot_signature == EXTENDED_BOOT_SIGNATURE => {
                ext.volume_label
            }
            _ => *b"           ",
        }
    }
}

fn verify_bpb(bpb: &BiosParameterBlock) -> Result<(), &'static str> {
    match bpb.jmp_boot[0] {
        0xEB => {
            if bpb.jmp_boot[2] != 0x90 {
                return Err("short jump in boot code must end with 0x90");
            }
        }
        0xE9 => {}
        _ => return Err("boot code must start with 0xEB or 0xE9"),
    }

    let bytes_per_sector = bpb.bytes_per_sector;
    if !matches!(bytes_per_sector, 512 | 1024 | 2048 | 4096) {
        return Err("bytes per sector must be 512, 1024, 2048 or 4096");
    }
    let sectors_per_cluster = bpb.sectors_per_cluster;
    if !sectors_per_cluster.is_power_of_two() {
        return Err("sectors per cluster must be a power of two in 1..=128");
    }
    let bytes_per_cluster = u32::from(bytes_per_sector) * u32::from(sectors_per_cluster);
    if bytes_per_cluster > 32 * 1024 {
        log::warn!("bytes per cluster is {bytes_per_cluster}, above the 32 KiB convention");
    }
    if bpb.reserved_sectors == 0 {
        return Err("reserved sector count must not be zero");
    }
    if bpb.fat_count == 0 {
        return Err("at least one FAT expected");
    }
    let media = bpb.media_descriptor;
    if media != 0xF0 && media < 0xF8 {
        return Err("invalid media descriptor");
    }
    let root_bytes = u32::from(bpb.root_dir_entries) * 32;
    if bpb.root_dir_entries != 0 && root_bytes % u32::from(bytes_per_sector) != 0 {
        return Err("root entry count does not align with bytes per sector");
    }
    let total_16 = bpb.total_sectors;
    let total_32 = bpb.total_sectors_large;
    if total_16 == 0 && total_32 == 0 {
        return Err("both total sector counts are zero");
    }
    Ok(())
}

/// The strict Microsoft rule classifies purely by cluster count, but images
/// formatted by other tools are sometimes slightly off. Trust an explicit
/// FAT32 extended record when the 16-bit FAT size is zero and warn when the
/// two rules disagree.
fn classify_lenient(
    cluster_count: u32,
    sectors_per_fat_16: u16,
    fat32_ext: &Fat32ExtBootRecord,
) -> FatType {
    let strict = FatType::classify(cluster_count);
    let lenient = if sectors_per_fat_16 == 0 {
        let large = fat32_ext.sectors_per_fat;
        if large != 0 {
            FatType::Fat32
        } else {
            strict
        }
    } else if cluster_count >= 4085 {
        FatType::Fat16
    } else {
        FatType::Fat12
    };

    if strict != lenient {
        log::warn!(
            "ambiguous FAT type: cluster count {cluster_count} suggests {strict}, \
             header layout suggests {lenient}; using {lenient}"
        );
    }
    lenient
}
