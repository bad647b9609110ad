//! Directory entries: the 32-byte on-disk records, 8.3 short names, VFAT
//! long-name records and the checksum binding the two together.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use bitflags::bitflags;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::boot::FatType;
use crate::fat::Cluster;
use crate::time::{DosDate, DosDateTime, DosTime};

pub(crate) const DIR_ENTRY_SIZE: usize = 32;

/// First name byte marking a slot that has never been used; scanning may
/// stop here.
pub(crate) const ENTRY_END: u8 = 0x00;
/// First name byte marking a deleted slot.
pub(crate) const ENTRY_DELETED: u8 = 0xE5;
/// Escape for a real first name byte of 0xE5.
pub(crate) const ENTRY_E5_ESCAPE: u8 = 0x05;

/// Longest long file name, in UCS-2 units.
pub(crate) const MAX_NAME_LEN: usize = 255;

/// UCS-2 units per LFN record.
pub(crate) const LFN_UNITS_PER_ENTRY: usize = 13;

/// Flag on the sequence number of the first physical (= last logical) LFN
/// record of a chain.
pub(crate) const LFN_LAST_ENTRY: u8 = 0x40;

/// NT reserved-byte flag: the 8.3 base name is stored lower-case.
pub(crate) const CASE_LOWER_BASE: u8 = 0x08;
/// NT reserved-byte flag: the 8.3 extension is stored lower-case.
pub(crate) const CASE_LOWER_EXT: u8 = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromZeroes, FromBytes, AsBytes)]
#[repr(transparent)]
pub struct Attributes(u8);

bitflags! {
    impl Attributes: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN = 0x02;
        const SYSTEM = 0x04;
        const VOLUME_ID = 0x08;
        const DIRECTORY = 0x10;
        const ARCHIVE = 0x20;

        /// The four low bits together mark a long-name record.
        const LONG_NAME = 0x0F;
    }
}

impl Attributes {
    const LONG_NAME_MASK: u8 = 0x3F;

    pub(crate) fn is_long_name(self) -> bool {
        self.0 & Self::LONG_NAME_MASK == Self::LONG_NAME.0
    }
}

/// The 32-byte short directory entry shared by files, directories and the
/// volume label.
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes)]
#[repr(C, packed)]
pub(crate) struct RawDirEntry {
    pub(crate) name: [u8; 11],
    pub(crate) attributes: Attributes,
    pub(crate) nt_reserved: u8,
    pub(crate) created_tenths: u8,
    pub(crate) created_time: u16,
    pub(crate) created_date: u16,
    pub(crate) accessed_date: u16,
    pub(crate) first_cluster_high: u16,
    pub(crate) modified_time: u16,
    pub(crate) modified_date: u16,
    pub(crate) first_cluster_low: u16,
    pub(crate) size: u32,
}

impl RawDirEntry {
    pub(crate) fn new(name: [u8; 11], attributes: Attributes, now: DosDateTime) -> Self {
        let mut entry = Self::new_zeroed();
        entry.name = name;
        entry.attributes = attributes;
        entry.set_created(now);
        entry.set_modified(now);
        entry.set_accessed(now.date);
        entry
    }

    /// First cluster of the entry's data. The high half is only meaningful
    /// on FAT32; FAT12/16 entries are supposed to keep it zero and some
    /// tools scribble into it, so it is ignored there.
    pub(crate) fn first_cluster(&self, fat_type: FatType) -> u32 {
        let low = u32::from(self.first_cluster_low);
        match fat_type {
            FatType::Fat12 | FatType::Fat16 => low,
            FatType::Fat32 => (u32::from(self.first_cluster_high) << 16) | low,
        }
    }

    pub(crate) fn set_first_cluster(&mut self, cluster: u32) {
        self.first_cluster_low = (cluster & 0xFFFF) as u16;
        self.first_cluster_high = (cluster >> 16) as u16;
    }

    pub(crate) fn created(&self) -> DosDateTime {
        DosDateTime::new(
            DosDate::from(self.created_date),
            DosTime::from(self.created_time),
            self.created_tenths,
        )
    }

    pub(crate) fn modified(&self) -> DosDateTime {
        DosDateTime::new(
            DosDate::from(self.modified_date),
            DosTime::from(self.modified_time),
            0,
        )
    }

    pub(crate) fn accessed(&self) -> DosDate {
        DosDate::from(self.accessed_date)
    }

    pub(crate) fn set_created(&mut self, at: DosDateTime) {
        self.created_date = u16::from(at.date);
        self.created_time = u16::from(at.time);
        self.created_tenths = at.tenths;
    }

    pub(crate) fn set_modified(&mut self, at: DosDateTime) {
        self.modified_date = u16::from(at.date);
        self.modified_time = u16::from(at.time);
    }

    pub(crate) fn set_accessed(&mut self, on: DosDate) {
        self.accessed_date = u16::from(on);
    }

    pub(crate) fn is_directory(&self) -> bool {
        self.attributes.contains(Attributes::DIRECTORY)
    }

    pub(crate) fn is_volume_label(&self) -> bool {
        self.attributes.contains(Attributes::VOLUME_ID) && !self.attributes.is_long_name()
    }

    /// Dot and dotdot entries anchor a directory to itself and its parent.
    pub(crate) fn is_dot_entry(&self) -> bool {
        self.name == *b".          " || self.name == *b"..         "
    }
}

/// One 32-byte VFAT long-name record carrying 13 UCS-2 units.
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes)]
#[repr(C, packed)]
pub(crate) struct RawLfnEntry {
    pub(crate) sequence: u8,
    pub(crate) name1: [u8; 10],
    pub(crate) attributes: Attributes,
    pub(crate) entry_type: u8,
    pub(crate) checksum: u8,
    pub(crate) name2: [u8; 12],
    pub(crate) first_cluster_low: u16,
    pub(crate) name3: [u8; 4],
}

impl RawLfnEntry {
    /// Position of this record within its chain, 1-based.
    pub(crate) fn ordinal(&self) -> u8 {
        self.sequence & 0x1F
    }

    pub(crate) fn is_last(&self) -> bool {
        self.sequence & LFN_LAST_ENTRY != 0
    }

    pub(crate) fn units(&self) -> [u16; LFN_UNITS_PER_ENTRY] {
        let mut units = [0u16; LFN_UNITS_PER_ENTRY];
        let bytes = self
            .name1
            .iter()
            .chain(self.name2.iter())
            .chain(self.name3.iter());
        let mut lo = 0u8;
        for (i, &b) in bytes.enumerate() {
            if i % 2 == 0 {
                lo = b;
            } else {
                units[i / 2] = u16::from_le_bytes([lo, b]);
            }
        }
        units
    }

    pub(crate) fn set_units(&mut self, units: &[u16; LFN_UNITS_PER_ENTRY]) {
        let mut bytes = [0u8; LFN_UNITS_PER_ENTRY * 2];
        for (i, unit) in units.iter().enumerate() {
            bytes[i * 2..i * 2 + 2].copy_from_slice(&unit.to_le_bytes());
        }
        self.name1.copy_from_slice(&bytes[0..10]);
        self.name2.copy_from_slice(&bytes[10..22]);
        self.name3.copy_from_slice(&bytes[22..26]);
    }
}

/// Checksum over the 11 short-name bytes, stored in every LFN record of the
/// chain: a right rotation folded with each byte.
pub(crate) fn lfn_checksum(short_name: &[u8; 11]) -> u8 {
    short_name
        .iter()
        .fold(0u8, |sum, &b| sum.rotate_right(1).wrapping_add(b))
}

/// Build the LFN chain for `name` in on-disk order, i.e. highest sequence
/// number first. The terminating NUL is always stored; the remaining units
/// of the last logical record are padded with 0xFFFF.
pub(crate) fn encode_lfn(name: &str, checksum: u8) -> Vec<RawLfnEntry> {
    let mut units: Vec<u16> = name.encode_utf16().collect();
    units.push(0);
    let record_count = units.len().div_ceil(LFN_UNITS_PER_ENTRY);
    units.resize(record_count * LFN_UNITS_PER_ENTRY, 0xFFFF);

    let mut records = Vec::with_capacity(record_count);
    for i in (0..record_count).rev() {
        let mut record = RawLfnEntry::new_zeroed();
        record.sequence = (i + 1) as u8;
        if i == record_count - 1 {
            record.sequence |= LFN_LAST_ENTRY;
        }
        record.attributes = Attributes::LONG_NAME;
        record.checksum = checksum;
        let mut chunk = [0u16; LFN_UNITS_PER_ENTRY];
        chunk.copy_from_slice(&units[i * LFN_UNITS_PER_ENTRY..(i + 1) * LFN_UNITS_PER_ENTRY]);
        record.set_units(&chunk);
        records.push(record);
    }
    records
}

/// Decode a complete LFN chain collected in on-disk order. Returns `None`
/// if the chain is inconsistent: wrong ordinals, missing last-entry flag,
/// or records disagreeing about the checksum.
pub(crate) fn decode_lfn(records: &[RawLfnEntry]) -> Option<(String, u8)> {
    let first = records.first()?;
    if !first.is_last() || first.ordinal() as usize != records.len() {
        return None;
    }
    let checksum = first.checksum;
    for (i, record) in records.iter().enumerate() {
        if record.ordinal() as usize != records.len() - i || record.checksum != checksum {
            return None;
        }
    }

    let mut units = Vec::with_capacity(records.len() * LFN_UNITS_PER_ENTRY);
    for record in records.iter().rev() {
        units.extend_from_slice(&record.units());
    }
    while matches!(units.last(), Some(0xFFFF)) {
        units.pop();
    }
    if matches!(units.last(), Some(0)) {
        units.pop();
    }
    if units.len() > MAX_NAME_LEN {
        return None;
    }
    Some((String::from_utf16_lossy(&units), checksum))
}

/// Short-name codec for the 8.3 fields. Long names are always UCS-2 and
/// unaffected by this choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OemEncoding {
    /// Code page 437, the PC hardware default.
    #[default]
    Ibm437,
    /// Strict ASCII; bytes above 0x7F decode to `_`.
    Ascii,
}

/// The upper half of code page 437.
const CP437_HIGH: [char; 128] = [
    'Ç', 'ü', 'é', 'â', 'ä', 'à', 'å', 'ç', 'ê', 'ë', 'è', 'ï', 'î', 'ì', 'Ä', 'Å', //
    'É', 'æ', 'Æ', 'ô', 'ö', 'ò', 'û', 'ù', 'ÿ', 'Ö', 'Ü', '¢', '£', '¥', '₧', 'ƒ', //
    'á', 'í', 'ó', 'ú', 'ñ', 'Ñ', 'ª', 'º', '¿', '⌐', '¬', '½', '¼', '¡', '«', '»', //
    '░', '▒', '▓', '│', '┤', '╡', '╢', '╖', '╕', '╣', '║', '╗', '╝', '╜', '╛', '┐', //
    '└', '┴', '┬', '├', '─', '┼', '╞', '╟', '╚', '╔', '╩', '╦', '╠', '═', '╬', '╧', //
    '╨', '╤', '╥', '╙', '╘', '╒', '╓', '╫', '╪', '┘', '┌', '█', '▄', '▌', '▐', '▀', //
    'α', 'ß', 'Γ', 'π', 'Σ', 'σ', 'µ', 'τ', 'Φ', 'Θ', 'Ω', 'δ', '∞', 'φ', 'ε', '∩', //
    '≡', '±', '≥', '≤', '⌠', '⌡', '÷', '≈', '°', '∙', '·', '√', 'ⁿ', '²', '■', '\u{a0}',
];

impl OemEncoding {
    pub(crate) fn decode_byte(self, byte: u8) -> char {
        if byte < 0x80 {
            char::from(byte)
        } else {
            match self {
                Self::Ibm437 => CP437_HIGH[byte as usize - 0x80],
                Self::Ascii => '_',
            }
        }
    }
}

/// An 8.3 short name: 8 space-padded base bytes followed by 3 space-padded
/// extension bytes, upper-case in the OEM encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShortName {
    bytes: [u8; 11],
}

impl ShortName {
    pub(crate) fn from_bytes(bytes: [u8; 11]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; 11] {
        &self.bytes
    }

    pub fn checksum(&self) -> u8 {
        lfn_checksum(&self.bytes)
    }

    /// Human-readable `BASE.EXT` form. The NT reserved-byte case flags
    /// lower individual fields that were stored upper-case on disk.
    pub fn display(&self, encoding: OemEncoding, nt_reserved: u8) -> String {
        let decode = |field: &[u8], lower: bool| -> String {
            let mut s = String::new();
            for &b in field {
                let c = encoding.decode_byte(b);
                if lower {
                    s.extend(c.to_lowercase());
                } else {
                    s.push(c);
                }
            }
            while s.ends_with(' ') {
                s.pop();
            }
            s
        };

        let base = decode(&self.bytes[..8], nt_reserved & CASE_LOWER_BASE != 0);
        let ext = decode(&self.bytes[8..], nt_reserved & CASE_LOWER_EXT != 0);
        if ext.is_empty() {
            base
        } else {
            let mut s = base;
            s.push('.');
            s.push_str(&ext);
            s
        }
    }
}

/// Characters allowed in an 8.3 name besides upper-case letters and digits.
const SFN_SPECIAL_CHARS: &str = "!#$%&'()-@^_`{}~";

fn is_valid_sfn_char(c: char) -> bool {
    c.is_ascii_uppercase() || c.is_ascii_digit() || SFN_SPECIAL_CHARS.contains(c)
}

/// Whether `name` can be stored as a short entry directly: 1-8 base
/// characters, an optional dot plus 1-3 extension characters, everything
/// upper-case and inside the OEM-legal set.
pub(crate) fn is_8dot3_conform(name: &str) -> bool {
    let (base, ext) = match name.rsplit_once('.') {
        Some((base, ext)) => (base, ext),
        None => (name, ""),
    };
    if base.is_empty() || base.len() > 8 || ext.len() > 3 {
        return false;
    }
    if name.contains('.') && ext.is_empty() {
        return false;
    }
    base.chars().all(is_valid_sfn_char) && ext.chars().all(is_valid_sfn_char)
}

/// Pack a conforming `BASE.EXT` name into the 11-byte on-disk form.
pub(crate) fn pack_8dot3(name: &str) -> [u8; 11] {
    let (base, ext) = match name.rsplit_once('.') {
        Some((base, ext)) => (base, ext),
        None => (name, ""),
    };
    let mut bytes = *b"           ";
    for (i, c) in base.bytes().take(8).enumerate() {
        bytes[i] = c;
    }
    for (i, c) in ext.bytes().take(3).enumerate() {
        bytes[8 + i] = c;
    }
    bytes
}

fn map_sfn_char(c: char) -> Option<char> {
    let upper = c.to_ascii_uppercase();
    if upper == ' ' {
        None
    } else if is_valid_sfn_char(upper) {
        Some(upper)
    } else {
        Some('_')
    }
}

/// Derive an 8.3 name for `name`, unique among `taken` (the sibling short
/// names). A name that already conforms is used as-is; anything else is
/// upper-cased, stripped of illegal characters and given a `~N` tail, with
/// N widening from 1 up to 999999 until no sibling collides.
pub(crate) fn make_8dot3(name: &str, taken: &[[u8; 11]]) -> Option<[u8; 11]> {
    let name = name.trim_matches(|c| c == '.' || c == ' ');
    if name.is_empty() {
        return None;
    }

    if is_8dot3_conform(name) {
        let packed = pack_8dot3(name);
        if !taken.contains(&packed) {
            return Some(packed);
        }
    }

    let (raw_base, raw_ext) = match name.rsplit_once('.') {
        Some((base, ext)) => (base, ext),
        None => (name, ""),
    };
    let base: String = raw_base.chars().filter_map(map_sfn_char).take(8).collect();
    let ext: String = raw_ext.chars().filter_map(map_sfn_char).take(3).collect();
    let base = if base.is_empty() { String::from("_") } else { base };

    for n in 1..=999_999u32 {
        let tail = format!("~{n}");
        let keep = 8 - tail.len();
        let mut candidate = String::new();
        candidate.push_str(&base[..base.len().min(keep)]);
        candidate.push_str(&tail);
        if !ext.is_empty() {
            candidate.push('.');
            candidate.push_str(&ext);
        }
        let packed = pack_8dot3(&candidate);
        if !taken.contains(&packed) {
            return Some(packed);
        }
    }
    None
}

/// Case flags under which `name` is expressible as a short entry without an
/// LFN chain: each of base and extension must be uniformly cased and
/// otherwise 8.3-conform. `Some(0)` means plain upper-case.
pub(crate) fn sfn_case_flags(name: &str) -> Option<u8> {
    let (base, ext) = match name.rsplit_once('.') {
        Some((base, ext)) => (base, ext),
        None => (name, ""),
    };

    let field_flags = |field: &str, flag: u8| -> Option<u8> {
        let has_lower = field.chars().any(|c| c.is_ascii_lowercase());
        let has_upper = field.chars().any(|c| c.is_ascii_uppercase());
        if has_lower && has_upper {
            return None;
        }
        Some(if has_lower { flag } else { 0 })
    };

    let upper: String = name.chars().map(|c| c.to_ascii_uppercase()).collect();
    if !is_8dot3_conform(&upper) {
        return None;
    }
    let base_flag = field_flags(base, CASE_LOWER_BASE)?;
    let ext_flag = field_flags(ext, CASE_LOWER_EXT)?;
    Some(base_flag | ext_flag)
}

/// Everything known about one logical directory entry as presented to the
/// caller: the long name when present, the short name, metadata.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub name: String,
    pub short_name: ShortName,
    pub attributes: Attributes,
    pub size: u32,
    pub first_cluster: Option<Cluster>,
    pub created: DosDateTime,
    pub modified: DosDateTime,
    pub accessed: DosDate,
}

impl EntryInfo {
    pub fn is_dir(&self) -> bool {
        self.attributes.contains(Attributes::DIRECTORY)
    }

    pub fn is_volume_label(&self) -> bool {
        self.attributes.contains(Attributes::VOLUME_ID)
            && !self.attributes.contains(Attributes::DIRECTORY)
    }
}
