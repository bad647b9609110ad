//! Directory regions as flat buffers of 32-byte slots: scanning them into
//! logical entries, finding room for new ones and cleaning up after
//! deletions. Reading and writing the backing clusters is the owning
//! handle's job; everything here is pure buffer manipulation.

use alloc::string::String;
use alloc::vec::Vec;
use core::ops::Range;

use zerocopy::{AsBytes, FromBytes};

use crate::boot::FatType;
use crate::dirent::{
    decode_lfn, lfn_checksum, Attributes, EntryInfo, OemEncoding, RawDirEntry, RawLfnEntry,
    ShortName, DIR_ENTRY_SIZE, ENTRY_DELETED, ENTRY_E5_ESCAPE, ENTRY_END,
};
use crate::fat::Cluster;

/// Where a directory's slots live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DirLocation {
    /// The fixed-size root directory region of a FAT12/16 volume. It cannot
    /// grow.
    FixedRoot,
    /// A cluster chain: the FAT32 root or any non-root directory.
    Chain(Cluster),
}

/// One logical directory entry found by a scan: the short entry plus the
/// long name folded out of the preceding LFN run, and the physical slots
/// the record occupies.
#[derive(Debug, Clone)]
pub(crate) struct ScannedEntry {
    pub(crate) raw: RawDirEntry,
    pub(crate) long_name: Option<String>,
    pub(crate) slots: Range<usize>,
}

impl ScannedEntry {
    pub(crate) fn short_name(&self) -> ShortName {
        ShortName::from_bytes(self.raw.name)
    }

    /// The name shown to callers: the long name when one survived folding,
    /// otherwise the short name with its case flags applied. Volume labels
    /// use all eleven bytes with no implied dot.
    pub(crate) fn display_name(&self, encoding: OemEncoding) -> String {
        if self.raw.is_volume_label() {
            let mut label: String = self
                .raw
                .name
                .iter()
                .map(|&b| encoding.decode_byte(b))
                .collect();
            while label.ends_with(' ') {
                label.pop();
            }
            return label;
        }
        self.long_name.clone().unwrap_or_else(|| {
            self.short_name().display(encoding, self.raw.nt_reserved)
        })
    }

    /// Case-insensitive match against both the long and the short form.
    pub(crate) fn matches(&self, name: &str, encoding: OemEncoding) -> bool {
        if let Some(long) = &self.long_name {
            if long.eq_ignore_ascii_case(name) {
                return true;
            }
        }
        self.short_name()
            .display(encoding, 0)
            .eq_ignore_ascii_case(name)
    }

    pub(crate) fn slot_count(&self) -> usize {
        self.slots.end - self.slots.start
    }

    pub(crate) fn info(&self, fat_type: FatType, encoding: OemEncoding) -> EntryInfo {
        let cluster = self.raw.first_cluster(fat_type);
        EntryInfo {
            name: self.display_name(encoding),
            short_name: self.short_name(),
            attributes: self.raw.attributes,
            size: self.raw.size,
            first_cluster: (cluster >= 2).then_some(Cluster(cluster)),
            created: self.raw.created(),
            modified: self.raw.modified(),
            accessed: self.raw.accessed(),
        }
    }
}

/// Fold a directory buffer into logical entries. Scanning stops at the
/// first never-used slot. An LFN run whose checksum does not match the
/// short entry that follows it, or that is incomplete, is dropped with a
/// warning and the short entry stands alone.
pub(crate) fn scan_entries(buf: &[u8], encoding: OemEncoding) -> Vec<ScannedEntry> {
    let mut entries = Vec::new();
    let mut lfn_run: Vec<RawLfnEntry> = Vec::new();
    let mut run_start = 0usize;

    for idx in 0..buf.len() / DIR_ENTRY_SIZE {
        let slot = &buf[idx * DIR_ENTRY_SIZE..(idx + 1) * DIR_ENTRY_SIZE];
        let first_byte = slot[0];
        if first_byte == ENTRY_END {
            break;
        }
        if first_byte == ENTRY_DELETED {
            lfn_run.clear();
            continue;
        }

        let attributes = Attributes::from_bits_retain(slot[11]);
        if attributes.is_long_name() {
            if lfn_run.is_empty() {
                run_start = idx;
            }
            lfn_run.push(RawLfnEntry::read_from(slot).expect("slot slice is 32 bytes"));
            continue;
        }

        let mut raw = RawDirEntry::read_from(slot).expect("slot slice is 32 bytes");
        if raw.name[0] == ENTRY_E5_ESCAPE {
            raw.name[0] = ENTRY_DELETED;
        }

        let mut start = idx;
        let mut long_name = None;
        if !lfn_run.is_empty() {
            match decode_lfn(&lfn_run) {
                Some((name, checksum)) if checksum == lfn_checksum(&raw.name) => {
                    long_name = Some(name);
                    start = run_start;
                }
                _ => {
                    let short = ShortName::from_bytes(raw.name).display(encoding, 0);
                    log::warn!("dropping orphaned long-name run before entry {short:?}");
                }
            }
            lfn_run.clear();
        }

        entries.push(ScannedEntry {
            raw,
            long_name,
            slots: start..idx + 1,
        });
    }

    entries
}

/// Find `needed` contiguous free slots (never-used or deleted) in the
/// buffer. Returns the index of the first slot of the run.
pub(crate) fn find_free_run(buf: &[u8], needed: usize) -> Option<usize> {
    let slot_count = buf.len() / DIR_ENTRY_SIZE;
    let mut run_start = 0;
    let mut run_len = 0;
    for idx in 0..slot_count {
        let first_byte = buf[idx * DIR_ENTRY_SIZE];
        if first_byte == ENTRY_END || first_byte == ENTRY_DELETED {
            if run_len == 0 {
                run_start = idx;
            }
            run_len += 1;
            if run_len == needed {
                return Some(run_start);
            }
        } else {
            run_len = 0;
        }
    }
    None
}

/// Serialize a logical entry into its physical slots: the LFN records (in
/// on-disk order) followed by the short entry, with the 0xE5 first-byte
/// escape applied.
pub(crate) fn entry_slots(lfn: &[RawLfnEntry], short: &RawDirEntry) -> Vec<[u8; DIR_ENTRY_SIZE]> {
    let mut slots = Vec::with_capacity(lfn.len() + 1);
    for record in lfn {
        let mut bytes = [0u8; DIR_ENTRY_SIZE];
        bytes.copy_from_slice(record.as_bytes());
        slots.push(bytes);
    }
    let mut bytes = [0u8; DIR_ENTRY_SIZE];
    bytes.copy_from_slice(short.as_bytes());
    if bytes[0] == ENTRY_DELETED {
        bytes[0] = ENTRY_E5_ESCAPE;
    }
    slots.push(bytes);
    slots
}

/// After slots have been marked deleted, find the deleted slots with no
/// live entry after them. Those are rewritten as never-used so a stale LFN
/// run cannot be picked up by the next scan.
pub(crate) fn trailing_tombstones(buf: &[u8]) -> Vec<usize> {
    let slot_count = buf.len() / DIR_ENTRY_SIZE;
    let mut last_live = None;
    for idx in 0..slot_count {
        let first_byte = buf[idx * DIR_ENTRY_SIZE];
        if first_byte != ENTRY_END && first_byte != ENTRY_DELETED {
            last_live = Some(idx);
        }
    }

    let scan_from = last_live.map_or(0, |idx| idx + 1);
    (scan_from..slot_count)
        .filter(|idx| buf[idx * DIR_ENTRY_SIZE] == ENTRY_DELETED)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::dirent::encode_lfn;
    use crate::time::DosDateTime;

    fn short_entry(name: &[u8; 11]) -> RawDirEntry {
        RawDirEntry::new(*name, Attributes::ARCHIVE, DosDateTime::EPOCH)
    }

    fn push_slots(buf: &mut Vec<u8>, slots: &[[u8; DIR_ENTRY_SIZE]]) {
        for slot in slots {
            buf.extend_from_slice(slot);
        }
    }

    fn buffer_with(entries: &[(&str, &[u8; 11])]) -> Vec<u8> {
        let mut buf = Vec::new();
        for (long, short) in entries {
            let raw = short_entry(short);
            let lfn = encode_lfn(long, lfn_checksum(short));
            push_slots(&mut buf, &entry_slots(&lfn, &raw));
        }
        buf.resize(1024, 0);
        buf
    }

    #[test]
    fn scan_folds_lfn_runs() {
        let buf = buffer_with(&[("Hello World.txt", b"HELLOW~1TXT")]);
        let entries = scan_entries(&buf, OemEncoding::Ibm437);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].long_name.as_deref(), Some("Hello World.txt"));
        assert_eq!(entries[0].slots, 0..3);
        assert!(entries[0].matches("hello world.TXT", OemEncoding::Ibm437));
        assert!(entries[0].matches("HELLOW~1.TXT", OemEncoding::Ibm437));
    }

    #[test]
    fn scan_stops_at_never_used_slot() {
        let mut buf = buffer_with(&[("a.txt", b"A       TXT"), ("b.txt", b"B       TXT")]);
        // Zero out the second entry's slots; the scan must not see it.
        let second_start = 2 * DIR_ENTRY_SIZE;
        for b in &mut buf[second_start..second_start + 2 * DIR_ENTRY_SIZE] {
            *b = 0;
        }
        let entries = scan_entries(&buf, OemEncoding::Ibm437);
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn corrupt_lfn_checksum_degrades_to_short_name() {
        let mut buf = buffer_with(&[("Hello World.txt", b"HELLOW~1TXT")]);
        buf[13] ^= 0xFF; // flip the checksum byte of the first LFN record
        let entries = scan_entries(&buf, OemEncoding::Ibm437);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].long_name, None);
        assert_eq!(
            entries[0].display_name(OemEncoding::Ibm437),
            "HELLOW~1.TXT"
        );
        // The short entry alone occupies one slot.
        assert_eq!(entries[0].slot_count(), 1);
    }

    #[test]
    fn deleted_slots_invalidate_pending_lfn_run() {
        let mut buf = buffer_with(&[("Hello World.txt", b"HELLOW~1TXT")]);
        // Delete the LFN records but leave the short entry.
        buf[0] = ENTRY_DELETED;
        buf[DIR_ENTRY_SIZE] = ENTRY_DELETED;
        let entries = scan_entries(&buf, OemEncoding::Ibm437);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].long_name, None);
    }

    #[test]
    fn free_run_prefers_deleted_slots() {
        let mut buf = buffer_with(&[
            ("a.txt", b"A       TXT"),
            ("b.txt", b"B       TXT"),
            ("c.txt", b"C       TXT"),
        ]);
        // Delete b (slots 2..4): its two slots become reusable.
        buf[2 * DIR_ENTRY_SIZE] = ENTRY_DELETED;
        buf[3 * DIR_ENTRY_SIZE] = ENTRY_DELETED;

        assert_eq!(find_free_run(&buf, 1), Some(2));
        assert_eq!(find_free_run(&buf, 2), Some(2));
        // A three-slot record does not fit in the hole; it goes after c.
        assert_eq!(find_free_run(&buf, 3), Some(6));
    }

    #[test]
    fn free_run_exhausted() {
        // One entry (an LFN slot plus the short slot) and a single spare slot.
        let mut buf = buffer_with(&[("a.txt", b"A       TXT")]);
        buf.truncate(3 * DIR_ENTRY_SIZE);
        assert_eq!(find_free_run(&buf, 1), Some(2));
        assert_eq!(find_free_run(&buf, 2), None);
    }

    #[test]
    fn trailing_tombstones_after_last_removal() {
        let mut buf = buffer_with(&[("a.txt", b"A       TXT"), ("b.txt", b"B       TXT")]);
        // Delete b; its tombstones trail the directory.
        buf[2 * DIR_ENTRY_SIZE] = ENTRY_DELETED;
        buf[3 * DIR_ENTRY_SIZE] = ENTRY_DELETED;
        assert_eq!(trailing_tombstones(&buf), vec![2, 3]);

        // A tombstone followed by a live entry stays.
        let mut buf = buffer_with(&[("a.txt", b"A       TXT"), ("b.txt", b"B       TXT")]);
        buf[0] = ENTRY_DELETED;
        buf[DIR_ENTRY_SIZE] = ENTRY_DELETED;
        assert_eq!(trailing_tombstones(&buf), Vec::<usize>::new());
    }

    #[test]
    fn e5_escape_round_trips() {
        let mut name = *b"X       TXT";
        name[0] = ENTRY_DELETED; // a real first byte of 0xE5
        let raw = short_entry(&name);
        let slots = entry_slots(&[], &raw);
        assert_eq!(slots[0][0], ENTRY_E5_ESCAPE);

        let mut buf = Vec::new();
        push_slots(&mut buf, &slots);
        buf.resize(512, 0);
        let entries = scan_entries(&buf, OemEncoding::Ibm437);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].raw.name[0], ENTRY_DELETED);
    }
}
