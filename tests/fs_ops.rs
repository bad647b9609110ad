//! API-level behavior: name collisions, removal rules, rename, mount
//! options, the dirty bit and read-only mounts.

mod common;

use common::{formatted, mount, mount_with, TestDisk, MIB};
use fat::{
    Clock, DosDate, DosDateTime, DosTime, Error, FatType, FileSystem, MountOptions, OpenOptions,
    SeekFrom,
};

#[test]
fn colliding_names_are_rejected() {
    let disk = formatted(2 * MIB, None, "COLLIDE");
    let fs = mount(&disk);

    fs.create_file("/A.TXT").unwrap();
    assert!(matches!(fs.create_file("/a.txt"), Err(Error::AlreadyExists)));

    fs.create_dir("/sub").unwrap();
    assert!(matches!(fs.create_file("/sub"), Err(Error::AlreadyExists)));
    assert!(matches!(fs.create_dir("/SUB"), Err(Error::AlreadyExists)));

    // A long name colliding with a short name is also caught.
    assert!(matches!(
        fs.create_file("/a.TXT"),
        Err(Error::AlreadyExists)
    ));
    fs.unmount().unwrap();
}

#[test]
fn removal_rules() {
    let disk = formatted(2 * MIB, None, "REMOVE");
    let fs = mount(&disk);

    fs.create_dir("/dir").unwrap();
    fs.create_file("/dir/F.TXT").unwrap();

    assert!(matches!(fs.remove_dir("/dir"), Err(Error::DirectoryNotEmpty)));
    assert!(matches!(fs.remove_file("/dir"), Err(Error::IsDirectory)));
    assert!(matches!(
        fs.remove_dir("/dir/F.TXT"),
        Err(Error::NotADirectory)
    ));
    assert!(matches!(fs.remove_file("/"), Err(Error::InvalidInput(_))));
    assert!(matches!(fs.remove_file("/nope"), Err(Error::NotFound)));

    fs.remove_file("/dir/F.TXT").unwrap();
    fs.remove_dir("/dir").unwrap();
    assert!(matches!(fs.stat("/dir"), Err(Error::NotFound)));
    fs.unmount().unwrap();
}

#[test]
fn rename_moves_and_preserves_contents() {
    let disk = formatted(16 * MIB, None, "RENAME");
    let fs = mount(&disk);

    let mut file = fs
        .open_file("/A.TXT", OpenOptions::new().write(true).create(true))
        .unwrap();
    file.write(b"payload").unwrap();
    drop(file);

    fs.rename("/A.TXT", "/B.TXT").unwrap();
    assert!(matches!(fs.stat("/A.TXT"), Err(Error::NotFound)));

    let mut file = fs.open_file("/B.TXT", OpenOptions::new().read(true)).unwrap();
    let mut contents = Vec::new();
    file.read_to_end(&mut contents).unwrap();
    assert_eq!(contents, b"payload");
    drop(file);

    // Moving a directory updates its dotdot anchor; children stay
    // reachable through the new path.
    fs.create_dir("/d1").unwrap();
    fs.create_dir("/d2").unwrap();
    fs.create_dir("/d1/child").unwrap();
    fs.create_file("/d1/child/F.TXT").unwrap();
    fs.rename("/d1/child", "/d2/moved").unwrap();
    assert!(fs.stat("/d2/moved/F.TXT").is_ok());
    assert!(matches!(fs.stat("/d1/child"), Err(Error::NotFound)));

    // Renaming onto an existing entry fails.
    fs.create_file("/C.TXT").unwrap();
    assert!(matches!(
        fs.rename("/B.TXT", "/C.TXT"),
        Err(Error::AlreadyExists)
    ));

    // A case-only rename of the same entry is allowed.
    fs.rename("/C.TXT", "/c.txt").unwrap();
    let info = fs.stat("/c.txt").unwrap();
    assert_eq!(info.name, "c.txt");
    fs.unmount().unwrap();
}

#[test]
fn fat12_root_directory_cannot_grow() {
    let disk = formatted(2 * MIB, None, "ROOTFULL");
    let fs = mount(&disk);

    // The FAT12 root region holds 224 slots; one is the label. Conforming
    // names take one slot each.
    let mut created = 0;
    let err = loop {
        match fs.create_file(&format!("/R{created}")) {
            Ok(()) => created += 1,
            Err(err) => break err,
        }
    };
    assert_eq!(created, 223);
    assert!(matches!(err, Error::NoSpace));
    fs.unmount().unwrap();
}

#[test]
fn read_only_mount_never_writes() {
    let disk = formatted(2 * MIB, None, "RDONLY");
    {
        let fs = mount(&disk);
        fs.create_file("/F.TXT").unwrap();
        fs.unmount().unwrap();
    }

    let writes_before = disk.write_count();
    let options = MountOptions {
        read_only: true,
        ..MountOptions::default()
    };
    let fs = mount_with(&disk, options);

    assert!(fs.read_dir("/").unwrap().iter().any(|e| e.name == "F.TXT"));
    let mut file = fs.open_file("/F.TXT", OpenOptions::new().read(true)).unwrap();
    let mut out = Vec::new();
    file.read_to_end(&mut out).unwrap();
    drop(file);

    assert!(matches!(fs.create_file("/G.TXT"), Err(Error::ReadOnly)));
    assert!(matches!(fs.remove_file("/F.TXT"), Err(Error::ReadOnly)));
    assert!(matches!(
        fs.open_file("/F.TXT", OpenOptions::new().write(true)),
        Err(Error::ReadOnly)
    ));
    fs.unmount().unwrap();

    assert_eq!(disk.write_count(), writes_before);
}

/// Byte offset of FAT entry 1's high byte on a freshly formatted FAT16
/// volume: one reserved sector, two bytes per entry.
const FAT16_ENTRY1_HIGH: usize = 512 + 2 + 1;

#[test]
fn dirty_bit_lifecycle() {
    let disk = formatted(16 * MIB, None, "DIRTY");
    assert_eq!(disk.snapshot()[FAT16_ENTRY1_HIGH], 0xFF);

    // Mounting read-write clears the clean-shutdown bit on disk.
    let fs = mount(&disk);
    assert_eq!(disk.snapshot()[FAT16_ENTRY1_HIGH], 0x7F);

    // A hard abort leaves it cleared.
    std::mem::forget(fs);
    assert_eq!(disk.snapshot()[FAT16_ENTRY1_HIGH], 0x7F);

    // The next mount observes the unclean state, proceeds, and a clean
    // unmount restores the bit.
    let fs = mount(&disk);
    fs.unmount().unwrap();
    assert_eq!(disk.snapshot()[FAT16_ENTRY1_HIGH], 0xFF);
}

#[test]
fn fs_info_reflects_free_count_after_unmount() {
    let disk = formatted(64 * MIB, Some(FatType::Fat32), "FSINFO");
    let fs = mount(&disk);
    let cluster = fs.geometry().bytes_per_cluster as usize;

    let mut file = fs
        .open_file("/F.BIN", OpenOptions::new().write(true).create(true))
        .unwrap();
    file.write(&vec![0u8; 5 * cluster]).unwrap();
    drop(file);
    let free = fs.free_clusters();
    fs.unmount().unwrap();

    // FSInfo lives in sector 1; the free count sits at offset 488.
    let snapshot = disk.snapshot();
    let stored = u32::from_le_bytes(snapshot[512 + 488..512 + 492].try_into().unwrap());
    assert_eq!(stored, free);

    // A remount agrees with the stored accounting.
    let fs = mount(&disk);
    assert_eq!(fs.free_clusters(), free);
    fs.unmount().unwrap();
}

#[test]
fn mount_option_parsing() {
    let options = MountOptions::from_pairs([
        ("encoding", "ascii"),
        ("read_only", "true"),
        ("lazy_load", "0"),
        ("atime", "yes"),
        ("utterly_unknown", "ignored"),
    ])
    .unwrap();
    assert!(options.read_only);
    assert!(!options.lazy_load);
    assert!(options.update_access_time);

    let err = MountOptions::from_pairs([("offset", "not-a-number")]).unwrap_err();
    assert_eq!(err.key, "offset");
}

#[test]
fn eager_mount_walks_the_tree() {
    let disk = formatted(16 * MIB, None, "EAGER");
    {
        let fs = mount(&disk);
        fs.create_dir("/a").unwrap();
        fs.create_dir("/a/b").unwrap();
        fs.create_file("/a/b/C.TXT").unwrap();
        fs.unmount().unwrap();
    }

    let options = MountOptions {
        lazy_load: false,
        ..MountOptions::default()
    };
    let fs = mount_with(&disk, options);
    assert!(fs.stat("/a/b/C.TXT").is_ok());
    fs.unmount().unwrap();
}

#[test]
fn path_and_name_validation() {
    let disk = formatted(2 * MIB, None, "NAMES");
    let fs = mount(&disk);

    assert!(matches!(fs.stat("/a/../b"), Err(Error::InvalidInput(_))));
    assert!(matches!(fs.create_file("/"), Err(Error::InvalidInput(_))));
    assert!(matches!(
        fs.create_file(&format!("/{}", "x".repeat(300))),
        Err(Error::InvalidInput(_))
    ));

    // Reading a file path as a directory fails with NotADirectory.
    fs.create_file("/F.TXT").unwrap();
    assert!(matches!(fs.read_dir("/F.TXT"), Err(Error::NotADirectory)));
    assert!(matches!(
        fs.stat("/F.TXT/below"),
        Err(Error::NotADirectory)
    ));

    // Opening a directory as a file fails with IsDirectory.
    fs.create_dir("/d").unwrap();
    assert!(matches!(
        fs.open_file("/d", OpenOptions::new().read(true)),
        Err(Error::IsDirectory)
    ));
    fs.unmount().unwrap();
}

/// Clock pinned to 2020-05-04 10:20:30 for observable timestamps.
struct FixedClock;

impl Clock for FixedClock {
    fn now(&self) -> DosDateTime {
        DosDateTime::new(
            DosDate::new().with_year_offset(40).with_month(5).with_day(4),
            DosTime::new()
                .with_hour(10)
                .with_minute(20)
                .with_double_seconds(15),
            0,
        )
    }
}

#[test]
fn timestamps_follow_the_mount_clock() {
    let disk = formatted(2 * MIB, None, "TIME");
    {
        let fs = mount(&disk);
        fs.create_file("/F.TXT").unwrap();
        fs.unmount().unwrap();
    }

    let info = {
        let fs = mount(&disk);
        fs.stat("/F.TXT").unwrap()
    };
    // Created under the default epoch clock.
    assert_eq!(info.created.year(), 1980);

    // Writing under a different clock stamps the new write time.
    let options = MountOptions {
        clock: Box::new(FixedClock),
        update_access_time: true,
        ..MountOptions::default()
    };
    let fs = mount_with(&disk, options);
    let mut file = fs
        .open_file("/F.TXT", OpenOptions::new().read(true).write(true))
        .unwrap();
    file.write(b"x").unwrap();
    file.seek(SeekFrom::Start(0)).unwrap();
    let mut byte = [0u8; 1];
    file.read(&mut byte).unwrap();
    file.flush().unwrap();
    drop(file);

    let info = fs.stat("/F.TXT").unwrap();
    assert_eq!(info.modified.year(), 2020);
    assert_eq!(info.modified.month(), 5);
    assert_eq!(info.modified.second(), 30);
    // The access date moved with the read we did via the write handle's
    // mount; creation time is untouched.
    assert_eq!(info.accessed.year_offset(), 40);
    assert_eq!(info.created.year(), 1980);
    fs.unmount().unwrap();
}

#[test]
fn unmount_returns_the_backing_store() {
    let disk = formatted(2 * MIB, None, "GIVEBACK");
    let fs: FileSystem<TestDisk> = mount(&disk);
    fs.create_file("/X.TXT").unwrap();
    let returned = fs.unmount().unwrap();
    drop(returned);

    let fs = mount(&disk);
    assert!(fs.stat("/X.TXT").is_ok());
    fs.unmount().unwrap();
}
