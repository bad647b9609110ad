use std::fs::File;
use std::os::unix::prelude::FileExt;

use fat::{Disk, EntryInfo, FileSystem, MountOptions};

/// `std::fs::File` as a backing store.
struct FileDisk(File);

impl Disk for FileDisk {
    type Error = std::io::Error;

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), Self::Error> {
        self.0.read_exact_at(buf, offset)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), Self::Error> {
        self.0.write_all_at(buf, offset)
    }

    fn size_bytes(&mut self) -> Result<u64, Self::Error> {
        Ok(self.0.metadata()?.len())
    }
}

fn main() {
    // Get command line arguments, including a FAT disk file
    let args: Vec<String> = std::env::args().collect();
    let (disk_file, offset) = match &args[..] {
        [_, disk_file] => (disk_file, 0),
        [_, disk_file, offset] => (
            disk_file,
            offset.parse().expect("offset must be a byte count"),
        ),
        _ => {
            eprintln!("Usage: {} <disk_file> [offset]", args[0]);
            std::process::exit(1);
        }
    };

    let file = File::open(disk_file).expect("failed to open disk file");
    let options = MountOptions {
        offset,
        read_only: true,
        ..MountOptions::default()
    };
    let fs = FileSystem::mount(FileDisk(file), options).expect("failed to mount filesystem");

    println!("{}: {}", disk_file, fs.fat_type());
    match fs.volume_label() {
        Ok(Some(label)) => println!("volume label: {label}"),
        Ok(None) => {}
        Err(err) => eprintln!("failed to read volume label: {err}"),
    }
    println!("free clusters: {}", fs.free_clusters());

    print_tree(&fs, "", 0);
}

fn print_tree(fs: &FileSystem<FileDisk>, path: &str, depth: usize) {
    let entries = match fs.read_dir(path) {
        Ok(entries) => entries,
        Err(err) => {
            eprintln!("failed to list {path}: {err}");
            return;
        }
    };
    for entry in entries {
        print_entry(&entry, depth);
        if entry.is_dir() {
            let child = format!("{}/{}", path, entry.name);
            print_tree(fs, &child, depth + 1);
        }
    }
}

fn print_entry(entry: &EntryInfo, depth: usize) {
    let kind = if entry.is_volume_label() {
        "label"
    } else if entry.is_dir() {
        "dir"
    } else {
        "file"
    };
    let modified = entry.modified;
    println!(
        "{:indent$}{:<5} {:>10}  {:04}-{:02}-{:02} {:02}:{:02}  {}",
        "",
        kind,
        entry.size,
        modified.year(),
        modified.month(),
        modified.day(),
        modified.hour(),
        modified.minute(),
        entry.name,
        indent = depth * 2,
    );
}
