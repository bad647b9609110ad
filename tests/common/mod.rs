//! Shared fixtures for the integration tests: an inspectable in-memory
//! disk and formatting helpers.

// Each test binary compiles this module separately and uses a subset.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use fat::{format_volume, Disk, FatType, FileSystem, FormatOptions, MountOptions};

pub const MIB: usize = 1024 * 1024;

/// In-memory disk whose contents stay reachable while a filesystem owns
/// it, with a write counter for read-only assertions.
#[derive(Clone)]
pub struct TestDisk {
    data: Arc<Mutex<Vec<u8>>>,
    writes: Arc<AtomicUsize>,
}

#[derive(Debug)]
pub struct OutOfBounds;

impl TestDisk {
    pub fn new(size: usize) -> Self {
        Self {
            data: Arc::new(Mutex::new(vec![0; size])),
            writes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn corrupt_byte(&self, offset: usize, f: impl FnOnce(u8) -> u8) {
        let mut data = self.data.lock().unwrap();
        data[offset] = f(data[offset]);
    }

    /// Find the byte offset of `needle` in the raw image.
    pub fn find(&self, needle: &[u8]) -> Option<usize> {
        let data = self.data.lock().unwrap();
        data.windows(needle.len()).position(|w| w == needle)
    }
}

impl Disk for TestDisk {
    type Error = OutOfBounds;

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), Self::Error> {
        let data = self.data.lock().unwrap();
        let start = usize::try_from(offset).map_err(|_| OutOfBounds)?;
        let end = start.checked_add(buf.len()).ok_or(OutOfBounds)?;
        if end > data.len() {
            return Err(OutOfBounds);
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), Self::Error> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut data = self.data.lock().unwrap();
        let start = usize::try_from(offset).map_err(|_| OutOfBounds)?;
        let end = start.checked_add(buf.len()).ok_or(OutOfBounds)?;
        if end > data.len() {
            return Err(OutOfBounds);
        }
        data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn size_bytes(&mut self) -> Result<u64, Self::Error> {
        Ok(self.data.lock().unwrap().len() as u64)
    }
}

/// Format a fresh image of `size` bytes and return the still-shared disk.
pub fn formatted(size: usize, fat_type: Option<FatType>, label: &str) -> TestDisk {
    let disk = TestDisk::new(size);
    let options = FormatOptions {
        fat_type,
        label: Some(label.to_string()),
        ..FormatOptions::default()
    };
    format_volume(&mut disk.clone(), &options).expect("format failed");
    disk
}

pub fn mount(disk: &TestDisk) -> FileSystem<TestDisk> {
    FileSystem::mount(disk.clone(), MountOptions::default()).expect("mount failed")
}

pub fn mount_with(disk: &TestDisk, options: MountOptions) -> FileSystem<TestDisk> {
    FileSystem::mount(disk.clone(), options).expect("mount failed")
}

/// Deterministic pseudo-random bytes from an xorshift generator.
pub fn random_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut x = seed.max(1);
    (0..len)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            x as u8
        })
        .collect()
}
