//! Pure code for interacting with FAT12/16/32 filesystems, including VFAT
//! long file names. Works on any seekable byte-addressable backing store.
//!
//! # Resources
//!
//! - <https://en.wikipedia.org/wiki/Design_of_the_FAT_file_system>
//! - <https://academy.cba.mit.edu/classes/networking_communications/SD/FAT.pdf>
//! - <https://wiki.osdev.org/FAT>

#![cfg_attr(not(test), no_std)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cargo_common_metadata,
    clippy::doc_markdown,
    clippy::implicit_hasher,
    clippy::implicit_return,
    clippy::missing_const_for_fn,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::multiple_crate_versions,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::redundant_pub_crate,
    clippy::suboptimal_flops,
    clippy::wildcard_imports
)]

extern crate alloc;

mod boot;
mod dir;
mod dirent;
mod disk;
mod error;
mod fat;
mod file;
mod fs;
mod mkfs;
mod path;
mod time;

pub use boot::{FatType, Geometry};
pub use dirent::{Attributes, EntryInfo, OemEncoding, ShortName};
pub use disk::{Disk, RamDisk, RamDiskError};
pub use error::Error;
pub use fat::Cluster;
pub use file::{File, OpenOptions, SeekFrom};
pub use fs::{FileSystem, InvalidOption, MountOptions};
pub use mkfs::{format_volume, FormatOptions};
pub use time::{Clock, DosDate, DosDateTime, DosTime, EpochClock};
