//! On-disk layout of the file system: constants, record formats and region
//! arithmetic.
//!
//! The whole file system lives inside a single fixed-size diskfile split into
//! [`BLOCK_SIZE`] byte blocks, laid out as consecutive block-aligned regions:
//! the superblock, the inode bitmap, the data block bitmap, the inode table
//! and finally the data region. All records are host-endian `#[repr(C)]`
//! structures transferred byte-for-byte.

use crate::util::ceil_division;
use std::mem::size_of;

/// Size of a disk block in bytes.
pub const BLOCK_SIZE: usize = 4096;
/// Size of the diskfile in bytes (32 MiB).
pub const DISK_SIZE: u64 = 32 * 1024 * 1024;
/// Maximum number of inodes.
pub const MAX_INUM: usize = 1024;
/// Maximum number of data blocks.
pub const MAX_DNUM: usize = 16384;
/// The file system's signature, stored in the superblock.
pub const MAGIC: u32 = 0x5c3a;
/// Number of direct block pointers per inode.
pub const N_DIRECT: usize = 16;
/// Number of single-indirect block pointers per inode.
pub const N_INDIRECT: usize = 8;
/// Maximum length of a file name, including the NUL terminator.
pub const NAME_MAX: usize = 208;
/// Inode number of the root directory.
pub const ROOT_INO: u16 = 0;

/// Number of block numbers held by one indirect block.
pub const PTRS_PER_BLOCK: usize = BLOCK_SIZE / size_of::<u32>();
/// Highest number of blocks a single file can address.
pub const MAX_FILE_BLOCKS: usize = N_DIRECT + N_INDIRECT * PTRS_PER_BLOCK;
/// Number of directory entries held by one directory data block.
pub const DIRENTS_PER_BLOCK: usize = BLOCK_SIZE / size_of::<DirEntry>();

/// Inode kind: directory.
pub const KIND_DIRECTORY: u32 = 0;
/// Inode kind: regular file.
pub const KIND_FILE: u32 = 1;

/// Mode reported for directories.
pub const DIR_MODE: u32 = libc::S_IFDIR | 0o755;
/// Mode reported for regular files.
pub const FILE_MODE: u32 = libc::S_IFREG | 0o755;

/// The superblock describes the region layout of the diskfile.
///
/// It is written once when the file system is created, read once at mount and
/// never mutated afterwards.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Superblock {
    /// Magic number identifying the file system.
    pub magic: u32,
    /// Maximum number of inodes.
    pub max_inum: u16,
    /// Maximum number of data blocks.
    pub max_dnum: u16,
    /// Start block of the inode bitmap.
    pub i_bitmap_blk: u32,
    /// Start block of the data block bitmap.
    pub d_bitmap_blk: u32,
    /// Start block of the inode region.
    pub i_start_blk: u32,
    /// Start block of the data region.
    pub d_start_blk: u32,
}

impl Superblock {
    /// Computes the region layout for the constants above.
    pub fn new() -> Self {
        let mut blk = ceil_division(size_of::<Superblock>(), BLOCK_SIZE) as u32;
        let i_bitmap_blk = blk;
        blk += ceil_division(ceil_division(MAX_INUM, 8), BLOCK_SIZE) as u32;
        let d_bitmap_blk = blk;
        blk += ceil_division(ceil_division(MAX_DNUM, 8), BLOCK_SIZE) as u32;
        let i_start_blk = blk;
        blk += ceil_division(MAX_INUM * size_of::<Inode>(), BLOCK_SIZE) as u32;
        let d_start_blk = blk;
        Self {
            magic: MAGIC,
            max_inum: MAX_INUM as u16,
            max_dnum: MAX_DNUM as u16,
            i_bitmap_blk,
            d_bitmap_blk,
            i_start_blk,
            d_start_blk,
        }
    }

    /// Number of blocks occupied by the inode region.
    pub fn inode_region_blocks(&self) -> u32 {
        self.d_start_blk - self.i_start_blk
    }
}

/// Fixed-size descriptor of one file or directory.
///
/// A block pointer value of `0` always means "not allocated": block `0` is
/// the superblock and can never back file data.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Inode {
    /// The inode number.
    pub ino: u16,
    /// Non-zero when the inode is in use.
    pub valid: u16,
    /// Size of the file in bytes.
    pub size: u32,
    /// Kind of the file ([`KIND_DIRECTORY`] or [`KIND_FILE`]).
    pub kind: u32,
    /// Reference count. For directories this counts the entries added to the
    /// directory, not the hard links to it.
    pub link: u32,
    /// Direct data block pointers.
    pub direct: [u32; N_DIRECT],
    /// Single-indirect block pointers, each naming a block of block numbers.
    pub indirect: [u32; N_INDIRECT],
    /// Mode bits as reported to `stat`.
    pub mode: u32,
    /// Timestamp of the last access.
    pub atime: i64,
    /// Timestamp of the last content modification.
    pub mtime: i64,
}

impl Default for Inode {
    fn default() -> Self {
        Self {
            ino: 0,
            valid: 0,
            size: 0,
            kind: 0,
            link: 0,
            direct: [0; N_DIRECT],
            indirect: [0; N_INDIRECT],
            mode: 0,
            atime: 0,
            mtime: 0,
        }
    }
}

impl Inode {
    /// Tells whether the inode is in use.
    pub fn is_valid(&self) -> bool {
        self.valid != 0
    }

    /// Tells whether the inode describes a directory.
    pub fn is_directory(&self) -> bool {
        self.kind == KIND_DIRECTORY
    }

    /// Tells whether the inode describes a regular file.
    pub fn is_file(&self) -> bool {
        self.kind == KIND_FILE
    }
}

/// A directory entry, binding a name to an inode number.
///
/// Directory data blocks are arrays of these fixed-size slots; a slot with
/// `valid == 0` is free and may be reused.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct DirEntry {
    /// Inode number of the entry's target.
    pub ino: u16,
    /// Non-zero when the slot is occupied.
    pub valid: u16,
    /// NUL-terminated name of the entry.
    pub name: [u8; NAME_MAX],
    /// Length of the name, not counting the terminator.
    pub len: u16,
}

impl Default for DirEntry {
    fn default() -> Self {
        Self {
            ino: 0,
            valid: 0,
            name: [0; NAME_MAX],
            len: 0,
        }
    }
}

impl DirEntry {
    /// Builds an occupied entry binding `name` to `ino`.
    ///
    /// `name` must be shorter than [`NAME_MAX`] so its NUL terminator fits.
    pub fn new(ino: u16, name: &str) -> Self {
        let mut entry = Self {
            ino,
            valid: 1,
            name: [0; NAME_MAX],
            len: name.len() as u16,
        };
        entry.name[..name.len()].copy_from_slice(name.as_bytes());
        entry
    }

    /// Returns the entry's name, or `None` if it is not valid UTF-8.
    pub fn name(&self) -> Option<&str> {
        std::str::from_utf8(&self.name[..self.len as usize]).ok()
    }

    /// Compares the entry's name to `name`, byte for byte.
    pub fn name_matches(&self, name: &str) -> bool {
        self.len as usize == name.len() && &self.name[..name.len()] == name.as_bytes()
    }
}

/// A block of block numbers, pointed to by an inode's indirect pointers.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct IndirectBlock {
    /// The referenced data blocks; `0` means "not allocated".
    pub entries: [u32; PTRS_PER_BLOCK],
}

impl Default for IndirectBlock {
    fn default() -> Self {
        Self {
            entries: [0; PTRS_PER_BLOCK],
        }
    }
}

const _: () = assert!(size_of::<Superblock>() == 24);
const _: () = assert!(size_of::<Inode>() == 136);
const _: () = assert!(size_of::<DirEntry>() == 214);
const _: () = assert!(size_of::<IndirectBlock>() == BLOCK_SIZE);
