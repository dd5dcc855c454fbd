//! A mounted volume: the backing device, the superblock and the metadata
//! regions (allocation bitmaps and inode table).

use crate::bitmap::Bitmap;
use crate::block::BlockDevice;
use crate::layout::{
    BLOCK_SIZE, DIR_MODE, IndirectBlock, Inode, KIND_DIRECTORY, MAGIC, MAX_DNUM, MAX_INUM,
    N_DIRECT, PTRS_PER_BLOCK, ROOT_INO, Superblock,
};
use crate::util::{ceil_division, errno, get_timestamp, reinterpret, reinterpret_mut};
use log::{debug, info};
use std::io;
use std::mem::size_of;
use std::path::Path;

/// Usage counters derived from the allocation bitmaps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VolumeStats {
    /// Number of inodes in use.
    pub used_inodes: usize,
    /// Number of blocks in use, metadata blocks included.
    pub used_blocks: usize,
}

/// A formatted diskfile and its in-memory superblock.
///
/// The volume offers the metadata primitives the upper layers are built on:
/// inode slot I/O, bitmap load/store and the two allocators. It performs no
/// locking of its own; [`crate::fs::TinyFs`] serializes access.
#[derive(Debug)]
pub struct Volume {
    /// The block device holding the file system.
    pub(crate) dev: BlockDevice,
    /// The superblock, read at mount.
    pub(crate) sb: Superblock,
}

impl Volume {
    /// Formats the diskfile at `path` and returns the mounted volume.
    ///
    /// The diskfile is created if absent and sized to the fixed disk size.
    /// After formatting, the volume holds a root directory containing only
    /// `"."` and `".."`.
    pub fn format(path: &Path) -> io::Result<Self> {
        let dev = BlockDevice::init(path)?;
        let sb = Superblock::new();

        let mut buf = [0u8; BLOCK_SIZE];
        buf[..size_of::<Superblock>()].copy_from_slice(reinterpret(&sb));
        dev.write_block(0, &buf)?;

        // Zero the inode region.
        let zero = [0u8; BLOCK_SIZE];
        for blk in sb.i_start_blk..sb.d_start_blk {
            dev.write_block(blk, &zero)?;
        }

        let volume = Self { dev, sb };

        // Root holds inode 0; the blocks in front of the data region are
        // pre-marked so metadata is never handed out as data.
        let mut imap = Bitmap::new(MAX_INUM);
        imap.set(ROOT_INO as usize);
        volume.store_inode_bitmap(&imap)?;
        let mut dmap = Bitmap::new(MAX_DNUM);
        for blk in 0..sb.d_start_blk {
            dmap.set(blk as usize);
        }
        volume.store_data_bitmap(&dmap)?;

        let now = get_timestamp();
        let root = Inode {
            ino: ROOT_INO,
            valid: 1,
            kind: KIND_DIRECTORY,
            mode: DIR_MODE,
            atime: now,
            mtime: now,
            ..Default::default()
        };
        volume.write_inode(ROOT_INO, &root)?;
        volume.init_directory(ROOT_INO, ROOT_INO)?;

        info!(
            "formatted {}: {} inodes, {} blocks, data region at block {}",
            path.display(),
            MAX_INUM,
            MAX_DNUM,
            sb.d_start_blk
        );
        Ok(volume)
    }

    /// Opens the formatted diskfile at `path` and reads its superblock.
    pub fn open(path: &Path) -> io::Result<Self> {
        let dev = BlockDevice::open(path)?;
        let mut buf = [0u8; BLOCK_SIZE];
        dev.read_block(0, &mut buf)?;
        let mut sb = Superblock::default();
        reinterpret_mut(&mut sb).copy_from_slice(&buf[..size_of::<Superblock>()]);
        if sb.magic != MAGIC {
            return Err(errno(libc::EINVAL));
        }
        Ok(Self { dev, sb })
    }

    /// Returns the volume's superblock.
    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    /// Counts the inodes and blocks in use by scanning both bitmaps.
    pub fn stats(&self) -> io::Result<VolumeStats> {
        Ok(VolumeStats {
            used_inodes: self.load_inode_bitmap()?.count_set(),
            used_blocks: self.load_data_bitmap()?.count_set(),
        })
    }

    /// Loads the inode bitmap from disk.
    pub fn load_inode_bitmap(&self) -> io::Result<Bitmap> {
        self.load_bitmap(self.sb.i_bitmap_blk, MAX_INUM)
    }

    /// Loads the data block bitmap from disk.
    pub fn load_data_bitmap(&self) -> io::Result<Bitmap> {
        self.load_bitmap(self.sb.d_bitmap_blk, MAX_DNUM)
    }

    /// Persists the inode bitmap.
    pub(crate) fn store_inode_bitmap(&self, bitmap: &Bitmap) -> io::Result<()> {
        self.store_bitmap(self.sb.i_bitmap_blk, bitmap)
    }

    /// Persists the data block bitmap.
    pub(crate) fn store_data_bitmap(&self, bitmap: &Bitmap) -> io::Result<()> {
        self.store_bitmap(self.sb.d_bitmap_blk, bitmap)
    }

    fn load_bitmap(&self, start_blk: u32, bits: usize) -> io::Result<Bitmap> {
        let byte_size = ceil_division(bits, 8);
        let mut bytes = vec![0u8; ceil_division(byte_size, BLOCK_SIZE) * BLOCK_SIZE];
        self.dev.read_blocks(start_blk, &mut bytes)?;
        bytes.truncate(byte_size);
        Ok(Bitmap::from_bytes(bytes))
    }

    fn store_bitmap(&self, start_blk: u32, bitmap: &Bitmap) -> io::Result<()> {
        let mut bytes = bitmap.as_bytes().to_vec();
        bytes.resize(ceil_division(bytes.len(), BLOCK_SIZE) * BLOCK_SIZE, 0);
        self.dev.write_blocks(start_blk, &bytes)
    }

    /// Allocates an inode number and persists the inode bitmap.
    ///
    /// The first free bit is taken, so allocation order is deterministic.
    pub fn alloc_ino(&self) -> io::Result<u16> {
        let mut imap = self.load_inode_bitmap()?;
        let Some(ino) = imap.take_first_free() else {
            return Err(errno(libc::ENOSPC));
        };
        self.store_inode_bitmap(&imap)?;
        debug!("allocated inode {ino}");
        Ok(ino as u16)
    }

    /// Allocates a data block number and persists the data bitmap.
    pub fn alloc_blkno(&self) -> io::Result<u32> {
        let mut dmap = self.load_data_bitmap()?;
        let Some(blkno) = dmap.take_first_free() else {
            return Err(errno(libc::ENOSPC));
        };
        self.store_data_bitmap(&dmap)?;
        debug!("allocated data block {blkno}");
        Ok(blkno as u32)
    }

    /// Releases inode number `ino` and persists the inode bitmap.
    ///
    /// Used to roll back an allocation whose follow-up steps failed.
    pub fn free_ino(&self, ino: u16) -> io::Result<()> {
        let mut imap = self.load_inode_bitmap()?;
        imap.clear(ino as usize);
        self.store_inode_bitmap(&imap)
    }

    /// Reads inode `ino` from the inode region.
    pub fn read_inode(&self, ino: u16) -> io::Result<Inode> {
        let region = self.read_inode_region(ino)?;
        let mut inode = Inode::default();
        let off = ino as usize * size_of::<Inode>();
        reinterpret_mut(&mut inode).copy_from_slice(&region[off..off + size_of::<Inode>()]);
        Ok(inode)
    }

    /// Writes inode `ino` to the inode region.
    ///
    /// The whole region is read, the slot overwritten, and the region written
    /// back; the full record is always transferred.
    pub fn write_inode(&self, ino: u16, inode: &Inode) -> io::Result<()> {
        let mut region = self.read_inode_region(ino)?;
        let off = ino as usize * size_of::<Inode>();
        region[off..off + size_of::<Inode>()].copy_from_slice(reinterpret(inode));
        self.dev.write_blocks(self.sb.i_start_blk, &region)
    }

    fn read_inode_region(&self, ino: u16) -> io::Result<Vec<u8>> {
        if ino as usize >= MAX_INUM {
            return Err(errno(libc::EINVAL));
        }
        let mut region = vec![0u8; self.sb.inode_region_blocks() as usize * BLOCK_SIZE];
        self.dev.read_blocks(self.sb.i_start_blk, &mut region)?;
        Ok(region)
    }

    /// Returns the data block backing file block `idx` of `inode`, or `None`
    /// for a hole.
    pub(crate) fn file_block(&self, inode: &Inode, idx: usize) -> io::Result<Option<u32>> {
        let blkno = if idx < N_DIRECT {
            inode.direct[idx]
        } else {
            let m = idx - N_DIRECT;
            let ptr = inode.indirect[m / PTRS_PER_BLOCK];
            if ptr == 0 {
                return Ok(None);
            }
            let mut table = IndirectBlock::default();
            self.dev.read_block(ptr, reinterpret_mut(&mut table))?;
            table.entries[m % PTRS_PER_BLOCK]
        };
        Ok((blkno != 0).then_some(blkno))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::layout::KIND_FILE;

    fn fresh_volume() -> (tempfile::TempDir, Volume) {
        let dir = tempfile::tempdir().unwrap();
        let volume = Volume::format(&dir.path().join("DISKFILE")).unwrap();
        (dir, volume)
    }

    #[test]
    fn format_then_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("DISKFILE");
        let volume = Volume::format(&path).unwrap();
        let sb = *volume.superblock();
        let imap = volume.load_inode_bitmap().unwrap();
        let dmap = volume.load_data_bitmap().unwrap();
        let root = volume.read_inode(ROOT_INO).unwrap();
        drop(volume);

        let volume = Volume::open(&path).unwrap();
        assert_eq!(*volume.superblock(), sb);
        assert_eq!(volume.load_inode_bitmap().unwrap(), imap);
        assert_eq!(volume.load_data_bitmap().unwrap(), dmap);
        assert_eq!(volume.read_inode(ROOT_INO).unwrap(), root);
    }

    #[test]
    fn open_rejects_unformatted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("DISKFILE");
        std::fs::write(&path, [0u8; BLOCK_SIZE]).unwrap();
        let err = Volume::open(&path).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
    }

    #[test]
    fn allocation_is_deterministic() {
        let (_dir, volume) = fresh_volume();
        // Root already holds inode 0.
        assert_eq!(volume.alloc_ino().unwrap(), 1);
        assert_eq!(volume.alloc_ino().unwrap(), 2);
        // Metadata blocks and the root directory block are pre-marked.
        let first = volume.alloc_blkno().unwrap();
        assert_eq!(first, volume.superblock().d_start_blk + 1);
    }

    #[test]
    fn free_ino_releases_the_number() {
        let (_dir, volume) = fresh_volume();
        let ino = volume.alloc_ino().unwrap();
        volume.free_ino(ino).unwrap();
        assert_eq!(volume.alloc_ino().unwrap(), ino);
    }

    #[test]
    fn inode_roundtrip() {
        let (_dir, volume) = fresh_volume();
        let mut inode = Inode {
            ino: 42,
            valid: 1,
            size: 12345,
            kind: KIND_FILE,
            link: 1,
            mode: crate::layout::FILE_MODE,
            atime: 1000,
            mtime: 2000,
            ..Default::default()
        };
        inode.direct[0] = 37;
        inode.indirect[7] = 99;
        volume.write_inode(42, &inode).unwrap();
        assert_eq!(volume.read_inode(42).unwrap(), inode);
        // Neighboring slots are untouched.
        assert_eq!(volume.read_inode(41).unwrap(), Inode::default());
        assert_eq!(volume.read_inode(43).unwrap(), Inode::default());
    }

    #[test]
    fn inode_bounds_checked() {
        let (_dir, volume) = fresh_volume();
        let err = volume.read_inode(MAX_INUM as u16).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
        let err = volume
            .write_inode(MAX_INUM as u16, &Inode::default())
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
    }

    #[test]
    fn stats_after_format() {
        let (_dir, volume) = fresh_volume();
        let stats = volume.stats().unwrap();
        // The root inode only.
        assert_eq!(stats.used_inodes, 1);
        // Metadata blocks plus the root directory block.
        assert_eq!(
            stats.used_blocks,
            volume.superblock().d_start_blk as usize + 1
        );
    }
}
