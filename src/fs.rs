//! Filesystem operations: the upcall surface and the mount lifecycle.
//!
//! [`TinyFs`] owns the volume behind one process-global mutex; every
//! operation acquires it on entry and releases it on every return path, so
//! upcalls are atomic with respect to each other even when the host
//! dispatcher calls from several threads. Failures carry POSIX error codes
//! which the host glue maps to negative errno values.

use crate::bitmap::Bitmap;
use crate::layout::{
    BLOCK_SIZE, DIR_MODE, FILE_MODE, IndirectBlock, Inode, KIND_DIRECTORY, KIND_FILE,
    MAX_FILE_BLOCKS, N_DIRECT, PTRS_PER_BLOCK, ROOT_INO,
};
use crate::util::{ceil_division, errno, get_timestamp, reinterpret, reinterpret_mut};
use crate::volume::{Volume, VolumeStats};
use log::info;
use std::cmp::min;
use std::io;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Attributes of a file or directory, as reported to the host's `stat`.
#[derive(Clone, Copy, Debug)]
pub struct FileAttr {
    /// Mode bits, including the file type.
    pub mode: u32,
    /// Reference count of the inode.
    pub nlink: u32,
    /// Owning user, taken from the calling process.
    pub uid: u32,
    /// Owning group, taken from the calling process.
    pub gid: u32,
    /// Size in bytes.
    pub size: u64,
    /// Size in blocks, rounded up.
    pub blocks: u64,
    /// Timestamp of the last access.
    pub atime: i64,
    /// Timestamp of the last content modification.
    pub mtime: i64,
}

/// A mounted tiny file system.
///
/// Dropping the handle unmounts: the in-memory superblock goes away and the
/// diskfile is closed.
pub struct TinyFs {
    /// The volume, serialized behind the global lock.
    volume: Mutex<Volume>,
}

/// Splits an absolute path into its parent directory and final component.
fn split_path(path: &str) -> io::Result<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    // The root itself has no parent to split off.
    if trimmed.is_empty() {
        return Err(errno(libc::EINVAL));
    }
    let idx = trimmed.rfind('/').ok_or_else(|| errno(libc::EINVAL))?;
    let parent = if idx == 0 { "/" } else { &trimmed[..idx] };
    Ok((parent, &trimmed[idx + 1..]))
}

/// Takes a free block out of `dmap` without persisting it.
fn take_free(dmap: &mut Bitmap) -> io::Result<u32> {
    dmap.take_first_free()
        .map(|blkno| blkno as u32)
        .ok_or_else(|| errno(libc::ENOSPC))
}

impl TinyFs {
    /// Mounts the diskfile at `path`, formatting it first if it does not
    /// exist.
    pub fn mount(path: &Path) -> io::Result<Self> {
        let volume = if path.exists() {
            info!("mounting existing diskfile {}", path.display());
            Volume::open(path)?
        } else {
            Volume::format(path)?
        };
        Ok(Self {
            volume: Mutex::new(volume),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Volume> {
        self.volume.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the volume's usage counters.
    pub fn stats(&self) -> io::Result<VolumeStats> {
        self.lock().stats()
    }

    /// Returns the attributes of the file or directory at `path`.
    ///
    /// The access time is refreshed and written back.
    pub fn getattr(&self, path: &str) -> io::Result<FileAttr> {
        let volume = self.lock();
        let mut inode = volume.resolve_path(path, ROOT_INO)?;
        inode.atime = get_timestamp();
        volume.write_inode(inode.ino, &inode)?;
        Ok(FileAttr {
            mode: if inode.is_directory() {
                DIR_MODE
            } else {
                FILE_MODE
            },
            nlink: inode.link,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            size: inode.size as u64,
            blocks: ceil_division(inode.size as usize, BLOCK_SIZE) as u64,
            atime: inode.atime,
            mtime: inode.mtime,
        })
    }

    /// Checks that `path` names a directory.
    pub fn opendir(&self, path: &str) -> io::Result<()> {
        let volume = self.lock();
        let inode = volume.resolve_path(path, ROOT_INO)?;
        if !inode.is_directory() {
            return Err(errno(libc::ENOTDIR));
        }
        Ok(())
    }

    /// Lists the directory at `path`, invoking `filler` once per entry.
    ///
    /// The `"."` and `".."` entries are skipped. The directory's access time
    /// is refreshed.
    pub fn readdir(&self, path: &str, mut filler: impl FnMut(&str)) -> io::Result<()> {
        let volume = self.lock();
        let mut inode = volume.resolve_path(path, ROOT_INO)?;
        let _ = volume.scan_dir(&inode, |_, _, entry| {
            if entry.valid != 0 && !entry.name_matches(".") && !entry.name_matches("..") {
                if let Some(name) = entry.name() {
                    filler(name);
                }
            }
            None::<()>
        })?;
        inode.atime = get_timestamp();
        volume.write_inode(inode.ino, &inode)
    }

    /// Creates the directory at `path`.
    pub fn mkdir(&self, path: &str, _mode: u32) -> io::Result<()> {
        self.create_node(path, KIND_DIRECTORY)
    }

    /// Creates an empty regular file at `path`. No data block is allocated.
    pub fn create(&self, path: &str, _mode: u32) -> io::Result<()> {
        self.create_node(path, KIND_FILE)
    }

    fn create_node(&self, path: &str, kind: u32) -> io::Result<()> {
        let volume = self.lock();
        let (parent_path, name) = split_path(path)?;
        let parent = volume.resolve_path(parent_path, ROOT_INO)?;
        let ino = volume.alloc_ino()?;
        if let Err(e) = volume.dir_add(parent.ino, ino, name) {
            // Return the inode number taken above.
            let _ = volume.free_ino(ino);
            return Err(e);
        }
        let now = get_timestamp();
        let inode = Inode {
            ino,
            valid: 1,
            kind,
            link: if kind == KIND_FILE { 1 } else { 0 },
            mode: if kind == KIND_FILE {
                FILE_MODE
            } else {
                DIR_MODE
            },
            atime: now,
            mtime: now,
            ..Default::default()
        };
        volume.write_inode(ino, &inode)?;
        if kind == KIND_DIRECTORY {
            volume.init_directory(ino, parent.ino)?;
        }
        Ok(())
    }

    /// Checks that `path` names a regular file.
    pub fn open(&self, path: &str) -> io::Result<()> {
        let volume = self.lock();
        let inode = volume.resolve_path(path, ROOT_INO)?;
        if !inode.is_file() {
            return Err(errno(libc::EISDIR));
        }
        Ok(())
    }

    /// Reads from the file at `path` starting at byte `offset`, filling as
    /// much of `buf` as the addressable block range covers.
    ///
    /// Holes read as zeroes. Returns the number of bytes placed in `buf`.
    pub fn read(&self, path: &str, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let volume = self.lock();
        let inode = volume.resolve_path(path, ROOT_INO)?;
        if !inode.is_file() {
            return Err(errno(libc::EISDIR));
        }
        let start = offset / BLOCK_SIZE as u64;
        let end = min(
            (MAX_FILE_BLOCKS - 1) as u64,
            (offset + buf.len() as u64 - 1) / BLOCK_SIZE as u64,
        );
        if start > end {
            return Ok(0);
        }

        let mut pos = 0;
        let mut block_off = (offset % BLOCK_SIZE as u64) as usize;
        let mut block = [0u8; BLOCK_SIZE];
        for idx in start..=end {
            let n = min(buf.len() - pos, BLOCK_SIZE - block_off);
            match volume.file_block(&inode, idx as usize)? {
                Some(blkno) => {
                    volume.dev.read_block(blkno, &mut block)?;
                    buf[pos..pos + n].copy_from_slice(&block[block_off..block_off + n]);
                }
                // A hole reads as zeroes.
                None => buf[pos..pos + n].fill(0),
            }
            pos += n;
            block_off = 0;
        }
        Ok(pos)
    }

    /// Writes `buf` to the file at `path` starting at byte `offset`,
    /// allocating every missing block in the covered range first.
    ///
    /// The file grows in whole blocks; indirect table blocks are zeroed on
    /// disk before being linked. Returns the number of bytes written, `0`
    /// when `offset` lies beyond the addressable range.
    pub fn write(&self, path: &str, buf: &[u8], offset: u64) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let volume = self.lock();
        let mut inode = volume.resolve_path(path, ROOT_INO)?;
        if !inode.is_file() {
            return Err(errno(libc::EISDIR));
        }
        let start = offset / BLOCK_SIZE as u64;
        let end = min(
            (MAX_FILE_BLOCKS - 1) as u64,
            (offset + buf.len() as u64 - 1) / BLOCK_SIZE as u64,
        );
        if start > end {
            return Ok(0);
        }

        // First pass: allocate every missing block in the range, batching
        // bitmap changes so they persist once.
        let mut dmap = volume.load_data_bitmap()?;
        let zero = [0u8; BLOCK_SIZE];
        let mut grown = 0u32;
        let mut dirty = false;
        for idx in start..=end {
            let idx = idx as usize;
            if idx < N_DIRECT {
                if inode.direct[idx] == 0 {
                    let blkno = take_free(&mut dmap)?;
                    volume.dev.write_block(blkno, &zero)?;
                    inode.direct[idx] = blkno;
                    grown += BLOCK_SIZE as u32;
                    dirty = true;
                }
            } else {
                let m = idx - N_DIRECT;
                let (ptr_idx, slot) = (m / PTRS_PER_BLOCK, m % PTRS_PER_BLOCK);
                if inode.indirect[ptr_idx] == 0 {
                    let blkno = take_free(&mut dmap)?;
                    // The table must hold no stale pointers before it is
                    // linked from the inode.
                    volume.dev.write_block(blkno, &zero)?;
                    inode.indirect[ptr_idx] = blkno;
                    dirty = true;
                }
                let mut table = IndirectBlock::default();
                volume
                    .dev
                    .read_block(inode.indirect[ptr_idx], reinterpret_mut(&mut table))?;
                if table.entries[slot] == 0 {
                    let blkno = take_free(&mut dmap)?;
                    volume.dev.write_block(blkno, &zero)?;
                    table.entries[slot] = blkno;
                    volume
                        .dev
                        .write_block(inode.indirect[ptr_idx], reinterpret(&table))?;
                    grown += BLOCK_SIZE as u32;
                    dirty = true;
                }
            }
        }
        if dirty {
            inode.size += grown;
            volume.write_inode(inode.ino, &inode)?;
            volume.store_data_bitmap(&dmap)?;
        }

        // Second pass: read-modify-write each covered block.
        let mut pos = 0;
        let mut block_off = (offset % BLOCK_SIZE as u64) as usize;
        let mut block = [0u8; BLOCK_SIZE];
        for idx in start..=end {
            let n = min(buf.len() - pos, BLOCK_SIZE - block_off);
            let blkno = volume
                .file_block(&inode, idx as usize)?
                .ok_or_else(|| errno(libc::EIO))?;
            volume.dev.read_block(blkno, &mut block)?;
            block[block_off..block_off + n].copy_from_slice(&buf[pos..pos + n]);
            volume.dev.write_block(blkno, &block)?;
            pos += n;
            block_off = 0;
        }

        inode.mtime = get_timestamp();
        volume.write_inode(inode.ino, &inode)?;
        Ok(pos)
    }

    /// Removes the regular file at `path` and frees its storage.
    pub fn unlink(&self, path: &str) -> io::Result<()> {
        self.remove_path(path, false)
    }

    /// Removes the directory at `path` and everything beneath it.
    pub fn rmdir(&self, path: &str) -> io::Result<()> {
        self.remove_path(path, true)
    }

    fn remove_path(&self, path: &str, expect_dir: bool) -> io::Result<()> {
        let volume = self.lock();
        let (parent_path, name) = split_path(path)?;
        let parent = volume.resolve_path(parent_path, ROOT_INO)?;
        let slot = volume
            .dir_locate(&parent, name)?
            .ok_or_else(|| errno(libc::ENOENT))?;
        let target = volume.read_inode(slot.entry.ino)?;
        if expect_dir && !target.is_directory() {
            return Err(errno(libc::ENOTDIR));
        }
        if !expect_dir && target.is_directory() {
            return Err(errno(libc::EISDIR));
        }
        if target.is_directory() {
            volume.remove_directory(&target)?;
        } else {
            volume.remove_file(&target)?;
        }
        volume.clear_dir_slot(&parent, slot.blk_idx, slot.slot)
    }

    /// Releases a directory handle. Nothing to do in this design.
    pub fn releasedir(&self, _path: &str) -> io::Result<()> {
        Ok(())
    }

    /// Truncation is not supported; the call succeeds without effect.
    pub fn truncate(&self, _path: &str, _size: u64) -> io::Result<()> {
        Ok(())
    }

    /// Flushes a file handle. All writes are synchronous, nothing to do.
    pub fn flush(&self, _path: &str) -> io::Result<()> {
        Ok(())
    }

    /// Sets file times. Not supported; the call succeeds without effect.
    pub fn utimens(&self, _path: &str, _atime: i64, _mtime: i64) -> io::Result<()> {
        Ok(())
    }

    /// Releases a file handle. Nothing to do in this design.
    pub fn release(&self, _path: &str) -> io::Result<()> {
        Ok(())
    }
}
