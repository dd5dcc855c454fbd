//! Directory entries and path resolution.
//!
//! A directory's storage is a flat vector of fixed-size entry slots spread
//! over its direct block pointers; indirect pointers are never used for
//! directories. Entries are looked up by exact byte comparison of the name;
//! removal zeroes a slot in place and never compacts.

use crate::bitmap::Bitmap;
use crate::layout::{BLOCK_SIZE, DIRENTS_PER_BLOCK, DirEntry, Inode, N_DIRECT, NAME_MAX};
use crate::util::{ceil_division, errno, reinterpret, reinterpret_mut};
use crate::volume::Volume;
use std::io;
use std::mem::size_of;

/// Location of a directory entry: which direct block and which slot inside it.
#[derive(Clone, Copy, Debug)]
pub(crate) struct DirSlot {
    /// Index into the directory's direct pointers.
    pub blk_idx: usize,
    /// Slot index within the block.
    pub slot: usize,
    /// The entry itself.
    pub entry: DirEntry,
}

/// Decodes the directory entry at `slot` of a directory data block.
fn read_dirent(buf: &[u8], slot: usize) -> DirEntry {
    let mut entry = DirEntry::default();
    let off = slot * size_of::<DirEntry>();
    reinterpret_mut(&mut entry).copy_from_slice(&buf[off..off + size_of::<DirEntry>()]);
    entry
}

/// Encodes `entry` at `slot` of a directory data block.
fn write_dirent(buf: &mut [u8], slot: usize, entry: &DirEntry) {
    let off = slot * size_of::<DirEntry>();
    buf[off..off + size_of::<DirEntry>()].copy_from_slice(reinterpret(entry));
}

impl Volume {
    /// Looks up `name` in the directory with inode number `ino`.
    pub fn dir_find(&self, ino: u16, name: &str) -> io::Result<DirEntry> {
        let dir = self.read_inode(ino)?;
        self.dir_locate(&dir, name)?
            .map(|slot| slot.entry)
            .ok_or_else(|| errno(libc::ENOENT))
    }

    /// Scans `dir` for the entry named `name` and returns its location.
    pub(crate) fn dir_locate(&self, dir: &Inode, name: &str) -> io::Result<Option<DirSlot>> {
        self.scan_dir(dir, |blk_idx, slot, entry| {
            (entry.valid != 0 && entry.name_matches(name)).then(|| DirSlot {
                blk_idx,
                slot,
                entry: *entry,
            })
        })
    }

    /// Calls `visit` on every entry slot of `dir` in storage order, stopping
    /// early when it returns `Some`.
    ///
    /// Free slots (`valid == 0`) are passed through so callers can reuse them.
    pub(crate) fn scan_dir<T>(
        &self,
        dir: &Inode,
        mut visit: impl FnMut(usize, usize, &DirEntry) -> Option<T>,
    ) -> io::Result<Option<T>> {
        let block_count = ceil_division(dir.size as usize, BLOCK_SIZE);
        if !dir.is_valid() || block_count > N_DIRECT {
            return Err(errno(libc::EINVAL));
        }
        if !dir.is_directory() {
            return Err(errno(libc::ENOTDIR));
        }
        let mut remaining = dir.size as usize;
        let mut buf = [0u8; BLOCK_SIZE];
        for (blk_idx, &blkno) in dir.direct[..block_count].iter().enumerate() {
            self.dev.read_block(blkno, &mut buf)?;
            for slot in 0..DIRENTS_PER_BLOCK {
                if remaining < size_of::<DirEntry>() {
                    return Ok(None);
                }
                let entry = read_dirent(&buf, slot);
                if let Some(found) = visit(blk_idx, slot, &entry) {
                    return Ok(Some(found));
                }
                remaining -= size_of::<DirEntry>();
            }
        }
        Ok(None)
    }

    /// Inserts an entry binding `name` to `child_ino` in the directory with
    /// inode number `dir_ino`.
    ///
    /// The first free slot is reused; a new direct block is allocated when
    /// every slot is taken. The directory's `link` counts the insertions.
    pub fn dir_add(&self, dir_ino: u16, child_ino: u16, name: &str) -> io::Result<()> {
        if name.is_empty() {
            return Err(errno(libc::EINVAL));
        }
        if name.len() >= NAME_MAX {
            return Err(errno(libc::ENAMETOOLONG));
        }
        let mut dir = self.read_inode(dir_ino)?;
        let block_count = ceil_division(dir.size as usize, BLOCK_SIZE);

        // One pass finds both a duplicate and the first reusable slot.
        let mut free_slot: Option<(usize, usize)> = None;
        let duplicate = self.scan_dir(&dir, |blk_idx, slot, entry| {
            if entry.valid != 0 {
                return entry.name_matches(name).then_some(());
            }
            if free_slot.is_none() {
                free_slot = Some((blk_idx, slot));
            }
            None
        })?;
        if duplicate.is_some() {
            return Err(errno(libc::EEXIST));
        }

        let mut buf = [0u8; BLOCK_SIZE];
        let mut new_block: Option<Bitmap> = None;
        let (blk_idx, slot) = match free_slot {
            Some((blk_idx, slot)) => {
                self.dev.read_block(dir.direct[blk_idx], &mut buf)?;
                (blk_idx, slot)
            }
            None => {
                if block_count >= N_DIRECT {
                    return Err(errno(libc::ENOSPC));
                }
                let mut dmap = self.load_data_bitmap()?;
                let Some(blkno) = dmap.take_first_free() else {
                    return Err(errno(libc::ENOSPC));
                };
                buf.fill(0);
                dir.size += BLOCK_SIZE as u32;
                dir.direct[block_count] = blkno as u32;
                new_block = Some(dmap);
                (block_count, 0)
            }
        };

        dir.link += 1;
        self.write_inode(dir_ino, &dir)?;
        write_dirent(&mut buf, slot, &DirEntry::new(child_ino, name));
        let result = self
            .dev
            .write_block(dir.direct[blk_idx], &buf)
            .and_then(|()| match &new_block {
                Some(dmap) => self.store_data_bitmap(dmap),
                None => Ok(()),
            });
        if let Err(e) = result {
            // Best-effort rollback of the inode update; the block itself was
            // never marked allocated on disk.
            dir.link -= 1;
            if new_block.is_some() {
                dir.size -= BLOCK_SIZE as u32;
                dir.direct[blk_idx] = 0;
            }
            let _ = self.write_inode(dir_ino, &dir);
            return Err(e);
        }
        Ok(())
    }

    /// Zeroes the entry slot at the given location, leaving it reusable.
    ///
    /// The referenced inode is not touched; reclaiming its storage is the
    /// caller's responsibility.
    pub(crate) fn clear_dir_slot(&self, dir: &Inode, blk_idx: usize, slot: usize) -> io::Result<()> {
        let mut buf = [0u8; BLOCK_SIZE];
        self.dev.read_block(dir.direct[blk_idx], &mut buf)?;
        let off = slot * size_of::<DirEntry>();
        buf[off..off + size_of::<DirEntry>()].fill(0);
        self.dev.write_block(dir.direct[blk_idx], &buf)
    }

    /// Plants the `"."` and `".."` entries of a freshly created directory.
    ///
    /// Allocates the directory's first data block and sets its size; `link`
    /// is left untouched since it only counts entries added through
    /// [`Volume::dir_add`]. For the root directory, `parent_ino` is the root
    /// itself.
    pub fn init_directory(&self, ino: u16, parent_ino: u16) -> io::Result<()> {
        let mut inode = self.read_inode(ino)?;
        let mut dmap = self.load_data_bitmap()?;
        let Some(blkno) = dmap.take_first_free() else {
            return Err(errno(libc::ENOSPC));
        };
        let mut buf = [0u8; BLOCK_SIZE];
        write_dirent(&mut buf, 0, &DirEntry::new(ino, "."));
        write_dirent(&mut buf, 1, &DirEntry::new(parent_ino, ".."));
        self.dev.write_block(blkno as u32, &buf)?;
        inode.direct[0] = blkno as u32;
        inode.size = BLOCK_SIZE as u32;
        self.write_inode(ino, &inode)?;
        self.store_data_bitmap(&dmap)
    }

    /// Walks the absolute path `path` from the directory `anchor` down to its
    /// target and returns the target's inode.
    ///
    /// Consecutive and trailing slashes are tolerated; `"/"` resolves to the
    /// anchor itself. `"."` and `".."` resolve through the literal entries
    /// planted at directory creation.
    pub fn resolve_path(&self, path: &str, anchor: u16) -> io::Result<Inode> {
        if !path.starts_with('/') {
            return Err(errno(libc::EINVAL));
        }
        let mut cur = anchor;
        for component in path.split('/') {
            if component.is_empty() {
                continue;
            }
            cur = self.dir_find(cur, component)?.ino;
        }
        self.read_inode(cur)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::layout::{KIND_FILE, ROOT_INO};
    use crate::volume::Volume;

    fn fresh_volume() -> (tempfile::TempDir, Volume) {
        let dir = tempfile::tempdir().unwrap();
        let volume = Volume::format(&dir.path().join("DISKFILE")).unwrap();
        (dir, volume)
    }

    /// Allocates an inode and registers `name` for it under the root.
    fn add_child(volume: &Volume, name: &str, kind: u32) -> u16 {
        let ino = volume.alloc_ino().unwrap();
        volume.dir_add(ROOT_INO, ino, name).unwrap();
        let inode = Inode {
            ino,
            valid: 1,
            kind,
            ..Default::default()
        };
        volume.write_inode(ino, &inode).unwrap();
        ino
    }

    #[test]
    fn root_has_dot_entries() {
        let (_dir, volume) = fresh_volume();
        let dot = volume.dir_find(ROOT_INO, ".").unwrap();
        assert_eq!(dot.ino, ROOT_INO);
        let dotdot = volume.dir_find(ROOT_INO, "..").unwrap();
        assert_eq!(dotdot.ino, ROOT_INO);
    }

    #[test]
    fn add_and_find() {
        let (_dir, volume) = fresh_volume();
        let ino = add_child(&volume, "hello", KIND_FILE);
        let entry = volume.dir_find(ROOT_INO, "hello").unwrap();
        assert_eq!(entry.ino, ino);
        assert_eq!(entry.name(), Some("hello"));

        let err = volume.dir_find(ROOT_INO, "world").unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }

    #[test]
    fn duplicate_name_rejected() {
        let (_dir, volume) = fresh_volume();
        add_child(&volume, "twice", KIND_FILE);
        let ino = volume.alloc_ino().unwrap();
        let err = volume.dir_add(ROOT_INO, ino, "twice").unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EEXIST));
    }

    #[test]
    fn name_length_enforced() {
        let (_dir, volume) = fresh_volume();
        let long = "x".repeat(NAME_MAX);
        let err = volume.dir_add(ROOT_INO, 1, &long).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENAMETOOLONG));
        // One byte shorter leaves room for the terminator.
        let fits = "x".repeat(NAME_MAX - 1);
        volume.dir_add(ROOT_INO, 1, &fits).unwrap();
        assert!(volume.dir_find(ROOT_INO, &fits).is_ok());
    }

    #[test]
    fn link_counts_insertions() {
        let (_dir, volume) = fresh_volume();
        assert_eq!(volume.read_inode(ROOT_INO).unwrap().link, 0);
        add_child(&volume, "a", KIND_FILE);
        add_child(&volume, "b", KIND_FILE);
        assert_eq!(volume.read_inode(ROOT_INO).unwrap().link, 2);
    }

    #[test]
    fn cleared_slot_is_reused() {
        let (_dir, volume) = fresh_volume();
        add_child(&volume, "victim", KIND_FILE);
        let root = volume.read_inode(ROOT_INO).unwrap();
        let slot = volume.dir_locate(&root, "victim").unwrap().unwrap();
        volume.clear_dir_slot(&root, slot.blk_idx, slot.slot).unwrap();
        assert!(volume.dir_find(ROOT_INO, "victim").is_err());

        // The next insertion lands in the zeroed slot, not a new one.
        let ino = volume.alloc_ino().unwrap();
        volume.dir_add(ROOT_INO, ino, "heir").unwrap();
        let root = volume.read_inode(ROOT_INO).unwrap();
        let reused = volume.dir_locate(&root, "heir").unwrap().unwrap();
        assert_eq!((reused.blk_idx, reused.slot), (slot.blk_idx, slot.slot));
    }

    #[test]
    fn directory_fills_up() {
        let (_dir, volume) = fresh_volume();
        // Root already holds "." and "..".
        let capacity = N_DIRECT * DIRENTS_PER_BLOCK - 2;
        for i in 0..capacity {
            volume.dir_add(ROOT_INO, 1, &format!("f{i}")).unwrap();
        }
        let err = volume.dir_add(ROOT_INO, 1, "overflow").unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOSPC));
    }

    #[test]
    fn growth_is_block_at_a_time() {
        let (_dir, volume) = fresh_volume();
        let before = volume.read_inode(ROOT_INO).unwrap();
        assert_eq!(before.size as usize, BLOCK_SIZE);
        // Filling the first block's remaining slots does not grow the
        // directory; the next insertion does.
        for i in 0..DIRENTS_PER_BLOCK - 2 {
            volume.dir_add(ROOT_INO, 1, &format!("f{i}")).unwrap();
        }
        assert_eq!(volume.read_inode(ROOT_INO).unwrap().size as usize, BLOCK_SIZE);
        volume.dir_add(ROOT_INO, 1, "straw").unwrap();
        let after = volume.read_inode(ROOT_INO).unwrap();
        assert_eq!(after.size as usize, 2 * BLOCK_SIZE);
        assert_ne!(after.direct[1], 0);
    }

    #[test]
    fn resolve_walks_components() {
        let (_dir, volume) = fresh_volume();
        let a = add_child(&volume, "a", crate::layout::KIND_DIRECTORY);
        volume.init_directory(a, ROOT_INO).unwrap();
        let f = volume.alloc_ino().unwrap();
        volume.dir_add(a, f, "f").unwrap();
        let inode = Inode {
            ino: f,
            valid: 1,
            kind: KIND_FILE,
            ..Default::default()
        };
        volume.write_inode(f, &inode).unwrap();

        assert_eq!(volume.resolve_path("/", ROOT_INO).unwrap().ino, ROOT_INO);
        assert_eq!(volume.resolve_path("/a", ROOT_INO).unwrap().ino, a);
        assert_eq!(volume.resolve_path("/a/f", ROOT_INO).unwrap().ino, f);
        // Repeated and trailing slashes are tolerated.
        assert_eq!(volume.resolve_path("//a///f", ROOT_INO).unwrap().ino, f);
        assert_eq!(volume.resolve_path("/a/", ROOT_INO).unwrap().ino, a);
        // Dot entries resolve like any other name.
        assert_eq!(volume.resolve_path("/a/..", ROOT_INO).unwrap().ino, ROOT_INO);
        assert_eq!(volume.resolve_path("/a/.", ROOT_INO).unwrap().ino, a);

        let err = volume.resolve_path("/missing", ROOT_INO).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
        let err = volume.resolve_path("relative", ROOT_INO).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
    }

    #[test]
    fn resolve_through_file_fails() {
        let (_dir, volume) = fresh_volume();
        add_child(&volume, "f", KIND_FILE);
        let err = volume.resolve_path("/f/x", ROOT_INO).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOTDIR));
    }
}
