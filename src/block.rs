//! Emulated block device backed by a single host file.
//!
//! The device only knows how to transfer whole blocks at block-aligned
//! offsets. Reads past the end of the diskfile succeed and yield zeroes, so a
//! hole behaves like a block of zeroes; writes extend the file implicitly,
//! although the diskfile is pre-sized at creation.

use crate::layout::{BLOCK_SIZE, DISK_SIZE};
use std::fs::{File, OpenOptions};
use std::io;
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;
use std::path::Path;

/// Fixed-size block device emulated on top of a regular file.
#[derive(Debug)]
pub struct BlockDevice {
    /// The diskfile.
    file: File,
}

impl BlockDevice {
    /// Creates the diskfile at `path` if needed and sizes it to [`DISK_SIZE`].
    pub fn init(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(DISK_SIZE)?;
        Ok(Self { file })
    }

    /// Opens an existing diskfile read/write.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }

    /// Reads block `blk` into `buf`.
    ///
    /// `buf` must be one block long. A short read (past the end of the
    /// diskfile) zero-fills the unread tail and reports success.
    pub fn read_block(&self, blk: u32, buf: &mut [u8]) -> io::Result<()> {
        debug_assert_eq!(buf.len(), BLOCK_SIZE);
        let mut off = blk as u64 * BLOCK_SIZE as u64;
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read_at(&mut buf[filled..], off) {
                Ok(0) => break,
                Ok(n) => {
                    filled += n;
                    off += n as u64;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        buf[filled..].fill(0);
        Ok(())
    }

    /// Writes `buf` to block `blk`.
    ///
    /// `buf` must be one block long.
    pub fn write_block(&self, blk: u32, buf: &[u8]) -> io::Result<()> {
        debug_assert_eq!(buf.len(), BLOCK_SIZE);
        self.file.write_all_at(buf, blk as u64 * BLOCK_SIZE as u64)
    }

    /// Reads consecutive blocks starting at `blk` until `buf` is filled.
    ///
    /// `buf` must be a multiple of one block long. Fails on the first failing
    /// block transfer.
    pub fn read_blocks(&self, blk: u32, buf: &mut [u8]) -> io::Result<()> {
        debug_assert_eq!(buf.len() % BLOCK_SIZE, 0);
        for (i, chunk) in buf.chunks_mut(BLOCK_SIZE).enumerate() {
            self.read_block(blk + i as u32, chunk)?;
        }
        Ok(())
    }

    /// Writes `buf` to consecutive blocks starting at `blk`.
    ///
    /// `buf` must be a multiple of one block long. Fails on the first failing
    /// block transfer.
    pub fn write_blocks(&self, blk: u32, buf: &[u8]) -> io::Result<()> {
        debug_assert_eq!(buf.len() % BLOCK_SIZE, 0);
        for (i, chunk) in buf.chunks(BLOCK_SIZE).enumerate() {
            self.write_block(blk + i as u32, chunk)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;

    #[test]
    fn init_sizes_diskfile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("DISKFILE");
        let _dev = BlockDevice::init(&path).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), DISK_SIZE);
    }

    #[test]
    fn block_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let dev = BlockDevice::init(&dir.path().join("DISKFILE")).unwrap();

        let mut src = [0u8; BLOCK_SIZE];
        for (i, b) in src.iter_mut().enumerate() {
            *b = i as u8;
        }
        dev.write_block(3, &src).unwrap();

        let mut dst = [0xffu8; BLOCK_SIZE];
        dev.read_block(3, &mut dst).unwrap();
        assert_eq!(src, dst);
    }

    #[test]
    fn short_read_zero_fills() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("DISKFILE");
        fs::write(&path, [0xaa; 100]).unwrap();
        let dev = BlockDevice::open(&path).unwrap();

        let mut buf = [0xffu8; BLOCK_SIZE];
        dev.read_block(0, &mut buf).unwrap();
        assert_eq!(&buf[..100], &[0xaa; 100]);
        assert!(buf[100..].iter().all(|&b| b == 0));

        // Entirely past the end of the file.
        let mut buf = [0xffu8; BLOCK_SIZE];
        dev.read_block(8, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn multi_block_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let dev = BlockDevice::init(&dir.path().join("DISKFILE")).unwrap();

        let mut src = vec![0u8; 3 * BLOCK_SIZE];
        for (i, b) in src.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        dev.write_blocks(5, &src).unwrap();

        let mut dst = vec![0u8; 3 * BLOCK_SIZE];
        dev.read_blocks(5, &mut dst).unwrap();
        assert_eq!(src, dst);

        // The middle block is addressable on its own.
        let mut one = [0u8; BLOCK_SIZE];
        dev.read_block(6, &mut one).unwrap();
        assert_eq!(&one[..], &src[BLOCK_SIZE..2 * BLOCK_SIZE]);
    }
}
