//! Tiny user-space file system stored inside a single diskfile.
//!
//! The whole file system lives in one fixed-size host file split into
//! 4096-byte blocks: a superblock, two allocation bitmaps, an inode table and
//! a data region. Files address their data through sixteen direct and eight
//! single-indirect block pointers; directories are flat arrays of fixed-size
//! entry slots over direct pointers only.
//!
//! [`TinyFs`] mounts a diskfile (formatting it on first use) and exposes the
//! path-based callbacks a host filesystem dispatcher needs: `getattr`,
//! `readdir`, `mkdir`, `rmdir`, `create`, `open`, `read`, `write`, `unlink`
//! and their no-op companions. All operations serialize on one global lock.
//!
//! ```no_run
//! use std::path::Path;
//! use tfs::TinyFs;
//!
//! # fn main() -> std::io::Result<()> {
//! let fs = TinyFs::mount(Path::new("DISKFILE"))?;
//! fs.mkdir("/docs", 0o755)?;
//! fs.create("/docs/note", 0o644)?;
//! fs.write("/docs/note", b"hello", 0)?;
//! # Ok(())
//! # }
//! ```

pub mod bitmap;
pub mod block;
pub mod dir;
pub mod fs;
pub mod layout;
pub mod remove;
pub mod util;
pub mod volume;

pub use fs::{FileAttr, TinyFs};
pub use volume::{Volume, VolumeStats};
