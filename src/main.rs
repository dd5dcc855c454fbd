//! The `tfs` tool formats and inspects tiny file system diskfiles.
//!
//! The file system itself is exposed to a host dispatcher through the library
//! crate; this binary only covers the operator surface.

use std::env;
use std::env::ArgsOs;
use std::path::PathBuf;
use std::process::exit;
use tfs::Volume;
use tfs::util::error;

/// Prints the command's usage.
fn print_usage() {
    eprintln!("Usage:");
    eprintln!(" tfs mkfs [-f] <diskfile>");
    eprintln!(" tfs info <diskfile>");
    eprintln!();
    eprintln!("Commands:");
    eprintln!(" mkfs:\tcreates a file system on the diskfile, sizing it to 32 MiB");
    eprintln!(" info:\tprints the superblock and usage counters of a formatted diskfile");
    eprintln!();
    eprintln!("Options:");
    eprintln!(" -f:\toverwrite an existing file system");
    eprintln!(" -h:\tprints usage");
}

/// Command line arguments shared by both subcommands.
#[derive(Default)]
struct Args {
    /// If true, overwrite an existing file system.
    force: bool,
    /// If true, print command line help.
    help: bool,
    /// The path to the diskfile.
    diskfile_path: Option<PathBuf>,
}

fn parse_args(args: ArgsOs) -> Args {
    let mut res: Args = Default::default();
    for arg in args {
        match arg.to_str() {
            Some("-h" | "--help") => res.help = true,
            Some("-f" | "--force") => res.force = true,
            _ => res.diskfile_path = Some(PathBuf::from(arg)),
        }
    }
    res
}

fn mkfs(args: ArgsOs) {
    let args = parse_args(args);
    if args.help {
        print_usage();
        exit(0);
    }
    let path = args
        .diskfile_path
        .unwrap_or_else(|| error("tfs", "specify path to a diskfile"));
    if !args.force && path.exists() && Volume::open(&path).is_ok() {
        error(
            "tfs",
            format_args!(
                "{}: already contains a file system (use -f to overwrite)",
                path.display()
            ),
        );
    }
    Volume::format(&path)
        .unwrap_or_else(|e| error("tfs", format_args!("{}: {e}", path.display())));
}

fn info(args: ArgsOs) {
    let args = parse_args(args);
    if args.help {
        print_usage();
        exit(0);
    }
    let path = args
        .diskfile_path
        .unwrap_or_else(|| error("tfs", "specify path to a diskfile"));
    let volume = Volume::open(&path)
        .unwrap_or_else(|e| error("tfs", format_args!("{}: {e}", path.display())));
    let stats = volume
        .stats()
        .unwrap_or_else(|e| error("tfs", format_args!("{}: {e}", path.display())));

    let sb = volume.superblock();
    println!("magic: {:#x}", sb.magic);
    println!("inode bitmap at block {}", sb.i_bitmap_blk);
    println!("data bitmap at block {}", sb.d_bitmap_blk);
    println!("inode region at block {}", sb.i_start_blk);
    println!("data region at block {}", sb.d_start_blk);
    println!("inodes in use: {}/{}", stats.used_inodes, sb.max_inum);
    println!("blocks in use: {}/{}", stats.used_blocks, sb.max_dnum);
}

fn main() {
    env_logger::init();
    let mut args = env::args_os();
    args.next();
    match args.next().and_then(|s| s.into_string().ok()).as_deref() {
        Some("mkfs") => mkfs(args),
        Some("info") => info(args),
        Some("-h" | "--help") => print_usage(),
        Some(cmd) => error("tfs", format_args!("invalid command `{cmd}`")),
        None => {
            print_usage();
            exit(1);
        }
    }
}
