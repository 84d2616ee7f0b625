/*
 * Copyright 2025 the o2tools authors
 *
 * This file is part of o2tools.
 *
 * o2tools is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * o2tools is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * o2tools. If not, see <https://www.gnu.org/licenses/>.
 */

//! The `o2info` command prints a summary of an OCFS2 volume or metadata
//! image.

use crate::error;
use ocfs2::fs::FsHandle;
use ocfs2::fs::OpenFlags;
use std::env::ArgsOs;
use std::path::PathBuf;

/// Structure storing command line arguments.
#[derive(Default)]
struct Args {
    /// The path is a metadata image, not a device.
    image: bool,
    /// If true, print command line help.
    help: bool,
    /// The path to the device or image.
    path: Option<PathBuf>,
}

fn parse_args(args: ArgsOs) -> Args {
    let mut res: Args = Default::default();
    for arg in args {
        match arg.to_str() {
            Some("-i" | "--image") => res.image = true,
            Some("-h" | "--help") => res.help = true,
            _ => res.path = Some(PathBuf::from(arg)),
        }
    }
    res
}

pub fn main(args: ArgsOs) {
    let args = parse_args(args);
    if args.help || args.path.is_none() {
        eprintln!("Usage: o2info [-i] <device|image>");
        std::process::exit(1);
    }
    let path = args.path.unwrap();

    let mut flags = OpenFlags::empty();
    if args.image {
        flags |= OpenFlags::IMAGE_FILE;
    }
    let fs = FsHandle::open(&path, flags, 0, 0).unwrap_or_else(|e| {
        error("o2info", format_args!("{}: {e}", path.display()));
    });

    println!("OCFS2 filesystem on \"{}\":", path.display());
    println!("\tuuid = {}", fs.uuid);
    fs.with_super(|sb| {
        let label = sb.s_label;
        let end = label.iter().position(|b| *b == 0).unwrap_or(label.len());
        println!("\tlabel = {}", String::from_utf8_lossy(&label[..end]));
        println!("\tfeatures = 0x{:x} / 0x{:x} / 0x{:x}",
            { sb.s_feature_compat }, { sb.s_feature_incompat }, { sb.s_feature_ro_compat });
        println!("\tmax slots = {}", { sb.s_max_slots });
    });
    println!("\tblocksize = {}", fs.blocksize);
    println!("\tclustersize = {}", fs.clustersize);
    println!("\tclusters = {}", fs.clusters);
    println!("\tblocks = {}", fs.blocks);
    println!("\troot_blkno = {}", fs.root_blkno);
    println!("\tsystem_dir_blkno = {}", fs.sysdir_blkno);
}
