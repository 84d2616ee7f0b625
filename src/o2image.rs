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

//! The `o2image` command captures the metadata of an OCFS2 volume into an
//! image file, packed by default or raw (sparse) with `-r`.

use crate::error;
use ocfs2::fs::FsHandle;
use ocfs2::fs::OpenFlags;
use ocfs2::image;
use std::env::ArgsOs;
use std::fs::OpenOptions;
use std::path::PathBuf;

/// Structure storing command line arguments.
#[derive(Default)]
struct Args {
    /// Write a raw, sparse image instead of a packed one.
    raw: bool,
    /// Print the header of an existing image instead of creating one.
    inspect: bool,
    /// If true, print command line help.
    help: bool,
    /// The device to read and the image file to write.
    paths: Vec<PathBuf>,
}

fn parse_args(args: ArgsOs) -> Args {
    let mut res: Args = Default::default();
    for arg in args {
        match arg.to_str() {
            Some("-r") => res.raw = true,
            Some("-I") => res.inspect = true,
            Some("-h" | "--help") => res.help = true,
            _ => res.paths.push(PathBuf::from(arg)),
        }
    }
    res
}

fn usage() -> ! {
    eprintln!("Usage: o2image [-rI] <device> <image_file>");
    std::process::exit(1);
}

pub fn main(args: ArgsOs) {
    let args = parse_args(args);
    if args.help {
        usage();
    }

    if args.inspect {
        let [image_path] = args.paths.as_slice() else {
            usage();
        };
        let mut file = std::fs::File::open(image_path).unwrap_or_else(|e| {
            error("o2image", format_args!("{}: {e}", image_path.display()));
        });
        let hdr = image::read_image_header(&mut file).unwrap_or_else(|e| {
            error("o2image", format_args!("{}: {e}", image_path.display()));
        });
        println!(
            "image of a {} byte filesystem ({} blocks of {}), {} metadata blocks",
            { hdr.hdr_fsblkcnt } * { hdr.hdr_fsblksz },
            { hdr.hdr_fsblkcnt },
            { hdr.hdr_fsblksz },
            { hdr.hdr_imgblkcnt },
        );
        return;
    }

    let [device, image_path] = args.paths.as_slice() else {
        usage();
    };

    let fs = FsHandle::open(device, OpenFlags::empty(), 0, 0).unwrap_or_else(|e| {
        error("o2image", format_args!("{}: {e}", device.display()));
    });

    let state = image::scan_metadata(&fs).unwrap_or_else(|e| {
        error("o2image", format_args!("while scanning metadata: {e}"));
    });

    let mut out = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(image_path)
        .unwrap_or_else(|e| {
            error("o2image", format_args!("{}: {e}", image_path.display()));
        });

    let res = if args.raw {
        image::write_raw_image(&fs, &state, &mut out)
    } else {
        image::write_packed_image(&fs, &state, &mut out)
    };
    res.unwrap_or_else(|e| {
        error("o2image", format_args!("while writing the image: {e}"));
    });

    println!(
        "captured {} of {} blocks from {}",
        state.image_blockcount,
        fs.blocks,
        device.display()
    );
}
