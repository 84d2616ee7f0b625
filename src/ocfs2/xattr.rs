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

//! Extended attribute blocks.
//!
//! Attributes live in three containers sharing one header layout: the
//! inline area at the tail of an inode, a separate xattr block, or — once
//! a block overflows — 4 KiB hash-keyed buckets mapped by an extent tree
//! rooted in the block.

use crate::byteorder::cpu_is_little_endian;
use crate::byteorder::swap_barrier;
use crate::error::Ocfs2Error;
use crate::extent;
use crate::fs::FsHandle;
use crate::ondisk::*;
use crate::util::cast_at;
use crate::util::cast_at_mut;
use std::mem::offset_of;
use std::mem::size_of;

/// Offset of the check field inside an xattr block.
pub const XATTR_BLOCK_CHECK_OFF: usize = offset_of!(XattrBlock, xb_check);

/// Number of buckets in one cluster.
pub fn buckets_per_cluster(fs: &FsHandle) -> u32 {
    fs.clustersize / XATTR_BUCKET_SIZE
}

/// Number of blocks one bucket spans.
pub fn blocks_per_bucket(fs: &FsHandle) -> u32 {
    XATTR_BUCKET_SIZE / fs.blocksize
}

fn swap_xattr_entries(blocksize: u32, buf: &mut [u8], header_off: usize) -> bool {
    let count = cast_at::<XattrHeader>(buf, header_off).xh_count as usize;
    for i in 0..count {
        let off = header_off + size_of::<XattrHeader>() + i * size_of::<XattrEntry>();
        if swap_barrier(blocksize as usize, off, size_of::<XattrEntry>()) {
            return false;
        }
        let e = cast_at_mut::<XattrEntry>(buf, off);
        e.xe_name_hash = e.xe_name_hash.swap_bytes();
        e.xe_name_offset = e.xe_name_offset.swap_bytes();
        e.xe_value_size = e.xe_value_size.swap_bytes();
    }
    true
}

fn swap_xattr_header_fields(xh: &mut XattrHeader) {
    xh.xh_count = xh.xh_count.swap_bytes();
    xh.xh_free_start = xh.xh_free_start.swap_bytes();
    xh.xh_name_value_len = xh.xh_name_value_len.swap_bytes();
    xh.xh_num_buckets = xh.xh_num_buckets.swap_bytes();
}

/// Swaps an xattr entry header (and its entries) to host endianness.
pub fn swap_xattr_header_to_native(blocksize: u32, buf: &mut [u8], off: usize) -> bool {
    if cpu_is_little_endian() {
        return true;
    }
    swap_xattr_header_fields(cast_at_mut::<XattrHeader>(buf, off));
    swap_xattr_entries(blocksize, buf, off)
}

/// Swaps an xattr entry header back to disk endianness.
pub fn swap_xattr_header_from_native(blocksize: u32, buf: &mut [u8], off: usize) -> bool {
    if cpu_is_little_endian() {
        return true;
    }
    let complete = swap_xattr_entries(blocksize, buf, off);
    swap_xattr_header_fields(cast_at_mut::<XattrHeader>(buf, off));
    complete
}

fn swap_xattr_block_header(xb: &mut XattrBlock) {
    xb.xb_suballoc_slot = xb.xb_suballoc_slot.swap_bytes();
    xb.xb_suballoc_bit = xb.xb_suballoc_bit.swap_bytes();
    xb.xb_fs_generation = xb.xb_fs_generation.swap_bytes();
    xb.xb_blkno = xb.xb_blkno.swap_bytes();
    xb.xb_flags = xb.xb_flags.swap_bytes();
    xb.xb_suballoc_loc = xb.xb_suballoc_loc.swap_bytes();
}

fn swap_xattr_tree_root(buf: &mut [u8]) {
    let xt = cast_at_mut::<XattrTreeRoot>(buf, XATTR_BODY_OFF);
    xt.xt_clusters = xt.xt_clusters.swap_bytes();
    xt.xt_last_eb_blk = xt.xt_last_eb_blk.swap_bytes();
}

/// Swaps an xattr block to host endianness.
pub fn swap_xattr_block_to_native(blocksize: u32, buf: &mut [u8]) -> bool {
    if cpu_is_little_endian() {
        return true;
    }
    swap_xattr_block_header(cast_at_mut::<XattrBlock>(buf, 0));
    if cast_at::<XattrBlock>(buf, 0).xb_flags & XATTR_INDEXED != 0 {
        swap_xattr_tree_root(buf);
        let list_off = XATTR_BODY_OFF + offset_of!(XattrTreeRoot, xt_list);
        extent::swap_extent_list_to_native(blocksize, buf, list_off)
    } else {
        swap_xattr_header_to_native(blocksize, buf, XATTR_BODY_OFF)
    }
}

/// Swaps an xattr block back to disk endianness.
pub fn swap_xattr_block_from_native(blocksize: u32, buf: &mut [u8]) -> bool {
    if cpu_is_little_endian() {
        return true;
    }
    let complete = if cast_at::<XattrBlock>(buf, 0).xb_flags & XATTR_INDEXED != 0 {
        let list_off = XATTR_BODY_OFF + offset_of!(XattrTreeRoot, xt_list);
        let complete = extent::swap_extent_list_from_native(blocksize, buf, list_off);
        swap_xattr_tree_root(buf);
        complete
    } else {
        swap_xattr_header_from_native(blocksize, buf, XATTR_BODY_OFF)
    };
    swap_xattr_block_header(cast_at_mut::<XattrBlock>(buf, 0));
    complete
}

/// Reads and validates the xattr block at `blkno`.
pub fn read_xattr_block(fs: &FsHandle, blkno: u64) -> Result<Vec<u8>, Ocfs2Error> {
    fs.check_blkno(blkno)?;
    let mut blk = fs.alloc_block();
    fs.read_blocks(blkno, 1, &mut blk)?;

    fs.validate_meta_ecc(&mut blk, XATTR_BLOCK_CHECK_OFF, blkno)?;

    let xb = cast_at::<XattrBlock>(&blk, 0);
    if !signature_matches(&xb.xb_signature, XATTR_BLOCK_SIGNATURE) {
        return Err(Ocfs2Error::BadSignature {
            blkno,
            expected: XATTR_BLOCK_SIGNATURE,
        });
    }
    if !swap_xattr_block_to_native(fs.blocksize, &mut blk) {
        return Err(Ocfs2Error::CorruptedBlock(blkno));
    }
    Ok(blk)
}

/// Writes a host-endian xattr block to `blkno`.
pub fn write_xattr_block(fs: &FsHandle, blkno: u64, buf: &[u8]) -> Result<(), Ocfs2Error> {
    if !fs.writable() {
        return Err(Ocfs2Error::ReadOnlyFilesystem);
    }
    fs.check_blkno(blkno)?;

    let mut blk = buf.to_vec();
    if !swap_xattr_block_from_native(fs.blocksize, &mut blk) {
        return Err(Ocfs2Error::CorruptedBlock(blkno));
    }
    fs.compute_meta_ecc(&mut blk, XATTR_BLOCK_CHECK_OFF);
    fs.write_blocks(blkno, 1, &blk)
}

/// Visits every attribute name of an xattr entry header.
pub fn xattr_header_iterate(
    buf: &[u8],
    header_off: usize,
    func: &mut dyn FnMut(&XattrEntry) -> Result<(), Ocfs2Error>,
) -> Result<(), Ocfs2Error> {
    let xh = cast_at::<XattrHeader>(buf, header_off);
    for entry in xh.entries() {
        func(entry)?;
    }
    Ok(())
}
