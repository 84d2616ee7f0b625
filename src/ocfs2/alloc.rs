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

//! Allocators.
//!
//! Two allocator shapes share the chain-of-groups layout: the global
//! cluster bitmap (one bit per cluster) and the per-slot suballocators for
//! metadata blocks (one bit per block). In both, an allocator inode holds a
//! chain list whose records head singly linked lists of group descriptors.
//!
//! A group's bitmap and counters live in the same block and are written
//! together; the chain record and allocator inode counters follow in a
//! second write. A failure in between leaves the bit allocated but
//! uncounted, which the next verification pass reconciles from the bitmaps.

use crate::bitmap;
use crate::byteorder::cpu_is_little_endian;
use crate::error::Ocfs2Error;
use crate::extent::{self, IterAction};
use crate::fs::FsHandle;
use crate::inode;
use crate::ondisk::*;
use crate::util::cast_at;
use crate::util::cast_at_mut;
use log::warn;
use std::mem::offset_of;

/// Offset of the check field inside a group descriptor block.
pub const GROUP_DESC_CHECK_OFF: usize = offset_of!(GroupDesc, bg_check);

fn swap_group_desc_header(gd: &mut GroupDesc) {
    gd.bg_size = gd.bg_size.swap_bytes();
    gd.bg_bits = gd.bg_bits.swap_bytes();
    gd.bg_free_bits_count = gd.bg_free_bits_count.swap_bytes();
    gd.bg_chain = gd.bg_chain.swap_bytes();
    gd.bg_generation = gd.bg_generation.swap_bytes();
    gd.bg_next_group = gd.bg_next_group.swap_bytes();
    gd.bg_parent_dinode = gd.bg_parent_dinode.swap_bytes();
    gd.bg_blkno = gd.bg_blkno.swap_bytes();
}

/// Swaps a group descriptor to host endianness. The bitmap is plain bytes.
pub fn swap_group_desc_to_native(buf: &mut [u8]) {
    if cpu_is_little_endian() {
        return;
    }
    swap_group_desc_header(cast_at_mut::<GroupDesc>(buf, 0));
}

/// Swaps a group descriptor back to disk endianness.
pub fn swap_group_desc_from_native(buf: &mut [u8]) {
    if cpu_is_little_endian() {
        return;
    }
    swap_group_desc_header(cast_at_mut::<GroupDesc>(buf, 0));
}

/// Reads and validates the group descriptor at `blkno`.
pub fn read_group_desc(fs: &FsHandle, blkno: u64) -> Result<Vec<u8>, Ocfs2Error> {
    fs.check_blkno(blkno)?;

    let mut blk = fs.alloc_block();
    fs.read_blocks(blkno, 1, &mut blk)?;

    fs.validate_meta_ecc(&mut blk, GROUP_DESC_CHECK_OFF, blkno)?;

    let gd = cast_at::<GroupDesc>(&blk, 0);
    if !signature_matches(&gd.bg_signature, GROUP_DESC_SIGNATURE) {
        return Err(Ocfs2Error::BadSignature {
            blkno,
            expected: GROUP_DESC_SIGNATURE,
        });
    }

    swap_group_desc_to_native(&mut blk);
    let gd = cast_at::<GroupDesc>(&blk, 0);
    let max_size = fs.blocksize as usize;
    if gd.bg_size as usize > max_size
        || (gd.bg_size as usize) <= GROUP_BITMAP_OFF
        || gd.bg_bits as usize > (gd.bg_size as usize - GROUP_BITMAP_OFF) * 8
        || gd.bg_free_bits_count > gd.bg_bits
    {
        return Err(Ocfs2Error::CorruptedBlock(blkno));
    }
    Ok(blk)
}

/// Writes a host-endian group descriptor to `blkno`.
pub fn write_group_desc(fs: &FsHandle, blkno: u64, buf: &[u8]) -> Result<(), Ocfs2Error> {
    if !fs.writable() {
        return Err(Ocfs2Error::ReadOnlyFilesystem);
    }
    fs.check_blkno(blkno)?;

    let mut blk = buf.to_vec();
    swap_group_desc_from_native(&mut blk);
    fs.compute_meta_ecc(&mut blk, GROUP_DESC_CHECK_OFF);
    fs.write_blocks(blkno, 1, &blk)
}

/// Visits every group descriptor of an allocator inode, chain by chain.
pub fn chain_iterate(
    fs: &FsHandle,
    allocator_buf: &[u8],
    func: &mut dyn FnMut(u64, u16) -> Result<IterAction, Ocfs2Error>,
) -> Result<(), Ocfs2Error> {
    let cl = inode_chain_list(allocator_buf);
    let chains: Vec<(u16, u64)> = cl
        .recs()
        .iter()
        .enumerate()
        .map(|(i, rec)| (i as u16, rec.c_blkno))
        .collect();
    for (chain, head) in chains {
        let mut gd_blkno = head;
        let mut steps = 0u64;
        while gd_blkno != 0 {
            if func(gd_blkno, chain)? == IterAction::Abort {
                return Ok(());
            }
            let gd_buf = read_group_desc(fs, gd_blkno)?;
            gd_blkno = cast_at::<GroupDesc>(&gd_buf, 0).bg_next_group;
            steps += 1;
            if steps > fs.blocks {
                return Err(Ocfs2Error::CorruptedBlock(head));
            }
        }
    }
    Ok(())
}

/// Result of a group search: the descriptor block and chain index.
struct FoundGroup {
    gd_blkno: u64,
    gd_buf: Vec<u8>,
    chain: u16,
}

/// First cluster covered by the cluster-bitmap group at `gd_blkno`.
///
/// The first group's descriptor sits just past the superblock, inside the
/// cluster range it covers, so it maps from cluster 0; later groups map
/// from the cluster their descriptor starts.
pub fn group_start_cluster(fs: &FsHandle, gd_blkno: u64) -> u32 {
    if gd_blkno == fs.first_cg_blkno {
        0
    } else {
        fs.blocks_to_clusters(gd_blkno)
    }
}

/// Finds a group with at least `want` free bits; with `want == 1` this is
/// the first group with any room.
fn find_group_with_space(
    fs: &FsHandle,
    allocator_buf: &[u8],
    want: u16,
) -> Result<Option<FoundGroup>, Ocfs2Error> {
    let cl = inode_chain_list(allocator_buf);
    for (chain, rec) in cl.recs().iter().enumerate() {
        if rec.c_free == 0 {
            continue;
        }
        let mut gd_blkno = rec.c_blkno;
        while gd_blkno != 0 {
            let gd_buf = read_group_desc(fs, gd_blkno)?;
            let gd = cast_at::<GroupDesc>(&gd_buf, 0);
            if gd.bg_free_bits_count >= want {
                return Ok(Some(FoundGroup {
                    gd_blkno,
                    gd_buf,
                    chain: chain as u16,
                }));
            }
            gd_blkno = gd.bg_next_group;
        }
    }
    Ok(None)
}

/// Propagates an allocation (`delta` > 0) or a release (`delta` < 0) of
/// bits into the chain record and allocator inode counters.
fn update_chain_counts(
    fs: &FsHandle,
    allocator_blkno: u64,
    chain: u16,
    delta: i64,
) -> Result<(), Ocfs2Error> {
    let mut buf = inode::read_inode(fs, allocator_blkno)?;
    {
        let cl = inode_chain_list_mut(&mut buf);
        let rec = &mut cl.recs_mut()[chain as usize];
        rec.c_free = (rec.c_free as i64 - delta) as u32;
    }
    {
        let di = cast_at_mut::<Dinode>(&mut buf, 0);
        unsafe {
            di.id1.bitmap1.i_used = (di.id1.bitmap1.i_used as i64 + delta) as u32;
        }
    }
    inode::write_inode(fs, allocator_blkno, &buf)
}

/// Allocates between `want_min` and `want_max` contiguous clusters from the
/// global bitmap.
///
/// Returns the first block of the run and the cluster count. The longest
/// run up to `want_max` wins; anything below `want_min` is refused with
/// `NoSpaceOnDevice`.
pub fn new_clusters(
    fs: &FsHandle,
    want_min: u32,
    want_max: u32,
) -> Result<(u64, u32), Ocfs2Error> {
    if want_min == 0 || want_min > want_max {
        return Err(Ocfs2Error::InvalidArgument("bad cluster request"));
    }
    let bitmap_blkno = fs.lookup_system_inode(SystemFileType::GlobalBitmap, 0)?;
    let allocator_buf = inode::read_inode(fs, bitmap_blkno)?;

    // best candidate over all groups: (gd_blkno, chain, start bit, length)
    let mut best: Option<(u64, u16, usize, u32)> = None;
    let cl = inode_chain_list(&allocator_buf);
    'chains: for (chain, rec) in cl.recs().iter().enumerate() {
        let mut gd_blkno = rec.c_blkno;
        while gd_blkno != 0 {
            let gd_buf = read_group_desc(fs, gd_blkno)?;
            let gd = cast_at::<GroupDesc>(&gd_buf, 0);
            let bits = gd.bg_bits as usize;
            let map = gd.bitmap();

            let mut start = 0;
            while let Some(run) = bitmap::find_clear_run(map, bits, start, 1) {
                let end = bitmap::find_next_set(map, bits, run);
                let len = ((end - run) as u32).min(want_max);
                if best.map(|(_, _, _, l)| l).unwrap_or(0) < len {
                    best = Some((gd_blkno, chain as u16, run, len));
                    if len == want_max {
                        break 'chains;
                    }
                }
                start = end;
            }
            gd_blkno = gd.bg_next_group;
        }
    }

    let Some((gd_blkno, chain, bit, len)) = best else {
        return Err(Ocfs2Error::NoSpaceOnDevice);
    };
    if len < want_min {
        return Err(Ocfs2Error::NoSpaceOnDevice);
    }

    // bitmap and group counters first, chain counters after
    let mut gd_buf = read_group_desc(fs, gd_blkno)?;
    let first_cluster = group_start_cluster(fs, gd_blkno) + bit as u32;
    {
        let gd = cast_at_mut::<GroupDesc>(&mut gd_buf, 0);
        bitmap::set_range(gd.bitmap_mut(), bit, bit + len as usize);
        let gd = cast_at_mut::<GroupDesc>(&mut gd_buf, 0);
        gd.bg_free_bits_count -= len as u16;
    }
    write_group_desc(fs, gd_blkno, &gd_buf)?;
    if let Err(e) = update_chain_counts(fs, bitmap_blkno, chain, len as i64) {
        // put the bits back before reporting
        undo_group_bits(fs, gd_blkno, bit, len as usize);
        return Err(e);
    }
    Ok((fs.clusters_to_blocks(first_cluster), len))
}

/// Returns `count` clusters starting at block `first_blkno` to the global
/// bitmap.
pub fn free_clusters(fs: &FsHandle, count: u32, first_blkno: u64) -> Result<(), Ocfs2Error> {
    if count == 0 {
        return Ok(());
    }
    let bitmap_blkno = fs.lookup_system_inode(SystemFileType::GlobalBitmap, 0)?;
    let allocator_buf = inode::read_inode(fs, bitmap_blkno)?;
    let cluster = fs.blocks_to_clusters(first_blkno);

    let found = find_group_of_cluster(fs, &allocator_buf, cluster)?;
    let Some(mut found) = found else {
        return Err(Ocfs2Error::BadBlockNumber(first_blkno));
    };
    let start = group_start_cluster(fs, found.gd_blkno);
    let gd = cast_at_mut::<GroupDesc>(&mut found.gd_buf, 0);
    let bit = (cluster - start) as usize;
    if bit + count as usize > gd.bg_bits as usize {
        return Err(Ocfs2Error::InvalidArgument("range leaves its group"));
    }
    bitmap::clear_range(gd.bitmap_mut(), bit, bit + count as usize);
    let gd = cast_at_mut::<GroupDesc>(&mut found.gd_buf, 0);
    gd.bg_free_bits_count += count as u16;

    write_group_desc(fs, found.gd_blkno, &found.gd_buf)?;
    update_chain_counts(fs, bitmap_blkno, found.chain, -(count as i64))
}

/// Finds the cluster-bitmap group covering `cluster`.
fn find_group_of_cluster(
    fs: &FsHandle,
    allocator_buf: &[u8],
    cluster: u32,
) -> Result<Option<FoundGroup>, Ocfs2Error> {
    let cl = inode_chain_list(allocator_buf);
    let cpg = cl.cl_cpg as u32;
    for (chain, rec) in cl.recs().iter().enumerate() {
        let mut gd_blkno = rec.c_blkno;
        while gd_blkno != 0 {
            let gd_buf = read_group_desc(fs, gd_blkno)?;
            let gd = cast_at::<GroupDesc>(&gd_buf, 0);
            let start = group_start_cluster(fs, gd_blkno);
            if start <= cluster && cluster < start + cpg {
                return Ok(Some(FoundGroup {
                    gd_blkno,
                    gd_buf,
                    chain: chain as u16,
                }));
            }
            gd_blkno = gd.bg_next_group;
        }
    }
    Ok(None)
}

fn undo_group_bits(fs: &FsHandle, gd_blkno: u64, bit: usize, len: usize) {
    let undo = || -> Result<(), Ocfs2Error> {
        let mut gd_buf = read_group_desc(fs, gd_blkno)?;
        let gd = cast_at_mut::<GroupDesc>(&mut gd_buf, 0);
        bitmap::clear_range(gd.bitmap_mut(), bit, bit + len);
        let gd = cast_at_mut::<GroupDesc>(&mut gd_buf, 0);
        gd.bg_free_bits_count += len as u16;
        write_group_desc(fs, gd_blkno, &gd_buf)
    };
    if let Err(e) = undo() {
        warn!("failed to roll back {len} bits in group {gd_blkno}: {e}");
    }
}

/// Allocates one block from the suballocator `ftype` of `slot`, extending
/// the allocator with a fresh group when every chain is full.
fn new_suballoc_block(
    fs: &FsHandle,
    ftype: SystemFileType,
    slot: u16,
) -> Result<SuballocBit, Ocfs2Error> {
    let allocator_blkno = fs.lookup_system_inode(ftype, slot)?;
    let allocator_buf = inode::read_inode(fs, allocator_blkno)?;

    let found = match find_group_with_space(fs, &allocator_buf, 1)? {
        Some(found) => found,
        None => extend_suballocator(fs, allocator_blkno)?,
    };
    let FoundGroup {
        gd_blkno,
        mut gd_buf,
        chain,
    } = found;

    let gd = cast_at_mut::<GroupDesc>(&mut gd_buf, 0);
    let bits = gd.bg_bits as usize;
    let bit = bitmap::find_next_clear(gd.bitmap(), bits, 0);
    if bit >= bits {
        return Err(Ocfs2Error::CorruptedBlock(gd_blkno));
    }
    bitmap::set_bit(gd.bitmap_mut(), bit);
    let gd = cast_at_mut::<GroupDesc>(&mut gd_buf, 0);
    gd.bg_free_bits_count -= 1;
    let blkno = gd.bg_blkno + bit as u64;

    write_group_desc(fs, gd_blkno, &gd_buf)?;
    if let Err(e) = update_chain_counts(fs, allocator_blkno, chain, 1) {
        undo_group_bits(fs, gd_blkno, bit, 1);
        return Err(e);
    }
    Ok(SuballocBit {
        blkno,
        bit: bit as u16,
        slot,
    })
}

/// A block handed out by a suballocator.
pub struct SuballocBit {
    /// The allocated block.
    pub blkno: u64,
    /// Bit index inside its group.
    pub bit: u16,
    /// Slot of the allocator.
    pub slot: u16,
}

/// Adds a fresh group to the emptiest chain of a suballocator.
fn extend_suballocator(fs: &FsHandle, allocator_blkno: u64) -> Result<FoundGroup, Ocfs2Error> {
    let mut allocator_buf = inode::read_inode(fs, allocator_blkno)?;
    let (cpg, bpc, chain, old_head, new_chain) = {
        let cl = inode_chain_list(&allocator_buf);
        // open an unused chain, or reuse the least-loaded one
        let used = cl.cl_next_free_rec as usize;
        let (chain, old_head, new_chain) = if used < cl.cl_count as usize {
            (used, 0, true)
        } else {
            let (best, rec) = cl
                .recs()
                .iter()
                .enumerate()
                .min_by_key(|(_, r)| r.c_total)
                .ok_or(Ocfs2Error::CorruptedBlock(allocator_blkno))?;
            (best, rec.c_blkno, false)
        };
        (cl.cl_cpg as u32, cl.cl_bpc as u32, chain, old_head, new_chain)
    };

    let (first_blkno, got) = new_clusters(fs, cpg, cpg)?;
    debug_assert_eq!(got, cpg);
    let bits = (cpg * bpc) as u16;

    let mut gd_buf = fs.alloc_block();
    {
        let gd = cast_at_mut::<GroupDesc>(&mut gd_buf, 0);
        set_signature(&mut gd.bg_signature, GROUP_DESC_SIGNATURE);
        gd.bg_size = fs.blocksize as u16;
        gd.bg_bits = bits;
        gd.bg_free_bits_count = bits - 1;
        gd.bg_chain = chain as u16;
        gd.bg_generation = fs.with_super_block_buf(|b| cast_at::<Dinode>(b, 0).i_fs_generation);
        gd.bg_next_group = old_head;
        gd.bg_parent_dinode = allocator_blkno;
        gd.bg_blkno = first_blkno;
        // the first bit is the descriptor itself
        bitmap::set_bit(gd.bitmap_mut(), 0);
    }
    write_group_desc(fs, first_blkno, &gd_buf)?;

    {
        let cl = inode_chain_list_mut(&mut allocator_buf);
        if new_chain {
            cl.cl_next_free_rec = (chain + 1) as u16;
        }
        let rec = &mut cl.recs_mut()[chain];
        rec.c_blkno = first_blkno;
        if new_chain {
            rec.c_total = bits as u32;
            rec.c_free = (bits - 1) as u32;
        } else {
            rec.c_total += bits as u32;
            rec.c_free += (bits - 1) as u32;
        }
    }
    {
        let di = cast_at_mut::<Dinode>(&mut allocator_buf, 0);
        unsafe {
            di.id1.bitmap1.i_total += bits as u32;
            // the descriptor's own bit is used from the start
            di.id1.bitmap1.i_used += 1;
        }
        di.i_clusters += cpg;
    }
    inode::write_inode(fs, allocator_blkno, &allocator_buf)?;

    let gd_buf = read_group_desc(fs, first_blkno)?;
    Ok(FoundGroup {
        gd_blkno: first_blkno,
        gd_buf,
        chain: chain as u16,
    })
}

/// Returns a block to the suballocator that handed it out.
fn free_suballoc_block(
    fs: &FsHandle,
    ftype: SystemFileType,
    slot: u16,
    blkno: u64,
) -> Result<(), Ocfs2Error> {
    let allocator_blkno = fs.lookup_system_inode(ftype, slot)?;
    let allocator_buf = inode::read_inode(fs, allocator_blkno)?;

    let cl = inode_chain_list(&allocator_buf);
    for (chain, rec) in cl.recs().iter().enumerate() {
        let mut gd_blkno = rec.c_blkno;
        while gd_blkno != 0 {
            let mut gd_buf = read_group_desc(fs, gd_blkno)?;
            let gd = cast_at_mut::<GroupDesc>(&mut gd_buf, 0);
            let start = gd.bg_blkno;
            let bits = gd.bg_bits as u64;
            if start <= blkno && blkno < start + bits {
                let bit = (blkno - start) as usize;
                bitmap::clear_bit(gd.bitmap_mut(), bit);
                let gd = cast_at_mut::<GroupDesc>(&mut gd_buf, 0);
                gd.bg_free_bits_count += 1;
                write_group_desc(fs, gd_blkno, &gd_buf)?;
                return update_chain_counts(fs, allocator_blkno, chain as u16, -1);
            }
            gd_blkno = gd.bg_next_group;
        }
    }
    Err(Ocfs2Error::BadBlockNumber(blkno))
}

/// Fills the common header of a freshly allocated metadata block.
fn stamp_generation(fs: &FsHandle) -> u32 {
    fs.with_super_block_buf(|b| cast_at::<Dinode>(b, 0).i_fs_generation)
}

/// Allocates and initialises an extent block. The block is written out and
/// also returned in host-endian form.
pub fn new_extent_block(fs: &FsHandle) -> Result<(u64, Vec<u8>), Ocfs2Error> {
    let got = new_suballoc_block(fs, SystemFileType::ExtentAlloc, 0)?;
    let mut buf = fs.alloc_block();
    {
        let eb = cast_at_mut::<ExtentBlock>(&mut buf, 0);
        set_signature(&mut eb.h_signature, EXTENT_BLOCK_SIGNATURE);
        eb.h_suballoc_slot = got.slot;
        eb.h_suballoc_bit = got.bit;
        eb.h_fs_generation = stamp_generation(fs);
        eb.h_blkno = got.blkno;
        eb.h_list.l_count = extent_recs_per_eb(fs.blocksize);
    }
    extent::write_extent_block(fs, got.blkno, &buf)?;
    Ok((got.blkno, buf))
}

/// Returns an extent block to its suballocator.
pub fn free_extent_block(fs: &FsHandle, blkno: u64) -> Result<(), Ocfs2Error> {
    free_suballoc_block(fs, SystemFileType::ExtentAlloc, 0, blkno)
}

/// Allocates and initialises a refcount block in inline-root form.
pub fn new_refcount_block(
    fs: &FsHandle,
    parent: u64,
    generation: u32,
) -> Result<(u64, Vec<u8>), Ocfs2Error> {
    let got = new_suballoc_block(fs, SystemFileType::ExtentAlloc, 0)?;
    let mut buf = fs.alloc_block();
    {
        let rb = cast_at_mut::<RefcountBlock>(&mut buf, 0);
        set_signature(&mut rb.rf_signature, REFCOUNT_BLOCK_SIGNATURE);
        rb.rf_suballoc_slot = got.slot;
        rb.rf_suballoc_bit = got.bit;
        rb.rf_fs_generation = stamp_generation(fs);
        rb.rf_blkno = got.blkno;
        rb.rf_parent = parent;
        rb.rf_generation = generation;
    }
    {
        let rl = refcount_list_mut(&mut buf);
        rl.rl_count = refcount_recs_per_rb(fs.blocksize);
    }
    crate::refcount::write_refcount_block(fs, got.blkno, &buf)?;
    Ok((got.blkno, buf))
}

/// Returns a refcount block to its suballocator.
pub fn free_refcount_block(fs: &FsHandle, blkno: u64) -> Result<(), Ocfs2Error> {
    free_suballoc_block(fs, SystemFileType::ExtentAlloc, 0, blkno)
}

/// Allocates and initialises a directory index root block in inline form.
pub fn new_dx_root(fs: &FsHandle, dir_blkno: u64) -> Result<(u64, Vec<u8>), Ocfs2Error> {
    let got = new_suballoc_block(fs, SystemFileType::ExtentAlloc, 0)?;
    let mut buf = fs.alloc_block();
    {
        let dr = cast_at_mut::<DxRootBlock>(&mut buf, 0);
        set_signature(&mut dr.dr_signature, DX_ROOT_SIGNATURE);
        dr.dr_suballoc_slot = got.slot;
        dr.dr_suballoc_bit = got.bit;
        dr.dr_fs_generation = stamp_generation(fs);
        dr.dr_blkno = got.blkno;
        dr.dr_dir_blkno = dir_blkno;
        dr.dr_flags = DX_FLAG_INLINE;
    }
    {
        let list = dx_root_entry_list_mut(&mut buf);
        list.de_count = dx_entries_per_root(fs.blocksize);
    }
    crate::dir_indexed::write_dx_root(fs, got.blkno, &buf)?;
    Ok((got.blkno, buf))
}

/// Returns a directory index root block to its suballocator.
pub fn free_dx_root(fs: &FsHandle, blkno: u64) -> Result<(), Ocfs2Error> {
    free_suballoc_block(fs, SystemFileType::ExtentAlloc, 0, blkno)
}

/// Allocates a blank inode block.
pub fn new_inode_block(fs: &FsHandle) -> Result<SuballocBit, Ocfs2Error> {
    new_suballoc_block(fs, SystemFileType::InodeAlloc, 0)
}

/// Extends a cached inode's allocation by `clusters`, appending extents at
/// the current end of the file.
pub fn extend_allocation(
    fs: &FsHandle,
    ci: &mut inode::CachedInode,
    mut clusters: u32,
) -> Result<(), Ocfs2Error> {
    while clusters > 0 {
        let (blkno, got) = new_clusters(fs, 1, clusters)?;
        let cpos = ci.dinode().i_clusters;
        let blkno_of = blkno;
        let mut et = extent::ExtentTree::dinode(fs, &mut ci.buf, ci.blkno);
        if let Err(e) = extent::insert_extent(fs, &mut et, cpos, blkno_of, got, 0) {
            let _ = free_clusters(fs, got, blkno_of);
            return Err(e);
        }
        clusters -= got;
    }
    ci.write(fs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::test_support::scratch_volume;
    use crate::fs::OpenFlags;

    /// Sum of group free counts must equal the chain record and inode
    /// counters.
    fn check_allocator(fs: &FsHandle, ftype: SystemFileType) {
        let blkno = fs.lookup_system_inode(ftype, 0).unwrap();
        let buf = inode::read_inode(fs, blkno).unwrap();
        let cl = inode_chain_list(&buf);

        let mut group_free = 0u64;
        let mut group_total = 0u64;
        let mut chain_free = 0u64;
        let mut chain_total = 0u64;
        for rec in cl.recs() {
            chain_free += rec.c_free as u64;
            chain_total += rec.c_total as u64;
            let mut gd_blkno = rec.c_blkno;
            while gd_blkno != 0 {
                let gd_buf = read_group_desc(fs, gd_blkno).unwrap();
                let gd = cast_at::<GroupDesc>(&gd_buf, 0);
                group_free += gd.bg_free_bits_count as u64;
                group_total += gd.bg_bits as u64;
                let set = bitmap::count_set(gd.bitmap(), 0, gd.bg_bits as usize);
                assert_eq!(
                    set,
                    (gd.bg_bits - gd.bg_free_bits_count) as usize,
                    "bitmap disagrees with the counters in group {gd_blkno}"
                );
                gd_blkno = gd.bg_next_group;
            }
        }
        assert_eq!(group_free, chain_free);
        assert_eq!(group_total, chain_total);

        let di = cast_at::<Dinode>(&buf, 0);
        let (used, total) = unsafe { (di.id1.bitmap1.i_used, di.id1.bitmap1.i_total) };
        assert_eq!(total as u64, chain_total);
        assert_eq!(used as u64, chain_total - chain_free);
    }

    #[test]
    fn cluster_allocation_roundtrip() {
        let tmp = scratch_volume(16 << 20, 4096, 4096);
        let fs = FsHandle::open(tmp.path(), OpenFlags::RW, 0, 0).unwrap();
        check_allocator(&fs, SystemFileType::GlobalBitmap);

        let (blkno, got) = new_clusters(&fs, 4, 16).unwrap();
        assert_eq!(got, 16);
        check_allocator(&fs, SystemFileType::GlobalBitmap);

        // the run is busy now; the next allocation lands elsewhere
        let (other, _) = new_clusters(&fs, 1, 1).unwrap();
        assert!(other < blkno || other >= blkno + fs.clusters_to_blocks(16));

        free_clusters(&fs, 16, blkno).unwrap();
        check_allocator(&fs, SystemFileType::GlobalBitmap);
    }

    #[test]
    fn want_min_limits_the_search() {
        let tmp = scratch_volume(8 << 20, 4096, 4096);
        let fs = FsHandle::open(tmp.path(), OpenFlags::RW, 0, 0).unwrap();
        // more than the whole volume can hold
        assert!(matches!(
            new_clusters(&fs, fs.clusters + 1, fs.clusters + 1),
            Err(Ocfs2Error::NoSpaceOnDevice)
        ));
        // flexible requests cap at what a run can give
        let (_, got) = new_clusters(&fs, 1, fs.clusters + 100).unwrap();
        assert!(got > 0 && got <= fs.clusters);
    }

    #[test]
    fn metadata_blocks_extend_on_demand() {
        let tmp = scratch_volume(16 << 20, 4096, 4096);
        let fs = FsHandle::open(tmp.path(), OpenFlags::RW, 0, 0).unwrap();

        // the extent allocator starts with no groups at all
        let (blkno, buf) = new_extent_block(&fs).unwrap();
        assert!(blkno > 0);
        let eb = cast_at::<ExtentBlock>(&buf, 0);
        assert_eq!({ eb.h_blkno }, blkno);
        check_allocator(&fs, SystemFileType::ExtentAlloc);

        // identical up to the check stamp added on the way to disk
        let mut again = extent::read_extent_block(&fs, blkno).unwrap();
        cast_at_mut::<ExtentBlock>(&mut again, 0).h_check = BlockCheck::default();
        assert_eq!(buf, again);

        free_extent_block(&fs, blkno).unwrap();
        check_allocator(&fs, SystemFileType::ExtentAlloc);
    }
}
