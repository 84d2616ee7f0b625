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

//! The directory index.
//!
//! A secondary hash index over directory entries. Names hash to a
//! (major, minor) pair; the major hash keys an extent tree whose leaf
//! clusters hold index blocks, the minor hash picks the block inside a
//! cluster. Small indexes start inline in the root block.

use crate::alloc;
use crate::byteorder::cpu_is_little_endian;
use crate::byteorder::swap_barrier;
use crate::dir;
use crate::error::Ocfs2Error;
use crate::extent;
use crate::fs::FsHandle;
use crate::inode;
use crate::ondisk::*;
use crate::util::cast_at;
use crate::util::cast_at_mut;
use std::mem::offset_of;
use std::mem::size_of;

/// Offset of the check field inside a directory index root block.
pub const DX_ROOT_CHECK_OFF: usize = offset_of!(DxRootBlock, dr_check);
/// Offset of the check field inside a directory index leaf block.
pub const DX_LEAF_CHECK_OFF: usize = offset_of!(DxLeaf, dl_check);

/// A name hash: the major half routes through the extent tree, the minor
/// half picks a block within the leaf cluster.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DxHinfo {
    /// Major hash.
    pub major_hash: u32,
    /// Minor hash.
    pub minor_hash: u32,
}

const TEA_DELTA: u32 = 0x9e3779b9;

fn tea_transform(buf: &mut [u32; 4], input: &[u32; 8]) {
    let mut sum = 0u32;
    let mut b0 = buf[0];
    let mut b1 = buf[1];
    let (a, b, c, d) = (input[0], input[1], input[2], input[3]);

    for _ in 0..16 {
        sum = sum.wrapping_add(TEA_DELTA);
        b0 = b0.wrapping_add(
            ((b1 << 4).wrapping_add(a)) ^ b1.wrapping_add(sum) ^ ((b1 >> 5).wrapping_add(b)),
        );
        b1 = b1.wrapping_add(
            ((b0 << 4).wrapping_add(c)) ^ b0.wrapping_add(sum) ^ ((b0 >> 5).wrapping_add(d)),
        );
    }

    buf[0] = buf[0].wrapping_add(b0);
    buf[1] = buf[1].wrapping_add(b1);
}

/// Packs up to 16 name bytes into four 32-bit lanes, padding the tail with
/// a value derived from the name length.
fn str2hashbuf(msg: &[u8], len: usize, buf: &mut [u32; 8], num: usize) {
    let mut pad = len as u32 | ((len as u32) << 8);
    pad |= pad << 16;

    let mut val = pad;
    let len = len.min(num * 4);
    let mut out = 0;
    let mut num = num as isize;
    for (i, byte) in msg.iter().take(len).enumerate() {
        if i % 4 == 0 {
            val = pad;
        }
        val = (*byte as u32).wrapping_add(val << 8);
        if i % 4 == 3 {
            buf[out] = val;
            out += 1;
            val = pad;
            num -= 1;
        }
    }
    num -= 1;
    if num >= 0 {
        buf[out] = val;
        out += 1;
    }
    while num > 0 {
        num -= 1;
        buf[out] = pad;
        out += 1;
    }
}

/// Hashes a directory entry name with the volume's seed.
///
/// `.` and `..` always hash to zero; they are never indexed.
pub fn name_hash(fs: &FsHandle, name: &[u8]) -> DxHinfo {
    if name == b"." || name == b".." {
        return DxHinfo::default();
    }

    let mut buf = [0u32; 4];
    let seed = fs.with_super(|sb| sb.s_dx_seed);
    buf[..3].copy_from_slice(&seed);

    let mut input = [0u32; 8];
    let mut rest = name;
    let mut remaining = name.len();
    while remaining > 0 {
        str2hashbuf(rest, remaining, &mut input, 4);
        tea_transform(&mut buf, &input);
        rest = &rest[rest.len().min(16)..];
        remaining = remaining.saturating_sub(16);
    }

    DxHinfo {
        major_hash: buf[0],
        minor_hash: buf[1],
    }
}

/// Index of the leaf block inside its cluster for a given hash.
fn dx_hash_idx(fs: &FsHandle, hinfo: &DxHinfo) -> u64 {
    let mask = fs.blocks_per_cluster() as u64 - 1;
    hinfo.minor_hash as u64 & mask
}

fn swap_dx_entries(blocksize: u32, buf: &mut [u8], list_off: usize) -> bool {
    let used = cast_at::<DxEntryList>(buf, list_off).de_num_used as usize;
    for i in 0..used {
        let off = list_off + size_of::<DxEntryList>() + i * size_of::<DxEntry>();
        if swap_barrier(blocksize as usize, off, size_of::<DxEntry>()) {
            return false;
        }
        let e = cast_at_mut::<DxEntry>(buf, off);
        e.dx_major_hash = e.dx_major_hash.swap_bytes();
        e.dx_minor_hash = e.dx_minor_hash.swap_bytes();
        e.dx_dirent_blk = e.dx_dirent_blk.swap_bytes();
    }
    true
}

fn swap_dx_entry_list_header(buf: &mut [u8], list_off: usize) {
    let list = cast_at_mut::<DxEntryList>(buf, list_off);
    list.de_count = list.de_count.swap_bytes();
    list.de_num_used = list.de_num_used.swap_bytes();
}

fn swap_dx_root_header(dr: &mut DxRootBlock) {
    dr.dr_suballoc_slot = dr.dr_suballoc_slot.swap_bytes();
    dr.dr_suballoc_bit = dr.dr_suballoc_bit.swap_bytes();
    dr.dr_fs_generation = dr.dr_fs_generation.swap_bytes();
    dr.dr_blkno = dr.dr_blkno.swap_bytes();
    dr.dr_last_eb_blk = dr.dr_last_eb_blk.swap_bytes();
    dr.dr_clusters = dr.dr_clusters.swap_bytes();
    dr.dr_dir_blkno = dr.dr_dir_blkno.swap_bytes();
    dr.dr_num_entries = dr.dr_num_entries.swap_bytes();
    dr.dr_free_blk = dr.dr_free_blk.swap_bytes();
}

/// Swaps a directory index root to host endianness.
pub fn swap_dx_root_to_native(blocksize: u32, buf: &mut [u8]) -> bool {
    if cpu_is_little_endian() {
        return true;
    }
    swap_dx_root_header(cast_at_mut::<DxRootBlock>(buf, 0));
    if cast_at::<DxRootBlock>(buf, 0).dr_flags & DX_FLAG_INLINE != 0 {
        swap_dx_entry_list_header(buf, DX_ROOT_BODY_OFF);
        swap_dx_entries(blocksize, buf, DX_ROOT_BODY_OFF)
    } else {
        extent::swap_extent_list_to_native(blocksize, buf, DX_ROOT_BODY_OFF)
    }
}

/// Swaps a directory index root back to disk endianness.
pub fn swap_dx_root_from_native(blocksize: u32, buf: &mut [u8]) -> bool {
    if cpu_is_little_endian() {
        return true;
    }
    let complete = if cast_at::<DxRootBlock>(buf, 0).dr_flags & DX_FLAG_INLINE != 0 {
        let complete = swap_dx_entries(blocksize, buf, DX_ROOT_BODY_OFF);
        swap_dx_entry_list_header(buf, DX_ROOT_BODY_OFF);
        complete
    } else {
        extent::swap_extent_list_from_native(blocksize, buf, DX_ROOT_BODY_OFF)
    };
    swap_dx_root_header(cast_at_mut::<DxRootBlock>(buf, 0));
    complete
}

fn swap_dx_leaf_header(dl: &mut DxLeaf) {
    dl.dl_blkno = dl.dl_blkno.swap_bytes();
    dl.dl_fs_generation = dl.dl_fs_generation.swap_bytes();
}

/// Swaps a directory index leaf to host endianness.
pub fn swap_dx_leaf_to_native(blocksize: u32, buf: &mut [u8]) -> bool {
    if cpu_is_little_endian() {
        return true;
    }
    swap_dx_leaf_header(cast_at_mut::<DxLeaf>(buf, 0));
    let list_off = offset_of!(DxLeaf, dl_list);
    swap_dx_entry_list_header(buf, list_off);
    swap_dx_entries(blocksize, buf, list_off)
}

/// Swaps a directory index leaf back to disk endianness.
pub fn swap_dx_leaf_from_native(blocksize: u32, buf: &mut [u8]) -> bool {
    if cpu_is_little_endian() {
        return true;
    }
    let list_off = offset_of!(DxLeaf, dl_list);
    let complete = swap_dx_entries(blocksize, buf, list_off);
    swap_dx_entry_list_header(buf, list_off);
    swap_dx_leaf_header(cast_at_mut::<DxLeaf>(buf, 0));
    complete
}

/// Reads and validates the directory index root at `blkno`.
pub fn read_dx_root(fs: &FsHandle, blkno: u64) -> Result<Vec<u8>, Ocfs2Error> {
    fs.check_blkno(blkno)?;
    let mut blk = fs.alloc_block();
    fs.read_blocks(blkno, 1, &mut blk)?;

    fs.validate_meta_ecc(&mut blk, DX_ROOT_CHECK_OFF, blkno)?;

    let dr = cast_at::<DxRootBlock>(&blk, 0);
    if !signature_matches(&dr.dr_signature, DX_ROOT_SIGNATURE) {
        return Err(Ocfs2Error::BadSignature {
            blkno,
            expected: DX_ROOT_SIGNATURE,
        });
    }
    if !swap_dx_root_to_native(fs.blocksize, &mut blk) {
        return Err(Ocfs2Error::CorruptedBlock(blkno));
    }
    let dr = cast_at::<DxRootBlock>(&blk, 0);
    if dr.dr_flags & DX_FLAG_INLINE != 0 {
        let list = dx_root_entry_list(&blk);
        if list.de_count > dx_entries_per_root(fs.blocksize) || list.de_num_used > list.de_count {
            return Err(Ocfs2Error::CorruptedBlock(blkno));
        }
    } else {
        let el = dx_root_extent_list(&blk);
        if el.l_count > extent_recs_per_dx_root(fs.blocksize) || el.l_next_free_rec > el.l_count {
            return Err(Ocfs2Error::CorruptedBlock(blkno));
        }
    }
    Ok(blk)
}

/// Writes a host-endian directory index root to `blkno`.
pub fn write_dx_root(fs: &FsHandle, blkno: u64, buf: &[u8]) -> Result<(), Ocfs2Error> {
    if !fs.writable() {
        return Err(Ocfs2Error::ReadOnlyFilesystem);
    }
    fs.check_blkno(blkno)?;

    let mut blk = buf.to_vec();
    if !swap_dx_root_from_native(fs.blocksize, &mut blk) {
        return Err(Ocfs2Error::CorruptedBlock(blkno));
    }
    fs.compute_meta_ecc(&mut blk, DX_ROOT_CHECK_OFF);
    fs.write_blocks(blkno, 1, &blk)
}

/// Reads and validates the directory index leaf at `blkno`.
pub fn read_dx_leaf(fs: &FsHandle, blkno: u64) -> Result<Vec<u8>, Ocfs2Error> {
    fs.check_blkno(blkno)?;
    let mut blk = fs.alloc_block();
    fs.read_blocks(blkno, 1, &mut blk)?;

    fs.validate_meta_ecc(&mut blk, DX_LEAF_CHECK_OFF, blkno)?;

    let dl = cast_at::<DxLeaf>(&blk, 0);
    if !signature_matches(&dl.dl_signature, DX_LEAF_SIGNATURE) {
        return Err(Ocfs2Error::BadSignature {
            blkno,
            expected: DX_LEAF_SIGNATURE,
        });
    }
    if !swap_dx_leaf_to_native(fs.blocksize, &mut blk) {
        return Err(Ocfs2Error::CorruptedBlock(blkno));
    }
    let list = &cast_at::<DxLeaf>(&blk, 0).dl_list;
    if list.de_count > dx_entries_per_leaf(fs.blocksize) || list.de_num_used > list.de_count {
        return Err(Ocfs2Error::CorruptedBlock(blkno));
    }
    Ok(blk)
}

/// Writes a host-endian directory index leaf to `blkno`.
pub fn write_dx_leaf(fs: &FsHandle, blkno: u64, buf: &[u8]) -> Result<(), Ocfs2Error> {
    if !fs.writable() {
        return Err(Ocfs2Error::ReadOnlyFilesystem);
    }
    fs.check_blkno(blkno)?;

    let mut blk = buf.to_vec();
    if !swap_dx_leaf_from_native(fs.blocksize, &mut blk) {
        return Err(Ocfs2Error::CorruptedBlock(blkno));
    }
    fs.compute_meta_ecc(&mut blk, DX_LEAF_CHECK_OFF);
    fs.write_blocks(blkno, 1, &blk)
}

fn entry_list_insert(list: &mut DxEntryList, hinfo: &DxHinfo, dirent_blk: u64) {
    let i = list.de_num_used as usize;
    let entry = list.entry_mut(i);
    *entry = DxEntry {
        dx_major_hash: hinfo.major_hash,
        dx_minor_hash: hinfo.minor_hash,
        dx_dirent_blk: dirent_blk,
    };
    list.de_num_used += 1;
}

/// Removes entry `index` from an index entry list, compacting the tail.
pub fn entry_list_remove(list: &mut DxEntryList, index: usize) {
    let num_used = list.de_num_used as usize;
    {
        let entries = list.entries_mut();
        for i in index..num_used - 1 {
            entries[i] = entries[i + 1];
        }
    }
    *list.entry_mut(num_used - 1) = DxEntry::default();
    list.de_num_used -= 1;
}

/// Formats the blocks of a fresh index cluster as empty leaves.
fn format_dx_cluster(fs: &FsHandle, start_blkno: u64) -> Result<Vec<Vec<u8>>, Ocfs2Error> {
    let count = fs.blocks_per_cluster() as u64;
    let generation = fs.with_super_block_buf(|b| cast_at::<Dinode>(b, 0).i_fs_generation);
    let mut leaves = Vec::with_capacity(count as usize);
    for i in 0..count {
        let mut blk = fs.alloc_block();
        {
            let dl = cast_at_mut::<DxLeaf>(&mut blk, 0);
            set_signature(&mut dl.dl_signature, DX_LEAF_SIGNATURE);
            dl.dl_fs_generation = generation;
            dl.dl_blkno = start_blkno + i;
            dl.dl_list.de_count = dx_entries_per_leaf(fs.blocksize);
        }
        write_dx_leaf(fs, start_blkno + i, &blk)?;
        leaves.push(blk);
    }
    Ok(leaves)
}

/// Promotes an inline index root to an extent-backed one.
///
/// A cluster is allocated and formatted as leaves, the inline entries are
/// dealt into them by minor hash, and the root flips to an extent list with
/// a single record covering the whole hash space.
fn expand_inline_dx_root(fs: &FsHandle, dx_root_buf: &mut [u8]) -> Result<(), Ocfs2Error> {
    let (start_blkno, got) = alloc::new_clusters(fs, 1, 1)?;
    debug_assert_eq!(got, 1);

    let mut leaves = format_dx_cluster(fs, start_blkno)?;

    // deal the inline entries into the right blocks
    {
        let list = dx_root_entry_list(dx_root_buf);
        for entry in list.entries() {
            let hinfo = DxHinfo {
                major_hash: entry.dx_major_hash,
                minor_hash: entry.dx_minor_hash,
            };
            let idx = dx_hash_idx(fs, &hinfo) as usize;
            let target = cast_at_mut::<DxLeaf>(&mut leaves[idx], 0);
            entry_list_insert(&mut target.dl_list, &hinfo, entry.dx_dirent_blk);
        }
    }
    // write the leaves before touching the root; until the root converts,
    // the cluster is only an orphan for verification to find
    for (i, leaf) in leaves.iter().enumerate() {
        write_dx_leaf(fs, start_blkno + i as u64, leaf)?;
    }

    let root_blkno = {
        let dr = cast_at_mut::<DxRootBlock>(dx_root_buf, 0);
        dr.dr_flags &= !DX_FLAG_INLINE;
        dr.dr_blkno
    };
    dx_root_buf[DX_ROOT_BODY_OFF..].fill(0);
    {
        let el = dx_root_extent_list_mut(dx_root_buf);
        el.l_count = extent_recs_per_dx_root(fs.blocksize);
    }

    let mut et = extent::ExtentTree::dx_root(fs, dx_root_buf, root_blkno);
    extent::insert_extent(fs, &mut et, 0, start_blkno, 1, 0)
}

/// Finds the index cluster covering `major_hash`, returning its logical
/// position and the block of the leaf the hash lands in.
pub fn dx_dir_lookup(
    fs: &FsHandle,
    dx_root_buf: &[u8],
    hinfo: &DxHinfo,
) -> Result<(u32, u64), Ocfs2Error> {
    let dr = cast_at::<DxRootBlock>(dx_root_buf, 0);
    let root_blkno = dr.dr_blkno;
    let el = dx_root_extent_list(dx_root_buf);

    let (leaf_holder, leaf_off);
    let owned;
    if el.l_tree_depth > 0 {
        owned = extent::tree_find_leaf(fs, dx_root_buf, DX_ROOT_BODY_OFF, root_blkno, hinfo.major_hash)?;
        leaf_holder = owned.as_slice();
        leaf_off = EXTENT_BLOCK_LIST_OFF;
    } else {
        leaf_holder = dx_root_buf;
        leaf_off = DX_ROOT_BODY_OFF;
    }
    let el = cast_at::<ExtentList>(leaf_holder, leaf_off);

    let mut found = None;
    for i in (0..el.l_next_free_rec as usize).rev() {
        let rec = el.recs()[i];
        if rec.e_cpos <= hinfo.major_hash {
            found = Some(rec);
            break;
        }
    }
    let Some(rec) = found else {
        return Err(Ocfs2Error::CorruptedExtentTree(root_blkno));
    };
    Ok((rec.e_cpos, rec.e_blkno + dx_hash_idx(fs, hinfo)))
}

/// Tells whether every entry of a leaf shares one major hash.
fn dx_leaf_same_major(dl_list: &DxEntryList) -> bool {
    let entries = dl_list.entries();
    entries
        .windows(2)
        .all(|pair| pair[0].dx_major_hash == pair[1].dx_major_hash)
}

/// Picks the major hash to split a full leaf at. The entries must be
/// sorted.
///
/// When every entry carries the insertion hash there is no split that
/// makes room, and the directory cannot take the name here.
fn find_leaf_split(
    dl_list: &DxEntryList,
    leaf_cpos: u32,
    insert_hash: u32,
) -> Result<u32, Ocfs2Error> {
    let entries = dl_list.entries();
    let num_used = entries.len();

    if dx_leaf_same_major(dl_list) {
        let val = entries[0].dx_major_hash;
        if val == insert_hash {
            // anywhere we split, the new entry would still want this block
            return Err(Ocfs2Error::NoSpaceOnDevice);
        }
        if val == leaf_cpos {
            // the insertion hash must be larger; split just above the
            // smallest value this leaf can keep
            return Ok(leaf_cpos + 1);
        }
        if val > insert_hash {
            return Ok(val);
        }
        return Ok(insert_hash);
    }

    // pick the first value past the median that can leave the leaf
    for i in num_used / 2..num_used {
        if entries[i].dx_major_hash > leaf_cpos {
            return Ok(entries[i].dx_major_hash);
        }
    }
    Err(Ocfs2Error::NoSpaceOnDevice)
}

/// Allocates a cluster of index leaves keyed at `cpos`.
fn dx_dir_new_cluster(
    fs: &FsHandle,
    dx_root_buf: &mut [u8],
    cpos: u32,
) -> Result<u64, Ocfs2Error> {
    let (start_blkno, got) = alloc::new_clusters(fs, 1, 1)?;
    debug_assert_eq!(got, 1);
    format_dx_cluster(fs, start_blkno)?;

    let root_blkno = cast_at::<DxRootBlock>(dx_root_buf, 0).dr_blkno;
    let mut et = extent::ExtentTree::dx_root(fs, dx_root_buf, root_blkno);
    extent::insert_extent(fs, &mut et, cpos, start_blkno, 1, 0)?;
    Ok(start_blkno)
}

/// Splits the cluster holding a full leaf: entries with a major hash at or
/// past the split move into a freshly keyed cluster.
fn dx_dir_rebalance(
    fs: &FsHandle,
    dx_root_buf: &mut [u8],
    hinfo: &DxHinfo,
    leaf_cpos: u32,
    leaf_blkno: u64,
) -> Result<(), Ocfs2Error> {
    let num_leaves = fs.blocks_per_cluster() as u64;
    let insert_hash = hinfo.major_hash;

    let mut full_leaf = read_dx_leaf(fs, leaf_blkno)?;
    {
        let dl = cast_at_mut::<DxLeaf>(&mut full_leaf, 0);
        if dl.dl_list.de_num_used < dl.dl_list.de_count {
            return Err(Ocfs2Error::EmptyLeafDuringSplit(leaf_blkno));
        }
        let used = dl.dl_list.de_num_used as usize;
        dl.dl_list.entries_mut()[..used]
            .sort_by_key(|e| (e.dx_major_hash, e.dx_minor_hash));
    }
    let split_hash = find_leaf_split(
        &cast_at::<DxLeaf>(&full_leaf, 0).dl_list,
        leaf_cpos,
        insert_hash,
    )?;

    // the original cluster starts at the block the minor hash offset was
    // applied to
    let orig_start = leaf_blkno - dx_hash_idx(fs, hinfo);
    let new_start = dx_dir_new_cluster(fs, dx_root_buf, split_hash)?;

    for i in 0..num_leaves {
        let mut orig = read_dx_leaf(fs, orig_start + i)?;
        let mut new = read_dx_leaf(fs, new_start + i)?;
        {
            let orig_dl = cast_at_mut::<DxLeaf>(&mut orig, 0);
            let keep: Vec<DxEntry> = orig_dl
                .dl_list
                .entries()
                .iter()
                .copied()
                .filter(|e| e.dx_major_hash < split_hash)
                .collect();
            let moved: Vec<DxEntry> = orig_dl
                .dl_list
                .entries()
                .iter()
                .copied()
                .filter(|e| e.dx_major_hash >= split_hash)
                .collect();

            let count = orig_dl.dl_list.de_count as usize;
            for slot in 0..count {
                *orig_dl.dl_list.entry_mut(slot) = DxEntry::default();
            }
            orig_dl.dl_list.de_num_used = 0;
            for e in &keep {
                let hinfo = DxHinfo {
                    major_hash: e.dx_major_hash,
                    minor_hash: e.dx_minor_hash,
                };
                entry_list_insert(&mut orig_dl.dl_list, &hinfo, e.dx_dirent_blk);
            }
            let new_dl = cast_at_mut::<DxLeaf>(&mut new, 0);
            for e in &moved {
                let hinfo = DxHinfo {
                    major_hash: e.dx_major_hash,
                    minor_hash: e.dx_minor_hash,
                };
                entry_list_insert(&mut new_dl.dl_list, &hinfo, e.dx_dirent_blk);
            }
        }
        write_dx_leaf(fs, orig_start + i, &orig)?;
        write_dx_leaf(fs, new_start + i, &new)?;
    }
    Ok(())
}

/// Finds (rebalancing once if needed) the leaf that can take an entry for
/// `hinfo`. Returns its block number.
fn find_dir_space_dx(
    fs: &FsHandle,
    dx_root_buf: &mut [u8],
    hinfo: &DxHinfo,
) -> Result<u64, Ocfs2Error> {
    let mut rebalanced = false;
    loop {
        let (leaf_cpos, blkno) = dx_dir_lookup(fs, dx_root_buf, hinfo)?;
        let leaf = read_dx_leaf(fs, blkno)?;
        let dl = cast_at::<DxLeaf>(&leaf, 0);
        if dl.dl_list.de_num_used < dl.dl_list.de_count {
            return Ok(blkno);
        }
        if rebalanced {
            // rebalancing should have provided room in a matching leaf
            return Err(Ocfs2Error::NoSpaceOnDevice);
        }
        dx_dir_rebalance(fs, dx_root_buf, hinfo, leaf_cpos, blkno)?;
        rebalanced = true;
    }
}

/// Adds `name` (stored in directory block `dirent_blk`) to the index of
/// the directory at `dir`.
pub fn insert_entry(
    fs: &FsHandle,
    dir: u64,
    name: &[u8],
    dirent_blk: u64,
) -> Result<(), Ocfs2Error> {
    let di_buf = inode::read_inode(fs, dir)?;
    let di = cast_at::<Dinode>(&di_buf, 0);
    let dyn_features = DynFeatures::from_bits_truncate(di.i_dyn_features);
    if !dyn_features.contains(DynFeatures::INDEXED_DIR) {
        return Ok(());
    }
    let dx_root_blkno = di.i_dx_root;
    let mut dx_root_buf = read_dx_root(fs, dx_root_blkno)?;
    let hinfo = name_hash(fs, name);

    let mut inline_done = false;
    if cast_at::<DxRootBlock>(&dx_root_buf, 0).dr_flags & DX_FLAG_INLINE != 0 {
        let list = dx_root_entry_list(&dx_root_buf);
        if list.de_num_used < list.de_count {
            entry_list_insert(dx_root_entry_list_mut(&mut dx_root_buf), &hinfo, dirent_blk);
            inline_done = true;
        } else {
            // the root block is full; spill into a leaf cluster
            expand_inline_dx_root(fs, &mut dx_root_buf)?;
        }
    }

    if !inline_done {
        let leaf_blkno = find_dir_space_dx(fs, &mut dx_root_buf, &hinfo)?;
        let mut leaf = read_dx_leaf(fs, leaf_blkno)?;
        {
            let dl = cast_at_mut::<DxLeaf>(&mut leaf, 0);
            entry_list_insert(&mut dl.dl_list, &hinfo, dirent_blk);
        }
        write_dx_leaf(fs, leaf_blkno, &leaf)?;
    }

    cast_at_mut::<DxRootBlock>(&mut dx_root_buf, 0).dr_num_entries += 1;
    write_dx_root(fs, dx_root_blkno, &dx_root_buf)
}

/// The outcome of an index search.
pub struct DxLookupResult {
    /// The hash of the name.
    pub hinfo: DxHinfo,
    /// The directory data block holding the entry.
    pub dirent_blk: u64,
    /// Offset of the entry inside that block.
    pub dirent_off: usize,
    /// The referenced inode.
    pub inode: u64,
    /// Block of the index leaf, 0 when the root is inline.
    pub dx_leaf_blkno: u64,
    /// Index of the hash entry inside its entry list.
    pub dx_entry_idx: usize,
}

/// Finds `name` through the index of the directory at `dir`.
pub fn search(fs: &FsHandle, dir: u64, name: &[u8]) -> Result<DxLookupResult, Ocfs2Error> {
    let di_buf = inode::read_inode(fs, dir)?;
    let di = cast_at::<Dinode>(&di_buf, 0);
    let dyn_features = DynFeatures::from_bits_truncate(di.i_dyn_features);
    if !dyn_features.contains(DynFeatures::INDEXED_DIR) {
        return Err(Ocfs2Error::InodeNotValid(dir));
    }
    let dx_root_buf = read_dx_root(fs, di.i_dx_root)?;
    let hinfo = name_hash(fs, name);

    let inline = cast_at::<DxRootBlock>(&dx_root_buf, 0).dr_flags & DX_FLAG_INLINE != 0;
    let (entries, dx_leaf_blkno) = if inline {
        (dx_root_entry_list(&dx_root_buf).entries().to_vec(), 0)
    } else {
        let (_, blkno) = dx_dir_lookup(fs, &dx_root_buf, &hinfo)?;
        let leaf = read_dx_leaf(fs, blkno)?;
        (
            cast_at::<DxLeaf>(&leaf, 0).dl_list.entries().to_vec(),
            blkno,
        )
    };

    let entry_end = dir::supports_dir_trailer(fs)
        .then(|| dir_trailer_blk_off(fs.blocksize))
        .unwrap_or(fs.blocksize as usize);

    for (i, entry) in entries.iter().enumerate() {
        if entry.dx_major_hash != hinfo.major_hash || entry.dx_minor_hash != hinfo.minor_hash {
            continue;
        }
        let blk = dir::read_dir_block(fs, &di_buf, entry.dx_dirent_blk)?;
        if let Some(off) = dir::search_dirblock(fs, &blk, name, entry_end)? {
            let de = cast_at::<DirEntry>(&blk, off);
            return Ok(DxLookupResult {
                hinfo,
                dirent_blk: entry.dx_dirent_blk,
                dirent_off: off,
                inode: de.inode,
                dx_leaf_blkno,
                dx_entry_idx: i,
            });
        }
    }
    Err(Ocfs2Error::DirentNotFound)
}

/// Removes `name` from the index of the directory at `dir`.
pub fn remove_entry(fs: &FsHandle, dir: u64, name: &[u8]) -> Result<(), Ocfs2Error> {
    let found = search(fs, dir, name)?;

    let di_buf = inode::read_inode(fs, dir)?;
    let dx_root_blkno = cast_at::<Dinode>(&di_buf, 0).i_dx_root;
    let mut dx_root_buf = read_dx_root(fs, dx_root_blkno)?;

    if found.dx_leaf_blkno == 0 {
        entry_list_remove(dx_root_entry_list_mut(&mut dx_root_buf), found.dx_entry_idx);
    } else {
        let mut leaf = read_dx_leaf(fs, found.dx_leaf_blkno)?;
        {
            let dl = cast_at_mut::<DxLeaf>(&mut leaf, 0);
            entry_list_remove(&mut dl.dl_list, found.dx_entry_idx);
        }
        write_dx_leaf(fs, found.dx_leaf_blkno, &leaf)?;
    }
    cast_at_mut::<DxRootBlock>(&mut dx_root_buf, 0).dr_num_entries -= 1;
    write_dx_root(fs, dx_root_blkno, &dx_root_buf)
}

/// Tears the whole index down: leaf clusters and interior blocks go back
/// to their allocators and the inode sheds the indexed-dir feature.
pub fn truncate(fs: &FsHandle, dir: u64) -> Result<(), Ocfs2Error> {
    let mut di_buf = inode::read_inode(fs, dir)?;
    let di = cast_at::<Dinode>(&di_buf, 0);
    let dyn_features = DynFeatures::from_bits_truncate(di.i_dyn_features);
    if !di.is_dir()
        || !dyn_features.contains(DynFeatures::INDEXED_DIR)
        || dyn_features.contains(DynFeatures::INLINE_DATA)
    {
        return Ok(());
    }
    let dx_root_blkno = di.i_dx_root;

    // the inode drops its reference first; whatever fails afterwards only
    // leaves orphans
    {
        let di = cast_at_mut::<Dinode>(&mut di_buf, 0);
        di.i_dyn_features &= !DynFeatures::INDEXED_DIR.bits();
        di.i_dx_root = 0;
    }
    inode::write_inode(fs, dir, &di_buf)?;

    let dx_root_buf = read_dx_root(fs, dx_root_blkno)?;
    let dr = cast_at::<DxRootBlock>(&dx_root_buf, 0);
    if dr.dr_flags & DX_FLAG_INLINE == 0 {
        let mut data = Vec::new();
        let mut interior = Vec::new();
        extent::extent_tree_iterate(
            fs,
            &dx_root_buf,
            DX_ROOT_BODY_OFF,
            dx_root_blkno,
            &mut |rec, depth| {
                if depth == 0 {
                    data.push((rec.e_blkno, rec.e_leaf_clusters as u32));
                } else {
                    interior.push(rec.e_blkno);
                }
                Ok(extent::IterAction::Continue)
            },
        )?;
        for (blkno, clusters) in data {
            alloc::free_clusters(fs, clusters, blkno)?;
        }
        for blkno in interior {
            alloc::free_extent_block(fs, blkno)?;
        }
    }
    alloc::free_dx_root(fs, dx_root_blkno)
}

/// Builds an index over an existing, unindexed directory.
pub fn build(fs: &FsHandle, dir: u64) -> Result<(), Ocfs2Error> {
    let mut di_buf = inode::read_inode(fs, dir)?;
    let di = cast_at::<Dinode>(&di_buf, 0);
    let dyn_features = DynFeatures::from_bits_truncate(di.i_dyn_features);
    if dyn_features.contains(DynFeatures::INDEXED_DIR)
        || dyn_features.contains(DynFeatures::INLINE_DATA)
    {
        return Ok(());
    }

    let (dr_blkno, _) = alloc::new_dx_root(fs, dir)?;
    {
        let di = cast_at_mut::<Dinode>(&mut di_buf, 0);
        di.i_dx_root = dr_blkno;
        di.i_dyn_features |= DynFeatures::INDEXED_DIR.bits();
    }
    inode::write_inode(fs, dir, &di_buf)?;

    // every live entry feeds the index; `.` and `..` stay out
    let mut names = Vec::new();
    dir::dir_iterate(fs, dir, dir::DirIterFlags::empty(), &mut |blk, _, de| {
        if de.name() != b"." && de.name() != b".." {
            names.push((de.name().to_vec(), blk));
        }
        Ok(dir::DirentAction::Continue)
    })?;
    for (name, blk) in names {
        insert_entry(fs, dir, &name, blk)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashbuf_short_names() {
        // a short name fills one lane and pads the rest
        let mut buf = [0u32; 8];
        str2hashbuf(b"a", 1, &mut buf, 4);
        let pad = 0x01010101u32;
        assert_eq!(buf[0], (pad << 8).wrapping_add(b'a' as u32));
        assert_eq!(buf[1], pad);
        assert_eq!(buf[2], pad);
        assert_eq!(buf[3], pad);
    }

    #[test]
    fn hashbuf_exact_lane() {
        let mut buf = [0u32; 8];
        str2hashbuf(b"abcd", 4, &mut buf, 4);
        // the pad seeds the lane, the name bytes shift in behind it
        let mut val = 0x04040404u32;
        for b in b"abcd" {
            val = (*b as u32).wrapping_add(val << 8);
        }
        assert_eq!(buf[0], val);
        assert_eq!(buf[1], 0x04040404);
    }

    #[test]
    fn tea_mixes() {
        let mut a = [1u32, 2, 3, 4];
        let mut b = [1u32, 2, 3, 4];
        tea_transform(&mut a, &[0; 8]);
        tea_transform(&mut b, &[1, 0, 0, 0, 0, 0, 0, 0]);
        assert_ne!(a, b);
        // only the first two lanes accumulate
        assert_eq!(a[2], 3);
        assert_eq!(a[3], 4);
    }
}

#[cfg(test)]
mod engine_tests {
    use super::*;
    use crate::dir::FT_REG_FILE;
    use crate::format::test_support::scratch_volume;
    use crate::fs::OpenFlags;

    #[test]
    fn build_and_search() {
        let tmp = scratch_volume(16 << 20, 4096, 4096);
        let fs = FsHandle::open(tmp.path(), OpenFlags::RW, 0, 0).unwrap();

        let names: Vec<String> = (0..20).map(|i| format!("indexed_{i}")).collect();
        for (i, name) in names.iter().enumerate() {
            dir::link(&fs, fs.root_blkno, name.as_bytes(), 2000 + i as u64, FT_REG_FILE)
                .unwrap();
        }
        build(&fs, fs.root_blkno).unwrap();

        for (i, name) in names.iter().enumerate() {
            let found = search(&fs, fs.root_blkno, name.as_bytes()).unwrap();
            assert_eq!(found.inode, 2000 + i as u64);
        }
        // a name that was never inserted
        assert!(matches!(
            search(&fs, fs.root_blkno, b"missing"),
            Err(Ocfs2Error::DirentNotFound)
        ));
    }

    #[test]
    fn inline_root_promotes_and_rebalances() {
        // tiny index root: a few hundred names force leaf splits
        let tmp = scratch_volume(64 << 20, 512, 4096);
        let fs = FsHandle::open(tmp.path(), OpenFlags::RW, 0, 0).unwrap();

        dir::link(&fs, fs.root_blkno, b"seed", 1, FT_REG_FILE).unwrap();
        build(&fs, fs.root_blkno).unwrap();

        let names: Vec<String> = (0..300).map(|i| format!("file_{i:04}")).collect();
        for (i, name) in names.iter().enumerate() {
            dir::link(&fs, fs.root_blkno, name.as_bytes(), 3000 + i as u64, FT_REG_FILE)
                .unwrap();
        }

        // the root must have spilled out of its inline form
        let di_buf = inode::read_inode(&fs, fs.root_blkno).unwrap();
        let dx_root_blkno = cast_at::<Dinode>(&di_buf, 0).i_dx_root;
        let dx_root = read_dx_root(&fs, dx_root_blkno).unwrap();
        assert_eq!(
            cast_at::<DxRootBlock>(&dx_root, 0).dr_flags & DX_FLAG_INLINE,
            0
        );

        for (i, name) in names.iter().enumerate() {
            let found = search(&fs, fs.root_blkno, name.as_bytes()).unwrap();
            assert_eq!(found.inode, 3000 + i as u64);
        }

        // removal through the plain directory path also maintains the index
        dir::unlink(&fs, fs.root_blkno, names[42].as_bytes()).unwrap();
        assert!(matches!(
            search(&fs, fs.root_blkno, names[42].as_bytes()),
            Err(Ocfs2Error::DirentNotFound)
        ));
        let found = search(&fs, fs.root_blkno, names[43].as_bytes()).unwrap();
        assert_eq!(found.inode, 3043);
    }

    #[test]
    fn truncate_drops_the_index() {
        let tmp = scratch_volume(16 << 20, 4096, 4096);
        let fs = FsHandle::open(tmp.path(), OpenFlags::RW, 0, 0).unwrap();

        for i in 0..10 {
            let name = format!("victim_{i}");
            dir::link(&fs, fs.root_blkno, name.as_bytes(), 4000 + i, FT_REG_FILE).unwrap();
        }
        build(&fs, fs.root_blkno).unwrap();
        truncate(&fs, fs.root_blkno).unwrap();

        let di_buf = inode::read_inode(&fs, fs.root_blkno).unwrap();
        let di = cast_at::<Dinode>(&di_buf, 0);
        assert_eq!({ di.i_dx_root }, 0);
        assert!(!DynFeatures::from_bits_truncate(di.i_dyn_features)
            .contains(DynFeatures::INDEXED_DIR));

        // the names stay reachable through the plain directory
        assert_eq!(dir::lookup(&fs, fs.root_blkno, b"victim_3").unwrap(), 4003);
    }
}
