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

//! Directory blocks and entries.
//!
//! Entries are variable-length records chained by `rec_len`. When the
//! filesystem carries checked metadata or indexed directories, every
//! directory data block ends in a signed trailer that doubles as an unused
//! entry, so record walks skip it transparently.

use crate::alloc;
use crate::byteorder::cpu_is_little_endian;
use crate::dir_indexed;
use crate::error::Ocfs2Error;
use crate::extent;
use crate::fs::FsHandle;
use crate::inode;
use crate::ondisk::*;
use crate::util::cast_at;
use crate::util::cast_at_mut;
use std::mem::offset_of;

/// File type hint: unknown.
pub const FT_UNKNOWN: u8 = 0;
/// File type hint: regular file.
pub const FT_REG_FILE: u8 = 1;
/// File type hint: directory.
pub const FT_DIR: u8 = 2;
/// File type hint: symbolic link.
pub const FT_SYMLINK: u8 = 7;

/// Offset of the check field inside a directory block trailer.
pub const DIR_TRAILER_CHECK_OFF: usize = offset_of!(DirBlockTrailer, db_check);

/// Tells whether this filesystem stamps trailers into directory blocks.
pub fn supports_dir_trailer(fs: &FsHandle) -> bool {
    fs.with_super(|sb| {
        let incompat = FeatureIncompat::from_bits_truncate(sb.s_feature_incompat);
        incompat.contains(FeatureIncompat::META_ECC)
            || incompat.contains(FeatureIncompat::INDEXED_DIRS)
    })
}

/// Tells whether the directory described by `di_buf` keeps trailers in its
/// blocks. Inline directories have no blocks at all.
pub fn dir_has_trailer(fs: &FsHandle, di_buf: &[u8]) -> bool {
    let di = cast_at::<Dinode>(di_buf, 0);
    let dyn_features = DynFeatures::from_bits_truncate(di.i_dyn_features);
    !dyn_features.contains(DynFeatures::INLINE_DATA) && supports_dir_trailer(fs)
}

/// Byte span of a directory block holding entries.
fn entry_area_end(fs: &FsHandle, with_trailer: bool) -> usize {
    if with_trailer {
        dir_trailer_blk_off(fs.blocksize)
    } else {
        fs.blocksize as usize
    }
}

fn swap_dir_entry(de: &mut DirEntry) {
    de.inode = de.inode.swap_bytes();
    de.rec_len = de.rec_len.swap_bytes();
}

fn swap_dir_entries(buf: &mut [u8], to_native: bool) -> bool {
    let mut ok = true;
    let end = buf.len();
    let mut off = 0;
    // entries shorter than a header cannot exist at the tail
    while off + DIR_ENTRY_HEADER_LEN <= end {
        let de = cast_at_mut::<DirEntry>(buf, off);
        if to_native {
            swap_dir_entry(de);
        }
        let name_len = de.name_len as usize;
        let mut rec_len = de.rec_len as usize;
        if !to_native {
            swap_dir_entry(de);
        }
        if rec_len < DIR_ENTRY_HEADER_LEN || rec_len % 4 != 0 {
            rec_len = DIR_ENTRY_HEADER_LEN;
            ok = false;
        }
        if name_len + DIR_ENTRY_HEADER_LEN > rec_len {
            ok = false;
        }
        off += rec_len;
    }
    ok
}

/// Swaps a run of directory entries to host endianness.
///
/// A corrupt record length degrades the walk to header-sized steps and is
/// reported through the return value, mirroring the tolerant on-disk walk.
pub fn swap_dir_entries_to_native(buf: &mut [u8]) -> bool {
    if cpu_is_little_endian() {
        return true;
    }
    swap_dir_entries(buf, true)
}

/// Swaps a run of directory entries back to disk endianness.
pub fn swap_dir_entries_from_native(buf: &mut [u8]) -> bool {
    if cpu_is_little_endian() {
        return true;
    }
    swap_dir_entries(buf, false)
}

fn swap_dir_trailer(t: &mut DirBlockTrailer) {
    t.db_compat_inode = t.db_compat_inode.swap_bytes();
    t.db_compat_rec_len = t.db_compat_rec_len.swap_bytes();
    t.db_free_rec_len = t.db_free_rec_len.swap_bytes();
    t.db_free_next = t.db_free_next.swap_bytes();
    t.db_blkno = t.db_blkno.swap_bytes();
    t.db_parent_dinode = t.db_parent_dinode.swap_bytes();
}

/// Reads a directory data block, validating the trailer when one is
/// expected.
pub fn read_dir_block(
    fs: &FsHandle,
    di_buf: &[u8],
    blkno: u64,
) -> Result<Vec<u8>, Ocfs2Error> {
    fs.check_blkno(blkno)?;
    let mut blk = fs.alloc_block();
    fs.read_blocks(blkno, 1, &mut blk)?;

    let with_trailer = dir_has_trailer(fs, di_buf);
    if with_trailer {
        let check_off = blk.len() - DIR_TRAILER_LEN + DIR_TRAILER_CHECK_OFF;
        fs.validate_meta_ecc(&mut blk, check_off, blkno)?;
        let trailer = dir_trailer(&blk);
        if !signature_matches(&trailer.db_signature, DIR_TRAILER_SIGNATURE) {
            return Err(Ocfs2Error::BadSignature {
                blkno,
                expected: DIR_TRAILER_SIGNATURE,
            });
        }
    }

    let end = entry_area_end(fs, with_trailer);
    if !swap_dir_entries_to_native(&mut blk[..end]) {
        return Err(Ocfs2Error::CorruptedDirectory(blkno));
    }
    if with_trailer && !cpu_is_little_endian() {
        swap_dir_trailer(dir_trailer_mut(&mut blk));
    }
    Ok(blk)
}

/// Writes a directory data block, re-stamping the trailer when one is
/// expected.
pub fn write_dir_block(
    fs: &FsHandle,
    di_buf: &[u8],
    blkno: u64,
    buf: &[u8],
) -> Result<(), Ocfs2Error> {
    if !fs.writable() {
        return Err(Ocfs2Error::ReadOnlyFilesystem);
    }
    fs.check_blkno(blkno)?;

    let mut blk = buf.to_vec();
    let with_trailer = dir_has_trailer(fs, di_buf);
    let end = entry_area_end(fs, with_trailer);
    if with_trailer {
        // the free-space summary rides along on every write
        let largest = find_max_rec_len(fs, &blk, true);
        dir_trailer_mut(&mut blk).db_free_rec_len = largest as u16;
    }
    if !swap_dir_entries_from_native(&mut blk[..end]) {
        return Err(Ocfs2Error::CorruptedDirectory(blkno));
    }
    if with_trailer {
        if !cpu_is_little_endian() {
            swap_dir_trailer(dir_trailer_mut(&mut blk));
        }
        let check_off = blk.len() - DIR_TRAILER_LEN + DIR_TRAILER_CHECK_OFF;
        fs.compute_meta_ecc(&mut blk, check_off);
    }
    fs.write_blocks(blkno, 1, &blk)
}

/// Structural check of one entry at `offset` of a directory block.
pub fn check_dir_entry(fs: &FsHandle, de: &DirEntry, offset: usize) -> bool {
    let rec_len = de.rec_len as usize;
    rec_len >= DIR_MIN_REC_LEN
        && rec_len % 4 == 0
        && rec_len >= dir_rec_len(de.name_len as usize)
        && offset + rec_len <= fs.blocksize as usize
}

/// Continuation decision of a directory iteration callback.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DirentAction {
    /// Keep going.
    Continue,
    /// The callback changed the entry; rewrite the containing block.
    Changed,
    /// Stop cleanly.
    Abort,
}

bitflags::bitflags! {
    /// Flags controlling directory iteration.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct DirIterFlags: u32 {
        /// Also yield unused entries.
        const INCLUDE_EMPTY = 0x01;
    }
}

/// Walks the entries stored in `area`, which belongs to block
/// `block_blkno` of a directory. The callback sees the containing block.
fn iterate_area(
    fs: &FsHandle,
    block_blkno: u64,
    area: &mut [u8],
    flags: DirIterFlags,
    func: &mut dyn FnMut(u64, usize, &mut DirEntry) -> Result<DirentAction, Ocfs2Error>,
) -> Result<(bool, bool), Ocfs2Error> {
    let mut changed = false;
    let mut offset = 0;
    let end = area.len();
    while offset + DIR_ENTRY_HEADER_LEN <= end {
        let de = cast_at_mut::<DirEntry>(area, offset);
        if !check_dir_entry(fs, de, offset) {
            return Err(Ocfs2Error::CorruptedDirectory(block_blkno));
        }
        let rec_len = de.rec_len as usize;
        if de.inode != 0 || flags.contains(DirIterFlags::INCLUDE_EMPTY) {
            match func(block_blkno, offset, de)? {
                DirentAction::Continue => {}
                DirentAction::Changed => changed = true,
                DirentAction::Abort => return Ok((changed, true)),
            }
        }
        offset += rec_len;
    }
    Ok((changed, false))
}

/// Iterates over the live entries of the directory at `dir`.
///
/// The callback receives the directory block, the entry offset inside it
/// and the entry itself, and steers the walk through its [`DirentAction`]
/// result. Blocks whose entries were changed are rewritten.
pub fn dir_iterate(
    fs: &FsHandle,
    dir: u64,
    flags: DirIterFlags,
    func: &mut dyn FnMut(u64, usize, &mut DirEntry) -> Result<DirentAction, Ocfs2Error>,
) -> Result<(), Ocfs2Error> {
    inode::check_directory(fs, dir)?;
    let mut di_buf = inode::read_inode(fs, dir)?;
    let di = cast_at::<Dinode>(&di_buf, 0);
    let dyn_features = DynFeatures::from_bits_truncate(di.i_dyn_features);

    if dyn_features.contains(DynFeatures::INLINE_DATA) {
        let count = inode_inline_data(&di_buf).id_count as usize;
        let end = INLINE_DATA_OFF + count.min(max_inline_data(fs.blocksize));
        let (changed, _) =
            iterate_area(fs, dir, &mut di_buf[INLINE_DATA_OFF..end], flags, func)?;
        if changed {
            inode::write_inode(fs, dir, &di_buf)?;
        }
        return Ok(());
    }

    let with_trailer = dir_has_trailer(fs, &di_buf);
    let end = entry_area_end(fs, with_trailer);
    let mut blocks = Vec::new();
    extent::block_iterate(fs, &di_buf, &mut |pblk, vblk| {
        // entries only exist below i_size
        if vblk * fs.blocksize as u64 >= cast_at::<Dinode>(&di_buf, 0).i_size {
            return Ok(extent::IterAction::Abort);
        }
        blocks.push(pblk);
        Ok(extent::IterAction::Continue)
    })?;

    for pblk in blocks {
        let mut blk = read_dir_block(fs, &di_buf, pblk)?;
        let (changed, abort) = iterate_area(fs, pblk, &mut blk[..end], flags, func)?;
        if changed {
            write_dir_block(fs, &di_buf, pblk, &blk)?;
        }
        if abort {
            break;
        }
    }
    Ok(())
}

/// Finds `name` in the directory at `dir` and returns its inode block.
pub fn lookup(fs: &FsHandle, dir: u64, name: &[u8]) -> Result<u64, Ocfs2Error> {
    if name.is_empty() || name.len() > MAX_FILENAME_LEN {
        return Err(Ocfs2Error::InvalidArgument("bad name length"));
    }
    let mut found = None;
    dir_iterate(fs, dir, DirIterFlags::empty(), &mut |_, _, de| {
        if de.name() == name {
            found = Some(de.inode);
            return Ok(DirentAction::Abort);
        }
        Ok(DirentAction::Continue)
    })?;
    found.ok_or(Ocfs2Error::DirentNotFound)
}

/// Searches one directory block buffer for `name`, returning the offset of
/// the matching entry.
pub fn search_dirblock(
    fs: &FsHandle,
    buf: &[u8],
    name: &[u8],
    bytes: usize,
) -> Result<Option<usize>, Ocfs2Error> {
    let mut offset = 0;
    while offset + DIR_ENTRY_HEADER_LEN <= bytes {
        let de = cast_at::<DirEntry>(buf, offset);
        if !check_dir_entry(fs, de, offset) {
            return Err(Ocfs2Error::CorruptedDirectory(0));
        }
        if de.inode != 0 && de.name() == name {
            return Ok(Some(offset));
        }
        offset += de.rec_len as usize;
    }
    Ok(None)
}

/// Initialises the trailer fields of a directory block. The check data is
/// stamped when the block is written.
pub fn init_dir_trailer(fs: &FsHandle, dir_blkno: u64, blkno: u64, buf: &mut [u8]) {
    let bs = fs.blocksize;
    let trailer = dir_trailer_mut(buf);
    *trailer = DirBlockTrailer::default();
    trailer.db_compat_rec_len = DIR_TRAILER_LEN as u16;
    set_signature(&mut trailer.db_signature, DIR_TRAILER_SIGNATURE);
    trailer.db_blkno = blkno;
    trailer.db_parent_dinode = dir_blkno;
    let _ = bs;
}

/// Returns the largest hole an entry walk can find in a directory block.
pub fn find_max_rec_len(fs: &FsHandle, buf: &[u8], with_trailer: bool) -> usize {
    let end = entry_area_end(fs, with_trailer);
    let mut largest = 0;
    let mut offset = 0;
    while offset + DIR_ENTRY_HEADER_LEN <= end {
        let de = cast_at::<DirEntry>(buf, offset);
        let rec_len = de.rec_len as usize;
        if rec_len < DIR_ENTRY_HEADER_LEN {
            break;
        }
        let hole = if de.inode == 0 {
            rec_len
        } else {
            rec_len - dir_rec_len(de.name_len as usize)
        };
        largest = largest.max(hole);
        offset += rec_len;
    }
    if largest >= DIR_MIN_REC_LEN {
        largest
    } else {
        0
    }
}

/// Builds an empty directory data block: one unused entry spanning the
/// whole entry area, plus a trailer when the filesystem keeps them.
pub fn empty_dir_block(fs: &FsHandle, dir_blkno: u64, blkno: u64, with_trailer: bool) -> Vec<u8> {
    let mut buf = fs.alloc_block();
    let end = entry_area_end(fs, with_trailer);
    {
        let de = cast_at_mut::<DirEntry>(&mut buf, 0);
        de.inode = 0;
        de.rec_len = end as u16;
    }
    if with_trailer {
        init_dir_trailer(fs, dir_blkno, blkno, &mut buf);
    }
    buf
}

/// Builds the first data block of a new directory, holding `.` and `..`.
pub fn new_dir_block(
    fs: &FsHandle,
    dir_blkno: u64,
    parent_blkno: u64,
    blkno: u64,
    with_trailer: bool,
) -> Vec<u8> {
    let mut buf = empty_dir_block(fs, dir_blkno, blkno, with_trailer);
    let end = entry_area_end(fs, with_trailer);
    {
        let de = cast_at_mut::<DirEntry>(&mut buf, 0);
        de.inode = dir_blkno;
        de.rec_len = dir_rec_len(1) as u16;
        de.file_type = FT_DIR;
        de.set_name(b".");
    }
    {
        let de = cast_at_mut::<DirEntry>(&mut buf, dir_rec_len(1));
        de.inode = parent_blkno;
        de.rec_len = (end - dir_rec_len(1)) as u16;
        de.file_type = FT_DIR;
        de.set_name(b"..");
    }
    buf
}

/// Fills the inode body of a new inline directory with `.` and `..`.
pub fn fill_inline_dir(fs: &FsHandle, di_buf: &mut [u8], dir_blkno: u64, parent_blkno: u64) {
    let count = max_inline_data(fs.blocksize) as u16;
    {
        let id = inode_inline_data_mut(di_buf);
        id.id_count = count;
    }
    {
        let de = cast_at_mut::<DirEntry>(di_buf, INLINE_DATA_OFF);
        de.inode = dir_blkno;
        de.rec_len = dir_rec_len(1) as u16;
        de.file_type = FT_DIR;
        de.set_name(b".");
    }
    {
        let de = cast_at_mut::<DirEntry>(di_buf, INLINE_DATA_OFF + dir_rec_len(1));
        de.inode = parent_blkno;
        de.rec_len = count - dir_rec_len(1) as u16;
        de.file_type = FT_DIR;
        de.set_name(b"..");
    }
}

/// Tries to place an entry for `name` in the entry run of `area`.
///
/// Returns the offset of the new entry on success.
fn insert_into_area(area: &mut [u8], name: &[u8], ino: u64, file_type: u8) -> Option<usize> {
    let needed = dir_rec_len(name.len());
    let end = area.len();
    let mut offset = 0;
    while offset + DIR_ENTRY_HEADER_LEN <= end {
        let de = cast_at::<DirEntry>(area, offset);
        let rec_len = de.rec_len as usize;
        if rec_len < DIR_ENTRY_HEADER_LEN {
            return None;
        }
        if de.inode == 0 && rec_len >= needed {
            // take over the unused record
            let de = cast_at_mut::<DirEntry>(area, offset);
            de.inode = ino;
            de.file_type = file_type;
            de.set_name(name);
            return Some(offset);
        }
        let used = dir_rec_len(de.name_len as usize);
        if de.inode != 0 && rec_len - used >= needed {
            // split the slack behind the live entry
            let new_off = offset + used;
            {
                let de = cast_at_mut::<DirEntry>(area, offset);
                de.rec_len = used as u16;
            }
            let de = cast_at_mut::<DirEntry>(area, new_off);
            de.inode = ino;
            de.rec_len = (rec_len - used) as u16;
            de.file_type = file_type;
            de.set_name(name);
            return Some(new_off);
        }
        offset += rec_len;
    }
    None
}

/// Converts an inline directory into an extent-backed one.
///
/// A cluster is allocated, the inline entries move into its first block
/// (the last record stretched over the new space), and the remaining
/// blocks are formatted empty. The inode flips to an extent list root.
pub fn expand_inline_dir(fs: &FsHandle, dir: u64) -> Result<(), Ocfs2Error> {
    let mut di_buf = inode::read_inode(fs, dir)?;
    let di = cast_at::<Dinode>(&di_buf, 0);
    let dyn_features = DynFeatures::from_bits_truncate(di.i_dyn_features);
    if !dyn_features.contains(DynFeatures::INLINE_DATA) {
        return Err(Ocfs2Error::InodeNotValid(dir));
    }

    let (first_blkno, got) = alloc::new_clusters(fs, 1, 1)?;
    debug_assert_eq!(got, 1);

    let with_trailer = supports_dir_trailer(fs);
    let end = entry_area_end(fs, with_trailer);

    // move the inline entries into the first block
    let inline_bytes = (inode_inline_data(&di_buf).id_count as usize)
        .min(max_inline_data(fs.blocksize));
    let mut first = empty_dir_block(fs, dir, first_blkno, with_trailer);
    first[..inline_bytes].copy_from_slice(&di_buf[INLINE_DATA_OFF..INLINE_DATA_OFF + inline_bytes]);
    stretch_last_entry(&mut first[..end], inline_bytes)?;

    // the inode flips in memory before the block writes, so the block
    // writer already sees a trailer-carrying directory
    {
        let di = cast_at_mut::<Dinode>(&mut di_buf, 0);
        di.i_dyn_features &= !DynFeatures::INLINE_DATA.bits();
        di.i_size = fs.clustersize as u64;
    }
    write_dir_block(fs, &di_buf, first_blkno, &first)?;
    for i in 1..fs.blocks_per_cluster() as u64 {
        let blkno = first_blkno + i;
        let blk = empty_dir_block(fs, dir, blkno, with_trailer);
        write_dir_block(fs, &di_buf, blkno, &blk)?;
    }

    di_buf[INODE_BODY_OFF..].fill(0);
    {
        let el = inode_extent_list_mut(&mut di_buf);
        el.l_count = extent_recs_per_inode(fs.blocksize);
    }
    inode::write_inode(fs, dir, &di_buf)?;

    let mut et = extent::ExtentTree::dinode(fs, &mut di_buf, dir);
    extent::insert_extent(fs, &mut et, 0, first_blkno, 1, 0)
}

/// Stretches the final record of an entry run out to the end of the run.
fn stretch_last_entry(area: &mut [u8], used_bytes: usize) -> Result<(), Ocfs2Error> {
    let end = area.len();
    let mut offset = 0;
    let mut last = 0;
    while offset + DIR_ENTRY_HEADER_LEN <= used_bytes.min(end) {
        let de = cast_at::<DirEntry>(area, offset);
        let rec_len = de.rec_len as usize;
        if rec_len < DIR_ENTRY_HEADER_LEN {
            return Err(Ocfs2Error::CorruptedDirectory(0));
        }
        last = offset;
        if offset + rec_len >= used_bytes {
            break;
        }
        offset += rec_len;
    }
    let de = cast_at_mut::<DirEntry>(area, last);
    de.rec_len = (end - last) as u16;
    Ok(())
}

/// Adds the entry `name` → `ino` to the directory at `dir`.
///
/// An inline directory that runs out of body space is promoted to an
/// extent-backed one; an extent-backed directory that runs out of block
/// space grows by one cluster. The directory index follows when present.
pub fn link(
    fs: &FsHandle,
    dir: u64,
    name: &[u8],
    ino: u64,
    file_type: u8,
) -> Result<(), Ocfs2Error> {
    if name.is_empty() || name.len() > MAX_FILENAME_LEN {
        return Err(Ocfs2Error::InvalidArgument("bad name length"));
    }
    inode::check_directory(fs, dir)?;

    let mut di_buf = inode::read_inode(fs, dir)?;
    let di = cast_at::<Dinode>(&di_buf, 0);
    let dyn_features = DynFeatures::from_bits_truncate(di.i_dyn_features);

    if dyn_features.contains(DynFeatures::INLINE_DATA) {
        let count = inode_inline_data(&di_buf).id_count as usize;
        let end = INLINE_DATA_OFF + count.min(max_inline_data(fs.blocksize));
        if let Some(_) =
            insert_into_area(&mut di_buf[INLINE_DATA_OFF..end], name, ino, file_type)
        {
            return inode::write_inode(fs, dir, &di_buf);
        }
        // no room left inside the inode
        expand_inline_dir(fs, dir)?;
        di_buf = inode::read_inode(fs, dir)?;
    }

    let with_trailer = dir_has_trailer(fs, &di_buf);
    let end = entry_area_end(fs, with_trailer);

    let mut blocks = Vec::new();
    extent::block_iterate(fs, &di_buf, &mut |pblk, vblk| {
        if vblk * fs.blocksize as u64 >= cast_at::<Dinode>(&di_buf, 0).i_size {
            return Ok(extent::IterAction::Abort);
        }
        blocks.push(pblk);
        Ok(extent::IterAction::Continue)
    })?;

    let mut target = None;
    for pblk in &blocks {
        let mut blk = read_dir_block(fs, &di_buf, *pblk)?;
        if let Some(off) = insert_into_area(&mut blk[..end], name, ino, file_type) {
            write_dir_block(fs, &di_buf, *pblk, &blk)?;
            target = Some((*pblk, off));
            break;
        }
    }

    let (entry_blkno, _) = match target {
        Some(t) => t,
        None => {
            // grow the directory by one cluster of fresh blocks
            let mut ci = inode::CachedInode {
                blkno: dir,
                buf: di_buf.clone(),
            };
            alloc::extend_allocation(fs, &mut ci, 1)?;
            ci.dinode_mut().i_size += fs.clustersize as u64;
            ci.write(fs)?;
            di_buf = ci.buf;

            let first_new = extent::extent_map_block(
                fs,
                &di_buf,
                (cast_at::<Dinode>(&di_buf, 0).i_size - fs.clustersize as u64)
                    / fs.blocksize as u64,
            )?
            .ok_or(Ocfs2Error::CorruptedExtentTree(dir))?;
            for i in 0..fs.blocks_per_cluster() as u64 {
                let blkno = first_new + i;
                let blk = empty_dir_block(fs, dir, blkno, with_trailer);
                write_dir_block(fs, &di_buf, blkno, &blk)?;
            }
            let mut blk = read_dir_block(fs, &di_buf, first_new)?;
            let off = insert_into_area(&mut blk[..end], name, ino, file_type)
                .ok_or(Ocfs2Error::CorruptedDirectory(first_new))?;
            write_dir_block(fs, &di_buf, first_new, &blk)?;
            (first_new, off)
        }
    };

    // keep the hash index in step
    let di = cast_at::<Dinode>(&di_buf, 0);
    let dyn_features = DynFeatures::from_bits_truncate(di.i_dyn_features);
    if dyn_features.contains(DynFeatures::INDEXED_DIR) {
        dir_indexed::insert_entry(fs, dir, name, entry_blkno)?;
    }
    Ok(())
}

/// Removes the entry `name` from the directory at `dir`.
///
/// The record is absorbed into its predecessor, or marked unused when it
/// leads its block.
pub fn unlink(fs: &FsHandle, dir: u64, name: &[u8]) -> Result<(), Ocfs2Error> {
    if name.is_empty() || name.len() > MAX_FILENAME_LEN {
        return Err(Ocfs2Error::InvalidArgument("bad name length"));
    }
    inode::check_directory(fs, dir)?;

    let mut di_buf = inode::read_inode(fs, dir)?;
    let di = cast_at::<Dinode>(&di_buf, 0);
    let dyn_features = DynFeatures::from_bits_truncate(di.i_dyn_features);

    if dyn_features.contains(DynFeatures::INDEXED_DIR) {
        dir_indexed::remove_entry(fs, dir, name)?;
        di_buf = inode::read_inode(fs, dir)?;
    }

    if DynFeatures::from_bits_truncate(cast_at::<Dinode>(&di_buf, 0).i_dyn_features)
        .contains(DynFeatures::INLINE_DATA)
    {
        let count = inode_inline_data(&di_buf).id_count as usize;
        let end = INLINE_DATA_OFF + count.min(max_inline_data(fs.blocksize));
        if remove_from_area(&mut di_buf[INLINE_DATA_OFF..end], name)? {
            return inode::write_inode(fs, dir, &di_buf);
        }
        return Err(Ocfs2Error::DirentNotFound);
    }

    let with_trailer = dir_has_trailer(fs, &di_buf);
    let end = entry_area_end(fs, with_trailer);
    let mut blocks = Vec::new();
    extent::block_iterate(fs, &di_buf, &mut |pblk, vblk| {
        if vblk * fs.blocksize as u64 >= cast_at::<Dinode>(&di_buf, 0).i_size {
            return Ok(extent::IterAction::Abort);
        }
        blocks.push(pblk);
        Ok(extent::IterAction::Continue)
    })?;

    for pblk in blocks {
        let mut blk = read_dir_block(fs, &di_buf, pblk)?;
        if remove_from_area(&mut blk[..end], name)? {
            write_dir_block(fs, &di_buf, pblk, &blk)?;
            return Ok(());
        }
    }
    Err(Ocfs2Error::DirentNotFound)
}

/// Removes `name` from an entry run. Returns whether it was found.
fn remove_from_area(area: &mut [u8], name: &[u8]) -> Result<bool, Ocfs2Error> {
    let end = area.len();
    let mut prev: Option<usize> = None;
    let mut offset = 0;
    while offset + DIR_ENTRY_HEADER_LEN <= end {
        let de = cast_at::<DirEntry>(area, offset);
        let rec_len = de.rec_len as usize;
        if rec_len < DIR_ENTRY_HEADER_LEN {
            return Err(Ocfs2Error::CorruptedDirectory(0));
        }
        if de.inode != 0 && de.name() == name {
            match prev {
                Some(p) => {
                    let absorbed = rec_len as u16;
                    cast_at_mut::<DirEntry>(area, p).rec_len += absorbed;
                }
                None => {
                    let de = cast_at_mut::<DirEntry>(area, offset);
                    de.inode = 0;
                }
            }
            return Ok(true);
        }
        prev = Some(offset);
        offset += rec_len;
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::test_support::scratch_volume;
    use crate::fs::FsHandle;
    use crate::fs::OpenFlags;

    #[test]
    fn link_lookup_unlink() {
        let tmp = scratch_volume(16 << 20, 4096, 4096);
        let fs = FsHandle::open(tmp.path(), OpenFlags::RW, 0, 0).unwrap();

        link(&fs, fs.root_blkno, b"alpha", 1000, FT_REG_FILE).unwrap();
        link(&fs, fs.root_blkno, b"beta", 1001, FT_REG_FILE).unwrap();
        link(&fs, fs.root_blkno, b"gamma", 1002, FT_DIR).unwrap();

        assert_eq!(lookup(&fs, fs.root_blkno, b"alpha").unwrap(), 1000);
        assert_eq!(lookup(&fs, fs.root_blkno, b"beta").unwrap(), 1001);
        assert_eq!(lookup(&fs, fs.root_blkno, b"gamma").unwrap(), 1002);

        unlink(&fs, fs.root_blkno, b"beta").unwrap();
        assert!(matches!(
            lookup(&fs, fs.root_blkno, b"beta"),
            Err(Ocfs2Error::DirentNotFound)
        ));
        assert_eq!(lookup(&fs, fs.root_blkno, b"alpha").unwrap(), 1000);

        // removing and re-adding a name keeps the inode reference
        link(&fs, fs.root_blkno, b"beta", 1001, FT_REG_FILE).unwrap();
        assert_eq!(lookup(&fs, fs.root_blkno, b"beta").unwrap(), 1001);
    }

    #[test]
    fn growth_past_first_cluster() {
        // small blocks make the directory spill early
        let tmp = scratch_volume(64 << 20, 512, 4096);
        let fs = FsHandle::open(tmp.path(), OpenFlags::RW, 0, 0).unwrap();

        let names: Vec<String> = (0..200).map(|i| format!("entry_number_{i:03}")).collect();
        for (i, name) in names.iter().enumerate() {
            link(&fs, fs.root_blkno, name.as_bytes(), 5000 + i as u64, FT_REG_FILE).unwrap();
        }
        let di_buf = inode::read_inode(&fs, fs.root_blkno).unwrap();
        assert!(crate::util::cast_at::<Dinode>(&di_buf, 0).i_clusters > 1);

        for (i, name) in names.iter().enumerate() {
            assert_eq!(
                lookup(&fs, fs.root_blkno, name.as_bytes()).unwrap(),
                5000 + i as u64
            );
        }
    }

    #[test]
    fn iterate_sees_live_entries_once() {
        let tmp = scratch_volume(16 << 20, 4096, 4096);
        let fs = FsHandle::open(tmp.path(), OpenFlags::RW, 0, 0).unwrap();

        for name in [b"one".as_slice(), b"two", b"three"] {
            link(&fs, fs.root_blkno, name, 900, FT_REG_FILE).unwrap();
        }
        unlink(&fs, fs.root_blkno, b"two").unwrap();

        let mut seen = Vec::new();
        dir_iterate(&fs, fs.root_blkno, DirIterFlags::empty(), &mut |_, _, de| {
            seen.push(de.name().to_vec());
            Ok(DirentAction::Continue)
        })
        .unwrap();
        assert!(seen.contains(&b"one".to_vec()));
        assert!(seen.contains(&b"three".to_vec()));
        assert!(!seen.contains(&b"two".to_vec()));
        // `.` and `..` plus the two live names
        assert_eq!(seen.len(), 4);

        // a changed entry reaches the disk
        dir_iterate(&fs, fs.root_blkno, DirIterFlags::empty(), &mut |_, _, de| {
            if de.name() == b"one" {
                de.inode = 901;
                return Ok(DirentAction::Changed);
            }
            Ok(DirentAction::Continue)
        })
        .unwrap();
        assert_eq!(lookup(&fs, fs.root_blkno, b"one").unwrap(), 901);
    }

    #[test]
    fn trailer_is_stamped() {
        let tmp = scratch_volume(16 << 20, 4096, 4096);
        let fs = FsHandle::open(tmp.path(), OpenFlags::RW, 0, 0).unwrap();
        assert!(supports_dir_trailer(&fs));

        let di_buf = inode::read_inode(&fs, fs.root_blkno).unwrap();
        let first = extent::extent_map_block(&fs, &di_buf, 0).unwrap().unwrap();
        let blk = read_dir_block(&fs, &di_buf, first).unwrap();
        let trailer = dir_trailer(&blk);
        assert!(signature_matches(&trailer.db_signature, DIR_TRAILER_SIGNATURE));
        assert_eq!({ trailer.db_blkno }, first);
        assert_eq!({ trailer.db_parent_dinode }, fs.root_blkno);
    }
}
