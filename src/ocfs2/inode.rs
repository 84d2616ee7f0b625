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

//! Inode operations.
//!
//! The inode swap runs in three layers: the fixed fields, the flag-selected
//! unions, and the record arrays inside the body. The body interpretation
//! follows the flags, so the layers must run fixed-fields-first when going
//! to native form and in reverse when leaving it.

use crate::byteorder::cpu_is_little_endian;
use crate::byteorder::swap_barrier;
use crate::dir;
use crate::error::Ocfs2Error;
use crate::extent;
use crate::fs::FsHandle;
use crate::fs::INODE_CHECK_OFF;
use crate::ondisk::*;
use crate::util::cast_at;
use crate::util::cast_at_mut;
use crate::xattr;
use std::mem::size_of;

fn swap_inode_first(di: &mut Dinode) {
    di.i_generation = di.i_generation.swap_bytes();
    di.i_suballoc_slot = di.i_suballoc_slot.swap_bytes();
    di.i_suballoc_bit = di.i_suballoc_bit.swap_bytes();
    di.i_links_count_hi = di.i_links_count_hi.swap_bytes();
    di.i_xattr_inline_size = di.i_xattr_inline_size.swap_bytes();
    di.i_clusters = di.i_clusters.swap_bytes();
    di.i_uid = di.i_uid.swap_bytes();
    di.i_gid = di.i_gid.swap_bytes();
    di.i_size = di.i_size.swap_bytes();
    di.i_mode = di.i_mode.swap_bytes();
    di.i_links_count = di.i_links_count.swap_bytes();
    di.i_flags = di.i_flags.swap_bytes();
    di.i_atime = di.i_atime.swap_bytes();
    di.i_ctime = di.i_ctime.swap_bytes();
    di.i_mtime = di.i_mtime.swap_bytes();
    di.i_dtime = di.i_dtime.swap_bytes();
    di.i_blkno = di.i_blkno.swap_bytes();
    di.i_last_eb_blk = di.i_last_eb_blk.swap_bytes();
    di.i_fs_generation = di.i_fs_generation.swap_bytes();
    di.i_atime_nsec = di.i_atime_nsec.swap_bytes();
    di.i_ctime_nsec = di.i_ctime_nsec.swap_bytes();
    di.i_mtime_nsec = di.i_mtime_nsec.swap_bytes();
    di.i_attr = di.i_attr.swap_bytes();
    di.i_orphaned_slot = di.i_orphaned_slot.swap_bytes();
    di.i_dyn_features = di.i_dyn_features.swap_bytes();
    di.i_xattr_loc = di.i_xattr_loc.swap_bytes();
    di.i_dx_root = di.i_dx_root.swap_bytes();
    di.i_refcount_loc = di.i_refcount_loc.swap_bytes();
    di.i_suballoc_loc = di.i_suballoc_loc.swap_bytes();
}

fn swap_inode_second(buf: &mut [u8]) {
    let di = cast_at_mut::<Dinode>(buf, 0);
    let flags = InodeFlags::from_bits_truncate(di.i_flags);
    let dyn_features = DynFeatures::from_bits_truncate(di.i_dyn_features);

    if di.is_dev() {
        unsafe {
            di.id1.dev1.i_rdev = di.id1.dev1.i_rdev.swap_bytes();
        }
    } else if flags.contains(InodeFlags::BITMAP) {
        unsafe {
            di.id1.bitmap1.i_used = di.id1.bitmap1.i_used.swap_bytes();
            di.id1.bitmap1.i_total = di.id1.bitmap1.i_total.swap_bytes();
        }
    } else if flags.contains(InodeFlags::JOURNAL) {
        unsafe {
            di.id1.journal1.ij_flags = di.id1.journal1.ij_flags.swap_bytes();
            di.id1.journal1.ij_recovery_generation =
                di.id1.journal1.ij_recovery_generation.swap_bytes();
        }
    }

    // swap the union member that is in use, explicitly flagged ones first
    if flags.contains(InodeFlags::SUPER_BLOCK) {
        let sb = inode_super_block_mut(buf);
        sb.s_major_rev_level = sb.s_major_rev_level.swap_bytes();
        sb.s_minor_rev_level = sb.s_minor_rev_level.swap_bytes();
        sb.s_mnt_count = sb.s_mnt_count.swap_bytes();
        sb.s_max_mnt_count = sb.s_max_mnt_count.swap_bytes();
        sb.s_state = sb.s_state.swap_bytes();
        sb.s_errors = sb.s_errors.swap_bytes();
        sb.s_checkinterval = sb.s_checkinterval.swap_bytes();
        sb.s_lastcheck = sb.s_lastcheck.swap_bytes();
        sb.s_creator_os = sb.s_creator_os.swap_bytes();
        sb.s_feature_compat = sb.s_feature_compat.swap_bytes();
        sb.s_feature_incompat = sb.s_feature_incompat.swap_bytes();
        sb.s_feature_ro_compat = sb.s_feature_ro_compat.swap_bytes();
        sb.s_root_blkno = sb.s_root_blkno.swap_bytes();
        sb.s_system_dir_blkno = sb.s_system_dir_blkno.swap_bytes();
        sb.s_blocksize_bits = sb.s_blocksize_bits.swap_bytes();
        sb.s_clustersize_bits = sb.s_clustersize_bits.swap_bytes();
        sb.s_max_slots = sb.s_max_slots.swap_bytes();
        sb.s_tunefs_flag = sb.s_tunefs_flag.swap_bytes();
        sb.s_uuid_hash = sb.s_uuid_hash.swap_bytes();
        sb.s_first_cluster_group = sb.s_first_cluster_group.swap_bytes();
        sb.s_xattr_inline_size = sb.s_xattr_inline_size.swap_bytes();
        let mut seed = sb.s_dx_seed;
        for lane in seed.iter_mut() {
            *lane = lane.swap_bytes();
        }
        sb.s_dx_seed = seed;
    } else if flags.contains(InodeFlags::LOCAL_ALLOC) {
        let la = cast_at_mut::<LocalAlloc>(buf, INODE_BODY_OFF);
        la.la_bm_off = la.la_bm_off.swap_bytes();
        la.la_size = la.la_size.swap_bytes();
    } else if flags.contains(InodeFlags::CHAIN) {
        let cl = inode_chain_list_mut(buf);
        cl.cl_cpg = cl.cl_cpg.swap_bytes();
        cl.cl_bpc = cl.cl_bpc.swap_bytes();
        cl.cl_count = cl.cl_count.swap_bytes();
        cl.cl_next_free_rec = cl.cl_next_free_rec.swap_bytes();
    } else if flags.contains(InodeFlags::DEALLOC) {
        let tl = inode_truncate_log_mut(buf);
        tl.tl_count = tl.tl_count.swap_bytes();
        tl.tl_used = tl.tl_used.swap_bytes();
    } else if dyn_features.contains(DynFeatures::INLINE_DATA) {
        let id = inode_inline_data_mut(buf);
        id.id_count = id.id_count.swap_bytes();
    }
}

/// Swaps the record arrays selected by the inode flags. Returns `false`
/// when a corrupt count made the loop stop at the block boundary.
fn swap_inode_third(blocksize: u32, buf: &mut [u8]) -> bool {
    let di = cast_at::<Dinode>(buf, 0);
    let flags = InodeFlags::from_bits_truncate(di.i_flags);

    if flags.contains(InodeFlags::CHAIN) {
        let next_free = inode_chain_list(buf).cl_next_free_rec as usize;
        for i in 0..next_free {
            let off = INODE_BODY_OFF + size_of::<ChainList>() + i * size_of::<ChainRec>();
            if swap_barrier(blocksize as usize, off, size_of::<ChainRec>()) {
                return false;
            }
            let rec = cast_at_mut::<ChainRec>(buf, off);
            rec.c_free = rec.c_free.swap_bytes();
            rec.c_total = rec.c_total.swap_bytes();
            rec.c_blkno = rec.c_blkno.swap_bytes();
        }
    } else if flags.contains(InodeFlags::DEALLOC) {
        let count = inode_truncate_log(buf).tl_count as usize;
        for i in 0..count {
            let off = INODE_BODY_OFF + size_of::<TruncateLog>() + i * size_of::<TruncateRec>();
            if swap_barrier(blocksize as usize, off, size_of::<TruncateRec>()) {
                return false;
            }
            let rec = cast_at_mut::<TruncateRec>(buf, off);
            rec.t_start = rec.t_start.swap_bytes();
            rec.t_clusters = rec.t_clusters.swap_bytes();
        }
    }
    true
}

fn swap_inline_dir(blocksize: u32, buf: &mut [u8], to_native: bool) {
    let di = cast_at::<Dinode>(buf, 0);
    let dyn_features = DynFeatures::from_bits_truncate(di.i_dyn_features);
    let xattr_inline = di.i_xattr_inline_size;

    let mut max_inline = max_inline_data(blocksize);
    if dyn_features.contains(DynFeatures::INLINE_XATTR) {
        max_inline = max_inline.saturating_sub(xattr_inline as usize);
    }

    let bytes = (inode_inline_data(buf).id_count as usize).min(max_inline);
    let area = &mut buf[INLINE_DATA_OFF..INLINE_DATA_OFF + bytes];
    if to_native {
        dir::swap_dir_entries_to_native(area);
    } else {
        dir::swap_dir_entries_from_native(area);
    }
}

fn inline_xattr_off(buf: &[u8]) -> Option<usize> {
    let di = cast_at::<Dinode>(buf, 0);
    let dyn_features = DynFeatures::from_bits_truncate(di.i_dyn_features);
    if !dyn_features.contains(DynFeatures::INLINE_XATTR) {
        return None;
    }
    let size = di.i_xattr_inline_size as usize;
    if size == 0 || size > buf.len() - INODE_BODY_OFF {
        return None;
    }
    Some(buf.len() - size)
}

/// Swaps an inode block to host endianness.
///
/// Returns `CorruptedBlock` when a record array was truncated by the swap
/// barrier; the buffer is still left in host form.
pub fn swap_inode_to_native(blocksize: u32, buf: &mut [u8]) -> Result<(), Ocfs2Error> {
    if cpu_is_little_endian() {
        return Ok(());
    }

    swap_inode_first(cast_at_mut::<Dinode>(buf, 0));
    swap_inode_second(buf);
    let mut complete = swap_inode_third(blocksize, buf);

    let di = cast_at::<Dinode>(buf, 0);
    let blkno = di.i_blkno;
    let is_dir = di.is_dir();
    let dyn_features = DynFeatures::from_bits_truncate(di.i_dyn_features);
    if dyn_features.contains(DynFeatures::INLINE_DATA) && is_dir {
        swap_inline_dir(blocksize, buf, true);
    }
    if cast_at::<Dinode>(buf, 0).has_extents() {
        complete &= extent::swap_extent_list_to_native(blocksize, buf, INODE_BODY_OFF);
    }
    if let Some(off) = inline_xattr_off(buf) {
        complete &= xattr::swap_xattr_header_to_native(blocksize, buf, off);
    }

    if complete {
        Ok(())
    } else {
        Err(Ocfs2Error::CorruptedBlock(blkno))
    }
}

/// Swaps an inode block back to disk endianness.
pub fn swap_inode_from_native(blocksize: u32, buf: &mut [u8]) -> Result<(), Ocfs2Error> {
    if cpu_is_little_endian() {
        return Ok(());
    }

    let di = cast_at::<Dinode>(buf, 0);
    let blkno = di.i_blkno;
    let is_dir = di.is_dir();
    let dyn_features = DynFeatures::from_bits_truncate(di.i_dyn_features);

    let mut complete = true;
    if let Some(off) = inline_xattr_off(buf) {
        complete &= xattr::swap_xattr_header_from_native(blocksize, buf, off);
    }
    if cast_at::<Dinode>(buf, 0).has_extents() {
        complete &= extent::swap_extent_list_from_native(blocksize, buf, INODE_BODY_OFF);
    }
    if dyn_features.contains(DynFeatures::INLINE_DATA) && is_dir {
        swap_inline_dir(blocksize, buf, false);
    }
    complete &= swap_inode_third(blocksize, buf);
    swap_inode_second(buf);
    swap_inode_first(cast_at_mut::<Dinode>(buf, 0));

    if complete {
        Ok(())
    } else {
        Err(Ocfs2Error::CorruptedBlock(blkno))
    }
}

/// Reads and validates the inode at block `blkno`, returning the block in
/// host endianness.
pub fn read_inode(fs: &FsHandle, blkno: u64) -> Result<Vec<u8>, Ocfs2Error> {
    fs.check_blkno(blkno)?;

    let mut blk = fs.alloc_block();
    fs.read_blocks(blkno, 1, &mut blk)?;

    fs.validate_meta_ecc(&mut blk, INODE_CHECK_OFF, blkno)?;

    let di = cast_at::<Dinode>(&blk, 0);
    if !signature_matches(&di.i_signature, INODE_SIGNATURE) {
        return Err(Ocfs2Error::BadSignature {
            blkno,
            expected: INODE_SIGNATURE,
        });
    }

    swap_inode_to_native(fs.blocksize, &mut blk)?;

    // counts drive record walks; a lying count must not get that far
    let flags = InodeFlags::from_bits_truncate(cast_at::<Dinode>(&blk, 0).i_flags);
    if flags.contains(InodeFlags::CHAIN) {
        let cl = inode_chain_list(&blk);
        if cl.cl_count > chain_recs_per_inode(fs.blocksize) || cl.cl_next_free_rec > cl.cl_count {
            return Err(Ocfs2Error::CorruptedBlock(blkno));
        }
    } else if flags.contains(InodeFlags::DEALLOC) {
        let tl = inode_truncate_log(&blk);
        if tl.tl_count > truncate_recs_per_inode(fs.blocksize) || tl.tl_used > tl.tl_count {
            return Err(Ocfs2Error::CorruptedBlock(blkno));
        }
    } else if cast_at::<Dinode>(&blk, 0).has_extents() {
        let el = inode_extent_list(&blk);
        if el.l_count > extent_recs_per_inode(fs.blocksize)
            || el.l_next_free_rec > el.l_count
            || el.l_tree_depth as usize >= MAX_PATH_DEPTH
        {
            return Err(Ocfs2Error::CorruptedBlock(blkno));
        }
    }
    Ok(blk)
}

/// Writes a host-endian inode block to block `blkno`.
pub fn write_inode(fs: &FsHandle, blkno: u64, buf: &[u8]) -> Result<(), Ocfs2Error> {
    if !fs.writable() {
        return Err(Ocfs2Error::ReadOnlyFilesystem);
    }
    fs.check_blkno(blkno)?;

    let mut blk = buf.to_vec();
    swap_inode_from_native(fs.blocksize, &mut blk)?;
    fs.compute_meta_ecc(&mut blk, INODE_CHECK_OFF);
    fs.write_blocks(blkno, 1, &blk)
}

/// Checks that block `dir` holds a directory inode.
pub fn check_directory(fs: &FsHandle, dir: u64) -> Result<(), Ocfs2Error> {
    let buf = read_inode(fs, dir)?;
    let di = cast_at::<Dinode>(&buf, 0);
    if !di.is_dir() {
        return Err(Ocfs2Error::InodeNotValid(dir));
    }
    Ok(())
}

/// An inode held in memory between operations.
pub struct CachedInode {
    /// The block the inode lives in.
    pub blkno: u64,
    /// The inode block, host-endian.
    pub buf: Vec<u8>,
}

impl CachedInode {
    /// Reads the inode at `blkno` into a cache entry.
    pub fn read(fs: &FsHandle, blkno: u64) -> Result<Self, Ocfs2Error> {
        let buf = read_inode(fs, blkno)?;
        Ok(Self { blkno, buf })
    }

    /// Flushes the cached inode back to its block.
    pub fn write(&self, fs: &FsHandle) -> Result<(), Ocfs2Error> {
        write_inode(fs, self.blkno, &self.buf)
    }

    /// Returns the inode fields.
    pub fn dinode(&self) -> &Dinode {
        cast_at(&self.buf, 0)
    }

    /// Returns the inode fields, mutable.
    pub fn dinode_mut(&mut self) -> &mut Dinode {
        cast_at_mut(&mut self.buf, 0)
    }

    /// Reads `count` blocks of file content starting at logical block
    /// `vblk`. A hole reads as zeros.
    pub fn file_read(
        &self,
        fs: &FsHandle,
        vblk: u64,
        count: usize,
        buf: &mut [u8],
    ) -> Result<(), Ocfs2Error> {
        let bs = fs.blocksize as usize;
        for i in 0..count {
            let chunk = &mut buf[i * bs..(i + 1) * bs];
            match extent::extent_map_block(fs, &self.buf, vblk + i as u64)? {
                Some(pblk) => fs.read_blocks(pblk, 1, chunk)?,
                None => chunk.fill(0),
            }
        }
        Ok(())
    }

    /// Writes `count` blocks of file content starting at logical block
    /// `vblk`. The blocks must already be allocated.
    pub fn file_write(
        &self,
        fs: &FsHandle,
        vblk: u64,
        count: usize,
        buf: &[u8],
    ) -> Result<(), Ocfs2Error> {
        let bs = fs.blocksize as usize;
        for i in 0..count {
            let chunk = &buf[i * bs..(i + 1) * bs];
            let pblk = extent::extent_map_block(fs, &self.buf, vblk + i as u64)?
                .ok_or(Ocfs2Error::ShortWrite(vblk + i as u64))?;
            fs.write_blocks(pblk, 1, chunk)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swap_is_identity_on_le() {
        // on a little-endian host the swap pair must not touch the buffer
        let mut buf = vec![0u8; 512];
        set_signature(&mut buf[..8], INODE_SIGNATURE);
        let before = buf.clone();
        swap_inode_to_native(512, &mut buf).unwrap();
        assert_eq!(buf, before);
        swap_inode_from_native(512, &mut buf).unwrap();
        assert_eq!(buf, before);
    }
}

#[cfg(test)]
mod roundtrip_tests {
    use super::*;
    use crate::format::test_support::scratch_volume;
    use crate::fs::FsHandle;
    use crate::fs::OpenFlags;

    #[test]
    fn read_write_read_is_stable() {
        let tmp = scratch_volume(16 << 20, 4096, 4096);
        let fs = FsHandle::open(tmp.path(), OpenFlags::RW, 0, 0).unwrap();

        for blkno in [fs.root_blkno, fs.sysdir_blkno] {
            let first = read_inode(&fs, blkno).unwrap();
            write_inode(&fs, blkno, &first).unwrap();
            let second = read_inode(&fs, blkno).unwrap();
            assert_eq!(first, second);
        }
    }

    #[test]
    fn wrong_kind_is_rejected() {
        let tmp = scratch_volume(16 << 20, 4096, 4096);
        let fs = FsHandle::open(tmp.path(), OpenFlags::empty(), 0, 0).unwrap();

        // the first cluster-group descriptor is no inode
        assert!(matches!(
            read_inode(&fs, fs.first_cg_blkno),
            Err(Ocfs2Error::BadSignature { .. })
        ));
        assert!(matches!(
            read_inode(&fs, fs.blocks + 10),
            Err(Ocfs2Error::BadBlockNumber(_))
        ));
    }

    #[test]
    fn directory_check() {
        let tmp = scratch_volume(16 << 20, 4096, 4096);
        let fs = FsHandle::open(tmp.path(), OpenFlags::empty(), 0, 0).unwrap();
        check_directory(&fs, fs.root_blkno).unwrap();
        let bitmap = fs
            .lookup_system_inode(SystemFileType::GlobalBitmap, 0)
            .unwrap();
        assert!(matches!(
            check_directory(&fs, bitmap),
            Err(Ocfs2Error::InodeNotValid(_))
        ));
    }
}
