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

//! Quota files.
//!
//! The global per-type quota file holds per-identity usage records in a
//! fixed-depth radix tree of block references; leaf blocks are linked into
//! two chains, one of blocks with free entries and one of entirely free
//! blocks. Every block of the file reserves its tail for a check trailer.
//! Per-slot local files log deltas that a mounted node folds back into the
//! global file.

use crate::blockcheck;
use crate::byteorder::cpu_is_little_endian;
use crate::error::Ocfs2Error;
use crate::fs::FsHandle;
use crate::inode::CachedInode;
use crate::ondisk::*;
use crate::util::cast_at;
use crate::util::cast_at_mut;
use std::mem::size_of;

/// Quota types, indexing the magic tables.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QuotaType {
    /// Per-user quota.
    User = 0,
    /// Per-group quota.
    Group = 1,
}

/// Magic numbers of the global quota files, by type.
pub const GLOBAL_QMAGICS: [u32; 2] = [0x0fe767ce, 0x0fe767cf];
/// Versions of the global quota files, by type.
pub const GLOBAL_QVERSIONS: [u32; 2] = [0, 0];
/// Magic numbers of the local quota files, by type.
pub const LOCAL_QMAGICS: [u32; 2] = [0x0de767ce, 0x0de767cf];
/// Versions of the local quota files, by type.
pub const LOCAL_QVERSIONS: [u32; 2] = [0, 0];

/// Local quota file flag: the file was cleanly synced.
pub const OLQF_CLEAN: u32 = 0x01;

/// File block holding the radix tree root.
pub const QT_TREEOFF: u32 = 1;

/// Common header of both quota file kinds.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DiskDqheader {
    /// Magic of the file's type.
    pub dqh_magic: u32,
    /// Format version.
    pub dqh_version: u32,
}

/// Offset of the global info record behind the header.
pub const GLOBAL_INFO_OFF: usize = size_of::<DiskDqheader>();
/// Offset of the local info record behind the header.
pub const LOCAL_INFO_OFF: usize = size_of::<DiskDqheader>();

/// Bookkeeping of a global quota file.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct GlobalDiskDqinfo {
    /// Grace period for space limits, seconds.
    pub dqi_bgrace: u32,
    /// Grace period for inode limits, seconds.
    pub dqi_igrace: u32,
    /// Sync interval, milliseconds.
    pub dqi_syncms: u32,
    /// Blocks in the file.
    pub dqi_blocks: u32,
    /// Head of the chain of entirely free blocks.
    pub dqi_free_blk: u32,
    /// Head of the chain of blocks with free entries.
    pub dqi_free_entry: u32,
}

/// Bookkeeping of a local quota file.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalDiskDqinfo {
    /// State flags (`OLQF_*`).
    pub dqi_flags: u32,
    /// Chunks in the file.
    pub dqi_chunks: u32,
    /// Blocks in the file.
    pub dqi_blocks: u32,
}

/// Header of a leaf block holding usage records.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct QtDiskDqdbheader {
    /// Next block in the free chain.
    pub dqdh_next_free: u32,
    /// Previous block in the free chain.
    pub dqdh_prev_free: u32,
    /// Entries in use in this block.
    pub dqdh_entries: u16,
    /// Padding.
    pub dqdh_pad1: u16,
    /// Padding.
    pub dqdh_pad2: u32,
}

/// One identity's usage and limits in the global file.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GlobalDiskDqblk {
    /// The user or group id.
    pub dqb_id: u32,
    /// Nodes holding a reference on the record.
    pub dqb_use_count: u32,
    /// Hard limit on inodes.
    pub dqb_ihardlimit: u64,
    /// Soft limit on inodes.
    pub dqb_isoftlimit: u64,
    /// Inodes in use.
    pub dqb_curinodes: u64,
    /// Hard limit on space, bytes.
    pub dqb_bhardlimit: u64,
    /// Soft limit on space, bytes.
    pub dqb_bsoftlimit: u64,
    /// Space in use, bytes.
    pub dqb_curspace: u64,
    /// End of the space grace period.
    pub dqb_btime: u64,
    /// End of the inode grace period.
    pub dqb_itime: u64,
    /// Padding.
    pub dqb_pad1: u64,
    /// Padding.
    pub dqb_pad2: u64,
}

/// Header of a chunk in a local quota file.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalDiskChunk {
    /// Free entries in the chunk. The usage bitmap follows the header.
    pub dqc_free: u32,
}

/// One logged delta in a local quota file.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalDiskDqblk {
    /// The user or group id.
    pub dqb_id: u64,
    /// Space delta, bytes.
    pub dqb_spacemod: u64,
    /// Inode delta.
    pub dqb_inodemod: u64,
}

/// Bytes reserved at the tail of every quota file block for the check
/// trailer.
pub fn qblk_reserved_space() -> usize {
    size_of::<BlockCheck>()
}

/// Offset of the check trailer in a quota file block.
pub fn qblk_check_off(blocksize: u32) -> usize {
    blocksize as usize - qblk_reserved_space()
}

/// Swaps a quota file header.
pub fn swap_quota_header(header: &mut DiskDqheader) {
    if cpu_is_little_endian() {
        return;
    }
    header.dqh_magic = header.dqh_magic.swap_bytes();
    header.dqh_version = header.dqh_version.swap_bytes();
}

/// Swaps a local quota info record.
pub fn swap_quota_local_info(info: &mut LocalDiskDqinfo) {
    if cpu_is_little_endian() {
        return;
    }
    info.dqi_flags = info.dqi_flags.swap_bytes();
    info.dqi_chunks = info.dqi_chunks.swap_bytes();
    info.dqi_blocks = info.dqi_blocks.swap_bytes();
}

/// Swaps a local chunk header.
pub fn swap_quota_chunk_header(chunk: &mut LocalDiskChunk) {
    if cpu_is_little_endian() {
        return;
    }
    chunk.dqc_free = chunk.dqc_free.swap_bytes();
}

/// Swaps a global quota info record.
pub fn swap_quota_global_info(info: &mut GlobalDiskDqinfo) {
    if cpu_is_little_endian() {
        return;
    }
    info.dqi_bgrace = info.dqi_bgrace.swap_bytes();
    info.dqi_igrace = info.dqi_igrace.swap_bytes();
    info.dqi_syncms = info.dqi_syncms.swap_bytes();
    info.dqi_blocks = info.dqi_blocks.swap_bytes();
    info.dqi_free_blk = info.dqi_free_blk.swap_bytes();
    info.dqi_free_entry = info.dqi_free_entry.swap_bytes();
}

/// Swaps one global usage record.
pub fn swap_quota_global_dqblk(dqblk: &mut GlobalDiskDqblk) {
    if cpu_is_little_endian() {
        return;
    }
    dqblk.dqb_id = dqblk.dqb_id.swap_bytes();
    dqblk.dqb_use_count = dqblk.dqb_use_count.swap_bytes();
    dqblk.dqb_ihardlimit = dqblk.dqb_ihardlimit.swap_bytes();
    dqblk.dqb_isoftlimit = dqblk.dqb_isoftlimit.swap_bytes();
    dqblk.dqb_curinodes = dqblk.dqb_curinodes.swap_bytes();
    dqblk.dqb_bhardlimit = dqblk.dqb_bhardlimit.swap_bytes();
    dqblk.dqb_bsoftlimit = dqblk.dqb_bsoftlimit.swap_bytes();
    dqblk.dqb_curspace = dqblk.dqb_curspace.swap_bytes();
    dqblk.dqb_btime = dqblk.dqb_btime.swap_bytes();
    dqblk.dqb_itime = dqblk.dqb_itime.swap_bytes();
}

/// Swaps a leaf block header.
pub fn swap_quota_leaf_block_header(bheader: &mut QtDiskDqdbheader) {
    if cpu_is_little_endian() {
        return;
    }
    bheader.dqdh_next_free = bheader.dqdh_next_free.swap_bytes();
    bheader.dqdh_prev_free = bheader.dqdh_prev_free.swap_bytes();
    bheader.dqdh_entries = bheader.dqdh_entries.swap_bytes();
}

/// Depth of the radix tree for the given block size: the smallest number
/// of levels whose fan-out covers every 32-bit id.
pub fn qtree_depth(blocksize: u32) -> u32 {
    let epb = (blocksize as u64 - qblk_reserved_space() as u64) >> 2;
    let mut entries = epb;
    let mut i = 1;
    while entries < 1 << 32 {
        entries *= epb;
        i += 1;
    }
    i
}

/// Index taken at tree level `depth` (0 at the root) for `id`.
pub fn qtree_index(blocksize: u32, id: u32, depth: u32) -> usize {
    let epb = ((blocksize as u64 - qblk_reserved_space() as u64) >> 2) as u32;
    let mut id = id;
    let mut levels_below = qtree_depth(blocksize) - depth - 1;
    while levels_below > 0 {
        id /= epb;
        levels_below -= 1;
    }
    (id % epb) as usize
}

/// Usage records fitting in one leaf block.
pub fn global_dqstr_in_blk(blocksize: u32) -> usize {
    (blocksize as usize - qblk_reserved_space() - size_of::<QtDiskDqdbheader>())
        / size_of::<GlobalDiskDqblk>()
}

/// Tells whether a leaf entry slot is unused.
pub fn qtree_entry_unused(ddquot: &GlobalDiskDqblk) -> bool {
    *ddquot == GlobalDiskDqblk::default()
}

/// A global quota file held open: its inode and host-endian info record.
pub struct QuotaFile {
    /// User or group.
    pub qtype: QuotaType,
    /// The quota file's inode.
    pub ci: CachedInode,
    /// Host-endian copy of the info record.
    pub info: GlobalDiskDqinfo,
    /// The info record needs to be written back.
    pub dirty: bool,
}

impl QuotaFile {
    /// Opens the global quota file of `qtype` and loads its info record,
    /// validating the magic and version.
    pub fn open(fs: &FsHandle, qtype: QuotaType) -> Result<Self, Ocfs2Error> {
        let ftype = match qtype {
            QuotaType::User => SystemFileType::UserQuota,
            QuotaType::Group => SystemFileType::GroupQuota,
        };
        let blkno = fs.lookup_system_inode(ftype, 0)?;
        let ci = CachedInode::read(fs, blkno)?;
        let mut qf = Self {
            qtype,
            ci,
            info: GlobalDiskDqinfo::default(),
            dirty: false,
        };

        let buf = qf.read_blk(fs, 0)?;
        let mut header = *cast_at::<DiskDqheader>(&buf, 0);
        swap_quota_header(&mut header);
        if header.dqh_magic != GLOBAL_QMAGICS[qtype as usize] {
            let magic = header.dqh_magic;
            return Err(Ocfs2Error::BadMagic(magic));
        }
        if header.dqh_version > GLOBAL_QVERSIONS[qtype as usize] {
            let version = header.dqh_version;
            return Err(Ocfs2Error::BadMagic(version));
        }
        let mut info = *cast_at::<GlobalDiskDqinfo>(&buf, GLOBAL_INFO_OFF);
        swap_quota_global_info(&mut info);
        qf.info = info;
        Ok(qf)
    }

    /// Reads file block `blk` of the quota file, validating its trailer.
    pub fn read_blk(&self, fs: &FsHandle, blk: u32) -> Result<Vec<u8>, Ocfs2Error> {
        let mut buf = fs.alloc_block();
        self.ci.file_read(fs, blk as u64, 1, &mut buf)?;
        if fs.meta_ecc() {
            blockcheck::block_check_validate(
                &mut buf,
                qblk_check_off(fs.blocksize),
                blk as u64,
            )?;
        }
        Ok(buf)
    }

    /// Writes file block `blk` of the quota file, stamping its trailer.
    pub fn write_blk(&self, fs: &FsHandle, blk: u32, buf: &[u8]) -> Result<(), Ocfs2Error> {
        let mut out = buf.to_vec();
        if fs.meta_ecc() {
            blockcheck::block_check_compute(&mut out, qblk_check_off(fs.blocksize));
        }
        self.ci.file_write(fs, blk as u64, 1, &out)
    }

    /// Writes the header and info record back to block 0.
    pub fn write_info(&mut self, fs: &FsHandle) -> Result<(), Ocfs2Error> {
        let mut buf = self.read_blk(fs, 0)?;
        {
            let header = cast_at_mut::<DiskDqheader>(&mut buf, 0);
            header.dqh_magic = GLOBAL_QMAGICS[self.qtype as usize];
            header.dqh_version = GLOBAL_QVERSIONS[self.qtype as usize];
            swap_quota_header(header);
        }
        {
            let info = cast_at_mut::<GlobalDiskDqinfo>(&mut buf, GLOBAL_INFO_OFF);
            *info = self.info;
            swap_quota_global_info(info);
        }
        self.write_blk(fs, 0, &buf)?;
        self.dirty = false;
        Ok(())
    }

    /// Takes a free block from the free-block chain, or extends the file.
    fn get_free_dqblk(&mut self, fs: &FsHandle) -> Result<u32, Ocfs2Error> {
        if self.info.dqi_free_blk != 0 {
            let blk = self.info.dqi_free_blk;
            let buf = self.read_blk(fs, blk)?;
            let mut dh = *cast_at::<QtDiskDqdbheader>(&buf, 0);
            swap_quota_leaf_block_header(&mut dh);
            self.info.dqi_free_blk = dh.dqdh_next_free;
            self.dirty = true;
            return Ok(blk);
        }
        // grow the file by one block
        let file_blocks = fs.clusters_to_blocks(self.ci.dinode().i_clusters);
        if self.info.dqi_blocks as u64 >= file_blocks {
            crate::alloc::extend_allocation(fs, &mut self.ci, 1)?;
        }
        let blk = self.info.dqi_blocks;
        self.info.dqi_blocks += 1;
        self.ci.dinode_mut().i_size = self.info.dqi_blocks as u64 * fs.blocksize as u64;
        self.ci.write(fs)?;
        self.dirty = true;
        Ok(blk)
    }

    /// Pushes `blk` onto the free-block chain.
    fn put_free_dqblk(&mut self, fs: &FsHandle, buf: &mut [u8], blk: u32) -> Result<(), Ocfs2Error> {
        {
            let dh = cast_at_mut::<QtDiskDqdbheader>(buf, 0);
            dh.dqdh_next_free = self.info.dqi_free_blk;
            dh.dqdh_prev_free = 0;
            dh.dqdh_entries = 0;
            swap_quota_leaf_block_header(dh);
        }
        self.write_blk(fs, blk, buf)?;
        swap_quota_leaf_block_header(cast_at_mut::<QtDiskDqdbheader>(buf, 0));
        self.info.dqi_free_blk = blk;
        self.dirty = true;
        Ok(())
    }

    /// Unlinks `blk` from the chain of blocks with free entries. `buf`
    /// holds the block with a host-endian header.
    fn remove_free_dqentry(
        &mut self,
        fs: &FsHandle,
        buf: &mut [u8],
        blk: u32,
    ) -> Result<(), Ocfs2Error> {
        let (next, prev) = {
            let dh = cast_at::<QtDiskDqdbheader>(buf, 0);
            (dh.dqdh_next_free, dh.dqdh_prev_free)
        };

        if next != 0 {
            let mut nbuf = self.read_blk(fs, next)?;
            let dh = cast_at_mut::<QtDiskDqdbheader>(&mut nbuf, 0);
            swap_quota_leaf_block_header(dh);
            dh.dqdh_prev_free = prev;
            swap_quota_leaf_block_header(dh);
            self.write_blk(fs, next, &nbuf)?;
        }
        if prev != 0 {
            let mut pbuf = self.read_blk(fs, prev)?;
            let dh = cast_at_mut::<QtDiskDqdbheader>(&mut pbuf, 0);
            swap_quota_leaf_block_header(dh);
            dh.dqdh_next_free = next;
            swap_quota_leaf_block_header(dh);
            self.write_blk(fs, prev, &pbuf)?;
        } else {
            self.info.dqi_free_entry = next;
            self.dirty = true;
        }
        {
            let dh = cast_at_mut::<QtDiskDqdbheader>(buf, 0);
            dh.dqdh_next_free = 0;
            dh.dqdh_prev_free = 0;
            swap_quota_leaf_block_header(dh);
        }
        self.write_blk(fs, blk, buf)?;
        swap_quota_leaf_block_header(cast_at_mut::<QtDiskDqdbheader>(buf, 0));
        Ok(())
    }

    /// Links `blk` at the head of the chain of blocks with free entries.
    fn insert_free_dqentry(
        &mut self,
        fs: &FsHandle,
        buf: &mut [u8],
        blk: u32,
    ) -> Result<(), Ocfs2Error> {
        {
            let dh = cast_at_mut::<QtDiskDqdbheader>(buf, 0);
            dh.dqdh_next_free = self.info.dqi_free_entry;
            dh.dqdh_prev_free = 0;
            swap_quota_leaf_block_header(dh);
        }
        self.write_blk(fs, blk, buf)?;
        swap_quota_leaf_block_header(cast_at_mut::<QtDiskDqdbheader>(buf, 0));

        if self.info.dqi_free_entry != 0 {
            let head = self.info.dqi_free_entry;
            let mut hbuf = self.read_blk(fs, head)?;
            let dh = cast_at_mut::<QtDiskDqdbheader>(&mut hbuf, 0);
            swap_quota_leaf_block_header(dh);
            dh.dqdh_prev_free = blk;
            swap_quota_leaf_block_header(dh);
            self.write_blk(fs, head, &hbuf)?;
        }
        self.info.dqi_free_entry = blk;
        self.dirty = true;
        Ok(())
    }

    /// Finds a free entry slot, preferring the free-entry chain, and
    /// returns the leaf block and the file offset of the slot.
    fn find_free_dqentry(&mut self, fs: &FsHandle) -> Result<(u32, u64), Ocfs2Error> {
        let blocksize = fs.blocksize;
        let per_blk = global_dqstr_in_blk(blocksize);

        let (blk, mut buf) = if self.info.dqi_free_entry != 0 {
            let blk = self.info.dqi_free_entry;
            (blk, self.read_blk(fs, blk)?)
        } else {
            let blk = self.get_free_dqblk(fs)?;
            let buf = vec![0u8; blocksize as usize];
            self.info.dqi_free_entry = blk;
            self.dirty = true;
            (blk, buf)
        };
        swap_quota_leaf_block_header(cast_at_mut::<QtDiskDqdbheader>(&mut buf, 0));

        // the block leaves the free-entry chain when this fills it up
        let entries = cast_at::<QtDiskDqdbheader>(&buf, 0).dqdh_entries;
        if entries as usize + 1 >= per_blk {
            self.remove_free_dqentry(fs, &mut buf, blk)?;
        }
        cast_at_mut::<QtDiskDqdbheader>(&mut buf, 0).dqdh_entries += 1;

        let mut slot = None;
        for i in 0..per_blk {
            let off = size_of::<QtDiskDqdbheader>() + i * size_of::<GlobalDiskDqblk>();
            if qtree_entry_unused(cast_at::<GlobalDiskDqblk>(&buf, off)) {
                slot = Some(i);
                break;
            }
        }
        let Some(slot) = slot else {
            return Err(Ocfs2Error::CorruptedQuotaFile(blk as u64));
        };

        swap_quota_leaf_block_header(cast_at_mut::<QtDiskDqdbheader>(&mut buf, 0));
        self.write_blk(fs, blk, &buf)?;

        let off = blk as u64 * blocksize as u64
            + (size_of::<QtDiskDqdbheader>() + slot * size_of::<GlobalDiskDqblk>()) as u64;
        Ok((blk, off))
    }

    /// Walks (and builds) the radix path for `id`, returning the file
    /// offset of the entry slot.
    fn do_insert_tree(
        &mut self,
        fs: &FsHandle,
        id: u32,
        treeblk: &mut u32,
        depth: u32,
    ) -> Result<u64, Ocfs2Error> {
        let mut new_block = false;
        let mut buf;
        if *treeblk == 0 {
            *treeblk = self.get_free_dqblk(fs)?;
            buf = vec![0u8; fs.blocksize as usize];
            new_block = true;
        } else {
            buf = self.read_blk(fs, *treeblk)?;
        }

        let index = qtree_index(fs.blocksize, id, depth);
        let ref_off = index * 4;
        let mut child = u32::from_le_bytes(buf[ref_off..ref_off + 4].try_into().unwrap());
        let new_son = child == 0;

        let result = if depth == qtree_depth(fs.blocksize) - 1 {
            if child != 0 {
                return Err(Ocfs2Error::CorruptedQuotaFile(*treeblk as u64));
            }
            let (leaf_blk, off) = self.find_free_dqentry(fs)?;
            child = leaf_blk;
            Ok(off)
        } else {
            let off = self.do_insert_tree(fs, id, &mut child, depth + 1);
            off
        };

        match &result {
            Ok(_) if new_son => {
                buf[ref_off..ref_off + 4].copy_from_slice(&child.to_le_bytes());
                self.write_blk(fs, *treeblk, &buf)?;
            }
            Err(_) if new_block => {
                let blk = *treeblk;
                self.put_free_dqblk(fs, &mut buf, blk)?;
                *treeblk = 0;
            }
            _ => {}
        }
        result
    }

    /// Allocates (or finds) the tree slot for `id`, returning its file
    /// offset.
    pub fn insert_qtree(&mut self, fs: &FsHandle, id: u32) -> Result<u64, Ocfs2Error> {
        let mut treeblk = QT_TREEOFF;
        self.do_insert_tree(fs, id, &mut treeblk, 0)
    }

    /// Writes `dquot` at its file offset, inserting it into the tree
    /// first when it has none yet.
    pub fn write_dquot(&mut self, fs: &FsHandle, dquot: &mut CachedDquot) -> Result<(), Ocfs2Error> {
        if dquot.off == 0 {
            dquot.off = self.insert_qtree(fs, dquot.ddquot.dqb_id)?;
        }
        let blocksize = fs.blocksize as u64;
        let blk = (dquot.off / blocksize) as u32;
        let off_in_blk = (dquot.off % blocksize) as usize;

        let mut buf = self.read_blk(fs, blk)?;
        {
            let slot = cast_at_mut::<GlobalDiskDqblk>(&mut buf, off_in_blk);
            *slot = dquot.ddquot;
            swap_quota_global_dqblk(slot);
        }
        self.write_blk(fs, blk, &buf)?;
        if self.dirty {
            self.write_info(fs)?;
        }
        Ok(())
    }

    /// Finds the entry for `id` in a leaf block.
    fn find_block_dqentry(
        &self,
        fs: &FsHandle,
        id: u32,
        blk: u32,
    ) -> Result<Option<u64>, Ocfs2Error> {
        let buf = self.read_blk(fs, blk)?;
        for i in 0..global_dqstr_in_blk(fs.blocksize) {
            let off = size_of::<QtDiskDqdbheader>() + i * size_of::<GlobalDiskDqblk>();
            let mut entry = *cast_at::<GlobalDiskDqblk>(&buf, off);
            swap_quota_global_dqblk(&mut entry);
            if entry.dqb_id == id && !qtree_entry_unused(&entry) {
                return Ok(Some(blk as u64 * fs.blocksize as u64 + off as u64));
            }
        }
        Ok(None)
    }

    /// Walks the radix path for `id` without modifying anything. Returns
    /// the file offset of the record, or `None` when the id has none.
    pub fn read_dquot_off(&self, fs: &FsHandle, id: u32) -> Result<Option<u64>, Ocfs2Error> {
        let mut treeblk = QT_TREEOFF;
        let depth_total = qtree_depth(fs.blocksize);
        for depth in 0..depth_total {
            let buf = self.read_blk(fs, treeblk)?;
            let index = qtree_index(fs.blocksize, id, depth);
            let ref_off = index * 4;
            let child = u32::from_le_bytes(buf[ref_off..ref_off + 4].try_into().unwrap());
            if child == 0 {
                return Ok(None);
            }
            if depth == depth_total - 1 {
                return self.find_block_dqentry(fs, id, child);
            }
            treeblk = child;
        }
        Ok(None)
    }

    /// Reads the usage record of `id`. An absent id reads as an all-zero
    /// record with no file offset.
    pub fn read_dquot(&self, fs: &FsHandle, id: u32) -> Result<CachedDquot, Ocfs2Error> {
        let off = self.read_dquot_off(fs, id)?;
        let mut dquot = CachedDquot {
            ddquot: GlobalDiskDqblk {
                dqb_id: id,
                ..Default::default()
            },
            off: 0,
        };
        if let Some(off) = off {
            let blocksize = fs.blocksize as u64;
            let buf = self.read_blk(fs, (off / blocksize) as u32)?;
            let mut entry = *cast_at::<GlobalDiskDqblk>(&buf, (off % blocksize) as usize);
            swap_quota_global_dqblk(&mut entry);
            dquot.ddquot = entry;
            dquot.off = off;
        }
        Ok(dquot)
    }

    /// Clears the leaf slot of `dquot`; a leaf that empties moves from the
    /// free-entry chain to the free-block chain. Returns whether the whole
    /// block was retired.
    fn remove_leaf_dqentry(&mut self, fs: &FsHandle, off: u64) -> Result<bool, Ocfs2Error> {
        let blocksize = fs.blocksize as u64;
        let blk = (off / blocksize) as u32;
        let off_in_blk = (off % blocksize) as usize;
        let per_blk = global_dqstr_in_blk(fs.blocksize);

        let mut buf = self.read_blk(fs, blk)?;
        swap_quota_leaf_block_header(cast_at_mut::<QtDiskDqdbheader>(&mut buf, 0));
        {
            let slot = cast_at_mut::<GlobalDiskDqblk>(&mut buf, off_in_blk);
            *slot = GlobalDiskDqblk::default();
        }
        let entries = {
            let dh = cast_at_mut::<QtDiskDqdbheader>(&mut buf, 0);
            dh.dqdh_entries -= 1;
            dh.dqdh_entries
        };

        if entries == 0 {
            // the block is entirely free now
            self.remove_free_dqentry(fs, &mut buf, blk)?;
            self.put_free_dqblk(fs, &mut buf, blk)?;
            return Ok(true);
        }
        let was_full = entries as usize + 1 >= per_blk;
        if was_full {
            // it just regained room; put it back on the chain
            self.insert_free_dqentry(fs, &mut buf, blk)?;
        } else {
            swap_quota_leaf_block_header(cast_at_mut::<QtDiskDqdbheader>(&mut buf, 0));
            self.write_blk(fs, blk, &buf)?;
        }
        Ok(false)
    }

    /// Walks the radix path of `id`, removing the record and pruning tree
    /// blocks that end up referencing nothing. Returns whether the block at
    /// `treeblk` was retired.
    fn remove_tree_dqentry(
        &mut self,
        fs: &FsHandle,
        id: u32,
        treeblk: u32,
        depth: u32,
    ) -> Result<bool, Ocfs2Error> {
        let mut buf = self.read_blk(fs, treeblk)?;
        let index = qtree_index(fs.blocksize, id, depth);
        let ref_off = index * 4;
        let child = u32::from_le_bytes(buf[ref_off..ref_off + 4].try_into().unwrap());
        if child == 0 {
            return Err(Ocfs2Error::DirentNotFound);
        }

        let child_retired = if depth == qtree_depth(fs.blocksize) - 1 {
            let off = self
                .find_block_dqentry(fs, id, child)?
                .ok_or(Ocfs2Error::DirentNotFound)?;
            self.remove_leaf_dqentry(fs, off)?
        } else {
            self.remove_tree_dqentry(fs, id, child, depth + 1)?
        };
        if !child_retired {
            return Ok(false);
        }

        // the child is gone; drop the reference and retire this block too
        // if nothing else hangs off it
        buf[ref_off..ref_off + 4].fill(0);
        let refs_end = qblk_check_off(fs.blocksize) & !3;
        let empty = buf[..refs_end].iter().all(|b| *b == 0);
        if empty && treeblk != QT_TREEOFF {
            self.put_free_dqblk(fs, &mut buf, treeblk)?;
            return Ok(true);
        }
        self.write_blk(fs, treeblk, &buf)?;
        Ok(false)
    }

    /// Removes the record of `id` from the file.
    pub fn delete_dquot(&mut self, fs: &FsHandle, id: u32) -> Result<(), Ocfs2Error> {
        self.remove_tree_dqentry(fs, id, QT_TREEOFF, 0)?;
        if self.dirty {
            self.write_info(fs)?;
        }
        Ok(())
    }
}

/// One identity's usage record held in memory.
#[derive(Clone, Copy, Debug)]
pub struct CachedDquot {
    /// The host-endian record.
    pub ddquot: GlobalDiskDqblk,
    /// File offset of the record, 0 when it is not in the tree yet.
    pub off: u64,
}

/// The default number of hash buckets.
const DEFAULT_QUOTA_HASH_SIZE: usize = 8192;
/// The largest number of hash buckets.
const MAX_QUOTA_HASH_SIZE: usize = 1 << 21;

/// An in-process map of loaded usage records, so repeated deltas for one
/// identity touch the disk once.
pub struct QuotaHash {
    buckets: Vec<Vec<CachedDquot>>,
    used_entries: usize,
}

impl Default for QuotaHash {
    fn default() -> Self {
        Self::new()
    }
}

impl QuotaHash {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self {
            buckets: (0..DEFAULT_QUOTA_HASH_SIZE).map(|_| Vec::new()).collect(),
            used_entries: 0,
        }
    }

    fn bucket(&self, id: u32) -> usize {
        (id as usize).wrapping_mul(5) & (self.buckets.len() - 1)
    }

    fn maybe_grow(&mut self) {
        if self.used_entries <= self.buckets.len() * 2 || self.buckets.len() >= MAX_QUOTA_HASH_SIZE
        {
            return;
        }
        let entries: Vec<CachedDquot> = self.buckets.drain(..).flatten().collect();
        self.buckets = (0..(self.buckets.capacity() * 2).min(MAX_QUOTA_HASH_SIZE))
            .map(|_| Vec::new())
            .collect();
        for dquot in entries {
            let b = self.bucket(dquot.ddquot.dqb_id);
            self.buckets[b].push(dquot);
        }
    }

    /// Finds the record of `id`.
    pub fn find(&mut self, id: u32) -> Option<&mut CachedDquot> {
        let b = self.bucket(id);
        self.buckets[b].iter_mut().find(|d| d.ddquot.dqb_id == id)
    }

    /// Inserts a record.
    pub fn insert(&mut self, dquot: CachedDquot) {
        let b = self.bucket(dquot.ddquot.dqb_id);
        self.buckets[b].push(dquot);
        self.used_entries += 1;
        self.maybe_grow();
    }

    /// Finds the record of `id`, reading it from the quota file on a miss.
    pub fn find_read(
        &mut self,
        fs: &FsHandle,
        qf: &QuotaFile,
        id: u32,
    ) -> Result<&mut CachedDquot, Ocfs2Error> {
        let b = self.bucket(id);
        if let Some(pos) = self.buckets[b].iter().position(|d| d.ddquot.dqb_id == id) {
            return Ok(&mut self.buckets[b][pos]);
        }
        let dquot = qf.read_dquot(fs, id)?;
        self.insert(dquot);
        let b = self.bucket(id);
        let pos = self.buckets[b]
            .iter()
            .position(|d| d.ddquot.dqb_id == id)
            .unwrap();
        Ok(&mut self.buckets[b][pos])
    }

    /// Visits every loaded record.
    pub fn for_each(
        &mut self,
        mut func: impl FnMut(&mut CachedDquot) -> Result<(), Ocfs2Error>,
    ) -> Result<(), Ocfs2Error> {
        for bucket in &mut self.buckets {
            for dquot in bucket {
                func(dquot)?;
            }
        }
        Ok(())
    }
}

/// Applies a usage delta to the loaded records of both identities.
pub fn apply_quota_change(
    fs: &FsHandle,
    usrhash: &mut QuotaHash,
    grphash: &mut QuotaHash,
    usrqf: &QuotaFile,
    grpqf: &QuotaFile,
    uid: u32,
    gid: u32,
    change_bytes: i64,
    change_inodes: i64,
) -> Result<(), Ocfs2Error> {
    let user = usrhash.find_read(fs, usrqf, uid)?;
    user.ddquot.dqb_curspace = (user.ddquot.dqb_curspace as i64 + change_bytes) as u64;
    user.ddquot.dqb_curinodes = (user.ddquot.dqb_curinodes as i64 + change_inodes) as u64;

    let group = grphash.find_read(fs, grpqf, gid)?;
    group.ddquot.dqb_curspace = (group.ddquot.dqb_curspace as i64 + change_bytes) as u64;
    group.ddquot.dqb_curinodes = (group.ddquot.dqb_curinodes as i64 + change_inodes) as u64;
    Ok(())
}

/// Flushes every loaded record of a hash back into the quota file.
pub fn write_release_dquots(
    fs: &FsHandle,
    qf: &mut QuotaFile,
    hash: &mut QuotaHash,
) -> Result<(), Ocfs2Error> {
    let mut dquots = Vec::new();
    hash.for_each(|d| {
        dquots.push(*d);
        Ok(())
    })?;
    for mut dquot in dquots {
        qf.write_dquot(fs, &mut dquot)?;
    }
    if qf.dirty {
        qf.write_info(fs)?;
    }
    Ok(())
}

/// Number of blocks a fresh global quota file holds: the header block and
/// the tree root.
pub const GLOBAL_QF_INIT_BLOCKS: u32 = 2;
/// Number of blocks a fresh local quota file holds: the header block and a
/// chunk descriptor.
pub const LOCAL_QF_INIT_BLOCKS: u32 = 2;

/// Initialises the global quota file of `qtype` at inode `blkno`.
pub fn init_global_quota_file(
    fs: &FsHandle,
    qtype: QuotaType,
    blkno: u64,
) -> Result<(), Ocfs2Error> {
    let mut ci = CachedInode::read(fs, blkno)?;
    let di_flags = InodeFlags::from_bits_truncate(ci.dinode().i_flags);
    if !di_flags.contains(InodeFlags::VALID) || !di_flags.contains(InodeFlags::QUOTA) {
        return Err(Ocfs2Error::InodeNotValid(blkno));
    }

    let needed = fs.clusters_for_bytes(GLOBAL_QF_INIT_BLOCKS as u64 * fs.blocksize as u64);
    if ci.dinode().i_clusters < needed {
        let delta = needed - ci.dinode().i_clusters;
        crate::alloc::extend_allocation(fs, &mut ci, delta)?;
    }
    ci.dinode_mut().i_size = GLOBAL_QF_INIT_BLOCKS as u64 * fs.blocksize as u64;
    ci.write(fs)?;

    let mut qf = QuotaFile {
        qtype,
        ci,
        info: GlobalDiskDqinfo {
            dqi_bgrace: 60 * 60 * 24 * 7,
            dqi_igrace: 60 * 60 * 24 * 7,
            dqi_syncms: 10000,
            dqi_blocks: GLOBAL_QF_INIT_BLOCKS,
            dqi_free_blk: 0,
            dqi_free_entry: 0,
        },
        dirty: false,
    };

    // block 0: header and info; block 1: the empty tree root
    let mut buf = fs.alloc_block();
    {
        let header = cast_at_mut::<DiskDqheader>(&mut buf, 0);
        header.dqh_magic = GLOBAL_QMAGICS[qtype as usize];
        header.dqh_version = GLOBAL_QVERSIONS[qtype as usize];
        swap_quota_header(header);
    }
    {
        let info = cast_at_mut::<GlobalDiskDqinfo>(&mut buf, GLOBAL_INFO_OFF);
        *info = qf.info;
        swap_quota_global_info(info);
    }
    qf.write_blk(fs, 0, &buf)?;

    let root = fs.alloc_block();
    qf.write_blk(fs, QT_TREEOFF, &root)
}

/// Initialises the local quota file of `qtype` at inode `blkno` with a
/// header block and one chunk descriptor.
pub fn init_local_quota_file(
    fs: &FsHandle,
    qtype: QuotaType,
    blkno: u64,
) -> Result<(), Ocfs2Error> {
    let mut ci = CachedInode::read(fs, blkno)?;
    let di_flags = InodeFlags::from_bits_truncate(ci.dinode().i_flags);
    if !di_flags.contains(InodeFlags::VALID) || !di_flags.contains(InodeFlags::QUOTA) {
        return Err(Ocfs2Error::InodeNotValid(blkno));
    }

    let needed = fs.clusters_for_bytes(LOCAL_QF_INIT_BLOCKS as u64 * fs.blocksize as u64);
    if ci.dinode().i_clusters < needed {
        let delta = needed - ci.dinode().i_clusters;
        crate::alloc::extend_allocation(fs, &mut ci, delta)?;
    }
    {
        let di = ci.dinode_mut();
        di.i_size = LOCAL_QF_INIT_BLOCKS as u64 * fs.blocksize as u64;
        di.i_mtime = crate::util::get_timestamp();
    }
    ci.write(fs)?;

    let mut buf = fs.alloc_block();
    {
        let header = cast_at_mut::<DiskDqheader>(&mut buf, 0);
        header.dqh_magic = LOCAL_QMAGICS[qtype as usize];
        header.dqh_version = LOCAL_QVERSIONS[qtype as usize];
        swap_quota_header(header);
    }
    {
        let info = cast_at_mut::<LocalDiskDqinfo>(&mut buf, LOCAL_INFO_OFF);
        info.dqi_chunks = 1;
        info.dqi_blocks = LOCAL_QF_INIT_BLOCKS;
        info.dqi_flags = OLQF_CLEAN;
        swap_quota_local_info(info);
    }
    if fs.meta_ecc() {
        blockcheck::block_check_compute(&mut buf, qblk_check_off(fs.blocksize));
    }
    ci.file_write(fs, 0, 1, &buf)?;

    // the chunk descriptor starts all-zero: no delta entries are tracked
    // until a mounted node allocates them
    let mut chunk = fs.alloc_block();
    if fs.meta_ecc() {
        blockcheck::block_check_compute(&mut chunk, qblk_check_off(fs.blocksize));
    }
    ci.file_write(fs, 1, 1, &chunk)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn radix_geometry() {
        // 4096-byte blocks: 1022 references per block, four levels
        assert_eq!(qtree_depth(4096), 4);
        // 512-byte blocks: 126 references per block, five levels
        assert_eq!(qtree_depth(512), 5);
    }

    #[test]
    fn radix_indexing() {
        let bs = 4096;
        let epb = (bs as u64 - 8) / 4;
        let depth = qtree_depth(bs);
        // the deepest level indexes by id directly
        assert_eq!(qtree_index(bs, 5, depth - 1), 5);
        assert_eq!(qtree_index(bs, 5, depth - 2), 5 / epb as u32 as usize);
        // id 0 walks the leftmost path
        for d in 0..depth {
            assert_eq!(qtree_index(bs, 0, d), 0);
        }
    }

    #[test]
    fn leaf_capacity() {
        assert_eq!(
            global_dqstr_in_blk(4096),
            (4096 - 8 - 16) / size_of::<GlobalDiskDqblk>()
        );
    }

    #[test]
    fn hash_find_insert() {
        let mut hash = QuotaHash::new();
        assert!(hash.find(42).is_none());
        hash.insert(CachedDquot {
            ddquot: GlobalDiskDqblk {
                dqb_id: 42,
                dqb_curspace: 4096,
                ..Default::default()
            },
            off: 0,
        });
        let found = hash.find(42).unwrap();
        assert_eq!({ found.ddquot.dqb_curspace }, 4096);
        assert!(hash.find(43).is_none());
    }
}

#[cfg(test)]
mod file_tests {
    use super::*;
    use crate::format::test_support::scratch_volume;
    use crate::fs::FsHandle;
    use crate::fs::OpenFlags;
    use crate::ondisk::SystemFileType;

    fn quota_fs() -> (tempfile::NamedTempFile, FsHandle) {
        let tmp = scratch_volume(16 << 20, 4096, 4096);
        let fs = FsHandle::open(tmp.path(), OpenFlags::RW, 0, 0).unwrap();
        let blkno = fs
            .lookup_system_inode(SystemFileType::UserQuota, 0)
            .unwrap();
        init_global_quota_file(&fs, QuotaType::User, blkno).unwrap();
        (tmp, fs)
    }

    #[test]
    fn open_validates_magic() {
        let (_tmp, fs) = quota_fs();
        let qf = QuotaFile::open(&fs, QuotaType::User).unwrap();
        assert_eq!({ qf.info.dqi_blocks }, GLOBAL_QF_INIT_BLOCKS);
        assert_eq!({ qf.info.dqi_free_blk }, 0);
        assert_eq!({ qf.info.dqi_free_entry }, 0);
    }

    #[test]
    fn write_and_read_back_identities() {
        let (_tmp, fs) = quota_fs();
        let mut qf = QuotaFile::open(&fs, QuotaType::User).unwrap();

        // ids far apart in the radix, including one in a distant subtree
        let ids = [0u32, 1, 7, 1000, 0xdead_beef];
        for (i, id) in ids.iter().enumerate() {
            let mut dquot = CachedDquot {
                ddquot: GlobalDiskDqblk {
                    dqb_id: *id,
                    dqb_curspace: (i as u64 + 1) * 4096,
                    dqb_curinodes: i as u64 + 1,
                    ..Default::default()
                },
                off: 0,
            };
            qf.write_dquot(&fs, &mut dquot).unwrap();
            assert_ne!(dquot.off, 0);
        }

        for (i, id) in ids.iter().enumerate() {
            let dquot = qf.read_dquot(&fs, *id).unwrap();
            assert_ne!(dquot.off, 0, "id {id} not found");
            assert_eq!({ dquot.ddquot.dqb_curspace }, (i as u64 + 1) * 4096);
            assert_eq!({ dquot.ddquot.dqb_curinodes }, i as u64 + 1);
        }

        // an id that was never written reads as unused
        let dquot = qf.read_dquot(&fs, 424242).unwrap();
        assert_eq!(dquot.off, 0);
        assert_eq!({ dquot.ddquot.dqb_curspace }, 0);
    }

    #[test]
    fn delete_releases_blocks_for_reuse() {
        let (_tmp, fs) = quota_fs();
        let mut qf = QuotaFile::open(&fs, QuotaType::User).unwrap();

        let per_blk = global_dqstr_in_blk(fs.blocksize) as u32;
        // fill a little more than one leaf so two leaves exist
        let count = per_blk + 3;
        for id in 0..count {
            let mut dquot = CachedDquot {
                ddquot: GlobalDiskDqblk {
                    dqb_id: id,
                    dqb_curinodes: 1,
                    ..Default::default()
                },
                off: 0,
            };
            qf.write_dquot(&fs, &mut dquot).unwrap();
        }
        let grown_blocks = { qf.info.dqi_blocks };

        for id in 0..count {
            qf.delete_dquot(&fs, id).unwrap();
            assert_eq!(qf.read_dquot(&fs, id).unwrap().off, 0);
        }
        // everything freed went onto the free chains, not the file end
        assert_eq!({ qf.info.dqi_blocks }, grown_blocks);
        assert_ne!({ qf.info.dqi_free_blk }, 0);

        // reinsertion reuses a freed block instead of growing the file;
        // the last-deleted id is the one whose tree reference was pruned
        // along with its emptied leaf
        let mut dquot = CachedDquot {
            ddquot: GlobalDiskDqblk {
                dqb_id: count - 1,
                dqb_curinodes: 1,
                ..Default::default()
            },
            off: 0,
        };
        qf.write_dquot(&fs, &mut dquot).unwrap();
        assert_eq!({ qf.info.dqi_blocks }, grown_blocks);
    }

    #[test]
    fn usage_deltas_accumulate() {
        let tmp = scratch_volume(16 << 20, 4096, 4096);
        let fs = FsHandle::open(tmp.path(), OpenFlags::RW, 0, 0).unwrap();
        for (qtype, ftype) in [
            (QuotaType::User, SystemFileType::UserQuota),
            (QuotaType::Group, SystemFileType::GroupQuota),
        ] {
            let blkno = fs.lookup_system_inode(ftype, 0).unwrap();
            init_global_quota_file(&fs, qtype, blkno).unwrap();
        }
        let mut usrqf = QuotaFile::open(&fs, QuotaType::User).unwrap();
        let mut grpqf = QuotaFile::open(&fs, QuotaType::Group).unwrap();
        let mut usrhash = QuotaHash::new();
        let mut grphash = QuotaHash::new();

        apply_quota_change(&fs, &mut usrhash, &mut grphash, &usrqf, &grpqf, 500, 100, 8192, 2)
            .unwrap();
        apply_quota_change(&fs, &mut usrhash, &mut grphash, &usrqf, &grpqf, 500, 100, 4096, 1)
            .unwrap();
        apply_quota_change(
            &fs, &mut usrhash, &mut grphash, &usrqf, &grpqf, 501, 100, -4096, -1,
        )
        .unwrap();

        write_release_dquots(&fs, &mut usrqf, &mut usrhash).unwrap();
        write_release_dquots(&fs, &mut grpqf, &mut grphash).unwrap();

        let user = usrqf.read_dquot(&fs, 500).unwrap();
        assert_eq!({ user.ddquot.dqb_curspace }, 12288);
        assert_eq!({ user.ddquot.dqb_curinodes }, 3);
        let other = usrqf.read_dquot(&fs, 501).unwrap();
        assert_eq!({ other.ddquot.dqb_curspace }, -4096i64 as u64);
        let group = grpqf.read_dquot(&fs, 100).unwrap();
        assert_eq!({ group.ddquot.dqb_curspace }, 8192);
        assert_eq!({ group.ddquot.dqb_curinodes }, 2);
    }

    #[test]
    fn local_file_layout() {
        let (_tmp, fs) = quota_fs();
        let blkno = fs
            .lookup_system_inode(SystemFileType::LocalUserQuota, 0)
            .unwrap();
        init_local_quota_file(&fs, QuotaType::User, blkno).unwrap();

        let ci = crate::inode::CachedInode::read(&fs, blkno).unwrap();
        assert_eq!(
            { ci.dinode().i_size },
            LOCAL_QF_INIT_BLOCKS as u64 * fs.blocksize as u64
        );

        let mut buf = fs.alloc_block();
        ci.file_read(&fs, 0, 1, &mut buf).unwrap();
        let mut header = *crate::util::cast_at::<DiskDqheader>(&buf, 0);
        swap_quota_header(&mut header);
        assert_eq!({ header.dqh_magic }, LOCAL_QMAGICS[QuotaType::User as usize]);
        let mut info = *crate::util::cast_at::<LocalDiskDqinfo>(&buf, LOCAL_INFO_OFF);
        swap_quota_local_info(&mut info);
        assert_eq!({ info.dqi_chunks }, 1);
        assert_eq!({ info.dqi_blocks }, LOCAL_QF_INIT_BLOCKS);
        assert_eq!({ info.dqi_flags }, OLQF_CLEAN);
    }
}
