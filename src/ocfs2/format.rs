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

//! Creating a filesystem on a device.
//!
//! The factory lays a minimal consistent core straight onto the device:
//! superblock, cluster bitmap, the inode allocator group holding every
//! system inode, and the three initial directories. It then opens the
//! result and finishes through the ordinary engines, so the very first
//! directory inserts and journal writes already exercise the same code
//! paths every later mutation uses.

use crate::blockcheck;
use crate::dir;
use crate::error::Ocfs2Error;
use crate::fs::FsHandle;
use crate::fs::OpenFlags;
use crate::fs::INODE_CHECK_OFF;
use crate::inode;
use crate::journal;
use crate::ondisk::*;
use crate::util::cast_at_mut;
use crate::util::get_timestamp;
use crate::util::log2;
use crate::{alloc, bitmap};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use uuid::Uuid;

/// The default block size in bytes.
const DEFAULT_BLOCK_SIZE: u32 = 4096;
/// The default cluster size in bytes.
const DEFAULT_CLUSTER_SIZE: u32 = 4096;

/// Inode-allocator groups start with at least this many bits.
const MIN_SUBALLOC_BITS: u32 = 64;

/// A factory to create an `ocfs2` filesystem.
#[derive(Default)]
pub struct Ocfs2Factory {
    /// The length of the filesystem in bytes.
    pub len: Option<u64>,
    /// The block size in bytes.
    pub block_size: Option<u32>,
    /// The cluster size in bytes.
    pub cluster_size: Option<u32>,
    /// The ID of the filesystem.
    pub fs_id: Option<[u8; 16]>,
    /// The name of the filesystem.
    pub label: Option<String>,
    /// Size of the slot-0 journal in blocks; 0 skips the journal body.
    pub journal_blocks: Option<u32>,
}

/// Every block position the factory decides up front.
struct Layout {
    blocksize: u32,
    clustersize: u32,
    bpc: u32,
    clusters: u32,
    cpg: u32,
    ngroups: u32,
    /// Clusters per inode-allocator group.
    sub_cpg: u32,
    /// First cluster of the inode-allocator group.
    ialloc_cluster: u32,
    /// Block of the inode-allocator group descriptor.
    ialloc_gd_blkno: u64,
    /// Clusters of the three initial directories.
    sysdir_cluster: u32,
    rootdir_cluster: u32,
    orphandir_cluster: u32,
    /// First cluster and length of the journal body.
    journal_cluster: u32,
    journal_clusters: u32,
}

/// Bit index of each system inode inside the inode-allocator group.
#[derive(Clone, Copy)]
enum InodeSlot {
    GlobalInodeAlloc = 1,
    GlobalBitmap = 2,
    SystemDir = 3,
    RootDir = 4,
    BadBlocks = 5,
    SlotMap = 6,
    Heartbeat = 7,
    OrphanDir = 8,
    ExtentAlloc = 9,
    InodeAlloc = 10,
    Journal = 11,
    LocalAlloc = 12,
    TruncateLog = 13,
    UserQuota = 14,
    GroupQuota = 15,
    LocalUserQuota = 16,
    LocalGroupQuota = 17,
}

/// One past the last used inode bit.
const INODE_SLOTS_END: u32 = 18;

impl Layout {
    fn inode_blkno(&self, slot: InodeSlot) -> u64 {
        self.ialloc_gd_blkno + slot as u64
    }

    fn clusters_to_blocks(&self, c: u32) -> u64 {
        c as u64 * self.bpc as u64
    }
}

impl Ocfs2Factory {
    /// Tells whether an `ocfs2` filesystem is present on the given device.
    pub fn is_present(&self, dev: &mut File) -> Result<bool, Ocfs2Error> {
        let mut blocksize = MIN_BLOCKSIZE;
        let mut buf = vec![0u8; 8];
        while blocksize <= MAX_BLOCKSIZE {
            let off = SUPER_BLOCK_BLKNO * blocksize as u64;
            if dev.read_exact_at(&mut buf, off).is_ok()
                && signature_matches(&buf, SUPER_BLOCK_SIGNATURE)
            {
                return Ok(true);
            }
            blocksize <<= 1;
        }
        Ok(false)
    }

    /// Creates the filesystem on the device at `path`.
    pub fn create(&self, path: &Path, dev: &mut File) -> Result<(), Ocfs2Error> {
        let layout = self.plan(dev)?;
        let uuid = self.fs_id.map(Uuid::from_bytes).unwrap_or_else(Uuid::new_v4);

        self.write_core(dev, &layout, &uuid)?;
        dev.sync_all()?;

        // reopen through the front door and finish with the live engines
        let fs = FsHandle::open(path, OpenFlags::RW, 0, 0)?;
        self.populate(&fs, &layout)?;
        fs.close()
    }

    fn plan(&self, dev: &mut File) -> Result<Layout, Ocfs2Error> {
        let blocksize = self.block_size.unwrap_or(DEFAULT_BLOCK_SIZE);
        let clustersize = self.cluster_size.unwrap_or(DEFAULT_CLUSTER_SIZE);
        if !blocksize.is_power_of_two() || !(MIN_BLOCKSIZE..=MAX_BLOCKSIZE).contains(&blocksize) {
            return Err(Ocfs2Error::InvalidArgument("invalid block size"));
        }
        if !clustersize.is_power_of_two()
            || clustersize < blocksize
            || !(1 << MIN_CLUSTERSIZE_BITS..=1 << MAX_CLUSTERSIZE_BITS).contains(&clustersize)
        {
            return Err(Ocfs2Error::InvalidArgument("invalid cluster size"));
        }

        let len = match self.len {
            Some(len) => len,
            None => dev.metadata()?.len(),
        };
        let clusters = (len / clustersize as u64) as u32;
        let bpc = clustersize / blocksize;

        let cpg = clusters.min((blocksize - GROUP_BITMAP_OFF as u32) * 8);
        let ngroups = clusters.div_ceil(cpg);

        let sub_cpg = MIN_SUBALLOC_BITS.div_ceil(bpc);
        let ialloc_cluster = 3 / bpc + 1;
        let ialloc_gd_blkno = (ialloc_cluster as u64) * bpc as u64;

        let sysdir_cluster = ialloc_cluster + sub_cpg;
        let rootdir_cluster = sysdir_cluster + 1;
        let orphandir_cluster = rootdir_cluster + 1;
        let journal_cluster = orphandir_cluster + 1;

        let wanted_journal = self
            .journal_blocks
            .unwrap_or(journal::MIN_JOURNAL_BLOCKS);
        let journal_clusters = if wanted_journal == 0 {
            0
        } else {
            (wanted_journal as u64 * blocksize as u64).div_ceil(clustersize as u64) as u32
        };

        // leave at least a few free clusters behind the fixed area
        if journal_cluster + journal_clusters + 4 >= clusters {
            return Err(Ocfs2Error::InvalidArgument("device too small"));
        }

        Ok(Layout {
            blocksize,
            clustersize,
            bpc,
            clusters,
            cpg,
            ngroups,
            sub_cpg,
            ialloc_cluster,
            ialloc_gd_blkno,
            sysdir_cluster,
            rootdir_cluster,
            orphandir_cluster,
            journal_cluster,
            journal_clusters,
        })
    }

    /// Lays the core skeleton straight onto the device.
    fn write_core(&self, dev: &File, l: &Layout, uuid: &Uuid) -> Result<(), Ocfs2Error> {
        let timestamp = get_timestamp();
        let generation = u32::from_le_bytes(uuid.as_bytes()[0..4].try_into().unwrap());

        // clusters consumed by the fixed area, marked used in the bitmap
        let mut used = Vec::new();
        for c in 0..=3 / l.bpc {
            used.push(c);
        }
        for c in l.ialloc_cluster..l.ialloc_cluster + l.sub_cpg {
            used.push(c);
        }
        used.push(l.sysdir_cluster);
        used.push(l.rootdir_cluster);
        used.push(l.orphandir_cluster);
        for c in l.journal_cluster..l.journal_cluster + l.journal_clusters {
            used.push(c);
        }

        // cluster-bitmap groups
        let mut total_free = 0u32;
        for g in 0..l.ngroups {
            let gd_blkno = if g == 0 {
                3
            } else {
                l.clusters_to_blocks(g * l.cpg)
            };
            let start = g * l.cpg;
            let bits = l.cpg.min(l.clusters - start) as u16;

            let mut buf = vec![0u8; l.blocksize as usize];
            {
                let gd = cast_at_mut::<GroupDesc>(&mut buf, 0);
                set_signature(&mut gd.bg_signature, GROUP_DESC_SIGNATURE);
                gd.bg_size = l.blocksize as u16;
                gd.bg_bits = bits;
                gd.bg_chain = 0;
                gd.bg_generation = generation;
                gd.bg_parent_dinode = l.inode_blkno(InodeSlot::GlobalBitmap);
                gd.bg_blkno = gd_blkno;
                gd.bg_next_group = if g + 1 < l.ngroups {
                    l.clusters_to_blocks((g + 1) * l.cpg)
                } else {
                    0
                };
                let mut set = 0;
                if g > 0 {
                    // the descriptor's own cluster
                    bitmap::set_bit(gd.bitmap_mut(), 0);
                    set += 1;
                }
                for c in &used {
                    if *c >= start && *c < start + bits as u32 {
                        if !bitmap::test_bit(gd.bitmap(), (*c - start) as usize) {
                            bitmap::set_bit(gd.bitmap_mut(), (*c - start) as usize);
                            set += 1;
                        }
                    }
                }
                let gd = cast_at_mut::<GroupDesc>(&mut buf, 0);
                gd.bg_free_bits_count = bits - set;
                total_free += (bits - set) as u32;
            }
            alloc::swap_group_desc_from_native(&mut buf);
            blockcheck::block_check_compute(&mut buf, alloc::GROUP_DESC_CHECK_OFF);
            dev.write_all_at(&buf, gd_blkno * l.blocksize as u64)?;
        }

        // the inode-allocator group, every system inode a set bit
        {
            let bits = (l.sub_cpg * l.bpc) as u16;
            let mut buf = vec![0u8; l.blocksize as usize];
            {
                let gd = cast_at_mut::<GroupDesc>(&mut buf, 0);
                set_signature(&mut gd.bg_signature, GROUP_DESC_SIGNATURE);
                gd.bg_size = l.blocksize as u16;
                gd.bg_bits = bits;
                gd.bg_free_bits_count = bits - INODE_SLOTS_END as u16;
                gd.bg_chain = 0;
                gd.bg_generation = generation;
                gd.bg_parent_dinode = l.inode_blkno(InodeSlot::GlobalInodeAlloc);
                gd.bg_blkno = l.ialloc_gd_blkno;
                bitmap::set_range(gd.bitmap_mut(), 0, INODE_SLOTS_END as usize);
            }
            alloc::swap_group_desc_from_native(&mut buf);
            blockcheck::block_check_compute(&mut buf, alloc::GROUP_DESC_CHECK_OFF);
            dev.write_all_at(&buf, l.ialloc_gd_blkno * l.blocksize as u64)?;
        }

        // the superblock inode
        {
            let mut buf = vec![0u8; l.blocksize as usize];
            self.fill_inode_header(
                &mut buf,
                l,
                SUPER_BLOCK_BLKNO,
                0,
                0o644,
                InodeFlags::VALID | InodeFlags::SYSTEM | InodeFlags::SUPER_BLOCK,
                timestamp,
                generation,
            );
            {
                let di = cast_at_mut::<Dinode>(&mut buf, 0);
                di.i_clusters = l.clusters;
            }
            {
                let sb = inode_super_block_mut(&mut buf);
                sb.s_major_rev_level = 0;
                sb.s_minor_rev_level = 90;
                sb.s_state = 0;
                sb.s_errors = 0;
                sb.s_checkinterval = 0;
                sb.s_lastcheck = timestamp;
                sb.s_creator_os = 0;
                sb.s_feature_compat = FeatureCompat::JBD2_SB.bits();
                sb.s_feature_incompat = (FeatureIncompat::LOCAL_MOUNT
                    | FeatureIncompat::SPARSE_ALLOC
                    | FeatureIncompat::INLINE_DATA
                    | FeatureIncompat::META_ECC
                    | FeatureIncompat::XATTR
                    | FeatureIncompat::INDEXED_DIRS
                    | FeatureIncompat::REFCOUNT_TREE)
                    .bits();
                sb.s_feature_ro_compat =
                    (FeatureRoCompat::USRQUOTA | FeatureRoCompat::GRPQUOTA).bits();
                sb.s_root_blkno = l.inode_blkno(InodeSlot::RootDir);
                sb.s_system_dir_blkno = l.inode_blkno(InodeSlot::SystemDir);
                sb.s_blocksize_bits = log2(l.blocksize as u64).unwrap() as u32;
                sb.s_clustersize_bits = log2(l.clustersize as u64).unwrap() as u32;
                sb.s_max_slots = 1;
                sb.s_first_cluster_group = 3;
                sb.s_uuid = *uuid.as_bytes();
                sb.s_uuid_hash = generation;
                if let Some(label) = &self.label {
                    let label = label.as_bytes();
                    let len = label.len().min(MAX_VOL_LABEL_LEN);
                    sb.s_label[..len].copy_from_slice(&label[..len]);
                }
                let mut seed = [0u32; 3];
                for (i, lane) in seed.iter_mut().enumerate() {
                    *lane = u32::from_le_bytes(
                        uuid.as_bytes()[i * 4 + 4..i * 4 + 8].try_into().unwrap(),
                    );
                }
                sb.s_dx_seed = seed;
            }
            self.write_inode_raw(dev, l, SUPER_BLOCK_BLKNO, buf)?;
        }

        // the global cluster bitmap inode
        {
            let blkno = l.inode_blkno(InodeSlot::GlobalBitmap);
            let mut buf = vec![0u8; l.blocksize as usize];
            self.fill_inode_header(
                &mut buf,
                l,
                blkno,
                InodeSlot::GlobalBitmap as u16,
                0o644,
                InodeFlags::VALID | InodeFlags::SYSTEM | InodeFlags::BITMAP | InodeFlags::CHAIN,
                timestamp,
                generation,
            );
            {
                let di = cast_at_mut::<Dinode>(&mut buf, 0);
                di.i_clusters = l.clusters;
                di.i_size = l.clusters as u64 * l.clustersize as u64;
                di.id1 = InodeId1 {
                    bitmap1: InodeBitmap1 {
                        i_used: l.clusters - total_free,
                        i_total: l.clusters,
                    },
                };
            }
            {
                let cl = inode_chain_list_mut(&mut buf);
                cl.cl_cpg = l.cpg as u16;
                cl.cl_bpc = 1;
                cl.cl_count = chain_recs_per_inode(l.blocksize);
                cl.cl_next_free_rec = 1;
                let rec = &mut cl.recs_mut()[0];
                rec.c_blkno = 3;
                rec.c_total = l.clusters;
                rec.c_free = total_free;
            }
            self.write_inode_raw(dev, l, blkno, buf)?;
        }

        // the global inode allocator
        {
            let blkno = l.inode_blkno(InodeSlot::GlobalInodeAlloc);
            let bits = l.sub_cpg * l.bpc;
            let mut buf = vec![0u8; l.blocksize as usize];
            self.fill_inode_header(
                &mut buf,
                l,
                blkno,
                InodeSlot::GlobalInodeAlloc as u16,
                0o644,
                InodeFlags::VALID | InodeFlags::SYSTEM | InodeFlags::BITMAP | InodeFlags::CHAIN,
                timestamp,
                generation,
            );
            {
                let di = cast_at_mut::<Dinode>(&mut buf, 0);
                di.i_clusters = l.sub_cpg;
                di.id1 = InodeId1 {
                    bitmap1: InodeBitmap1 {
                        i_used: INODE_SLOTS_END,
                        i_total: bits,
                    },
                };
            }
            {
                let cl = inode_chain_list_mut(&mut buf);
                cl.cl_cpg = l.sub_cpg as u16;
                cl.cl_bpc = l.bpc as u16;
                cl.cl_count = chain_recs_per_inode(l.blocksize);
                cl.cl_next_free_rec = 1;
                let rec = &mut cl.recs_mut()[0];
                rec.c_blkno = l.ialloc_gd_blkno;
                rec.c_total = bits;
                rec.c_free = bits - INODE_SLOTS_END;
            }
            self.write_inode_raw(dev, l, blkno, buf)?;
        }

        // the block suballocators, chains empty until first use
        for slot in [InodeSlot::ExtentAlloc, InodeSlot::InodeAlloc] {
            let blkno = l.inode_blkno(slot);
            let mut buf = vec![0u8; l.blocksize as usize];
            self.fill_inode_header(
                &mut buf,
                l,
                blkno,
                slot as u16,
                0o644,
                InodeFlags::VALID | InodeFlags::SYSTEM | InodeFlags::BITMAP | InodeFlags::CHAIN,
                timestamp,
                generation,
            );
            {
                let di = cast_at_mut::<Dinode>(&mut buf, 0);
                di.id1 = InodeId1 {
                    bitmap1: InodeBitmap1 {
                        i_used: 0,
                        i_total: 0,
                    },
                };
            }
            {
                let cl = inode_chain_list_mut(&mut buf);
                cl.cl_cpg = l.sub_cpg as u16;
                cl.cl_bpc = l.bpc as u16;
                cl.cl_count = chain_recs_per_inode(l.blocksize);
            }
            self.write_inode_raw(dev, l, blkno, buf)?;
        }

        // the three directories and their first clusters
        self.write_dir_core(
            dev,
            l,
            InodeSlot::SystemDir,
            l.inode_blkno(InodeSlot::SystemDir),
            l.sysdir_cluster,
            timestamp,
            generation,
        )?;
        self.write_dir_core(
            dev,
            l,
            InodeSlot::RootDir,
            l.inode_blkno(InodeSlot::RootDir),
            l.rootdir_cluster,
            timestamp,
            generation,
        )?;
        self.write_dir_core(
            dev,
            l,
            InodeSlot::OrphanDir,
            l.inode_blkno(InodeSlot::SystemDir),
            l.orphandir_cluster,
            timestamp,
            generation,
        )?;

        // the journal inode
        {
            let blkno = l.inode_blkno(InodeSlot::Journal);
            let mut buf = vec![0u8; l.blocksize as usize];
            self.fill_inode_header(
                &mut buf,
                l,
                blkno,
                InodeSlot::Journal as u16,
                0o644,
                InodeFlags::VALID | InodeFlags::SYSTEM | InodeFlags::JOURNAL,
                timestamp,
                generation,
            );
            {
                let di = cast_at_mut::<Dinode>(&mut buf, 0);
                di.i_clusters = l.journal_clusters;
                di.i_size = l.journal_clusters as u64 * l.clustersize as u64;
            }
            {
                let el = inode_extent_list_mut(&mut buf);
                el.l_count = extent_recs_per_inode(l.blocksize);
                if l.journal_clusters > 0 {
                    el.l_next_free_rec = 1;
                    let rec = el.rec_mut(0);
                    rec.e_cpos = 0;
                    rec.e_leaf_clusters = l.journal_clusters as u16;
                    rec.e_blkno = l.clusters_to_blocks(l.journal_cluster);
                }
            }
            self.write_inode_raw(dev, l, blkno, buf)?;
        }

        // the local allocator window
        {
            let blkno = l.inode_blkno(InodeSlot::LocalAlloc);
            let mut buf = vec![0u8; l.blocksize as usize];
            self.fill_inode_header(
                &mut buf,
                l,
                blkno,
                InodeSlot::LocalAlloc as u16,
                0o644,
                InodeFlags::VALID | InodeFlags::SYSTEM | InodeFlags::LOCAL_ALLOC,
                timestamp,
                generation,
            );
            {
                let la = cast_at_mut::<LocalAlloc>(&mut buf, INODE_BODY_OFF);
                la.la_bm_off = 0;
                la.la_size = (l.blocksize as usize
                    - INODE_BODY_OFF
                    - std::mem::size_of::<LocalAlloc>()) as u16;
            }
            self.write_inode_raw(dev, l, blkno, buf)?;
        }

        // the truncate log
        {
            let blkno = l.inode_blkno(InodeSlot::TruncateLog);
            let mut buf = vec![0u8; l.blocksize as usize];
            self.fill_inode_header(
                &mut buf,
                l,
                blkno,
                InodeSlot::TruncateLog as u16,
                0o644,
                InodeFlags::VALID | InodeFlags::SYSTEM | InodeFlags::DEALLOC,
                timestamp,
                generation,
            );
            {
                let tl = inode_truncate_log_mut(&mut buf);
                tl.tl_count = truncate_recs_per_inode(l.blocksize);
            }
            self.write_inode_raw(dev, l, blkno, buf)?;
        }

        // plain, empty system files
        for (slot, quota) in [
            (InodeSlot::BadBlocks, false),
            (InodeSlot::SlotMap, false),
            (InodeSlot::Heartbeat, false),
            (InodeSlot::UserQuota, true),
            (InodeSlot::GroupQuota, true),
            (InodeSlot::LocalUserQuota, true),
            (InodeSlot::LocalGroupQuota, true),
        ] {
            let blkno = l.inode_blkno(slot);
            let mut buf = vec![0u8; l.blocksize as usize];
            let mut flags = InodeFlags::VALID | InodeFlags::SYSTEM;
            if quota {
                flags |= InodeFlags::QUOTA;
            }
            self.fill_inode_header(
                &mut buf, l, blkno, slot as u16, 0o644, flags, timestamp, generation,
            );
            {
                let el = inode_extent_list_mut(&mut buf);
                el.l_count = extent_recs_per_inode(l.blocksize);
            }
            self.write_inode_raw(dev, l, blkno, buf)?;
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn fill_inode_header(
        &self,
        buf: &mut [u8],
        l: &Layout,
        blkno: u64,
        suballoc_bit: u16,
        mode: u16,
        flags: InodeFlags,
        timestamp: u64,
        generation: u32,
    ) {
        let di = cast_at_mut::<Dinode>(buf, 0);
        set_signature(&mut di.i_signature, INODE_SIGNATURE);
        di.i_generation = generation;
        di.i_fs_generation = generation;
        di.i_blkno = blkno;
        di.i_suballoc_slot = 0;
        di.i_suballoc_bit = suballoc_bit;
        di.i_suballoc_loc = if suballoc_bit != 0 {
            l.ialloc_gd_blkno
        } else {
            0
        };
        di.i_mode = mode;
        di.i_links_count = 1;
        di.i_flags = flags.bits();
        di.i_atime = timestamp;
        di.i_ctime = timestamp;
        di.i_mtime = timestamp;
    }

    fn write_inode_raw(
        &self,
        dev: &File,
        l: &Layout,
        blkno: u64,
        mut buf: Vec<u8>,
    ) -> Result<(), Ocfs2Error> {
        inode::swap_inode_from_native(l.blocksize, &mut buf)?;
        blockcheck::block_check_compute(&mut buf, INODE_CHECK_OFF);
        dev.write_all_at(&buf, blkno * l.blocksize as u64)?;
        Ok(())
    }

    /// Writes a directory inode and formats its first cluster with `.` and
    /// `..` plus trailers.
    #[allow(clippy::too_many_arguments)]
    fn write_dir_core(
        &self,
        dev: &File,
        l: &Layout,
        slot: InodeSlot,
        parent_blkno: u64,
        cluster: u32,
        timestamp: u64,
        generation: u32,
    ) -> Result<(), Ocfs2Error> {
        let blkno = l.inode_blkno(slot);
        let first_blkno = l.clusters_to_blocks(cluster);

        let mut buf = vec![0u8; l.blocksize as usize];
        self.fill_inode_header(
            &mut buf,
            l,
            blkno,
            slot as u16,
            0o040000 | 0o755,
            InodeFlags::VALID | InodeFlags::SYSTEM,
            timestamp,
            generation,
        );
        {
            let di = cast_at_mut::<Dinode>(&mut buf, 0);
            di.i_clusters = 1;
            di.i_size = l.clustersize as u64;
            di.i_links_count = 2;
        }
        {
            let el = inode_extent_list_mut(&mut buf);
            el.l_count = extent_recs_per_inode(l.blocksize);
            el.l_next_free_rec = 1;
            let rec = el.rec_mut(0);
            rec.e_cpos = 0;
            rec.e_leaf_clusters = 1;
            rec.e_blkno = first_blkno;
        }
        self.write_inode_raw(dev, l, blkno, buf)?;

        // first block carries `.` and `..`, the rest of the cluster is
        // empty entry space
        let trailer_off = dir_trailer_blk_off(l.blocksize);
        for i in 0..l.bpc as u64 {
            let mut blk = vec![0u8; l.blocksize as usize];
            if i == 0 {
                {
                    let de = cast_at_mut::<DirEntry>(&mut blk, 0);
                    de.inode = blkno;
                    de.rec_len = dir_rec_len(1) as u16;
                    de.file_type = dir::FT_DIR;
                    de.set_name(b".");
                }
                let de = cast_at_mut::<DirEntry>(&mut blk, dir_rec_len(1));
                de.inode = parent_blkno;
                de.rec_len = (trailer_off - dir_rec_len(1)) as u16;
                de.file_type = dir::FT_DIR;
                de.set_name(b"..");
            } else {
                let de = cast_at_mut::<DirEntry>(&mut blk, 0);
                de.inode = 0;
                de.rec_len = trailer_off as u16;
            }
            {
                let trailer = dir_trailer_mut(&mut blk);
                trailer.db_compat_rec_len = DIR_TRAILER_LEN as u16;
                set_signature(&mut trailer.db_signature, DIR_TRAILER_SIGNATURE);
                trailer.db_blkno = first_blkno + i;
                trailer.db_parent_dinode = blkno;
            }
            let check_off = l.blocksize as usize - DIR_TRAILER_LEN + dir::DIR_TRAILER_CHECK_OFF;
            blockcheck::block_check_compute(&mut blk, check_off);
            dev.write_all_at(&blk, (first_blkno + i) * l.blocksize as u64)?;
        }
        Ok(())
    }

    /// Finishes the filesystem through the ordinary engines: system
    /// directory entries and the journal superblock.
    fn populate(&self, fs: &FsHandle, l: &Layout) -> Result<(), Ocfs2Error> {
        let entries: [(SystemFileType, InodeSlot); 15] = [
            (SystemFileType::BadBlock, InodeSlot::BadBlocks),
            (SystemFileType::GlobalInodeAlloc, InodeSlot::GlobalInodeAlloc),
            (SystemFileType::SlotMap, InodeSlot::SlotMap),
            (SystemFileType::Heartbeat, InodeSlot::Heartbeat),
            (SystemFileType::GlobalBitmap, InodeSlot::GlobalBitmap),
            (SystemFileType::UserQuota, InodeSlot::UserQuota),
            (SystemFileType::GroupQuota, InodeSlot::GroupQuota),
            (SystemFileType::OrphanDir, InodeSlot::OrphanDir),
            (SystemFileType::ExtentAlloc, InodeSlot::ExtentAlloc),
            (SystemFileType::InodeAlloc, InodeSlot::InodeAlloc),
            (SystemFileType::Journal, InodeSlot::Journal),
            (SystemFileType::LocalAlloc, InodeSlot::LocalAlloc),
            (SystemFileType::TruncateLog, InodeSlot::TruncateLog),
            (SystemFileType::LocalUserQuota, InodeSlot::LocalUserQuota),
            (SystemFileType::LocalGroupQuota, InodeSlot::LocalGroupQuota),
        ];
        for (ftype, slot) in entries {
            let name = ftype.file_name(0);
            let file_type = match slot {
                InodeSlot::OrphanDir => dir::FT_DIR,
                _ => dir::FT_REG_FILE,
            };
            dir::link(
                fs,
                fs.sysdir_blkno,
                name.as_bytes(),
                l.inode_blkno(slot),
                file_type,
            )?;
        }

        if l.journal_clusters > 0 {
            let jsb = journal::create_journal_superblock(
                fs,
                (l.journal_clusters as u64 * l.bpc as u64) as u32,
            )?;
            journal::write_journal_superblock(fs, l.clusters_to_blocks(l.journal_cluster), &jsb)?;
        }
        Ok(())
    }
}

/// Convenience wrapper formatting the file or device at `path` with
/// default options.
pub fn format_volume(path: &Path, factory: &Ocfs2Factory) -> Result<(), Ocfs2Error> {
    let mut dev = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)?;
    factory.create(path, &mut dev)
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use tempfile::NamedTempFile;

    /// Creates a formatted scratch volume for tests.
    pub fn scratch_volume(bytes: u64, block_size: u32, cluster_size: u32) -> NamedTempFile {
        let tmp = NamedTempFile::new().unwrap();
        tmp.as_file().set_len(bytes).unwrap();
        let factory = Ocfs2Factory {
            block_size: Some(block_size),
            cluster_size: Some(cluster_size),
            label: Some("scratch".into()),
            // keep the journal small so tiny volumes stay mostly free
            journal_blocks: Some(0),
            ..Default::default()
        };
        format_volume(tmp.path(), &factory).unwrap();
        tmp
    }

    /// A scratch volume with a journal body.
    pub fn scratch_volume_with_journal(bytes: u64) -> NamedTempFile {
        let tmp = NamedTempFile::new().unwrap();
        tmp.as_file().set_len(bytes).unwrap();
        let factory = Ocfs2Factory {
            block_size: Some(4096),
            cluster_size: Some(4096),
            ..Default::default()
        };
        format_volume(tmp.path(), &factory).unwrap();
        tmp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{FsHandle, OpenFlags};

    #[test]
    fn format_and_open() {
        let tmp = test_support::scratch_volume(16 << 20, 4096, 4096);
        let fs = FsHandle::open(tmp.path(), OpenFlags::empty(), 0, 0).unwrap();
        assert_eq!(fs.blocksize, 4096);
        assert_eq!(fs.clustersize, 4096);
        assert_eq!(fs.clusters, (16 << 20) / 4096);
        assert!(fs.root_blkno != 0);
        assert!(fs.sysdir_blkno != 0);
        fs.close().unwrap();
    }

    #[test]
    fn detects_existing_filesystem() {
        let tmp = test_support::scratch_volume(16 << 20, 4096, 4096);
        let factory = Ocfs2Factory::default();
        let mut dev = std::fs::File::open(tmp.path()).unwrap();
        assert!(factory.is_present(&mut dev).unwrap());

        let empty = tempfile::NamedTempFile::new().unwrap();
        empty.as_file().set_len(1 << 20).unwrap();
        let mut dev = std::fs::File::open(empty.path()).unwrap();
        assert!(!factory.is_present(&mut dev).unwrap());
    }

    #[test]
    fn system_files_resolvable() {
        let tmp = test_support::scratch_volume(16 << 20, 4096, 4096);
        let fs = FsHandle::open(tmp.path(), OpenFlags::empty(), 0, 0).unwrap();
        for ftype in [
            SystemFileType::GlobalBitmap,
            SystemFileType::GlobalInodeAlloc,
            SystemFileType::ExtentAlloc,
            SystemFileType::InodeAlloc,
            SystemFileType::OrphanDir,
            SystemFileType::Journal,
        ] {
            let blkno = fs.lookup_system_inode(ftype, 0).unwrap();
            assert!(blkno > SUPER_BLOCK_BLKNO);
        }
    }

    #[test]
    fn small_blocks_format() {
        let tmp = test_support::scratch_volume(8 << 20, 512, 4096);
        let fs = FsHandle::open(tmp.path(), OpenFlags::empty(), 0, 0).unwrap();
        assert_eq!(fs.blocksize, 512);
        assert_eq!(fs.blocks_per_cluster(), 8);
        crate::inode::check_directory(&fs, fs.root_blkno).unwrap();
        crate::inode::check_directory(&fs, fs.sysdir_blkno).unwrap();
    }
}
