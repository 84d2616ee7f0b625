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

//! On-disk structures of the OCFS2 filesystem.
//!
//! Every structure here is `#[repr(C, packed)]` and stored little-endian on
//! disk. Buffers are swapped to host endianness right after a read and back
//! right before a write (see the `byteorder` module); in between, fields are
//! plain host-endian integers.

use crate::util::cast_at;
use crate::util::cast_at_mut;
use bitflags::bitflags;
use std::mem::size_of;
use std::slice;

/// The smallest supported block size.
pub const MIN_BLOCKSIZE: u32 = 512;
/// The largest supported block size.
pub const MAX_BLOCKSIZE: u32 = 4096;
/// The smallest supported cluster size (2^12).
pub const MIN_CLUSTERSIZE_BITS: u32 = 12;
/// The largest supported cluster size (2^20).
pub const MAX_CLUSTERSIZE_BITS: u32 = 20;

/// The block number of the primary superblock, in filesystem blocks.
pub const SUPER_BLOCK_BLKNO: u64 = 2;
/// The maximum number of node slots.
pub const MAX_SLOTS: u16 = 255;
/// The maximum number of backup superblocks.
pub const MAX_BACKUP_SUPERBLOCKS: usize = 6;
/// Byte offsets at which backup superblocks are kept: 1 GiB, 4 GiB, 16 GiB,
/// 64 GiB, 256 GiB and 1 TiB.
pub const BACKUP_SB_OFFSETS: [u64; MAX_BACKUP_SUPERBLOCKS] = [
    1 << 30,
    4 << 30,
    16 << 30,
    64 << 30,
    256 << 30,
    1 << 40,
];

/// The maximum length of a file name.
pub const MAX_FILENAME_LEN: usize = 255;
/// The length of the volume label.
pub const MAX_VOL_LABEL_LEN: usize = 64;
/// The length of the volume UUID.
pub const VOL_UUID_LEN: usize = 16;
/// The maximum depth of an extent tree.
pub const MAX_PATH_DEPTH: usize = 5;
/// Mask extracting the low 32 bits of a 64-bit cluster position.
pub const POS_32BIT_MASK: u64 = 0xffffffff;

/// Superblock signature.
pub const SUPER_BLOCK_SIGNATURE: &str = "OCFSV2";
/// Inode signature.
pub const INODE_SIGNATURE: &str = "INODE01";
/// Extent block signature.
pub const EXTENT_BLOCK_SIGNATURE: &str = "EXBLK01";
/// Group descriptor signature.
pub const GROUP_DESC_SIGNATURE: &str = "GROUP01";
/// Refcount block signature.
pub const REFCOUNT_BLOCK_SIGNATURE: &str = "REFCNT1";
/// Xattr block signature.
pub const XATTR_BLOCK_SIGNATURE: &str = "XATTR01";
/// Directory trailer signature.
pub const DIR_TRAILER_SIGNATURE: &str = "DIRTRL1";
/// Directory index root signature.
pub const DX_ROOT_SIGNATURE: &str = "DXDIR01";
/// Directory index leaf signature.
pub const DX_LEAF_SIGNATURE: &str = "DXLEAF1";

/// Signature of the legacy OCFS (version 1) volume header at block 0.
pub const OCFS1_VOLUME_SIGNATURE: &str = "OracleCFS";
/// Major version number of the legacy format.
pub const OCFS1_MAJOR_VERSION: u32 = 2;

bitflags! {
    /// Compatible feature bits.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct FeatureCompat: u32 {
        /// Backup superblocks are kept at the fixed offsets.
        const BACKUP_SB = 0x0001;
        /// The journal superblock uses the JBD2 layout.
        const JBD2_SB = 0x0002;
    }

    /// Incompatible feature bits.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct FeatureIncompat: u32 {
        /// The device is used as a raw heartbeat area.
        const HEARTBEAT_DEV = 0x0002;
        /// A resize was interrupted.
        const RESIZE_INPROG = 0x0004;
        /// The volume is mounted without cluster awareness.
        const LOCAL_MOUNT = 0x0008;
        /// Files may have holes.
        const SPARSE_ALLOC = 0x0010;
        /// A tunefs operation was interrupted.
        const TUNEFS_INPROG = 0x0020;
        /// Small files keep their data inside the inode.
        const INLINE_DATA = 0x0040;
        /// Cluster stack is managed from userspace.
        const USERSPACE_STACK = 0x0080;
        /// Extended attributes.
        const XATTR = 0x0100;
        /// Directories carry a hash index.
        const INDEXED_DIRS = 0x0200;
        /// Metadata blocks carry CRC32/ECC check data.
        const META_ECC = 0x0800;
        /// Reference-counted (shared) clusters.
        const REFCOUNT_TREE = 0x1000;
    }

    /// Read-only compatible feature bits.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct FeatureRoCompat: u32 {
        /// Extents may be allocated but not yet written.
        const UNWRITTEN = 0x0001;
        /// User quotas are tracked.
        const USRQUOTA = 0x0002;
        /// Group quotas are tracked.
        const GRPQUOTA = 0x0004;
    }

    /// Inode flags (`i_flags`).
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct InodeFlags: u32 {
        /// The inode is in use.
        const VALID = 0x00000001;
        /// The inode is orphaned.
        const ORPHANED = 0x00000004;
        /// The inode is a system file.
        const SYSTEM = 0x00000010;
        /// The inode body holds the superblock.
        const SUPER_BLOCK = 0x00000020;
        /// The inode body holds a local allocator bitmap.
        const LOCAL_ALLOC = 0x00000040;
        /// The inode is an allocation bitmap.
        const BITMAP = 0x00000080;
        /// The inode is a journal file.
        const JOURNAL = 0x00000100;
        /// The inode is the heartbeat area.
        const HEARTBEAT = 0x00000200;
        /// The inode body holds a chain list.
        const CHAIN = 0x00000400;
        /// The inode body holds a truncate log.
        const DEALLOC = 0x00000800;
        /// The inode is a quota file.
        const QUOTA = 0x00001000;
    }

    /// Dynamic inode features (`i_dyn_features`).
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct DynFeatures: u16 {
        /// File data lives inside the inode body.
        const INLINE_DATA = 0x0001;
        /// The inode has extended attributes.
        const HAS_XATTR = 0x0002;
        /// Extended attributes live inside the inode block.
        const INLINE_XATTR = 0x0004;
        /// The directory carries a hash index.
        const INDEXED_DIR = 0x0008;
        /// The inode shares clusters through a refcount tree.
        const HAS_REFCOUNT = 0x0010;
    }
}

impl FeatureCompat {
    /// Bits this library understands.
    pub const SUPP: Self = Self::all();
}

impl FeatureIncompat {
    /// Bits this library understands.
    pub const SUPP: Self = Self::all();
}

impl FeatureRoCompat {
    /// Bits this library understands.
    pub const SUPP: Self = Self::all();
}

/// Extent record flag: the extent is allocated but unwritten.
pub const EXT_UNWRITTEN: u8 = 0x01;
/// Extent record flag: the extent is shared through a refcount tree.
pub const EXT_REFCOUNTED: u8 = 0x02;

/// Refcount block flag: the block is an extent-tree root.
pub const REFCOUNT_TREE_FL: u32 = 0x00000001;
/// Refcount block flag: the block is a record leaf.
pub const REFCOUNT_LEAF_FL: u32 = 0x00000002;

/// Directory index root flag: the entry list is kept inline.
pub const DX_FLAG_INLINE: u8 = 0x01;

/// Xattr block flag: the block roots a bucket tree.
pub const XATTR_INDEXED: u16 = 0x0001;
/// Size of one xattr bucket.
pub const XATTR_BUCKET_SIZE: u32 = 4096;

/// Check information stamped into every checked metadata block.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BlockCheck {
    /// CRC32 (802.3 little-endian) over the block with this field zeroed.
    pub bc_crc32e: u32,
    /// Hamming parity over the block with this field zeroed.
    pub bc_ecc: u16,
    /// Padding.
    pub bc_reserved1: u16,
}

/// An extent record.
///
/// At tree depth 0 the record maps `e_leaf_clusters` clusters starting at
/// logical cluster `e_cpos` to the blocks starting at `e_blkno`. At depth
/// above 0 it points at a child extent block and the pair
/// (`e_leaf_clusters`, `e_reserved1`, `e_flags`) is read as one 32-bit
/// cluster count (see [`ExtentRec::int_clusters`]).
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct ExtentRec {
    /// Logical position, in clusters (hash values for directory indexes).
    pub e_cpos: u32,
    /// Cluster count of a leaf record.
    pub e_leaf_clusters: u16,
    /// Padding of the leaf form.
    pub e_reserved1: u8,
    /// Leaf record flags (`EXT_*`).
    pub e_flags: u8,
    /// First physical block of the range, or the child extent block.
    pub e_blkno: u64,
}

impl ExtentRec {
    /// Cluster count of an interior (depth > 0) record.
    pub fn int_clusters(&self) -> u32 {
        unsafe { (std::ptr::addr_of!(self.e_leaf_clusters) as *const u32).read_unaligned() }
    }

    /// Sets the cluster count of an interior record.
    pub fn set_int_clusters(&mut self, clusters: u32) {
        unsafe {
            (std::ptr::addr_of_mut!(self.e_leaf_clusters) as *mut u32).write_unaligned(clusters);
        }
    }
}

/// Header of an extent list. Records follow the header in the same block.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct ExtentList {
    /// Depth of the subtree below this list. 0 means records are data
    /// extents.
    pub l_tree_depth: u16,
    /// Number of record slots in the containing block.
    pub l_count: u16,
    /// Number of slots in use.
    pub l_next_free_rec: u16,
    /// Padding.
    pub l_reserved1: u16,
    /// Padding.
    pub l_reserved2: u64,
    /// Marker for the records following the header.
    pub l_recs: [ExtentRec; 0],
}

impl ExtentList {
    /// Returns the used records.
    pub fn recs(&self) -> &[ExtentRec] {
        unsafe { slice::from_raw_parts(self.l_recs.as_ptr(), self.l_next_free_rec as usize) }
    }

    /// Returns the used records, mutable.
    pub fn recs_mut(&mut self) -> &mut [ExtentRec] {
        unsafe {
            slice::from_raw_parts_mut(self.l_recs.as_mut_ptr(), self.l_next_free_rec as usize)
        }
    }

    /// Returns record slot `i`, which may be past `l_next_free_rec` but must
    /// be within `l_count`.
    pub fn rec(&self, i: usize) -> &ExtentRec {
        assert!(i < self.l_count as usize);
        unsafe { &*self.l_recs.as_ptr().add(i) }
    }

    /// Like [`ExtentList::rec`], but mutable.
    pub fn rec_mut(&mut self, i: usize) -> &mut ExtentRec {
        assert!(i < self.l_count as usize);
        unsafe { &mut *self.l_recs.as_mut_ptr().add(i) }
    }
}

/// An extent block: one interior or leaf node of an extent tree.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct ExtentBlock {
    /// Signature (`EXBLK01`).
    pub h_signature: [u8; 8],
    /// Block check information.
    pub h_check: BlockCheck,
    /// Slot of the allocator this block came from.
    pub h_suballoc_slot: u16,
    /// Bit index inside the allocator group.
    pub h_suballoc_bit: u16,
    /// Filesystem generation the block belongs to.
    pub h_fs_generation: u32,
    /// The number of the block itself.
    pub h_blkno: u64,
    /// Block holding the parent extent list, verified during descent.
    pub h_up_hdr_node_ptr: u64,
    /// Next leaf in the chain of depth-0 siblings.
    pub h_next_leaf_blk: u64,
    /// The embedded extent list.
    pub h_list: ExtentList,
}

/// Offset of the embedded extent list inside an extent block.
pub const EXTENT_BLOCK_LIST_OFF: usize = 48;
const _: () = assert!(size_of::<ExtentBlock>() == 64);

/// A chain record: one chain of group descriptors inside an allocator inode.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct ChainRec {
    /// Free bits in the whole chain.
    pub c_free: u32,
    /// Total bits in the whole chain.
    pub c_total: u32,
    /// First group descriptor of the chain.
    pub c_blkno: u64,
}

/// Header of the chain list inside an allocator inode.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct ChainList {
    /// Clusters per group.
    pub cl_cpg: u16,
    /// Bits per cluster.
    pub cl_bpc: u16,
    /// Number of chain record slots.
    pub cl_count: u16,
    /// Number of slots in use.
    pub cl_next_free_rec: u16,
    /// Padding.
    pub cl_reserved1: u64,
    /// Marker for the records following the header.
    pub cl_recs: [ChainRec; 0],
}

impl ChainList {
    /// Returns the used chain records.
    pub fn recs(&self) -> &[ChainRec] {
        unsafe { slice::from_raw_parts(self.cl_recs.as_ptr(), self.cl_next_free_rec as usize) }
    }

    /// Returns the used chain records, mutable.
    pub fn recs_mut(&mut self) -> &mut [ChainRec] {
        unsafe {
            slice::from_raw_parts_mut(self.cl_recs.as_mut_ptr(), self.cl_next_free_rec as usize)
        }
    }
}

/// A group descriptor: one run of allocatable bits linked into a chain.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct GroupDesc {
    /// Signature (`GROUP01`).
    pub bg_signature: [u8; 8],
    /// Size of the descriptor header plus bitmap, in bytes.
    pub bg_size: u16,
    /// Total bits described by this group.
    pub bg_bits: u16,
    /// Free bits in this group.
    pub bg_free_bits_count: u16,
    /// Index of the chain this group belongs to.
    pub bg_chain: u16,
    /// Generation matching the superblock.
    pub bg_generation: u32,
    /// Padding.
    pub bg_reserved1: u32,
    /// Next group descriptor in the chain.
    pub bg_next_group: u64,
    /// The allocator inode owning this group.
    pub bg_parent_dinode: u64,
    /// The number of the block itself.
    pub bg_blkno: u64,
    /// Block check information.
    pub bg_check: BlockCheck,
    /// Padding.
    pub bg_reserved2: u64,
    /// Marker for the bitmap following the header.
    pub bg_bitmap: [u8; 0],
}

/// Offset of the allocation bitmap inside a group descriptor block.
pub const GROUP_BITMAP_OFF: usize = size_of::<GroupDesc>();
const _: () = assert!(GROUP_BITMAP_OFF == 64);

impl GroupDesc {
    /// Returns the group bitmap.
    pub fn bitmap(&self) -> &[u8] {
        let bytes = self.bg_size as usize - GROUP_BITMAP_OFF;
        unsafe { slice::from_raw_parts(self.bg_bitmap.as_ptr(), bytes) }
    }

    /// Returns the group bitmap, mutable.
    pub fn bitmap_mut(&mut self) -> &mut [u8] {
        let bytes = self.bg_size as usize - GROUP_BITMAP_OFF;
        unsafe { slice::from_raw_parts_mut(self.bg_bitmap.as_mut_ptr(), bytes) }
    }
}

/// A truncate log record.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct TruncateRec {
    /// First cluster of the freed range.
    pub t_start: u32,
    /// Length of the freed range, in clusters.
    pub t_clusters: u32,
}

/// Header of the truncate log inside a dealloc inode.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct TruncateLog {
    /// Number of record slots.
    pub tl_count: u16,
    /// Number of slots in use.
    pub tl_used: u16,
    /// Padding.
    pub tl_reserved1: u32,
    /// Marker for the records following the header.
    pub tl_recs: [TruncateRec; 0],
}

impl TruncateLog {
    /// Returns the used records.
    pub fn recs(&self) -> &[TruncateRec] {
        unsafe { slice::from_raw_parts(self.tl_recs.as_ptr(), self.tl_used as usize) }
    }
}

/// Local allocator window inside a local-alloc inode.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalAlloc {
    /// First bit of the window inside the global bitmap.
    pub la_bm_off: u32,
    /// Size of the window bitmap, in bits.
    pub la_size: u16,
    /// Padding.
    pub la_reserved1: u16,
    /// Padding.
    pub la_reserved2: u64,
    /// Marker for the bitmap following the header.
    pub la_bitmap: [u8; 0],
}

/// Inline file data inside an inode body.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineData {
    /// Number of data bytes the body can hold.
    pub id_count: u16,
    /// Padding.
    pub id_reserved0: u16,
    /// Padding.
    pub id_reserved1: u32,
    /// Marker for the data following the header.
    pub id_data: [u8; 0],
}

/// Cluster stack identity stored in the superblock.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct ClusterInfo {
    /// Short name of the cluster stack.
    pub ci_stack: [u8; 4],
    /// Padding.
    pub ci_reserved: u32,
    /// Name of the cluster this volume belongs to.
    pub ci_cluster: [u8; 16],
}

/// The superblock, stored in the body of the inode at block 2.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct SuperBlock {
    /// Major revision.
    pub s_major_rev_level: u16,
    /// Minor revision.
    pub s_minor_rev_level: u16,
    /// Mounts since the last check.
    pub s_mnt_count: u16,
    /// Mounts allowed between checks.
    pub s_max_mnt_count: u16,
    /// Filesystem state flags.
    pub s_state: u16,
    /// Behavior on error.
    pub s_errors: u16,
    /// Seconds allowed between checks.
    pub s_checkinterval: u32,
    /// Timestamp of the last check.
    pub s_lastcheck: u64,
    /// Creating operating system.
    pub s_creator_os: u32,
    /// Compatible feature set.
    pub s_feature_compat: u32,
    /// Incompatible feature set.
    pub s_feature_incompat: u32,
    /// Read-only compatible feature set.
    pub s_feature_ro_compat: u32,
    /// Block of the root directory inode.
    pub s_root_blkno: u64,
    /// Block of the system directory inode.
    pub s_system_dir_blkno: u64,
    /// log2 of the block size.
    pub s_blocksize_bits: u32,
    /// log2 of the cluster size.
    pub s_clustersize_bits: u32,
    /// Number of node slots.
    pub s_max_slots: u16,
    /// Interrupted-tunefs flags.
    pub s_tunefs_flag: u16,
    /// Hash of the UUID, used by some lock domains.
    pub s_uuid_hash: u32,
    /// Block of the first cluster group.
    pub s_first_cluster_group: u64,
    /// Volume label.
    pub s_label: [u8; MAX_VOL_LABEL_LEN],
    /// Volume UUID.
    pub s_uuid: [u8; VOL_UUID_LEN],
    /// Cluster stack identity.
    pub s_cluster_info: ClusterInfo,
    /// Bytes reserved inside each inode for inline xattrs.
    pub s_xattr_inline_size: u16,
    /// Padding.
    pub s_reserved0: u16,
    /// Seed of the directory-index hash.
    pub s_dx_seed: [u32; 3],
    /// Padding.
    pub s_reserved2: [u64; 15],
}

const _: () = assert!(size_of::<SuperBlock>() == 320);

/// Device number stored in the first inode union for device nodes.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct InodeDev1 {
    /// The device number.
    pub i_rdev: u64,
}

/// Bitmap counters stored in the first inode union for bitmap inodes.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct InodeBitmap1 {
    /// Bits in use.
    pub i_used: u32,
    /// Total bits.
    pub i_total: u32,
}

/// Journal state stored in the first inode union for journal inodes.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct InodeJournal1 {
    /// Journal flags.
    pub ij_flags: u32,
    /// Generation of the last recovery.
    pub ij_recovery_generation: u32,
}

/// First inode union, selected by `i_flags` and the file mode.
#[repr(C)]
#[derive(Clone, Copy)]
pub union InodeId1 {
    /// Device nodes.
    pub dev1: InodeDev1,
    /// Bitmap inodes.
    pub bitmap1: InodeBitmap1,
    /// Journal inodes.
    pub journal1: InodeJournal1,
    /// Raw bytes.
    pub reserved: [u8; 8],
}

impl Default for InodeId1 {
    fn default() -> Self {
        Self { reserved: [0; 8] }
    }
}

/// An inode. One per metadata block; the body union (`id2`) follows the
/// fixed fields at [`INODE_BODY_OFF`].
#[repr(C, packed)]
#[derive(Clone, Copy, Default)]
pub struct Dinode {
    /// Signature (`INODE01`).
    pub i_signature: [u8; 8],
    /// Generation, compared against lock levels.
    pub i_generation: u32,
    /// Slot of the allocator this inode came from.
    pub i_suballoc_slot: u16,
    /// Bit index inside the allocator group.
    pub i_suballoc_bit: u16,
    /// High 16 bits of the link count.
    pub i_links_count_hi: u16,
    /// Bytes reserved at the end of the block for inline xattrs.
    pub i_xattr_inline_size: u16,
    /// Total clusters mapped by the inode.
    pub i_clusters: u32,
    /// Owning user.
    pub i_uid: u32,
    /// Owning group.
    pub i_gid: u32,
    /// Size in bytes.
    pub i_size: u64,
    /// File mode.
    pub i_mode: u16,
    /// Low 16 bits of the link count.
    pub i_links_count: u16,
    /// Inode flags (`InodeFlags`).
    pub i_flags: u32,
    /// Access time, seconds.
    pub i_atime: u64,
    /// Change time, seconds.
    pub i_ctime: u64,
    /// Modification time, seconds.
    pub i_mtime: u64,
    /// Deletion time, seconds.
    pub i_dtime: u64,
    /// The number of the block holding this inode.
    pub i_blkno: u64,
    /// Rightmost leaf of the inode's extent tree.
    pub i_last_eb_blk: u64,
    /// Filesystem generation.
    pub i_fs_generation: u32,
    /// Access time, nanoseconds.
    pub i_atime_nsec: u32,
    /// Change time, nanoseconds.
    pub i_ctime_nsec: u32,
    /// Modification time, nanoseconds.
    pub i_mtime_nsec: u32,
    /// Attribute flags.
    pub i_attr: u32,
    /// Slot the inode was orphaned from.
    pub i_orphaned_slot: u16,
    /// Dynamic features (`DynFeatures`).
    pub i_dyn_features: u16,
    /// Block of the external xattr block.
    pub i_xattr_loc: u64,
    /// Block check information.
    pub i_check: BlockCheck,
    /// Block of the directory index root.
    pub i_dx_root: u64,
    /// Block of the refcount tree root.
    pub i_refcount_loc: u64,
    /// Suballocator group the inode was cut from.
    pub i_suballoc_loc: u64,
    /// Padding.
    pub i_reserved2: [u64; 3],
    /// First body union.
    pub id1: InodeId1,
}

/// Offset of the inode body union (`id2`) inside the inode block.
pub const INODE_BODY_OFF: usize = size_of::<Dinode>();
const _: () = assert!(INODE_BODY_OFF == 192);

/// Offset of inline file data inside the inode block.
pub const INLINE_DATA_OFF: usize = INODE_BODY_OFF + size_of::<InlineData>();

/// Returns the extent list rooted in an inode block.
pub fn inode_extent_list(buf: &[u8]) -> &ExtentList {
    cast_at(buf, INODE_BODY_OFF)
}

/// Returns the extent list rooted in an inode block, mutable.
pub fn inode_extent_list_mut(buf: &mut [u8]) -> &mut ExtentList {
    cast_at_mut(buf, INODE_BODY_OFF)
}

/// Returns the chain list of an allocator inode block.
pub fn inode_chain_list(buf: &[u8]) -> &ChainList {
    cast_at(buf, INODE_BODY_OFF)
}

/// Returns the chain list of an allocator inode block, mutable.
pub fn inode_chain_list_mut(buf: &mut [u8]) -> &mut ChainList {
    cast_at_mut(buf, INODE_BODY_OFF)
}

/// Returns the superblock stored in the block at [`SUPER_BLOCK_BLKNO`].
pub fn inode_super_block(buf: &[u8]) -> &SuperBlock {
    cast_at(buf, INODE_BODY_OFF)
}

/// Returns the superblock, mutable.
pub fn inode_super_block_mut(buf: &mut [u8]) -> &mut SuperBlock {
    cast_at_mut(buf, INODE_BODY_OFF)
}

/// Returns the local allocator window of a local-alloc inode block.
pub fn inode_local_alloc(buf: &[u8]) -> &LocalAlloc {
    cast_at(buf, INODE_BODY_OFF)
}

/// Returns the truncate log of a dealloc inode block.
pub fn inode_truncate_log(buf: &[u8]) -> &TruncateLog {
    cast_at(buf, INODE_BODY_OFF)
}

/// Returns the truncate log, mutable.
pub fn inode_truncate_log_mut(buf: &mut [u8]) -> &mut TruncateLog {
    cast_at_mut(buf, INODE_BODY_OFF)
}

/// Returns the inline data header of an inline-data inode block.
pub fn inode_inline_data(buf: &[u8]) -> &InlineData {
    cast_at(buf, INODE_BODY_OFF)
}

/// Returns the inline data header, mutable.
pub fn inode_inline_data_mut(buf: &mut [u8]) -> &mut InlineData {
    cast_at_mut(buf, INODE_BODY_OFF)
}

impl Dinode {
    /// Tells whether the body union holds an extent list.
    ///
    /// Mirrors the union selection precedence: explicit body flags win, then
    /// fast symlinks, then inline data.
    pub fn has_extents(&self) -> bool {
        let flags = InodeFlags::from_bits_truncate(self.i_flags);
        if flags.intersects(
            InodeFlags::SUPER_BLOCK
                | InodeFlags::LOCAL_ALLOC
                | InodeFlags::CHAIN
                | InodeFlags::DEALLOC,
        ) {
            return false;
        }
        // a fast symlink keeps its target in the body
        if self.i_mode & 0o170000 == 0o120000 && self.i_size != 0 && self.i_clusters == 0 {
            return false;
        }
        let dyn_features = DynFeatures::from_bits_truncate(self.i_dyn_features);
        !dyn_features.contains(DynFeatures::INLINE_DATA)
    }

    /// Tells whether the inode is a directory.
    pub fn is_dir(&self) -> bool {
        self.i_mode & 0o170000 == 0o040000
    }

    /// Tells whether the inode is a regular file.
    pub fn is_file(&self) -> bool {
        self.i_mode & 0o170000 == 0o100000
    }

    /// Tells whether the inode is a character or block device.
    pub fn is_dev(&self) -> bool {
        matches!(self.i_mode & 0o170000, 0o020000 | 0o060000)
    }
}

/// A refcount record, mapping a cluster range to its use count.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct RefcountRec {
    /// First physical cluster of the range.
    pub r_cpos: u64,
    /// Length of the range, in clusters.
    pub r_clusters: u32,
    /// Reference count of every cluster in the range.
    pub r_refcount: u32,
}

impl RefcountRec {
    /// Low 32 bits of the position, the key used inside the extent tree.
    pub fn low_cpos(&self) -> u32 {
        (self.r_cpos & POS_32BIT_MASK) as u32
    }
}

/// Header of the record list inside a refcount block.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct RefcountList {
    /// Number of record slots.
    pub rl_count: u16,
    /// Number of slots in use.
    pub rl_used: u16,
    /// Padding.
    pub rl_reserved2: u32,
    /// Padding.
    pub rl_reserved1: u64,
    /// Marker for the records following the header.
    pub rl_recs: [RefcountRec; 0],
}

impl RefcountList {
    /// Returns the used records.
    pub fn recs(&self) -> &[RefcountRec] {
        unsafe { slice::from_raw_parts(self.rl_recs.as_ptr(), self.rl_used as usize) }
    }

    /// Returns the used records, mutable.
    pub fn recs_mut(&mut self) -> &mut [RefcountRec] {
        unsafe { slice::from_raw_parts_mut(self.rl_recs.as_mut_ptr(), self.rl_used as usize) }
    }

    /// Returns all record slots up to `rl_count`.
    pub fn all_recs_mut(&mut self) -> &mut [RefcountRec] {
        unsafe { slice::from_raw_parts_mut(self.rl_recs.as_mut_ptr(), self.rl_count as usize) }
    }
}

/// A refcount block: the tree root (inline records or extent list) or a
/// record leaf.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct RefcountBlock {
    /// Signature (`REFCNT1`).
    pub rf_signature: [u8; 8],
    /// Slot of the allocator this block came from.
    pub rf_suballoc_slot: u16,
    /// Bit index inside the allocator group.
    pub rf_suballoc_bit: u16,
    /// Filesystem generation.
    pub rf_fs_generation: u32,
    /// The number of the block itself.
    pub rf_blkno: u64,
    /// Root block of the tree this leaf belongs to.
    pub rf_parent: u64,
    /// Rightmost leaf of the root's extent tree.
    pub rf_last_eb_blk: u64,
    /// Inodes sharing this tree.
    pub rf_count: u32,
    /// Block role (`REFCOUNT_TREE_FL` / `REFCOUNT_LEAF_FL`).
    pub rf_flags: u32,
    /// Clusters mapped below the root's extent tree.
    pub rf_clusters: u32,
    /// Low 32 bits of the first position covered by a leaf.
    pub rf_cpos: u32,
    /// Generation of the tree, bumped on re-rooting.
    pub rf_generation: u32,
    /// Padding.
    pub rf_reserved0: u32,
    /// Block check information.
    pub rf_check: BlockCheck,
    /// Suballocator group the block was cut from.
    pub rf_suballoc_loc: u64,
    /// Padding.
    pub rf_reserved1: [u64; 6],
}

/// Offset of the root union (record list or extent list) inside a refcount
/// block.
pub const REFCOUNT_BODY_OFF: usize = size_of::<RefcountBlock>();
const _: () = assert!(REFCOUNT_BODY_OFF == 128);

/// Returns the record list of an inline root or a leaf.
pub fn refcount_list(buf: &[u8]) -> &RefcountList {
    cast_at(buf, REFCOUNT_BODY_OFF)
}

/// Returns the record list, mutable.
pub fn refcount_list_mut(buf: &mut [u8]) -> &mut RefcountList {
    cast_at_mut(buf, REFCOUNT_BODY_OFF)
}

/// Returns the extent list of a promoted refcount root.
pub fn refcount_extent_list(buf: &[u8]) -> &ExtentList {
    cast_at(buf, REFCOUNT_BODY_OFF)
}

/// Returns the extent list of a promoted refcount root, mutable.
pub fn refcount_extent_list_mut(buf: &mut [u8]) -> &mut ExtentList {
    cast_at_mut(buf, REFCOUNT_BODY_OFF)
}

/// One directory index entry, mapping a name hash to the directory block
/// holding the name.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DxEntry {
    /// Major hash, the extent-tree key.
    pub dx_major_hash: u32,
    /// Minor hash, discriminating within a cluster.
    pub dx_minor_hash: u32,
    /// Directory block holding the entry.
    pub dx_dirent_blk: u64,
}

/// Header of a directory index entry list.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DxEntryList {
    /// Number of entry slots.
    pub de_count: u32,
    /// Number of slots in use.
    pub de_num_used: u32,
    /// Marker for the entries following the header.
    pub de_entries: [DxEntry; 0],
}

impl DxEntryList {
    /// Returns the used entries.
    pub fn entries(&self) -> &[DxEntry] {
        unsafe { slice::from_raw_parts(self.de_entries.as_ptr(), self.de_num_used as usize) }
    }

    /// Returns the used entries, mutable.
    pub fn entries_mut(&mut self) -> &mut [DxEntry] {
        unsafe { slice::from_raw_parts_mut(self.de_entries.as_mut_ptr(), self.de_num_used as usize) }
    }

    /// Returns entry slot `i`, which must be within `de_count`.
    pub fn entry_mut(&mut self, i: usize) -> &mut DxEntry {
        assert!(i < self.de_count as usize);
        unsafe { &mut *self.de_entries.as_mut_ptr().add(i) }
    }
}

/// The root block of a directory index.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DxRootBlock {
    /// Signature (`DXDIR01`).
    pub dr_signature: [u8; 8],
    /// Block check information.
    pub dr_check: BlockCheck,
    /// Slot of the allocator this block came from.
    pub dr_suballoc_slot: u16,
    /// Bit index inside the allocator group.
    pub dr_suballoc_bit: u16,
    /// Filesystem generation.
    pub dr_fs_generation: u32,
    /// The number of the block itself.
    pub dr_blkno: u64,
    /// Rightmost leaf of the index's extent tree.
    pub dr_last_eb_blk: u64,
    /// Clusters allocated to index leaves.
    pub dr_clusters: u32,
    /// Root flags (`DX_FLAG_INLINE`).
    pub dr_flags: u8,
    /// Padding.
    pub dr_reserved0: u8,
    /// Padding.
    pub dr_reserved1: u16,
    /// The directory inode this index belongs to.
    pub dr_dir_blkno: u64,
    /// Live entries in the whole index.
    pub dr_num_entries: u32,
    /// Padding.
    pub dr_reserved2: u32,
    /// Head of the list of directory blocks with free space.
    pub dr_free_blk: u64,
    /// Suballocator group the block was cut from.
    pub dr_suballoc_loc: u64,
    /// Padding.
    pub dr_reserved3: [u64; 14],
}

/// Offset of the root union (entry list or extent list) inside a directory
/// index root block.
pub const DX_ROOT_BODY_OFF: usize = size_of::<DxRootBlock>();
const _: () = assert!(DX_ROOT_BODY_OFF == 192);

/// Returns the inline entry list of a directory index root.
pub fn dx_root_entry_list(buf: &[u8]) -> &DxEntryList {
    cast_at(buf, DX_ROOT_BODY_OFF)
}

/// Returns the inline entry list, mutable.
pub fn dx_root_entry_list_mut(buf: &mut [u8]) -> &mut DxEntryList {
    cast_at_mut(buf, DX_ROOT_BODY_OFF)
}

/// Returns the extent list of an extent-backed directory index root.
pub fn dx_root_extent_list(buf: &[u8]) -> &ExtentList {
    cast_at(buf, DX_ROOT_BODY_OFF)
}

/// Returns the extent list, mutable.
pub fn dx_root_extent_list_mut(buf: &mut [u8]) -> &mut ExtentList {
    cast_at_mut(buf, DX_ROOT_BODY_OFF)
}

/// A directory index leaf block.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DxLeaf {
    /// Signature (`DXLEAF1`).
    pub dl_signature: [u8; 8],
    /// Block check information.
    pub dl_check: BlockCheck,
    /// The number of the block itself.
    pub dl_blkno: u64,
    /// Filesystem generation.
    pub dl_fs_generation: u32,
    /// Padding.
    pub dl_reserved0: u32,
    /// Padding.
    pub dl_reserved1: u64,
    /// The entry list.
    pub dl_list: DxEntryList,
}

const _: () = assert!(size_of::<DxLeaf>() == 48);

/// A directory entry. The name follows the fixed fields; `rec_len` covers
/// the entry plus any free space behind it.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DirEntry {
    /// Referenced inode block, 0 for an unused entry.
    pub inode: u64,
    /// Length of the record, name and free space included.
    pub rec_len: u16,
    /// Length of the name.
    pub name_len: u8,
    /// File type hint.
    pub file_type: u8,
    /// Marker for the name following the header.
    pub name: [u8; 0],
}

/// Size of the fixed part of a directory entry.
pub const DIR_ENTRY_HEADER_LEN: usize = size_of::<DirEntry>();
const _: () = assert!(DIR_ENTRY_HEADER_LEN == 12);
/// The smallest valid directory record length.
pub const DIR_MIN_REC_LEN: usize = dir_rec_len(1);

/// Returns the record length needed for a name of `name_len` bytes.
pub const fn dir_rec_len(name_len: usize) -> usize {
    (DIR_ENTRY_HEADER_LEN + name_len + 3) & !3
}

impl DirEntry {
    /// Returns the entry name.
    pub fn name(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.name.as_ptr(), self.name_len as usize) }
    }

    /// Sets the entry name.
    pub fn set_name(&mut self, name: &[u8]) {
        self.name_len = name.len() as u8;
        unsafe {
            slice::from_raw_parts_mut(self.name.as_mut_ptr(), name.len()).copy_from_slice(name);
        }
    }
}

/// Trailer stamped at the end of a directory block when the feature is on.
///
/// The leading fields mimic an unused directory entry spanning the trailer
/// so readers unaware of it skip over cleanly.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DirBlockTrailer {
    /// Always 0, as an unused entry.
    pub db_compat_inode: u64,
    /// Record length covering the trailer.
    pub db_compat_rec_len: u16,
    /// Always 0.
    pub db_compat_name_len: u8,
    /// Padding.
    pub db_reserved0: u8,
    /// Padding.
    pub db_reserved1: u16,
    /// Largest free record length in the block.
    pub db_free_rec_len: u16,
    /// Signature (`DIRTRL1`).
    pub db_signature: [u8; 8],
    /// Padding.
    pub db_reserved2: u64,
    /// Next directory block with free space.
    pub db_free_next: u64,
    /// The number of the block itself.
    pub db_blkno: u64,
    /// The directory inode this block belongs to.
    pub db_parent_dinode: u64,
    /// Block check information.
    pub db_check: BlockCheck,
}

/// Size of the directory block trailer.
pub const DIR_TRAILER_LEN: usize = size_of::<DirBlockTrailer>();
const _: () = assert!(DIR_TRAILER_LEN == 64);

/// An extended attribute entry.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct XattrEntry {
    /// Hash of the attribute name.
    pub xe_name_hash: u32,
    /// Offset of the name inside the container.
    pub xe_name_offset: u16,
    /// Length of the name.
    pub xe_name_len: u8,
    /// Name index and value-location flags.
    pub xe_type: u8,
    /// Size of the value, in bytes.
    pub xe_value_size: u64,
}

/// Header of a run of xattr entries (inline area, block, or bucket).
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct XattrHeader {
    /// Number of entries.
    pub xh_count: u16,
    /// First free byte of the name/value area.
    pub xh_free_start: u16,
    /// Bytes used by names and values.
    pub xh_name_value_len: u16,
    /// Buckets in the container (first bucket of a cluster only).
    pub xh_num_buckets: u16,
    /// Block check information.
    pub xh_check: BlockCheck,
    /// Marker for the entries following the header.
    pub xh_entries: [XattrEntry; 0],
}

impl XattrHeader {
    /// Returns the entries.
    pub fn entries(&self) -> &[XattrEntry] {
        unsafe { slice::from_raw_parts(self.xh_entries.as_ptr(), self.xh_count as usize) }
    }

    /// Returns the entries, mutable.
    pub fn entries_mut(&mut self) -> &mut [XattrEntry] {
        unsafe { slice::from_raw_parts_mut(self.xh_entries.as_mut_ptr(), self.xh_count as usize) }
    }
}

/// Root of the extent tree mapping the clusters of a large xattr value.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct XattrValueRoot {
    /// Clusters held by the value.
    pub xr_clusters: u32,
    /// Padding.
    pub xr_reserved0: u32,
    /// Rightmost leaf of the value's extent tree.
    pub xr_last_eb_blk: u64,
    /// The embedded extent list.
    pub xr_list: ExtentList,
}

/// Root of the extent tree mapping xattr buckets.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct XattrTreeRoot {
    /// Clusters held by the bucket tree.
    pub xt_clusters: u32,
    /// Padding.
    pub xt_reserved0: u32,
    /// Rightmost leaf of the bucket tree.
    pub xt_last_eb_blk: u64,
    /// The embedded extent list.
    pub xt_list: ExtentList,
}

/// An extended attribute block.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct XattrBlock {
    /// Signature (`XATTR01`).
    pub xb_signature: [u8; 8],
    /// Slot of the allocator this block came from.
    pub xb_suballoc_slot: u16,
    /// Bit index inside the allocator group.
    pub xb_suballoc_bit: u16,
    /// Filesystem generation.
    pub xb_fs_generation: u32,
    /// The number of the block itself.
    pub xb_blkno: u64,
    /// Block check information.
    pub xb_check: BlockCheck,
    /// Block flags (`XATTR_INDEXED`).
    pub xb_flags: u16,
    /// Padding.
    pub xb_reserved0: u16,
    /// Padding.
    pub xb_reserved1: u32,
    /// Suballocator group the block was cut from.
    pub xb_suballoc_loc: u64,
}

/// Offset of the block body (entry header or bucket tree root).
pub const XATTR_BODY_OFF: usize = size_of::<XattrBlock>();
const _: () = assert!(XATTR_BODY_OFF == 48);

/// Returns the entry header of a non-indexed xattr block.
pub fn xattr_block_header(buf: &[u8]) -> &XattrHeader {
    cast_at(buf, XATTR_BODY_OFF)
}

/// Returns the entry header, mutable.
pub fn xattr_block_header_mut(buf: &mut [u8]) -> &mut XattrHeader {
    cast_at_mut(buf, XATTR_BODY_OFF)
}

/// Returns the bucket tree root of an indexed xattr block.
pub fn xattr_block_root(buf: &[u8]) -> &XattrTreeRoot {
    cast_at(buf, XATTR_BODY_OFF)
}

/// Returns the bucket tree root, mutable.
pub fn xattr_block_root_mut(buf: &mut [u8]) -> &mut XattrTreeRoot {
    cast_at_mut(buf, XATTR_BODY_OFF)
}

/// Types of system files.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SystemFileType {
    /// Bad block inode.
    BadBlock,
    /// Global inode allocator.
    GlobalInodeAlloc,
    /// Slot map.
    SlotMap,
    /// Heartbeat area.
    Heartbeat,
    /// Global cluster bitmap.
    GlobalBitmap,
    /// Global user quota file.
    UserQuota,
    /// Global group quota file.
    GroupQuota,
    /// Per-slot orphan directory.
    OrphanDir,
    /// Per-slot extent block allocator.
    ExtentAlloc,
    /// Per-slot inode allocator.
    InodeAlloc,
    /// Per-slot journal.
    Journal,
    /// Per-slot local allocator.
    LocalAlloc,
    /// Per-slot truncate log.
    TruncateLog,
    /// Per-slot local user quota file.
    LocalUserQuota,
    /// Per-slot local group quota file.
    LocalGroupQuota,
}

impl SystemFileType {
    /// Tells whether files of this type exist once per slot.
    pub fn is_per_slot(self) -> bool {
        matches!(
            self,
            Self::OrphanDir
                | Self::ExtentAlloc
                | Self::InodeAlloc
                | Self::Journal
                | Self::LocalAlloc
                | Self::TruncateLog
                | Self::LocalUserQuota
                | Self::LocalGroupQuota
        )
    }

    /// Returns the name of the system file for the given slot.
    pub fn file_name(self, slot: u16) -> String {
        let base = match self {
            Self::BadBlock => "bad_blocks",
            Self::GlobalInodeAlloc => "global_inode_alloc",
            Self::SlotMap => "slot_map",
            Self::Heartbeat => "heartbeat",
            Self::GlobalBitmap => "global_bitmap",
            Self::UserQuota => "aquota.user",
            Self::GroupQuota => "aquota.group",
            Self::OrphanDir => "orphan_dir",
            Self::ExtentAlloc => "extent_alloc",
            Self::InodeAlloc => "inode_alloc",
            Self::Journal => "journal",
            Self::LocalAlloc => "local_alloc",
            Self::TruncateLog => "truncate_log",
            Self::LocalUserQuota => "aquota.user",
            Self::LocalGroupQuota => "aquota.group",
        };
        if self.is_per_slot() {
            format!("{base}:{slot:04}")
        } else {
            base.to_string()
        }
    }
}

/// Number of extent records a list embedded in an inode can hold.
pub fn extent_recs_per_inode(blocksize: u32) -> u16 {
    let space = blocksize as usize - INODE_BODY_OFF - size_of::<ExtentList>();
    (space / size_of::<ExtentRec>()) as u16
}

/// Number of extent records an extent block can hold.
pub fn extent_recs_per_eb(blocksize: u32) -> u16 {
    let space = blocksize as usize - size_of::<ExtentBlock>();
    (space / size_of::<ExtentRec>()) as u16
}

/// Number of extent records a promoted refcount root can hold.
pub fn extent_recs_per_rb(blocksize: u32) -> u16 {
    let space = blocksize as usize - REFCOUNT_BODY_OFF - size_of::<ExtentList>();
    (space / size_of::<ExtentRec>()) as u16
}

/// Number of extent records a directory index root can hold.
pub fn extent_recs_per_dx_root(blocksize: u32) -> u16 {
    let space = blocksize as usize - DX_ROOT_BODY_OFF - size_of::<ExtentList>();
    (space / size_of::<ExtentRec>()) as u16
}

/// Number of refcount records a refcount block can hold.
pub fn refcount_recs_per_rb(blocksize: u32) -> u16 {
    let space = blocksize as usize - REFCOUNT_BODY_OFF - size_of::<RefcountList>();
    (space / size_of::<RefcountRec>()) as u16
}

/// Number of chain records an allocator inode can hold.
pub fn chain_recs_per_inode(blocksize: u32) -> u16 {
    let space = blocksize as usize - INODE_BODY_OFF - size_of::<ChainList>();
    (space / size_of::<ChainRec>()) as u16
}

/// Number of index entries a directory index root can hold inline.
pub fn dx_entries_per_root(blocksize: u32) -> u32 {
    let space = blocksize as usize - DX_ROOT_BODY_OFF - size_of::<DxEntryList>();
    (space / size_of::<DxEntry>()) as u32
}

/// Number of index entries a directory index leaf can hold.
pub fn dx_entries_per_leaf(blocksize: u32) -> u32 {
    let space = blocksize as usize - size_of::<DxLeaf>();
    (space / size_of::<DxEntry>()) as u32
}

/// Number of truncate records a dealloc inode can hold.
pub fn truncate_recs_per_inode(blocksize: u32) -> u16 {
    let space = blocksize as usize - INODE_BODY_OFF - size_of::<TruncateLog>();
    (space / size_of::<TruncateRec>()) as u16
}

/// Bytes of file data an inline-data inode can hold.
pub fn max_inline_data(blocksize: u32) -> usize {
    blocksize as usize - INLINE_DATA_OFF
}

/// Offset of the trailer inside a directory block.
pub fn dir_trailer_blk_off(blocksize: u32) -> usize {
    blocksize as usize - DIR_TRAILER_LEN
}

/// Returns the trailer of a directory block.
pub fn dir_trailer(buf: &[u8]) -> &DirBlockTrailer {
    cast_at(buf, buf.len() - DIR_TRAILER_LEN)
}

/// Returns the trailer of a directory block, mutable.
pub fn dir_trailer_mut(buf: &mut [u8]) -> &mut DirBlockTrailer {
    let off = buf.len() - DIR_TRAILER_LEN;
    cast_at_mut(buf, off)
}

/// Copies an ASCII signature into a fixed-size field.
pub fn set_signature(field: &mut [u8], signature: &str) {
    field.fill(0);
    field[..signature.len()].copy_from_slice(signature.as_bytes());
}

/// Tells whether a signature field starts with the given ASCII signature.
pub fn signature_matches(field: &[u8], signature: &str) -> bool {
    field.len() >= signature.len() && &field[..signature.len()] == signature.as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_offsets() {
        assert_eq!(size_of::<Dinode>(), 192);
        assert_eq!(size_of::<SuperBlock>(), 320);
        assert_eq!(size_of::<ExtentRec>(), 16);
        assert_eq!(size_of::<ExtentList>(), 16);
        assert_eq!(size_of::<ExtentBlock>(), 64);
        assert_eq!(size_of::<GroupDesc>(), 64);
        assert_eq!(size_of::<ChainRec>(), 16);
        assert_eq!(size_of::<RefcountRec>(), 16);
        assert_eq!(size_of::<RefcountBlock>(), 128);
        assert_eq!(size_of::<DxRootBlock>(), 192);
        assert_eq!(size_of::<DxLeaf>(), 48);
        assert_eq!(size_of::<DxEntry>(), 16);
        assert_eq!(size_of::<DirBlockTrailer>(), 64);
        assert_eq!(size_of::<XattrBlock>(), 48);
        assert_eq!(size_of::<XattrEntry>(), 16);
        assert_eq!(size_of::<BlockCheck>(), 8);
    }

    #[test]
    fn rec_len_rounding() {
        assert_eq!(dir_rec_len(1), 16);
        assert_eq!(dir_rec_len(4), 16);
        assert_eq!(dir_rec_len(5), 20);
        assert_eq!(dir_rec_len(255), 268);
    }

    #[test]
    fn interior_cluster_count() {
        let mut rec = ExtentRec::default();
        rec.set_int_clusters(0x0102_0304);
        assert_eq!(rec.int_clusters(), 0x0102_0304);
        // the leaf fields alias the same bytes
        assert_eq!(u32::from(rec.e_leaf_clusters) | (u32::from(rec.e_flags) << 24) | (u32::from(rec.e_reserved1) << 16), 0x0102_0304u32.to_le());
    }

    #[test]
    fn system_file_names() {
        assert_eq!(SystemFileType::GlobalBitmap.file_name(0), "global_bitmap");
        assert_eq!(SystemFileType::InodeAlloc.file_name(3), "inode_alloc:0003");
        assert_eq!(SystemFileType::Journal.file_name(12), "journal:0012");
    }

    #[test]
    fn geometry() {
        // a 4096-byte block: (4096 - 192 - 16) / 16
        assert_eq!(extent_recs_per_inode(4096), 243);
        assert_eq!(extent_recs_per_eb(4096), 252);
        assert_eq!(refcount_recs_per_rb(4096), 247);
        assert_eq!(dx_entries_per_leaf(4096), 253);
        assert_eq!(dir_trailer_blk_off(4096), 4032);
    }
}
