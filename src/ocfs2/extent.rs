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

//! The extent-tree engine.
//!
//! A bounded-depth B+-tree keyed by logical cluster position, embedded in
//! several kinds of root blocks (inodes, refcount roots, directory index
//! roots, xattr value roots). The root kind is abstracted behind
//! [`ExtentTreeOps`]; everything else is shared.
//!
//! Mutations never recurse through on-disk parent pointers. A [`Path`] is
//! built from the root down, worked on in memory, and written back children
//! first, so an interrupted operation leaves an orphan child rather than a
//! dangling parent record.

use crate::alloc;
use crate::byteorder::cpu_is_little_endian;
use crate::byteorder::swap_barrier;
use crate::error::Ocfs2Error;
use crate::fs::FsHandle;
use crate::inode;
use crate::ondisk::*;
use crate::util::cast_at;
use crate::util::cast_at_mut;
use std::mem::offset_of;
use std::mem::size_of;

/// Offset of the check field inside an extent block.
pub const EXTENT_BLOCK_CHECK_OFF: usize = offset_of!(ExtentBlock, h_check);

/// Returns the cluster count of a record at the given tree depth.
pub fn rec_clusters(tree_depth: u16, rec: &ExtentRec) -> u32 {
    if tree_depth > 0 {
        rec.int_clusters()
    } else {
        rec.e_leaf_clusters as u32
    }
}

/// Sets the cluster count of a record at the given tree depth.
pub fn set_rec_clusters(tree_depth: u16, rec: &mut ExtentRec, clusters: u32) {
    if tree_depth > 0 {
        rec.set_int_clusters(clusters);
    } else {
        rec.e_leaf_clusters = clusters as u16;
    }
}

/// Swaps an extent list (header and records) to host endianness.
///
/// Returns `false` when a corrupt record count made the loop stop at the
/// block boundary.
pub fn swap_extent_list_to_native(blocksize: u32, buf: &mut [u8], list_off: usize) -> bool {
    if cpu_is_little_endian() {
        return true;
    }
    let el = cast_at_mut::<ExtentList>(buf, list_off);
    el.l_tree_depth = el.l_tree_depth.swap_bytes();
    el.l_count = el.l_count.swap_bytes();
    el.l_next_free_rec = el.l_next_free_rec.swap_bytes();
    swap_extent_recs(blocksize, buf, list_off)
}

/// Swaps an extent list back to disk endianness.
pub fn swap_extent_list_from_native(blocksize: u32, buf: &mut [u8], list_off: usize) -> bool {
    if cpu_is_little_endian() {
        return true;
    }
    let complete = swap_extent_recs(blocksize, buf, list_off);
    let el = cast_at_mut::<ExtentList>(buf, list_off);
    el.l_tree_depth = el.l_tree_depth.swap_bytes();
    el.l_count = el.l_count.swap_bytes();
    el.l_next_free_rec = el.l_next_free_rec.swap_bytes();
    complete
}

/// Swaps the records of a list whose header is in host endianness.
fn swap_extent_recs(blocksize: u32, buf: &mut [u8], list_off: usize) -> bool {
    let el = cast_at::<ExtentList>(buf, list_off);
    let depth = el.l_tree_depth;
    let next_free = el.l_next_free_rec as usize;
    for i in 0..next_free {
        let off = list_off + size_of::<ExtentList>() + i * size_of::<ExtentRec>();
        if swap_barrier(blocksize as usize, off, size_of::<ExtentRec>()) {
            return false;
        }
        let rec = cast_at_mut::<ExtentRec>(buf, off);
        rec.e_cpos = rec.e_cpos.swap_bytes();
        rec.e_blkno = rec.e_blkno.swap_bytes();
        if depth > 0 {
            rec.set_int_clusters(rec.int_clusters().swap_bytes());
        } else {
            rec.e_leaf_clusters = rec.e_leaf_clusters.swap_bytes();
        }
    }
    true
}

fn swap_extent_block_header(eb: &mut ExtentBlock) {
    eb.h_suballoc_slot = eb.h_suballoc_slot.swap_bytes();
    eb.h_suballoc_bit = eb.h_suballoc_bit.swap_bytes();
    eb.h_fs_generation = eb.h_fs_generation.swap_bytes();
    eb.h_blkno = eb.h_blkno.swap_bytes();
    eb.h_up_hdr_node_ptr = eb.h_up_hdr_node_ptr.swap_bytes();
    eb.h_next_leaf_blk = eb.h_next_leaf_blk.swap_bytes();
}

/// Swaps an extent block to host endianness.
pub fn swap_extent_block_to_native(blocksize: u32, buf: &mut [u8]) -> bool {
    if cpu_is_little_endian() {
        return true;
    }
    swap_extent_block_header(cast_at_mut::<ExtentBlock>(buf, 0));
    swap_extent_list_to_native(blocksize, buf, EXTENT_BLOCK_LIST_OFF)
}

/// Swaps an extent block back to disk endianness.
pub fn swap_extent_block_from_native(blocksize: u32, buf: &mut [u8]) -> bool {
    if cpu_is_little_endian() {
        return true;
    }
    let complete = swap_extent_list_from_native(blocksize, buf, EXTENT_BLOCK_LIST_OFF);
    swap_extent_block_header(cast_at_mut::<ExtentBlock>(buf, 0));
    complete
}

/// Reads and validates the extent block at `blkno`.
pub fn read_extent_block(fs: &FsHandle, blkno: u64) -> Result<Vec<u8>, Ocfs2Error> {
    fs.check_blkno(blkno)?;

    let mut blk = fs.alloc_block();
    fs.read_blocks(blkno, 1, &mut blk)?;

    fs.validate_meta_ecc(&mut blk, EXTENT_BLOCK_CHECK_OFF, blkno)?;

    let eb = cast_at::<ExtentBlock>(&blk, 0);
    if !signature_matches(&eb.h_signature, EXTENT_BLOCK_SIGNATURE) {
        return Err(Ocfs2Error::BadSignature {
            blkno,
            expected: EXTENT_BLOCK_SIGNATURE,
        });
    }

    if !swap_extent_block_to_native(fs.blocksize, &mut blk) {
        return Err(Ocfs2Error::CorruptedBlock(blkno));
    }
    let el = cast_at::<ExtentList>(&blk, EXTENT_BLOCK_LIST_OFF);
    if el.l_count > extent_recs_per_eb(fs.blocksize)
        || el.l_next_free_rec > el.l_count
        || el.l_tree_depth as usize >= MAX_PATH_DEPTH
    {
        return Err(Ocfs2Error::CorruptedExtentTree(blkno));
    }
    Ok(blk)
}

/// Writes a host-endian extent block to `blkno`.
pub fn write_extent_block(fs: &FsHandle, blkno: u64, buf: &[u8]) -> Result<(), Ocfs2Error> {
    if !fs.writable() {
        return Err(Ocfs2Error::ReadOnlyFilesystem);
    }
    fs.check_blkno(blkno)?;

    let mut blk = buf.to_vec();
    if !swap_extent_block_from_native(fs.blocksize, &mut blk) {
        return Err(Ocfs2Error::CorruptedBlock(blkno));
    }
    fs.compute_meta_ecc(&mut blk, EXTENT_BLOCK_CHECK_OFF);
    fs.write_blocks(blkno, 1, &blk)
}

/// Default contiguity test: `right` directly follows `left`, both logically
/// and physically, with the same flags.
pub fn default_extent_contig(fs: &FsHandle, left: &ExtentRec, right: &ExtentRec) -> bool {
    left.e_cpos as u64 + left.e_leaf_clusters as u64 == right.e_cpos as u64
        && left.e_blkno + fs.clusters_to_blocks(left.e_leaf_clusters as u32) == right.e_blkno
        && left.e_flags == right.e_flags
}

/// Operations a root kind provides to the extent engine.
pub trait ExtentTreeOps {
    /// Returns the rightmost leaf block stored in the root.
    fn last_eb_blk(&self, root: &[u8]) -> u64;
    /// Stores the rightmost leaf block in the root.
    fn set_last_eb_blk(&self, root: &mut [u8], blkno: u64);
    /// Adds `delta` to the root's total cluster count.
    fn update_clusters(&self, root: &mut [u8], delta: i64);
    /// Returns the root's total cluster count.
    fn clusters(&self, root: &[u8]) -> u32;
    /// Offset of the embedded extent list inside the root block.
    fn root_list_off(&self) -> usize;
    /// Cap on the clusters a single leaf record may carry; 0 is unlimited.
    fn max_leaf_clusters(&self, _fs: &FsHandle) -> u32 {
        0
    }
    /// Called before a record is inserted.
    fn insert_check(&self, _fs: &FsHandle, _root: &[u8], _rec: &ExtentRec) -> Result<(), Ocfs2Error> {
        Ok(())
    }
    /// Structural check of the root before a mutating walk.
    fn sanity_check(&self, _fs: &FsHandle, root: &[u8], root_blkno: u64) -> Result<(), Ocfs2Error> {
        let el = cast_at::<ExtentList>(root, self.root_list_off());
        if el.l_next_free_rec > el.l_count || el.l_tree_depth as usize >= MAX_PATH_DEPTH {
            return Err(Ocfs2Error::CorruptedExtentTree(root_blkno));
        }
        Ok(())
    }
    /// Tests whether `right` should be treated as the continuation of
    /// `left`.
    fn extent_contig(&self, fs: &FsHandle, left: &ExtentRec, right: &ExtentRec) -> bool {
        default_extent_contig(fs, left, right)
    }
    /// Writes the root block back through its own typed writer.
    fn write_root(&self, fs: &FsHandle, blkno: u64, root: &[u8]) -> Result<(), Ocfs2Error>;
}

struct DinodeTreeOps;

impl ExtentTreeOps for DinodeTreeOps {
    fn last_eb_blk(&self, root: &[u8]) -> u64 {
        cast_at::<Dinode>(root, 0).i_last_eb_blk
    }

    fn set_last_eb_blk(&self, root: &mut [u8], blkno: u64) {
        cast_at_mut::<Dinode>(root, 0).i_last_eb_blk = blkno;
    }

    fn update_clusters(&self, root: &mut [u8], delta: i64) {
        let di = cast_at_mut::<Dinode>(root, 0);
        di.i_clusters = (di.i_clusters as i64 + delta) as u32;
    }

    fn clusters(&self, root: &[u8]) -> u32 {
        cast_at::<Dinode>(root, 0).i_clusters
    }

    fn root_list_off(&self) -> usize {
        INODE_BODY_OFF
    }

    fn write_root(&self, fs: &FsHandle, blkno: u64, root: &[u8]) -> Result<(), Ocfs2Error> {
        inode::write_inode(fs, blkno, root)
    }
}

struct RefcountTreeOps;

impl ExtentTreeOps for RefcountTreeOps {
    fn last_eb_blk(&self, root: &[u8]) -> u64 {
        cast_at::<RefcountBlock>(root, 0).rf_last_eb_blk
    }

    fn set_last_eb_blk(&self, root: &mut [u8], blkno: u64) {
        cast_at_mut::<RefcountBlock>(root, 0).rf_last_eb_blk = blkno;
    }

    fn update_clusters(&self, root: &mut [u8], delta: i64) {
        let rb = cast_at_mut::<RefcountBlock>(root, 0);
        rb.rf_clusters = (rb.rf_clusters as i64 + delta) as u32;
    }

    fn clusters(&self, root: &[u8]) -> u32 {
        cast_at::<RefcountBlock>(root, 0).rf_clusters
    }

    fn root_list_off(&self) -> usize {
        REFCOUNT_BODY_OFF
    }

    fn write_root(&self, fs: &FsHandle, blkno: u64, root: &[u8]) -> Result<(), Ocfs2Error> {
        crate::refcount::write_refcount_block(fs, blkno, root)
    }
}

struct DxRootTreeOps;

impl ExtentTreeOps for DxRootTreeOps {
    fn last_eb_blk(&self, root: &[u8]) -> u64 {
        cast_at::<DxRootBlock>(root, 0).dr_last_eb_blk
    }

    fn set_last_eb_blk(&self, root: &mut [u8], blkno: u64) {
        cast_at_mut::<DxRootBlock>(root, 0).dr_last_eb_blk = blkno;
    }

    fn update_clusters(&self, root: &mut [u8], delta: i64) {
        let dr = cast_at_mut::<DxRootBlock>(root, 0);
        dr.dr_clusters = (dr.dr_clusters as i64 + delta) as u32;
    }

    fn clusters(&self, root: &[u8]) -> u32 {
        cast_at::<DxRootBlock>(root, 0).dr_clusters
    }

    fn root_list_off(&self) -> usize {
        DX_ROOT_BODY_OFF
    }

    fn extent_contig(&self, _fs: &FsHandle, _left: &ExtentRec, _right: &ExtentRec) -> bool {
        // hash ranges are never merged, their boundaries are lookup keys
        false
    }

    fn write_root(&self, fs: &FsHandle, blkno: u64, root: &[u8]) -> Result<(), Ocfs2Error> {
        crate::dir_indexed::write_dx_root(fs, blkno, root)
    }
}

/// Where an xattr value root lives, deciding how its block is written back.
#[derive(Clone, Copy)]
pub enum XattrRootContainer {
    /// Inside an inode block.
    Inode,
    /// Inside an xattr block.
    XattrBlock,
}

struct XattrValueTreeOps {
    /// Offset of the [`XattrValueRoot`] inside the container block.
    value_off: usize,
    container: XattrRootContainer,
}

impl ExtentTreeOps for XattrValueTreeOps {
    fn last_eb_blk(&self, root: &[u8]) -> u64 {
        cast_at::<XattrValueRoot>(root, self.value_off).xr_last_eb_blk
    }

    fn set_last_eb_blk(&self, root: &mut [u8], blkno: u64) {
        cast_at_mut::<XattrValueRoot>(root, self.value_off).xr_last_eb_blk = blkno;
    }

    fn update_clusters(&self, root: &mut [u8], delta: i64) {
        let xv = cast_at_mut::<XattrValueRoot>(root, self.value_off);
        xv.xr_clusters = (xv.xr_clusters as i64 + delta) as u32;
    }

    fn clusters(&self, root: &[u8]) -> u32 {
        cast_at::<XattrValueRoot>(root, self.value_off).xr_clusters
    }

    fn root_list_off(&self) -> usize {
        self.value_off + offset_of!(XattrValueRoot, xr_list)
    }

    fn write_root(&self, fs: &FsHandle, blkno: u64, root: &[u8]) -> Result<(), Ocfs2Error> {
        match self.container {
            XattrRootContainer::Inode => inode::write_inode(fs, blkno, root),
            XattrRootContainer::XattrBlock => crate::xattr::write_xattr_block(fs, blkno, root),
        }
    }
}

struct XattrTreeOps;

/// Largest byte span one xattr bucket-tree leaf record may cover.
const XATTR_TREE_LEAF_MAX_BYTES: u64 = 65536;

impl ExtentTreeOps for XattrTreeOps {
    fn last_eb_blk(&self, root: &[u8]) -> u64 {
        cast_at::<XattrTreeRoot>(root, XATTR_BODY_OFF).xt_last_eb_blk
    }

    fn set_last_eb_blk(&self, root: &mut [u8], blkno: u64) {
        cast_at_mut::<XattrTreeRoot>(root, XATTR_BODY_OFF).xt_last_eb_blk = blkno;
    }

    fn update_clusters(&self, root: &mut [u8], delta: i64) {
        let xt = cast_at_mut::<XattrTreeRoot>(root, XATTR_BODY_OFF);
        xt.xt_clusters = (xt.xt_clusters as i64 + delta) as u32;
    }

    fn clusters(&self, root: &[u8]) -> u32 {
        cast_at::<XattrTreeRoot>(root, XATTR_BODY_OFF).xt_clusters
    }

    fn root_list_off(&self) -> usize {
        XATTR_BODY_OFF + offset_of!(XattrTreeRoot, xt_list)
    }

    fn max_leaf_clusters(&self, fs: &FsHandle) -> u32 {
        fs.clusters_for_bytes(XATTR_TREE_LEAF_MAX_BYTES)
    }

    fn write_root(&self, fs: &FsHandle, blkno: u64, root: &[u8]) -> Result<(), Ocfs2Error> {
        crate::xattr::write_xattr_block(fs, blkno, root)
    }
}

/// An extent tree: a root kind, the root block and its block number.
pub struct ExtentTree<'a> {
    ops: Box<dyn ExtentTreeOps>,
    /// The root block, host-endian.
    pub root_buf: &'a mut [u8],
    /// The block holding the root.
    pub root_blkno: u64,
    /// Leaf record cap, filled from the ops at construction.
    pub max_leaf_clusters: u32,
}

impl<'a> ExtentTree<'a> {
    fn new(
        fs: &FsHandle,
        ops: Box<dyn ExtentTreeOps>,
        root_buf: &'a mut [u8],
        root_blkno: u64,
    ) -> Self {
        let max_leaf_clusters = ops.max_leaf_clusters(fs);
        Self {
            ops,
            root_buf,
            root_blkno,
            max_leaf_clusters,
        }
    }

    /// Tree rooted in an inode block.
    pub fn dinode(fs: &FsHandle, root_buf: &'a mut [u8], root_blkno: u64) -> Self {
        Self::new(fs, Box::new(DinodeTreeOps), root_buf, root_blkno)
    }

    /// Tree rooted in a promoted refcount block.
    pub fn refcount(fs: &FsHandle, root_buf: &'a mut [u8], root_blkno: u64) -> Self {
        Self::new(fs, Box::new(RefcountTreeOps), root_buf, root_blkno)
    }

    /// Tree rooted in a directory index root block.
    pub fn dx_root(fs: &FsHandle, root_buf: &'a mut [u8], root_blkno: u64) -> Self {
        Self::new(fs, Box::new(DxRootTreeOps), root_buf, root_blkno)
    }

    /// Tree rooted in an xattr value root at `value_off` inside the block.
    pub fn xattr_value(
        fs: &FsHandle,
        root_buf: &'a mut [u8],
        root_blkno: u64,
        value_off: usize,
        container: XattrRootContainer,
    ) -> Self {
        Self::new(
            fs,
            Box::new(XattrValueTreeOps {
                value_off,
                container,
            }),
            root_buf,
            root_blkno,
        )
    }

    /// Tree of xattr buckets rooted in an indexed xattr block.
    pub fn xattr_tree(fs: &FsHandle, root_buf: &'a mut [u8], root_blkno: u64) -> Self {
        Self::new(fs, Box::new(XattrTreeOps), root_buf, root_blkno)
    }

    /// Returns the root's embedded extent list.
    pub fn root_list(&self) -> &ExtentList {
        cast_at(self.root_buf, self.ops.root_list_off())
    }

    /// Returns the root's embedded extent list, mutable.
    pub fn root_list_mut(&mut self) -> &mut ExtentList {
        cast_at_mut(self.root_buf, self.ops.root_list_off())
    }
}

/// One node of a path, root first.
pub struct PathItem {
    /// The block the node lives in.
    pub blkno: u64,
    /// The node's block, host-endian. For the root this is a working copy,
    /// synced back when the path is written.
    pub buf: Vec<u8>,
    /// Offset of the node's extent list inside the block.
    pub list_off: usize,
}

impl PathItem {
    /// Returns the node's extent list.
    pub fn list(&self) -> &ExtentList {
        cast_at(&self.buf, self.list_off)
    }

    /// Returns the node's extent list, mutable.
    pub fn list_mut(&mut self) -> &mut ExtentList {
        cast_at_mut(&mut self.buf, self.list_off)
    }
}

/// A root-to-leaf walk through a tree.
pub struct Path {
    /// The nodes, index 0 being the root.
    pub items: Vec<PathItem>,
}

impl Path {
    /// Returns the leaf node.
    pub fn leaf(&self) -> &PathItem {
        self.items.last().unwrap()
    }

    /// Returns the leaf node, mutable.
    pub fn leaf_mut(&mut self) -> &mut PathItem {
        self.items.last_mut().unwrap()
    }
}

/// Picks the child slot covering `cpos` in an interior list.
fn search_interior(el: &ExtentList, cpos: u32) -> usize {
    let mut idx = 0;
    for (i, rec) in el.recs().iter().enumerate() {
        if rec.e_cpos <= cpos {
            idx = i;
        } else {
            break;
        }
    }
    idx
}

/// Builds the path from the tree root down to the leaf covering `cpos`.
///
/// The walk is iterative and bounded by the maximum tree depth; the child
/// depth and the parent back-pointer are verified at every step.
pub fn find_path(fs: &FsHandle, et: &ExtentTree<'_>, cpos: u32) -> Result<Path, Ocfs2Error> {
    let root_list = et.root_list();
    let mut depth = root_list.l_tree_depth;
    if depth as usize >= MAX_PATH_DEPTH {
        return Err(Ocfs2Error::CorruptedExtentTree(et.root_blkno));
    }

    let mut items = vec![PathItem {
        blkno: et.root_blkno,
        buf: et.root_buf.to_vec(),
        list_off: et.ops.root_list_off(),
    }];

    while depth > 0 {
        let parent = items.last().unwrap();
        let el = parent.list();
        if el.l_next_free_rec == 0 {
            return Err(Ocfs2Error::CorruptedExtentTree(parent.blkno));
        }
        let idx = search_interior(el, cpos);
        let child_blkno = el.recs()[idx].e_blkno;
        let parent_blkno = parent.blkno;

        let buf = read_extent_block(fs, child_blkno)?;
        let eb = cast_at::<ExtentBlock>(&buf, 0);
        if eb.h_list.l_tree_depth != depth - 1 || eb.h_up_hdr_node_ptr != parent_blkno {
            return Err(Ocfs2Error::CorruptedExtentTree(child_blkno));
        }

        items.push(PathItem {
            blkno: child_blkno,
            buf,
            list_off: EXTENT_BLOCK_LIST_OFF,
        });
        depth -= 1;
    }
    Ok(Path { items })
}

/// Descends from an extent list embedded at `list_off` of `root_buf` down
/// to the depth-0 extent block covering `cpos`, without going through an
/// [`ExtentTree`]. Used by the engines that keep their own key spaces
/// (refcount, directory index).
pub fn tree_find_leaf(
    fs: &FsHandle,
    root_buf: &[u8],
    list_off: usize,
    root_blkno: u64,
    cpos: u32,
) -> Result<Vec<u8>, Ocfs2Error> {
    let mut depth = {
        let el = cast_at::<ExtentList>(root_buf, list_off);
        el.l_tree_depth
    };
    if depth == 0 || depth as usize >= MAX_PATH_DEPTH {
        return Err(Ocfs2Error::CorruptedExtentTree(root_blkno));
    }
    let mut parent_blkno = root_blkno;
    let mut cur: Option<Vec<u8>> = None;
    loop {
        let child_blkno = {
            let el: &ExtentList = match &cur {
                None => cast_at(root_buf, list_off),
                Some(buf) => cast_at(buf, EXTENT_BLOCK_LIST_OFF),
            };
            if el.l_next_free_rec == 0 {
                return Err(Ocfs2Error::CorruptedExtentTree(parent_blkno));
            }
            el.recs()[search_interior(el, cpos)].e_blkno
        };

        let buf = read_extent_block(fs, child_blkno)?;
        let eb = cast_at::<ExtentBlock>(&buf, 0);
        if eb.h_list.l_tree_depth != depth - 1 || eb.h_up_hdr_node_ptr != parent_blkno {
            return Err(Ocfs2Error::CorruptedExtentTree(child_blkno));
        }
        depth -= 1;
        if depth == 0 {
            return Ok(buf);
        }
        parent_blkno = child_blkno;
        cur = Some(buf);
    }
}

/// Writes the nodes of a path back to disk, children before parents, the
/// root through its typed writer last.
fn write_path(fs: &FsHandle, et: &mut ExtentTree<'_>, path: &Path) -> Result<(), Ocfs2Error> {
    for item in path.items[1..].iter().rev() {
        write_extent_block(fs, item.blkno, &item.buf)?;
    }
    et.root_buf.copy_from_slice(&path.items[0].buf);
    et.ops.write_root(fs, et.root_blkno, et.root_buf)
}

/// Effective record count of a leaf list, ignoring a trailing empty record
/// left behind by a partial insertion.
fn leaf_used(el: &ExtentList) -> usize {
    let used = el.l_next_free_rec as usize;
    if used > 0 && el.l_tree_depth == 0 && el.recs()[used - 1].e_leaf_clusters == 0 {
        used - 1
    } else {
        used
    }
}

enum LeafInsert {
    Done,
    NeedSplit,
}

/// Inserts `rec` into the path's leaf list if a merge or a free slot allows
/// it.
fn insert_into_leaf(
    fs: &FsHandle,
    et: &ExtentTree<'_>,
    path: &mut Path,
    rec: &ExtentRec,
) -> Result<LeafInsert, Ocfs2Error> {
    let max_leaf = et.max_leaf_clusters;
    let leaf_blkno = path.leaf().blkno;
    let el = path.leaf_mut().list_mut();
    let used = leaf_used(el);
    let count = el.l_count as usize;

    // insertion slot: first record with a larger position
    let mut idx = 0;
    while idx < used && el.rec(idx).e_cpos < rec.e_cpos {
        idx += 1;
    }

    // overlaps mean the caller's view of the tree is stale or the tree is
    // corrupt
    if idx > 0 {
        let prev = *el.rec(idx - 1);
        if prev.e_cpos as u64 + prev.e_leaf_clusters as u64 > rec.e_cpos as u64 {
            return Err(Ocfs2Error::CorruptedExtentTree(leaf_blkno));
        }
    }
    if idx < used {
        let next = *el.rec(idx);
        if rec.e_cpos as u64 + rec.e_leaf_clusters as u64 > next.e_cpos as u64 {
            return Err(Ocfs2Error::CorruptedExtentTree(leaf_blkno));
        }
    }

    let fits = |combined: u64| -> bool {
        combined <= u16::MAX as u64 && (max_leaf == 0 || combined <= max_leaf as u64)
    };

    let contig_left = idx > 0 && {
        let prev = *el.rec(idx - 1);
        et.ops.extent_contig(fs, &prev, rec)
            && fits(prev.e_leaf_clusters as u64 + rec.e_leaf_clusters as u64)
    };
    let contig_right = idx < used && {
        let next = *el.rec(idx);
        et.ops.extent_contig(fs, rec, &next)
            && fits(rec.e_leaf_clusters as u64 + next.e_leaf_clusters as u64)
    };

    if contig_left && contig_right {
        let bridged = el.rec(idx - 1).e_leaf_clusters as u64
            + rec.e_leaf_clusters as u64
            + el.rec(idx).e_leaf_clusters as u64;
        if fits(bridged) {
            let absorbed = el.rec(idx).e_leaf_clusters;
            el.rec_mut(idx - 1).e_leaf_clusters += rec.e_leaf_clusters + absorbed;
            // drop the right neighbour
            for i in idx..used - 1 {
                *el.rec_mut(i) = *el.rec(i + 1);
            }
            *el.rec_mut(used - 1) = ExtentRec::default();
            el.l_next_free_rec = (used - 1) as u16;
            return Ok(LeafInsert::Done);
        }
    }
    if contig_left {
        el.rec_mut(idx - 1).e_leaf_clusters += rec.e_leaf_clusters;
        return Ok(LeafInsert::Done);
    }
    if contig_right {
        let next = el.rec_mut(idx);
        next.e_cpos = rec.e_cpos;
        next.e_blkno = rec.e_blkno;
        next.e_leaf_clusters += rec.e_leaf_clusters;
        return Ok(LeafInsert::Done);
    }

    if used < count {
        let mut i = used;
        while i > idx {
            *el.rec_mut(i) = *el.rec(i - 1);
            i -= 1;
        }
        *el.rec_mut(idx) = *rec;
        el.l_next_free_rec = (used + 1) as u16;
        return Ok(LeafInsert::Done);
    }
    Ok(LeafInsert::NeedSplit)
}

/// Sum of the cluster counts of a list's records.
fn list_clusters(el: &ExtentList) -> u32 {
    let depth = el.l_tree_depth;
    el.recs().iter().map(|r| rec_clusters(depth, r)).sum()
}

/// Grows the tree by one level: the root's records move to a freshly
/// allocated extent block and the root keeps a single record covering the
/// whole tree.
fn grow_tree_depth(fs: &FsHandle, et: &mut ExtentTree<'_>) -> Result<(), Ocfs2Error> {
    let root_depth = et.root_list().l_tree_depth;
    if root_depth as usize + 1 >= MAX_PATH_DEPTH {
        return Err(Ocfs2Error::NoSpaceInTree(et.root_blkno));
    }

    let (new_blkno, mut new_buf) = alloc::new_extent_block(fs)?;
    let root_blkno = et.root_blkno;

    // move the whole root list into the new block
    {
        let root_list = et.root_list();
        let next_free = root_list.l_next_free_rec;
        let recs: Vec<ExtentRec> = root_list.recs().to_vec();

        let eb = cast_at_mut::<ExtentBlock>(&mut new_buf, 0);
        eb.h_up_hdr_node_ptr = root_blkno;
        eb.h_list.l_tree_depth = root_depth;
        eb.h_list.l_next_free_rec = next_free;
        let el = cast_at_mut::<ExtentList>(&mut new_buf, EXTENT_BLOCK_LIST_OFF);
        for (i, rec) in recs.iter().enumerate() {
            *el.rec_mut(i) = *rec;
        }
    }

    // moved interior records now parent their children from the new block
    if root_depth > 0 {
        let children: Vec<u64> = cast_at::<ExtentList>(&new_buf, EXTENT_BLOCK_LIST_OFF)
            .recs()
            .iter()
            .map(|r| r.e_blkno)
            .collect();
        for child in children {
            let mut child_buf = read_extent_block(fs, child)?;
            cast_at_mut::<ExtentBlock>(&mut child_buf, 0).h_up_hdr_node_ptr = new_blkno;
            write_extent_block(fs, child, &child_buf)?;
        }
    }

    let subtree_clusters = list_clusters(cast_at::<ExtentList>(&new_buf, EXTENT_BLOCK_LIST_OFF));
    write_extent_block(fs, new_blkno, &new_buf)?;

    // now raise the root
    {
        let el = et.root_list_mut();
        let count = el.l_count as usize;
        el.l_tree_depth = root_depth + 1;
        el.l_next_free_rec = 1;
        let first = el.rec_mut(0);
        first.e_cpos = 0;
        first.e_blkno = new_blkno;
        first.set_int_clusters(subtree_clusters);
        for i in 1..count {
            *el.rec_mut(i) = ExtentRec::default();
        }
    }
    if root_depth == 0 {
        et.ops.set_last_eb_blk(et.root_buf, new_blkno);
    }
    et.ops.write_root(fs, root_blkno, et.root_buf)
}

/// Inserts `rec` into a list at its sorted slot. The list must have room.
fn list_insert_sorted(el: &mut ExtentList, rec: ExtentRec) {
    let used = el.l_next_free_rec as usize;
    let mut idx = 0;
    while idx < used && el.rec(idx).e_cpos < rec.e_cpos {
        idx += 1;
    }
    let mut i = used;
    while i > idx {
        *el.rec_mut(i) = *el.rec(i - 1);
        i -= 1;
    }
    *el.rec_mut(idx) = rec;
    el.l_next_free_rec = (used + 1) as u16;
}

/// Splits the full leaf of `path` (and full ancestors, bottom-up) so the
/// leaf covering the insertion point regains a free slot. The caller has
/// verified that some ancestor, the root included, still has room; the root
/// itself is never split here.
fn split_path_leaf(
    fs: &FsHandle,
    et: &mut ExtentTree<'_>,
    path: &mut Path,
) -> Result<(), Ocfs2Error> {
    let mut new_blocks: Vec<(u64, Vec<u8>)> = Vec::new();
    // record describing the newest sibling, waiting for a slot one level up
    let mut pending: Option<ExtentRec> = None;

    for level in (1..path.items.len()).rev() {
        if let Some(held) = pending.take() {
            let el = path.items[level].list_mut();
            if (el.l_next_free_rec as usize) < el.l_count as usize {
                list_insert_sorted(el, held);
                pending = None;
                break;
            }
            pending = Some(held);
        } else {
            // first iteration: the leaf, full by contract
            let el = path.items[level].list();
            if (el.l_next_free_rec as usize) < el.l_count as usize {
                return Err(Ocfs2Error::EmptyLeafDuringSplit(path.items[level].blkno));
            }
        }

        let item_blkno = path.items[level].blkno;
        let parent_blkno = path.items[level - 1].blkno;
        let next_leaf = cast_at::<ExtentBlock>(&path.items[level].buf, 0).h_next_leaf_blk;

        // keep the lower half, move the upper half to a new sibling
        let (depth, moved) = {
            let el = path.items[level].list_mut();
            let used = el.l_next_free_rec as usize;
            if used < 2 {
                return Err(Ocfs2Error::EmptyLeafDuringSplit(item_blkno));
            }
            let depth = el.l_tree_depth;
            let split = used / 2;
            let moved: Vec<ExtentRec> = (split..used).map(|i| *el.rec(i)).collect();
            for i in split..used {
                *el.rec_mut(i) = ExtentRec::default();
            }
            el.l_next_free_rec = split as u16;
            (depth, moved)
        };

        let (new_blkno, mut new_buf) = alloc::new_extent_block(fs)?;
        {
            let eb = cast_at_mut::<ExtentBlock>(&mut new_buf, 0);
            eb.h_up_hdr_node_ptr = parent_blkno;
            eb.h_list.l_tree_depth = depth;
            eb.h_list.l_next_free_rec = moved.len() as u16;
            if depth == 0 {
                eb.h_next_leaf_blk = next_leaf;
            }
            let nel = cast_at_mut::<ExtentList>(&mut new_buf, EXTENT_BLOCK_LIST_OFF);
            for (i, rec) in moved.iter().enumerate() {
                *nel.rec_mut(i) = *rec;
            }
        }

        if depth == 0 {
            // keep the sibling chain linked
            cast_at_mut::<ExtentBlock>(&mut path.items[level].buf, 0).h_next_leaf_blk = new_blkno;
            if next_leaf == 0 {
                et.ops.set_last_eb_blk(&mut path.items[0].buf, new_blkno);
            }
        } else {
            // moved interior records re-parent their children. The child on
            // the path and freshly made siblings are patched in memory, the
            // rest on disk.
            for rec in &moved {
                let child = rec.e_blkno;
                if child == path.items[level + 1].blkno {
                    cast_at_mut::<ExtentBlock>(&mut path.items[level + 1].buf, 0)
                        .h_up_hdr_node_ptr = new_blkno;
                } else if let Some((_, buf)) =
                    new_blocks.iter_mut().find(|(blkno, _)| *blkno == child)
                {
                    cast_at_mut::<ExtentBlock>(buf, 0).h_up_hdr_node_ptr = new_blkno;
                } else {
                    let mut child_buf = read_extent_block(fs, child)?;
                    cast_at_mut::<ExtentBlock>(&mut child_buf, 0).h_up_hdr_node_ptr = new_blkno;
                    write_extent_block(fs, child, &child_buf)?;
                }
            }
        }

        // the parent record for the split node sheds the moved clusters
        let moved_clusters: u32 = moved.iter().map(|r| rec_clusters(depth, r)).sum();
        {
            let pel = path.items[level - 1].list_mut();
            for i in 0..pel.l_next_free_rec as usize {
                if pel.rec(i).e_blkno == item_blkno {
                    let c = pel.rec(i).int_clusters();
                    pel.rec_mut(i).set_int_clusters(c - moved_clusters);
                    break;
                }
            }
        }

        let mut parent_rec = ExtentRec {
            e_cpos: moved[0].e_cpos,
            e_blkno: new_blkno,
            ..Default::default()
        };
        parent_rec.set_int_clusters(moved_clusters);

        if let Some(held) = pending.take() {
            // this level split while holding a record; it lands in the half
            // that covers its position
            if held.e_cpos >= moved[0].e_cpos {
                list_insert_sorted(
                    cast_at_mut::<ExtentList>(&mut new_buf, EXTENT_BLOCK_LIST_OFF),
                    held,
                );
                // its block is a fresh sibling from the level below
                if let Some((_, buf)) = new_blocks
                    .iter_mut()
                    .find(|(blkno, _)| *blkno == held.e_blkno)
                {
                    cast_at_mut::<ExtentBlock>(buf, 0).h_up_hdr_node_ptr = new_blkno;
                }
            } else {
                list_insert_sorted(path.items[level].list_mut(), held);
            }
        }
        new_blocks.push((new_blkno, new_buf));
        pending = Some(parent_rec);
    }

    if let Some(held) = pending.take() {
        // every interior level was full; the root takes the topmost sibling
        let root_off = et.ops.root_list_off();
        let el = cast_at_mut::<ExtentList>(&mut path.items[0].buf, root_off);
        if el.l_next_free_rec >= el.l_count {
            return Err(Ocfs2Error::NoSpaceInTree(et.root_blkno));
        }
        list_insert_sorted(el, held);
    }

    // children first, ancestors after
    for (blkno, buf) in &new_blocks {
        write_extent_block(fs, *blkno, buf)?;
    }
    write_path(fs, et, path)
}

/// Inserts the extent (`cpos`, `clusters`) → `blkno` into the tree.
///
/// The target leaf is found by position; append, left merge and right merge
/// are attempted before a slot is taken. A full leaf splits bottom-up,
/// growing the tree depth when the root itself is full.
pub fn insert_extent(
    fs: &FsHandle,
    et: &mut ExtentTree<'_>,
    cpos: u32,
    blkno: u64,
    clusters: u32,
    flags: u8,
) -> Result<(), Ocfs2Error> {
    if clusters == 0 || clusters > u16::MAX as u32 {
        return Err(Ocfs2Error::InvalidArgument("bad extent length"));
    }
    let rec = ExtentRec {
        e_cpos: cpos,
        e_leaf_clusters: clusters as u16,
        e_flags: flags,
        e_blkno: blkno,
        ..Default::default()
    };
    et.ops.insert_check(fs, et.root_buf, &rec)?;

    loop {
        let mut path = find_path(fs, et, cpos)?;
        match insert_into_leaf(fs, et, &mut path, &rec)? {
            LeafInsert::Done => {
                et.ops
                    .update_clusters(&mut path.items[0].buf, clusters as i64);
                // interior records along the path cover the new clusters too
                for level in 0..path.items.len() - 1 {
                    let child_blkno = path.items[level + 1].blkno;
                    let el = path.items[level].list_mut();
                    for i in 0..el.l_next_free_rec as usize {
                        if el.rec(i).e_blkno == child_blkno {
                            let c = el.rec(i).int_clusters();
                            el.rec_mut(i).set_int_clusters(c + clusters);
                            break;
                        }
                    }
                }
                return write_path(fs, et, &path);
            }
            LeafInsert::NeedSplit => {
                if path.items.len() == 1 {
                    // the root list is the leaf; deepen the tree and retry
                    grow_tree_depth(fs, et)?;
                    continue;
                }
                // make sure the ascent will find room somewhere
                let root_el = path.items[0].list();
                let interior_full = path.items[..path.items.len() - 1]
                    .iter()
                    .all(|item| item.list().l_next_free_rec >= item.list().l_count);
                if interior_full && root_el.l_next_free_rec >= root_el.l_count {
                    grow_tree_depth(fs, et)?;
                    continue;
                }
                split_path_leaf(fs, et, &mut path)?;
                continue;
            }
        }
    }
}

/// Locates the record containing `cpos` in a leaf list.
fn search_leaf(el: &ExtentList, cpos: u32) -> Option<usize> {
    for (i, rec) in el.recs().iter().enumerate() {
        let start = rec.e_cpos;
        let clusters = rec.e_leaf_clusters as u32;
        if clusters == 0 {
            continue;
        }
        if start <= cpos && cpos < start + clusters {
            return Some(i);
        }
    }
    None
}

/// Removes `len` clusters starting at `cpos` from the tree.
///
/// Covered records are truncated or removed; a removal inside a record
/// splits it. Leaves that empty are detached from the sibling chain and
/// freed, and the tree depth collapses when the root keeps a single child
/// level.
pub fn remove_extent(
    fs: &FsHandle,
    et: &mut ExtentTree<'_>,
    cpos: u32,
    len: u32,
) -> Result<(), Ocfs2Error> {
    if len == 0 {
        return Err(Ocfs2Error::InvalidArgument("bad extent length"));
    }
    et.ops.sanity_check(fs, et.root_buf, et.root_blkno)?;
    let mut cur = cpos;
    let mut remaining = len;

    while remaining > 0 {
        let mut path = find_path(fs, et, cur)?;
        let leaf_blkno = path.leaf().blkno;
        let el = path.leaf_mut().list_mut();
        let idx = search_leaf(el, cur).ok_or(Ocfs2Error::CorruptedExtentTree(leaf_blkno))?;

        let rec = *el.rec(idx);
        let rec_end = rec.e_cpos + rec.e_leaf_clusters as u32;
        let chunk = remaining.min(rec_end - cur);

        if cur == rec.e_cpos && chunk == rec.e_leaf_clusters as u32 {
            // drop the whole record
            let used = el.l_next_free_rec as usize;
            for i in idx..used - 1 {
                *el.rec_mut(i) = *el.rec(i + 1);
            }
            *el.rec_mut(used - 1) = ExtentRec::default();
            el.l_next_free_rec = (used - 1) as u16;
        } else if cur == rec.e_cpos {
            // truncate the head
            let r = el.rec_mut(idx);
            r.e_cpos += chunk;
            r.e_blkno += fs.clusters_to_blocks(chunk);
            r.e_leaf_clusters -= chunk as u16;
        } else if cur + chunk == rec_end {
            // truncate the tail
            el.rec_mut(idx).e_leaf_clusters -= chunk as u16;
        } else {
            // punch a hole in the middle; the tail becomes a new record
            let used = el.l_next_free_rec as usize;
            if used >= el.l_count as usize {
                return Err(Ocfs2Error::NoSpaceInTree(et.root_blkno));
            }
            let mut i = used;
            while i > idx + 1 {
                *el.rec_mut(i) = *el.rec(i - 1);
                i -= 1;
            }
            let tail_start = cur + chunk;
            let tail = ExtentRec {
                e_cpos: tail_start,
                e_leaf_clusters: (rec_end - tail_start) as u16,
                e_flags: rec.e_flags,
                e_blkno: rec.e_blkno + fs.clusters_to_blocks(tail_start - rec.e_cpos),
                ..Default::default()
            };
            *el.rec_mut(idx + 1) = tail;
            el.rec_mut(idx).e_leaf_clusters = (cur - rec.e_cpos) as u16;
            el.l_next_free_rec = (used + 1) as u16;
        }

        // interior records along the path shrink by the removed span
        for level in 0..path.items.len() - 1 {
            let child_blkno = path.items[level + 1].blkno;
            let el = path.items[level].list_mut();
            for i in 0..el.l_next_free_rec as usize {
                if el.rec(i).e_blkno == child_blkno {
                    let c = el.rec(i).int_clusters();
                    el.rec_mut(i).set_int_clusters(c - chunk);
                    break;
                }
            }
        }
        et.ops
            .update_clusters(&mut path.items[0].buf, -(chunk as i64));

        let leaf_emptied =
            path.items.len() > 1 && path.leaf().list().l_next_free_rec == 0;
        if leaf_emptied {
            reap_empty_leaf(fs, et, &mut path, leaf_blkno)?;
        } else {
            write_path(fs, et, &path)?;
        }

        cur += chunk;
        remaining -= chunk;
    }
    collapse_tree(fs, et)
}

/// Detaches the emptied leaf at the end of `path` from its parent and the
/// sibling chain, frees it, and bubbles the removal up through interior
/// nodes that empty in turn. Writes the surviving path.
fn reap_empty_leaf(
    fs: &FsHandle,
    et: &mut ExtentTree<'_>,
    path: &mut Path,
    leaf_blkno: u64,
) -> Result<(), Ocfs2Error> {
    // unlink from the sibling chain: walk from the leftmost leaf
    let next = cast_at::<ExtentBlock>(&path.leaf().buf, 0).h_next_leaf_blk;
    let mut prev_blkno = 0;
    {
        let leftmost = find_path(fs, et, 0)?;
        let mut walk = leftmost.leaf().blkno;
        while walk != 0 && walk != leaf_blkno {
            let buf = read_extent_block(fs, walk)?;
            let n = cast_at::<ExtentBlock>(&buf, 0).h_next_leaf_blk;
            if n == leaf_blkno {
                prev_blkno = walk;
                break;
            }
            walk = n;
        }
    }
    if prev_blkno != 0 {
        let mut prev_buf = read_extent_block(fs, prev_blkno)?;
        cast_at_mut::<ExtentBlock>(&mut prev_buf, 0).h_next_leaf_blk = next;
        write_extent_block(fs, prev_blkno, &prev_buf)?;
    }
    if et.ops.last_eb_blk(&path.items[0].buf) == leaf_blkno {
        et.ops.set_last_eb_blk(&mut path.items[0].buf, prev_blkno);
    }

    // drop the parent records of nodes that emptied, bottom-up
    let mut doomed = Vec::new();
    while path.items.len() > 1 {
        let node = path.items.last().unwrap();
        if node.list().l_next_free_rec != 0 {
            break;
        }
        let node_blkno = node.blkno;
        doomed.push(node_blkno);
        path.items.pop();

        let el = path.items.last_mut().unwrap().list_mut();
        let used = el.l_next_free_rec as usize;
        let mut idx = None;
        for i in 0..used {
            if el.rec(i).e_blkno == node_blkno {
                idx = Some(i);
                break;
            }
        }
        let Some(idx) = idx else {
            return Err(Ocfs2Error::CorruptedExtentTree(node_blkno));
        };
        for i in idx..used - 1 {
            *el.rec_mut(i) = *el.rec(i + 1);
        }
        *el.rec_mut(used - 1) = ExtentRec::default();
        el.l_next_free_rec = (used - 1) as u16;
    }

    write_path(fs, et, path)?;
    for blkno in doomed {
        alloc::free_extent_block(fs, blkno)?;
    }
    Ok(())
}

/// Shrinks the tree after removals: a root with a single child level is
/// folded onto that child, and an empty root returns to the zero-record
/// state.
fn collapse_tree(fs: &FsHandle, et: &mut ExtentTree<'_>) -> Result<(), Ocfs2Error> {
    loop {
        let (depth, used) = {
            let el = et.root_list();
            (el.l_tree_depth, el.l_next_free_rec as usize)
        };
        if depth == 0 {
            return Ok(());
        }
        if used == 0 {
            // the whole tree is gone
            et.root_list_mut().l_tree_depth = 0;
            et.ops.set_last_eb_blk(et.root_buf, 0);
            return et.ops.write_root(fs, et.root_blkno, et.root_buf);
        }
        if used > 1 {
            return Ok(());
        }

        // single child: fold it into the root if it fits
        let child_blkno = et.root_list().recs()[0].e_blkno;
        let child_buf = read_extent_block(fs, child_blkno)?;
        let cel = cast_at::<ExtentList>(&child_buf, EXTENT_BLOCK_LIST_OFF);
        let child_used = cel.l_next_free_rec as usize;
        let child_depth = cel.l_tree_depth;
        if child_used > et.root_list().l_count as usize {
            return Ok(());
        }
        let recs: Vec<ExtentRec> = cel.recs().to_vec();

        {
            let el = et.root_list_mut();
            let count = el.l_count as usize;
            el.l_tree_depth = child_depth;
            el.l_next_free_rec = child_used as u16;
            for i in 0..count {
                *el.rec_mut(i) = recs.get(i).copied().unwrap_or_default();
            }
        }
        if child_depth == 0 {
            et.ops.set_last_eb_blk(et.root_buf, 0);
        } else {
            // grandchildren are now parented by the root
            for rec in &recs {
                let mut buf = read_extent_block(fs, rec.e_blkno)?;
                cast_at_mut::<ExtentBlock>(&mut buf, 0).h_up_hdr_node_ptr = et.root_blkno;
                write_extent_block(fs, rec.e_blkno, &buf)?;
            }
        }
        et.ops.write_root(fs, et.root_blkno, et.root_buf)?;
        alloc::free_extent_block(fs, child_blkno)?;
    }
}

/// Splits the record covering `[cpos, cpos + len)` and applies flag changes
/// to the central piece.
pub fn change_extent_flag(
    fs: &FsHandle,
    et: &mut ExtentTree<'_>,
    cpos: u32,
    len: u32,
    blkno: u64,
    set_flags: u8,
    clear_flags: u8,
) -> Result<(), Ocfs2Error> {
    if len == 0 {
        return Err(Ocfs2Error::InvalidArgument("bad extent length"));
    }
    let mut path = find_path(fs, et, cpos)?;
    let leaf_blkno = path.leaf().blkno;
    let el = path.leaf_mut().list_mut();
    let idx = search_leaf(el, cpos).ok_or(Ocfs2Error::CorruptedExtentTree(leaf_blkno))?;

    let rec = *el.rec(idx);
    let rec_end = rec.e_cpos + rec.e_leaf_clusters as u32;
    if cpos + len > rec_end {
        return Err(Ocfs2Error::InvalidArgument("range spans several extents"));
    }
    if rec.e_blkno + fs.clusters_to_blocks(cpos - rec.e_cpos) != blkno {
        return Err(Ocfs2Error::InvalidArgument("extent does not map there"));
    }

    let head = cpos - rec.e_cpos;
    let tail = rec_end - (cpos + len);
    let extra = (head > 0) as usize + (tail > 0) as usize;
    let used = el.l_next_free_rec as usize;
    if used + extra > el.l_count as usize {
        return Err(Ocfs2Error::NoSpaceInTree(et.root_blkno));
    }

    // spread the pieces out
    let mut i = used + extra;
    while i > idx + extra {
        i -= 1;
        *el.rec_mut(i) = *el.rec(i - extra);
    }
    el.l_next_free_rec = (used + extra) as u16;

    let mut at = idx;
    if head > 0 {
        let r = el.rec_mut(at);
        r.e_cpos = rec.e_cpos;
        r.e_blkno = rec.e_blkno;
        r.e_leaf_clusters = head as u16;
        r.e_flags = rec.e_flags;
        at += 1;
    }
    {
        let r = el.rec_mut(at);
        r.e_cpos = cpos;
        r.e_blkno = blkno;
        r.e_leaf_clusters = len as u16;
        r.e_flags = (rec.e_flags | set_flags) & !clear_flags;
    }
    if tail > 0 {
        let r = el.rec_mut(at + 1);
        r.e_cpos = cpos + len;
        r.e_blkno = rec.e_blkno + fs.clusters_to_blocks(head + len);
        r.e_leaf_clusters = tail as u16;
        r.e_flags = rec.e_flags;
    }

    // merge the pieces that ended up identical to their neighbours
    merge_leaf(fs, et, path.leaf_mut().list_mut());
    write_path(fs, et, &path)
}

/// Greedily merges adjacent contiguous records of a leaf list.
fn merge_leaf(fs: &FsHandle, et: &ExtentTree<'_>, el: &mut ExtentList) {
    let mut i = 0;
    while (i as usize) + 1 < el.l_next_free_rec as usize {
        let left = *el.rec(i);
        let right = *el.rec(i as usize + 1);
        let combined = left.e_leaf_clusters as u64 + right.e_leaf_clusters as u64;
        if et.ops.extent_contig(fs, &left, &right)
            && combined <= u16::MAX as u64
            && (et.max_leaf_clusters == 0 || combined <= et.max_leaf_clusters as u64)
        {
            el.rec_mut(i).e_leaf_clusters += right.e_leaf_clusters;
            let used = el.l_next_free_rec as usize;
            for j in (i as usize + 1)..used - 1 {
                *el.rec_mut(j) = *el.rec(j + 1);
            }
            *el.rec_mut(used - 1) = ExtentRec::default();
            el.l_next_free_rec -= 1;
        } else {
            i += 1;
        }
    }
}

/// Maps logical block `vblk` of an inode to its physical block.
///
/// Returns `None` for holes and for inline inodes, which have no mapped
/// blocks at all.
pub fn extent_map_block(
    fs: &FsHandle,
    di_buf: &[u8],
    vblk: u64,
) -> Result<Option<u64>, Ocfs2Error> {
    let di = cast_at::<Dinode>(di_buf, 0);
    if !di.has_extents() {
        return Ok(None);
    }
    let bpc = fs.blocks_per_cluster() as u64;
    let cpos = (vblk / bpc) as u32;

    let el = inode_extent_list(di_buf);
    let (leaf_buf, leaf_off);
    let owned;
    if el.l_tree_depth > 0 {
        owned = tree_find_leaf(fs, di_buf, INODE_BODY_OFF, di.i_blkno, cpos)?;
        leaf_buf = owned.as_slice();
        leaf_off = EXTENT_BLOCK_LIST_OFF;
    } else {
        leaf_buf = di_buf;
        leaf_off = INODE_BODY_OFF;
    }
    let leaf = cast_at::<ExtentList>(leaf_buf, leaf_off);
    match search_leaf(leaf, cpos) {
        Some(i) => {
            let rec = leaf.recs()[i];
            let off = vblk - fs.clusters_to_blocks(rec.e_cpos);
            Ok(Some(rec.e_blkno + off))
        }
        None => Ok(None),
    }
}

/// Continuation decision of an iteration callback.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IterAction {
    /// Keep going.
    Continue,
    /// Stop cleanly.
    Abort,
}

/// Visits every record of the tree rooted at `list_off` of `root_buf` in
/// position order, interior records right before the subtree they head.
///
/// The callback receives the record and the depth of the list holding it.
pub fn extent_tree_iterate(
    fs: &FsHandle,
    root_buf: &[u8],
    list_off: usize,
    root_blkno: u64,
    func: &mut dyn FnMut(&ExtentRec, u16) -> Result<IterAction, Ocfs2Error>,
) -> Result<(), Ocfs2Error> {
    let root_depth = cast_at::<ExtentList>(root_buf, list_off).l_tree_depth;
    if root_depth as usize >= MAX_PATH_DEPTH {
        return Err(Ocfs2Error::CorruptedExtentTree(root_blkno));
    }
    let root_recs: Vec<ExtentRec> = cast_at::<ExtentList>(root_buf, list_off).recs().to_vec();
    let mut root_idx = 0;

    // an explicit (block, cursor) stack replaces recursion
    let mut frames: Vec<(Vec<u8>, usize)> = Vec::new();
    loop {
        let exhausted = match frames.last() {
            Some((buf, idx)) => {
                let el = cast_at::<ExtentList>(buf.as_slice(), EXTENT_BLOCK_LIST_OFF);
                *idx >= el.l_next_free_rec as usize
            }
            None => false,
        };
        if exhausted {
            frames.pop();
            continue;
        }

        let (rec, depth) = if let Some((buf, idx)) = frames.last_mut() {
            let el = cast_at::<ExtentList>(buf.as_slice(), EXTENT_BLOCK_LIST_OFF);
            let rec = el.recs()[*idx];
            *idx += 1;
            (rec, el.l_tree_depth)
        } else if root_idx < root_recs.len() {
            let rec = root_recs[root_idx];
            root_idx += 1;
            (rec, root_depth)
        } else {
            return Ok(());
        };

        if func(&rec, depth)? == IterAction::Abort {
            return Ok(());
        }
        if depth > 0 {
            frames.push((read_extent_block(fs, rec.e_blkno)?, 0));
        }
    }
}

/// Visits the data blocks of an inode in logical order.
///
/// The callback receives the physical block and the logical block count.
pub fn block_iterate(
    fs: &FsHandle,
    di_buf: &[u8],
    func: &mut dyn FnMut(u64, u64) -> Result<IterAction, Ocfs2Error>,
) -> Result<(), Ocfs2Error> {
    let di = cast_at::<Dinode>(di_buf, 0);
    let bpc = fs.blocks_per_cluster() as u64;
    extent_tree_iterate(
        fs,
        di_buf,
        INODE_BODY_OFF,
        di.i_blkno,
        &mut |rec, depth| {
            if depth > 0 {
                return Ok(IterAction::Continue);
            }
            let vstart = rec.e_cpos as u64 * bpc;
            for i in 0..rec.e_leaf_clusters as u64 * bpc {
                if func(rec.e_blkno + i, vstart + i)? == IterAction::Abort {
                    return Ok(IterAction::Abort);
                }
            }
            Ok(IterAction::Continue)
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::test_support::scratch_volume;
    use crate::fs::OpenFlags;

    /// Creates a plain file inode to hang a tree off.
    fn test_inode(fs: &FsHandle) -> u64 {
        let got = alloc::new_inode_block(fs).unwrap();
        let mut buf = fs.alloc_block();
        {
            let di = cast_at_mut::<Dinode>(&mut buf, 0);
            set_signature(&mut di.i_signature, INODE_SIGNATURE);
            di.i_blkno = got.blkno;
            di.i_suballoc_slot = got.slot;
            di.i_suballoc_bit = got.bit;
            di.i_mode = 0o100644;
            di.i_links_count = 1;
            di.i_flags = InodeFlags::VALID.bits();
        }
        {
            let el = inode_extent_list_mut(&mut buf);
            el.l_count = extent_recs_per_inode(fs.blocksize);
        }
        inode::write_inode(fs, got.blkno, &buf).unwrap();
        got.blkno
    }

    /// Collects the depth-0 records of the tree in walk order and checks
    /// the structural invariants.
    fn check_tree(fs: &FsHandle, ino: u64) -> Vec<ExtentRec> {
        let di_buf = inode::read_inode(fs, ino).unwrap();
        let mut leaves = Vec::new();
        extent_tree_iterate(fs, &di_buf, INODE_BODY_OFF, ino, &mut |rec, depth| {
            if depth == 0 && rec.e_leaf_clusters != 0 {
                leaves.push(*rec);
            }
            Ok(IterAction::Continue)
        })
        .unwrap();
        leaves.sort_by_key(|r| r.e_cpos);

        for pair in leaves.windows(2) {
            let end = pair[0].e_cpos + pair[0].e_leaf_clusters as u32;
            assert!(end <= pair[1].e_cpos, "records overlap or are unsorted");
            assert!(
                !default_extent_contig(fs, &pair[0], &pair[1]),
                "adjacent records left unmerged"
            );
        }
        let total: u32 = leaves.iter().map(|r| r.e_leaf_clusters as u32).sum();
        assert_eq!(total, { cast_at::<Dinode>(&di_buf, 0).i_clusters });
        leaves
    }

    #[test]
    fn insert_lookup_merge() {
        let tmp = scratch_volume(16 << 20, 4096, 4096);
        let fs = FsHandle::open(tmp.path(), OpenFlags::RW, 0, 0).unwrap();
        let ino = test_inode(&fs);

        let (blkno, got) = alloc::new_clusters(&fs, 4, 4).unwrap();
        assert_eq!(got, 4);

        // two contiguous halves merge into a single record
        let mut di_buf = inode::read_inode(&fs, ino).unwrap();
        {
            let mut et = ExtentTree::dinode(&fs, &mut di_buf, ino);
            insert_extent(&fs, &mut et, 0, blkno, 2, 0).unwrap();
            insert_extent(&fs, &mut et, 2, blkno + fs.clusters_to_blocks(2), 2, 0).unwrap();
        }

        let di_buf = inode::read_inode(&fs, ino).unwrap();
        let el = inode_extent_list(&di_buf);
        assert_eq!({ el.l_next_free_rec }, 1);
        assert_eq!({ el.recs()[0].e_leaf_clusters }, 4);
        assert_eq!({ cast_at::<Dinode>(&di_buf, 0).i_clusters }, 4);

        // every block of the range maps
        for vblk in 0..fs.clusters_to_blocks(4) {
            assert_eq!(
                extent_map_block(&fs, &di_buf, vblk).unwrap(),
                Some(blkno + vblk)
            );
        }
        assert_eq!(
            extent_map_block(&fs, &di_buf, fs.clusters_to_blocks(4)).unwrap(),
            None
        );
        check_tree(&fs, ino);
    }

    #[test]
    fn split_grows_and_remove_collapses() {
        // small blocks so the root list overflows quickly
        let tmp = scratch_volume(64 << 20, 512, 4096);
        let fs = FsHandle::open(tmp.path(), OpenFlags::RW, 0, 0).unwrap();
        let ino = test_inode(&fs);

        let count = extent_recs_per_inode(fs.blocksize) as u32 + 2;
        // allocate forward, insert backward-by-block so nothing merges
        let mut blknos = Vec::new();
        for _ in 0..count {
            let (blkno, got) = alloc::new_clusters(&fs, 1, 1).unwrap();
            assert_eq!(got, 1);
            blknos.push(blkno);
        }
        blknos.reverse();

        let mut di_buf = inode::read_inode(&fs, ino).unwrap();
        for (k, blkno) in blknos.iter().enumerate() {
            let mut et = ExtentTree::dinode(&fs, &mut di_buf, ino);
            insert_extent(&fs, &mut et, k as u32, *blkno, 1, 0).unwrap();
        }

        // the root list overflowed exactly once: one level, one leaf
        let di_buf = inode::read_inode(&fs, ino).unwrap();
        let el = inode_extent_list(&di_buf);
        assert_eq!({ el.l_tree_depth }, 1);
        assert_eq!({ el.l_next_free_rec }, 1);
        let leaves = check_tree(&fs, ino);
        assert_eq!(leaves.len(), count as usize);

        // removing everything shrinks the tree back to an empty leaf root
        let mut di_buf = inode::read_inode(&fs, ino).unwrap();
        {
            let mut et = ExtentTree::dinode(&fs, &mut di_buf, ino);
            remove_extent(&fs, &mut et, 0, count).unwrap();
        }
        let di_buf = inode::read_inode(&fs, ino).unwrap();
        let el = inode_extent_list(&di_buf);
        assert_eq!({ el.l_tree_depth }, 0);
        assert_eq!({ el.l_next_free_rec }, 0);
        assert_eq!({ cast_at::<Dinode>(&di_buf, 0).i_clusters }, 0);
        assert_eq!({ cast_at::<Dinode>(&di_buf, 0).i_last_eb_blk }, 0);
    }

    #[test]
    fn remove_middle_splits_record() {
        let tmp = scratch_volume(16 << 20, 4096, 4096);
        let fs = FsHandle::open(tmp.path(), OpenFlags::RW, 0, 0).unwrap();
        let ino = test_inode(&fs);

        let (blkno, _) = alloc::new_clusters(&fs, 8, 8).unwrap();
        let mut di_buf = inode::read_inode(&fs, ino).unwrap();
        {
            let mut et = ExtentTree::dinode(&fs, &mut di_buf, ino);
            insert_extent(&fs, &mut et, 0, blkno, 8, 0).unwrap();
            remove_extent(&fs, &mut et, 3, 2).unwrap();
        }
        let di_buf = inode::read_inode(&fs, ino).unwrap();
        let el = inode_extent_list(&di_buf);
        assert_eq!({ el.l_next_free_rec }, 2);
        assert_eq!({ el.recs()[0].e_cpos }, 0);
        assert_eq!({ el.recs()[0].e_leaf_clusters }, 3);
        assert_eq!({ el.recs()[1].e_cpos }, 5);
        assert_eq!({ el.recs()[1].e_leaf_clusters }, 3);
        assert_eq!({ el.recs()[1].e_blkno }, blkno + fs.clusters_to_blocks(5));
        assert_eq!({ cast_at::<Dinode>(&di_buf, 0).i_clusters }, 6);
        assert_eq!(
            extent_map_block(&fs, &di_buf, fs.clusters_to_blocks(3)).unwrap(),
            None
        );
    }

    #[test]
    fn flag_change_splits_then_merges_back() {
        let tmp = scratch_volume(16 << 20, 4096, 4096);
        let fs = FsHandle::open(tmp.path(), OpenFlags::RW, 0, 0).unwrap();
        let ino = test_inode(&fs);

        let (blkno, _) = alloc::new_clusters(&fs, 6, 6).unwrap();
        let mut di_buf = inode::read_inode(&fs, ino).unwrap();
        {
            let mut et = ExtentTree::dinode(&fs, &mut di_buf, ino);
            insert_extent(&fs, &mut et, 0, blkno, 6, 0).unwrap();
            change_extent_flag(
                &fs,
                &mut et,
                2,
                2,
                blkno + fs.clusters_to_blocks(2),
                EXT_UNWRITTEN,
                0,
            )
            .unwrap();
        }
        let di_buf = inode::read_inode(&fs, ino).unwrap();
        let el = inode_extent_list(&di_buf);
        assert_eq!({ el.l_next_free_rec }, 3);
        assert_eq!({ el.recs()[1].e_flags }, EXT_UNWRITTEN);
        assert_eq!({ el.recs()[0].e_flags }, 0);

        // clearing the flag lets the three pieces merge again
        let mut di_buf = inode::read_inode(&fs, ino).unwrap();
        {
            let mut et = ExtentTree::dinode(&fs, &mut di_buf, ino);
            change_extent_flag(
                &fs,
                &mut et,
                2,
                2,
                blkno + fs.clusters_to_blocks(2),
                0,
                EXT_UNWRITTEN,
            )
            .unwrap();
        }
        let di_buf = inode::read_inode(&fs, ino).unwrap();
        let el = inode_extent_list(&di_buf);
        assert_eq!({ el.l_next_free_rec }, 1);
        assert_eq!({ el.recs()[0].e_leaf_clusters }, 6);
        check_tree(&fs, ino);
    }
}
