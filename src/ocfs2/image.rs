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

//! Metadata image files.
//!
//! An image captures every metadata block of a filesystem, either packed
//! (header, the marked blocks in ascending order, then the bitmap) or raw
//! (a sparse file with blocks at their native offsets). A handle opened on
//! a packed image loads the bitmap and translates block numbers through
//! it; reads of unmarked blocks fail like reads of a bad device.

use crate::byteorder::cpu_is_little_endian;
use crate::bitmap;
use crate::dir_indexed;
use crate::error::Ocfs2Error;
use crate::extent;
use crate::fs::FsHandle;
use crate::inode;
use crate::io::IoChannel;
use crate::ondisk::*;
use crate::util::cast_at;
use crate::util::cast_at_mut;
use crate::util::get_timestamp;
use crate::xattr;
use log::warn;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::mem::size_of;
use std::os::unix::fs::FileExt;

/// Magic of an image file header.
pub const IMAGE_MAGIC: u32 = 0x72a3d45f;
/// ASCII tag following the magic.
pub const IMAGE_DESC: &[u8] = b"OCFS2 IMAGE";
/// Version written to fresh images.
pub const IMAGE_VERSION: u64 = 1;
/// Highest version accepted on read.
pub const IMAGE_MAX_VERSION: u64 = 4;
/// Size of one bitmap block in the image file.
pub const IMAGE_BITMAP_BLOCKSIZE: u64 = 4096;
/// Filesystem blocks mapped by one bitmap block.
pub const IMAGE_BITS_IN_BLOCK: u64 = IMAGE_BITMAP_BLOCKSIZE * 8;

/// The on-disk image header, stored in the image's first filesystem block.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct ImageHeader {
    /// Magic (`IMAGE_MAGIC`).
    pub hdr_magic: u32,
    /// Time of image creation.
    pub hdr_timestamp: u32,
    /// ASCII tag (`OCFS2 IMAGE`).
    pub hdr_magic_desc: [u8; 16],
    /// Image format version.
    pub hdr_version: u64,
    /// Blocks in the filesystem.
    pub hdr_fsblkcnt: u64,
    /// Filesystem block size.
    pub hdr_fsblksz: u64,
    /// Filesystem blocks stored in the image.
    pub hdr_imgblkcnt: u64,
    /// Bitmap block size.
    pub hdr_bmpblksz: u64,
    /// Entries used in the superblock list.
    pub hdr_superblkcnt: u64,
    /// Filesystem blocks of the superblock and its backups.
    pub hdr_superblocks: [u64; MAX_BACKUP_SUPERBLOCKS],
}

const _: () = assert!(size_of::<ImageHeader>() == 120);

/// Swaps an image header between disk and host order. Self-inverse.
pub fn swap_image_header(hdr: &mut ImageHeader) {
    if cpu_is_little_endian() {
        return;
    }
    let mut superblocks = hdr.hdr_superblocks;
    for blkno in superblocks.iter_mut() {
        *blkno = blkno.swap_bytes();
    }
    hdr.hdr_superblocks = superblocks;
    hdr.hdr_magic = hdr.hdr_magic.swap_bytes();
    hdr.hdr_timestamp = hdr.hdr_timestamp.swap_bytes();
    hdr.hdr_version = hdr.hdr_version.swap_bytes();
    hdr.hdr_fsblkcnt = hdr.hdr_fsblkcnt.swap_bytes();
    hdr.hdr_fsblksz = hdr.hdr_fsblksz.swap_bytes();
    hdr.hdr_imgblkcnt = hdr.hdr_imgblkcnt.swap_bytes();
    hdr.hdr_bmpblksz = hdr.hdr_bmpblksz.swap_bytes();
    hdr.hdr_superblkcnt = hdr.hdr_superblkcnt.swap_bytes();
}

/// The block bitmap of an image, with cumulative ranks per bitmap block.
pub struct ImageState {
    /// Filesystem block size.
    pub fs_blocksize: u64,
    /// Blocks in the filesystem.
    pub fs_blockcount: u64,
    /// Marked blocks (filled by a scan or loaded from a header).
    pub image_blockcount: u64,
    /// The superblock and its backups, as filesystem blocks.
    pub superblocks: Vec<u64>,
    /// Bitmap chunks of [`IMAGE_BITMAP_BLOCKSIZE`] bytes each.
    chunks: Vec<Vec<u8>>,
    /// Bits set in all chunks before each chunk.
    set_counts: Vec<u64>,
}

impl ImageState {
    /// Creates an all-clear bitmap covering `fs_blockcount` blocks.
    pub fn alloc(fs_blocksize: u64, fs_blockcount: u64) -> Self {
        let nchunks = (fs_blockcount - 1) / IMAGE_BITS_IN_BLOCK + 1;
        Self {
            fs_blocksize,
            fs_blockcount,
            image_blockcount: 0,
            superblocks: Vec::new(),
            chunks: (0..nchunks)
                .map(|_| vec![0u8; IMAGE_BITMAP_BLOCKSIZE as usize])
                .collect(),
            set_counts: vec![0; nchunks as usize],
        }
    }

    /// Loads the header and bitmap of an image file opened on `io`.
    pub fn load(io: &IoChannel) -> Result<Self, Ocfs2Error> {
        let mut hdr_buf = vec![0u8; size_of::<ImageHeader>()];
        io.file().read_exact_at(&mut hdr_buf, 0)?;
        let mut hdr = *cast_at::<ImageHeader>(&hdr_buf, 0);
        swap_image_header(&mut hdr);

        if hdr.hdr_magic != IMAGE_MAGIC {
            let magic = hdr.hdr_magic;
            return Err(Ocfs2Error::BadMagic(magic));
        }
        if !hdr.hdr_magic_desc.starts_with(IMAGE_DESC) {
            return Err(Ocfs2Error::BadMagic(0));
        }
        if hdr.hdr_version == 0 || hdr.hdr_version > IMAGE_MAX_VERSION {
            return Err(Ocfs2Error::UnsupportedFeature(hdr.hdr_version as u32));
        }
        if hdr.hdr_bmpblksz != IMAGE_BITMAP_BLOCKSIZE {
            return Err(Ocfs2Error::CorruptedBlock(0));
        }

        let mut state = Self::alloc(hdr.hdr_fsblksz, hdr.hdr_fsblkcnt);
        state.image_blockcount = hdr.hdr_imgblkcnt;
        let hdr_superblocks = hdr.hdr_superblocks;
        state.superblocks = hdr_superblocks[..hdr.hdr_superblkcnt as usize].to_vec();

        // bitmap blocks sit after the header block and the packed blocks
        let mut off = (hdr.hdr_imgblkcnt + 1) * hdr.hdr_fsblksz;
        for chunk in state.chunks.iter_mut() {
            io.file().read_exact_at(chunk, off)?;
            off += IMAGE_BITMAP_BLOCKSIZE;
        }
        state.update_set_counts();
        Ok(state)
    }

    /// Recomputes the cumulative rank of each bitmap chunk.
    pub fn update_set_counts(&mut self) {
        let mut total = 0;
        for (i, chunk) in self.chunks.iter().enumerate() {
            self.set_counts[i] = total;
            total += bitmap::count_set(chunk, 0, IMAGE_BITS_IN_BLOCK as usize) as u64;
        }
        self.image_blockcount = total;
    }

    /// Marks filesystem block `blkno` as present.
    pub fn mark(&mut self, blkno: u64) {
        if blkno >= self.fs_blockcount {
            return;
        }
        let chunk = (blkno / IMAGE_BITS_IN_BLOCK) as usize;
        bitmap::set_bit(&mut self.chunks[chunk], (blkno % IMAGE_BITS_IN_BLOCK) as usize);
    }

    /// Tells whether filesystem block `blkno` is present.
    pub fn test_bit(&self, blkno: u64) -> bool {
        let chunk = (blkno / IMAGE_BITS_IN_BLOCK) as usize;
        if chunk >= self.chunks.len() {
            return false;
        }
        bitmap::test_bit(&self.chunks[chunk], (blkno % IMAGE_BITS_IN_BLOCK) as usize)
    }

    /// Translates a filesystem block into its image block: one past the
    /// count of marked blocks below it, the header holding image block 0.
    pub fn image_blkno(&self, blkno: u64) -> u64 {
        let chunk = (blkno / IMAGE_BITS_IN_BLOCK) as usize;
        let bit = (blkno % IMAGE_BITS_IN_BLOCK) as usize;
        let below = bitmap::count_set(&self.chunks[chunk], 0, bit) as u64;
        self.set_counts[chunk] + below + 1
    }

    /// Picks the superblock an image open should validate: the last entry
    /// of the header's backup list, or the primary when the list is empty.
    pub fn superblock_to_validate(&self) -> u64 {
        self.superblocks.last().copied().unwrap_or(SUPER_BLOCK_BLKNO)
    }

    /// Returns the bitmap chunks.
    pub fn chunks(&self) -> &[Vec<u8>] {
        &self.chunks
    }
}

/// How deeply a chain allocator's groups are walked during a scan.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ChainDump {
    /// Do not walk the chains at all (the global bitmap).
    SkipChains,
    /// Mark the blocks covered by each group.
    MarkBlocks,
    /// Treat every set bit as an inode and descend into it.
    DescendInodes,
}

/// A metadata scan in progress.
struct Scan<'a> {
    fs: &'a FsHandle,
    state: ImageState,
    global_bitmap_inode: u64,
    global_inode_alloc: u64,
    global_inode_traversed: bool,
    inode_allocs: Vec<u64>,
}

impl<'a> Scan<'a> {
    fn mark_extent_tree(&mut self, root_buf: &[u8], list_off: usize, blkno: u64) -> Result<(), Ocfs2Error> {
        let bpc = self.fs.blocks_per_cluster() as u64;
        let mut leaves = Vec::new();
        extent::extent_tree_iterate(self.fs, root_buf, list_off, blkno, &mut |rec, depth| {
            if depth > 0 {
                self.state.mark(rec.e_blkno);
            } else {
                leaves.push((rec.e_blkno, rec.e_leaf_clusters as u64));
            }
            Ok(extent::IterAction::Continue)
        })?;
        for (start, clusters) in leaves {
            for i in 0..clusters * bpc {
                self.state.mark(start + i);
            }
        }
        Ok(())
    }

    fn traverse_dx_root(&mut self, blkno: u64) -> Result<(), Ocfs2Error> {
        self.state.mark(blkno);
        let buf = dir_indexed::read_dx_root(self.fs, blkno)?;
        let dr = cast_at::<DxRootBlock>(&buf, 0);
        if dr.dr_flags & DX_FLAG_INLINE == 0 {
            self.mark_extent_tree(&buf, DX_ROOT_BODY_OFF, blkno)?;
        }
        Ok(())
    }

    fn traverse_xattr_block(&mut self, blkno: u64) -> Result<(), Ocfs2Error> {
        self.state.mark(blkno);
        let buf = xattr::read_xattr_block(self.fs, blkno)?;
        let xb = cast_at::<XattrBlock>(&buf, 0);
        if xb.xb_flags & XATTR_INDEXED != 0 {
            let list_off = XATTR_BODY_OFF + std::mem::offset_of!(XattrTreeRoot, xt_list);
            self.mark_extent_tree(&buf, list_off, blkno)?;
        }
        Ok(())
    }

    fn traverse_chains(&mut self, di_buf: &[u8], dump: ChainDump) -> Result<(), Ocfs2Error> {
        let cl = inode_chain_list(di_buf);
        let heads: Vec<u64> = cl.recs().iter().map(|r| r.c_blkno).collect();
        for head in heads {
            let mut gd_blkno = head;
            while gd_blkno != 0 {
                self.state.mark(gd_blkno);
                let gd_buf = crate::alloc::read_group_desc(self.fs, gd_blkno)?;
                let gd = cast_at::<GroupDesc>(&gd_buf, 0);
                if dump != ChainDump::SkipChains {
                    self.traverse_group(&gd_buf, dump)?;
                }
                gd_blkno = gd.bg_next_group;
            }
        }
        Ok(())
    }

    fn traverse_group(&mut self, gd_buf: &[u8], dump: ChainDump) -> Result<(), Ocfs2Error> {
        let gd = cast_at::<GroupDesc>(gd_buf, 0);
        let start = gd.bg_blkno;
        let bits = gd.bg_bits;
        for i in 1..bits as u64 {
            let blkno = start + i;
            if dump == ChainDump::DescendInodes && bitmap::test_bit(gd.bitmap(), i as usize) {
                self.traverse_inode(blkno)?;
            } else {
                self.state.mark(blkno);
            }
        }
        Ok(())
    }

    fn traverse_inode(&mut self, inode: u64) -> Result<(), Ocfs2Error> {
        self.state.mark(inode);
        let di_buf = inode::read_inode(self.fs, inode)?;
        let di = cast_at::<Dinode>(&di_buf, 0);
        let flags = InodeFlags::from_bits_truncate(di.i_flags);
        let dyn_features = DynFeatures::from_bits_truncate(di.i_dyn_features);

        // plain files are not scanned; their extent blocks surface through
        // the extent allocators, and only an xattr tree needs a visit
        if !di.is_dir()
            && !flags.contains(InodeFlags::SYSTEM)
            && !dyn_features.contains(DynFeatures::HAS_XATTR)
        {
            return Ok(());
        }

        let mut dump = ChainDump::MarkBlocks;
        if inode == self.global_bitmap_inode {
            dump = ChainDump::SkipChains;
        }
        if self.inode_allocs.contains(&inode) {
            dump = ChainDump::DescendInodes;
        }
        if inode == self.global_inode_alloc {
            if self.global_inode_traversed {
                return Ok(());
            }
            dump = ChainDump::DescendInodes;
            self.global_inode_traversed = true;
        }

        if flags.contains(InodeFlags::LOCAL_ALLOC) || flags.contains(InodeFlags::DEALLOC) {
            // reserved and deleted space carries no metadata worth keeping
            return Ok(());
        }
        if flags.contains(InodeFlags::CHAIN) {
            return self.traverse_chains(&di_buf, dump);
        }
        if dyn_features.contains(DynFeatures::HAS_XATTR) && di.i_xattr_loc != 0 {
            self.traverse_xattr_block(di.i_xattr_loc)?;
        }
        if di.is_dir() && dyn_features.contains(DynFeatures::INDEXED_DIR) && di.i_dx_root != 0 {
            // pick up as much of the index as possible even when the
            // superblock no longer advertises the feature
            let supports = self.fs.with_super(|sb| {
                FeatureIncompat::from_bits_truncate(sb.s_feature_incompat)
                    .contains(FeatureIncompat::INDEXED_DIRS)
            });
            match self.traverse_dx_root(di.i_dx_root) {
                Ok(()) => {}
                Err(e) if supports => return Err(e),
                Err(e) => warn!("skipping damaged directory index of inode {inode}: {e}"),
            }
        }
        if di.has_extents() {
            self.mark_extent_tree(&di_buf, INODE_BODY_OFF, inode)?;
        }
        Ok(())
    }
}

/// Scans every reachable metadata block of `fs` into an image bitmap.
pub fn scan_metadata(fs: &FsHandle) -> Result<ImageState, Ocfs2Error> {
    let mut state = ImageState::alloc(fs.blocksize as u64, fs.blocks);

    // the superblock, its backups and everything before the first cluster
    // group
    let has_backups = fs.with_super(|sb| {
        FeatureCompat::from_bits_truncate(sb.s_feature_compat)
            .contains(FeatureCompat::BACKUP_SB)
    });
    state.superblocks.push(SUPER_BLOCK_BLKNO);
    if has_backups {
        for off in fs.backup_super_offsets() {
            let blkno = off / fs.blocksize as u64;
            state.mark(blkno);
            state.superblocks.push(blkno);
        }
    }
    let mut blkno = 0;
    while blkno <= fs.first_cg_blkno {
        state.mark(blkno);
        blkno += 1;
    }

    let global_bitmap_inode = fs.lookup_system_inode(SystemFileType::GlobalBitmap, 0)?;
    let global_inode_alloc = fs.lookup_system_inode(SystemFileType::GlobalInodeAlloc, 0)?;
    let max_slots = fs.with_super(|sb| sb.s_max_slots);
    let mut inode_allocs = Vec::new();
    for slot in 0..max_slots {
        inode_allocs.push(fs.lookup_system_inode(SystemFileType::InodeAlloc, slot)?);
    }

    let mut scan = Scan {
        fs,
        state,
        global_bitmap_inode,
        global_inode_alloc,
        global_inode_traversed: false,
        inode_allocs,
    };
    // the global inode allocator reaches every metadata inode
    scan.traverse_inode(global_inode_alloc)?;

    let mut state = scan.state;
    state.update_set_counts();
    Ok(state)
}

/// Writes a packed image: the header block, the marked blocks in ascending
/// order, then the bitmap.
pub fn write_packed_image(
    fs: &FsHandle,
    state: &ImageState,
    out: &mut dyn Write,
) -> Result<(), Ocfs2Error> {
    let blocksize = fs.blocksize as usize;
    let mut hdr_blk = vec![0u8; blocksize];
    {
        let hdr = cast_at_mut::<ImageHeader>(&mut hdr_blk, 0);
        hdr.hdr_magic = IMAGE_MAGIC;
        hdr.hdr_timestamp = get_timestamp() as u32;
        hdr.hdr_magic_desc[..IMAGE_DESC.len()].copy_from_slice(IMAGE_DESC);
        hdr.hdr_version = IMAGE_VERSION;
        hdr.hdr_fsblkcnt = state.fs_blockcount;
        hdr.hdr_fsblksz = state.fs_blocksize;
        hdr.hdr_imgblkcnt = state.image_blockcount;
        hdr.hdr_bmpblksz = IMAGE_BITMAP_BLOCKSIZE;
        hdr.hdr_superblkcnt = state.superblocks.len() as u64;
        for (i, blkno) in state.superblocks.iter().enumerate() {
            hdr.hdr_superblocks[i] = *blkno;
        }
        swap_image_header(hdr);
    }
    out.write_all(&hdr_blk)?;

    let mut buf = fs.alloc_block();
    for blkno in 0..state.fs_blockcount {
        if state.test_bit(blkno) {
            fs.read_blocks(blkno, 1, &mut buf)?;
            out.write_all(&buf)?;
        }
    }
    for chunk in state.chunks() {
        out.write_all(chunk)?;
    }
    Ok(())
}

/// Writes a raw (sparse) image: marked blocks at their native offsets.
///
/// On a seekable output the holes stay holes; a stream gets them as
/// zeros.
pub fn write_raw_image(
    fs: &FsHandle,
    state: &ImageState,
    out: &mut std::fs::File,
) -> Result<(), Ocfs2Error> {
    let can_seek = out.seek(SeekFrom::Current(0)).is_ok();
    let blocksize = fs.blocksize as u64;
    let mut buf = fs.alloc_block();

    if can_seek {
        for blkno in 0..state.fs_blockcount {
            if state.test_bit(blkno) {
                fs.read_blocks(blkno, 1, &mut buf)?;
                out.write_all_at(&buf, blkno * blocksize)?;
            }
        }
        return Ok(());
    }

    // stream zeros through the holes
    let zero = vec![0u8; blocksize as usize];
    for blkno in 0..state.fs_blockcount {
        if state.test_bit(blkno) {
            fs.read_blocks(blkno, 1, &mut buf)?;
            out.write_all(&buf)?;
        } else {
            out.write_all(&zero)?;
        }
    }
    Ok(())
}

/// Reads the header of an image file, for tools printing a summary.
pub fn read_image_header(file: &mut std::fs::File) -> Result<ImageHeader, Ocfs2Error> {
    let mut hdr_buf = vec![0u8; size_of::<ImageHeader>()];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut hdr_buf)?;
    let mut hdr = *cast_at::<ImageHeader>(&hdr_buf, 0);
    swap_image_header(&mut hdr);
    if hdr.hdr_magic != IMAGE_MAGIC {
        let magic = hdr.hdr_magic;
        return Err(Ocfs2Error::BadMagic(magic));
    }
    Ok(hdr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        assert_eq!(size_of::<ImageHeader>(), 120);
    }

    #[test]
    fn rank_translation() {
        let mut state = ImageState::alloc(4096, 100_000);
        for blkno in [0u64, 2, 5, 40_000, 70_000] {
            state.mark(blkno);
        }
        state.update_set_counts();
        assert_eq!(state.image_blockcount, 5);

        // ranks count marked blocks strictly below, the header is image
        // block 0
        assert_eq!(state.image_blkno(0), 1);
        assert_eq!(state.image_blkno(2), 2);
        assert_eq!(state.image_blkno(5), 3);
        assert_eq!(state.image_blkno(40_000), 4);
        assert_eq!(state.image_blkno(70_000), 5);

        assert!(state.test_bit(2));
        assert!(!state.test_bit(3));
    }

    #[test]
    fn bitmap_chunk_boundaries() {
        let mut state = ImageState::alloc(512, IMAGE_BITS_IN_BLOCK * 2 + 10);
        state.mark(IMAGE_BITS_IN_BLOCK - 1);
        state.mark(IMAGE_BITS_IN_BLOCK);
        state.mark(IMAGE_BITS_IN_BLOCK * 2 + 3);
        state.update_set_counts();
        assert_eq!(state.image_blockcount, 3);
        assert_eq!(state.image_blkno(IMAGE_BITS_IN_BLOCK - 1), 1);
        assert_eq!(state.image_blkno(IMAGE_BITS_IN_BLOCK), 2);
        assert_eq!(state.image_blkno(IMAGE_BITS_IN_BLOCK * 2 + 3), 3);
    }
}

#[cfg(test)]
mod roundtrip_tests {
    use super::*;
    use crate::dir;
    use crate::format::test_support::scratch_volume_with_journal;
    use crate::fs::FsHandle;
    use crate::fs::OpenFlags;
    use std::io::Write as _;

    #[test]
    fn packed_image_reopens_identically() {
        let tmp = scratch_volume_with_journal(64 << 20);
        let fs = FsHandle::open(tmp.path(), OpenFlags::RW, 0, 0).unwrap();

        // a directory with three files in it
        dir::link(&fs, fs.root_blkno, b"docs", fs.sysdir_blkno, dir::FT_DIR).unwrap();
        for name in [b"a.txt".as_slice(), b"b.txt", b"c.txt"] {
            dir::link(&fs, fs.root_blkno, name, 777, dir::FT_REG_FILE).unwrap();
        }
        fs.flush().unwrap();

        let state = scan_metadata(&fs).unwrap();
        assert!(state.image_blockcount > 0);
        // the whole metadata skeleton must be a small fraction of the
        // volume
        assert!(state.image_blockcount < fs.blocks / 2);

        let mut img = tempfile::NamedTempFile::new().unwrap();
        write_packed_image(&fs, &state, img.as_file_mut()).unwrap();
        img.as_file_mut().flush().unwrap();

        // the packed size is exactly header + blocks + bitmap
        let expect = fs.blocksize as u64 * (1 + state.image_blockcount)
            + state.chunks().len() as u64 * IMAGE_BITMAP_BLOCKSIZE;
        assert_eq!(img.as_file().metadata().unwrap().len(), expect);

        let img_fs =
            FsHandle::open(img.path(), OpenFlags::IMAGE_FILE, 0, 0).unwrap();
        assert_eq!(img_fs.blocksize, fs.blocksize);
        assert_eq!(img_fs.clusters, fs.clusters);
        assert_eq!(img_fs.root_blkno, fs.root_blkno);

        // the captured directory listing survives the trip
        assert_eq!(
            dir::lookup(&img_fs, img_fs.root_blkno, b"docs").unwrap(),
            fs.sysdir_blkno
        );
        for name in [b"a.txt".as_slice(), b"b.txt", b"c.txt"] {
            assert_eq!(dir::lookup(&img_fs, img_fs.root_blkno, name).unwrap(), 777);
        }

        // every marked block reads back bit for bit
        let mut from_dev = fs.alloc_block();
        let mut from_img = fs.alloc_block();
        for blkno in 0..fs.blocks {
            if state.test_bit(blkno) {
                fs.read_blocks(blkno, 1, &mut from_dev).unwrap();
                img_fs.read_blocks(blkno, 1, &mut from_img).unwrap();
                assert_eq!(from_dev, from_img, "block {blkno} differs");
            }
        }

        // a block outside the capture reads as an I/O failure
        let mut unmarked = None;
        for blkno in (0..fs.blocks).rev() {
            if !state.test_bit(blkno) {
                unmarked = Some(blkno);
                break;
            }
        }
        let mut buf = fs.alloc_block();
        assert!(matches!(
            img_fs.read_blocks(unmarked.unwrap(), 1, &mut buf),
            Err(Ocfs2Error::IoError(_))
        ));
    }

    #[test]
    fn raw_image_opens_like_the_device() {
        let tmp = scratch_volume_with_journal(64 << 20);
        let fs = FsHandle::open(tmp.path(), OpenFlags::empty(), 0, 0).unwrap();

        let state = scan_metadata(&fs).unwrap();
        let img = tempfile::NamedTempFile::new().unwrap();
        let mut out = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(img.path())
            .unwrap();
        write_raw_image(&fs, &state, &mut out).unwrap();

        // a raw image is a filesystem with holes; it opens like a device
        let raw_fs = FsHandle::open(img.path(), OpenFlags::empty(), 0, 0).unwrap();
        assert_eq!(raw_fs.blocksize, fs.blocksize);
        assert_eq!(raw_fs.root_blkno, fs.root_blkno);
        crate::inode::check_directory(&raw_fs, raw_fs.root_blkno).unwrap();
    }
}
