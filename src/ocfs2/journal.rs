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

//! Journal superblocks.
//!
//! Each slot's journal file starts with a JBD2 superblock. Unlike the rest
//! of the volume, the JBD2 layout is big-endian on disk, so the swap pair
//! here is a no-op on big-endian hosts instead. Journal contents beyond
//! the superblock are not interpreted.

use crate::error::Ocfs2Error;
use crate::fs::FsHandle;
use crate::util::cast_at;
use crate::util::cast_at_mut;
use std::mem::size_of;

/// The JBD2 magic number.
pub const JBD2_MAGIC_NUMBER: u32 = 0xc03b3998;
/// Block type of a version-2 journal superblock.
pub const JBD2_SUPERBLOCK_V2: u32 = 4;
/// Journal incompat feature: block numbers are 64-bit.
pub const JBD2_FEATURE_INCOMPAT_64BIT: u32 = 0x0002;
/// The smallest journal this library will create, in blocks.
pub const MIN_JOURNAL_BLOCKS: u32 = 1024;

/// Common header of every JBD2 block.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct JournalHeader {
    /// Magic number.
    pub h_magic: u32,
    /// Block type.
    pub h_blocktype: u32,
    /// Transaction sequence number.
    pub h_sequence: u32,
}

/// The journal superblock, big-endian on disk.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct JournalSuperblock {
    /// Common header.
    pub s_header: JournalHeader,
    /// Journal device block size.
    pub s_blocksize: u32,
    /// Total blocks in the journal file.
    pub s_maxlen: u32,
    /// First block of log information.
    pub s_first: u32,
    /// First expected commit sequence.
    pub s_sequence: u32,
    /// Block of the log's start; 0 means the journal is empty.
    pub s_start: u32,
    /// Error value left by an aborted journal.
    pub s_errno: i32,
    /// Compatible feature set.
    pub s_feature_compat: u32,
    /// Incompatible feature set.
    pub s_feature_incompat: u32,
    /// Read-only compatible feature set.
    pub s_feature_ro_compat: u32,
    /// Journal UUID.
    pub s_uuid: [u8; 16],
    /// Filesystems sharing the journal.
    pub s_nr_users: u32,
    /// Location of a dynamic superblock copy.
    pub s_dynsuper: u32,
    /// Cap on blocks in one transaction.
    pub s_max_transaction: u32,
    /// Cap on data blocks in one transaction.
    pub s_max_trans_data: u32,
    /// Padding.
    pub s_padding: [u32; 44],
    /// IDs of the sharing filesystems.
    pub s_users: [u8; 768],
}

const _: () = assert!(size_of::<JournalSuperblock>() == 1024);

/// Swaps a journal superblock between disk (big-endian) and host order.
/// Self-inverse, so one helper serves both directions.
fn swap_journal_superblock(jsb: &mut JournalSuperblock) {
    if !cfg!(target_endian = "big") {
        jsb.s_header.h_magic = jsb.s_header.h_magic.swap_bytes();
        jsb.s_header.h_blocktype = jsb.s_header.h_blocktype.swap_bytes();
        jsb.s_header.h_sequence = jsb.s_header.h_sequence.swap_bytes();
        jsb.s_blocksize = jsb.s_blocksize.swap_bytes();
        jsb.s_maxlen = jsb.s_maxlen.swap_bytes();
        jsb.s_first = jsb.s_first.swap_bytes();
        jsb.s_sequence = jsb.s_sequence.swap_bytes();
        jsb.s_start = jsb.s_start.swap_bytes();
        jsb.s_errno = jsb.s_errno.swap_bytes();
        jsb.s_feature_compat = jsb.s_feature_compat.swap_bytes();
        jsb.s_feature_incompat = jsb.s_feature_incompat.swap_bytes();
        jsb.s_feature_ro_compat = jsb.s_feature_ro_compat.swap_bytes();
        jsb.s_nr_users = jsb.s_nr_users.swap_bytes();
        jsb.s_dynsuper = jsb.s_dynsuper.swap_bytes();
        jsb.s_max_transaction = jsb.s_max_transaction.swap_bytes();
        jsb.s_max_trans_data = jsb.s_max_trans_data.swap_bytes();
    }
}

/// Swaps a journal superblock to host endianness.
pub fn swap_journal_superblock_to_native(buf: &mut [u8]) {
    swap_journal_superblock(cast_at_mut::<JournalSuperblock>(buf, 0));
}

/// Swaps a journal superblock back to disk endianness.
pub fn swap_journal_superblock_from_native(buf: &mut [u8]) {
    swap_journal_superblock(cast_at_mut::<JournalSuperblock>(buf, 0));
}

/// Size in bytes of one block tag, decided by the journal's feature bits.
pub fn journal_tag_bytes(jsb: &JournalSuperblock) -> usize {
    if jsb.s_feature_incompat & JBD2_FEATURE_INCOMPAT_64BIT != 0 {
        12
    } else {
        8
    }
}

/// Builds a fresh journal superblock for a journal of `size_in_blks`
/// blocks, returned as a host-endian block buffer.
pub fn create_journal_superblock(
    fs: &FsHandle,
    size_in_blks: u32,
) -> Result<Vec<u8>, Ocfs2Error> {
    if size_in_blks < MIN_JOURNAL_BLOCKS {
        return Err(Ocfs2Error::JournalTooSmall(size_in_blks));
    }
    // the structure spans two blocks on a 512-byte filesystem; the buffer
    // is padded, the write only issues one block
    let mut buf = vec![0u8; (fs.blocksize as usize).max(size_of::<JournalSuperblock>())];
    let jsb = cast_at_mut::<JournalSuperblock>(&mut buf, 0);
    jsb.s_header.h_magic = JBD2_MAGIC_NUMBER;
    jsb.s_header.h_blocktype = JBD2_SUPERBLOCK_V2;
    jsb.s_blocksize = fs.blocksize;
    jsb.s_maxlen = size_in_blks;
    jsb.s_first = 1;
    jsb.s_start = 1;
    jsb.s_sequence = 1;
    jsb.s_errno = 0;
    jsb.s_nr_users = 1;
    jsb.s_uuid = *fs.uuid.as_bytes();
    Ok(buf)
}

/// Reads and validates the journal superblock at block `blkno` (the first
/// block of a journal system file).
pub fn read_journal_superblock(fs: &FsHandle, blkno: u64) -> Result<Vec<u8>, Ocfs2Error> {
    fs.check_blkno(blkno)?;
    let mut blk = vec![0u8; (fs.blocksize as usize).max(size_of::<JournalSuperblock>())];
    fs.read_blocks(blkno, 1, &mut blk)?;

    swap_journal_superblock_to_native(&mut blk);
    let jsb = cast_at::<JournalSuperblock>(&blk, 0);
    if jsb.s_header.h_magic != JBD2_MAGIC_NUMBER {
        let magic = jsb.s_header.h_magic;
        return Err(Ocfs2Error::BadMagic(magic));
    }
    if jsb.s_header.h_blocktype != JBD2_SUPERBLOCK_V2 {
        let blocktype = jsb.s_header.h_blocktype;
        return Err(Ocfs2Error::BadMagic(blocktype));
    }
    Ok(blk)
}

/// Writes a host-endian journal superblock to block `blkno`.
pub fn write_journal_superblock(fs: &FsHandle, blkno: u64, buf: &[u8]) -> Result<(), Ocfs2Error> {
    if !fs.writable() {
        return Err(Ocfs2Error::ReadOnlyFilesystem);
    }
    fs.check_blkno(blkno)?;

    let mut blk = buf.to_vec();
    swap_journal_superblock_from_native(&mut blk);
    fs.write_blocks(blkno, 1, &blk)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout() {
        assert_eq!(size_of::<JournalHeader>(), 12);
        assert_eq!(size_of::<JournalSuperblock>(), 1024);
    }

    #[test]
    fn tag_bytes() {
        let mut buf = vec![0u8; 1024];
        let jsb = cast_at_mut::<JournalSuperblock>(&mut buf, 0);
        assert_eq!(journal_tag_bytes(jsb), 8);
        jsb.s_feature_incompat = JBD2_FEATURE_INCOMPAT_64BIT;
        assert_eq!(journal_tag_bytes(jsb), 12);
    }
}
