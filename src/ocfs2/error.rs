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

//! Error type shared by the whole library.

use std::io;
use thiserror::Error;

/// Errors returned by metadata operations.
///
/// Variants that concern one metadata block carry the responsible block
/// number so tools can point at the damage.
#[derive(Debug, Error)]
pub enum Ocfs2Error {
    /// A block number outside `[superblock, fs_blocks]` was requested.
    #[error("block number {0} out of range")]
    BadBlockNumber(u64),
    /// A block did not start with the signature its kind requires.
    #[error("bad signature in block {blkno}, expected {expected:?}")]
    BadSignature {
        /// The block that failed the check.
        blkno: u64,
        /// The expected ASCII signature.
        expected: &'static str,
    },
    /// A magic number (superblock, image header, quota file) did not match.
    #[error("bad magic 0x{0:x}")]
    BadMagic(u32),
    /// CRC mismatch that single-bit correction could not repair.
    #[error("uncorrectable corruption in block {0}")]
    CorruptedBlock(u64),
    /// An extent tree failed a structural check.
    #[error("corrupted extent tree at block {0}")]
    CorruptedExtentTree(u64),
    /// A directory block or entry failed a structural check.
    #[error("corrupted directory at block {0}")]
    CorruptedDirectory(u64),
    /// A quota file failed a structural check.
    #[error("corrupted quota file (block {0})")]
    CorruptedQuotaFile(u64),
    /// The superblock carries feature bits the library does not know.
    #[error("unsupported feature bits 0x{0:x}")]
    UnsupportedFeature(u32),
    /// Read-only compatible feature bits prevent a read-write open.
    #[error("unsupported read-only feature bits 0x{0:x}")]
    ReadOnlyUnsupportedFeature(u32),
    /// A caller-supplied argument was out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The extent tree cannot grow any further.
    #[error("no space left in extent tree rooted at block {0}")]
    NoSpaceInTree(u64),
    /// An allocator ran out of free bits.
    #[error("no space left on device")]
    NoSpaceOnDevice,
    /// The requested journal is below the minimum size.
    #[error("journal size of {0} blocks is too small")]
    JournalTooSmall(u32),
    /// A read returned fewer bytes than one block run requires.
    #[error("short read at block {0}")]
    ShortRead(u64),
    /// A write stored fewer bytes than one block run requires.
    #[error("short write at block {0}")]
    ShortWrite(u64),
    /// An I/O error from the channel, or a block absent from an image.
    #[error("I/O error")]
    IoError(#[from] io::Error),
    /// A mutating operation was attempted on a read-only handle.
    #[error("filesystem is opened read-only")]
    ReadOnlyFilesystem,
    /// An inode block is not usable for the requested operation.
    #[error("inode {0} is not valid")]
    InodeNotValid(u64),
    /// A directory entry was not found.
    #[error("directory entry not found")]
    DirentNotFound,
    /// A leaf that should be full was found partly empty during a split.
    #[error("leaf at block {0} unexpectedly empty during split")]
    EmptyLeafDuringSplit(u64),
}

impl Ocfs2Error {
    /// I/O error from the current `errno`.
    pub fn last_os_error() -> Self {
        Self::IoError(io::Error::last_os_error())
    }
}
