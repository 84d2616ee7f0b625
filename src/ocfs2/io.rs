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

//! Block-granular I/O channel over a device or regular file.

use crate::error::Ocfs2Error;
use crate::ondisk::MAX_BLOCKSIZE;
use crate::ondisk::MIN_BLOCKSIZE;
use libc::ioctl;
use std::ffi::c_long;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::Error;
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;

/// ioctl macro: Command.
macro_rules! ioc {
    ($a:expr, $b:expr, $c:expr, $d:expr) => {
        (($a) << 30) | (($b) << 8) | ($c) | (($d) << 16)
    };
}

/// ioctl macro: Read command.
macro_rules! ior {
    ($a:expr, $b:expr, $c:ty) => {
        ioc!(2, $a, $b, std::mem::size_of::<$c>() as c_long)
    };
}

/// ioctl command: Get size of disk in bytes.
const BLKGETSIZE64: c_long = ior!(0x12, 114, u64);

/// Access mode of a channel.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IoMode {
    /// Read-only.
    ReadOnly,
    /// Read-write.
    ReadWrite,
    /// Read-write through the page cache.
    Buffered,
}

/// A channel performing I/O in whole blocks on an open descriptor.
///
/// The channel is single-threaded; callers serialise access themselves.
pub struct IoChannel {
    /// The backing file or device.
    file: File,
    /// The logical block size.
    blksize: u32,
    /// Tells whether writing is allowed.
    writable: bool,
}

impl IoChannel {
    /// Opens the device or file at `path`.
    pub fn open(path: &Path, mode: IoMode) -> Result<Self, Ocfs2Error> {
        let writable = mode != IoMode::ReadOnly;
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)?;
        Ok(Self {
            file,
            blksize: MIN_BLOCKSIZE,
            writable,
        })
    }

    /// Sets the logical block size, in bytes.
    pub fn set_blksize(&mut self, blksize: u32) -> Result<(), Ocfs2Error> {
        if !blksize.is_power_of_two() || !(MIN_BLOCKSIZE..=MAX_BLOCKSIZE).contains(&blksize) {
            return Err(Ocfs2Error::InvalidArgument("invalid block size"));
        }
        self.blksize = blksize;
        Ok(())
    }

    /// Returns the logical block size, in bytes.
    pub fn blksize(&self) -> u32 {
        self.blksize
    }

    /// Tells whether the channel accepts writes.
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Reads `count` blocks starting at block `blkno` into `buf`.
    pub fn read_blocks(&self, blkno: u64, count: usize, buf: &mut [u8]) -> Result<(), Ocfs2Error> {
        let bytes = count * self.blksize as usize;
        assert!(buf.len() >= bytes);
        let off = blkno * self.blksize as u64;
        self.file
            .read_exact_at(&mut buf[..bytes], off)
            .map_err(|e| match e.kind() {
                io::ErrorKind::UnexpectedEof => Ocfs2Error::ShortRead(blkno),
                _ => Ocfs2Error::IoError(e),
            })
    }

    /// Reads `count` blocks, bypassing any cache the channel may keep.
    ///
    /// The channel keeps no cache of its own, so this is a plain read; the
    /// entry point exists for callers that must observe on-disk state.
    pub fn read_blocks_nocache(
        &self,
        blkno: u64,
        count: usize,
        buf: &mut [u8],
    ) -> Result<(), Ocfs2Error> {
        self.read_blocks(blkno, count, buf)
    }

    /// Writes `count` blocks starting at block `blkno` from `buf`.
    pub fn write_blocks(&self, blkno: u64, count: usize, buf: &[u8]) -> Result<(), Ocfs2Error> {
        let bytes = count * self.blksize as usize;
        assert!(buf.len() >= bytes);
        let off = blkno * self.blksize as u64;
        self.file
            .write_all_at(&buf[..bytes], off)
            .map_err(|e| match e.kind() {
                io::ErrorKind::WriteZero => Ocfs2Error::ShortWrite(blkno),
                _ => Ocfs2Error::IoError(e),
            })
    }

    /// Returns the size of the backing device or file, in bytes.
    pub fn device_size(&self) -> Result<u64, Ocfs2Error> {
        let metadata = self.file.metadata()?;
        let file_type = metadata.file_type();
        if file_type.is_block_device() || file_type.is_char_device() {
            let mut size = 0u64;
            let ret = unsafe { ioctl(self.file.as_raw_fd(), BLKGETSIZE64 as _, &mut size) };
            if ret < 0 {
                return Err(Ocfs2Error::IoError(Error::last_os_error()));
            }
            Ok(size)
        } else {
            Ok(metadata.len())
        }
    }

    /// Returns the backing file.
    pub fn file(&self) -> &File {
        &self.file
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn read_write_roundtrip() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&vec![0u8; 4096]).unwrap();

        let mut channel = IoChannel::open(tmp.path(), IoMode::ReadWrite).unwrap();
        channel.set_blksize(512).unwrap();

        let data: Vec<u8> = (0..1024).map(|i| (i % 251) as u8).collect();
        channel.write_blocks(3, 2, &data).unwrap();

        let mut back = vec![0u8; 1024];
        channel.read_blocks(3, 2, &mut back).unwrap();
        assert_eq!(back, data);

        // the neighbouring block is untouched
        let mut before = vec![0u8; 512];
        channel.read_blocks(2, 1, &mut before).unwrap();
        assert_eq!(before, vec![0u8; 512]);
    }

    #[test]
    fn short_read() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&vec![0u8; 700]).unwrap();

        let mut channel = IoChannel::open(tmp.path(), IoMode::ReadOnly).unwrap();
        channel.set_blksize(512).unwrap();

        let mut buf = vec![0u8; 512];
        assert!(matches!(
            channel.read_blocks(1, 1, &mut buf),
            Err(Ocfs2Error::ShortRead(1))
        ));
    }

    #[test]
    fn invalid_block_size() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut channel = IoChannel::open(tmp.path(), IoMode::ReadOnly).unwrap();
        assert!(channel.set_blksize(1000).is_err());
        assert!(channel.set_blksize(8192).is_err());
        assert!(channel.set_blksize(256).is_err());
        assert!(channel.set_blksize(4096).is_ok());
    }
}
