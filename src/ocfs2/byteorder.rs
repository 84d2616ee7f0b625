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

//! Endianness primitives for the on-disk swap pairs.
//!
//! The disk format is little-endian. Each record kind has exactly one swap
//! pair, kept next to its reader (`swap_<kind>_to_native` /
//! `swap_<kind>_from_native`); the pairs are no-ops on little-endian hosts.
//! Scalar fields are swapped before embedded record arrays on the way to
//! native form, and after them on the way back, so the loop bounds are
//! always read in native byte order.

/// Tells whether the host already uses the on-disk byte order.
pub const fn cpu_is_little_endian() -> bool {
    cfg!(target_endian = "little")
}

/// Barrier protecting per-record swap loops against corrupt counts.
///
/// Returns `true` when a record of `size` bytes at `off` would cross the end
/// of its `blocksize`-byte block. The swap loop stops there, leaving the
/// tail untouched; the typed reader reports the block as corrupted.
pub fn swap_barrier(blocksize: usize, off: usize, size: usize) -> bool {
    off + size > blocksize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn barrier() {
        assert!(!swap_barrier(512, 0, 16));
        assert!(!swap_barrier(512, 496, 16));
        assert!(swap_barrier(512, 497, 16));
        assert!(swap_barrier(512, 512, 1));
    }
}
