// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Fixed-layout preamble codec for KLL byte images.
//!
//! The preamble is the first 8 bytes (empty and single-item images) or 20
//! bytes (everything else) of an image:
//!
//! ```text
//! byte 0      preamble ints (2 or 5)
//! byte 1      serial version (1 single-item, 2 compact, 3 updatable)
//! byte 2      family id (15)
//! byte 3      flags
//! bytes 4-5   k (u16 LE)
//! byte 6      m
//! byte 7      reserved
//! bytes 8-15  n (u64 LE)        full preamble only
//! bytes 16-17 min k (u16 LE)    full preamble only
//! bytes 18-19 num levels (u16 LE)  full preamble only
//! ```
//!
//! All operations here work in place on a borrowed byte region and never
//! allocate.

use byteorder::ByteOrder;
use byteorder::LittleEndian;

use super::MAX_K;
use super::VALID_M;
use crate::error::Error;

/// Family ID for KLL sketches.
pub(crate) const KLL_FAMILY_ID: u8 = 15;

/// Serial version of a single-item compact image.
pub(crate) const SER_VER_SINGLE: u8 = 1;
/// Serial version of a compact image (empty or general).
pub(crate) const SER_VER_COMPACT: u8 = 2;
/// Serial version of an updatable image.
pub(crate) const SER_VER_UPDATABLE: u8 = 3;

/// Preamble ints for empty and single-item images.
pub(crate) const PREAMBLE_INTS_SHORT: u8 = 2;
/// Preamble ints for all other images.
pub(crate) const PREAMBLE_INTS_FULL: u8 = 5;

pub(crate) const FLAG_EMPTY: u8 = 1 << 0;
pub(crate) const FLAG_LEVEL_ZERO_SORTED: u8 = 1 << 1;
pub(crate) const FLAG_SINGLE_ITEM: u8 = 1 << 2;
pub(crate) const FLAG_DOUBLES_SKETCH: u8 = 1 << 3;
pub(crate) const FLAG_UPDATABLE: u8 = 1 << 4;

/// Byte length of the short preamble; also the data offset of empty and
/// single-item images.
pub(crate) const PREAMBLE_SHORT_BYTES: usize = 8;
/// Byte length of the full preamble; also the offset of the levels array.
pub(crate) const PREAMBLE_FULL_BYTES: usize = 20;

const OFFSET_PREAMBLE_INTS: usize = 0;
const OFFSET_SER_VER: usize = 1;
const OFFSET_FAMILY: usize = 2;
const OFFSET_FLAGS: usize = 3;
const OFFSET_K: usize = 4;
const OFFSET_M: usize = 6;
const OFFSET_N: usize = 8;
const OFFSET_MIN_K: usize = 16;
const OFFSET_NUM_LEVELS: usize = 18;

/// Decoded preamble of a byte image.
///
/// For short-preamble images the derived fields are filled in: `n` is 0 or 1,
/// `min_k == k`, and `num_levels == 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Preamble {
    pub preamble_ints: u8,
    pub ser_ver: u8,
    pub flags: u8,
    pub k: u16,
    pub m: u8,
    pub n: u64,
    pub min_k: u16,
    pub num_levels: u16,
}

impl Preamble {
    pub fn is_empty(&self) -> bool {
        self.flags & FLAG_EMPTY != 0
    }

    pub fn is_single_item(&self) -> bool {
        self.flags & FLAG_SINGLE_ITEM != 0
    }

    pub fn is_level_zero_sorted(&self) -> bool {
        self.flags & FLAG_LEVEL_ZERO_SORTED != 0
    }

    pub fn is_doubles_sketch(&self) -> bool {
        self.flags & FLAG_DOUBLES_SKETCH != 0
    }

    pub fn is_updatable(&self) -> bool {
        self.flags & FLAG_UPDATABLE != 0
    }

    /// Decodes and validates a preamble from the start of `bytes`.
    ///
    /// Validation covers the family id, the serial version, the
    /// preamble-ints/flags consistency, and the ranges of `m`, `k`, `min_k`
    /// and `num_levels`. Anything off is a `CorruptImage` error.
    pub fn read(bytes: &[u8]) -> Result<Preamble, Error> {
        if bytes.len() < PREAMBLE_SHORT_BYTES {
            return Err(Error::insufficient_data("preamble"));
        }

        let preamble_ints = bytes[OFFSET_PREAMBLE_INTS];
        let ser_ver = bytes[OFFSET_SER_VER];
        let family = bytes[OFFSET_FAMILY];
        let flags = bytes[OFFSET_FLAGS];
        let k = LittleEndian::read_u16(&bytes[OFFSET_K..OFFSET_K + 2]);
        let m = bytes[OFFSET_M];

        if family != KLL_FAMILY_ID {
            return Err(Error::corrupt(format!(
                "invalid family: expected {KLL_FAMILY_ID} (KLL), got {family}"
            )));
        }
        if !(SER_VER_SINGLE..=SER_VER_UPDATABLE).contains(&ser_ver) {
            return Err(Error::corrupt(format!("invalid serial version: {ser_ver}")));
        }
        if !VALID_M.contains(&m) {
            return Err(Error::corrupt(format!(
                "invalid m: must be one of {VALID_M:?}, got {m}"
            )));
        }
        if k < m as u16 {
            return Err(Error::corrupt(format!(
                "k out of range: must be in [{m}, {MAX_K}], got {k}"
            )));
        }

        let is_empty = flags & FLAG_EMPTY != 0;
        let is_single = flags & FLAG_SINGLE_ITEM != 0;
        if is_empty && is_single {
            return Err(Error::corrupt("empty and single-item flags both set"));
        }
        if is_single && ser_ver != SER_VER_SINGLE {
            return Err(Error::corrupt(format!(
                "single-item flag requires serial version {SER_VER_SINGLE}, got {ser_ver}"
            )));
        }
        if (flags & FLAG_UPDATABLE != 0) != (ser_ver == SER_VER_UPDATABLE) {
            return Err(Error::corrupt(
                "updatable flag inconsistent with serial version",
            ));
        }

        let expected_ints = if (is_empty || is_single) && ser_ver != SER_VER_UPDATABLE {
            PREAMBLE_INTS_SHORT
        } else {
            PREAMBLE_INTS_FULL
        };
        if preamble_ints != expected_ints {
            return Err(Error::corrupt(format!(
                "invalid preamble ints: expected {expected_ints}, got {preamble_ints}"
            )));
        }

        let (n, min_k, num_levels) = if preamble_ints == PREAMBLE_INTS_SHORT {
            (if is_empty { 0 } else { 1 }, k, 1)
        } else {
            if bytes.len() < PREAMBLE_FULL_BYTES {
                return Err(Error::insufficient_data("full preamble"));
            }
            let n = LittleEndian::read_u64(&bytes[OFFSET_N..OFFSET_N + 8]);
            let min_k = LittleEndian::read_u16(&bytes[OFFSET_MIN_K..OFFSET_MIN_K + 2]);
            let num_levels =
                LittleEndian::read_u16(&bytes[OFFSET_NUM_LEVELS..OFFSET_NUM_LEVELS + 2]);
            (n, min_k, num_levels)
        };

        if num_levels == 0 {
            return Err(Error::corrupt("num_levels must be > 0"));
        }
        if num_levels > 61 {
            return Err(Error::corrupt(format!("num_levels too large: {num_levels}")));
        }
        if min_k < m as u16 || min_k > k {
            return Err(Error::corrupt(format!(
                "min_k must be in [{m}, {k}], got {min_k}"
            )));
        }

        Ok(Preamble {
            preamble_ints,
            ser_ver,
            flags,
            k,
            m,
            n,
            min_k,
            num_levels,
        })
    }

    /// Encodes this preamble at the start of `out`.
    ///
    /// Writes the short or full form according to `preamble_ints`. The
    /// region must be large enough; callers size it from the serialized
    /// layout before writing.
    pub fn write(&self, out: &mut [u8]) {
        out[OFFSET_PREAMBLE_INTS] = self.preamble_ints;
        out[OFFSET_SER_VER] = self.ser_ver;
        out[OFFSET_FAMILY] = KLL_FAMILY_ID;
        out[OFFSET_FLAGS] = self.flags;
        LittleEndian::write_u16(&mut out[OFFSET_K..OFFSET_K + 2], self.k);
        out[OFFSET_M] = self.m;
        out[OFFSET_M + 1] = 0;
        if self.preamble_ints == PREAMBLE_INTS_FULL {
            LittleEndian::write_u64(&mut out[OFFSET_N..OFFSET_N + 8], self.n);
            LittleEndian::write_u16(&mut out[OFFSET_MIN_K..OFFSET_MIN_K + 2], self.min_k);
            LittleEndian::write_u16(
                &mut out[OFFSET_NUM_LEVELS..OFFSET_NUM_LEVELS + 2],
                self.num_levels,
            );
        }
    }
}

// Single-field write-through accessors for updatable images. A writable
// memory-backed sketch keeps its region current after every mutation without
// re-encoding the whole preamble.

pub(crate) fn insert_n(region: &mut [u8], n: u64) {
    LittleEndian::write_u64(&mut region[OFFSET_N..OFFSET_N + 8], n);
}

pub(crate) fn insert_min_k(region: &mut [u8], min_k: u16) {
    LittleEndian::write_u16(&mut region[OFFSET_MIN_K..OFFSET_MIN_K + 2], min_k);
}

pub(crate) fn insert_num_levels(region: &mut [u8], num_levels: u16) {
    LittleEndian::write_u16(
        &mut region[OFFSET_NUM_LEVELS..OFFSET_NUM_LEVELS + 2],
        num_levels,
    );
}

pub(crate) fn insert_flags(region: &mut [u8], flags: u8) {
    region[OFFSET_FLAGS] = flags;
}
