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

//! Byte images of KLL sketches.
//!
//! Both image families share the preamble of [`super::preamble`]:
//!
//! - compact (canonical for interchange): empty images are the 8-byte short
//!   preamble; single-item images append the one value; general images hold
//!   the full preamble, `num_levels` offsets normalized to the start of the
//!   retained items, min, max, and the retained items with no leading
//!   garbage. Read in place by [`KllSketch::wrap_compact`] or copied onto
//!   the heap by [`KllSketch::heapify`].
//! - updatable: full preamble, all `num_levels + 1` absolute offsets, min,
//!   max, and the items buffer at full capacity including the leading
//!   garbage. Mutated in place through [`KllSketch::wrap_updatable`].

use byteorder::ByteOrder;
use byteorder::LittleEndian;

use super::helper::compute_total_capacity;
use super::helper::sum_the_sample_weights;
use super::preamble::FLAG_DOUBLES_SKETCH;
use super::preamble::FLAG_EMPTY;
use super::preamble::FLAG_LEVEL_ZERO_SORTED;
use super::preamble::FLAG_SINGLE_ITEM;
use super::preamble::KLL_FAMILY_ID;
use super::preamble::PREAMBLE_FULL_BYTES;
use super::preamble::PREAMBLE_INTS_FULL;
use super::preamble::PREAMBLE_INTS_SHORT;
use super::preamble::PREAMBLE_SHORT_BYTES;
use super::preamble::Preamble;
use super::preamble::SER_VER_COMPACT;
use super::preamble::SER_VER_SINGLE;
use super::preamble::SER_VER_UPDATABLE;
use super::sketch::KllItem;
use super::sketch::KllSketch;
use super::sketch::check_k_and_m;
use super::store::Items;
use super::store::MemoryProvider;
use crate::codec::SketchBytes;
use crate::codec::SketchSlice;
use crate::error::Error;

/// Size in bytes of an updatable image with the given shape.
pub(super) fn updatable_image_size<T: KllItem>(num_levels: usize, total_capacity: usize) -> usize {
    PREAMBLE_FULL_BYTES + 4 * (num_levels + 1) + (2 + total_capacity) * T::SIZE_BYTES
}

fn check_item_type<T: KllItem>(pre: &Preamble) -> Result<(), Error> {
    if pre.is_doubles_sketch() != T::IS_DOUBLE {
        let actual = if pre.is_doubles_sketch() { "f64" } else { "f32" };
        return Err(Error::type_mismatch(T::TYPE_NAME, actual));
    }
    Ok(())
}

#[allow(private_bounds)]
impl<T: KllItem> KllSketch<'static, T> {
    /// Reconstructs a heap sketch from a compact byte image.
    ///
    /// Accepts serial versions 1 (single-item) and 2 (empty or general).
    /// Updatable images must be wrapped with [`KllSketch::wrap_updatable`]
    /// instead. Images with an unsorted level 0 are accepted; level 0 is
    /// sorted after loading.
    pub fn heapify(bytes: &[u8]) -> Result<Self, Error> {
        let pre = Preamble::read(bytes)?;
        if pre.ser_ver == SER_VER_UPDATABLE {
            return Err(Error::corrupt(
                "heapify requires a compact image; wrap updatable images instead",
            ));
        }
        check_item_type::<T>(&pre)?;

        if pre.is_empty() {
            let mut sketch = Self::make_heap(pre.k, pre.m);
            sketch.is_level_zero_sorted = pre.is_level_zero_sorted();
            return Ok(sketch);
        }

        if pre.is_single_item() {
            let mut cursor = SketchSlice::new(bytes);
            cursor.skip(PREAMBLE_SHORT_BYTES as u64);
            let item = T::read_item(&mut cursor)?;
            let mut sketch = Self::make_heap(pre.k, pre.m);
            sketch.items.set(pre.k as usize - 1, item);
            sketch.levels[0] = pre.k as u32 - 1;
            sketch.n = 1;
            sketch.min_item = Some(item);
            sketch.max_item = Some(item);
            sketch.is_level_zero_sorted = true;
            return Ok(sketch);
        }

        let num_levels = pre.num_levels as usize;
        let items_off = PREAMBLE_FULL_BYTES + 4 * num_levels + 2 * T::SIZE_BYTES;
        let relative = read_compact_offsets(bytes, num_levels, items_off)?;
        let retained = compact_retained_count::<T>(bytes, items_off)?;
        validate_compact_shape(&pre, &relative, retained)?;

        let capacity = compute_total_capacity(pre.k, pre.m, num_levels) as usize;
        if retained > capacity {
            return Err(Error::corrupt(format!(
                "retained count {retained} exceeds capacity {capacity}"
            )));
        }
        let garbage = capacity - retained;

        let mut cursor = SketchSlice::new(bytes);
        cursor.skip((PREAMBLE_FULL_BYTES + 4 * num_levels) as u64);
        let min_item = T::read_item(&mut cursor)?;
        let max_item = T::read_item(&mut cursor)?;

        let mut buf = vec![T::default(); capacity];
        for slot in buf.iter_mut().skip(garbage) {
            *slot = T::read_item(&mut cursor)?;
        }

        let mut levels = Vec::with_capacity(num_levels + 1);
        for offset in &relative {
            levels.push(offset + garbage as u32);
        }
        levels.push(capacity as u32);

        let mut sketch = Self::make(pre.k, pre.m, levels, Items::Heap(buf));
        sketch.min_k = pre.min_k;
        sketch.n = pre.n;
        sketch.min_item = Some(min_item);
        sketch.max_item = Some(max_item);
        sketch.is_level_zero_sorted = pre.is_level_zero_sorted();

        // interchange tolerance: accept and repair an unsorted level 0
        if !sketch.is_level_zero_sorted {
            let level0 = sketch.levels[0] as usize..sketch.levels[1] as usize;
            sketch.items.sort_range(level0);
            sketch.is_level_zero_sorted = true;
        }
        Ok(sketch)
    }
}

#[allow(private_bounds)]
impl<'a, T: KllItem> KllSketch<'a, T> {
    /// Wraps a compact byte image as a read-only sketch without copying the
    /// items. All mutating calls on the result fail with `ReadOnly`.
    pub fn wrap_compact(bytes: &'a [u8]) -> Result<Self, Error> {
        let pre = Preamble::read(bytes)?;
        if pre.ser_ver == SER_VER_UPDATABLE {
            return Err(Error::corrupt(
                "wrap_compact requires a compact image; use wrap_updatable",
            ));
        }
        check_item_type::<T>(&pre)?;

        if pre.is_empty() {
            let mut sketch = Self::make(
                pre.k,
                pre.m,
                vec![0, 0],
                Items::ReadOnlyMem {
                    region: bytes,
                    items_off: PREAMBLE_SHORT_BYTES,
                },
            );
            sketch.is_level_zero_sorted = pre.is_level_zero_sorted();
            return Ok(sketch);
        }

        if pre.is_single_item() {
            if bytes.len() < PREAMBLE_SHORT_BYTES + T::SIZE_BYTES {
                return Err(Error::insufficient_data("single item"));
            }
            let item = T::read_le(&bytes[PREAMBLE_SHORT_BYTES..]);
            let mut sketch = Self::make(
                pre.k,
                pre.m,
                vec![0, 1],
                Items::ReadOnlyMem {
                    region: bytes,
                    items_off: PREAMBLE_SHORT_BYTES,
                },
            );
            sketch.n = 1;
            sketch.min_item = Some(item);
            sketch.max_item = Some(item);
            sketch.is_level_zero_sorted = true;
            return Ok(sketch);
        }

        let num_levels = pre.num_levels as usize;
        let items_off = PREAMBLE_FULL_BYTES + 4 * num_levels + 2 * T::SIZE_BYTES;
        let relative = read_compact_offsets(bytes, num_levels, items_off)?;
        let retained = compact_retained_count::<T>(bytes, items_off)?;
        validate_compact_shape(&pre, &relative, retained)?;
        let capacity = compute_total_capacity(pre.k, pre.m, num_levels) as usize;
        if retained > capacity {
            return Err(Error::corrupt(format!(
                "retained count {retained} exceeds capacity {capacity}"
            )));
        }

        let min_off = PREAMBLE_FULL_BYTES + 4 * num_levels;
        let min_item = T::read_le(&bytes[min_off..]);
        let max_item = T::read_le(&bytes[min_off + T::SIZE_BYTES..]);

        let mut levels = relative;
        levels.push(retained as u32);

        let mut sketch = Self::make(
            pre.k,
            pre.m,
            levels,
            Items::ReadOnlyMem {
                region: bytes,
                items_off,
            },
        );
        sketch.min_k = pre.min_k;
        sketch.n = pre.n;
        sketch.min_item = Some(min_item);
        sketch.max_item = Some(max_item);
        sketch.is_level_zero_sorted = pre.is_level_zero_sorted();
        Ok(sketch)
    }

    /// Creates a new sketch that lives inside the given writable byte
    /// region, initializing an updatable image there.
    ///
    /// Fails with `InsufficientSpace` if the region cannot hold the initial
    /// single-level layout for k.
    pub fn new_direct(k: u16, region: &'a mut [u8]) -> Result<Self, Error> {
        Self::direct_internal(k, region, None)
    }

    /// Like [`Self::new_direct`], with a provider consulted when the region
    /// must grow.
    pub fn new_direct_with_provider(
        k: u16,
        region: &'a mut [u8],
        provider: &'a mut dyn MemoryProvider<'a>,
    ) -> Result<Self, Error> {
        Self::direct_internal(k, region, Some(provider))
    }

    fn direct_internal(
        k: u16,
        region: &'a mut [u8],
        provider: Option<&'a mut dyn MemoryProvider<'a>>,
    ) -> Result<Self, Error> {
        check_k_and_m(k, super::DEFAULT_M)?;
        let required = updatable_image_size::<T>(1, k as usize);
        if region.len() < required {
            return Err(Error::insufficient_space(required, region.len()));
        }
        let items_off = PREAMBLE_FULL_BYTES + 4 * 2 + 2 * T::SIZE_BYTES;
        let mut sketch = Self::make(
            k,
            super::DEFAULT_M,
            vec![k as u32, k as u32],
            Items::WritableMem {
                region,
                items_off,
                provider,
            },
        );
        sketch.init_region_header();
        sketch.sync_region();
        Ok(sketch)
    }

    /// Wraps an updatable byte image as a writable sketch that mutates the
    /// region in place.
    pub fn wrap_updatable(region: &'a mut [u8]) -> Result<Self, Error> {
        Self::wrap_updatable_internal(region, None)
    }

    /// Like [`Self::wrap_updatable`], with a provider consulted when the
    /// region must grow.
    pub fn wrap_updatable_with_provider(
        region: &'a mut [u8],
        provider: &'a mut dyn MemoryProvider<'a>,
    ) -> Result<Self, Error> {
        Self::wrap_updatable_internal(region, Some(provider))
    }

    fn wrap_updatable_internal(
        region: &'a mut [u8],
        provider: Option<&'a mut dyn MemoryProvider<'a>>,
    ) -> Result<Self, Error> {
        let pre = Preamble::read(region)?;
        if !pre.is_updatable() {
            return Err(Error::corrupt(format!(
                "wrap_updatable requires serial version {SER_VER_UPDATABLE}, got {}",
                pre.ser_ver
            )));
        }
        check_item_type::<T>(&pre)?;

        let num_levels = pre.num_levels as usize;
        if region.len() < PREAMBLE_FULL_BYTES + 4 * (num_levels + 1) {
            return Err(Error::insufficient_data("levels array"));
        }
        let mut levels = Vec::with_capacity(num_levels + 1);
        for index in 0..=num_levels {
            let at = PREAMBLE_FULL_BYTES + 4 * index;
            levels.push(LittleEndian::read_u32(&region[at..at + 4]));
        }
        for window in levels.windows(2) {
            if window[1] < window[0] {
                return Err(Error::corrupt("level offsets must be non-decreasing"));
            }
        }
        let capacity = compute_total_capacity(pre.k, pre.m, num_levels);
        if levels[num_levels] != capacity {
            return Err(Error::corrupt(format!(
                "top level offset {} must equal capacity {capacity}",
                levels[num_levels]
            )));
        }

        let required = updatable_image_size::<T>(num_levels, capacity as usize);
        if region.len() < required {
            return Err(Error::corrupt(format!(
                "updatable image requires {required} bytes, region has {}",
                region.len()
            )));
        }

        let sizes: Vec<usize> = levels
            .windows(2)
            .map(|pair| (pair[1] - pair[0]) as usize)
            .collect();
        if sum_the_sample_weights(&sizes) != pre.n {
            return Err(Error::corrupt("level sizes do not sum to n"));
        }

        let min_off = PREAMBLE_FULL_BYTES + 4 * (num_levels + 1);
        let items_off = min_off + 2 * T::SIZE_BYTES;
        let (min_item, max_item) = if pre.n > 0 {
            (
                Some(T::read_le(&region[min_off..])),
                Some(T::read_le(&region[min_off + T::SIZE_BYTES..])),
            )
        } else {
            (None, None)
        };

        let mut sketch = Self::make(
            pre.k,
            pre.m,
            levels,
            Items::WritableMem {
                region,
                items_off,
                provider,
            },
        );
        sketch.min_k = pre.min_k;
        sketch.n = pre.n;
        sketch.min_item = min_item;
        sketch.max_item = max_item;
        sketch.is_level_zero_sorted = pre.is_level_zero_sorted();
        Ok(sketch)
    }

    /// Serialized size of the compact image [`Self::to_bytes`] would emit.
    pub fn serialized_size_bytes(&self) -> usize {
        if self.is_empty() {
            return PREAMBLE_SHORT_BYTES;
        }
        if self.n == 1 {
            return PREAMBLE_SHORT_BYTES + T::SIZE_BYTES;
        }
        PREAMBLE_FULL_BYTES + 4 * self.num_levels() + (2 + self.num_retained()) * T::SIZE_BYTES
    }

    /// Serialized size of the updatable image [`Self::to_updatable_bytes`]
    /// would emit.
    pub fn updatable_serialized_size_bytes(&self) -> usize {
        let num_levels = self.num_levels();
        let capacity = compute_total_capacity(self.k, self.m, num_levels) as usize;
        updatable_image_size::<T>(num_levels, capacity)
    }

    /// Serializes the sketch to the compact image, the canonical interchange
    /// form. Level 0 is emitted sorted.
    pub fn to_bytes(&self) -> Vec<u8> {
        let size = self.serialized_size_bytes();
        let mut bytes = SketchBytes::with_capacity(size);

        let is_empty = self.is_empty();
        let is_single = self.n == 1;

        let preamble_ints = if is_empty || is_single {
            PREAMBLE_INTS_SHORT
        } else {
            PREAMBLE_INTS_FULL
        };
        let ser_ver = if is_single {
            SER_VER_SINGLE
        } else {
            SER_VER_COMPACT
        };
        let mut flags = 0u8;
        if is_empty {
            flags |= FLAG_EMPTY;
        } else {
            // the writer always emits level 0 sorted
            flags |= FLAG_LEVEL_ZERO_SORTED;
        }
        if is_single {
            flags |= FLAG_SINGLE_ITEM;
        }
        if T::IS_DOUBLE {
            flags |= FLAG_DOUBLES_SKETCH;
        }

        bytes.write_u8(preamble_ints);
        bytes.write_u8(ser_ver);
        bytes.write_u8(KLL_FAMILY_ID);
        bytes.write_u8(flags);
        bytes.write_u16_le(self.k);
        bytes.write_u8(self.m);
        bytes.write_u8(0);

        if is_empty {
            return bytes.into_bytes();
        }

        if is_single {
            T::write_item(self.items.get(self.levels[0] as usize), &mut bytes);
            return bytes.into_bytes();
        }

        bytes.write_u64_le(self.n);
        bytes.write_u16_le(self.min_k);
        bytes.write_u16_le(self.num_levels() as u16);

        // offsets normalized to the start of the retained items; the
        // implicit top offset is the retained count
        let base = self.levels[0];
        for level in 0..self.num_levels() {
            bytes.write_u32_le(self.levels[level] - base);
        }

        if let Some(min) = self.min_item {
            T::write_item(min, &mut bytes);
        }
        if let Some(max) = self.max_item {
            T::write_item(max, &mut bytes);
        }

        let mut level0 = self
            .items
            .read_range(self.levels[0] as usize..self.levels[1] as usize);
        level0.sort_by(T::cmp);
        for value in level0 {
            T::write_item(value, &mut bytes);
        }
        for index in self.levels[1]..self.levels[self.num_levels()] {
            T::write_item(self.items.get(index as usize), &mut bytes);
        }

        debug_assert_eq!(bytes.len(), size);
        bytes.into_bytes()
    }

    /// Serializes the sketch to an updatable image at full capacity,
    /// suitable for in-place mutation through [`Self::wrap_updatable`].
    pub fn to_updatable_bytes(&self) -> Vec<u8> {
        let num_levels = self.num_levels();
        let capacity = compute_total_capacity(self.k, self.m, num_levels) as usize;
        let retained = self.num_retained();
        let garbage = capacity - retained;
        let size = updatable_image_size::<T>(num_levels, capacity);
        let mut out = vec![0u8; size];

        Preamble {
            preamble_ints: PREAMBLE_INTS_FULL,
            ser_ver: SER_VER_UPDATABLE,
            flags: self.region_flags(),
            k: self.k,
            m: self.m,
            n: self.n,
            min_k: self.min_k,
            num_levels: num_levels as u16,
        }
        .write(&mut out);

        // offsets rebased so the leading garbage matches the capacity
        // schedule regardless of this sketch's backing
        let base = self.levels[0] as usize;
        for (index, &offset) in self.levels.iter().enumerate() {
            let rebased = (offset as usize - base + garbage) as u32;
            let at = PREAMBLE_FULL_BYTES + 4 * index;
            LittleEndian::write_u32(&mut out[at..at + 4], rebased);
        }

        let min_off = PREAMBLE_FULL_BYTES + 4 * (num_levels + 1);
        if let Some(min) = self.min_item {
            T::write_le(min, &mut out[min_off..]);
        }
        if let Some(max) = self.max_item {
            T::write_le(max, &mut out[min_off + T::SIZE_BYTES..]);
        }

        let items_off = min_off + 2 * T::SIZE_BYTES;
        for (slot, index) in (garbage..).zip(self.levels[0]..self.levels[num_levels]) {
            let at = items_off + slot * T::SIZE_BYTES;
            T::write_le(self.items.get(index as usize), &mut out[at..]);
        }

        out
    }

    /// Writes the immutable header bytes of an updatable region. The
    /// mutable fields are kept current by `sync_region`.
    fn init_region_header(&mut self) {
        let k = self.k;
        let m = self.m;
        if let Items::WritableMem { region, .. } = &mut self.items {
            region[0] = PREAMBLE_INTS_FULL;
            region[1] = SER_VER_UPDATABLE;
            region[2] = KLL_FAMILY_ID;
            // flags written by sync_region
            LittleEndian::write_u16(&mut region[4..6], k);
            region[6] = m;
            region[7] = 0;
        }
    }
}

fn read_compact_offsets(
    bytes: &[u8],
    num_levels: usize,
    items_off: usize,
) -> Result<Vec<u32>, Error> {
    if bytes.len() < items_off {
        return Err(Error::insufficient_data("levels array"));
    }
    let mut cursor = SketchSlice::new(bytes);
    cursor.skip(PREAMBLE_FULL_BYTES as u64);
    let mut offsets = Vec::with_capacity(num_levels + 1);
    for _ in 0..num_levels {
        let offset = cursor
            .read_u32_le()
            .map_err(|_| Error::insufficient_data("levels"))?;
        offsets.push(offset);
    }
    Ok(offsets)
}

fn compact_retained_count<T: KllItem>(bytes: &[u8], items_off: usize) -> Result<usize, Error> {
    let items_bytes = bytes.len() - items_off;
    if items_bytes % T::SIZE_BYTES != 0 {
        return Err(Error::corrupt(format!(
            "trailing item bytes {items_bytes} not a multiple of the item size"
        )));
    }
    Ok(items_bytes / T::SIZE_BYTES)
}

fn validate_compact_shape(
    pre: &Preamble,
    relative: &[u32],
    retained: usize,
) -> Result<(), Error> {
    if relative.first() != Some(&0) {
        return Err(Error::corrupt(
            "compact level offsets must start at zero",
        ));
    }
    for window in relative.windows(2) {
        if window[1] < window[0] {
            return Err(Error::corrupt("level offsets must be non-decreasing"));
        }
    }
    if let Some(&last) = relative.last() {
        if (last as usize) > retained {
            return Err(Error::corrupt("level offsets exceed the retained count"));
        }
    }

    let mut sizes: Vec<usize> = relative
        .windows(2)
        .map(|pair| (pair[1] - pair[0]) as usize)
        .collect();
    let top_base = relative.last().copied().unwrap_or(0) as usize;
    sizes.push(retained - top_base);
    if sum_the_sample_weights(&sizes) != pre.n {
        return Err(Error::corrupt("level sizes do not sum to n"));
    }
    Ok(())
}
