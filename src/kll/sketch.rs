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

use std::cell::RefCell;
use std::cmp::Ordering;

use byteorder::ByteOrder;
use byteorder::LittleEndian;

use super::DEFAULT_K;
use super::DEFAULT_M;
use super::MAX_K;
use super::MIN_K;
use super::VALID_M;
use super::helper::compute_total_capacity;
use super::helper::level_capacity;
use super::helper::normalized_rank_error_for_k;
use super::helper::sum_the_sample_weights;
use super::preamble;
use super::preamble::FLAG_DOUBLES_SKETCH;
use super::preamble::FLAG_EMPTY;
use super::preamble::FLAG_LEVEL_ZERO_SORTED;
use super::preamble::FLAG_UPDATABLE;
use super::preamble::PREAMBLE_FULL_BYTES;
use super::serialization::updatable_image_size;
use super::sorted_view::SortedView;
use super::store::Items;
use crate::codec::SketchBytes;
use crate::codec::SketchSlice;
use crate::common::RandomSource;
use crate::common::XorShift64;
use crate::error::Error;

/// Trait implemented by item types supported by [`KllSketch`].
pub(crate) trait KllItem: Copy + PartialEq + Default + std::fmt::Debug {
    /// Serialized size of one item in bytes.
    const SIZE_BYTES: usize;

    /// True for the 64-bit item type; drives the doubles-sketch image flag.
    const IS_DOUBLE: bool;

    /// Name used in type-mismatch diagnostics.
    const TYPE_NAME: &'static str;

    /// Compare two items by total order.
    fn cmp(a: &Self, b: &Self) -> Ordering;

    /// Returns true if the item is NaN.
    fn is_nan(value: &Self) -> bool;

    /// Reads one item from the start of a little-endian byte region.
    fn read_le(bytes: &[u8]) -> Self;

    /// Writes one item at the start of a little-endian byte region.
    fn write_le(value: Self, out: &mut [u8]);

    /// Reads one item from a cursor.
    fn read_item(input: &mut SketchSlice<'_>) -> Result<Self, Error>;

    /// Appends one item to a byte writer.
    fn write_item(value: Self, bytes: &mut SketchBytes);
}

/// KLL sketch for estimating quantiles and ranks.
///
/// The sketch keeps its retained items in a flat array partitioned into
/// levels by the offsets in `levels`; an item at level `i` carries weight
/// `2^i`. Level 0 occupies `[levels[0], levels[1])` and grows downward into
/// the reserved space below `levels[0]`; levels at or above 1 are always
/// sorted.
///
/// The lifetime parameter ties a memory-backed sketch to the byte region it
/// borrows; heap sketches are `'static`.
///
/// See the [kll module level documentation](crate::kll) for more.
#[allow(private_bounds)]
#[derive(Debug)]
pub struct KllSketch<'a, T: KllItem> {
    pub(super) k: u16,
    pub(super) m: u8,
    pub(super) min_k: u16,
    pub(super) n: u64,
    pub(super) is_level_zero_sorted: bool,
    pub(super) levels: Vec<u32>,
    pub(super) items: Items<'a, T>,
    pub(super) min_item: Option<T>,
    pub(super) max_item: Option<T>,
    pub(super) sorted_view: RefCell<Option<SortedView<T>>>,
    pub(super) rng: XorShift64,
}

impl<T: KllItem> Default for KllSketch<'_, T> {
    fn default() -> Self {
        Self::make_heap(DEFAULT_K, DEFAULT_M)
    }
}

#[allow(private_bounds)]
impl<T: KllItem> KllSketch<'static, T> {
    /// Creates a new heap sketch with the given value of k and the default m.
    ///
    /// Fails with `InvalidArgument` if k is outside `[m, 65535]`.
    ///
    /// # Examples
    ///
    /// ```
    /// # use kll_quantiles::kll::KllSketch;
    /// let sketch = KllSketch::<f64>::new(200).unwrap();
    /// assert_eq!(sketch.k(), 200);
    /// ```
    pub fn new(k: u16) -> Result<Self, Error> {
        Self::new_with_m(k, DEFAULT_M)
    }

    /// Creates a new heap sketch with the given k and minimum level width m.
    pub fn new_with_m(k: u16, m: u8) -> Result<Self, Error> {
        check_k_and_m(k, m)?;
        Ok(Self::make_heap(k, m))
    }
}

#[allow(private_bounds)]
impl<'a, T: KllItem> KllSketch<'a, T> {
    pub(super) fn make_heap(k: u16, m: u8) -> Self {
        Self::make(
            k,
            m,
            vec![k as u32, k as u32],
            Items::Heap(vec![T::default(); k as usize]),
        )
    }

    pub(super) fn make(k: u16, m: u8, levels: Vec<u32>, items: Items<'a, T>) -> Self {
        KllSketch {
            k,
            m,
            min_k: k,
            n: 0,
            is_level_zero_sorted: false,
            levels,
            items,
            min_item: None,
            max_item: None,
            sorted_view: RefCell::new(None),
            rng: XorShift64::default(),
        }
    }

    /// Returns parameter k used to configure this sketch.
    pub fn k(&self) -> u16 {
        self.k
    }

    /// Returns the minimum level width m.
    pub fn m(&self) -> u8 {
        self.m
    }

    /// Returns the minimum k this sketch has seen through merging.
    pub fn min_k(&self) -> u16 {
        self.min_k
    }

    /// Returns total weight of the stream.
    pub fn n(&self) -> u64 {
        self.n
    }

    /// Returns true if the sketch has not seen any data.
    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// Returns true if this sketch cannot be mutated.
    pub fn is_read_only(&self) -> bool {
        self.items.is_read_only()
    }

    /// Returns the current number of levels.
    pub fn num_levels(&self) -> usize {
        self.levels.len() - 1
    }

    /// Returns the number of retained items.
    pub fn num_retained(&self) -> usize {
        (self.levels[self.num_levels()] - self.levels[0]) as usize
    }

    /// Returns true if the sketch is in estimation mode.
    pub fn is_estimation_mode(&self) -> bool {
        self.num_levels() > 1
    }

    /// Returns the minimum item seen by the sketch, exactly.
    pub fn min_item(&self) -> Option<T> {
        self.min_item
    }

    /// Returns the maximum item seen by the sketch, exactly.
    pub fn max_item(&self) -> Option<T> {
        self.max_item
    }

    /// Reseeds the compaction parity source.
    ///
    /// The drop parity of each compaction is the only randomness the sketch
    /// consumes; a fixed seed makes the sketch fully deterministic for a
    /// given input sequence.
    pub fn set_random_seed(&mut self, seed: u64) {
        self.rng = XorShift64::seeded(seed);
    }

    /// Updates the sketch with a new item.
    ///
    /// NaN values are ignored: they do not change `n` or the min/max items.
    /// Fails with `ReadOnly` on a read-only sketch, or `InsufficientSpace`
    /// when a memory-backed sketch cannot grow; in both cases the sketch is
    /// unchanged.
    pub fn update(&mut self, item: T) -> Result<(), Error> {
        if self.items.is_read_only() {
            return Err(Error::read_only("update"));
        }
        if T::is_nan(&item) {
            return Ok(());
        }

        debug_assert!(self.levels[0] > 0, "level 0 must have a free slot");
        let was_sorted = self.is_level_zero_sorted;
        let at = self.levels[0] as usize - 1;
        self.items.set(at, item);
        self.levels[0] -= 1;
        self.is_level_zero_sorted = false;

        if self.levels[0] == 0 {
            if let Err(err) = self.compress_while_updating() {
                // roll back the insert; the value left in the reserved space
                // below levels[0] is garbage
                self.levels[0] += 1;
                self.is_level_zero_sorted = was_sorted;
                return Err(err);
            }
        }

        self.n += 1;
        self.update_min_max(item);
        self.invalidate_sorted_view();
        self.sync_region();
        Ok(())
    }

    /// Merges another sketch into this one.
    ///
    /// Merging an empty sketch is the identity. Fails with `ReadOnly` on a
    /// read-only target and `InsufficientSpace` when a memory-backed target
    /// cannot grow; the target is unchanged on error.
    pub fn merge(&mut self, other: &KllSketch<'_, T>) -> Result<(), Error> {
        if self.items.is_read_only() {
            return Err(Error::read_only("merge"));
        }
        if self.m != other.m {
            return Err(Error::invalid_argument(format!(
                "incompatible m values: {} and {}",
                self.m, other.m
            )));
        }
        if other.is_empty() {
            return Ok(());
        }

        let final_n = self.n + other.n;
        let self_vecs = self.level_vecs();
        let other_vecs = other.level_vecs();

        let sorted0 = if self_vecs[0].is_empty() && other_vecs[0].is_empty() {
            true
        } else if self_vecs[0].is_empty() {
            other.is_level_zero_sorted
        } else if other_vecs[0].is_empty() {
            self.is_level_zero_sorted
        } else {
            false
        };

        let work_len = self_vecs.len().max(other_vecs.len());
        let mut work: Vec<Vec<T>> = vec![Vec::new(); work_len];
        let mut sources = [self_vecs, other_vecs];
        for source in sources.iter_mut() {
            let mut level0 = std::mem::take(&mut source[0]);
            work[0].append(&mut level0);
        }
        for level in 1..work_len {
            let left = sources[0].get_mut(level).map(std::mem::take).unwrap_or_default();
            let right = sources[1].get_mut(level).map(std::mem::take).unwrap_or_default();
            work[level] = if left.is_empty() {
                right
            } else if right.is_empty() {
                left
            } else {
                merge_sorted_vecs(left, right)
            };
        }

        let (mut out, mut out_sorted0) =
            general_compress(self.k, self.m, work, sorted0, &mut self.rng);
        // eager schedule: leave room for at least one more level-0 item
        while out.iter().map(Vec::len).sum::<usize>()
            >= compute_total_capacity(self.k, self.m, out.len()) as usize
        {
            let (next, next_sorted0) =
                general_compress(self.k, self.m, out, out_sorted0, &mut self.rng);
            out = next;
            out_sorted0 = next_sorted0;
        }

        self.commit_levels(&out, out_sorted0)?;

        self.n = final_n;
        self.update_min_max_from_other(other);
        if other.is_estimation_mode() {
            self.min_k = self.min_k.min(other.min_k);
        }
        self.invalidate_sorted_view();
        self.sync_region();

        debug_assert_eq!(self.total_weight(), self.n, "total weight does not match n");
        Ok(())
    }

    /// Returns the sketch to its initial empty state with the same k.
    pub fn reset(&mut self) -> Result<(), Error> {
        if self.items.is_read_only() {
            return Err(Error::read_only("reset"));
        }
        let k = self.k as usize;
        match &mut self.items {
            Items::Heap(buf) => *buf = vec![T::default(); k],
            Items::ReadOnlyMem { .. } => unreachable!("read-only store"),
            Items::WritableMem { items_off, .. } => {
                // one level again: the region held at least this layout at
                // construction time and regions never shrink
                *items_off = PREAMBLE_FULL_BYTES + 4 * 2 + 2 * T::SIZE_BYTES;
            }
        }
        self.levels = vec![self.k as u32, self.k as u32];
        self.n = 0;
        self.min_k = self.k;
        self.is_level_zero_sorted = false;
        self.min_item = None;
        self.max_item = None;
        self.invalidate_sorted_view();
        self.sync_region();
        Ok(())
    }

    /// Returns the normalized rank of the given item.
    ///
    /// Fails with `EmptySketch` if the sketch holds no data.
    pub fn rank(&self, item: T, inclusive: bool) -> Result<f64, Error> {
        if T::is_nan(&item) {
            return Err(Error::invalid_argument("rank operand must not be NaN"));
        }
        self.with_sorted_view("rank", |view| view.rank(&item, inclusive))
    }

    /// Returns the quantile for the given normalized rank in `[0.0, 1.0]`.
    ///
    /// Rank 0 returns the exact minimum and rank 1 the exact maximum.
    pub fn quantile(&self, rank: f64, inclusive: bool) -> Result<T, Error> {
        if self.is_empty() {
            return Err(Error::empty_sketch("quantile"));
        }
        if !(0.0..=1.0).contains(&rank) {
            return Err(Error::invalid_argument(format!(
                "rank must be in [0.0, 1.0], got {rank}"
            )));
        }
        if rank == 0.0 {
            if let Some(min) = self.min_item {
                return Ok(min);
            }
        }
        if rank == 1.0 {
            if let Some(max) = self.max_item {
                return Ok(max);
            }
        }
        self.with_sorted_view("quantile", |view| view.quantile(rank, inclusive))
    }

    /// Returns the approximate CDF at the given split points.
    ///
    /// Split points must be unique, non-NaN, and strictly increasing. The
    /// result has one more entry than `split_points`; the last entry is 1.
    pub fn cdf(&self, split_points: &[T], inclusive: bool) -> Result<Vec<f64>, Error> {
        check_split_points(split_points)?;
        self.with_sorted_view("cdf", |view| view.cdf(split_points, inclusive))
    }

    /// Returns the approximate PMF over the buckets defined by the given
    /// split points; the adjacent differences of [`Self::cdf`].
    pub fn pmf(&self, split_points: &[T], inclusive: bool) -> Result<Vec<f64>, Error> {
        check_split_points(split_points)?;
        self.with_sorted_view("pmf", |view| view.pmf(split_points, inclusive))
    }

    /// Returns the normalized rank error of this sketch at 99% confidence:
    /// single-sided for rank/quantile queries (`pmf == false`), double-sided
    /// for PMF/CDF buckets (`pmf == true`).
    ///
    /// Reported from `min_k`, so merging in a sketch built with a smaller k
    /// widens the bound.
    pub fn normalized_rank_error(&self, pmf: bool) -> f64 {
        normalized_rank_error_for_k(self.min_k, pmf)
    }

    /// Returns an iterator over `(item, weight)` pairs in physical storage
    /// order: level 0 first, then ascending levels. The order is not sorted.
    pub fn iter(&self) -> KllIter<'_, 'a, T> {
        KllIter {
            sketch: self,
            level: 0,
            index: self.levels[0] as usize,
        }
    }

    pub(super) fn level_vecs(&self) -> Vec<Vec<T>> {
        (0..self.num_levels())
            .map(|level| {
                self.items
                    .read_range(self.levels[level] as usize..self.levels[level + 1] as usize)
            })
            .collect()
    }

    fn with_sorted_view<R>(
        &self,
        op: &'static str,
        f: impl FnOnce(&SortedView<T>) -> R,
    ) -> Result<R, Error> {
        if self.is_empty() {
            return Err(Error::empty_sketch(op));
        }
        let mut cache = self.sorted_view.borrow_mut();
        let view = cache.get_or_insert_with(|| SortedView::build(&self.levels, &self.items));
        Ok(f(view))
    }

    pub(super) fn invalidate_sorted_view(&self) {
        *self.sorted_view.borrow_mut() = None;
    }

    fn update_min_max(&mut self, item: T) {
        match self.min_item {
            None => {
                self.min_item = Some(item);
                self.max_item = Some(item);
            }
            Some(min) => {
                if T::cmp(&item, &min) == Ordering::Less {
                    self.min_item = Some(item);
                }
                if let Some(max) = self.max_item {
                    if T::cmp(&max, &item) == Ordering::Less {
                        self.max_item = Some(item);
                    }
                }
            }
        }
    }

    fn update_min_max_from_other(&mut self, other: &KllSketch<'_, T>) {
        match (self.min_item, self.max_item) {
            (Some(min), Some(max)) => {
                if let Some(other_min) = other.min_item {
                    if T::cmp(&other_min, &min) == Ordering::Less {
                        self.min_item = Some(other_min);
                    }
                }
                if let Some(other_max) = other.max_item {
                    if T::cmp(&max, &other_max) == Ordering::Less {
                        self.max_item = Some(other_max);
                    }
                }
            }
            _ => {
                self.min_item = other.min_item;
                self.max_item = other.max_item;
            }
        }
    }

    fn find_level_to_compact(&self) -> usize {
        let num_levels = self.num_levels();
        for level in 0..num_levels {
            let pop = (self.levels[level + 1] - self.levels[level]) as usize;
            let cap = level_capacity(self.k, num_levels, level, self.m) as usize;
            if pop >= cap {
                return level;
            }
        }
        panic!("no level to compact");
    }

    /// Compacts the lowest over-capacity level into the level above,
    /// recycling the freed slots into level 0.
    fn compress_while_updating(&mut self) -> Result<(), Error> {
        let level = self.find_level_to_compact();
        // growing must happen first: it shifts the data and the level
        // boundaries, and it is the only step that can fail
        if level == self.num_levels() - 1 {
            self.add_empty_top_level()?;
        }

        let raw_beg = self.levels[level] as usize;
        let raw_end = self.levels[level + 1] as usize;
        let raw_pop = raw_end - raw_beg;
        let odd_pop = raw_pop % 2 == 1;
        let adj_beg = if odd_pop { raw_beg + 1 } else { raw_beg };
        let adj_pop = if odd_pop { raw_pop - 1 } else { raw_pop };
        let half_adj_pop = adj_pop / 2;
        let pop_above = self.levels[level + 2] as usize - raw_end;

        if level == 0 && !self.is_level_zero_sorted {
            self.items.sort_range(adj_beg..adj_beg + adj_pop);
        }

        let offset = self.rng.next_bit() as usize;
        let keep_parity = if pop_above == 0 { 1 - offset } else { offset };
        let promoted: Vec<T> = (0..half_adj_pop)
            .map(|j| self.items.get(adj_beg + 2 * j + keep_parity))
            .collect();

        if pop_above == 0 {
            // the kept half becomes the level above in place
            self.items.write_range(raw_end - half_adj_pop, &promoted);
        } else {
            self.merge_with_level_above(&promoted, raw_end, pop_above, adj_beg + half_adj_pop);
        }
        self.levels[level + 1] -= half_adj_pop as u32;

        if odd_pop {
            // the leftover item is all that remains of this level
            self.levels[level] = self.levels[level + 1] - 1;
            let leftover_dst = self.levels[level] as usize;
            if leftover_dst != raw_beg {
                let leftover = self.items.get(raw_beg);
                self.items.set(leftover_dst, leftover);
            }
        } else {
            self.levels[level] = self.levels[level + 1];
        }
        debug_assert_eq!(
            self.levels[level] as usize,
            raw_beg + half_adj_pop,
            "compaction must free exactly half the adjusted population"
        );

        if level > 0 {
            // shift the levels below upward so the freed slots reach level 0
            let bottom = self.levels[0] as usize;
            let amount = raw_beg - bottom;
            self.items
                .copy_within(bottom..bottom + amount, bottom + half_adj_pop);
            for lvl in 0..level {
                self.levels[lvl] += half_adj_pop as u32;
            }
        }

        if level == 0 {
            // at most the leftover remains
            self.is_level_zero_sorted = true;
        }
        Ok(())
    }

    /// Forward-merges `promoted` with the sorted run at
    /// `[above_start, above_start + above_len)` into `dst`. The destination
    /// never overtakes the unread part of the run above.
    fn merge_with_level_above(
        &mut self,
        promoted: &[T],
        above_start: usize,
        above_len: usize,
        dst: usize,
    ) {
        let mut i = 0;
        let mut j = 0;
        let mut out = dst;
        while i < promoted.len() && j < above_len {
            let above = self.items.get(above_start + j);
            if T::cmp(&above, &promoted[i]) == Ordering::Less {
                self.items.set(out, above);
                j += 1;
            } else {
                self.items.set(out, promoted[i]);
                i += 1;
            }
            out += 1;
        }
        while i < promoted.len() {
            self.items.set(out, promoted[i]);
            i += 1;
            out += 1;
        }
        while j < above_len {
            let above = self.items.get(above_start + j);
            self.items.set(out, above);
            j += 1;
            out += 1;
        }
    }

    /// Appends a new empty top level, growing the items storage by the new
    /// level-0 capacity and shifting existing data upward.
    fn add_empty_top_level(&mut self) -> Result<(), Error> {
        let num_levels = self.num_levels();
        let cur_total = self.levels[num_levels] as usize;
        let delta = level_capacity(self.k, num_levels + 1, 0, self.m) as usize;
        let new_total = cur_total + delta;

        if matches!(self.items, Items::WritableMem { .. }) {
            let retained_beg = self.levels[0] as usize;
            let retained = self.items.read_range(retained_beg..cur_total);
            self.ensure_writable_layout(num_levels + 1, new_total)?;
            self.items.write_range(retained_beg + delta, &retained);
        } else if let Items::Heap(buf) = &mut self.items {
            let mut grown = vec![T::default(); new_total];
            grown[delta..delta + cur_total].copy_from_slice(buf);
            *buf = grown;
        }

        for offset in self.levels.iter_mut() {
            *offset += delta as u32;
        }
        self.levels.push(new_total as u32);
        Ok(())
    }

    /// Makes the writable region large enough for an updatable image with
    /// the given shape and points the items view at the new layout. Asks the
    /// memory provider when the current region is too small; a refusal
    /// leaves the sketch untouched.
    fn ensure_writable_layout(&mut self, num_levels: usize, total_capacity: usize) -> Result<(), Error> {
        let required = updatable_image_size::<T>(num_levels, total_capacity);
        let Items::WritableMem {
            region,
            items_off,
            provider,
        } = &mut self.items
        else {
            return Ok(());
        };
        if region.len() < required {
            let Some(request) = provider else {
                return Err(Error::insufficient_space(required, region.len()));
            };
            let grown = request.request(&region[..], required)?;
            debug_assert!(grown.len() >= required, "provider returned a short region");
            *region = grown;
        }
        *items_off = PREAMBLE_FULL_BYTES + 4 * (num_levels + 1) + 2 * T::SIZE_BYTES;
        Ok(())
    }

    /// Replaces the level structure and items with the given per-level
    /// contents, rebuilding the backing storage for the new shape.
    fn commit_levels(&mut self, level_vecs: &[Vec<T>], level_zero_sorted: bool) -> Result<(), Error> {
        let num_levels = level_vecs.len();
        let total = compute_total_capacity(self.k, self.m, num_levels) as usize;
        let retained: usize = level_vecs.iter().map(Vec::len).sum();
        debug_assert!(retained < total, "commit requires a free level-0 slot");
        let garbage = total - retained;

        if let Items::Heap(buf) = &mut self.items {
            let mut grown = vec![T::default(); total];
            let mut at = garbage;
            for level in level_vecs {
                for &value in level {
                    grown[at] = value;
                    at += 1;
                }
            }
            *buf = grown;
        } else {
            debug_assert!(!self.items.is_read_only(), "commit on read-only store");
            self.ensure_writable_layout(num_levels, total)?;
            let mut at = garbage;
            for level in level_vecs {
                self.items.write_range(at, level);
                at += level.len();
            }
        }

        let mut levels = Vec::with_capacity(num_levels + 1);
        let mut offset = garbage as u32;
        levels.push(offset);
        for level in level_vecs {
            offset += level.len() as u32;
            levels.push(offset);
        }
        self.levels = levels;
        self.is_level_zero_sorted = level_zero_sorted;
        Ok(())
    }

    /// Write-through of the mutable preamble fields, the levels array, and
    /// min/max for memory-backed writable sketches; no-op on other backings.
    pub(super) fn sync_region(&mut self) {
        let flags = self.region_flags();
        let num_levels = self.num_levels() as u16;
        let n = self.n;
        let min_k = self.min_k;
        let min_off = PREAMBLE_FULL_BYTES + 4 * self.levels.len();
        let levels = &self.levels;
        let min_item = self.min_item;
        let max_item = self.max_item;
        if let Items::WritableMem { region, .. } = &mut self.items {
            preamble::insert_n(region, n);
            preamble::insert_min_k(region, min_k);
            preamble::insert_num_levels(region, num_levels);
            preamble::insert_flags(region, flags);
            for (index, &offset) in levels.iter().enumerate() {
                let at = PREAMBLE_FULL_BYTES + 4 * index;
                LittleEndian::write_u32(&mut region[at..at + 4], offset);
            }
            if let Some(min) = min_item {
                T::write_le(min, &mut region[min_off..min_off + T::SIZE_BYTES]);
            }
            if let Some(max) = max_item {
                T::write_le(max, &mut region[min_off + T::SIZE_BYTES..min_off + 2 * T::SIZE_BYTES]);
            }
        }
    }

    pub(super) fn region_flags(&self) -> u8 {
        let mut flags = FLAG_UPDATABLE;
        if self.is_empty() {
            flags |= FLAG_EMPTY;
        }
        if self.is_level_zero_sorted {
            flags |= FLAG_LEVEL_ZERO_SORTED;
        }
        if T::IS_DOUBLE {
            flags |= FLAG_DOUBLES_SKETCH;
        }
        flags
    }

    fn total_weight(&self) -> u64 {
        let sizes: Vec<usize> = (0..self.num_levels())
            .map(|level| (self.levels[level + 1] - self.levels[level]) as usize)
            .collect();
        sum_the_sample_weights(&sizes)
    }
}

impl<'a, 'b, T: KllItem> PartialEq<KllSketch<'b, T>> for KllSketch<'a, T> {
    /// Equality on public state. Level 0 is compared as a sorted sequence
    /// because the compact serializer emits it sorted.
    fn eq(&self, other: &KllSketch<'b, T>) -> bool {
        if self.k != other.k
            || self.m != other.m
            || self.min_k != other.min_k
            || self.n != other.n
            || self.num_levels() != other.num_levels()
            || self.min_item != other.min_item
            || self.max_item != other.max_item
        {
            return false;
        }
        for level in 0..self.num_levels() {
            let mut left = self.items.read_range(
                self.levels[level] as usize..self.levels[level + 1] as usize,
            );
            let mut right = other.items.read_range(
                other.levels[level] as usize..other.levels[level + 1] as usize,
            );
            if level == 0 {
                left.sort_by(T::cmp);
                right.sort_by(T::cmp);
            }
            if left != right {
                return false;
            }
        }
        true
    }
}

/// Iterator over `(item, weight)` pairs in physical storage order.
///
/// Returned by [`KllSketch::iter`]; finite and not restartable.
#[allow(private_bounds)]
#[derive(Debug)]
pub struct KllIter<'s, 'a, T: KllItem> {
    sketch: &'s KllSketch<'a, T>,
    level: usize,
    index: usize,
}

#[allow(private_bounds)]
impl<T: KllItem> Iterator for KllIter<'_, '_, T> {
    type Item = (T, u64);

    fn next(&mut self) -> Option<(T, u64)> {
        let levels = &self.sketch.levels;
        let num_levels = levels.len() - 1;
        while self.level < num_levels {
            if self.index < levels[self.level + 1] as usize {
                let value = self.sketch.items.get(self.index);
                self.index += 1;
                return Some((value, 1u64 << self.level));
            }
            self.level += 1;
        }
        None
    }
}

pub(super) fn check_k_and_m(k: u16, m: u8) -> Result<(), Error> {
    if !VALID_M.contains(&m) {
        return Err(Error::invalid_argument(format!(
            "m must be one of {VALID_M:?}, got {m}"
        )));
    }
    if !(MIN_K..=MAX_K).contains(&k) || k < m as u16 {
        let floor = (m as u16).max(MIN_K);
        return Err(Error::invalid_argument(format!(
            "k must be in [{floor}, {MAX_K}], got {k}"
        )));
    }
    Ok(())
}

pub(super) fn check_split_points<T: KllItem>(split_points: &[T]) -> Result<(), Error> {
    for point in split_points {
        if T::is_nan(point) {
            return Err(Error::invalid_argument(
                "split points must not contain NaN values",
            ));
        }
    }
    for window in split_points.windows(2) {
        if T::cmp(&window[0], &window[1]) != Ordering::Less {
            return Err(Error::invalid_argument(
                "split points must be unique and monotonically increasing",
            ));
        }
    }
    Ok(())
}

/// Keeps every other item of a sorted even-length buffer, starting at a
/// random offset. When the output lands where a level above would be
/// (`use_up`), the kept parity flips so the selection matches an upward
/// in-place halving.
fn downsample<T: KllItem>(items: Vec<T>, offset: u32, use_up: bool) -> Vec<T> {
    let len = items.len();
    debug_assert!(len % 2 == 0, "length must be even");
    let offset = (offset & 1) as usize;
    let parity = if use_up { (len - 1 - offset) % 2 } else { offset };

    items
        .into_iter()
        .enumerate()
        .filter_map(|(idx, item)| if idx % 2 == parity { Some(item) } else { None })
        .collect()
}

fn merge_sorted_vecs<T: KllItem>(left: Vec<T>, right: Vec<T>) -> Vec<T> {
    let mut merged = Vec::with_capacity(left.len() + right.len());
    let mut left_iter = left.into_iter().peekable();
    let mut right_iter = right.into_iter().peekable();

    while let (Some(l), Some(r)) = (left_iter.peek(), right_iter.peek()) {
        if T::cmp(l, r) == Ordering::Less {
            merged.push(left_iter.next().unwrap());
        } else {
            merged.push(right_iter.next().unwrap());
        }
    }
    merged.extend(left_iter);
    merged.extend(right_iter);
    merged
}

/// Compacts a scratch level structure until it fits the capacity schedule
/// for its number of levels, growing the level count as needed. Returns the
/// compacted levels and whether level 0 ended sorted.
fn general_compress<T: KllItem>(
    k: u16,
    m: u8,
    mut levels_in: Vec<Vec<T>>,
    mut level_zero_sorted: bool,
    rng: &mut XorShift64,
) -> (Vec<Vec<T>>, bool) {
    let mut current_num_levels = levels_in.len();
    let mut current_item_count: usize = levels_in.iter().map(Vec::len).sum();
    let mut target_item_count = compute_total_capacity(k, m, current_num_levels) as usize;
    let mut levels_out = Vec::with_capacity(current_num_levels + 1);

    let mut current_level = 0usize;
    while current_level < current_num_levels {
        if current_level + 1 >= levels_in.len() {
            levels_in.push(Vec::new());
        }

        let raw_pop = levels_in[current_level].len();
        let cap = level_capacity(k, current_num_levels, current_level, m) as usize;

        if current_item_count < target_item_count || raw_pop < cap {
            levels_out.push(std::mem::take(&mut levels_in[current_level]));
        } else {
            let mut current = std::mem::take(&mut levels_in[current_level]);
            let above = std::mem::take(&mut levels_in[current_level + 1]);

            let mut leftover = None;
            if current.len() % 2 == 1 {
                leftover = Some(current.remove(0));
            }

            if current_level == 0 && !level_zero_sorted {
                current.sort_by(T::cmp);
                level_zero_sorted = true;
            }

            let use_up = above.is_empty();
            let promoted = downsample(current, rng.next_bit(), use_up);
            let promoted_len = promoted.len();
            levels_in[current_level + 1] = if above.is_empty() {
                promoted
            } else {
                merge_sorted_vecs(promoted, above)
            };

            let mut out_level = Vec::new();
            if let Some(item) = leftover {
                out_level.push(item);
            }
            levels_out.push(out_level);

            current_item_count -= promoted_len;

            if current_level == current_num_levels - 1 {
                current_num_levels += 1;
                target_item_count += level_capacity(k, current_num_levels, 0, m) as usize;
                if levels_in.len() < current_num_levels + 1 {
                    levels_in.resize_with(current_num_levels + 1, Vec::new);
                }
            }
        }
        current_level += 1;
    }

    levels_out.truncate(current_num_levels);
    (levels_out, level_zero_sorted)
}

impl KllItem for f32 {
    const SIZE_BYTES: usize = 4;
    const IS_DOUBLE: bool = false;
    const TYPE_NAME: &'static str = "f32";

    fn cmp(a: &Self, b: &Self) -> Ordering {
        a.partial_cmp(b).unwrap_or(Ordering::Greater)
    }

    fn is_nan(value: &Self) -> bool {
        value.is_nan()
    }

    fn read_le(bytes: &[u8]) -> Self {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&bytes[..4]);
        f32::from_le_bytes(buf)
    }

    fn write_le(value: Self, out: &mut [u8]) {
        out[..4].copy_from_slice(&value.to_le_bytes());
    }

    fn read_item(input: &mut SketchSlice<'_>) -> Result<Self, Error> {
        input
            .read_f32_le()
            .map_err(|_| Error::insufficient_data("f32"))
    }

    fn write_item(value: Self, bytes: &mut SketchBytes) {
        bytes.write_f32_le(value);
    }
}

impl KllItem for f64 {
    const SIZE_BYTES: usize = 8;
    const IS_DOUBLE: bool = true;
    const TYPE_NAME: &'static str = "f64";

    fn cmp(a: &Self, b: &Self) -> Ordering {
        a.partial_cmp(b).unwrap_or(Ordering::Greater)
    }

    fn is_nan(value: &Self) -> bool {
        value.is_nan()
    }

    fn read_le(bytes: &[u8]) -> Self {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes[..8]);
        f64::from_le_bytes(buf)
    }

    fn write_le(value: Self, out: &mut [u8]) {
        out[..8].copy_from_slice(&value.to_le_bytes());
    }

    fn read_item(input: &mut SketchSlice<'_>) -> Result<Self, Error> {
        input
            .read_f64_le()
            .map_err(|_| Error::insufficient_data("f64"))
    }

    fn write_item(value: Self, bytes: &mut SketchBytes) {
        bytes.write_f64_le(value);
    }
}
