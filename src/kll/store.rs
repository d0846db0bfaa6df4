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

//! Backing storage for sketch items.
//!
//! A sketch's items live in one of three places: an owned heap buffer, a
//! read-only view over a compact byte image, or a writable view over an
//! updatable byte image in externally owned memory. The sketch addresses
//! items by index; the memory-backed variants translate indexes to packed
//! little-endian element offsets inside the region.

use std::fmt;
use std::ops::Range;

use super::sketch::KllItem;
use crate::error::Error;

/// Supplies a larger byte region when a writable memory-backed sketch
/// outgrows its current one.
///
/// On success, the contents of `current` must appear at the start of the
/// returned region, and the returned region must be at least
/// `required_bytes` long. On error nothing may have changed: the sketch
/// keeps its current region and the operation that triggered the request
/// fails with `InsufficientSpace`.
pub trait MemoryProvider<'a> {
    /// Trades the region holding `current` for one of at least
    /// `required_bytes`. The sketch releases its borrow of the old region
    /// once the call returns successfully.
    fn request(&mut self, current: &[u8], required_bytes: usize) -> Result<&'a mut [u8], Error>;
}

/// Items storage, one variant per backing.
pub(crate) enum Items<'a, T: KllItem> {
    /// Owned buffer; length equals the sketch capacity.
    Heap(Vec<T>),
    /// Borrowed read-only region of packed items starting at `items_off`.
    ReadOnlyMem { region: &'a [u8], items_off: usize },
    /// Borrowed writable updatable image; items start at `items_off`.
    WritableMem {
        region: &'a mut [u8],
        items_off: usize,
        provider: Option<&'a mut dyn MemoryProvider<'a>>,
    },
}

impl<T: KllItem> Items<'_, T> {
    pub fn is_read_only(&self) -> bool {
        matches!(self, Items::ReadOnlyMem { .. })
    }

    pub fn get(&self, index: usize) -> T {
        match self {
            Items::Heap(buf) => buf[index],
            Items::ReadOnlyMem { region, items_off } => {
                let at = items_off + index * T::SIZE_BYTES;
                T::read_le(&region[at..at + T::SIZE_BYTES])
            }
            Items::WritableMem {
                region, items_off, ..
            } => {
                let at = items_off + index * T::SIZE_BYTES;
                T::read_le(&region[at..at + T::SIZE_BYTES])
            }
        }
    }

    pub fn set(&mut self, index: usize, value: T) {
        match self {
            Items::Heap(buf) => buf[index] = value,
            Items::ReadOnlyMem { .. } => unreachable!("write to read-only store"),
            Items::WritableMem {
                region, items_off, ..
            } => {
                let at = *items_off + index * T::SIZE_BYTES;
                T::write_le(value, &mut region[at..at + T::SIZE_BYTES]);
            }
        }
    }

    /// Moves `src` to start at `dst_start`; ranges may overlap.
    pub fn copy_within(&mut self, src: Range<usize>, dst_start: usize) {
        match self {
            Items::Heap(buf) => buf.copy_within(src, dst_start),
            Items::ReadOnlyMem { .. } => unreachable!("write to read-only store"),
            Items::WritableMem {
                region, items_off, ..
            } => {
                let from = *items_off + src.start * T::SIZE_BYTES;
                let to = *items_off + src.end * T::SIZE_BYTES;
                let dst = *items_off + dst_start * T::SIZE_BYTES;
                region.copy_within(from..to, dst);
            }
        }
    }

    pub fn sort_range(&mut self, range: Range<usize>) {
        if let Items::Heap(buf) = self {
            buf[range].sort_by(T::cmp);
            return;
        }
        debug_assert!(!self.is_read_only(), "sort on read-only store");
        let mut scratch: Vec<T> = range.clone().map(|i| self.get(i)).collect();
        scratch.sort_by(T::cmp);
        for (offset, value) in scratch.into_iter().enumerate() {
            self.set(range.start + offset, value);
        }
    }

    /// Copies the given index range out into an owned buffer.
    pub fn read_range(&self, range: Range<usize>) -> Vec<T> {
        range.map(|i| self.get(i)).collect()
    }

    /// Writes `values` starting at `dst_start`.
    pub fn write_range(&mut self, dst_start: usize, values: &[T]) {
        for (offset, &value) in values.iter().enumerate() {
            self.set(dst_start + offset, value);
        }
    }
}

impl<T: KllItem> fmt::Debug for Items<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Items::Heap(buf) => f.debug_tuple("Heap").field(&buf.len()).finish(),
            Items::ReadOnlyMem { region, items_off } => f
                .debug_struct("ReadOnlyMem")
                .field("region_len", &region.len())
                .field("items_off", items_off)
                .finish(),
            Items::WritableMem {
                region,
                items_off,
                provider,
            } => f
                .debug_struct("WritableMem")
                .field("region_len", &region.len())
                .field("items_off", items_off)
                .field("has_provider", &provider.is_some())
                .finish(),
        }
    }
}
