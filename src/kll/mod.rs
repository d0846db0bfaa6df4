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

//! KLL sketch for estimating quantiles and ranks.
//!
//! KLL is a compact, streaming quantiles sketch with lazy level growth and
//! near-optimal accuracy per retained item. It supports one-pass updates,
//! merging, and approximate quantile, rank, PMF, and CDF queries.
//!
//! A sketch maintains a flat items array partitioned into levels by an
//! offsets array; an item at level `i` represents `2^i` stream values. Level
//! 0 grows downward into reserved space at the bottom of the array, and a
//! randomized compaction halves a level into the one above it whenever
//! level 0 fills up.
//!
//! Three storage backings share this one data type:
//! - heap: an owned buffer ([`KllSketch::new`]),
//! - read-only memory: a compact byte image queried in place without
//!   deserialization ([`KllSketch::wrap_compact`]),
//! - writable memory: an updatable byte image mutated in place over an
//!   externally owned region ([`KllSketch::new_direct`],
//!   [`KllSketch::wrap_updatable`]).
//!
//! # Usage
//!
//! ```rust
//! # use kll_quantiles::kll::KllSketch;
//! let mut sketch = KllSketch::<f64>::new(200).unwrap();
//! sketch.update(1.0).unwrap();
//! sketch.update(2.0).unwrap();
//! let q = sketch.quantile(0.5, true).unwrap();
//! assert!(q >= 1.0 && q <= 2.0);
//! ```

mod helper;
mod preamble;
mod serialization;
mod sketch;
mod sorted_view;
mod store;

pub use self::helper::k_from_epsilon;
pub use self::helper::normalized_rank_error_for_k;
pub use self::sketch::KllIter;
pub use self::sketch::KllSketch;
pub use self::store::MemoryProvider;

/// Default value of parameter k.
pub const DEFAULT_K: u16 = 200;
/// Default value of parameter m, the minimum level width.
pub const DEFAULT_M: u8 = 8;
/// Minimum value of parameter k; k must also be at least the sketch's m.
pub const MIN_K: u16 = VALID_M[0] as u16;
/// Maximum value of parameter k.
pub const MAX_K: u16 = u16::MAX;

/// Values of parameter m a sketch (or byte image) may carry.
pub(crate) const VALID_M: [u8; 4] = [2, 4, 6, 8];
