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

//! Streaming KLL quantile sketch.
//!
//! A KLL sketch consumes an unbounded stream of `f32` or `f64` values in a
//! single pass and answers approximate quantile, rank, CDF and PMF queries
//! with a normalized-rank error bound at 99% confidence, using sub-linear
//! memory.
//!
//! Sketches can live on the heap, be read in place from a compact byte image
//! without deserialization, or mutate in place over an externally owned
//! writable byte region. See [`kll::KllSketch`].
//!
//! # Usage
//!
//! ```rust
//! # use kll_quantiles::kll::KllSketch;
//! let mut sketch = KllSketch::<f64>::new(200).unwrap();
//! for i in 0..1000 {
//!     sketch.update(i as f64).unwrap();
//! }
//! let median = sketch.quantile(0.5, true).unwrap();
//! assert!(median >= 400.0 && median <= 600.0);
//! ```

mod codec;
pub mod common;
pub mod error;
pub mod kll;
