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

//! Capacity schedule and accuracy math for the KLL sketch.

use super::DEFAULT_M;
use super::MAX_K;

const POWERS_OF_THREE: [u64; 31] = [
    1,
    3,
    9,
    27,
    81,
    243,
    729,
    2187,
    6561,
    19683,
    59049,
    177147,
    531441,
    1594323,
    4782969,
    14348907,
    43046721,
    129140163,
    387420489,
    1162261467,
    3486784401,
    10460353203,
    31381059609,
    94143178827,
    282429536481,
    847288609443,
    2541865828329,
    7625597484987,
    22876792454961,
    68630377364883,
    205891132094649,
];

/// Sum of level capacities for a sketch with `num_levels` levels.
pub fn compute_total_capacity(k: u16, m: u8, num_levels: usize) -> u32 {
    let mut total: u32 = 0;
    for level in 0..num_levels {
        total += level_capacity(k, num_levels, level, m);
    }
    total
}

/// Capacity of the level at the given height: `max(m, ceil(k * (2/3)^depth))`
/// where `depth = num_levels - height - 1`.
pub fn level_capacity(k: u16, num_levels: usize, height: usize, min_wid: u8) -> u32 {
    assert!(height < num_levels, "height must be < num_levels");
    let depth = num_levels - height - 1;
    let cap = int_cap_aux(k, depth as u8);
    std::cmp::max(min_wid as u32, cap as u32)
}

// Exact integer form of round(k * (2/3)^depth), composed for depths > 30
// where the powers-of-three table would overflow.
fn int_cap_aux(k: u16, depth: u8) -> u16 {
    if depth > 60 {
        panic!("depth must be <= 60");
    }
    if depth <= 30 {
        return int_cap_aux_aux(k, depth);
    }
    let half = depth / 2;
    let rest = depth - half;
    let tmp = int_cap_aux_aux(k, half);
    int_cap_aux_aux(tmp, rest)
}

fn int_cap_aux_aux(k: u16, depth: u8) -> u16 {
    if depth > 30 {
        panic!("depth must be <= 30");
    }
    let twok = (k as u64) << 1;
    let tmp = (twok << depth) / POWERS_OF_THREE[depth as usize];
    let result = (tmp + 1) >> 1;
    assert!(result <= k as u64, "capacity result exceeds k");
    result as u16
}

/// Weighted item count: level `i` sizes contribute with weight `2^i`.
pub fn sum_the_sample_weights(level_sizes: &[usize]) -> u64 {
    let mut total = 0u64;
    let mut weight = 1u64;
    for &size in level_sizes {
        total += weight * size as u64;
        weight <<= 1;
    }
    total
}

/// Normalized rank error of a sketch configured with the given k, at 99%
/// confidence.
///
/// With `pmf == false` this is the single-sided bound that applies to rank
/// and quantile queries; with `pmf == true` it is the double-sided bound for
/// PMF/CDF buckets.
pub fn normalized_rank_error_for_k(k: u16, pmf: bool) -> f64 {
    let k = k as f64;
    if pmf {
        2.446 / k.powf(0.9433)
    } else {
        2.296 / k.powf(0.9723)
    }
}

/// Smallest k whose normalized rank error does not exceed `epsilon`.
///
/// Inverse of [`normalized_rank_error_for_k`]. The result is clamped to the
/// valid range of k.
pub fn k_from_epsilon(epsilon: f64, pmf: bool) -> u16 {
    let eps = epsilon.max(6.395e-5);
    let kdbl = if pmf {
        ((2.446f64 / eps).ln() / 0.9433).exp()
    } else {
        ((2.296f64 / eps).ln() / 0.9723).exp()
    };
    let krnd = kdbl.round();
    let del = (krnd - kdbl).abs();
    let k = if del < 1e-6 { krnd } else { kdbl.ceil() };
    (k as u64).clamp(DEFAULT_M as u64, MAX_K as u64) as u16
}
