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

//! Serialization tests for the KLL sketch byte images.

use googletest::assert_that;
use googletest::prelude::contains_substring;
use kll_quantiles::common::RandomSource;
use kll_quantiles::common::XorShift64;
use kll_quantiles::error::ErrorKind;
use kll_quantiles::kll::KllSketch;

fn filled_sketch(k: u16, n: u64, seed: u64) -> KllSketch<'static, f64> {
    let mut sketch = KllSketch::<f64>::new(k).unwrap();
    sketch.set_random_seed(seed);
    let mut rng = XorShift64::seeded(seed ^ 0x5bd1e995);
    for _ in 0..n {
        sketch.update((rng.next_u64() % 1_000_000) as f64).unwrap();
    }
    sketch
}

#[test]
fn test_serialize_empty() {
    let sketch = KllSketch::<f64>::new(200).unwrap();
    let bytes = sketch.to_bytes();

    // Empty sketch is the 8-byte preamble alone
    assert_eq!(bytes.len(), 8);
    assert_eq!(bytes[0], 2, "preamble ints should be 2 for empty");
    assert_eq!(bytes[1], 2, "serial version should be 2");
    assert_eq!(bytes[2], 15, "family id should be 15 (KLL)");
    assert_ne!(bytes[3] & 0x01, 0, "empty flag should be set");
    assert_eq!(u16::from_le_bytes([bytes[4], bytes[5]]), 200);
    assert_eq!(bytes[6], 8, "m should be 8");

    let restored = KllSketch::<f64>::heapify(&bytes).unwrap();
    assert!(restored.is_empty());
    assert_eq!(restored.k(), 200);
    assert_eq!(
        restored.quantile(0.5, true).unwrap_err().kind(),
        ErrorKind::EmptySketch
    );
    assert_eq!(restored, sketch);
}

#[test]
fn test_serialize_single_item() {
    let mut sketch = KllSketch::<f64>::new(200).unwrap();
    sketch.update(1.0).unwrap();
    let bytes = sketch.to_bytes();

    assert_eq!(bytes.len(), 8 + 8);
    assert_eq!(bytes[0], 2, "preamble ints should be 2 for single item");
    assert_eq!(bytes[1], 1, "serial version should be 1 for single item");
    assert_ne!(bytes[3] & 0x04, 0, "single-item flag should be set");
    assert_eq!(f64::from_le_bytes(bytes[8..16].try_into().unwrap()), 1.0);

    let restored = KllSketch::<f64>::heapify(&bytes).unwrap();
    assert_eq!(restored.n(), 1);
    assert_eq!(restored.min_item(), Some(1.0));
    assert_eq!(restored.max_item(), Some(1.0));
    assert_eq!(restored.quantile(0.5, true).unwrap(), 1.0);
    assert_eq!(restored, sketch);
}

#[test]
fn test_serialize_single_item_f32() {
    let mut sketch = KllSketch::<f32>::new(200).unwrap();
    sketch.update(1.0).unwrap();
    let bytes = sketch.to_bytes();
    assert_eq!(bytes.len(), 8 + 4);
    assert_eq!(bytes[3] & 0x08, 0, "doubles flag must be clear for f32");

    let restored = KllSketch::<f32>::heapify(&bytes).unwrap();
    assert_eq!(restored.quantile(0.5, true).unwrap(), 1.0);
}

#[test]
fn test_compact_round_trip_exact_mode() {
    let sketch = filled_sketch(200, 150, 4);
    let bytes = sketch.to_bytes();
    assert_eq!(bytes.len(), sketch.serialized_size_bytes());
    assert_eq!(bytes[0], 5, "preamble ints should be 5 for a general image");
    assert_eq!(bytes[1], 2, "serial version should be 2 for compact");

    let restored = KllSketch::<f64>::heapify(&bytes).unwrap();
    assert_eq!(restored, sketch);
}

#[test]
fn test_compact_round_trip_estimation_mode() {
    for n in [1_000u64, 10_000, 250_000] {
        let sketch = filled_sketch(200, n, n);
        let bytes = sketch.to_bytes();
        assert_eq!(bytes.len(), sketch.serialized_size_bytes());

        let restored = KllSketch::<f64>::heapify(&bytes).unwrap();
        assert_eq!(restored, sketch);
        assert_eq!(restored.n(), sketch.n());
        assert_eq!(restored.num_retained(), sketch.num_retained());
        assert_eq!(restored.min_k(), sketch.min_k());
        for q in [0.05, 0.5, 0.95] {
            assert_eq!(
                restored.quantile(q, true).unwrap(),
                sketch.quantile(q, true).unwrap()
            );
        }
    }
}

#[test]
fn test_updatable_round_trip() {
    let sketch = filled_sketch(128, 20_000, 9);
    let mut image = sketch.to_updatable_bytes();
    assert_eq!(image.len(), sketch.updatable_serialized_size_bytes());
    assert_eq!(image[1], 3, "serial version should be 3 for updatable");
    assert_ne!(image[3] & 0x10, 0, "updatable flag should be set");

    let wrapped = KllSketch::<f64>::wrap_updatable(&mut image).unwrap();
    assert_eq!(wrapped, sketch);
}

#[test]
fn test_updatable_round_trip_empty() {
    let sketch = KllSketch::<f64>::new(200).unwrap();
    let mut image = sketch.to_updatable_bytes();
    let wrapped = KllSketch::<f64>::wrap_updatable(&mut image).unwrap();
    assert!(wrapped.is_empty());
    assert_eq!(wrapped.k(), 200);
}

#[test]
fn test_wrap_compact_reads_in_place() {
    let sketch = filled_sketch(200, 50_000, 31);
    let bytes = sketch.to_bytes();
    let wrapped = KllSketch::<f64>::wrap_compact(&bytes).unwrap();

    assert!(wrapped.is_read_only());
    assert_eq!(wrapped, sketch);
    assert_eq!(wrapped.n(), sketch.n());
    for q in [0.01, 0.25, 0.5, 0.75, 0.99] {
        assert_eq!(
            wrapped.quantile(q, true).unwrap(),
            sketch.quantile(q, true).unwrap()
        );
    }
    let weighted: u64 = wrapped.iter().map(|(_, w)| w).sum();
    assert_eq!(weighted, wrapped.n());
}

#[test]
fn test_wrap_compact_single_and_empty() {
    let mut sketch = KllSketch::<f32>::new(200).unwrap();
    let empty_bytes = sketch.to_bytes();
    let wrapped = KllSketch::<f32>::wrap_compact(&empty_bytes).unwrap();
    assert!(wrapped.is_empty());
    assert!(wrapped.is_read_only());

    sketch.update(7.5).unwrap();
    let single_bytes = sketch.to_bytes();
    let wrapped = KllSketch::<f32>::wrap_compact(&single_bytes).unwrap();
    assert_eq!(wrapped.n(), 1);
    assert_eq!(wrapped.quantile(0.5, true).unwrap(), 7.5);
    assert_eq!(wrapped.rank(7.5, true).unwrap(), 1.0);
}

#[test]
fn test_deterministic_compact_images() {
    // same seed, same stream: byte-identical images
    let make = || {
        let mut sketch = KllSketch::<f64>::new(200).unwrap();
        sketch.set_random_seed(0xC0FFEE);
        let mut rng = XorShift64::seeded(44);
        for _ in 0..100_000 {
            sketch.update((rng.next_u64() % 1_000_000) as f64).unwrap();
        }
        sketch
    };
    assert_eq!(make().to_bytes(), make().to_bytes());
}

#[test]
fn test_heapify_rejects_wrong_family() {
    let sketch = filled_sketch(200, 1_000, 5);
    let mut bytes = sketch.to_bytes();
    bytes[2] = 3;
    let err = KllSketch::<f64>::heapify(&bytes).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CorruptImage);
    assert_that!(err.message(), contains_substring("invalid family"));
}

#[test]
fn test_heapify_rejects_bad_serial_version() {
    let sketch = filled_sketch(200, 1_000, 5);
    let mut bytes = sketch.to_bytes();
    bytes[1] = 9;
    let err = KllSketch::<f64>::heapify(&bytes).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CorruptImage);
    assert_that!(err.message(), contains_substring("serial version"));
}

#[test]
fn test_heapify_rejects_bad_m() {
    let sketch = filled_sketch(200, 1_000, 5);
    let mut bytes = sketch.to_bytes();
    bytes[6] = 3;
    let err = KllSketch::<f64>::heapify(&bytes).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CorruptImage);
    assert_that!(err.message(), contains_substring("invalid m"));
}

#[test]
fn test_heapify_rejects_k_below_m() {
    let sketch = filled_sketch(200, 1_000, 5);
    let mut bytes = sketch.to_bytes();
    bytes[4] = 2;
    bytes[5] = 0;
    let err = KllSketch::<f64>::heapify(&bytes).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CorruptImage);
    assert_that!(err.message(), contains_substring("k out of range"));
}

#[test]
fn test_heapify_rejects_truncated_image() {
    let sketch = filled_sketch(200, 10_000, 5);
    let bytes = sketch.to_bytes();
    for cut in [0usize, 4, 7, 12, 19, bytes.len() - 3] {
        let err = KllSketch::<f64>::heapify(&bytes[..cut]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptImage, "cut at {cut}");
    }
}

#[test]
fn test_heapify_rejects_updatable_image() {
    let sketch = filled_sketch(200, 10_000, 5);
    let image = sketch.to_updatable_bytes();
    let err = KllSketch::<f64>::heapify(&image).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CorruptImage);
    assert_that!(err.message(), contains_substring("compact"));
}

#[test]
fn test_wrap_updatable_rejects_compact_image() {
    let sketch = filled_sketch(200, 10_000, 5);
    let mut bytes = sketch.to_bytes();
    let err = KllSketch::<f64>::wrap_updatable(&mut bytes).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CorruptImage);
}

#[test]
fn test_heapify_rejects_inconsistent_weight() {
    let sketch = filled_sketch(200, 10_000, 5);
    let mut bytes = sketch.to_bytes();
    // corrupt n so the level sizes no longer sum to it
    bytes[8] = bytes[8].wrapping_add(1);
    let err = KllSketch::<f64>::heapify(&bytes).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CorruptImage);
    assert_that!(err.message(), contains_substring("sum to n"));
}

#[test]
fn test_type_mismatch_on_heapify() {
    let sketch = filled_sketch(200, 1_000, 5);
    let bytes = sketch.to_bytes();
    let err = KllSketch::<f32>::heapify(&bytes).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    assert_that!(err.message(), contains_substring("f64"));
}

#[test]
fn test_type_mismatch_on_empty_image() {
    let sketch = KllSketch::<f32>::new(200).unwrap();
    let bytes = sketch.to_bytes();
    let err = KllSketch::<f64>::heapify(&bytes).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TypeMismatch);
}

#[test]
fn test_heapify_sorts_unsorted_level_zero() {
    // a foreign writer may emit level 0 unsorted with the flag clear; the
    // reader accepts and repairs it
    let mut sketch = KllSketch::<f64>::new(20).unwrap();
    for value in [5.0, 1.0, 4.0, 2.0, 3.0] {
        sketch.update(value).unwrap();
    }
    let mut bytes = sketch.to_bytes();
    // clear the level-zero-sorted flag and scramble the items region
    bytes[3] &= !0x02;
    let items_off = bytes.len() - 5 * 8;
    let mut first = [0u8; 8];
    first.copy_from_slice(&bytes[items_off..items_off + 8]);
    let last_off = bytes.len() - 8;
    bytes.copy_within(last_off..last_off + 8, items_off);
    bytes[last_off..].copy_from_slice(&first);

    let restored = KllSketch::<f64>::heapify(&bytes).unwrap();
    assert_eq!(restored.n(), 5);
    assert_eq!(restored.quantile(0.5, true).unwrap(), 3.0);
    for i in 1..=5u32 {
        assert_eq!(restored.rank(i as f64, true).unwrap(), i as f64 / 5.0);
    }
}

#[test]
fn test_serialized_size_growth() {
    let mut sketch = KllSketch::<f64>::new(200).unwrap();
    assert_eq!(sketch.serialized_size_bytes(), 8);
    sketch.update(1.0).unwrap();
    assert_eq!(sketch.serialized_size_bytes(), 16);
    sketch.update(2.0).unwrap();
    // full preamble + 1 level offset + min + max + 2 items
    assert_eq!(sketch.serialized_size_bytes(), 20 + 4 + 8 * 4);
    assert_eq!(sketch.to_bytes().len(), sketch.serialized_size_bytes());
}
