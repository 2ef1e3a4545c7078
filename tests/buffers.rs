// Copyright 2025 STARGA Inc.
// Licensed under the Apache License, Version 2.0 (the “License”);
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at:
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an “AS IS” BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Part of the MIND project (Machine Intelligence Native Design).

use half::{bf16, f16};
use num_complex::Complex32;

use mind_xcall::buffer::{decode, encode, WIRE_MAGIC};
use mind_xcall::prelude::*;

#[test]
fn reduced_precision_and_complex_survive_the_wire() {
    let halves =
        HostArray::from_slice(&[2], &[f16::from_f32(1.5), f16::from_f32(-0.25)]).unwrap();
    let brains =
        HostArray::from_slice(&[1, 2], &[bf16::from_f32(3.0), bf16::from_f32(8.0)]).unwrap();
    let complex = HostArray::from_vec(vec![Complex32::new(1.0, -1.0), Complex32::new(0.0, 2.0)]);

    for array in [halves, brains, complex] {
        let bytes = encode(&array.view());
        assert_eq!(&bytes[..4], &WIRE_MAGIC);
        assert_eq!(decode(&bytes).unwrap(), array);
    }
}

#[test]
fn predicates_are_bytes() {
    let mask = HostArray::from_bools(&[3], &[true, false, true]).unwrap();
    assert_eq!(mask.dtype(), DType::Pred);
    assert_eq!(mask.bytes(), &[1, 0, 1]);
    assert_eq!(decode(&encode(&mask.view())).unwrap().to_bools().unwrap(), vec![true, false, true]);
}

#[test]
fn corrupt_encodings_are_rejected() {
    let array = HostArray::from_vec(vec![1i64, 2, 3]);
    let bytes = encode(&array.view());

    assert!(decode(&bytes[..bytes.len() - 1]).is_err());

    let mut extra = bytes.clone();
    extra.push(0);
    assert!(decode(&extra).is_err());

    let mut bad_magic = bytes.clone();
    bad_magic[0] = b'X';
    assert_eq!(
        decode(&bad_magic).unwrap_err().category(),
        ErrorCategory::InvalidArgument
    );

    let mut future = bytes;
    future[4] = 9;
    assert_eq!(
        decode(&future).unwrap_err().category(),
        ErrorCategory::NotImplemented
    );

    // A huge claimed shape with an empty payload fails before allocating.
    let empty = HostArray::zeros(DType::F64, &[0]).unwrap();
    let mut huge = encode(&empty.view());
    huge[12..20].copy_from_slice(&(1u64 << 40).to_le_bytes());
    assert_eq!(
        decode(&huge).unwrap_err().category(),
        ErrorCategory::InvalidArgument
    );

    let square = HostArray::zeros(DType::F64, &[0, 0]).unwrap();
    let mut overflow = encode(&square.view());
    overflow[12..20].copy_from_slice(&(1u64 << 40).to_le_bytes());
    overflow[20..28].copy_from_slice(&(1u64 << 40).to_le_bytes());
    assert_eq!(
        decode(&overflow).unwrap_err().category(),
        ErrorCategory::OutOfRange
    );
}

#[test]
fn typed_views_check_element_type() {
    let array = HostArray::from_vec(vec![1.0f32, 2.0]);
    let view = array.view();
    assert!(view.typed::<f32>().is_ok());
    assert!(view.typed::<i32>().is_err());
    assert!(!view.is_writable());
    assert!(view.matches(&ShapeDType::new(DType::F32, &[2])));
}

#[test]
fn zero_sized_arrays() {
    let empty = HostArray::zeros(DType::F64, &[0, 4]).unwrap();
    assert!(empty.is_empty());
    assert_eq!(empty.element_count(), 0);
    assert_eq!(decode(&encode(&empty.view())).unwrap().dims(), &[0, 4]);
}
