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

//! Element types that may cross the foreign-call boundary.
//!
//! # Example
//! ```
//! use mind_xcall::types::DType;
//! assert_eq!(DType::F32.byte_width(), 4);
//! assert_eq!(DType::from_tag(DType::BF16.tag()).unwrap(), DType::BF16);
//! ```

use std::fmt;

use half::{bf16, f16};
use num_complex::{Complex32, Complex64};

use crate::error::{Result, XcallError};

/// Element type of a buffer.
///
/// The tags follow the primitive-type numbering used by accelerator
/// compilers so that descriptors can be handed to existing kernels
/// unchanged. Tags are part of the ABI.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Pred = 1,
    I8 = 2,
    I16 = 3,
    I32 = 4,
    I64 = 5,
    U8 = 6,
    U16 = 7,
    U32 = 8,
    U64 = 9,
    F16 = 10,
    F32 = 11,
    F64 = 12,
    C64 = 15,
    BF16 = 16,
    /// Zero-sized ordering token; carries no data.
    Token = 17,
    C128 = 18,
}

impl DType {
    pub const ALL: [DType; 16] = [
        DType::Pred,
        DType::I8,
        DType::I16,
        DType::I32,
        DType::I64,
        DType::U8,
        DType::U16,
        DType::U32,
        DType::U64,
        DType::F16,
        DType::BF16,
        DType::F32,
        DType::F64,
        DType::C64,
        DType::C128,
        DType::Token,
    ];

    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Decode a wire tag. Tags this build does not know about are reported
    /// as not implemented instead of being reinterpreted.
    pub fn from_tag(tag: u8) -> Result<Self> {
        let dtype = match tag {
            1 => DType::Pred,
            2 => DType::I8,
            3 => DType::I16,
            4 => DType::I32,
            5 => DType::I64,
            6 => DType::U8,
            7 => DType::U16,
            8 => DType::U32,
            9 => DType::U64,
            10 => DType::F16,
            11 => DType::F32,
            12 => DType::F64,
            15 => DType::C64,
            16 => DType::BF16,
            17 => DType::Token,
            18 => DType::C128,
            other => {
                return Err(XcallError::NotImplemented(format!(
                    "unknown element type tag {other}"
                )))
            }
        };
        Ok(dtype)
    }

    /// Size in bytes of one element.
    pub fn byte_width(self) -> usize {
        match self {
            DType::Token => 0,
            DType::Pred | DType::I8 | DType::U8 => 1,
            DType::I16 | DType::U16 | DType::F16 | DType::BF16 => 2,
            DType::I32 | DType::U32 | DType::F32 => 4,
            DType::I64 | DType::U64 | DType::F64 | DType::C64 => 8,
            DType::C128 => 16,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::F16 | DType::BF16 | DType::F32 | DType::F64)
    }

    pub fn is_complex(self) -> bool {
        matches!(self, DType::C64 | DType::C128)
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::Pred => "pred",
            DType::I8 => "i8",
            DType::I16 => "i16",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::U8 => "u8",
            DType::U16 => "u16",
            DType::U32 => "u32",
            DType::U64 => "u64",
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::C64 => "c64",
            DType::C128 => "c128",
            DType::Token => "token",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        DType::ALL
            .iter()
            .copied()
            .find(|d| d.name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Rust scalar types that can be viewed as buffer elements.
///
/// Booleans are stored as `u8` under [`DType::Pred`]; use the dedicated
/// helpers on `HostArray` for them.
pub trait Element: bytemuck::Pod {
    const DTYPE: DType;
}

macro_rules! impl_element {
    ($($ty:ty => $dtype:ident),* $(,)?) => {
        $(impl Element for $ty {
            const DTYPE: DType = DType::$dtype;
        })*
    };
}

impl_element! {
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    f16 => F16,
    bf16 => BF16,
    f32 => F32,
    f64 => F64,
    Complex32 => C64,
    Complex64 => C128,
}

/// Number of elements described by `dims`; the empty product is 1.
pub fn element_count(dims: &[usize]) -> usize {
    dims.iter().product()
}

/// Element count that reports overflow instead of wrapping.
pub fn checked_element_count(dims: &[usize]) -> Result<usize> {
    dims.iter().try_fold(1usize, |acc, &d| {
        acc.checked_mul(d)
            .ok_or_else(|| XcallError::OutOfRange(format!("element count of {dims:?} overflows")))
    })
}

/// A declared result shape and element type.
///
/// Dimensions are signed so that a malformed declaration (a negative
/// extent) is representable and can be rejected at call-site construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShapeDType {
    pub dtype: DType,
    pub dims: Vec<i64>,
}

impl ShapeDType {
    pub fn new(dtype: DType, dims: &[i64]) -> Self {
        Self {
            dtype,
            dims: dims.to_vec(),
        }
    }

    pub fn from_dims(dtype: DType, dims: &[usize]) -> Self {
        Self {
            dtype,
            dims: dims.iter().map(|&d| d as i64).collect(),
        }
    }

    pub fn scalar(dtype: DType) -> Self {
        Self::new(dtype, &[])
    }

    /// Concrete dimensions, failing on any negative extent.
    pub fn concrete_dims(&self) -> Result<Vec<usize>> {
        self.dims
            .iter()
            .enumerate()
            .map(|(axis, &d)| {
                usize::try_from(d).map_err(|_| {
                    XcallError::InvalidArgument(format!(
                        "declared result dimension {axis} is negative ({d})"
                    ))
                })
            })
            .collect()
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Prepend batch dimensions, producing the batched declaration.
    pub fn with_leading(&self, batch: &[usize]) -> Self {
        let mut dims: Vec<i64> = batch.iter().map(|&d| d as i64).collect();
        dims.extend_from_slice(&self.dims);
        Self {
            dtype: self.dtype,
            dims,
        }
    }
}

impl fmt::Display for ShapeDType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:?}", self.dtype, self.dims)
    }
}
