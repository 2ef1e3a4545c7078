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

use std::fmt;
use std::ptr::NonNull;

use crate::error::{invalid, Result, XcallError};
use crate::types::{checked_element_count, element_count, DType, Element};

use super::TypedBuffer;

/// Owned, dense, row-major host array.
///
/// Storage is kept in 8-byte words so that every element type the bridge
/// supports can be viewed in place.
#[derive(Clone)]
pub struct HostArray {
    dtype: DType,
    dims: Vec<usize>,
    words: Vec<u64>,
    byte_len: usize,
}

impl HostArray {
    pub fn zeros(dtype: DType, dims: &[usize]) -> Result<Self> {
        let byte_len = byte_len_of(dtype, dims)?;
        Ok(Self {
            dtype,
            dims: dims.to_vec(),
            words: vec![0u64; byte_len.div_ceil(8)],
            byte_len,
        })
    }

    pub fn from_slice<T: Element>(dims: &[usize], data: &[T]) -> Result<Self> {
        let mut out = Self::zeros(T::DTYPE, dims)?;
        if data.len() != out.element_count() {
            return Err(invalid(format!(
                "{} elements supplied for shape {dims:?}",
                data.len()
            )));
        }
        out.bytes_mut().copy_from_slice(bytemuck::cast_slice(data));
        Ok(out)
    }

    pub fn from_vec<T: Element>(data: Vec<T>) -> Self {
        let len = data.len();
        // A rank-1 array of the supplied length always matches.
        match Self::from_slice(&[len], &data) {
            Ok(arr) => arr,
            Err(_) => unreachable!("rank-1 array of {len} elements"),
        }
    }

    pub fn scalar<T: Element>(value: T) -> Self {
        match Self::from_slice(&[], &[value]) {
            Ok(arr) => arr,
            Err(_) => unreachable!("scalar array"),
        }
    }

    pub fn from_bools(dims: &[usize], data: &[bool]) -> Result<Self> {
        let mut out = Self::zeros(DType::Pred, dims)?;
        if data.len() != out.element_count() {
            return Err(invalid(format!(
                "{} elements supplied for shape {dims:?}",
                data.len()
            )));
        }
        for (dst, &src) in out.bytes_mut().iter_mut().zip(data) {
            *dst = u8::from(src);
        }
        Ok(out)
    }

    pub fn from_bytes(dtype: DType, dims: &[usize], bytes: &[u8]) -> Result<Self> {
        let expected = byte_len_of(dtype, dims)?;
        if bytes.len() != expected {
            return Err(invalid(format!(
                "{} bytes supplied for {dtype}{dims:?}, expected {expected}",
                bytes.len()
            )));
        }
        let mut out = Self::zeros(dtype, dims)?;
        out.bytes_mut().copy_from_slice(bytes);
        Ok(out)
    }

    /// Copy a descriptor's contents into a new owned array.
    pub fn from_buffer(buf: &TypedBuffer<'_>) -> Result<Self> {
        Self::from_bytes(buf.dtype(), buf.dims(), buf.bytes())
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn element_count(&self) -> usize {
        element_count(&self.dims)
    }

    pub fn is_empty(&self) -> bool {
        self.element_count() == 0
    }

    pub fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u64, u8>(&self.words)[..self.byte_len]
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        let len = self.byte_len;
        &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.words)[..len]
    }

    pub fn as_slice<T: Element>(&self) -> Result<&[T]> {
        self.check_dtype(T::DTYPE)?;
        Ok(bytemuck::cast_slice(self.bytes()))
    }

    pub fn as_mut_slice<T: Element>(&mut self) -> Result<&mut [T]> {
        self.check_dtype(T::DTYPE)?;
        Ok(bytemuck::cast_slice_mut(self.bytes_mut()))
    }

    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        Ok(self.as_slice::<T>()?.to_vec())
    }

    pub fn to_bools(&self) -> Result<Vec<bool>> {
        self.check_dtype(DType::Pred)?;
        Ok(self.bytes().iter().map(|&b| b != 0).collect())
    }

    /// Read-only descriptor borrowing this array.
    pub fn view(&self) -> TypedBuffer<'_> {
        TypedBuffer::from_host(self.dtype, self.dims.clone(), self.data_ptr(), false)
    }

    /// Writable descriptor borrowing this array.
    pub fn view_mut(&mut self) -> TypedBuffer<'_> {
        let ptr = NonNull::new(self.words.as_mut_ptr() as *mut u8).unwrap_or(NonNull::dangling());
        TypedBuffer::from_host(self.dtype, self.dims.clone(), ptr, true)
    }

    fn data_ptr(&self) -> NonNull<u8> {
        // `Vec::as_ptr` is non-null (dangling but aligned when empty).
        NonNull::new(self.words.as_ptr() as *mut u8).unwrap_or(NonNull::dangling())
    }

    pub fn reshape(mut self, dims: &[usize]) -> Result<Self> {
        if element_count(dims) != self.element_count() {
            return Err(invalid(format!(
                "cannot reshape {:?} into {dims:?}",
                self.dims
            )));
        }
        self.dims = dims.to_vec();
        Ok(self)
    }

    /// The `index`-th slice along the leading axis.
    pub fn index_leading(&self, index: usize) -> Result<Self> {
        let Some((&lead, rest)) = self.dims.split_first() else {
            return Err(invalid("cannot index the leading axis of a scalar"));
        };
        if index >= lead {
            return Err(XcallError::OutOfRange(format!(
                "index {index} out of range for leading axis of size {lead}"
            )));
        }
        let stride = element_count(rest) * self.dtype.byte_width();
        let start = index * stride;
        Self::from_bytes(self.dtype, rest, &self.bytes()[start..start + stride])
    }

    /// Stack equally shaped arrays along a new leading axis.
    ///
    /// `item_dims` fixes the result shape when `parts` is empty.
    pub fn stack(dtype: DType, item_dims: &[usize], parts: &[HostArray]) -> Result<Self> {
        let mut dims = Vec::with_capacity(item_dims.len() + 1);
        dims.push(parts.len());
        dims.extend_from_slice(item_dims);
        let mut out = Self::zeros(dtype, &dims)?;
        let stride = element_count(item_dims) * dtype.byte_width();
        for (i, part) in parts.iter().enumerate() {
            if part.dtype != dtype || part.dims != item_dims {
                return Err(invalid(format!(
                    "cannot stack {}{:?} with {dtype}{item_dims:?}",
                    part.dtype, part.dims
                )));
            }
            out.bytes_mut()[i * stride..(i + 1) * stride].copy_from_slice(part.bytes());
        }
        Ok(out)
    }

    /// Broadcast to `target` using trailing-dimension alignment.
    pub fn broadcast_to(&self, target: &[usize]) -> Result<Self> {
        if target.len() < self.rank() {
            return Err(invalid(format!(
                "cannot broadcast {:?} to lower rank {target:?}",
                self.dims
            )));
        }
        let offset = target.len() - self.rank();
        for (axis, &d) in self.dims.iter().enumerate() {
            let t = target[axis + offset];
            if d != t && d != 1 {
                return Err(invalid(format!(
                    "cannot broadcast {:?} to {target:?}",
                    self.dims
                )));
            }
        }
        if self.dims == target {
            return Ok(self.clone());
        }
        let width = self.dtype.byte_width();
        let mut out = Self::zeros(self.dtype, target)?;
        let src_strides = row_major_strides(&self.dims);
        let mut index = vec![0usize; target.len()];
        let src = self.bytes();
        let count = element_count(target);
        let dst = out.bytes_mut();
        for linear in 0..count {
            unravel(linear, target, &mut index);
            let mut src_linear = 0;
            for (axis, &d) in self.dims.iter().enumerate() {
                if d != 1 {
                    src_linear += index[axis + offset] * src_strides[axis];
                }
            }
            dst[linear * width..(linear + 1) * width]
                .copy_from_slice(&src[src_linear * width..(src_linear + 1) * width]);
        }
        Ok(out)
    }

    /// Copy out the block starting at `offsets` with extent `dims`.
    pub fn extract_block(&self, offsets: &[usize], dims: &[usize]) -> Result<Self> {
        self.check_block(offsets, dims)?;
        let width = self.dtype.byte_width();
        let strides = row_major_strides(&self.dims);
        let mut out = Self::zeros(self.dtype, dims)?;
        let mut index = vec![0usize; dims.len()];
        let src = self.bytes();
        let dst = out.bytes_mut();
        for linear in 0..element_count(dims) {
            unravel(linear, dims, &mut index);
            let src_linear: usize = index
                .iter()
                .zip(offsets)
                .zip(&strides)
                .map(|((&i, &o), &s)| (i + o) * s)
                .sum();
            dst[linear * width..(linear + 1) * width]
                .copy_from_slice(&src[src_linear * width..(src_linear + 1) * width]);
        }
        Ok(out)
    }

    /// Write `block` into this array starting at `offsets`.
    pub fn write_block(&mut self, offsets: &[usize], block: &HostArray) -> Result<()> {
        if block.dtype != self.dtype {
            return Err(invalid(format!(
                "cannot write {} block into {} array",
                block.dtype, self.dtype
            )));
        }
        self.check_block(offsets, &block.dims)?;
        let width = self.dtype.byte_width();
        let strides = row_major_strides(&self.dims);
        let mut index = vec![0usize; block.rank()];
        let src = block.bytes();
        let dims = block.dims.clone();
        let dst = self.bytes_mut();
        for linear in 0..element_count(&dims) {
            unravel(linear, &dims, &mut index);
            let dst_linear: usize = index
                .iter()
                .zip(offsets)
                .zip(&strides)
                .map(|((&i, &o), &s)| (i + o) * s)
                .sum();
            dst[dst_linear * width..(dst_linear + 1) * width]
                .copy_from_slice(&src[linear * width..(linear + 1) * width]);
        }
        Ok(())
    }

    fn check_block(&self, offsets: &[usize], dims: &[usize]) -> Result<()> {
        if offsets.len() != self.rank() || dims.len() != self.rank() {
            return Err(invalid(format!(
                "block rank does not match array rank {}",
                self.rank()
            )));
        }
        for axis in 0..self.rank() {
            if offsets[axis] + dims[axis] > self.dims[axis] {
                return Err(XcallError::OutOfRange(format!(
                    "block {offsets:?}+{dims:?} exceeds array {:?}",
                    self.dims
                )));
            }
        }
        Ok(())
    }

    fn check_dtype(&self, want: DType) -> Result<()> {
        if self.dtype != want {
            return Err(invalid(format!(
                "array has element type {}, requested {want}",
                self.dtype
            )));
        }
        Ok(())
    }
}

impl PartialEq for HostArray {
    fn eq(&self, other: &Self) -> bool {
        self.dtype == other.dtype && self.dims == other.dims && self.bytes() == other.bytes()
    }
}

impl fmt::Debug for HostArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostArray")
            .field("dtype", &self.dtype)
            .field("dims", &self.dims)
            .field("byte_len", &self.byte_len)
            .finish()
    }
}

pub(crate) fn row_major_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; dims.len()];
    for axis in (0..dims.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * dims[axis + 1];
    }
    strides
}

fn unravel(mut linear: usize, dims: &[usize], index: &mut [usize]) {
    for axis in (0..dims.len()).rev() {
        let d = dims[axis];
        index[axis] = linear % d;
        linear /= d;
    }
}

fn byte_len_of(dtype: DType, dims: &[usize]) -> Result<usize> {
    checked_element_count(dims)?
        .checked_mul(dtype.byte_width())
        .ok_or_else(|| XcallError::OutOfRange(format!("{dtype}{dims:?} is too large")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_and_index_are_inverse() {
        let a = HostArray::from_slice(&[2], &[1i32, 2]).unwrap();
        let b = HostArray::from_slice(&[2], &[3i32, 4]).unwrap();
        let stacked = HostArray::stack(DType::I32, &[2], &[a.clone(), b.clone()]).unwrap();
        assert_eq!(stacked.dims(), &[2, 2]);
        assert_eq!(stacked.index_leading(0).unwrap(), a);
        assert_eq!(stacked.index_leading(1).unwrap(), b);
        assert!(matches!(
            stacked.index_leading(2),
            Err(XcallError::OutOfRange(_))
        ));
    }

    #[test]
    fn stacking_nothing_gives_empty_leading_axis() {
        let out = HostArray::stack(DType::F32, &[3], &[]).unwrap();
        assert_eq!(out.dims(), &[0, 3]);
        assert!(out.is_empty());
    }

    #[test]
    fn broadcast_replicates_size_one_axes() {
        let a = HostArray::from_slice(&[1, 2], &[1.0f64, 2.0]).unwrap();
        let out = a.broadcast_to(&[3, 2]).unwrap();
        assert_eq!(out.to_vec::<f64>().unwrap(), vec![1.0, 2.0, 1.0, 2.0, 1.0, 2.0]);
        let scalar = HostArray::scalar(7u8);
        assert_eq!(scalar.broadcast_to(&[2]).unwrap().to_vec::<u8>().unwrap(), vec![7, 7]);
        assert!(a.broadcast_to(&[3, 3]).is_err());
    }

    #[test]
    fn blocks_roundtrip() {
        let a = HostArray::from_slice(&[2, 4], &[0i64, 1, 2, 3, 4, 5, 6, 7]).unwrap();
        let block = a.extract_block(&[0, 2], &[2, 2]).unwrap();
        assert_eq!(block.to_vec::<i64>().unwrap(), vec![2, 3, 6, 7]);
        let mut b = HostArray::zeros(DType::I64, &[2, 4]).unwrap();
        b.write_block(&[0, 2], &block).unwrap();
        assert_eq!(b.to_vec::<i64>().unwrap(), vec![0, 0, 2, 3, 0, 0, 6, 7]);
        assert!(a.extract_block(&[1, 3], &[2, 2]).is_err());
    }

    #[test]
    fn bools_are_stored_as_pred_bytes() {
        let a = HostArray::from_bools(&[3], &[true, false, true]).unwrap();
        assert_eq!(a.dtype(), DType::Pred);
        assert_eq!(a.to_bools().unwrap(), vec![true, false, true]);
    }

    #[test]
    fn views_see_the_same_memory() {
        let mut a = HostArray::zeros(DType::F32, &[3]).unwrap();
        {
            let mut view = a.view_mut();
            view.typed_mut::<f32>().unwrap().copy_from_slice(&[1.0, 2.0, 3.0]);
        }
        assert_eq!(a.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0]);
    }
}
